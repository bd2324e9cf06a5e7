use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use quire::codec::{SpecDescriptor, SpecRegistry};
use quire::config::CONFIG_ENV;
use quire::telemetry::{self, LogFormat};
use quire::{Author, Change, Changeset, CommitMeta, CommitOutcome, Engine, EngineConfig};
use quire_git::RemoteAuth;

mod serve;

/// Structured object storage over git working copies
///
/// Every command takes the working copy as an absolute or relative path;
/// relative paths are resolved against the current directory.
///
/// Engine settings come from a TOML file (`--config`, or $QUIRE_CONFIG).
/// Logging is controlled by $QUIRE_LOG and $QUIRE_LOG_FORMAT.
#[derive(Parser)]
#[command(name = "quire")]
#[command(version, about)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to a quire.toml
    #[arg(long, global = true, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an empty repository
    Init {
        work_dir: PathBuf,
        #[arg(long, default_value = "main")]
        branch: String,
    },

    /// Probe a remote: is it blank, and do the credentials allow pushing
    DescribeRemote {
        url: String,
        #[command(flatten)]
        auth: AuthArgs,
    },

    /// Clone a remote into a new working copy
    Clone {
        url: String,
        work_dir: PathBuf,
        #[arg(long, default_value = "main")]
        branch: String,
        #[command(flatten)]
        auth: AuthArgs,
    },

    /// Push the current branch
    Push {
        work_dir: PathBuf,
        /// Remote URL (default: the configured origin)
        #[arg(long)]
        url: Option<String>,
        #[command(flatten)]
        auth: AuthArgs,
    },

    /// Fast-forward the current branch from the remote
    Pull {
        work_dir: PathBuf,
        /// Remote URL (default: the configured origin)
        #[arg(long)]
        url: Option<String>,
        #[command(flatten)]
        auth: AuthArgs,
    },

    /// Print buffers, from the working tree or from a commit
    Read {
        work_dir: PathBuf,
        #[arg(required = true)]
        paths: Vec<String>,
        /// Read at this revision instead of the working tree
        #[arg(long)]
        commit: Option<String>,
    },

    /// Write one buffer and commit it
    ///
    /// The current working-tree content is used as the expected old value,
    /// so a concurrent change between the read and the commit is reported
    /// as a conflict.
    Write {
        work_dir: PathBuf,
        path: String,
        /// New content; read from stdin when omitted
        #[arg(long)]
        text: Option<String>,
        #[command(flatten)]
        commit: CommitArgs,
    },

    /// Remove every file below a directory in one commit
    RmTree {
        work_dir: PathBuf,
        root: String,
        #[command(flatten)]
        commit: CommitArgs,
    },

    /// Describe a working copy: branch, head, remote, author
    Describe { work_dir: PathBuf },

    /// Print the working copy's status
    Status {
        work_dir: PathBuf,
        /// Keep printing status changes until interrupted
        #[arg(long)]
        follow: bool,
    },

    /// Load a dataset and query its default index
    Index {
        work_dir: PathBuf,
        dataset_dir: String,
        /// JSON file with an array of spec descriptors
        #[arg(long)]
        specs: PathBuf,
        /// Print this object instead of the index status
        #[arg(long)]
        get: Option<String>,
    },

    /// Serve JSON requests, one per line, on stdin/stdout
    Serve,
}

#[derive(Args)]
struct AuthArgs {
    /// Remote account name
    #[arg(long)]
    username: Option<String>,
    /// Password or access token
    #[arg(long, env = "QUIRE_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

impl AuthArgs {
    fn into_auth(self) -> Option<RemoteAuth> {
        self.username.map(|username| RemoteAuth {
            username,
            password: self.password,
        })
    }
}

#[derive(Args)]
struct CommitArgs {
    /// Commit message
    #[arg(short, long)]
    message: String,
    /// Author name (default: the working copy's user.name)
    #[arg(long, requires = "author_email")]
    author_name: Option<String>,
    /// Author email (default: the working copy's user.email)
    #[arg(long, requires = "author_name")]
    author_email: Option<String>,
}

impl CommitArgs {
    fn into_meta(self) -> CommitMeta {
        let author = self
            .author_name
            .zip(self.author_email)
            .map(|(name, email)| Author { name, email });
        CommitMeta::new(author, self.message)
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()
        .context("could not resolve the current directory")?
        .join(path))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn report_commit(outcome: &CommitOutcome) -> Result<()> {
    match outcome {
        CommitOutcome::Committed { commit, paths } => {
            println!("committed {} ({} path(s))", commit.short(), paths.len());
            Ok(())
        }
        CommitOutcome::Conflicts(paths) => {
            for p in paths {
                eprintln!("conflict: {p}");
            }
            bail!("{} path(s) changed underneath the write", paths.len())
        }
    }
}

fn main() -> Result<()> {
    telemetry::init(LogFormat::from_env());
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let engine = Engine::new(config);
    let result = run(&engine, cli.command);
    engine.shutdown();
    result
}

#[allow(clippy::too_many_lines)]
fn run(engine: &Engine, command: Commands) -> Result<()> {
    match command {
        Commands::Init { work_dir, branch } => {
            let work_dir = absolute(&work_dir)?;
            engine.init_repo(&work_dir, &branch)?;
            println!("initialized {} on {branch}", work_dir.display());
        }
        Commands::DescribeRemote { url, auth } => {
            let d = engine.describe_remote(&url, auth.into_auth().as_ref())?;
            println!("blank: {}\ncan push: {}", d.is_blank, d.can_push);
        }
        Commands::Clone {
            url,
            work_dir,
            branch,
            auth,
        } => {
            let work_dir = absolute(&work_dir)?;
            engine.clone_repo(&work_dir, &url, auth.into_auth(), &branch)?;
            println!("cloned {url} into {}", work_dir.display());
        }
        Commands::Push { work_dir, url, auth } => {
            engine.push_repo(&absolute(&work_dir)?, url, auth.into_auth())?;
            println!("pushed");
        }
        Commands::Pull { work_dir, url, auth } => {
            let outcome = engine.pull_repo(&absolute(&work_dir)?, url, auth.into_auth())?;
            match outcome.new_head {
                Some(head) => println!("fast-forwarded to {} ({} file(s))", head.short(), outcome.changed.len()),
                None => println!("already up to date"),
            }
        }
        Commands::Read {
            work_dir,
            paths,
            commit,
        } => {
            let buffers = engine.read_buffers(&absolute(&work_dir)?, &paths, commit)?;
            for (path, data) in buffers {
                match data {
                    Some(data) => println!("== {path}\n{}", String::from_utf8_lossy(&data)),
                    None => println!("== {path} (absent)"),
                }
            }
        }
        Commands::Write {
            work_dir,
            path,
            text,
            commit,
        } => {
            let work_dir = absolute(&work_dir)?;
            let new = match text {
                Some(t) => t.into_bytes(),
                None => {
                    let mut buf = Vec::new();
                    std::io::Read::read_to_end(&mut std::io::stdin(), &mut buf)
                        .context("could not read stdin")?;
                    buf
                }
            };
            let old = engine
                .read_buffers(&work_dir, std::slice::from_ref(&path), None)?
                .into_values()
                .next()
                .flatten();
            let changeset = Changeset::from([(path, Change::new(old, Some(new)))]);
            report_commit(&engine.update_buffers(&work_dir, changeset, commit.into_meta())?)?;
        }
        Commands::RmTree {
            work_dir,
            root,
            commit,
        } => {
            report_commit(&engine.delete_tree(&absolute(&work_dir)?, &root, commit.into_meta())?)?;
        }
        Commands::Describe { work_dir } => {
            print_json(&engine.describe_working_copy(&absolute(&work_dir)?)?)?;
        }
        Commands::Status { work_dir, follow } => {
            let work_dir = absolute(&work_dir)?;
            if follow {
                for status in engine.stream_status(&work_dir)? {
                    println!("{}", serde_json::to_string(&status)?);
                }
            } else {
                println!("{}", serde_json::to_string(&engine.status(&work_dir)?)?);
            }
        }
        Commands::Index {
            work_dir,
            dataset_dir,
            specs,
            get,
        } => {
            let work_dir = absolute(&work_dir)?;
            let raw = std::fs::read_to_string(&specs)
                .with_context(|| format!("could not read {}", specs.display()))?;
            let descriptors: Vec<SpecDescriptor> =
                serde_json::from_str(&raw).with_context(|| format!("invalid spec file {}", specs.display()))?;
            let status = engine.load_dataset(&work_dir, &dataset_dir, SpecRegistry::from_descriptors(&descriptors)?)?;
            match get {
                Some(object_path) => {
                    let object = engine.get_indexed_object(
                        &work_dir,
                        &dataset_dir,
                        quire::dataset::DEFAULT_INDEX,
                        &object_path,
                    )?;
                    print_json(&object)?;
                }
                None => print_json(&status)?,
            }
        }
        Commands::Serve => serve::run(engine)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn author_flags_come_in_pairs() {
        let parsed = Cli::try_parse_from([
            "quire", "rm-tree", "/wc", "/data", "-m", "clear", "--author-name", "A",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn relative_paths_resolve_against_cwd() {
        let resolved = absolute(Path::new("wc")).unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("wc"));
    }
}
