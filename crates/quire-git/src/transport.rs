//! Network transport via the `git` CLI: clone, fetch, push, and remote
//! probing.
//!
//! gix handles local plumbing; everything that talks to a remote shells out
//! to `git` so HTTP auth, proxies and protocol negotiation behave exactly as
//! they do for users. Credentials are never persisted: they travel as a
//! per-invocation `http.extraHeader` and terminal prompts are disabled, so a
//! missing or wrong password fails fast with [`GitError::AuthFailed`].

use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::cli;
use crate::error::GitError;
use crate::types::GitOid;

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

/// HTTP basic-auth credentials for a remote.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteAuth {
    /// Remote account name.
    pub username: String,
    /// Password or access token. Without one, no header is sent and git
    /// relies on whatever the URL itself carries.
    pub password: Option<String>,
}

impl RemoteAuth {
    /// Credentials with a password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Some(password.into()),
        }
    }

    /// `-c http.extraHeader=...` arguments for this credential pair.
    fn config_args(&self) -> Vec<String> {
        match &self.password {
            Some(password) => {
                let token = STANDARD.encode(format!("{}:{password}", self.username));
                vec![
                    "-c".to_owned(),
                    format!("http.extraHeader=Authorization: Basic {token}"),
                ]
            }
            None => Vec::new(),
        }
    }
}

impl std::fmt::Debug for RemoteAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteAuth")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

fn auth_args(auth: Option<&RemoteAuth>) -> Vec<String> {
    auth.map(RemoteAuth::config_args).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// One progress report parsed from git's `--progress` output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferProgress {
    /// The phase git reports, e.g. `"Receiving objects"`.
    pub phase: String,
    /// Units completed so far.
    pub loaded: u64,
    /// Total units, when git knows it.
    pub total: Option<u64>,
}

impl TransferProgress {
    /// Parse a single progress line such as
    /// `"Receiving objects:  37% (37/100), 1.20 MiB | 2.00 MiB/s"` or
    /// `"remote: Enumerating objects: 5, done."`.
    ///
    /// Returns `None` for lines that carry no counter.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let line = line.strip_prefix("remote:").map_or(line, str::trim_start);
        let (phase, rest) = line.split_once(':')?;
        let phase = phase.trim();
        if !phase.starts_with(|c: char| c.is_ascii_uppercase()) {
            return None;
        }
        let rest = rest.trim();

        if let Some(open) = rest.find('(') {
            let close = rest[open..].find(')')? + open;
            let (loaded, total) = rest[open + 1..close].split_once('/')?;
            return Some(Self {
                phase: phase.to_owned(),
                loaded: loaded.trim().parse().ok()?,
                total: Some(total.trim().parse().ok()?),
            });
        }

        let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
        if digits.is_empty() {
            return None;
        }
        Some(Self {
            phase: phase.to_owned(),
            loaded: digits.parse().ok()?,
            total: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Remote probing
// ---------------------------------------------------------------------------

/// What a remote looks like to the supplied credentials.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemoteDescription {
    /// The remote has no refs yet.
    pub is_blank: bool,
    /// The credentials are accepted for a push.
    pub can_push: bool,
}

/// List the refs a remote advertises.
///
/// Replaces: `git ls-remote <url>`.
///
/// # Errors
/// [`GitError::AuthFailed`] when the remote rejects the credentials, or
/// [`GitError::Command`] for any other failure.
pub fn ls_remote(url: &str, auth: Option<&RemoteAuth>) -> Result<Vec<(String, GitOid)>, GitError> {
    let mut args = auth_args(auth);
    args.extend(["ls-remote".to_owned(), "--".to_owned(), url.to_owned()]);
    let argv: Vec<&str> = args.iter().map(String::as_str).collect();
    let output = cli::run(None, &argv).map_err(|e| classify(url, e))?;

    let mut refs = Vec::new();
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let Some((oid, name)) = line.split_once('\t') else {
            continue;
        };
        if let Ok(oid) = oid.parse::<GitOid>() {
            refs.push((name.trim().to_owned(), oid));
        }
    }
    Ok(refs)
}

/// Probe a remote without touching any working copy.
///
/// `is_blank` comes from the advertised refs. `can_push` is established with
/// a dry-run push of a throwaway commit from a scratch repository: git has to
/// authenticate against the receive-pack endpoint to plan the push, but
/// `--dry-run` sends nothing.
///
/// # Errors
/// Propagates failures from listing the refs; a refused dry-run push only
/// yields `can_push: false`.
pub fn describe_remote(url: &str, auth: Option<&RemoteAuth>) -> Result<RemoteDescription, GitError> {
    let refs = ls_remote(url, auth)?;
    let is_blank = refs.is_empty();
    let can_push = match probe_push(url, auth) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(url, error = %e, "push probe refused");
            false
        }
    };
    Ok(RemoteDescription { is_blank, can_push })
}

fn probe_push(url: &str, auth: Option<&RemoteAuth>) -> Result<(), GitError> {
    let scratch = std::env::temp_dir().join(format!(
        "quire-push-probe-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos())
    ));
    std::fs::create_dir_all(&scratch)?;
    let result = (|| {
        cli::run(Some(&scratch), &["init", "-q"])?;
        cli::run(
            Some(&scratch),
            &[
                "-c",
                "user.name=quire",
                "-c",
                "user.email=quire@localhost",
                "commit",
                "-q",
                "--allow-empty",
                "-m",
                "probe",
            ],
        )?;
        let mut args = auth_args(auth);
        args.extend(
            ["push", "--dry-run", "--porcelain", "--", url, "HEAD:refs/heads/quire-push-probe"]
                .map(str::to_owned),
        );
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        cli::run(Some(&scratch), &argv).map(|_| ())
    })();
    if let Err(e) = std::fs::remove_dir_all(&scratch) {
        tracing::warn!(path = %scratch.display(), error = %e, "failed to remove push probe");
    }
    result
}

// ---------------------------------------------------------------------------
// Clone / fetch / push
// ---------------------------------------------------------------------------

/// Clone `url` into `dest`.
///
/// With `branch`, only that branch is fetched and checked out. Pass `None`
/// for a blank remote, which has no branch to select.
///
/// Replaces: `git clone --progress [--branch <b> --single-branch] <url> <dest>`.
///
/// # Errors
/// [`GitError::AuthFailed`] or [`GitError::Command`]. The caller owns
/// cleanup of `dest` on failure.
pub fn clone(
    url: &str,
    auth: Option<&RemoteAuth>,
    branch: Option<&str>,
    dest: &Path,
    on_progress: &mut dyn FnMut(TransferProgress),
) -> Result<(), GitError> {
    let dest_str = dest.to_string_lossy().into_owned();
    let mut args = auth_args(auth);
    args.extend(["clone".to_owned(), "--progress".to_owned()]);
    if let Some(branch) = branch {
        args.extend([
            "--branch".to_owned(),
            branch.to_owned(),
            "--single-branch".to_owned(),
        ]);
    }
    args.extend(["--".to_owned(), url.to_owned(), dest_str]);
    let argv: Vec<&str> = args.iter().map(String::as_str).collect();

    cli::run_streaming(None, &argv, &mut |line| {
        if let Some(progress) = TransferProgress::parse(line) {
            on_progress(progress);
        }
    })
    .map_err(|e| classify(url, e))?;
    tracing::info!(url, dest = %dest.display(), "cloned");
    Ok(())
}

/// Fetch `branch` from `url` into `refs/remotes/origin/<branch>` and return
/// the fetched tip, or `None` when the remote has no such branch.
///
/// # Errors
/// [`GitError::AuthFailed`] or [`GitError::Command`].
pub fn fetch(
    workdir: &Path,
    url: &str,
    auth: Option<&RemoteAuth>,
    branch: &str,
    on_progress: &mut dyn FnMut(TransferProgress),
) -> Result<Option<GitOid>, GitError> {
    let tracking = format!("refs/remotes/origin/{branch}");
    let refspec = format!("+refs/heads/{branch}:{tracking}");
    let mut args = auth_args(auth);
    args.extend(["fetch".to_owned(), "--progress".to_owned(), "--".to_owned(), url.to_owned(), refspec]);
    let argv: Vec<&str> = args.iter().map(String::as_str).collect();

    match cli::run_streaming(Some(workdir), &argv, &mut |line| {
        if let Some(progress) = TransferProgress::parse(line) {
            on_progress(progress);
        }
    }) {
        Ok(_) => {}
        Err(GitError::Command { stderr, .. })
            if stderr.to_ascii_lowercase().contains("couldn't find remote ref") =>
        {
            return Ok(None);
        }
        Err(e) => return Err(classify(url, e)),
    }

    let tip = cli::stdout(Some(workdir), &["rev-parse", "--verify", "-q", &tracking])?;
    tip.parse::<GitOid>()
        .map(Some)
        .map_err(|e| GitError::InvalidOid {
            value: e.value,
            reason: e.reason,
        })
}

/// Push local `branch` to the same branch on `url`.
///
/// Replaces: `git push --progress <url> refs/heads/<b>:refs/heads/<b>`.
///
/// # Errors
/// [`GitError::PushFailed`] when the remote rejects the update (for example a
/// non-fast-forward), [`GitError::AuthFailed`] on refused credentials.
pub fn push(
    workdir: &Path,
    url: &str,
    auth: Option<&RemoteAuth>,
    branch: &str,
    on_progress: &mut dyn FnMut(TransferProgress),
) -> Result<(), GitError> {
    let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
    let mut args = auth_args(auth);
    args.extend(["push".to_owned(), "--progress".to_owned(), "--".to_owned(), url.to_owned(), refspec]);
    let argv: Vec<&str> = args.iter().map(String::as_str).collect();

    cli::run_streaming(Some(workdir), &argv, &mut |line| {
        if let Some(progress) = TransferProgress::parse(line) {
            on_progress(progress);
        }
    })
    .map_err(|e| match classify(url, e) {
        GitError::Command { stderr, .. } => GitError::PushFailed {
            remote: url.to_owned(),
            message: stderr,
        },
        other => other,
    })?;
    tracing::info!(url, branch, "pushed");
    Ok(())
}

/// Turn credential failures reported by git into [`GitError::AuthFailed`].
fn classify(url: &str, err: GitError) -> GitError {
    match err {
        GitError::Command { stderr, command, exit_code } => {
            let lower = stderr.to_ascii_lowercase();
            if lower.contains("authentication failed")
                || lower.contains("could not read username")
                || lower.contains("could not read password")
                || lower.contains("403")
                || lower.contains("401")
            {
                GitError::AuthFailed {
                    url: url.to_owned(),
                    message: stderr,
                }
            } else {
                GitError::Command {
                    command,
                    stderr,
                    exit_code,
                }
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_counted_progress() {
        let p = TransferProgress::parse("Receiving objects:  37% (37/100), 1.20 MiB | 2.00 MiB/s")
            .unwrap();
        assert_eq!(p.phase, "Receiving objects");
        assert_eq!(p.loaded, 37);
        assert_eq!(p.total, Some(100));
    }

    #[test]
    fn parses_remote_prefixed_progress() {
        let p = TransferProgress::parse("remote: Counting objects: 100% (5/5), done.").unwrap();
        assert_eq!(p.phase, "Counting objects");
        assert_eq!((p.loaded, p.total), (5, Some(5)));
    }

    #[test]
    fn parses_uncounted_progress() {
        let p = TransferProgress::parse("remote: Enumerating objects: 12, done.").unwrap();
        assert_eq!(p.phase, "Enumerating objects");
        assert_eq!((p.loaded, p.total), (12, None));
    }

    #[test]
    fn ignores_plain_messages() {
        assert!(TransferProgress::parse("Cloning into 'repo'...").is_none());
        assert!(TransferProgress::parse("").is_none());
        assert!(TransferProgress::parse("warning: You appear to have cloned an empty repository.").is_none());
    }

    #[test]
    fn auth_header_is_basic() {
        let args = RemoteAuth::new("alice", "s3cret").config_args();
        assert_eq!(args[0], "-c");
        assert_eq!(
            args[1],
            format!("http.extraHeader=Authorization: Basic {}", STANDARD.encode("alice:s3cret"))
        );
        let anonymous = RemoteAuth {
            username: "alice".to_owned(),
            password: None,
        };
        assert!(anonymous.config_args().is_empty());
    }

    #[test]
    fn debug_redacts_password() {
        let rendered = format!("{:?}", RemoteAuth::new("alice", "s3cret"));
        assert!(!rendered.contains("s3cret"));
    }

    #[test]
    fn classify_maps_auth_failures() {
        let err = GitError::Command {
            command: "git fetch".to_owned(),
            stderr: "fatal: Authentication failed for 'https://example.com/r.git'".to_owned(),
            exit_code: Some(128),
        };
        assert!(matches!(classify("https://example.com/r.git", err), GitError::AuthFailed { .. }));
    }
}
