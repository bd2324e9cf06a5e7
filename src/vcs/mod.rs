//! Version-Control Adapter: working-copy lifecycle and settings.
//!
//! These functions implement the engine's repository operations on top of
//! [`GitRepo`]. They assume the caller holds the repository lock where the
//! operation mutates the working copy; locking and status reporting are the
//! engine's job.
//!
//! Working-copy attributes (remote, author) live in the repository's local
//! git config, so they survive restarts and are visible to plain `git`.

pub mod sync;

use std::path::{Path, PathBuf};

use quire_git::{GitError, GitOid, GitRepo, GixRepo, RefName, Signature};
use serde::{Deserialize, Serialize};

use crate::config::RepositoriesConfig;
use crate::error::{EngineError, Result};

pub use sync::{PullOutcome, clone, pull, push};

/// Git config key holding the remote URL.
pub const KEY_REMOTE_URL: &str = "remote.origin.url";
/// Git config key holding the remote username.
pub const KEY_REMOTE_USERNAME: &str = "quire.remoteUsername";
/// Git config key recording whether the credentials may push.
pub const KEY_WRITE_ACCESS: &str = "quire.writeAccess";
/// Git config keys holding the commit author.
pub const KEY_USER_NAME: &str = "user.name";
pub const KEY_USER_EMAIL: &str = "user.email";
/// Reflog identity when the working copy has no author configured.
const ENGINE_NAME: &str = "quire";
const ENGINE_EMAIL: &str = "quire@localhost";

/// A commit author as it travels over the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    pub email: String,
}

impl From<Author> for Signature {
    fn from(a: Author) -> Self {
        Self::new(a.name, a.email)
    }
}

/// Remote settings of a working copy. Passwords are never stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSettings {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default)]
    pub write_access: bool,
}

/// Everything the engine knows about a working copy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkingCopyDescription {
    pub work_dir: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Author>,
    pub dirty: bool,
}

fn vcs(work_dir: &Path, operation: &'static str) -> impl FnOnce(GitError) -> EngineError {
    move |e| EngineError::vcs(work_dir, operation, e)
}

/// Check a branch name against the configured allow-list.
///
/// # Errors
/// [`EngineError::Validation`] for a blank, malformed or disallowed name.
pub fn validate_branch(branch: &str, repositories: &RepositoriesConfig) -> Result<RefName> {
    let branch = branch.trim();
    if branch.is_empty() {
        return Err(EngineError::validation("Missing branch name"));
    }
    if !repositories.allows(branch) {
        return Err(EngineError::validation(format!(
            "branch {branch:?} is not allowed (expected one of: {})",
            repositories.allowed_branches.join(", ")
        )));
    }
    RefName::branch(branch).map_err(|e| EngineError::validation(e.to_string()))
}

/// Create an empty repository at `work_dir` on `branch`.
///
/// # Errors
/// [`EngineError::Validation`] when `work_dir` already holds a repository,
/// [`EngineError::VersionControl`] when git fails.
pub fn init(work_dir: &Path, branch: &RefName) -> Result<()> {
    if work_dir.join(".git").exists() {
        return Err(EngineError::validation(format!(
            "{} is already a repository",
            work_dir.display()
        )));
    }
    std::fs::create_dir_all(work_dir).map_err(|e| EngineError::io(work_dir, e))?;
    GixRepo::init(work_dir, branch).map_err(vcs(work_dir, "init"))?;
    tracing::info!(work_dir = %work_dir.display(), branch = branch.as_str(), "initialized");
    Ok(())
}

/// Remove the working copy from disk.
///
/// Without `force`, a working copy with uncommitted changes is refused.
///
/// # Errors
/// [`EngineError::Validation`] for a dirty working copy,
/// [`EngineError::Io`] when removal fails.
pub fn delete(work_dir: &Path, force: bool) -> Result<()> {
    if !work_dir.exists() {
        tracing::debug!(work_dir = %work_dir.display(), "nothing to delete");
        return Ok(());
    }
    if !force {
        let repo = GixRepo::open_at(work_dir).map_err(vcs(work_dir, "delete"))?;
        if repo.is_dirty().map_err(vcs(work_dir, "delete"))? {
            return Err(EngineError::validation(
                "working copy has uncommitted changes; pass force to delete anyway",
            ));
        }
    }
    std::fs::remove_dir_all(work_dir).map_err(|e| EngineError::io(work_dir, e))?;
    tracing::info!(work_dir = %work_dir.display(), force, "deleted");
    Ok(())
}

/// Point `origin` at a remote and record the non-secret credentials.
///
/// # Errors
/// [`EngineError::Validation`] for a blank URL, [`EngineError::VersionControl`]
/// when the config cannot be written.
pub fn set_remote(repo: &dyn GitRepo, work_dir: &Path, remote: &RemoteSettings) -> Result<()> {
    if remote.url.trim().is_empty() {
        return Err(EngineError::validation("Missing remote URL"));
    }
    let map = vcs(work_dir, "set remote");
    let result = (|| -> Result<(), GitError> {
        repo.write_config(KEY_REMOTE_URL, remote.url.trim())?;
        match &remote.username {
            Some(username) => repo.write_config(KEY_REMOTE_USERNAME, username)?,
            None => repo.unset_config(KEY_REMOTE_USERNAME)?,
        }
        repo.write_config(KEY_WRITE_ACCESS, if remote.write_access { "true" } else { "false" })
    })();
    result.map_err(map)
}

/// Forget the remote.
///
/// # Errors
/// [`EngineError::VersionControl`] when the config cannot be written.
pub fn delete_origin(repo: &dyn GitRepo, work_dir: &Path) -> Result<()> {
    let map = vcs(work_dir, "delete origin");
    let result = (|| -> Result<(), GitError> {
        repo.unset_config(KEY_REMOTE_URL)?;
        repo.unset_config(KEY_REMOTE_USERNAME)?;
        repo.unset_config(KEY_WRITE_ACCESS)
    })();
    result.map_err(map)
}

/// Record the default commit author.
///
/// # Errors
/// [`EngineError::Validation`] for a blank name or email.
pub fn set_author(repo: &dyn GitRepo, work_dir: &Path, author: &Author) -> Result<()> {
    if author.name.trim().is_empty() || author.email.trim().is_empty() {
        return Err(EngineError::validation("Missing author information"));
    }
    let map = vcs(work_dir, "set author");
    let result = (|| -> Result<(), GitError> {
        repo.write_config(KEY_USER_NAME, author.name.trim())?;
        repo.write_config(KEY_USER_EMAIL, author.email.trim())
    })();
    result.map_err(map)
}

/// The remote recorded in config, if any.
///
/// # Errors
/// [`EngineError::VersionControl`] when the config cannot be read.
pub fn remote(repo: &dyn GitRepo, work_dir: &Path) -> Result<Option<RemoteSettings>> {
    let map = vcs(work_dir, "read remote");
    let result = (|| -> Result<Option<RemoteSettings>, GitError> {
        let Some(url) = repo.read_config(KEY_REMOTE_URL)? else {
            return Ok(None);
        };
        Ok(Some(RemoteSettings {
            url,
            username: repo.read_config(KEY_REMOTE_USERNAME)?,
            write_access: repo
                .read_config(KEY_WRITE_ACCESS)?
                .is_some_and(|v| v == "true"),
        }))
    })();
    result.map_err(map)
}

/// The author recorded in config, if both parts are set.
///
/// # Errors
/// [`EngineError::VersionControl`] when the config cannot be read.
pub fn author(repo: &dyn GitRepo, work_dir: &Path) -> Result<Option<Author>> {
    let map = vcs(work_dir, "read author");
    let name = repo.read_config(KEY_USER_NAME).map_err(map)?;
    let email = repo
        .read_config(KEY_USER_EMAIL)
        .map_err(vcs(work_dir, "read author"))?;
    Ok(name.zip(email).map(|(name, email)| Author { name, email }))
}

/// Identity recorded in the reflog for ref moves no author asked for, such
/// as a pull: the configured author, or a fixed engine identity.
///
/// # Errors
/// [`EngineError::VersionControl`] when the config cannot be read.
pub fn reflog_identity(repo: &dyn GitRepo, work_dir: &Path) -> Result<Signature> {
    Ok(author(repo, work_dir)?
        .map_or_else(|| Signature::new(ENGINE_NAME, ENGINE_EMAIL), Signature::from))
}

/// Describe the working copy at `work_dir`.
///
/// # Errors
/// [`EngineError::VersionControl`] when the repository cannot be read.
pub fn describe_working_copy(repo: &dyn GitRepo, work_dir: &Path) -> Result<WorkingCopyDescription> {
    let map = vcs(work_dir, "describe working copy");
    let branch = repo
        .head_branch()
        .map_err(vcs(work_dir, "describe working copy"))?
        .and_then(|r| r.branch_name().map(str::to_owned));
    let head = repo
        .head_commit()
        .map_err(vcs(work_dir, "describe working copy"))?
        .map(|oid| oid.to_string());
    let dirty = repo.is_dirty().map_err(map)?;
    Ok(WorkingCopyDescription {
        work_dir: work_dir.to_path_buf(),
        branch,
        head,
        remote: remote(repo, work_dir)?,
        author: author(repo, work_dir)?,
        dirty,
    })
}

/// Throw away uncommitted changes: the working tree and index are reset to
/// `HEAD`, and untracked files are removed. Returns the commit restored.
///
/// # Errors
/// [`EngineError::VersionControl`] when the checkout fails.
pub fn discard_uncommitted_changes(repo: &dyn GitRepo, work_dir: &Path) -> Result<Option<GitOid>> {
    let head = repo.head_commit().map_err(vcs(work_dir, "discard changes"))?;
    let target = match head {
        Some(head) => head,
        None => repo.empty_tree().map_err(vcs(work_dir, "discard changes"))?,
    };
    repo.checkout_tree(target, work_dir)
        .map_err(vcs(work_dir, "discard changes"))?;
    tracing::info!(work_dir = %work_dir.display(), "discarded uncommitted changes");
    Ok(head)
}
