//! Clone, push and pull.
//!
//! Transport goes through the `git` CLI (see `quire_git::transport`); the
//! fast-forward after a fetch is done locally with gix so the changed paths
//! are known exactly.

use std::collections::{BTreeSet, VecDeque};
use std::path::Path;

use quire_git::transport::{self, RemoteAuth, TransferProgress};
use quire_git::{ChangedPath, GitError, GitOid, GitRepo, GixRepo, RefEdit, RefName, Signature};

use super::{KEY_REMOTE_USERNAME, reflog_identity, vcs};
use crate::error::{EngineError, Result};

/// What a pull did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PullOutcome {
    /// The new `HEAD`, when it moved.
    pub new_head: Option<GitOid>,
    /// Files that changed in the working tree.
    pub changed: Vec<ChangedPath>,
}

/// Clone `url` into `work_dir` on `branch`.
///
/// A blank remote is cloned as an empty repository whose `HEAD` points at
/// `branch`. Whatever the clone created is removed if it fails; a directory
/// that existed beforehand is emptied but kept.
///
/// # Errors
/// [`EngineError::Validation`] when `work_dir` exists and is not empty,
/// [`EngineError::VersionControl`] when git fails.
pub fn clone(
    url: &str,
    auth: Option<&RemoteAuth>,
    branch: &RefName,
    work_dir: &Path,
    on_progress: &mut dyn FnMut(TransferProgress),
) -> Result<()> {
    let occupied = std::fs::read_dir(work_dir).is_ok_and(|mut entries| entries.next().is_some());
    if occupied {
        return Err(EngineError::validation(format!(
            "{} already exists and is not empty",
            work_dir.display()
        )));
    }

    let existed = work_dir.exists();
    let result = clone_into(url, auth, branch, work_dir, on_progress);
    if result.is_err() && work_dir.exists() {
        tracing::info!(work_dir = %work_dir.display(), existed, "removing failed clone");
        let cleanup = if existed {
            empty_dir(work_dir)
        } else {
            std::fs::remove_dir_all(work_dir)
        };
        if let Err(e) = cleanup {
            tracing::warn!(work_dir = %work_dir.display(), error = %e, "failed to clean up clone");
        }
    }
    result
}

fn empty_dir(dir: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

fn clone_into(
    url: &str,
    auth: Option<&RemoteAuth>,
    branch: &RefName,
    work_dir: &Path,
    on_progress: &mut dyn FnMut(TransferProgress),
) -> Result<()> {
    let name = branch.branch_name().unwrap_or("main");
    let refs = transport::ls_remote(url, auth).map_err(vcs(work_dir, "clone"))?;
    let blank = refs.is_empty();
    if !blank && !refs.iter().any(|(r, _)| r == branch.as_str()) {
        return Err(EngineError::validation(format!(
            "remote has no branch {name:?}"
        )));
    }

    transport::clone(url, auth, (!blank).then_some(name), work_dir, on_progress)
        .map_err(vcs(work_dir, "clone"))?;

    let repo = GixRepo::open_at(work_dir).map_err(vcs(work_dir, "clone"))?;
    if blank {
        repo.set_head_branch(branch).map_err(vcs(work_dir, "clone"))?;
    }
    if let Some(username) = auth.map(|a| a.username.as_str()) {
        repo.write_config(KEY_REMOTE_USERNAME, username)
            .map_err(vcs(work_dir, "clone"))?;
    }
    tracing::info!(url, work_dir = %work_dir.display(), blank, "clone complete");
    Ok(())
}

/// Push the current branch to `url`.
///
/// # Errors
/// [`EngineError::Validation`] when there is nothing to push,
/// [`EngineError::VersionControl`] when the remote refuses.
pub fn push(
    repo: &dyn GitRepo,
    work_dir: &Path,
    url: &str,
    auth: Option<&RemoteAuth>,
    on_progress: &mut dyn FnMut(TransferProgress),
) -> Result<()> {
    let branch = current_branch(repo, work_dir)?;
    if repo.head_commit().map_err(vcs(work_dir, "push"))?.is_none() {
        return Err(EngineError::validation("nothing to push: the branch has no commits"));
    }
    let name = branch.branch_name().unwrap_or_default();
    transport::push(work_dir, url, auth, name, on_progress).map_err(vcs(work_dir, "push"))
}

/// Fetch the current branch from `url` and fast-forward to it.
///
/// Only fast-forwards are performed. A working copy with uncommitted changes
/// is refused, since the checkout would overwrite them.
///
/// # Errors
/// [`EngineError::Validation`] for a dirty working copy,
/// [`EngineError::VersionControl`] when the fetch fails or the histories
/// have diverged.
pub fn pull(
    repo: &dyn GitRepo,
    work_dir: &Path,
    url: &str,
    auth: Option<&RemoteAuth>,
    on_progress: &mut dyn FnMut(TransferProgress),
) -> Result<PullOutcome> {
    let branch = current_branch(repo, work_dir)?;
    let name = branch.branch_name().unwrap_or_default().to_owned();
    if repo.is_dirty().map_err(vcs(work_dir, "pull"))? {
        return Err(EngineError::validation(
            "working copy has uncommitted changes; commit or discard them before pulling",
        ));
    }

    let Some(remote) = transport::fetch(work_dir, url, auth, &name, on_progress)
        .map_err(vcs(work_dir, "pull"))?
    else {
        tracing::info!(url, branch = %name, "remote branch does not exist, nothing to pull");
        return Ok(PullOutcome::default());
    };
    let local = repo.head_commit().map_err(vcs(work_dir, "pull"))?;

    if let Some(local) = local {
        if local == remote || is_ancestor(repo, remote, local).map_err(vcs(work_dir, "pull"))? {
            tracing::info!(%local, "already up to date");
            return Ok(PullOutcome::default());
        }
        if !is_ancestor(repo, local, remote).map_err(vcs(work_dir, "pull"))? {
            return Err(EngineError::vcs(
                work_dir,
                "pull",
                GitError::RefConflict {
                    ref_name: branch.as_str().to_owned(),
                    message: format!("local {local} and remote {remote} have diverged"),
                },
            ));
        }
    }

    let old_tree = match local {
        Some(local) => Some(repo.read_commit(local).map_err(vcs(work_dir, "pull"))?.tree_oid),
        None => None,
    };
    let new_tree = repo.read_commit(remote).map_err(vcs(work_dir, "pull"))?.tree_oid;
    let changed = repo
        .diff_trees(old_tree, new_tree)
        .map_err(vcs(work_dir, "pull"))?;

    let committer = reflog_identity(repo, work_dir)?;
    fast_forward(repo, work_dir, &branch, local, remote, &committer)?;

    tracing::info!(%remote, files = changed.len(), "fast-forwarded");
    Ok(PullOutcome {
        new_head: Some(remote),
        changed,
    })
}

/// Check out `to`, then move `branch` from `from` to `to`.
///
/// The working tree is checked out first so a failed checkout leaves the
/// branch where it was. If either step fails the tree of `from` is checked
/// out again; the working copy was clean, so that restores it exactly.
fn fast_forward(
    repo: &dyn GitRepo,
    work_dir: &Path,
    branch: &RefName,
    from: Option<GitOid>,
    to: GitOid,
    committer: &Signature,
) -> Result<()> {
    let result = repo.checkout_tree(to, work_dir).and_then(|()| {
        repo.atomic_ref_update(
            &[RefEdit {
                name: branch.clone(),
                new_oid: to,
                expected_old_oid: from.unwrap_or(GitOid::ZERO),
                log_message: format!("pull: fast-forward to {}", to.short()),
            }],
            committer,
        )
    });
    if let Err(e) = result {
        let restore = from
            .map_or_else(|| repo.empty_tree(), Ok)
            .and_then(|tree| repo.checkout_tree(tree, work_dir));
        if let Err(restore_err) = restore {
            tracing::error!(error = %restore_err, "failed to restore the working tree after a failed pull");
        }
        return Err(EngineError::vcs(work_dir, "pull", e));
    }
    Ok(())
}

fn current_branch(repo: &dyn GitRepo, work_dir: &Path) -> Result<RefName> {
    repo.head_branch()
        .map_err(vcs(work_dir, "resolve HEAD"))?
        .ok_or_else(|| EngineError::validation("HEAD is detached"))
}

/// Whether `ancestor` is reachable from `descendant` through parent links.
fn is_ancestor(repo: &dyn GitRepo, ancestor: GitOid, descendant: GitOid) -> std::result::Result<bool, GitError> {
    let mut seen = BTreeSet::new();
    let mut queue = VecDeque::from([descendant]);
    while let Some(oid) = queue.pop_front() {
        if oid == ancestor {
            return Ok(true);
        }
        if !seen.insert(oid.to_string()) {
            continue;
        }
        queue.extend(repo.read_commit(oid)?.parents);
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_git::{EntryMode, TreeEdit};

    fn commit_file(repo: &GixRepo, path: &str, content: &str) -> GitOid {
        let head = repo.head_commit().unwrap();
        let base = match head {
            Some(h) => repo.read_commit(h).unwrap().tree_oid,
            None => repo.empty_tree().unwrap(),
        };
        let blob = repo.write_blob(content.as_bytes()).unwrap();
        let tree = repo
            .edit_tree(
                base,
                &[TreeEdit::Upsert {
                    path: path.to_owned(),
                    mode: EntryMode::Blob,
                    oid: blob,
                }],
            )
            .unwrap();
        let parents: Vec<GitOid> = head.into_iter().collect();
        let oid = repo
            .create_commit(tree, &parents, "c", &Signature::new("T", "t@example.com"))
            .unwrap();
        repo.atomic_ref_update(
            &[RefEdit {
                name: RefName::branch("main").unwrap(),
                new_oid: oid,
                expected_old_oid: head.unwrap_or(GitOid::ZERO),
                log_message: "c".to_owned(),
            }],
            &Signature::new("T", "t@example.com"),
        )
        .unwrap();
        oid
    }

    #[test]
    fn ancestry_follows_parents() {
        let dir = tempfile::tempdir().unwrap();
        let repo = GixRepo::init(dir.path(), &RefName::branch("main").unwrap()).unwrap();
        let first = commit_file(&repo, "a", "1");
        let second = commit_file(&repo, "a", "2");
        assert!(is_ancestor(&repo, first, second).unwrap());
        assert!(!is_ancestor(&repo, second, first).unwrap());
    }

    #[test]
    fn clone_into_non_empty_directory_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x"), "x").unwrap();
        let err = clone(
            "file:///nonexistent",
            None,
            &RefName::branch("main").unwrap(),
            dir.path(),
            &mut |_| {},
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
        assert!(dir.path().join("x").exists());
    }

    #[test]
    fn failed_clone_keeps_preexisting_directory() {
        let parent = tempfile::tempdir().unwrap();
        let dest = parent.path().join("wc");
        std::fs::create_dir(&dest).unwrap();
        let missing = parent.path().join("no-such-remote");
        let result = clone(
            &missing.to_string_lossy(),
            None,
            &RefName::branch("main").unwrap(),
            &dest,
            &mut |_| {},
        );
        assert!(result.is_err());
        assert!(dest.is_dir());
        assert_eq!(std::fs::read_dir(&dest).unwrap().count(), 0);
    }

    #[test]
    fn failed_fast_forward_restores_working_tree() {
        let dir = tempfile::tempdir().unwrap();
        let repo = GixRepo::init(dir.path(), &RefName::branch("main").unwrap()).unwrap();
        let first = commit_file(&repo, "a.txt", "1");
        repo.checkout_tree(first, dir.path()).unwrap();
        let upstream = commit_file(&repo, "b.txt", "new");
        // Put the branch back on `first`, then claim it sits on a sibling
        // commit so the ref update is rejected after the checkout.
        let sig = Signature::new("T", "t@example.com");
        repo.atomic_ref_update(
            &[RefEdit {
                name: RefName::branch("main").unwrap(),
                new_oid: first,
                expected_old_oid: upstream,
                log_message: "rewind".to_owned(),
            }],
            &sig,
        )
        .unwrap();
        let tree = repo.read_commit(first).unwrap().tree_oid;
        let sibling = repo.create_commit(tree, &[first], "sibling", &sig).unwrap();

        let err = fast_forward(
            &repo,
            dir.path(),
            &RefName::branch("main").unwrap(),
            Some(sibling),
            upstream,
            &sig,
        )
        .unwrap_err();

        assert!(matches!(err, EngineError::VersionControl { .. }), "{err:?}");
        assert_eq!(repo.head_commit().unwrap(), Some(first));
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "1");
        assert!(!dir.path().join("b.txt").exists());
        assert!(!repo.is_dirty().unwrap());
    }

    #[test]
    fn failed_clone_removes_destination() {
        let parent = tempfile::tempdir().unwrap();
        let dest = parent.path().join("wc");
        let missing = parent.path().join("no-such-remote");
        let result = clone(
            &missing.to_string_lossy(),
            None,
            &RefName::branch("main").unwrap(),
            &dest,
            &mut |_| {},
        );
        assert!(result.is_err());
        assert!(!dest.exists());
    }
}
