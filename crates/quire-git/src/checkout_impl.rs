//! gix-backed checkout and index operations.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::AtomicBool;

use gix::bstr::ByteSlice;

use crate::error::GitError;
use crate::gix_repo::{GixRepo, to_gix_oid};
use crate::types::GitOid;

/// Resolve a commit or tree OID to a tree OID.
fn peel_to_tree(repo: &GixRepo, oid: GitOid) -> Result<gix::ObjectId, GitError> {
    let gix_oid = to_gix_oid(oid);
    let obj = repo
        .repo
        .find_object(gix_oid)
        .map_err(|e| GitError::NotFound {
            message: format!("object {oid}: {e}"),
        })?;
    match obj.kind {
        gix::object::Kind::Commit => Ok(obj
            .into_commit()
            .tree_id()
            .map_err(|e| GitError::BackendError {
                message: format!("failed to get tree from commit {oid}: {e}"),
            })?
            .detach()),
        gix::object::Kind::Tree => Ok(gix_oid),
        other => Err(GitError::BackendError {
            message: format!("expected commit or tree, got {other}"),
        }),
    }
}

fn index_from_tree(repo: &GixRepo, tree: &gix::oid) -> Result<gix::index::File, GitError> {
    repo.repo
        .index_from_tree(tree)
        .map_err(|e| GitError::BackendError {
            message: format!("failed to create index from tree {tree}: {e}"),
        })
}

fn write_index(index: &mut gix::index::File) -> Result<(), GitError> {
    index
        .write(gix::index::write::Options::default())
        .map_err(|e| GitError::BackendError {
            message: format!("failed to write index: {e}"),
        })
}

pub fn reset_index(repo: &GixRepo, tree: GitOid) -> Result<(), GitError> {
    let tree_oid = peel_to_tree(repo, tree)?;
    let mut index = index_from_tree(repo, &tree_oid)?;
    write_index(&mut index)
}

pub fn checkout_tree(repo: &GixRepo, oid: GitOid, workdir: &Path) -> Result<(), GitError> {
    let tree_oid = peel_to_tree(repo, oid)?;
    let mut index_file = index_from_tree(repo, &tree_oid)?;

    let tree_paths: HashSet<String> = index_file
        .entries()
        .iter()
        .filter_map(|entry| entry.path(&index_file).to_str().ok().map(str::to_owned))
        .collect();

    let mut opts = repo
        .repo
        .checkout_options(gix::worktree::stack::state::attributes::Source::IdMapping)
        .map_err(|e| GitError::BackendError {
            message: format!("failed to get checkout options: {e}"),
        })?;
    opts.overwrite_existing = true;
    opts.destination_is_initially_empty = false;

    let objects = repo
        .repo
        .objects
        .clone()
        .into_arc()
        .map_err(|e| GitError::BackendError {
            message: format!("failed to share object store: {e}"),
        })?;

    let outcome = gix::worktree::state::checkout(
        &mut index_file,
        workdir,
        objects,
        &gix::progress::Discard,
        &gix::progress::Discard,
        &AtomicBool::new(false),
        opts,
    )
    .map_err(|e| GitError::BackendError {
        message: format!("checkout failed: {e}"),
    })?;

    if let Some(first) = outcome.errors.first() {
        return Err(GitError::BackendError {
            message: format!(
                "checkout had {} error(s), first: {}: {}",
                outcome.errors.len(),
                first.path,
                first.error,
            ),
        });
    }

    remove_stale_files(workdir, workdir, &tree_paths)?;
    // Checkout refreshed the stat data of every entry; persist it so the
    // next status check is cheap and clean.
    write_index(&mut index_file)
}

/// Remove files below `dir` whose workdir-relative path is not in
/// `tree_paths`, then drop directories left empty. `.git` is skipped.
fn remove_stale_files(
    workdir: &Path,
    dir: &Path,
    tree_paths: &HashSet<String>,
) -> Result<(), GitError> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Ok(());
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if entry.file_name() == ".git" {
            continue;
        }

        if entry.file_type().is_ok_and(|t| t.is_dir()) {
            remove_stale_files(workdir, &path, tree_paths)?;
            // Fails harmlessly when the directory still has tracked files.
            let _ = std::fs::remove_dir(&path);
            continue;
        }

        let rel = path
            .strip_prefix(workdir)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();
        if !rel.is_empty() && !tree_paths.contains(&rel) {
            tracing::debug!(path = %rel, "removing file absent from checked-out tree");
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}
