//! gix-backed status and dirty detection.

use gix::bstr::ByteSlice;

use crate::error::GitError;
use crate::gix_repo::GixRepo;
use crate::types::{FileStatus, StatusEntry};

pub fn is_dirty(repo: &GixRepo) -> Result<bool, GitError> {
    if repo.repo.head_id().is_err() {
        // Unborn HEAD: nothing to compare against but the worktree itself.
        return Ok(!status(repo)?.is_empty());
    }
    if repo.repo.is_dirty().map_err(|e| GitError::BackendError {
        message: format!("dirty check: {e}"),
    })? {
        return Ok(true);
    }
    // `is_dirty` ignores untracked files; a new file is still an
    // uncommitted change for our purposes.
    Ok(status(repo)?
        .iter()
        .any(|entry| entry.status == FileStatus::Added))
}

pub fn status(repo: &GixRepo) -> Result<Vec<StatusEntry>, GitError> {
    let platform = repo
        .repo
        .status(gix::progress::Discard)
        .map_err(|e| GitError::BackendError {
            message: format!("status: {e}"),
        })?
        .untracked_files(gix::status::UntrackedFiles::Files);

    let iter = platform
        .into_index_worktree_iter(Vec::new())
        .map_err(|e| GitError::BackendError {
            message: format!("status: {e}"),
        })?;

    let mut entries = Vec::new();
    for item in iter {
        let item = item.map_err(|e| GitError::BackendError {
            message: format!("status item: {e}"),
        })?;
        if let Some(entry) = convert_status_item(&item) {
            entries.push(entry);
        }
    }
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(entries)
}

fn convert_status_item(item: &gix::status::index_worktree::Item) -> Option<StatusEntry> {
    use gix::status::index_worktree::iter::Summary;

    let summary = item.summary()?;
    let path = item.rela_path().to_str().ok()?.to_owned();
    let status = match summary {
        Summary::Added | Summary::IntentToAdd | Summary::Copied => FileStatus::Added,
        Summary::Modified | Summary::TypeChange | Summary::Conflict => FileStatus::Modified,
        Summary::Removed => FileStatus::Deleted,
        Summary::Renamed => FileStatus::Renamed,
    };
    Some(StatusEntry { path, status })
}
