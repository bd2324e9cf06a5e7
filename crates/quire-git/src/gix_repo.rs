//! The gix-backed implementation of [`GitRepo`].

use std::path::{Path, PathBuf};

use crate::error::GitError;
use crate::repo::GitRepo;
use crate::types::{
    CommitInfo, GitOid, RefEdit, RefName, Signature, StatusEntry, TreeEdit, TreeEntry,
};

/// A [`GitRepo`] implementation backed by [gix](https://github.com/GitoxideLabs/gitoxide).
///
/// Construct via [`GixRepo::open`], [`GixRepo::open_at`] or [`GixRepo::init`].
/// A handle is cheap to keep but not `Sync`; each execution context opens
/// its own.
pub struct GixRepo {
    pub(crate) repo: gix::Repository,
    pub(crate) workdir: Option<PathBuf>,
}

impl GixRepo {
    /// Open the git repository at or above `path`.
    ///
    /// # Errors
    /// [`GitError::NotARepository`] when no repository is found.
    pub fn open(path: &Path) -> Result<Self, GitError> {
        let repo = gix::discover(path).map_err(|e| {
            tracing::debug!(path = %path.display(), error = %e, "discover failed");
            GitError::NotARepository {
                path: path.to_path_buf(),
            }
        })?;
        Ok(Self::wrap(repo))
    }

    /// Open a git repository at exactly `path` (no parent discovery, no
    /// global or system config).
    ///
    /// # Errors
    /// [`GitError::NotARepository`] when `path` holds no repository.
    pub fn open_at(path: &Path) -> Result<Self, GitError> {
        let repo = gix::open_opts(path, gix::open::Options::isolated()).map_err(|e| {
            tracing::debug!(path = %path.display(), error = %e, "open failed");
            GitError::NotARepository {
                path: path.to_path_buf(),
            }
        })?;
        Ok(Self::wrap(repo))
    }

    /// Create a new non-bare repository at `path` whose `HEAD` points at the
    /// (unborn) `branch`.
    ///
    /// Replaces: `git init -b <branch> <path>`.
    ///
    /// # Errors
    /// Fails if `path` already holds a repository or cannot be created.
    pub fn init(path: &Path, branch: &RefName) -> Result<Self, GitError> {
        std::fs::create_dir_all(path)?;
        let repo = gix::init(path).map_err(|e| GitError::BackendError {
            message: format!("failed to init {}: {e}", path.display()),
        })?;
        let this = Self::wrap(repo);
        this.set_head_branch(branch)?;
        Ok(this)
    }

    fn wrap(repo: gix::Repository) -> Self {
        let workdir = repo.workdir().map(Path::to_path_buf);
        Self { repo, workdir }
    }

    /// The working tree root, if the repository is not bare.
    #[must_use]
    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }

    /// The `.git` directory.
    #[must_use]
    pub fn git_dir(&self) -> &Path {
        self.repo.git_dir()
    }
}

impl std::fmt::Debug for GixRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GixRepo")
            .field("git_dir", &self.git_dir())
            .field("workdir", &self.workdir)
            .finish_non_exhaustive()
    }
}

/// Convert our `GitOid` to a `gix::ObjectId`.
pub(crate) const fn to_gix_oid(oid: GitOid) -> gix::ObjectId {
    gix::ObjectId::Sha1(*oid.as_bytes())
}

/// Convert a `gix::ObjectId` (or `&gix::oid`) to our `GitOid`.
pub(crate) fn from_gix_oid(oid: &gix::oid) -> GitOid {
    let mut bytes = [0u8; 20];
    let src = oid.as_bytes();
    let n = src.len().min(bytes.len());
    bytes[..n].copy_from_slice(&src[..n]);
    GitOid::from_bytes(bytes)
}

impl GitRepo for GixRepo {
    // === Refs ===
    fn atomic_ref_update(&self, edits: &[RefEdit], committer: &Signature) -> Result<(), GitError> {
        crate::refs_impl::atomic_ref_update(self, edits, committer)
    }

    fn head_branch(&self) -> Result<Option<RefName>, GitError> {
        crate::refs_impl::head_branch(self)
    }

    fn set_head_branch(&self, branch: &RefName) -> Result<(), GitError> {
        crate::refs_impl::set_head_branch(self, branch)
    }

    // === Rev-parse ===
    fn rev_parse_opt(&self, spec: &str) -> Result<Option<GitOid>, GitError> {
        crate::refs_impl::rev_parse_opt(self, spec)
    }

    // === Object read ===
    fn read_blob(&self, oid: GitOid) -> Result<Vec<u8>, GitError> {
        crate::objects_impl::read_blob(self, oid)
    }

    fn read_tree(&self, oid: GitOid) -> Result<Vec<TreeEntry>, GitError> {
        crate::objects_impl::read_tree(self, oid)
    }

    fn read_commit(&self, oid: GitOid) -> Result<CommitInfo, GitError> {
        crate::objects_impl::read_commit(self, oid)
    }

    // === Object write ===
    fn write_blob(&self, data: &[u8]) -> Result<GitOid, GitError> {
        crate::objects_impl::write_blob(self, data)
    }

    fn write_tree(&self, entries: &[TreeEntry]) -> Result<GitOid, GitError> {
        crate::objects_impl::write_tree(self, entries)
    }

    fn create_commit(
        &self,
        tree: GitOid,
        parents: &[GitOid],
        message: &str,
        author: &Signature,
    ) -> Result<GitOid, GitError> {
        crate::objects_impl::create_commit(self, tree, parents, message, author)
    }

    // === Tree editing ===
    fn edit_tree(&self, base: GitOid, edits: &[TreeEdit]) -> Result<GitOid, GitError> {
        crate::objects_impl::edit_tree(self, base, edits)
    }

    // === Index ===
    fn reset_index(&self, tree: GitOid) -> Result<(), GitError> {
        crate::checkout_impl::reset_index(self, tree)
    }

    // === Checkout ===
    fn checkout_tree(&self, oid: GitOid, workdir: &Path) -> Result<(), GitError> {
        crate::checkout_impl::checkout_tree(self, oid, workdir)
    }

    // === Status ===
    fn is_dirty(&self) -> Result<bool, GitError> {
        crate::status_impl::is_dirty(self)
    }

    fn status(&self) -> Result<Vec<StatusEntry>, GitError> {
        crate::status_impl::status(self)
    }

    // === Config ===
    fn read_config(&self, key: &str) -> Result<Option<String>, GitError> {
        crate::config_impl::read_config(self, key)
    }

    fn write_config(&self, key: &str, value: &str) -> Result<(), GitError> {
        crate::config_impl::write_config(self, key, value)
    }

    fn unset_config(&self, key: &str) -> Result<(), GitError> {
        crate::config_impl::unset_config(self, key)
    }
}
