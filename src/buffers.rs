//! Buffer Store: raw bytes at canonical paths, from the working tree or from
//! a historical commit.
//!
//! Absence is a value (`None`), distinct from empty content. Any failure
//! other than absence is an error.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use quire_git::{GitOid, GitRepo};

use crate::error::{EngineError, Result};
use crate::paths;

/// A set of buffers keyed by canonical path (or by object-relative key).
pub type BufferMap = BTreeMap<String, Vec<u8>>;

// ---------------------------------------------------------------------------
// Working tree
// ---------------------------------------------------------------------------

/// Reads and writes buffers in a working copy's checked-out files.
#[derive(Clone, Debug)]
pub struct WorkingTree {
    root: PathBuf,
}

impl WorkingTree {
    /// A store over the working copy at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The working copy root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read the buffer at `path`. Missing files and directories read as
    /// `None`.
    ///
    /// # Errors
    /// [`EngineError::Io`] for any failure other than absence.
    pub fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let full = paths::on_disk(&self.root, path);
        match std::fs::read(&full) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) if full.is_dir() => {
                tracing::debug!(path, error = %e, "buffer path is a directory");
                Ok(None)
            }
            Err(e) => Err(EngineError::io(full, e)),
        }
    }

    /// Read every file below `root`, keyed relative to it. A file `root`
    /// yields a single `/` entry; a missing root yields nothing.
    ///
    /// # Errors
    /// [`EngineError::Io`] if a directory or file cannot be read.
    pub fn read_all(&self, root: &str) -> Result<BufferMap> {
        let mut out = BufferMap::new();
        let full = paths::on_disk(&self.root, root);
        let meta = match std::fs::symlink_metadata(&full) {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(EngineError::io(full, e)),
        };
        if meta.is_dir() {
            self.walk(&full, "", &mut out)?;
        } else {
            let data = std::fs::read(&full).map_err(|e| EngineError::io(&full, e))?;
            out.insert("/".to_owned(), data);
        }
        Ok(out)
    }

    fn walk(&self, dir: &Path, rel: &str, out: &mut BufferMap) -> Result<()> {
        let entries = std::fs::read_dir(dir).map_err(|e| EngineError::io(dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| EngineError::io(dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == ".git" {
                continue;
            }
            let key = format!("{rel}/{name}");
            let path = entry.path();
            let file_type = entry.file_type().map_err(|e| EngineError::io(&path, e))?;
            if file_type.is_dir() {
                self.walk(&path, &key, out)?;
            } else {
                let data = std::fs::read(&path).map_err(|e| EngineError::io(&path, e))?;
                out.insert(key, data);
            }
        }
        Ok(())
    }

    /// Write `data` at `path`, or remove the file when `data` is `None`.
    ///
    /// Parent directories are created on write. On removal, directories left
    /// empty are pruned up to the working copy root.
    ///
    /// # Errors
    /// [`EngineError::Io`] on filesystem failure. Removing a missing file is
    /// not an error.
    pub fn write(&self, path: &str, data: Option<&[u8]>) -> Result<()> {
        let full = paths::on_disk(&self.root, path);
        match data {
            Some(bytes) => {
                if let Some(parent) = full.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
                }
                std::fs::write(&full, bytes).map_err(|e| EngineError::io(&full, e))
            }
            None => {
                match std::fs::remove_file(&full) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
                    Err(e) => return Err(EngineError::io(&full, e)),
                }
                self.prune_empty_parents(&full);
                Ok(())
            }
        }
    }

    fn prune_empty_parents(&self, removed: &Path) {
        let mut dir = removed.parent();
        while let Some(d) = dir {
            if d == self.root || !d.starts_with(&self.root) {
                break;
            }
            // Stops at the first directory that still has entries.
            if std::fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// Reads buffers from committed history. History is immutable, so these
/// reads never need the repository lock.
pub struct History<'r> {
    repo: &'r dyn GitRepo,
    work_dir: &'r Path,
}

impl<'r> History<'r> {
    /// A reader over `repo`, reporting errors against `work_dir`.
    pub fn new(repo: &'r dyn GitRepo, work_dir: &'r Path) -> Self {
        Self { repo, work_dir }
    }

    /// The commit `HEAD` resolves to, if any.
    ///
    /// # Errors
    /// [`EngineError::VersionControl`] when `HEAD` cannot be read.
    pub fn head(&self) -> Result<Option<GitOid>> {
        self.repo
            .head_commit()
            .map_err(|e| EngineError::vcs(self.work_dir, "resolve HEAD", e))
    }

    /// Read `path` as of `commit`. Missing paths, directories and unknown
    /// commits read as `None`.
    ///
    /// # Errors
    /// [`EngineError::VersionControl`] for failures other than absence.
    pub fn read_at(&self, path: &str, commit: GitOid) -> Result<Option<Vec<u8>>> {
        match self.repo.read_path(commit, paths::relative(path)) {
            Ok(data) => Ok(data),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(EngineError::vcs(self.work_dir, "read buffer at version", e)),
        }
    }

    /// Batch variant of [`History::read_at`], keyed by the requested paths.
    ///
    /// # Errors
    /// Same as [`History::read_at`].
    pub fn read_many_at(
        &self,
        paths: &[String],
        commit: GitOid,
    ) -> Result<BTreeMap<String, Option<Vec<u8>>>> {
        paths
            .iter()
            .map(|p| Ok((p.clone(), self.read_at(p, commit)?)))
            .collect()
    }

    /// Every file below `root` in `commit`, keyed relative to `root` like
    /// [`WorkingTree::read_all`].
    ///
    /// # Errors
    /// [`EngineError::VersionControl`] when the commit or its trees cannot be
    /// read.
    pub fn read_all_at(&self, root: &str, commit: GitOid) -> Result<BufferMap> {
        let map_err = |e: quire_git::GitError| EngineError::vcs(self.work_dir, "list buffers at version", e);
        let tree = self.repo.read_commit(commit).map_err(map_err)?.tree_oid;
        let root = paths::canonical(root)?;
        let mut out = BufferMap::new();
        for (rel_path, oid) in self.repo.list_blobs(tree, paths::relative(&root)).map_err(map_err)? {
            let data = self.repo.read_blob(oid).map_err(map_err)?;
            out.insert(paths::relative_to(&root, &format!("/{rel_path}")), data);
        }
        Ok(out)
    }
}
