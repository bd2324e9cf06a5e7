//! The [`GitRepo`] trait: the boundary between the storage engine and a
//! working copy's git plumbing.
//!
//! The engine reaches git exclusively through this trait (local plumbing) and
//! the [`transport`](crate::transport) module (network operations). The trait
//! is object-safe so callers can hold `&dyn GitRepo` or `Box<dyn GitRepo>`.
//!
//! | Group        | Methods                                                   |
//! |--------------|-----------------------------------------------------------|
//! | Refs         | `atomic_ref_update`, `head_branch`, `set_head_branch`     |
//! | Rev-parse    | `rev_parse_opt`, `head_commit`                            |
//! | Object read  | `read_blob`, `read_tree`, `read_commit`                   |
//! | Object write | `write_blob`, `write_tree`, `create_commit`               |
//! | Tree editing | `edit_tree`                                               |
//! | Tree walking | `find_entry`, `read_path`, `list_blobs`, `diff_trees`     |
//! | Index        | `reset_index`                                             |
//! | Checkout     | `checkout_tree`                                           |
//! | Status       | `is_dirty`, `status`                                      |
//! | Config       | `read_config`, `write_config`, `unset_config`             |

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::GitError;
use crate::types::{
    ChangeType, ChangedPath, CommitInfo, EntryMode, GitOid, RefEdit, RefName, Signature, StatusEntry,
    TreeEdit, TreeEntry,
};

/// The git abstraction trait used by the storage engine.
///
/// Tree-walking helpers have default implementations expressed through the
/// object-read primitives, so a test double only needs to provide those.
pub trait GitRepo {
    // -----------------------------------------------------------------------
    // Refs
    //
    // Replaces: git update-ref, git symbolic-ref
    // -----------------------------------------------------------------------

    /// Atomically apply a batch of ref updates with compare-and-swap semantics.
    ///
    /// All updates succeed or all fail. If any ref's current value differs
    /// from its expected old OID the transaction is aborted and
    /// [`GitError::RefConflict`] is returned.
    ///
    /// `committer` is recorded in the reflog; git config is never consulted
    /// for an identity.
    fn atomic_ref_update(&self, edits: &[RefEdit], committer: &Signature) -> Result<(), GitError>;

    /// The branch `HEAD` points at, even when that branch has no commits yet.
    /// `None` when `HEAD` is detached.
    ///
    /// Replaces: `git symbolic-ref HEAD`.
    fn head_branch(&self) -> Result<Option<RefName>, GitError>;

    /// Point `HEAD` at `refs/heads/<branch>`.
    ///
    /// Replaces: `git symbolic-ref HEAD refs/heads/<branch>`.
    fn set_head_branch(&self, branch: &RefName) -> Result<(), GitError>;

    // -----------------------------------------------------------------------
    // Rev-parse
    // -----------------------------------------------------------------------

    /// Resolve a revision spec, returning `None` when it cannot be resolved
    /// (missing ref, unborn `HEAD`, malformed spec).
    ///
    /// Replaces: `git rev-parse --verify -q <spec>`.
    fn rev_parse_opt(&self, spec: &str) -> Result<Option<GitOid>, GitError>;

    /// The commit `HEAD` resolves to, or `None` for a repository without
    /// commits.
    fn head_commit(&self) -> Result<Option<GitOid>, GitError> {
        self.rev_parse_opt("HEAD")
    }

    // -----------------------------------------------------------------------
    // Object read
    //
    // Replaces: git cat-file, git ls-tree, git show
    // -----------------------------------------------------------------------

    /// Read the raw bytes of a blob. Returns [`GitError::NotFound`] if the
    /// object does not exist.
    fn read_blob(&self, oid: GitOid) -> Result<Vec<u8>, GitError>;

    /// Read the direct entries of a tree (non-recursive).
    fn read_tree(&self, oid: GitOid) -> Result<Vec<TreeEntry>, GitError>;

    /// Read a commit's tree, parents, message and identities.
    fn read_commit(&self, oid: GitOid) -> Result<CommitInfo, GitError>;

    // -----------------------------------------------------------------------
    // Object write
    //
    // Replaces: git hash-object -w, git mktree, git commit-tree
    // -----------------------------------------------------------------------

    /// Write bytes as a blob and return its OID.
    fn write_blob(&self, data: &[u8]) -> Result<GitOid, GitError>;

    /// Write a tree from entries. Entries are sorted into git order first.
    fn write_tree(&self, entries: &[TreeEntry]) -> Result<GitOid, GitError>;

    /// Create a commit object authored and committed by `author`.
    ///
    /// The commit is written to the object database only; moving a branch is
    /// the caller's job (see [`GitRepo::atomic_ref_update`]).
    fn create_commit(
        &self,
        tree: GitOid,
        parents: &[GitOid],
        message: &str,
        author: &Signature,
    ) -> Result<GitOid, GitError>;

    // -----------------------------------------------------------------------
    // Tree editing
    // -----------------------------------------------------------------------

    /// Apply path edits to `base` and return the OID of the resulting tree.
    /// Intermediate trees are created or pruned as needed.
    fn edit_tree(&self, base: GitOid, edits: &[TreeEdit]) -> Result<GitOid, GitError>;

    /// The OID of the empty tree, written to the object database.
    fn empty_tree(&self) -> Result<GitOid, GitError> {
        self.write_tree(&[])
    }

    // -----------------------------------------------------------------------
    // Tree walking
    // -----------------------------------------------------------------------

    /// Look up the entry at a slash-separated `path` below `tree`.
    ///
    /// Returns `None` when any component is missing or a non-final component
    /// is not a directory.
    fn find_entry(&self, tree: GitOid, path: &str) -> Result<Option<TreeEntry>, GitError> {
        let mut current = tree;
        let mut components = path.split('/').filter(|c| !c.is_empty()).peekable();
        while let Some(component) = components.next() {
            let Some(entry) = self
                .read_tree(current)?
                .into_iter()
                .find(|e| e.name == component)
            else {
                return Ok(None);
            };
            if components.peek().is_none() {
                return Ok(Some(entry));
            }
            if entry.mode != EntryMode::Tree {
                return Ok(None);
            }
            current = entry.oid;
        }
        Ok(None)
    }

    /// Read the file content at `path` in the tree of `commit`.
    ///
    /// Missing paths and paths naming a directory yield `None`.
    fn read_path(&self, commit: GitOid, path: &str) -> Result<Option<Vec<u8>>, GitError> {
        let tree = self.read_commit(commit)?.tree_oid;
        match self.find_entry(tree, path)? {
            Some(entry) if entry.mode.is_blob() || entry.mode == EntryMode::Link => {
                self.read_blob(entry.oid).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Recursively list every file below `prefix` in `tree`.
    ///
    /// Returned paths are relative to the tree root, without a leading
    /// slash, in git tree order. A `prefix` naming a file yields that file.
    fn list_blobs(&self, tree: GitOid, prefix: &str) -> Result<Vec<(String, GitOid)>, GitError> {
        let prefix = prefix.trim_matches('/');
        let mut out = Vec::new();
        if prefix.is_empty() {
            walk_tree(self, tree, "", &mut out)?;
            return Ok(out);
        }
        match self.find_entry(tree, prefix)? {
            Some(entry) if entry.mode == EntryMode::Tree => {
                walk_tree(self, entry.oid, prefix, &mut out)?;
            }
            Some(entry) if entry.mode != EntryMode::Commit => {
                out.push((prefix.to_owned(), entry.oid));
            }
            _ => {}
        }
        Ok(out)
    }

    /// File-level differences between two trees. `old = None` means every
    /// file in `new` was added.
    ///
    /// Replaces: `git diff-tree -r --name-status`.
    fn diff_trees(&self, old: Option<GitOid>, new: GitOid) -> Result<Vec<ChangedPath>, GitError> {
        let before: BTreeMap<String, GitOid> = match old {
            Some(tree) => self.list_blobs(tree, "")?.into_iter().collect(),
            None => BTreeMap::new(),
        };
        let after: BTreeMap<String, GitOid> = self.list_blobs(new, "")?.into_iter().collect();

        let mut changes = Vec::new();
        for (path, oid) in &after {
            match before.get(path) {
                None => changes.push(ChangedPath {
                    path: path.clone(),
                    change: ChangeType::Added,
                }),
                Some(prev) if prev != oid => changes.push(ChangedPath {
                    path: path.clone(),
                    change: ChangeType::Modified,
                }),
                Some(_) => {}
            }
        }
        for path in before.keys().filter(|p| !after.contains_key(*p)) {
            changes.push(ChangedPath {
                path: path.clone(),
                change: ChangeType::Deleted,
            });
        }
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(changes)
    }

    // -----------------------------------------------------------------------
    // Index
    //
    // Replaces: git read-tree, git reset --mixed
    // -----------------------------------------------------------------------

    /// Replace the git index with the contents of `tree`, leaving the working
    /// tree alone.
    fn reset_index(&self, tree: GitOid) -> Result<(), GitError>;

    // -----------------------------------------------------------------------
    // Checkout
    // -----------------------------------------------------------------------

    /// Make the working tree and index match a commit or tree.
    ///
    /// Files not present in the target are removed; `.git` is never touched.
    ///
    /// Replaces: `git checkout -f <oid> -- .` followed by `git clean`.
    fn checkout_tree(&self, oid: GitOid, workdir: &Path) -> Result<(), GitError>;

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    /// Whether the working tree has uncommitted changes to tracked or
    /// untracked files.
    fn is_dirty(&self) -> Result<bool, GitError>;

    /// Index-to-worktree status entries.
    ///
    /// Replaces: `git status --porcelain`.
    fn status(&self) -> Result<Vec<StatusEntry>, GitError>;

    // -----------------------------------------------------------------------
    // Config
    //
    // Replaces: git config
    // -----------------------------------------------------------------------

    /// Read a single-valued key such as `remote.origin.url`.
    fn read_config(&self, key: &str) -> Result<Option<String>, GitError>;

    /// Set a key in the repository-local config.
    fn write_config(&self, key: &str, value: &str) -> Result<(), GitError>;

    /// Remove a key from the repository-local config. No-op when absent.
    fn unset_config(&self, key: &str) -> Result<(), GitError>;
}

fn walk_tree<R: GitRepo + ?Sized>(
    repo: &R,
    tree: GitOid,
    base: &str,
    out: &mut Vec<(String, GitOid)>,
) -> Result<(), GitError> {
    for entry in repo.read_tree(tree)? {
        let path = if base.is_empty() {
            entry.name.clone()
        } else {
            format!("{base}/{}", entry.name)
        };
        match entry.mode {
            EntryMode::Tree => walk_tree(repo, entry.oid, &path, out)?,
            EntryMode::Commit => {}
            _ => out.push((path, entry.oid)),
        }
    }
    Ok(())
}
