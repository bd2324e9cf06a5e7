//! Commit Pipeline: validate → detect conflicts → write → commit.
//!
//! The pipeline runs on a working copy's writer context with the repository
//! lock held. Conflicts are detected against the working tree before
//! anything is written. Files touched by the write phase are journaled and
//! restored if the commit cannot be completed, so a failed commit leaves the
//! working tree as it found it.
//!
//! The new tree is HEAD's tree plus exactly the changed paths; files outside
//! the changeset, including uncommitted edits to them, are not swept into the
//! commit.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use quire_git::{EntryMode, GitOid, GitRepo, RefEdit, RefName, Signature, TreeEdit};
use serde::{Deserialize, Serialize};

use crate::buffers::{BufferMap, WorkingTree};
use crate::error::{EngineError, Result};
use crate::paths;

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

/// How a change's values are represented on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    #[default]
    #[serde(rename = "binary")]
    Binary,
    #[serde(rename = "utf-8")]
    Utf8,
}

impl FromStr for Encoding {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "binary" => Ok(Self::Binary),
            "utf-8" | "utf8" => Ok(Self::Utf8),
            _ => Err(EngineError::validation("Supplied encoding is not supported")),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Binary => "binary",
            Self::Utf8 => "utf-8",
        })
    }
}

/// One path's expected and desired content. `None` means absent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Change {
    pub old: Option<Vec<u8>>,
    pub new: Option<Vec<u8>>,
    pub encoding: Encoding,
}

impl Change {
    /// A binary change.
    pub fn new(old: Option<impl Into<Vec<u8>>>, new: Option<impl Into<Vec<u8>>>) -> Self {
        Self {
            old: old.map(Into::into),
            new: new.map(Into::into),
            encoding: Encoding::Binary,
        }
    }

    /// A change between two texts.
    #[must_use]
    pub fn text(old: Option<&str>, new: Option<&str>) -> Self {
        Self {
            old: old.map(|s| s.as_bytes().to_vec()),
            new: new.map(|s| s.as_bytes().to_vec()),
            encoding: Encoding::Utf8,
        }
    }

    /// Whether the change leaves the path as it is. Unchanged entries still
    /// take part in conflict detection.
    #[must_use]
    pub fn is_unchanged(&self) -> bool {
        self.old == self.new
    }
}

/// Path → change, in path order.
pub type Changeset = BTreeMap<String, Change>;

/// Build a changeset that writes every buffer in `buffers` over `previous`.
///
/// Paths present only in `previous` become removals.
#[must_use]
pub fn diff_buffers(previous: &BufferMap, next: &BufferMap) -> Changeset {
    let keys: BTreeSet<&String> = previous.keys().chain(next.keys()).collect();
    keys.into_iter()
        .map(|path| {
            let change = Change {
                old: previous.get(path).cloned(),
                new: next.get(path).cloned(),
                encoding: Encoding::Binary,
            };
            (path.clone(), change)
        })
        .filter(|(_, change)| !change.is_unchanged())
        .collect()
}

/// Everything needed to turn a changeset into a commit.
#[derive(Clone, Debug)]
pub struct CommitRequest {
    pub changeset: Changeset,
    pub author: Signature,
    pub message: String,
    /// Skip conflict detection and write the new values unconditionally.
    pub ignore_conflicts: bool,
}

impl CommitRequest {
    #[must_use]
    pub const fn new(changeset: Changeset, author: Signature, message: String) -> Self {
        Self {
            changeset,
            author,
            message,
            ignore_conflicts: false,
        }
    }

    /// Check the request and return its changeset keyed by canonical path.
    ///
    /// # Errors
    /// [`EngineError::Validation`] describing the first problem found.
    pub fn validate(&self) -> Result<Changeset> {
        if self.changeset.is_empty() {
            return Err(EngineError::validation("Nothing to commit"));
        }
        if self.author.name.trim().is_empty() || self.author.email.trim().is_empty() {
            return Err(EngineError::validation("Missing author information"));
        }
        if self.message.trim().is_empty() {
            return Err(EngineError::validation("Missing commit message"));
        }

        let mut out = Changeset::new();
        for (path, change) in &self.changeset {
            let canonical = paths::canonical(path)?;
            if canonical == "/" {
                return Err(EngineError::validation("the repository root is not a file"));
            }
            if change.old.is_none() && change.new.is_none() {
                return Err(EngineError::validation(format!(
                    "change at {canonical} has neither an old nor a new value"
                )));
            }
            if change.encoding == Encoding::Utf8 {
                for value in [&change.old, &change.new].into_iter().flatten() {
                    if std::str::from_utf8(value).is_err() {
                        return Err(EngineError::validation(format!(
                            "value at {canonical} is not valid UTF-8"
                        )));
                    }
                }
            }
            if out.insert(canonical.clone(), change.clone()).is_some() {
                return Err(EngineError::validation(format!(
                    "{canonical} appears more than once in the changeset"
                )));
            }
        }
        if out.values().all(Change::is_unchanged) {
            return Err(EngineError::validation("Nothing to commit"));
        }
        Ok(out)
    }
}

/// The result of a commit attempt. Conflicts are an outcome, not an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed {
        commit: GitOid,
        /// The paths that were written or removed.
        paths: Vec<String>,
    },
    /// Paths whose current content did not match the declared old value.
    Conflicts(BTreeSet<String>),
}

impl CommitOutcome {
    /// The new commit, if one was made.
    #[must_use]
    pub const fn commit(&self) -> Option<GitOid> {
        match self {
            Self::Committed { commit, .. } => Some(*commit),
            Self::Conflicts(_) => None,
        }
    }
}

/// Pipeline stages, in order. Logged as the pipeline advances.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitPhase {
    Validating,
    DetectingConflicts,
    Writing,
    Committing,
    Done,
}

impl fmt::Display for CommitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Validating => "validating",
            Self::DetectingConflicts => "detecting-conflicts",
            Self::Writing => "writing",
            Self::Committing => "committing",
            Self::Done => "done",
        })
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Run the pipeline against the working copy at `work_dir`.
///
/// # Errors
/// [`EngineError::Validation`] for a bad request, [`EngineError::Io`] or
/// [`EngineError::VersionControl`] when writing or committing fails (after
/// the working tree has been restored).
pub fn run(repo: &dyn GitRepo, work_dir: &Path, request: &CommitRequest) -> Result<CommitOutcome> {
    let span = tracing::info_span!("commit", work_dir = %work_dir.display());
    let _enter = span.enter();
    let phase = |p: CommitPhase| tracing::debug!(phase = %p, "commit phase");

    phase(CommitPhase::Validating);
    let changes = request.validate()?;
    let vcs = |operation: &'static str| {
        move |e: quire_git::GitError| EngineError::vcs(work_dir, operation, e)
    };
    let branch = repo
        .head_branch()
        .map_err(vcs("resolve HEAD"))?
        .ok_or_else(|| EngineError::validation("HEAD is detached; cannot commit"))?;
    let head = repo.head_commit().map_err(vcs("resolve HEAD"))?;
    let tree = WorkingTree::new(work_dir);

    if head.is_none() {
        tracing::debug!("first commit, conflict detection skipped");
    } else if request.ignore_conflicts {
        tracing::debug!("conflict detection skipped on request");
    } else {
        phase(CommitPhase::DetectingConflicts);
        let conflicts = detect_conflicts(&tree, &changes)?;
        if !conflicts.is_empty() {
            tracing::info!(count = conflicts.len(), "commit refused: conflicts");
            return Ok(CommitOutcome::Conflicts(conflicts));
        }
    }

    let to_write: Vec<(&String, &Change)> = changes
        .iter()
        .filter(|(_, change)| !change.is_unchanged())
        .collect();

    phase(CommitPhase::Writing);
    let mut journal = Journal::new(&tree);
    let written = to_write
        .iter()
        .try_for_each(|(path, change)| journal.write(path, change.new.as_deref()));
    if let Err(e) = written {
        journal.rollback();
        return Err(e);
    }

    phase(CommitPhase::Committing);
    let commit = match commit_tree(repo, work_dir, &branch, head, &to_write, request) {
        Ok(commit) => commit,
        Err(e) => {
            journal.rollback();
            return Err(e);
        }
    };

    phase(CommitPhase::Done);
    let paths: Vec<String> = to_write.iter().map(|(p, _)| (*p).clone()).collect();
    tracing::info!(%commit, files = paths.len(), "committed");
    Ok(CommitOutcome::Committed { commit, paths })
}

/// Paths whose working-tree content differs from the declared old value.
///
/// # Errors
/// [`EngineError::Io`] when a file cannot be read.
pub fn detect_conflicts(tree: &WorkingTree, changes: &Changeset) -> Result<BTreeSet<String>> {
    let mut conflicts = BTreeSet::new();
    for (path, change) in changes {
        let current = tree.read(path)?;
        if current != change.old {
            tracing::debug!(path, "conflict");
            conflicts.insert(path.clone());
        }
    }
    Ok(conflicts)
}

fn commit_tree(
    repo: &dyn GitRepo,
    work_dir: &Path,
    branch: &RefName,
    head: Option<GitOid>,
    to_write: &[(&String, &Change)],
    request: &CommitRequest,
) -> Result<GitOid> {
    let vcs = |operation: &'static str| {
        move |e: quire_git::GitError| EngineError::vcs(work_dir, operation, e)
    };

    let mut edits = Vec::with_capacity(to_write.len());
    for (path, change) in to_write {
        let rel = paths::relative(path).to_owned();
        match &change.new {
            Some(data) => {
                let oid = repo.write_blob(data).map_err(vcs("write blob"))?;
                edits.push(TreeEdit::Upsert {
                    path: rel,
                    mode: EntryMode::Blob,
                    oid,
                });
            }
            None => edits.push(TreeEdit::Remove { path: rel }),
        }
    }

    let base = match head {
        Some(head) => repo.read_commit(head).map_err(vcs("read HEAD commit"))?.tree_oid,
        None => repo.empty_tree().map_err(vcs("write empty tree"))?,
    };
    let new_tree = repo.edit_tree(base, &edits).map_err(vcs("build tree"))?;
    let parents: Vec<GitOid> = head.into_iter().collect();
    let commit = repo
        .create_commit(new_tree, &parents, &request.message, &request.author)
        .map_err(vcs("create commit"))?;
    repo.atomic_ref_update(
        &[RefEdit {
            name: branch.clone(),
            new_oid: commit,
            expected_old_oid: head.unwrap_or(GitOid::ZERO),
            log_message: format!("commit: {}", first_line(&request.message)),
        }],
        &request.author,
    )
    .map_err(vcs("advance branch"))?;

    // The commit is durable from here on; a stale index is only cosmetic.
    if let Err(e) = repo.reset_index(new_tree) {
        tracing::warn!(error = %e, "failed to reset the git index after commit");
    }
    Ok(commit)
}

fn first_line(message: &str) -> &str {
    message.lines().next().unwrap_or_default()
}

/// Prior contents of every file the write phase touched.
struct Journal<'t> {
    tree: &'t WorkingTree,
    prior: Vec<(String, Option<Vec<u8>>)>,
}

impl<'t> Journal<'t> {
    const fn new(tree: &'t WorkingTree) -> Self {
        Self {
            tree,
            prior: Vec::new(),
        }
    }

    fn write(&mut self, path: &str, data: Option<&[u8]>) -> Result<()> {
        let before = self.tree.read(path)?;
        self.prior.push((path.to_owned(), before));
        self.tree.write(path, data)
    }

    fn rollback(self) {
        for (path, before) in self.prior.into_iter().rev() {
            if let Err(e) = self.tree.write(&path, before.as_deref()) {
                tracing::warn!(path, error = %e, "failed to restore file after aborted commit");
            }
        }
    }
}

/// A removal changeset for every file below `root` in the working tree.
///
/// # Errors
/// [`EngineError::Io`] when the tree cannot be read, or
/// [`EngineError::Validation`] when `root` is not a canonical path.
pub fn delete_tree_changeset(tree: &WorkingTree, root: &str) -> Result<Changeset> {
    let root = paths::canonical(root)?;
    Ok(tree
        .read_all(&root)?
        .into_iter()
        .map(|(key, data)| {
            let path = paths::join(&root, &key);
            (path, Change::new(Some(data), None::<Vec<u8>>))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_git::GixRepo;

    fn author() -> Signature {
        Signature::new("Test", "test@example.com")
    }

    fn setup() -> (tempfile::TempDir, GixRepo) {
        let dir = tempfile::tempdir().unwrap();
        let repo = GixRepo::init(dir.path(), &RefName::branch("main").unwrap()).unwrap();
        (dir, repo)
    }

    fn request(changes: &[(&str, Change)]) -> CommitRequest {
        CommitRequest::new(
            changes.iter().map(|(p, c)| ((*p).to_owned(), c.clone())).collect(),
            author(),
            "test".to_owned(),
        )
    }

    #[test]
    fn validation_messages() {
        let empty = request(&[]);
        assert!(empty.validate().unwrap_err().to_string().contains("Nothing to commit"));

        let mut no_author = request(&[("/a", Change::text(None, Some("x")))]);
        no_author.author = Signature::new(" ", "a@b");
        assert!(
            no_author
                .validate()
                .unwrap_err()
                .to_string()
                .contains("Missing author information")
        );

        let mut no_message = request(&[("/a", Change::text(None, Some("x")))]);
        no_message.message = "\n".to_owned();
        assert!(
            no_message
                .validate()
                .unwrap_err()
                .to_string()
                .contains("Missing commit message")
        );
    }

    #[test]
    fn validation_rejects_non_changes_and_bad_paths() {
        let neither = request(&[("/a", Change::new(None::<Vec<u8>>, None::<Vec<u8>>))]);
        assert!(neither.validate().is_err());

        let escape = request(&[("/../a", Change::text(None, Some("x")))]);
        assert!(escape.validate().is_err());

        let git_dir = request(&[("/.git/config", Change::text(None, Some("x")))]);
        assert!(git_dir.validate().is_err());

        let bad_utf8 = request(&[(
            "/a",
            Change {
                old: None,
                new: Some(vec![0xff, 0xfe]),
                encoding: Encoding::Utf8,
            },
        )]);
        assert!(bad_utf8.validate().is_err());

        let only_unchanged = request(&[("/a", Change::text(Some("x"), Some("x")))]);
        assert!(only_unchanged.validate().is_err());
    }

    #[test]
    fn encoding_parse() {
        assert_eq!("utf-8".parse::<Encoding>().unwrap(), Encoding::Utf8);
        assert_eq!("binary".parse::<Encoding>().unwrap(), Encoding::Binary);
        let err = "latin1".parse::<Encoding>().unwrap_err();
        assert!(err.to_string().contains("Supplied encoding is not supported"));
    }

    #[test]
    fn first_commit_skips_conflict_check() {
        let (dir, repo) = setup();
        // The declared old value is wrong, but there is nothing to conflict with.
        let req = request(&[("/a.txt", Change::text(Some("stale"), Some("hello")))]);
        let outcome = run(&repo, dir.path(), &req).unwrap();
        let commit = outcome.commit().unwrap();
        assert_eq!(repo.head_commit().unwrap(), Some(commit));
        assert_eq!(
            repo.read_path(commit, "a.txt").unwrap().as_deref(),
            Some(&b"hello"[..])
        );
        assert!(!repo.is_dirty().unwrap());
    }

    #[test]
    fn conflicts_abort_before_write() {
        let (dir, repo) = setup();
        run(&repo, dir.path(), &request(&[("/a.txt", Change::text(None, Some("one")))])).unwrap();
        let head = repo.head_commit().unwrap();

        let req = request(&[
            ("/a.txt", Change::text(Some("not one"), Some("two"))),
            ("/b.txt", Change::text(None, Some("b"))),
        ]);
        let outcome = run(&repo, dir.path(), &req).unwrap();
        assert_eq!(
            outcome,
            CommitOutcome::Conflicts(BTreeSet::from(["/a.txt".to_owned()]))
        );
        assert_eq!(repo.head_commit().unwrap(), head);
        assert!(!dir.path().join("b.txt").exists());
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "one");
    }

    #[test]
    fn unchanged_entries_guard_but_are_not_written() {
        let (dir, repo) = setup();
        run(&repo, dir.path(), &request(&[("/a.txt", Change::text(None, Some("one")))])).unwrap();
        std::fs::write(dir.path().join("a.txt"), "edited").unwrap();
        let req = request(&[
            ("/a.txt", Change::text(Some("one"), Some("one"))),
            ("/b.txt", Change::text(None, Some("b"))),
        ]);
        let outcome = run(&repo, dir.path(), &req).unwrap();
        assert!(matches!(outcome, CommitOutcome::Conflicts(c) if c.contains("/a.txt")));
    }

    #[test]
    fn commit_contains_only_changed_paths() {
        let (dir, repo) = setup();
        run(&repo, dir.path(), &request(&[("/a.txt", Change::text(None, Some("a")))])).unwrap();
        std::fs::write(dir.path().join("stray.txt"), "not committed").unwrap();
        let outcome = run(
            &repo,
            dir.path(),
            &request(&[("/d/b.txt", Change::text(None, Some("b")))]),
        )
        .unwrap();
        let commit = outcome.commit().unwrap();
        assert_eq!(repo.read_path(commit, "stray.txt").unwrap(), None);
        assert_eq!(repo.read_path(commit, "a.txt").unwrap().as_deref(), Some(&b"a"[..]));
        assert_eq!(repo.read_path(commit, "d/b.txt").unwrap().as_deref(), Some(&b"b"[..]));
    }

    #[test]
    fn removal_deletes_file() {
        let (dir, repo) = setup();
        run(&repo, dir.path(), &request(&[("/d/a.txt", Change::text(None, Some("a")))])).unwrap();
        let outcome = run(
            &repo,
            dir.path(),
            &request(&[("/d/a.txt", Change::text(Some("a"), None))]),
        )
        .unwrap();
        let commit = outcome.commit().unwrap();
        assert_eq!(repo.read_path(commit, "d/a.txt").unwrap(), None);
        assert!(!dir.path().join("d").exists());
    }

    #[test]
    fn journal_restores_prior_content() {
        let dir = tempfile::tempdir().unwrap();
        let tree = WorkingTree::new(dir.path());
        tree.write("/a.txt", Some(b"before")).unwrap();
        let mut journal = Journal::new(&tree);
        journal.write("/a.txt", Some(b"after")).unwrap();
        journal.write("/new.txt", Some(b"new")).unwrap();
        journal.rollback();
        assert_eq!(tree.read("/a.txt").unwrap().as_deref(), Some(&b"before"[..]));
        assert_eq!(tree.read("/new.txt").unwrap(), None);
    }

    #[test]
    fn delete_tree_lists_every_file() {
        let dir = tempfile::tempdir().unwrap();
        let tree = WorkingTree::new(dir.path());
        tree.write("/data/a.json", Some(b"{}")).unwrap();
        tree.write("/data/sub/b.json", Some(b"[]")).unwrap();
        tree.write("/other.txt", Some(b"x")).unwrap();
        let changes = delete_tree_changeset(&tree, "/data").unwrap();
        assert_eq!(
            changes.keys().cloned().collect::<Vec<_>>(),
            vec!["/data/a.json".to_owned(), "/data/sub/b.json".to_owned()]
        );
        assert!(changes.values().all(|c| c.new.is_none() && c.old.is_some()));
    }

    #[test]
    fn diff_buffers_drops_unchanged() {
        let prev = BufferMap::from([
            ("/a".to_owned(), b"1".to_vec()),
            ("/b".to_owned(), b"2".to_vec()),
        ]);
        let next = BufferMap::from([
            ("/a".to_owned(), b"1".to_vec()),
            ("/c".to_owned(), b"3".to_vec()),
        ]);
        let changes = diff_buffers(&prev, &next);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes["/b"].new, None);
        assert_eq!(changes["/c"].old, None);
    }
}
