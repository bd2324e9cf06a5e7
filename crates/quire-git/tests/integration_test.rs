use std::path::Path;

use tempfile::TempDir;

use quire_git::transport::{self, TransferProgress};
use quire_git::{
    ChangeType, EntryMode, FileStatus, GitError, GitOid, GitRepo, GixRepo, RefEdit, RefName,
    Signature, TreeEdit, TreeEntry,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn git(dir: &Path, args: &[&str]) {
    let out = std::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
}

fn setup_repo() -> (TempDir, GixRepo) {
    let dir = TempDir::new().unwrap();
    let repo = GixRepo::init(dir.path(), &RefName::branch("main").unwrap()).unwrap();
    (dir, repo)
}

fn author() -> Signature {
    Signature::new("Test User", "test@test.com")
}

/// Commit a tree holding `files` on top of HEAD and advance `main`.
fn commit_files(repo: &GixRepo, files: &[(&str, &[u8])], message: &str) -> GitOid {
    let parent = repo.head_commit().unwrap();
    let base = match parent {
        Some(commit) => repo.read_commit(commit).unwrap().tree_oid,
        None => repo.empty_tree().unwrap(),
    };
    let edits: Vec<TreeEdit> = files
        .iter()
        .map(|(path, data)| TreeEdit::Upsert {
            path: (*path).to_owned(),
            mode: EntryMode::Blob,
            oid: repo.write_blob(data).unwrap(),
        })
        .collect();
    let tree = repo.edit_tree(base, &edits).unwrap();
    let parents: Vec<GitOid> = parent.into_iter().collect();
    let commit = repo.create_commit(tree, &parents, message, &author()).unwrap();
    repo.atomic_ref_update(
        &[RefEdit {
            name: RefName::branch("main").unwrap(),
            new_oid: commit,
            expected_old_oid: parent.unwrap_or(GitOid::ZERO),
            log_message: message.to_owned(),
        }],
        &author(),
    )
    .unwrap();
    commit
}

// ===========================================================================
// Init and refs
// ===========================================================================

#[test]
fn init_points_head_at_unborn_branch() {
    let (_dir, repo) = setup_repo();
    assert_eq!(
        repo.head_branch().unwrap(),
        Some(RefName::branch("main").unwrap())
    );
    assert!(repo.head_commit().unwrap().is_none());
}

#[test]
fn open_at_rejects_plain_directory() {
    let dir = TempDir::new().unwrap();
    let err = GixRepo::open_at(dir.path()).err().unwrap();
    assert!(matches!(err, GitError::NotARepository { .. }));
}

#[test]
fn first_commit_resolves_head() {
    let (_dir, repo) = setup_repo();
    let commit = commit_files(&repo, &[("a.txt", b"hello")], "first");
    assert_eq!(repo.head_commit().unwrap(), Some(commit));
    let info = repo.read_commit(commit).unwrap();
    assert!(info.parents.is_empty());
    assert_eq!(info.message, "first");
    assert_eq!(info.author, "Test User <test@test.com>");
}

#[test]
fn debug_output_names_the_repository() {
    let (dir, repo) = setup_repo();
    let shown = format!("{repo:?}");
    assert!(shown.starts_with("GixRepo"), "{shown}");
    let name = dir.path().file_name().unwrap().to_string_lossy().into_owned();
    assert!(shown.contains(&name), "{shown}");
}

#[test]
fn cas_update_rejects_stale_expectation() {
    let (_dir, repo) = setup_repo();
    let first = commit_files(&repo, &[("a.txt", b"1")], "one");
    let _second = commit_files(&repo, &[("a.txt", b"2")], "two");

    let tree = repo.read_commit(first).unwrap().tree_oid;
    let stray = repo
        .create_commit(tree, &[first], "stray", &author())
        .unwrap();
    let err = repo
        .atomic_ref_update(
            &[RefEdit {
                name: RefName::branch("main").unwrap(),
                new_oid: stray,
                expected_old_oid: first,
                log_message: "stale".to_owned(),
            }],
            &author(),
        )
        .unwrap_err();
    assert!(matches!(err, GitError::RefConflict { .. }), "{err:?}");
}

// ===========================================================================
// Trees and paths
// ===========================================================================

#[test]
fn read_path_distinguishes_files_dirs_and_missing() {
    let (_dir, repo) = setup_repo();
    let commit = commit_files(
        &repo,
        &[("docs/readme.md", b"# hi"), ("docs/nested/x.json", b"{}")],
        "docs",
    );
    assert_eq!(
        repo.read_path(commit, "docs/readme.md").unwrap(),
        Some(b"# hi".to_vec())
    );
    assert_eq!(repo.read_path(commit, "/docs/readme.md").unwrap(), Some(b"# hi".to_vec()));
    assert_eq!(repo.read_path(commit, "docs").unwrap(), None);
    assert_eq!(repo.read_path(commit, "docs/missing.md").unwrap(), None);
    assert_eq!(repo.read_path(commit, "docs/readme.md/deeper").unwrap(), None);
}

#[test]
fn list_blobs_walks_prefix() {
    let (_dir, repo) = setup_repo();
    let commit = commit_files(
        &repo,
        &[("a/1.txt", b"1"), ("a/b/2.txt", b"2"), ("c.txt", b"3")],
        "tree",
    );
    let tree = repo.read_commit(commit).unwrap().tree_oid;

    let all: Vec<String> = repo.list_blobs(tree, "").unwrap().into_iter().map(|(p, _)| p).collect();
    assert_eq!(all, vec!["a/1.txt", "a/b/2.txt", "c.txt"]);

    let under_a: Vec<String> = repo.list_blobs(tree, "/a").unwrap().into_iter().map(|(p, _)| p).collect();
    assert_eq!(under_a, vec!["a/1.txt", "a/b/2.txt"]);

    let single: Vec<String> = repo.list_blobs(tree, "c.txt").unwrap().into_iter().map(|(p, _)| p).collect();
    assert_eq!(single, vec!["c.txt"]);

    assert!(repo.list_blobs(tree, "nope").unwrap().is_empty());
}

#[test]
fn diff_trees_reports_changes() {
    let (_dir, repo) = setup_repo();
    let one = commit_files(&repo, &[("keep.txt", b"k"), ("edit.txt", b"1"), ("gone.txt", b"x")], "one");
    let old_tree = repo.read_commit(one).unwrap().tree_oid;
    let new_tree = repo
        .edit_tree(
            old_tree,
            &[
                TreeEdit::Upsert {
                    path: "edit.txt".to_owned(),
                    mode: EntryMode::Blob,
                    oid: repo.write_blob(b"2").unwrap(),
                },
                TreeEdit::Remove {
                    path: "gone.txt".to_owned(),
                },
                TreeEdit::Upsert {
                    path: "new/file.txt".to_owned(),
                    mode: EntryMode::Blob,
                    oid: repo.write_blob(b"n").unwrap(),
                },
            ],
        )
        .unwrap();

    let changes: Vec<(String, ChangeType)> = repo
        .diff_trees(Some(old_tree), new_tree)
        .unwrap()
        .into_iter()
        .map(|c| (c.path, c.change))
        .collect();
    assert_eq!(
        changes,
        vec![
            ("edit.txt".to_owned(), ChangeType::Modified),
            ("gone.txt".to_owned(), ChangeType::Deleted),
            ("new/file.txt".to_owned(), ChangeType::Added),
        ]
    );
}

#[test]
fn write_tree_sorts_entries() {
    let (_dir, repo) = setup_repo();
    let blob = repo.write_blob(b"x").unwrap();
    let tree = repo
        .write_tree(&[
            TreeEntry { name: "z".to_owned(), mode: EntryMode::Blob, oid: blob },
            TreeEntry { name: "a".to_owned(), mode: EntryMode::Blob, oid: blob },
        ])
        .unwrap();
    let names: Vec<String> = repo.read_tree(tree).unwrap().into_iter().map(|e| e.name).collect();
    assert_eq!(names, vec!["a", "z"]);
}

// ===========================================================================
// Index, checkout, status
// ===========================================================================

#[test]
fn reset_index_after_worktree_write_is_clean() {
    let (dir, repo) = setup_repo();
    std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
    assert!(repo.is_dirty().unwrap());

    let commit = commit_files(&repo, &[("a.txt", b"hello")], "a");
    repo.reset_index(commit).unwrap();
    let repo = GixRepo::open_at(dir.path()).unwrap();
    assert!(!repo.is_dirty().unwrap());
}

#[test]
fn checkout_restores_and_prunes() {
    let (dir, repo) = setup_repo();
    let commit = commit_files(&repo, &[("a.txt", b"hello"), ("sub/b.txt", b"b")], "two files");
    repo.checkout_tree(commit, dir.path()).unwrap();
    assert_eq!(std::fs::read(dir.path().join("sub/b.txt")).unwrap(), b"b");

    std::fs::write(dir.path().join("a.txt"), b"scribble").unwrap();
    std::fs::create_dir_all(dir.path().join("extra")).unwrap();
    std::fs::write(dir.path().join("extra/c.txt"), b"c").unwrap();
    let repo = GixRepo::open_at(dir.path()).unwrap();
    let statuses: Vec<FileStatus> = repo.status().unwrap().into_iter().map(|s| s.status).collect();
    assert!(statuses.contains(&FileStatus::Modified));
    assert!(statuses.contains(&FileStatus::Added));

    repo.checkout_tree(commit, dir.path()).unwrap();
    assert_eq!(std::fs::read(dir.path().join("a.txt")).unwrap(), b"hello");
    assert!(!dir.path().join("extra").exists());
    assert!(dir.path().join(".git").exists());
}

// ===========================================================================
// Config
// ===========================================================================

#[test]
fn config_roundtrip_and_unset() {
    let (_dir, repo) = setup_repo();
    assert_eq!(repo.read_config("quire.remoteUsername").unwrap(), None);
    repo.write_config("quire.remoteUsername", "alice").unwrap();
    assert_eq!(
        repo.read_config("quire.remoteUsername").unwrap().as_deref(),
        Some("alice")
    );
    repo.unset_config("quire.remoteUsername").unwrap();
    repo.unset_config("quire.remoteUsername").unwrap();
    assert_eq!(repo.read_config("quire.remoteUsername").unwrap(), None);
}

// ===========================================================================
// Transport against a local bare remote
// ===========================================================================

#[test]
fn push_clone_fetch_against_bare_remote() {
    let remote = TempDir::new().unwrap();
    git(remote.path(), &["init", "--bare", "-q", "-b", "main"]);
    let url = remote.path().to_string_lossy().into_owned();

    let refs = transport::ls_remote(&url, None).unwrap();
    assert!(refs.is_empty());

    let (src_dir, src) = setup_repo();
    let first = commit_files(&src, &[("a.txt", b"hello")], "first");
    transport::push(src_dir.path(), &url, None, "main", &mut |_| {}).unwrap();

    let clone_parent = TempDir::new().unwrap();
    let dest = clone_parent.path().join("copy");
    let mut seen: Vec<TransferProgress> = Vec::new();
    transport::clone(&url, None, Some("main"), &dest, &mut |p| seen.push(p)).unwrap();
    assert_eq!(std::fs::read(dest.join("a.txt")).unwrap(), b"hello");

    let second = commit_files(&src, &[("a.txt", b"bye")], "second");
    transport::push(src_dir.path(), &url, None, "main", &mut |_| {}).unwrap();

    let fetched = transport::fetch(&dest, &url, None, "main", &mut |_| {}).unwrap();
    assert_eq!(fetched, Some(second));
    assert_ne!(fetched, Some(first));

    let missing = transport::fetch(&dest, &url, None, "no-such-branch", &mut |_| {}).unwrap();
    assert_eq!(missing, None);
}
