//! Shared fixtures for integration tests.
//!
//! [`TestRepo`] owns a temporary directory holding a working copy and an
//! index cache, plus an [`Engine`] pointed at that cache.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;

use quire::config::IndexConfig;
use quire::{Author, Change, Changeset, CommitMeta, CommitOutcome, Engine, EngineConfig};
use tempfile::TempDir;

pub fn author() -> Author {
    Author {
        name: "Test Author".to_owned(),
        email: "author@example.com".to_owned(),
    }
}

pub fn meta(message: &str) -> CommitMeta {
    CommitMeta::new(Some(author()), message)
}

pub fn engine_with_cache(cache_root: &Path) -> Engine {
    Engine::new(EngineConfig {
        index: IndexConfig {
            cache_root: Some(cache_root.to_path_buf()),
        },
        ..EngineConfig::default()
    })
}

/// Run git in `dir` and return trimmed stdout. Panics on failure.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "Test Author")
        .env("GIT_AUTHOR_EMAIL", "author@example.com")
        .env("GIT_COMMITTER_NAME", "Test Author")
        .env("GIT_COMMITTER_EMAIL", "author@example.com")
        .output()
        .expect("spawn git");
    assert!(
        out.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_owned()
}

pub struct TestRepo {
    // Dropped first, so indexes are closed before the directory goes.
    pub engine: Engine,
    root: TempDir,
}

impl TestRepo {
    /// A fresh repository on `main` with no commits.
    pub fn new() -> Self {
        let repo = Self::uninitialized();
        repo.engine.init_repo(&repo.work_dir(), "main").expect("init");
        repo
    }

    /// An engine and a path where no repository exists yet.
    pub fn uninitialized() -> Self {
        let root = tempfile::tempdir().expect("tempdir");
        let engine = engine_with_cache(&root.path().join("cache"));
        Self { engine, root }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn work_dir(&self) -> PathBuf {
        self.root.path().join("wc")
    }

    /// Commit text changes given as `(path, old, new)`.
    pub fn commit(&self, message: &str, changes: &[(&str, Option<&str>, Option<&str>)]) -> CommitOutcome {
        let changeset: Changeset = changes
            .iter()
            .map(|(path, old, new)| ((*path).to_owned(), Change::text(*old, *new)))
            .collect();
        self.engine
            .update_buffers(&self.work_dir(), changeset, meta(message))
            .expect("update_buffers")
    }

    /// Working-tree content of `path` as text.
    pub fn read(&self, path: &str) -> Option<String> {
        self.engine
            .read_buffers(&self.work_dir(), &[path.to_owned()], None)
            .expect("read_buffers")
            .remove(path)
            .flatten()
            .map(|b| String::from_utf8(b).expect("utf-8"))
    }

    /// Content of `path` at `commit`.
    pub fn read_at(&self, path: &str, commit: &str) -> Option<String> {
        self.engine
            .read_buffers(&self.work_dir(), &[path.to_owned()], Some(commit.to_owned()))
            .expect("read_buffers")
            .remove(path)
            .flatten()
            .map(|b| String::from_utf8(b).expect("utf-8"))
    }

    pub fn git(&self, args: &[&str]) -> String {
        git(&self.work_dir(), args)
    }
}
