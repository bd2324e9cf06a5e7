//! Canonical buffer paths.
//!
//! Buffer and object paths are slash-separated and absolute relative to a
//! root (a working copy or a dataset directory): `/units/a.json`. The root
//! itself is `/`. Directory paths produced during grouping carry a trailing
//! slash (`/units/`), which keeps them sorted immediately before their
//! contents.

use std::path::{Path, PathBuf};

use crate::error::{EngineError, Result};

/// Normalize `path` into canonical form.
///
/// Accepts paths with or without a leading slash and collapses repeated
/// slashes. A trailing slash is dropped. Rejects `.` and `..` components and
/// anything under `.git`.
///
/// # Errors
/// [`EngineError::Validation`] for a path that would escape its root or
/// reach into git metadata.
pub fn canonical(path: &str) -> Result<String> {
    let mut out = String::with_capacity(path.len() + 1);
    for component in path.split('/').filter(|c| !c.is_empty()) {
        match component {
            "." | ".." => {
                return Err(EngineError::validation(format!(
                    "path {path:?} contains a relative component"
                )));
            }
            ".git" => {
                return Err(EngineError::validation(format!(
                    "path {path:?} points into git metadata"
                )));
            }
            _ if component.contains('\0') || component.contains('\\') => {
                return Err(EngineError::validation(format!(
                    "path {path:?} contains a forbidden character"
                )));
            }
            _ => {
                out.push('/');
                out.push_str(component);
            }
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

/// The path without its leading slash, as git and the filesystem want it.
#[must_use]
pub fn relative(path: &str) -> &str {
    path.trim_start_matches('/')
}

/// Whether `path` is `root` itself or lies below it.
///
/// The test is component-aware: `/foo` owns `/foo/bar` but not `/foobar`.
/// A `root` with a trailing slash (a directory path) owns everything that
/// starts with it.
#[must_use]
pub fn is_descendant(root: &str, path: &str) -> bool {
    if root == "/" || root.ends_with('/') {
        return path.starts_with(root);
    }
    path == root
        || path
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// The key of `path` relative to `root`: `/` for the root itself, otherwise
/// slash-prefixed. Callers must check [`is_descendant`] first.
#[must_use]
pub fn relative_to(root: &str, path: &str) -> String {
    let rest = path.strip_prefix(root.trim_end_matches('/')).unwrap_or(path);
    let rest = rest.trim_start_matches('/');
    format!("/{rest}")
}

/// Join a root and a slash-prefixed relative key; the inverse of
/// [`relative_to`].
#[must_use]
pub fn join(root: &str, key: &str) -> String {
    let root = root.trim_end_matches('/');
    let key = key.trim_start_matches('/');
    match (root.is_empty(), key.is_empty()) {
        (true, true) => "/".to_owned(),
        (true, false) => format!("/{key}"),
        (false, true) => root.to_owned(),
        (false, false) => format!("{root}/{key}"),
    }
}

/// Every ancestor directory of `path`, shallowest first, each with a trailing
/// slash. `/a/b/c.txt` yields `/a/` and `/a/b/`.
pub fn ancestor_dirs(path: &str) -> impl Iterator<Item = &str> {
    path.match_indices('/')
        .map(|(i, _)| &path[..=i])
        .filter(|p| *p != "/" && p.len() < path.len())
}

/// Resolve a canonical path against a directory on disk.
#[must_use]
pub fn on_disk(root: &Path, path: &str) -> PathBuf {
    let rel = relative(path);
    if rel.is_empty() {
        root.to_path_buf()
    } else {
        root.join(rel)
    }
}
