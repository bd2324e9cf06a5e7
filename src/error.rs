//! Engine error type.
//!
//! [`EngineError`] is returned by every engine operation. Absence is never an
//! error (reads return `Option`), and commit conflicts are data
//! ([`CommitOutcome`](crate::commit::CommitOutcome)), so every variant here is
//! a real failure. Variants carry the working copy and the operation that
//! failed so a caller can report them without extra context.

use std::path::PathBuf;
use std::time::Duration;

use quire_git::GitError;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A fail-fast operation found the working copy busy, or the wait queue
    /// is full.
    #[error("working copy {} is busy: {reason}", work_dir.display())]
    LockBusy {
        /// The working copy.
        work_dir: PathBuf,
        /// Why admission was refused.
        reason: String,
    },

    /// A queued mutation did not acquire the lock in time.
    #[error("timed out after {waited:?} waiting for the lock on {}", work_dir.display())]
    LockTimeout {
        /// The working copy.
        work_dir: PathBuf,
        /// How long the caller waited.
        waited: Duration,
    },

    /// The request was rejected before anything was touched.
    #[error("invalid request: {message}")]
    Validation {
        /// What was wrong.
        message: String,
    },

    /// A git operation failed for a reason other than absence.
    #[error("{operation} failed in {}: {source}", work_dir.display())]
    VersionControl {
        /// The working copy.
        work_dir: PathBuf,
        /// The engine operation in progress.
        operation: &'static str,
        /// The underlying git failure.
        #[source]
        source: GitError,
    },

    /// An index operation was attempted against a dataset that is not loaded.
    #[error("dataset {dataset_dir} in {} is not loaded: {message}", work_dir.display())]
    IndexState {
        /// The working copy.
        work_dir: PathBuf,
        /// The dataset directory.
        dataset_dir: String,
        /// Details.
        message: String,
    },

    /// The index store failed.
    #[error("index store failure during {operation}: {source}")]
    Index {
        /// The index operation in progress.
        operation: &'static str,
        /// The storage error.
        #[source]
        source: sled::Error,
    },

    /// An object could not be serialized or deserialized.
    #[error("codec error at {path}: {message}")]
    Codec {
        /// The object or buffer path.
        path: String,
        /// What went wrong.
        message: String,
    },

    /// A filesystem operation failed.
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        /// The path being accessed.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The execution context serving a request went away (its thread was
    /// shut down or the job panicked).
    #[error("execution context for {} lost: {message}", work_dir.display())]
    ExecutionContextLost {
        /// The working copy.
        work_dir: PathBuf,
        /// Details.
        message: String,
    },
}

impl EngineError {
    /// Shorthand for [`EngineError::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Wrap a git error with its working copy and operation.
    pub fn vcs(work_dir: impl Into<PathBuf>, operation: &'static str, source: GitError) -> Self {
        Self::VersionControl {
            work_dir: work_dir.into(),
            operation,
            source,
        }
    }

    /// Wrap an I/O error with its path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Shorthand for [`EngineError::Codec`].
    pub fn codec(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Codec {
            path: path.into(),
            message: message.into(),
        }
    }

    /// A stable, machine-readable name for the variant, used on the wire.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::LockBusy { .. } => "lockBusy",
            Self::LockTimeout { .. } => "lockTimeout",
            Self::Validation { .. } => "validation",
            Self::VersionControl { .. } => "versionControl",
            Self::IndexState { .. } => "indexState",
            Self::Index { .. } => "index",
            Self::Codec { .. } => "codec",
            Self::Io { .. } => "io",
            Self::ExecutionContextLost { .. } => "executionContextLost",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vcs_error_names_operation_and_work_dir() {
        let err = EngineError::vcs(
            "/tmp/wc",
            "pull",
            GitError::BackendError {
                message: "boom".to_owned(),
            },
        );
        let text = err.to_string();
        assert!(text.contains("pull"));
        assert!(text.contains("/tmp/wc"));
        assert!(text.contains("boom"));
        assert_eq!(err.kind(), "versionControl");
    }

    #[test]
    fn kinds_are_distinct() {
        let errors = [
            EngineError::validation("x"),
            EngineError::codec("/a", "bad"),
            EngineError::io("/a", std::io::Error::other("x")),
            EngineError::LockBusy {
                work_dir: "/a".into(),
                reason: "held".to_owned(),
            },
        ];
        let kinds: std::collections::HashSet<_> = errors.iter().map(EngineError::kind).collect();
        assert_eq!(kinds.len(), errors.len());
    }
}
