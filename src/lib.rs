//! quire: structured, indexed object storage over git working copies.
//!
//! A dataset is a directory tree under version control, read as a collection
//! of typed objects. Each path pattern carries its own codec, reads are served
//! from a persistent index, and writes are conflict-checked changesets that
//! land as git commits.
//!
//! The entry point is [`Engine`]. The `quire` binary in `crates/quire-cli`
//! exposes the same operations on the command line and as a JSON-lines
//! service (see [`rpc`]).

pub mod buffers;
pub mod codec;
pub mod commit;
pub mod config;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod lock;
pub mod paths;
pub mod rpc;
pub mod status;
pub mod telemetry;
pub mod vcs;
pub mod worker;

pub use commit::{Change, Changeset, CommitOutcome, Encoding};
pub use config::EngineConfig;
pub use engine::{CommitMeta, Engine, ObjectChange};
pub use error::{EngineError, Result};
pub use status::{Operation, RepoStatus, StatusStream};
pub use vcs::Author;
