//! Git abstraction layer for quire.
//!
//! This crate defines the [`GitRepo`] trait, the single interface through
//! which the storage engine interacts with a working copy's history. The
//! engine never imports gix directly; it depends on `quire-git` and programs
//! against the trait.
//!
//! # Crate layout
//!
//! - [`repo`]: the [`GitRepo`] trait definition.
//! - [`types`]: value types used in trait signatures ([`GitOid`], [`RefName`],
//!   [`TreeEntry`], [`Signature`], etc.).
//! - [`error`]: the [`GitError`] enum returned by all trait methods.
//! - [`transport`]: clone, fetch, push and remote probing via the git CLI.

pub mod error;
pub mod repo;
pub mod transport;
pub mod types;

// gix-backed implementation modules
mod checkout_impl;
mod cli;
mod config_impl;
mod gix_repo;
mod objects_impl;
mod refs_impl;
mod status_impl;

pub use gix_repo::GixRepo;

// Re-export the main trait and commonly used types at the crate root for
// ergonomic imports: `use quire_git::{GitRepo, GitOid, GitError};`
pub use error::GitError;
pub use repo::GitRepo;
pub use transport::{RemoteAuth, RemoteDescription, TransferProgress};
pub use types::{
    ChangeType, ChangedPath, CommitInfo, EntryMode, FileStatus, GitOid, OidParseError, RefEdit,
    RefName, RefNameError, Signature, StatusEntry, TreeEdit, TreeEntry,
};
