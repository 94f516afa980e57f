#![forbid(unsafe_code)]

//! Versioned-document core for an embedded document store.
//!
//! Two revision-identity schemes coexist: generation-digest revision
//! trees and per-peer version vectors. This crate owns the tree and
//! vector value types with their codecs, the per-document façade that
//! selects and mutates revisions, and the one-way migration from trees
//! to vectors. Durable storage is an external collaborator behind the
//! [`store::KeyStore`] seam.

pub mod config;
pub mod core;
pub mod db;
pub mod doc;
pub mod error;
pub mod store;
mod upgrade;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the main types at the crate root for convenience.
pub use crate::config::{default_config, set_default_config, DatabaseConfig, VersioningScheme};
pub use crate::core::{
    generate_rev_id, Author, CoreError, Inserted, PeerId, RemoteId, Rev, RevFlags, RevId, RevTree,
    TreeError, Version, VersionOrder, VersionVector, DEFAULT_MAX_REV_TREE_DEPTH,
};
pub use crate::db::{Database, DbError, PutDelta, PutRequest, Transaction};
pub use crate::doc::{DocError, Document, RevisionFlags, SelectedRevision};
pub use crate::store::{
    ContentOption, DocumentFlags, KeyStore, MemoryKeyStore, Record, RecordUpdate, StoreError,
};
