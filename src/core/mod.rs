//! Revision-identity core.
//!
//! Module hierarchy follows type dependency order:
//! - varint: integer wire encoding
//! - error: core capability errors
//! - peer: PeerId, RemoteId
//! - version: Version, VersionOrder
//! - vector: VersionVector
//! - revid: RevId (tree and version forms)
//! - tree: Rev, RevFlags, RevTree
//! - raw_tree: whole-tree binary codec

pub mod error;
pub mod peer;
pub mod raw_tree;
pub mod revid;
pub mod tree;
pub mod varint;
pub mod vector;
pub mod version;

pub use error::CoreError;
pub use peer::{PeerId, RemoteId};
pub use raw_tree::{decode_tree, encode_tree};
pub use revid::{generate_rev_id, RevId};
pub use tree::{
    Inserted, Rev, RevFlags, RevIndex, RevTree, TreeError, DEFAULT_MAX_REV_TREE_DEPTH,
};
pub use vector::VersionVector;
pub use version::{Author, Version, VersionOrder};
