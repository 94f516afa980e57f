//! The key-value seam between the revision core and its storage engine.
//!
//! The core touches durable state only through [`KeyStore`]: whole-record
//! reads, conditional writes inside a caller-begun transaction, and an
//! unsorted full enumeration for migrations. Everything else about the
//! engine (file layout, indexing, encryption) is its own business.

pub mod memory;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::VersioningScheme;

pub use memory::MemoryKeyStore;

/// Document-level flags stored on a record, derived from its revisions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentFlags {
    pub deleted: bool,
    pub conflicted: bool,
    pub has_attachments: bool,
    /// The current revision was pushed to remote #1 without rewriting the
    /// record body; materialised into the remote slot on next load.
    pub synced: bool,
}

impl DocumentFlags {
    pub fn to_bits(self) -> u8 {
        let mut bits = 0u8;
        if self.deleted {
            bits |= 1 << 0;
        }
        if self.conflicted {
            bits |= 1 << 1;
        }
        if self.has_attachments {
            bits |= 1 << 2;
        }
        if self.synced {
            bits |= 1 << 3;
        }
        bits
    }

    pub fn from_bits(bits: u8) -> Self {
        DocumentFlags {
            deleted: bits & (1 << 0) != 0,
            conflicted: bits & (1 << 1) != 0,
            has_attachments: bits & (1 << 2) != 0,
            synced: bits & (1 << 3) != 0,
        }
    }
}

/// How much of a record to load.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ContentOption {
    MetaOnly,
    CurrentRevOnly,
    EntireBody,
}

/// A record as read from the store. `exists` is false for a key the
/// store has never seen; such a record still carries its key so a new
/// document can be built on it.
#[derive(Clone, Debug)]
pub struct Record {
    pub key: String,
    pub doc_type: Option<String>,
    pub flags: DocumentFlags,
    pub body: Bytes,
    pub extra: Bytes,
    /// Current revision id (binary form; in the vector scheme this may
    /// be a whole version vector).
    pub version: Bytes,
    pub sequence: u64,
    pub exists: bool,
    pub content: ContentOption,
}

impl Record {
    /// An empty placeholder for a key with no stored record.
    pub fn absent(key: impl Into<String>) -> Self {
        Record {
            key: key.into(),
            doc_type: None,
            flags: DocumentFlags::default(),
            body: Bytes::new(),
            extra: Bytes::new(),
            version: Bytes::new(),
            sequence: 0,
            exists: false,
            content: ContentOption::EntireBody,
        }
    }
}

/// A pending write. `sequence` is the sequence the writer last observed;
/// the store refuses the write if the stored record has moved past it.
/// With `update_sequence` false the stored sequence is preserved as-is
/// (used by migrations that must not disturb the change feed).
#[derive(Clone, Debug)]
pub struct RecordUpdate {
    pub key: String,
    pub doc_type: Option<String>,
    pub flags: DocumentFlags,
    pub body: Bytes,
    pub extra: Bytes,
    pub version: Bytes,
    pub sequence: u64,
    pub update_sequence: bool,
}

/// Storage failures surfaced to the core.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreError {
    #[error("operation requires an open transaction")]
    NotInTransaction,

    #[error("a transaction is already open on this handle")]
    TransactionBusy,

    #[error("database is read-only")]
    ReadOnly,

    #[error("document `{key}` not found")]
    NotFound { key: String },
}

/// The store interface the revision core is written against.
///
/// A single database-level lock must protect the implementation; every
/// operation acquires it on entry and releases it on all exit paths.
/// Mutations are only legal between `begin` and `commit`/`abort`, and an
/// abort restores the state observed at `begin`.
pub trait KeyStore: Send + Sync {
    fn get(&self, key: &str, content: ContentOption) -> Result<Record, StoreError>;

    fn get_by_sequence(
        &self,
        sequence: u64,
        content: ContentOption,
    ) -> Result<Option<Record>, StoreError>;

    /// Writes a record. Returns the record's sequence, or `None` when the
    /// stored sequence no longer matches `update.sequence` (a concurrent
    /// write won).
    fn set(&self, update: RecordUpdate) -> Result<Option<u64>, StoreError>;

    /// Removes a record entirely. Returns whether it existed.
    fn purge(&self, key: &str) -> Result<bool, StoreError>;

    /// Every record, unsorted, tombstones included, bodies loaded.
    fn enumerate_all(&self) -> Result<Vec<Record>, StoreError>;

    fn begin(&self) -> Result<(), StoreError>;
    fn commit(&self) -> Result<(), StoreError>;
    fn abort(&self) -> Result<(), StoreError>;
    fn in_transaction(&self) -> bool;

    /// The sequence most recently assigned by a committed or pending write.
    fn last_sequence(&self) -> u64;

    //---- Store-wide metadata the core persists.

    fn versioning(&self) -> Option<VersioningScheme>;
    fn set_versioning(&self, scheme: VersioningScheme) -> Result<(), StoreError>;
    fn local_peer_id(&self) -> Option<u64>;
    fn set_local_peer_id(&self, id: u64) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_flags_round_trip() {
        let flags = DocumentFlags {
            deleted: true,
            conflicted: false,
            has_attachments: true,
            synced: false,
        };
        assert_eq!(DocumentFlags::from_bits(flags.to_bits()), flags);
        assert_eq!(DocumentFlags::from_bits(0), DocumentFlags::default());
    }

    #[test]
    fn content_options_are_ordered() {
        assert!(ContentOption::MetaOnly < ContentOption::CurrentRevOnly);
        assert!(ContentOption::CurrentRevOnly < ContentOption::EntireBody);
    }
}
