//! Per-document façades over the two revision schemes.
//!
//! A document presents one record plus a "selected revision" cursor.
//! Callers program against the [`Document`] trait and never learn which
//! scheme is behind it; the database hands out the right implementation
//! for its configured versioning.

pub mod tree_doc;
pub mod vector_doc;

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

use crate::core::RemoteId;
use crate::store::DocumentFlags;

pub use tree_doc::TreeDocument;
pub use vector_doc::VectorDocument;

/// Façade-level failures, mapped to HTTP-style statuses at the boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DocError {
    #[error("document or revision not found")]
    NotFound,

    #[error("revision body has been compacted away")]
    Gone,

    #[error("conflict detected")]
    Conflict,

    #[error("delta source revision unknown")]
    DeltaBaseUnknown,

    #[error("operation not supported by this versioning scheme")]
    Unimplemented,
}

/// Flags a caller attaches to a revision being written.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RevisionFlags {
    pub deleted: bool,
    pub has_attachments: bool,
}

/// Snapshot of the revision the cursor points at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectedRevision {
    /// Expanded ASCII revision id.
    pub rev_id: String,
    pub sequence: u64,
    pub leaf: bool,
    pub deleted: bool,
    pub has_attachments: bool,
    pub conflict: bool,
}

/// The shared operation surface of both schemes.
pub trait Document {
    fn doc_id(&self) -> &str;
    fn exists(&self) -> bool;
    fn doc_type(&self) -> Option<&str>;
    fn set_doc_type(&mut self, doc_type: Option<String>);
    fn flags(&self) -> DocumentFlags;
    fn sequence(&self) -> u64;

    /// Expanded ASCII id of the current revision, if any.
    fn current_rev_id(&self) -> Option<String>;

    fn revisions_loaded(&self) -> bool;
    fn load_revisions(&mut self) -> crate::Result<()>;

    fn selected(&self) -> Option<SelectedRevision>;
    fn selected_body(&self) -> Option<Bytes>;

    /// The selected revision's id with the local peer written as its
    /// absolute id (vector scheme); same as the plain form for trees.
    fn selected_rev_global_form(&self) -> Option<String>;

    /// Ancestry (tree) or version vector (vector) of the selected
    /// revision as ASCII, newest first, limited to `max_revs` entries
    /// when nonzero. In the vector scheme `max_revs == 0` also leaves
    /// the local `*` unexpanded.
    fn selected_rev_history(&mut self, max_revs: usize) -> Option<String>;

    /// Selects by ASCII revision id, optionally loading the body
    /// (`Gone` if it was compacted away). `NotFound` if absent.
    fn select_revision(&mut self, rev_id: &str, with_body: bool) -> crate::Result<()>;
    fn select_current_revision(&mut self) -> bool;
    fn select_parent_revision(&mut self) -> bool;
    fn select_next_revision(&mut self) -> bool;

    /// Advances to the next leaf revision. `Ok(false)` with no error
    /// signals normal exhaustion.
    fn select_next_leaf_revision(&mut self, include_deleted: bool) -> crate::Result<bool>;

    fn has_revision_body(&self) -> bool;
    fn load_selected_rev_body(&mut self) -> crate::Result<()>;

    /// Inserts a revision with a known id as a child of the selected
    /// revision. Returns 1 if inserted, 0 if it already existed.
    fn insert_revision(
        &mut self,
        rev_id: &str,
        body: Bytes,
        flags: RevisionFlags,
        allow_conflict: bool,
    ) -> crate::Result<i32>;

    /// Inserts a revision along with its ancestry, newest first.
    /// Returns the index of the common ancestor within `history`.
    fn insert_revision_with_history(
        &mut self,
        history: &[&str],
        body: Bytes,
        flags: RevisionFlags,
        remote: RemoteId,
    ) -> crate::Result<i32>;

    /// Generates a new revision id for a local mutation (digest in the
    /// tree scheme, incremented vector in the vector scheme), inserts it
    /// as a child of the selected revision, and selects it.
    fn put_new_revision(
        &mut self,
        body: Bytes,
        flags: RevisionFlags,
        allow_conflict: bool,
    ) -> crate::Result<()>;

    /// Removes a revision (and, in the tree scheme, newly-dangling
    /// ancestors). Returns the number removed; updates the cursor if the
    /// selected revision went away.
    fn purge_revision(&mut self, rev_id: &str) -> crate::Result<usize>;

    /// Prunes to `max_rev_tree_depth` and persists through the open
    /// transaction. Fails with `Conflict` if the record moved underneath.
    fn save(&mut self, max_rev_tree_depth: u32) -> crate::Result<()>;

    /// Merges a conflicting pair; vector scheme only.
    fn resolve_conflict(
        &mut self,
        winning_rev_id: &str,
        losing_rev_id: &str,
        merged_body: Option<Bytes>,
        merged_flags: RevisionFlags,
    ) -> crate::Result<()> {
        let _ = (winning_rev_id, losing_rev_id, merged_body, merged_flags);
        Err(DocError::Unimplemented.into())
    }

    /// The revision id last acknowledged by `remote`, if tracked.
    fn remote_ancestor_rev_id(&mut self, remote: RemoteId) -> crate::Result<Option<String>>;

    /// Records `rev_id` as the revision last acknowledged by `remote`.
    fn set_remote_ancestor_rev_id(&mut self, remote: RemoteId, rev_id: &str) -> crate::Result<()>;
}

impl fmt::Debug for dyn Document + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document").field("doc_id", &self.doc_id()).finish()
    }
}

/// Alphabet for generated document ids (URL-safe base64).
const DOC_ID_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Length of the random part: 22 base64 characters = 132 bits.
const DOC_ID_LENGTH: usize = 22;

/// Generates a random document id, prefixed `-` so generated ids are
/// recognisable.
pub(crate) fn generate_doc_id() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    let mut id = String::with_capacity(1 + DOC_ID_LENGTH);
    id.push('-');
    for _ in 0..DOC_ID_LENGTH {
        let index = rng.random_range(0..DOC_ID_ALPHABET.len());
        id.push(DOC_ID_ALPHABET[index] as char);
    }
    id
}
