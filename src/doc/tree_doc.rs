//! Tree-scheme document façade: binds one record to its revision tree
//! and drives the selected-revision cursor over it.

use std::sync::Arc;

use bytes::Bytes;

use crate::core::{
    decode_tree, encode_tree, generate_rev_id, RemoteId, RevFlags, RevId, RevIndex, RevTree,
};
use crate::store::{ContentOption, DocumentFlags, KeyStore, Record, RecordUpdate, StoreError};

use super::{Document, DocError, RevisionFlags, SelectedRevision};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Cursor {
    None,
    /// A revision in the loaded tree.
    Rev(RevIndex),
    /// The record-level current revision of a tree that is not loaded.
    MetaCurrent,
}

pub struct TreeDocument {
    store: Arc<dyn KeyStore>,
    doc_id: String,
    doc_type: Option<String>,
    flags: DocumentFlags,
    sequence: u64,
    rev_id: Option<RevId>,
    tree: RevTree,
    cursor: Cursor,
    exists: bool,
    legacy_rev_ids: bool,
}

impl TreeDocument {
    pub fn load(
        store: Arc<dyn KeyStore>,
        doc_id: &str,
        content: ContentOption,
        prune_depth: u32,
        legacy_rev_ids: bool,
    ) -> crate::Result<Self> {
        let record = store.get(doc_id, content)?;
        Self::from_record(store, record, prune_depth, legacy_rev_ids)
    }

    pub fn from_record(
        store: Arc<dyn KeyStore>,
        record: Record,
        prune_depth: u32,
        legacy_rev_ids: bool,
    ) -> crate::Result<Self> {
        let tree = if record.exists
            && record.content >= ContentOption::EntireBody
            && !record.extra.is_empty()
        {
            decode_tree(&record.extra, prune_depth)?
        } else if record.exists {
            RevTree::unknown(prune_depth)
        } else {
            RevTree::new(prune_depth)
        };
        let rev_id = if record.version.is_empty() {
            None
        } else {
            Some(RevId::from_bytes(&record.version)?)
        };
        let mut doc = TreeDocument {
            store,
            doc_id: record.key,
            doc_type: record.doc_type,
            flags: record.flags,
            sequence: record.sequence,
            rev_id,
            tree,
            cursor: Cursor::None,
            exists: record.exists,
            legacy_rev_ids,
        };
        doc.select_current_revision();
        Ok(doc)
    }

    fn require_transaction(&self) -> crate::Result<()> {
        if self.store.in_transaction() {
            Ok(())
        } else {
            Err(StoreError::NotInTransaction.into())
        }
    }

    fn selected_index(&self) -> Option<RevIndex> {
        match self.cursor {
            Cursor::Rev(index) => Some(index),
            _ => None,
        }
    }

    fn select_index(&mut self, index: Option<RevIndex>) -> bool {
        match index {
            Some(i) => {
                self.cursor = Cursor::Rev(i);
                true
            }
            None => {
                self.cursor = Cursor::None;
                false
            }
        }
    }

    /// Re-resolves the cursor by revision id after an operation that may
    /// have compacted the arena.
    fn reselect(&mut self, rev_id: Option<RevId>) {
        let index = rev_id.and_then(|id| self.tree.get(&id));
        match index {
            Some(i) => self.cursor = Cursor::Rev(i),
            None => {
                let current = self.tree.current();
                self.select_index(current);
            }
        }
    }

    fn selected_rev_id(&self) -> Option<RevId> {
        self.selected_index().map(|i| self.tree.rev(i).rev_id().clone())
    }

    /// Recomputes record-level metadata from the tree.
    fn update_meta(&mut self) {
        match self.tree.current() {
            Some(current) => {
                let has_attachments = self
                    .tree
                    .in_order()
                    .iter()
                    .any(|&i| self.tree.rev(i).is_leaf() && self.tree.rev(i).has_attachments());
                let rev = self.tree.rev(current);
                self.rev_id = Some(rev.rev_id().clone());
                self.flags = DocumentFlags {
                    deleted: rev.is_deleted(),
                    conflicted: self.tree.has_conflict(),
                    has_attachments,
                    synced: false,
                };
            }
            None => {
                self.rev_id = None;
                self.flags = DocumentFlags::default();
            }
        }
    }

    fn parse_rev_id(&self, ascii: &str) -> crate::Result<RevId> {
        Ok(RevId::parse(ascii, crate::core::PeerId::ME)?)
    }

    fn rev_flags(flags: RevisionFlags) -> RevFlags {
        let mut out = RevFlags::empty();
        if flags.deleted {
            out = out.union(RevFlags::DELETED);
        }
        if flags.has_attachments {
            out = out.union(RevFlags::HAS_ATTACHMENTS);
        }
        out
    }
}

impl Document for TreeDocument {
    fn doc_id(&self) -> &str {
        &self.doc_id
    }

    fn exists(&self) -> bool {
        self.exists
    }

    fn doc_type(&self) -> Option<&str> {
        self.doc_type.as_deref()
    }

    fn set_doc_type(&mut self, doc_type: Option<String>) {
        self.doc_type = doc_type;
    }

    fn flags(&self) -> DocumentFlags {
        self.flags
    }

    fn sequence(&self) -> u64 {
        self.sequence
    }

    fn current_rev_id(&self) -> Option<String> {
        self.rev_id
            .as_ref()
            .map(|id| id.expanded(crate::core::PeerId::ME))
    }

    fn revisions_loaded(&self) -> bool {
        !self.tree.is_unknown()
    }

    fn load_revisions(&mut self) -> crate::Result<()> {
        if self.revisions_loaded() {
            return Ok(());
        }
        let record = self.store.get(&self.doc_id, ContentOption::EntireBody)?;
        let prune_depth = self.tree.prune_depth();
        if record.exists && !record.extra.is_empty() {
            self.tree = decode_tree(&record.extra, prune_depth)?;
        } else {
            self.tree = RevTree::new(prune_depth);
        }
        let current = self.tree.current();
        self.select_index(current);
        Ok(())
    }

    fn selected(&self) -> Option<SelectedRevision> {
        match self.cursor {
            Cursor::None => None,
            Cursor::MetaCurrent => Some(SelectedRevision {
                rev_id: self.current_rev_id().unwrap_or_default(),
                sequence: self.sequence,
                leaf: self.exists,
                deleted: self.flags.deleted,
                has_attachments: self.flags.has_attachments,
                conflict: false,
            }),
            Cursor::Rev(index) => {
                let rev = self.tree.rev(index);
                Some(SelectedRevision {
                    rev_id: rev.rev_id().expanded(crate::core::PeerId::ME),
                    sequence: rev.sequence(),
                    leaf: rev.is_leaf(),
                    deleted: rev.is_deleted(),
                    has_attachments: rev.has_attachments(),
                    conflict: rev.is_conflict(),
                })
            }
        }
    }

    fn selected_body(&self) -> Option<Bytes> {
        let index = self.selected_index()?;
        self.tree.rev(index).body().cloned()
    }

    fn selected_rev_global_form(&self) -> Option<String> {
        self.selected().map(|s| s.rev_id)
    }

    fn selected_rev_history(&mut self, max_revs: usize) -> Option<String> {
        let index = self.selected_index()?;
        let mut chain = self.tree.history(index);
        if max_revs > 0 {
            chain.truncate(max_revs);
        }
        let ids: Vec<String> = chain
            .iter()
            .map(|&i| self.tree.rev(i).rev_id().expanded(crate::core::PeerId::ME))
            .collect();
        Some(ids.join(","))
    }

    fn select_revision(&mut self, rev_id: &str, with_body: bool) -> crate::Result<()> {
        self.load_revisions()?;
        let id = self.parse_rev_id(rev_id)?;
        match self.tree.get(&id) {
            Some(index) => {
                self.cursor = Cursor::Rev(index);
                if with_body {
                    self.load_selected_rev_body()?;
                }
                Ok(())
            }
            None => {
                self.cursor = Cursor::None;
                Err(DocError::NotFound.into())
            }
        }
    }

    fn select_current_revision(&mut self) -> bool {
        if self.revisions_loaded() {
            let current = self.tree.current();
            self.select_index(current)
        } else {
            // The tree isn't loaded, but the record tells us enough
            // about the current revision.
            self.cursor = Cursor::MetaCurrent;
            true
        }
    }

    fn select_parent_revision(&mut self) -> bool {
        match self.cursor {
            Cursor::Rev(index) => {
                let parent = self.tree.rev(index).parent();
                self.select_index(parent)
            }
            _ => {
                self.cursor = Cursor::None;
                false
            }
        }
    }

    fn select_next_revision(&mut self) -> bool {
        match self.cursor {
            Cursor::Rev(index) => {
                let next = self.tree.next_in_order(index);
                self.select_index(next)
            }
            _ => {
                self.cursor = Cursor::None;
                false
            }
        }
    }

    fn select_next_leaf_revision(&mut self, include_deleted: bool) -> crate::Result<bool> {
        let Cursor::Rev(mut index) = self.cursor else {
            self.cursor = Cursor::None;
            return Ok(false);
        };
        loop {
            match self.tree.next_in_order(index) {
                None => {
                    self.cursor = Cursor::None;
                    return Ok(false);
                }
                Some(next) => {
                    let rev = self.tree.rev(next);
                    if rev.is_leaf() && (include_deleted || !rev.is_deleted()) {
                        self.cursor = Cursor::Rev(next);
                        return Ok(true);
                    }
                    index = next;
                }
            }
        }
    }

    fn has_revision_body(&self) -> bool {
        self.selected_index()
            .is_some_and(|i| self.tree.rev(i).body().is_some())
    }

    fn load_selected_rev_body(&mut self) -> crate::Result<()> {
        self.load_revisions()?;
        if self.cursor == Cursor::MetaCurrent {
            self.select_current_revision();
        }
        let Some(index) = self.selected_index() else {
            return Ok(());
        };
        if self.tree.rev(index).body().is_none() {
            return Err(DocError::Gone.into());
        }
        Ok(())
    }

    fn insert_revision(
        &mut self,
        rev_id: &str,
        body: Bytes,
        flags: RevisionFlags,
        allow_conflict: bool,
    ) -> crate::Result<i32> {
        self.require_transaction()?;
        self.load_revisions()?;
        let id = self.parse_rev_id(rev_id)?;
        let parent = self.selected_index();
        let outcome = self.tree.insert(
            id,
            Some(body),
            Self::rev_flags(flags),
            parent,
            allow_conflict,
            false,
        )?;
        let inserted = outcome.is_new();
        self.cursor = Cursor::Rev(outcome.index());
        if inserted {
            self.update_meta();
            Ok(1)
        } else {
            Ok(0)
        }
    }

    fn insert_revision_with_history(
        &mut self,
        history: &[&str],
        body: Bytes,
        flags: RevisionFlags,
        remote: RemoteId,
    ) -> crate::Result<i32> {
        self.require_transaction()?;
        self.load_revisions()?;
        let ids: Vec<RevId> = history
            .iter()
            .map(|h| self.parse_rev_id(h))
            .collect::<crate::Result<_>>()?;
        let common_ancestor = self.tree.insert_history(
            &ids,
            Some(body),
            Self::rev_flags(flags),
            true,
            !remote.is_local(),
        )?;
        self.update_meta();
        if let Some(index) = self.tree.get(&ids[0]) {
            self.cursor = Cursor::Rev(index);
            if !remote.is_local() {
                self.tree.set_latest_revision_on_remote(remote, Some(index));
            }
        }
        Ok(common_ancestor as i32)
    }

    fn put_new_revision(
        &mut self,
        body: Bytes,
        flags: RevisionFlags,
        allow_conflict: bool,
    ) -> crate::Result<()> {
        self.require_transaction()?;
        self.load_revisions()?;
        let parent_id = self.selected_rev_id();
        let new_id = generate_rev_id(&body, parent_id.as_ref(), flags.deleted, self.legacy_rev_ids)?;
        let parent = self.selected_index();
        let outcome = self.tree.insert(
            new_id,
            Some(body),
            Self::rev_flags(flags),
            parent,
            allow_conflict,
            false,
        )?;
        self.cursor = Cursor::Rev(outcome.index());
        if outcome.is_new() {
            self.update_meta();
        }
        Ok(())
    }

    fn purge_revision(&mut self, rev_id: &str) -> crate::Result<usize> {
        self.require_transaction()?;
        self.load_revisions()?;
        let id = self.parse_rev_id(rev_id)?;
        let selected = self.selected_rev_id();
        let purged = self.tree.purge(&id);
        if purged > 0 {
            self.update_meta();
            self.reselect(selected);
        }
        Ok(purged)
    }

    fn save(&mut self, max_rev_tree_depth: u32) -> crate::Result<()> {
        self.require_transaction()?;
        if !self.tree.changed() {
            return Ok(());
        }
        let selected = self.selected_rev_id();
        if self.tree.prune(max_rev_tree_depth) > 0 {
            self.reselect(selected);
        }
        self.tree.remove_non_leaf_bodies();
        self.update_meta();

        if self.tree.is_empty() {
            if self.exists {
                self.store.purge(&self.doc_id)?;
                self.exists = false;
                self.sequence = 0;
            }
            self.tree.set_changed(false);
            return Ok(());
        }

        let current = self.tree.current().expect("non-empty tree has a current rev");
        let body = self.tree.rev(current).body().cloned().unwrap_or_default();
        let version = self.tree.rev(current).rev_id().as_bytes();
        let update_sequence = self.tree.has_new_revisions();
        let extra = encode_tree(&mut self.tree);

        let update = RecordUpdate {
            key: self.doc_id.clone(),
            doc_type: self.doc_type.clone(),
            flags: self.flags,
            body,
            extra,
            version: version.into(),
            sequence: self.sequence,
            update_sequence,
        };
        match self.store.set(update)? {
            None => Err(DocError::Conflict.into()),
            Some(sequence) => {
                tracing::debug!(
                    doc = %self.doc_id,
                    rev = %self.current_rev_id().unwrap_or_default(),
                    sequence,
                    deleted = self.flags.deleted,
                    "saved revision tree"
                );
                self.sequence = sequence;
                self.exists = true;
                self.tree.saved(sequence);
                self.tree.set_changed(false);
                Ok(())
            }
        }
    }

    fn remote_ancestor_rev_id(&mut self, remote: RemoteId) -> crate::Result<Option<String>> {
        self.load_revisions()?;
        Ok(self
            .tree
            .latest_revision_on_remote(remote)
            .map(|i| self.tree.rev(i).rev_id().expanded(crate::core::PeerId::ME)))
    }

    fn set_remote_ancestor_rev_id(&mut self, remote: RemoteId, rev_id: &str) -> crate::Result<()> {
        self.require_transaction()?;
        self.load_revisions()?;
        let id = self.parse_rev_id(rev_id)?;
        let index = self.tree.get(&id).ok_or(DocError::NotFound)?;
        self.tree.set_latest_revision_on_remote(remote, Some(index));
        Ok(())
    }
}
