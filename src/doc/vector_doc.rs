//! Vector-scheme document façade.
//!
//! Record schema: `version` holds the current revision's binary version
//! vector, `body` the current revision's bytes, and `extra` the remote
//! revisions. `extra` is a CBOR array indexed by remote id; each slot is
//! either null or `[revid bytes, flags, body bytes]`. Slot 0 is always
//! null since the local revision lives in the record proper.

use std::sync::Arc;

use bytes::Bytes;
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};

use crate::core::{CoreError, PeerId, RemoteId, RevId, Version, VersionOrder, VersionVector};
use crate::store::{ContentOption, DocumentFlags, KeyStore, Record, RecordUpdate, StoreError};

use super::{Document, DocError, RevisionFlags, SelectedRevision};

/// One revision as stored in a remote slot (or the record itself, for
/// the local current revision).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Revision {
    pub rev_id: Option<RevId>,
    pub body: Bytes,
    pub flags: DocumentFlags,
}

impl Revision {
    fn version(&self) -> Option<Version> {
        self.rev_id.as_ref().and_then(|id| id.as_version().ok())
    }

    fn vector(&self) -> VersionVector {
        self.rev_id
            .as_ref()
            .and_then(|id| id.as_vector().ok())
            .unwrap_or_default()
    }
}

pub struct VectorDocument {
    store: Arc<dyn KeyStore>,
    my_peer: PeerId,
    doc_id: String,
    doc_type: Option<String>,
    doc_flags: DocumentFlags,
    sequence: u64,
    current: Revision,
    /// Remote slots by remote id; index 0 unused.
    revisions: Vec<Option<Revision>>,
    content: ContentOption,
    exists: bool,
    changed: bool,
    rev_id_changed: bool,
    selected: Option<RemoteId>,
}

impl VectorDocument {
    pub fn load(
        store: Arc<dyn KeyStore>,
        doc_id: &str,
        content: ContentOption,
        my_peer: PeerId,
    ) -> crate::Result<Self> {
        let record = store.get(doc_id, content)?;
        Self::from_record(store, record, my_peer)
    }

    pub fn from_record(
        store: Arc<dyn KeyStore>,
        record: Record,
        my_peer: PeerId,
    ) -> crate::Result<Self> {
        let rev_id = if record.version.is_empty() {
            None
        } else {
            let id = RevId::from_bytes(&record.version)?;
            if !id.is_version() {
                return Err(CoreError::corrupt("tree revision id in a vector record").into());
            }
            Some(id)
        };
        let current = Revision {
            rev_id,
            body: record.body.clone(),
            flags: DocumentFlags {
                conflicted: false,
                synced: false,
                ..record.flags
            },
        };
        let revisions = if record.content >= ContentOption::EntireBody && !record.extra.is_empty() {
            decode_extra(&record.extra)?
        } else {
            Vec::new()
        };
        let mut doc = VectorDocument {
            store,
            my_peer,
            doc_id: record.key,
            doc_type: record.doc_type,
            doc_flags: record.flags,
            sequence: record.sequence,
            current,
            revisions,
            content: record.content,
            exists: record.exists,
            changed: false,
            rev_id_changed: false,
            selected: None,
        };
        doc.materialise_synced_flag();
        doc.select_current_revision();
        Ok(doc)
    }

    /// The Synced flag means the current revision was pushed to remote 1
    /// without rewriting the record; catch the remote slot up now.
    fn materialise_synced_flag(&mut self) {
        if self.doc_flags.synced && self.content >= ContentOption::EntireBody {
            let current = self.current.clone();
            self.set_slot(RemoteId::DEFAULT, Some(current));
            self.doc_flags.synced = false;
            self.changed = false;
        }
    }

    fn require_transaction(&self) -> crate::Result<()> {
        if self.store.in_transaction() {
            Ok(())
        } else {
            Err(StoreError::NotInTransaction.into())
        }
    }

    fn load_data(&mut self, which: ContentOption) -> crate::Result<()> {
        if !self.exists || which <= self.content {
            return Ok(());
        }
        let record = self.store.get(&self.doc_id, which)?;
        if !record.exists {
            return Err(DocError::NotFound.into());
        }
        if which >= ContentOption::CurrentRevOnly && self.content < ContentOption::CurrentRevOnly {
            self.current.body = record.body.clone();
        }
        if which >= ContentOption::EntireBody && self.content < ContentOption::EntireBody {
            self.revisions = if record.extra.is_empty() {
                Vec::new()
            } else {
                decode_extra(&record.extra)?
            };
        }
        self.content = which;
        self.materialise_synced_flag();
        Ok(())
    }

    fn current_vector(&self) -> VersionVector {
        self.current.vector()
    }

    /// The revision in a slot; slot 0 is the local current revision.
    fn slot(&self, remote: RemoteId) -> Option<Revision> {
        if remote.is_local() {
            Some(self.current.clone())
        } else {
            self.revisions
                .get(remote.get() as usize)
                .and_then(|r| r.clone())
        }
    }

    fn set_slot(&mut self, remote: RemoteId, revision: Option<Revision>) {
        if remote.is_local() {
            let revision = revision.expect("local revision cannot be removed");
            self.set_current_revision(revision);
            return;
        }
        let index = remote.get() as usize;
        match revision {
            Some(revision) => {
                if self.revisions.len() <= index {
                    self.revisions.resize(index + 1, None);
                }
                if self.revisions[index].as_ref() != Some(&revision) {
                    self.revisions[index] = Some(revision);
                    self.changed = true;
                }
            }
            None => {
                if self.revisions.get(index).is_some_and(Option::is_some) {
                    self.revisions[index] = None;
                    while self.revisions.last().is_some_and(Option::is_none) {
                        self.revisions.pop();
                    }
                    self.changed = true;
                }
            }
        }
        self.update_doc_flags();
    }

    fn set_current_revision(&mut self, revision: Revision) {
        if revision.rev_id != self.current.rev_id {
            self.rev_id_changed = true;
            self.changed = true;
        }
        if revision.body != self.current.body || revision.flags != self.current.flags {
            self.changed = true;
        }
        self.current = revision;
        self.current.flags.conflicted = false;
        self.current.flags.synced = false;
        self.update_doc_flags();
    }

    /// Document flags are the local revision's, plus Conflicted and
    /// HasAttachments contributed by any remote slot.
    fn update_doc_flags(&mut self) {
        let mut flags = DocumentFlags {
            conflicted: false,
            has_attachments: self.current.flags.has_attachments,
            deleted: self.current.flags.deleted,
            synced: self.doc_flags.synced,
        };
        for revision in self.revisions.iter().flatten() {
            if revision.flags.conflicted {
                flags.conflicted = true;
            }
            if revision.flags.has_attachments {
                flags.has_attachments = true;
            }
        }
        self.doc_flags = flags;
    }

    fn next_slot(&self, after: RemoteId) -> Option<RemoteId> {
        let start = after.get() as usize + 1;
        (start..self.revisions.len())
            .find(|&i| self.revisions[i].is_some())
            .map(|i| RemoteId::new(i as u32))
    }

    /// Locates a revision by ASCII id: a comma means a whole vector,
    /// matched by binary equality against every slot; a single version
    /// matches the slot whose current version it is.
    fn find_remote(&self, rev_id: &str) -> crate::Result<Option<(RemoteId, Revision)>> {
        if rev_id.contains(',') {
            let vector = VersionVector::parse_ascii(rev_id, self.my_peer)?;
            let binary = vector.as_binary(PeerId::ME)?;
            let mut remote = Some(RemoteId::LOCAL);
            while let Some(r) = remote {
                if let Some(revision) = self.slot(r) {
                    if revision
                        .rev_id
                        .as_ref()
                        .is_some_and(|id| id.as_bytes() == binary)
                    {
                        return Ok(Some((r, revision)));
                    }
                }
                remote = self.next_slot(r);
            }
        } else {
            let version = Version::parse_ascii(rev_id, self.my_peer)
                .map_err(|_| CoreError::bad_rev_id(rev_id, "not a version string"))?;
            let mut remote = Some(RemoteId::LOCAL);
            while let Some(r) = remote {
                if let Some(revision) = self.slot(r) {
                    if revision.version().as_ref() == Some(&version) {
                        return Ok(Some((r, revision)));
                    }
                }
                remote = self.next_slot(r);
            }
        }
        Ok(None)
    }

    fn select_slot(&mut self, remote: RemoteId) -> bool {
        match self.slot(remote) {
            Some(revision) if revision.rev_id.is_some() => {
                self.selected = Some(remote);
                true
            }
            _ => {
                self.selected = None;
                false
            }
        }
    }

    fn expand_rev_id(&self, rev_id: &RevId, my_id: PeerId) -> String {
        rev_id.expanded(my_id)
    }

    fn revision_flags(flags: RevisionFlags) -> DocumentFlags {
        DocumentFlags {
            deleted: flags.deleted,
            has_attachments: flags.has_attachments,
            conflicted: false,
            synced: false,
        }
    }
}

impl Document for VectorDocument {
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
        self.doc_flags
    }

    fn sequence(&self) -> u64 {
        self.sequence
    }

    fn current_rev_id(&self) -> Option<String> {
        self.current
            .rev_id
            .as_ref()
            .map(|id| self.expand_rev_id(id, PeerId::ME))
    }

    fn revisions_loaded(&self) -> bool {
        self.content >= ContentOption::EntireBody
    }

    fn load_revisions(&mut self) -> crate::Result<()> {
        self.load_data(ContentOption::EntireBody)
    }

    fn selected(&self) -> Option<SelectedRevision> {
        let remote = self.selected?;
        let revision = self.slot(remote)?;
        let rev_id = revision.rev_id.as_ref()?;
        Some(SelectedRevision {
            rev_id: self.expand_rev_id(rev_id, PeerId::ME),
            sequence: self.sequence,
            leaf: remote.is_local() || revision.flags.conflicted,
            deleted: revision.flags.deleted,
            has_attachments: revision.flags.has_attachments,
            conflict: revision.flags.conflicted,
        })
    }

    fn selected_body(&self) -> Option<Bytes> {
        let remote = self.selected?;
        let revision = self.slot(remote)?;
        if remote.is_local() && self.content < ContentOption::CurrentRevOnly {
            return None;
        }
        Some(revision.body)
    }

    fn selected_rev_global_form(&self) -> Option<String> {
        let remote = self.selected?;
        let revision = self.slot(remote)?;
        revision
            .rev_id
            .as_ref()
            .map(|id| self.expand_rev_id(id, self.my_peer))
    }

    fn selected_rev_history(&mut self, max_revs: usize) -> Option<String> {
        let remote = self.selected?;
        let revision = self.slot(remote)?;
        let mut vector = revision.vector();
        if max_revs > 0 && vector.count() > max_revs {
            vector.limit_count(max_revs);
        }
        // With no limit the local placeholder stays unexpanded.
        let my_id = if max_revs > 0 { self.my_peer } else { PeerId::ME };
        Some(vector.as_ascii(my_id))
    }

    fn select_revision(&mut self, rev_id: &str, _with_body: bool) -> crate::Result<()> {
        match self.find_remote(rev_id)? {
            Some((remote, _)) => {
                self.selected = Some(remote);
                Ok(())
            }
            None => {
                self.selected = None;
                Err(DocError::NotFound.into())
            }
        }
    }

    fn select_current_revision(&mut self) -> bool {
        self.select_slot(RemoteId::LOCAL)
    }

    fn select_parent_revision(&mut self) -> bool {
        // Version vectors have no parent pointers.
        self.selected = None;
        false
    }

    fn select_next_revision(&mut self) -> bool {
        match self.selected {
            Some(remote) => match self.next_slot(remote) {
                Some(next) => self.select_slot(next),
                None => {
                    self.selected = None;
                    false
                }
            },
            None => false,
        }
    }

    fn select_next_leaf_revision(&mut self, _include_deleted: bool) -> crate::Result<bool> {
        while self.select_next_revision() {
            if let Some(selected) = self.selected() {
                if selected.leaf {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn has_revision_body(&self) -> bool {
        self.exists && self.selected.is_some()
    }

    fn load_selected_rev_body(&mut self) -> crate::Result<()> {
        let Some(remote) = self.selected else {
            return Ok(());
        };
        let which = if remote.is_local() {
            ContentOption::CurrentRevOnly
        } else {
            ContentOption::EntireBody
        };
        self.load_data(which)
    }

    fn insert_revision(
        &mut self,
        rev_id: &str,
        body: Bytes,
        flags: RevisionFlags,
        _allow_conflict: bool,
    ) -> crate::Result<i32> {
        // A known revision is a one-entry history; the ordering rules
        // decide the effect.
        self.insert_revision_with_history(&[rev_id], body, flags, RemoteId::LOCAL)
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

        let new_vector = VersionVector::read_history(history, self.my_peer)?;
        let rev_id = RevId::from_vector(&new_vector, PeerId::ME)?;
        let mut new_rev = Revision {
            rev_id: Some(rev_id),
            body,
            flags: Self::revision_flags(flags),
        };

        let order = if self.exists {
            new_vector.compare_to(&self.current_vector())
        } else {
            VersionOrder::Newer
        };

        let common_ancestor = match order {
            VersionOrder::Same | VersionOrder::Older => 0,
            VersionOrder::Newer => {
                self.set_current_revision(new_rev.clone());
                1
            }
            VersionOrder::Conflicting => {
                if remote.is_local() {
                    tracing::warn!(
                        doc = %self.doc_id,
                        new = %new_vector.as_ascii(PeerId::ME),
                        current = %self.current_vector().as_ascii(PeerId::ME),
                        "local revision insert conflicts"
                    );
                    return Err(DocError::Conflict.into());
                }
                tracing::info!(
                    doc = %self.doc_id,
                    new = %new_vector.as_ascii(PeerId::ME),
                    current = %self.current_vector().as_ascii(PeerId::ME),
                    remote = %remote,
                    "remote revision conflicts with current"
                );
                new_rev.flags.conflicted = true;
                1
            }
        };

        if !remote.is_local() {
            self.set_slot(remote, Some(new_rev));
        }
        self.select_slot(remote);
        Ok(common_ancestor)
    }

    fn put_new_revision(
        &mut self,
        body: Bytes,
        flags: RevisionFlags,
        _allow_conflict: bool,
    ) -> crate::Result<()> {
        self.require_transaction()?;
        let mut vector = self.current_vector();
        vector.increment_generation(PeerId::ME)?;
        let rev_id = RevId::from_vector(&vector, PeerId::ME)?;
        tracing::debug!(
            doc = %self.doc_id,
            new = %vector.as_ascii(PeerId::ME),
            "new local revision"
        );
        self.set_current_revision(Revision {
            rev_id: Some(rev_id),
            body,
            flags: Self::revision_flags(flags),
        });
        self.select_current_revision();
        Ok(())
    }

    fn purge_revision(&mut self, rev_id: &str) -> crate::Result<usize> {
        self.require_transaction()?;
        self.load_revisions()?;
        let Some((remote, _)) = self.find_remote(rev_id)? else {
            return Ok(0);
        };
        if remote.is_local() {
            return Err(DocError::Unimplemented.into());
        }
        self.set_slot(remote, None);
        if self.selected == Some(remote) {
            self.select_current_revision();
        }
        Ok(1)
    }

    fn save(&mut self, _max_rev_tree_depth: u32) -> crate::Result<()> {
        self.require_transaction()?;
        if !self.changed {
            return Ok(());
        }
        let Some(rev_id) = self.current.rev_id.clone() else {
            return Err(CoreError::invalid("document has no revision to save").into());
        };

        let extra = encode_extra(&self.revisions)?;
        let update_sequence = self.sequence == 0 || self.rev_id_changed;
        let update = RecordUpdate {
            key: self.doc_id.clone(),
            doc_type: self.doc_type.clone(),
            flags: self.doc_flags,
            body: self.current.body.clone(),
            extra,
            version: Bytes::from(rev_id.as_bytes()),
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
                    deleted = self.doc_flags.deleted,
                    "saved vector record"
                );
                self.sequence = sequence;
                self.exists = true;
                self.changed = false;
                self.rev_id_changed = false;
                Ok(())
            }
        }
    }

    fn resolve_conflict(
        &mut self,
        winning_rev_id: &str,
        losing_rev_id: &str,
        merged_body: Option<Bytes>,
        merged_flags: RevisionFlags,
    ) -> crate::Result<()> {
        self.require_transaction()?;
        self.load_revisions()?;
        let won = self
            .find_remote(winning_rev_id)?
            .ok_or(DocError::NotFound)?;
        let lost = self.find_remote(losing_rev_id)?.ok_or(DocError::NotFound)?;
        if won.0 == lost.0 {
            return Err(CoreError::invalid("winner and loser are the same revision").into());
        }
        let local_won = won.0.is_local();
        if !local_won && !lost.0.is_local() {
            return Err(CoreError::invalid("one operand must be the local revision").into());
        }
        let local_rev = if local_won { won.1.clone() } else { lost.1.clone() };
        let (remote, mut remote_rev) = if local_won { lost.clone() } else { won.clone() };
        if !remote_rev.flags.conflicted {
            return Err(DocError::Conflict.into());
        }

        let local_vector = local_rev.vector();
        let remote_vector = remote_rev.vector();
        let mut merged = local_vector.merged_with(&remote_vector);
        merged.increment_generation(PeerId::ME)?;
        let merged_rev_id = RevId::from_vector(&merged, PeerId::ME)?;

        let body = match merged_body {
            Some(body) => body,
            None => won.1.body.clone(),
        };
        self.set_current_revision(Revision {
            rev_id: Some(merged_rev_id),
            body,
            flags: Self::revision_flags(merged_flags),
        });

        remote_rev.flags.conflicted = false;
        self.set_slot(remote, Some(remote_rev));
        self.select_current_revision();
        tracing::info!(
            doc = %self.doc_id,
            local = %local_vector.as_ascii(PeerId::ME),
            remote = %remote_vector.as_ascii(PeerId::ME),
            merged = %merged.as_ascii(PeerId::ME),
            "resolved conflict"
        );
        Ok(())
    }

    fn remote_ancestor_rev_id(&mut self, remote: RemoteId) -> crate::Result<Option<String>> {
        self.load_revisions()?;
        Ok(self
            .slot(remote)
            .and_then(|r| r.rev_id)
            .map(|id| self.expand_rev_id(&id, PeerId::ME)))
    }

    fn set_remote_ancestor_rev_id(&mut self, remote: RemoteId, rev_id: &str) -> crate::Result<()> {
        if remote.is_local() {
            return Err(CoreError::invalid("cannot set the local slot as a remote").into());
        }
        self.require_transaction()?;
        self.load_revisions()?;
        let revision = match self.find_remote(rev_id)? {
            Some((_, revision)) => revision,
            None => {
                let id = if rev_id.contains(',') {
                    let vector = VersionVector::parse_ascii(rev_id, self.my_peer)?;
                    RevId::from_vector(&vector, PeerId::ME)?
                } else {
                    let version = Version::parse_ascii(rev_id, self.my_peer)?;
                    RevId::from_version(&version, PeerId::ME)?
                };
                Revision {
                    rev_id: Some(id),
                    body: Bytes::new(),
                    flags: DocumentFlags::default(),
                }
            }
        };
        self.set_slot(remote, Some(revision));
        Ok(())
    }
}

//---- `extra` codec

pub(crate) fn encode_extra(revisions: &[Option<Revision>]) -> crate::Result<Bytes> {
    if revisions.iter().all(Option::is_none) {
        return Ok(Bytes::new());
    }
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.array(revisions.len() as u64)
        .map_err(encode_error)?;
    for slot in revisions {
        match slot {
            None => {
                enc.null().map_err(encode_error)?;
            }
            Some(revision) => {
                let rev_id = revision
                    .rev_id
                    .as_ref()
                    .ok_or_else(|| CoreError::corrupt("remote revision without an id"))?;
                enc.array(3).map_err(encode_error)?;
                enc.bytes(&rev_id.as_bytes()).map_err(encode_error)?;
                enc.u8(revision.flags.to_bits()).map_err(encode_error)?;
                enc.bytes(&revision.body).map_err(encode_error)?;
            }
        }
    }
    Ok(Bytes::from(buf))
}

pub(crate) fn decode_extra(extra: &[u8]) -> crate::Result<Vec<Option<Revision>>> {
    let mut dec = Decoder::new(extra);
    let count = dec
        .array()
        .map_err(decode_error)?
        .ok_or_else(|| CoreError::corrupt("indefinite-length revision array"))?;
    let mut revisions = Vec::with_capacity(count as usize);
    for _ in 0..count {
        match dec.datatype().map_err(decode_error)? {
            Type::Null => {
                dec.null().map_err(decode_error)?;
                revisions.push(None);
            }
            Type::Array => {
                let len = dec.array().map_err(decode_error)?;
                if len != Some(3) {
                    return Err(CoreError::corrupt("remote revision must have 3 fields").into());
                }
                let rev_id_bytes = dec.bytes().map_err(decode_error)?;
                let rev_id = RevId::from_bytes(rev_id_bytes)?;
                let flags = DocumentFlags::from_bits(dec.u8().map_err(decode_error)?);
                let body = Bytes::copy_from_slice(dec.bytes().map_err(decode_error)?);
                revisions.push(Some(Revision {
                    rev_id: Some(rev_id),
                    body,
                    flags,
                }));
            }
            other => {
                return Err(
                    CoreError::corrupt(format!("unexpected cbor type {other} in extra")).into(),
                );
            }
        }
    }
    if dec.datatype().is_ok() {
        return Err(CoreError::corrupt("trailing bytes after revision array").into());
    }
    Ok(revisions)
}

fn encode_error(err: minicbor::encode::Error<std::convert::Infallible>) -> crate::Error {
    CoreError::corrupt(format!("cbor encode: {err}")).into()
}

fn decode_error(err: minicbor::decode::Error) -> crate::Error {
    CoreError::corrupt(format!("cbor decode: {err}")).into()
}
