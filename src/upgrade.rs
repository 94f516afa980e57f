//! One-shot migration of stored documents between versioning schemes.
//!
//! Runs inside the single transaction opened by `Database::open_store`
//! and rewrites every record in place. Sequences are preserved so the
//! upgrade does not masquerade as new edits.

use bytes::Bytes;

use crate::config::{DatabaseConfig, VersioningScheme};
use crate::core::{decode_tree, PeerId, RemoteId, RevTree, RevIndex, Version, VersionVector};
use crate::doc::vector_doc::{encode_extra, Revision};
use crate::store::{DocumentFlags, KeyStore, Record, RecordUpdate};

pub(crate) fn upgrade_document_versioning(
    store: &dyn KeyStore,
    current: VersioningScheme,
    config: &DatabaseConfig,
) -> crate::Result<()> {
    let target = config.versioning;
    if target == current {
        return Ok(());
    }
    tracing::info!(
        from = current.name(),
        to = target.name(),
        "upgrading stored documents"
    );

    let mut doc_count = 0u64;
    for record in store.enumerate_all()? {
        if target.is_vectors() {
            upgrade_record_to_vectors(store, record, config)?;
        } else {
            // Tree-to-tree upgrade: the record layout is unchanged, but
            // rewrite it so the stored schema round-trips as v3.
            rewrite_record_unchanged(store, record)?;
        }
        doc_count += 1;
    }

    tracing::info!(documents = doc_count, "documents upgraded, committing");
    Ok(())
}

fn upgrade_record_to_vectors(
    store: &dyn KeyStore,
    record: Record,
    config: &DatabaseConfig,
) -> crate::Result<()> {
    let mut tree = decode_record_tree(&record, config.max_rev_tree_depth)?;
    let Some(current) = tree.current() else {
        return Ok(());
    };
    let remote = tree.latest_revision_on_remote(RemoteId::DEFAULT);
    let base = remote.and_then(|r| tree.common_ancestor(current, r));

    // Everything up to the replication base is attributed to the legacy
    // peer; changes past it are ours.
    let mut vector = VersionVector::new();
    let current_generation = tree.rev(current).rev_id().generation();
    let mut local_changes = current_generation;
    if let Some(base) = base {
        let base_generation = tree.rev(base).rev_id().generation();
        vector.add(Version::new(base_generation, PeerId::LEGACY)?);
        local_changes = current_generation.saturating_sub(base_generation);
    }
    if local_changes > 0 {
        vector.add(Version::new(local_changes, PeerId::ME)?);
    }
    let binary_version = Bytes::from(vector.as_binary(PeerId::ME)?);

    let current_body = tree.rev(current).body().cloned().unwrap_or_default();
    let extra = if tree.remote_revs().is_empty() {
        Bytes::new()
    } else {
        let current_revision = Revision {
            rev_id: Some(crate::core::RevId::from_vector(&vector, PeerId::ME)?),
            body: current_body.clone(),
            flags: rev_document_flags(&tree, current),
        };
        let mut slots: Vec<Option<Revision>> = Vec::new();
        for (&remote_id, &index) in tree.remote_revs() {
            let slot = remote_id.get() as usize;
            if slots.len() <= slot {
                slots.resize(slot + 1, None);
            }
            slots[slot] = Some(if index == current {
                current_revision.clone()
            } else {
                legacy_revision(&tree, index)?
            });
        }
        encode_extra(&slots)?
    };

    tracing::debug!(
        doc = %record.key,
        vector = %vector.as_ascii(PeerId::ME),
        body = current_body.len(),
        extra = extra.len(),
        "upgraded document"
    );

    store.set(RecordUpdate {
        key: record.key,
        doc_type: record.doc_type,
        flags: record.flags,
        body: current_body,
        extra,
        version: binary_version,
        sequence: record.sequence,
        update_sequence: false,
    })?;
    Ok(())
}

/// A remote revision carried over from the tree: its generation under
/// the legacy peer id, with its body if one survived pruning.
fn legacy_revision(tree: &RevTree, index: RevIndex) -> crate::Result<Revision> {
    let rev = tree.rev(index);
    let mut vector = VersionVector::new();
    vector.add(Version::new(rev.rev_id().generation(), PeerId::LEGACY)?);
    Ok(Revision {
        rev_id: Some(crate::core::RevId::from_vector(&vector, PeerId::ME)?),
        body: rev.body().cloned().unwrap_or_default(),
        flags: rev_document_flags(tree, index),
    })
}

fn rev_document_flags(tree: &RevTree, index: RevIndex) -> DocumentFlags {
    let rev = tree.rev(index);
    DocumentFlags {
        deleted: rev.is_deleted(),
        has_attachments: rev.has_attachments(),
        conflicted: false,
        synced: false,
    }
}

fn decode_record_tree(record: &Record, prune_depth: u32) -> crate::Result<RevTree> {
    if !record.extra.is_empty() {
        return Ok(decode_tree(&record.extra, prune_depth)?);
    }
    // A record written before trees moved to the extra column; all we
    // know is its current revision. A gen-N root is acceptable here
    // even though inserts would reject one.
    if record.version.is_empty() {
        return Ok(RevTree::new(prune_depth));
    }
    let rev_id = crate::core::RevId::from_bytes(&record.version)?;
    let mut flags = crate::core::RevFlags::LEAF;
    if record.flags.deleted {
        flags = flags.union(crate::core::RevFlags::DELETED);
    }
    let rev = RevTree::make_rev(
        rev_id,
        Some(record.body.clone()),
        None,
        record.sequence,
        flags,
    );
    Ok(RevTree::from_parts(
        vec![rev],
        Default::default(),
        prune_depth,
    ))
}

fn rewrite_record_unchanged(store: &dyn KeyStore, record: Record) -> crate::Result<()> {
    tracing::debug!(doc = %record.key, "rewriting record under the new schema");
    store.set(RecordUpdate {
        key: record.key,
        doc_type: record.doc_type,
        flags: record.flags,
        body: record.body,
        extra: record.extra,
        version: record.version,
        sequence: record.sequence,
        update_sequence: false,
    })?;
    Ok(())
}
