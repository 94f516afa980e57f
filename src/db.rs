//! The database handle: open options, transactions, the put pipeline,
//! and the document factory for the configured versioning scheme.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use crate::config::{self, DatabaseConfig};
use crate::core::{PeerId, RemoteId};
use crate::doc::{Document, DocError, RevisionFlags, TreeDocument, VectorDocument};
use crate::store::{ContentOption, KeyStore, MemoryKeyStore, StoreError};
use crate::upgrade;

/// Database-level failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DbError {
    #[error("database does not exist and Create was not requested")]
    DatabaseNotFound,

    #[error("document versioning needs upgrade")]
    CantUpgradeDatabase,

    #[error("cannot downgrade document versioning")]
    CannotDowngrade,
}

/// A put request, as issued by a local writer or the replicator.
pub struct PutRequest {
    /// Empty means: generate a random document id.
    pub doc_id: Option<String>,
    pub body: Bytes,
    /// When present, `body` is ignored and the new body is computed from
    /// the delta against an existing revision's body.
    pub delta: Option<PutDelta>,
    pub deleted: bool,
    pub has_attachments: bool,
    /// True for the replicator path: insert a revision whose identity is
    /// already known, with its ancestry in `history` (newest first).
    /// False for a local mutation: `history` may carry the parent id.
    pub existing_revision: bool,
    pub allow_conflict: bool,
    pub history: Vec<String>,
    /// The remote this revision came from; Local for local writes.
    pub remote: RemoteId,
    pub save: bool,
}

impl Default for PutRequest {
    fn default() -> Self {
        PutRequest {
            doc_id: None,
            body: Bytes::new(),
            delta: None,
            deleted: false,
            has_attachments: false,
            existing_revision: false,
            allow_conflict: false,
            history: Vec::new(),
            remote: RemoteId::LOCAL,
            save: true,
        }
    }
}

/// A delta to apply against an existing revision's body.
pub struct PutDelta {
    pub source_rev_id: String,
    pub delta: Bytes,
    /// Applies (base body, delta) -> new body; None if the delta does
    /// not fit the base.
    pub apply: fn(&[u8], &[u8]) -> Option<Bytes>,
}

/// A caller-begun transaction. Aborts on drop unless committed, which
/// restores the store to its state at `begin`.
pub struct Transaction<'db> {
    db: &'db Database,
    finished: bool,
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction").field("finished", &self.finished).finish()
    }
}

impl Transaction<'_> {
    pub fn commit(mut self) -> crate::Result<()> {
        self.finished = true;
        self.db.store.commit()?;
        Ok(())
    }

    pub fn abort(mut self) -> crate::Result<()> {
        self.finished = true;
        self.db.store.abort()?;
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.db.store.abort();
        }
    }
}

pub struct Database {
    store: Arc<dyn KeyStore>,
    config: DatabaseConfig,
    my_peer: PeerId,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("config", &self.config)
            .field("my_peer", &self.my_peer)
            .finish()
    }
}

impl Database {
    /// Opens a fresh in-memory database.
    pub fn open_in_memory(config: DatabaseConfig) -> crate::Result<Database> {
        Database::open_store(Arc::new(MemoryKeyStore::new()), config)
    }

    /// Opens a database over an existing store, creating or upgrading
    /// its schema as the options allow.
    pub fn open_store(store: Arc<dyn KeyStore>, config: DatabaseConfig) -> crate::Result<Database> {
        config.validate()?;
        config::freeze_defaults();

        match store.versioning() {
            None => {
                if !config.create {
                    return Err(DbError::DatabaseNotFound.into());
                }
                if config.read_only {
                    return Err(StoreError::ReadOnly.into());
                }
                store.set_versioning(config.versioning)?;
            }
            Some(stored) => {
                if stored > config.versioning {
                    return Err(DbError::CannotDowngrade.into());
                }
                if stored < config.versioning {
                    if config.read_only || config.no_upgrade {
                        return Err(DbError::CantUpgradeDatabase.into());
                    }
                    store.begin()?;
                    let upgraded =
                        upgrade::upgrade_document_versioning(store.as_ref(), stored, &config);
                    match upgraded {
                        Ok(()) => {
                            store.set_versioning(config.versioning)?;
                            store.commit()?;
                        }
                        Err(err) => {
                            let _ = store.abort();
                            return Err(err);
                        }
                    }
                }
            }
        }

        let my_peer = match store.local_peer_id() {
            Some(id) => PeerId::new(id),
            None => {
                let id = config.local_peer_id.unwrap_or_else(random_peer_id);
                if !config.read_only {
                    store.set_local_peer_id(id)?;
                }
                PeerId::new(id)
            }
        };

        Ok(Database {
            store,
            config,
            my_peer,
        })
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// This database's peer id in version vectors it shares.
    pub fn my_peer_id(&self) -> PeerId {
        self.my_peer
    }

    pub fn store(&self) -> &Arc<dyn KeyStore> {
        &self.store
    }

    pub fn max_rev_tree_depth(&self) -> u32 {
        self.config.max_rev_tree_depth
    }

    pub fn begin_transaction(&self) -> crate::Result<Transaction<'_>> {
        if self.config.read_only {
            return Err(StoreError::ReadOnly.into());
        }
        self.store.begin()?;
        Ok(Transaction {
            db: self,
            finished: false,
        })
    }

    pub fn in_transaction(&self) -> bool {
        self.store.in_transaction()
    }

    fn require_transaction(&self) -> crate::Result<()> {
        if self.in_transaction() {
            Ok(())
        } else {
            Err(StoreError::NotInTransaction.into())
        }
    }

    fn new_document(&self, doc_id: &str, content: ContentOption) -> crate::Result<Box<dyn Document>> {
        Ok(if self.config.versioning.is_vectors() {
            Box::new(VectorDocument::load(
                self.store.clone(),
                doc_id,
                content,
                self.my_peer,
            )?)
        } else {
            Box::new(TreeDocument::load(
                self.store.clone(),
                doc_id,
                content,
                self.config.max_rev_tree_depth,
                self.config.legacy_rev_ids,
            )?)
        })
    }

    /// Fetches a document by id. With `must_exist`, a missing document
    /// is an error rather than an empty document to build on.
    pub fn get_document(&self, doc_id: &str, must_exist: bool) -> crate::Result<Box<dyn Document>> {
        let doc = self.new_document(doc_id, ContentOption::EntireBody)?;
        if must_exist && !doc.exists() {
            return Err(DocError::NotFound.into());
        }
        Ok(doc)
    }

    pub fn get_document_by_sequence(&self, sequence: u64) -> crate::Result<Box<dyn Document>> {
        let record = self
            .store
            .get_by_sequence(sequence, ContentOption::EntireBody)?
            .ok_or(DocError::NotFound)?;
        self.get_document(&record.key, true)
    }

    /// Removes a document and its whole revision history.
    pub fn purge_document(&self, doc_id: &str) -> crate::Result<bool> {
        self.require_transaction()?;
        Ok(self.store.purge(doc_id)?)
    }

    /// The put pipeline: local mutation or replicator insert, optionally
    /// saved. Returns the document (current revision selected on the new
    /// revision) and the common-ancestor index (0 for plain inserts that
    /// changed nothing, 1+ as the schemes define it).
    pub fn put(&self, request: PutRequest) -> crate::Result<(Box<dyn Document>, i32)> {
        self.require_transaction()?;
        if request.existing_revision {
            self.put_existing(request)
        } else {
            self.put_new(request)
        }
    }

    fn put_existing(&self, request: PutRequest) -> crate::Result<(Box<dyn Document>, i32)> {
        let doc_id = match request.doc_id.as_deref() {
            Some(id) if !id.is_empty() => id,
            _ => {
                return Err(
                    crate::core::CoreError::invalid("existing revision requires a document id")
                        .into(),
                )
            }
        };
        if request.history.is_empty() {
            return Err(crate::core::CoreError::invalid(
                "existing revision requires a history",
            )
            .into());
        }

        let mut doc = self.get_document(doc_id, false)?;
        let body = resolve_body(doc.as_mut(), &request)?;
        let history: Vec<&str> = request.history.iter().map(String::as_str).collect();
        let flags = RevisionFlags {
            deleted: request.deleted,
            has_attachments: request.has_attachments,
        };
        let inserted =
            doc.insert_revision_with_history(&history, body, flags, request.remote)?;
        if request.save {
            doc.save(self.config.max_rev_tree_depth)?;
        }
        Ok((doc, inserted))
    }

    fn put_new(&self, request: PutRequest) -> crate::Result<(Box<dyn Document>, i32)> {
        if request.history.len() > 1 {
            return Err(crate::core::CoreError::invalid(
                "a new revision takes at most one parent id",
            )
            .into());
        }
        let parent_rev_id = request.history.first().cloned();

        let generated;
        let doc_id = match request.doc_id.as_deref() {
            Some(id) if !id.is_empty() => id,
            _ => {
                generated = crate::doc::generate_doc_id();
                &generated
            }
        };

        let mut doc = self.get_document(doc_id, false)?;
        let body = resolve_body(doc.as_mut(), &request)?;

        match &parent_rev_id {
            Some(parent) => {
                // Updating an existing revision: it must exist, and must
                // be a leaf unless conflicts are allowed.
                doc.select_revision(parent, false)?;
                let selected = doc.selected().ok_or(DocError::NotFound)?;
                if !request.allow_conflict && !selected.leaf {
                    return Err(DocError::Conflict.into());
                }
            }
            None => {
                if request.deleted {
                    // Deleting without naming a revision.
                    return Err(if doc.exists() {
                        DocError::Conflict.into()
                    } else {
                        DocError::NotFound.into()
                    });
                }
                if doc.exists() {
                    // Without a parent, the current revision must be a
                    // tombstone or this write conflicts.
                    doc.select_current_revision();
                    if let Some(selected) = doc.selected() {
                        if !selected.deleted {
                            return Err(DocError::Conflict.into());
                        }
                    }
                }
            }
        }

        let flags = RevisionFlags {
            deleted: request.deleted,
            has_attachments: request.has_attachments,
        };
        doc.put_new_revision(body, flags, request.allow_conflict)?;
        if request.save {
            doc.save(self.config.max_rev_tree_depth)?;
        }
        Ok((doc, 1))
    }
}

/// Resolves the new revision body, applying a delta against a stored
/// revision if one was supplied.
fn resolve_body(doc: &mut dyn Document, request: &PutRequest) -> crate::Result<Bytes> {
    let Some(delta) = &request.delta else {
        return Ok(request.body.clone());
    };
    if doc.select_revision(&delta.source_rev_id, true).is_err() {
        return Err(DocError::DeltaBaseUnknown.into());
    }
    let base = doc.selected_body().ok_or(DocError::DeltaBaseUnknown)?;
    (delta.apply)(&base, &delta.delta).ok_or_else(|| DocError::DeltaBaseUnknown.into())
}

fn random_peer_id() -> u64 {
    use rand::Rng;
    let mut rng = rand::rng();
    loop {
        let id: u64 = rng.random();
        if id != 0 && id != PeerId::LEGACY.id() {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VersioningScheme;

    fn config(versioning: VersioningScheme) -> DatabaseConfig {
        DatabaseConfig {
            create: true,
            versioning,
            ..DatabaseConfig::default()
        }
    }

    #[test]
    fn open_requires_create_for_a_fresh_store() {
        let err = Database::open_store(
            Arc::new(MemoryKeyStore::new()),
            DatabaseConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, crate::Error::Db(DbError::DatabaseNotFound)));

        let db = Database::open_in_memory(config(VersioningScheme::Vectors)).unwrap();
        assert!(db.my_peer_id().id() != 0);
    }

    #[test]
    fn downgrade_is_refused() {
        let store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new());
        Database::open_store(store.clone(), config(VersioningScheme::Vectors)).unwrap();
        let err =
            Database::open_store(store, config(VersioningScheme::RevTreesV3)).unwrap_err();
        assert!(matches!(err, crate::Error::Db(DbError::CannotDowngrade)));
    }

    #[test]
    fn no_upgrade_refuses_a_schema_change() {
        let store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new());
        Database::open_store(store.clone(), config(VersioningScheme::RevTreesV3)).unwrap();
        let err = Database::open_store(
            store,
            DatabaseConfig {
                no_upgrade: true,
                ..config(VersioningScheme::Vectors)
            },
        )
        .unwrap_err();
        assert!(matches!(err, crate::Error::Db(DbError::CantUpgradeDatabase)));
    }

    #[test]
    fn mutations_require_a_transaction() {
        let db = Database::open_in_memory(config(VersioningScheme::Vectors)).unwrap();
        let err = db
            .put(PutRequest {
                doc_id: Some("doc1".into()),
                body: Bytes::from_static(b"{}"),
                ..PutRequest::default()
            })
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Store(StoreError::NotInTransaction)
        ));
    }

    #[test]
    fn peer_id_is_stable_across_reopens() {
        let store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new());
        let first = Database::open_store(store.clone(), config(VersioningScheme::Vectors))
            .unwrap()
            .my_peer_id();
        let second = Database::open_store(store, config(VersioningScheme::Vectors))
            .unwrap()
            .my_peer_id();
        assert_eq!(first, second);
    }
}
