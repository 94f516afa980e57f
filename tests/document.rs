//! End-to-end document scenarios through the put pipeline, for both
//! versioning schemes.

use bytes::Bytes;
use strata::{
    Database, DatabaseConfig, DocError, Error, PutRequest, RemoteId, RevisionFlags, StoreError,
    VersioningScheme,
};

fn tree_db() -> Database {
    Database::open_in_memory(DatabaseConfig {
        create: true,
        versioning: VersioningScheme::RevTreesV3,
        ..DatabaseConfig::default()
    })
    .unwrap()
}

fn vector_db() -> Database {
    Database::open_in_memory(DatabaseConfig {
        create: true,
        versioning: VersioningScheme::Vectors,
        local_peer_id: Some(0xb0b),
        ..DatabaseConfig::default()
    })
    .unwrap()
}

fn body(json: &serde_json::Value) -> Bytes {
    Bytes::from(serde_json::to_vec(json).unwrap())
}

fn put_simple(db: &Database, doc_id: &str, json: serde_json::Value) -> String {
    let txn = db.begin_transaction().unwrap();
    let (doc, _) = db
        .put(PutRequest {
            doc_id: Some(doc_id.to_string()),
            body: body(&json),
            history: doc_rev(db, doc_id).into_iter().collect(),
            ..PutRequest::default()
        })
        .unwrap();
    let rev = doc.current_rev_id().unwrap();
    txn.commit().unwrap();
    rev
}

fn doc_rev(db: &Database, doc_id: &str) -> Option<String> {
    let doc = db.get_document(doc_id, false).unwrap();
    if doc.exists() {
        doc.current_rev_id()
    } else {
        None
    }
}

#[test]
fn fresh_insert_tree() {
    let db = tree_db();
    let txn = db.begin_transaction().unwrap();
    let (doc, n) = db
        .put(PutRequest {
            doc_id: Some("doc1".into()),
            body: body(&serde_json::json!({"x": 1})),
            ..PutRequest::default()
        })
        .unwrap();
    txn.commit().unwrap();

    assert_eq!(n, 1);
    assert!(doc.exists());
    let selected = doc.selected().unwrap();
    assert!(selected.rev_id.starts_with("1-"));
    assert_eq!(doc.selected_body().unwrap(), body(&serde_json::json!({"x": 1})));
    assert!(doc.sequence() > 0);
}

#[test]
fn fresh_insert_vector() {
    let db = vector_db();
    let txn = db.begin_transaction().unwrap();
    let (doc, _) = db
        .put(PutRequest {
            doc_id: Some("doc1".into()),
            body: body(&serde_json::json!({"x": 1})),
            ..PutRequest::default()
        })
        .unwrap();
    txn.commit().unwrap();

    assert!(doc.exists());
    assert_eq!(doc.current_rev_id().unwrap(), "1@*");
    assert_eq!(doc.selected_rev_global_form().unwrap(), "1@b0b");
}

#[test]
fn generated_doc_ids_are_distinct() {
    let db = tree_db();
    let txn = db.begin_transaction().unwrap();
    let (doc_a, _) = db
        .put(PutRequest {
            body: body(&serde_json::json!({})),
            ..PutRequest::default()
        })
        .unwrap();
    let (doc_b, _) = db
        .put(PutRequest {
            body: body(&serde_json::json!({})),
            ..PutRequest::default()
        })
        .unwrap();
    txn.commit().unwrap();

    assert!(doc_a.doc_id().starts_with('-'));
    assert_eq!(doc_a.doc_id().len(), 23);
    assert_ne!(doc_a.doc_id(), doc_b.doc_id());
}

#[test]
fn sequential_updates_advance_the_generation() {
    let db = tree_db();
    let rev1 = put_simple(&db, "doc1", serde_json::json!({"v": 1}));
    let rev2 = put_simple(&db, "doc1", serde_json::json!({"v": 2}));
    assert!(rev1.starts_with("1-"));
    assert!(rev2.starts_with("2-"));

    let mut doc = db.get_document("doc1", true).unwrap();
    assert_eq!(doc.current_rev_id().unwrap(), rev2);
    assert!(doc.select_current_revision());
    assert!(doc.select_parent_revision());
    assert_eq!(doc.selected().unwrap().rev_id, rev1);
}

#[test]
fn updating_without_the_parent_conflicts() {
    let db = tree_db();
    put_simple(&db, "doc1", serde_json::json!({"v": 1}));

    let txn = db.begin_transaction().unwrap();
    let err = db
        .put(PutRequest {
            doc_id: Some("doc1".into()),
            body: body(&serde_json::json!({"v": 2})),
            ..PutRequest::default()
        })
        .unwrap_err();
    assert!(matches!(err, Error::Doc(DocError::Conflict)));
    drop(txn);
}

#[test]
fn deleting_requires_an_existing_revision() {
    let db = tree_db();
    let txn = db.begin_transaction().unwrap();
    let err = db
        .put(PutRequest {
            doc_id: Some("ghost".into()),
            deleted: true,
            ..PutRequest::default()
        })
        .unwrap_err();
    assert!(matches!(err, Error::Doc(DocError::NotFound)));
    drop(txn);
}

#[test]
fn tombstone_then_recreate() {
    let db = tree_db();
    let rev1 = put_simple(&db, "doc1", serde_json::json!({"v": 1}));

    let txn = db.begin_transaction().unwrap();
    let (doc, _) = db
        .put(PutRequest {
            doc_id: Some("doc1".into()),
            deleted: true,
            history: vec![rev1],
            ..PutRequest::default()
        })
        .unwrap();
    assert!(doc.flags().deleted);
    txn.commit().unwrap();

    // A no-parent put on a tombstoned doc starts a new branch.
    let txn = db.begin_transaction().unwrap();
    let (doc, _) = db
        .put(PutRequest {
            doc_id: Some("doc1".into()),
            body: body(&serde_json::json!({"reborn": true})),
            ..PutRequest::default()
        })
        .unwrap();
    assert!(!doc.flags().deleted);
    assert_eq!(doc.selected().unwrap().rev_id.split('-').next(), Some("3"));
    txn.commit().unwrap();
}

#[test]
fn replicator_insert_with_history_tree() {
    let db = tree_db();
    let rev1 = put_simple(&db, "doc1", serde_json::json!({"v": 1}));

    let txn = db.begin_transaction().unwrap();
    let history = vec!["3-ffffaaaa".to_string(), "2-eeeebbbb".to_string(), rev1.clone()];
    let (doc, ancestor) = db
        .put(PutRequest {
            doc_id: Some("doc1".into()),
            body: body(&serde_json::json!({"v": 3})),
            existing_revision: true,
            history,
            remote: RemoteId::new(1),
            ..PutRequest::default()
        })
        .unwrap();
    txn.commit().unwrap();

    assert_eq!(ancestor, 2);
    assert_eq!(doc.current_rev_id().unwrap(), "3-ffffaaaa");

    // The remote now tracks the inserted revision.
    let mut doc = db.get_document("doc1", true).unwrap();
    assert_eq!(
        doc.remote_ancestor_rev_id(RemoteId::new(1)).unwrap(),
        Some("3-ffffaaaa".to_string())
    );

    // The bodyless intermediate reports Gone when its body is demanded.
    let err = doc.select_revision("2-eeeebbbb", true).unwrap_err();
    assert!(matches!(err, Error::Doc(DocError::Gone)));
}

#[test]
fn next_leaf_iteration_terminates_cleanly() {
    let db = tree_db();
    let rev1 = put_simple(&db, "doc1", serde_json::json!({"v": 1}));

    let txn = db.begin_transaction().unwrap();
    db.put(PutRequest {
        doc_id: Some("doc1".into()),
        body: body(&serde_json::json!({"branch": "a"})),
        history: vec![rev1.clone()],
        ..PutRequest::default()
    })
    .unwrap();
    db.put(PutRequest {
        doc_id: Some("doc1".into()),
        body: body(&serde_json::json!({"branch": "b"})),
        history: vec![rev1],
        allow_conflict: true,
        ..PutRequest::default()
    })
    .unwrap();
    txn.commit().unwrap();

    let mut doc = db.get_document("doc1", true).unwrap();
    assert!(doc.flags().conflicted);
    assert!(doc.select_current_revision());
    let mut leaves = 1;
    while doc.select_next_leaf_revision(true).unwrap() {
        leaves += 1;
    }
    assert_eq!(leaves, 2);
    // Exhaustion cleared the selection without an error.
    assert!(doc.selected().is_none());
}

#[test]
fn concurrent_saves_detect_the_conflict() {
    let db = tree_db();
    let rev1 = put_simple(&db, "doc1", serde_json::json!({"v": 1}));

    let mut doc_a = db.get_document("doc1", true).unwrap();
    let mut doc_b = db.get_document("doc1", true).unwrap();

    let txn = db.begin_transaction().unwrap();
    doc_a.select_revision(&rev1, false).unwrap();
    doc_a
        .put_new_revision(
            body(&serde_json::json!({"winner": "a"})),
            RevisionFlags::default(),
            false,
        )
        .unwrap();
    doc_a.save(20).unwrap();

    doc_b.select_revision(&rev1, false).unwrap();
    doc_b
        .put_new_revision(
            body(&serde_json::json!({"winner": "b"})),
            RevisionFlags::default(),
            false,
        )
        .unwrap();
    let err = doc_b.save(20).unwrap_err();
    assert!(matches!(err, Error::Doc(DocError::Conflict)));
    txn.commit().unwrap();
}

#[test]
fn abort_discards_pending_mutations() {
    let db = tree_db();
    {
        let txn = db.begin_transaction().unwrap();
        db.put(PutRequest {
            doc_id: Some("doc1".into()),
            body: body(&serde_json::json!({"v": 1})),
            ..PutRequest::default()
        })
        .unwrap();
        txn.abort().unwrap();
    }
    assert!(!db.get_document("doc1", false).unwrap().exists());

    // Dropping the guard without committing aborts too.
    {
        let _txn = db.begin_transaction().unwrap();
        db.put(PutRequest {
            doc_id: Some("doc2".into()),
            body: body(&serde_json::json!({})),
            ..PutRequest::default()
        })
        .unwrap();
    }
    assert!(!db.get_document("doc2", false).unwrap().exists());
}

#[test]
fn purge_revision_updates_the_cursor() {
    let db = tree_db();
    put_simple(&db, "doc1", serde_json::json!({"v": 1}));
    let rev2 = put_simple(&db, "doc1", serde_json::json!({"v": 2}));

    let mut doc = db.get_document("doc1", true).unwrap();
    let txn = db.begin_transaction().unwrap();
    doc.select_revision(&rev2, false).unwrap();
    let purged = doc.purge_revision(&rev2).unwrap();
    assert_eq!(purged, 2);
    doc.save(20).unwrap();
    txn.commit().unwrap();
    assert!(!db.get_document("doc1", false).unwrap().exists());
}

#[test]
fn documents_are_reachable_by_sequence() {
    let db = tree_db();
    put_simple(&db, "doc1", serde_json::json!({"v": 1}));
    put_simple(&db, "doc2", serde_json::json!({"v": 2}));

    let doc = db.get_document_by_sequence(2).unwrap();
    assert_eq!(doc.doc_id(), "doc2");
    let err = db.get_document_by_sequence(99).unwrap_err();
    assert!(matches!(err, Error::Doc(DocError::NotFound)));
}

#[test]
fn process_defaults_freeze_at_first_open() {
    // tree_db() has already opened a handle by the time this runs; a
    // fresh one makes the ordering explicit.
    let _db = tree_db();
    let err = strata::set_default_config(DatabaseConfig::default()).unwrap_err();
    assert!(matches!(
        err,
        strata::config::ConfigError::DefaultsFrozen
    ));
}

#[test]
fn read_only_refuses_transactions() {
    let store = std::sync::Arc::new(strata::MemoryKeyStore::new());
    Database::open_store(
        store.clone(),
        DatabaseConfig {
            create: true,
            ..DatabaseConfig::default()
        },
    )
    .unwrap();
    let db = Database::open_store(
        store,
        DatabaseConfig {
            read_only: true,
            ..DatabaseConfig::default()
        },
    )
    .unwrap();
    let err = db.begin_transaction().unwrap_err();
    assert!(matches!(err, Error::Store(StoreError::ReadOnly)));
}

//---- Vector-scheme specifics

#[test]
fn vector_updates_increment_the_local_generation() {
    let db = vector_db();
    put_simple(&db, "doc1", serde_json::json!({"v": 1}));
    put_simple(&db, "doc1", serde_json::json!({"v": 2}));
    let doc = db.get_document("doc1", true).unwrap();
    assert_eq!(doc.current_rev_id().unwrap(), "2@*");
}

#[test]
fn put_existing_ordering_table() {
    let db = vector_db();
    let remote = RemoteId::new(1);

    // Newer: local copy updates and the remote slot tracks it.
    let txn = db.begin_transaction().unwrap();
    let (doc, ancestor) = db
        .put(PutRequest {
            doc_id: Some("doc1".into()),
            body: body(&serde_json::json!({"v": 1})),
            existing_revision: true,
            history: vec!["3@aaa".into()],
            remote,
            ..PutRequest::default()
        })
        .unwrap();
    assert_eq!(ancestor, 1);
    assert_eq!(doc.current_rev_id().unwrap(), "3@aaa");
    txn.commit().unwrap();

    // Same: no local change, ancestor 0.
    let txn = db.begin_transaction().unwrap();
    let (_, ancestor) = db
        .put(PutRequest {
            doc_id: Some("doc1".into()),
            body: body(&serde_json::json!({"v": 1})),
            existing_revision: true,
            history: vec!["3@aaa".into()],
            remote,
            ..PutRequest::default()
        })
        .unwrap();
    assert_eq!(ancestor, 0);
    txn.commit().unwrap();

    // Older: remote slot may regress, local stays.
    let txn = db.begin_transaction().unwrap();
    let (doc, ancestor) = db
        .put(PutRequest {
            doc_id: Some("doc1".into()),
            body: body(&serde_json::json!({"v": 0})),
            existing_revision: true,
            history: vec!["2@aaa".into()],
            remote,
            ..PutRequest::default()
        })
        .unwrap();
    assert_eq!(ancestor, 0);
    assert_eq!(doc.current_rev_id().unwrap(), "3@aaa");
    txn.commit().unwrap();

    // Conflicting from a remote: flagged, stored in the slot.
    let txn = db.begin_transaction().unwrap();
    let (doc, ancestor) = db
        .put(PutRequest {
            doc_id: Some("doc1".into()),
            body: body(&serde_json::json!({"other": true})),
            existing_revision: true,
            history: vec!["1@bbb".into()],
            remote,
            ..PutRequest::default()
        })
        .unwrap();
    assert_eq!(ancestor, 1);
    assert!(doc.flags().conflicted);
    assert_eq!(doc.current_rev_id().unwrap(), "3@aaa");
    txn.commit().unwrap();

    // Conflicting into the local slot is an error.
    let txn = db.begin_transaction().unwrap();
    let err = db
        .put(PutRequest {
            doc_id: Some("doc1".into()),
            body: body(&serde_json::json!({})),
            existing_revision: true,
            history: vec!["1@ccc".into()],
            remote: RemoteId::LOCAL,
            ..PutRequest::default()
        })
        .unwrap_err();
    assert!(matches!(err, Error::Doc(DocError::Conflict)));
    drop(txn);
}

#[test]
fn resolve_conflict_merges_and_clears_the_flag() {
    let db = vector_db();
    let remote = RemoteId::new(1);

    put_simple(&db, "doc1", serde_json::json!({"mine": 1}));
    let txn = db.begin_transaction().unwrap();
    db.put(PutRequest {
        doc_id: Some("doc1".into()),
        body: body(&serde_json::json!({"theirs": 1})),
        existing_revision: true,
        history: vec!["1@facade".into()],
        remote,
        ..PutRequest::default()
    })
    .unwrap();
    txn.commit().unwrap();

    let mut doc = db.get_document("doc1", true).unwrap();
    assert!(doc.flags().conflicted);

    let txn = db.begin_transaction().unwrap();
    doc.resolve_conflict(
        "1@*",
        "1@facade",
        Some(body(&serde_json::json!({"merged": true}))),
        RevisionFlags::default(),
    )
    .unwrap();
    doc.save(20).unwrap();
    txn.commit().unwrap();

    assert!(!doc.flags().conflicted);
    // The merged vector dominates both sides: ours bumped to 2, theirs kept.
    assert_eq!(doc.current_rev_id().unwrap(), "2@*");
    let history = doc.selected_rev_history(0).unwrap();
    assert!(history.contains("1@facade"), "{history}");
    assert_eq!(
        doc.selected_body().unwrap(),
        body(&serde_json::json!({"merged": true}))
    );

    // Reload: the resolution was persisted.
    let doc = db.get_document("doc1", true).unwrap();
    assert!(!doc.flags().conflicted);
}

#[test]
fn resolve_conflict_requires_a_conflicted_remote() {
    let db = vector_db();
    let remote = RemoteId::new(1);
    put_simple(&db, "doc1", serde_json::json!({"v": 1}));

    // Remote slot in sync with local: nothing to resolve.
    let txn = db.begin_transaction().unwrap();
    let mut doc = db.get_document("doc1", true).unwrap();
    doc.set_remote_ancestor_rev_id(remote, "1@*").unwrap();
    doc.save(20).unwrap();
    let err = doc
        .resolve_conflict("1@*", "1@*", None, RevisionFlags::default())
        .unwrap_err();
    assert!(matches!(err, Error::Core(_)));
    drop(txn);
}

#[test]
fn tree_scheme_has_no_conflict_resolver() {
    let db = tree_db();
    put_simple(&db, "doc1", serde_json::json!({"v": 1}));
    let mut doc = db.get_document("doc1", true).unwrap();
    let txn = db.begin_transaction().unwrap();
    let err = doc
        .resolve_conflict("1-aa", "1-bb", None, RevisionFlags::default())
        .unwrap_err();
    assert!(matches!(err, Error::Doc(DocError::Unimplemented)));
    drop(txn);
}

#[test]
fn delta_puts_resolve_against_the_stored_body() {
    let db = vector_db();
    put_simple(&db, "doc1", serde_json::json!({"n": 1}));

    fn apply(base: &[u8], delta: &[u8]) -> Option<Bytes> {
        // Toy delta format: the new body is base ++ delta.
        let mut out = base.to_vec();
        out.extend_from_slice(delta);
        Some(Bytes::from(out))
    }

    let txn = db.begin_transaction().unwrap();
    let (doc, _) = db
        .put(PutRequest {
            doc_id: Some("doc1".into()),
            delta: Some(strata::PutDelta {
                source_rev_id: "1@*".into(),
                delta: Bytes::from_static(b"!"),
                apply,
            }),
            history: vec!["1@*".into()],
            ..PutRequest::default()
        })
        .unwrap();
    txn.commit().unwrap();
    let expected = {
        let mut v = serde_json::to_vec(&serde_json::json!({"n": 1})).unwrap();
        v.push(b'!');
        Bytes::from(v)
    };
    assert_eq!(doc.selected_body().unwrap(), expected);

    // An unknown delta base is refused.
    let txn = db.begin_transaction().unwrap();
    let err = db
        .put(PutRequest {
            doc_id: Some("doc1".into()),
            delta: Some(strata::PutDelta {
                source_rev_id: "9@dead".into(),
                delta: Bytes::new(),
                apply,
            }),
            history: vec!["2@*".into()],
            ..PutRequest::default()
        })
        .unwrap_err();
    assert!(matches!(err, Error::Doc(DocError::DeltaBaseUnknown)));
    drop(txn);
}
