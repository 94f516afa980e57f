//! Tree-to-vector migration scenarios.

use std::sync::Arc;

use bytes::Bytes;
use strata::{
    Database, DatabaseConfig, KeyStore, MemoryKeyStore, PutRequest, RemoteId, VersioningScheme,
};

fn config(versioning: VersioningScheme) -> DatabaseConfig {
    DatabaseConfig {
        create: true,
        versioning,
        local_peer_id: Some(0xfeed),
        ..DatabaseConfig::default()
    }
}

fn body(json: serde_json::Value) -> Bytes {
    Bytes::from(serde_json::to_vec(&json).unwrap())
}

fn put_chain(db: &Database, doc_id: &str, bodies: &[serde_json::Value]) -> Vec<String> {
    let mut revs = Vec::new();
    for value in bodies {
        let txn = db.begin_transaction().unwrap();
        let parent = revs.last().cloned();
        let (doc, _) = db
            .put(PutRequest {
                doc_id: Some(doc_id.to_string()),
                body: body(value.clone()),
                history: parent.into_iter().collect(),
                ..PutRequest::default()
            })
            .unwrap();
        revs.push(doc.current_rev_id().unwrap());
        txn.commit().unwrap();
    }
    revs
}

#[test]
fn upgrade_splits_history_at_the_replication_base() {
    let store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new());
    let db = Database::open_store(store.clone(), config(VersioningScheme::RevTreesV3)).unwrap();

    // Four local generations; the remote acknowledged generation 2.
    let revs = put_chain(
        &db,
        "doc1",
        &[
            serde_json::json!({"v": 1}),
            serde_json::json!({"v": 2}),
            serde_json::json!({"v": 3}),
            serde_json::json!({"v": 4}),
        ],
    );
    let txn = db.begin_transaction().unwrap();
    let mut doc = db.get_document("doc1", true).unwrap();
    doc.set_remote_ancestor_rev_id(RemoteId::new(1), &revs[1]).unwrap();
    doc.save(20).unwrap();
    txn.commit().unwrap();
    let sequence_before = db.get_document("doc1", true).unwrap().sequence();
    drop(db);

    let db = Database::open_store(store, config(VersioningScheme::Vectors)).unwrap();
    let mut doc = db.get_document("doc1", true).unwrap();

    // Two generations are past the base: [2@*, 2@legacy].
    assert_eq!(doc.current_rev_id().unwrap(), "2@*");
    assert!(doc.select_current_revision());
    assert_eq!(
        doc.selected_rev_history(0).unwrap(),
        "2@*,2@7777777"
    );

    // Body and sequence survive unchanged.
    assert_eq!(doc.selected_body().unwrap(), body(serde_json::json!({"v": 4})));
    assert_eq!(doc.sequence(), sequence_before);

    // The remote slot carries the base revision under the legacy peer.
    assert_eq!(
        doc.remote_ancestor_rev_id(RemoteId::new(1)).unwrap(),
        Some("2@7777777".to_string())
    );
}

#[test]
fn upgrade_without_remotes_is_all_local() {
    let store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new());
    let db = Database::open_store(store.clone(), config(VersioningScheme::RevTreesV3)).unwrap();
    put_chain(
        &db,
        "doc1",
        &[serde_json::json!({"v": 1}), serde_json::json!({"v": 2}), serde_json::json!({"v": 3})],
    );
    drop(db);

    let db = Database::open_store(store, config(VersioningScheme::Vectors)).unwrap();
    let mut doc = db.get_document("doc1", true).unwrap();
    assert_eq!(doc.current_rev_id().unwrap(), "3@*");
    doc.select_current_revision();
    assert_eq!(doc.selected_rev_history(0).unwrap(), "3@*");
    assert_eq!(doc.selected_body().unwrap(), body(serde_json::json!({"v": 3})));
}

#[test]
fn upgrade_preserves_tombstones() {
    let store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new());
    let db = Database::open_store(store.clone(), config(VersioningScheme::RevTreesV3)).unwrap();
    let revs = put_chain(&db, "doc1", &[serde_json::json!({"v": 1})]);
    let txn = db.begin_transaction().unwrap();
    db.put(PutRequest {
        doc_id: Some("doc1".into()),
        deleted: true,
        history: vec![revs[0].clone()],
        ..PutRequest::default()
    })
    .unwrap();
    txn.commit().unwrap();
    drop(db);

    let db = Database::open_store(store, config(VersioningScheme::Vectors)).unwrap();
    let doc = db.get_document("doc1", true).unwrap();
    assert!(doc.flags().deleted);
    assert_eq!(doc.current_rev_id().unwrap(), "2@*");
}

#[test]
fn upgrade_to_the_same_scheme_is_a_no_op() {
    let store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new());
    let db = Database::open_store(store.clone(), config(VersioningScheme::Vectors)).unwrap();
    let txn = db.begin_transaction().unwrap();
    let (doc, _) = db
        .put(PutRequest {
            doc_id: Some("doc1".into()),
            body: body(serde_json::json!({"v": 1})),
            ..PutRequest::default()
        })
        .unwrap();
    let sequence = doc.sequence();
    txn.commit().unwrap();
    drop(db);

    let db = Database::open_store(store, config(VersioningScheme::Vectors)).unwrap();
    let doc = db.get_document("doc1", true).unwrap();
    assert_eq!(doc.sequence(), sequence);
    assert_eq!(doc.current_rev_id().unwrap(), "1@*");
}

#[test]
fn tree_layouts_upgrade_between_themselves() {
    let store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new());
    let db = Database::open_store(store.clone(), config(VersioningScheme::RevTreesV2)).unwrap();
    let revs = put_chain(
        &db,
        "doc1",
        &[serde_json::json!({"v": 1}), serde_json::json!({"v": 2})],
    );
    let sequence_before = db.get_document("doc1", true).unwrap().sequence();
    drop(db);

    let db = Database::open_store(store, config(VersioningScheme::RevTreesV3)).unwrap();
    let doc = db.get_document("doc1", true).unwrap();
    assert_eq!(doc.current_rev_id().unwrap(), revs[1]);
    assert_eq!(doc.sequence(), sequence_before);
}
