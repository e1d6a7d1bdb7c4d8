//! SQLite Backend Tests
//!
//! Invariants exercised here:
//! - The store behaves identically over the SQLite backend, including
//!   reference distinction and change-key granularity
//! - Records persist across reopening the same database file
//! - Clear empties the persisted state

mod common;

use serde_json::json;
use normstore::{
    CacheKey, NormStore, Record, RecordSet, RecordValue, Reference, SqliteRecordStore,
};

fn sqlite_store_at(path: &std::path::Path) -> NormStore {
    NormStore::with_cache_key_resolver(
        Box::new(SqliteRecordStore::open(path).unwrap()),
        common::id_hook,
    )
}

#[tokio::test]
async fn publish_and_read_through_sqlite() {
    let store = NormStore::with_cache_key_resolver(
        Box::new(SqliteRecordStore::open_in_memory().unwrap()),
        common::id_hook,
    );
    store.publish(common::hero_records(), None).await.unwrap();

    let result = store.load(&common::hero_name_query()).await.unwrap();
    assert_eq!(result.data, json!({ "hero": { "name": "R2-D2" } }));
    assert!(result.dependent_keys.contains(&CacheKey::new("2001")));
}

#[tokio::test]
async fn change_keys_are_field_granular_over_sqlite() {
    let store = NormStore::with_cache_key_resolver(
        Box::new(SqliteRecordStore::open_in_memory().unwrap()),
        common::id_hook,
    );
    store.publish(common::hero_records(), None).await.unwrap();

    let update = RecordSet::new().with(
        "2001",
        Record::new().with("name", RecordValue::String("C-3PO".into())),
    );
    let changed = store.publish(update, None).await.unwrap();
    assert_eq!(changed, common::changed(&["2001.name"]));

    // Re-publishing the identical value reports nothing.
    let update = RecordSet::new().with(
        "2001",
        Record::new().with("name", RecordValue::String("C-3PO".into())),
    );
    let changed = store.publish(update, None).await.unwrap();
    assert!(changed.is_empty());
}

#[tokio::test]
async fn records_persist_across_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("cache.db");

    {
        let store = sqlite_store_at(&path);
        store.publish(common::hero_records(), None).await.unwrap();
    }

    let reopened = sqlite_store_at(&path);
    let result = reopened.load(&common::hero_name_query()).await.unwrap();
    assert_eq!(result.data, json!({ "hero": { "name": "R2-D2" } }));
}

#[tokio::test]
async fn references_survive_persistence() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("cache.db");

    {
        let store = sqlite_store_at(&path);
        // A reference and a string with the same spelling.
        let records = RecordSet::new().with(
            "QUERY_ROOT",
            Record::new()
                .with("hero", RecordValue::Reference(Reference::new("2001")))
                .with("heroId", RecordValue::String("2001".into())),
        );
        store.publish(records, None).await.unwrap();
    }

    let mut backend = SqliteRecordStore::open(&path).unwrap();
    let rows = normstore::RecordStore::load(&backend, &[CacheKey::query_root()])
        .await
        .unwrap();
    let root = rows[0].as_ref().unwrap();
    assert_eq!(
        root.record.get("hero"),
        Some(&RecordValue::Reference(Reference::new("2001")))
    );
    assert_eq!(
        root.record.get("heroId"),
        Some(&RecordValue::String("2001".into()))
    );

    normstore::RecordStore::clear(&mut backend).await.unwrap();
    let rows = normstore::RecordStore::load(&backend, &[CacheKey::query_root()])
        .await
        .unwrap();
    assert!(rows[0].is_none());
}

#[tokio::test]
async fn batched_friend_reads_work_over_sqlite() {
    let store = NormStore::new(Box::new(SqliteRecordStore::open_in_memory().unwrap()));
    let (records, _) = common::hero_with_friends_records(5);
    store.publish(records, None).await.unwrap();

    let result = store.load(&common::hero_friends_query()).await.unwrap();
    assert_eq!(result.data["hero"]["friends"].as_array().unwrap().len(), 5);
}
