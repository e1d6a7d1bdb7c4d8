#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use normstore::{
    CacheKey, Field, GraphQLOperation, InMemoryRecordStore, JsonObject, NormStore, OperationType,
    OutputType, Record, RecordRow, RecordSet, RecordStore, RecordValue, Reference, Result,
    Subscriber,
};

// =============================================================================
// Stores & Fixtures
// =============================================================================

/// The identity hook used throughout the suite: objects are keyed by `id`.
pub fn id_hook(object: &JsonObject) -> Option<String> {
    object.get("id").and_then(JsonValue::as_str).map(String::from)
}

/// An in-memory store keying objects by `id`.
pub fn id_store() -> NormStore {
    NormStore::with_cache_key_resolver(Box::new(InMemoryRecordStore::new()), id_hook)
}

/// `{ hero { name } }`
pub fn hero_name_query() -> GraphQLOperation {
    GraphQLOperation::new(
        OperationType::Query,
        vec![Field::new("hero", OutputType::Object)
            .with_selections(vec![Field::new("name", OutputType::Scalar).into_selection()])
            .into_selection()],
    )
}

/// `{ hero { id name } }`
pub fn hero_identity_query() -> GraphQLOperation {
    GraphQLOperation::new(
        OperationType::Query,
        vec![Field::new("hero", OutputType::Object)
            .with_selections(vec![
                Field::new("id", OutputType::Scalar).into_selection(),
                Field::new("name", OutputType::Scalar).into_selection(),
            ])
            .into_selection()],
    )
}

/// `{ hero { friends { name } } }`
pub fn hero_friends_query() -> GraphQLOperation {
    GraphQLOperation::new(
        OperationType::Query,
        vec![Field::new("hero", OutputType::Object)
            .with_selections(vec![Field::new(
                "friends",
                OutputType::list_of(OutputType::Object),
            )
            .with_selections(vec![Field::new("name", OutputType::Scalar).into_selection()])
            .into_selection()])
            .into_selection()],
    )
}

/// The hero record pair: `QUERY_ROOT -> hero -> "2001"`.
pub fn hero_records() -> RecordSet {
    RecordSet::new()
        .with(
            "QUERY_ROOT",
            Record::new().with("hero", RecordValue::Reference(Reference::new("2001"))),
        )
        .with(
            "2001",
            Record::new()
                .with("__typename", RecordValue::String("Droid".into()))
                .with("id", RecordValue::String("2001".into()))
                .with("name", RecordValue::String("R2-D2".into())),
        )
}

/// Hero with `count` friends; returns the records and the friend keys in
/// list order.
pub fn hero_with_friends_records(count: usize) -> (RecordSet, Vec<CacheKey>) {
    let friend_keys: Vec<CacheKey> =
        (0..count).map(|i| CacheKey::new(format!("{}", 1000 + i))).collect();

    let mut records = RecordSet::new()
        .with(
            "QUERY_ROOT",
            Record::new().with("hero", RecordValue::Reference(Reference::new("2001"))),
        )
        .with(
            "2001",
            Record::new()
                .with("id", RecordValue::String("2001".into()))
                .with("name", RecordValue::String("R2-D2".into()))
                .with(
                    "friends",
                    RecordValue::List(
                        friend_keys
                            .iter()
                            .map(|key| RecordValue::Reference(Reference::new(key.clone())))
                            .collect(),
                    ),
                ),
        );

    for (i, key) in friend_keys.iter().enumerate() {
        records.insert(
            key.clone(),
            Record::new()
                .with("id", RecordValue::String(key.as_str().to_string()))
                .with("name", RecordValue::String(format!("Friend {}", i))),
        );
    }

    (records, friend_keys)
}

// =============================================================================
// Instrumented Backends
// =============================================================================

/// Wraps the in-memory backend and records every load batch it serves.
pub struct CountingBackend {
    inner: InMemoryRecordStore,
    batches: Arc<Mutex<Vec<Vec<CacheKey>>>>,
}

impl CountingBackend {
    /// Returns the backend and a shared handle to its batch log.
    pub fn new() -> (Self, Arc<Mutex<Vec<Vec<CacheKey>>>>) {
        let batches = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                inner: InMemoryRecordStore::new(),
                batches: Arc::clone(&batches),
            },
            batches,
        )
    }
}

#[async_trait]
impl RecordStore for CountingBackend {
    async fn load(&self, keys: &[CacheKey]) -> Result<Vec<Option<RecordRow>>> {
        self.batches.lock().unwrap().push(keys.to_vec());
        self.inner.load(keys).await
    }

    async fn merge(&mut self, records: RecordSet) -> Result<BTreeSet<String>> {
        self.inner.merge(records).await
    }

    async fn clear(&mut self) -> Result<()> {
        self.inner.clear().await
    }
}

/// Wraps the in-memory backend and delays every load, for exercising
/// reader/writer interleavings.
pub struct SlowBackend {
    inner: InMemoryRecordStore,
    delay: Duration,
}

impl SlowBackend {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: InMemoryRecordStore::new(),
            delay,
        }
    }
}

#[async_trait]
impl RecordStore for SlowBackend {
    async fn load(&self, keys: &[CacheKey]) -> Result<Vec<Option<RecordRow>>> {
        tokio::time::sleep(self.delay).await;
        self.inner.load(keys).await
    }

    async fn merge(&mut self, records: RecordSet) -> Result<BTreeSet<String>> {
        self.inner.merge(records).await
    }

    async fn clear(&mut self) -> Result<()> {
        self.inner.clear().await
    }
}

// =============================================================================
// Recording Subscriber
// =============================================================================

/// Collects every notification it receives.
pub struct RecordingSubscriber {
    pub notifications: Mutex<Vec<(BTreeSet<String>, Option<Uuid>)>>,
}

impl RecordingSubscriber {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            notifications: Mutex::new(Vec::new()),
        })
    }

    /// The changed-key sets seen so far.
    pub fn seen(&self) -> Vec<BTreeSet<String>> {
        self.notifications
            .lock()
            .unwrap()
            .iter()
            .map(|(keys, _)| keys.clone())
            .collect()
    }
}

impl Subscriber for RecordingSubscriber {
    fn did_change_keys(
        &self,
        _store: &NormStore,
        changed_keys: &BTreeSet<String>,
        identifier: Option<Uuid>,
    ) {
        self.notifications
            .lock()
            .unwrap()
            .push((changed_keys.clone(), identifier));
    }
}

/// Builds a `BTreeSet` of changed keys from literals.
pub fn changed(keys: &[&str]) -> BTreeSet<String> {
    keys.iter().map(|key| key.to_string()).collect()
}
