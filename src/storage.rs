//! # Record Store Backends
//!
//! This module defines the pluggable backend contract ([`RecordStore`]) and
//! the default in-memory implementation.
//!
//! ## Concurrency Discipline
//!
//! Backends are simple on purpose: `load` takes `&self` and may run under
//! many concurrent readers; `merge` and `clear` take `&mut self` and rely on
//! the store façade's write lock for exclusivity. A backend never needs its
//! own write serialization.
//!
//! ## Merge Semantics
//!
//! Merging is monotonic and change-tracking:
//!
//! ```text
//! stored:   "2001": { name: "R2-D2", id: "2001" }
//! incoming: "2001": { name: "C-3PO", id: "2001" }
//! result:   "2001": { name: "C-3PO", id: "2001" }   changed = { "2001.name" }
//! ```
//!
//! A field merged with a value deep-equal to the stored one reports no
//! change; an absent record reports every incoming field. Equality is the
//! only gate on change notification, there is no diffing anywhere else.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{changed_key, now_millis, CacheKey, Record, RecordRow, RecordSet};

// =============================================================================
// Backend Contract
// =============================================================================

/// The pluggable persistence backend behind the store façade.
///
/// Implementations must support concurrent `load` calls; exclusive access
/// for `merge` and `clear` is guaranteed by the façade. Errors propagate to
/// callers unchanged. Persistent backends are expected to apply a merge
/// atomically.
///
/// The record graph may be cyclic; implementations must treat records as
/// independent rows and never attempt eager deep materialization.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Loads rows for the given keys, positionally: the result has exactly
    /// one entry per key, `None` where the key is absent.
    async fn load(&self, keys: &[CacheKey]) -> Result<Vec<Option<RecordRow>>>;

    /// Merges a record set and returns the set of field-qualified changed
    /// keys, formatted `"<cacheKey>.<fieldKey>"`.
    ///
    /// Stamps `last_received_at` on every record the input touches.
    async fn merge(&mut self, records: RecordSet) -> Result<BTreeSet<String>>;

    /// Removes every record.
    async fn clear(&mut self) -> Result<()>;
}

/// Merges `incoming` into `existing` field-wise, accumulating the
/// field-qualified keys of fields that were inserted or deep-unequal.
///
/// Shared by every shipped backend so merge granularity cannot drift
/// between them.
pub(crate) fn merge_record_fields(
    key: &CacheKey,
    existing: &mut Record,
    incoming: Record,
    changed: &mut BTreeSet<String>,
) {
    for (field_key, value) in incoming.into_fields() {
        match existing.get(&field_key) {
            Some(current) if *current == value => {}
            _ => {
                changed.insert(changed_key(key, &field_key));
                existing.insert(field_key, value);
            }
        }
    }
}

// =============================================================================
// In-Memory Backend
// =============================================================================

/// The default backend: a process-local map from cache key to record row.
///
/// Merge is all-or-nothing (it cannot fail partway), loads are cheap clones.
///
/// # Example
///
/// ```rust,ignore
/// let store = NormStore::new(Box::new(InMemoryRecordStore::new()));
/// ```
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    rows: HashMap<CacheKey, (Record, u64)>,
}

impl InMemoryRecordStore {
    /// Creates an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn load(&self, keys: &[CacheKey]) -> Result<Vec<Option<RecordRow>>> {
        Ok(keys
            .iter()
            .map(|key| {
                self.rows.get(key).map(|(record, last_received_at)| RecordRow {
                    record: record.clone(),
                    last_received_at: *last_received_at,
                })
            })
            .collect())
    }

    async fn merge(&mut self, records: RecordSet) -> Result<BTreeSet<String>> {
        let now = now_millis();
        let mut changed = BTreeSet::new();

        for (key, incoming) in records.into_records() {
            let (existing, last_received_at) =
                self.rows.entry(key.clone()).or_insert_with(|| (Record::new(), now));
            merge_record_fields(&key, existing, incoming, &mut changed);
            // The timestamp moves for every record the merge touched, even
            // when no field actually changed.
            *last_received_at = now;
        }

        tracing::debug!(changed = changed.len(), "merged record set");
        Ok(changed)
    }

    async fn clear(&mut self) -> Result<()> {
        self.rows.clear();
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RecordValue, Reference};

    fn droid_record() -> Record {
        Record::new()
            .with("__typename", RecordValue::String("Droid".into()))
            .with("id", RecordValue::String("2001".into()))
            .with("name", RecordValue::String("R2-D2".into()))
    }

    #[tokio::test]
    async fn test_insert_reports_every_field() {
        let mut store = InMemoryRecordStore::new();
        let records = RecordSet::new().with("2001", droid_record());

        let changed = store.merge(records).await.unwrap();
        let expected: BTreeSet<String> = ["2001.__typename", "2001.id", "2001.name"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(changed, expected);
    }

    #[tokio::test]
    async fn test_identical_merge_reports_nothing() {
        let mut store = InMemoryRecordStore::new();
        store
            .merge(RecordSet::new().with("2001", droid_record()))
            .await
            .unwrap();

        let changed = store
            .merge(RecordSet::new().with("2001", droid_record()))
            .await
            .unwrap();
        assert!(changed.is_empty());
    }

    #[tokio::test]
    async fn test_merge_reports_only_differing_fields() {
        let mut store = InMemoryRecordStore::new();
        store
            .merge(RecordSet::new().with("2001", droid_record()))
            .await
            .unwrap();

        let update = Record::new()
            .with("id", RecordValue::String("2001".into()))
            .with("name", RecordValue::String("C-3PO".into()));
        let changed = store
            .merge(RecordSet::new().with("2001", update))
            .await
            .unwrap();

        let expected: BTreeSet<String> = ["2001.name".to_string()].into_iter().collect();
        assert_eq!(changed, expected);
    }

    #[tokio::test]
    async fn test_merge_never_drops_fields() {
        let mut store = InMemoryRecordStore::new();
        store
            .merge(RecordSet::new().with("2001", droid_record()))
            .await
            .unwrap();

        // A later partial record leaves unmentioned fields intact.
        let partial = Record::new().with("primaryFunction", RecordValue::String("Astromech".into()));
        store
            .merge(RecordSet::new().with("2001", partial))
            .await
            .unwrap();

        let rows = store.load(&[CacheKey::new("2001")]).await.unwrap();
        let record = &rows[0].as_ref().unwrap().record;
        assert_eq!(record.len(), 4);
        assert_eq!(record.get("name"), Some(&RecordValue::String("R2-D2".into())));
    }

    #[tokio::test]
    async fn test_load_is_positional() {
        let mut store = InMemoryRecordStore::new();
        store
            .merge(RecordSet::new().with("2001", droid_record()))
            .await
            .unwrap();

        let rows = store
            .load(&[CacheKey::new("missing"), CacheKey::new("2001")])
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].is_none());
        assert!(rows[1].is_some());
    }

    #[tokio::test]
    async fn test_references_survive_round_trip() {
        let mut store = InMemoryRecordStore::new();
        let root = Record::new().with("hero", RecordValue::Reference(Reference::new("2001")));
        store
            .merge(
                RecordSet::new()
                    .with("QUERY_ROOT", root)
                    .with("2001", droid_record()),
            )
            .await
            .unwrap();

        let rows = store.load(&[CacheKey::query_root()]).await.unwrap();
        let hero = rows[0].as_ref().unwrap().record.get("hero").unwrap();
        assert_eq!(hero, &RecordValue::Reference(Reference::new("2001")));
    }

    #[tokio::test]
    async fn test_clear_removes_everything() {
        let mut store = InMemoryRecordStore::new();
        store
            .merge(RecordSet::new().with("2001", droid_record()))
            .await
            .unwrap();
        store.clear().await.unwrap();

        let rows = store.load(&[CacheKey::new("2001")]).await.unwrap();
        assert!(rows[0].is_none());
        assert!(store.is_empty());
    }
}
