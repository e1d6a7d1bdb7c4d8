//! # Store Façade
//!
//! The public entry point: a normalized, transactional cache handle with
//! parallel readers and serialized writers.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Async Tasks (callers)                    │
//! │      load / within_read_transaction        publish / clear      │
//! │      within_read_write_transaction                              │
//! └───────────────┬─────────────────────────────────┬───────────────┘
//!                 │ read lock (shared)              │ write lock (exclusive)
//!                 ▼                                 ▼
//!      ┌────────────────────┐             ┌────────────────────┐
//!      │  ReadTransaction   │             │  merge + notify    │
//!      │  executor + loader │             │  subscribers       │
//!      └─────────┬──────────┘             └─────────┬──────────┘
//!                │ batched loads                    │
//!                ▼                                  ▼
//!      ┌─────────────────────────────────────────────────────┐
//!      │            RecordStore backend (pluggable)          │
//!      └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Data Flow
//!
//! - **Write path**: `publish(records)` acquires the write lock, merges,
//!   computes the changed-key set, notifies subscribers, then resolves.
//! - **Read path**: a read transaction holds the read lock for its whole
//!   body; every reference the executor meets is coalesced by the
//!   transaction's loader into batched backend loads.
//!
//! ## Ordering Guarantees
//!
//! - Reads within one transaction observe a consistent snapshot: once the
//!   read lock is held, no merge can interleave.
//! - Writes are globally ordered; notifications are delivered in the order
//!   writes completed, before the corresponding publish future resolves.
//! - Subscribers see exactly one invocation per write, with that write's
//!   full changed-key set.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Mutex};

use serde_json::Value as JsonValue;
use tokio::sync::{Mutex as AsyncMutex, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::loader::DataLoader;
use crate::normalizer::{normalize_response, CacheKeyResolverFn};
use crate::reader::{read_operation, read_selection_set, GraphQLResult};
use crate::selection::{GraphQLOperation, Selection};
use crate::storage::{InMemoryRecordStore, RecordStore};
use crate::subscription::{Subscriber, SubscriberRegistry};
use crate::types::{CacheKey, JsonObject, RecordRow, RecordSet};

/// The backend behind the reader/writer lock.
type SharedBackend = Arc<RwLock<Box<dyn RecordStore>>>;

/// The per-transaction loader of record rows.
type RowLoader = DataLoader<CacheKey, Option<RecordRow>>;

// =============================================================================
// NormStore
// =============================================================================

/// The normalized cache store.
///
/// `NormStore` is `Clone`, `Send`, and `Sync`; clones share the same
/// backend, lock, and subscriber list.
///
/// # Example
///
/// ```rust,ignore
/// let store = NormStore::with_cache_key_resolver(
///     Box::new(InMemoryRecordStore::new()),
///     |object| object.get("id").and_then(|v| v.as_str()).map(String::from),
/// );
///
/// store.publish(records, None).await?;
/// let result = store.load(&hero_query).await?;
/// ```
#[derive(Clone)]
pub struct NormStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    backend: SharedBackend,
    subscribers: SubscriberRegistry,
    cache_key_resolver: Option<Arc<CacheKeyResolverFn>>,
}

impl NormStore {
    /// Creates a store over the given backend, with path-derived cache keys
    /// only.
    pub fn new(backend: Box<dyn RecordStore>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                backend: Arc::new(RwLock::new(backend)),
                subscribers: SubscriberRegistry::new(),
                cache_key_resolver: None,
            }),
        }
    }

    /// Creates a store over the given backend with an object-identity hook.
    ///
    /// The hook receives each raw response object during normalization and
    /// returns its identity key (commonly the `id` field); `None` falls back
    /// to the response-path key. Installed once, read-only thereafter.
    pub fn with_cache_key_resolver(
        backend: Box<dyn RecordStore>,
        resolver: impl Fn(&JsonObject) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                backend: Arc::new(RwLock::new(backend)),
                subscribers: SubscriberRegistry::new(),
                cache_key_resolver: Some(Arc::new(resolver)),
            }),
        }
    }

    /// Creates a store over a fresh [`InMemoryRecordStore`].
    pub fn in_memory() -> Self {
        Self::new(Box::new(InMemoryRecordStore::new()))
    }

    /// The store's cache-key hook, shared with transactions.
    fn cache_key_resolver(&self) -> Option<Arc<CacheKeyResolverFn>> {
        self.inner.cache_key_resolver.clone()
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    /// Merges a record set and notifies subscribers of the changed keys.
    ///
    /// Acquires the write lock, so the merge waits for active readers and
    /// blocks new ones. Notifications are delivered synchronously before the
    /// returned future resolves, tagged with `identifier` so the originator
    /// of a write can skip its own notification.
    ///
    /// Returns the field-qualified changed-key set; an identical re-publish
    /// returns an empty set and notifies nobody.
    pub async fn publish(
        &self,
        records: RecordSet,
        identifier: Option<Uuid>,
    ) -> Result<BTreeSet<String>> {
        let mut guard = self.inner.backend.clone().write_owned().await;
        let backend: &mut dyn RecordStore = &mut **guard;
        let changed = backend.merge(records).await?;

        if !changed.is_empty() {
            tracing::debug!(changed = changed.len(), "publishing change notification");
            self.inner.subscribers.notify(self, &changed, identifier);
        }
        Ok(changed)
    }

    /// Normalizes a response payload for an operation and publishes the
    /// resulting records. This is the path a network layer hands fetch
    /// results to.
    pub async fn publish_response(
        &self,
        data: &JsonObject,
        operation: &GraphQLOperation,
        identifier: Option<Uuid>,
    ) -> Result<BTreeSet<String>> {
        let records = normalize_response(
            data,
            &operation.selections,
            &operation.variables,
            CacheKey::root_for(operation.operation_type),
            self.cache_key_resolver(),
        )
        .await?;
        self.publish(records, identifier).await
    }

    /// Removes every record. Waits for active readers like any writer.
    pub async fn clear(&self) -> Result<()> {
        let mut guard = self.inner.backend.clone().write_owned().await;
        let backend: &mut dyn RecordStore = &mut **guard;
        backend.clear().await
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Registers a change subscriber. Membership is by `Arc` identity and
    /// notification order is registration order.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        self.inner.subscribers.add(subscriber);
    }

    /// Removes a previously registered subscriber.
    pub fn unsubscribe(&self, subscriber: &Arc<dyn Subscriber>) {
        self.inner.subscribers.remove(subscriber);
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Runs `body` inside a read transaction.
    ///
    /// The read lock is held from before the body starts until its future
    /// completes, so every read in the body observes one consistent
    /// snapshot. Any number of read transactions may overlap; a writer waits
    /// for all of them.
    pub async fn within_read_transaction<F, Fut, T>(&self, body: F) -> Result<T>
    where
        F: FnOnce(ReadTransaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.inner.backend.clone().read_owned().await;
        let transaction = ReadTransaction {
            inner: Arc::new(ReadTransactionInner {
                guard,
                loader: RowLoader::new(),
            }),
        };
        body(transaction).await
    }

    /// Runs `body` inside a read-write transaction.
    ///
    /// The body reads through the same executor as a read transaction and
    /// stages writes locally; staged records overlay its subsequent reads.
    /// When the body completes, the staged set merges through the backend as
    /// one write and the changed keys broadcast to subscribers, before the
    /// returned future resolves.
    pub async fn within_read_write_transaction<F, Fut, T>(&self, body: F) -> Result<T>
    where
        F: FnOnce(ReadWriteTransaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.inner.backend.clone().write_owned().await;
        let inner = Arc::new(ReadWriteTransactionInner {
            guard: AsyncMutex::new(guard),
            loader: RowLoader::new(),
            staged: Mutex::new(RecordSet::new()),
            cache_key_resolver: self.cache_key_resolver(),
        });
        let transaction = ReadWriteTransaction {
            inner: Arc::clone(&inner),
        };

        let value = body(transaction).await?;

        let staged = std::mem::take(&mut *inner.staged.lock().expect("staged mutex poisoned"));
        if !staged.is_empty() {
            let mut guard = inner.guard.lock().await;
            let backend: &mut dyn RecordStore = &mut ***guard;
            let changed = backend.merge(staged).await?;
            if !changed.is_empty() {
                tracing::debug!(changed = changed.len(), "transaction committed changes");
                self.inner.subscribers.notify(self, &changed, None);
            }
        }
        Ok(value)
    }

    /// Convenience read: runs the operation's selection set from its root
    /// key in a fresh read transaction.
    pub async fn load(&self, operation: &GraphQLOperation) -> Result<GraphQLResult> {
        self.within_read_transaction(|transaction| async move {
            transaction.read(operation).await
        })
        .await
    }
}

// =============================================================================
// Read Transactions
// =============================================================================

struct ReadTransactionInner {
    guard: OwnedRwLockReadGuard<Box<dyn RecordStore>>,
    loader: RowLoader,
}

/// A handle valid for the duration of one read-transaction body.
///
/// All reads in one transaction share one loader, so repeated reads of the
/// same records coalesce and deduplicate.
pub struct ReadTransaction {
    inner: Arc<ReadTransactionInner>,
}

impl ReadTransaction {
    /// Reads a whole operation from its root key.
    pub async fn read(&self, operation: &GraphQLOperation) -> Result<GraphQLResult> {
        let backend: &dyn RecordStore = &**self.inner.guard;
        read_operation(backend, &self.inner.loader, None, operation).await
    }

    /// Reads a selection set rooted at an arbitrary cache key.
    pub async fn read_object(
        &self,
        key: &CacheKey,
        selections: &[Selection],
        variables: &JsonObject,
    ) -> Result<GraphQLResult> {
        let backend: &dyn RecordStore = &**self.inner.guard;
        read_selection_set(
            backend,
            &self.inner.loader,
            None,
            selections,
            variables,
            key.clone(),
        )
        .await
    }
}

// =============================================================================
// Read-Write Transactions
// =============================================================================

struct ReadWriteTransactionInner {
    guard: AsyncMutex<OwnedRwLockWriteGuard<Box<dyn RecordStore>>>,
    loader: RowLoader,
    /// Records written by the body, merged into the backend on completion.
    staged: Mutex<RecordSet>,
    cache_key_resolver: Option<Arc<CacheKeyResolverFn>>,
}

/// A handle valid for the duration of one read-write-transaction body.
///
/// Writes stage locally and merge as a single backend write when the body
/// completes; reads issued after a write observe the staged records.
pub struct ReadWriteTransaction {
    inner: Arc<ReadWriteTransactionInner>,
}

impl ReadWriteTransaction {
    /// Reads a whole operation, with staged writes overlaid.
    pub async fn read(&self, operation: &GraphQLOperation) -> Result<GraphQLResult> {
        let guard = self.inner.guard.lock().await;
        let backend: &dyn RecordStore = &***guard;
        let staged = self.inner.staged.lock().expect("staged mutex poisoned").clone();
        read_operation(backend, &self.inner.loader, Some(&staged), operation).await
    }

    /// Reads a selection set rooted at an arbitrary cache key, with staged
    /// writes overlaid.
    pub async fn read_object(
        &self,
        key: &CacheKey,
        selections: &[Selection],
        variables: &JsonObject,
    ) -> Result<GraphQLResult> {
        let guard = self.inner.guard.lock().await;
        let backend: &dyn RecordStore = &***guard;
        let staged = self.inner.staged.lock().expect("staged mutex poisoned").clone();
        read_selection_set(
            backend,
            &self.inner.loader,
            Some(&staged),
            selections,
            variables,
            key.clone(),
        )
        .await
    }

    /// Normalizes `data` as the operation's response and stages the records.
    pub async fn write_data(
        &self,
        data: &JsonObject,
        operation: &GraphQLOperation,
    ) -> Result<()> {
        self.stage(
            data,
            &operation.selections,
            &operation.variables,
            CacheKey::root_for(operation.operation_type),
        )
        .await
    }

    /// Normalizes `object` against a selection set rooted at `key` and
    /// stages the records.
    pub async fn write_object(
        &self,
        object: &JsonObject,
        key: &CacheKey,
        selections: &[Selection],
        variables: &JsonObject,
    ) -> Result<()> {
        self.stage(object, selections, variables, key.clone()).await
    }

    /// Read, mutate in place, re-normalize, stage.
    ///
    /// There is no diffing: the merge's per-field equality check is the only
    /// gate on change notification, so an update that changes nothing
    /// notifies nobody.
    pub async fn update<M>(&self, operation: &GraphQLOperation, mutate: M) -> Result<()>
    where
        M: FnOnce(&mut JsonValue),
    {
        let mut result = self.read(operation).await?;
        mutate(&mut result.data);
        let data = as_object(&result.data)?;
        self.write_data(data, operation).await
    }

    /// Read an object, mutate it in place, re-normalize, stage.
    pub async fn update_object<M>(
        &self,
        key: &CacheKey,
        selections: &[Selection],
        variables: &JsonObject,
        mutate: M,
    ) -> Result<()>
    where
        M: FnOnce(&mut JsonValue),
    {
        let mut result = self.read_object(key, selections, variables).await?;
        mutate(&mut result.data);
        let object = as_object(&result.data)?;
        self.write_object(object, key, selections, variables).await
    }

    /// Normalizes and stages one write, then drops cached load promises so
    /// later reads in this body observe the new records.
    async fn stage(
        &self,
        data: &JsonObject,
        selections: &[Selection],
        variables: &JsonObject,
        root_key: CacheKey,
    ) -> Result<()> {
        let records = normalize_response(
            data,
            selections,
            variables,
            root_key,
            self.inner.cache_key_resolver.clone(),
        )
        .await?;
        self.inner
            .staged
            .lock()
            .expect("staged mutex poisoned")
            .merge_set(records);
        self.inner.loader.clear_promises();
        Ok(())
    }
}

/// A mutator must leave the result's root an object; anything else cannot
/// be re-normalized.
fn as_object(value: &JsonValue) -> Result<&JsonObject> {
    value.as_object().ok_or_else(|| Error::TypeMismatch {
        path: String::new(),
        expected: "object",
        found: "scalar".to_string(),
    })
}

// =============================================================================
// Tests
// =============================================================================
