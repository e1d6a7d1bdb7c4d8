//! # normstore - Normalized GraphQL Result Cache
//!
//! A client-side cache for GraphQL results: response payloads are flattened
//! into canonical records keyed by object identity, and typed results are
//! served later by re-executing selection sets against those records.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       NormStore (façade)                        │
//! │        publish / load / transactions / subscriptions            │
//! └──────────────┬───────────────────────────────┬──────────────────┘
//!                │ read path                     │ write path
//!                ▼                               ▼
//! ┌──────────────────────────┐     ┌──────────────────────────────┐
//! │   Selection Executor     │     │         Normalizer           │
//! │  records -> typed data   │     │  payload -> RecordSet        │
//! │  + dependency keys       │     └──────────────┬───────────────┘
//! │  + freshness minimum     │                    │
//! └────────────┬─────────────┘                    ▼
//!              │ batched loads        ┌──────────────────────────┐
//!              ▼                      │   merge -> changed keys  │
//! ┌──────────────────────────┐       │   -> notify subscribers  │
//! │        DataLoader        │       └──────────────────────────┘
//! │  N fetches -> 1 batch    │
//! └────────────┬─────────────┘
//!              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │          RecordStore backend (in-memory or SQLite)              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Normalized records never nest objects**: sub-objects are stored as
//!    references and dereferenced transparently on read
//! 2. **Merging is monotonic**: fields are inserted or overwritten, never
//!    dropped, and only deep-unequal fields report a change
//! 3. **Parallel readers, serialized writers**: a read transaction observes
//!    one consistent snapshot; writes apply atomically between reads
//! 4. **One batch per executed object**: dereferencing N references costs
//!    one backend round-trip
//! 5. **Notifications before resolution**: subscribers hear about a write
//!    before the publisher's future resolves
//!
//! ## Module Organization
//!
//! - [`error`]: the crate-wide error enum
//! - [`types`]: cache keys, references, records, record sets
//! - [`selection`]: selection-set and operation model
//! - [`executor`]: the polymorphic selection-set executor
//! - [`loader`]: the per-transaction batched loader
//! - [`normalizer`]: response payload -> records
//! - [`reader`]: records -> typed result + dependency metadata
//! - [`storage`]: the backend contract and the in-memory backend
//! - [`schema`], [`codec`], [`sqlite`]: the SQLite backend
//! - [`subscription`]: change subscribers
//! - [`api`]: the store façade

/// Error types for store operations.
pub mod error;

/// Domain types: keys, references, records, record sets.
pub mod types;

/// Selection sets, fragments, arguments, and operations.
pub mod selection;

/// Record encoding for the SQLite backend's JSON column.
pub mod codec;

/// The per-transaction batched loader.
pub mod loader;

/// The backend contract and the in-memory backend.
pub mod storage;

/// SQLite DDL and database initialization.
pub mod schema;

/// The SQLite backend (dedicated connection thread plus row cache).
pub mod sqlite;

/// The selection-set executor and its accumulator surface.
pub mod executor;

/// Response normalization into record sets.
pub mod normalizer;

/// The cache read path: mapper, dependency and timestamp tracking.
pub mod reader;

/// Change subscribers and notification delivery.
pub mod subscription;

/// The store façade: transactions, publish, subscribe.
pub mod api;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::{NormStore, ReadTransaction, ReadWriteTransaction};
pub use error::{Error, Result};
pub use loader::DataLoader;
pub use reader::{GraphQLResult, ResultMetadata, ResultSource};
pub use sqlite::SqliteRecordStore;
pub use storage::{InMemoryRecordStore, RecordStore};
pub use subscription::Subscriber;

// Commonly used domain and selection types at the crate root.
pub use selection::{
    Argument, Field, FragmentDefinition, FragmentSpread, GraphQLOperation, InlineFragment,
    InputValue, OutputType, Selection,
};
pub use types::{
    CacheKey, JsonObject, OperationType, Record, RecordRow, RecordSet, RecordValue, Reference,
};
