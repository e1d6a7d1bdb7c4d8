//! # SQLite Record Store
//!
//! A persistent [`RecordStore`](crate::storage::RecordStore) backed by
//! SQLite. Records are stored as JSON text (see [`crate::codec`]) in the
//! schema defined by [`crate::schema`].
//!
//! ## The SQLite Challenge
//!
//! `rusqlite::Connection` uses `RefCell` internally, making it `!Sync`, and
//! every call into it blocks. The backend trait, however, is async and must
//! be `Send + Sync`. The solution is the same one the async API layer of any
//! SQLite-backed store reaches for: a dedicated OS thread owns the
//! connection, and async callers talk to it over channels.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Async Tasks (store façade)               │
//! │   load ─┐                                      ┌─ merge      │
//! │         ├── tokio::sync::mpsc ─────────────────┤             │
//! │   load ─┘      (oneshot responses)             └─ clear      │
//! └────────────────────────┬─────────────────────────────────────┘
//!                          ▼
//!              ┌───────────────────────┐
//!              │  Dedicated OS Thread  │
//!              │  ┌─────────────────┐  │
//!              │  │ Connection      │  │
//!              │  │ LRU row cache   │  │
//!              │  └─────────────────┘  │
//!              └───────────────────────┘
//! ```
//!
//! This split is also what keeps batched loads off the lock-holding task: a
//! transaction that awaits a batch is suspended while the actual work runs
//! here, so a writer queued on the store lock can never be deadlocked by a
//! reader's load completion.
//!
//! ## Row Cache
//!
//! An LRU cache of decoded rows sits on the actor thread. Merges refresh it
//! only after the SQLite transaction commits, so the cache may lag disk but
//! never leads it.

use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::thread;

use async_trait::async_trait;
use lru::LruCache;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{mpsc, oneshot};

use crate::codec::{decode_record, encode_record};
use crate::error::{Error, Result};
use crate::schema::Database;
use crate::storage::{merge_record_fields, RecordStore};
use crate::types::{now_millis, CacheKey, Record, RecordRow, RecordSet};

// =============================================================================
// Configuration
// =============================================================================

/// Size of the request channel to the connection thread.
const REQUEST_CHANNEL_SIZE: usize = 1024;

/// Capacity of the decoded-row LRU cache on the connection thread.
const ROW_CACHE_CAPACITY: usize = 1024;

// =============================================================================
// Request Types
// =============================================================================

/// A request sent to the connection-owning thread.
enum StoreRequest {
    Load {
        keys: Vec<CacheKey>,
        response: oneshot::Sender<Result<Vec<Option<RecordRow>>>>,
    },
    Merge {
        records: RecordSet,
        response: oneshot::Sender<Result<BTreeSet<String>>>,
    },
    Clear {
        response: oneshot::Sender<Result<()>>,
    },
}

// =============================================================================
// SqliteRecordStore
// =============================================================================

/// A persistent record store backed by a SQLite file (or an in-memory
/// SQLite database).
///
/// Merges run in one SQLite transaction, so a failed merge leaves the
/// database unchanged. The handle is cheap to use from any task; dropping
/// the last handle closes the request channel and the connection thread
/// exits after draining queued requests.
///
/// # Example
///
/// ```rust,ignore
/// let backend = SqliteRecordStore::open("cache.db")?;
/// let store = NormStore::new(Box::new(backend));
/// ```
pub struct SqliteRecordStore {
    request_tx: mpsc::Sender<StoreRequest>,
}

impl SqliteRecordStore {
    /// Opens or creates a record store at the given path.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Self::spawn(Database::open(path)?)
    }

    /// Creates a record store on an in-memory SQLite database.
    pub fn open_in_memory() -> Result<Self> {
        Self::spawn(Database::open_in_memory()?)
    }

    /// Spawns the connection-owning thread and returns the handle.
    fn spawn(database: Database) -> Result<Self> {
        let (request_tx, request_rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);

        thread::Builder::new()
            .name("normstore-sqlite".to_string())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to create backend runtime");
                rt.block_on(run_store(database.into_connection(), request_rx));
            })
            .map_err(|e| Error::Backend(format!("failed to spawn backend thread: {}", e)))?;

        Ok(Self { request_tx })
    }

    /// Sends a request and awaits its oneshot response.
    async fn request<T>(
        &self,
        request: StoreRequest,
        response_rx: oneshot::Receiver<Result<T>>,
    ) -> Result<T> {
        self.request_tx
            .send(request)
            .await
            .map_err(|_| Error::Backend("record store thread has shut down".to_string()))?;
        response_rx
            .await
            .map_err(|_| Error::Backend("record store thread dropped the response".to_string()))?
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn load(&self, keys: &[CacheKey]) -> Result<Vec<Option<RecordRow>>> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(
            StoreRequest::Load {
                keys: keys.to_vec(),
                response: response_tx,
            },
            response_rx,
        )
        .await
    }

    async fn merge(&mut self, records: RecordSet) -> Result<BTreeSet<String>> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(
            StoreRequest::Merge {
                records,
                response: response_tx,
            },
            response_rx,
        )
        .await
    }

    async fn clear(&mut self) -> Result<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(StoreRequest::Clear { response: response_tx }, response_rx)
            .await
    }
}

// =============================================================================
// Connection Thread
// =============================================================================

/// The loop running on the connection-owning thread.
///
/// Exits when every handle to the request channel has been dropped.
async fn run_store(mut conn: Connection, mut request_rx: mpsc::Receiver<StoreRequest>) {
    let mut cache: LruCache<CacheKey, RecordRow> =
        LruCache::new(NonZeroUsize::new(ROW_CACHE_CAPACITY).expect("capacity is nonzero"));

    while let Some(request) = request_rx.recv().await {
        match request {
            StoreRequest::Load { keys, response } => {
                let _ = response.send(load_rows(&conn, &mut cache, &keys));
            }
            StoreRequest::Merge { records, response } => {
                let _ = response.send(merge_records(&mut conn, &mut cache, records));
            }
            StoreRequest::Clear { response } => {
                cache.clear();
                let _ = response.send(
                    conn.execute("DELETE FROM records", [])
                        .map(|_| ())
                        .map_err(Error::from),
                );
            }
        }
    }

    tracing::debug!("sqlite record store thread exiting");
}

/// Loads rows positionally, consulting the LRU cache first.
fn load_rows(
    conn: &Connection,
    cache: &mut LruCache<CacheKey, RecordRow>,
    keys: &[CacheKey],
) -> Result<Vec<Option<RecordRow>>> {
    let mut rows = Vec::with_capacity(keys.len());

    for key in keys {
        if let Some(row) = cache.get(key) {
            rows.push(Some(row.clone()));
            continue;
        }

        let stored: Option<(String, i64)> = conn
            .query_row(
                "SELECT record, last_received_at FROM records WHERE cache_key = ?",
                [key.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match stored {
            Some((text, last_received_at)) => {
                let row = RecordRow {
                    record: decode_record(&text)?,
                    last_received_at: last_received_at as u64,
                };
                cache.put(key.clone(), row.clone());
                rows.push(Some(row));
            }
            None => rows.push(None),
        }
    }

    Ok(rows)
}

/// Merges a record set inside one SQLite transaction.
///
/// The cache is refreshed only after commit, so it never leads disk.
fn merge_records(
    conn: &mut Connection,
    cache: &mut LruCache<CacheKey, RecordRow>,
    records: RecordSet,
) -> Result<BTreeSet<String>> {
    let now = now_millis();
    let mut changed = BTreeSet::new();
    let mut merged_rows = Vec::new();

    let tx = conn.transaction()?;
    for (key, incoming) in records.into_records() {
        let stored: Option<String> = tx
            .query_row(
                "SELECT record FROM records WHERE cache_key = ?",
                [key.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        let mut record = match stored {
            Some(text) => decode_record(&text)?,
            None => Record::new(),
        };
        merge_record_fields(&key, &mut record, incoming, &mut changed);

        let encoded = encode_record(&record)?;
        tx.execute(
            "INSERT INTO records (cache_key, record, last_received_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(cache_key) DO UPDATE SET record = ?2, last_received_at = ?3",
            params![key.as_str(), encoded, now as i64],
        )?;
        merged_rows.push((
            key,
            RecordRow {
                record,
                last_received_at: now,
            },
        ));
    }
    tx.commit()?;

    for (key, row) in merged_rows {
        cache.put(key, row);
    }

    tracing::debug!(changed = changed.len(), "merged record set into sqlite");
    Ok(changed)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RecordValue, Reference};

    fn droid_set() -> RecordSet {
        RecordSet::new()
            .with(
                "QUERY_ROOT",
                Record::new().with("hero", RecordValue::Reference(Reference::new("2001"))),
            )
            .with(
                "2001",
                Record::new()
                    .with("id", RecordValue::String("2001".into()))
                    .with("name", RecordValue::String("R2-D2".into())),
            )
    }

    #[tokio::test]
    async fn test_merge_and_load_round_trip() {
        let mut store = SqliteRecordStore::open_in_memory().unwrap();
        let changed = store.merge(droid_set()).await.unwrap();
        assert_eq!(changed.len(), 3);

        let rows = store
            .load(&[CacheKey::query_root(), CacheKey::new("2001")])
            .await
            .unwrap();
        let hero = rows[0].as_ref().unwrap().record.get("hero").unwrap();
        assert_eq!(hero, &RecordValue::Reference(Reference::new("2001")));
        let name = rows[1].as_ref().unwrap().record.get("name").unwrap();
        assert_eq!(name, &RecordValue::String("R2-D2".into()));
    }

    #[tokio::test]
    async fn test_second_identical_merge_changes_nothing() {
        let mut store = SqliteRecordStore::open_in_memory().unwrap();
        store.merge(droid_set()).await.unwrap();
        let changed = store.merge(droid_set()).await.unwrap();
        assert!(changed.is_empty());
    }

    #[tokio::test]
    async fn test_clear_empties_the_store() {
        let mut store = SqliteRecordStore::open_in_memory().unwrap();
        store.merge(droid_set()).await.unwrap();
        store.clear().await.unwrap();

        let rows = store.load(&[CacheKey::new("2001")]).await.unwrap();
        assert!(rows[0].is_none());
    }
}
