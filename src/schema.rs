//! # SQLite Schema
//!
//! DDL and initialization for the SQLite record store backend. The schema is
//! deliberately minimal: one row per normalized record plus a metadata table
//! for the schema version.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  records                       normstore_metadata        │
//! │  ┌──────────────────────┐      ┌────────────────┐        │
//! │  │ cache_key (PK)       │      │ key (PK)       │        │
//! │  │ record (JSON text)   │      │ value          │        │
//! │  │ last_received_at     │      └────────────────┘        │
//! │  └──────────────────────┘                                │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Why One Table?
//!
//! A normalized record is a small flat JSON object looked up by primary key.
//! The record graph may be cyclic, so rows stay independent: references are
//! stored inside the JSON (see [`crate::codec`]) and dereferenced lazily by
//! readers, never joined eagerly.

use rusqlite::Connection;

use crate::error::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current schema version. Incremented on breaking schema changes.
///
/// No migrations yet: opening a database with a different version is an
/// error rather than a silent upgrade.
const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// DDL Statements
// =============================================================================

/// The `records` table holds one row per normalized record.
///
/// # Columns
///
/// - `cache_key`: The record's cache key, primary key
/// - `record`: The record's fields as JSON text (codec module format)
/// - `last_received_at`: Unix-millisecond timestamp of the last merge that
///   touched this record
const CREATE_RECORDS: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    cache_key        TEXT PRIMARY KEY,
    record           TEXT NOT NULL,
    last_received_at INTEGER NOT NULL
)
"#;

/// The `normstore_metadata` table holds schema bookkeeping as key/value
/// pairs. Currently only `schema_version`.
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS normstore_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the record-store schema applied.
///
/// Owns its `Connection`; dropping the `Database` closes it.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a database file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - [`Error::Backend`] if the file cannot be opened or the stored
    ///   schema version does not match [`SCHEMA_VERSION`]
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates an in-memory database.
    ///
    /// In-memory databases vanish when the connection closes; they exist for
    /// tests and for callers who want SQLite semantics without a file.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Applies pragmas, creates tables, and verifies the schema version.
    fn initialize(&mut self) -> Result<()> {
        // WAL keeps concurrent readers off the writer's back; NORMAL syncs
        // the WAL on commit but not on every write.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;

        self.conn.execute_batch(CREATE_RECORDS)?;
        self.conn.execute_batch(CREATE_METADATA)?;

        self.check_schema_version()
    }

    /// Records the schema version on first open; verifies it afterwards.
    fn check_schema_version(&mut self) -> Result<()> {
        let stored: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM normstore_metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        match stored {
            None => {
                self.conn.execute(
                    "INSERT INTO normstore_metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
                Ok(())
            }
            Some(version) if version == SCHEMA_VERSION.to_string() => Ok(()),
            Some(version) => Err(Error::Backend(format!(
                "schema version mismatch: database has {}, this build expects {}",
                version, SCHEMA_VERSION
            ))),
        }
    }

    /// Consumes the wrapper, yielding the initialized connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }

    /// Borrows the underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_creates_tables() {
        let db = Database::open_in_memory().unwrap();
        let count: i64 = db
            .connection()
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_schema_version_is_recorded() {
        let db = Database::open_in_memory().unwrap();
        let version: String = db
            .connection()
            .query_row(
                "SELECT value FROM normstore_metadata WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION.to_string());
    }

    #[test]
    fn test_version_mismatch_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("store.db");

        {
            let db = Database::open(&path).unwrap();
            db.connection()
                .execute(
                    "UPDATE normstore_metadata SET value = '999' WHERE key = 'schema_version'",
                    [],
                )
                .unwrap();
        }

        let err = Database::open(&path).unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
    }
}
