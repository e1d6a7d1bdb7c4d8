//! # Error Handling
//!
//! This module defines the error types used throughout the store. A single
//! error enum ([`Error`]) represents all failure modes, which keeps function
//! signatures simple and lets callers handle failures uniformly.
//!
//! ## Error Categories
//!
//! | Category | Examples | Typical Response |
//! |----------|----------|------------------|
//! | Read failure | Missing field, shape mismatch | Fix the query or populate the cache |
//! | Backend | SQLite error, corrupt stored record | Log and investigate |
//! | Contract | Batch result length mismatch | Fix the backend implementation |
//! | Lifecycle | Transaction dropped mid-flight | Retry in a new transaction |
//!
//! ## Why `Clone`?
//!
//! A single batched backend load serves many coalesced waiters. When the
//! batch fails, every waiter must receive the failure, so the error type is
//! cloneable. This is also why foreign errors (`rusqlite`, `serde_json`)
//! fold into [`Error::Backend`] as text instead of being wrapped by value:
//! neither foreign type implements `Clone`. The message is preserved
//! unchanged.

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // =========================================================================
    // Read Failures (the query asked for something the cache cannot supply)
    // =========================================================================
    /// A selected field has no value at the given response path.
    ///
    /// Raised identically by normalization (payload is missing a selected
    /// field) and by reads (record is missing a selected field, or a
    /// reference points at a record that is not in the store).
    #[error("missing value at '{path}'")]
    MissingValue {
        /// Dotted response path of the absent value, e.g. `hero.friends.0.name`.
        path: String,
    },

    /// A stored or payload value does not match the shape the selection
    /// declares, e.g. a scalar where a sub-selection expects an object.
    #[error("type mismatch at '{path}': expected {expected}, found {found}")]
    TypeMismatch {
        /// Dotted response path of the mismatched value.
        path: String,
        /// The shape the selection declares.
        expected: &'static str,
        /// A short description of the value actually present.
        found: String,
    },

    /// An argument refers to a variable the operation did not supply.
    #[error("undefined variable '${name}'")]
    UndefinedVariable {
        /// The variable name, without the `$` sigil.
        name: String,
    },

    // =========================================================================
    // Backend Failures (propagated unchanged, as text)
    // =========================================================================
    /// A record store backend operation failed.
    ///
    /// Wraps SQLite errors, codec failures on corrupt stored records, and
    /// closed-channel conditions when a backend worker has shut down.
    #[error("record store error: {0}")]
    Backend(String),

    // =========================================================================
    // Contract Violations (a pluggable piece broke its interface promise)
    // =========================================================================
    /// A batched load returned a result list whose length differs from the
    /// key list it was given. Results are paired by position, so a length
    /// mismatch makes every pairing meaningless; the whole batch fails.
    #[error("batch load contract violation: {expected} keys requested, {actual} values returned")]
    BatchContract {
        /// Number of keys in the dispatched batch.
        expected: usize,
        /// Number of values the backend returned.
        actual: usize,
    },

    // =========================================================================
    // Lifecycle
    // =========================================================================
    /// A pending load's transaction was dropped before the load resolved.
    ///
    /// In-flight reads fail with this rather than observing torn state.
    #[error("transaction dropped with loads still pending")]
    TransactionDropped,
}

impl Error {
    /// Builds a [`Error::Backend`] from any displayable error.
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Error::Backend(err.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Backend(err.to_string())
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
