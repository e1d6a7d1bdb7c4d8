//! # Domain Types
//!
//! This module defines the core types of the normalized cache: keys, values,
//! records, and record sets. Types follow the newtype pattern so a cache key
//! cannot be confused with a plain string or a reference with a scalar.
//!
//! ## The Normalized Shape
//!
//! A GraphQL response is a tree. The cache flattens that tree into records,
//! one per distinct object, keyed by identity:
//!
//! ```text
//! Response tree:                     Normalized records:
//!
//! { hero: { id: "2001",              QUERY_ROOT:
//!           name: "R2-D2",             hero -> Reference("2001")
//!           friends: [...] } }       "2001":
//!                                      id -> "2001"
//!                                      name -> "R2-D2"
//!                                      friends -> [Reference("1000"), ...]
//! ```
//!
//! Nested objects are never stored inline. A record field holds a scalar, a
//! list, a [`Reference`], or a list of references; the referenced objects
//! live in their own records. This is what makes a later write to `"2001"`
//! visible through every query that reaches it.
//!
//! ## Invariants
//!
//! - Merging records is monotonic: fields are overwritten or inserted, never
//!   dropped.
//! - A merged field equal to the stored value must not report a change.
//! - `last_received_at` of a record equals the timestamp of the most recent
//!   merge that touched that record.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value as JsonValue;

/// A JSON object, as delivered by a GraphQL response payload.
///
/// `serde_json::Map` is BTree-backed, so serializing one always emits keys
/// in sorted order. Canonical argument encoding relies on this.
pub type JsonObject = serde_json::Map<String, JsonValue>;

// =============================================================================
// Operation Type
// =============================================================================

/// The three GraphQL operation types.
///
/// Each operation type roots its normalized data under a distinct sentinel
/// key, so query data and mutation data never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    Query,
    Mutation,
    Subscription,
}

// =============================================================================
// Cache Keys
// =============================================================================

/// An opaque string uniquely identifying a normalized object in the store.
///
/// Root objects use the fixed sentinels [`CacheKey::query_root`],
/// [`CacheKey::mutation_root`], and [`CacheKey::subscription_root`].
/// Non-root keys come from the user-supplied cache-key hook when it yields
/// one, and otherwise from the response path rooted at the enclosing
/// sentinel, e.g. `QUERY_ROOT.hero.friends.0`.
///
/// # Example
///
/// ```rust
/// use normstore::CacheKey;
///
/// let root = CacheKey::query_root();
/// let hero = root.child("hero");
/// let friend = hero.child("friends").item(0);
/// assert_eq!(friend.as_str(), "QUERY_ROOT.hero.friends.0");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

/// Sentinel key for query-rooted data.
const QUERY_ROOT: &str = "QUERY_ROOT";
/// Sentinel key for mutation-rooted data.
const MUTATION_ROOT: &str = "MUTATION_ROOT";
/// Sentinel key for subscription-rooted data.
const SUBSCRIPTION_ROOT: &str = "SUBSCRIPTION_ROOT";

impl CacheKey {
    /// Creates a cache key from a string.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The root key for query data.
    pub fn query_root() -> Self {
        Self(QUERY_ROOT.to_string())
    }

    /// The root key for mutation data.
    pub fn mutation_root() -> Self {
        Self(MUTATION_ROOT.to_string())
    }

    /// The root key for subscription data.
    pub fn subscription_root() -> Self {
        Self(SUBSCRIPTION_ROOT.to_string())
    }

    /// The root key for an operation type.
    pub fn root_for(operation_type: OperationType) -> Self {
        match operation_type {
            OperationType::Query => Self::query_root(),
            OperationType::Mutation => Self::mutation_root(),
            OperationType::Subscription => Self::subscription_root(),
        }
    }

    /// Returns the string representation of this key.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Extends this key with a response-key path segment.
    pub fn child(&self, segment: &str) -> Self {
        Self(format!("{}.{}", self.0, segment))
    }

    /// Extends this key with a list index path segment.
    pub fn item(&self, index: usize) -> Self {
        Self(format!("{}.{}", self.0, index))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Formats a field-qualified changed key, `"<cacheKey>.<fieldKey>"`.
///
/// This is the granularity at which merges report changes, so a watcher of
/// `2001.name` is not woken by a write that only touched `2001.homePlanet`.
pub fn changed_key(key: &CacheKey, field_key: &str) -> String {
    format!("{}.{}", key.as_str(), field_key)
}

// =============================================================================
// References
// =============================================================================

/// A value-typed pointer to another record.
///
/// Distinct from a string scalar: a record field holding `Reference("2001")`
/// and one holding the string `"2001"` are different values, and every
/// backend must preserve that distinction on round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference(CacheKey);

impl Reference {
    /// Creates a reference to the given key.
    pub fn new(key: impl Into<CacheKey>) -> Self {
        Self(key.into())
    }

    /// The key this reference points at.
    pub fn key(&self) -> &CacheKey {
        &self.0
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-> {}", self.0)
    }
}

// =============================================================================
// Record Values
// =============================================================================

/// A value stored in a record field.
///
/// One of: a JSON scalar (null, boolean, number, string), a list of values,
/// a [`Reference`], or a list of references. Records never nest objects;
/// nested objects are always referenced.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordValue {
    Null,
    Boolean(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<RecordValue>),
    Reference(Reference),
}

impl RecordValue {
    /// Converts a JSON scalar into a record value.
    ///
    /// Returns `None` for arrays and objects: arrays are assembled
    /// element-wise by the normalizer, and objects are never stored inline.
    pub fn from_scalar_json(value: &JsonValue) -> Option<Self> {
        match value {
            JsonValue::Null => Some(RecordValue::Null),
            JsonValue::Bool(b) => Some(RecordValue::Boolean(*b)),
            JsonValue::Number(n) => Some(RecordValue::Number(n.clone())),
            JsonValue::String(s) => Some(RecordValue::String(s.clone())),
            JsonValue::Array(_) | JsonValue::Object(_) => None,
        }
    }

    /// Converts a scalar record value back into JSON.
    ///
    /// Returns `None` for lists and references; those are walked by the
    /// executor rather than copied wholesale.
    pub fn to_scalar_json(&self) -> Option<JsonValue> {
        match self {
            RecordValue::Null => Some(JsonValue::Null),
            RecordValue::Boolean(b) => Some(JsonValue::Bool(*b)),
            RecordValue::Number(n) => Some(JsonValue::Number(n.clone())),
            RecordValue::String(s) => Some(JsonValue::String(s.clone())),
            RecordValue::List(_) | RecordValue::Reference(_) => None,
        }
    }

    /// A short description of this value's shape, for error messages.
    pub fn describe(&self) -> &'static str {
        match self {
            RecordValue::Null => "null",
            RecordValue::Boolean(_) => "boolean",
            RecordValue::Number(_) => "number",
            RecordValue::String(_) => "string",
            RecordValue::List(_) => "list",
            RecordValue::Reference(_) => "reference",
        }
    }
}

impl From<Reference> for RecordValue {
    fn from(reference: Reference) -> Self {
        RecordValue::Reference(reference)
    }
}

// =============================================================================
// Records
// =============================================================================

/// A single normalized object: a mapping from field key to value.
///
/// Field keys are `<fieldName>` or `<fieldName>(<canonicalArgs>)` when
/// arguments affect identity, so two selections of the same field with
/// different arguments occupy different slots.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    fields: BTreeMap<String, RecordValue>,
}

impl Record {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style field insertion, for fixtures and cache manipulation.
    pub fn with(mut self, field_key: impl Into<String>, value: RecordValue) -> Self {
        self.fields.insert(field_key.into(), value);
        self
    }

    /// Looks up a field by its field key.
    pub fn get(&self, field_key: &str) -> Option<&RecordValue> {
        self.fields.get(field_key)
    }

    /// Inserts or overwrites a field.
    pub fn insert(&mut self, field_key: impl Into<String>, value: RecordValue) {
        self.fields.insert(field_key.into(), value);
    }

    /// Iterates fields in field-key order.
    pub fn fields(&self) -> impl Iterator<Item = (&String, &RecordValue)> {
        self.fields.iter()
    }

    /// Consumes the record, yielding its fields in field-key order.
    pub fn into_fields(self) -> impl Iterator<Item = (String, RecordValue)> {
        self.fields.into_iter()
    }

    /// Number of fields in this record.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether this record has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl FromIterator<(String, RecordValue)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, RecordValue)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

// =============================================================================
// Record Sets
// =============================================================================

/// A set of records keyed by cache key: the unit of merge input and of
/// normalization output.
///
/// Record sets are short-lived. The normalizer produces one per write, a
/// single merge consumes it, and it is discarded.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordSet {
    records: BTreeMap<CacheKey, Record>,
}

impl RecordSet {
    /// Creates an empty record set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style record insertion, for fixtures.
    pub fn with(mut self, key: impl Into<CacheKey>, record: Record) -> Self {
        self.records.insert(key.into(), record);
        self
    }

    /// Looks up a record.
    pub fn get(&self, key: &CacheKey) -> Option<&Record> {
        self.records.get(key)
    }

    /// Inserts a record, replacing any existing record wholesale.
    pub fn insert(&mut self, key: CacheKey, record: Record) {
        self.records.insert(key, record);
    }

    /// Merges a record field-wise into this set.
    ///
    /// Used when one normalization pass visits the same object twice (two
    /// selections resolving to the same cache key): later fields join the
    /// earlier record instead of replacing it.
    pub fn merge_record(&mut self, key: CacheKey, record: Record) {
        let entry = self.records.entry(key).or_default();
        for (field_key, value) in record.into_fields() {
            entry.insert(field_key, value);
        }
    }

    /// Merges every record of `other` field-wise into this set.
    pub fn merge_set(&mut self, other: RecordSet) {
        for (key, record) in other.records {
            self.merge_record(key, record);
        }
    }

    /// Iterates records in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&CacheKey, &Record)> {
        self.records.iter()
    }

    /// Consumes the set, yielding records in key order.
    pub fn into_records(self) -> impl Iterator<Item = (CacheKey, Record)> {
        self.records.into_iter()
    }

    /// Number of records in this set.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether this set has no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl FromIterator<(CacheKey, Record)> for RecordSet {
    fn from_iter<I: IntoIterator<Item = (CacheKey, Record)>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

// =============================================================================
// Record Rows
// =============================================================================

/// A stored record together with the timestamp of the merge that last
/// touched it (unix milliseconds).
///
/// Backends return rows rather than bare records so readers can compute the
/// earliest freshness across every dependency of a query.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordRow {
    /// The stored record.
    pub record: Record,
    /// Unix-millisecond timestamp of the most recent merge touching this record.
    pub last_received_at: u64,
}

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================
