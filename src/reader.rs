//! # Cache Reads
//!
//! The read path: executes a selection set against stored records,
//! dereferencing references through the transaction's batched loader, and
//! materializes three artifacts in a single pass:
//!
//! - the selection-shaped result tree ([`SelectionSetMapper`]),
//! - the set of cache keys the read touched ([`DependencyTracker`]),
//! - the minimum receive timestamp across the tree ([`TimestampTracker`]).
//!
//! ```text
//!   QUERY_ROOT ── hero ──► Reference("2001") ─┐
//!                                             │ loader (one batch)
//!   "2001" ◄──────────────────────────────────┘
//!     name ──► "R2-D2"          data:      { "hero": { "name": "R2-D2" } }
//!                               depends:   { QUERY_ROOT, "2001" }
//!                               freshness: min(received timestamps)
//! ```
//!
//! Watchers use the dependency set to decide whether a later write affects
//! their result; callers use the freshness minimum to decide whether the
//! cached answer is still acceptable.

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::executor::{
    execute, zip, DeferredObject, FieldInfo, FieldResolver, ObjectInfo, ResolvedObject,
    ResolvedValue, ResultAccumulator,
};
use crate::loader::DataLoader;
use crate::selection::{GraphQLOperation, OutputType, Selection};
use crate::storage::RecordStore;
use crate::types::{now_millis, CacheKey, JsonObject, Record, RecordRow, RecordSet, RecordValue};

// =============================================================================
// Read Results
// =============================================================================

/// Where a result came from.
///
/// The cache only ever produces [`ResultSource::Cache`]; the server variant
/// exists so callers can carry fetch results through the same type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultSource {
    Cache,
    Server,
}

/// Side data about a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultMetadata {
    /// The minimum `last_received_at` across every record the read touched,
    /// i.e. the age of the staleest dependency.
    pub earliest_received_at: Option<u64>,
}

/// A fully materialized read: the result tree plus dependency metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphQLResult {
    /// The selection-shaped result data.
    pub data: JsonValue,
    /// Every cache key this read touched.
    pub dependent_keys: HashSet<CacheKey>,
    /// Where the data came from.
    pub source: ResultSource,
    /// Freshness metadata.
    pub metadata: ResultMetadata,
}

// =============================================================================
// Cache Resolver
// =============================================================================

/// Field resolver over stored records.
///
/// Scalar and list fields come straight out of the record; references
/// enqueue into the per-transaction loader and resolve after the executor's
/// single dispatch. In a read-write transaction, staged-but-unmerged records
/// overlay what the backend returns, so a body reads its own writes.
pub struct CacheResolver<'a> {
    loader: &'a DataLoader<CacheKey, Option<RecordRow>>,
    backend: &'a dyn RecordStore,
    overlay: Option<&'a RecordSet>,
}

impl<'a> CacheResolver<'a> {
    pub fn new(
        loader: &'a DataLoader<CacheKey, Option<RecordRow>>,
        backend: &'a dyn RecordStore,
        overlay: Option<&'a RecordSet>,
    ) -> Self {
        Self {
            loader,
            backend,
            overlay,
        }
    }

    /// Shapes a stored value by the field's declared type, recursing through
    /// list nesting and deferring reference targets.
    fn shape(
        &self,
        value: &RecordValue,
        declared: &OutputType,
        received_floor: u64,
        path: &str,
    ) -> Result<ResolvedValue<Record>> {
        match (declared, value) {
            (_, RecordValue::Null) => Ok(ResolvedValue::Scalar(JsonValue::Null)),
            (OutputType::Object, RecordValue::Reference(reference)) => {
                let promise = self.loader.load(reference.key().clone());
                let key = reference.key().clone();
                let path = path.to_string();
                Ok(ResolvedValue::Deferred(DeferredObject::new(async move {
                    match promise.await? {
                        Some(row) => Ok(ResolvedObject {
                            object: row.record,
                            cache_key: Some(key),
                            // Freshness of a sub-tree is the minimum along
                            // the dereference chain.
                            received_at: received_floor.min(row.last_received_at),
                        }),
                        None => Err(Error::MissingValue { path }),
                    }
                })))
            }
            (OutputType::List(inner), RecordValue::List(items)) => {
                let shaped: Result<Vec<_>> = items
                    .iter()
                    .enumerate()
                    .map(|(index, item)| {
                        self.shape(item, inner, received_floor, &format!("{}.{}", path, index))
                    })
                    .collect();
                Ok(ResolvedValue::List(shaped?))
            }
            (OutputType::Scalar, scalar) => match scalar.to_scalar_json() {
                Some(json) => Ok(ResolvedValue::Scalar(json)),
                None => Err(Error::TypeMismatch {
                    path: path.to_string(),
                    expected: "scalar",
                    found: scalar.describe().to_string(),
                }),
            },
            (declared, found) => Err(Error::TypeMismatch {
                path: path.to_string(),
                expected: declared.describe(),
                found: found.describe().to_string(),
            }),
        }
    }
}

#[async_trait]
impl FieldResolver for CacheResolver<'_> {
    type Object = Record;

    fn typename(&self, object: &Record) -> Option<String> {
        match object.get("__typename") {
            Some(RecordValue::String(name)) => Some(name.clone()),
            _ => None,
        }
    }

    fn resolve(&self, object: &Record, info: &FieldInfo) -> Result<ResolvedValue<Record>> {
        let value = object
            .get(&info.cache_key_for_field)
            .ok_or_else(|| Error::MissingValue {
                path: info.path.clone(),
            })?;
        self.shape(value, &info.field_type, info.received_at, &info.path)
    }

    /// Runs the batched backend load for everything enqueued so far and
    /// applies the staged-write overlay positionally.
    async fn dispatch_loads(&self) -> Result<()> {
        self.loader
            .dispatch(|keys| async move {
                let mut rows = self.backend.load(&keys).await?;
                if rows.len() != keys.len() {
                    return Err(Error::BatchContract {
                        expected: keys.len(),
                        actual: rows.len(),
                    });
                }
                if let Some(staged) = self.overlay {
                    apply_overlay(staged, &keys, &mut rows);
                }
                Ok(rows)
            })
            .await
    }
}

/// Overlays staged records onto loaded rows, field-wise. A staged record
/// with no stored counterpart materializes as a fresh row.
fn apply_overlay(staged: &RecordSet, keys: &[CacheKey], rows: &mut [Option<RecordRow>]) {
    for (index, key) in keys.iter().enumerate() {
        let Some(staged_record) = staged.get(key) else {
            continue;
        };
        match &mut rows[index] {
            Some(row) => {
                for (field_key, value) in staged_record.fields() {
                    row.record.insert(field_key.clone(), value.clone());
                }
            }
            None => {
                rows[index] = Some(RecordRow {
                    record: staged_record.clone(),
                    last_received_at: now_millis(),
                });
            }
        }
    }
}

// =============================================================================
// Accumulators
// =============================================================================

/// Materializes the selection-shaped result tree as JSON.
///
/// Sub-objects become nested objects keyed by response key, lists become
/// arrays, scalars are copied verbatim.
pub struct SelectionSetMapper;

impl ResultAccumulator for SelectionSetMapper {
    type Partial = JsonValue;
    type Output = JsonValue;

    fn accept_scalar(&mut self, value: &JsonValue, _info: &FieldInfo) -> Result<JsonValue> {
        Ok(value.clone())
    }

    fn accept_list(&mut self, items: Vec<JsonValue>, _info: &FieldInfo) -> Result<JsonValue> {
        Ok(JsonValue::Array(items))
    }

    fn accept_object(
        &mut self,
        fields: Vec<(&FieldInfo, JsonValue)>,
        _info: &ObjectInfo,
    ) -> Result<JsonValue> {
        let mut object = JsonObject::new();
        for (field_info, value) in fields {
            object.insert(field_info.response_key.clone(), value);
        }
        Ok(JsonValue::Object(object))
    }

    fn finish(&mut self, root: JsonValue) -> Result<JsonValue> {
        Ok(root)
    }
}

/// Accumulates the set of cache keys an executor pass touched.
#[derive(Default)]
pub struct DependencyTracker {
    keys: HashSet<CacheKey>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultAccumulator for DependencyTracker {
    type Partial = ();
    type Output = HashSet<CacheKey>;

    fn accept_scalar(&mut self, _value: &JsonValue, info: &FieldInfo) -> Result<()> {
        self.keys.insert(info.enclosing_key.clone());
        Ok(())
    }

    fn accept_list(&mut self, _items: Vec<()>, _info: &FieldInfo) -> Result<()> {
        Ok(())
    }

    fn accept_object(&mut self, _fields: Vec<(&FieldInfo, ())>, info: &ObjectInfo) -> Result<()> {
        self.keys.insert(info.cache_key.clone());
        Ok(())
    }

    fn finish(&mut self, _root: ()) -> Result<HashSet<CacheKey>> {
        Ok(std::mem::take(&mut self.keys))
    }
}

/// Propagates the minimum receive timestamp up the tree: the final value is
/// the query's freshness bound.
#[derive(Default)]
pub struct TimestampTracker {
    minimum: Option<u64>,
}

impl TimestampTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn fold(&mut self, received_at: u64) {
        self.minimum = Some(match self.minimum {
            Some(current) => current.min(received_at),
            None => received_at,
        });
    }
}

impl ResultAccumulator for TimestampTracker {
    type Partial = ();
    type Output = Option<u64>;

    fn accept_scalar(&mut self, _value: &JsonValue, info: &FieldInfo) -> Result<()> {
        self.fold(info.received_at);
        Ok(())
    }

    fn accept_list(&mut self, _items: Vec<()>, _info: &FieldInfo) -> Result<()> {
        Ok(())
    }

    fn accept_object(&mut self, _fields: Vec<(&FieldInfo, ())>, info: &ObjectInfo) -> Result<()> {
        self.fold(info.received_at);
        Ok(())
    }

    fn finish(&mut self, _root: ()) -> Result<Option<u64>> {
        Ok(self.minimum)
    }
}

// =============================================================================
// Entry Points
// =============================================================================

/// Reads a whole operation from its root key.
pub async fn read_operation(
    backend: &dyn RecordStore,
    loader: &DataLoader<CacheKey, Option<RecordRow>>,
    overlay: Option<&RecordSet>,
    operation: &GraphQLOperation,
) -> Result<GraphQLResult> {
    read_selection_set(
        backend,
        loader,
        overlay,
        &operation.selections,
        &operation.variables,
        CacheKey::root_for(operation.operation_type),
    )
    .await
}

/// Reads a selection set rooted at an arbitrary cache key.
pub async fn read_selection_set(
    backend: &dyn RecordStore,
    loader: &DataLoader<CacheKey, Option<RecordRow>>,
    overlay: Option<&RecordSet>,
    selections: &[Selection],
    variables: &JsonObject,
    root_key: CacheKey,
) -> Result<GraphQLResult> {
    let resolver = CacheResolver::new(loader, backend, overlay);

    // The root record goes through the loader too, so a reference back to
    // the root later in the same transaction reuses this fetch.
    let root_promise = loader.load(root_key.clone());
    resolver.dispatch_loads().await?;
    let root_row = root_promise.await?.ok_or_else(|| Error::MissingValue {
        path: root_key.to_string(),
    })?;

    let mut accumulator = zip(
        SelectionSetMapper,
        zip(DependencyTracker::new(), TimestampTracker::new()),
    );
    let (data, (dependent_keys, earliest_received_at)) = execute(
        &resolver,
        selections,
        &root_row.record,
        root_key,
        variables,
        root_row.last_received_at,
        &mut accumulator,
    )
    .await?;

    Ok(GraphQLResult {
        data,
        dependent_keys,
        source: ResultSource::Cache,
        metadata: ResultMetadata {
            earliest_received_at,
        },
    })
}

// =============================================================================
// Tests
// =============================================================================
