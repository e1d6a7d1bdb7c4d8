//! # Response Normalization
//!
//! Turns a GraphQL response payload into a [`RecordSet`] by executing the
//! operation's selection set against the payload with a record-emitting
//! accumulator.
//!
//! Per field: the field key lands in the current record under the current
//! cache key. Sub-objects emit a [`Reference`] at the parent's field plus a
//! record of their own; lists of sub-objects emit lists of references;
//! scalars are copied verbatim. Explicit `null` is written as null, never
//! omitted.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::executor::{
    execute, FieldInfo, FieldResolver, ObjectInfo, ResolvedObject, ResolvedValue, ResultAccumulator,
};
use crate::selection::{OutputType, Selection};
use crate::types::{now_millis, CacheKey, JsonObject, Record, RecordSet, RecordValue, Reference};

/// The cache-key hook: given a raw response object, yields its identity key
/// (commonly the `id` field), or `None` to fall back to path-derived keys.
///
/// Installed once at store construction and treated as read-only.
pub type CacheKeyResolverFn = dyn Fn(&JsonObject) -> Option<String> + Send + Sync;

// =============================================================================
// Payload Resolver
// =============================================================================

/// Field resolver over raw response payload objects.
///
/// Looks fields up by response key and stamps every value with the
/// normalization pass's timestamp.
pub struct PayloadResolver {
    cache_key_resolver: Option<Arc<CacheKeyResolverFn>>,
    received_at: u64,
}

impl PayloadResolver {
    pub fn new(cache_key_resolver: Option<Arc<CacheKeyResolverFn>>, received_at: u64) -> Self {
        Self {
            cache_key_resolver,
            received_at,
        }
    }

    /// Shapes a payload value by the field's declared type, recursing
    /// through list nesting.
    fn shape(
        &self,
        value: &JsonValue,
        declared: &OutputType,
        path: &str,
    ) -> Result<ResolvedValue<JsonObject>> {
        match (declared, value) {
            (_, JsonValue::Null) => Ok(ResolvedValue::Scalar(JsonValue::Null)),
            (OutputType::List(inner), JsonValue::Array(items)) => {
                let shaped: Result<Vec<_>> = items
                    .iter()
                    .enumerate()
                    .map(|(index, item)| self.shape(item, inner, &format!("{}.{}", path, index)))
                    .collect();
                Ok(ResolvedValue::List(shaped?))
            }
            (OutputType::Object, JsonValue::Object(object)) => {
                let cache_key = self
                    .cache_key_resolver
                    .as_ref()
                    .and_then(|resolve| resolve(object))
                    .map(CacheKey::new);
                Ok(ResolvedValue::Object(ResolvedObject {
                    object: object.clone(),
                    cache_key,
                    received_at: self.received_at,
                }))
            }
            (OutputType::Scalar, scalar)
                if !matches!(scalar, JsonValue::Array(_) | JsonValue::Object(_)) =>
            {
                Ok(ResolvedValue::Scalar(scalar.clone()))
            }
            (declared, found) => Err(Error::TypeMismatch {
                path: path.to_string(),
                expected: declared.describe(),
                found: crate::executor::describe_json(found),
            }),
        }
    }
}

#[async_trait]
impl FieldResolver for PayloadResolver {
    type Object = JsonObject;

    fn typename(&self, object: &JsonObject) -> Option<String> {
        object
            .get("__typename")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
    }

    fn resolve(&self, object: &JsonObject, info: &FieldInfo) -> Result<ResolvedValue<JsonObject>> {
        let value = object.get(&info.response_key).ok_or_else(|| Error::MissingValue {
            path: info.path.clone(),
        })?;
        self.shape(value, &info.field_type, &info.path)
    }

    /// The payload is already on hand; nothing to flush.
    async fn dispatch_loads(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Record Set Builder
// =============================================================================

/// Accumulator that emits a [`RecordSet`].
///
/// Object completion writes the object's record (fields keyed by field key)
/// and hands a [`Reference`] up to the parent. Two selections resolving to
/// the same cache key merge field-wise into one record.
#[derive(Default)]
pub struct RecordSetBuilder {
    records: RecordSet,
}

impl RecordSetBuilder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultAccumulator for RecordSetBuilder {
    type Partial = RecordValue;
    type Output = RecordSet;

    fn accept_scalar(&mut self, value: &JsonValue, info: &FieldInfo) -> Result<RecordValue> {
        RecordValue::from_scalar_json(value).ok_or_else(|| Error::TypeMismatch {
            path: info.path.clone(),
            expected: "scalar",
            found: "object".to_string(),
        })
    }

    fn accept_list(&mut self, items: Vec<RecordValue>, _info: &FieldInfo) -> Result<RecordValue> {
        Ok(RecordValue::List(items))
    }

    fn accept_object(
        &mut self,
        fields: Vec<(&FieldInfo, RecordValue)>,
        info: &ObjectInfo,
    ) -> Result<RecordValue> {
        let mut record = Record::new();
        for (field_info, value) in fields {
            record.insert(field_info.cache_key_for_field.clone(), value);
        }
        self.records.merge_record(info.cache_key.clone(), record);
        Ok(RecordValue::Reference(Reference::new(info.cache_key.clone())))
    }

    fn finish(&mut self, _root: RecordValue) -> Result<RecordSet> {
        Ok(std::mem::take(&mut self.records))
    }
}

// =============================================================================
// Entry Point
// =============================================================================

/// Normalizes a response payload into the record set for one operation,
/// rooted at `root_key`.
pub async fn normalize_response(
    data: &JsonObject,
    selections: &[Selection],
    variables: &JsonObject,
    root_key: CacheKey,
    cache_key_resolver: Option<Arc<CacheKeyResolverFn>>,
) -> Result<RecordSet> {
    let received_at = now_millis();
    let resolver = PayloadResolver::new(cache_key_resolver, received_at);
    let mut builder = RecordSetBuilder::new();
    execute(
        &resolver,
        selections,
        data,
        root_key,
        variables,
        received_at,
        &mut builder,
    )
    .await
}

// =============================================================================
// Tests
// =============================================================================
