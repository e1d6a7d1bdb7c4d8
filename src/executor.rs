//! # Selection-Set Executor
//!
//! The executor walks a selection set against an object and feeds what it
//! finds to a pluggable accumulator. The same traversal drives two opposite
//! jobs:
//!
//! - **Normalization**: the object is a response payload; the accumulator
//!   emits normalized records.
//! - **Reading**: the object is a stored record; references are dereferenced
//!   through the batched loader and the accumulator materializes the result
//!   tree, the dependency set, and the freshness minimum.
//!
//! ```text
//!                    ┌────────────┐
//!   selections ────► │  executor  │ ──► accumulator hooks
//!   object ────────► │            │       accept_scalar / accept_list /
//!   resolver ──────► │  (walks)   │       accept_object / finish
//!                    └────────────┘
//! ```
//!
//! ## Batching Discipline
//!
//! For one object, the executor resolves every selected field first, which
//! enqueues all reference loads without awaiting any of them, then flushes
//! the loader exactly once, then completes field values. Dereferencing a
//! list of N references therefore costs one batched backend call.
//!
//! ## Fragments
//!
//! Inline fragments and fragment spreads with a type condition contribute
//! their fields only when the object's `__typename` matches the condition.
//! A non-matching spread contributes nothing; it is not an error.
//! Unconditioned fragments always merge. Fields with the same response key
//! merge their sub-selection sets.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::selection::{field_cache_key, resolve_arguments, Field, OutputType, Selection};
use crate::types::{CacheKey, JsonObject};

// =============================================================================
// Execution Info
// =============================================================================

/// Execution-time description of one merged field, handed to resolvers and
/// accumulator hooks.
#[derive(Debug, Clone)]
pub struct FieldInfo {
    /// The key this field occupies in the response (alias or name).
    pub response_key: String,
    /// The schema field name.
    pub field_name: String,
    /// Arguments resolved against the operation's variables, canonical order.
    pub arguments: JsonObject,
    /// The key this field occupies in a record: name plus canonical args.
    pub cache_key_for_field: String,
    /// The declared shape of the field's value.
    pub field_type: OutputType,
    /// Cache key of the object this field belongs to.
    pub enclosing_key: CacheKey,
    /// Receive timestamp in effect for this field's value (unix millis).
    pub received_at: u64,
    /// Dotted response path from the operation root, for error messages.
    pub path: String,
}

/// Execution-time description of one completed object.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    /// The object's cache key (identity-derived or path-derived).
    pub cache_key: CacheKey,
    /// The object's `__typename`, when present.
    pub typename: Option<String>,
    /// Receive timestamp in effect for this object's sub-tree.
    pub received_at: u64,
}

// =============================================================================
// Resolved Values
// =============================================================================

/// An object produced by a resolver: the raw object to recurse into, its
/// identity key when one is known, and the receive timestamp governing its
/// sub-tree.
pub struct ResolvedObject<O> {
    pub object: O,
    /// `Some` when identity is known (a dereferenced record, or the
    /// cache-key hook yielded one); `None` falls back to a path-derived key.
    pub cache_key: Option<CacheKey>,
    pub received_at: u64,
}

/// An object that is still being fetched.
///
/// Read-path resolvers hand these out for references: the loader promise is
/// already enqueued, and awaiting happens only after the executor's single
/// dispatch for the enclosing object.
pub struct DeferredObject<O> {
    future: BoxFuture<'static, Result<ResolvedObject<O>>>,
}

impl<O> DeferredObject<O> {
    /// Wraps a pending fetch.
    pub fn new(
        future: impl std::future::Future<Output = Result<ResolvedObject<O>>> + Send + 'static,
    ) -> Self {
        Self {
            future: future.boxed(),
        }
    }

    async fn resolve(self) -> Result<ResolvedObject<O>> {
        self.future.await
    }
}

/// A field value as produced by a resolver, before completion against the
/// field's declared type.
pub enum ResolvedValue<O> {
    /// A leaf value, including null.
    Scalar(JsonValue),
    /// A list, completed element-wise.
    List(Vec<ResolvedValue<O>>),
    /// An object that is already on hand (normalize path).
    Object(ResolvedObject<O>),
    /// An object pending a batched load (read path).
    Deferred(DeferredObject<O>),
}

/// A short description of a JSON value's shape, for error messages.
pub(crate) fn describe_json(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "list",
        JsonValue::Object(_) => "object",
    }
    .to_string()
}

// =============================================================================
// Field Resolver
// =============================================================================

/// The executor's view of where field values come from.
///
/// The normalize path implements this over response payload objects; the
/// read path implements it over stored records, routing references through
/// the transaction's loader.
#[async_trait]
pub trait FieldResolver: Sync {
    /// The object type this resolver walks.
    type Object: Send + Sync;

    /// The object's `__typename`, used for fragment type conditions.
    fn typename(&self, object: &Self::Object) -> Option<String>;

    /// Produces the value of one field.
    ///
    /// Must not await: reference fetches are enqueued into the loader and
    /// returned as [`ResolvedValue::Deferred`], to be awaited only after
    /// [`dispatch_loads`](Self::dispatch_loads).
    fn resolve(
        &self,
        object: &Self::Object,
        info: &FieldInfo,
    ) -> Result<ResolvedValue<Self::Object>>;

    /// Flushes every load enqueued by `resolve`. Invoked exactly once per
    /// executed object, after all of its fields have been resolved.
    async fn dispatch_loads(&self) -> Result<()>;
}

// =============================================================================
// Result Accumulator
// =============================================================================

/// A pluggable visitor driven by the executor; produces one artifact per
/// pass (a record set, a result tree, a dependency set, a freshness bound).
///
/// `Partial` is the accumulator's intermediate value for one completed
/// field or object; `Output` is the artifact [`finish`](Self::finish)
/// produces from the root partial.
pub trait ResultAccumulator: Send {
    type Partial: Send;
    type Output;

    /// A leaf value (including explicit null) at `info`.
    fn accept_scalar(&mut self, value: &JsonValue, info: &FieldInfo) -> Result<Self::Partial>;

    /// A completed list for the field at `info`.
    fn accept_list(&mut self, items: Vec<Self::Partial>, info: &FieldInfo)
        -> Result<Self::Partial>;

    /// A completed object: one partial per selected field, in field order.
    fn accept_object(
        &mut self,
        fields: Vec<(&FieldInfo, Self::Partial)>,
        info: &ObjectInfo,
    ) -> Result<Self::Partial>;

    /// Converts the root partial into the pass's artifact.
    fn finish(&mut self, root: Self::Partial) -> Result<Self::Output>;
}

/// Zips two accumulators so one executor pass produces both artifacts.
pub struct ZipAccumulator<A, B> {
    first: A,
    second: B,
}

/// Pairs two accumulators; their finals come back as a tuple.
pub fn zip<A, B>(first: A, second: B) -> ZipAccumulator<A, B> {
    ZipAccumulator { first, second }
}

impl<A, B> ResultAccumulator for ZipAccumulator<A, B>
where
    A: ResultAccumulator,
    B: ResultAccumulator,
{
    type Partial = (A::Partial, B::Partial);
    type Output = (A::Output, B::Output);

    fn accept_scalar(&mut self, value: &JsonValue, info: &FieldInfo) -> Result<Self::Partial> {
        Ok((
            self.first.accept_scalar(value, info)?,
            self.second.accept_scalar(value, info)?,
        ))
    }

    fn accept_list(
        &mut self,
        items: Vec<Self::Partial>,
        info: &FieldInfo,
    ) -> Result<Self::Partial> {
        let mut first_items = Vec::with_capacity(items.len());
        let mut second_items = Vec::with_capacity(items.len());
        for (a, b) in items {
            first_items.push(a);
            second_items.push(b);
        }
        Ok((
            self.first.accept_list(first_items, info)?,
            self.second.accept_list(second_items, info)?,
        ))
    }

    fn accept_object(
        &mut self,
        fields: Vec<(&FieldInfo, Self::Partial)>,
        info: &ObjectInfo,
    ) -> Result<Self::Partial> {
        let mut first_fields = Vec::with_capacity(fields.len());
        let mut second_fields = Vec::with_capacity(fields.len());
        for (field_info, (a, b)) in fields {
            first_fields.push((field_info, a));
            second_fields.push((field_info, b));
        }
        Ok((
            self.first.accept_object(first_fields, info)?,
            self.second.accept_object(second_fields, info)?,
        ))
    }

    fn finish(&mut self, root: Self::Partial) -> Result<Self::Output> {
        let (a, b) = root;
        Ok((self.first.finish(a)?, self.second.finish(b)?))
    }
}

// =============================================================================
// Execution
// =============================================================================

/// Executes a selection set against an object rooted at `cache_key` and
/// returns the accumulator's artifact.
pub async fn execute<R, A>(
    resolver: &R,
    selections: &[Selection],
    object: &R::Object,
    cache_key: CacheKey,
    variables: &JsonObject,
    first_received_at: u64,
    accumulator: &mut A,
) -> Result<A::Output>
where
    R: FieldResolver,
    A: ResultAccumulator,
{
    let selection_refs: Vec<&Selection> = selections.iter().collect();
    let root = execute_selection_set(
        resolver,
        selection_refs,
        object,
        cache_key,
        String::new(),
        variables,
        first_received_at,
        accumulator,
    )
    .await?;
    accumulator.finish(root)
}

/// One field after fragment resolution and response-key merging.
struct MergedField<'s> {
    field: &'s Field,
    /// Sub-selections merged from every occurrence of this response key.
    sub_selections: Vec<&'s Selection>,
}

/// Groups selections into concrete fields: fragments are resolved against
/// the object's `__typename` and duplicate response keys merge their
/// sub-selection sets. First-occurrence order is preserved.
fn collect_fields<'s>(
    selections: &[&'s Selection],
    typename: Option<&str>,
    merged: &mut Vec<MergedField<'s>>,
    by_response_key: &mut HashMap<String, usize>,
) {
    for selection in selections {
        match selection {
            Selection::Field(field) => {
                let response_key = field.response_key();
                if let Some(&index) = by_response_key.get(response_key) {
                    merged[index].sub_selections.extend(field.selection_set.iter());
                } else {
                    by_response_key.insert(response_key.to_string(), merged.len());
                    merged.push(MergedField {
                        field,
                        sub_selections: field.selection_set.iter().collect(),
                    });
                }
            }
            Selection::FragmentSpread(spread) => {
                if type_condition_matches(spread.fragment.type_condition.as_deref(), typename) {
                    let nested: Vec<&Selection> = spread.fragment.selections.iter().collect();
                    collect_fields(&nested, typename, merged, by_response_key);
                }
            }
            Selection::InlineFragment(inline) => {
                if type_condition_matches(inline.type_condition.as_deref(), typename) {
                    let nested: Vec<&Selection> = inline.selections.iter().collect();
                    collect_fields(&nested, typename, merged, by_response_key);
                }
            }
        }
    }
}

/// An unconditioned fragment always applies; a conditioned one applies only
/// to a matching `__typename`.
fn type_condition_matches(condition: Option<&str>, typename: Option<&str>) -> bool {
    match condition {
        None => true,
        Some(wanted) => typename == Some(wanted),
    }
}

/// Executes a selection set on one object and returns its partial.
///
/// Resolution and completion are two phases: every field resolves (enqueuing
/// reference loads) before the single `dispatch_loads` flush, and completion
/// follows in field order so accumulator output stays deterministic.
#[allow(clippy::too_many_arguments)]
fn execute_selection_set<'a, R, A>(
    resolver: &'a R,
    selections: Vec<&'a Selection>,
    object: &'a R::Object,
    cache_key: CacheKey,
    path: String,
    variables: &'a JsonObject,
    first_received_at: u64,
    accumulator: &'a mut A,
) -> BoxFuture<'a, Result<A::Partial>>
where
    R: FieldResolver,
    A: ResultAccumulator,
{
    async move {
        let typename = resolver.typename(object);

        let mut merged = Vec::new();
        let mut by_response_key = HashMap::new();
        collect_fields(&selections, typename.as_deref(), &mut merged, &mut by_response_key);

        // Phase 1: resolve every field. Reference loads enqueue here.
        let mut entries = Vec::with_capacity(merged.len());
        for MergedField { field, sub_selections } in merged {
            let arguments = resolve_arguments(&field.arguments, variables)?;
            let cache_key_for_field = field_cache_key(&field.name, &arguments);
            let field_path = if path.is_empty() {
                field.response_key().to_string()
            } else {
                format!("{}.{}", path, field.response_key())
            };
            let info = FieldInfo {
                response_key: field.response_key().to_string(),
                field_name: field.name.clone(),
                arguments,
                cache_key_for_field,
                field_type: field.field_type.clone(),
                enclosing_key: cache_key.clone(),
                received_at: first_received_at,
                path: field_path,
            };
            let resolved = resolver.resolve(object, &info)?;
            entries.push((info, sub_selections, resolved));
        }

        // Phase 2: one flush for this object's whole batch of loads.
        resolver.dispatch_loads().await?;

        // Phase 3: complete values in field order.
        let mut infos = Vec::with_capacity(entries.len());
        let mut partials = Vec::with_capacity(entries.len());
        for (info, sub_selections, resolved) in entries {
            let fallback_key = cache_key.child(&info.response_key);
            let partial = complete_value(
                resolver,
                &info,
                &info.field_type,
                resolved,
                &sub_selections,
                fallback_key,
                info.path.clone(),
                variables,
                accumulator,
            )
            .await?;
            infos.push(info);
            partials.push(partial);
        }

        let object_info = ObjectInfo {
            cache_key,
            typename,
            received_at: first_received_at,
        };
        let fields: Vec<(&FieldInfo, A::Partial)> = infos.iter().zip(partials).collect();
        accumulator.accept_object(fields, &object_info)
    }
    .boxed()
}

/// Completes one resolved value against its declared shape, recursing into
/// lists and sub-selection sets.
#[allow(clippy::too_many_arguments)]
fn complete_value<'a, R, A>(
    resolver: &'a R,
    info: &'a FieldInfo,
    declared: &'a OutputType,
    value: ResolvedValue<R::Object>,
    sub_selections: &'a [&'a Selection],
    fallback_key: CacheKey,
    path: String,
    variables: &'a JsonObject,
    accumulator: &'a mut A,
) -> BoxFuture<'a, Result<A::Partial>>
where
    R: FieldResolver,
    A: ResultAccumulator,
{
    async move {
        // A deferred object is resolved here, strictly after the enclosing
        // object's dispatch, then completed like any other object.
        let value = match value {
            ResolvedValue::Deferred(deferred) => ResolvedValue::Object(deferred.resolve().await?),
            other => other,
        };

        match value {
            // Explicit null satisfies any declared shape and is preserved.
            ResolvedValue::Scalar(JsonValue::Null) => {
                accumulator.accept_scalar(&JsonValue::Null, info)
            }
            ResolvedValue::Scalar(scalar) => match declared {
                OutputType::Scalar => accumulator.accept_scalar(&scalar, info),
                other => Err(Error::TypeMismatch {
                    path,
                    expected: other.describe(),
                    found: describe_json(&scalar),
                }),
            },
            ResolvedValue::List(items) => match declared {
                OutputType::List(inner) => {
                    let mut partials = Vec::with_capacity(items.len());
                    for (index, item) in items.into_iter().enumerate() {
                        let partial = complete_value(
                            resolver,
                            info,
                            inner,
                            item,
                            sub_selections,
                            fallback_key.item(index),
                            format!("{}.{}", path, index),
                            variables,
                            accumulator,
                        )
                        .await?;
                        partials.push(partial);
                    }
                    accumulator.accept_list(partials, info)
                }
                other => Err(Error::TypeMismatch {
                    path,
                    expected: other.describe(),
                    found: "list".to_string(),
                }),
            },
            ResolvedValue::Object(resolved) => match declared {
                OutputType::Object => {
                    let child_key = resolved.cache_key.clone().unwrap_or(fallback_key);
                    execute_selection_set(
                        resolver,
                        sub_selections.to_vec(),
                        &resolved.object,
                        child_key,
                        path,
                        variables,
                        resolved.received_at,
                        accumulator,
                    )
                    .await
                }
                other => Err(Error::TypeMismatch {
                    path,
                    expected: other.describe(),
                    found: "object".to_string(),
                }),
            },
            ResolvedValue::Deferred(_) => unreachable!("deferred values are resolved above"),
        }
    }
    .boxed()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::{FragmentDefinition, FragmentSpread, InlineFragment};
    use std::sync::Arc;

    fn name_field() -> Selection {
        Field::new("name", OutputType::Scalar).into_selection()
    }

    fn collect(selections: &[Selection], typename: Option<&str>) -> Vec<String> {
        let refs: Vec<&Selection> = selections.iter().collect();
        let mut merged = Vec::new();
        let mut index = HashMap::new();
        collect_fields(&refs, typename, &mut merged, &mut index);
        merged
            .into_iter()
            .map(|m| m.field.response_key().to_string())
            .collect()
    }

    #[test]
    fn test_inline_fragment_requires_matching_typename() {
        let selections = vec![
            name_field(),
            Selection::InlineFragment(InlineFragment::on(
                "Human",
                vec![Field::new("homePlanet", OutputType::Scalar).into_selection()],
            )),
        ];

        assert_eq!(collect(&selections, Some("Human")), vec!["name", "homePlanet"]);
        assert_eq!(collect(&selections, Some("Droid")), vec!["name"]);
        assert_eq!(collect(&selections, None), vec!["name"]);
    }

    #[test]
    fn test_unconditional_fragments_always_merge() {
        let fragment = Arc::new(FragmentDefinition::new(
            "CharacterName",
            None,
            vec![name_field()],
        ));
        let selections = vec![
            Field::new("id", OutputType::Scalar).into_selection(),
            Selection::FragmentSpread(FragmentSpread::new(fragment)),
            Selection::InlineFragment(InlineFragment::unconditional(vec![Field::new(
                "appearsIn",
                OutputType::list_of(OutputType::Scalar),
            )
            .into_selection()])),
        ];

        assert_eq!(collect(&selections, None), vec!["id", "name", "appearsIn"]);
    }

    #[test]
    fn test_duplicate_response_keys_merge_sub_selections() {
        let selections = vec![
            Field::new("hero", OutputType::Object)
                .with_selections(vec![name_field()])
                .into_selection(),
            Field::new("hero", OutputType::Object)
                .with_selections(vec![Field::new("id", OutputType::Scalar).into_selection()])
                .into_selection(),
        ];

        let refs: Vec<&Selection> = selections.iter().collect();
        let mut merged = Vec::new();
        let mut index = HashMap::new();
        collect_fields(&refs, None, &mut merged, &mut index);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].sub_selections.len(), 2);
    }

    /// A minimal accumulator pair for exercising the zip combinator.
    struct CountScalars(usize);
    impl ResultAccumulator for CountScalars {
        type Partial = ();
        type Output = usize;
        fn accept_scalar(&mut self, _: &JsonValue, _: &FieldInfo) -> Result<()> {
            self.0 += 1;
            Ok(())
        }
        fn accept_list(&mut self, _: Vec<()>, _: &FieldInfo) -> Result<()> {
            Ok(())
        }
        fn accept_object(&mut self, _: Vec<(&FieldInfo, ())>, _: &ObjectInfo) -> Result<()> {
            Ok(())
        }
        fn finish(&mut self, _: ()) -> Result<usize> {
            Ok(self.0)
        }
    }

    #[test]
    fn test_zip_fans_out_to_both_accumulators() {
        let mut zipped = zip(CountScalars(0), CountScalars(10));
        let info = FieldInfo {
            response_key: "name".into(),
            field_name: "name".into(),
            arguments: JsonObject::new(),
            cache_key_for_field: "name".into(),
            field_type: OutputType::Scalar,
            enclosing_key: CacheKey::new("2001"),
            received_at: 0,
            path: "name".into(),
        };

        let partial = zipped.accept_scalar(&JsonValue::Bool(true), &info).unwrap();
        let (a, b) = zipped.finish(partial).unwrap();
        assert_eq!((a, b), (1, 11));
    }
}
