//! # Selection Sets
//!
//! This module models the statically declared shape of a GraphQL operation:
//! fields, fragment spreads, and type-conditioned inline fragments. A code
//! generator would normally emit these structures; the builders here give
//! hand-written callers and tests the same vocabulary.
//!
//! ## Field Keys
//!
//! Two selections of the same field with different arguments are different
//! cache entries. The field key encodes that:
//!
//! ```text
//! hero                      ->  "hero"
//! hero(episode: $ep)        ->  "hero({\"episode\":\"JEDI\"})"   with ep = "JEDI"
//! ```
//!
//! Argument objects are canonicalized with sorted keys at every nesting
//! level, so the same arguments always produce the same field key no matter
//! how the query spelled them.

use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::types::JsonObject;

// =============================================================================
// Declared Output Types
// =============================================================================

/// The declared shape of a field's value, as far as the cache needs to know.
///
/// Nullability is not modeled here: an explicit `null` is a legal value for
/// any shape, and schema validation happened at codegen time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputType {
    /// A leaf value: null, boolean, number, or string.
    Scalar,
    /// An object completed by the field's sub-selection set.
    Object,
    /// A list of the inner shape, completed element-wise.
    List(Box<OutputType>),
}

impl OutputType {
    /// Convenience constructor for a list of the given inner shape.
    pub fn list_of(inner: OutputType) -> Self {
        OutputType::List(Box::new(inner))
    }

    /// The name of this shape, for error messages.
    pub fn describe(&self) -> &'static str {
        match self {
            OutputType::Scalar => "scalar",
            OutputType::Object => "object",
            OutputType::List(_) => "list",
        }
    }
}

// =============================================================================
// Input Values & Arguments
// =============================================================================

/// A field argument value as declared in the operation.
///
/// Values are literal JSON, variable references, or composites of both.
#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    /// A literal scalar, including null.
    Scalar(JsonValue),
    /// A reference to an operation variable, `$name`.
    Variable(String),
    /// A list of input values.
    List(Vec<InputValue>),
    /// An input object; keys are canonicalized at resolution time.
    Object(Vec<(String, InputValue)>),
}

impl InputValue {
    /// Resolves this value against the operation's variables.
    pub fn resolve(&self, variables: &JsonObject) -> Result<JsonValue> {
        match self {
            InputValue::Scalar(v) => Ok(v.clone()),
            InputValue::Variable(name) => variables
                .get(name)
                .cloned()
                .ok_or_else(|| Error::UndefinedVariable { name: name.clone() }),
            InputValue::List(items) => {
                let resolved: Result<Vec<JsonValue>> =
                    items.iter().map(|item| item.resolve(variables)).collect();
                Ok(JsonValue::Array(resolved?))
            }
            InputValue::Object(entries) => {
                // serde_json::Map is BTree-backed, so insertion order does
                // not matter: serialization is always key-sorted.
                let mut map = JsonObject::new();
                for (key, value) in entries {
                    map.insert(key.clone(), value.resolve(variables)?);
                }
                Ok(JsonValue::Object(map))
            }
        }
    }
}

/// A named argument on a field.
#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    pub name: String,
    pub value: InputValue,
}

/// Resolves a field's arguments against the operation's variables into a
/// canonical (key-sorted) JSON object.
pub fn resolve_arguments(arguments: &[Argument], variables: &JsonObject) -> Result<JsonObject> {
    let mut resolved = JsonObject::new();
    for argument in arguments {
        resolved.insert(argument.name.clone(), argument.value.resolve(variables)?);
    }
    Ok(resolved)
}

/// Computes the field key for a field with the given resolved arguments:
/// `<fieldName>` when there are none, `<fieldName>(<sortedArgsJSON>)`
/// otherwise.
pub fn field_cache_key(field_name: &str, arguments: &JsonObject) -> String {
    if arguments.is_empty() {
        field_name.to_string()
    } else {
        let canonical =
            serde_json::to_string(arguments).expect("argument values are plain JSON");
        format!("{}({})", field_name, canonical)
    }
}

// =============================================================================
// Selections
// =============================================================================

/// One node of a selection set.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// A concrete field.
    Field(Field),
    /// A spread of a named fragment.
    FragmentSpread(FragmentSpread),
    /// An inline fragment, optionally conditioned on a concrete type.
    InlineFragment(InlineFragment),
}

/// A field selection: name, optional alias, arguments, declared shape, and
/// sub-selections for object-shaped fields.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub alias: Option<String>,
    pub field_type: OutputType,
    pub arguments: Vec<Argument>,
    pub selection_set: Vec<Selection>,
}

impl Field {
    /// Creates a field selection with no alias, arguments, or sub-selections.
    pub fn new(name: impl Into<String>, field_type: OutputType) -> Self {
        Self {
            name: name.into(),
            alias: None,
            field_type,
            arguments: Vec::new(),
            selection_set: Vec::new(),
        }
    }

    /// Sets the response alias.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Adds an argument.
    pub fn with_argument(mut self, name: impl Into<String>, value: InputValue) -> Self {
        self.arguments.push(Argument {
            name: name.into(),
            value,
        });
        self
    }

    /// Sets the sub-selection set.
    pub fn with_selections(mut self, selections: Vec<Selection>) -> Self {
        self.selection_set = selections;
        self
    }

    /// The key this field occupies in the response: alias if present,
    /// otherwise the field name.
    pub fn response_key(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Wraps this field as a [`Selection`].
    pub fn into_selection(self) -> Selection {
        Selection::Field(self)
    }
}

/// A named, reusable selection set with an optional type condition.
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentDefinition {
    pub name: String,
    pub type_condition: Option<String>,
    pub selections: Vec<Selection>,
}

impl FragmentDefinition {
    pub fn new(
        name: impl Into<String>,
        type_condition: Option<String>,
        selections: Vec<Selection>,
    ) -> Self {
        Self {
            name: name.into(),
            type_condition,
            selections,
        }
    }
}

/// A use of a named fragment inside a selection set.
///
/// Fragments are shared between every spread site, so the definition lives
/// behind an `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentSpread {
    pub fragment: Arc<FragmentDefinition>,
}

impl FragmentSpread {
    pub fn new(fragment: Arc<FragmentDefinition>) -> Self {
        Self { fragment }
    }
}

/// An anonymous fragment, optionally conditioned on a concrete type.
///
/// A conditioned fragment contributes its fields only when the object's
/// `__typename` matches the condition; an unconditioned fragment always
/// contributes.
#[derive(Debug, Clone, PartialEq)]
pub struct InlineFragment {
    pub type_condition: Option<String>,
    pub selections: Vec<Selection>,
}

impl InlineFragment {
    pub fn on(type_condition: impl Into<String>, selections: Vec<Selection>) -> Self {
        Self {
            type_condition: Some(type_condition.into()),
            selections,
        }
    }

    pub fn unconditional(selections: Vec<Selection>) -> Self {
        Self {
            type_condition: None,
            selections,
        }
    }
}

// =============================================================================
// Operations
// =============================================================================

/// A GraphQL operation as the cache consumes it: an operation type, a
/// statically declared selection set, and the variable values for this
/// execution.
///
/// Operations are normally emitted by a code generator; the cache treats
/// them as opaque values and never validates them against a schema.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphQLOperation {
    pub operation_type: crate::types::OperationType,
    pub selections: Vec<Selection>,
    pub variables: JsonObject,
}

impl GraphQLOperation {
    /// Creates an operation with no variables.
    pub fn new(operation_type: crate::types::OperationType, selections: Vec<Selection>) -> Self {
        Self {
            operation_type,
            selections,
            variables: JsonObject::new(),
        }
    }

    /// Sets the variable values for this execution.
    pub fn with_variables(mut self, variables: JsonObject) -> Self {
        self.variables = variables;
        self
    }
}

// =============================================================================
// Tests
// =============================================================================
