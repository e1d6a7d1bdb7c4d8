//! # Record Encoding and Decoding
//!
//! This module provides the codec between in-memory records and the JSON
//! text column the SQLite backend stores them in.
//!
//! ## Stored Format
//!
//! A record is stored as one JSON object, field keys as-is:
//!
//! ```text
//! {"__typename":"Droid","id":"2001","name":"R2-D2","friends":[{"$reference":"1000"}]}
//! ```
//!
//! References are encoded as the tagged object `{"$reference": "<key>"}`.
//! Records never contain inline objects, so the tag is unambiguous: any
//! object on the way in must be a reference tag, and anything else is a
//! corrupt row. The tagging is what lets `Reference("2001")` and the string
//! `"2001"` survive a round-trip as distinct values.

use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::types::{JsonObject, Record, RecordValue, Reference};

/// Tag key marking an encoded reference.
const REFERENCE_TAG: &str = "$reference";

// =============================================================================
// Encoding
// =============================================================================

/// Encodes a record value into its stored JSON form.
pub fn encode_value(value: &RecordValue) -> JsonValue {
    match value {
        RecordValue::Null => JsonValue::Null,
        RecordValue::Boolean(b) => JsonValue::Bool(*b),
        RecordValue::Number(n) => JsonValue::Number(n.clone()),
        RecordValue::String(s) => JsonValue::String(s.clone()),
        RecordValue::List(items) => JsonValue::Array(items.iter().map(encode_value).collect()),
        RecordValue::Reference(reference) => {
            let mut tag = JsonObject::new();
            tag.insert(
                REFERENCE_TAG.to_string(),
                JsonValue::String(reference.key().as_str().to_string()),
            );
            JsonValue::Object(tag)
        }
    }
}

/// Encodes a record into its stored JSON text.
pub fn encode_record(record: &Record) -> Result<String> {
    let mut object = JsonObject::new();
    for (field_key, value) in record.fields() {
        object.insert(field_key.clone(), encode_value(value));
    }
    Ok(serde_json::to_string(&object)?)
}

// =============================================================================
// Decoding
// =============================================================================

/// Decodes a stored JSON value back into a record value.
///
/// # Errors
///
/// Returns [`Error::Backend`] when an object is not a well-formed reference
/// tag; records never store inline objects, so that row is corrupt.
pub fn decode_value(value: JsonValue) -> Result<RecordValue> {
    match value {
        JsonValue::Null => Ok(RecordValue::Null),
        JsonValue::Bool(b) => Ok(RecordValue::Boolean(b)),
        JsonValue::Number(n) => Ok(RecordValue::Number(n)),
        JsonValue::String(s) => Ok(RecordValue::String(s)),
        JsonValue::Array(items) => {
            let decoded: Result<Vec<RecordValue>> = items.into_iter().map(decode_value).collect();
            Ok(RecordValue::List(decoded?))
        }
        JsonValue::Object(mut object) => {
            if object.len() == 1 {
                if let Some(JsonValue::String(key)) = object.remove(REFERENCE_TAG) {
                    return Ok(RecordValue::Reference(Reference::new(key)));
                }
            }
            Err(Error::Backend(
                "corrupt stored record: object value is not a reference tag".to_string(),
            ))
        }
    }
}

/// Decodes a stored JSON text back into a record.
pub fn decode_record(text: &str) -> Result<Record> {
    let value: JsonValue = serde_json::from_str(text)?;
    let object = match value {
        JsonValue::Object(object) => object,
        other => {
            return Err(Error::Backend(format!(
                "corrupt stored record: expected a JSON object, found {}",
                other
            )))
        }
    };

    object
        .into_iter()
        .map(|(field_key, value)| Ok((field_key, decode_value(value)?)))
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RecordValue;

    #[test]
    fn test_record_round_trip() {
        let record = Record::new()
            .with("__typename", RecordValue::String("Droid".into()))
            .with("id", RecordValue::String("2001".into()))
            .with("appearsIn", RecordValue::List(vec![
                RecordValue::String("NEWHOPE".into()),
                RecordValue::Null,
            ]))
            .with(
                "friends",
                RecordValue::List(vec![
                    RecordValue::Reference(Reference::new("1000")),
                    RecordValue::Reference(Reference::new("1002")),
                ]),
            );

        let text = encode_record(&record).unwrap();
        let decoded = decode_record(&text).unwrap();
        assert_eq!(decoded, record);
    }

    /// A reference and a string with the same content must stay distinct
    /// through the stored form.
    #[test]
    fn test_reference_distinction_survives() {
        let record = Record::new()
            .with("hero", RecordValue::Reference(Reference::new("2001")))
            .with("heroId", RecordValue::String("2001".into()));

        let decoded = decode_record(&encode_record(&record).unwrap()).unwrap();
        assert!(matches!(decoded.get("hero"), Some(RecordValue::Reference(_))));
        assert!(matches!(decoded.get("heroId"), Some(RecordValue::String(_))));
    }

    #[test]
    fn test_inline_object_is_corrupt() {
        let err = decode_record(r#"{"hero":{"name":"R2-D2"}}"#).unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
    }

    #[test]
    fn test_non_object_row_is_corrupt() {
        assert!(decode_record("[1,2,3]").is_err());
        assert!(decode_record("not json").is_err());
    }
}
