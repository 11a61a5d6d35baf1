// Document bodies, version tokens and id generation

use crate::error::{CushionError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An opaque document body: field name to JSON value.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Opaque version token returned by every write.
/// Tokens change on every write to a given id; callers must not interpret them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cas(pub u64);

impl fmt::Display for Cas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Strategy for generating ids when a document is stored without one
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdStrategy {
    /// Random 128-bit token rendered as 32 lowercase hex characters
    #[default]
    Uuid,
    Ulid,
    Nanoid,
}

impl IdStrategy {
    pub fn generate(&self) -> String {
        match self {
            IdStrategy::Uuid => uuid::Uuid::new_v4().simple().to_string(),
            IdStrategy::Ulid => ulid::Ulid::new().to_string().to_lowercase(),
            IdStrategy::Nanoid => nanoid::nanoid!(),
        }
    }
}

/// Accept a JSON value as a document body, rejecting anything but an object.
pub fn into_document(value: serde_json::Value) -> Result<Document> {
    match value {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(CushionError::InvalidDocument(format!(
            "document body must be a JSON object, got {}",
            json_type_name(&other)
        ))),
    }
}

pub(crate) fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_uuid_ids_are_hex_128_bit() {
        let id = IdStrategy::Uuid.generate();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, IdStrategy::Uuid.generate());
    }

    #[test]
    fn test_ulid_and_nanoid_ids() {
        let ulid = IdStrategy::Ulid.generate();
        assert_eq!(ulid.len(), 26);
        assert_eq!(ulid, ulid.to_lowercase());

        let nano = IdStrategy::Nanoid.generate();
        assert_eq!(nano.len(), 21);
    }

    #[test]
    fn test_into_document_rejects_non_objects() {
        assert!(into_document(json!({"n": "one"})).is_ok());
        let err = into_document(json!([1, 2])).unwrap_err();
        assert!(matches!(err, CushionError::InvalidDocument(_)));
        assert!(err.to_string().contains("array"));
    }

    #[test]
    fn test_cas_display_is_fixed_width_hex() {
        assert_eq!(Cas(255).to_string(), "00000000000000ff");
    }
}
