//! Argument and result payloads as they cross the registry boundary:
//! base64 (standard alphabet) over compact JSON with sorted object keys.

use base64::{Engine as _, engine::general_purpose};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, TaskError};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WirePayload(String);

impl WirePayload {
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let value = serde_json::to_value(value)?;
        Ok(Self::from_value(value))
    }

    pub fn from_value(value: Value) -> Self {
        let json = canonicalize(value).to_string();
        Self(general_purpose::STANDARD.encode(json.as_bytes()))
    }

    /// Wraps an already encoded payload, validating it decodes to JSON.
    pub fn from_encoded(encoded: impl Into<String>) -> Result<Self> {
        let payload = Self(encoded.into());
        payload.decode_value()?;
        Ok(payload)
    }

    pub fn decode_value(&self) -> Result<Value> {
        let bytes = general_purpose::STANDARD
            .decode(self.0.as_bytes())
            .map_err(|e| TaskError::Serialization(format!("invalid base64 payload: {e}")))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.decode_value()?)?)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

/// Rebuilds every object with its keys in ascending order.
pub fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, canonicalize(value)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encoding_is_key_sorted_base64_json() {
        let payload = WirePayload::encode(&json!({"b": 2, "a": {"d": 1, "c": [3]}})).unwrap();
        let raw = general_purpose::STANDARD.decode(payload.as_str()).unwrap();
        assert_eq!(
            String::from_utf8(raw).unwrap(),
            r#"{"a":{"c":[3],"d":1},"b":2}"#
        );
    }

    #[test]
    fn equal_objects_encode_identically() {
        let left = WirePayload::encode(&json!({"x": 1, "y": "two"})).unwrap();
        let right = WirePayload::encode(&json!({"y": "two", "x": 1})).unwrap();
        assert_eq!(left, right);
    }

    #[test]
    fn rejects_garbage() {
        assert!(WirePayload::from_encoded("not base64!").is_err());
        let not_json = general_purpose::STANDARD.encode(b"{oops");
        assert!(WirePayload::from_encoded(not_json).is_err());
    }
}
