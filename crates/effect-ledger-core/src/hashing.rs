use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::ids::ContentId;
use crate::GovernanceError;

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Serializes `value` with object keys sorted recursively and no whitespace.
///
/// # Errors
/// Returns [`GovernanceError::Validation`] if a scalar fails to serialize.
pub fn canonical_json(value: &Value) -> Result<String, GovernanceError> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut String) -> Result<(), GovernanceError> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (index, key) in keys.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&scalar_json(&Value::String(key.clone()))?);
                out.push(':');
                if let Some(inner) = map.get(key) {
                    write_canonical(inner, out)?;
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar_json(scalar)?),
    }
    Ok(())
}

fn scalar_json(value: &Value) -> Result<String, GovernanceError> {
    serde_json::to_string(value)
        .map_err(|err| GovernanceError::Validation(format!("failed to encode JSON: {err}")))
}

/// SHA-256 over the canonical JSON encoding of `value`.
///
/// # Errors
/// Returns [`GovernanceError::Validation`] if encoding fails.
pub fn hash_json(value: &Value) -> Result<String, GovernanceError> {
    Ok(hash_bytes(canonical_json(value)?.as_bytes()))
}

#[must_use]
pub fn content_id_for_bytes(bytes: &[u8]) -> ContentId {
    ContentId::from_hex(&hash_bytes(bytes))
}

/// Content id of the canonical encoding of `value`.
///
/// # Errors
/// Returns [`GovernanceError::Validation`] if encoding fails.
pub fn content_id_for_json(value: &Value) -> Result<ContentId, GovernanceError> {
    Ok(content_id_for_bytes(canonical_json(value)?.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let value = json!({"b": 1, "a": {"z": [3, {"y": 1, "x": 2}], "c": "s"}});
        assert_eq!(
            must_ok(canonical_json(&value)),
            r#"{"a":{"c":"s","z":[3,{"x":2,"y":1}]},"b":1}"#
        );
    }

    #[test]
    fn content_id_ignores_key_order() {
        let first = must_ok(content_id_for_json(&json!({"a": 1, "b": 2})));
        let second = must_ok(content_id_for_json(&json!({"b": 2, "a": 1})));
        assert_eq!(first, second);
        assert!(first.as_str().starts_with("sha256:"));
        assert_eq!(first.digest().len(), 64);
    }
}
