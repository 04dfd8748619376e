//! Canonical JSON encoding.
//!
//! Canonical form: object keys sorted by code point, no insignificant
//! whitespace, UTF-8 output, integers within the IEEE double safe range and
//! no floats. Two servers must produce identical bytes for the same object or
//! signatures made on one will not verify on the other.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::SignatureError;

/// Largest integer representable exactly in an IEEE double.
const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

/// Fields excluded from the signed form of a key object.
const UNSIGNED_FIELDS: [&str; 2] = ["signatures", "unsigned"];

/// Encode a JSON value in canonical form.
pub fn canonical_json(value: &Value) -> Result<Vec<u8>, SignatureError> {
    let canonical = canonicalize(value)?;
    serde_json::to_vec(&canonical).map_err(|e| SignatureError::NonCanonical(e.to_string()))
}

/// Canonical bytes a signature over `object` covers.
///
/// `object` must serialize to a JSON object; its `signatures` and `unsigned`
/// fields are dropped before encoding.
pub fn signable_json<T: Serialize + ?Sized>(object: &T) -> Result<Vec<u8>, SignatureError> {
    let value =
        serde_json::to_value(object).map_err(|e| SignatureError::NonCanonical(e.to_string()))?;

    let Value::Object(mut map) = value else {
        return Err(SignatureError::NonCanonical("signed value must be a JSON object".to_string()));
    };

    for field in UNSIGNED_FIELDS {
        map.remove(field);
    }

    canonical_json(&Value::Object(map))
}

/// Rebuild `value` with sorted object keys.
///
/// Sorting explicitly keeps the output independent of whether serde_json was
/// built with `preserve_order`.
fn canonicalize(value: &Value) -> Result<Value, SignatureError> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));

            let mut sorted = Map::with_capacity(entries.len());
            for (key, item) in entries {
                sorted.insert(key.clone(), canonicalize(item)?);
            }
            Ok(Value::Object(sorted))
        },
        Value::Array(items) => {
            items.iter().map(canonicalize).collect::<Result<Vec<_>, _>>().map(Value::Array)
        },
        Value::Number(number) => {
            let in_range = number
                .as_i64()
                .map(|n| (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&n))
                .unwrap_or(false);

            if in_range {
                Ok(value.clone())
            } else {
                Err(SignatureError::NonCanonical(format!("number {number} is not a safe integer")))
            }
        },
        Value::Null | Value::Bool(_) | Value::String(_) => Ok(value.clone()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn keys_are_sorted_and_compact() {
        let value = json!({"b": 1, "a": {"d": [1, 2], "c": "x"}});
        let bytes = canonical_json(&value).unwrap();
        assert_eq!(bytes, br#"{"a":{"c":"x","d":[1,2]},"b":1}"#);
    }

    #[test]
    fn unicode_is_not_escaped() {
        let bytes = canonical_json(&json!({"name": "日本語"})).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"name":"日本語"}"#);
    }

    #[test]
    fn floats_and_large_integers_are_rejected() {
        assert!(canonical_json(&json!({"a": 1.5})).is_err());
        assert!(canonical_json(&json!({"a": 9_007_199_254_740_992_i64})).is_err());
        assert!(canonical_json(&json!({"a": -9_007_199_254_740_991_i64})).is_ok());
    }

    #[test]
    fn signable_form_drops_signatures_and_unsigned() {
        let object = json!({
            "keys": {"ed25519:abc": "k"},
            "signatures": {"@a:hs": {"ed25519:abc": "sig"}},
            "unsigned": {"device_display_name": "phone"}
        });

        assert_eq!(signable_json(&object).unwrap(), br#"{"keys":{"ed25519:abc":"k"}}"#);
    }

    #[test]
    fn signable_form_requires_object() {
        assert!(signable_json(&json!(["not", "an", "object"])).is_err());
    }
}
