//! Fuzz target for canonical JSON encoding
//!
//! Signatures are computed over canonical JSON, so two servers must produce
//! byte-identical output for the same value.
//!
//! # Strategy
//!
//! - Arbitrary bytes parsed as JSON (most rejected by the parser)
//! - Valid documents with floats, deep nesting, escapes and unicode
//!
//! # Invariants
//!
//! - Canonical output re-parses to the same value
//! - Canonicalization is idempotent (canonical of canonical is identical)
//! - Floats and integers beyond 2^53 are rejected, never silently rounded
//! - NEVER panic on any parsed value

#![no_main]

use keyward_crypto::canonical_json;
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

/// Largest integer representable exactly in an IEEE double.
const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

fn has_unsafe_number(value: &Value) -> bool {
    match value {
        Value::Number(n) => !n.as_i64().is_some_and(|n| (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&n)),
        Value::Array(items) => items.iter().any(has_unsafe_number),
        Value::Object(map) => map.values().any(has_unsafe_number),
        _ => false,
    }
}

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<Value>(data) else {
        return;
    };

    match canonical_json(&value) {
        Ok(canonical) => {
            assert!(!has_unsafe_number(&value), "float or huge integer accepted");

            let reparsed: Value =
                serde_json::from_slice(&canonical).expect("canonical JSON must parse");
            assert_eq!(reparsed, value, "canonical JSON changed the value");

            let again = canonical_json(&reparsed).expect("canonical JSON must re-encode");
            assert_eq!(again, canonical, "canonicalization not idempotent");
        },
        Err(_) => {
            assert!(has_unsafe_number(&value), "value with safe integers rejected");
        },
    }
});
