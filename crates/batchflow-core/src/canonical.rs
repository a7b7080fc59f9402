//! Canonical JSON encoding.
//!
//! The upload file format and the `custom_id` uniqueness/token-estimate
//! pipeline both depend on every request producing the *same* bytes for the
//! same logical payload (spec §4.3, §4.6 step 4, property P3). `serde_json`
//! preserves insertion order by default; we re-key through a `BTreeMap` so
//! object keys sort lexicographically regardless of client-supplied order.

use serde_json::Value;

/// Re-serialize `value` with every object's keys in sorted order and no
/// insignificant whitespace, then append a trailing newline so the result
/// is ready to use as one line of an NDJSON file.
pub fn canonicalize_payload(value: &Value) -> Vec<u8> {
    let sorted = sort_keys(value);
    let mut bytes = serde_json::to_vec(&sorted).expect("canonicalized value always serializes");
    bytes.push(b'\n');
    bytes
}

/// Same as [`canonicalize_payload`] but without the trailing newline, for
/// callers that need the canonical bytes on their own (byte-size
/// estimation, hashing).
pub fn canonicalize_value(value: &Value) -> Vec<u8> {
    let sorted = sort_keys(value);
    serde_json::to_vec(&sorted).expect("canonicalized value always serializes")
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: std::collections::BTreeMap<String, Value> =
                map.iter().map(|(k, v)| (k.clone(), sort_keys(v))).collect();
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// Rough input-token estimate used for capacity admission (spec §4.6 step
/// 4). This is intentionally simple — four bytes per token is the same
/// order-of-magnitude heuristic the corpus's tokenizer-free estimators use
/// before falling back to a real tokenizer.
pub fn estimate_input_tokens(body: &Value) -> i64 {
    let bytes = canonicalize_value(body).len() as i64;
    (bytes / 4).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonicalizing_twice_yields_equal_bytes() {
        let v = json!({"b": 1, "a": {"z": 2, "y": [3, 2, 1]}});
        assert_eq!(canonicalize_payload(&v), canonicalize_payload(&v));
    }

    #[test]
    fn key_order_does_not_affect_output() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(canonicalize_payload(&a), canonicalize_payload(&b));
    }

    #[test]
    fn output_is_newline_terminated() {
        let v = json!({"x": 1});
        let out = canonicalize_payload(&v);
        assert_eq!(*out.last().unwrap(), b'\n');
    }
}
