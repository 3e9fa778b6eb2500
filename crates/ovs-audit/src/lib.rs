//! Canonical payload hashing for the audit log, plus event payload schema
//! versioning.
//!
//! Every audit row stores a content hash of its canonicalized payload so the
//! log can be cross-checked after the fact. Canonical form: object keys
//! sorted recursively, compact separators, UTF-8.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Version stamped into event payloads that don't carry one.
pub const EVENT_SCHEMA_VERSION: i64 = 1;

/// Canonicalize JSON by sorting all object keys recursively and emitting
/// compact JSON.
pub fn canonical_json(value: &Value) -> String {
    let sorted = sort_keys(value);
    // Serialization of an already-valid Value cannot fail.
    serde_json::to_string(&sorted).unwrap_or_default()
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for key in keys {
                out.insert(key.clone(), sort_keys(&map[&key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        _ => value.clone(),
    }
}

/// SHA-256 of the canonical form, hex-encoded.
pub fn payload_hash(payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(payload).as_bytes());
    hex::encode(hasher.finalize())
}

/// Ensure a payload object carries a positive integer `schema_version`,
/// stamping [`EVENT_SCHEMA_VERSION`] when absent or invalid.
pub fn normalize_event_payload(payload: Option<Value>) -> Value {
    let mut map = match payload {
        Some(Value::Object(map)) => map,
        Some(other) => {
            // Non-object payloads are wrapped so the version slot exists.
            let mut map = serde_json::Map::new();
            map.insert("value".to_string(), other);
            map
        }
        None => serde_json::Map::new(),
    };

    let valid = map
        .get("schema_version")
        .and_then(Value::as_i64)
        .map(|v| v > 0)
        .unwrap_or(false);
    if !valid {
        map.insert("schema_version".to_string(), Value::from(EVENT_SCHEMA_VERSION));
    }
    Value::Object(map)
}

/// Read the schema version out of a payload, defaulting to the current one.
pub fn event_schema_version(payload: Option<&Value>) -> i64 {
    payload
        .and_then(|p| p.get("schema_version"))
        .and_then(Value::as_i64)
        .filter(|v| *v > 0)
        .unwrap_or(EVENT_SCHEMA_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let value = json!({"b": {"z": 1, "a": [ {"k": 2, "c": 3} ]}, "a": true});
        assert_eq!(
            canonical_json(&value),
            r#"{"a":true,"b":{"a":[{"c":3,"k":2}],"z":1}}"#
        );
    }

    #[test]
    fn payload_hash_is_order_insensitive() {
        let left = json!({"x": 1, "y": {"b": 2, "a": 3}});
        let right = json!({"y": {"a": 3, "b": 2}, "x": 1});
        assert_eq!(payload_hash(&left), payload_hash(&right));
        assert_eq!(payload_hash(&left).len(), 64);
    }

    #[test]
    fn normalize_injects_schema_version() {
        let normalized = normalize_event_payload(Some(json!({"slot_id": "preview-1"})));
        assert_eq!(normalized["schema_version"], json!(EVENT_SCHEMA_VERSION));
        assert_eq!(normalized["slot_id"], json!("preview-1"));

        let normalized = normalize_event_payload(None);
        assert_eq!(normalized, json!({"schema_version": EVENT_SCHEMA_VERSION}));
    }

    #[test]
    fn normalize_keeps_explicit_versions() {
        let normalized = normalize_event_payload(Some(json!({"schema_version": 4})));
        assert_eq!(normalized["schema_version"], json!(4));

        // Zero and negative versions are replaced.
        let normalized = normalize_event_payload(Some(json!({"schema_version": 0})));
        assert_eq!(normalized["schema_version"], json!(EVENT_SCHEMA_VERSION));
    }

    #[test]
    fn schema_version_reader_defaults() {
        assert_eq!(event_schema_version(None), EVENT_SCHEMA_VERSION);
        let payload = json!({"schema_version": 3});
        assert_eq!(event_schema_version(Some(&payload)), 3);
        let payload = json!({"schema_version": "nope"});
        assert_eq!(event_schema_version(Some(&payload)), EVENT_SCHEMA_VERSION);
    }
}
