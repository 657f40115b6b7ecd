//! Content hash of a service definition
//!
//! The definition is written out in a canonical form (object keys sorted,
//! array order kept) and digested with SHA-256. Object members whose value is
//! `null` or an empty object carry no configuration and are left out, so
//! `labels:` with no body hashes the same as no `labels` at all.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hex SHA-256 of the canonical encoding of `value`
pub fn config_hash(value: &Value) -> String {
    let mut canonical = String::new();
    encode(value, &mut canonical);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn is_noop(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.values().all(is_noop),
        _ => false,
    }
}

fn encode(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map
                .iter()
                .filter(|(_, v)| !is_noop(v))
                .map(|(k, _)| k)
                .collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                encode_string(key, out);
                out.push(':');
                encode(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                encode(item, out);
            }
            out.push(']');
        }
        Value::String(s) => encode_string(s, out),
        other => out.push_str(&other.to_string()),
    }
}

fn encode_string(s: &str, out: &mut String) {
    // JSON string escaping keeps keys and values unambiguous
    out.push_str(&Value::String(s.to_string()).to_string());
}
