//! Content digests over canonical JSON.
//!
//! Every digest in the crate (context refs, ledger entry digests, prompt
//! digests, tool-call input digests, bundle manifests) is SHA-256 over a
//! canonical JSON rendering: object keys sorted recursively, compact
//! separators. Two structurally equal values always digest identically
//! regardless of the key order they were built with.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// SHA-256 of raw bytes as lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let out = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for byte in out {
        use std::fmt::Write;
        // Writing to a String cannot fail.
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Recursively sort object keys so serialization order is deterministic.
///
/// `serde_json::Map` preserves insertion order by default; rebuilding each
/// object from a sorted key list yields a canonical form.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                if let Some(v) = map.get(key) {
                    sorted.insert(key.clone(), canonicalize(v));
                }
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Digest a JSON value: canonicalize, serialize compactly, SHA-256 hex.
pub fn digest_value(value: &Value) -> String {
    let canonical = canonicalize(value);
    let encoded = serde_json::to_string(&canonical).unwrap_or_default();
    sha256_hex(encoded.as_bytes())
}

/// Digest an arbitrary string (prompts, file contents).
pub fn digest_text(text: &str) -> String {
    sha256_hex(text.as_bytes())
}
