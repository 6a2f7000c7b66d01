//! Raw record model and canonical content hashing
//!
//! A [`RawRecord`] is the immutable unit of ingestion: an opaque structured
//! payload plus a content checksum computed over a canonical serialization.
//! The checksum is the deduplication key of the raw store, so the canonical
//! form must be stable across loaders, platforms and runs:
//!
//! - object keys are sorted bytewise
//! - strings are Unicode NFC normalized
//! - no insignificant whitespace

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

/// Where a raw record came from: source file plus line or byte offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    /// Path of the source file
    pub file_path: String,
    /// 1-based line number, or record offset for block formats
    pub line_no: u64,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file_path, self.line_no)
    }
}

/// An immutable raw record as produced by a source loader.
///
/// Created once at ingest, never mutated, never deleted. The `checksum`
/// is unique across the raw store; duplicates are discarded at insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    /// Logical source identifier (e.g. "wiktionary-en")
    pub source_id: String,
    /// Opaque structured payload (nested maps/lists of strings and numbers)
    pub payload: Value,
    /// SHA-256 over the canonical serialization of `payload`, hex encoded
    pub checksum: String,
    /// File and line/offset this record was read from
    pub origin: Origin,
}

impl RawRecord {
    /// Build a record, computing the canonical checksum of the payload.
    pub fn new(source_id: impl Into<String>, payload: Value, origin: Origin) -> Self {
        let checksum = payload_checksum(&payload);
        Self {
            source_id: source_id.into(),
            payload,
            checksum,
            origin,
        }
    }

    /// Canonical bytes of this record's payload.
    ///
    /// Two payloads are duplicates exactly when their canonical bytes match.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        canonical_bytes(&self.payload)
    }
}

/// Hex-encoded SHA-256 of the canonical serialization of a payload.
pub fn payload_checksum(payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_bytes(payload));
    hex_encode(&hasher.finalize())
}

/// Canonical serialization of a JSON value.
///
/// Stable key order and NFC strings; the output is itself valid JSON.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(b) => out.extend_from_slice(if *b { b"true" } else { b"false" }),
        Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::String(s) => write_canonical_string(s, out),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        Value::Object(map) => {
            // serde_json's default map preserves insertion order; canonical
            // form requires bytewise key order regardless of how the loader
            // assembled the object.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical_string(key, out);
                out.push(b':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push(b'}');
        }
    }
}

fn write_canonical_string(s: &str, out: &mut Vec<u8>) {
    let normalized: String = s.nfc().collect();
    // serde_json string escaping is deterministic
    let quoted = serde_json::to_string(&normalized).expect("string serialization is infallible");
    out.extend_from_slice(quoted.as_bytes());
}

/// Lowercase hex encoding of a digest.
pub fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_checksum_independent_of_key_order() {
        let a = json!({"word": "father", "lang_code": "en"});
        let b = json!({"lang_code": "en", "word": "father"});
        assert_eq!(payload_checksum(&a), payload_checksum(&b));
    }

    #[test]
    fn test_checksum_nfc_normalizes_strings() {
        // "é" composed vs decomposed
        let composed = json!({ "word": "caf\u{00e9}" });
        let decomposed = json!({ "word": "cafe\u{0301}" });
        assert_eq!(payload_checksum(&composed), payload_checksum(&decomposed));
    }

    #[test]
    fn test_checksum_differs_for_different_payloads() {
        let a = json!({"word": "father"});
        let b = json!({"word": "mother"});
        assert_ne!(payload_checksum(&a), payload_checksum(&b));
    }

    #[test]
    fn test_canonical_bytes_are_valid_json() {
        let v = json!({"b": [1, 2.5, null], "a": {"nested": true}});
        let bytes = canonical_bytes(&v);
        let reparsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(reparsed, v);
    }

    #[test]
    fn test_origin_display() {
        let origin = Origin {
            file_path: "data/en.jsonl".to_string(),
            line_no: 42,
        };
        assert_eq!(origin.to_string(), "data/en.jsonl:42");
    }
}
