//! Canonical JSON and content hashing
//!
//! Every hash and signature in the engine is computed over the same canonical
//! form so that identical data always yields identical bytes:
//! - Object keys sorted lexicographically (recursively)
//! - No whitespace between tokens
//! - Strings escaped exactly as `serde_json` escapes them
//!
//! Array order is significant and preserved.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Convert JSON to canonical form (sorted keys, no whitespace)
///
/// # Examples
///
/// ```
/// use rce_common::to_canonical_json;
/// use serde_json::json;
///
/// let value = json!({"b": 1, "a": [true, null]});
/// assert_eq!(to_canonical_json(&value), r#"{"a":[true,null],"b":1}"#);
/// ```
pub fn to_canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by(|(a, _), (b, _)| a.cmp(b));
            let items: Vec<String> = pairs
                .into_iter()
                .map(|(k, v)| format!("{}:{}", escape_string(k), to_canonical_json(v)))
                .collect();
            format!("{{{}}}", items.join(","))
        }
        Value::Array(arr) => {
            let items: Vec<String> = arr.iter().map(to_canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::String(s) => escape_string(s),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
    }
}

/// Serialize any value to its canonical JSON form
pub fn canonicalize<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value).map_err(Error::Json)?;
    Ok(to_canonical_json(&value))
}

/// SHA-256 of raw bytes as 64 lowercase hex characters
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// SHA-256 of the canonical JSON form of `value`
pub fn canonical_sha256<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(sha256_hex(canonicalize(value)?.as_bytes()))
}

fn escape_string(s: &str) -> String {
    // serde_json never fails on a plain &str
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_sorts_nested_keys() {
        let value = json!({"z": {"b": 2, "a": 1}, "a": "x"});
        assert_eq!(to_canonical_json(&value), r#"{"a":"x","z":{"a":1,"b":2}}"#);
    }

    #[test]
    fn test_canonical_preserves_array_order() {
        let value = json!([3, 1, 2]);
        assert_eq!(to_canonical_json(&value), "[3,1,2]");
    }

    #[test]
    fn test_canonical_escapes_control_characters() {
        let value = json!({"k": "line\nbreak \"quoted\""});
        assert_eq!(to_canonical_json(&value), r#"{"k":"line\nbreak \"quoted\""}"#);
    }

    #[test]
    fn test_canonical_independent_of_insertion_order() {
        let mut a = serde_json::Map::new();
        a.insert("first".into(), json!(1));
        a.insert("second".into(), json!(2));
        let mut b = serde_json::Map::new();
        b.insert("second".into(), json!(2));
        b.insert("first".into(), json!(1));
        assert_eq!(
            to_canonical_json(&Value::Object(a)),
            to_canonical_json(&Value::Object(b))
        );
    }

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_canonical_sha256_is_stable() {
        let h1 = canonical_sha256(&json!({"a": 1, "b": [1, 2]})).unwrap();
        let h2 = canonical_sha256(&json!({"b": [1, 2], "a": 1})).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }
}
