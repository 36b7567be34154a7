//! Deterministic hashing for content blobs and commits.
//!
//! Canonical JSON serialization (sorted keys at every level, compact
//! separators, UTF-8 with non-ASCII preserved) feeds SHA-256 for both
//! content and commit hashes. Same input always produces the same hex
//! digest, regardless of map key ordering.
//!
//! Number formatting: integers serialize without a decimal point or
//! exponent; floats use the shortest round-trip form. Hash-relevant
//! payloads only carry integers in practice.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize a JSON value to canonical bytes.
///
/// Object keys are sorted lexicographically at every nesting level and
/// the output uses `,`/`:` separators with no extra whitespace.
pub fn canonical_json(value: &Value) -> Vec<u8> {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out.into_bytes()
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            // serde_json escapes quotes and control characters but leaves
            // non-ASCII text as raw UTF-8.
            out.push_str(&serde_json::to_string(s).expect("string serialization is infallible"));
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(
                    &serde_json::to_string(key).expect("string serialization is infallible"),
                );
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

/// SHA-256 hex digest of the canonical JSON encoding of `value`.
pub fn sha256_canonical(value: &Value) -> String {
    hex::encode(Sha256::digest(canonical_json(value)))
}

/// Compute the content hash of a payload (the payload must already carry
/// its `content_type` discriminator field).
pub fn content_hash(payload: &Value) -> String {
    sha256_canonical(payload)
}

/// Compute the commit hash from the identity-relevant commit fields.
///
/// `reply_to` is the wire name for the edit target; it is only included
/// when present so append commits keep stable hashes if the input schema
/// later gains optional fields. `parent_hash` serializes as `null` for
/// the root commit.
pub fn commit_hash(
    content_hash: &str,
    parent_hash: Option<&str>,
    content_type: &str,
    operation: &str,
    timestamp_iso: &str,
    reply_to: Option<&str>,
) -> String {
    let mut map = serde_json::Map::new();
    map.insert("content_hash".into(), Value::String(content_hash.into()));
    map.insert(
        "parent_hash".into(),
        match parent_hash {
            Some(p) => Value::String(p.into()),
            None => Value::Null,
        },
    );
    map.insert("content_type".into(), Value::String(content_type.into()));
    map.insert("operation".into(), Value::String(operation.into()));
    map.insert("timestamp_iso".into(), Value::String(timestamp_iso.into()));
    if let Some(target) = reply_to {
        map.insert("reply_to".into(), Value::String(target.into()));
    }
    sha256_canonical(&Value::Object(map))
}

/// True if `s` is a 64-character lowercase hex string.
pub fn is_full_hash(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Identical dicts in any key order must produce identical bytes.
    #[test]
    fn test_canonical_json_order_insensitive() {
        let a = json!({"b": 2, "a": 1});
        let b = json!({"a": 1, "b": 2});
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), b"{\"a\":1,\"b\":2}");
    }

    #[test]
    fn test_canonical_json_nested_sorting() {
        let v = json!({"z": {"y": 1, "x": [true, null]}, "a": "text"});
        assert_eq!(
            String::from_utf8(canonical_json(&v)).unwrap(),
            r#"{"a":"text","z":{"x":[true,null],"y":1}}"#
        );
    }

    /// Non-ASCII text is preserved as UTF-8, not escaped.
    #[test]
    fn test_canonical_json_preserves_unicode() {
        let v = json!({"text": "héllo 世界"});
        assert_eq!(
            String::from_utf8(canonical_json(&v)).unwrap(),
            "{\"text\":\"héllo 世界\"}"
        );
    }

    #[test]
    fn test_content_hash_deterministic() {
        let p1 = json!({"content_type": "dialogue", "role": "user", "text": "Hi"});
        let p2 = json!({"text": "Hi", "role": "user", "content_type": "dialogue"});
        assert_eq!(content_hash(&p1), content_hash(&p2));
        assert_eq!(content_hash(&p1).len(), 64);
    }

    /// Omitting reply_to must not hash the same as reply_to=null.
    #[test]
    fn test_commit_hash_reply_to_omitted_when_absent() {
        let with = commit_hash("c".repeat(64).as_str(), None, "dialogue", "edit", "t", Some("x"));
        let without = commit_hash("c".repeat(64).as_str(), None, "dialogue", "edit", "t", None);
        assert_ne!(with, without);
    }

    #[test]
    fn test_commit_hash_parent_null_for_root() {
        let root = commit_hash("c", None, "instruction", "append", "t", None);
        let child = commit_hash("c", Some("p"), "instruction", "append", "t", None);
        assert_ne!(root, child);
        // Recomputing yields the same digest.
        assert_eq!(root, commit_hash("c", None, "instruction", "append", "t", None));
    }

    #[test]
    fn test_is_full_hash() {
        assert!(is_full_hash(&"a".repeat(64)));
        assert!(!is_full_hash(&"a".repeat(40)));
        assert!(!is_full_hash(&"g".repeat(64)));
    }
}
