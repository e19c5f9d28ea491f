//! Canonical-JSON hashing for cache validators.
//!
//! An ETag is the SHA-256 hex digest of the canonical JSON encoding of a
//! target-state body: object keys sorted, UTF-8, no insignificant
//! whitespace. Equal documents therefore always yield equal ETags, and the
//! hash doubles as the no-op detector for target-state writes.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Computes the canonical-JSON SHA-256 ETag of any serializable value.
///
/// # Examples
///
/// ```rust
/// use talos_core::etag::etag_of;
///
/// let a = serde_json::json!({"b": 1, "a": [1, 2]});
/// let b = serde_json::json!({"a": [1, 2], "b": 1});
/// assert_eq!(etag_of(&a).unwrap(), etag_of(&b).unwrap());
/// ```
pub fn etag_of<T: Serialize>(value: &T) -> Result<String> {
    let canonical = canonical_json(value)?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Renders a value as canonical JSON: sorted object keys, compact encoding.
///
/// Array order is preserved; it is semantic (service start order).
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)?;
    let mut out = String::new();
    write_canonical(&value, &mut out);
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            for (i, (key, val)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Object keys are strings; serializing cannot fail.
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical(val, out);
            }
            out.push('}');
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
        scalar => {
            out.push_str(&serde_json::to_string(scalar).unwrap_or_default());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{App, Service, TargetState};
    use serde_json::json;

    #[test]
    fn test_key_order_is_irrelevant() {
        let a = json!({"z": 1, "a": {"y": 2, "b": 3}});
        let b = json!({"a": {"b": 3, "y": 2}, "z": 1});
        assert_eq!(etag_of(&a).unwrap(), etag_of(&b).unwrap());
    }

    #[test]
    fn test_array_order_is_significant() {
        let a = json!({"services": [1, 2]});
        let b = json!({"services": [2, 1]});
        assert_ne!(etag_of(&a).unwrap(), etag_of(&b).unwrap());
    }

    #[test]
    fn test_different_documents_differ() {
        let a = json!({"tag": "7-alpine"});
        let b = json!({"tag": "7.2-alpine"});
        assert_ne!(etag_of(&a).unwrap(), etag_of(&b).unwrap());
    }

    #[test]
    fn test_etag_is_hex_sha256() {
        let etag = etag_of(&json!({})).unwrap();
        assert_eq!(etag.len(), 64);
        assert!(etag.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_etag_stable_across_reads() {
        let state = TargetState::new().with_app(
            App::new(1002, "cache")
                .with_service(Service::new(1, "redis").with_image("redis:7-alpine")),
        );
        assert_eq!(etag_of(&state).unwrap(), etag_of(&state).unwrap());
    }

    #[test]
    fn test_etag_changes_with_image_tag() {
        let base = TargetState::new().with_app(
            App::new(1002, "cache")
                .with_service(Service::new(1, "redis").with_image("redis:7-alpine")),
        );
        let mut bumped = base.clone();
        bumped
            .set_image_for_service(1002, 1, &crate::ImageRef::new("redis", "7.2-alpine"))
            .unwrap();
        assert_ne!(etag_of(&base).unwrap(), etag_of(&bumped).unwrap());
    }

    #[test]
    fn test_canonical_json_compact_and_sorted() {
        let rendered = canonical_json(&json!({"b": [true, null], "a": "x"})).unwrap();
        assert_eq!(rendered, r#"{"a":"x","b":[true,null]}"#);
    }
}
