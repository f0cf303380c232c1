//! Key encoding for the document trees and indexes.
//!
//! All ids are big-endian so lexicographic key order matches numeric order and
//! every per-pipeline scan is a prefix scan.

use serde_json::Value;

/// Size of an encoded id.
pub const ID_SIZE: usize = 8;

/// Separator between a slug and the trailing key component.
const SLUG_TERMINATOR: u8 = 0;

/// Encode a single id.
pub fn id_key(id: u64) -> [u8; ID_SIZE] {
    id.to_be_bytes()
}

/// Decode a single id.
pub fn decode_id(bytes: &[u8]) -> Option<u64> {
    let arr: [u8; ID_SIZE] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(arr))
}

/// Record key: `[pipeline_id][record_id]`.
pub fn record_key(pipeline_id: u64, record_id: u64) -> [u8; ID_SIZE * 2] {
    let mut buf = [0u8; ID_SIZE * 2];
    buf[..ID_SIZE].copy_from_slice(&pipeline_id.to_be_bytes());
    buf[ID_SIZE..].copy_from_slice(&record_id.to_be_bytes());
    buf
}

/// Decode a record key into `(pipeline_id, record_id)`.
pub fn decode_record_key(bytes: &[u8]) -> Option<(u64, u64)> {
    if bytes.len() != ID_SIZE * 2 {
        return None;
    }
    Some((decode_id(&bytes[..ID_SIZE])?, decode_id(&bytes[ID_SIZE..])?))
}

/// Prefix shared by every record of a pipeline.
pub fn record_prefix(pipeline_id: u64) -> [u8; ID_SIZE] {
    pipeline_id.to_be_bytes()
}

/// Prefix shared by every index entry of `slug` in a pipeline:
/// `[pipeline_id][slug bytes][0]`.
pub fn slug_prefix(pipeline_id: u64, slug: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ID_SIZE + slug.len() + 1);
    buf.extend_from_slice(&pipeline_id.to_be_bytes());
    buf.extend_from_slice(slug.as_bytes());
    buf.push(SLUG_TERMINATOR);
    buf
}

/// Key-containment entry: record `record_id` holds a value under `slug`.
pub fn key_index_key(pipeline_id: u64, slug: &str, record_id: u64) -> Vec<u8> {
    let mut buf = slug_prefix(pipeline_id, slug);
    buf.extend_from_slice(&record_id.to_be_bytes());
    buf
}

/// Extract the record id from a key-containment entry.
pub fn decode_key_index_record(bytes: &[u8]) -> Option<u64> {
    if bytes.len() < ID_SIZE * 2 + 1 {
        return None;
    }
    decode_id(&bytes[bytes.len() - ID_SIZE..])
}

/// Unique index entry for a canonical value of `slug`.
pub fn unique_key(pipeline_id: u64, slug: &str, canonical: &str) -> Vec<u8> {
    let mut buf = slug_prefix(pipeline_id, slug);
    buf.extend_from_slice(blake3::hash(canonical.as_bytes()).as_bytes());
    buf
}

/// Canonical form of a value for uniqueness comparison.
///
/// Strings compare trimmed and case-insensitively, numbers by value. Blank
/// values have no canonical form and never collide.
pub fn canonical_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(format!("s:{}", trimmed.to_lowercase()))
            }
        }
        Value::Number(n) => n.as_f64().map(|f| format!("n:{}", f)),
        Value::Bool(b) => Some(format!("b:{}", b)),
        Value::Array(items) if items.is_empty() => None,
        other => Some(format!("j:{}", other)),
    }
}

/// Human-readable part of a canonical value.
pub fn canonical_display(canonical: &str) -> &str {
    canonical
        .split_once(':')
        .map(|(_, value)| value)
        .unwrap_or(canonical)
}

/// Get current timestamp in microseconds since Unix epoch.
pub fn current_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_key_ordering() {
        let a = record_key(1, 300);
        let b = record_key(2, 1);
        assert!(a < b);
        assert!(a.starts_with(&record_prefix(1)));
        assert_eq!(decode_record_key(&a), Some((1, 300)));
        assert_eq!(decode_record_key(&a[..10]), None);
    }

    #[test]
    fn test_key_index_prefix_is_exact() {
        let email = key_index_key(1, "email", 9);
        let email_address = key_index_key(1, "email_address", 9);
        let prefix = slug_prefix(1, "email");

        assert!(email.starts_with(&prefix));
        assert!(!email_address.starts_with(&prefix));
        assert_eq!(decode_key_index_record(&email), Some(9));
    }

    #[test]
    fn test_canonical_value() {
        assert_eq!(canonical_value(&json!(" Ann@Example.com ")), canonical_value(&json!("ann@example.com")));
        assert_eq!(canonical_value(&json!(1)), canonical_value(&json!(1.0)));
        assert_ne!(canonical_value(&json!("1")), canonical_value(&json!(1)));
        assert_eq!(canonical_value(&json!("  ")), None);
        assert_eq!(canonical_value(&Value::Null), None);
    }
}
