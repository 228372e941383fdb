//! Content hashing for change detection
//!
//! Payloads are hashed over their *canonical* serialization: object keys
//! sorted at every depth and compact separators. Two payloads that differ
//! only in key order therefore hash to the same digest.

use crate::error::{CommonError, Result};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Canonical bytes of a JSON document together with their SHA-256 digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalJson {
    bytes: Vec<u8>,
    hash: String,
}

impl CanonicalJson {
    /// Serialize `value` canonically and hash the result
    pub fn from_value(value: &Value) -> Result<Self> {
        let bytes = serde_json::to_vec(&sort_keys(value))?;
        let hash = sha256_hex(&bytes);
        Ok(Self { bytes, hash })
    }

    /// Parse raw bytes and canonicalize them
    pub fn from_slice(raw: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(raw)?;
        Self::from_value(&value)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Lowercase hex SHA-256 of [`Self::bytes`]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn into_parts(self) -> (Vec<u8>, String) {
        (self.bytes, self.hash)
    }
}

/// Rebuild `value` with every object's keys in ascending order.
///
/// Does not rely on `serde_json`'s default `BTreeMap` backing, which flips to
/// insertion order as soon as any crate in the graph enables `preserve_order`.
fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            let mut sorted = Map::with_capacity(entries.len());
            for (key, inner) in entries {
                sorted.insert(key.clone(), sort_keys(inner));
            }
            Value::Object(sorted)
        },
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// SHA-256 of a byte slice as lowercase hex
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compute the SHA-256 checksum of a file
pub fn compute_file_checksum(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    compute_checksum(&mut file)
}

/// Compute the SHA-256 checksum of any readable source
pub fn compute_checksum<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Verify that a file's checksum matches `expected`
pub fn verify_file_checksum(path: impl AsRef<Path>, expected: &str) -> Result<()> {
    let actual = compute_file_checksum(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(CommonError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    #[test]
    fn test_compute_checksum_sha256() {
        let mut cursor = Cursor::new(b"hello world");
        let checksum = compute_checksum(&mut cursor).unwrap();
        assert_eq!(checksum, "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9");
    }

    #[test]
    fn test_canonical_bytes_sort_nested_keys() {
        let value = json!({"b": [2, 1.5], "a": {"y": null, "x": true}});
        let canonical = CanonicalJson::from_value(&value).unwrap();

        assert_eq!(canonical.bytes(), br#"{"a":{"x":true,"y":null},"b":[2,1.5]}"#);
        assert_eq!(
            canonical.hash(),
            "0d3f34cf98af8a0bae567f7b7912c00e3d6098a3e9bb71812fd004a59ec516f4"
        );
    }

    #[test]
    fn test_key_order_does_not_change_hash() {
        let first = CanonicalJson::from_slice(br#"{"prices": [[1, 2.0]], "id": "btc"}"#).unwrap();
        let second =
            CanonicalJson::from_slice(br#"{ "id": "btc",  "prices": [[1, 2.0]] }"#).unwrap();
        assert_eq!(first.hash(), second.hash());

        let changed = CanonicalJson::from_slice(br#"{"id": "btc", "prices": [[1, 2.5]]}"#).unwrap();
        assert_ne!(first.hash(), changed.hash());
    }

    #[test]
    fn test_array_order_is_significant() {
        let first = CanonicalJson::from_value(&json!([1, 2])).unwrap();
        let second = CanonicalJson::from_value(&json!([2, 1])).unwrap();
        assert_ne!(first.hash(), second.hash());
    }

    #[test]
    fn test_invalid_json_is_rejected() {
        let err = CanonicalJson::from_slice(b"{not json").unwrap_err();
        assert!(matches!(err, CommonError::Serialization(_)));
    }

    #[test]
    fn test_verify_file_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.json");
        let canonical = CanonicalJson::from_value(&json!({"k": 1})).unwrap();
        std::fs::write(&path, canonical.bytes()).unwrap();

        verify_file_checksum(&path, canonical.hash()).unwrap();

        let err = verify_file_checksum(&path, "deadbeef").unwrap_err();
        assert!(matches!(err, CommonError::ChecksumMismatch { .. }));
    }
}
