//! Canonical JSON serialization and fingerprinting.
//!
//! Every signature, fingerprint, and cross-process hash comparison in the
//! sidecar operates on exactly one byte representation: RFC 8785 (JCS)
//! canonical JSON. Object keys are sorted lexicographically at every level,
//! array order is preserved, numbers use the shortest literal, and no
//! whitespace is emitted. Two documents with the same canonical form have the
//! same fingerprint; nothing else is ever hashed or signed.
//!
//! The on-disk identity of a snapshot file is its bytes, but the canonical
//! form used for hashing is always computed over the logical object, never
//! the file bytes.

use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Predecessor hash of the first entry in any chain: 32 zero bytes, hex.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Errors produced while canonicalizing a value.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CanonicalError {
    /// The value cannot be represented in canonical JSON (for example a
    /// non-finite float or a map with non-string keys).
    #[error("canonicalization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Serializes a value into its canonical JSON form.
///
/// # Errors
///
/// Returns [`CanonicalError::Serialization`] if the value cannot be
/// represented in canonical JSON.
pub fn to_canonical_json<T: Serialize>(value: &T) -> Result<String, CanonicalError> {
    Ok(serde_jcs::to_string(value)?)
}

/// Computes the SHA-256 fingerprint of a canonical form, lowercase hex.
#[must_use]
pub fn fingerprint_hex(canonical: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Canonicalizes a value and fingerprints it in one step.
///
/// # Errors
///
/// Returns [`CanonicalError::Serialization`] if canonicalization fails.
pub fn fingerprint_value<T: Serialize>(value: &T) -> Result<String, CanonicalError> {
    Ok(fingerprint_hex(&to_canonical_json(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_sorts_keys_at_every_level() {
        let doc = serde_json::json!({
            "z": {"b": 2, "a": 1},
            "a": [3, 1, 2],
        });
        let canonical = to_canonical_json(&doc).unwrap();
        assert_eq!(canonical, r#"{"a":[3,1,2],"z":{"a":1,"b":2}}"#);
    }

    #[test]
    fn test_canonical_preserves_array_order() {
        let doc = serde_json::json!(["c", "a", "b"]);
        assert_eq!(to_canonical_json(&doc).unwrap(), r#"["c","a","b"]"#);
    }

    #[test]
    fn test_canonical_emits_no_whitespace() {
        let doc = serde_json::json!({"key": "value", "n": 1.5});
        let canonical = to_canonical_json(&doc).unwrap();
        assert!(!canonical.contains(' '));
    }

    #[test]
    fn test_same_canonical_form_same_fingerprint() {
        let a = serde_json::json!({"x": 1, "y": 2});
        let b = serde_json::json!({"y": 2, "x": 1});
        assert_eq!(
            fingerprint_value(&a).unwrap(),
            fingerprint_value(&b).unwrap()
        );
    }

    #[test]
    fn test_genesis_hash_is_32_zero_bytes_hex() {
        assert_eq!(GENESIS_HASH.len(), 64);
        assert!(GENESIS_HASH.chars().all(|c| c == '0'));
    }
}
