//! HMAC-SHA256 signing over canonical forms.
//!
//! Signatures are 64 lowercase hex characters. Verification decodes both
//! sides to bytes and compares in constant time; a length mismatch rejects
//! before comparison. `verify_any` exists solely to accept legacy
//! single-signature documents under a keyring during rotation.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use super::keyring::Keyring;

type HmacSha256 = Hmac<Sha256>;

/// Expected length of a hex-encoded HMAC-SHA256 signature.
pub const SIGNATURE_HEX_LEN: usize = 64;

/// Errors produced while signing.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SignError {
    /// The secret could not be used as HMAC key material.
    #[error("invalid HMAC key material")]
    InvalidKey,
}

/// A v2 signature: the signing key id and the hex HMAC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyedSignature {
    /// Id of the key that produced the signature.
    pub kid: String,

    /// HMAC-SHA256 over the canonical form, lowercase hex.
    pub sig: String,
}

fn hmac_hex(canonical: &str, secret: &SecretString) -> Result<String, SignError> {
    let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
        .map_err(|_| SignError::InvalidKey)?;
    mac.update(canonical.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Compares two hex-encoded digests in constant time.
///
/// Both sides are decoded to bytes before comparison; malformed hex or a
/// length mismatch rejects without a timing-dependent compare. Used for
/// every hex-digest check in the sidecar, not just HMAC signatures.
#[must_use]
pub fn hex_eq_ct(expected_hex: &str, actual_hex: &str) -> bool {
    let Ok(expected) = hex::decode(expected_hex) else {
        return false;
    };
    let Ok(actual) = hex::decode(actual_hex) else {
        return false;
    };
    if expected.len() != actual.len() {
        return false;
    }
    expected.ct_eq(actual.as_slice()).into()
}

/// Signs a canonical form with the keyring's active key.
///
/// # Errors
///
/// Returns [`SignError::InvalidKey`] if the active secret cannot key an HMAC.
pub fn sign(canonical: &str, keyring: &Keyring) -> Result<KeyedSignature, SignError> {
    let sig = hmac_hex(canonical, keyring.active_secret())?;
    Ok(KeyedSignature {
        kid: keyring.active_kid().to_string(),
        sig,
    })
}

/// Signs a canonical form with a static secret (legacy mode).
///
/// # Errors
///
/// Returns [`SignError::InvalidKey`] if the secret cannot key an HMAC.
pub fn sign_static(canonical: &str, secret: &SecretString) -> Result<String, SignError> {
    hmac_hex(canonical, secret)
}

/// Verifies a v2 signature against the named key in the keyring.
///
/// Returns `false` for an unknown kid, unusable key material, malformed hex,
/// or a mismatched MAC. Comparison is constant time.
#[must_use]
pub fn verify_kid(canonical: &str, signature: &KeyedSignature, keyring: &Keyring) -> bool {
    let Some(secret) = keyring.secret(&signature.kid) else {
        return false;
    };
    let Ok(expected) = hmac_hex(canonical, secret) else {
        return false;
    };
    hex_eq_ct(&expected, &signature.sig)
}

/// Verifies a bare legacy signature against every key in the keyring.
///
/// Returns the id of the first (in sorted kid order) key that validates, or
/// `None`. Used only to accept legacy single-signature documents under a
/// keyring while rotation is in flight.
#[must_use]
pub fn verify_any(canonical: &str, sig_hex: &str, keyring: &Keyring) -> Option<String> {
    for kid in keyring.kids() {
        let Some(secret) = keyring.secret(kid) else {
            continue;
        };
        let Ok(expected) = hmac_hex(canonical, secret) else {
            continue;
        };
        if hex_eq_ct(&expected, sig_hex) {
            return Some(kid.to_string());
        }
    }
    None
}

/// Verifies a bare legacy signature against a static secret.
#[must_use]
pub fn verify_static(canonical: &str, sig_hex: &str, secret: &SecretString) -> bool {
    let Ok(expected) = hmac_hex(canonical, secret) else {
        return false;
    };
    hex_eq_ct(&expected, sig_hex)
}
