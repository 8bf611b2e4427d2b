//! Signed catalog loading, verification, and hot-reload snapshots.
//!
//! Every rule set feeding the gates arrives as a signed JSON document. A
//! loader parses the document, splits off its signature, canonicalizes the
//! remaining payload, verifies the signature against the configured material,
//! normalizes the rules, and returns them together with a fingerprint and a
//! signing-mode descriptor. Once loaded, rules are immutable until the next
//! reload, which installs a whole new snapshot.
//!
//! # Document format
//!
//! A catalog is a JSON object carrying either a legacy `signature` (64 hex
//! chars, HMAC-SHA256 over the canonical payload) or a
//! `signature_v2: {kid, sig}`. The payload is the object minus both
//! signature fields.
//!
//! # Failure semantics
//!
//! A failed signature or an unparseable document fails the load. At boot
//! this is fatal; at reload the caller keeps the current in-memory snapshot
//! and surfaces the structured error to the control caller.

mod approval_policy;
mod capability;
mod connectors;
mod control_tokens;
mod destination;
mod model_registry;
mod policy;
mod pricing;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use secrecy::SecretString;
use serde_json::{Map, Value};
use thiserror::Error;

pub use approval_policy::{ApprovalPolicy, ApprovalRequirement, MAX_REQUIRED_APPROVALS};
pub use capability::{CapabilityMode, CapabilityRules, CapabilityScope};
pub use connectors::{ConnectorCatalog, ConnectorEntry, DEFAULT_DISPATCH_TIMEOUT_MS};
pub use control_tokens::{ControlToken, ControlTokens};
pub use destination::{DestinationPattern, DestinationRules, DestinationScope};
pub use model_registry::{ModelEntry, ModelModality, ModelRegistry, sign_entry};
pub use policy::PolicyRules;
pub use pricing::{ModelPrice, PricingTable, UnpricedModel};

use crate::canonical::{self, CanonicalError};
use crate::crypto::{self, KeyedSignature, Keyring};
use crate::snapshot::SnapshotCell;

/// Legacy signature field name.
const SIGNATURE_FIELD: &str = "signature";

/// Keyed signature field name.
const SIGNATURE_V2_FIELD: &str = "signature_v2";

/// Wildcard model id shared by the pricing and model-registry catalogs.
pub const WILDCARD_MODEL: &str = "*";

/// How a catalog was verified at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningMode {
    /// No verification material configured; the document was accepted as-is.
    None,
    /// Verified with a legacy static key.
    Static,
    /// Verified against a keyring.
    Keyring,
}

impl std::fmt::Display for SigningMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Static => f.write_str("static"),
            Self::Keyring => f.write_str("keyring"),
        }
    }
}

/// Verification material available to a loader.
#[derive(Clone)]
pub enum SigningMaterial {
    /// No material; documents load unverified in mode `none`.
    None,
    /// A single static secret (legacy deployments).
    Static(SecretString),
    /// A keyring; v2 signatures verify by kid, legacy signatures through
    /// the rotation path.
    Keyring(Arc<Keyring>),
}

impl std::fmt::Debug for SigningMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("SigningMaterial::None"),
            Self::Static(_) => f.write_str("SigningMaterial::Static"),
            Self::Keyring(ring) => write!(f, "SigningMaterial::Keyring({})", ring.active_kid()),
        }
    }
}

/// Errors produced while loading a catalog.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CatalogError {
    /// The catalog file could not be read.
    #[error("failed to read catalog file: {0}")]
    Io(#[from] std::io::Error),

    /// The document is not valid JSON.
    #[error("failed to parse catalog document: {0}")]
    Parse(#[from] serde_json::Error),

    /// The document is not a JSON object.
    #[error("catalog document must be a JSON object")]
    NotAnObject,

    /// The payload could not be canonicalized.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),

    /// Verification material is configured but the document is unsigned.
    #[error("catalog is unsigned but verification material is configured")]
    Unsigned,

    /// The document carries a v2 signature but no keyring is configured.
    #[error("signature_v2 requires a keyring, but only a static key is configured")]
    KeyringRequired,

    /// Signature verification failed.
    #[error("catalog signature verification failed{}", .kid.as_ref().map(|k| format!(" (kid '{k}')")).unwrap_or_default())]
    SignatureMismatch {
        /// Kid named by the document, when signed with `signature_v2`.
        kid: Option<String>,
    },

    /// The signature field is malformed.
    #[error("malformed signature field: {detail}")]
    MalformedSignature {
        /// What was wrong with the field.
        detail: String,
    },

    /// A rule in the payload failed validation.
    #[error("invalid catalog rule: {detail}")]
    Rule {
        /// What was wrong with the rule.
        detail: String,
    },

    /// Signing failed while sealing a document.
    #[error("failed to sign catalog: {0}")]
    Sign(#[from] crypto::SignError),
}

/// A loaded catalog: normalized rules plus provenance.
#[derive(Debug)]
pub struct SignedCatalog<T> {
    /// The normalized rule set.
    pub rules: T,

    /// SHA-256 of the canonical payload, lowercase hex. Published on the
    /// control-status surface for drift detection.
    pub fingerprint: String,

    /// How the document was verified.
    pub signing_mode: SigningMode,

    /// The key id that verified the document, when a keyring was used.
    pub active_kid: Option<String>,
}

/// Normalization hook implemented by each catalog's rule type.
pub trait CatalogRules: Sized {
    /// Short kind name used in logs and the control-status surface.
    const KIND: &'static str;

    /// Builds normalized rules from the verified payload.
    ///
    /// `material` is available for catalogs whose entries carry their own
    /// signatures (the model registry).
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::Rule`] when the payload violates the catalog
    /// schema.
    fn from_payload(
        payload: &Map<String, Value>,
        material: &SigningMaterial,
    ) -> Result<Self, CatalogError>;
}

/// Outcome of verifying a detached document signature.
struct VerifiedDocument {
    payload: Map<String, Value>,
    canonical: String,
    signing_mode: SigningMode,
    active_kid: Option<String>,
}

fn verify_document(raw: &str, material: &SigningMaterial) -> Result<VerifiedDocument, CatalogError> {
    let doc: Value = serde_json::from_str(raw)?;
    let Value::Object(mut payload) = doc else {
        return Err(CatalogError::NotAnObject);
    };

    let legacy = payload.remove(SIGNATURE_FIELD);
    let v2 = payload.remove(SIGNATURE_V2_FIELD);
    let canonical = canonical::to_canonical_json(&payload)?;

    let (signing_mode, active_kid) = match material {
        SigningMaterial::None => (SigningMode::None, None),
        SigningMaterial::Static(secret) => match (legacy, v2) {
            (_, Some(_)) => return Err(CatalogError::KeyringRequired),
            (Some(sig), None) => {
                let sig_hex = signature_hex(&sig)?;
                if !crypto::verify_static(&canonical, &sig_hex, secret) {
                    return Err(CatalogError::SignatureMismatch { kid: None });
                }
                (SigningMode::Static, None)
            }
            (None, None) => return Err(CatalogError::Unsigned),
        },
        SigningMaterial::Keyring(ring) => match (legacy, v2) {
            (_, Some(v2)) => {
                let sig: KeyedSignature =
                    serde_json::from_value(v2).map_err(|err| CatalogError::MalformedSignature {
                        detail: err.to_string(),
                    })?;
                if !crypto::verify_kid(&canonical, &sig, ring) {
                    return Err(CatalogError::SignatureMismatch { kid: Some(sig.kid) });
                }
                (SigningMode::Keyring, Some(sig.kid))
            }
            (Some(sig), None) => {
                // Rotation path: a legacy single-signature document is
                // accepted while any ring key still validates it.
                let sig_hex = signature_hex(&sig)?;
                let Some(kid) = crypto::verify_any(&canonical, &sig_hex, ring) else {
                    return Err(CatalogError::SignatureMismatch { kid: None });
                };
                (SigningMode::Keyring, Some(kid))
            }
            (None, None) => return Err(CatalogError::Unsigned),
        },
    };

    Ok(VerifiedDocument {
        payload,
        canonical,
        signing_mode,
        active_kid,
    })
}

fn signature_hex(value: &Value) -> Result<String, CatalogError> {
    match value {
        Value::String(sig) if sig.len() == crypto::SIGNATURE_HEX_LEN => Ok(sig.clone()),
        Value::String(sig) => Err(CatalogError::MalformedSignature {
            detail: format!(
                "expected {} hex chars, found {}",
                crypto::SIGNATURE_HEX_LEN,
                sig.len()
            ),
        }),
        _ => Err(CatalogError::MalformedSignature {
            detail: "signature must be a hex string".to_string(),
        }),
    }
}

/// Loads and verifies a catalog from a document string.
///
/// # Errors
///
/// Returns a [`CatalogError`] when parsing, verification, or rule
/// normalization fails. On reload failures the caller keeps its current
/// snapshot.
pub fn load_catalog<T: CatalogRules>(
    raw: &str,
    material: &SigningMaterial,
) -> Result<SignedCatalog<T>, CatalogError> {
    let verified = verify_document(raw, material)?;
    let rules = T::from_payload(&verified.payload, material)?;
    let fingerprint = canonical::fingerprint_hex(&verified.canonical);
    tracing::debug!(
        kind = T::KIND,
        %fingerprint,
        mode = %verified.signing_mode,
        "catalog loaded"
    );
    Ok(SignedCatalog {
        rules,
        fingerprint,
        signing_mode: verified.signing_mode,
        active_kid: verified.active_kid,
    })
}

/// Loads and verifies a catalog from a file.
///
/// # Errors
///
/// Returns a [`CatalogError`] when reading, parsing, verification, or rule
/// normalization fails.
pub fn load_catalog_file<T: CatalogRules>(
    path: &Path,
    material: &SigningMaterial,
) -> Result<SignedCatalog<T>, CatalogError> {
    load_catalog(&fs::read_to_string(path)?, material)
}

/// Seals a payload with a `signature_v2` under the keyring's active key.
///
/// Any existing signature fields are replaced. The inverse of
/// [`load_catalog`]: a sealed document loads and verifies under the same
/// keyring.
///
/// # Errors
///
/// Returns a [`CatalogError`] when canonicalization or signing fails.
pub fn sign_document(
    mut payload: Map<String, Value>,
    keyring: &Keyring,
) -> Result<Value, CatalogError> {
    payload.remove(SIGNATURE_FIELD);
    payload.remove(SIGNATURE_V2_FIELD);
    let canonical = canonical::to_canonical_json(&payload)?;
    let sig = crypto::sign(&canonical, keyring)?;
    payload.insert(SIGNATURE_V2_FIELD.to_string(), serde_json::to_value(sig)?);
    Ok(Value::Object(payload))
}

/// Seals a payload with a legacy `signature` under a static secret.
///
/// # Errors
///
/// Returns a [`CatalogError`] when canonicalization or signing fails.
pub fn sign_document_static(
    mut payload: Map<String, Value>,
    secret: &SecretString,
) -> Result<Value, CatalogError> {
    payload.remove(SIGNATURE_FIELD);
    payload.remove(SIGNATURE_V2_FIELD);
    let canonical = canonical::to_canonical_json(&payload)?;
    let sig = crypto::sign_static(&canonical, secret)?;
    payload.insert(SIGNATURE_FIELD.to_string(), Value::String(sig));
    Ok(Value::Object(payload))
}

/// Shared handle to the current snapshot of one catalog.
pub type CatalogHandle<T> = SnapshotCell<SignedCatalog<T>>;

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn ring() -> Arc<Keyring> {
        let mut keys = HashMap::new();
        keys.insert("k1".to_string(), SecretString::from("secret-one"));
        keys.insert("k2".to_string(), SecretString::from("secret-two"));
        Arc::new(Keyring::new("k1", keys).unwrap())
    }

    fn policy_payload() -> Map<String, Value> {
        let doc = serde_json::json!({
            "high_risk_tools": ["Shell"],
            "critical_patterns": ["drop table"],
            "high_risk_patterns": ["production"],
        });
        let Value::Object(map) = doc else {
            unreachable!()
        };
        map
    }

    #[test]
    fn test_signed_catalog_round_trip_under_keyring() {
        let ring = ring();
        let doc = sign_document(policy_payload(), &ring).unwrap();
        let raw = serde_json::to_string(&doc).unwrap();

        let material = SigningMaterial::Keyring(Arc::clone(&ring));
        let catalog = load_catalog::<PolicyRules>(&raw, &material).unwrap();
        assert_eq!(catalog.signing_mode, SigningMode::Keyring);
        assert_eq!(catalog.active_kid.as_deref(), Some("k1"));
        assert!(catalog.rules.critical_patterns.contains("drop table"));
    }

    #[test]
    fn test_signed_catalog_round_trip_static() {
        let secret = SecretString::from("legacy");
        let doc = sign_document_static(policy_payload(), &secret).unwrap();
        let raw = serde_json::to_string(&doc).unwrap();

        let material = SigningMaterial::Static(secret);
        let catalog = load_catalog::<PolicyRules>(&raw, &material).unwrap();
        assert_eq!(catalog.signing_mode, SigningMode::Static);
        assert!(catalog.active_kid.is_none());
    }

    #[test]
    fn test_tampered_payload_fails_verification() {
        let ring = ring();
        let doc = sign_document(policy_payload(), &ring).unwrap();
        let Value::Object(mut map) = doc else {
            unreachable!()
        };
        map.insert(
            "high_risk_tools".to_string(),
            serde_json::json!(["shell", "sudo"]),
        );
        let raw = serde_json::to_string(&Value::Object(map)).unwrap();

        let material = SigningMaterial::Keyring(ring);
        let err = load_catalog::<PolicyRules>(&raw, &material).unwrap_err();
        assert!(matches!(err, CatalogError::SignatureMismatch { .. }));
    }

    #[test]
    fn test_unsigned_document_rejected_when_material_present() {
        let raw = serde_json::to_string(&Value::Object(policy_payload())).unwrap();
        let material = SigningMaterial::Keyring(ring());
        let err = load_catalog::<PolicyRules>(&raw, &material).unwrap_err();
        assert!(matches!(err, CatalogError::Unsigned));
    }

    #[test]
    fn test_unsigned_document_loads_without_material() {
        let raw = serde_json::to_string(&Value::Object(policy_payload())).unwrap();
        let catalog = load_catalog::<PolicyRules>(&raw, &SigningMaterial::None).unwrap();
        assert_eq!(catalog.signing_mode, SigningMode::None);
    }

    #[test]
    fn test_legacy_signature_accepted_under_keyring_rotation_path() {
        let ring = ring();
        let under_k2 = Arc::new(ring.with_active("k2").unwrap());
        let secret = SecretString::from("secret-two");
        let doc = sign_document_static(policy_payload(), &secret).unwrap();
        let raw = serde_json::to_string(&doc).unwrap();

        let material = SigningMaterial::Keyring(under_k2);
        let catalog = load_catalog::<PolicyRules>(&raw, &material).unwrap();
        assert_eq!(catalog.signing_mode, SigningMode::Keyring);
        assert_eq!(catalog.active_kid.as_deref(), Some("k2"));
    }

    #[test]
    fn test_load_catalog_file_with_keyring_from_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let keyring_path = dir.path().join("keyring.json");
        std::fs::write(
            &keyring_path,
            r#"{"active_kid":"k1","keys":{"k1":"secret-one"}}"#,
        )
        .unwrap();
        let ring = Keyring::from_path(&keyring_path).unwrap();

        let catalog_path = dir.path().join("policy.json");
        let doc = sign_document(policy_payload(), &ring).unwrap();
        std::fs::write(&catalog_path, serde_json::to_string(&doc).unwrap()).unwrap();

        let material = SigningMaterial::Keyring(Arc::new(ring));
        let catalog = load_catalog_file::<PolicyRules>(&catalog_path, &material).unwrap();
        assert_eq!(catalog.signing_mode, SigningMode::Keyring);
    }

    #[test]
    fn test_fingerprint_ignores_signature_field() {
        let ring = ring();
        let signed = sign_document(policy_payload(), &ring).unwrap();
        let raw = serde_json::to_string(&signed).unwrap();
        let material = SigningMaterial::Keyring(Arc::clone(&ring));
        let loaded = load_catalog::<PolicyRules>(&raw, &material).unwrap();

        let unsigned_raw = serde_json::to_string(&Value::Object(policy_payload())).unwrap();
        let unsigned = load_catalog::<PolicyRules>(&unsigned_raw, &SigningMaterial::None).unwrap();
        assert_eq!(loaded.fingerprint, unsigned.fingerprint);
    }
}
