//! Attestation ledgers: hash-chained, signed, offline-verifiable exports.
//!
//! Three ledgers share this structure: approval decisions, audit actions,
//! and security-conformance reports. A generated payload chains its entries
//! from the genesis hash (`entry_hash = H(canonical({previous_hash, ..record
//! fields}))`), carries `generated_at`, `since`, `count`, `entries`, and
//! `final_hash`, and is signed with the keyring over the canonical form of
//! every field except `signature` and `signature_kid`.
//!
//! Verification recomputes everything and returns a structured result with
//! a precise reason naming the first offending entry; nothing here panics
//! on hostile input.

mod seal;

use std::sync::Arc;

use clawee_core::GENESIS_HASH;
use clawee_core::canonical::{self, CanonicalError};
use clawee_core::catalog::SigningMaterial;
use clawee_core::crypto::{self, KeyedSignature};
use clawee_core::invariant::InvariantRegistry;
use clawee_core::time::Clock;
use serde_json::{Map, Value};
use thiserror::Error;

pub use seal::{ChainVerification, SealEntry, export_sealed, verify_sealed_chain};

use crate::approval::{ApprovalError, ApprovalStore};
use crate::audit::{AuditError, AuditLog};

/// Field carrying the detached payload signature.
const SIGNATURE_FIELD: &str = "signature";

/// Field carrying the signing key id.
const SIGNATURE_KID_FIELD: &str = "signature_kid";

/// Errors produced while generating an attestation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AttestError {
    /// Canonicalization failed.
    #[error(transparent)]
    Canonical(#[from] CanonicalError),

    /// Signing failed.
    #[error("failed to sign attestation payload: {0}")]
    Sign(#[from] crypto::SignError),

    /// Record serialization failed.
    #[error("failed to serialize attestation record: {0}")]
    Record(#[from] serde_json::Error),

    /// The approval source failed.
    #[error(transparent)]
    Approvals(#[from] ApprovalError),

    /// The audit source failed.
    #[error(transparent)]
    Audit(#[from] AuditError),

    /// A snapshot or chain file could not be read or written.
    #[error("attestation I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of verifying a payload.
#[derive(Debug, Clone, serde::Serialize)]
pub struct VerificationReport {
    /// Whether every check passed.
    pub valid: bool,
    /// Reason for the first failure, when invalid.
    pub reason: Option<String>,
    /// Index of the first offending entry, when the failure is entry-level.
    pub entry_index: Option<usize>,
    /// Number of entries whose hashes were recomputed.
    pub entries_checked: usize,
}

impl VerificationReport {
    fn ok(entries_checked: usize) -> Self {
        Self {
            valid: true,
            reason: None,
            entry_index: None,
            entries_checked,
        }
    }

    fn fail(reason: &str, entry_index: Option<usize>, entries_checked: usize) -> Self {
        Self {
            valid: false,
            reason: Some(reason.to_string()),
            entry_index,
            entries_checked,
        }
    }
}

/// Signs attestation payloads with the configured material.
pub struct AttestationSigner {
    material: SigningMaterial,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for AttestationSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttestationSigner")
            .field("material", &self.material)
            .finish_non_exhaustive()
    }
}

impl AttestationSigner {
    /// Creates a signer.
    #[must_use]
    pub fn new(material: SigningMaterial, clock: Arc<dyn Clock>) -> Self {
        Self { material, clock }
    }

    fn now_rfc3339(&self) -> String {
        self.clock
            .now()
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    }

    /// Returns the signer's verification material.
    #[must_use]
    pub fn material(&self) -> &SigningMaterial {
        &self.material
    }

    /// Inserts the detached signature fields into a payload map.
    fn sign_into(&self, payload: &mut Map<String, Value>) -> Result<(), AttestError> {
        payload.remove(SIGNATURE_FIELD);
        payload.remove(SIGNATURE_KID_FIELD);
        let canonical = canonical::to_canonical_json(&payload)?;
        match &self.material {
            SigningMaterial::None => {}
            SigningMaterial::Static(secret) => {
                let sig = crypto::sign_static(&canonical, secret)?;
                payload.insert(SIGNATURE_FIELD.to_string(), Value::String(sig));
            }
            SigningMaterial::Keyring(ring) => {
                let KeyedSignature { kid, sig } = crypto::sign(&canonical, ring)?;
                payload.insert(SIGNATURE_FIELD.to_string(), Value::String(sig));
                payload.insert(SIGNATURE_KID_FIELD.to_string(), Value::String(kid));
            }
        }
        Ok(())
    }
}

/// Chains records into attestation entries.
///
/// Each record gains `previous_hash` (genesis for the first) and
/// `entry_hash = H(canonical(record + previous_hash))`. Returns the entries
/// and the final hash (genesis when empty).
///
/// # Errors
///
/// Returns an error when a record cannot be canonicalized.
pub fn chain_records(records: Vec<Map<String, Value>>) -> Result<(Vec<Value>, String), AttestError> {
    let mut entries = Vec::with_capacity(records.len());
    let mut previous_hash = GENESIS_HASH.to_string();

    for mut record in records {
        record.insert(
            "previous_hash".to_string(),
            Value::String(previous_hash.clone()),
        );
        let entry_hash = canonical::fingerprint_value(&record)?;
        record.insert("entry_hash".to_string(), Value::String(entry_hash.clone()));
        entries.push(Value::Object(record));
        previous_hash = entry_hash;
    }

    Ok((entries, previous_hash))
}

/// Builds and signs an attestation payload from chained records.
///
/// `extra_fields` lets a ledger add fields of its own (the conformance
/// report embeds `invariant_catalog_hash` this way); they are covered by
/// the signature like every other field.
///
/// # Errors
///
/// Returns an error when canonicalization or signing fails.
pub fn build_signed_payload(
    records: Vec<Map<String, Value>>,
    since: Option<String>,
    extra_fields: Map<String, Value>,
    signer: &AttestationSigner,
) -> Result<Value, AttestError> {
    let count = records.len();
    let (entries, final_hash) = chain_records(records)?;

    let mut payload = Map::new();
    payload.insert(
        "generated_at".to_string(),
        Value::String(signer.now_rfc3339()),
    );
    payload.insert(
        "since".to_string(),
        since.map_or(Value::Null, Value::String),
    );
    payload.insert("count".to_string(), Value::from(count));
    payload.insert("entries".to_string(), Value::Array(entries));
    payload.insert("final_hash".to_string(), Value::String(final_hash));
    for (key, value) in extra_fields {
        payload.insert(key, value);
    }

    signer.sign_into(&mut payload)?;
    Ok(Value::Object(payload))
}

/// Verifies a generated payload: entry hashes, chain links, final hash, and
/// signature.
///
/// Returns a structured report; an invalid payload names the first
/// offending entry.
#[must_use]
pub fn verify_payload(payload: &Value, material: &SigningMaterial) -> VerificationReport {
    let Value::Object(payload_map) = payload else {
        return VerificationReport::fail("Payload is not an object.", None, 0);
    };
    let Some(Value::Array(entries)) = payload_map.get("entries") else {
        return VerificationReport::fail("Payload has no entries array.", None, 0);
    };

    let mut previous_hash = GENESIS_HASH.to_string();
    for (index, entry) in entries.iter().enumerate() {
        let Value::Object(entry_map) = entry else {
            return VerificationReport::fail("Entry is not an object.", Some(index), index);
        };
        let Some(Value::String(stored_hash)) = entry_map.get("entry_hash") else {
            return VerificationReport::fail("Entry hash missing.", Some(index), index);
        };
        let Some(Value::String(stored_previous)) = entry_map.get("previous_hash") else {
            return VerificationReport::fail("Entry previous hash missing.", Some(index), index);
        };
        if *stored_previous != previous_hash {
            return VerificationReport::fail("Entry chain broken.", Some(index), index);
        }

        let mut unsigned = entry_map.clone();
        unsigned.remove("entry_hash");
        let recomputed = match canonical::fingerprint_value(&unsigned) {
            Ok(hash) => hash,
            Err(_) => {
                return VerificationReport::fail(
                    "Entry cannot be canonicalized.",
                    Some(index),
                    index,
                );
            }
        };
        if recomputed != *stored_hash {
            return VerificationReport::fail("Entry hash mismatch.", Some(index), index);
        }
        previous_hash.clone_from(stored_hash);
    }

    match payload_map.get("final_hash") {
        Some(Value::String(final_hash)) if *final_hash == previous_hash => {}
        _ => {
            return VerificationReport::fail("Final hash mismatch.", None, entries.len());
        }
    }

    let mut unsigned = payload_map.clone();
    let signature = unsigned.remove(SIGNATURE_FIELD);
    let signature_kid = unsigned.remove(SIGNATURE_KID_FIELD);
    let canonical = match canonical::to_canonical_json(&unsigned) {
        Ok(canonical) => canonical,
        Err(_) => {
            return VerificationReport::fail(
                "Payload cannot be canonicalized.",
                None,
                entries.len(),
            );
        }
    };

    let signature_ok = match material {
        SigningMaterial::None => true,
        SigningMaterial::Static(secret) => match signature {
            Some(Value::String(sig)) => crypto::verify_static(&canonical, &sig, secret),
            _ => false,
        },
        SigningMaterial::Keyring(ring) => match (signature, signature_kid) {
            (Some(Value::String(sig)), Some(Value::String(kid))) => {
                crypto::verify_kid(&canonical, &KeyedSignature { kid, sig }, ring)
            }
            // Legacy payloads signed before rotation carry a bare signature.
            (Some(Value::String(sig)), None) => {
                crypto::verify_any(&canonical, &sig, ring).is_some()
            }
            _ => false,
        },
    };
    if !signature_ok {
        return VerificationReport::fail("Signature mismatch.", None, entries.len());
    }

    VerificationReport::ok(entries.len())
}

// =============================================================================
// Ledger attestors
// =============================================================================

/// Attestation ledger over approval decisions.
pub struct ApprovalAttestor {
    store: Arc<ApprovalStore>,
    signer: AttestationSigner,
}

impl ApprovalAttestor {
    /// Creates the attestor.
    #[must_use]
    pub fn new(store: Arc<ApprovalStore>, signer: AttestationSigner) -> Self {
        Self { store, signer }
    }

    /// Generates a signed payload over approval records in stable order
    /// (`created_at` ASC, id ASC).
    ///
    /// # Errors
    ///
    /// Returns an error when the source read, canonicalization, or signing
    /// fails.
    pub fn generate(
        &self,
        limit: u32,
        since: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Value, AttestError> {
        let records = self.store.list(limit, since)?;
        let maps = records
            .iter()
            .map(|record| {
                let Value::Object(map) = serde_json::to_value(record)? else {
                    unreachable!("approval records serialize to objects")
                };
                Ok(map)
            })
            .collect::<Result<Vec<_>, serde_json::Error>>()?;
        build_signed_payload(
            maps,
            since.map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
            Map::new(),
            &self.signer,
        )
    }
}

/// Attestation ledger over audit actions.
pub struct AuditAttestor {
    log: Arc<AuditLog>,
    signer: AttestationSigner,
}

impl AuditAttestor {
    /// Creates the attestor.
    #[must_use]
    pub fn new(log: Arc<AuditLog>, signer: AttestationSigner) -> Self {
        Self { log, signer }
    }

    /// Generates a signed payload over audit actions with `seq > since`,
    /// in monotone insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error when the source read, canonicalization, or signing
    /// fails.
    pub fn generate(&self, limit: u32, since: u64) -> Result<Value, AttestError> {
        let actions = self.log.read_since(since, limit)?;
        let maps = actions
            .iter()
            .map(|action| {
                let Value::Object(map) = serde_json::to_value(action)? else {
                    unreachable!("audit actions serialize to objects")
                };
                Ok(map)
            })
            .collect::<Result<Vec<_>, serde_json::Error>>()?;
        build_signed_payload(
            maps,
            (since > 0).then(|| since.to_string()),
            Map::new(),
            &self.signer,
        )
    }
}

/// Attestation ledger over security-conformance state.
pub struct ConformanceAttestor {
    registry: Arc<InvariantRegistry>,
    signer: AttestationSigner,
}

impl ConformanceAttestor {
    /// Creates the attestor.
    #[must_use]
    pub fn new(registry: Arc<InvariantRegistry>, signer: AttestationSigner) -> Self {
        Self { registry, signer }
    }

    /// Generates a signed conformance report: one entry per invariant, with
    /// `invariant_catalog_hash` embedded so a verifier can detect catalog
    /// drift.
    ///
    /// # Errors
    ///
    /// Returns an error when canonicalization or signing fails.
    pub fn generate(&self) -> Result<Value, AttestError> {
        let maps = self
            .registry
            .snapshot()
            .iter()
            .map(|state| {
                let Value::Object(map) = serde_json::to_value(state)? else {
                    unreachable!("invariant states serialize to objects")
                };
                Ok(map)
            })
            .collect::<Result<Vec<_>, serde_json::Error>>()?;

        let mut extra = Map::new();
        extra.insert(
            "invariant_catalog_hash".to_string(),
            Value::String(InvariantRegistry::definition_hash()),
        );
        build_signed_payload(maps, None, extra, &self.signer)
    }
}

#[cfg(test)]
mod tests {
    use clawee_core::Keyring;
    use clawee_core::time::{ManualClock, SystemClock};
    use secrecy::SecretString;

    use super::*;

    fn signer() -> AttestationSigner {
        let ring = Keyring::from_json_str(r#"{"active_kid":"k1","keys":{"k1":"s1"}}"#).unwrap();
        AttestationSigner::new(
            SigningMaterial::Keyring(Arc::new(ring)),
            Arc::new(SystemClock),
        )
    }

    fn material() -> SigningMaterial {
        let ring = Keyring::from_json_str(r#"{"active_kid":"k1","keys":{"k1":"s1"}}"#).unwrap();
        SigningMaterial::Keyring(Arc::new(ring))
    }

    fn record(n: u64) -> Map<String, Value> {
        let Value::Object(map) = serde_json::json!({
            "id": format!("record-{n}"),
            "metadata": {"note": format!("payload {n}")},
        }) else {
            unreachable!()
        };
        map
    }

    #[test]
    fn test_generated_payload_verifies() {
        let payload =
            build_signed_payload(vec![record(1), record(2), record(3)], None, Map::new(), &signer())
                .unwrap();
        let report = verify_payload(&payload, &material());
        assert!(report.valid, "reason: {:?}", report.reason);
        assert_eq!(report.entries_checked, 3);
    }

    #[test]
    fn test_empty_payload_final_hash_is_genesis() {
        let payload = build_signed_payload(vec![], None, Map::new(), &signer()).unwrap();
        assert_eq!(
            payload.get("final_hash").and_then(Value::as_str),
            Some(GENESIS_HASH)
        );
        assert!(verify_payload(&payload, &material()).valid);
    }

    #[test]
    fn test_mutated_entry_detected_at_index() {
        let payload =
            build_signed_payload(vec![record(1), record(2), record(3)], None, Map::new(), &signer())
                .unwrap();
        let mut tampered = payload.clone();
        tampered["entries"][1]["metadata"]["note"] = Value::String("altered".to_string());

        let report = verify_payload(&tampered, &material());
        assert!(!report.valid);
        assert_eq!(report.reason.as_deref(), Some("Entry hash mismatch."));
        assert_eq!(report.entry_index, Some(1));
    }

    #[test]
    fn test_reordered_entries_break_chain() {
        let payload =
            build_signed_payload(vec![record(1), record(2)], None, Map::new(), &signer()).unwrap();
        let mut tampered = payload.clone();
        let entries = tampered["entries"].as_array_mut().unwrap();
        entries.swap(0, 1);

        let report = verify_payload(&tampered, &material());
        assert!(!report.valid);
        assert_eq!(report.reason.as_deref(), Some("Entry chain broken."));
        assert_eq!(report.entry_index, Some(0));
    }

    #[test]
    fn test_tampered_final_hash_detected() {
        let payload =
            build_signed_payload(vec![record(1)], None, Map::new(), &signer()).unwrap();
        let mut tampered = payload.clone();
        tampered["final_hash"] = Value::String(GENESIS_HASH.to_string());

        let report = verify_payload(&tampered, &material());
        assert!(!report.valid);
        assert_eq!(report.reason.as_deref(), Some("Final hash mismatch."));
    }

    #[test]
    fn test_tampered_top_level_field_fails_signature() {
        let payload =
            build_signed_payload(vec![record(1)], None, Map::new(), &signer()).unwrap();
        let mut tampered = payload.clone();
        tampered["generated_at"] = Value::String("2020-01-01T00:00:00.000Z".to_string());

        let report = verify_payload(&tampered, &material());
        assert!(!report.valid);
        assert_eq!(report.reason.as_deref(), Some("Signature mismatch."));
    }

    #[test]
    fn test_conformance_report_embeds_catalog_hash() {
        let registry = Arc::new(InvariantRegistry::new(Arc::new(SystemClock)));
        registry.check(clawee_core::invariant::INV_POLICY, true, None, None);
        let attestor = ConformanceAttestor::new(registry, signer());
        let payload = attestor.generate().unwrap();

        assert_eq!(
            payload.get("invariant_catalog_hash").and_then(Value::as_str),
            Some(InvariantRegistry::definition_hash().as_str())
        );
        assert_eq!(payload.get("count").and_then(Value::as_u64), Some(8));
        assert!(verify_payload(&payload, &material()).valid);
    }

    #[test]
    fn test_static_mode_payload_verifies_without_kid() {
        let secret = SecretString::from("legacy");
        let signer = AttestationSigner::new(
            SigningMaterial::Static(secret.clone()),
            Arc::new(ManualClock::at_wall_clock()),
        );
        let payload = build_signed_payload(vec![record(1)], None, Map::new(), &signer).unwrap();
        assert!(payload.get("signature_kid").is_none());
        let report = verify_payload(&payload, &SigningMaterial::Static(secret));
        assert!(report.valid);
    }
}
