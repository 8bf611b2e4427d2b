//! Sealed snapshot export and chain-log verification.
//!
//! A sealed export writes the payload to a snapshot file (pretty JSON with
//! a trailing newline), then appends one seal line to a JSONL chain log.
//! Each seal links to its predecessor through `previous_snapshot_hash`, so
//! the whole chain re-verifies offline from the genesis hash. The snapshot
//! must exist on disk before its seal line is appended.
//!
//! The identity of a snapshot file is its bytes; the canonical form used
//! for hashing is computed over the logical object, never the file bytes.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use clawee_core::GENESIS_HASH;
use clawee_core::canonical;
use clawee_core::catalog::SigningMaterial;
use clawee_core::crypto::{self, KeyedSignature};
use serde_json::{Map, Value};

use super::{AttestError, AttestationSigner, verify_payload};

/// One line of a chain log.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SealEntry {
    /// When the seal was appended.
    pub sealed_at: String,
    /// Path of the sealed snapshot file.
    pub snapshot_path: String,
    /// Canonical hash of the snapshot payload.
    pub payload_hash: String,
    /// `current_snapshot_hash` of the preceding seal, or genesis.
    pub previous_snapshot_hash: String,
    /// `generated_at` copied from the payload.
    pub generated_at: String,
    /// Canonical hash over every seal field except itself and the
    /// signature fields.
    pub current_snapshot_hash: String,
    /// Detached signature over the sealed fields, when signing material is
    /// configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Key id of the signature, in keyring mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature_kid: Option<String>,
}

/// Outcome of verifying a chain log.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChainVerification {
    /// Whether every seal verified.
    pub valid: bool,
    /// Number of seal lines verified.
    pub entries: usize,
    /// Reason for the first failure, when invalid.
    pub reason: Option<String>,
    /// One-based line number of the first offending seal.
    pub line: Option<usize>,
}

impl ChainVerification {
    fn fail(reason: String, line: usize, entries: usize) -> Self {
        Self {
            valid: false,
            entries,
            reason: Some(reason),
            line: Some(line),
        }
    }
}

fn seal_base_map(
    sealed_at: &str,
    snapshot_path: &str,
    payload_hash: &str,
    previous_snapshot_hash: &str,
    generated_at: &str,
) -> Map<String, Value> {
    let mut base = Map::new();
    base.insert("sealed_at".to_string(), Value::String(sealed_at.to_string()));
    base.insert(
        "snapshot_path".to_string(),
        Value::String(snapshot_path.to_string()),
    );
    base.insert(
        "payload_hash".to_string(),
        Value::String(payload_hash.to_string()),
    );
    base.insert(
        "previous_snapshot_hash".to_string(),
        Value::String(previous_snapshot_hash.to_string()),
    );
    base.insert(
        "generated_at".to_string(),
        Value::String(generated_at.to_string()),
    );
    base
}

/// Reads the tail seal of a chain log, if the file exists and is non-empty.
fn chain_tail(chain_path: &Path) -> Result<Option<SealEntry>, AttestError> {
    if !chain_path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(chain_path)?;
    let Some(last_line) = contents.lines().filter(|l| !l.trim().is_empty()).last() else {
        return Ok(None);
    };
    Ok(Some(serde_json::from_str(last_line)?))
}

/// Writes a snapshot file and appends its seal to the chain log.
///
/// Exports against the same chain path must be serialized by the caller;
/// the chain log is single-writer.
///
/// # Errors
///
/// Returns an error when the snapshot cannot be written, the chain tail
/// cannot be read, or signing fails.
pub fn export_sealed(
    payload: &Value,
    snapshot_path: &Path,
    chain_path: &Path,
    signer: &AttestationSigner,
) -> Result<SealEntry, AttestError> {
    // Snapshot first: the seal line must never reference a missing file.
    let pretty = serde_json::to_string_pretty(payload)?;
    fs::write(snapshot_path, format!("{pretty}\n"))?;

    let payload_hash = canonical::fingerprint_value(payload)?;
    let previous_snapshot_hash =
        chain_tail(chain_path)?.map_or_else(|| GENESIS_HASH.to_string(), |s| s.current_snapshot_hash);
    let generated_at = payload
        .get("generated_at")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let sealed_at = signer.now_rfc3339();

    let base = seal_base_map(
        &sealed_at,
        &snapshot_path.display().to_string(),
        &payload_hash,
        &previous_snapshot_hash,
        &generated_at,
    );
    let current_snapshot_hash = canonical::fingerprint_value(&base)?;

    let mut signed = base;
    signed.insert(
        "current_snapshot_hash".to_string(),
        Value::String(current_snapshot_hash.clone()),
    );
    let signed_canonical = canonical::to_canonical_json(&signed)?;
    let (signature, signature_kid) = match signer.material() {
        SigningMaterial::None => (None, None),
        SigningMaterial::Static(secret) => {
            (Some(crypto::sign_static(&signed_canonical, secret)?), None)
        }
        SigningMaterial::Keyring(ring) => {
            let KeyedSignature { kid, sig } = crypto::sign(&signed_canonical, ring)?;
            (Some(sig), Some(kid))
        }
    };

    let seal = SealEntry {
        sealed_at,
        snapshot_path: snapshot_path.display().to_string(),
        payload_hash,
        previous_snapshot_hash,
        generated_at,
        current_snapshot_hash,
        signature,
        signature_kid,
    };

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(chain_path)?;
    let line = serde_json::to_string(&seal)?;
    writeln!(file, "{line}")?;
    Ok(seal)
}

/// Verifies a chain log line by line.
///
/// Each seal must hash to its own `current_snapshot_hash` and link to the
/// previous seal. With `open_snapshots`, every referenced snapshot file is
/// read, its payload hash compared, and the payload itself re-verified.
#[must_use]
pub fn verify_sealed_chain(
    chain_path: &Path,
    material: &SigningMaterial,
    open_snapshots: bool,
) -> ChainVerification {
    let contents = match fs::read_to_string(chain_path) {
        Ok(contents) => contents,
        Err(err) => {
            return ChainVerification {
                valid: false,
                entries: 0,
                reason: Some(format!("Chain log unreadable: {err}.")),
                line: None,
            };
        }
    };

    let mut previous = GENESIS_HASH.to_string();
    let mut entries = 0usize;

    for (index, raw_line) in contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .enumerate()
    {
        let line_no = index + 1;
        let seal: SealEntry = match serde_json::from_str(raw_line) {
            Ok(seal) => seal,
            Err(err) => {
                return ChainVerification::fail(
                    format!("Seal line unparseable: {err}."),
                    line_no,
                    entries,
                );
            }
        };

        if seal.previous_snapshot_hash != previous {
            return ChainVerification::fail("Seal chain broken.".to_string(), line_no, entries);
        }

        let base = seal_base_map(
            &seal.sealed_at,
            &seal.snapshot_path,
            &seal.payload_hash,
            &seal.previous_snapshot_hash,
            &seal.generated_at,
        );
        let recomputed = match canonical::fingerprint_value(&base) {
            Ok(hash) => hash,
            Err(err) => {
                return ChainVerification::fail(
                    format!("Seal cannot be canonicalized: {err}."),
                    line_no,
                    entries,
                );
            }
        };
        if recomputed != seal.current_snapshot_hash {
            return ChainVerification::fail("Seal hash mismatch.".to_string(), line_no, entries);
        }

        let mut signed = base;
        signed.insert(
            "current_snapshot_hash".to_string(),
            Value::String(seal.current_snapshot_hash.clone()),
        );
        let signed_canonical = match canonical::to_canonical_json(&signed) {
            Ok(canonical) => canonical,
            Err(err) => {
                return ChainVerification::fail(
                    format!("Seal cannot be canonicalized: {err}."),
                    line_no,
                    entries,
                );
            }
        };
        let signature_ok = match material {
            SigningMaterial::None => true,
            SigningMaterial::Static(secret) => seal
                .signature
                .as_ref()
                .is_some_and(|sig| crypto::verify_static(&signed_canonical, sig, secret)),
            SigningMaterial::Keyring(ring) => match (&seal.signature, &seal.signature_kid) {
                (Some(sig), Some(kid)) => crypto::verify_kid(
                    &signed_canonical,
                    &KeyedSignature {
                        kid: kid.clone(),
                        sig: sig.clone(),
                    },
                    ring,
                ),
                (Some(sig), None) => crypto::verify_any(&signed_canonical, sig, ring).is_some(),
                _ => false,
            },
        };
        if !signature_ok {
            return ChainVerification::fail(
                "Seal signature mismatch.".to_string(),
                line_no,
                entries,
            );
        }

        if open_snapshots {
            let snapshot_raw = match fs::read_to_string(&seal.snapshot_path) {
                Ok(raw) => raw,
                Err(err) => {
                    return ChainVerification::fail(
                        format!("Snapshot unreadable: {err}."),
                        line_no,
                        entries,
                    );
                }
            };
            let snapshot: Value = match serde_json::from_str(&snapshot_raw) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    return ChainVerification::fail(
                        format!("Snapshot unparseable: {err}."),
                        line_no,
                        entries,
                    );
                }
            };
            match canonical::fingerprint_value(&snapshot) {
                Ok(hash) if hash == seal.payload_hash => {}
                _ => {
                    return ChainVerification::fail(
                        "Snapshot payload hash mismatch.".to_string(),
                        line_no,
                        entries,
                    );
                }
            }
            let report = verify_payload(&snapshot, material);
            if !report.valid {
                return ChainVerification::fail(
                    report
                        .reason
                        .unwrap_or_else(|| "Snapshot payload invalid.".to_string()),
                    line_no,
                    entries,
                );
            }
        }

        previous.clone_from(&seal.current_snapshot_hash);
        entries += 1;
    }

    ChainVerification {
        valid: true,
        entries,
        reason: None,
        line: None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use clawee_core::Keyring;
    use clawee_core::time::SystemClock;
    use serde_json::Map;

    use super::super::build_signed_payload;
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

    fn payload(n: u64) -> Value {
        let Value::Object(record) = serde_json::json!({"id": format!("r-{n}")}) else {
            unreachable!()
        };
        build_signed_payload(vec![record], None, Map::new(), &signer()).unwrap()
    }

    #[test]
    fn test_sealed_exports_chain_and_verify() {
        let dir = tempfile::TempDir::new().unwrap();
        let chain = dir.path().join("chain.jsonl");
        let signer = signer();

        for n in 0..3 {
            let snapshot = dir.path().join(format!("snapshot-{n}.json"));
            export_sealed(&payload(n), &snapshot, &chain, &signer).unwrap();
        }

        let verification = verify_sealed_chain(&chain, &material(), true);
        assert!(verification.valid, "reason: {:?}", verification.reason);
        assert_eq!(verification.entries, 3);
    }

    #[test]
    fn test_snapshot_written_before_seal() {
        let dir = tempfile::TempDir::new().unwrap();
        let chain = dir.path().join("chain.jsonl");
        let snapshot = dir.path().join("snapshot.json");
        let seal = export_sealed(&payload(1), &snapshot, &chain, &signer()).unwrap();

        let bytes = fs::read_to_string(&snapshot).unwrap();
        assert!(bytes.ends_with('\n'));
        assert_eq!(seal.previous_snapshot_hash, GENESIS_HASH);
    }

    #[test]
    fn test_tampered_seal_line_detected() {
        let dir = tempfile::TempDir::new().unwrap();
        let chain = dir.path().join("chain.jsonl");
        let snapshot = dir.path().join("snapshot.json");
        export_sealed(&payload(1), &snapshot, &chain, &signer()).unwrap();

        let contents = fs::read_to_string(&chain).unwrap();
        let tampered = contents.replace("snapshot.json", "other.json");
        fs::write(&chain, tampered).unwrap();

        let verification = verify_sealed_chain(&chain, &material(), false);
        assert!(!verification.valid);
        assert_eq!(verification.reason.as_deref(), Some("Seal hash mismatch."));
        assert_eq!(verification.line, Some(1));
    }

    #[test]
    fn test_removed_middle_seal_breaks_chain() {
        let dir = tempfile::TempDir::new().unwrap();
        let chain = dir.path().join("chain.jsonl");
        let signer = signer();
        for n in 0..3 {
            let snapshot = dir.path().join(format!("snapshot-{n}.json"));
            export_sealed(&payload(n), &snapshot, &chain, &signer).unwrap();
        }

        let contents = fs::read_to_string(&chain).unwrap();
        let mut lines: Vec<&str> = contents.lines().collect();
        lines.remove(1);
        fs::write(&chain, format!("{}\n", lines.join("\n"))).unwrap();

        let verification = verify_sealed_chain(&chain, &material(), false);
        assert!(!verification.valid);
        assert_eq!(verification.reason.as_deref(), Some("Seal chain broken."));
        assert_eq!(verification.line, Some(2));
    }

    #[test]
    fn test_tampered_snapshot_detected_when_opened() {
        let dir = tempfile::TempDir::new().unwrap();
        let chain = dir.path().join("chain.jsonl");
        let snapshot = dir.path().join("snapshot.json");
        export_sealed(&payload(1), &snapshot, &chain, &signer()).unwrap();

        let mut parsed: Value =
            serde_json::from_str(&fs::read_to_string(&snapshot).unwrap()).unwrap();
        parsed["count"] = Value::from(99);
        fs::write(&snapshot, serde_json::to_string_pretty(&parsed).unwrap()).unwrap();

        // The seal line still verifies; only the opened snapshot fails.
        assert!(verify_sealed_chain(&chain, &material(), false).valid);
        let verification = verify_sealed_chain(&chain, &material(), true);
        assert!(!verification.valid);
        assert_eq!(
            verification.reason.as_deref(),
            Some("Snapshot payload hash mismatch.")
        );
    }
}
