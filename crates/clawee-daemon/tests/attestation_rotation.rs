//! Key rotation and sealed attestation scenarios across the catalog and
//! ledger layers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use clawee_core::catalog::{self, ApprovalRequirement, PolicyRules, SigningMaterial};
use clawee_core::time::{Clock, ManualClock, SystemClock};
use clawee_core::{Keyring, SigningMode, SnapshotCell};
use clawee_daemon::approval::ApprovalStore;
use clawee_daemon::attest::{
    ApprovalAttestor, AttestationSigner, AuditAttestor, verify_payload, verify_sealed_chain,
};
use clawee_daemon::audit::AuditLog;
use secrecy::SecretString;
use serde_json::Value;

fn ring_with(keys: &[(&str, &str)], active: &str) -> Keyring {
    let keys: HashMap<String, SecretString> = keys
        .iter()
        .map(|(kid, secret)| ((*kid).to_string(), SecretString::from(*secret)))
        .collect();
    Keyring::new(active, keys).unwrap()
}

fn policy_doc() -> serde_json::Map<String, Value> {
    let Value::Object(map) = serde_json::json!({
        "high_risk_tools": [],
        "critical_patterns": ["drop table"],
        "high_risk_patterns": [],
    }) else {
        unreachable!()
    };
    map
}

#[test]
fn test_keyring_rotation_keeps_old_documents_verifying_until_removal() {
    // Sign a policy catalog under a keyring with active kid k1.
    let ring_k1 = Arc::new(ring_with(&[("k1", "secret-one")], "k1"));
    let old_doc = catalog::sign_document(policy_doc(), &ring_k1).unwrap();
    let old_raw = serde_json::to_string(&old_doc).unwrap();

    // Publish rotation through a snapshot cell: add k2, switch active.
    let keyrings = SnapshotCell::new(ring_with(&[("k1", "secret-one")], "k1"));
    keyrings.install(ring_with(&[("k1", "secret-one"), ("k2", "secret-two")], "k2"));
    let rotated = keyrings.snapshot();
    assert_eq!(rotated.active_kid(), "k2");

    // Re-sign and reload under the rotated ring.
    let new_doc = catalog::sign_document(policy_doc(), &rotated).unwrap();
    let new_raw = serde_json::to_string(&new_doc).unwrap();
    let material = SigningMaterial::Keyring(Arc::clone(&rotated));

    let new_catalog = catalog::load_catalog::<PolicyRules>(&new_raw, &material).unwrap();
    assert_eq!(new_catalog.signing_mode, SigningMode::Keyring);
    assert_eq!(new_catalog.active_kid.as_deref(), Some("k2"));

    // The old document still verifies while k1 remains in the ring.
    let old_catalog = catalog::load_catalog::<PolicyRules>(&old_raw, &material).unwrap();
    assert_eq!(old_catalog.active_kid.as_deref(), Some("k1"));

    // Once k1 is removed, the old document stops verifying.
    keyrings.install(ring_with(&[("k2", "secret-two")], "k2"));
    let pruned = SigningMaterial::Keyring(keyrings.snapshot());
    let err = catalog::load_catalog::<PolicyRules>(&old_raw, &pruned).unwrap_err();
    assert!(matches!(err, catalog::CatalogError::SignatureMismatch { .. }));
}

#[test]
fn test_attestation_verifies_across_rotation_by_recorded_kid() {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ring_k1 = Arc::new(ring_with(&[("k1", "secret-one")], "k1"));
    let store = Arc::new(ApprovalStore::open_in_memory(Arc::clone(&clock)).unwrap());
    store
        .get_or_create_pending(
            "fp-1",
            &ApprovalRequirement {
                required_approvals: 1,
                required_roles: Default::default(),
            },
            Duration::from_secs(3600),
            1,
            "test",
            serde_json::json!({}),
        )
        .unwrap();

    let attestor = ApprovalAttestor::new(
        Arc::clone(&store),
        AttestationSigner::new(
            SigningMaterial::Keyring(Arc::clone(&ring_k1)),
            Arc::clone(&clock),
        ),
    );
    let payload = attestor.generate(100, None).unwrap();
    assert_eq!(payload.get("count").and_then(Value::as_u64), Some(1));

    // The payload records kid k1; it verifies under the rotated ring that
    // still holds k1, and fails once k1 is gone.
    let rotated = Arc::new(ring_with(&[("k1", "secret-one"), ("k2", "secret-two")], "k2"));
    assert!(verify_payload(&payload, &SigningMaterial::Keyring(rotated)).valid);

    let pruned = Arc::new(ring_with(&[("k2", "secret-two")], "k2"));
    let report = verify_payload(&payload, &SigningMaterial::Keyring(pruned));
    assert!(!report.valid);
    assert_eq!(report.reason.as_deref(), Some("Signature mismatch."));
}

#[test]
fn test_audit_ledger_sealed_chain_round_trip() {
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_wall_clock());
    let ring = Arc::new(ring_with(&[("k1", "secret-one")], "k1"));
    let material = SigningMaterial::Keyring(Arc::clone(&ring));

    let log = Arc::new(AuditLog::open_in_memory(Arc::clone(&clock)).unwrap());
    for n in 0..5 {
        log.record(
            "system",
            "pipeline.decision",
            &format!("/v1/messages/{n}"),
            serde_json::json!({"verdict": "block"}),
        )
        .unwrap();
    }

    let attestor = AuditAttestor::new(
        Arc::clone(&log),
        AttestationSigner::new(material.clone(), Arc::clone(&clock)),
    );
    let signer = AttestationSigner::new(material.clone(), Arc::clone(&clock));

    let dir = tempfile::TempDir::new().unwrap();
    let chain = dir.path().join("audit-chain.jsonl");

    // Three sealed exports over a moving cursor.
    let mut since = 0u64;
    for n in 0..3 {
        let payload = attestor.generate(2, since).unwrap();
        since += payload.get("count").and_then(Value::as_u64).unwrap_or(0);
        let snapshot = dir.path().join(format!("audit-{n}.json"));
        clawee_daemon::attest::export_sealed(&payload, &snapshot, &chain, &signer).unwrap();
    }

    let verification = verify_sealed_chain(&chain, &material, true);
    assert!(verification.valid, "reason: {:?}", verification.reason);
    assert_eq!(verification.entries, 3);
}
