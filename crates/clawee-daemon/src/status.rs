//! Control-status snapshot: the data behind the operator status surface.
//!
//! The HTTP layer serializes this snapshot verbatim; nothing here serves
//! requests. Fingerprints and signing modes are published per catalog so
//! operators can detect drift against the documents they signed.

use std::collections::BTreeMap;

use clawee_core::SigningMode;
use clawee_core::invariant::InvariantSummary;
use serde::Serialize;

use crate::approval::ApprovalCounts;
use crate::budget::BudgetStateRow;

/// Provenance of one loaded catalog.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogStatus {
    /// How the catalog was verified at load time.
    pub signing_mode: SigningMode,
    /// SHA-256 of the canonical payload, lowercase hex.
    pub fingerprint: String,
    /// The key id that verified the document, in keyring mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_kid: Option<String>,
}

impl CatalogStatus {
    /// Builds the status of one loaded catalog.
    #[must_use]
    pub fn of<T>(catalog: &clawee_core::SignedCatalog<T>) -> Self {
        Self {
            signing_mode: catalog.signing_mode,
            fingerprint: catalog.fingerprint.clone(),
            active_kid: catalog.active_kid.clone(),
        }
    }
}

/// The full control-status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ControlStatus {
    /// Per-catalog provenance, keyed by catalog kind.
    pub catalogs: BTreeMap<String, CatalogStatus>,
    /// Current budget suspension state.
    pub budget: BudgetStateRow,
    /// Approval counts by status.
    pub approvals: ApprovalCounts,
    /// Invariant registry summary.
    pub invariants: InvariantSummary,
}

#[cfg(test)]
mod tests {
    use clawee_core::SignedCatalog;

    use super::*;

    #[test]
    fn test_catalog_status_carries_provenance() {
        let catalog = SignedCatalog {
            rules: (),
            fingerprint: "ab".repeat(32),
            signing_mode: SigningMode::Keyring,
            active_kid: Some("k1".to_string()),
        };
        let status = CatalogStatus::of(&catalog);
        assert_eq!(status.signing_mode, SigningMode::Keyring);
        assert_eq!(status.active_kid.as_deref(), Some("k1"));
    }
}
