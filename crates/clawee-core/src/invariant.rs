//! Security invariant registry.
//!
//! A fixed catalog of named runtime invariants whose pass/fail counters are
//! fed by the gate pipeline and exported by the conformance service. The
//! catalog itself never changes at runtime; its hash is embedded in every
//! conformance report so a verifier can detect unauthorized catalog drift.

// Lock poisoning indicates a panic in another thread, which is unrecoverable.
#![allow(clippy::missing_panics_doc)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::canonical;
use crate::time::Clock;

/// Egress containment: outbound hosts are allowlisted or private.
pub const INV_EGRESS: &str = "INV-001-EGRESS-ALLOWLIST";
/// Capability enforcement: tools and actions stay inside their scope.
pub const INV_CAPABILITY: &str = "INV-002-CAPABILITY-SCOPE";
/// Policy gate: critical patterns block, high-risk signals suspend.
pub const INV_POLICY: &str = "INV-003-POLICY-GATE";
/// Model registry: only approved, in-window models are called.
pub const INV_MODEL: &str = "INV-004-MODEL-REGISTRY";
/// Approval quorum: suspended requests resume only with quorum and roles.
pub const INV_APPROVAL: &str = "INV-005-APPROVAL-QUORUM";
/// Budget containment: spend never exceeds configured caps unsuspended.
pub const INV_BUDGET: &str = "INV-006-BUDGET-CAPS";
/// Replay protection: nonces and event keys register at most once.
pub const INV_REPLAY: &str = "INV-007-REPLAY-PROTECTION";
/// Attestation integrity: ledgers chain and verify offline.
pub const INV_ATTESTATION: &str = "INV-008-ATTESTATION-CHAIN";

/// One catalog entry: an invariant id with its description.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct InvariantDefinition {
    /// Stable invariant id.
    pub id: &'static str,
    /// What the invariant guarantees.
    pub description: &'static str,
}

/// The fixed invariant catalog.
pub const INVARIANT_CATALOG: [InvariantDefinition; 8] = [
    InvariantDefinition {
        id: INV_EGRESS,
        description: "Outbound traffic reaches only allowlisted or private hosts",
    },
    InvariantDefinition {
        id: INV_CAPABILITY,
        description: "Tool and action use stays inside the resolved capability scope",
    },
    InvariantDefinition {
        id: INV_POLICY,
        description: "Critical patterns block; high-risk signals suspend for approval",
    },
    InvariantDefinition {
        id: INV_MODEL,
        description: "Only registered, approved, in-window models are invoked",
    },
    InvariantDefinition {
        id: INV_APPROVAL,
        description: "Suspended requests resume only with quorum and role coverage",
    },
    InvariantDefinition {
        id: INV_BUDGET,
        description: "Projected and actual spend never exceed caps while unsuspended",
    },
    InvariantDefinition {
        id: INV_REPLAY,
        description: "Nonces and event keys register at most once per TTL window",
    },
    InvariantDefinition {
        id: INV_ATTESTATION,
        description: "Attestation ledgers form verifiable hash chains",
    },
];

/// Last observed status of one invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InvariantStatus {
    /// Never checked.
    Unknown,
    /// Last check passed.
    Pass,
    /// Last check failed.
    Fail,
}

/// Runtime counters for one invariant.
#[derive(Debug, Clone, Serialize)]
pub struct InvariantState {
    /// The invariant id.
    pub id: String,
    /// Number of passing checks.
    pub passes: u64,
    /// Number of failing checks.
    pub failures: u64,
    /// Last observed status.
    pub last_status: InvariantStatus,
    /// When the invariant was last checked.
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Reason recorded on the last failure.
    pub last_failure_reason: Option<String>,
    /// Context recorded on the last failure.
    pub last_failure_context: Option<Value>,
}

impl InvariantState {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            passes: 0,
            failures: 0,
            last_status: InvariantStatus::Unknown,
            last_checked_at: None,
            last_failure_reason: None,
            last_failure_context: None,
        }
    }
}

/// Point-in-time summary across all invariants.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct InvariantSummary {
    /// Number of invariants in the catalog.
    pub total: usize,
    /// Invariants whose last check passed.
    pub passing: usize,
    /// Invariants whose last check failed.
    pub failing: usize,
    /// Invariants never checked.
    pub unknown: usize,
}

/// The runtime invariant registry.
///
/// Many-writer, many-reader: updates are monotone counter increments and
/// serialized behind one lock; summaries are point-in-time snapshots and
/// need not be globally linearizable.
pub struct InvariantRegistry {
    states: Mutex<BTreeMap<&'static str, InvariantState>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for InvariantRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvariantRegistry").finish_non_exhaustive()
    }
}

impl InvariantRegistry {
    /// Creates a registry with every catalog invariant in `unknown` state.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let states = INVARIANT_CATALOG
            .iter()
            .map(|def| (def.id, InvariantState::new(def.id)))
            .collect();
        Self {
            states: Mutex::new(states),
            clock,
        }
    }

    /// Records one check of an invariant.
    ///
    /// Unknown ids are ignored (the catalog is fixed); gates always report
    /// against catalog constants.
    pub fn check(&self, id: &str, passed: bool, reason: Option<&str>, context: Option<Value>) {
        let now = self.clock.now();
        let mut states = self.states.lock().expect("invariant lock poisoned");
        let Some(state) = states.values_mut().find(|s| s.id == id) else {
            tracing::warn!(%id, "check against unknown invariant id ignored");
            return;
        };
        state.last_checked_at = Some(now);
        if passed {
            state.passes += 1;
            state.last_status = InvariantStatus::Pass;
        } else {
            state.failures += 1;
            state.last_status = InvariantStatus::Fail;
            state.last_failure_reason = reason.map(str::to_string);
            state.last_failure_context = context;
        }
    }

    /// Returns a snapshot of every invariant state, in catalog order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<InvariantState> {
        let states = self.states.lock().expect("invariant lock poisoned");
        INVARIANT_CATALOG
            .iter()
            .filter_map(|def| states.get(def.id).cloned())
            .collect()
    }

    /// Returns a point-in-time summary.
    #[must_use]
    pub fn summary(&self) -> InvariantSummary {
        let states = self.states.lock().expect("invariant lock poisoned");
        let mut summary = InvariantSummary {
            total: states.len(),
            passing: 0,
            failing: 0,
            unknown: 0,
        };
        for state in states.values() {
            match state.last_status {
                InvariantStatus::Pass => summary.passing += 1,
                InvariantStatus::Fail => summary.failing += 1,
                InvariantStatus::Unknown => summary.unknown += 1,
            }
        }
        summary
    }

    /// SHA-256 of the sorted canonical catalog.
    ///
    /// Embedded in every conformance report as `invariant_catalog_hash` so a
    /// verifier can detect catalog drift.
    #[must_use]
    pub fn definition_hash() -> String {
        let catalog: BTreeMap<&str, &str> = INVARIANT_CATALOG
            .iter()
            .map(|def| (def.id, def.description))
            .collect();
        canonical::fingerprint_value(&catalog)
            .unwrap_or_else(|_| canonical::fingerprint_hex("invariant-catalog"))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::time::{ManualClock, SystemClock};

    fn registry() -> InvariantRegistry {
        InvariantRegistry::new(Arc::new(SystemClock))
    }

    #[test]
    fn test_check_updates_counters_and_status() {
        let registry = registry();
        registry.check(INV_POLICY, true, None, None);
        registry.check(INV_POLICY, false, Some("critical pattern"), None);

        let snapshot = registry.snapshot();
        let policy = snapshot.iter().find(|s| s.id == INV_POLICY).unwrap();
        assert_eq!(policy.passes, 1);
        assert_eq!(policy.failures, 1);
        assert_eq!(policy.last_status, InvariantStatus::Fail);
        assert_eq!(policy.last_failure_reason.as_deref(), Some("critical pattern"));
    }

    #[test]
    fn test_check_stamps_injected_clock_time() {
        let clock = Arc::new(ManualClock::at_wall_clock());
        let registry = InvariantRegistry::new(Arc::clone(&clock) as Arc<dyn Clock>);

        let first = clock.now();
        registry.check(INV_POLICY, true, None, None);
        clock.advance(Duration::from_secs(90));
        registry.check(INV_POLICY, true, None, None);

        let snapshot = registry.snapshot();
        let policy = snapshot.iter().find(|s| s.id == INV_POLICY).unwrap();
        assert_eq!(
            policy.last_checked_at,
            Some(first + chrono::Duration::seconds(90))
        );
    }

    #[test]
    fn test_unchecked_invariants_stay_unknown() {
        let registry = registry();
        registry.check(INV_EGRESS, true, None, None);
        let summary = registry.summary();
        assert_eq!(summary.total, 8);
        assert_eq!(summary.passing, 1);
        assert_eq!(summary.unknown, 7);
    }

    #[test]
    fn test_definition_hash_is_stable() {
        assert_eq!(
            InvariantRegistry::definition_hash(),
            InvariantRegistry::definition_hash()
        );
        assert_eq!(InvariantRegistry::definition_hash().len(), 64);
    }

    #[test]
    fn test_unknown_id_ignored() {
        let registry = registry();
        registry.check("INV-999-MISSING", false, None, None);
        assert_eq!(registry.summary().failing, 0);
    }

    #[test]
    fn test_concurrent_checks_count_exactly() {
        use std::thread;

        let registry = Arc::new(registry());
        let mut handles = vec![];
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    registry.check(INV_REPLAY, true, None, None);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let snapshot = registry.snapshot();
        let replay = snapshot.iter().find(|s| s.id == INV_REPLAY).unwrap();
        assert_eq!(replay.passes, 800);
    }
}
