//! Gate engines: pure evaluators from rules plus request context to a
//! decision.
//!
//! Gates are stateless with respect to requests and hot-reloadable by
//! snapshot swap of their rule tables. Each gate reports a denial through its
//! own error type (fail-closed, never recovered by another gate); the
//! pipeline driver in `clawee-daemon` maps denials to block decisions and
//! feeds the invariant registry.

mod capability;
mod destination;
mod egress;
mod model;
mod policy;

pub use capability::{CapabilityDeny, evaluate_action, evaluate_tools};
pub use destination::{DestinationDeny, evaluate_destination};
pub use egress::{
    DEFAULT_EGRESS_CACHE_TTL, EgressDeny, EgressGate, EgressMode, EgressRules, HostResolver,
    SystemResolver, is_private_addr,
};
pub use model::{ModelDeny, evaluate_model};
pub use policy::{PolicyRequest, evaluate_policy};

use serde::{Deserialize, Serialize};

/// What the pipeline should do with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateVerdict {
    /// Forward the request.
    Allow,
    /// Suspend the request pending human approval.
    RequireApproval,
    /// Reject the request.
    Block,
}

/// Risk classification attached to a policy decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskClass {
    /// No risk signals matched.
    Low,
    /// Reserved for future graduated signals.
    Medium,
    /// High-risk signals matched; approval required.
    High,
    /// A critical pattern matched; blocked outright.
    Critical,
}

impl RiskClass {
    /// Returns the lowercase name of the class.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for RiskClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the policy engine for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    /// The verdict.
    pub decision: GateVerdict,

    /// Risk classification motivating the verdict.
    pub risk_class: RiskClass,

    /// Signals that fired, in emission order, e.g.
    /// `critical-pattern:drop table` or `high-risk-tool:shell`.
    pub matched_signals: Vec<String>,

    /// Human-readable summary of the verdict.
    pub reason: String,
}
