//! Approval service: pending decisions, quorum accumulation, and
//! at-most-N-uses consumption.
//!
//! # State machine
//!
//! ```text
//! pending ──► approved ──► (consumed up to max_uses)
//!    │
//!    ├─────► denied
//!    └─────► expired   (lazily, on read, when expires_at < now)
//! ```
//!
//! Terminal states are absorbing. A pending record transitions to approved
//! only when the quorum is met **and** every required role is represented
//! among the approvers. Once resolved, the actor and role sets are frozen.

mod store;

pub use store::{
    ApprovalCounts, ApprovalError, ApprovalRecord, ApprovalStatus, ApprovalStore,
    DEFAULT_APPROVAL_TTL,
};
