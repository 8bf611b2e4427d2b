//! # clawee-daemon
//!
//! Stateful services for the clawee governance sidecar: the approval state
//! machine, the budget controller, replay-protection backends, the audit
//! action log, the attestation ledgers with their sealed snapshot chains,
//! and the gate pipeline driver that composes the `clawee-core` gates in a
//! fixed order per request.
//!
//! The HTTP control surface, environment configuration, and connector
//! transports live outside this crate; their only contract with the core is
//! the types exported here.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod approval;
pub mod attest;
pub mod audit;
pub mod budget;
pub mod maintenance;
pub mod pipeline;
pub mod replay;
pub mod status;

pub use approval::{ApprovalRecord, ApprovalStatus, ApprovalStore};
pub use budget::{BudgetCaps, BudgetController, BudgetStateRow};
pub use pipeline::{GatePipeline, PipelineDecision, PipelineRequest};
pub use replay::{ReplayBackend, ReplayStore};
