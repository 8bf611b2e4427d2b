//! # clawee-core
//!
//! Core library for clawee - a security and governance sidecar interposed
//! between an autonomous agent and the upstream models, tools, and messaging
//! channels it calls.
//!
//! This crate provides the stateless building blocks of the decision
//! pipeline: canonical serialization, HMAC keyring signing, signed catalog
//! loading with hot-reload snapshots, the gate engines, and the security
//! invariant registry. Stateful services (approvals, budget, replay
//! protection, attestation ledgers) live in `clawee-daemon`.
//!
//! ## Example
//!
//! ```rust
//! use clawee_core::canonical::{fingerprint_hex, to_canonical_json};
//!
//! let doc = serde_json::json!({"z": 1, "a": "b"});
//! let canonical = to_canonical_json(&doc).unwrap();
//! assert_eq!(canonical, r#"{"a":"b","z":1}"#);
//! let fp = fingerprint_hex(&canonical);
//! assert_eq!(fp.len(), 64);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod canonical;
pub mod catalog;
pub mod crypto;
pub mod gate;
pub mod invariant;
pub mod snapshot;
pub mod time;

pub use canonical::GENESIS_HASH;
pub use catalog::{SignedCatalog, SigningMaterial, SigningMode};
pub use crypto::{KeyedSignature, Keyring};
pub use gate::{GateVerdict, PolicyDecision, RiskClass};
pub use invariant::InvariantRegistry;
pub use snapshot::SnapshotCell;
pub use time::{Clock, ManualClock, SystemClock};
