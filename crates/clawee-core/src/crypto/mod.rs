//! Keyring management and HMAC signing for catalogs and attestations.
//!
//! Signing in the sidecar is symmetric: every catalog and attestation payload
//! carries an HMAC-SHA256 over its canonical form. Secrets live in a
//! [`Keyring`] mapping key ids to secrets with one designated active id;
//! legacy single-key deployments are a degenerate one-entry keyring.

mod keyring;
mod signing;

pub use keyring::{Keyring, KeyringError};
pub use signing::{
    KeyedSignature, SIGNATURE_HEX_LEN, SignError, hex_eq_ct, sign, sign_static, verify_any,
    verify_kid, verify_static,
};
