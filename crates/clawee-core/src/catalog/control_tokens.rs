//! Control token catalog: operator token digests and their roles.
//!
//! The enclosing control surface authenticates operators; the catalog only
//! maps SHA-256 token digests to role sets. Raw tokens are never stored.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::{CatalogError, CatalogRules, SigningMaterial};
use crate::crypto::hex_eq_ct;

/// One operator token entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlToken {
    /// Operator-facing label, for status output only.
    pub label: String,

    /// SHA-256 of the raw token, lowercase hex.
    pub token_sha256: String,

    /// Roles the token asserts.
    #[serde(default)]
    pub roles: BTreeSet<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ControlTokenDocument {
    tokens: Vec<ControlToken>,
}

/// Normalized control token catalog.
#[derive(Debug, Clone)]
pub struct ControlTokens {
    tokens: Vec<ControlToken>,
}

impl ControlTokens {
    /// Looks up the roles asserted by a presented raw token.
    ///
    /// The raw token is hashed and its digest compared against every stored
    /// digest in constant time; `None` means the token is unknown.
    #[must_use]
    pub fn roles_for(&self, raw_token: &str) -> Option<&BTreeSet<String>> {
        let digest = hex::encode(Sha256::digest(raw_token.as_bytes()));
        self.tokens
            .iter()
            .find(|t| hex_eq_ct(&t.token_sha256, &digest))
            .map(|t| &t.roles)
    }

    /// Returns the number of configured tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Returns `true` if no tokens are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl CatalogRules for ControlTokens {
    const KIND: &'static str = "control_tokens";

    fn from_payload(
        payload: &Map<String, Value>,
        _material: &SigningMaterial,
    ) -> Result<Self, CatalogError> {
        let doc: ControlTokenDocument = serde_json::from_value(Value::Object(payload.clone()))?;
        for token in &doc.tokens {
            if token.token_sha256.len() != 64 || hex::decode(&token.token_sha256).is_err() {
                return Err(CatalogError::Rule {
                    detail: format!("token '{}' digest is not 64 hex chars", token.label),
                });
            }
        }
        Ok(Self {
            tokens: doc
                .tokens
                .into_iter()
                .map(|mut t| {
                    t.token_sha256 = t.token_sha256.to_lowercase();
                    t.roles = t.roles.into_iter().map(|r| r.to_lowercase()).collect();
                    t
                })
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles_for_presented_token() {
        let digest = hex::encode(Sha256::digest(b"operator-token"));
        let doc = serde_json::json!({
            "tokens": [{"label": "ops", "token_sha256": digest, "roles": ["Security"]}]
        });
        let Value::Object(map) = doc else {
            unreachable!()
        };
        let tokens = ControlTokens::from_payload(&map, &SigningMaterial::None).unwrap();
        let roles = tokens.roles_for("operator-token").unwrap();
        assert!(roles.contains("security"));
        assert!(tokens.roles_for("wrong-token").is_none());
    }

    #[test]
    fn test_malformed_digest_rejected() {
        let doc = serde_json::json!({
            "tokens": [{"label": "ops", "token_sha256": "zz", "roles": []}]
        });
        let Value::Object(map) = doc else {
            unreachable!()
        };
        assert!(ControlTokens::from_payload(&map, &SigningMaterial::None).is_err());
    }
}
