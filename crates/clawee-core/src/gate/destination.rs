//! Destination gate: channel destination regex enforcement.

use thiserror::Error;

use crate::catalog::{CapabilityMode, DestinationRules};

/// A destination denial.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum DestinationDeny {
    /// The destination matched a deny pattern.
    #[error("destination '{destination}' matches deny pattern '{pattern}'")]
    DenyMatch {
        /// The rejected destination.
        destination: String,
        /// The deny pattern that matched.
        pattern: String,
    },

    /// No allow pattern admitted the destination.
    #[error("destination '{destination}' is not on the allowlist")]
    NoAllowMatch {
        /// The rejected destination.
        destination: String,
    },
}

/// Checks a destination against the resolved channel scope.
///
/// A deny match wins. Under `mode=deny` an allow match is required; under
/// `mode=allow` the destination passes unless an allowlist is configured and
/// nothing matches.
///
/// # Errors
///
/// Returns a [`DestinationDeny`] when the destination is rejected.
pub fn evaluate_destination(
    rules: &DestinationRules,
    channel: Option<&str>,
    destination: &str,
) -> Result<(), DestinationDeny> {
    let scope = rules.scope_for(channel);

    if let Some(pattern) = scope.deny.iter().find(|p| p.is_match(destination)) {
        return Err(DestinationDeny::DenyMatch {
            destination: destination.to_string(),
            pattern: pattern.source.clone(),
        });
    }

    let allow_matched = scope.allow.iter().any(|p| p.is_match(destination));
    let permitted = match scope.mode {
        CapabilityMode::Deny => allow_matched,
        CapabilityMode::Allow => scope.allow.is_empty() || allow_matched,
    };

    if permitted {
        Ok(())
    } else {
        Err(DestinationDeny::NoAllowMatch {
            destination: destination.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::catalog::{CatalogRules, SigningMaterial};

    fn rules() -> DestinationRules {
        let doc = serde_json::json!({
            "default": {"mode": "allow", "deny": ["^#secret-.*$"]},
            "channels": {
                "slack": {"mode": "deny", "allow": ["^#eng-.*$"], "deny": ["^#eng-private$"]}
            },
        });
        let Value::Object(map) = doc else {
            unreachable!()
        };
        DestinationRules::from_payload(&map, &SigningMaterial::None).unwrap()
    }

    #[test]
    fn test_deny_match_wins() {
        let err = evaluate_destination(&rules(), Some("slack"), "#eng-private").unwrap_err();
        assert!(matches!(err, DestinationDeny::DenyMatch { .. }));
    }

    #[test]
    fn test_deny_mode_requires_allow_match() {
        let rules = rules();
        assert!(evaluate_destination(&rules, Some("slack"), "#eng-infra").is_ok());
        let err = evaluate_destination(&rules, Some("slack"), "#general").unwrap_err();
        assert!(matches!(err, DestinationDeny::NoAllowMatch { .. }));
    }

    #[test]
    fn test_allow_mode_without_allowlist_passes() {
        let rules = rules();
        assert!(evaluate_destination(&rules, None, "#general").is_ok());
        assert!(evaluate_destination(&rules, None, "#secret-ops").is_err());
    }
}
