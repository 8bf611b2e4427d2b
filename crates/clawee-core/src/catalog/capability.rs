//! Capability catalog: per-scope tool and action lists.
//!
//! A scope is either the default scope or a per-channel override. Lists are
//! normalized to lowercase; `BTreeSet` keeps them sorted and unique so the
//! canonical form of a normalized scope is stable.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use serde_json::{Map, Value};

use super::{CatalogError, CatalogRules, SigningMaterial};

/// Default posture of a scope when no list matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityMode {
    /// Unlisted names are allowed.
    Allow,
    /// Unlisted names are denied.
    Deny,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScopeDocument {
    mode: CapabilityMode,
    #[serde(default)]
    allow_tools: Vec<String>,
    #[serde(default)]
    deny_tools: Vec<String>,
    #[serde(default)]
    allow_actions: Vec<String>,
    #[serde(default)]
    deny_actions: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CapabilityDocument {
    default: ScopeDocument,
    #[serde(default)]
    channels: BTreeMap<String, ScopeDocument>,
}

/// One normalized capability scope.
#[derive(Debug, Clone)]
pub struct CapabilityScope {
    /// Posture for names not on any list.
    pub mode: CapabilityMode,
    /// Tools explicitly allowed.
    pub allow_tools: BTreeSet<String>,
    /// Tools explicitly denied. Deny wins over allow.
    pub deny_tools: BTreeSet<String>,
    /// Actions explicitly allowed.
    pub allow_actions: BTreeSet<String>,
    /// Actions explicitly denied.
    pub deny_actions: BTreeSet<String>,
}

fn lowered(values: Vec<String>) -> BTreeSet<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .collect()
}

impl From<ScopeDocument> for CapabilityScope {
    fn from(doc: ScopeDocument) -> Self {
        Self {
            mode: doc.mode,
            allow_tools: lowered(doc.allow_tools),
            deny_tools: lowered(doc.deny_tools),
            allow_actions: lowered(doc.allow_actions),
            deny_actions: lowered(doc.deny_actions),
        }
    }
}

/// Normalized capability rules: a default scope plus per-channel overrides.
#[derive(Debug, Clone)]
pub struct CapabilityRules {
    /// Scope applied when a channel has no override.
    pub default: CapabilityScope,
    /// Per-channel overrides, keyed by lowercase channel name.
    pub channels: BTreeMap<String, CapabilityScope>,
}

impl CapabilityRules {
    /// Resolves the scope for a channel: the override if present, the
    /// default otherwise.
    #[must_use]
    pub fn scope_for(&self, channel: Option<&str>) -> &CapabilityScope {
        channel
            .and_then(|c| self.channels.get(&c.to_lowercase()))
            .unwrap_or(&self.default)
    }
}

impl CatalogRules for CapabilityRules {
    const KIND: &'static str = "capability";

    fn from_payload(
        payload: &Map<String, Value>,
        _material: &SigningMaterial,
    ) -> Result<Self, CatalogError> {
        let doc: CapabilityDocument = serde_json::from_value(Value::Object(payload.clone()))?;
        Ok(Self {
            default: doc.default.into(),
            channels: doc
                .channels
                .into_iter()
                .map(|(channel, scope)| (channel.to_lowercase(), scope.into()))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> CapabilityRules {
        let doc = serde_json::json!({
            "default": {"mode": "deny", "allow_tools": ["Search"], "deny_tools": []},
            "channels": {"Slack": {"mode": "allow", "deny_tools": ["shell"]}},
        });
        let Value::Object(map) = doc else {
            unreachable!()
        };
        CapabilityRules::from_payload(&map, &SigningMaterial::None).unwrap()
    }

    #[test]
    fn test_channel_override_resolution() {
        let rules = rules();
        assert_eq!(rules.scope_for(None).mode, CapabilityMode::Deny);
        assert_eq!(rules.scope_for(Some("slack")).mode, CapabilityMode::Allow);
        assert_eq!(rules.scope_for(Some("email")).mode, CapabilityMode::Deny);
    }

    #[test]
    fn test_lists_normalized_lowercase() {
        let rules = rules();
        assert!(rules.default.allow_tools.contains("search"));
        assert!(rules.scope_for(Some("SLACK")).deny_tools.contains("shell"));
    }
}
