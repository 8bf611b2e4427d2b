//! Channel destination policy catalog: regex allow/deny lists.
//!
//! Regex compilation happens once at load time and must be total; a compile
//! failure fails the load so a half-compiled scope can never be installed.

use std::collections::BTreeMap;

use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

use super::{CapabilityMode, CatalogError, CatalogRules, SigningMaterial};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScopeDocument {
    mode: CapabilityMode,
    #[serde(default)]
    allow: Vec<String>,
    #[serde(default)]
    deny: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DestinationDocument {
    default: ScopeDocument,
    #[serde(default)]
    channels: BTreeMap<String, ScopeDocument>,
}

/// A compiled destination pattern, keeping its source for signal reporting.
#[derive(Debug, Clone)]
pub struct DestinationPattern {
    /// The pattern source as written in the catalog.
    pub source: String,
    regex: Regex,
}

impl DestinationPattern {
    fn compile(source: &str, field: &str) -> Result<Self, CatalogError> {
        let regex = Regex::new(source).map_err(|err| CatalogError::Rule {
            detail: format!("{field} pattern '{source}' does not compile: {err}"),
        })?;
        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    /// Returns `true` if the destination matches this pattern.
    #[must_use]
    pub fn is_match(&self, destination: &str) -> bool {
        self.regex.is_match(destination)
    }
}

/// One destination scope: a mode plus compiled allow/deny lists.
#[derive(Debug, Clone)]
pub struct DestinationScope {
    /// Posture for destinations not matching any list.
    pub mode: CapabilityMode,
    /// Patterns that admit a destination.
    pub allow: Vec<DestinationPattern>,
    /// Patterns that reject a destination. Deny wins.
    pub deny: Vec<DestinationPattern>,
}

fn compile_scope(doc: &ScopeDocument) -> Result<DestinationScope, CatalogError> {
    Ok(DestinationScope {
        mode: doc.mode,
        allow: doc
            .allow
            .iter()
            .map(|p| DestinationPattern::compile(p, "allow"))
            .collect::<Result<_, _>>()?,
        deny: doc
            .deny
            .iter()
            .map(|p| DestinationPattern::compile(p, "deny"))
            .collect::<Result<_, _>>()?,
    })
}

/// Normalized destination rules with the default/per-channel resolution
/// shared with the capability catalog.
#[derive(Debug, Clone)]
pub struct DestinationRules {
    /// Scope applied when a channel has no override.
    pub default: DestinationScope,
    /// Per-channel overrides, keyed by lowercase channel name.
    pub channels: BTreeMap<String, DestinationScope>,
}

impl DestinationRules {
    /// Resolves the scope for a channel.
    #[must_use]
    pub fn scope_for(&self, channel: Option<&str>) -> &DestinationScope {
        channel
            .and_then(|c| self.channels.get(&c.to_lowercase()))
            .unwrap_or(&self.default)
    }
}

impl CatalogRules for DestinationRules {
    const KIND: &'static str = "destination";

    fn from_payload(
        payload: &Map<String, Value>,
        _material: &SigningMaterial,
    ) -> Result<Self, CatalogError> {
        let doc: DestinationDocument = serde_json::from_value(Value::Object(payload.clone()))?;
        Ok(Self {
            default: compile_scope(&doc.default)?,
            channels: doc
                .channels
                .iter()
                .map(|(channel, scope)| Ok((channel.to_lowercase(), compile_scope(scope)?)))
                .collect::<Result<_, CatalogError>>()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regex_compile_failure_fails_load() {
        let doc = serde_json::json!({"default": {"mode": "allow", "deny": ["("]}});
        let Value::Object(map) = doc else {
            unreachable!()
        };
        let err = DestinationRules::from_payload(&map, &SigningMaterial::None).unwrap_err();
        assert!(matches!(err, CatalogError::Rule { .. }));
    }

    #[test]
    fn test_compiled_patterns_match() {
        let doc = serde_json::json!({
            "default": {"mode": "deny", "allow": ["^#eng-.*$"]},
        });
        let Value::Object(map) = doc else {
            unreachable!()
        };
        let rules = DestinationRules::from_payload(&map, &SigningMaterial::None).unwrap();
        assert!(rules.default.allow[0].is_match("#eng-infra"));
        assert!(!rules.default.allow[0].is_match("#general"));
    }
}
