//! Policy catalog: risk patterns and high-risk tool names.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde_json::{Map, Value};

use super::{CatalogError, CatalogRules, SigningMaterial};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyDocument {
    #[serde(default)]
    high_risk_tools: Vec<String>,
    #[serde(default)]
    critical_patterns: Vec<String>,
    #[serde(default)]
    high_risk_patterns: Vec<String>,
}

/// Normalized policy rules: three sets of lowercase strings.
#[derive(Debug, Clone, Default)]
pub struct PolicyRules {
    /// Tool names that force the approval path.
    pub high_risk_tools: BTreeSet<String>,

    /// Body substrings that block outright.
    pub critical_patterns: BTreeSet<String>,

    /// Body substrings that force the approval path.
    pub high_risk_patterns: BTreeSet<String>,
}

fn lowered(values: Vec<String>, field: &str) -> Result<BTreeSet<String>, CatalogError> {
    let mut set = BTreeSet::new();
    for value in values {
        let value = value.trim().to_lowercase();
        if value.is_empty() {
            return Err(CatalogError::Rule {
                detail: format!("{field} entries must be non-empty"),
            });
        }
        set.insert(value);
    }
    Ok(set)
}

impl CatalogRules for PolicyRules {
    const KIND: &'static str = "policy";

    fn from_payload(
        payload: &Map<String, Value>,
        _material: &SigningMaterial,
    ) -> Result<Self, CatalogError> {
        let doc: PolicyDocument = serde_json::from_value(Value::Object(payload.clone()))?;
        Ok(Self {
            high_risk_tools: lowered(doc.high_risk_tools, "high_risk_tools")?,
            critical_patterns: lowered(doc.critical_patterns, "critical_patterns")?,
            high_risk_patterns: lowered(doc.high_risk_patterns, "high_risk_patterns")?,
        })
    }
}
