//! Approval policy catalog: quorum requirements with override maps.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use serde_json::{Map, Value};

use super::{CatalogError, CatalogRules, SigningMaterial};
use crate::gate::RiskClass;

/// Upper bound for `required_approvals`.
pub const MAX_REQUIRED_APPROVALS: u32 = 5;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RequirementDocument {
    required_approvals: u32,
    #[serde(default)]
    required_roles: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ApprovalPolicyDocument {
    default: RequirementDocument,
    #[serde(default)]
    by_risk_class: BTreeMap<String, RequirementDocument>,
    #[serde(default)]
    by_tool: BTreeMap<String, RequirementDocument>,
    #[serde(default)]
    by_channel_action: BTreeMap<String, RequirementDocument>,
}

/// A quorum requirement: how many approvals, from which roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalRequirement {
    /// Number of distinct approving actors required, 1..=5.
    pub required_approvals: u32,

    /// Roles that must each be represented among the approvers.
    pub required_roles: BTreeSet<String>,
}

impl ApprovalRequirement {
    /// Merges another requirement into this one: union of roles, max of
    /// approvals.
    pub fn merge(&mut self, other: &Self) {
        self.required_approvals = self.required_approvals.max(other.required_approvals);
        self.required_roles
            .extend(other.required_roles.iter().cloned());
    }
}

fn normalize_requirement(doc: &RequirementDocument) -> Result<ApprovalRequirement, CatalogError> {
    if doc.required_approvals == 0 || doc.required_approvals > MAX_REQUIRED_APPROVALS {
        return Err(CatalogError::Rule {
            detail: format!(
                "required_approvals must be 1..={MAX_REQUIRED_APPROVALS}, found {}",
                doc.required_approvals
            ),
        });
    }
    Ok(ApprovalRequirement {
        required_approvals: doc.required_approvals,
        required_roles: doc
            .required_roles
            .iter()
            .map(|r| r.trim().to_lowercase())
            .filter(|r| !r.is_empty())
            .collect(),
    })
}

/// Normalized approval policy: a default requirement plus override maps
/// keyed by risk class, tool name, and `channel:action`.
#[derive(Debug, Clone)]
pub struct ApprovalPolicy {
    /// Requirement applied when no override matches.
    pub default: ApprovalRequirement,
    /// Overrides by risk class name (lowercase).
    pub by_risk_class: BTreeMap<String, ApprovalRequirement>,
    /// Overrides by tool name (lowercase).
    pub by_tool: BTreeMap<String, ApprovalRequirement>,
    /// Overrides by `channel:action` (lowercase).
    pub by_channel_action: BTreeMap<String, ApprovalRequirement>,
}

impl ApprovalPolicy {
    /// Resolves the requirement for a decision context.
    ///
    /// Starts from the default and merges every matching override: the risk
    /// class, each requested tool, and the `channel:action` pair. Merging is
    /// union of required roles and max of required approvals.
    #[must_use]
    pub fn resolve(
        &self,
        risk_class: RiskClass,
        tools: &[String],
        channel_action: Option<&str>,
    ) -> ApprovalRequirement {
        let mut requirement = self.default.clone();
        if let Some(by_risk) = self.by_risk_class.get(risk_class.as_str()) {
            requirement.merge(by_risk);
        }
        for tool in tools {
            if let Some(by_tool) = self.by_tool.get(&tool.to_lowercase()) {
                requirement.merge(by_tool);
            }
        }
        if let Some(pair) = channel_action {
            if let Some(by_pair) = self.by_channel_action.get(&pair.to_lowercase()) {
                requirement.merge(by_pair);
            }
        }
        requirement
    }
}

fn normalize_overrides(
    docs: &BTreeMap<String, RequirementDocument>,
) -> Result<BTreeMap<String, ApprovalRequirement>, CatalogError> {
    docs.iter()
        .map(|(key, doc)| Ok((key.trim().to_lowercase(), normalize_requirement(doc)?)))
        .collect()
}

impl CatalogRules for ApprovalPolicy {
    const KIND: &'static str = "approval_policy";

    fn from_payload(
        payload: &Map<String, Value>,
        _material: &SigningMaterial,
    ) -> Result<Self, CatalogError> {
        let doc: ApprovalPolicyDocument = serde_json::from_value(Value::Object(payload.clone()))?;
        Ok(Self {
            default: normalize_requirement(&doc.default)?,
            by_risk_class: normalize_overrides(&doc.by_risk_class)?,
            by_tool: normalize_overrides(&doc.by_tool)?,
            by_channel_action: normalize_overrides(&doc.by_channel_action)?,
        })
    }
}
