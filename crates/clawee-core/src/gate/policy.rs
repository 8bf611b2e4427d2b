//! Policy engine: pattern and tool-risk signal emission with fixed
//! tie-break rules.
//!
//! The engine scans a lowercased rendering of the request body for catalog
//! patterns. Matching is a plain substring scan; false positives on
//! legitimate text (say, schema documentation mentioning `drop table`) are
//! possible, so every matched literal is flagged in `matched_signals` for
//! the caller to audit.

use serde_json::Value;

use super::{GateVerdict, PolicyDecision, RiskClass};
use crate::catalog::PolicyRules;

/// Request fields inspected by the policy engine.
#[derive(Debug, Clone)]
pub struct PolicyRequest<'a> {
    /// Request path as seen by the ingress layer.
    pub path: &'a str,
    /// HTTP method.
    pub method: &'a str,
    /// Request body.
    pub body: &'a Value,
    /// Requested tool names.
    pub tools: &'a [String],
    /// Request modality, `"text"` for plain completions.
    pub modality: &'a str,
}

/// Evaluates the policy rules against a request.
///
/// Tie-break: any `critical-pattern` signal blocks at `critical`; otherwise
/// any `high-risk-*` signal requires approval at `high`; otherwise the
/// request is allowed at `low`. Informational signals (`modality:*`) never
/// change the verdict.
#[must_use]
pub fn evaluate_policy(rules: &PolicyRules, request: &PolicyRequest<'_>) -> PolicyDecision {
    let body_text = request.body.to_string().to_lowercase();
    let path = request.path.to_lowercase();
    let mut signals = Vec::new();
    let mut critical = false;
    let mut high_risk = false;

    for pattern in &rules.critical_patterns {
        if body_text.contains(pattern.as_str()) {
            signals.push(format!("critical-pattern:{pattern}"));
            critical = true;
        }
    }

    for tool in request.tools {
        if rules.high_risk_tools.contains(&tool.to_lowercase()) {
            signals.push(format!("high-risk-tool:{}", tool.to_lowercase()));
            high_risk = true;
        }
    }

    for pattern in &rules.high_risk_patterns {
        if body_text.contains(pattern.as_str()) {
            signals.push(format!("high-risk-pattern:{pattern}"));
            high_risk = true;
        }
    }

    if (path.contains("admin") || path.contains("system"))
        && !request.method.eq_ignore_ascii_case("GET")
    {
        signals.push("high-risk-path:admin-system".to_string());
        high_risk = true;
    }

    if !request.modality.eq_ignore_ascii_case("text") {
        signals.push(format!("modality:{}", request.modality.to_lowercase()));
    }

    if critical {
        PolicyDecision {
            decision: GateVerdict::Block,
            risk_class: RiskClass::Critical,
            matched_signals: signals,
            reason: "Critical pattern matched.".to_string(),
        }
    } else if high_risk {
        PolicyDecision {
            decision: GateVerdict::RequireApproval,
            risk_class: RiskClass::High,
            matched_signals: signals,
            reason: "High-risk signals require approval.".to_string(),
        }
    } else {
        PolicyDecision {
            decision: GateVerdict::Allow,
            risk_class: RiskClass::Low,
            matched_signals: signals,
            reason: "No risk signals matched.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogRules, SigningMaterial};

    fn rules() -> PolicyRules {
        let doc = serde_json::json!({
            "high_risk_tools": ["shell"],
            "critical_patterns": ["drop table", "rm -rf"],
            "high_risk_patterns": ["production"],
        });
        let serde_json::Value::Object(map) = doc else {
            unreachable!()
        };
        PolicyRules::from_payload(&map, &SigningMaterial::None).unwrap()
    }

    fn request<'a>(body: &'a Value, tools: &'a [String]) -> PolicyRequest<'a> {
        PolicyRequest {
            path: "/v1/messages",
            method: "POST",
            body,
            tools,
            modality: "text",
        }
    }

    #[test]
    fn test_critical_pattern_blocks() {
        let body = serde_json::json!({"prompt": "please DROP TABLE users"});
        let decision = evaluate_policy(&rules(), &request(&body, &[]));
        assert_eq!(decision.decision, GateVerdict::Block);
        assert_eq!(decision.risk_class, RiskClass::Critical);
        assert!(decision
            .matched_signals
            .contains(&"critical-pattern:drop table".to_string()));
    }

    #[test]
    fn test_high_risk_pattern_requires_approval() {
        let body = serde_json::json!({"prompt": "deploy to production now"});
        let decision = evaluate_policy(&rules(), &request(&body, &[]));
        assert_eq!(decision.decision, GateVerdict::RequireApproval);
        assert_eq!(decision.risk_class, RiskClass::High);
    }

    #[test]
    fn test_critical_wins_over_high_risk() {
        let body = serde_json::json!({"prompt": "drop table in production"});
        let decision = evaluate_policy(&rules(), &request(&body, &[]));
        assert_eq!(decision.decision, GateVerdict::Block);
        assert_eq!(decision.risk_class, RiskClass::Critical);
        assert!(decision.matched_signals.len() >= 2);
    }

    #[test]
    fn test_clean_body_allows() {
        let body = serde_json::json!({"prompt": "summarize this document"});
        let decision = evaluate_policy(&rules(), &request(&body, &[]));
        assert_eq!(decision.decision, GateVerdict::Allow);
        assert_eq!(decision.risk_class, RiskClass::Low);
        assert!(decision.matched_signals.is_empty());
    }

    #[test]
    fn test_high_risk_tool_signal() {
        let body = serde_json::json!({});
        let tools = vec!["Shell".to_string()];
        let decision = evaluate_policy(&rules(), &request(&body, &tools));
        assert_eq!(decision.decision, GateVerdict::RequireApproval);
        assert!(decision
            .matched_signals
            .contains(&"high-risk-tool:shell".to_string()));
    }

    #[test]
    fn test_admin_path_post_flagged_get_ignored() {
        let body = serde_json::json!({});
        let rules = rules();

        let mut req = request(&body, &[]);
        req.path = "/admin/settings";
        let decision = evaluate_policy(&rules, &req);
        assert_eq!(decision.decision, GateVerdict::RequireApproval);
        assert!(decision
            .matched_signals
            .contains(&"high-risk-path:admin-system".to_string()));

        req.method = "GET";
        let decision = evaluate_policy(&rules, &req);
        assert_eq!(decision.decision, GateVerdict::Allow);
    }

    #[test]
    fn test_modality_signal_is_informational() {
        let body = serde_json::json!({});
        let mut req = request(&body, &[]);
        req.modality = "vision";
        let decision = evaluate_policy(&rules(), &req);
        assert_eq!(decision.decision, GateVerdict::Allow);
        assert!(decision
            .matched_signals
            .contains(&"modality:vision".to_string()));
    }
}
