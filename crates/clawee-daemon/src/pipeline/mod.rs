//! Gate pipeline driver: the fixed per-request decision sequence.
//!
//! Per inbound request the pipeline runs egress, capability, model, policy,
//! approval, and projected-budget gates, in that order. Any non-allow
//! result short-circuits the remaining gates; the invariant registry is
//! still updated for the gates that did run. After the upstream forward the
//! caller settles actual cost through [`GatePipeline::settle_actual`].
//!
//! Collaborators are constructor-injected; no component owns another. Store
//! failures never escape as errors: they map to fail-closed block decisions
//! with a distinct kind so operators can tell infrastructure failures from
//! policy denials.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use clawee_core::canonical;
use clawee_core::catalog::{
    ApprovalPolicy, CapabilityRules, CatalogHandle, DestinationRules, ModelModality,
    ModelRegistry, PolicyRules,
};
use clawee_core::gate::{
    self, EgressGate, GateVerdict, PolicyRequest, RiskClass,
};
use clawee_core::invariant::{
    INV_APPROVAL, INV_BUDGET, INV_CAPABILITY, INV_EGRESS, INV_MODEL, INV_POLICY,
    InvariantRegistry,
};
use clawee_core::time::Clock;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::approval::{ApprovalStore, DEFAULT_APPROVAL_TTL};
use crate::audit::AuditLog;
use crate::budget::{BudgetController, BudgetError};

/// One inbound request as seen by the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    /// Upstream identifier, for egress cache keying.
    pub target: String,
    /// Outbound host being contacted.
    pub host: String,
    /// Messaging channel, when the request belongs to one.
    pub channel: Option<String>,
    /// The operation being performed, e.g. `model.invoke` or
    /// `message.send`.
    pub action: String,
    /// Request path.
    pub path: String,
    /// HTTP method.
    pub method: String,
    /// Model being called, when the request is a model call.
    pub model_id: Option<String>,
    /// Request modality.
    pub modality: ModelModality,
    /// Requested tool names.
    pub tools: Vec<String>,
    /// Request body.
    pub body: Value,
    /// Estimated input tokens, for the projected budget check.
    pub input_tokens: u64,
    /// Estimated output tokens, for the projected budget check.
    pub output_tokens: u64,
}

/// Which error kind produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// The request may be forwarded.
    Allowed,
    /// Blocked by the egress gate.
    EgressDeny,
    /// Blocked by the capability gate.
    CapabilityDeny,
    /// Blocked by the model registry gate.
    ModelDeny,
    /// Blocked by the channel destination gate.
    DestinationDeny,
    /// Blocked by the policy engine.
    PolicyDeny,
    /// Suspended pending human approval.
    ApprovalRequired,
    /// Blocked by the budget controller.
    BudgetSuspended,
    /// Blocked by a configuration gap (e.g. an unpriced model).
    Configuration,
    /// Blocked because a backing store is unavailable; fail closed.
    TransientBackend,
}

/// The pipeline's answer for one request.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PipelineDecision {
    /// What to do with the request.
    pub verdict: GateVerdict,
    /// Which error kind produced the verdict.
    pub kind: DecisionKind,
    /// The gate that decided, `"pipeline"` for an end-to-end allow.
    pub gate: &'static str,
    /// Risk classification from the policy engine, when it ran.
    pub risk_class: RiskClass,
    /// Signals that motivated the decision.
    pub matched_signals: Vec<String>,
    /// Human-readable reason.
    pub reason: String,
    /// The pending approval covering this request, when suspended.
    pub approval_id: Option<Uuid>,
}

impl PipelineDecision {
    fn block(gate: &'static str, kind: DecisionKind, reason: String) -> Self {
        Self {
            verdict: GateVerdict::Block,
            kind,
            gate,
            risk_class: RiskClass::Low,
            matched_signals: Vec::new(),
            reason,
            approval_id: None,
        }
    }
}

/// Constructor-injected collaborators of the pipeline.
pub struct PipelineParts {
    /// The egress gate with its verdict cache.
    pub egress: Arc<EgressGate>,
    /// Capability rules snapshot handle.
    pub capabilities: Arc<CatalogHandle<CapabilityRules>>,
    /// Model registry snapshot handle.
    pub models: Arc<CatalogHandle<ModelRegistry>>,
    /// Policy rules snapshot handle.
    pub policy: Arc<CatalogHandle<PolicyRules>>,
    /// Approval policy snapshot handle.
    pub approval_policy: Arc<CatalogHandle<ApprovalPolicy>>,
    /// Destination rules snapshot handle, for the channel delivery path.
    pub destinations: Arc<CatalogHandle<DestinationRules>>,
    /// The approval store.
    pub approvals: Arc<ApprovalStore>,
    /// The budget controller.
    pub budget: Arc<BudgetController>,
    /// The invariant registry fed by every gate.
    pub invariants: Arc<InvariantRegistry>,
    /// The audit action log.
    pub audit: Arc<AuditLog>,
    /// The clock.
    pub clock: Arc<dyn Clock>,
}

/// The gate pipeline.
pub struct GatePipeline {
    parts: PipelineParts,
    approval_ttl: Duration,
}

impl std::fmt::Debug for GatePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatePipeline")
            .field("approval_ttl", &self.approval_ttl)
            .finish_non_exhaustive()
    }
}

/// Computes the canonical fingerprint of the request fields that uniquely
/// identify an approvable operation.
///
/// # Errors
///
/// Returns an error when the body cannot be canonicalized.
pub fn request_fingerprint(
    request: &PipelineRequest,
) -> Result<String, canonical::CanonicalError> {
    let mut fields: BTreeMap<&str, Value> = BTreeMap::new();
    fields.insert("action", Value::String(request.action.clone()));
    fields.insert("body", request.body.clone());
    fields.insert(
        "channel",
        request
            .channel
            .as_ref()
            .map_or(Value::Null, |c| Value::String(c.to_lowercase())),
    );
    fields.insert("method", Value::String(request.method.to_uppercase()));
    fields.insert(
        "model_id",
        request
            .model_id
            .as_ref()
            .map_or(Value::Null, |m| Value::String(m.clone())),
    );
    fields.insert("path", Value::String(request.path.clone()));
    fields.insert(
        "tools",
        Value::Array(
            request
                .tools
                .iter()
                .map(|t| Value::String(t.to_lowercase()))
                .collect(),
        ),
    );
    canonical::fingerprint_value(&fields)
}

impl GatePipeline {
    /// Creates a pipeline with the default pending-approval TTL.
    #[must_use]
    pub fn new(parts: PipelineParts) -> Self {
        Self::with_approval_ttl(parts, DEFAULT_APPROVAL_TTL)
    }

    /// Creates a pipeline with a custom pending-approval TTL.
    #[must_use]
    pub fn with_approval_ttl(parts: PipelineParts, approval_ttl: Duration) -> Self {
        Self {
            parts,
            approval_ttl,
        }
    }

    /// Runs the gate sequence for one request.
    ///
    /// Never fails: store errors map to fail-closed block decisions with
    /// [`DecisionKind::TransientBackend`].
    #[must_use]
    pub fn decide(&self, request: &PipelineRequest) -> PipelineDecision {
        let decision = self.run_gates(request);
        if decision.verdict != GateVerdict::Allow {
            self.parts.audit.record_best_effort(
                "system",
                "pipeline.decision",
                &request.path,
                serde_json::json!({
                    "verdict": decision.verdict,
                    "kind": decision.kind,
                    "gate": decision.gate,
                    "reason": decision.reason,
                    "matched_signals": decision.matched_signals,
                }),
            );
        }
        debug!(
            gate = decision.gate,
            verdict = ?decision.verdict,
            path = %request.path,
            "pipeline decision"
        );
        decision
    }

    fn run_gates(&self, request: &PipelineRequest) -> PipelineDecision {
        let invariants = &self.parts.invariants;

        // 1. Runtime egress.
        if let Err(deny) = self.parts.egress.check(&request.target, &request.host) {
            let reason = deny.to_string();
            invariants.check(INV_EGRESS, false, Some(&reason), None);
            return PipelineDecision::block("egress", DecisionKind::EgressDeny, reason);
        }
        invariants.check(INV_EGRESS, true, None, None);

        // 2. Capability gate: the action, then the tool batch behind a
        //    tool.execute check.
        let capabilities = self.parts.capabilities.snapshot();
        let channel = request.channel.as_deref();
        let capability_result = gate::evaluate_action(&capabilities.rules, channel, &request.action)
            .and_then(|()| {
                if request.tools.is_empty() || request.action == "tool.execute" {
                    Ok(())
                } else {
                    gate::evaluate_action(&capabilities.rules, channel, "tool.execute")
                }
            })
            .and_then(|()| {
                if request.tools.is_empty() {
                    Ok(())
                } else {
                    gate::evaluate_tools(&capabilities.rules, channel, &request.tools)
                }
            });
        if let Err(deny) = capability_result {
            let reason = deny.to_string();
            invariants.check(INV_CAPABILITY, false, Some(&reason), None);
            return PipelineDecision::block("capability", DecisionKind::CapabilityDeny, reason);
        }
        invariants.check(INV_CAPABILITY, true, None, None);

        // 3. Model registry gate.
        if let Some(model_id) = &request.model_id {
            let models = self.parts.models.snapshot();
            if let Err(deny) = gate::evaluate_model(
                &models.rules,
                model_id,
                request.modality,
                self.parts.clock.now(),
            ) {
                let reason = deny.to_string();
                invariants.check(INV_MODEL, false, Some(&reason), None);
                return PipelineDecision::block("model", DecisionKind::ModelDeny, reason);
            }
            invariants.check(INV_MODEL, true, None, None);
        }

        // 4. Policy engine.
        let policy = self.parts.policy.snapshot();
        let policy_decision = gate::evaluate_policy(
            &policy.rules,
            &PolicyRequest {
                path: &request.path,
                method: &request.method,
                body: &request.body,
                tools: &request.tools,
                modality: request.modality.as_str(),
            },
        );
        match policy_decision.decision {
            GateVerdict::Block => {
                invariants.check(
                    INV_POLICY,
                    false,
                    Some(&policy_decision.reason),
                    Some(serde_json::json!({
                        "matched_signals": policy_decision.matched_signals,
                    })),
                );
                return PipelineDecision {
                    verdict: GateVerdict::Block,
                    kind: DecisionKind::PolicyDeny,
                    gate: "policy",
                    risk_class: policy_decision.risk_class,
                    matched_signals: policy_decision.matched_signals,
                    reason: policy_decision.reason,
                    approval_id: None,
                };
            }
            GateVerdict::RequireApproval => {
                invariants.check(INV_POLICY, true, None, None);
                // 5. Approval gate.
                if let Some(decision) = self.approval_gate(request, &policy_decision) {
                    return decision;
                }
            }
            GateVerdict::Allow => {
                invariants.check(INV_POLICY, true, None, None);
            }
        }

        // 6. Budget controller, projected.
        if let Some(model_id) = &request.model_id {
            match self.parts.budget.check_projected(
                model_id,
                request.input_tokens,
                request.output_tokens,
            ) {
                Ok(_projection) => {
                    invariants.check(INV_BUDGET, true, None, None);
                }
                Err(BudgetError::Suspended { reason }) => {
                    invariants.check(INV_BUDGET, false, Some(&reason), None);
                    return PipelineDecision::block(
                        "budget",
                        DecisionKind::BudgetSuspended,
                        reason,
                    );
                }
                Err(BudgetError::Unpriced(err)) => {
                    let reason = err.to_string();
                    invariants.check(INV_BUDGET, false, Some(&reason), None);
                    return PipelineDecision::block("budget", DecisionKind::Configuration, reason);
                }
                Err(err) => {
                    let reason = err.to_string();
                    invariants.check(INV_BUDGET, false, Some(&reason), None);
                    return PipelineDecision::block(
                        "budget",
                        DecisionKind::TransientBackend,
                        reason,
                    );
                }
            }
        }

        PipelineDecision {
            verdict: GateVerdict::Allow,
            kind: DecisionKind::Allowed,
            gate: "pipeline",
            risk_class: policy_decision.risk_class,
            matched_signals: policy_decision.matched_signals,
            reason: "All gates passed.".to_string(),
            approval_id: None,
        }
    }

    /// Runs the approval gate. Returns `Some(decision)` to short-circuit
    /// (suspend or fail closed), `None` when a valid approval was consumed
    /// and the pipeline may continue.
    fn approval_gate(
        &self,
        request: &PipelineRequest,
        policy_decision: &clawee_core::PolicyDecision,
    ) -> Option<PipelineDecision> {
        let invariants = &self.parts.invariants;

        let fingerprint = match request_fingerprint(request) {
            Ok(fingerprint) => fingerprint,
            Err(err) => {
                let reason = format!("request fingerprint failed: {err}");
                invariants.check(INV_APPROVAL, false, Some(&reason), None);
                return Some(PipelineDecision::block(
                    "approval",
                    DecisionKind::TransientBackend,
                    reason,
                ));
            }
        };

        // Consume an existing valid approval if one covers this request.
        match self.parts.approvals.find_valid_approved(&fingerprint) {
            Ok(Some(record)) => {
                match self.parts.approvals.consume_approved(record.id, &fingerprint) {
                    Ok(true) => {
                        invariants.check(INV_APPROVAL, true, None, None);
                        debug!(approval = %record.id, "approval consumed");
                        return None;
                    }
                    Ok(false) => {
                        // Lost a consume race; fall through to the pending
                        // path.
                    }
                    Err(err) => {
                        let reason = err.to_string();
                        invariants.check(INV_APPROVAL, false, Some(&reason), None);
                        return Some(PipelineDecision::block(
                            "approval",
                            DecisionKind::TransientBackend,
                            reason,
                        ));
                    }
                }
            }
            Ok(None) => {}
            Err(err) => {
                let reason = err.to_string();
                invariants.check(INV_APPROVAL, false, Some(&reason), None);
                return Some(PipelineDecision::block(
                    "approval",
                    DecisionKind::TransientBackend,
                    reason,
                ));
            }
        }

        // No valid approval: create or upgrade the pending record.
        let channel_action = request
            .channel
            .as_ref()
            .map(|channel| format!("{}:{}", channel.to_lowercase(), request.action));
        let requirement = self.parts.approval_policy.snapshot().rules.resolve(
            policy_decision.risk_class,
            &request.tools,
            channel_action.as_deref(),
        );

        match self.parts.approvals.get_or_create_pending(
            &fingerprint,
            &requirement,
            self.approval_ttl,
            1,
            &policy_decision.reason,
            serde_json::json!({
                "matched_signals": policy_decision.matched_signals,
                "path": request.path,
            }),
        ) {
            Ok(record) => {
                invariants.check(INV_APPROVAL, true, None, None);
                Some(PipelineDecision {
                    verdict: GateVerdict::RequireApproval,
                    kind: DecisionKind::ApprovalRequired,
                    gate: "approval",
                    risk_class: policy_decision.risk_class,
                    matched_signals: policy_decision.matched_signals.clone(),
                    reason: policy_decision.reason.clone(),
                    approval_id: Some(record.id),
                })
            }
            Err(err) => {
                let reason = err.to_string();
                invariants.check(INV_APPROVAL, false, Some(&reason), None);
                Some(PipelineDecision::block(
                    "approval",
                    DecisionKind::TransientBackend,
                    reason,
                ))
            }
        }
    }

    /// Checks a channel delivery destination.
    ///
    /// Runs outside the per-request gate sequence: the connector layer
    /// calls it once per outbound message, after the message's request has
    /// already cleared the pipeline.
    #[must_use]
    pub fn check_destination(
        &self,
        channel: Option<&str>,
        destination: &str,
    ) -> PipelineDecision {
        let destinations = self.parts.destinations.snapshot();
        match gate::evaluate_destination(&destinations.rules, channel, destination) {
            Ok(()) => {
                self.parts
                    .invariants
                    .check(INV_CAPABILITY, true, None, None);
                PipelineDecision {
                    verdict: GateVerdict::Allow,
                    kind: DecisionKind::Allowed,
                    gate: "destination",
                    risk_class: RiskClass::Low,
                    matched_signals: Vec::new(),
                    reason: "Destination permitted.".to_string(),
                    approval_id: None,
                }
            }
            Err(deny) => {
                let reason = deny.to_string();
                self.parts
                    .invariants
                    .check(INV_CAPABILITY, false, Some(&reason), None);
                self.parts.audit.record_best_effort(
                    "system",
                    "pipeline.destination_deny",
                    destination,
                    serde_json::json!({"channel": channel, "reason": reason}),
                );
                PipelineDecision::block("destination", DecisionKind::DestinationDeny, reason)
            }
        }
    }

    /// Settles actual cost after the upstream response.
    ///
    /// Best-effort: a failed settle is surfaced through the audit alert
    /// path, never to the caller whose response is already in flight.
    pub fn settle_actual(
        &self,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        request_path: &str,
    ) {
        match self
            .parts
            .budget
            .record_actual(model, input_tokens, output_tokens, request_path)
        {
            Ok(recorded) => {
                self.parts
                    .invariants
                    .check(INV_BUDGET, !recorded.suspended, None, None);
            }
            Err(err) => {
                self.parts.audit.record_best_effort(
                    "system",
                    "budget.settle_failed",
                    request_path,
                    serde_json::json!({"error": err.to_string()}),
                );
            }
        }
    }
}
