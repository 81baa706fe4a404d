// gate.rs — Policy gate evaluator.
//
// Every side-effecting step of a run passes through `evaluate()` first.
// Rules are checked in order and the first match wins:
//
// 0. Structurally invalid action (undeclared tool, zero quantity) → Deny
// 1. Strict mode and a reservation above the threshold or across regions
//    → RequireApproval (exec)
// 2. Tracking issue for a P1 ticket with p1_needs_approval → RequireApproval
// 3. Ticket flagged as containing PII → RequireApproval
// 4. Ticket flagged with external impact → RequireApproval
// 5. Triggering confidence below the threshold → RequireApproval
// 6. Otherwise → Allow
//
// The gate holds only the declared agent catalog. It reads nothing else and
// writes nothing, so identical inputs always give identical decisions.

use mesh_agents::{AgentCatalog, AgentKind, SpareRecommendation, Tool};
use serde::{Deserialize, Serialize};

use crate::config::PolicyConfig;
use crate::role::Role;
use crate::ticket::{region_of, Priority, Ticket};

/// What the orchestrator wants to do, with the facts the rules need.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedAction {
    pub agent: AgentKind,
    pub tool: Tool,
    pub kind: ActionKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionKind {
    CreateIssue {
        /// Classification confidence.
        confidence: f64,
    },
    ReserveSpare {
        part_no: String,
        source_location: String,
        quantity: u32,
        value_cents: u64,
        /// Log-findings confidence.
        confidence: f64,
    },
}

impl ProposedAction {
    pub fn create_issue(confidence: f64) -> Self {
        Self {
            agent: AgentKind::TriageAgent,
            tool: Tool::CreateIssue,
            kind: ActionKind::CreateIssue { confidence },
        }
    }

    pub fn reserve_spare(recommendation: &SpareRecommendation, confidence: f64) -> Self {
        Self {
            agent: AgentKind::SpareAgent,
            tool: Tool::ReserveSpare,
            kind: ActionKind::ReserveSpare {
                part_no: recommendation.part_no.clone(),
                source_location: recommendation.location.clone(),
                quantity: recommendation.quantity,
                value_cents: recommendation.total_value_cents(),
                confidence,
            },
        }
    }

    pub fn confidence(&self) -> f64 {
        match &self.kind {
            ActionKind::CreateIssue { confidence } => *confidence,
            ActionKind::ReserveSpare { confidence, .. } => *confidence,
        }
    }

    fn expected_tool(&self) -> Tool {
        match self.kind {
            ActionKind::CreateIssue { .. } => Tool::CreateIssue,
            ActionKind::ReserveSpare { .. } => Tool::ReserveSpare,
        }
    }
}

/// Which approval rule fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateRule {
    StrictModeReservation,
    P1Issue,
    ContainsPii,
    ExternalImpact,
    LowConfidence,
    /// Raised by the orchestrator, not by `evaluate`: a run blocked by the
    /// rate limiter asks for an explicit override.
    RateLimitOverride,
}

impl GateRule {
    /// Rules consulted by `evaluate`, in priority order.
    pub const ORDER: [GateRule; 5] = [
        GateRule::StrictModeReservation,
        GateRule::P1Issue,
        GateRule::ContainsPii,
        GateRule::ExternalImpact,
        GateRule::LowConfidence,
    ];

    /// Minimum role that may approve an action held by this rule.
    pub fn required_role(&self) -> Role {
        match self {
            GateRule::StrictModeReservation => Role::Exec,
            _ => Role::Head,
        }
    }

    pub fn check_name(&self) -> &'static str {
        match self {
            GateRule::StrictModeReservation => "strict_mode",
            GateRule::P1Issue => "p1_issue",
            GateRule::ContainsPii => "contains_pii",
            GateRule::ExternalImpact => "external_impact",
            GateRule::LowConfidence => "confidence",
            GateRule::RateLimitOverride => "rate_limit",
        }
    }

    /// `Some(reason)` when this rule holds the action.
    fn holds(&self, action: &ProposedAction, ticket: &Ticket, policy: &PolicyConfig) -> Option<String> {
        match self {
            GateRule::StrictModeReservation => {
                let ActionKind::ReserveSpare {
                    source_location,
                    value_cents,
                    ..
                } = &action.kind
                else {
                    return None;
                };
                if !policy.strict_mode {
                    return None;
                }
                let over = *value_cents > policy.strict_mode_threshold_cents;
                let crosses = region_of(source_location) != ticket.region();
                match (over, crosses) {
                    (false, false) => None,
                    (true, false) => Some(format!(
                        "strict mode: reservation value {} exceeds {}",
                        dollars(*value_cents),
                        dollars(policy.strict_mode_threshold_cents)
                    )),
                    (false, true) => Some(format!(
                        "strict mode: reservation from {source_location} crosses into site {}",
                        ticket.site
                    )),
                    (true, true) => Some(format!(
                        "strict mode: {} reservation from {source_location} exceeds {} and crosses into site {}",
                        dollars(*value_cents),
                        dollars(policy.strict_mode_threshold_cents),
                        ticket.site
                    )),
                }
            }
            GateRule::P1Issue => (matches!(action.kind, ActionKind::CreateIssue { .. })
                && ticket.priority == Priority::P1
                && policy.p1_needs_approval)
                .then(|| "P1 ticket requires approval before issue creation".to_string()),
            GateRule::ContainsPii => (ticket.policy_flags.contains_pii && policy.pii_approval_required)
                .then(|| "ticket contains PII".to_string()),
            GateRule::ExternalImpact => (ticket.policy_flags.external_impact
                && policy.external_impact_approval_required)
                .then(|| "ticket has external impact".to_string()),
            GateRule::LowConfidence => (action.confidence() < policy.confidence_threshold).then(|| {
                format!(
                    "confidence {:.2} below threshold {:.2}",
                    action.confidence(),
                    policy.confidence_threshold
                )
            }),
            GateRule::RateLimitOverride => None,
        }
    }
}

impl std::fmt::Display for GateRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.check_name())
    }
}

/// Outcome of a gate evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    /// Proceed automatically.
    Allow,
    /// Hold until an operator with `required_role` or above approves.
    RequireApproval {
        rule: GateRule,
        required_role: Role,
        reason: String,
    },
    /// Structurally invalid; fatal to the run.
    Deny { reason: String },
}

impl GateDecision {
    pub fn label(&self) -> &'static str {
        match self {
            GateDecision::Allow => "ALLOW",
            GateDecision::RequireApproval { .. } => "REQUIRE_APPROVAL",
            GateDecision::Deny { .. } => "DENY",
        }
    }
}

/// One check performed during evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationStep {
    pub check: String,
    pub outcome: String,
    /// Whether this check decided the result.
    pub terminal: bool,
}

impl EvaluationStep {
    fn passed(check: &str) -> Self {
        Self {
            check: check.to_string(),
            outcome: "passed".to_string(),
            terminal: false,
        }
    }

    fn terminal(check: &str, outcome: String) -> Self {
        Self {
            check: check.to_string(),
            outcome,
            terminal: true,
        }
    }
}

/// A decision plus the ordered checks that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationTrace {
    pub decision: GateDecision,
    pub steps: Vec<EvaluationStep>,
}

/// Pure decision function over `(action, ticket, policy)`.
#[derive(Debug, Clone, Default)]
pub struct PolicyGate {
    catalog: AgentCatalog,
}

impl PolicyGate {
    pub fn new(catalog: AgentCatalog) -> Self {
        Self { catalog }
    }

    pub fn evaluate(&self, action: &ProposedAction, ticket: &Ticket, policy: &PolicyConfig) -> GateDecision {
        self.evaluate_with_trace(action, ticket, policy).decision
    }

    pub fn evaluate_with_trace(
        &self,
        action: &ProposedAction,
        ticket: &Ticket,
        policy: &PolicyConfig,
    ) -> EvaluationTrace {
        let mut steps = Vec::new();

        if let Some(reason) = self.structural_violation(action) {
            steps.push(EvaluationStep::terminal("structure", format!("failed: {reason}")));
            return EvaluationTrace {
                decision: GateDecision::Deny { reason },
                steps,
            };
        }
        steps.push(EvaluationStep::passed("structure"));

        for rule in GateRule::ORDER {
            match rule.holds(action, ticket, policy) {
                Some(reason) => {
                    steps.push(EvaluationStep::terminal(
                        rule.check_name(),
                        format!("matched: {reason}"),
                    ));
                    return EvaluationTrace {
                        decision: GateDecision::RequireApproval {
                            rule,
                            required_role: rule.required_role(),
                            reason,
                        },
                        steps,
                    };
                }
                None => steps.push(EvaluationStep::passed(rule.check_name())),
            }
        }

        steps.push(EvaluationStep::terminal("default", "allow".to_string()));
        EvaluationTrace {
            decision: GateDecision::Allow,
            steps,
        }
    }

    fn structural_violation(&self, action: &ProposedAction) -> Option<String> {
        if action.tool.owner() != action.agent {
            return Some(format!("{} does not own tool '{}'", action.agent, action.tool));
        }
        if action.tool != action.expected_tool() {
            return Some(format!(
                "tool '{}' does not perform the proposed action",
                action.tool
            ));
        }
        if !self.catalog.declares(action.tool) {
            return Some(format!(
                "tool '{}' is not in {}'s declared capability set",
                action.tool, action.agent
            ));
        }
        if let ActionKind::ReserveSpare { quantity: 0, .. } = action.kind {
            return Some("reservation quantity must be positive".to_string());
        }
        None
    }
}

fn dollars(cents: u64) -> String {
    format!("${}.{:02}", cents / 100, cents % 100)
}
