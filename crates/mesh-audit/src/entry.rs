// entry.rs — Steps and approvals, the two kinds of ledger entry.
//
// Entries are append-only: once the ledger assigns `seq`, `recorded_at` and
// `chain_hash`, nothing mutates them. The canonical bytes of an entry are
// its JSON form (tagged with `entry`) with `chain_hash` removed.

use std::fmt;

use chrono::{DateTime, Utc};
use mesh_agents::{AgentKind, Tool};
use mesh_policy::Role;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::CanonicalBytes;
use crate::state::{FailureKind, RunState, StateTransition};

/// Actor name on steps taken by the orchestrator itself.
pub const ORCHESTRATOR: &str = "orchestrator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Decision,
    ToolCall,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Decision => write!(f, "DECISION"),
            StepKind::ToolCall => write!(f, "TOOL_CALL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    /// A failed attempt that was followed by another attempt.
    Retried,
    Failed,
    RateLimited,
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::Success => write!(f, "SUCCESS"),
            StepOutcome::Retried => write!(f, "RETRIED"),
            StepOutcome::Failed => write!(f, "FAILED"),
            StepOutcome::RateLimited => write!(f, "RATE_LIMITED"),
        }
    }
}

/// One recorded unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub seq: u64,
    /// Acting agent name, or [`ORCHESTRATOR`].
    pub agent: String,
    pub kind: StepKind,
    /// Short name of what happened: a tool name, `run_opened`, `transition`,
    /// `gate`, `approval_refused`, ...
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<Tool>,
    pub input: Value,
    pub output: Value,
    pub latency_ms: u64,
    pub outcome: StepOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition: Option<StateTransition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    pub recorded_at: DateTime<Utc>,
    pub chain_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

impl fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalDecision::Approved => write!(f, "APPROVED"),
            ApprovalDecision::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// A human decision on a gate, written exactly once per gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub seq: u64,
    pub actor: String,
    pub role: Role,
    /// Channel the decision arrived through (`agent_mesh`, `cli`, ...).
    pub channel: String,
    pub decision: ApprovalDecision,
    /// Sequence index of the gate step this decision resolves.
    pub gates_step: u64,
    pub decided_at: DateTime<Utc>,
    pub chain_hash: String,
}

/// A ledger entry in chain order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum LedgerEntry {
    Step(Step),
    Approval(Approval),
}

impl LedgerEntry {
    pub fn seq(&self) -> u64 {
        match self {
            LedgerEntry::Step(s) => s.seq,
            LedgerEntry::Approval(a) => a.seq,
        }
    }

    pub fn chain_hash(&self) -> &str {
        match self {
            LedgerEntry::Step(s) => &s.chain_hash,
            LedgerEntry::Approval(a) => &a.chain_hash,
        }
    }

    pub(crate) fn set_chain_hash(&mut self, hash: String) {
        match self {
            LedgerEntry::Step(s) => s.chain_hash = hash,
            LedgerEntry::Approval(a) => a.chain_hash = hash,
        }
    }

    /// Canonical bytes hashed into the chain (`chain_hash` excluded).
    pub fn canonical_bytes(&self) -> Result<CanonicalBytes, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.remove("chain_hash");
        }
        CanonicalBytes::from_value(value)
    }

    pub fn as_step(&self) -> Option<&Step> {
        match self {
            LedgerEntry::Step(s) => Some(s),
            LedgerEntry::Approval(_) => None,
        }
    }

    pub fn as_approval(&self) -> Option<&Approval> {
        match self {
            LedgerEntry::Approval(a) => Some(a),
            LedgerEntry::Step(_) => None,
        }
    }
}

/// A step before the ledger assigns its sequence, timestamp and hash.
#[derive(Debug, Clone, PartialEq)]
pub struct StepDraft {
    pub agent: String,
    pub kind: StepKind,
    pub label: String,
    pub tool: Option<Tool>,
    pub input: Value,
    pub output: Value,
    pub latency_ms: u64,
    pub outcome: StepOutcome,
    pub attempt: Option<u32>,
    pub idempotency_key: Option<String>,
    pub transition: Option<StateTransition>,
    pub failure: Option<FailureKind>,
}

impl StepDraft {
    /// An orchestrator decision.
    pub fn decision(label: &str, input: Value, output: Value) -> Self {
        Self {
            agent: ORCHESTRATOR.to_string(),
            kind: StepKind::Decision,
            label: label.to_string(),
            tool: None,
            input,
            output,
            latency_ms: 0,
            outcome: StepOutcome::Success,
            attempt: None,
            idempotency_key: None,
            transition: None,
            failure: None,
        }
    }

    /// A state transition, recorded as a decision.
    pub fn transition(from: RunState, to: RunState, input: Value) -> Self {
        let mut draft = Self::decision(
            "transition",
            input,
            serde_json::json!({ "state": to.to_string() }),
        );
        draft.transition = Some(StateTransition { from, to });
        draft
    }

    /// A call to an agent tool.
    pub fn tool_call(
        agent: AgentKind,
        tool: Tool,
        input: Value,
        output: Value,
        latency_ms: u64,
        outcome: StepOutcome,
    ) -> Self {
        Self {
            agent: agent.to_string(),
            kind: StepKind::ToolCall,
            label: tool.to_string(),
            tool: Some(tool),
            input,
            output,
            latency_ms,
            outcome,
            attempt: None,
            idempotency_key: None,
            transition: None,
            failure: None,
        }
    }

    pub fn with_agent(mut self, agent: AgentKind) -> Self {
        self.agent = agent.to_string();
        self
    }

    pub fn with_tool(mut self, tool: Tool) -> Self {
        self.tool = Some(tool);
        self
    }

    pub fn with_outcome(mut self, outcome: StepOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_failure(mut self, failure: FailureKind) -> Self {
        self.failure = Some(failure);
        self
    }

    pub(crate) fn into_step(self, seq: u64, recorded_at: DateTime<Utc>) -> Step {
        Step {
            seq,
            agent: self.agent,
            kind: self.kind,
            label: self.label,
            tool: self.tool,
            input: self.input,
            output: self.output,
            latency_ms: self.latency_ms,
            outcome: self.outcome,
            attempt: self.attempt,
            idempotency_key: self.idempotency_key,
            transition: self.transition,
            failure: self.failure,
            recorded_at,
            chain_hash: String::new(),
        }
    }
}

/// An approval before the ledger assigns its sequence, timestamp and hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalDraft {
    pub actor: String,
    pub role: Role,
    pub channel: String,
    pub decision: ApprovalDecision,
    pub gates_step: u64,
}

impl ApprovalDraft {
    pub(crate) fn into_approval(self, seq: u64, decided_at: DateTime<Utc>) -> Approval {
        Approval {
            seq,
            actor: self.actor,
            role: self.role,
            channel: self.channel,
            decision: self.decision,
            gates_step: self.gates_step,
            decided_at,
            chain_hash: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step() -> LedgerEntry {
        LedgerEntry::Step(
            StepDraft::decision("run_opened", json!({"run_id": "r"}), json!({}))
                .into_step(0, crate::canonical::now()),
        )
    }

    #[test]
    fn canonical_bytes_exclude_chain_hash() {
        let mut a = step();
        let before = a.canonical_bytes().unwrap();
        a.set_chain_hash("ff".repeat(32));
        assert_eq!(a.canonical_bytes().unwrap(), before);
        let text = String::from_utf8(before.as_bytes().to_vec()).unwrap();
        assert!(!text.contains("chain_hash"));
        assert!(text.contains(r#""entry":"step""#));
    }

    #[test]
    fn entry_json_round_trips_tagged() {
        let e = step();
        let json = serde_json::to_string(&e).unwrap();
        let back: LedgerEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
        assert_eq!(back.canonical_bytes().unwrap(), e.canonical_bytes().unwrap());
    }

    #[test]
    fn transition_draft_carries_typed_edge() {
        let d = StepDraft::transition(RunState::Created, RunState::Classifying, json!({}));
        assert_eq!(d.kind, StepKind::Decision);
        assert_eq!(
            d.transition,
            Some(StateTransition {
                from: RunState::Created,
                to: RunState::Classifying
            })
        );
        assert_eq!(d.output["state"], "CLASSIFYING");
    }
}
