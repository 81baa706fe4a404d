// run.rs — The Run record and what a suspended run is waiting for.
//
// A `Run` is owned by exactly one `RunOrchestrator`. Its ticket and policy
// snapshot are fixed when it opens; everything else is derived from what
// has been recorded in its ledger, which is why a run can be rebuilt from
// its journal after a restart.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use mesh_agents::{
    ArtifactRef, Classification, IssueRef, LogFindings, Reservation, SpareRecommendation, Tool,
};
use mesh_audit::{FailureKind, RunState};
use mesh_policy::{GateRule, PolicyConfig, Role, Ticket};
use serde::{Deserialize, Serialize};

/// An open approval gate, as recorded in the `hold` of the step that opened it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalGate {
    /// Sequence index of the step the approval resolves.
    pub gate_step: u64,
    pub tool: Tool,
    pub rule: GateRule,
    pub required_role: Role,
    pub reason: String,
    pub requested_at: DateTime<Utc>,
    /// For rate-limit holds: when the window next has room.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
}

impl ApprovalGate {
    /// When an unanswered gate abandons the run. Rate-limit holds never
    /// expire; they retry at `retry_at` instead.
    pub fn deadline(&self, timeout: chrono::Duration) -> Option<DateTime<Utc>> {
        match self.rule {
            GateRule::RateLimitOverride => None,
            _ => Some(self.requested_at + timeout),
        }
    }
}

/// Why a non-terminal run is suspended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "waiting_for", rename_all = "snake_case")]
pub enum Pending {
    Approval(ApprovalGate),
    Artifact,
}

/// A gate that has been passed for a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clearance {
    pub tool: Tool,
    /// Passed by a human approval rather than automatically. Approved
    /// actions do not consume the rate limiter.
    pub approved: bool,
}

#[derive(Debug, Clone)]
pub struct Run {
    pub id: String,
    pub tenant: String,
    pub ticket: Ticket,
    pub policy: Arc<PolicyConfig>,
    pub state: RunState,
    pub pending: Option<Pending>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure: Option<FailureKind>,
    pub classification: Option<Classification>,
    pub issue: Option<IssueRef>,
    pub artifact: Option<ArtifactRef>,
    pub findings: Option<LogFindings>,
    pub recommendation: Option<SpareRecommendation>,
    pub reservation: Option<Reservation>,
    pub cleared: Option<Clearance>,
}

impl Run {
    pub fn new(
        id: impl Into<String>,
        tenant: impl Into<String>,
        ticket: Ticket,
        policy: Arc<PolicyConfig>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            tenant: tenant.into(),
            ticket,
            policy,
            state: RunState::Created,
            pending: None,
            started_at,
            finished_at: None,
            failure: None,
            classification: None,
            issue: None,
            artifact: None,
            findings: None,
            recommendation: None,
            reservation: None,
            cleared: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn open_gate(&self) -> Option<&ApprovalGate> {
        match &self.pending {
            Some(Pending::Approval(gate)) => Some(gate),
            _ => None,
        }
    }

    /// Whether the gate for `tool` has been passed.
    pub fn clearance_for(&self, tool: Tool) -> Option<Clearance> {
        self.cleared.filter(|c| c.tool == tool)
    }

    pub fn status(&self) -> RunStatus {
        RunStatus {
            run_id: self.id.clone(),
            ticket_id: self.ticket.id.clone(),
            state: self.state,
            pending: self.pending.clone(),
            failure: self.failure,
        }
    }
}

/// Point-in-time view of a run, returned to callers of the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatus {
    pub run_id: String,
    pub ticket_id: String,
    pub state: RunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<Pending>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

impl RunStatus {
    pub fn is_awaiting_approval(&self) -> bool {
        matches!(self.pending, Some(Pending::Approval(_)))
    }
}
