// state.rs — Run states, transitions and the failure taxonomy.
//
// The orchestrator owns the run; this vocabulary lives next to the ledger so
// that replay can check recorded transitions without depending on it.
//
//   Created → Classifying → AwaitingApproval → IssueCreated
//                         ↘ IssueCreated → LogAnalysisPending → LogAnalyzed
//   LogAnalyzed → SparePending → SpareReserved → Resolved
//   LogAnalyzed → Resolved
//   any non-terminal → Failed | Abandoned

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    Classifying,
    AwaitingApproval,
    IssueCreated,
    LogAnalysisPending,
    LogAnalyzed,
    SparePending,
    SpareReserved,
    Resolved,
    Failed,
    Abandoned,
}

impl RunState {
    /// Check whether transitioning from `self` to `next` is valid.
    pub fn can_transition_to(&self, next: &RunState) -> bool {
        use RunState::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Created, Classifying)
                | (Classifying, AwaitingApproval)
                | (Classifying, IssueCreated)
                | (AwaitingApproval, IssueCreated)
                | (IssueCreated, LogAnalysisPending)
                | (LogAnalysisPending, LogAnalyzed)
                | (LogAnalyzed, SparePending)
                | (LogAnalyzed, Resolved)
                | (SparePending, SpareReserved)
                | (SpareReserved, Resolved)
                | (_, Failed)
                | (_, Abandoned)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Resolved | RunState::Failed | RunState::Abandoned)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunState::Created => "CREATED",
            RunState::Classifying => "CLASSIFYING",
            RunState::AwaitingApproval => "AWAITING_APPROVAL",
            RunState::IssueCreated => "ISSUE_CREATED",
            RunState::LogAnalysisPending => "LOG_ANALYSIS_PENDING",
            RunState::LogAnalyzed => "LOG_ANALYZED",
            RunState::SparePending => "SPARE_PENDING",
            RunState::SpareReserved => "SPARE_RESERVED",
            RunState::Resolved => "RESOLVED",
            RunState::Failed => "FAILED",
            RunState::Abandoned => "ABANDONED",
        };
        f.write_str(label)
    }
}

/// One edge of the run state machine, as recorded in a transition step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: RunState,
    pub to: RunState,
}

impl StateTransition {
    pub fn is_legal(&self) -> bool {
        self.from.can_transition_to(&self.to)
    }
}

impl fmt::Display for StateTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} → {}", self.from, self.to)
    }
}

/// Why a run ended in `Failed` or `Abandoned`, or why a step did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transport-level failure; the only retryable kind.
    ToolUnavailable,
    ToolRejected,
    RateLimited,
    ApprovalTimeout,
    ApprovalRejected,
    PolicyDenied,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::ToolUnavailable)
    }

    pub fn from_tool_error(err: &mesh_agents::ToolError) -> Self {
        match err {
            mesh_agents::ToolError::Unavailable(_) => FailureKind::ToolUnavailable,
            mesh_agents::ToolError::Rejected(_) => FailureKind::ToolRejected,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::ToolUnavailable => "ToolUnavailable",
            FailureKind::ToolRejected => "ToolRejected",
            FailureKind::RateLimited => "RateLimited",
            FailureKind::ApprovalTimeout => "ApprovalTimeout",
            FailureKind::ApprovalRejected => "ApprovalRejected",
            FailureKind::PolicyDenied => "PolicyDenied",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn golden_path_is_legal() {
        let path = [
            RunState::Created,
            RunState::Classifying,
            RunState::IssueCreated,
            RunState::LogAnalysisPending,
            RunState::LogAnalyzed,
            RunState::SparePending,
            RunState::SpareReserved,
            RunState::Resolved,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(&pair[1]), "{} → {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn terminal_states_are_final() {
        for terminal in [RunState::Resolved, RunState::Failed, RunState::Abandoned] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(&RunState::Failed));
            assert!(!terminal.can_transition_to(&RunState::Classifying));
        }
    }

    #[test]
    fn skipping_states_is_illegal() {
        assert!(!RunState::Classifying.can_transition_to(&RunState::LogAnalyzed));
        assert!(!RunState::IssueCreated.can_transition_to(&RunState::Resolved));
        assert!(!RunState::AwaitingApproval.can_transition_to(&RunState::Classifying));
    }

    #[test]
    fn any_live_state_can_fail_or_be_abandoned() {
        assert!(RunState::Created.can_transition_to(&RunState::Failed));
        assert!(RunState::IssueCreated.can_transition_to(&RunState::Abandoned));
        assert!(RunState::SparePending.can_transition_to(&RunState::Abandoned));
    }

    #[test]
    fn only_unavailable_is_retryable() {
        assert!(FailureKind::ToolUnavailable.is_retryable());
        assert!(!FailureKind::ToolRejected.is_retryable());
        assert!(!FailureKind::RateLimited.is_retryable());
        assert!(!FailureKind::ApprovalTimeout.is_retryable());
    }

    #[test]
    fn display_uses_screaming_labels() {
        assert_eq!(RunState::AwaitingApproval.to_string(), "AWAITING_APPROVAL");
        assert_eq!(
            serde_json::to_value(RunState::AwaitingApproval).unwrap(),
            serde_json::json!("awaiting_approval")
        );
    }
}
