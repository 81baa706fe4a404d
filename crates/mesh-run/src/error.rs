// error.rs — Error types for run orchestration and supervision.

use std::path::PathBuf;

use mesh_agents::AgentError;
use mesh_audit::{LedgerError, RunState};
use mesh_policy::{PolicyError, Role};
use thiserror::Error;

/// Errors that can occur while driving or supervising runs.
///
/// Tool failures are not errors here: they are recorded as steps and end the
/// run in `FAILED` or `ABANDONED`. A `RunError` means the orchestrator itself
/// could not proceed (bad configuration, ledger I/O, misaddressed event).
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid Agentfile: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Attempted a transition the state machine does not allow.
    #[error("invalid transition for run {run_id}: {from} → {to}")]
    InvalidTransition {
        run_id: String,
        from: RunState,
        to: RunState,
    },

    /// An approval arrived for a run with no open gate.
    #[error("run {run_id} is not awaiting approval")]
    NotAwaitingApproval { run_id: String },

    /// An event arrived for a run that already finished.
    #[error("run {run_id} is terminal ({state})")]
    Terminal { run_id: String, state: RunState },

    /// The approver's role is below what the open gate requires.
    #[error("approval for run {run_id} refused: requires {required_role} or above")]
    ApprovalRefused { run_id: String, required_role: Role },

    /// A second log artifact arrived after one was already accepted.
    #[error("run {run_id} already has a log artifact")]
    UnexpectedArtifact { run_id: String },

    #[error("run not found: {0}")]
    UnknownRun(String),

    #[error("no run for ticket: {0}")]
    UnknownTicket(String),

    /// The journal could not be turned back into a run.
    #[error("cannot recover run from {path}: {reason}")]
    Recovery { path: PathBuf, reason: String },

    /// A run task went away before answering.
    #[error("run task failed: {0}")]
    TaskFailed(String),
}
