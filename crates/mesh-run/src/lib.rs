//! # mesh-run
//!
//! Run orchestration for Agent Mesh: one ticket in, one sealed evidence pack
//! out.
//!
//! A [`RunOrchestrator`] drives a single run through the workflow state
//! machine, calling agents through the adapter, consulting the policy gate
//! before every side effect and recording everything in the run's evidence
//! ledger. The [`RunSupervisor`] gives each run its own task and routes
//! inbound events (new tickets, log artifacts, approvals) to it.
//!
//! ## Key components
//!
//! - [`RunOrchestrator`] — per-run state machine with retry, idempotency and
//!   recovery from a journal
//! - [`RunSupervisor`] — concurrent runs, approval deadlines and rate-limit
//!   retries
//! - [`EventLog`] — globally sequenced state-change events, with
//!   subscribe-from-sequence and [`NotificationSink`]s
//! - [`RunStore`] — JSON index of runs under `.mesh/runs/`
//! - [`Agentfile`] — YAML deployment description (policy, agents, settings)

pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod run;
pub mod store;
pub mod supervisor;

pub use config::{Agentfile, AgentfileMetadata, MeshPaths, OrchestratorSettings, SignerSettings};
pub use error::RunError;
pub use events::{EventLog, LogSink, NotificationSink, RunEvent, SequencedEvent, Subscription};
pub use orchestrator::{
    idempotency_key, ApprovalInput, ApprovalOutcome, Collaborators, RunOrchestrator, RUN_OPENED,
};
pub use run::{ApprovalGate, Clearance, Pending, Run, RunStatus};
pub use store::{RunRecord, RunStore};
pub use supervisor::{InboundEvent, ResumeFailure, ResumeReport, RunSupervisor, RunTarget};
