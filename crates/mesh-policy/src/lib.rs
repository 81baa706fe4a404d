//! # mesh-policy
//!
//! Governance for Agent Mesh runs.
//!
//! Every side-effecting step of a run is checked by the [`PolicyGate`]
//! against an immutable [`PolicyConfig`] snapshot taken when the run starts.
//! The gate is a pure function: identical `(action, ticket, policy)` inputs
//! always produce the identical [`GateDecision`].
//!
//! Shared, mutable governance state is limited to two injected collaborators:
//! the [`PolicyStore`] (versioned, read-mostly, hands out `Arc` snapshots) and
//! the [`RateLimiter`] (atomic consume over a sliding one-hour window).

pub mod config;
pub mod error;
pub mod gate;
pub mod rate_limit;
pub mod role;
pub mod store;
pub mod ticket;

pub use config::{PolicyConfig, PolicyPatch};
pub use error::PolicyError;
pub use gate::{
    ActionKind, EvaluationStep, EvaluationTrace, GateDecision, GateRule, PolicyGate,
    ProposedAction,
};
pub use rate_limit::{ActionClass, RateLimiter, RATE_WINDOW};
pub use role::Role;
pub use store::PolicyStore;
pub use ticket::{Priority, PolicyFlags, Ticket};
