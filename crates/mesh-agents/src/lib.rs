//! # mesh-agents
//!
//! The three cooperating agents of Agent Mesh and the uniform adapter used to
//! call their tools.
//!
//! The agent set is closed: [`AgentKind`] names the agents and [`Tool`] names
//! every tool, each tool owned by exactly one agent. Invalid `(agent, tool)`
//! pairs can only come from outside input and are rejected when parsed.
//!
//! ## Key components
//!
//! - [`AgentCatalog`] — declared tool list per agent (loadable from an Agentfile)
//! - [`AgentAdapter`] — invokes a tool through an [`AgentTransport`], measuring
//!   latency and enforcing the per-call timeout; it never retries
//! - [`SimulatedTransport`] — deterministic in-process agents for demos and tests
//! - [`payload`] — typed inputs and outputs exchanged with the tools

pub mod adapter;
pub mod catalog;
pub mod error;
pub mod payload;
pub mod simulated;

pub use adapter::{AgentAdapter, AgentTransport, Invocation, ToolCall, DEFAULT_CALL_TIMEOUT};
pub use catalog::{AgentCatalog, AgentKind, AgentManifest, Tool};
pub use error::{AgentError, ToolError};
pub use payload::{
    ArtifactRef, Classification, Intent, IssueRef, IssueRequest, LogFindings, Reservation,
    ReserveRequest, SpareRecommendation, SpareRequest, Track,
};
pub use simulated::{InventoryItem, SimulatedTransport};
