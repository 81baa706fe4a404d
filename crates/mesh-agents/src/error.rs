// error.rs — Error types for agent lookup and tool invocation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A failed tool call, as observed by the adapter.
///
/// Both variants are returned to the caller as typed outcomes. The adapter
/// never swallows them and never retries on its own.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum ToolError {
    /// Transport-level failure (network, process, timeout). Transient.
    #[error("tool unavailable: {0}")]
    Unavailable(String),

    /// The tool validated the request and refused it. Not retryable.
    #[error("tool rejected the request: {0}")]
    Rejected(String),
}

impl ToolError {
    /// Only transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ToolError::Unavailable(_))
    }
}

/// Errors raised while resolving agents, tools, and payloads.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The agent name is not one of the known agents.
    #[error("unknown agent '{0}'")]
    UnknownAgent(String),

    /// The tool name is not part of any agent's capability set.
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    /// The tool exists but is not declared by the given agent.
    #[error("tool '{tool}' is not declared by agent '{agent}'")]
    ToolNotDeclared { agent: String, tool: String },

    /// A tool returned (or was given) a payload that does not match its schema.
    #[error("malformed payload for tool '{tool}': {source}")]
    Payload {
        tool: String,
        source: serde_json::Error,
    },
}
