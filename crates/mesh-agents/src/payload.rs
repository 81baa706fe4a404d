// payload.rs — Typed inputs and outputs exchanged with agent tools.
//
// On the wire every payload is JSON; inside the mesh the orchestrator works
// with these structs and converts at the adapter boundary with
// `to_value` / `from_value`. Money is always integer cents.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::catalog::Tool;
use crate::error::AgentError;

/// Resolution track chosen by the triage agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Track {
    Hardware,
    Software,
}

impl std::fmt::Display for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Track::Hardware => write!(f, "hardware"),
            Track::Software => write!(f, "software"),
        }
    }
}

/// Declared or derived intent of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Bug,
    Feature,
    Incident,
    Question,
}

/// Output of `classify_ticket`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub track: Track,
    pub intent: Intent,
    /// Model confidence in `[0, 1]`.
    pub confidence: f64,
    pub rationale: String,
    #[serde(default)]
    pub similar_tickets: Vec<String>,
}

/// Input of `create_issue`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRequest {
    pub ticket_id: String,
    pub subject: String,
    /// Tracker priority name (`Highest`, `High`, `Medium`, `Low`).
    pub priority: String,
    pub labels: Vec<String>,
    pub component: String,
    pub idempotency_key: String,
}

/// Output of `create_issue`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRef {
    pub key: String,
    pub project: String,
    pub url: String,
}

/// Reference to an uploaded log artifact (input of `analyze_log`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub name: String,
    /// `file://` path or opaque blob URI understood by the transport.
    pub uri: String,
    #[serde(default)]
    pub size_bytes: u64,
}

impl ArtifactRef {
    pub fn new(name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uri: uri.into(),
            size_bytes: 0,
        }
    }
}

/// Output of `analyze_log`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogFindings {
    pub root_cause: String,
    #[serde(default)]
    pub signals: Vec<String>,
    /// Timestamps (HH:MM:SS) of matching error lines.
    #[serde(default)]
    pub error_bursts: Vec<String>,
    pub recommended_action: String,
    /// Part number to replace, when the findings call for one.
    #[serde(default)]
    pub replacement_part: Option<String>,
    pub confidence: f64,
}

/// Input of `recommend_spare`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpareRequest {
    pub issue_key: String,
    pub part_no: String,
    /// Ticket site, used to prefer stock in the same region.
    pub site: String,
}

/// Output of `recommend_spare`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpareRecommendation {
    pub part_no: String,
    pub name: String,
    pub location: String,
    pub quantity: u32,
    pub unit_value_cents: u64,
    pub eta: String,
}

impl SpareRecommendation {
    pub fn total_value_cents(&self) -> u64 {
        self.unit_value_cents.saturating_mul(u64::from(self.quantity))
    }
}

/// Input of `reserve_spare`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveRequest {
    pub part_no: String,
    pub location: String,
    pub quantity: u32,
    pub idempotency_key: String,
}

/// Output of `reserve_spare`; the artifact strict mode protects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub part_no: String,
    pub location: String,
    pub quantity: u32,
    pub value_cents: u64,
    pub confirmation_id: String,
}

/// Serialize a tool input.
pub fn to_value<T: Serialize>(tool: Tool, payload: &T) -> Result<serde_json::Value, AgentError> {
    serde_json::to_value(payload).map_err(|source| AgentError::Payload {
        tool: tool.to_string(),
        source,
    })
}

/// Decode a tool output into its typed form.
pub fn from_value<T: DeserializeOwned>(
    tool: Tool,
    value: &serde_json::Value,
) -> Result<T, AgentError> {
    T::deserialize(value).map_err(|source| AgentError::Payload {
        tool: tool.to_string(),
        source,
    })
}
