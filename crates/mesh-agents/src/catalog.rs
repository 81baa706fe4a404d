// catalog.rs — The closed set of agents and their declared tools.
//
// Every tool belongs to exactly one agent, so code inside the mesh names a
// `Tool` and derives the agent from it. String names only appear at the
// edges (Agentfile, CLI) and are resolved here once.
//
//   TriageAgent       classify_ticket, create_issue
//   LogAnalyzerAgent  analyze_log
//   SpareAgent        recommend_spare, reserve_spare

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// One of the three cooperating agents.
///
/// Serialized with the agent's display name (e.g. `"TriageAgent"`), which is
/// how evidence packs and dashboards refer to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AgentKind {
    TriageAgent,
    LogAnalyzerAgent,
    SpareAgent,
}

impl AgentKind {
    pub const ALL: [AgentKind; 3] = [
        AgentKind::TriageAgent,
        AgentKind::LogAnalyzerAgent,
        AgentKind::SpareAgent,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AgentKind::TriageAgent => "TriageAgent",
            AgentKind::LogAnalyzerAgent => "LogAnalyzerAgent",
            AgentKind::SpareAgent => "SpareAgent",
        }
    }

    /// The full capability set of this agent.
    pub fn capabilities(&self) -> &'static [Tool] {
        match self {
            AgentKind::TriageAgent => &[Tool::ClassifyTicket, Tool::CreateIssue],
            AgentKind::LogAnalyzerAgent => &[Tool::AnalyzeLog],
            AgentKind::SpareAgent => &[Tool::RecommendSpare, Tool::ReserveSpare],
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AgentKind {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "triageagent" | "triage" => Ok(AgentKind::TriageAgent),
            "loganalyzeragent" | "log_analyzer" | "loganalyzer" => Ok(AgentKind::LogAnalyzerAgent),
            "spareagent" | "spare" => Ok(AgentKind::SpareAgent),
            _ => Err(AgentError::UnknownAgent(s.to_string())),
        }
    }
}

/// A tool exposed by one of the agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    ClassifyTicket,
    CreateIssue,
    AnalyzeLog,
    RecommendSpare,
    ReserveSpare,
}

impl Tool {
    pub const ALL: [Tool; 5] = [
        Tool::ClassifyTicket,
        Tool::CreateIssue,
        Tool::AnalyzeLog,
        Tool::RecommendSpare,
        Tool::ReserveSpare,
    ];

    /// The agent that owns this tool.
    pub fn owner(&self) -> AgentKind {
        match self {
            Tool::ClassifyTicket | Tool::CreateIssue => AgentKind::TriageAgent,
            Tool::AnalyzeLog => AgentKind::LogAnalyzerAgent,
            Tool::RecommendSpare | Tool::ReserveSpare => AgentKind::SpareAgent,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Tool::ClassifyTicket => "classify_ticket",
            Tool::CreateIssue => "create_issue",
            Tool::AnalyzeLog => "analyze_log",
            Tool::RecommendSpare => "recommend_spare",
            Tool::ReserveSpare => "reserve_spare",
        }
    }

    /// Calling the tool twice has no additional external effect.
    ///
    /// Issue creation and spare reservation are the two irreversible actions;
    /// they are always invoked with an idempotency key.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, Tool::CreateIssue | Tool::ReserveSpare)
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Tool {
    type Err = AgentError;

    /// Accepts snake_case names and the camelCase names used by the tool
    /// endpoints (`classifyTicket`, `createJiraFromTicket`, ...).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "classifyticket" => Ok(Tool::ClassifyTicket),
            "createissue" | "createjirafromticket" | "createjira" => Ok(Tool::CreateIssue),
            "analyzelog" => Ok(Tool::AnalyzeLog),
            "recommendspare" => Ok(Tool::RecommendSpare),
            "reservespare" => Ok(Tool::ReserveSpare),
            _ => Err(AgentError::UnknownTool(s.to_string())),
        }
    }
}

/// Resolve a string `(agent, tool)` pair, rejecting tools the agent does not own.
pub fn resolve(agent: &str, tool: &str) -> Result<(AgentKind, Tool), AgentError> {
    let agent = agent.parse::<AgentKind>()?;
    let tool = tool.parse::<Tool>()?;
    if tool.owner() != agent {
        return Err(AgentError::ToolNotDeclared {
            agent: agent.to_string(),
            tool: tool.to_string(),
        });
    }
    Ok((agent, tool))
}

/// The deployed version and declared tools of one agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentManifest {
    #[serde(rename = "name")]
    pub kind: AgentKind,
    #[serde(default)]
    pub version: String,
    pub tools: Vec<Tool>,
}

/// Declared capability sets for the agents of one deployment.
///
/// A deployment may declare fewer tools than an agent supports (e.g. spare
/// reservation switched off); a run that needs an undeclared tool is refused
/// when it is constructed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct AgentCatalog {
    agents: Vec<AgentManifest>,
}

impl AgentCatalog {
    pub fn new(agents: Vec<AgentManifest>) -> Result<Self, AgentError> {
        let catalog = Self { agents };
        catalog.validate()?;
        Ok(catalog)
    }

    /// Check that every listed tool is owned by the agent listing it.
    pub fn validate(&self) -> Result<(), AgentError> {
        for manifest in &self.agents {
            for tool in &manifest.tools {
                if tool.owner() != manifest.kind {
                    return Err(AgentError::ToolNotDeclared {
                        agent: manifest.kind.to_string(),
                        tool: tool.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn manifest(&self, kind: AgentKind) -> Option<&AgentManifest> {
        self.agents.iter().find(|m| m.kind == kind)
    }

    pub fn manifests(&self) -> &[AgentManifest] {
        &self.agents
    }

    /// Whether the tool's owning agent declares it.
    pub fn declares(&self, tool: Tool) -> bool {
        self.manifest(tool.owner())
            .is_some_and(|m| m.tools.contains(&tool))
    }

    /// Fail on the first tool in `required` that is not declared.
    pub fn require(&self, required: &[Tool]) -> Result<(), AgentError> {
        match required.iter().find(|t| !self.declares(**t)) {
            Some(tool) => Err(AgentError::ToolNotDeclared {
                agent: tool.owner().to_string(),
                tool: tool.to_string(),
            }),
            None => Ok(()),
        }
    }
}

impl Default for AgentCatalog {
    /// All three agents with their full capability sets.
    fn default() -> Self {
        let version = |kind: AgentKind| match kind {
            AgentKind::TriageAgent => "2.1.3",
            AgentKind::LogAnalyzerAgent => "1.8.2",
            AgentKind::SpareAgent => "1.4.1",
        };
        Self {
            agents: AgentKind::ALL
                .iter()
                .map(|kind| AgentManifest {
                    kind: *kind,
                    version: version(*kind).to_string(),
                    tools: kind.capabilities().to_vec(),
                })
                .collect(),
        }
    }
}
