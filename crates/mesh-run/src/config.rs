// config.rs — Agentfile loading, orchestrator settings and the `.mesh/` layout.
//
// An Agentfile is the YAML document that describes one deployment: who the
// tenant is, which governance policy applies, which tools each agent
// declares, and how patient the orchestrator is. Every section is optional
// and falls back to its defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use mesh_agents::AgentCatalog;
use mesh_policy::PolicyConfig;
use serde::{Deserialize, Serialize};

use crate::error::RunError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentfileMetadata {
    pub name: String,
    pub version: String,
    pub tenant: String,
}

impl Default for AgentfileMetadata {
    fn default() -> Self {
        Self {
            name: "first-action-worker".to_string(),
            version: "1.0".to_string(),
            tenant: "default".to_string(),
        }
    }
}

/// Timeouts, retry bound and backoff for every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// How long an approval gate stays open before the run is abandoned.
    pub approval_timeout_secs: u64,
    /// Per-call bound on an agent tool invocation.
    pub call_timeout_secs: u64,
    /// Total attempts for a retryable tool failure, first call included.
    pub max_attempts: u32,
    /// Backoff before attempt `n + 1` is `backoff_base_ms · 2^(n-1)`.
    pub backoff_base_ms: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            approval_timeout_secs: 86_400,
            call_timeout_secs: 30,
            max_attempts: 3,
            backoff_base_ms: 2_000,
        }
    }
}

impl OrchestratorSettings {
    pub fn approval_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.approval_timeout_secs).unwrap_or(i64::MAX))
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Delay after failed attempt `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignerSettings {
    /// Identity recorded as `signed_by` in attestations.
    pub id: String,
    /// PKCS#8 Ed25519 key for the local signer. A fresh key is generated
    /// when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
}

impl Default for SignerSettings {
    fn default() -> Self {
        Self {
            id: "mesh-local-signer".to_string(),
            key_path: None,
        }
    }
}

/// A parsed and validated Agentfile.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Agentfile {
    pub metadata: AgentfileMetadata,
    pub policies: PolicyConfig,
    pub agents: AgentCatalog,
    pub orchestrator: OrchestratorSettings,
    pub signer: SignerSettings,
}

impl Agentfile {
    pub fn load(path: &Path) -> Result<Self, RunError> {
        let yaml = std::fs::read_to_string(path).map_err(|source| RunError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, RunError> {
        let agentfile: Agentfile = serde_yaml::from_str(yaml)?;
        agentfile.agents.validate()?;
        agentfile.policies.validate()?;
        Ok(agentfile)
    }

    pub fn to_yaml(&self) -> Result<String, RunError> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Where run state lives on disk, under `<project>/.mesh/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshPaths {
    pub root: PathBuf,
    pub runs_dir: PathBuf,
    pub packs_dir: PathBuf,
    pub events_log: PathBuf,
}

impl MeshPaths {
    /// Standard `.mesh/` layout for a project.
    pub fn for_project(project_root: impl AsRef<Path>) -> Self {
        let root = project_root.as_ref().join(".mesh");
        Self {
            runs_dir: root.join("runs"),
            packs_dir: root.join("packs"),
            events_log: root.join("events.jsonl"),
            root,
        }
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }

    pub fn journal(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("ledger.jsonl")
    }

    pub fn record(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("run.json")
    }

    pub fn pack(&self, run_id: &str) -> PathBuf {
        self.packs_dir.join(format!("{run_id}.json"))
    }
}
