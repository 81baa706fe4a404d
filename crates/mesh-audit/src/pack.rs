// pack.rs — The sealed, self-contained evidence artifact of a run.
//
// A pack is generated once, at completion or abandonment, and is immutable
// thereafter. Its attestation signs a small canonical payload that binds the
// final chain hash, the entry count and a digest of the run summary.

use std::path::Path;

use chrono::{DateTime, Utc};
use mesh_policy::{PolicyConfig, Ticket};
use serde::{Deserialize, Serialize};

use crate::canonical::CanonicalBytes;
use crate::entry::{Approval, LedgerEntry, Step};
use crate::error::LedgerError;
use crate::hasher;
use crate::state::{FailureKind, RunState};

/// Version of the pack document and of its attestation payload.
pub const PACK_FORMAT_VERSION: &str = "mesh-evidence/v1";

/// Run metadata carried at the top of a pack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub tenant: String,
    pub ticket: Ticket,
    pub policy: PolicyConfig,
    pub terminal_state: RunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Why the triage agent classified the ticket the way it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default)]
    pub similar_tickets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<String>,
}

/// The bytes handed to the signer, in canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationPayload {
    pub run_id: String,
    pub ticket_id: String,
    pub terminal_state: RunState,
    pub final_hash: String,
    pub entry_count: u64,
    pub summary_digest: String,
    pub format_version: String,
}

impl AttestationPayload {
    pub fn for_summary(
        summary: &RunSummary,
        final_hash: &str,
        entry_count: u64,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            run_id: summary.run_id.clone(),
            ticket_id: summary.ticket.id.clone(),
            terminal_state: summary.terminal_state,
            final_hash: final_hash.to_string(),
            entry_count,
            summary_digest: hasher::digest(&CanonicalBytes::new(summary)?),
            format_version: PACK_FORMAT_VERSION.to_string(),
        })
    }

    pub fn canonical_bytes(&self) -> Result<CanonicalBytes, serde_json::Error> {
        CanonicalBytes::new(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub final_hash: String,
    pub entry_count: u64,
    /// SHA-256 of the canonical attestation payload.
    pub payload_digest: String,
    pub signed_by: String,
    /// Base64 signature over the canonical attestation payload.
    pub signature: String,
    pub format_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidencePack {
    pub format_version: String,
    pub summary: RunSummary,
    pub steps: Vec<Step>,
    pub approvals: Vec<Approval>,
    pub attestation: Attestation,
}

impl EvidencePack {
    /// All entries merged back into sequence order.
    pub fn entries(&self) -> Vec<LedgerEntry> {
        let mut entries: Vec<LedgerEntry> = self
            .steps
            .iter()
            .cloned()
            .map(LedgerEntry::Step)
            .chain(self.approvals.iter().cloned().map(LedgerEntry::Approval))
            .collect();
        entries.sort_by_key(LedgerEntry::seq);
        entries
    }

    /// Rebuild the payload the signer saw.
    pub fn attestation_payload(&self) -> Result<AttestationPayload, serde_json::Error> {
        AttestationPayload::for_summary(
            &self.summary,
            &self.attestation.final_hash,
            self.attestation.entry_count,
        )
    }

    pub fn to_json(&self) -> Result<String, LedgerError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, LedgerError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), LedgerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, LedgerError> {
        let json = std::fs::read_to_string(path).map_err(|source| LedgerError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Steps recorded with the given outcome.
    pub fn steps_with_outcome(&self, outcome: crate::entry::StepOutcome) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(move |s| s.outcome == outcome)
    }
}
