//! Replay engine: re-verify a sealed pack and reconstruct its run.
//!
//! Everything here reads the pack only. No agent is called and nothing is
//! written.

use serde::{Deserialize, Serialize};

use mesh_agents::Tool;

use crate::canonical::CanonicalBytes;
use crate::entry::{Approval, LedgerEntry, StepOutcome};
use crate::error::LedgerError;
use crate::hasher;
use crate::ledger::verify_entries;
use crate::pack::{EvidencePack, PACK_FORMAT_VERSION};
use crate::state::{RunState, StateTransition};

/// A state the run entered, and the step that recorded it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVisit {
    pub state: RunState,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallSummary {
    pub seq: u64,
    pub tool: Tool,
    pub outcome: StepOutcome,
    pub attempt: Option<u32>,
    pub latency_ms: u64,
}

/// Inspection view of a run rebuilt from its pack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconstructedRunView {
    pub run_id: String,
    pub ticket_id: String,
    pub states: Vec<StateVisit>,
    pub tool_calls: Vec<ToolCallSummary>,
    pub approvals: Vec<Approval>,
    pub terminal_state: RunState,
    /// Recorded transitions the state machine does not allow.
    pub illegal_transitions: Vec<StateTransition>,
    pub verified: bool,
}

/// Full integrity check of a pack.
///
/// Recomputes the chain from the seed over the merged entries and compares
/// the final hash, entry count and payload digest with the attestation.
/// Any tampering, truncation or reordering is a `ChainIntegrityViolation`.
pub fn check(pack: &EvidencePack) -> Result<(), LedgerError> {
    let violation = |seq: u64, reason: String| LedgerError::ChainIntegrityViolation { seq, reason };

    if pack.format_version != PACK_FORMAT_VERSION {
        return Err(violation(
            0,
            format!("unsupported pack format '{}'", pack.format_version),
        ));
    }
    for (name, seqs) in [
        ("steps", pack.steps.iter().map(|s| s.seq).collect::<Vec<_>>()),
        ("approvals", pack.approvals.iter().map(|a| a.seq).collect::<Vec<_>>()),
    ] {
        if let Some(pair) = seqs.windows(2).find(|w| w[0] >= w[1]) {
            return Err(violation(
                pair[1],
                format!("{name} out of order: {} follows {}", pair[1], pair[0]),
            ));
        }
    }

    let entries = pack.entries();
    let final_hash = verify_entries(&entries)?;
    let count = entries.len() as u64;

    if count != pack.attestation.entry_count {
        return Err(violation(
            count,
            format!(
                "pack holds {count} entries, attestation covers {}",
                pack.attestation.entry_count
            ),
        ));
    }
    if final_hash != pack.attestation.final_hash {
        return Err(violation(
            count.saturating_sub(1),
            format!(
                "final hash {final_hash} does not match attested {}",
                pack.attestation.final_hash
            ),
        ));
    }

    let payload = pack.attestation_payload()?;
    let digest = hasher::digest(&CanonicalBytes::new(&payload)?);
    if digest != pack.attestation.payload_digest {
        return Err(violation(
            count.saturating_sub(1),
            "attestation payload digest mismatch (summary altered)".to_string(),
        ));
    }
    Ok(())
}

/// `true` when [`check`] passes.
pub fn verify(pack: &EvidencePack) -> bool {
    match check(pack) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(run_id = %pack.summary.run_id, error = %e, "evidence pack failed verification");
            false
        }
    }
}

/// Reconstruct the sequence of states the run passed through.
pub fn replay(pack: &EvidencePack) -> ReconstructedRunView {
    let verified = verify(pack);
    let mut states = Vec::new();
    let mut tool_calls = Vec::new();
    let mut approvals = Vec::new();
    let mut illegal_transitions = Vec::new();
    let mut current: Option<RunState> = None;

    for entry in pack.entries() {
        match entry {
            LedgerEntry::Step(step) => {
                if step.label == "run_opened" && current.is_none() {
                    current = Some(RunState::Created);
                    states.push(StateVisit {
                        state: RunState::Created,
                        seq: step.seq,
                    });
                }
                if let Some(transition) = step.transition {
                    let from_matches = current.map_or(true, |c| c == transition.from);
                    if !from_matches || !transition.is_legal() {
                        illegal_transitions.push(transition);
                    }
                    current = Some(transition.to);
                    states.push(StateVisit {
                        state: transition.to,
                        seq: step.seq,
                    });
                }
                if let Some(tool) = step.tool {
                    if step.kind == crate::entry::StepKind::ToolCall {
                        tool_calls.push(ToolCallSummary {
                            seq: step.seq,
                            tool,
                            outcome: step.outcome,
                            attempt: step.attempt,
                            latency_ms: step.latency_ms,
                        });
                    }
                }
            }
            LedgerEntry::Approval(approval) => approvals.push(approval),
        }
    }

    ReconstructedRunView {
        run_id: pack.summary.run_id.clone(),
        ticket_id: pack.summary.ticket.id.clone(),
        terminal_state: current.unwrap_or(pack.summary.terminal_state),
        states,
        tool_calls,
        approvals,
        illegal_transitions,
        verified,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical;
    use crate::entry::{ApprovalDecision, ApprovalDraft, StepDraft};
    use crate::ledger::EvidenceLedger;
    use crate::pack::RunSummary;
    use crate::signing::{verify_signature, LocalKeySigner};
    use mesh_agents::AgentKind;
    use mesh_policy::{PolicyConfig, Priority, Role, Ticket};
    use serde_json::json;

    fn sealed_pack(signer: &LocalKeySigner) -> EvidencePack {
        let mut ledger = EvidenceLedger::new("run-7");
        ledger
            .record_step(StepDraft::decision("run_opened", json!({"run_id": "run-7"}), json!({})))
            .unwrap();
        ledger
            .record_step(StepDraft::transition(RunState::Created, RunState::Classifying, json!({})))
            .unwrap();
        ledger
            .record_step(StepDraft::tool_call(
                AgentKind::TriageAgent,
                Tool::ClassifyTicket,
                json!({"body": "motor"}),
                json!({"track": "hardware", "confidence": 0.91}),
                40,
                StepOutcome::Success,
            ))
            .unwrap();
        ledger
            .record_step(StepDraft::transition(
                RunState::Classifying,
                RunState::AwaitingApproval,
                json!({}),
            ))
            .unwrap();
        ledger
            .record_approval(ApprovalDraft {
                actor: "dana".into(),
                role: Role::Head,
                channel: "agent_mesh".into(),
                decision: ApprovalDecision::Approved,
                gates_step: 3,
            })
            .unwrap();
        ledger
            .record_step(StepDraft::transition(
                RunState::AwaitingApproval,
                RunState::IssueCreated,
                json!({}),
            ))
            .unwrap();
        let now = canonical::now();
        ledger
            .seal(
                RunSummary {
                    run_id: "run-7".into(),
                    tenant: "acme".into(),
                    ticket: Ticket::new("ZD-7", "motor", "ATL-1", Priority::P1),
                    policy: PolicyConfig::default(),
                    terminal_state: RunState::IssueCreated,
                    failure: None,
                    started_at: now,
                    finished_at: now,
                    rationale: Some("motor keywords".into()),
                    similar_tickets: vec!["ZD-3".into()],
                    issue_key: None,
                    reservation_id: None,
                },
                signer,
            )
            .unwrap()
    }

    #[test]
    fn sealed_pack_verifies() {
        let signer = LocalKeySigner::generate("s").unwrap();
        let pack = sealed_pack(&signer);
        assert!(check(&pack).is_ok());
        assert!(verify(&pack));
        assert!(verify_signature(&pack, &signer.public_key_base64()).is_ok());
    }

    #[test]
    fn exported_json_verifies_after_reload() {
        let signer = LocalKeySigner::generate("s").unwrap();
        let pack = sealed_pack(&signer);
        let reloaded = EvidencePack::from_json(&pack.to_json().unwrap()).unwrap();
        assert!(verify(&reloaded));
        assert_eq!(reloaded.to_json().unwrap(), pack.to_json().unwrap());
    }

    #[test]
    fn long_scores_verify_after_reload() {
        let score = 0.9856906946328695_f64;
        let signer = LocalKeySigner::generate("s").unwrap();
        let mut ledger = EvidenceLedger::new("run-8");
        ledger
            .record_step(StepDraft::tool_call(
                AgentKind::LogAnalyzerAgent,
                Tool::AnalyzeLog,
                json!({"uri": "blob://agv-17.log"}),
                json!({"root_cause": "CRC mismatch", "confidence": score}),
                25,
                StepOutcome::Success,
            ))
            .unwrap();
        let now = canonical::now();
        let pack = ledger
            .seal(
                RunSummary {
                    run_id: "run-8".into(),
                    tenant: "acme".into(),
                    ticket: Ticket::new("ZD-8", "motor", "ATL-1", Priority::P3).with_confidence(score),
                    policy: PolicyConfig::default(),
                    terminal_state: RunState::Resolved,
                    failure: None,
                    started_at: now,
                    finished_at: now,
                    rationale: None,
                    similar_tickets: Vec::new(),
                    issue_key: None,
                    reservation_id: None,
                },
                &signer,
            )
            .unwrap();

        let reloaded = EvidencePack::from_json(&pack.to_json().unwrap()).unwrap();
        assert!(check(&reloaded).is_ok());
        assert_eq!(reloaded.summary.ticket.confidence, score);
        assert!(verify_signature(&reloaded, &signer.public_key_base64()).is_ok());
    }

    #[test]
    fn altered_output_byte_is_detected() {
        let signer = LocalKeySigner::generate("s").unwrap();
        let pack = sealed_pack(&signer);
        let json = pack.to_json().unwrap().replace("hardware", "hardwarf");
        let tampered = EvidencePack::from_json(&json).unwrap();
        assert!(!verify(&tampered));
        assert!(matches!(
            check(&tampered),
            Err(LedgerError::ChainIntegrityViolation { seq: 2, .. })
        ));
    }

    #[test]
    fn truncation_is_detected() {
        let signer = LocalKeySigner::generate("s").unwrap();
        let mut pack = sealed_pack(&signer);
        pack.steps.pop();
        assert!(matches!(check(&pack), Err(LedgerError::ChainIntegrityViolation { .. })));
    }

    #[test]
    fn reordering_is_detected() {
        let signer = LocalKeySigner::generate("s").unwrap();
        let mut pack = sealed_pack(&signer);
        pack.steps.swap(1, 2);
        assert!(!verify(&pack));
    }

    #[test]
    fn altered_summary_is_detected() {
        let signer = LocalKeySigner::generate("s").unwrap();
        let mut pack = sealed_pack(&signer);
        pack.summary.terminal_state = RunState::Resolved;
        assert!(!verify(&pack));
        assert!(verify_signature(&pack, &signer.public_key_base64()).is_err());
    }

    #[test]
    fn wrong_public_key_fails_signature_check() {
        let signer = LocalKeySigner::generate("s").unwrap();
        let other = LocalKeySigner::generate("o").unwrap();
        let pack = sealed_pack(&signer);
        assert!(verify_signature(&pack, &other.public_key_base64()).is_err());
    }

    #[test]
    fn replay_reconstructs_states_and_approvals() {
        let signer = LocalKeySigner::generate("s").unwrap();
        let view = replay(&sealed_pack(&signer));
        let states: Vec<RunState> = view.states.iter().map(|v| v.state).collect();
        assert_eq!(
            states,
            vec![
                RunState::Created,
                RunState::Classifying,
                RunState::AwaitingApproval,
                RunState::IssueCreated
            ]
        );
        assert_eq!(view.terminal_state, RunState::IssueCreated);
        assert_eq!(view.approvals.len(), 1);
        assert_eq!(view.approvals[0].gates_step, 3);
        assert_eq!(view.tool_calls.len(), 1);
        assert!(view.illegal_transitions.is_empty());
        assert!(view.verified);
    }
}
