// workflow.rs — End-to-end runs through the orchestrator with simulated agents.
//
// Each test drives one or more tickets from CREATED to a terminal state and
// then checks the sealed evidence pack:
//
//   1. Golden path: P3 ticket, CRC log, spare reserved, RESOLVED
//   2. Transient analyzer failure: three attempts, then FAILED
//   3. Rate limit: the eleventh automatic issue in an hour is held
//   4. Tampered pack: chain verification catches the edit
//   5. Strict mode: a costly cross-region reservation needs an exec
//   6. Crash after an external side effect: recovery does not repeat it

use std::fs;
use std::sync::Arc;

use mesh_agents::{AgentAdapter, ArtifactRef, SimulatedTransport, Tool, ToolError};
use mesh_audit::{
    replay, verify_signature, ApprovalDecision, FailureKind, LedgerEntry, LedgerError,
    LocalKeySigner, RunState, StepOutcome,
};
use mesh_policy::{GateRule, PolicyConfig, Priority, RateLimiter, Role, Ticket};
use mesh_run::{
    idempotency_key, ApprovalInput, ApprovalOutcome, Collaborators, MeshPaths,
    OrchestratorSettings, RunOrchestrator,
};
use tempfile::tempdir;

const CRC_LOG: &str = "\
2024-03-02 14:31:07 INFO  agv-17 heartbeat ok
2024-03-02 14:32:10 ERROR agv-17 CRC checksum mismatch error on motor driver bus
2024-03-02 14:32:41 ERROR agv-17 CRC frame mismatch error on motor driver bus
2024-03-02 14:33:02 WARN  agv-17 tote misrouted to lane 4
";

const LOG_URI: &str = "blob://tickets/agv-17.log";

fn transport() -> Arc<SimulatedTransport> {
    Arc::new(SimulatedTransport::new().with_log(LOG_URI, CRC_LOG))
}

fn deps(transport: Arc<SimulatedTransport>, signer: Arc<LocalKeySigner>) -> Collaborators {
    Collaborators::new(AgentAdapter::new(transport), signer)
        .with_tenant("acme-logistics")
        .with_settings(OrchestratorSettings {
            backoff_base_ms: 0,
            ..OrchestratorSettings::default()
        })
}

fn signer() -> Arc<LocalKeySigner> {
    Arc::new(LocalKeySigner::generate("mesh-test-signer").unwrap())
}

fn agv_ticket(id: &str, priority: Priority) -> Ticket {
    Ticket::new(id, "AGV-17 motor driver fault, totes misrouted on lane 4", "ATL-1", priority)
        .with_subject("AGV-17 stopped on lane 4")
}

fn artifact() -> ArtifactRef {
    ArtifactRef::new("agv-17.log", LOG_URI)
}

fn visited(orch: &RunOrchestrator) -> Vec<RunState> {
    orch.ledger()
        .steps()
        .filter_map(|s| s.transition)
        .map(|t| t.to)
        .collect()
}

#[tokio::test]
async fn golden_path_resolves_with_signed_verifiable_pack() {
    let transport = transport();
    let signer = signer();
    let mut orch = RunOrchestrator::create(
        agv_ticket("ZD-4411", Priority::P3),
        Arc::new(PolicyConfig::default()),
        deps(transport.clone(), signer.clone()),
    )
    .unwrap();

    orch.start().await.unwrap();
    assert_eq!(orch.run().state, RunState::IssueCreated);
    orch.artifact_uploaded(artifact()).await.unwrap();

    assert_eq!(
        visited(&orch),
        vec![
            RunState::Classifying,
            RunState::IssueCreated,
            RunState::LogAnalysisPending,
            RunState::LogAnalyzed,
            RunState::SparePending,
            RunState::SpareReserved,
            RunState::Resolved,
        ]
    );

    let pack = orch.pack().unwrap();
    assert!(replay::verify(pack));
    verify_signature(pack, &signer.public_key_base64()).unwrap();
    assert_eq!(pack.summary.tenant, "acme-logistics");
    assert_eq!(pack.summary.issue_key.as_deref(), Some("GO-1012"));
    assert_eq!(pack.summary.reservation_id.as_deref(), Some("RSV-000001"));
    assert!(pack.approvals.is_empty());

    // Same-region stock is preferred; none in ATL, so the deepest elsewhere.
    assert_eq!(transport.stock("MD-BRD-V2", "DFW-DC"), 4);

    let view = replay::replay(pack);
    assert!(view.verified);
    assert!(view.illegal_transitions.is_empty());
    assert_eq!(view.terminal_state, RunState::Resolved);
    let tools: Vec<Tool> = view.tool_calls.iter().map(|c| c.tool).collect();
    assert_eq!(
        tools,
        vec![
            Tool::ClassifyTicket,
            Tool::CreateIssue,
            Tool::AnalyzeLog,
            Tool::RecommendSpare,
            Tool::ReserveSpare,
        ]
    );
}

#[tokio::test]
async fn transient_analyzer_failure_retries_then_fails() {
    let transport = transport();
    transport.fail_next(
        Tool::AnalyzeLog,
        3,
        ToolError::Unavailable("log analyzer connection reset".into()),
    );
    let mut orch = RunOrchestrator::create(
        agv_ticket("ZD-4412", Priority::P3),
        Arc::new(PolicyConfig::default()),
        deps(transport.clone(), signer()),
    )
    .unwrap();

    orch.start().await.unwrap();
    orch.artifact_uploaded(artifact()).await.unwrap();

    assert_eq!(orch.run().state, RunState::Failed);
    assert_eq!(orch.run().failure, Some(FailureKind::ToolUnavailable));
    assert_eq!(transport.calls(Tool::AnalyzeLog), 3);

    let attempts: Vec<(Option<u32>, StepOutcome)> = orch
        .ledger()
        .steps()
        .filter(|s| s.tool == Some(Tool::AnalyzeLog))
        .map(|s| (s.attempt, s.outcome))
        .collect();
    assert_eq!(
        attempts,
        vec![
            (Some(1), StepOutcome::Retried),
            (Some(2), StepOutcome::Retried),
            (Some(3), StepOutcome::Failed),
        ]
    );

    let pack = orch.pack().unwrap();
    assert!(replay::verify(pack));
    assert_eq!(pack.summary.failure, Some(FailureKind::ToolUnavailable));
    // The issue was created before the failure and stays on record.
    assert_eq!(pack.summary.issue_key.as_deref(), Some("GO-1012"));
}

#[tokio::test]
async fn recovered_transient_failure_still_resolves() {
    let transport = transport();
    transport.fail_next(Tool::AnalyzeLog, 2, ToolError::Unavailable("busy".into()));
    let mut orch = RunOrchestrator::create(
        agv_ticket("ZD-4413", Priority::P3),
        Arc::new(PolicyConfig::default()),
        deps(transport.clone(), signer()),
    )
    .unwrap();

    orch.start().await.unwrap();
    orch.artifact_uploaded(artifact()).await.unwrap();

    assert_eq!(orch.run().state, RunState::Resolved);
    assert_eq!(transport.calls(Tool::AnalyzeLog), 3);
    let pack = orch.pack().unwrap();
    assert_eq!(pack.steps_with_outcome(StepOutcome::Retried).count(), 2);
}

#[tokio::test]
async fn eleventh_automatic_issue_in_an_hour_is_held() {
    let transport = transport();
    let limiter = Arc::new(RateLimiter::new());
    let policy = Arc::new(PolicyConfig::default());
    let deps = deps(transport.clone(), signer()).with_limiter(limiter);

    for n in 0..10 {
        let ticket = agv_ticket(&format!("ZD-50{n:02}"), Priority::P3);
        let mut orch = RunOrchestrator::create(ticket, policy.clone(), deps.clone()).unwrap();
        orch.start().await.unwrap();
        assert_eq!(orch.run().state, RunState::IssueCreated);
    }

    let mut held =
        RunOrchestrator::create(agv_ticket("ZD-5010", Priority::P3), policy, deps).unwrap();
    held.start().await.unwrap();

    assert_eq!(held.run().state, RunState::AwaitingApproval);
    assert_eq!(transport.calls(Tool::CreateIssue), 10);
    let gate = held.run().open_gate().unwrap().clone();
    assert_eq!(gate.rule, GateRule::RateLimitOverride);
    assert_eq!(gate.required_role, Role::Head);
    assert!(gate.retry_at.is_some());
    assert_eq!(held.approval_deadline(), None);
    assert_eq!(held.rate_limit_retry_at(), gate.retry_at);

    let limited: Vec<_> = held
        .ledger()
        .steps()
        .filter(|s| s.outcome == StepOutcome::RateLimited)
        .collect();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].failure, Some(FailureKind::RateLimited));

    // Not yet time to retry.
    assert!(!held.retry_rate_limited(chrono::Utc::now()).await.unwrap());

    // A head can override; approved actions do not consume the window.
    let outcome = held
        .approval_decided(ApprovalInput::approve("dana.ops", Role::Head).via("slack"))
        .await
        .unwrap();
    assert_eq!(outcome, ApprovalOutcome::Recorded(ApprovalDecision::Approved));
    assert_eq!(held.run().state, RunState::IssueCreated);
    assert_eq!(transport.calls(Tool::CreateIssue), 11);
    assert_eq!(held.ledger().entries().iter().filter_map(LedgerEntry::as_approval).count(), 1);
}

#[tokio::test]
async fn tampered_pack_fails_verification() {
    let signer = signer();
    let mut orch = RunOrchestrator::create(
        agv_ticket("ZD-4414", Priority::P3),
        Arc::new(PolicyConfig::default()),
        deps(transport(), signer.clone()),
    )
    .unwrap();
    orch.start().await.unwrap();
    orch.artifact_uploaded(artifact()).await.unwrap();
    let pack = orch.pack().unwrap().clone();
    assert!(replay::verify(&pack));

    // Edit one recorded tool output.
    let mut edited = pack.clone();
    let step = edited
        .steps
        .iter_mut()
        .find(|s| s.tool == Some(Tool::ReserveSpare) && s.outcome == StepOutcome::Success)
        .unwrap();
    step.output["confirmation_id"] = serde_json::json!("RSV-999999");
    assert!(matches!(
        replay::check(&edited),
        Err(LedgerError::ChainIntegrityViolation { .. })
    ));
    assert!(!replay::replay(&edited).verified);

    // Drop the last step.
    let mut truncated = pack.clone();
    truncated.steps.pop();
    assert!(replay::check(&truncated).is_err());

    // Rewrite the summary: the chain is intact but the attestation is not.
    let mut resummarized = pack.clone();
    resummarized.summary.reservation_id = Some("RSV-999999".into());
    assert!(replay::check(&resummarized).is_err());
    assert!(verify_signature(&resummarized, &signer.public_key_base64()).is_err());

    // A pack survives a round trip through its JSON form unchanged.
    let reloaded = mesh_audit::EvidencePack::from_json(&pack.to_json().unwrap()).unwrap();
    assert!(replay::verify(&reloaded));
}

#[tokio::test]
async fn strict_mode_reservation_needs_an_exec() {
    let transport = transport();
    let policy = Arc::new(PolicyConfig {
        strict_mode: true,
        ..PolicyConfig::default()
    });
    let mut orch = RunOrchestrator::create(
        agv_ticket("ZD-4415", Priority::P3),
        policy,
        deps(transport.clone(), signer()),
    )
    .unwrap();
    orch.start().await.unwrap();
    orch.artifact_uploaded(artifact()).await.unwrap();

    // $600 board from DFW-DC for an ATL site: held for an exec.
    assert_eq!(orch.run().state, RunState::SparePending);
    let gate = orch.run().open_gate().unwrap().clone();
    assert_eq!(gate.rule, GateRule::StrictModeReservation);
    assert_eq!(gate.required_role, Role::Exec);
    assert_eq!(gate.tool, Tool::ReserveSpare);
    assert_eq!(transport.calls(Tool::ReserveSpare), 0);

    let refused = orch
        .approval_decided(ApprovalInput::approve("dana.ops", Role::Head))
        .await
        .unwrap();
    assert_eq!(
        refused,
        ApprovalOutcome::Refused {
            required_role: Role::Exec
        }
    );
    assert_eq!(orch.run().state, RunState::SparePending);
    assert!(orch.run().open_gate().is_some());
    assert!(orch.ledger().steps().any(|s| s.label == "approval_refused"));

    orch.approval_decided(ApprovalInput::approve("morgan.vp", Role::Exec))
        .await
        .unwrap();
    assert_eq!(orch.run().state, RunState::Resolved);
    assert_eq!(transport.calls(Tool::ReserveSpare), 1);

    let pack = orch.pack().unwrap();
    assert!(replay::verify(pack));
    assert_eq!(pack.approvals.len(), 1);
    assert_eq!(pack.approvals[0].role, Role::Exec);
    assert_eq!(pack.approvals[0].gates_step, gate.gate_step);
    assert_eq!(pack.summary.reservation_id.as_deref(), Some("RSV-000001"));
}

#[tokio::test]
async fn recovery_after_crash_does_not_repeat_issue_creation() {
    let dir = tempdir().unwrap();
    let paths = MeshPaths::for_project(dir.path());
    let transport = transport();
    let signer = signer();

    let mut orch = RunOrchestrator::create_in(
        agv_ticket("ZD-4416", Priority::P3),
        Arc::new(PolicyConfig::default()),
        deps(transport.clone(), signer.clone()),
        &paths,
    )
    .unwrap();
    orch.start().await.unwrap();
    let run_id = orch.run().id.clone();
    assert_eq!(orch.run().state, RunState::IssueCreated);
    drop(orch);

    // Simulate a crash between the issue call and the transition after it.
    let journal = paths.journal(&run_id);
    let content = fs::read_to_string(&journal).unwrap();
    let mut kept = Vec::new();
    for line in content.lines() {
        kept.push(line);
        let entry: LedgerEntry = serde_json::from_str(line).unwrap();
        let created = entry.as_step().is_some_and(|s| {
            s.tool == Some(Tool::CreateIssue) && s.outcome == StepOutcome::Success
        });
        if created {
            break;
        }
    }
    fs::write(&journal, format!("{}\n", kept.join("\n"))).unwrap();

    let mut recovered =
        RunOrchestrator::recover(&journal, deps(transport.clone(), signer)).unwrap();
    assert_eq!(recovered.run().id, run_id);
    assert_eq!(recovered.run().state, RunState::Classifying);
    assert_eq!(recovered.run().ticket.id, "ZD-4416");

    recovered.advance().await.unwrap();
    assert_eq!(recovered.run().state, RunState::IssueCreated);
    assert_eq!(transport.calls(Tool::CreateIssue), 1);
    assert!(recovered
        .ledger()
        .steps()
        .any(|s| s.label == "idempotent_skip"));

    recovered.artifact_uploaded(artifact()).await.unwrap();
    assert_eq!(recovered.run().state, RunState::Resolved);
    let pack = recovered.pack().unwrap();
    assert!(replay::verify(pack));
    assert_eq!(pack.summary.issue_key.as_deref(), Some("GO-1012"));
    let key = idempotency_key(&run_id, Tool::CreateIssue);
    let successes = pack
        .steps
        .iter()
        .filter(|s| s.idempotency_key.as_deref() == Some(key.as_str()))
        .filter(|s| s.outcome == StepOutcome::Success)
        .count();
    assert_eq!(successes, 1);
}

#[tokio::test]
async fn recovery_restores_an_open_gate() {
    let dir = tempdir().unwrap();
    let paths = MeshPaths::for_project(dir.path());
    let transport = transport();
    let signer = signer();

    let mut orch = RunOrchestrator::create_in(
        agv_ticket("ZD-4417", Priority::P1),
        Arc::new(PolicyConfig::default()),
        deps(transport.clone(), signer.clone()),
        &paths,
    )
    .unwrap();
    orch.start().await.unwrap();
    let run_id = orch.run().id.clone();
    let gate = orch.run().open_gate().unwrap().clone();
    assert_eq!(gate.rule, GateRule::P1Issue);
    drop(orch);

    let mut recovered =
        RunOrchestrator::recover(&paths.journal(&run_id), deps(transport.clone(), signer)).unwrap();
    assert_eq!(recovered.run().state, RunState::AwaitingApproval);
    assert_eq!(recovered.run().open_gate(), Some(&gate));

    recovered
        .approval_decided(ApprovalInput::approve("dana.ops", Role::Head))
        .await
        .unwrap();
    assert_eq!(recovered.run().state, RunState::IssueCreated);
    assert_eq!(transport.calls(Tool::CreateIssue), 1);
}
