// orchestrator.rs — The state machine that drives one ticket to a sealed pack.
//
// A `RunOrchestrator` owns one run and its evidence ledger. It calls agents
// through the adapter, consults the policy gate before every side effect,
// honors the shared rate limiter, and records every decision, tool call and
// transition before acting on it. It suspends (returns from `advance`) when
// the run waits for an approval, a log artifact, or the next rate-limit
// window, and seals the ledger once the run is terminal.
//
//   CREATED → CLASSIFYING → gate(create_issue) → ISSUE_CREATED | AWAITING_APPROVAL
//   ISSUE_CREATED ─(artifact)→ LOG_ANALYSIS_PENDING → LOG_ANALYZED
//   LOG_ANALYZED → SPARE_PENDING → gate(reserve_spare) → SPARE_RESERVED → RESOLVED
//   LOG_ANALYZED → RESOLVED                  (no replacement part)
//
// Non-idempotent tools carry a per-run idempotency key. Before calling one,
// the orchestrator looks for a SUCCESS step with that key in its ledger and
// reuses the recorded output instead, which is what makes a recovered run
// safe to resume.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use mesh_agents::payload;
use mesh_agents::{
    AgentAdapter, AgentTransport, ArtifactRef, Classification, Invocation, IssueRef,
    IssueRequest, LogFindings, Reservation, ReserveRequest, SpareRecommendation, SpareRequest,
    Tool,
};
use mesh_audit::canonical;
use mesh_audit::{
    ApprovalDecision, ApprovalDraft, EvidenceLedger, EvidencePack, FailureKind, LedgerEntry,
    RunState, RunSummary, Signer, Step, StepDraft, StepKind, StepOutcome,
};
use mesh_policy::{
    ActionClass, GateDecision, GateRule, PolicyConfig, PolicyGate, ProposedAction, RateLimiter,
    Role, Ticket,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::{Agentfile, MeshPaths, OrchestratorSettings};
use crate::error::RunError;
use crate::events::{EventLog, RunEvent};
use crate::run::{ApprovalGate, Clearance, Pending, Run, RunStatus};

/// Label of the first step of every ledger.
pub const RUN_OPENED: &str = "run_opened";

/// Everything a run uses but does not own.
///
/// The limiter and event log are shared by every run of a tenant; the rest
/// is cheap to clone per run.
#[derive(Clone)]
pub struct Collaborators {
    pub adapter: AgentAdapter,
    pub gate: PolicyGate,
    pub limiter: Arc<RateLimiter>,
    pub signer: Arc<dyn Signer>,
    pub events: Arc<EventLog>,
    pub settings: OrchestratorSettings,
    pub tenant: String,
}

impl Collaborators {
    /// Defaults: a private limiter and event log, default settings.
    pub fn new(adapter: AgentAdapter, signer: Arc<dyn Signer>) -> Self {
        let gate = PolicyGate::new(adapter.catalog().clone());
        let settings = OrchestratorSettings::default();
        Self {
            adapter: adapter.with_call_timeout(settings.call_timeout()),
            gate,
            limiter: Arc::new(RateLimiter::new()),
            signer,
            events: Arc::new(EventLog::new()),
            settings,
            tenant: "default".to_string(),
        }
    }

    /// Collaborators for the deployment an Agentfile describes.
    pub fn from_agentfile(
        agentfile: &Agentfile,
        transport: Arc<dyn AgentTransport>,
        signer: Arc<dyn Signer>,
    ) -> Self {
        let adapter = AgentAdapter::new(transport).with_catalog(agentfile.agents.clone());
        Self::new(adapter, signer)
            .with_settings(agentfile.orchestrator.clone())
            .with_tenant(agentfile.metadata.tenant.clone())
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_events(mut self, events: Arc<EventLog>) -> Self {
        self.events = events;
        self
    }

    /// Also applies the settings' call timeout to the adapter.
    pub fn with_settings(mut self, settings: OrchestratorSettings) -> Self {
        self.adapter = self.adapter.with_call_timeout(settings.call_timeout());
        self.settings = settings;
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = tenant.into();
        self
    }
}

/// A decision delivered by an approver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalInput {
    pub actor: String,
    pub role: Role,
    pub channel: String,
    pub decision: ApprovalDecision,
}

impl ApprovalInput {
    pub fn approve(actor: impl Into<String>, role: Role) -> Self {
        Self {
            actor: actor.into(),
            role,
            channel: "agent_mesh".to_string(),
            decision: ApprovalDecision::Approved,
        }
    }

    pub fn reject(actor: impl Into<String>, role: Role) -> Self {
        Self {
            decision: ApprovalDecision::Rejected,
            ..Self::approve(actor, role)
        }
    }

    pub fn via(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalOutcome {
    /// The approval was written to the ledger.
    Recorded(ApprovalDecision),
    /// The approver's role is too low; the gate stays open.
    Refused { required_role: Role },
}

pub struct RunOrchestrator {
    run: Run,
    ledger: EvidenceLedger,
    deps: Collaborators,
    pack: Option<EvidencePack>,
}

impl RunOrchestrator {
    /// Open a run with an in-memory ledger.
    pub fn create(
        ticket: Ticket,
        policy: Arc<PolicyConfig>,
        deps: Collaborators,
    ) -> Result<Self, RunError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let ledger = EvidenceLedger::new(run_id.clone());
        Self::open(run_id, ticket, policy, deps, ledger)
    }

    /// Open a run whose ledger is journaled under `paths`.
    pub fn create_in(
        ticket: Ticket,
        policy: Arc<PolicyConfig>,
        deps: Collaborators,
        paths: &MeshPaths,
    ) -> Result<Self, RunError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let ledger = EvidenceLedger::create_journal(run_id.clone(), &paths.journal(&run_id))?;
        Self::open(run_id, ticket, policy, deps, ledger)
    }

    fn open(
        run_id: String,
        ticket: Ticket,
        policy: Arc<PolicyConfig>,
        deps: Collaborators,
        ledger: EvidenceLedger,
    ) -> Result<Self, RunError> {
        // Capabilities are checked up front, not at call time.
        deps.adapter.catalog().require(&Tool::ALL)?;

        let started_at = canonical::now();
        let run = Run::new(run_id, deps.tenant.clone(), ticket, policy, started_at);
        let mut orchestrator = Self {
            run,
            ledger,
            deps,
            pack: None,
        };
        let input = json!({
            "run_id": orchestrator.run.id,
            "tenant": orchestrator.run.tenant,
            "ticket": orchestrator.run.ticket,
            "policy": *orchestrator.run.policy,
        });
        orchestrator.record(StepDraft::decision(
            RUN_OPENED,
            input,
            json!({ "state": RunState::Created.to_string() }),
        ))?;
        orchestrator.deps.events.publish(RunEvent::RunCreated {
            run_id: orchestrator.run.id.clone(),
            ticket_id: orchestrator.run.ticket.id.clone(),
            tenant: orchestrator.run.tenant.clone(),
            timestamp: Utc::now(),
        });
        tracing::info!(
            run_id = %orchestrator.run.id,
            ticket_id = %orchestrator.run.ticket.id,
            policy_version = orchestrator.run.policy.version,
            "run created"
        );
        Ok(orchestrator)
    }

    /// Rebuild a run from its journal after a restart.
    ///
    /// The chain is verified; ticket and policy come from the `run_opened`
    /// step, the state from the last transition, tool results from SUCCESS
    /// steps, open gates from recorded holds and clearances from gate
    /// decisions and approvals. Call [`advance`](Self::advance) to continue.
    pub fn recover(journal: &Path, deps: Collaborators) -> Result<Self, RunError> {
        let recovery = |reason: &str| RunError::Recovery {
            path: journal.to_path_buf(),
            reason: reason.to_string(),
        };
        let entries = EvidenceLedger::read_journal(journal)?;
        let opened = entries
            .first()
            .and_then(LedgerEntry::as_step)
            .filter(|s| s.label == RUN_OPENED)
            .ok_or_else(|| recovery("journal does not start with run_opened"))?;
        let field = |name: &str| {
            opened.input.get(name).cloned().ok_or_else(|| recovery(&format!("run_opened has no {name}")))
        };
        let run_id = field("run_id")?
            .as_str()
            .map(String::from)
            .ok_or_else(|| recovery("run_id is not a string"))?;
        let tenant = field("tenant")?.as_str().unwrap_or_default().to_string();
        let ticket: Ticket = serde_json::from_value(field("ticket")?)?;
        let policy: PolicyConfig = serde_json::from_value(field("policy")?)?;
        let started_at = opened.recorded_at;

        let ledger = EvidenceLedger::open_journal(run_id.clone(), journal)?;
        let mut run = Run::new(run_id, tenant, ticket, Arc::new(policy), started_at);
        restore(&mut run, ledger.entries())?;
        tracing::info!(
            run_id = %run.id,
            state = %run.state,
            entries = ledger.len(),
            "run recovered from journal"
        );
        Ok(Self {
            run,
            ledger,
            deps,
            pack: None,
        })
    }

    pub fn run(&self) -> &Run {
        &self.run
    }

    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    pub fn pack(&self) -> Option<&EvidencePack> {
        self.pack.as_ref()
    }

    pub fn status(&self) -> RunStatus {
        self.run.status()
    }

    pub fn is_terminal(&self) -> bool {
        self.run.is_terminal()
    }

    /// When the open approval gate, if any, abandons the run.
    pub fn approval_deadline(&self) -> Option<DateTime<Utc>> {
        self.run
            .open_gate()
            .and_then(|g| g.deadline(self.deps.settings.approval_timeout()))
    }

    /// When a rate-limited run should try again.
    pub fn rate_limit_retry_at(&self) -> Option<DateTime<Utc>> {
        self.run
            .open_gate()
            .filter(|g| g.rule == GateRule::RateLimitOverride)
            .and_then(|g| g.retry_at)
    }

    /// Start the run. Same as [`advance`](Self::advance).
    pub async fn start(&mut self) -> Result<(), RunError> {
        self.advance().await
    }

    /// Drive the run until it suspends or ends. A terminal run is sealed.
    pub async fn advance(&mut self) -> Result<(), RunError> {
        loop {
            if self.run.pending.is_some() {
                return Ok(());
            }
            match self.run.state {
                RunState::Created => {
                    self.transition(RunState::Classifying, json!({}))?;
                }
                RunState::Classifying | RunState::AwaitingApproval => {
                    let Some(confidence) = self.classification_confidence().await? else {
                        continue;
                    };
                    self.gate_and_execute(ProposedAction::create_issue(confidence))
                        .await?;
                }
                RunState::IssueCreated => match self.run.artifact.clone() {
                    Some(artifact) => {
                        self.transition(RunState::LogAnalysisPending, json!({ "artifact": artifact }))?;
                    }
                    None => {
                        tracing::info!(run_id = %self.run.id, "waiting for log artifact");
                        self.run.pending = Some(Pending::Artifact);
                    }
                },
                RunState::LogAnalysisPending => self.analyze().await?,
                RunState::LogAnalyzed => {
                    let findings = self.run.findings.clone().unwrap_or_else(|| LogFindings {
                        root_cause: String::new(),
                        signals: Vec::new(),
                        error_bursts: Vec::new(),
                        recommended_action: "monitor".to_string(),
                        replacement_part: None,
                        confidence: 0.0,
                    });
                    match findings.replacement_part {
                        Some(part_no) => {
                            self.transition(RunState::SparePending, json!({ "part_no": part_no }))?;
                        }
                        None => {
                            self.transition(
                                RunState::Resolved,
                                json!({ "recommended_action": findings.recommended_action }),
                            )?;
                        }
                    }
                }
                RunState::SparePending => self.reserve().await?,
                RunState::SpareReserved => {
                    let confirmation = self.run.reservation.as_ref().map(|r| r.confirmation_id.clone());
                    self.transition(RunState::Resolved, json!({ "confirmation_id": confirmation }))?;
                }
                RunState::Resolved | RunState::Failed | RunState::Abandoned => {
                    self.finalize()?;
                    return Ok(());
                }
            }
        }
    }

    /// Deliver a human decision on the open gate.
    pub async fn approval_decided(&mut self, input: ApprovalInput) -> Result<ApprovalOutcome, RunError> {
        self.ensure_live()?;
        let Some(gate) = self.run.open_gate().cloned() else {
            return Err(RunError::NotAwaitingApproval {
                run_id: self.run.id.clone(),
            });
        };

        if !input.role.satisfies(gate.required_role) {
            tracing::warn!(
                run_id = %self.run.id,
                actor = %input.actor,
                role = %input.role,
                required = %gate.required_role,
                "approval refused: insufficient role"
            );
            self.record(StepDraft::decision(
                "approval_refused",
                json!({
                    "actor": input.actor,
                    "role": input.role,
                    "channel": input.channel,
                    "decision": input.decision,
                    "gates_step": gate.gate_step,
                }),
                json!({ "required_role": gate.required_role, "rule": gate.rule }),
            ))?;
            return Ok(ApprovalOutcome::Refused {
                required_role: gate.required_role,
            });
        }

        let seq = self.ledger.next_seq();
        self.ledger.record_approval(ApprovalDraft {
            actor: input.actor.clone(),
            role: input.role,
            channel: input.channel.clone(),
            decision: input.decision,
            gates_step: gate.gate_step,
        })?;
        self.deps.events.publish(RunEvent::ApprovalRecorded {
            run_id: self.run.id.clone(),
            seq,
            actor: input.actor.clone(),
            decision: input.decision,
            timestamp: Utc::now(),
        });
        tracing::info!(
            run_id = %self.run.id,
            actor = %input.actor,
            decision = %input.decision,
            gates_step = gate.gate_step,
            "approval recorded"
        );
        self.run.pending = None;

        match input.decision {
            ApprovalDecision::Approved => {
                self.run.cleared = Some(Clearance {
                    tool: gate.tool,
                    approved: true,
                });
            }
            ApprovalDecision::Rejected => {
                self.end(
                    RunState::Abandoned,
                    Some(FailureKind::ApprovalRejected),
                    &format!("{} rejected {}", input.actor, gate.tool),
                )?;
            }
        }
        self.advance().await?;
        Ok(ApprovalOutcome::Recorded(input.decision))
    }

    /// A log artifact became available.
    pub async fn artifact_uploaded(&mut self, artifact: ArtifactRef) -> Result<(), RunError> {
        self.ensure_live()?;
        if self.run.artifact.is_some() {
            return Err(RunError::UnexpectedArtifact {
                run_id: self.run.id.clone(),
            });
        }
        self.record(StepDraft::decision(
            "artifact_received",
            json!({ "artifact": artifact }),
            json!({ "state": self.run.state.to_string() }),
        ))?;
        self.run.artifact = Some(artifact);
        if self.run.pending == Some(Pending::Artifact) {
            self.run.pending = None;
            self.advance().await?;
        }
        Ok(())
    }

    /// Abandon the run if its approval gate is past its deadline at `now`.
    pub fn expire_approval(&mut self, now: DateTime<Utc>) -> Result<bool, RunError> {
        let Some(deadline) = self.approval_deadline() else {
            return Ok(false);
        };
        if now < deadline {
            return Ok(false);
        }
        tracing::warn!(run_id = %self.run.id, %deadline, "approval timed out");
        self.run.pending = None;
        self.end(
            RunState::Abandoned,
            Some(FailureKind::ApprovalTimeout),
            &format!("no approval by {}", deadline.to_rfc3339()),
        )?;
        self.finalize()?;
        Ok(true)
    }

    /// Retry a rate-limited action once its window has room at `now`.
    pub async fn retry_rate_limited(&mut self, now: DateTime<Utc>) -> Result<bool, RunError> {
        match self.rate_limit_retry_at() {
            Some(at) if now >= at => {
                self.run.pending = None;
                self.advance().await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// External cancellation: end in ABANDONED and seal.
    pub fn abandon(&mut self, reason: &str) -> Result<(), RunError> {
        self.ensure_live()?;
        self.run.pending = None;
        self.end(RunState::Abandoned, None, reason)?;
        self.finalize()
    }

    // ── workflow stages ──────────────────────────────────────────────

    /// Classification confidence, classifying first if needed. `None` when
    /// classification failed and the run has ended.
    async fn classification_confidence(&mut self) -> Result<Option<f64>, RunError> {
        if let Some(c) = &self.run.classification {
            return Ok(Some(c.confidence));
        }
        let input = serde_json::to_value(&self.run.ticket)?;
        let Some(output) = self.call_or_fail(Tool::ClassifyTicket, input, None).await? else {
            return Ok(None);
        };
        let Some(classification) = self.decode::<Classification>(Tool::ClassifyTicket, &output)? else {
            return Ok(None);
        };
        tracing::info!(
            run_id = %self.run.id,
            track = %classification.track,
            confidence = classification.confidence,
            "ticket classified"
        );
        let confidence = classification.confidence;
        self.run.classification = Some(classification);
        Ok(Some(confidence))
    }

    async fn analyze(&mut self) -> Result<(), RunError> {
        let Some(artifact) = self.run.artifact.clone() else {
            return self.end(RunState::Failed, Some(FailureKind::ToolRejected), "no log artifact");
        };
        let input = payload::to_value(Tool::AnalyzeLog, &artifact)?;
        let Some(output) = self.call_or_fail(Tool::AnalyzeLog, input, None).await? else {
            return Ok(());
        };
        let Some(findings) = self.decode::<LogFindings>(Tool::AnalyzeLog, &output)? else {
            return Ok(());
        };
        let input = json!({
            "root_cause": findings.root_cause,
            "replacement_part": findings.replacement_part,
        });
        self.run.findings = Some(findings);
        self.transition(RunState::LogAnalyzed, input)?;
        Ok(())
    }

    async fn reserve(&mut self) -> Result<(), RunError> {
        let (Some(findings), Some(issue)) = (self.run.findings.clone(), self.run.issue.clone()) else {
            return self.end(
                RunState::Failed,
                Some(FailureKind::ToolRejected),
                "spare stage reached without findings or issue",
            );
        };
        if self.run.recommendation.is_none() {
            let request = SpareRequest {
                issue_key: issue.key,
                part_no: findings.replacement_part.clone().unwrap_or_default(),
                site: self.run.ticket.site.clone(),
            };
            let input = payload::to_value(Tool::RecommendSpare, &request)?;
            let Some(output) = self.call_or_fail(Tool::RecommendSpare, input, None).await? else {
                return Ok(());
            };
            let Some(recommendation) =
                self.decode::<SpareRecommendation>(Tool::RecommendSpare, &output)?
            else {
                return Ok(());
            };
            self.run.recommendation = Some(recommendation);
        }
        let Some(recommendation) = self.run.recommendation.clone() else {
            return Ok(());
        };
        self.gate_and_execute(ProposedAction::reserve_spare(&recommendation, findings.confidence))
            .await
    }

    /// Consult the gate for a side effect, then perform it, hold it for
    /// approval, or fail the run.
    async fn gate_and_execute(&mut self, action: ProposedAction) -> Result<(), RunError> {
        let tool = action.tool;
        if let Some(clearance) = self.run.clearance_for(tool) {
            return self.execute(tool, !clearance.approved).await;
        }

        let trace = self
            .deps
            .gate
            .evaluate_with_trace(&action, &self.run.ticket, &self.run.policy);
        let gate_step = self.ledger.next_seq();
        let mut output = json!({
            "decision": trace.decision,
            "trace": trace.steps,
        });
        let draft_input = serde_json::to_value(&action)?;

        match trace.decision {
            GateDecision::Allow => {
                self.record(StepDraft::decision("gate", draft_input, output).with_tool(tool))?;
                self.run.cleared = Some(Clearance {
                    tool,
                    approved: false,
                });
                self.execute(tool, true).await
            }
            GateDecision::RequireApproval {
                rule,
                required_role,
                reason,
            } => {
                let gate = ApprovalGate {
                    gate_step,
                    tool,
                    rule,
                    required_role,
                    reason: reason.clone(),
                    requested_at: canonical::now(),
                    retry_at: None,
                };
                output["hold"] = serde_json::to_value(&gate)?;
                self.record(StepDraft::decision("gate", draft_input, output).with_tool(tool))?;
                tracing::info!(
                    run_id = %self.run.id,
                    %tool,
                    %rule,
                    %required_role,
                    %reason,
                    "action held for approval"
                );
                if self.run.state == RunState::Classifying {
                    self.transition(
                        RunState::AwaitingApproval,
                        json!({ "rule": rule, "required_role": required_role }),
                    )?;
                }
                self.run.pending = Some(Pending::Approval(gate));
                Ok(())
            }
            GateDecision::Deny { reason } => {
                self.record(StepDraft::decision("gate", draft_input, output).with_tool(tool))?;
                self.end(RunState::Failed, Some(FailureKind::PolicyDenied), &reason)
            }
        }
    }

    /// Perform a cleared non-idempotent action exactly once.
    async fn execute(&mut self, tool: Tool, automatic: bool) -> Result<(), RunError> {
        let key = idempotency_key(&self.run.id, tool);

        let recorded = self.ledger.find_success(&key).map(|s| s.output.clone());
        let output = match recorded {
            Some(output) => {
                tracing::info!(run_id = %self.run.id, %tool, %key, "reusing recorded result");
                self.record(
                    StepDraft::decision(
                        "idempotent_skip",
                        json!({ "tool": tool, "idempotency_key": key }),
                        output.clone(),
                    )
                    .with_tool(tool),
                )?;
                output
            }
            None => {
                let input = self.action_input(tool, &key)?;
                if automatic && !self.consume_rate_limit(tool, &input, &key)? {
                    return Ok(());
                }
                match self.call_or_fail(tool, input, Some(&key)).await? {
                    Some(output) => output,
                    None => return Ok(()),
                }
            }
        };

        match tool {
            Tool::CreateIssue => {
                let Some(issue) = self.decode::<IssueRef>(tool, &output)? else {
                    return Ok(());
                };
                let input = json!({ "issue_key": issue.key });
                self.run.issue = Some(issue);
                self.transition(RunState::IssueCreated, input)?;
            }
            Tool::ReserveSpare => {
                let Some(reservation) = self.decode::<Reservation>(tool, &output)? else {
                    return Ok(());
                };
                let input = json!({ "confirmation_id": reservation.confirmation_id });
                self.run.reservation = Some(reservation);
                self.transition(RunState::SpareReserved, input)?;
            }
            other => {
                return self.end(
                    RunState::Failed,
                    Some(FailureKind::PolicyDenied),
                    &format!("'{other}' is not a gated action"),
                );
            }
        }
        Ok(())
    }

    fn action_input(&self, tool: Tool, key: &str) -> Result<Value, RunError> {
        match tool {
            Tool::CreateIssue => {
                let ticket = &self.run.ticket;
                let track = self
                    .run
                    .classification
                    .as_ref()
                    .map(|c| c.track.to_string())
                    .unwrap_or_else(|| "unclassified".to_string());
                let subject = if ticket.subject.is_empty() {
                    ticket.body.chars().take(80).collect()
                } else {
                    ticket.subject.clone()
                };
                let request = IssueRequest {
                    ticket_id: ticket.id.clone(),
                    subject,
                    priority: ticket.priority.tracker_priority().to_string(),
                    labels: vec![
                        "first-action".to_string(),
                        "ai-suggested".to_string(),
                        track.clone(),
                    ],
                    component: track,
                    idempotency_key: key.to_string(),
                };
                Ok(payload::to_value(tool, &request)?)
            }
            Tool::ReserveSpare => {
                let Some(rec) = &self.run.recommendation else {
                    return Ok(Value::Null);
                };
                let request = ReserveRequest {
                    part_no: rec.part_no.clone(),
                    location: rec.location.clone(),
                    quantity: rec.quantity,
                    idempotency_key: key.to_string(),
                };
                Ok(payload::to_value(tool, &request)?)
            }
            _ => Ok(Value::Null),
        }
    }

    /// Take a rate-limit slot for an automatic action. When none is free the
    /// attempt is recorded as RATE_LIMITED and the run is held until the
    /// window has room or someone approves an override.
    fn consume_rate_limit(&mut self, tool: Tool, input: &Value, key: &str) -> Result<bool, RunError> {
        let Some(class) = ActionClass::for_tool(tool) else {
            return Ok(true);
        };
        let capacity = self.run.policy.max_auto_creates_per_hour;
        let now = Utc::now();
        if self.deps.limiter.try_consume_at(class, capacity, now) {
            return Ok(true);
        }

        let retry_at = self
            .deps
            .limiter
            .next_available_at(class, capacity, now)
            .unwrap_or(now);
        let gate = ApprovalGate {
            gate_step: self.ledger.next_seq(),
            tool,
            rule: GateRule::RateLimitOverride,
            required_role: GateRule::RateLimitOverride.required_role(),
            reason: format!("{class} limit of {capacity} per hour reached"),
            requested_at: canonical::now(),
            retry_at: Some(retry_at),
        };
        self.record(
            StepDraft::tool_call(
                tool.owner(),
                tool,
                input.clone(),
                json!({ "error": gate.reason, "hold": gate }),
                0,
                StepOutcome::RateLimited,
            )
            .with_failure(FailureKind::RateLimited)
            .with_idempotency_key(key),
        )?;
        tracing::warn!(
            run_id = %self.run.id,
            %tool,
            %class,
            retry_at = %retry_at,
            "action rate limited; run held"
        );
        if self.run.state == RunState::Classifying {
            self.transition(
                RunState::AwaitingApproval,
                json!({ "rule": GateRule::RateLimitOverride, "required_role": gate.required_role }),
            )?;
        }
        self.run.pending = Some(Pending::Approval(gate));
        Ok(false)
    }

    /// Call with retry; on final failure end the run in FAILED and return `None`.
    async fn call_or_fail(
        &mut self,
        tool: Tool,
        input: Value,
        key: Option<&str>,
    ) -> Result<Option<Value>, RunError> {
        match self.call_with_retry(tool, input, key).await? {
            Ok(output) => Ok(Some(output)),
            Err((kind, message)) => {
                self.end(RunState::Failed, Some(kind), &message)?;
                Ok(None)
            }
        }
    }

    /// Invoke a tool, retrying `ToolUnavailable` with exponential backoff.
    ///
    /// Every attempt is recorded: earlier failures as RETRIED, the last as
    /// FAILED. The outer `Result` is for ledger errors only.
    async fn call_with_retry(
        &mut self,
        tool: Tool,
        input: Value,
        key: Option<&str>,
    ) -> Result<Result<Value, (FailureKind, String)>, RunError> {
        let max_attempts = self.deps.settings.max_attempts.max(1);
        let invocation = Invocation::new(tool, input);
        let mut attempt = 1;
        loop {
            let call = self.deps.adapter.invoke(&invocation).await;
            let latency_ms = call.latency_ms();
            let with_key = |draft: StepDraft| match key {
                Some(key) => draft.with_idempotency_key(key),
                None => draft,
            };
            match call.result {
                Ok(output) => {
                    self.record(with_key(
                        StepDraft::tool_call(
                            invocation.agent,
                            tool,
                            invocation.input.clone(),
                            output.clone(),
                            latency_ms,
                            StepOutcome::Success,
                        )
                        .with_attempt(attempt),
                    ))?;
                    return Ok(Ok(output));
                }
                Err(error) => {
                    let kind = FailureKind::from_tool_error(&error);
                    let last = attempt >= max_attempts || !error.is_retryable();
                    let outcome = if last {
                        StepOutcome::Failed
                    } else {
                        StepOutcome::Retried
                    };
                    self.record(with_key(
                        StepDraft::tool_call(
                            invocation.agent,
                            tool,
                            invocation.input.clone(),
                            json!({ "error": error }),
                            latency_ms,
                            outcome,
                        )
                        .with_attempt(attempt)
                        .with_failure(kind),
                    ))?;
                    if last {
                        tracing::warn!(
                            run_id = %self.run.id,
                            %tool,
                            attempt,
                            %error,
                            "tool call failed"
                        );
                        return Ok(Err((kind, error.to_string())));
                    }
                    let delay = self.deps.settings.backoff(attempt);
                    tracing::warn!(
                        run_id = %self.run.id,
                        %tool,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "tool call failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    fn decode<T: DeserializeOwned>(&mut self, tool: Tool, output: &Value) -> Result<Option<T>, RunError> {
        match payload::from_value(tool, output) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                self.end(RunState::Failed, Some(FailureKind::ToolRejected), &e.to_string())?;
                Ok(None)
            }
        }
    }

    // ── recording ────────────────────────────────────────────────────

    fn record(&mut self, draft: StepDraft) -> Result<u64, RunError> {
        let seq = self.ledger.next_seq();
        let (label, kind, outcome) = (draft.label.clone(), draft.kind, draft.outcome);
        self.ledger.record_step(draft)?;
        self.deps.events.publish(RunEvent::StepRecorded {
            run_id: self.run.id.clone(),
            seq,
            label,
            kind,
            outcome,
            timestamp: Utc::now(),
        });
        Ok(seq)
    }

    fn transition(&mut self, to: RunState, input: Value) -> Result<u64, RunError> {
        self.transition_with(to, input, None)
    }

    fn transition_with(
        &mut self,
        to: RunState,
        input: Value,
        failure: Option<FailureKind>,
    ) -> Result<u64, RunError> {
        let from = self.run.state;
        if !from.can_transition_to(&to) {
            return Err(RunError::InvalidTransition {
                run_id: self.run.id.clone(),
                from,
                to,
            });
        }
        let mut draft = StepDraft::transition(from, to, input);
        if let Some(kind) = failure {
            draft = draft.with_failure(kind);
        }
        let seq = self.record(draft)?;
        self.run.state = to;
        if to.is_terminal() {
            self.run.finished_at = self.ledger.steps().last().map(|s| s.recorded_at);
        }
        self.deps.events.publish(RunEvent::StateChanged {
            run_id: self.run.id.clone(),
            from,
            to,
            timestamp: Utc::now(),
        });
        tracing::info!(
            run_id = %self.run.id,
            ticket_id = %self.run.ticket.id,
            %from,
            %to,
            "run state changed"
        );
        Ok(seq)
    }

    /// End the run in `FAILED` or `ABANDONED`.
    fn end(&mut self, to: RunState, failure: Option<FailureKind>, reason: &str) -> Result<(), RunError> {
        self.run.failure = failure;
        self.run.pending = None;
        self.transition_with(to, json!({ "reason": reason }), failure)?;
        Ok(())
    }

    fn ensure_live(&self) -> Result<(), RunError> {
        if self.run.is_terminal() {
            return Err(RunError::Terminal {
                run_id: self.run.id.clone(),
                state: self.run.state,
            });
        }
        Ok(())
    }

    /// Seal the ledger. Runs once per terminal run.
    fn finalize(&mut self) -> Result<(), RunError> {
        if self.pack.is_some() {
            return Ok(());
        }
        let summary = RunSummary {
            run_id: self.run.id.clone(),
            tenant: self.run.tenant.clone(),
            ticket: self.run.ticket.clone(),
            policy: (*self.run.policy).clone(),
            terminal_state: self.run.state,
            failure: self.run.failure,
            started_at: self.run.started_at,
            finished_at: self.run.finished_at.unwrap_or_else(canonical::now),
            rationale: self.run.classification.as_ref().map(|c| c.rationale.clone()),
            similar_tickets: self
                .run
                .classification
                .as_ref()
                .map(|c| c.similar_tickets.clone())
                .unwrap_or_default(),
            issue_key: self.run.issue.as_ref().map(|i| i.key.clone()),
            reservation_id: self.run.reservation.as_ref().map(|r| r.confirmation_id.clone()),
        };
        let pack = self.ledger.seal(summary, self.deps.signer.as_ref())?;
        self.deps.events.publish(RunEvent::RunSealed {
            run_id: self.run.id.clone(),
            terminal_state: self.run.state,
            final_hash: pack.attestation.final_hash.clone(),
            timestamp: Utc::now(),
        });
        self.pack = Some(pack);
        Ok(())
    }
}

/// Idempotency key of a non-idempotent tool within a run.
pub fn idempotency_key(run_id: &str, tool: Tool) -> String {
    format!("{run_id}:{tool}")
}

/// Re-apply recorded entries to a freshly opened run.
fn restore(run: &mut Run, entries: &[LedgerEntry]) -> Result<(), RunError> {
    let mut gate_tools = std::collections::HashMap::new();
    for entry in entries {
        match entry {
            LedgerEntry::Step(step) => {
                if let Some(tool) = step.tool.filter(|_| step.label == "gate") {
                    gate_tools.insert(step.seq, tool);
                }
                restore_step(run, step)?;
            }
            LedgerEntry::Approval(approval) => {
                run.pending = None;
                if approval.decision == ApprovalDecision::Approved {
                    let tool = gate_tools.get(&approval.gates_step).copied().or_else(|| {
                        entries
                            .iter()
                            .filter_map(LedgerEntry::as_step)
                            .find(|s| s.seq == approval.gates_step)
                            .and_then(|s| s.tool)
                    });
                    if let Some(tool) = tool {
                        run.cleared = Some(Clearance {
                            tool,
                            approved: true,
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

fn restore_step(run: &mut Run, step: &Step) -> Result<(), RunError> {
    if let Some(transition) = step.transition {
        run.state = transition.to;
        if transition.to.is_terminal() {
            run.finished_at = Some(step.recorded_at);
            run.failure = step.failure;
            run.pending = None;
        }
    }
    if let Some(hold) = step.output.get("hold") {
        run.pending = Some(Pending::Approval(serde_json::from_value(hold.clone())?));
    }
    match step.label.as_str() {
        "gate" if step.output.get("decision").and_then(|d| d.get("decision")) == Some(&json!("allow")) => {
            if let Some(tool) = step.tool {
                run.cleared = Some(Clearance {
                    tool,
                    approved: false,
                });
            }
        }
        "artifact_received" => {
            if let Some(artifact) = step.input.get("artifact") {
                run.artifact = Some(serde_json::from_value(artifact.clone())?);
            }
        }
        _ => {}
    }
    if step.kind == StepKind::ToolCall && step.outcome == StepOutcome::Success {
        if let Some(tool) = step.tool {
            if run.open_gate().is_some_and(|g| g.tool == tool) {
                run.pending = None;
            }
            restore_output(run, tool, &step.output)?;
        }
    }
    Ok(())
}

fn restore_output(run: &mut Run, tool: Tool, output: &Value) -> Result<(), RunError> {
    match tool {
        Tool::ClassifyTicket => run.classification = Some(payload::from_value(tool, output)?),
        Tool::CreateIssue => run.issue = Some(payload::from_value(tool, output)?),
        Tool::AnalyzeLog => run.findings = Some(payload::from_value(tool, output)?),
        Tool::RecommendSpare => run.recommendation = Some(payload::from_value(tool, output)?),
        Tool::ReserveSpare => run.reservation = Some(payload::from_value(tool, output)?),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_agents::{SimulatedTransport, ToolError};
    use mesh_audit::{replay, LocalKeySigner};
    use mesh_policy::Priority;

    const CRC_LOG: &str = "\
2024-03-02 14:31:07 INFO  agv-17 heartbeat ok
2024-03-02 14:32:10 ERROR agv-17 CRC checksum mismatch error on motor driver bus
2024-03-02 14:32:41 ERROR agv-17 CRC frame mismatch error on motor driver bus
";

    fn deps(transport: Arc<SimulatedTransport>) -> Collaborators {
        let signer = Arc::new(LocalKeySigner::generate("test-signer").unwrap());
        Collaborators::new(AgentAdapter::new(transport), signer).with_settings(OrchestratorSettings {
            backoff_base_ms: 0,
            ..OrchestratorSettings::default()
        })
    }

    fn p3_ticket() -> Ticket {
        Ticket::new("ZD-100", "AGV motor driver fault, totes misrouted", "ATL-1", Priority::P3)
    }

    fn policy() -> Arc<PolicyConfig> {
        Arc::new(PolicyConfig::default())
    }

    #[tokio::test]
    async fn golden_path_without_artifact_suspends_in_issue_created() {
        let transport = Arc::new(SimulatedTransport::new());
        let mut orch = RunOrchestrator::create(p3_ticket(), policy(), deps(transport.clone())).unwrap();
        orch.start().await.unwrap();

        assert_eq!(orch.run().state, RunState::IssueCreated);
        assert_eq!(orch.run().pending, Some(Pending::Artifact));
        assert_eq!(orch.run().issue.as_ref().unwrap().key, "GO-1012");
        assert!(orch.pack().is_none());
        assert_eq!(transport.calls(Tool::CreateIssue), 1);
    }

    #[tokio::test]
    async fn artifact_drives_run_to_resolved_with_reservation() {
        let transport = Arc::new(SimulatedTransport::new().with_log("blob://agv-17.log", CRC_LOG));
        let mut orch = RunOrchestrator::create(p3_ticket(), policy(), deps(transport.clone())).unwrap();
        orch.start().await.unwrap();
        orch.artifact_uploaded(ArtifactRef::new("agv-17.log", "blob://agv-17.log"))
            .await
            .unwrap();

        assert_eq!(orch.run().state, RunState::Resolved);
        let pack = orch.pack().unwrap();
        assert!(replay::verify(pack));
        assert_eq!(pack.summary.terminal_state, RunState::Resolved);
        assert_eq!(pack.summary.issue_key.as_deref(), Some("GO-1012"));
        assert_eq!(pack.summary.reservation_id.as_deref(), Some("RSV-000001"));
        assert_eq!(transport.calls(Tool::ReserveSpare), 1);

        let view = replay::replay(pack);
        assert!(view.illegal_transitions.is_empty());
        assert_eq!(view.states.last().unwrap().state, RunState::Resolved);
    }

    #[tokio::test]
    async fn first_step_opens_the_run_with_its_snapshot() {
        let transport = Arc::new(SimulatedTransport::new());
        let orch = RunOrchestrator::create(p3_ticket(), policy(), deps(transport)).unwrap();
        let first = orch.ledger().steps().next().unwrap();
        assert_eq!(first.label, RUN_OPENED);
        assert_eq!(first.input["ticket"]["id"], "ZD-100");
        assert_eq!(first.input["policy"]["version"], 1);
    }

    #[tokio::test]
    async fn run_requires_every_workflow_tool_declared() {
        let transport = Arc::new(SimulatedTransport::new());
        let catalog: mesh_agents::AgentCatalog = serde_json::from_value(json!([
            { "name": "TriageAgent", "tools": ["classify_ticket", "create_issue"] },
            { "name": "LogAnalyzerAgent", "tools": ["analyze_log"] },
            { "name": "SpareAgent", "tools": ["recommend_spare"] }
        ]))
        .unwrap();
        let signer = Arc::new(LocalKeySigner::generate("s").unwrap());
        let deps = Collaborators::new(AgentAdapter::new(transport).with_catalog(catalog), signer);
        assert!(matches!(
            RunOrchestrator::create(p3_ticket(), policy(), deps),
            Err(RunError::Agent(_))
        ));
    }

    #[tokio::test]
    async fn rejected_classification_fails_the_run_and_still_seals() {
        let transport = Arc::new(SimulatedTransport::new());
        transport.fail_next(Tool::ClassifyTicket, 1, ToolError::Rejected("bad ticket".into()));
        let mut orch = RunOrchestrator::create(p3_ticket(), policy(), deps(transport.clone())).unwrap();
        orch.start().await.unwrap();

        assert_eq!(orch.run().state, RunState::Failed);
        assert_eq!(orch.run().failure, Some(FailureKind::ToolRejected));
        assert_eq!(transport.calls(Tool::ClassifyTicket), 1);
        let pack = orch.pack().unwrap();
        assert!(replay::verify(pack));
        assert_eq!(pack.steps_with_outcome(StepOutcome::Failed).count(), 1);
    }

    #[tokio::test]
    async fn low_confidence_holds_issue_creation() {
        let transport = Arc::new(SimulatedTransport::new());
        let ticket = p3_ticket().with_confidence(0.5);
        let mut orch = RunOrchestrator::create(ticket, policy(), deps(transport.clone())).unwrap();
        orch.start().await.unwrap();

        assert_eq!(orch.run().state, RunState::AwaitingApproval);
        let gate = orch.run().open_gate().unwrap();
        assert_eq!(gate.rule, GateRule::LowConfidence);
        assert!(orch.approval_deadline().is_some());
        assert_eq!(transport.calls(Tool::CreateIssue), 0);
    }

    #[tokio::test]
    async fn approval_without_open_gate_is_an_error() {
        let transport = Arc::new(SimulatedTransport::new());
        let mut orch = RunOrchestrator::create(p3_ticket(), policy(), deps(transport)).unwrap();
        orch.start().await.unwrap();
        assert!(matches!(
            orch.approval_decided(ApprovalInput::approve("dana", Role::Head)).await,
            Err(RunError::NotAwaitingApproval { .. })
        ));
    }

    #[tokio::test]
    async fn rejection_abandons_and_seals() {
        let transport = Arc::new(SimulatedTransport::new());
        let ticket = Ticket::new("ZD-1", "AGV down", "ATL-1", Priority::P1);
        let mut orch = RunOrchestrator::create(ticket, policy(), deps(transport.clone())).unwrap();
        orch.start().await.unwrap();
        let outcome = orch
            .approval_decided(ApprovalInput::reject("dana", Role::Head))
            .await
            .unwrap();

        assert_eq!(outcome, ApprovalOutcome::Recorded(ApprovalDecision::Rejected));
        assert_eq!(orch.run().state, RunState::Abandoned);
        assert_eq!(orch.run().failure, Some(FailureKind::ApprovalRejected));
        assert_eq!(transport.calls(Tool::CreateIssue), 0);
        let pack = orch.pack().unwrap();
        assert_eq!(pack.approvals.len(), 1);
        assert!(replay::verify(pack));
    }

    #[tokio::test]
    async fn approval_timeout_abandons() {
        let transport = Arc::new(SimulatedTransport::new());
        let ticket = Ticket::new("ZD-2", "AGV down", "ATL-1", Priority::P1);
        let mut orch = RunOrchestrator::create(ticket, policy(), deps(transport)).unwrap();
        orch.start().await.unwrap();
        let deadline = orch.approval_deadline().unwrap();

        assert!(!orch.expire_approval(deadline - chrono::Duration::seconds(1)).unwrap());
        assert!(orch.expire_approval(deadline).unwrap());
        assert_eq!(orch.run().state, RunState::Abandoned);
        assert_eq!(orch.run().failure, Some(FailureKind::ApprovalTimeout));
        assert!(orch.pack().is_some());
    }

    #[tokio::test]
    async fn abandon_signal_seals_from_any_live_state() {
        let transport = Arc::new(SimulatedTransport::new());
        let mut orch = RunOrchestrator::create(p3_ticket(), policy(), deps(transport)).unwrap();
        orch.start().await.unwrap();
        orch.abandon("customer withdrew ticket").unwrap();

        assert_eq!(orch.run().state, RunState::Abandoned);
        assert!(orch.pack().is_some());
        assert!(matches!(orch.abandon("again"), Err(RunError::Terminal { .. })));
    }

    #[tokio::test]
    async fn early_artifact_is_used_when_issue_is_created() {
        let transport = Arc::new(SimulatedTransport::new().with_log("blob://a.log", "all quiet"));
        let ticket = Ticket::new("ZD-3", "AGV motor fault", "ATL-1", Priority::P1);
        let mut orch = RunOrchestrator::create(ticket, policy(), deps(transport)).unwrap();
        orch.start().await.unwrap();
        orch.artifact_uploaded(ArtifactRef::new("a.log", "blob://a.log"))
            .await
            .unwrap();
        assert_eq!(orch.run().state, RunState::AwaitingApproval);

        orch.approval_decided(ApprovalInput::approve("dana", Role::Head))
            .await
            .unwrap();
        // No known signature: no replacement part, so the run resolves directly.
        assert_eq!(orch.run().state, RunState::Resolved);
        assert!(orch.run().reservation.is_none());
    }

    #[tokio::test]
    async fn second_artifact_is_refused() {
        let transport = Arc::new(SimulatedTransport::new());
        let ticket = Ticket::new("ZD-4", "AGV motor fault", "ATL-1", Priority::P1);
        let mut orch = RunOrchestrator::create(ticket, policy(), deps(transport)).unwrap();
        orch.start().await.unwrap();
        orch.artifact_uploaded(ArtifactRef::new("a.log", "blob://a.log"))
            .await
            .unwrap();
        assert!(matches!(
            orch.artifact_uploaded(ArtifactRef::new("b.log", "blob://b.log")).await,
            Err(RunError::UnexpectedArtifact { .. })
        ));
    }

    #[test]
    fn idempotency_key_is_per_run_and_tool() {
        assert_eq!(idempotency_key("r1", Tool::CreateIssue), "r1:create_issue");
        assert_ne!(
            idempotency_key("r1", Tool::ReserveSpare),
            idempotency_key("r2", Tool::ReserveSpare)
        );
    }
}
