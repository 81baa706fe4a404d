// supervisor.rs — One task per run, fed by inbound events.
//
// The supervisor is the ingestion collaborator's entry point. Each run lives
// in its own tokio task that owns the orchestrator (and therefore the
// ledger) exclusively. The task waits on three things: commands from the
// supervisor, the open approval gate's deadline, and the instant a
// rate-limited action may retry. Runs for different tickets proceed
// concurrently; within a run everything is sequential.
//
// Only the rate limiter and the policy store are shared between runs. Each
// run takes its policy snapshot when it is created.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mesh_agents::ArtifactRef;
use mesh_audit::{ApprovalDecision, EvidencePack};
use mesh_policy::{PolicyStore, Role, Ticket};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::MeshPaths;
use crate::error::RunError;
use crate::orchestrator::{ApprovalInput, ApprovalOutcome, Collaborators, RunOrchestrator};
use crate::run::RunStatus;
use crate::store::{RunRecord, RunStore};

const COMMAND_BUFFER: usize = 32;

/// How an inbound event names its run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", content = "id", rename_all = "snake_case")]
pub enum RunTarget {
    Run(String),
    /// The ticket's most recent run.
    Ticket(String),
}

/// Events delivered by the ingestion collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InboundEvent {
    TicketCreated {
        ticket: Ticket,
    },
    ArtifactUploaded {
        target: RunTarget,
        artifact: ArtifactRef,
    },
    ApprovalDecided {
        target: RunTarget,
        actor: String,
        role: Role,
        #[serde(default = "default_channel")]
        channel: String,
        decision: ApprovalDecision,
    },
    Abandon {
        target: RunTarget,
        reason: String,
    },
}

fn default_channel() -> String {
    "agent_mesh".to_string()
}

type Reply = oneshot::Sender<Result<RunStatus, RunError>>;

enum Command {
    Artifact(ArtifactRef, Reply),
    Approval(ApprovalInput, Reply),
    Abandon(String, Reply),
    Status(Reply),
}

struct RunHandle {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<Result<EvidencePack, RunError>>,
}

/// Status of runs whose task has ended, so late events get a clear answer.
/// One entry per ended run is kept until [`RunSupervisor::forget`] drops it.
type Finished = Arc<Mutex<HashMap<String, RunStatus>>>;

/// A live run that could not be brought back by [`RunSupervisor::resume`].
#[derive(Debug)]
pub struct ResumeFailure {
    pub run_id: String,
    pub error: RunError,
}

/// Outcome of [`RunSupervisor::resume`].
#[derive(Debug, Default)]
pub struct ResumeReport {
    pub resumed: Vec<RunStatus>,
    pub failed: Vec<ResumeFailure>,
}

pub struct RunSupervisor {
    deps: Collaborators,
    policy: Arc<PolicyStore>,
    store: Option<Arc<RunStore>>,
    runs: Mutex<HashMap<String, RunHandle>>,
    tickets: Mutex<HashMap<String, String>>,
    finished: Finished,
}

impl RunSupervisor {
    /// Supervisor with in-memory ledgers.
    pub fn new(deps: Collaborators, policy: Arc<PolicyStore>) -> Self {
        Self {
            deps,
            policy,
            store: None,
            runs: Mutex::new(HashMap::new()),
            tickets: Mutex::new(HashMap::new()),
            finished: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Journal ledgers, run records and packs under `.mesh/`.
    pub fn with_store(mut self, store: RunStore) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    pub fn policy(&self) -> &Arc<PolicyStore> {
        &self.policy
    }

    /// Runs currently owned by a task.
    pub fn live_runs(&self) -> Vec<String> {
        self.lock_runs().keys().cloned().collect()
    }

    /// Route one inbound event and return the run's status afterwards.
    pub async fn handle(&self, event: InboundEvent) -> Result<RunStatus, RunError> {
        match event {
            InboundEvent::TicketCreated { ticket } => self.open(ticket).await,
            InboundEvent::ArtifactUploaded { target, artifact } => {
                self.send(&target, |reply| Command::Artifact(artifact, reply)).await
            }
            InboundEvent::ApprovalDecided {
                target,
                actor,
                role,
                channel,
                decision,
            } => {
                let input = ApprovalInput {
                    actor,
                    role,
                    channel,
                    decision,
                };
                self.send(&target, |reply| Command::Approval(input, reply)).await
            }
            InboundEvent::Abandon { target, reason } => {
                self.send(&target, |reply| Command::Abandon(reason, reply)).await
            }
        }
    }

    pub async fn status(&self, target: &RunTarget) -> Result<RunStatus, RunError> {
        self.send(target, Command::Status).await
    }

    /// Wait for a run to end and take its sealed evidence pack.
    ///
    /// The run stops taking events once it is handed over; a run that is
    /// still suspended keeps waiting on its own deadlines until it ends.
    pub async fn finish(&self, run_id: &str) -> Result<EvidencePack, RunError> {
        let RunHandle { commands, task } = self
            .lock_runs()
            .remove(run_id)
            .ok_or_else(|| RunError::UnknownRun(run_id.to_string()))?;
        let result = task.await.map_err(|e| RunError::TaskFailed(e.to_string()));
        drop(commands);
        result?
    }

    /// Restart every run the store still lists as live, from its journal.
    ///
    /// A run that cannot be recovered is logged and reported in
    /// [`ResumeReport::failed`]; the others are resumed regardless.
    pub async fn resume(&self) -> Result<ResumeReport, RunError> {
        let mut report = ResumeReport::default();
        let Some(store) = self.store.clone() else {
            return Ok(report);
        };
        for record in store.live()? {
            if self.lock_runs().contains_key(&record.run_id) {
                continue;
            }
            let resumed = match RunOrchestrator::recover(&record.journal, self.deps.clone()) {
                Ok(orchestrator) => self.spawn(orchestrator).await,
                Err(e) => Err(e),
            };
            match resumed {
                Ok(status) => report.resumed.push(status),
                Err(error) => {
                    tracing::warn!(
                        run_id = %record.run_id,
                        journal = %record.journal.display(),
                        %error,
                        "live run could not be resumed"
                    );
                    report.failed.push(ResumeFailure {
                        run_id: record.run_id,
                        error,
                    });
                }
            }
        }
        Ok(report)
    }

    /// Drop what the supervisor remembers about an ended run. Later events
    /// for it are answered as for an unknown run.
    pub fn forget(&self, run_id: &str) -> bool {
        let removed = self
            .finished
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(run_id)
            .is_some();
        if removed {
            self.lock_tickets().retain(|_, id| id.as_str() != run_id);
        }
        removed
    }

    async fn open(&self, ticket: Ticket) -> Result<RunStatus, RunError> {
        let snapshot = self.policy.snapshot();
        let orchestrator = match &self.store {
            Some(store) => RunOrchestrator::create_in(ticket, snapshot, self.deps.clone(), store.paths())?,
            None => RunOrchestrator::create(ticket, snapshot, self.deps.clone())?,
        };
        self.spawn(orchestrator).await
    }

    /// Start the run's task and wait until it first suspends or ends.
    async fn spawn(&self, orchestrator: RunOrchestrator) -> Result<RunStatus, RunError> {
        let run_id = orchestrator.run().id.clone();
        let ticket_id = orchestrator.run().ticket.id.clone();
        let (commands, receiver) = mpsc::channel(COMMAND_BUFFER);
        let (started, first) = oneshot::channel();
        let task = tokio::spawn(drive(
            orchestrator,
            receiver,
            started,
            self.store.clone(),
            self.finished.clone(),
        ));
        self.lock_runs().insert(run_id.clone(), RunHandle { commands, task });
        self.lock_tickets().insert(ticket_id.clone(), run_id.clone());
        let status = first
            .await
            .map_err(|_| RunError::TaskFailed("run task ended before starting".into()))
            .and_then(|started| started);
        if status.is_err() {
            // The task has ended; it must not be reported as live.
            self.lock_runs().remove(&run_id);
            let mut tickets = self.lock_tickets();
            if tickets.get(&ticket_id) == Some(&run_id) {
                tickets.remove(&ticket_id);
            }
        }
        status
    }

    async fn send(
        &self,
        target: &RunTarget,
        command: impl FnOnce(Reply) -> Command,
    ) -> Result<RunStatus, RunError> {
        let run_id = self.resolve(target)?;
        let sender = self.lock_runs().get(&run_id).map(|h| h.commands.clone());
        let (reply, answer) = oneshot::channel();
        let delivered = match sender {
            Some(sender) => sender.send(command(reply)).await.is_ok(),
            None => false,
        };
        if !delivered {
            return Err(self.gone(&run_id));
        }
        answer.await.map_err(|_| self.gone(&run_id))?
    }

    fn resolve(&self, target: &RunTarget) -> Result<String, RunError> {
        match target {
            RunTarget::Run(run_id) => Ok(run_id.clone()),
            RunTarget::Ticket(ticket_id) => self
                .lock_tickets()
                .get(ticket_id)
                .cloned()
                .ok_or_else(|| RunError::UnknownTicket(ticket_id.clone())),
        }
    }

    /// Error for an event addressed to a run that no longer takes events.
    fn gone(&self, run_id: &str) -> RunError {
        let finished = self.finished.lock().unwrap_or_else(|e| e.into_inner());
        match finished.get(run_id) {
            Some(status) => RunError::Terminal {
                run_id: run_id.to_string(),
                state: status.state,
            },
            None => RunError::UnknownRun(run_id.to_string()),
        }
    }

    fn lock_runs(&self) -> MutexGuard<'_, HashMap<String, RunHandle>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_tickets(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.tickets.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The body of a run task.
async fn drive(
    mut orchestrator: RunOrchestrator,
    mut commands: mpsc::Receiver<Command>,
    started: oneshot::Sender<Result<RunStatus, RunError>>,
    store: Option<Arc<RunStore>>,
    finished: Finished,
) -> Result<EvidencePack, RunError> {
    let first = orchestrator.advance().await;
    persist(&orchestrator, store.as_deref());
    let failed_start = first.is_err();
    let _ = started.send(first.map(|()| orchestrator.status()));
    if failed_start {
        return Err(RunError::TaskFailed(format!(
            "run {} could not start",
            orchestrator.run().id
        )));
    }

    while !orchestrator.is_terminal() {
        let deadline = orchestrator.approval_deadline();
        let retry_at = orchestrator.rate_limit_retry_at();
        let result = tokio::select! {
            command = commands.recv() => match command {
                Some(command) => {
                    apply(&mut orchestrator, command).await;
                    Ok(())
                }
                None => {
                    tracing::info!(
                        run_id = %orchestrator.run().id,
                        state = %orchestrator.run().state,
                        "supervisor released a live run"
                    );
                    return Err(RunError::TaskFailed(format!(
                        "run {} released in state {}",
                        orchestrator.run().id,
                        orchestrator.run().state
                    )));
                }
            },
            _ = sleep_until(deadline) => orchestrator.expire_approval(Utc::now()).map(|_| ()),
            _ = sleep_until(retry_at) => orchestrator.retry_rate_limited(Utc::now()).await.map(|_| ()),
        };
        if let Err(e) = result {
            tracing::warn!(run_id = %orchestrator.run().id, error = %e, "run task error");
        }
        persist(&orchestrator, store.as_deref());
    }

    let status = orchestrator.status();
    finished
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(status.run_id.clone(), status);
    // Late commands get a terminal answer rather than silence.
    commands.close();
    while let Some(command) = commands.recv().await {
        apply(&mut orchestrator, command).await;
    }
    orchestrator
        .pack()
        .cloned()
        .ok_or_else(|| RunError::TaskFailed("terminal run has no pack".into()))
}

async fn apply(orchestrator: &mut RunOrchestrator, command: Command) {
    let (result, reply) = match command {
        Command::Artifact(artifact, reply) => (orchestrator.artifact_uploaded(artifact).await, reply),
        Command::Approval(input, reply) => {
            let result = match orchestrator.approval_decided(input).await {
                Ok(ApprovalOutcome::Recorded(_)) => Ok(()),
                Ok(ApprovalOutcome::Refused { required_role }) => Err(RunError::ApprovalRefused {
                    run_id: orchestrator.run().id.clone(),
                    required_role,
                }),
                Err(e) => Err(e),
            };
            (result, reply)
        }
        Command::Abandon(reason, reply) => (orchestrator.abandon(&reason), reply),
        Command::Status(reply) => (Ok(()), reply),
    };
    let _ = reply.send(result.map(|()| orchestrator.status()));
}

/// Write the run record, and the pack once sealed. Failures are logged; the
/// journal remains the source of truth.
fn persist(orchestrator: &RunOrchestrator, store: Option<&RunStore>) {
    let Some(store) = store else {
        return;
    };
    let run = orchestrator.run();
    let mut pack_path = None;
    if let Some(pack) = orchestrator.pack() {
        let path = store.paths().pack(&run.id);
        match pack.save(&path) {
            Ok(()) => pack_path = Some(path),
            Err(e) => tracing::warn!(run_id = %run.id, error = %e, "failed to write evidence pack"),
        }
    }
    let record = RunRecord {
        run_id: run.id.clone(),
        ticket_id: run.ticket.id.clone(),
        tenant: run.tenant.clone(),
        state: run.state,
        created_at: run.started_at,
        updated_at: Utc::now(),
        journal: store.paths().journal(&run.id),
        pack_path,
    };
    if let Err(e) = store.save(&record) {
        tracing::warn!(run_id = %run.id, error = %e, "failed to write run record");
    }
}

/// Sleep until `at`; never completes for `None`.
async fn sleep_until(at: Option<DateTime<Utc>>) {
    match at {
        Some(at) => {
            let wait = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;
        }
        None => std::future::pending::<()>().await,
    }
}

