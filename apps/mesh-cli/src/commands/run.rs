// run.rs — `mesh run` and `mesh run --resume`: drive a ticket with the
// simulated agents.
//
// The run goes through the supervisor exactly as an ingestion service would
// feed it: the ticket, then approvals and the log artifact as the run asks
// for them. When the run needs something the command line did not supply it
// stays live in `.mesh/runs/` and can be resumed later.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use clap::Args;
use mesh_agents::{ArtifactRef, SimulatedTransport};
use mesh_audit::ApprovalDecision;
use mesh_policy::{PolicyStore, Role};
use mesh_run::{
    Collaborators, EventLog, InboundEvent, LogSink, Pending, RunError, RunStatus, RunStore,
    RunSupervisor, RunTarget,
};

use super::keygen;
use crate::Context;

#[derive(Args)]
pub struct RunArgs {
    /// Ticket JSON to open a run for.
    #[arg(long, required_unless_present = "resume", conflicts_with = "resume")]
    ticket: Option<PathBuf>,

    /// Resume a live run from its journal instead of opening a new one.
    #[arg(long, value_name = "RUN_ID")]
    resume: Option<String>,

    /// Log file to upload when the run asks for one.
    #[arg(long)]
    log: Option<PathBuf>,

    /// Approve open gates in order, as `actor:role` (repeatable).
    #[arg(long, value_name = "ACTOR:ROLE")]
    approve: Vec<String>,

    /// Reject the next open gate, as `actor:role`.
    #[arg(long, value_name = "ACTOR:ROLE")]
    reject: Option<String>,

    /// Also write the evidence pack here.
    #[arg(long)]
    out: Option<PathBuf>,
}

pub async fn execute(args: &RunArgs, ctx: &Context) -> anyhow::Result<()> {
    let mut decisions = args
        .approve
        .iter()
        .map(|s| parse_approver(s).map(|(actor, role)| (actor, role, ApprovalDecision::Approved)))
        .collect::<anyhow::Result<Vec<_>>>()?;
    if let Some(reject) = &args.reject {
        let (actor, role) = parse_approver(reject)?;
        decisions.push((actor, role, ApprovalDecision::Rejected));
    }
    let mut artifact = args.log.as_deref().map(artifact_for).transpose()?;

    let supervisor = supervisor(ctx)?;
    let mut status = match (&args.ticket, &args.resume) {
        (Some(path), _) => {
            let ticket = super::read_ticket(path)?;
            supervisor
                .handle(InboundEvent::TicketCreated { ticket })
                .await?
        }
        (None, Some(run_id)) => resumed(&supervisor, run_id).await?,
        (None, None) => anyhow::bail!("either --ticket or --resume is required"),
    };
    let target = RunTarget::Run(status.run_id.clone());
    let mut decisions = decisions.into_iter();

    while !status.state.is_terminal() {
        let event = match &status.pending {
            Some(Pending::Approval(gate)) => match decisions.next() {
                Some((actor, role, decision)) => InboundEvent::ApprovalDecided {
                    target: target.clone(),
                    actor,
                    role,
                    channel: "cli".to_string(),
                    decision,
                },
                None => {
                    print_status(&status);
                    println!(
                        "Waiting for approval of {} by {} or above: {}",
                        gate.tool, gate.required_role, gate.reason
                    );
                    println!("Resume with: mesh run --resume {} --approve <actor>:<role>", status.run_id);
                    return Ok(());
                }
            },
            Some(Pending::Artifact) => match artifact.take() {
                Some(artifact) => InboundEvent::ArtifactUploaded {
                    target: target.clone(),
                    artifact,
                },
                None => {
                    print_status(&status);
                    println!("Waiting for a log artifact.");
                    println!("Resume with: mesh run --resume {} --log <file>", status.run_id);
                    return Ok(());
                }
            },
            None => anyhow::bail!("run {} stopped in {} with nothing pending", status.run_id, status.state),
        };

        status = match supervisor.handle(event).await {
            Ok(status) => status,
            Err(RunError::ApprovalRefused { required_role, .. }) => {
                println!("Approval refused: this gate needs {required_role} or above.");
                supervisor.status(&target).await?
            }
            Err(e) => return Err(e.into()),
        };
    }

    let pack = supervisor.finish(&status.run_id).await?;
    if let Some(out) = &args.out {
        pack.save(out)?;
        println!("Evidence pack written to {}", out.display());
    }
    print_status(&status);
    println!("Issue:       {}", pack.summary.issue_key.as_deref().unwrap_or("-"));
    println!(
        "Reservation: {}",
        pack.summary.reservation_id.as_deref().unwrap_or("-")
    );
    println!("Entries:     {}", pack.attestation.entry_count);
    println!("Final hash:  {}", pack.attestation.final_hash);
    println!("Pack:        {}", ctx.paths.pack(&status.run_id).display());
    Ok(())
}

fn supervisor(ctx: &Context) -> anyhow::Result<RunSupervisor> {
    let transport = Arc::new(SimulatedTransport::new());
    let signer = keygen::load_signer(ctx)?;
    let events = EventLog::new().with_sink(Box::new(LogSink::new(&ctx.paths.events_log)));
    let deps = Collaborators::from_agentfile(&ctx.agentfile, transport, signer)
        .with_events(Arc::new(events));
    let policy = Arc::new(PolicyStore::new(ctx.agentfile.policies.clone())?);
    let store = RunStore::new(ctx.paths.clone())?;
    Ok(RunSupervisor::new(deps, policy).with_store(store))
}

async fn resumed(supervisor: &RunSupervisor, run_id: &str) -> anyhow::Result<RunStatus> {
    let report = supervisor.resume().await?;
    tracing::info!(
        resumed = report.resumed.len(),
        failed = report.failed.len(),
        "live runs resumed"
    );
    if let Some(failure) = report.failed.into_iter().find(|f| f.run_id == run_id) {
        return Err(anyhow::Error::new(failure.error).context(format!("cannot resume run {run_id}")));
    }
    report
        .resumed
        .into_iter()
        .find(|s| s.run_id == run_id)
        .with_context(|| format!("no live run {run_id} under .mesh/runs"))
}

/// Parse `actor:role`.
fn parse_approver(arg: &str) -> anyhow::Result<(String, Role)> {
    let Some((actor, role)) = arg.rsplit_once(':') else {
        anyhow::bail!("expected <actor>:<role>, got '{arg}'");
    };
    if actor.is_empty() {
        anyhow::bail!("approver in '{arg}' has no name");
    }
    Ok((actor.to_string(), role.parse()?))
}

fn artifact_for(path: &Path) -> anyhow::Result<ArtifactRef> {
    let path = path
        .canonicalize()
        .with_context(|| format!("cannot find log {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "log".to_string());
    let mut artifact = ArtifactRef::new(name, format!("file://{}", path.display()));
    artifact.size_bytes = std::fs::metadata(&path)?.len();
    Ok(artifact)
}

fn print_status(status: &RunStatus) {
    println!("Run:         {}", status.run_id);
    println!("Ticket:      {}", status.ticket_id);
    println!("State:       {}", status.state);
    if let Some(failure) = status.failure {
        println!("Failure:     {failure}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn approver_is_actor_then_role() {
        assert_eq!(
            parse_approver("dana.ops:head").unwrap(),
            ("dana.ops".to_string(), Role::Head)
        );
        assert_eq!(
            parse_approver("ops:team:exec").unwrap(),
            ("ops:team".to_string(), Role::Exec)
        );
        assert!(parse_approver("dana").is_err());
        assert!(parse_approver(":head").is_err());
        assert!(parse_approver("dana:intern").is_err());
    }

    #[test]
    fn artifact_points_at_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agv-17.log");
        std::fs::write(&path, "ERROR CRC mismatch error\n").unwrap();

        let artifact = artifact_for(&path).unwrap();
        assert_eq!(artifact.name, "agv-17.log");
        assert!(artifact.uri.starts_with("file://"));
        assert_eq!(artifact.size_bytes, 25);
        assert!(artifact_for(&dir.path().join("missing.log")).is_err());
    }
}
