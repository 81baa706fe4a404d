// pack.rs — Evidence pack subcommands: verify, replay, verify-signature.

use std::path::{Path, PathBuf};

use clap::Subcommand;
use mesh_audit::{replay, verify_signature, EvidencePack, LedgerError};

#[derive(Subcommand)]
pub enum PackCommands {
    /// Recompute the hash chain and check it against the attestation.
    Verify {
        /// Path to the evidence pack JSON.
        file: PathBuf,
    },
    /// Show the states, tool calls and approvals a run went through.
    Replay {
        file: PathBuf,
        /// Print the reconstructed view as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Check the attestation signature with an Ed25519 public key.
    VerifySignature {
        file: PathBuf,
        /// Base64 public key, as printed by `mesh keygen`.
        #[arg(long)]
        public_key: String,
    },
}

pub fn execute(cmd: &PackCommands) -> anyhow::Result<()> {
    match cmd {
        PackCommands::Verify { file } => {
            let pack = load(file)?;
            match replay::check(&pack) {
                Ok(()) => {
                    println!(
                        "Evidence pack verified: {} entries, hash chain intact.",
                        pack.attestation.entry_count
                    );
                    println!("Run:        {}", pack.summary.run_id);
                    println!("Terminal:   {}", pack.summary.terminal_state);
                    println!("Final hash: {}", pack.attestation.final_hash);
                }
                Err(LedgerError::ChainIntegrityViolation { seq, reason }) => {
                    println!("INTEGRITY VIOLATION at entry {}:", seq);
                    println!("  {}", reason);
                    println!();
                    println!("The evidence pack may have been tampered with.");
                    anyhow::bail!("Evidence pack integrity check failed");
                }
                Err(e) => return Err(e.into()),
            }
        }

        PackCommands::Replay { file, json } => {
            let pack = load(file)?;
            let view = replay::replay(&pack);
            if *json {
                println!("{}", serde_json::to_string_pretty(&view)?);
                return Ok(());
            }

            println!("Run {} (ticket {})", view.run_id, view.ticket_id);
            println!(
                "Verified: {}",
                if view.verified { "yes" } else { "NO" }
            );
            println!();
            println!("{:<6} STATE", "SEQ");
            println!("{}", "-".repeat(40));
            for visit in &view.states {
                println!("{:<6} {}", visit.seq, visit.state);
            }

            if !view.tool_calls.is_empty() {
                println!();
                println!(
                    "{:<6} {:<18} {:<14} {:<8} LATENCY",
                    "SEQ", "TOOL", "OUTCOME", "ATTEMPT"
                );
                println!("{}", "-".repeat(60));
                for call in &view.tool_calls {
                    println!(
                        "{:<6} {:<18} {:<14} {:<8} {}ms",
                        call.seq,
                        call.tool.to_string(),
                        call.outcome.to_string(),
                        call.attempt.map_or("-".to_string(), |a| a.to_string()),
                        call.latency_ms,
                    );
                }
            }

            if !view.approvals.is_empty() {
                println!();
                println!("{:<6} {:<16} {:<10} {:<10} GATES", "SEQ", "ACTOR", "ROLE", "DECISION");
                println!("{}", "-".repeat(60));
                for approval in &view.approvals {
                    println!(
                        "{:<6} {:<16} {:<10} {:<10} {}",
                        approval.seq,
                        approval.actor,
                        approval.role.to_string(),
                        approval.decision.to_string(),
                        approval.gates_step,
                    );
                }
            }

            for transition in &view.illegal_transitions {
                println!("ILLEGAL TRANSITION: {}", transition);
            }
            println!();
            println!("Terminal state: {}", view.terminal_state);
        }

        PackCommands::VerifySignature { file, public_key } => {
            let pack = load(file)?;
            verify_signature(&pack, public_key)?;
            println!(
                "Signature valid: signed by {}",
                pack.attestation.signed_by
            );
        }
    }

    Ok(())
}

fn load(path: &Path) -> anyhow::Result<EvidencePack> {
    Ok(EvidencePack::load(path)?)
}
