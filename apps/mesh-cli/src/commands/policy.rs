// policy.rs — Policy subcommands: show, evaluate.

use std::path::PathBuf;

use clap::{Subcommand, ValueEnum};
use mesh_agents::SpareRecommendation;
use mesh_policy::{GateDecision, PolicyGate, ProposedAction};

use crate::Context;

#[derive(Clone, Copy, ValueEnum)]
pub enum ActionArg {
    CreateIssue,
    ReserveSpare,
}

#[derive(Subcommand)]
pub enum PolicyCommands {
    /// Print the governance policy in effect.
    Show {
        /// Print as JSON instead of YAML.
        #[arg(long)]
        json: bool,
    },
    /// Dry-run the gate for one action on a ticket.
    Evaluate {
        /// Path to the ticket JSON.
        #[arg(long)]
        ticket: PathBuf,
        #[arg(long, value_enum)]
        action: ActionArg,
        /// Confidence behind the action (defaults to the ticket's).
        #[arg(long)]
        confidence: Option<f64>,
        /// Part to reserve.
        #[arg(long, default_value = "MD-BRD-V2")]
        part_no: String,
        /// Inventory location the part comes from.
        #[arg(long, default_value = "DFW-DC")]
        location: String,
        #[arg(long, default_value = "1")]
        quantity: u32,
        /// Value of one unit, in cents.
        #[arg(long, default_value = "60000")]
        unit_value_cents: u64,
        /// Print the trace as JSON.
        #[arg(long)]
        json: bool,
    },
}

pub fn execute(cmd: &PolicyCommands, ctx: &Context) -> anyhow::Result<()> {
    let policy = &ctx.agentfile.policies;
    match cmd {
        PolicyCommands::Show { json } => {
            if *json {
                println!("{}", serde_json::to_string_pretty(policy)?);
            } else {
                print!("{}", serde_yaml::to_string(policy)?);
            }
        }

        PolicyCommands::Evaluate {
            ticket,
            action,
            confidence,
            part_no,
            location,
            quantity,
            unit_value_cents,
            json,
        } => {
            let ticket = super::read_ticket(ticket)?;
            let confidence = confidence.unwrap_or(ticket.confidence);
            let proposed = match action {
                ActionArg::CreateIssue => ProposedAction::create_issue(confidence),
                ActionArg::ReserveSpare => {
                    let recommendation = SpareRecommendation {
                        part_no: part_no.clone(),
                        name: part_no.clone(),
                        location: location.clone(),
                        quantity: *quantity,
                        unit_value_cents: *unit_value_cents,
                        eta: "-".to_string(),
                    };
                    ProposedAction::reserve_spare(&recommendation, confidence)
                }
            };

            let gate = PolicyGate::new(ctx.agentfile.agents.clone());
            let trace = gate.evaluate_with_trace(&proposed, &ticket, policy);
            if *json {
                println!("{}", serde_json::to_string_pretty(&trace)?);
                return Ok(());
            }

            println!(
                "Ticket {} ({}, site {}) under policy v{}",
                ticket.id, ticket.priority, ticket.site, policy.version
            );
            println!();
            println!("{:<18} OUTCOME", "CHECK");
            println!("{}", "-".repeat(60));
            for step in &trace.steps {
                println!("{:<18} {}", step.check, step.outcome);
            }
            println!();
            match &trace.decision {
                GateDecision::Allow => println!("Decision: ALLOW"),
                GateDecision::RequireApproval {
                    rule,
                    required_role,
                    reason,
                } => {
                    println!("Decision: REQUIRE_APPROVAL ({rule})");
                    println!("  Approver: {required_role} or above");
                    println!("  Reason:   {reason}");
                }
                GateDecision::Deny { reason } => {
                    println!("Decision: DENY");
                    println!("  Reason: {reason}");
                }
            }
        }
    }

    Ok(())
}
