//! # mesh-cli
//!
//! Command-line interface for Agent Mesh operators.
//!
//! - `mesh run` — drive a ticket through a run against the simulated agents
//! - `mesh pack verify/replay/verify-signature` — check a sealed evidence pack
//! - `mesh policy show/evaluate` — inspect governance and dry-run the gate
//! - `mesh keygen` — create the local Ed25519 signing key

mod commands;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use mesh_run::{Agentfile, MeshPaths};
use tracing_subscriber::EnvFilter;

/// File names looked up in the project root when `--agentfile` is not given.
const AGENTFILE_NAMES: [&str; 2] = ["Agentfile.yaml", "Agentfile.yml"];

/// Agent Mesh CLI — simulate runs, verify evidence, inspect policy.
#[derive(Parser)]
#[command(name = "mesh", version, about)]
struct Cli {
    /// Project root directory (defaults to current directory).
    #[arg(long, default_value = ".")]
    project_root: PathBuf,

    /// Agentfile to load (defaults to Agentfile.yaml in the project root).
    #[arg(long)]
    agentfile: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr.
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive a ticket through a run with the simulated agents.
    Run(commands::run::RunArgs),
    /// Verify and replay evidence packs.
    Pack {
        #[command(subcommand)]
        command: commands::pack::PackCommands,
    },
    /// Show the governance policy or dry-run the gate.
    Policy {
        #[command(subcommand)]
        command: commands::policy::PolicyCommands,
    },
    /// Generate the local Ed25519 signing key.
    Keygen {
        /// Where to write the key (defaults to .mesh/signer.pk8).
        #[arg(long)]
        out: Option<PathBuf>,
        /// Overwrite an existing key.
        #[arg(long)]
        force: bool,
    },
}

/// Everything a command needs to know about the project.
pub struct Context {
    pub project_root: PathBuf,
    pub agentfile: Agentfile,
    pub paths: MeshPaths,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs)?;

    let project_root = cli.project_root.canonicalize().unwrap_or(cli.project_root);
    let agentfile = load_agentfile(&project_root, cli.agentfile.as_deref())?;
    let ctx = Context {
        paths: MeshPaths::for_project(&project_root),
        project_root,
        agentfile,
    };

    match &cli.command {
        Commands::Run(args) => commands::run::execute(args, &ctx).await,
        Commands::Pack { command } => commands::pack::execute(command),
        Commands::Policy { command } => commands::policy::execute(command, &ctx),
        Commands::Keygen { out, force } => commands::keygen::execute(out.as_deref(), *force, &ctx),
    }
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_logging(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("mesh_run=info".parse()?)
        .add_directive("mesh_cli=info".parse()?);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn load_agentfile(project_root: &Path, explicit: Option<&Path>) -> anyhow::Result<Agentfile> {
    if let Some(path) = explicit {
        tracing::info!(path = %path.display(), "loading Agentfile");
        return Ok(Agentfile::load(path)?);
    }
    for name in AGENTFILE_NAMES {
        let path = project_root.join(name);
        if path.exists() {
            tracing::info!(path = %path.display(), "loading Agentfile");
            return Ok(Agentfile::load(&path)?);
        }
    }
    tracing::debug!("no Agentfile found; using defaults");
    Ok(Agentfile::default())
}
