pub mod keygen;
pub mod pack;
pub mod policy;
pub mod run;

use std::path::Path;

use anyhow::Context as _;
use mesh_policy::Ticket;

/// Read a ticket from a JSON file.
pub fn read_ticket(path: &Path) -> anyhow::Result<Ticket> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read ticket {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("invalid ticket JSON in {}", path.display()))
}
