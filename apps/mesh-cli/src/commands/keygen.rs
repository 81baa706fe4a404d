// keygen.rs — Local signing key: generate it, and load it for runs.
//
// The key file holds the PKCS#8 document as base64 text.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use mesh_audit::LocalKeySigner;

use crate::Context;

pub fn execute(out: Option<&Path>, force: bool, ctx: &Context) -> anyhow::Result<()> {
    let path = out
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_key_path(ctx));
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to replace it)",
            path.display()
        );
    }

    let signer = LocalKeySigner::generate(ctx.agentfile.signer.id.clone())?;
    write_key(&path, &signer)?;
    tracing::info!(path = %path.display(), "signing key written");

    println!("Signing key written to {}", path.display());
    println!("Signer id:  {}", ctx.agentfile.signer.id);
    println!("Public key: {}", signer.public_key_base64());
    Ok(())
}

/// The configured signer, or a throwaway key when none is configured.
pub fn load_signer(ctx: &Context) -> anyhow::Result<Arc<LocalKeySigner>> {
    let id = ctx.agentfile.signer.id.clone();
    let configured = ctx
        .agentfile
        .signer
        .key_path
        .as_ref()
        .map(|p| ctx.project_root.join(p));
    let path = configured.or_else(|| Some(default_key_path(ctx)).filter(|p| p.exists()));

    let signer = match path {
        Some(path) => read_key(&path, id)?,
        None => {
            tracing::warn!("no signing key configured; packs are signed with an ephemeral key");
            LocalKeySigner::generate(id)?
        }
    };
    Ok(Arc::new(signer))
}

fn default_key_path(ctx: &Context) -> PathBuf {
    ctx.paths.root.join("signer.pk8")
}

fn write_key(path: &Path, signer: &LocalKeySigner) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, STANDARD.encode(signer.pkcs8()))
        .with_context(|| format!("cannot write {}", path.display()))
}

fn read_key(path: &Path, id: String) -> anyhow::Result<LocalKeySigner> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read signing key {}", path.display()))?;
    let pkcs8 = STANDARD
        .decode(text.trim())
        .with_context(|| format!("{} is not base64", path.display()))?;
    Ok(LocalKeySigner::from_pkcs8(id, &pkcs8)?)
}
