//! Node keypair persisted as a hex-encoded private key.

use std::path::Path;

use anyhow::{Context, Result};

use strand_core::crypto::Keypair;

/// Load the keypair at `path`, generating and saving one if missing.
pub fn load_or_generate(path: &Path) -> Result<Keypair> {
    if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read keypair {}", path.display()))?;
        let bytes = hex::decode(text.trim()).context("keypair file is not hex")?;
        let private: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| anyhow::anyhow!("keypair must be 32 bytes, got {}", v.len()))?;
        return Ok(Keypair::from_private(private));
    }

    let keypair = Keypair::generate();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, hex::encode(*keypair.private_bytes()))
        .with_context(|| format!("failed to write keypair {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("failed to restrict {}", path.display()))?;
    }
    tracing::info!(path = %path.display(), "generated new keypair");
    Ok(keypair)
}
