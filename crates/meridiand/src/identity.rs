//! Node identity — a random 160-bit id persisted as hex.

use std::path::Path;

use anyhow::{Context, Result};

use meridian_core::{Id, NodeId};

/// Read the node id at `path`, generating and saving one on first run.
pub fn load_or_create(path: &Path) -> Result<NodeId> {
    if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read node id from {}", path.display()))?;
        return text
            .trim()
            .parse()
            .with_context(|| format!("invalid node id in {}", path.display()));
    }

    let id = Id::random();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, format!("{id}\n"))
        .with_context(|| format!("failed to write node id to {}", path.display()))?;
    tracing::info!(node = %id, path = %path.display(), "generated node id");
    Ok(id)
}
