//! Host identity: the node name and machine id stamped into every event's
//! target map.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};

use crate::config::WardenConfig;

/// The identity of the machine this daemon runs on, resolved once at
/// startup.
#[derive(Debug, Clone)]
pub struct HostInfo {
    pub node_name: String,
    pub machine_id: String,
}

impl HostInfo {
    /// Resolve the host identity from configuration, falling back to the
    /// system hostname when no node name is configured.
    pub fn resolve(config: &WardenConfig) -> Result<Self> {
        let node_name = match &config.node_name {
            Some(name) => name.clone(),
            None => nix::unistd::gethostname()
                .context("failed to read hostname")?
                .to_string_lossy()
                .into_owned(),
        };

        let machine_id = read_machine_id(&config.machine_id_path)?;

        Ok(Self {
            node_name,
            machine_id,
        })
    }

    /// The target map attached to every emitted event.
    pub fn target(&self) -> HashMap<String, String> {
        let mut target = HashMap::new();
        target.insert("host".to_string(), self.node_name.clone());
        target.insert("machine-id".to_string(), self.machine_id.clone());
        target
    }
}

fn read_machine_id(path: &Path) -> Result<String> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read machine id from {}", path.display()))?;
    let id = raw.trim();
    if id.is_empty() {
        anyhow::bail!("machine id file {} is empty", path.display());
    }
    Ok(id.to_string())
}
