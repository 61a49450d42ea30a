//! Persistence of the active network configuration
//!
//! The active configuration is a single JSON document under the data
//! directory. Writes go to a sibling temp file first and are renamed into
//! place, so a crash never leaves a half-written active configuration.

use crate::error::Result;
use crate::netconfig::NetworkConfiguration;
use std::path::{Path, PathBuf};

const ACTIVE_FILE: &str = "active.json";

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// Store rooted at a data directory
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(ACTIVE_FILE),
        }
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the active configuration, `None` if nothing was saved yet
    pub async fn load(&self) -> Result<Option<NetworkConfiguration>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Replace the active configuration atomically
    pub async fn save(&self, config: &NetworkConfiguration) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(config)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        tracing::debug!(path = %self.path.display(), interfaces = config.interfaces.len(), "Saved active configuration");
        Ok(())
    }
}
