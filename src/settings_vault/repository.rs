//! SettingsVault persistence
//!
//! One JSON document on flash. Written through a temp file so a power cut
//! mid-write cannot truncate the live settings.

use super::types::DeviceSettings;
use crate::error::Result;
use std::path::PathBuf;
use tokio::fs;

/// File-backed settings repository
pub struct SettingsRepository {
    path: PathBuf,
}

impl SettingsRepository {
    /// Create repository rooted at the data dir; the file is `settings.json`
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            path: data_dir.join("settings.json"),
        }
    }

    /// Load the persisted document, or None on first boot
    pub async fn load(&self) -> Result<Option<DeviceSettings>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let raw = fs::read(&self.path).await?;
        let settings = serde_json::from_slice(&raw)?;
        Ok(Some(settings))
    }

    /// Persist the document
    pub async fn save(&self, settings: &DeviceSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(settings)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &json).await?;
        fs::rename(&tmp, &self.path).await?;

        tracing::debug!(path = %self.path.display(), size = json.len(), "Settings persisted");
        Ok(())
    }
}
