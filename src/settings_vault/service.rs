//! SettingsVault service
//!
//! Typed access and patch validation over the persisted document. All
//! mutations write through to flash before returning.

use super::repository::SettingsRepository;
use super::types::*;
use crate::error::{Error, Result};
use tokio::sync::RwLock;

/// Single source of truth for mutable device settings
pub struct SettingsVault {
    repo: SettingsRepository,
    current: RwLock<DeviceSettings>,
}

impl SettingsVault {
    /// Load the persisted document, seeding defaults on first boot
    pub async fn new(repo: SettingsRepository) -> Result<Self> {
        let current = match repo.load().await? {
            Some(settings) => {
                tracing::info!(device_id = %settings.device_id, "Settings loaded");
                settings
            }
            None => {
                let settings = DeviceSettings::default();
                repo.save(&settings).await?;
                tracing::info!(device_id = %settings.device_id, "Settings seeded (first boot)");
                settings
            }
        };

        Ok(Self {
            repo,
            current: RwLock::new(current),
        })
    }

    /// Current settings snapshot
    pub async fn snapshot(&self) -> DeviceSettings {
        self.current.read().await.clone()
    }

    /// Redacted view for the settings API
    pub async fn view(&self) -> SettingsView {
        SettingsView::from(&*self.current.read().await)
    }

    /// Validate a patch without applying it. Callers that commit other
    /// side effects alongside a patch run this first.
    pub async fn check_patch(&self, patch: &SettingsPatch) -> Result<()> {
        validate(patch, &*self.current.read().await)
    }

    /// Apply a partial update. All fields are validated before anything
    /// mutates, so a rejected patch changes nothing. Password changes
    /// are handled by SessionAuthority and ignored here.
    pub async fn apply_patch(&self, patch: &SettingsPatch) -> Result<AppliedPatch> {
        let mut applied = AppliedPatch::default();
        let mut settings = self.current.write().await;
        validate(patch, &settings)?;

        if let Some(ref ssid) = patch.wifi_ssid {
            settings.remembered_network = Some(WifiNetwork {
                ssid: ssid.clone(),
                psk: patch.wifi_password.clone().unwrap_or_default(),
            });
            applied.network_changed = true;
        } else if let Some(ref psk) = patch.wifi_password {
            if let Some(ref mut network) = settings.remembered_network {
                network.psk = psk.clone();
                applied.network_changed = true;
            }
        }

        if let Some(ref device_id) = patch.device_id {
            if *device_id != settings.device_id {
                settings.device_id = device_id.clone();
                settings.camera_uuid = None;
                applied.identity_changed = true;
            }
        }

        if let Some(ref name) = patch.device_name {
            settings.device_name = name.clone();
        }

        if let Some(ref key) = patch.cloud_api_key {
            settings.cloud.api_key = key.clone();
        }
        if let Some(ref url) = patch.cloud_base_url {
            settings.cloud.base_url = url.clone();
        }
        if patch.cloud_api_key.is_some() || patch.cloud_base_url.is_some() {
            settings.cloud.enabled =
                !settings.cloud.base_url.is_empty() && !settings.cloud.api_key.is_empty();
        }

        if let Some(ref location_id) = patch.location_id {
            settings.location_id = Some(location_id.clone());
        }

        if let Some(enabled) = patch.frame_upload_enabled {
            settings.frame_upload.enabled = enabled;
        }
        if let Some(interval) = patch.frame_upload_interval_s {
            settings.frame_upload.interval_s = interval.max(1.0);
        }
        if let Some(ref format) = patch.frame_upload_format {
            settings.frame_upload.format = format.clone();
        }

        self.repo.save(&settings).await?;

        tracing::info!(
            network_changed = applied.network_changed,
            identity_changed = applied.identity_changed,
            "Settings patch applied"
        );

        Ok(applied)
    }

    /// Cache or clear the remote registration
    pub async fn set_camera_uuid(&self, uuid: Option<String>) -> Result<()> {
        let mut settings = self.current.write().await;
        settings.camera_uuid = uuid;
        self.repo.save(&settings).await
    }

    /// Persist the first successfully joined network as remembered
    pub async fn set_remembered_network(&self, network: WifiNetwork) -> Result<()> {
        let mut settings = self.current.write().await;
        if settings.remembered_network.as_ref() == Some(&network) {
            return Ok(());
        }
        settings.remembered_network = Some(network);
        self.repo.save(&settings).await
    }

    /// Append a network to the candidate list; a known ssid has its
    /// psk replaced instead
    pub async fn add_configured_network(&self, network: WifiNetwork) -> Result<()> {
        let mut settings = self.current.write().await;
        match settings
            .configured_networks
            .iter_mut()
            .find(|n| n.ssid == network.ssid)
        {
            Some(existing) => existing.psk = network.psk,
            None => settings.configured_networks.push(network),
        }
        self.repo.save(&settings).await
    }

    /// Current credential record
    pub async fn credential(&self) -> CredentialRecord {
        self.current.read().await.credential.clone()
    }

    /// Replace the credential record (login setup / password change)
    pub async fn store_credential(&self, credential: CredentialRecord) -> Result<()> {
        let mut settings = self.current.write().await;
        settings.credential = credential;
        self.repo.save(&settings).await
    }
}

/// Field validation shared by check_patch and apply_patch
fn validate(patch: &SettingsPatch, settings: &DeviceSettings) -> Result<()> {
    if let Some(ref format) = patch.frame_upload_format {
        if format != "binary" {
            return Err(Error::Validation(format!(
                "unsupported frame format: {}",
                format
            )));
        }
    }

    if let Some(ref ssid) = patch.wifi_ssid {
        if ssid.is_empty() {
            return Err(Error::Validation("wifi_ssid must not be empty".to_string()));
        }
    } else if patch.wifi_password.is_some() && settings.remembered_network.is_none() {
        return Err(Error::Validation(
            "wifi_password given without a network to apply it to".to_string(),
        ));
    }

    if let Some(ref device_id) = patch.device_id {
        if device_id.is_empty() || device_id.len() > 64 {
            return Err(Error::Validation(
                "device_id must be 1-64 characters".to_string(),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn vault() -> (tempfile::TempDir, SettingsVault) {
        let dir = tempfile::tempdir().unwrap();
        let repo = SettingsRepository::new(dir.path().to_path_buf());
        let vault = SettingsVault::new(repo).await.unwrap();
        (dir, vault)
    }

    #[tokio::test]
    async fn test_identity_change_clears_registration() {
        let (_dir, vault) = vault().await;
        vault.set_camera_uuid(Some("abc-123".to_string())).await.unwrap();

        let patch = SettingsPatch {
            device_id: Some("field-7".to_string()),
            ..Default::default()
        };
        let applied = vault.apply_patch(&patch).await.unwrap();

        assert!(applied.identity_changed);
        let settings = vault.snapshot().await;
        assert_eq!(settings.device_id, "field-7");
        assert!(settings.camera_uuid.is_none());
    }

    #[tokio::test]
    async fn test_same_identity_is_not_a_change() {
        let (_dir, vault) = vault().await;
        let device_id = vault.snapshot().await.device_id;
        vault.set_camera_uuid(Some("abc-123".to_string())).await.unwrap();

        let patch = SettingsPatch {
            device_id: Some(device_id),
            ..Default::default()
        };
        let applied = vault.apply_patch(&patch).await.unwrap();

        assert!(!applied.identity_changed);
        assert!(vault.snapshot().await.camera_uuid.is_some());
    }

    #[tokio::test]
    async fn test_wifi_patch_flags_network_change() {
        let (_dir, vault) = vault().await;
        let patch = SettingsPatch {
            wifi_ssid: Some("greenhouse".to_string()),
            wifi_password: Some("hunter22".to_string()),
            ..Default::default()
        };
        let applied = vault.apply_patch(&patch).await.unwrap();

        assert!(applied.network_changed);
        let remembered = vault.snapshot().await.remembered_network.unwrap();
        assert_eq!(remembered.ssid, "greenhouse");
        assert_eq!(remembered.psk, "hunter22");
    }

    #[tokio::test]
    async fn test_add_configured_network_replaces_known_ssid() {
        let (_dir, vault) = vault().await;

        vault
            .add_configured_network(WifiNetwork {
                ssid: "shed".to_string(),
                psk: "old".to_string(),
            })
            .await
            .unwrap();
        vault
            .add_configured_network(WifiNetwork {
                ssid: "shed".to_string(),
                psk: "new".to_string(),
            })
            .await
            .unwrap();

        let networks = vault.snapshot().await.configured_networks;
        assert_eq!(networks.len(), 1);
        assert_eq!(networks[0].psk, "new");
    }

    #[tokio::test]
    async fn test_rejected_patch_mutates_nothing() {
        let (_dir, vault) = vault().await;

        // Valid wifi fields bundled with an invalid device_id
        let patch = SettingsPatch {
            wifi_ssid: Some("greenhouse".to_string()),
            wifi_password: Some("hunter22".to_string()),
            device_id: Some(String::new()),
            ..Default::default()
        };
        assert!(vault.apply_patch(&patch).await.is_err());

        let settings = vault.snapshot().await;
        assert!(settings.remembered_network.is_none());
    }

    #[tokio::test]
    async fn test_check_patch_reports_without_side_effects() {
        let (_dir, vault) = vault().await;

        let orphan_psk = SettingsPatch {
            wifi_password: Some("pw-123456".to_string()),
            ..Default::default()
        };
        assert!(vault.check_patch(&orphan_psk).await.is_err());

        let ok = SettingsPatch {
            wifi_ssid: Some("greenhouse".to_string()),
            ..Default::default()
        };
        vault.check_patch(&ok).await.unwrap();
        assert!(vault.snapshot().await.remembered_network.is_none());
    }

    #[tokio::test]
    async fn test_frame_interval_clamped_and_format_validated() {
        let (_dir, vault) = vault().await;

        let patch = SettingsPatch {
            frame_upload_interval_s: Some(0.05),
            ..Default::default()
        };
        vault.apply_patch(&patch).await.unwrap();
        assert_eq!(vault.snapshot().await.frame_upload.interval_s, 1.0);

        let bad = SettingsPatch {
            frame_upload_format: Some("base64".to_string()),
            ..Default::default()
        };
        assert!(vault.apply_patch(&bad).await.is_err());
    }
}
