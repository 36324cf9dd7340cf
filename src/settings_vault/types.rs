//! SettingsVault data types
//!
//! The persisted settings document and the partial patch applied by
//! the update-settings command.

use serde::{Deserialize, Serialize};

/// Default operator password seeded on first boot
pub const DEFAULT_PASSWORD: &str = "change-me";

/// Default on-device model reference
pub const DEFAULT_MODEL_REF: &str = "models/strawberry-yolo-int8";

/// Complete persisted settings document (one JSON file under the data dir)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Device identity sent to the cloud service
    pub device_id: String,
    /// Human-readable device name
    pub device_name: String,
    /// Last network successfully joined (tried first on boot)
    pub remembered_network: Option<WifiNetwork>,
    /// Candidate networks tried in order after the remembered one
    pub configured_networks: Vec<WifiNetwork>,
    /// Cloud sync settings
    pub cloud: CloudSettings,
    /// Cached remote registration; cleared when device_id changes
    pub camera_uuid: Option<String>,
    /// Operator credential record
    pub credential: CredentialRecord,
    /// Detection model reference loaded by ai_enable without an argument
    pub ai_model_ref: String,
    /// Confidence threshold for reported detections
    pub ai_threshold: f32,
    /// Periodic frame upload to the cloud
    pub frame_upload: FrameUploadSettings,
    /// Selected site from the locations catalog
    pub location_id: Option<String>,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        let device_id = format!("berrycam-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        Self {
            device_name: format!("BerryCam {}", device_id),
            device_id,
            remembered_network: None,
            configured_networks: Vec::new(),
            cloud: CloudSettings::default(),
            camera_uuid: None,
            credential: CredentialRecord::default(),
            ai_model_ref: DEFAULT_MODEL_REF.to_string(),
            ai_threshold: 0.5,
            frame_upload: FrameUploadSettings::default(),
            location_id: None,
        }
    }
}

/// One wireless network candidate
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WifiNetwork {
    pub ssid: String,
    pub psk: String,
}

/// Cloud endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudSettings {
    pub enabled: bool,
    /// REST base, e.g. https://harvest.example.com/functions/v1/cameras-api
    pub base_url: String,
    /// Object storage base, e.g. https://harvest.example.com/storage/v1/object
    pub storage_url: String,
    /// Storage bucket for photo artifacts
    pub bucket: String,
    pub api_key: String,
}

impl Default for CloudSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            storage_url: String::new(),
            bucket: "camera-photos".to_string(),
            api_key: String::new(),
        }
    }
}

/// Salted credential record; hash and salt are lowercase hex
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub password_hash: String,
    pub salt: String,
    pub setup_complete: bool,
}

/// Periodic frame upload knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameUploadSettings {
    pub enabled: bool,
    /// Seconds between uploads, clamped to >= 1.0
    pub interval_s: f64,
    /// Only "binary" is supported
    pub format: String,
}

impl Default for FrameUploadSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_s: 10.0,
            format: "binary".to_string(),
        }
    }
}

/// Partial settings update carried by the update_settings command
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsPatch {
    pub wifi_ssid: Option<String>,
    pub wifi_password: Option<String>,
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub cloud_api_key: Option<String>,
    pub cloud_base_url: Option<String>,
    pub auth_password: Option<PasswordChange>,
    pub location_id: Option<String>,
    pub frame_upload_enabled: Option<bool>,
    pub frame_upload_interval_s: Option<f64>,
    pub frame_upload_format: Option<String>,
}

/// Old/new password pair inside a settings patch
#[derive(Debug, Clone, Deserialize)]
pub struct PasswordChange {
    pub old: String,
    pub new: String,
}

/// What a successfully applied patch touched; drives deferred actions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedPatch {
    /// Wifi credentials changed; a deferred reconnect is due
    pub network_changed: bool,
    /// device_id changed; the cached registration was cleared
    pub identity_changed: bool,
}

/// Redacted view of the settings returned by GET /api/settings
#[derive(Debug, Clone, Serialize)]
pub struct SettingsView {
    pub device_id: String,
    pub device_name: String,
    pub wifi_ssid: Option<String>,
    pub configured_network_count: usize,
    pub cloud_enabled: bool,
    pub cloud_base_url: String,
    pub camera_uuid: Option<String>,
    pub ai_model_ref: String,
    pub ai_threshold: f32,
    pub frame_upload: FrameUploadSettings,
    pub location_id: Option<String>,
    pub setup_complete: bool,
}

impl From<&DeviceSettings> for SettingsView {
    fn from(s: &DeviceSettings) -> Self {
        Self {
            device_id: s.device_id.clone(),
            device_name: s.device_name.clone(),
            wifi_ssid: s.remembered_network.as_ref().map(|n| n.ssid.clone()),
            configured_network_count: s.configured_networks.len(),
            cloud_enabled: s.cloud.enabled,
            cloud_base_url: s.cloud.base_url.clone(),
            camera_uuid: s.camera_uuid.clone(),
            ai_model_ref: s.ai_model_ref.clone(),
            ai_threshold: s.ai_threshold,
            frame_upload: s.frame_upload.clone(),
            location_id: s.location_id.clone(),
            setup_complete: s.credential.setup_complete,
        }
    }
}
