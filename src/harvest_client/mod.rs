//! HarvestClient - cloud sync over the harvest REST API
//!
//! ## Responsibilities
//!
//! - One-time registration, UUID cached in the settings vault
//! - Status push (POST with a PATCH retry on non-2xx)
//! - Remote command poll and per-command acknowledgement
//! - Photo artifact upload to object storage plus notification
//! - Periodic raw frame upload
//!
//! Every request carries the `apikey` header and the same key as a
//! bearer token. JSON calls use the 15s client, raw uploads the 20s one.

mod types;

pub use types::{PhotoNotification, RegisterMetadata, RegisterPayload, RemoteCommand};

use crate::error::{Error, Result};
use crate::models::CommandResult;
use crate::settings_vault::{CloudSettings, SettingsVault};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Timeout for JSON API calls (seconds)
const JSON_TIMEOUT_SECS: u64 = 15;

/// Timeout for raw binary uploads (seconds)
const RAW_TIMEOUT_SECS: u64 = 20;

/// HarvestClient - REST client plus registration state
pub struct HarvestClient {
    json_http: reqwest::Client,
    raw_http: reqwest::Client,
    vault: Arc<SettingsVault>,
    /// Registered and usable for status/poll/frame calls
    ready: RwLock<bool>,
}

impl HarvestClient {
    pub fn new(vault: Arc<SettingsVault>) -> Self {
        // Redirects are refused; a 301 would replay a POST as a GET.
        let json_http = reqwest::Client::builder()
            .timeout(Duration::from_secs(JSON_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("Failed to build HTTP client");

        let raw_http = reqwest::Client::builder()
            .timeout(Duration::from_secs(RAW_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("Failed to build HTTP client");

        Self {
            json_http,
            raw_http,
            vault,
            ready: RwLock::new(false),
        }
    }

    /// Registered against the cloud and holding a UUID
    pub async fn ready(&self) -> bool {
        *self.ready.read().await
    }

    /// Mark the registration stale (identity change, persistent failure)
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Register once and cache the UUID. A cached UUID short-circuits.
    pub async fn ensure_registered(
        &self,
        ip_address: Option<&str>,
        stream_url: Option<&str>,
    ) -> Result<String> {
        let settings = self.vault.snapshot().await;
        let cloud = configured(&settings.cloud)?;

        if let Some(uuid) = settings.camera_uuid.clone() {
            self.set_ready(true).await;
            return Ok(uuid);
        }

        let payload = RegisterPayload {
            camera_id: settings.device_id.clone(),
            camera_name: settings.device_name.clone(),
            metadata: RegisterMetadata {
                ip_address: ip_address.map(|s| s.to_string()),
                stream_url: stream_url.map(|s| s.to_string()),
            },
        };

        let url = format!("{}/cameras", cloud.base_url);
        let resp = self
            .authed(self.json_http.post(&url), &cloud.api_key)
            .json(&payload)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Error::Cloud(format!(
                "registration failed: {}",
                resp.status()
            )));
        }

        let body: serde_json::Value = resp.json().await?;
        let uuid = extract_uuid(&body).ok_or_else(|| {
            Error::Cloud("registration response carried no camera UUID".to_string())
        })?;

        self.vault.set_camera_uuid(Some(uuid.clone())).await?;
        self.set_ready(true).await;
        tracing::info!(camera_uuid = %uuid, "Registered with harvest");
        Ok(uuid)
    }

    /// Push the status snapshot. The API gained PATCH late; POST stays
    /// the first verb and PATCH the retry for deployments either side.
    pub async fn push_status(&self, snapshot: &serde_json::Value) -> Result<()> {
        let settings = self.vault.snapshot().await;
        let cloud = configured(&settings.cloud)?;
        let uuid = registered(&settings.camera_uuid)?;

        let url = format!("{}/cameras/{}", cloud.base_url, uuid);
        let posted = self
            .authed(self.json_http.post(&url), &cloud.api_key)
            .json(snapshot)
            .send()
            .await?;

        if posted.status().is_success() {
            return Ok(());
        }

        let post_status = posted.status();
        let patched = self
            .authed(self.json_http.patch(&url), &cloud.api_key)
            .json(snapshot)
            .send()
            .await?;

        if patched.status().is_success() {
            tracing::debug!(post_status = %post_status, "Status push fell back to PATCH");
            return Ok(());
        }

        Err(Error::Cloud(format!(
            "status push failed: POST {} / PATCH {}",
            post_status,
            patched.status()
        )))
    }

    /// Pull pending remote commands. A body without a `commands` key is
    /// an empty queue, not an error.
    pub async fn poll_commands(&self) -> Result<Vec<RemoteCommand>> {
        let settings = self.vault.snapshot().await;
        let cloud = configured(&settings.cloud)?;
        let uuid = registered(&settings.camera_uuid)?;

        let url = format!("{}/cameras/{}/commands", cloud.base_url, uuid);
        let resp = self
            .authed(self.json_http.get(&url), &cloud.api_key)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Error::Cloud(format!(
                "command poll failed: {}",
                resp.status()
            )));
        }

        let body: serde_json::Value = resp.json().await?;
        let items = match body.get("commands").and_then(|c| c.as_array()) {
            Some(items) => items.clone(),
            None => return Ok(Vec::new()),
        };

        let mut commands = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value::<RemoteCommand>(item) {
                Ok(cmd) => commands.push(cmd),
                Err(e) => tracing::warn!(error = %e, "Skipping malformed remote command"),
            }
        }

        Ok(commands)
    }

    /// Acknowledge one processed remote command
    pub async fn acknowledge(&self, command_id: &str, result: &CommandResult) -> Result<()> {
        let settings = self.vault.snapshot().await;
        let cloud = configured(&settings.cloud)?;

        let url = format!("{}/commands/{}/ack", cloud.base_url, command_id);
        let resp = self
            .authed(self.json_http.post(&url), &cloud.api_key)
            .json(result)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Error::Cloud(format!(
                "command ack failed: {}",
                resp.status()
            )));
        }

        Ok(())
    }

    /// Upload one JPEG artifact to object storage, returning its public URL
    pub async fn upload_artifact(&self, bytes: Vec<u8>) -> Result<String> {
        let settings = self.vault.snapshot().await;
        let cloud = configured(&settings.cloud)?;
        if cloud.storage_url.is_empty() {
            return Err(Error::Cloud("object storage is not configured".to_string()));
        }

        let object_url = format!(
            "{}/{}/{}/{}.jpg",
            cloud.storage_url,
            cloud.bucket,
            settings.device_id,
            chrono::Utc::now().timestamp_millis()
        );

        let resp = self
            .authed(self.raw_http.post(&object_url), &cloud.api_key)
            .header(CONTENT_TYPE, "image/jpeg")
            .body(bytes)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Error::Cloud(format!(
                "artifact upload failed: {}",
                resp.status()
            )));
        }

        Ok(public_artifact_url(&object_url))
    }

    /// Notify the photos endpoint about an uploaded artifact
    pub async fn notify_photo(&self, photo_url: &str, command_id: Option<&str>) -> Result<()> {
        let settings = self.vault.snapshot().await;
        let cloud = configured(&settings.cloud)?;

        let notification = PhotoNotification {
            camera_id: settings.device_id.clone(),
            photo_url: photo_url.to_string(),
            command_id: command_id.map(|s| s.to_string()),
            captured_at: chrono::Utc::now().to_rfc3339(),
        };

        let url = format!("{}/photos", cloud.base_url);
        let resp = self
            .authed(self.json_http.post(&url), &cloud.api_key)
            .json(&notification)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Error::Cloud(format!(
                "photo notification failed: {}",
                resp.status()
            )));
        }

        Ok(())
    }

    /// Upload one raw frame to the per-device frame endpoint
    pub async fn upload_frame(&self, bytes: Vec<u8>) -> Result<()> {
        let settings = self.vault.snapshot().await;
        let cloud = configured(&settings.cloud)?;
        let uuid = registered(&settings.camera_uuid)?;

        let url = format!("{}/cameras/{}/frame", cloud.base_url, uuid);
        let resp = self
            .authed(self.raw_http.post(&url), &cloud.api_key)
            .header(CONTENT_TYPE, "image/jpeg")
            .body(bytes)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Error::Cloud(format!(
                "frame upload failed: {}",
                resp.status()
            )));
        }

        Ok(())
    }

    fn authed(&self, req: reqwest::RequestBuilder, api_key: &str) -> reqwest::RequestBuilder {
        req.header("apikey", api_key)
            .header(AUTHORIZATION, format!("Bearer {}", api_key))
    }
}

fn configured(cloud: &CloudSettings) -> Result<&CloudSettings> {
    if !cloud.enabled || cloud.base_url.is_empty() || cloud.api_key.is_empty() {
        return Err(Error::Cloud("cloud sync is not configured".to_string()));
    }
    Ok(cloud)
}

fn registered(camera_uuid: &Option<String>) -> Result<&str> {
    camera_uuid
        .as_deref()
        .ok_or_else(|| Error::Cloud("camera is not registered".to_string()))
}

/// UUID from a registration response: `camera.id`, then `uuid`, then `id`
fn extract_uuid(body: &serde_json::Value) -> Option<String> {
    body.get("camera")
        .and_then(|c| c.get("id"))
        .and_then(|v| v.as_str())
        .or_else(|| body.get("uuid").and_then(|v| v.as_str()))
        .or_else(|| body.get("id").and_then(|v| v.as_str()))
        .map(|s| s.to_string())
}

/// Public variant of a storage object URL
fn public_artifact_url(object_url: &str) -> String {
    object_url.replacen("/storage/v1/object", "/storage/v1/object/public", 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_uuid_precedence() {
        let body = json!({"camera": {"id": "aaa"}, "uuid": "bbb", "id": "ccc"});
        assert_eq!(extract_uuid(&body).as_deref(), Some("aaa"));

        let body = json!({"uuid": "bbb", "id": "ccc"});
        assert_eq!(extract_uuid(&body).as_deref(), Some("bbb"));

        let body = json!({"id": "ccc"});
        assert_eq!(extract_uuid(&body).as_deref(), Some("ccc"));

        let body = json!({"ok": true});
        assert!(extract_uuid(&body).is_none());
    }

    #[test]
    fn test_public_artifact_url() {
        let url = "https://h.example.com/storage/v1/object/camera-photos/dev-1/17000.jpg";
        assert_eq!(
            public_artifact_url(url),
            "https://h.example.com/storage/v1/object/public/camera-photos/dev-1/17000.jpg"
        );
    }
}
