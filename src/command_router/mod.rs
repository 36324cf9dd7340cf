//! CommandRouter - one dispatch point for every transport
//!
//! ## Responsibilities
//!
//! - Resolve decoded commands against the device services
//! - Fold every handler error into a failed CommandResult; the loop
//!   never sees a command panic or error bubble
//! - Hand deferred actions (wifi reconnect, reboot) back to the loop so
//!   they run after the result has left the device
//!
//! Socket, wireless, cloud and HTTP commands all pass through here, so
//! behavior differences between transports cannot creep in.

mod led;
mod types;

pub use led::StatusLed;
pub use types::{Command, CommandKind, CommandOrigin, DeferredAction, InboundCommand};

use crate::device_state::{locations, CloudFacet, DeviceStateStore, StatusSnapshot};
use crate::harvest_client::HarvestClient;
use crate::inference_gate::{FrameOutcome, InferenceGate, RunOutcome};
use crate::models::CommandResult;
use crate::session_authority::SessionAuthority;
use crate::settings_vault::{SettingsPatch, SettingsVault};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// CommandRouter - resolves commands into results
pub struct CommandRouter {
    store: Arc<DeviceStateStore>,
    vault: Arc<SettingsVault>,
    sessions: Arc<SessionAuthority>,
    gate: Arc<InferenceGate>,
    harvest: Arc<HarvestClient>,
    led: StatusLed,
    started_at: Instant,
    /// Free memory gauge, refreshed by the control loop
    free_memory: Arc<AtomicU64>,
}

impl CommandRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<DeviceStateStore>,
        vault: Arc<SettingsVault>,
        sessions: Arc<SessionAuthority>,
        gate: Arc<InferenceGate>,
        harvest: Arc<HarvestClient>,
        led: StatusLed,
        started_at: Instant,
        free_memory: Arc<AtomicU64>,
    ) -> Self {
        Self {
            store,
            vault,
            sessions,
            gate,
            harvest,
            led,
            started_at,
            free_memory,
        }
    }

    /// Execute one command. Never fails; failures are results.
    pub async fn execute(&self, command: &Command) -> (CommandResult, Option<DeferredAction>) {
        tracing::debug!(kind = command.kind.name(), id = ?command.id, "Dispatching command");

        match &command.kind {
            CommandKind::StartStream => (self.set_streaming(true).await, None),
            CommandKind::StopStream => (self.set_streaming(false).await, None),
            CommandKind::ToggleLed => (self.drive_led(None).await, None),
            CommandKind::LedOn => (self.drive_led(Some(true)).await, None),
            CommandKind::LedOff => (self.drive_led(Some(false)).await, None),
            CommandKind::GetStatus => (self.report_status().await, None),
            CommandKind::AiEnable => (self.ai_enable(&command.params).await, None),
            CommandKind::AiDisable => (self.ai_disable().await, None),
            CommandKind::AiRun => (self.ai_run().await, None),
            CommandKind::TakePhoto => (self.take_photo(command.id.as_deref()).await, None),
            CommandKind::ChangeLocation => (self.change_location(&command.params).await, None),
            CommandKind::UpdateSettings => self.update_settings(&command.params).await,
            CommandKind::Reboot => {
                tracing::warn!("Reboot scheduled");
                (
                    CommandResult::completed(json!({ "rebooting": true })),
                    Some(DeferredAction::Reboot),
                )
            }
            CommandKind::Unknown(raw) => (
                CommandResult::failed(format!("unknown_command: {}", raw)),
                None,
            ),
        }
    }

    /// Full status snapshot, also served by GET /api/status
    pub async fn status_snapshot(&self) -> StatusSnapshot {
        let state = self.store.read().await;
        let settings = self.vault.snapshot().await;
        let cloud = CloudFacet {
            enabled: settings.cloud.enabled,
            ready: self.harvest.ready().await,
            camera_uuid: settings.camera_uuid,
        };

        StatusSnapshot::assemble(
            &state,
            self.started_at.elapsed().as_secs(),
            self.free_memory.load(Ordering::Relaxed),
            cloud,
        )
    }

    async fn set_streaming(&self, enabled: bool) -> CommandResult {
        let before = self.store.read().await.streaming_enabled;
        self.store.mutate(|s| s.streaming_enabled = enabled).await;
        if before != enabled {
            tracing::info!(streaming = enabled, "Streaming toggled");
        }
        CommandResult::completed(json!({ "streaming": enabled }))
    }

    async fn drive_led(&self, target: Option<bool>) -> CommandResult {
        let current = self.store.read().await.led_on;
        let on = target.unwrap_or(!current);

        if let Err(e) = self.led.set(on).await {
            tracing::error!(error = %e, "LED write failed");
            return CommandResult::failed(format!("led_write_failed: {}", e));
        }

        self.store.mutate(|s| s.led_on = on).await;
        CommandResult::completed(json!({ "led": on }))
    }

    async fn report_status(&self) -> CommandResult {
        match serde_json::to_value(self.status_snapshot().await) {
            Ok(status) => CommandResult::completed(status),
            Err(e) => CommandResult::failed(format!("status_unavailable: {}", e)),
        }
    }

    async fn ai_enable(&self, params: &serde_json::Value) -> CommandResult {
        let model = params
            .get("model")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        match self.gate.enable(model).await {
            Ok(ai) => CommandResult::completed(json!({ "ai": ai })),
            Err(e) => CommandResult::failed(e.to_string()),
        }
    }

    async fn ai_disable(&self) -> CommandResult {
        let ai = self.gate.disable().await;
        CommandResult::completed(json!({ "ai": ai }))
    }

    async fn ai_run(&self) -> CommandResult {
        match self.gate.run().await {
            Ok(RunOutcome::Detections(detections)) => CommandResult::completed(json!({
                "count": detections.len(),
                "detections": detections,
            })),
            Ok(RunOutcome::Busy) => CommandResult::failed("camera_busy"),
            Err(e) => CommandResult::failed(e.to_string()),
        }
    }

    async fn take_photo(&self, command_id: Option<&str>) -> CommandResult {
        let bytes = match self.gate.capture_photo().await {
            Ok(FrameOutcome::Frame(bytes)) => bytes,
            Ok(FrameOutcome::Busy) => return CommandResult::failed("camera_busy"),
            Err(e) => return CommandResult::failed(format!("capture_failed: {}", e)),
        };

        let url = match self.harvest.upload_artifact(bytes).await {
            Ok(url) => url,
            Err(e) => return CommandResult::failed(format!("upload_failed: {}", e)),
        };

        // The photo exists either way; a missed notification only delays
        // it showing up in the feed.
        if let Err(e) = self.harvest.notify_photo(&url, command_id).await {
            tracing::warn!(error = %e, "Photo uploaded but notification failed");
        }

        CommandResult::completed(json!({ "photo_url": url }))
    }

    async fn change_location(&self, params: &serde_json::Value) -> CommandResult {
        let id = match params.get("location_id").and_then(|v| v.as_str()) {
            Some(id) => id,
            None => return CommandResult::failed("location_id is required"),
        };

        let location = match locations::find(id) {
            Some(location) => location,
            None => return CommandResult::failed(format!("unknown_location: {}", id)),
        };

        let patch = SettingsPatch {
            location_id: Some(id.to_string()),
            ..Default::default()
        };
        if let Err(e) = self.vault.apply_patch(&patch).await {
            return CommandResult::failed(e.to_string());
        }

        let state = self
            .store
            .mutate(|s| s.location = Some(location.clone()))
            .await;
        tracing::info!(location = %id, "Location changed");
        CommandResult::completed(json!({ "location": state.location }))
    }

    async fn update_settings(
        &self,
        params: &serde_json::Value,
    ) -> (CommandResult, Option<DeferredAction>) {
        let patch: SettingsPatch = match serde_json::from_value(params.clone()) {
            Ok(patch) => patch,
            Err(e) => {
                return (
                    CommandResult::failed(format!("invalid_settings: {}", e)),
                    None,
                )
            }
        };

        // Validate everything with side effects up front so a rejected
        // patch leaves no partial state behind. The password change below
        // commits, so every other field must already have passed.
        let location = match patch.location_id.as_deref() {
            Some(id) => match locations::find(id) {
                Some(location) => Some(location),
                None => {
                    return (
                        CommandResult::failed(format!("unknown_location: {}", id)),
                        None,
                    )
                }
            },
            None => None,
        };
        if let Err(e) = self.vault.check_patch(&patch).await {
            return (CommandResult::failed(e.to_string()), None);
        }

        if let Some(ref change) = patch.auth_password {
            if change.new.len() < 6 {
                return (
                    CommandResult::failed("auth_password: new password too short"),
                    None,
                );
            }
            match self.sessions.change_password(&change.old, &change.new).await {
                Ok(true) => {}
                Ok(false) => {
                    return (
                        CommandResult::failed("auth_password: old password mismatch"),
                        None,
                    )
                }
                Err(e) => {
                    return (
                        CommandResult::failed(format!("auth_password: {}", e)),
                        None,
                    )
                }
            }
        }

        let applied = match self.vault.apply_patch(&patch).await {
            Ok(applied) => applied,
            Err(e) => return (CommandResult::failed(e.to_string()), None),
        };

        if applied.identity_changed {
            self.harvest.set_ready(false).await;
        }
        if let Some(location) = location {
            self.store
                .mutate(|s| s.location = Some(location.clone()))
                .await;
        }

        let view = self.vault.view().await;
        let deferred = applied.network_changed.then_some(DeferredAction::ReconnectWifi);
        (
            CommandResult::completed(json!({ "settings": view })),
            deferred,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use crate::inference_gate::{DetectionEngine, FrameSource, RawDetection};
    use crate::models::CommandStatus;
    use crate::settings_vault::{SettingsRepository, DEFAULT_MODEL_REF, DEFAULT_PASSWORD};

    struct StubCamera;

    #[async_trait::async_trait]
    impl FrameSource for StubCamera {
        async fn capture_jpeg(&self) -> Result<Vec<u8>> {
            Ok(vec![0xFF, 0xD8, 0xFF, 0xD9])
        }

        async fn probe(&self) -> bool {
            true
        }
    }

    struct StubEngine;

    #[async_trait::async_trait]
    impl DetectionEngine for StubEngine {
        async fn load(&self, model_ref: &str) -> Result<()> {
            if model_ref == DEFAULT_MODEL_REF {
                Ok(())
            } else {
                Err(Error::Inference("no such model".to_string()))
            }
        }

        async fn unload(&self) -> Result<()> {
            Ok(())
        }

        async fn detect(&self, _jpeg: Vec<u8>) -> Result<Vec<RawDetection>> {
            Ok(vec![RawDetection {
                label: "strawberry".to_string(),
                score: 0.9,
                x: 0.1,
                y: 0.2,
                w: 0.3,
                h: 0.4,
            }])
        }

        async fn health(&self) -> bool {
            true
        }
    }

    async fn router() -> (tempfile::TempDir, CommandRouter) {
        let dir = tempfile::tempdir().unwrap();
        let repo = SettingsRepository::new(dir.path().to_path_buf());
        let vault = Arc::new(SettingsVault::new(repo).await.unwrap());
        let store = Arc::new(DeviceStateStore::default());
        let sessions = Arc::new(SessionAuthority::new(vault.clone()).await.unwrap());
        let gate = Arc::new(InferenceGate::with_waits(
            Arc::new(StubCamera),
            Arc::new(StubEngine),
            store.clone(),
            vault.clone(),
            100,
            1,
        ));
        let harvest = Arc::new(HarvestClient::new(vault.clone()));

        let router = CommandRouter::new(
            store,
            vault,
            sessions,
            gate,
            harvest,
            StatusLed::new(None),
            Instant::now(),
            Arc::new(AtomicU64::new(0)),
        );
        (dir, router)
    }

    fn cmd(kind: CommandKind, params: serde_json::Value) -> Command {
        Command::new(kind, params)
    }

    #[tokio::test]
    async fn test_stream_commands_flip_state() {
        let (_dir, router) = router().await;

        let (result, deferred) = router
            .execute(&cmd(CommandKind::StartStream, serde_json::Value::Null))
            .await;
        assert_eq!(result.status, CommandStatus::Completed);
        assert!(deferred.is_none());
        assert_eq!(router.store.read().await.streaming_enabled, true);

        router
            .execute(&cmd(CommandKind::StopStream, serde_json::Value::Null))
            .await;
        assert_eq!(router.store.read().await.streaming_enabled, false);
    }

    #[tokio::test]
    async fn test_unknown_command_names_the_type() {
        let (_dir, router) = router().await;

        let (result, _) = router
            .execute(&cmd(
                CommandKind::Unknown("blink".to_string()),
                serde_json::Value::Null,
            ))
            .await;
        assert!(result.is_failed());
        assert_eq!(
            result.payload.get("error").and_then(|v| v.as_str()),
            Some("unknown_command: blink")
        );
    }

    #[tokio::test]
    async fn test_led_toggle_tracks_flag() {
        let (_dir, router) = router().await;

        router
            .execute(&cmd(CommandKind::LedOn, serde_json::Value::Null))
            .await;
        assert!(router.store.read().await.led_on);

        router
            .execute(&cmd(CommandKind::ToggleLed, serde_json::Value::Null))
            .await;
        assert!(!router.store.read().await.led_on);
    }

    #[tokio::test]
    async fn test_get_status_carries_version() {
        let (_dir, router) = router().await;

        let (result, _) = router
            .execute(&cmd(CommandKind::GetStatus, serde_json::Value::Null))
            .await;
        assert_eq!(result.status, CommandStatus::Completed);
        assert_eq!(
            result.payload.get("version").and_then(|v| v.as_str()),
            Some(env!("CARGO_PKG_VERSION"))
        );
    }

    #[tokio::test]
    async fn test_ai_run_without_enable_fails() {
        let (_dir, router) = router().await;

        let (result, _) = router
            .execute(&cmd(CommandKind::AiRun, serde_json::Value::Null))
            .await;
        assert!(result.is_failed());
    }

    #[tokio::test]
    async fn test_ai_enable_then_run_reports_detections() {
        let (_dir, router) = router().await;

        let (result, _) = router
            .execute(&cmd(CommandKind::AiEnable, serde_json::Value::Null))
            .await;
        assert_eq!(result.status, CommandStatus::Completed);

        let (result, _) = router
            .execute(&cmd(CommandKind::AiRun, serde_json::Value::Null))
            .await;
        assert_eq!(result.status, CommandStatus::Completed);
        assert_eq!(result.payload.get("count").and_then(|v| v.as_u64()), Some(1));
    }

    #[tokio::test]
    async fn test_change_location_rejects_unknown_site() {
        let (_dir, router) = router().await;

        let (result, _) = router
            .execute(&cmd(
                CommandKind::ChangeLocation,
                json!({"location_id": "atlantis"}),
            ))
            .await;
        assert!(result.is_failed());

        let (result, _) = router
            .execute(&cmd(
                CommandKind::ChangeLocation,
                json!({"location_id": "grunewald"}),
            ))
            .await;
        assert_eq!(result.status, CommandStatus::Completed);
        let state = router.store.read().await;
        assert_eq!(state.location.as_ref().map(|l| l.id.as_str()), Some("grunewald"));
    }

    #[tokio::test]
    async fn test_update_settings_wifi_defers_reconnect() {
        let (_dir, router) = router().await;

        let (result, deferred) = router
            .execute(&cmd(
                CommandKind::UpdateSettings,
                json!({"wifi_ssid": "field-net", "wifi_password": "pw-123456"}),
            ))
            .await;
        assert_eq!(result.status, CommandStatus::Completed);
        assert_eq!(deferred, Some(DeferredAction::ReconnectWifi));
    }

    #[tokio::test]
    async fn test_update_settings_rejects_short_password() {
        let (_dir, router) = router().await;

        let (result, _) = router
            .execute(&cmd(
                CommandKind::UpdateSettings,
                json!({"auth_password": {"old": DEFAULT_PASSWORD, "new": "tiny"}}),
            ))
            .await;
        assert!(result.is_failed());

        let (result, _) = router
            .execute(&cmd(
                CommandKind::UpdateSettings,
                json!({"auth_password": {"old": "not-it", "new": "long-enough"}}),
            ))
            .await;
        assert!(result.is_failed());

        let (result, _) = router
            .execute(&cmd(
                CommandKind::UpdateSettings,
                json!({"auth_password": {"old": DEFAULT_PASSWORD, "new": "long-enough"}}),
            ))
            .await;
        assert_eq!(result.status, CommandStatus::Completed);
    }

    #[tokio::test]
    async fn test_rejected_patch_commits_nothing() {
        let (_dir, router) = router().await;
        let token = router.sessions.login(DEFAULT_PASSWORD).await.unwrap();

        // A valid password change bundled with an invalid field must not
        // commit the password change.
        let (result, deferred) = router
            .execute(&cmd(
                CommandKind::UpdateSettings,
                json!({
                    "auth_password": {"old": DEFAULT_PASSWORD, "new": "grape-123"},
                    "wifi_ssid": ""
                }),
            ))
            .await;

        assert!(result.is_failed());
        assert!(deferred.is_none());
        assert!(router.sessions.verify(&token).await);
        assert!(router.sessions.login(DEFAULT_PASSWORD).await.is_some());
        assert!(router.vault.snapshot().await.remembered_network.is_none());
    }

    #[tokio::test]
    async fn test_reboot_defers_after_ack() {
        let (_dir, router) = router().await;

        let (result, deferred) = router
            .execute(&cmd(CommandKind::Reboot, serde_json::Value::Null))
            .await;
        assert_eq!(result.status, CommandStatus::Completed);
        assert_eq!(deferred, Some(DeferredAction::Reboot));
    }

    #[tokio::test]
    async fn test_take_photo_without_cloud_fails() {
        let (_dir, router) = router().await;

        let (result, _) = router
            .execute(&cmd(CommandKind::TakePhoto, serde_json::Value::Null))
            .await;
        assert!(result.is_failed());
        let error = result.payload.get("error").and_then(|v| v.as_str()).unwrap_or("");
        assert!(error.starts_with("upload_failed"));
    }
}
