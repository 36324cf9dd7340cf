//! NetworkSupervisor - uplink state machine
//!
//! ## Responsibilities
//!
//! - Boot connectivity: remembered network first, then each configured
//!   candidate, persisting the first success as the new remembered one
//! - Access-point fallback once every candidate is exhausted; the AP is
//!   terminal until a credentials patch asks for a reconnect
//! - Periodic link check with rejoin, reporting reconnects so the loop
//!   can refresh the cloud registration
//!
//! Wireless control itself sits behind the WifiControl trait; the
//! production implementation shells out to nmcli.

use crate::device_state::{DeviceStateStore, NetworkInfo, NetworkMode};
use crate::error::{Error, Result};
use crate::settings_vault::{SettingsVault, WifiNetwork};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::RwLock;

/// Join window for the remembered network (seconds)
const REMEMBERED_JOIN_SECS: u64 = 12;

/// Join window per configured candidate (seconds)
const CANDIDATE_JOIN_SECS: u64 = 10;

/// Where the supervisor currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Disconnected,
    TryingRemembered,
    TryingConfigured,
    Connected,
    /// Provisioning AP is up; maintenance skips until a reconnect request
    AccessPoint,
}

/// What a maintenance pass found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintainOutcome {
    /// AP mode, nothing checked
    AccessPoint,
    /// Link still up
    Connected,
    /// Link was down and a rejoin succeeded
    Reconnected,
    /// Link was down and every candidate failed; AP is up now
    FellBack,
}

/// Link facts as the wireless layer reports them
#[derive(Debug, Clone, Default)]
pub struct LinkStatus {
    pub connected: bool,
    pub ssid: Option<String>,
    pub ip: Option<String>,
    pub rssi: Option<i32>,
}

/// Wireless control seam
#[async_trait::async_trait]
pub trait WifiControl: Send + Sync {
    /// Join an infrastructure network. Ok(false) is a clean join failure;
    /// Err means the wireless layer itself misbehaved.
    async fn join(&self, ssid: &str, psk: &str, window: Duration) -> Result<bool>;

    /// Bring up the provisioning access point
    async fn start_access_point(&self, ssid: &str, channel: u8) -> Result<()>;

    /// Current link status
    async fn status(&self) -> Result<LinkStatus>;
}

/// NetworkSupervisor instance
pub struct NetworkSupervisor {
    wifi: Arc<dyn WifiControl>,
    vault: Arc<SettingsVault>,
    store: Arc<DeviceStateStore>,
    ap_ssid: String,
    ap_channel: u8,
    state: RwLock<SupervisorState>,
}

impl NetworkSupervisor {
    pub fn new(
        wifi: Arc<dyn WifiControl>,
        vault: Arc<SettingsVault>,
        store: Arc<DeviceStateStore>,
        ap_ssid: String,
        ap_channel: u8,
    ) -> Self {
        Self {
            wifi,
            vault,
            store,
            ap_ssid,
            ap_channel,
            state: RwLock::new(SupervisorState::Disconnected),
        }
    }

    pub async fn state(&self) -> SupervisorState {
        *self.state.read().await
    }

    /// Walk the candidates until something joins. Returns true when an
    /// infrastructure network is up, false once the AP fallback is.
    pub async fn ensure_connectivity(&self) -> Result<bool> {
        let settings = self.vault.snapshot().await;

        if let Some(ref remembered) = settings.remembered_network {
            self.set_state(SupervisorState::TryingRemembered).await;
            if self
                .try_join(remembered, Duration::from_secs(REMEMBERED_JOIN_SECS))
                .await
            {
                self.mark_connected().await;
                return Ok(true);
            }
        }

        self.set_state(SupervisorState::TryingConfigured).await;
        for candidate in &settings.configured_networks {
            if self
                .try_join(candidate, Duration::from_secs(CANDIDATE_JOIN_SECS))
                .await
            {
                // This candidate becomes the remembered network for the
                // next boot.
                self.vault.set_remembered_network(candidate.clone()).await?;
                self.mark_connected().await;
                return Ok(true);
            }
        }

        self.enter_access_point().await?;
        Ok(false)
    }

    /// Periodic link check. Early-returns in AP mode.
    pub async fn maintain(&self) -> Result<MaintainOutcome> {
        if self.state().await == SupervisorState::AccessPoint {
            return Ok(MaintainOutcome::AccessPoint);
        }

        let status = match self.wifi.status().await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(error = %e, "Link status check failed");
                LinkStatus::default()
            }
        };

        if status.connected {
            self.store_link(&status).await;
            self.set_state(SupervisorState::Connected).await;
            return Ok(MaintainOutcome::Connected);
        }

        tracing::warn!("Uplink lost, rejoining");
        self.set_state(SupervisorState::Disconnected).await;
        self.store
            .mutate(|s| s.network = NetworkInfo::default())
            .await;

        if self.ensure_connectivity().await? {
            Ok(MaintainOutcome::Reconnected)
        } else {
            Ok(MaintainOutcome::FellBack)
        }
    }

    /// Reconnect with fresh credentials; the only way out of AP mode
    pub async fn reconnect(&self) -> Result<bool> {
        self.set_state(SupervisorState::Disconnected).await;
        self.ensure_connectivity().await
    }

    async fn try_join(&self, network: &WifiNetwork, window: Duration) -> bool {
        tracing::info!(ssid = %network.ssid, window_s = window.as_secs(), "Joining network");
        match self.wifi.join(&network.ssid, &network.psk, window).await {
            Ok(true) => true,
            Ok(false) => {
                tracing::warn!(ssid = %network.ssid, "Join failed");
                false
            }
            Err(e) => {
                tracing::error!(ssid = %network.ssid, error = %e, "Wireless layer error");
                false
            }
        }
    }

    async fn mark_connected(&self) {
        self.set_state(SupervisorState::Connected).await;
        match self.wifi.status().await {
            Ok(status) => self.store_link(&status).await,
            Err(e) => tracing::warn!(error = %e, "Connected but status read failed"),
        }
    }

    async fn enter_access_point(&self) -> Result<()> {
        tracing::warn!(ssid = %self.ap_ssid, channel = self.ap_channel, "All candidates failed, starting access point");
        self.wifi
            .start_access_point(&self.ap_ssid, self.ap_channel)
            .await?;
        self.set_state(SupervisorState::AccessPoint).await;

        let ip = match self.wifi.status().await {
            Ok(status) => status.ip.unwrap_or_default(),
            Err(_) => String::new(),
        };
        let ssid = self.ap_ssid.clone();
        self.store
            .mutate(|s| {
                s.network = NetworkInfo {
                    mode: NetworkMode::Ap,
                    ssid,
                    ip,
                    rssi: 0,
                }
            })
            .await;
        Ok(())
    }

    async fn store_link(&self, status: &LinkStatus) {
        let info = NetworkInfo {
            mode: NetworkMode::Sta,
            ssid: status.ssid.clone().unwrap_or_default(),
            ip: status.ip.clone().unwrap_or_default(),
            rssi: status.rssi.unwrap_or(0),
        };
        self.store.mutate(|s| s.network = info).await;
    }

    async fn set_state(&self, state: SupervisorState) {
        *self.state.write().await = state;
    }
}

/// nmcli-backed wireless control
pub struct NmcliWifi {
    interface: String,
}

impl NmcliWifi {
    pub fn new(interface: String) -> Self {
        Self { interface }
    }

    async fn nmcli(args: &[&str]) -> Result<std::process::Output> {
        Command::new("nmcli")
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Network(format!("nmcli failed to start: {}", e)))
    }
}

#[async_trait::async_trait]
impl WifiControl for NmcliWifi {
    async fn join(&self, ssid: &str, psk: &str, window: Duration) -> Result<bool> {
        let wait = window.as_secs().max(1).to_string();
        let output = Self::nmcli(&[
            "--wait", &wait,
            "device", "wifi", "connect", ssid,
            "password", psk,
            "ifname", &self.interface,
        ])
        .await?;

        Ok(output.status.success())
    }

    async fn start_access_point(&self, ssid: &str, channel: u8) -> Result<()> {
        let channel = channel.to_string();
        let output = Self::nmcli(&[
            "device", "wifi", "hotspot",
            "ifname", &self.interface,
            "ssid", ssid,
            "band", "bg",
            "channel", &channel,
        ])
        .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Network(format!(
                "hotspot start failed: {}",
                stderr.trim()
            )));
        }
        Ok(())
    }

    async fn status(&self) -> Result<LinkStatus> {
        let show = Self::nmcli(&[
            "-t", "-f", "GENERAL.STATE,GENERAL.CONNECTION,IP4.ADDRESS",
            "device", "show", &self.interface,
        ])
        .await?;
        let show_text = String::from_utf8_lossy(&show.stdout).to_string();

        let list = Self::nmcli(&["-t", "-f", "IN-USE,SIGNAL", "device", "wifi", "list", "ifname", &self.interface]).await?;
        let list_text = String::from_utf8_lossy(&list.stdout).to_string();

        Ok(parse_link_status(&show_text, &list_text))
    }
}

/// Assemble a LinkStatus from `nmcli device show` and `device wifi list`
/// terse outputs.
fn parse_link_status(show: &str, wifi_list: &str) -> LinkStatus {
    let mut connected = false;
    let mut ssid = None;
    let mut ip = None;

    for line in show.lines() {
        if let Some(value) = line.strip_prefix("GENERAL.STATE:") {
            // "100 (connected)"
            connected = value.contains("(connected)");
        } else if let Some(value) = line.strip_prefix("GENERAL.CONNECTION:") {
            if !value.is_empty() && value != "--" {
                ssid = Some(value.to_string());
            }
        } else if line.starts_with("IP4.ADDRESS") {
            if let Some(value) = line.split(':').nth(1) {
                ip = value.split('/').next().map(|s| s.to_string());
            }
        }
    }

    // nmcli reports signal as a percentage; fold it back to rough dBm
    let rssi = wifi_list
        .lines()
        .find(|l| l.starts_with('*'))
        .and_then(|l| l.split(':').nth(1))
        .and_then(|s| s.parse::<i32>().ok())
        .map(|percent| percent / 2 - 100);

    LinkStatus {
        connected,
        ssid,
        ip,
        rssi,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings_vault::SettingsRepository;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    struct ScriptedWifi {
        accept: Vec<String>,
        attempts: AsyncMutex<Vec<String>>,
        ap_starts: AtomicU32,
        link_up: AtomicBool,
        current_ssid: AsyncMutex<Option<String>>,
    }

    impl ScriptedWifi {
        fn accepting(ssids: &[&str]) -> Self {
            Self {
                accept: ssids.iter().map(|s| s.to_string()).collect(),
                attempts: AsyncMutex::new(Vec::new()),
                ap_starts: AtomicU32::new(0),
                link_up: AtomicBool::new(false),
                current_ssid: AsyncMutex::new(None),
            }
        }
    }

    #[async_trait::async_trait]
    impl WifiControl for ScriptedWifi {
        async fn join(&self, ssid: &str, _psk: &str, _window: Duration) -> Result<bool> {
            self.attempts.lock().await.push(ssid.to_string());
            let ok = self.accept.iter().any(|s| s == ssid);
            if ok {
                self.link_up.store(true, Ordering::SeqCst);
                *self.current_ssid.lock().await = Some(ssid.to_string());
            }
            Ok(ok)
        }

        async fn start_access_point(&self, _ssid: &str, _channel: u8) -> Result<()> {
            self.ap_starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn status(&self) -> Result<LinkStatus> {
            Ok(LinkStatus {
                connected: self.link_up.load(Ordering::SeqCst),
                ssid: self.current_ssid.lock().await.clone(),
                ip: Some("192.168.7.20".to_string()),
                rssi: Some(-52),
            })
        }
    }

    async fn supervisor_with(
        wifi: Arc<ScriptedWifi>,
        remembered: Option<&str>,
        configured: &[&str],
    ) -> (tempfile::TempDir, NetworkSupervisor, Arc<DeviceStateStore>) {
        let dir = tempfile::tempdir().unwrap();
        let repo = SettingsRepository::new(dir.path().to_path_buf());
        let vault = Arc::new(SettingsVault::new(repo).await.unwrap());

        if let Some(ssid) = remembered {
            vault
                .set_remembered_network(WifiNetwork {
                    ssid: ssid.to_string(),
                    psk: "pw".to_string(),
                })
                .await
                .unwrap();
        }
        for ssid in configured {
            vault
                .add_configured_network(WifiNetwork {
                    ssid: ssid.to_string(),
                    psk: "pw".to_string(),
                })
                .await
                .unwrap();
        }

        let store = Arc::new(DeviceStateStore::default());
        let supervisor = NetworkSupervisor::new(
            wifi,
            vault,
            store.clone(),
            "BerryCam-Setup".to_string(),
            6,
        );
        (dir, supervisor, store)
    }

    #[tokio::test]
    async fn test_remembered_then_configured_order() {
        let wifi = Arc::new(ScriptedWifi::accepting(&["barn-net"]));
        let (_dir, supervisor, store) =
            supervisor_with(wifi.clone(), Some("old-net"), &["shed-net", "barn-net"]).await;

        assert!(supervisor.ensure_connectivity().await.unwrap());
        assert_eq!(
            *wifi.attempts.lock().await,
            vec!["old-net", "shed-net", "barn-net"]
        );
        assert_eq!(supervisor.state().await, SupervisorState::Connected);
        assert_eq!(store.read().await.network.mode, NetworkMode::Sta);
    }

    #[tokio::test]
    async fn test_first_success_becomes_remembered() {
        let wifi = Arc::new(ScriptedWifi::accepting(&["shed-net"]));
        let (_dir, supervisor, _store) =
            supervisor_with(wifi.clone(), None, &["shed-net", "barn-net"]).await;

        assert!(supervisor.ensure_connectivity().await.unwrap());
        let remembered = supervisor.vault.snapshot().await.remembered_network;
        assert_eq!(remembered.map(|n| n.ssid), Some("shed-net".to_string()));
    }

    #[tokio::test]
    async fn test_fallback_is_terminal_for_maintenance() {
        let wifi = Arc::new(ScriptedWifi::accepting(&[]));
        let (_dir, supervisor, store) =
            supervisor_with(wifi.clone(), Some("old-net"), &["shed-net"]).await;

        assert!(!supervisor.ensure_connectivity().await.unwrap());
        assert_eq!(wifi.ap_starts.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.state().await, SupervisorState::AccessPoint);
        assert_eq!(store.read().await.network.mode, NetworkMode::Ap);

        let attempts_before = wifi.attempts.lock().await.len();
        assert_eq!(
            supervisor.maintain().await.unwrap(),
            MaintainOutcome::AccessPoint
        );
        // No further joins and no second AP start
        assert_eq!(wifi.attempts.lock().await.len(), attempts_before);
        assert_eq!(wifi.ap_starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reconnect_leaves_ap_mode() {
        let wifi = Arc::new(ScriptedWifi::accepting(&["new-net"]));
        let (_dir, supervisor, _store) = supervisor_with(wifi.clone(), None, &[]).await;

        assert!(!supervisor.ensure_connectivity().await.unwrap());
        assert_eq!(supervisor.state().await, SupervisorState::AccessPoint);

        supervisor
            .vault
            .set_remembered_network(WifiNetwork {
                ssid: "new-net".to_string(),
                psk: "fresh".to_string(),
            })
            .await
            .unwrap();

        assert!(supervisor.reconnect().await.unwrap());
        assert_eq!(supervisor.state().await, SupervisorState::Connected);
    }

    #[tokio::test]
    async fn test_maintain_reports_reconnect() {
        let wifi = Arc::new(ScriptedWifi::accepting(&["barn-net"]));
        let (_dir, supervisor, _store) =
            supervisor_with(wifi.clone(), Some("barn-net"), &[]).await;

        assert!(supervisor.ensure_connectivity().await.unwrap());
        assert_eq!(
            supervisor.maintain().await.unwrap(),
            MaintainOutcome::Connected
        );

        // Drop the link behind the supervisor's back
        wifi.link_up.store(false, Ordering::SeqCst);
        assert_eq!(
            supervisor.maintain().await.unwrap(),
            MaintainOutcome::Reconnected
        );
    }

    #[test]
    fn test_parse_link_status() {
        let show = "GENERAL.STATE:100 (connected)\nGENERAL.CONNECTION:barn-net\nIP4.ADDRESS[1]:192.168.7.20/24\n";
        let list = "*:84\n:61\n";
        let status = parse_link_status(show, list);

        assert!(status.connected);
        assert_eq!(status.ssid.as_deref(), Some("barn-net"));
        assert_eq!(status.ip.as_deref(), Some("192.168.7.20"));
        assert_eq!(status.rssi, Some(-58));

        let show = "GENERAL.STATE:30 (disconnected)\nGENERAL.CONNECTION:--\n";
        let status = parse_link_status(show, "");
        assert!(!status.connected);
        assert!(status.ssid.is_none());
        assert!(status.rssi.is_none());
    }
}
