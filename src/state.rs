//! Application state
//!
//! Holds all shared components and state

use crate::command_router::{CommandRouter, InboundCommand};
use crate::device_state::DeviceStateStore;
use crate::harvest_client::HarvestClient;
use crate::inference_gate::InferenceGate;
use crate::network_supervisor::NetworkSupervisor;
use crate::realtime_hub::RealtimeHub;
use crate::session_authority::SessionAuthority;
use crate::settings_vault::SettingsVault;
use crate::wireless_port::WirelessPort;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Persistent settings directory
    pub data_dir: PathBuf,
    /// Bundled web UI directory
    pub static_dir: PathBuf,
    /// Camera device node
    pub video_device: String,
    /// Detection engine URL
    pub engine_url: String,
    /// Wifi interface managed by the supervisor
    pub wifi_interface: String,
    /// Fallback access point SSID
    pub ap_ssid: String,
    /// Fallback access point channel
    pub ap_channel: u8,
    /// Status LED sysfs node, if wired
    pub led_path: Option<PathBuf>,
    /// Status panel framebuffer node
    pub display_device: PathBuf,
    /// Wireless bridge socket path
    pub wireless_socket: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            data_dir: std::env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/var/lib/berrycam")),
            static_dir: std::env::var("STATIC_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/usr/share/berrycam/www")),
            video_device: std::env::var("VIDEO_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            engine_url: std::env::var("ENGINE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:9000".to_string()),
            wifi_interface: std::env::var("WIFI_INTERFACE")
                .unwrap_or_else(|_| "wlan0".to_string()),
            ap_ssid: std::env::var("AP_SSID").unwrap_or_else(|_| "BerryCam-Setup".to_string()),
            ap_channel: std::env::var("AP_CHANNEL")
                .ok()
                .and_then(|c| c.parse().ok())
                .unwrap_or(6),
            led_path: std::env::var("LED_PATH").map(PathBuf::from).ok(),
            display_device: std::env::var("DISPLAY_DEVICE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/dev/fb0")),
            wireless_socket: std::env::var("WIRELESS_SOCKET")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/run/berrycam/wireless.sock")),
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Application config
    pub config: AppConfig,
    /// Canonical device state
    pub store: Arc<DeviceStateStore>,
    /// Persistent settings
    pub vault: Arc<SettingsVault>,
    /// Session tokens and the device credential
    pub sessions: Arc<SessionAuthority>,
    /// Camera and detection engine access
    pub gate: Arc<InferenceGate>,
    /// Cloud sync client
    pub harvest: Arc<HarvestClient>,
    /// Socket client registry
    pub hub: Arc<RealtimeHub>,
    /// Wifi uplink supervisor
    pub supervisor: Arc<NetworkSupervisor>,
    /// Command execution
    pub router: Arc<CommandRouter>,
    /// Wireless provisioning port
    pub wireless: Arc<WirelessPort>,
    /// Queue into the control loop
    pub command_tx: mpsc::Sender<InboundCommand>,
}
