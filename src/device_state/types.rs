//! Canonical device state and the wire status snapshot

use serde::{Deserialize, Serialize};

/// One detection box, normalized to the frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    /// Confidence in [0,1]
    pub score: f32,
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

impl Detection {
    /// Clamp score and box coordinates into [0,1]
    pub fn clamped(mut self) -> Self {
        let clamp01 = |v: f32| v.clamp(0.0, 1.0);
        self.score = clamp01(self.score);
        self.x = clamp01(self.x);
        self.y = clamp01(self.y);
        self.w = clamp01(self.w);
        self.h = clamp01(self.h);
        self
    }
}

/// Network mode as seen by the transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    Ap,
    Sta,
    Disconnected,
}

/// Uplink details rendered into the snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub mode: NetworkMode,
    pub ssid: String,
    pub ip: String,
    pub rssi: i32,
}

impl Default for NetworkInfo {
    fn default() -> Self {
        Self {
            mode: NetworkMode::Disconnected,
            ssid: String::new(),
            ip: String::new(),
            rssi: 0,
        }
    }
}

/// A site from the built-in catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: String,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

/// On-device AI facet of the state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AiState {
    pub enabled: bool,
    pub model_ref: String,
    pub ready: bool,
    /// Millis since epoch of the last completed run
    pub last_run_ms: Option<i64>,
    /// Results of the most recent run only
    pub detections: Vec<Detection>,
}

/// The single canonical state record. One writer (the control loop via
/// command handlers); everything else reads snapshots.
#[derive(Debug, Clone, Default)]
pub struct DeviceState {
    pub streaming_enabled: bool,
    pub led_on: bool,
    pub camera_ready: bool,
    pub display_ready: bool,
    pub frames_sent: u64,
    pub frame_rate: f32,
    pub network: NetworkInfo,
    pub location: Option<Location>,
    pub ai: AiState,
}

/// Operating state derived from the streaming flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingState {
    Streaming,
    Idle,
}

/// Cloud facet rendered into the snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudFacet {
    pub enabled: bool,
    pub ready: bool,
    pub camera_uuid: Option<String>,
}

/// The status JSON broadcast to every transport and pushed to the cloud
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub version: String,
    pub streaming: bool,
    pub operating_state: OperatingState,
    pub camera_ready: bool,
    pub display_ready: bool,
    pub fps: f32,
    pub frames_sent: u64,
    /// Seconds since boot
    pub uptime: u64,
    /// Free memory gauge in bytes
    pub free_memory: u64,
    pub led: bool,
    pub network: NetworkInfo,
    pub cloud: CloudFacet,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub ai: AiStatusFacet,
}

/// AI facet of the snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiStatusFacet {
    pub enabled: bool,
    pub model: String,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_ms: Option<i64>,
    pub detections: Vec<Detection>,
}

impl StatusSnapshot {
    /// Assemble the wire snapshot from the canonical state plus the
    /// facets owned elsewhere (uptime, memory gauge, cloud readiness).
    pub fn assemble(state: &DeviceState, uptime: u64, free_memory: u64, cloud: CloudFacet) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            streaming: state.streaming_enabled,
            operating_state: if state.streaming_enabled {
                OperatingState::Streaming
            } else {
                OperatingState::Idle
            },
            camera_ready: state.camera_ready,
            display_ready: state.display_ready,
            fps: state.frame_rate,
            frames_sent: state.frames_sent,
            uptime,
            free_memory,
            led: state.led_on,
            network: state.network.clone(),
            cloud,
            location: state.location.clone(),
            ai: AiStatusFacet {
                enabled: state.ai.enabled,
                model: state.ai.model_ref.clone(),
                ready: state.ai.ready,
                last_run_ms: state.ai.last_run_ms,
                detections: state.ai.detections.clone(),
            },
        }
    }
}
