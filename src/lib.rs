//! BerryCam Control Plane Library
//!
//! Field camera firmware service: command routing, cloud sync,
//! on-device detection.
//!
//! ## Architecture (10 Components)
//!
//! 1. SettingsVault - persistent device settings and credential record
//! 2. DeviceStateStore - canonical runtime state, copy-on-read
//! 3. SessionAuthority - password auth and session tokens
//! 4. InferenceGate - camera/engine access behind one guard
//! 5. CommandRouter - one vocabulary, every transport
//! 6. HarvestClient - cloud registration, status, commands, uploads
//! 7. RealtimeHub - socket client registry and fan-out
//! 8. WirelessPort - provisioning characteristic bridge
//! 9. NetworkSupervisor - wifi join ladder and AP fallback
//! 10. ControlLoop - the single periodic driver task
//!
//! ## Design Principles
//!
//! - One writer: all state transitions happen on the control loop
//! - One queue: every transport funnels into the same bounded channel
//! - Snapshots out: transports render copies, never live references

pub mod command_router;
pub mod control_loop;
pub mod device_state;
pub mod error;
pub mod harvest_client;
pub mod inference_gate;
pub mod models;
pub mod network_supervisor;
pub mod realtime_hub;
pub mod session_authority;
pub mod settings_vault;
pub mod state;
pub mod web_api;
pub mod wireless_port;

pub use error::{Error, Result};
pub use state::AppState;
