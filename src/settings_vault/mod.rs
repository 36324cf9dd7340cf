//! SettingsVault - Single Source of Truth for device settings
//!
//! ## Responsibilities
//!
//! - Device identity, wifi candidates, cloud endpoint, AI knobs
//! - Credential record persistence for SessionAuthority
//! - Cached remote registration (camera_uuid)
//! - Partial updates from the update_settings command
//!
//! All reads come from an in-memory copy; every mutation writes through
//! to one JSON document on flash.

mod repository;
mod service;
mod types;

pub use repository::SettingsRepository;
pub use service::SettingsVault;
pub use types::*;
