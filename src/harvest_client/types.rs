//! Wire types for the harvest cloud API

use crate::models::de_command_id;
use serde::{Deserialize, Serialize};

/// Registration request body
#[derive(Debug, Clone, Serialize)]
pub struct RegisterPayload {
    pub camera_id: String,
    pub camera_name: String,
    pub metadata: RegisterMetadata,
}

/// Optional registration metadata
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegisterMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_url: Option<String>,
}

/// One command pulled from the per-device queue
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteCommand {
    #[serde(default, deserialize_with = "de_command_id")]
    pub id: Option<String>,
    #[serde(rename = "type", alias = "command")]
    pub kind: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Photo notification body sent after an artifact upload
#[derive(Debug, Clone, Serialize)]
pub struct PhotoNotification {
    pub camera_id: String,
    pub photo_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    pub captured_at: String,
}
