//! Shared models and types for BerryCam
//!
//! This module contains types shared across multiple modules
//! to avoid circular dependencies.

use serde::{Deserialize, Serialize};

/// Standard API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_sec: u64,
    pub camera_ready: bool,
    pub engine_connected: bool,
    pub cloud_ready: bool,
}

/// Terminal status of one executed command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Completed,
    Failed,
}

/// What a command resolved to. Serialized into transport replies and
/// cloud acks alike; the wire key for the payload is `result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub status: CommandStatus,
    #[serde(
        rename = "result",
        default,
        skip_serializing_if = "serde_json::Value::is_null"
    )]
    pub payload: serde_json::Value,
}

impl CommandResult {
    pub fn completed(payload: serde_json::Value) -> Self {
        Self {
            status: CommandStatus::Completed,
            payload,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: CommandStatus::Failed,
            payload: serde_json::json!({ "error": reason.into() }),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == CommandStatus::Failed
    }
}

/// Command ids arrive as strings or numbers depending on the sender;
/// normalize both to a string.
pub fn de_command_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}
