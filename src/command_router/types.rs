//! Command vocabulary and the decoded command record

use crate::models::{de_command_id, CommandResult};
use serde::Deserialize;
use uuid::Uuid;

/// Every command the device understands, after alias folding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    StartStream,
    StopStream,
    ToggleLed,
    LedOn,
    LedOff,
    GetStatus,
    AiEnable,
    AiDisable,
    AiRun,
    TakePhoto,
    ChangeLocation,
    UpdateSettings,
    Reboot,
    /// Anything else; carries the type as received
    Unknown(String),
}

impl CommandKind {
    /// Fold a wire command type onto the vocabulary, case-insensitively
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "start_stream" | "start_video" => CommandKind::StartStream,
            "stop_stream" | "stop_video" => CommandKind::StopStream,
            "toggle_led" => CommandKind::ToggleLed,
            "led_on" => CommandKind::LedOn,
            "led_off" => CommandKind::LedOff,
            "get_status" => CommandKind::GetStatus,
            "ai_enable" => CommandKind::AiEnable,
            "ai_disable" => CommandKind::AiDisable,
            "ai_run" | "ai_snapshot" => CommandKind::AiRun,
            "take_photo" | "capture_photo" => CommandKind::TakePhoto,
            "change_location" => CommandKind::ChangeLocation,
            "update_settings" => CommandKind::UpdateSettings,
            "reboot" => CommandKind::Reboot,
            _ => CommandKind::Unknown(raw.to_string()),
        }
    }

    /// Canonical name used in transport replies
    pub fn name(&self) -> &str {
        match self {
            CommandKind::StartStream => "start_stream",
            CommandKind::StopStream => "stop_stream",
            CommandKind::ToggleLed => "toggle_led",
            CommandKind::LedOn => "led_on",
            CommandKind::LedOff => "led_off",
            CommandKind::GetStatus => "get_status",
            CommandKind::AiEnable => "ai_enable",
            CommandKind::AiDisable => "ai_disable",
            CommandKind::AiRun => "ai_run",
            CommandKind::TakePhoto => "take_photo",
            CommandKind::ChangeLocation => "change_location",
            CommandKind::UpdateSettings => "update_settings",
            CommandKind::Reboot => "reboot",
            CommandKind::Unknown(raw) => raw,
        }
    }
}

/// Wire envelope shared by every transport
#[derive(Debug, Clone, Deserialize)]
struct CommandEnvelope {
    #[serde(default, deserialize_with = "de_command_id")]
    id: Option<String>,
    #[serde(rename = "type", alias = "command")]
    kind: String,
    #[serde(default)]
    params: serde_json::Value,
}

/// A decoded command, ready for dispatch
#[derive(Debug, Clone)]
pub struct Command {
    /// Sender-supplied id, echoed in replies and acks
    pub id: Option<String>,
    pub kind: CommandKind,
    pub params: serde_json::Value,
}

impl Command {
    pub fn new(kind: CommandKind, params: serde_json::Value) -> Self {
        Self {
            id: None,
            kind,
            params,
        }
    }

    /// Decode a raw transport payload. JSON envelopes are the norm; the
    /// first firmware generation sent bare strings for the stream
    /// commands, which still have to work.
    pub fn decode(raw: &str) -> Self {
        match serde_json::from_str::<CommandEnvelope>(raw) {
            Ok(env) => Self {
                id: env.id,
                kind: CommandKind::parse(&env.kind),
                params: env.params,
            },
            Err(_) => {
                let bare = raw.trim();
                let kind = match CommandKind::parse(bare) {
                    k @ (CommandKind::StartStream | CommandKind::StopStream) => k,
                    _ => CommandKind::Unknown(bare.to_string()),
                };
                Self {
                    id: None,
                    kind,
                    params: serde_json::Value::Null,
                }
            }
        }
    }
}

/// Which transport a queued command entered through; the loop routes
/// the result back the same way. Polled cloud commands never enter the
/// queue: the loop executes and acks them inline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOrigin {
    /// A connected socket client
    Socket(Uuid),
    /// The wireless provisioning port
    Wireless,
    /// A direct HTTP call awaiting the outcome
    Local,
}

/// One queue entry consumed by the control loop
#[derive(Debug)]
pub struct InboundCommand {
    pub command: Command,
    pub origin: CommandOrigin,
    /// Present when an HTTP handler waits on the outcome
    pub reply: Option<tokio::sync::oneshot::Sender<CommandResult>>,
}

impl InboundCommand {
    pub fn new(command: Command, origin: CommandOrigin) -> Self {
        Self {
            command,
            origin,
            reply: None,
        }
    }

    pub fn with_reply(
        command: Command,
        origin: CommandOrigin,
        reply: tokio::sync::oneshot::Sender<CommandResult>,
    ) -> Self {
        Self {
            command,
            origin,
            reply: Some(reply),
        }
    }
}

/// Side effect to run after the result has been delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredAction {
    /// Re-run connectivity with fresh wifi credentials (500 ms)
    ReconnectWifi,
    /// Restart the process (1 s, after the ack has left the device)
    Reboot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_folds_aliases_case_insensitively() {
        assert_eq!(CommandKind::parse("START_VIDEO"), CommandKind::StartStream);
        assert_eq!(CommandKind::parse("stop_video"), CommandKind::StopStream);
        assert_eq!(CommandKind::parse("AI_SNAPSHOT"), CommandKind::AiRun);
        assert_eq!(CommandKind::parse("Capture_Photo"), CommandKind::TakePhoto);
        assert_eq!(
            CommandKind::parse("blink"),
            CommandKind::Unknown("blink".to_string())
        );
    }

    #[test]
    fn test_decode_envelope_with_either_kind_key() {
        let cmd = Command::decode(r#"{"id": "c1", "type": "led_on"}"#);
        assert_eq!(cmd.kind, CommandKind::LedOn);
        assert_eq!(cmd.id.as_deref(), Some("c1"));

        let cmd = Command::decode(r#"{"command": "get_status", "params": {"verbose": true}}"#);
        assert_eq!(cmd.kind, CommandKind::GetStatus);
        assert!(cmd.params.get("verbose").is_some());
    }

    #[test]
    fn test_decode_legacy_bare_strings() {
        assert_eq!(Command::decode("start_stream").kind, CommandKind::StartStream);
        assert_eq!(Command::decode(" start_video\n").kind, CommandKind::StartStream);
        assert_eq!(Command::decode("stop_video").kind, CommandKind::StopStream);

        // Only the stream pair has the legacy bare form
        let cmd = Command::decode("led_on");
        assert_eq!(cmd.kind, CommandKind::Unknown("led_on".to_string()));
    }

    #[test]
    fn test_decode_garbage_is_unknown() {
        let cmd = Command::decode("{not json");
        assert!(matches!(cmd.kind, CommandKind::Unknown(_)));
    }
}
