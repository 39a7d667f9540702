//! Streaming WebSocket message types
//!
//! Every client frame is a JSON object with a `command` field. Parsing is
//! done in two steps so failures can be classified:
//!
//! 1. Structural: the frame is not a JSON object or has no string `command`.
//!    These are protocol violations and close the connection.
//! 2. Per-command: the named command is unknown, carries unknown fields, or
//!    has missing or invalid fields. These produce an `error` reply and the
//!    connection survives.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::core::AudioEncoding;
use crate::session::{FieldError, SessionConfig, reject_unknown_fields};

/// Maximum allowed size for a `special` payload once serialized (64 KB)
pub const MAX_SPECIAL_CONTENT_SIZE: usize = 64 * 1024;

/// Sample rate assumed when a `voice` command omits `sampleRate`
pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;

/// Members accepted inside `agora_settings`
const AGORA_FIELDS: &[&str] = &["app_id", "token", "channel", "uid", "enable_string_uid"];

// =============================================================================
// Incoming Messages (Client -> Server)
// =============================================================================

/// A parsed client command
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingCommand {
    Init(InitCommand),
    Voice(VoiceCommand),
    VoiceEnd(EventCommand),
    VoiceInterrupt(EventCommand),
    Heartbeat(HeartbeatCommand),
    Special(SpecialCommand),
}

/// `init`: binds the connection to its session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitCommand {
    pub session_id: String,
    pub config: SessionConfig,
}

/// `voice`: one base64 audio chunk
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VoiceCommand {
    pub audio: String,
    #[serde(rename = "sampleRate", default = "default_sample_rate")]
    pub sample_rate: u32,
    pub encoding: AudioEncoding,
    pub event_id: String,
}

/// `voice_end` and `voice_interrupt`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventCommand {
    pub event_id: String,
}

/// `heartbeat`: the timestamp is echoed back exactly as sent
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatCommand {
    pub event_id: String,
    #[serde(default = "default_timestamp")]
    pub timestamp: Value,
}

fn default_sample_rate() -> u32 {
    DEFAULT_SAMPLE_RATE
}

fn default_timestamp() -> Value {
    Value::from(0)
}

/// `special`: out-of-band instruction passed through to the engine
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpecialCommand {
    pub content: Value,
    pub event_id: String,
}

impl IncomingCommand {
    pub fn name(&self) -> &'static str {
        match self {
            IncomingCommand::Init(_) => "init",
            IncomingCommand::Voice(_) => "voice",
            IncomingCommand::VoiceEnd(_) => "voice_end",
            IncomingCommand::VoiceInterrupt(_) => "voice_interrupt",
            IncomingCommand::Heartbeat(_) => "heartbeat",
            IncomingCommand::Special(_) => "special",
        }
    }

    /// Event id of an ACTIVE-loop command; `init` carries none.
    pub fn event_id(&self) -> Option<&str> {
        match self {
            IncomingCommand::Init(_) => None,
            IncomingCommand::Voice(cmd) => Some(&cmd.event_id),
            IncomingCommand::VoiceEnd(cmd) | IncomingCommand::VoiceInterrupt(cmd) => {
                Some(&cmd.event_id)
            }
            IncomingCommand::Heartbeat(cmd) => Some(&cmd.event_id),
            IncomingCommand::Special(cmd) => Some(&cmd.event_id),
        }
    }

    /// Parse one text frame.
    ///
    /// `default_idle_timeout` fills `activity_idle_timeout` when an `init`
    /// omits it.
    pub fn parse(text: &str, default_idle_timeout: u64) -> Result<Self, CommandError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| CommandError::MalformedJson(e.to_string()))?;
        let Value::Object(mut obj) = value else {
            return Err(CommandError::NotAnObject);
        };

        let command = match obj.remove("command") {
            Some(Value::String(command)) => command,
            _ => return Err(CommandError::MissingCommand),
        };
        let event_id = obj
            .get("event_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        let invalid = |command: &'static str, message: String| CommandError::Invalid {
            command,
            message,
            event_id: event_id.clone(),
        };

        match command.as_str() {
            "init" => parse_init(&obj, default_idle_timeout)
                .map(IncomingCommand::Init)
                .map_err(|e| invalid("init", e.to_string())),
            "voice" => from_object(obj)
                .map(IncomingCommand::Voice)
                .map_err(|e| invalid("voice", e)),
            "voice_end" => from_object(obj)
                .map(IncomingCommand::VoiceEnd)
                .map_err(|e| invalid("voice_end", e)),
            "voice_interrupt" => from_object(obj)
                .map(IncomingCommand::VoiceInterrupt)
                .map_err(|e| invalid("voice_interrupt", e)),
            "heartbeat" => from_object(obj)
                .map(IncomingCommand::Heartbeat)
                .map_err(|e| invalid("heartbeat", e)),
            "special" => {
                let special: SpecialCommand =
                    from_object(obj).map_err(|e| invalid("special", e))?;
                let size = special.content.to_string().len();
                if size > MAX_SPECIAL_CONTENT_SIZE {
                    return Err(invalid(
                        "special",
                        format!(
                            "content too large: {size} bytes (max: {MAX_SPECIAL_CONTENT_SIZE} bytes)"
                        ),
                    ));
                }
                Ok(IncomingCommand::Special(special))
            }
            _ => Err(CommandError::UnknownCommand {
                command,
                event_id,
            }),
        }
    }
}

fn from_object<T: serde::de::DeserializeOwned>(obj: Map<String, Value>) -> Result<T, String> {
    serde_json::from_value(Value::Object(obj)).map_err(|e| e.to_string())
}

fn parse_init(obj: &Map<String, Value>, default_idle_timeout: u64) -> Result<InitCommand, FieldError> {
    let mut allowed = SessionConfig::FIELDS.to_vec();
    allowed.push("session_id");
    reject_unknown_fields(obj, &allowed, "")?;
    if let Some(Value::Object(agora)) = obj.get("agora_settings") {
        reject_unknown_fields(agora, AGORA_FIELDS, "agora_settings.")?;
    }

    let session_id = match obj.get("session_id") {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        Some(Value::String(_)) | None | Some(Value::Null) => {
            return Err(FieldError::missing("session_id"));
        }
        Some(_) => return Err(FieldError::new("session_id", "session_id must be a string")),
    };

    let config = SessionConfig::from_json(obj, default_idle_timeout)?;
    Ok(InitCommand { session_id, config })
}

/// Why a text frame could not be turned into a command
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CommandError {
    #[error("Invalid JSON: {0}")]
    MalformedJson(String),

    #[error("Message must be a JSON object")]
    NotAnObject,

    #[error("Message has no 'command' field")]
    MissingCommand,

    #[error("Unknown command '{command}'")]
    UnknownCommand {
        command: String,
        event_id: Option<String>,
    },

    #[error("Invalid '{command}' command: {message}")]
    Invalid {
        command: &'static str,
        message: String,
        event_id: Option<String>,
    },
}

impl CommandError {
    /// Structural errors make the frame uninterpretable and end the connection.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            CommandError::MalformedJson(_) | CommandError::NotAnObject | CommandError::MissingCommand
        )
    }

    /// Name of the command the frame claimed to be, if it got that far.
    pub fn command(&self) -> Option<&str> {
        match self {
            CommandError::UnknownCommand { command, .. } => Some(command),
            CommandError::Invalid { command, .. } => Some(command),
            _ => None,
        }
    }

    pub fn event_id(&self) -> Option<&str> {
        match self {
            CommandError::UnknownCommand { event_id, .. }
            | CommandError::Invalid { event_id, .. } => event_id.as_deref(),
            _ => None,
        }
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            CommandError::MalformedJson(_) | CommandError::NotAnObject => ErrorCode::InvalidJson,
            CommandError::MissingCommand => ErrorCode::MissingCommand,
            CommandError::UnknownCommand { .. } => ErrorCode::UnknownCommand,
            CommandError::Invalid { .. } => ErrorCode::ValidationError,
        }
    }
}

// =============================================================================
// Outgoing Messages (Server -> Client)
// =============================================================================

/// Machine-readable codes carried by `error` messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidJson,
    MissingCommand,
    UnknownCommand,
    ValidationError,
    NotInitialized,
    AlreadyInitialized,
    SessionMismatch,
    SessionUnavailable,
    UnsupportedFrame,
    DecodeError,
    DecodeFailureLimit,
    EngineError,
    InitTimeout,
    IdleTimeout,
}

/// Messages sent by the server
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command")]
pub enum OutgoingMessage {
    /// `init` accepted; the ACTIVE loop is running
    #[serde(rename = "initialized")]
    Initialized { session_id: String },

    #[serde(rename = "heartbeat_ack")]
    HeartbeatAck { event_id: String, timestamp: Value },

    #[serde(rename = "error")]
    Error {
        code: ErrorCode,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
    },
}

impl OutgoingMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>, event_id: Option<&str>) -> Self {
        OutgoingMessage::Error {
            code,
            message: message.into(),
            event_id: event_id.map(str::to_string),
        }
    }
}

// =============================================================================
// Message Routing
// =============================================================================

/// Close code for protocol violations (RFC 6455 "policy violation")
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Close code for a normal shutdown
pub const CLOSE_NORMAL: u16 = 1000;

/// Items queued for the socket writer task
#[derive(Debug)]
pub enum MessageRoute {
    Outgoing(OutgoingMessage),
    /// Send a close frame and stop writing
    Close { code: u16, reason: String },
}
