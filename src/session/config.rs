use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::errors::AppError;

/// Idle timeout applied when `activity_idle_timeout` is omitted
pub const DEFAULT_IDLE_TIMEOUT_SECONDS: u64 = 120;

/// Largest accepted `activity_idle_timeout` (one day)
pub const MAX_IDLE_TIMEOUT_SECONDS: u64 = 86_400;

/// A request field that is missing or malformed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing(field: &str) -> Self {
        Self::new(field, format!("{field} is required"))
    }
}

impl From<FieldError> for AppError {
    fn from(err: FieldError) -> Self {
        AppError::Validation {
            field: err.field,
            message: err.message,
        }
    }
}

/// Rendering quality tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    Medium,
    High,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Low => "low",
            Quality::Medium => "medium",
            Quality::High => "high",
        }
    }
}

impl FromStr for Quality {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Quality::Low),
            "medium" => Ok(Quality::Medium),
            "high" => Ok(Quality::High),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output video codec
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoEncoding {
    H264,
    VP8,
    AV1,
}

impl VideoEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoEncoding::H264 => "H264",
            VideoEncoding::VP8 => "VP8",
            VideoEncoding::AV1 => "AV1",
        }
    }
}

impl FromStr for VideoEncoding {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "H264" => Ok(VideoEncoding::H264),
            "VP8" => Ok(VideoEncoding::VP8),
            "AV1" => Ok(VideoEncoding::AV1),
            _ => Err(()),
        }
    }
}

impl fmt::Display for VideoEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Downstream RTC transport settings, passed through to the engine untouched.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgoraSettings {
    pub app_id: String,
    pub token: String,
    pub channel: String,
    pub uid: String,
    #[serde(default)]
    pub enable_string_uid: bool,
}

impl fmt::Debug for AgoraSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgoraSettings")
            .field("app_id", &self.app_id)
            .field("token", &"***")
            .field("channel", &self.channel)
            .field("uid", &self.uid)
            .field("enable_string_uid", &self.enable_string_uid)
            .finish()
    }
}

/// Avatar session configuration as supplied at start and echoed by `init`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub avatar_id: String,
    pub quality: Quality,
    pub version: String,
    pub video_encoding: VideoEncoding,
    /// Seconds of inactivity before the session is closed; 0 disables
    pub activity_idle_timeout: u64,
    pub agora_settings: AgoraSettings,
}

impl SessionConfig {
    /// Fields accepted by [`SessionConfig::from_json`]
    pub const FIELDS: &'static [&'static str] = &[
        "avatar_id",
        "quality",
        "version",
        "video_encoding",
        "activity_idle_timeout",
        "agora_settings",
    ];

    /// Parse and validate a configuration object.
    ///
    /// Fields are checked in a fixed order and the first problem is
    /// reported, naming the field: `avatar_id`, `quality`, `version`,
    /// `video_encoding`, `activity_idle_timeout`, `agora_settings` (then its
    /// members as `agora_settings.<name>`).
    pub fn from_json(obj: &Map<String, Value>, default_idle_timeout: u64) -> Result<Self, FieldError> {
        let avatar_id = required_str(obj, "avatar_id", "avatar_id")?;

        let quality = required_str(obj, "quality", "quality")?
            .parse::<Quality>()
            .map_err(|_| FieldError::new("quality", "quality must be one of: low, medium, high"))?;

        let version = required_str(obj, "version", "version")?;

        let video_encoding = required_str(obj, "video_encoding", "video_encoding")?
            .parse::<VideoEncoding>()
            .map_err(|_| {
                FieldError::new(
                    "video_encoding",
                    "video_encoding must be one of: H264, VP8, AV1",
                )
            })?;

        let activity_idle_timeout = match obj.get("activity_idle_timeout") {
            None | Some(Value::Null) => default_idle_timeout,
            Some(value) => match value.as_u64() {
                Some(seconds) if seconds <= MAX_IDLE_TIMEOUT_SECONDS => seconds,
                Some(_) => {
                    return Err(FieldError::new(
                        "activity_idle_timeout",
                        format!(
                            "activity_idle_timeout must not exceed {MAX_IDLE_TIMEOUT_SECONDS} seconds"
                        ),
                    ));
                }
                None => {
                    return Err(FieldError::new(
                        "activity_idle_timeout",
                        "activity_idle_timeout must be a non-negative integer number of seconds",
                    ));
                }
            },
        };

        let agora_settings = match obj.get("agora_settings") {
            None | Some(Value::Null) => return Err(FieldError::missing("agora_settings")),
            Some(Value::Object(agora)) => parse_agora_settings(agora)?,
            Some(_) => {
                return Err(FieldError::new(
                    "agora_settings",
                    "agora_settings must be an object",
                ));
            }
        };

        Ok(Self {
            avatar_id,
            quality,
            version,
            video_encoding,
            activity_idle_timeout,
            agora_settings,
        })
    }

    /// Idle window, `None` when the timeout is disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.activity_idle_timeout > 0).then(|| Duration::from_secs(self.activity_idle_timeout))
    }
}

/// Reject any key of `obj` not listed in `allowed`.
pub fn reject_unknown_fields(
    obj: &Map<String, Value>,
    allowed: &[&str],
    prefix: &str,
) -> Result<(), FieldError> {
    match obj.keys().find(|key| !allowed.contains(&key.as_str())) {
        Some(key) => {
            let field = format!("{prefix}{key}");
            Err(FieldError::new(
                field.clone(),
                format!("unknown field '{field}'"),
            ))
        }
        None => Ok(()),
    }
}

fn parse_agora_settings(obj: &Map<String, Value>) -> Result<AgoraSettings, FieldError> {
    let app_id = required_str(obj, "app_id", "agora_settings.app_id")?;

    let token = match obj.get("token") {
        None | Some(Value::Null) => return Err(FieldError::missing("agora_settings.token")),
        Some(Value::String(token)) => token.clone(),
        Some(_) => {
            return Err(FieldError::new(
                "agora_settings.token",
                "agora_settings.token must be a string",
            ));
        }
    };

    let channel = required_str(obj, "channel", "agora_settings.channel")?;

    let uid = match obj.get("uid") {
        None | Some(Value::Null) => return Err(FieldError::missing("agora_settings.uid")),
        Some(Value::String(uid)) if !uid.trim().is_empty() => uid.clone(),
        Some(Value::Number(n)) if n.is_u64() => n.to_string(),
        Some(_) => {
            return Err(FieldError::new(
                "agora_settings.uid",
                "agora_settings.uid must be a non-empty string or a non-negative integer",
            ));
        }
    };

    let enable_string_uid = match obj.get("enable_string_uid") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => *flag,
        Some(_) => {
            return Err(FieldError::new(
                "agora_settings.enable_string_uid",
                "agora_settings.enable_string_uid must be a boolean",
            ));
        }
    };

    Ok(AgoraSettings {
        app_id,
        token,
        channel,
        uid,
        enable_string_uid,
    })
}

fn required_str(obj: &Map<String, Value>, key: &str, field: &str) -> Result<String, FieldError> {
    match obj.get(key) {
        None | Some(Value::Null) => Err(FieldError::missing(field)),
        Some(Value::String(s)) if s.trim().is_empty() => {
            Err(FieldError::new(field, format!("{field} must not be empty")))
        }
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(FieldError::new(field, format!("{field} must be a string"))),
    }
}
