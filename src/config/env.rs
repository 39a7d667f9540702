//! Environment variable layer
//!
//! Reads every setting from the process environment (which already includes
//! `.env` values loaded by `main`) and falls back to defaults.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use super::{ApiKeyEntry, ConfigError, ServerConfig};
use crate::session::DEFAULT_IDLE_TIMEOUT_SECONDS;

pub(super) const DEFAULT_HOST: &str = "0.0.0.0";
pub(super) const DEFAULT_PORT: u16 = 8764;
pub(super) const DEFAULT_TOKEN_TTL_SECONDS: u64 = 3600;
pub(super) const DEFAULT_INIT_TIMEOUT_SECONDS: u64 = 30;
pub(super) const DEFAULT_MAX_DECODE_FAILURES: u32 = 5;
pub(super) const DEFAULT_MAX_BUFFER_DELAY_MS: u64 = 100;
pub(super) const DEFAULT_RATE_LIMIT_RPS: u32 = 60;
pub(super) const DEFAULT_RATE_LIMIT_BURST: u32 = 10;
pub(super) const DEFAULT_MAX_CONNECTIONS_PER_IP: u32 = 100;

/// Non-empty value of an environment variable.
fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match var(name) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn parse_opt<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    var(name)
        .map(|raw| {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                name,
                message: e.to_string(),
            })
        })
        .transpose()
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match var(name).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(ConfigError::Invalid {
            name,
            message: format!("expected a boolean, got '{v}'"),
        }),
    }
}

/// Parse `API_KEYS_JSON`: `[{"id": "...", "key": "..."}]`.
pub(crate) fn parse_api_keys_json(json_str: &str) -> Result<Vec<ApiKeyEntry>, ConfigError> {
    #[derive(serde::Deserialize)]
    struct ApiKeyJson {
        id: String,
        key: String,
    }

    let entries: Vec<ApiKeyJson> =
        serde_json::from_str(json_str).map_err(|e| ConfigError::Invalid {
            name: "API_KEYS_JSON",
            message: e.to_string(),
        })?;

    Ok(entries
        .into_iter()
        .map(|entry| ApiKeyEntry {
            id: entry.id,
            key: entry.key,
        })
        .collect())
}

/// API keys from the environment. `API_KEYS_JSON` wins over `API_KEY`.
fn api_keys() -> Result<Vec<ApiKeyEntry>, ConfigError> {
    if let Some(json) = var("API_KEYS_JSON") {
        return parse_api_keys_json(&json);
    }
    Ok(var("API_KEY")
        .map(|key| {
            vec![ApiKeyEntry {
                id: var("API_KEY_ID").unwrap_or_else(|| "default".to_string()),
                key,
            }]
        })
        .unwrap_or_default())
}

/// Build a configuration from environment variables and defaults.
pub(super) fn load() -> Result<ServerConfig, ConfigError> {
    Ok(ServerConfig {
        host: var("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
        port: parse("PORT", DEFAULT_PORT)?,
        public_stream_url: var("PUBLIC_STREAM_URL"),

        api_keys: api_keys()?,
        token_secret: var("SESSION_TOKEN_SECRET"),
        token_ttl_seconds: parse("SESSION_TOKEN_TTL_SECONDS", DEFAULT_TOKEN_TTL_SECONDS)?,

        default_idle_timeout_seconds: parse(
            "DEFAULT_IDLE_TIMEOUT_SECONDS",
            DEFAULT_IDLE_TIMEOUT_SECONDS,
        )?,
        init_timeout_seconds: parse("INIT_TIMEOUT_SECONDS", DEFAULT_INIT_TIMEOUT_SECONDS)?,

        max_decode_failures: parse("MAX_DECODE_FAILURES", DEFAULT_MAX_DECODE_FAILURES)?,
        forward_batch_bytes: parse("FORWARD_BATCH_BYTES", 0)?,
        max_buffer_delay_ms: parse("MAX_BUFFER_DELAY_MS", DEFAULT_MAX_BUFFER_DELAY_MS)?,
        heartbeat_ack: parse_bool("HEARTBEAT_ACK", true)?,

        audio_capture_dir: var("AUDIO_CAPTURE_DIR").map(PathBuf::from),

        cors_allowed_origins: var("CORS_ALLOWED_ORIGINS"),
        rate_limit_requests_per_second: parse("RATE_LIMIT_REQUESTS_PER_SECOND", DEFAULT_RATE_LIMIT_RPS)?,
        rate_limit_burst_size: parse("RATE_LIMIT_BURST_SIZE", DEFAULT_RATE_LIMIT_BURST)?,
        max_websocket_connections: parse_opt("MAX_WEBSOCKET_CONNECTIONS")?,
        max_connections_per_ip: parse("MAX_CONNECTIONS_PER_IP", DEFAULT_MAX_CONNECTIONS_PER_IP)?,
    })
}
