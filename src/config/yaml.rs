use serde::Deserialize;
use std::path::Path;

use super::ConfigError;

/// Complete YAML configuration structure
///
/// All fields are optional to allow partial configuration. Values present in
/// the file override the environment.
///
/// # Example YAML structure
/// ```yaml
/// server:
///   host: "0.0.0.0"
///   port: 8764
///   public_stream_url: "wss://avatar.example.com/ws"
///
/// auth:
///   api_keys:
///     - id: "default"
///       key: "your-api-key"
///   token_secret: "at-least-32-bytes-of-secret-material"
///   token_ttl_seconds: 3600
///
/// session:
///   default_idle_timeout_seconds: 120
///   init_timeout_seconds: 30
///
/// stream:
///   max_decode_failures: 5
///   forward_batch_bytes: 0
///   max_buffer_delay_ms: 100
///   heartbeat_ack: true
///
/// capture:
///   dir: "/var/lib/avatar-gateway/captures"
///
/// security:
///   cors_allowed_origins: "https://app.example.com"
///   rate_limit_requests_per_second: 60
///   rate_limit_burst_size: 10
///   max_websocket_connections: 1000
///   max_connections_per_ip: 100
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: Option<ServerYaml>,
    pub auth: Option<AuthYaml>,
    pub session: Option<SessionYaml>,
    pub stream: Option<StreamYaml>,
    pub capture: Option<CaptureYaml>,
    pub security: Option<SecurityYaml>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerYaml {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Address handed back to clients in `websocket_address`
    pub public_stream_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthYaml {
    /// Preferred multi-key form. If non-empty, it takes precedence over api_key.
    pub api_keys: Vec<ApiKeyYaml>,
    /// Single-key shorthand, registered under the id "default".
    pub api_key: Option<String>,
    pub token_secret: Option<String>,
    pub token_ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyYaml {
    pub id: String,
    pub key: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SessionYaml {
    pub default_idle_timeout_seconds: Option<u64>,
    pub init_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StreamYaml {
    pub max_decode_failures: Option<u32>,
    pub forward_batch_bytes: Option<usize>,
    pub max_buffer_delay_ms: Option<u64>,
    pub heartbeat_ack: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CaptureYaml {
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SecurityYaml {
    /// CORS allowed origins (comma-separated list or "*" for all)
    pub cors_allowed_origins: Option<String>,
    pub rate_limit_requests_per_second: Option<u32>,
    pub rate_limit_burst_size: Option<u32>,
    pub max_websocket_connections: Option<usize>,
    pub max_connections_per_ip: Option<u32>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or the YAML is malformed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        serde_yaml::from_str(&contents).map_err(ConfigError::Parse)
    }
}
