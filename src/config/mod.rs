//! Configuration module for the avatar gateway
//!
//! This module handles server configuration from various sources: .env files, YAML files,
//! and environment variables. Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `env`: Environment variable loading
//! - `merge`: Merging YAML and environment configurations
//! - `validation`: Configuration validation logic
//!
//! # Example
//! ```rust,no_run
//! use avatar_gateway::config::ServerConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = ServerConfig::from_env()?;
//!
//! // Load from YAML file with environment variable overrides
//! let config = ServerConfig::from_file(&PathBuf::from("config.yaml"))?;
//!
//! println!("Server listening on {}", config.address());
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

mod env;
mod merge;
mod validation;
mod yaml;

pub use validation::MIN_TOKEN_SECRET_BYTES;
pub use yaml::YamlConfig;

use crate::core::IngestSettings;

/// Errors raised while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid value for {name}: {message}")]
    Invalid { name: &'static str, message: String },

    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Control-plane API key with a client identifier
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKeyEntry {
    pub id: String,
    pub key: String,
}

impl fmt::Debug for ApiKeyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKeyEntry")
            .field("id", &self.id)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Server configuration
///
/// Contains everything needed to run the gateway:
/// - Listener and advertised stream address
/// - Control-plane API keys and session token signing
/// - Session and streaming behaviour (timeouts, buffering, decode limits)
/// - Optional WAV capture of forwarded audio
/// - Security settings (CORS, rate limiting, connection limits)
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Server settings
    pub host: String,
    pub port: u16,
    /// Advertised as `websocket_address`; defaults to `ws://{host}:{port}/ws`
    pub public_stream_url: Option<String>,

    // Authentication
    pub api_keys: Vec<ApiKeyEntry>,
    /// HS256 signing secret. When unset a random per-process secret is used
    /// and tokens do not survive a restart.
    pub token_secret: Option<String>,
    pub token_ttl_seconds: u64,

    // Session behaviour
    /// Applied when `activity_idle_timeout` is omitted from a start request
    pub default_idle_timeout_seconds: u64,
    /// A connection that has not sent `init` within this window is closed
    pub init_timeout_seconds: u64,

    // Streaming
    pub max_decode_failures: u32,
    /// 0 forwards every chunk as soon as it is decoded
    pub forward_batch_bytes: usize,
    pub max_buffer_delay_ms: u64,
    pub heartbeat_ack: bool,

    /// When set, every completed PCM utterance is also written here as WAV
    pub audio_capture_dir: Option<PathBuf>,

    // Security configuration
    /// CORS allowed origins (comma-separated list or "*" for all)
    /// Default: None (CORS disabled, same-origin only)
    pub cors_allowed_origins: Option<String>,
    /// Default: 60
    pub rate_limit_requests_per_second: u32,
    /// Default: 10
    pub rate_limit_burst_size: u32,
    /// Default: None (unlimited)
    pub max_websocket_connections: Option<usize>,
    /// Default: 100
    pub max_connections_per_ip: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: env::DEFAULT_HOST.to_string(),
            port: env::DEFAULT_PORT,
            public_stream_url: None,
            api_keys: Vec::new(),
            token_secret: None,
            token_ttl_seconds: env::DEFAULT_TOKEN_TTL_SECONDS,
            default_idle_timeout_seconds: crate::session::DEFAULT_IDLE_TIMEOUT_SECONDS,
            init_timeout_seconds: env::DEFAULT_INIT_TIMEOUT_SECONDS,
            max_decode_failures: env::DEFAULT_MAX_DECODE_FAILURES,
            forward_batch_bytes: 0,
            max_buffer_delay_ms: env::DEFAULT_MAX_BUFFER_DELAY_MS,
            heartbeat_ack: true,
            audio_capture_dir: None,
            cors_allowed_origins: None,
            rate_limit_requests_per_second: env::DEFAULT_RATE_LIMIT_RPS,
            rate_limit_burst_size: env::DEFAULT_RATE_LIMIT_BURST,
            max_websocket_connections: None,
            max_connections_per_ip: env::DEFAULT_MAX_CONNECTIONS_PER_IP,
        }
    }
}

/// Zeroize secrets when the configuration is dropped.
impl Drop for ServerConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        for entry in &mut self.api_keys {
            entry.key.zeroize();
        }
        if let Some(ref mut secret) = self.token_secret {
            secret.zeroize();
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables and defaults.
    ///
    /// `.env` is loaded by `main` before this is called, so real environment
    /// variables take precedence over `.env` values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = merge::merge_config(None)?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a YAML file on top of the environment.
    ///
    /// Priority order (highest to lowest):
    /// 1. YAML file values
    /// 2. Environment variables (actual ENV vars override .env values)
    /// 3. .env file values
    /// 4. Default values
    ///
    /// The merged result is validated before it is returned.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let yaml_config = YamlConfig::from_file(path)?;
        let config = merge::merge_config(Some(yaml_config))?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Get the server address as "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// URL clients should open the streaming connection on.
    pub fn stream_url(&self) -> String {
        self.public_stream_url
            .clone()
            .unwrap_or_else(|| format!("ws://{}:{}/ws", self.host, self.port))
    }

    /// Returns true if at least one control-plane API key is configured
    pub fn has_api_keys(&self) -> bool {
        !self.api_keys.is_empty()
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_seconds)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_seconds)
    }

    /// Ingest tuning for each streaming connection
    pub fn ingest_settings(&self) -> IngestSettings {
        IngestSettings {
            batch_bytes: self.forward_batch_bytes,
            max_buffer_delay: Duration::from_millis(self.max_buffer_delay_ms),
            max_decode_failures: self.max_decode_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env as std_env;
    use std::fs;
    use tempfile::TempDir;

    const ENV_VARS: &[&str] = &[
        "HOST",
        "PORT",
        "PUBLIC_STREAM_URL",
        "API_KEY",
        "API_KEY_ID",
        "API_KEYS_JSON",
        "SESSION_TOKEN_SECRET",
        "SESSION_TOKEN_TTL_SECONDS",
        "DEFAULT_IDLE_TIMEOUT_SECONDS",
        "INIT_TIMEOUT_SECONDS",
        "MAX_DECODE_FAILURES",
        "FORWARD_BATCH_BYTES",
        "MAX_BUFFER_DELAY_MS",
        "HEARTBEAT_ACK",
        "AUDIO_CAPTURE_DIR",
        "CORS_ALLOWED_ORIGINS",
        "RATE_LIMIT_REQUESTS_PER_SECOND",
        "RATE_LIMIT_BURST_SIZE",
        "MAX_WEBSOCKET_CONNECTIONS",
        "MAX_CONNECTIONS_PER_IP",
    ];

    // Helper to clean up environment variables
    fn cleanup_env_vars() {
        unsafe {
            for name in ENV_VARS {
                std_env::remove_var(name);
            }
        }
    }

    #[test]
    fn test_stream_url_defaults_to_listener() {
        let mut config = ServerConfig::default();
        config.host = "127.0.0.1".to_string();
        config.port = 9100;
        assert_eq!(config.address(), "127.0.0.1:9100");
        assert_eq!(config.stream_url(), "ws://127.0.0.1:9100/ws");

        config.public_stream_url = Some("wss://avatar.example.com/ws".to_string());
        assert_eq!(config.stream_url(), "wss://avatar.example.com/ws");
    }

    #[test]
    fn test_ingest_settings() {
        let mut config = ServerConfig::default();
        config.forward_batch_bytes = 3200;
        config.max_buffer_delay_ms = 40;
        let settings = config.ingest_settings();
        assert_eq!(settings.batch_bytes, 3200);
        assert_eq!(settings.max_buffer_delay, Duration::from_millis(40));
        assert_eq!(settings.max_decode_failures, 5);
    }

    #[test]
    fn test_api_key_debug_is_redacted() {
        let entry = ApiKeyEntry {
            id: "default".to_string(),
            key: "super-secret".to_string(),
        };
        let printed = format!("{entry:?}");
        assert!(printed.contains("default"));
        assert!(!printed.contains("super-secret"));
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        cleanup_env_vars();

        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8764);
        assert!(!config.has_api_keys());
        assert_eq!(config.token_ttl_seconds, 3600);
        assert_eq!(config.default_idle_timeout_seconds, 120);
        assert_eq!(config.init_timeout_seconds, 30);
        assert!(config.heartbeat_ack);
        assert!(config.audio_capture_dir.is_none());
    }

    #[test]
    #[serial]
    fn test_from_env_values() {
        cleanup_env_vars();
        unsafe {
            std_env::set_var("PORT", "9001");
            std_env::set_var("API_KEY", "env-key");
            std_env::set_var("DEFAULT_IDLE_TIMEOUT_SECONDS", "0");
            std_env::set_var("HEARTBEAT_ACK", "false");
            std_env::set_var("MAX_WEBSOCKET_CONNECTIONS", "25");
        }

        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.port, 9001);
        assert_eq!(config.api_keys.len(), 1);
        assert_eq!(config.api_keys[0].id, "default");
        assert_eq!(config.api_keys[0].key, "env-key");
        assert_eq!(config.default_idle_timeout_seconds, 0);
        assert!(!config.heartbeat_ack);
        assert_eq!(config.max_websocket_connections, Some(25));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_api_keys_json_wins_over_single_key() {
        cleanup_env_vars();
        unsafe {
            std_env::set_var("API_KEY", "single");
            std_env::set_var("API_KEYS_JSON", r#"[{"id":"partner","key":"k2"}]"#);
        }

        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.api_keys.len(), 1);
        assert_eq!(config.api_keys[0].id, "partner");

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_env_invalid_number() {
        cleanup_env_vars();
        unsafe {
            std_env::set_var("PORT", "not-a-port");
        }

        let err = ServerConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "PORT", .. }));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_short_token_secret_rejected() {
        cleanup_env_vars();
        unsafe {
            std_env::set_var("SESSION_TOKEN_SECRET", "too-short");
        }

        assert!(matches!(
            ServerConfig::from_env(),
            Err(ConfigError::Validation(_))
        ));

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_yaml_overrides_env() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        let yaml_content = r#"
server:
  host: "127.0.0.1"
  port: 8080
auth:
  api_keys:
    - id: "yaml"
      key: "yaml-key"
stream:
  forward_batch_bytes: 640
"#;
        fs::write(&config_path, yaml_content).unwrap();

        unsafe {
            std_env::set_var("HOST", "10.0.0.1");
            std_env::set_var("API_KEY", "env-key");
            std_env::set_var("INIT_TIMEOUT_SECONDS", "7");
        }

        let config = ServerConfig::from_file(&config_path).unwrap();

        // YAML overrides ENV
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.api_keys[0].id, "yaml");
        assert_eq!(config.forward_batch_bytes, 640);
        // ENV value not present in YAML
        assert_eq!(config.init_timeout_seconds, 7);

        cleanup_env_vars();
    }

    #[test]
    #[serial]
    fn test_from_file_missing_file() {
        cleanup_env_vars();

        let result = ServerConfig::from_file(Path::new("/nonexistent/config.yaml"));
        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Failed to read config file")
        );
    }

    #[test]
    #[serial]
    fn test_from_file_validation_runs() {
        cleanup_env_vars();

        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        fs::write(
            &config_path,
            "server:\n  public_stream_url: \"http://example.com/ws\"\n",
        )
        .unwrap();

        assert!(matches!(
            ServerConfig::from_file(&config_path),
            Err(ConfigError::Validation(_))
        ));
    }
}
