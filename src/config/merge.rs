//! Merge YAML overrides on top of the environment layer

use std::path::PathBuf;

use super::yaml::YamlConfig;
use super::{ApiKeyEntry, ConfigError, ServerConfig, env};

/// Environment (with defaults) first, then every value present in `yaml`.
pub(super) fn merge_config(yaml: Option<YamlConfig>) -> Result<ServerConfig, ConfigError> {
    let mut config = env::load()?;
    let Some(yaml) = yaml else {
        return Ok(config);
    };

    if let Some(server) = yaml.server {
        if let Some(host) = server.host {
            config.host = host;
        }
        if let Some(port) = server.port {
            config.port = port;
        }
        if server.public_stream_url.is_some() {
            config.public_stream_url = server.public_stream_url;
        }
    }

    if let Some(auth) = yaml.auth {
        if !auth.api_keys.is_empty() {
            config.api_keys = auth
                .api_keys
                .into_iter()
                .map(|entry| ApiKeyEntry {
                    id: entry.id,
                    key: entry.key,
                })
                .collect();
        } else if let Some(key) = auth.api_key {
            config.api_keys = vec![ApiKeyEntry {
                id: "default".to_string(),
                key,
            }];
        }
        if auth.token_secret.is_some() {
            config.token_secret = auth.token_secret;
        }
        if let Some(ttl) = auth.token_ttl_seconds {
            config.token_ttl_seconds = ttl;
        }
    }

    if let Some(session) = yaml.session {
        if let Some(idle) = session.default_idle_timeout_seconds {
            config.default_idle_timeout_seconds = idle;
        }
        if let Some(init) = session.init_timeout_seconds {
            config.init_timeout_seconds = init;
        }
    }

    if let Some(stream) = yaml.stream {
        if let Some(limit) = stream.max_decode_failures {
            config.max_decode_failures = limit;
        }
        if let Some(bytes) = stream.forward_batch_bytes {
            config.forward_batch_bytes = bytes;
        }
        if let Some(delay) = stream.max_buffer_delay_ms {
            config.max_buffer_delay_ms = delay;
        }
        if let Some(ack) = stream.heartbeat_ack {
            config.heartbeat_ack = ack;
        }
    }

    if let Some(dir) = yaml.capture.and_then(|capture| capture.dir) {
        config.audio_capture_dir = Some(PathBuf::from(dir));
    }

    if let Some(security) = yaml.security {
        if security.cors_allowed_origins.is_some() {
            config.cors_allowed_origins = security.cors_allowed_origins;
        }
        if let Some(rps) = security.rate_limit_requests_per_second {
            config.rate_limit_requests_per_second = rps;
        }
        if let Some(burst) = security.rate_limit_burst_size {
            config.rate_limit_burst_size = burst;
        }
        if security.max_websocket_connections.is_some() {
            config.max_websocket_connections = security.max_websocket_connections;
        }
        if let Some(per_ip) = security.max_connections_per_ip {
            config.max_connections_per_ip = per_ip;
        }
    }

    Ok(config)
}
