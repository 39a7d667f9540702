//! Checks applied to the merged configuration

use std::collections::HashSet;

use super::{ApiKeyEntry, ConfigError, ServerConfig};

/// HS256 keys shorter than this are rejected
pub const MIN_TOKEN_SECRET_BYTES: usize = 32;

pub(super) fn validate(config: &ServerConfig) -> Result<(), ConfigError> {
    validate_api_keys(&config.api_keys)?;
    validate_token(config.token_secret.as_deref(), config.token_ttl_seconds)?;
    validate_stream_url(config.public_stream_url.as_deref())?;
    validate_stream_limits(config)?;
    validate_rate_limit(config)?;
    Ok(())
}

pub(super) fn validate_api_keys(keys: &[ApiKeyEntry]) -> Result<(), ConfigError> {
    let mut ids = HashSet::new();
    for entry in keys {
        if entry.id.trim().is_empty() {
            return Err(ConfigError::Validation(
                "API key entries must have a non-empty id".to_string(),
            ));
        }
        if entry.key.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "API key '{}' has an empty key",
                entry.id
            )));
        }
        if !ids.insert(entry.id.as_str()) {
            return Err(ConfigError::Validation(format!(
                "duplicate API key id '{}'",
                entry.id
            )));
        }
    }
    Ok(())
}

pub(super) fn validate_token(secret: Option<&str>, ttl_seconds: u64) -> Result<(), ConfigError> {
    if let Some(secret) = secret
        && secret.len() < MIN_TOKEN_SECRET_BYTES
    {
        return Err(ConfigError::Validation(format!(
            "SESSION_TOKEN_SECRET must be at least {MIN_TOKEN_SECRET_BYTES} bytes"
        )));
    }
    if ttl_seconds == 0 {
        return Err(ConfigError::Validation(
            "session token TTL must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

pub(super) fn validate_stream_url(url: Option<&str>) -> Result<(), ConfigError> {
    let Some(raw) = url else {
        return Ok(());
    };
    let parsed = url::Url::parse(raw).map_err(|e| {
        ConfigError::Validation(format!("PUBLIC_STREAM_URL '{raw}' is not a valid URL: {e}"))
    })?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(ConfigError::Validation(format!(
            "PUBLIC_STREAM_URL must use ws or wss, got '{other}'"
        ))),
    }
}

fn validate_stream_limits(config: &ServerConfig) -> Result<(), ConfigError> {
    if config.max_decode_failures == 0 {
        return Err(ConfigError::Validation(
            "max_decode_failures must be at least 1".to_string(),
        ));
    }
    if config.forward_batch_bytes > 0 && config.max_buffer_delay_ms == 0 {
        return Err(ConfigError::Validation(
            "max_buffer_delay_ms must be greater than zero when batching is enabled".to_string(),
        ));
    }
    if config.default_idle_timeout_seconds > crate::session::MAX_IDLE_TIMEOUT_SECONDS {
        return Err(ConfigError::Validation(format!(
            "default_idle_timeout_seconds must not exceed {}",
            crate::session::MAX_IDLE_TIMEOUT_SECONDS
        )));
    }
    if config.init_timeout_seconds == 0 {
        return Err(ConfigError::Validation(
            "init_timeout_seconds must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_rate_limit(config: &ServerConfig) -> Result<(), ConfigError> {
    if config.rate_limit_requests_per_second == 0 || config.rate_limit_burst_size == 0 {
        return Err(ConfigError::Validation(
            "rate limit requests per second and burst size must be greater than zero"
                .to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, key: &str) -> ApiKeyEntry {
        ApiKeyEntry {
            id: id.to_string(),
            key: key.to_string(),
        }
    }

    #[test]
    fn test_api_keys() {
        assert!(validate_api_keys(&[]).is_ok());
        assert!(validate_api_keys(&[entry("a", "k1"), entry("b", "k2")]).is_ok());
        assert!(validate_api_keys(&[entry("", "k1")]).is_err());
        assert!(validate_api_keys(&[entry("a", " ")]).is_err());
        assert!(validate_api_keys(&[entry("a", "k1"), entry("a", "k2")]).is_err());
    }

    #[test]
    fn test_token_secret_length() {
        assert!(validate_token(None, 60).is_ok());
        assert!(validate_token(Some("short"), 60).is_err());
        assert!(validate_token(Some(&"x".repeat(MIN_TOKEN_SECRET_BYTES)), 60).is_ok());
        assert!(validate_token(None, 0).is_err());
    }

    #[test]
    fn test_stream_url_scheme() {
        assert!(validate_stream_url(None).is_ok());
        assert!(validate_stream_url(Some("wss://host/ws")).is_ok());
        assert!(validate_stream_url(Some("ws://127.0.0.1:8764/ws")).is_ok());
        assert!(validate_stream_url(Some("https://host/ws")).is_err());
        assert!(validate_stream_url(Some("not a url")).is_err());
    }

    #[test]
    fn test_batching_requires_delay() {
        let mut config = ServerConfig::default();
        config.forward_batch_bytes = 1024;
        config.max_buffer_delay_ms = 0;
        assert!(validate(&config).is_err());

        config.max_buffer_delay_ms = 50;
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_zero_decode_failures_rejected() {
        let mut config = ServerConfig::default();
        config.max_decode_failures = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_default_idle_timeout_bounded() {
        let mut config = ServerConfig::default();
        config.default_idle_timeout_seconds = crate::session::MAX_IDLE_TIMEOUT_SECONDS + 1;
        assert!(validate(&config).is_err());

        config.default_idle_timeout_seconds = 0;
        assert!(validate(&config).is_ok());
    }
}
