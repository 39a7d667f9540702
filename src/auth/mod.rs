//! Credential handling for both planes
//!
//! - Control plane: static API keys sent in `x-api-key`, compared in
//!   constant time.
//! - Streaming plane: signed session tokens (see [`token`]) sent as
//!   `Authorization: Bearer <token>`.

pub mod token;

pub use token::{SessionClaims, SessionTokenSigner, TokenError};

use axum::http::{HeaderMap, Uri};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::config::ApiKeyEntry;
use crate::errors::AuthError;

/// Header carrying the control-plane API key
pub const API_KEY_HEADER: &str = "x-api-key";

/// Constant-time equality for two secrets of possibly different length.
pub fn secrets_match(provided: &str, expected: &str) -> bool {
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Return the id of the configured key matching `provided`, if any.
///
/// Every configured key is compared so timing does not reveal which entry
/// matched.
pub fn match_api_key_id<'a>(provided: &str, keys: &'a [ApiKeyEntry]) -> Option<&'a str> {
    let mut matched = None;
    for entry in keys {
        if secrets_match(provided, &entry.key) && matched.is_none() {
            matched = Some(entry.id.as_str());
        }
    }
    matched
}

/// Short SHA-256 fingerprint of a secret, safe to put in logs.
pub fn fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    hex::encode(&digest[..6])
}

/// Extract the bearer token from a streaming upgrade request.
///
/// Token sources, in priority order:
/// 1. `Authorization: Bearer <token>` header
/// 2. `?token=<token>` query parameter, for browser clients that cannot set
///    headers on a WebSocket handshake
pub fn extract_bearer_token(headers: &HeaderMap, uri: &Uri) -> Result<String, AuthError> {
    if let Some(auth_header) = headers.get(http::header::AUTHORIZATION) {
        let auth_str = auth_header
            .to_str()
            .map_err(|_| AuthError::InvalidAuthHeader)?;

        return match auth_str.strip_prefix("Bearer ") {
            Some(token) if !token.trim().is_empty() => {
                tracing::debug!("Session token extracted from Authorization header");
                Ok(token.trim().to_string())
            }
            _ => Err(AuthError::InvalidAuthHeader),
        };
    }

    if let Some(query) = uri.query() {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if key == "token" && !value.is_empty() {
                tracing::debug!("Session token extracted from query parameter");
                return Ok(value.into_owned());
            }
        }
    }

    Err(AuthError::MissingAuthHeader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn keys() -> Vec<ApiKeyEntry> {
        vec![
            ApiKeyEntry {
                id: "default".into(),
                key: "key-one".into(),
            },
            ApiKeyEntry {
                id: "partner".into(),
                key: "key-two".into(),
            },
        ]
    }

    #[test]
    fn test_match_api_key_id() {
        let keys = keys();
        assert_eq!(match_api_key_id("key-one", &keys), Some("default"));
        assert_eq!(match_api_key_id("key-two", &keys), Some("partner"));
        assert_eq!(match_api_key_id("key-three", &keys), None);
        assert_eq!(match_api_key_id("", &keys), None);
        assert_eq!(match_api_key_id("key-one", &[]), None);
    }

    #[test]
    fn test_fingerprint_is_stable_and_short() {
        assert_eq!(fingerprint("abc"), fingerprint("abc"));
        assert_ne!(fingerprint("abc"), fingerprint("abd"));
        assert_eq!(fingerprint("abc").len(), 12);
    }

    #[test]
    fn test_extract_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer tok-1"));
        let uri: Uri = "/ws".parse().unwrap();
        assert_eq!(extract_bearer_token(&headers, &uri).unwrap(), "tok-1");
    }

    #[test]
    fn test_header_wins_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer tok-1"));
        let uri: Uri = "/ws?token=tok-2".parse().unwrap();
        assert_eq!(extract_bearer_token(&headers, &uri).unwrap(), "tok-1");
    }

    #[test]
    fn test_extract_from_query() {
        let uri: Uri = "/ws?token=tok-2".parse().unwrap();
        assert_eq!(
            extract_bearer_token(&HeaderMap::new(), &uri).unwrap(),
            "tok-2"
        );
    }

    #[test]
    fn test_non_bearer_header_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        let uri: Uri = "/ws".parse().unwrap();
        assert!(matches!(
            extract_bearer_token(&headers, &uri),
            Err(AuthError::InvalidAuthHeader)
        ));
    }

    #[test]
    fn test_missing_token() {
        let uri: Uri = "/ws".parse().unwrap();
        assert!(matches!(
            extract_bearer_token(&HeaderMap::new(), &uri),
            Err(AuthError::MissingAuthHeader)
        ));
    }
}
