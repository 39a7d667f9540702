//! Self-verifying session tokens
//!
//! A session token is an HS256 JWT whose subject is the session id. The
//! streaming endpoint verifies it with [`SessionTokenSigner::verify`] alone,
//! without consulting the control plane, and only afterwards checks the
//! session store for termination.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Claims carried by a session token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionClaims {
    /// Session id the token is bound to
    pub sub: String,
    /// Issued-at (Unix seconds)
    pub iat: i64,
    /// Expiry (Unix seconds)
    pub exp: i64,
    /// Unique token id
    pub jti: String,
}

impl SessionClaims {
    pub fn new(session_id: &str, ttl_seconds: u64) -> Self {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        Self {
            sub: session_id.to_string(),
            iat: now,
            exp: now.saturating_add(ttl_seconds as i64),
            jti: uuid::Uuid::new_v4().simple().to_string(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.sub
    }
}

/// Token verification and minting errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token has expired")]
    Expired,

    #[error("token signature is invalid")]
    InvalidSignature,

    #[error("token is malformed: {0}")]
    Malformed(String),

    #[error("token could not be signed: {0}")]
    Signing(String),
}

/// Mints and verifies session tokens with a shared HMAC secret.
#[derive(Clone)]
pub struct SessionTokenSigner {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl_seconds: u64,
}

impl SessionTokenSigner {
    pub fn new(secret: &[u8], ttl_seconds: u64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            ttl_seconds,
        }
    }

    /// Mint a token for `session_id` valid for the configured TTL.
    pub fn mint(&self, session_id: &str) -> Result<String, TokenError> {
        self.mint_with_claims(&SessionClaims::new(session_id, self.ttl_seconds))
    }

    pub fn mint_with_claims(&self, claims: &SessionClaims) -> Result<String, TokenError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| TokenError::Signing(e.to_string()))
    }

    /// Verify signature and expiry, returning the embedded claims.
    pub fn verify(&self, token: &str) -> Result<SessionClaims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        // Tokens expire at exactly `exp`
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        decode::<SessionClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidSignature => TokenError::InvalidSignature,
                _ => TokenError::Malformed(e.to_string()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"unit-test-secret-with-enough-entropy";

    #[test]
    fn test_mint_and_verify() {
        let signer = SessionTokenSigner::new(SECRET, 3600);
        let token = signer.mint("sess-1").unwrap();

        let claims = signer.verify(&token).unwrap();
        assert_eq!(claims.session_id(), "sess-1");
        assert!(claims.exp - claims.iat == 3600);
    }

    #[test]
    fn test_tokens_are_unique_per_mint() {
        let signer = SessionTokenSigner::new(SECRET, 3600);
        let a = signer.mint("sess-1").unwrap();
        let b = signer.mint("sess-1").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_expired_token_rejected() {
        let signer = SessionTokenSigner::new(SECRET, 3600);
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let claims = SessionClaims {
            sub: "sess-1".into(),
            iat: now - 100,
            exp: now - 1,
            jti: "j".into(),
        };
        let token = signer.mint_with_claims(&claims).unwrap();
        assert_eq!(signer.verify(&token).unwrap_err(), TokenError::Expired);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = SessionTokenSigner::new(SECRET, 60).mint("sess-1").unwrap();
        let other = SessionTokenSigner::new(b"another-secret-entirely-different", 60);
        assert_eq!(other.verify(&token).unwrap_err(), TokenError::InvalidSignature);
    }

    #[test]
    fn test_garbage_token_is_malformed() {
        let signer = SessionTokenSigner::new(SECRET, 60);
        assert!(matches!(
            signer.verify("not-a-jwt"),
            Err(TokenError::Malformed(_))
        ));
    }
}
