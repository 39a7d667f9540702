use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use super::app_error::ErrorBody;
use crate::auth::TokenError;

/// Errors raised while authenticating a streaming connection upgrade.
///
/// These are always terminal for the connection attempt: the upgrade is
/// refused with 401 and no WebSocket is established.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing authorization header")]
    MissingAuthHeader,

    #[error("Invalid authorization header format, expected 'Bearer <token>'")]
    InvalidAuthHeader,

    #[error("Invalid session token: {0}")]
    InvalidToken(#[from] TokenError),

    #[error("Session {0} is not available for streaming")]
    SessionUnavailable(String),
}

pub type AuthResult<T> = Result<T, AuthError>;

impl AuthError {
    pub fn error_code(&self) -> &'static str {
        match self {
            AuthError::MissingAuthHeader => "MISSING_AUTHORIZATION",
            AuthError::InvalidAuthHeader => "INVALID_AUTHORIZATION",
            AuthError::InvalidToken(_) => "INVALID_SESSION_TOKEN",
            AuthError::SessionUnavailable(_) => "SESSION_NOT_FOUND",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = StatusCode::UNAUTHORIZED;
        let body = ErrorBody {
            error: self.error_code(),
            message: self.to_string(),
            code: status.as_u16(),
            field: None,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_error_converts() {
        let err: AuthError = TokenError::Expired.into();
        assert_eq!(err.error_code(), "INVALID_SESSION_TOKEN");
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn test_all_variants_are_unauthorized() {
        for err in [
            AuthError::MissingAuthHeader,
            AuthError::InvalidAuthHeader,
            AuthError::SessionUnavailable("s1".into()),
        ] {
            assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);
        }
    }
}
