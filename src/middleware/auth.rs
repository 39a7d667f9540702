use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::auth::{API_KEY_HEADER, SessionClaims, extract_bearer_token, fingerprint, match_api_key_id};
use crate::errors::{AppError, AuthError};
use crate::state::AppState;

/// Identifier of the API key that authenticated a control-plane request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyId(pub String);

/// Verified session token attached to a streaming upgrade request
#[derive(Debug, Clone)]
pub struct StreamAuth {
    pub claims: SessionClaims,
}

impl StreamAuth {
    pub fn session_id(&self) -> &str {
        self.claims.session_id()
    }
}

/// Control-plane API key middleware
///
/// Runs before the handler reads the body, so credential errors always take
/// precedence over validation errors:
/// 1. No `x-api-key` header: 403 `MISSING_API_KEY`
/// 2. Header present but not a configured key: 401 `INVALID_API_KEY`
///
/// On success an [`ApiKeyId`] extension carries the matching key id.
pub async fn api_key_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let provided = match request.headers().get(API_KEY_HEADER) {
        None => {
            tracing::debug!(path = %request.uri().path(), "Request without API key");
            return Err(AppError::MissingApiKey);
        }
        Some(value) => value.to_str().map_err(|_| AppError::InvalidApiKey)?,
    };

    let Some(id) = match_api_key_id(provided, &state.config.api_keys) else {
        tracing::warn!(
            key_fingerprint = %fingerprint(provided),
            path = %request.uri().path(),
            "Rejected unknown API key"
        );
        return Err(AppError::InvalidApiKey);
    };

    tracing::debug!(auth_id = %id, "API key accepted");
    let id = ApiKeyId(id.to_string());
    request.extensions_mut().insert(id);
    Ok(next.run(request).await)
}

/// Streaming upgrade authentication middleware
///
/// Token extraction priority (for browser/WebSocket compatibility):
/// 1. Authorization header: `Authorization: Bearer <token>`
/// 2. Query parameter: `?token=<token>`
///
/// The token signature and expiry are verified offline. The session it names
/// must still exist and not be terminated. Any failure answers 401 and the
/// upgrade never happens.
pub async fn session_auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let token = extract_bearer_token(request.headers(), request.uri())?;

    let claims = state.tokens.verify(&token).inspect_err(|e| {
        tracing::warn!(
            token_fingerprint = %fingerprint(&token),
            "Session token rejected: {}",
            e
        );
    })?;

    if !state.sessions.is_live(claims.session_id()) {
        tracing::warn!(
            session_id = %claims.session_id(),
            "Stream upgrade for unknown or terminated session"
        );
        return Err(AuthError::SessionUnavailable(claims.sub));
    }

    tracing::debug!(session_id = %claims.session_id(), "Session token verified");
    request.extensions_mut().insert(StreamAuth { claims });
    Ok(next.run(request).await)
}
