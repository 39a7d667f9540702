//! Session control plane: `POST /session/start` and `DELETE /session/stop`
//!
//! Both handlers sit behind `api_key_middleware`, so credentials are checked
//! before the body is looked at. Bodies are taken as raw bytes and parsed
//! here so malformed JSON is reported as a validation error in the usual
//! error shape.

use axum::{
    Extension, Json,
    body::Bytes,
    extract::State,
};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::errors::{AppError, AppResult};
use crate::middleware::ApiKeyId;
use crate::session::{SessionConfig, StopOutcome};
use crate::state::AppState;

/// Successful `POST /session/start` body
#[derive(Debug, Serialize)]
pub struct StartSessionResponse {
    pub session_id: String,
    pub websocket_address: String,
    pub session_token: String,
}

/// Successful `DELETE /session/stop` body
#[derive(Debug, Serialize)]
pub struct StopSessionResponse {
    pub status: &'static str,
    pub message: String,
}

fn json_object(body: &Bytes) -> AppResult<Map<String, Value>> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(obj)) => Ok(obj),
        Ok(_) => Err(AppError::validation(
            "body",
            "Request body must be a JSON object",
        )),
        Err(e) => Err(AppError::validation(
            "body",
            format!("Request body is not valid JSON: {e}"),
        )),
    }
}

fn required_string<'a>(obj: &'a Map<String, Value>, field: &str) -> AppResult<&'a str> {
    match obj.get(field) {
        Some(Value::String(value)) if !value.trim().is_empty() => Ok(value),
        Some(Value::String(_)) | Some(Value::Null) | None => Err(AppError::missing_field(field)),
        Some(_) => Err(AppError::validation(
            field,
            format!("{field} must be a string"),
        )),
    }
}

/// Provision a new avatar session.
///
/// Returns the session id, the streaming address and a bearer token bound
/// to the session. The session is PENDING until a streaming connection
/// sends `init`.
pub async fn start_session(
    State(state): State<Arc<AppState>>,
    Extension(ApiKeyId(auth_id)): Extension<ApiKeyId>,
    body: Bytes,
) -> AppResult<Json<StartSessionResponse>> {
    let obj = json_object(&body)?;
    let config = SessionConfig::from_json(&obj, state.config.default_idle_timeout_seconds)?;

    let session = state
        .sessions
        .create(config, |id| state.tokens.mint(id))
        .map_err(|e| AppError::Internal(format!("failed to mint session token: {e}")))?;

    info!(
        session_id = %session.id,
        auth_id = %auth_id,
        avatar_id = %session.config.avatar_id,
        quality = %session.config.quality,
        idle_timeout_secs = session.config.activity_idle_timeout,
        "Session started"
    );

    Ok(Json(StartSessionResponse {
        session_id: session.id,
        websocket_address: state.config.stream_url(),
        session_token: session.token,
    }))
}

/// Stop a session and close its streaming connection, if any.
pub async fn stop_session(
    State(state): State<Arc<AppState>>,
    Extension(ApiKeyId(auth_id)): Extension<ApiKeyId>,
    body: Bytes,
) -> AppResult<Json<StopSessionResponse>> {
    let obj = json_object(&body)?;
    let session_id = required_string(&obj, "session_id")?;
    let session_token = required_string(&obj, "session_token")?;

    match state.sessions.stop(session_id, session_token) {
        StopOutcome::Terminated(session) => {
            info!(
                session_id = %session.id,
                auth_id = %auth_id,
                "Session stopped"
            );
            Ok(Json(StopSessionResponse {
                status: "success",
                message: format!("Session {} stopped", session.id),
            }))
        }
        StopOutcome::NotFound => Err(AppError::SessionNotFound(session_id.to_string())),
        StopOutcome::TokenMismatch => {
            warn!(
                session_id = %session_id,
                auth_id = %auth_id,
                "Stop rejected: session token mismatch"
            );
            Err(AppError::InvalidSessionToken)
        }
    }
}
