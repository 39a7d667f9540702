//! Streaming WebSocket route configuration

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::stream::stream_handler;
use crate::state::AppState;
use std::sync::Arc;

/// Create the streaming WebSocket router
///
/// # Endpoint
///
/// `GET /ws` - WebSocket upgrade for one avatar session
///
/// # Authentication
///
/// `Authorization: Bearer <session_token>` as returned by
/// `POST /session/start`. Browser clients that cannot set headers may pass
/// `?token=<session_token>` instead.
///
/// # Example
///
/// ```json
/// // Client sends init
/// {"command": "init", "session_id": "...", "avatar_id": "a1", "quality": "high", ...}
///
/// // Server responds
/// {"command": "initialized", "session_id": "..."}
/// ```
pub fn create_stream_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ws", get(stream_handler))
        .layer(TraceLayer::new_for_http())
}
