//! Connection limit middleware for WebSocket connections
//!
//! This module provides middleware to enforce connection limits:
//! - Global maximum WebSocket connections
//! - Per-IP connection limits
//!
//! # Example
//!
//! ```ignore
//! use axum::Router;
//! use avatar_gateway::middleware::connection_limit_middleware;
//!
//! let app = Router::new()
//!     .route("/ws", get(stream_handler))
//!     .layer(axum::middleware::from_fn_with_state(
//!         state.clone(),
//!         connection_limit_middleware,
//!     ));
//! ```

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::state::{AppState, ConnectionLimitError};

/// Extension type to carry the client IP through to the handler
#[derive(Clone, Debug)]
pub struct ClientIp(pub IpAddr);

/// Reserved WebSocket connection slot.
///
/// The slot is released when the last clone is dropped: either when the
/// streaming task ends, or together with the request if it never upgrades.
#[derive(Clone)]
pub struct ConnectionSlot(Arc<SlotGuard>);

struct SlotGuard {
    state: Arc<AppState>,
    ip: IpAddr,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.state.release_connection(self.ip);
        tracing::debug!(ip = %self.ip, "WebSocket connection slot released");
    }
}

/// Middleware that enforces connection limits for WebSocket connections.
///
/// This middleware:
/// 1. Returns 503 Service Unavailable if the global limit is reached
/// 2. Returns 429 Too Many Requests if the per-IP limit is reached
/// 3. Otherwise injects [`ClientIp`] and a [`ConnectionSlot`] for the handler
///
/// Only WebSocket upgrade requests (detected by the Upgrade header) are
/// counted. Other requests pass through untouched.
pub async fn connection_limit_middleware(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let is_ws_upgrade = request
        .headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    if !is_ws_upgrade {
        return next.run(request).await;
    }

    let client_ip = addr.ip();

    match state.try_acquire_connection(client_ip) {
        Ok(()) => {
            let slot = ConnectionSlot(Arc::new(SlotGuard {
                state: state.clone(),
                ip: client_ip,
            }));
            request.extensions_mut().insert(ClientIp(client_ip));
            request.extensions_mut().insert(slot);
            next.run(request).await
        }
        Err(ConnectionLimitError::GlobalLimitReached) => {
            tracing::warn!(
                ip = %client_ip,
                "Rejecting connection: global limit reached"
            );
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "Server at capacity. Please try again later.",
            )
                .into_response()
        }
        Err(ConnectionLimitError::PerIpLimitReached) => {
            tracing::warn!(
                ip = %client_ip,
                "Rejecting connection: per-IP limit reached"
            );
            (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many connections from your IP address.",
            )
                .into_response()
        }
    }
}
