use axum::{
    Router,
    routing::{delete, post},
};
use tower_http::trace::TraceLayer;

use crate::handlers::session;
use crate::state::AppState;
use std::sync::Arc;

/// Create the session control-plane router
///
/// Note: `api_key_middleware` is applied by the caller once state is available
pub fn create_session_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/session/start", post(session::start_session))
        .route("/session/stop", delete(session::stop_session))
        .layer(TraceLayer::new_for_http())
}
