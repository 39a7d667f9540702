use axum::{Router, middleware, routing::get};
use std::sync::Arc;

use crate::handlers::api::health_check;
use crate::middleware::{
    api_key_middleware, connection_limit_middleware, session_auth_middleware,
};
use crate::state::AppState;

pub mod session;
pub mod stream;

/// Assemble every route with its authentication layers.
///
/// Layer order for the stream route (outer to inner):
/// connection_limit -> session_auth -> handler, so a rejected token never
/// holds a connection slot past its request.
///
/// Server-wide layers (CORS, rate limiting, security headers) are added by
/// the binary.
pub fn create_app(state: Arc<AppState>) -> Router {
    let session_routes = session::create_session_router().layer(
        middleware::from_fn_with_state(state.clone(), api_key_middleware),
    );

    let stream_routes = stream::create_stream_router()
        .layer(middleware::from_fn_with_state(
            state.clone(),
            session_auth_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            connection_limit_middleware,
        ));

    let public_routes = Router::new().route("/", get(health_check));

    public_routes
        .merge(session_routes)
        .merge(stream_routes)
        .with_state(state)
}
