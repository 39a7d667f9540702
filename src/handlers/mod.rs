//! HTTP and WebSocket request handlers
//!
//! - `api` - Health check endpoint
//! - `session` - Session start and stop (control plane)
//! - `stream` - Streaming avatar session WebSocket

pub mod api;
pub mod session;
pub mod stream;

// Re-export commonly used handlers for convenient access
pub use session::{start_session, stop_session};
pub use stream::stream_handler;
