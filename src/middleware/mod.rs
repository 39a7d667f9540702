pub mod auth;
pub mod connection_limit;

// Re-export middleware functions
pub use auth::{ApiKeyId, StreamAuth, api_key_middleware, session_auth_middleware};
pub use connection_limit::{ClientIp, ConnectionSlot, connection_limit_middleware};
