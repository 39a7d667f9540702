//! Streaming avatar session WebSocket
//!
//! This module provides the `/ws` endpoint that carries one avatar session:
//! - `init` binds the connection to the session named by its bearer token
//! - `voice`, `voice_end` and `voice_interrupt` drive the audio pipeline
//! - `heartbeat` keeps the session alive and is acknowledged
//! - `special` passes instructions through to the rendering engine
//!
//! # Protocol Flow
//!
//! 1. Client obtains a session token from `POST /session/start`
//! 2. Client connects with `Authorization: Bearer <token>`
//! 3. Client sends `init`; server replies `initialized`
//! 4. Client streams commands until it disconnects, the session is stopped,
//!    or the idle timeout fires
//!
//! # Example Messages
//!
//! ```json
//! {"command": "voice", "audio": "AAEC...", "sampleRate": 24000, "encoding": "PCM16", "event_id": "e1"}
//! {"command": "voice_end", "event_id": "e2"}
//! {"command": "heartbeat", "event_id": "h1", "timestamp": 1700000000}
//! ```

mod handler;
pub mod messages;
mod state;

pub use handler::stream_handler;
pub use messages::{ErrorCode, IncomingCommand, OutgoingMessage};
