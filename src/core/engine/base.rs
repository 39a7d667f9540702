//! Base traits and types for the downstream avatar rendering engine.
//!
//! The gateway never renders anything itself. Each initialized streaming
//! connection opens one [`RenderSink`] on the configured [`AvatarEngine`] and
//! forwards decoded audio, end-of-utterance, cancellation and out-of-band
//! instructions to it, strictly in the order they arrived on the socket.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::session::SessionConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors reported by a rendering engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine could not open a render session
    #[error("Failed to open render session: {0}")]
    OpenFailed(String),

    /// The engine rejected a forwarded item
    #[error("Engine rejected input: {0}")]
    Rejected(String),

    /// The render session is already closed
    #[error("Render session closed")]
    Closed,

    /// Local I/O failure (capture files, pipes)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

// =============================================================================
// Audio Types
// =============================================================================

/// Encoding of a voice chunk as declared by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioEncoding {
    /// Signed 16-bit little-endian PCM
    #[serde(rename = "PCM16")]
    Pcm16,
    /// Unsigned 8-bit PCM
    #[serde(rename = "PCM8")]
    Pcm8,
    /// Opus packets
    #[serde(rename = "OPUS")]
    Opus,
}

impl fmt::Display for AudioEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioEncoding::Pcm16 => write!(f, "PCM16"),
            AudioEncoding::Pcm8 => write!(f, "PCM8"),
            AudioEncoding::Opus => write!(f, "OPUS"),
        }
    }
}

/// One decoded audio chunk, forwarded byte-exact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// Raw bytes after base64 decoding
    pub data: Bytes,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Declared encoding
    pub encoding: AudioEncoding,
    /// Event id of the `voice` command that carried this chunk
    pub event_id: String,
    /// Per-connection sequence number, starting at 0
    pub sequence: u64,
}

/// Everything the engine needs to start rendering for a session.
#[derive(Debug, Clone)]
pub struct RenderSessionConfig {
    pub session_id: String,
    /// Configuration echoed by the client in `init`
    pub config: SessionConfig,
}

// =============================================================================
// Traits
// =============================================================================

/// Factory for per-connection render sinks.
#[async_trait]
pub trait AvatarEngine: Send + Sync {
    /// Short identifier used in logs
    fn name(&self) -> &'static str;

    /// Open a render session for an initialized connection.
    async fn open(&self, session: &RenderSessionConfig) -> EngineResult<Box<dyn RenderSink>>;
}

/// Ordered input channel into one render session.
///
/// Calls are made sequentially by the connection task that owns the sink.
#[async_trait]
pub trait RenderSink: Send {
    /// Forward one decoded audio frame.
    async fn push_audio(&mut self, frame: AudioFrame) -> EngineResult<()>;

    /// All audio for the current utterance has been forwarded.
    async fn end_utterance(&mut self) -> EngineResult<()>;

    /// Stop the current utterance. Frames already forwarded cannot be
    /// recalled; the engine is responsible for halting their playback.
    async fn cancel_utterance(&mut self) -> EngineResult<()>;

    /// Out-of-band instruction from a `special` command.
    async fn special(&mut self, content: &serde_json::Value) -> EngineResult<()>;

    /// Release the render session. Called once when the connection ends.
    async fn close(&mut self) -> EngineResult<()>;
}
