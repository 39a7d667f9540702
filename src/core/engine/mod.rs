//! Avatar rendering engine seam.
//!
//! The rendering engine is an external collaborator. This module defines the
//! contract the streaming handler drives ([`AvatarEngine`] / [`RenderSink`])
//! and ships two implementations:
//!
//! - [`LoggingEngine`] - accepts everything and logs it; the default when no
//!   real engine is wired in
//! - [`CaptureEngine`] - wraps another engine and additionally writes each
//!   completed PCM utterance to a WAV file
//!
//! # Example
//!
//! ```rust,ignore
//! use avatar_gateway::core::engine::{AvatarEngine, CaptureEngine, LoggingEngine};
//! use std::sync::Arc;
//!
//! let engine: Arc<dyn AvatarEngine> =
//!     Arc::new(CaptureEngine::new(LoggingEngine, "/tmp/captures"));
//! ```

mod base;
mod capture;

pub use base::{
    AudioEncoding, AudioFrame, AvatarEngine, EngineError, EngineResult, RenderSessionConfig,
    RenderSink,
};
pub use capture::CaptureEngine;

use async_trait::async_trait;
use tracing::{debug, info};

/// Engine that accepts every input and only logs it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEngine;

#[async_trait]
impl AvatarEngine for LoggingEngine {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn open(&self, session: &RenderSessionConfig) -> EngineResult<Box<dyn RenderSink>> {
        info!(
            session_id = %session.session_id,
            avatar_id = %session.config.avatar_id,
            quality = %session.config.quality,
            video_encoding = %session.config.video_encoding,
            "Render session opened"
        );
        Ok(Box::new(LoggingSink {
            session_id: session.session_id.clone(),
            frames: 0,
            bytes: 0,
        }))
    }
}

struct LoggingSink {
    session_id: String,
    frames: u64,
    bytes: u64,
}

#[async_trait]
impl RenderSink for LoggingSink {
    async fn push_audio(&mut self, frame: AudioFrame) -> EngineResult<()> {
        self.frames += 1;
        self.bytes += frame.data.len() as u64;
        debug!(
            session_id = %self.session_id,
            event_id = %frame.event_id,
            sequence = frame.sequence,
            bytes = frame.data.len(),
            sample_rate = frame.sample_rate,
            encoding = %frame.encoding,
            "Audio frame forwarded"
        );
        Ok(())
    }

    async fn end_utterance(&mut self) -> EngineResult<()> {
        debug!(session_id = %self.session_id, "Utterance ended");
        Ok(())
    }

    async fn cancel_utterance(&mut self) -> EngineResult<()> {
        debug!(session_id = %self.session_id, "Utterance cancelled");
        Ok(())
    }

    async fn special(&mut self, content: &serde_json::Value) -> EngineResult<()> {
        debug!(session_id = %self.session_id, content = %content, "Special instruction");
        Ok(())
    }

    async fn close(&mut self) -> EngineResult<()> {
        info!(
            session_id = %self.session_id,
            frames = self.frames,
            bytes = self.bytes,
            "Render session closed"
        );
        Ok(())
    }
}
