//! Audio ingest pipeline
//!
//! Turns `voice` commands into [`AudioFrame`]s and hands them to the render
//! sink in arrival order. With `batch_bytes == 0` every frame is forwarded as
//! soon as it is decoded. Otherwise frames are held until the buffered byte
//! count reaches `batch_bytes` or the oldest buffered frame is older than
//! `max_buffer_delay`, whichever comes first. Buffering never reorders.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::engine::{AudioEncoding, AudioFrame, EngineError, RenderSink};

/// Accepted sample-rate range, in Hz
pub const MIN_SAMPLE_RATE: u32 = 8_000;
pub const MAX_SAMPLE_RATE: u32 = 48_000;

/// Tuning for one connection's ingest pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestSettings {
    /// Forward once this many bytes are buffered; 0 forwards immediately
    pub batch_bytes: usize,
    /// Upper bound on how long a frame may sit in the buffer
    pub max_buffer_delay: Duration,
    /// Consecutive decode failures that make the connection fatal
    pub max_decode_failures: u32,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            batch_bytes: 0,
            max_buffer_delay: Duration::from_millis(100),
            max_decode_failures: 5,
        }
    }
}

/// A single `voice` chunk that could not be accepted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("audio is not valid base64: {0}")]
    InvalidBase64(String),

    #[error("PCM16 audio must contain an even number of bytes, got {0}")]
    OddLength(usize),

    #[error("sample rate {0} Hz is outside {MIN_SAMPLE_RATE}-{MAX_SAMPLE_RATE} Hz")]
    SampleRateOutOfRange(u32),

    #[error(
        "audio format changed within an utterance: {expected_encoding}@{expected_rate} Hz, got {encoding}@{rate} Hz"
    )]
    FormatChanged {
        expected_encoding: AudioEncoding,
        expected_rate: u32,
        encoding: AudioEncoding,
        rate: u32,
    },
}

/// Errors from the ingest pipeline.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Per-message failure; the connection survives
    #[error(transparent)]
    Decode(DecodeError),

    /// Consecutive decode failures reached the configured limit
    #[error("{count} consecutive audio chunks failed to decode: {last}")]
    TooManyDecodeFailures { count: u32, last: DecodeError },

    /// The render sink refused a forwarded item
    #[error("rendering engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Per-connection audio ingest state.
#[derive(Debug)]
pub struct AudioIngest {
    settings: IngestSettings,
    buffer: VecDeque<AudioFrame>,
    buffered_bytes: usize,
    oldest_buffered_at: Option<Instant>,
    /// Encoding and rate locked by the first frame of the current utterance
    utterance_format: Option<(AudioEncoding, u32)>,
    next_sequence: u64,
    consecutive_failures: u32,
}

impl AudioIngest {
    pub fn new(settings: IngestSettings) -> Self {
        Self {
            settings,
            buffer: VecDeque::new(),
            buffered_bytes: 0,
            oldest_buffered_at: None,
            utterance_format: None,
            next_sequence: 0,
            consecutive_failures: 0,
        }
    }

    /// When the buffer must be flushed at the latest, if it holds anything.
    pub fn flush_deadline(&self) -> Option<Instant> {
        self.oldest_buffered_at
            .map(|at| at + self.settings.max_buffer_delay)
    }

    /// Decode one chunk and forward or buffer it.
    pub async fn push_voice(
        &mut self,
        sink: &mut dyn RenderSink,
        event_id: &str,
        audio: &str,
        sample_rate: u32,
        encoding: AudioEncoding,
    ) -> Result<(), IngestError> {
        let data = match self.decode(audio, sample_rate, encoding) {
            Ok(data) => {
                self.consecutive_failures = 0;
                data
            }
            Err(err) => {
                self.consecutive_failures += 1;
                warn!(
                    event_id = %event_id,
                    consecutive_failures = self.consecutive_failures,
                    "Audio decode failed: {}",
                    err
                );
                if self.consecutive_failures >= self.settings.max_decode_failures {
                    return Err(IngestError::TooManyDecodeFailures {
                        count: self.consecutive_failures,
                        last: err,
                    });
                }
                return Err(IngestError::Decode(err));
            }
        };

        if data.is_empty() {
            debug!(event_id = %event_id, "Ignoring empty audio chunk");
            return Ok(());
        }

        self.utterance_format
            .get_or_insert((encoding, sample_rate));

        let frame = AudioFrame {
            data,
            sample_rate,
            encoding,
            event_id: event_id.to_string(),
            sequence: self.next_sequence,
        };
        self.next_sequence += 1;

        if self.settings.batch_bytes == 0 {
            sink.push_audio(frame).await?;
            return Ok(());
        }

        self.buffered_bytes += frame.data.len();
        self.buffer.push_back(frame);
        self.oldest_buffered_at.get_or_insert_with(Instant::now);

        if self.buffered_bytes >= self.settings.batch_bytes {
            self.flush(sink).await?;
        }
        Ok(())
    }

    /// Forward every buffered frame, oldest first.
    pub async fn flush(&mut self, sink: &mut dyn RenderSink) -> Result<usize, IngestError> {
        let count = self.buffer.len();
        while let Some(frame) = self.buffer.pop_front() {
            self.buffered_bytes -= frame.data.len();
            sink.push_audio(frame).await?;
        }
        self.oldest_buffered_at = None;
        Ok(count)
    }

    /// Flush, then signal end of utterance.
    pub async fn end_utterance(&mut self, sink: &mut dyn RenderSink) -> Result<(), IngestError> {
        self.flush(sink).await?;
        self.utterance_format = None;
        sink.end_utterance().await?;
        Ok(())
    }

    /// Drop everything not yet forwarded and signal cancellation.
    ///
    /// Returns the number of discarded frames.
    pub async fn interrupt(&mut self, sink: &mut dyn RenderSink) -> Result<usize, IngestError> {
        let discarded = self.discard();
        sink.cancel_utterance().await?;
        Ok(discarded)
    }

    /// Drop buffered frames without telling the sink.
    pub fn discard(&mut self) -> usize {
        let discarded = self.buffer.len();
        self.buffer.clear();
        self.buffered_bytes = 0;
        self.oldest_buffered_at = None;
        self.utterance_format = None;
        discarded
    }

    fn decode(
        &self,
        audio: &str,
        sample_rate: u32,
        encoding: AudioEncoding,
    ) -> Result<Bytes, DecodeError> {
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&sample_rate) {
            return Err(DecodeError::SampleRateOutOfRange(sample_rate));
        }

        if let Some((expected_encoding, expected_rate)) = self.utterance_format
            && (expected_encoding != encoding || expected_rate != sample_rate)
        {
            return Err(DecodeError::FormatChanged {
                expected_encoding,
                expected_rate,
                encoding,
                rate: sample_rate,
            });
        }

        let bytes = BASE64
            .decode(audio.as_bytes())
            .map_err(|e| DecodeError::InvalidBase64(e.to_string()))?;

        if encoding == AudioEncoding::Pcm16 && bytes.len() % 2 != 0 {
            return Err(DecodeError::OddLength(bytes.len()));
        }

        Ok(Bytes::from(bytes))
    }
}
