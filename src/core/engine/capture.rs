//! WAV capture of forwarded utterances.
//!
//! Every PCM frame handed to the wrapped engine is also kept in memory until
//! the utterance ends. On `end_utterance` the collected samples are written
//! to `{dir}/{session_id}-{n}.wav` on the blocking pool. Cancelled utterances
//! are dropped without writing. Opus audio is forwarded but never captured.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::base::{
    AudioEncoding, AudioFrame, AvatarEngine, EngineError, EngineResult, RenderSessionConfig,
    RenderSink,
};

/// Engine decorator that tees PCM utterances to WAV files.
pub struct CaptureEngine<E> {
    inner: E,
    dir: PathBuf,
}

impl<E: AvatarEngine> CaptureEngine<E> {
    pub fn new(inner: E, dir: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            dir: dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl<E: AvatarEngine> AvatarEngine for CaptureEngine<E> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn open(&self, session: &RenderSessionConfig) -> EngineResult<Box<dyn RenderSink>> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let inner = self.inner.open(session).await?;
        Ok(Box::new(CaptureSink {
            inner,
            dir: self.dir.clone(),
            session_id: session.session_id.clone(),
            utterance: Utterance::default(),
            written: 0,
        }))
    }
}

#[derive(Default)]
struct Utterance {
    format: Option<(AudioEncoding, u32)>,
    chunks: Vec<Bytes>,
}

impl Utterance {
    fn take(&mut self) -> Utterance {
        std::mem::take(self)
    }
}

struct CaptureSink {
    inner: Box<dyn RenderSink>,
    dir: PathBuf,
    session_id: String,
    utterance: Utterance,
    written: u32,
}

#[async_trait]
impl RenderSink for CaptureSink {
    async fn push_audio(&mut self, frame: AudioFrame) -> EngineResult<()> {
        if frame.encoding != AudioEncoding::Opus {
            self.utterance
                .format
                .get_or_insert((frame.encoding, frame.sample_rate));
            self.utterance.chunks.push(frame.data.clone());
        }
        self.inner.push_audio(frame).await
    }

    async fn end_utterance(&mut self) -> EngineResult<()> {
        self.inner.end_utterance().await?;

        let utterance = self.utterance.take();
        let Some((encoding, sample_rate)) = utterance.format else {
            return Ok(());
        };

        self.written += 1;
        let path = self
            .dir
            .join(format!("{}-{}.wav", self.session_id, self.written));
        let chunks = utterance.chunks;
        let target = path.clone();

        tokio::task::spawn_blocking(move || write_wav(&target, encoding, sample_rate, &chunks))
            .await
            .map_err(|e| EngineError::Rejected(format!("capture task failed: {e}")))??;

        info!(
            session_id = %self.session_id,
            path = %path.display(),
            "Utterance captured"
        );
        Ok(())
    }

    async fn cancel_utterance(&mut self) -> EngineResult<()> {
        self.utterance.take();
        self.inner.cancel_utterance().await
    }

    async fn special(&mut self, content: &serde_json::Value) -> EngineResult<()> {
        self.inner.special(content).await
    }

    async fn close(&mut self) -> EngineResult<()> {
        if !self.utterance.take().chunks.is_empty() {
            warn!(session_id = %self.session_id, "Discarding unfinished utterance on close");
        }
        self.inner.close().await
    }
}

fn write_wav(
    path: &Path,
    encoding: AudioEncoding,
    sample_rate: u32,
    chunks: &[Bytes],
) -> EngineResult<()> {
    let bits_per_sample = match encoding {
        AudioEncoding::Pcm16 => 16,
        AudioEncoding::Pcm8 => 8,
        AudioEncoding::Opus => return Ok(()),
    };
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample,
        sample_format: hound::SampleFormat::Int,
    };

    let mut writer = hound::WavWriter::create(path, spec).map_err(wav_error)?;
    for chunk in chunks {
        match encoding {
            AudioEncoding::Pcm16 => {
                for pair in chunk.chunks_exact(2) {
                    writer
                        .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                        .map_err(wav_error)?;
                }
            }
            // Unsigned on the wire, hound takes signed 8-bit samples
            AudioEncoding::Pcm8 => {
                for &byte in chunk.iter() {
                    writer
                        .write_sample((byte as i16 - 128) as i8)
                        .map_err(wav_error)?;
                }
            }
            AudioEncoding::Opus => {}
        }
    }
    writer.finalize().map_err(wav_error)
}

fn wav_error(err: hound::Error) -> EngineError {
    match err {
        hound::Error::IoError(io) => EngineError::Io(io),
        other => EngineError::Rejected(other.to_string()),
    }
}
