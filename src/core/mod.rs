pub mod engine;
pub mod heartbeat;
pub mod ingest;

pub use engine::{
    AudioEncoding, AudioFrame, AvatarEngine, CaptureEngine, EngineError, EngineResult,
    LoggingEngine, RenderSessionConfig, RenderSink,
};
pub use heartbeat::HeartbeatMonitor;
pub use ingest::{AudioIngest, DecodeError, IngestError, IngestSettings};
