//! Session model and registry
//!
//! A session is provisioned by the control plane (`POST /session/start`),
//! activated by the `init` command of exactly one streaming connection, and
//! terminated by an explicit stop, idle timeout, or loss of that connection.

mod config;
pub mod store;

pub use config::{
    AgoraSettings, DEFAULT_IDLE_TIMEOUT_SECONDS, FieldError, MAX_IDLE_TIMEOUT_SECONDS, Quality,
    SessionConfig, VideoEncoding, reject_unknown_fields,
};
pub use store::{ActivateError, SessionStore, StopOutcome};

use serde::Serialize;
use std::fmt;
use time::OffsetDateTime;

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Pending,
    Active,
    Terminated,
}

/// Why a session reached `TERMINATED`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Explicit `DELETE /session/stop`
    Stopped,
    /// No inbound message within the idle window
    IdleTimeout,
    /// The bound streaming connection went away
    ConnectionClosed,
    /// The bound connection broke the command protocol
    ProtocolViolation,
    /// Too many consecutive undecodable audio chunks
    DecodeFailures,
    /// The rendering engine refused the session or its input
    EngineFailure,
    /// Never connected before its token expired
    Expired,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminationReason::Stopped => "stopped",
            TerminationReason::IdleTimeout => "idle_timeout",
            TerminationReason::ConnectionClosed => "connection_closed",
            TerminationReason::ProtocolViolation => "protocol_violation",
            TerminationReason::DecodeFailures => "decode_failures",
            TerminationReason::EngineFailure => "engine_failure",
            TerminationReason::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Snapshot of a session record
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub token: String,
    pub config: SessionConfig,
    pub created_at: OffsetDateTime,
    pub status: SessionStatus,
    pub terminated_at: Option<OffsetDateTime>,
    pub termination_reason: Option<TerminationReason>,
}

impl Session {
    pub fn new(id: String, token: String, config: SessionConfig) -> Self {
        Self {
            id,
            token,
            config,
            created_at: OffsetDateTime::now_utc(),
            status: SessionStatus::Pending,
            terminated_at: None,
            termination_reason: None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.status == SessionStatus::Terminated
    }
}
