//! Per-connection streaming state machine
//!
//! [`StreamConnection`] owns everything one WebSocket connection needs and is
//! driven by the socket loop in `handler.rs`: text frames, binary frames and
//! timer expiry each go through one method that returns a [`Flow`]. Replies
//! are queued on the writer channel in the order they are produced.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::core::{
    AudioIngest, HeartbeatMonitor, IngestError, RenderSessionConfig, RenderSink,
};
use crate::session::TerminationReason;
use crate::state::AppState;

use super::messages::{
    CLOSE_NORMAL, CLOSE_POLICY_VIOLATION, CommandError, ErrorCode, IncomingCommand, InitCommand,
    MessageRoute, OutgoingMessage,
};

/// Close code for an engine failure (RFC 6455 "internal error")
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
/// Close code when the server goes away
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// How many recent event ids are remembered for duplicate detection
const RECENT_EVENT_WINDOW: usize = 256;

/// Lifecycle of one streaming connection
pub enum ConnectionState {
    /// Upgraded, waiting for `init` until `deadline`
    AwaitingInit { deadline: Instant },
    /// Bound to its session and forwarding to the engine
    Initialized(Box<ActiveStream>),
    Closed,
}

/// Resources of an initialized connection
pub struct ActiveStream {
    pub sink: Box<dyn RenderSink>,
    pub ingest: AudioIngest,
    pub heartbeat: HeartbeatMonitor,
    pub recent_events: RecentEvents,
}

/// What the socket loop should do after an input was handled
#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close(Shutdown),
}

/// How a connection ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shutdown {
    pub code: u16,
    pub reason: String,
    /// Transition applied to the session, if any
    pub termination: Option<TerminationReason>,
    /// False when the peer is already gone
    pub send_close: bool,
}

impl Shutdown {
    fn new(code: u16, reason: impl Into<String>, termination: Option<TerminationReason>) -> Self {
        Self {
            code,
            reason: reason.into(),
            termination,
            send_close: true,
        }
    }

    /// The peer closed or the transport failed.
    pub fn disconnected(termination: Option<TerminationReason>) -> Self {
        Self {
            code: CLOSE_NORMAL,
            reason: String::new(),
            termination,
            send_close: false,
        }
    }

    /// The session was terminated elsewhere (stop request or another path).
    pub fn session_ended(reason: Option<TerminationReason>) -> Self {
        let reason = match reason {
            Some(reason) => format!("session terminated: {reason}"),
            None => "session terminated".to_string(),
        };
        Self::new(CLOSE_NORMAL, reason, None)
    }

    pub fn going_away(termination: Option<TerminationReason>) -> Self {
        Self::new(CLOSE_GOING_AWAY, "server shutting down", termination)
    }
}

/// Bounded memory of recently seen event ids.
#[derive(Debug)]
pub struct RecentEvents {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl RecentEvents {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Remember `event_id`. Returns false if it is already in the window.
    pub fn insert(&mut self, event_id: &str) -> bool {
        if self.seen.contains(event_id) {
            return false;
        }
        if self.order.len() == self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.seen.remove(&oldest);
        }
        self.order.push_back(event_id.to_string());
        self.seen.insert(event_id.to_string());
        true
    }
}

pub struct StreamConnection {
    app: Arc<AppState>,
    /// Session named by the bearer token
    session_id: String,
    state: ConnectionState,
    out: mpsc::Sender<MessageRoute>,
}

impl StreamConnection {
    pub fn new(app: Arc<AppState>, session_id: String, out: mpsc::Sender<MessageRoute>) -> Self {
        let deadline = Instant::now() + app.config.init_timeout();
        Self {
            app,
            session_id,
            state: ConnectionState::AwaitingInit { deadline },
            out,
        }
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.state, ConnectionState::Initialized(_))
    }

    /// Termination applied when the peer goes away.
    ///
    /// A connection that never initialized leaves its session PENDING so
    /// the client can reconnect.
    pub fn disconnect_reason(&self) -> Option<TerminationReason> {
        self.is_initialized()
            .then_some(TerminationReason::ConnectionClosed)
    }

    /// Earliest instant at which [`on_deadline`](Self::on_deadline) has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        match &self.state {
            ConnectionState::AwaitingInit { deadline } => Some(*deadline),
            ConnectionState::Initialized(active) => {
                match (active.heartbeat.deadline(), active.ingest.flush_deadline()) {
                    (Some(idle), Some(flush)) => Some(idle.min(flush)),
                    (idle, flush) => idle.or(flush),
                }
            }
            ConnectionState::Closed => None,
        }
    }

    /// Handle one text frame.
    pub async fn on_text(&mut self, text: &str) -> Flow {
        let default_idle = self.app.config.default_idle_timeout_seconds;
        match &mut self.state {
            ConnectionState::AwaitingInit { .. } => {
                let parsed = IncomingCommand::parse(text, default_idle);
                self.before_init(parsed).await
            }
            ConnectionState::Initialized(active) => {
                active.heartbeat.touch();
                let parsed = IncomingCommand::parse(text, default_idle);
                self.active(parsed).await
            }
            ConnectionState::Closed => Flow::Continue,
        }
    }

    /// Handle one binary frame. Audio must arrive inside `voice` commands.
    pub async fn on_binary(&mut self, len: usize) -> Flow {
        match &mut self.state {
            ConnectionState::AwaitingInit { .. } => {
                violation(
                    &self.out,
                    ErrorCode::NotInitialized,
                    "Binary frame received before init",
                    None,
                    false,
                )
                .await
            }
            ConnectionState::Initialized(active) => {
                active.heartbeat.touch();
                debug!(session_id = %self.session_id, bytes = len, "Rejecting binary frame");
                send(
                    &self.out,
                    OutgoingMessage::error(
                        ErrorCode::UnsupportedFrame,
                        "Binary frames are not supported, send audio in a voice command",
                        None,
                    ),
                )
                .await;
                Flow::Continue
            }
            ConnectionState::Closed => Flow::Continue,
        }
    }

    /// Timer expiry: init timeout, idle timeout, or a due buffer flush.
    pub async fn on_deadline(&mut self) -> Flow {
        let now = Instant::now();
        match &mut self.state {
            ConnectionState::AwaitingInit { deadline } => {
                if now < *deadline {
                    return Flow::Continue;
                }
                warn!(session_id = %self.session_id, "No init received in time, closing connection");
                send(
                    &self.out,
                    OutgoingMessage::error(
                        ErrorCode::InitTimeout,
                        "init was not received in time",
                        None,
                    ),
                )
                .await;
                Flow::Close(Shutdown::new(CLOSE_POLICY_VIOLATION, "init timeout", None))
            }
            ConnectionState::Initialized(active) => {
                if active.heartbeat.is_expired() {
                    info!(
                        session_id = %self.session_id,
                        idle_secs = active.heartbeat.last_activity().elapsed().as_secs(),
                        "Session idle timeout reached"
                    );
                    send(
                        &self.out,
                        OutgoingMessage::error(
                            ErrorCode::IdleTimeout,
                            "Session closed due to inactivity",
                            None,
                        ),
                    )
                    .await;
                    return Flow::Close(Shutdown::new(
                        CLOSE_NORMAL,
                        "idle timeout",
                        Some(TerminationReason::IdleTimeout),
                    ));
                }

                if active.ingest.flush_deadline().is_some_and(|at| now >= at) {
                    let ActiveStream { sink, ingest, .. } = &mut **active;
                    match ingest.flush(sink.as_mut()).await {
                        Ok(count) => {
                            debug!(session_id = %self.session_id, frames = count, "Flushed buffered audio")
                        }
                        Err(err) => return ingest_failure(&self.out, err, None).await,
                    }
                }
                Flow::Continue
            }
            ConnectionState::Closed => Flow::Continue,
        }
    }

    async fn before_init(&mut self, parsed: Result<IncomingCommand, CommandError>) -> Flow {
        match parsed {
            Ok(IncomingCommand::Init(init)) => self.initialize(init).await,
            Ok(command) => {
                let message = format!("'{}' received before init", command.name());
                violation(
                    &self.out,
                    ErrorCode::NotInitialized,
                    message,
                    command.event_id(),
                    false,
                )
                .await
            }
            Err(err) if err.is_structural() => {
                violation(&self.out, err.error_code(), err.to_string(), None, false).await
            }
            Err(err) if err.command() == Some("init") => {
                // A malformed init can be corrected and resent
                debug!(session_id = %self.session_id, "Rejected init: {}", err);
                send(
                    &self.out,
                    OutgoingMessage::error(err.error_code(), err.to_string(), err.event_id()),
                )
                .await;
                Flow::Continue
            }
            Err(err) => {
                violation(
                    &self.out,
                    ErrorCode::NotInitialized,
                    format!("{err} received before init"),
                    err.event_id(),
                    false,
                )
                .await
            }
        }
    }

    async fn initialize(&mut self, init: InitCommand) -> Flow {
        if init.session_id != self.session_id {
            warn!(
                session_id = %self.session_id,
                claimed = %init.session_id,
                "init names a different session than the token"
            );
            return violation(
                &self.out,
                ErrorCode::SessionMismatch,
                "session_id does not match the session token",
                None,
                false,
            )
            .await;
        }

        let (session, _) = match self.app.sessions.activate(&self.session_id) {
            Ok(bound) => bound,
            Err(err) => {
                warn!(session_id = %self.session_id, "Cannot bind connection: {}", err);
                return violation(
                    &self.out,
                    ErrorCode::SessionUnavailable,
                    format!("Cannot initialize: {err}"),
                    None,
                    false,
                )
                .await;
            }
        };

        if init.config != session.config {
            debug!(
                session_id = %self.session_id,
                "init configuration differs from the one supplied at start"
            );
        }

        let render = RenderSessionConfig {
            session_id: session.id.clone(),
            config: init.config,
        };
        let sink = match self.app.engine.open(&render).await {
            Ok(sink) => sink,
            Err(err) => {
                error!(
                    session_id = %self.session_id,
                    engine = self.app.engine.name(),
                    "Failed to open render session: {}",
                    err
                );
                send(
                    &self.out,
                    OutgoingMessage::error(ErrorCode::EngineError, err.to_string(), None),
                )
                .await;
                return Flow::Close(Shutdown::new(
                    CLOSE_INTERNAL_ERROR,
                    "engine unavailable",
                    Some(TerminationReason::EngineFailure),
                ));
            }
        };

        // The idle window comes from the stored configuration, not the echo
        let heartbeat = HeartbeatMonitor::new(session.config.idle_timeout());
        info!(
            session_id = %self.session_id,
            avatar_id = %render.config.avatar_id,
            quality = %render.config.quality,
            video_encoding = %render.config.video_encoding,
            channel = %render.config.agora_settings.channel,
            idle_timeout_secs = session.config.activity_idle_timeout,
            engine = self.app.engine.name(),
            "Session initialized"
        );

        self.state = ConnectionState::Initialized(Box::new(ActiveStream {
            sink,
            ingest: AudioIngest::new(self.app.config.ingest_settings()),
            heartbeat,
            recent_events: RecentEvents::new(RECENT_EVENT_WINDOW),
        }));

        send(
            &self.out,
            OutgoingMessage::Initialized {
                session_id: self.session_id.clone(),
            },
        )
        .await;
        Flow::Continue
    }

    async fn active(&mut self, parsed: Result<IncomingCommand, CommandError>) -> Flow {
        let ConnectionState::Initialized(active) = &mut self.state else {
            return Flow::Continue;
        };

        let command = match parsed {
            Ok(command) => command,
            Err(err) if err.is_structural() => {
                return violation(&self.out, err.error_code(), err.to_string(), None, true).await;
            }
            Err(err) => {
                debug!(session_id = %self.session_id, "Rejected command: {}", err);
                send(
                    &self.out,
                    OutgoingMessage::error(err.error_code(), err.to_string(), err.event_id()),
                )
                .await;
                return Flow::Continue;
            }
        };

        if let Some(event_id) = command.event_id()
            && !active.recent_events.insert(event_id)
        {
            warn!(
                session_id = %self.session_id,
                event_id = %event_id,
                command = command.name(),
                "Duplicate event_id, processing anyway"
            );
        }

        let ActiveStream {
            sink,
            ingest,
            ..
        } = &mut **active;

        match command {
            IncomingCommand::Init(_) => {
                violation(
                    &self.out,
                    ErrorCode::AlreadyInitialized,
                    "Session is already initialized",
                    None,
                    true,
                )
                .await
            }
            IncomingCommand::Voice(voice) => {
                match ingest
                    .push_voice(
                        sink.as_mut(),
                        &voice.event_id,
                        &voice.audio,
                        voice.sample_rate,
                        voice.encoding,
                    )
                    .await
                {
                    Ok(()) => Flow::Continue,
                    Err(err) => ingest_failure(&self.out, err, Some(&voice.event_id)).await,
                }
            }
            IncomingCommand::VoiceEnd(end) => match ingest.end_utterance(sink.as_mut()).await {
                Ok(()) => {
                    debug!(session_id = %self.session_id, event_id = %end.event_id, "Utterance ended");
                    Flow::Continue
                }
                Err(err) => ingest_failure(&self.out, err, Some(&end.event_id)).await,
            },
            IncomingCommand::VoiceInterrupt(interrupt) => {
                match ingest.interrupt(sink.as_mut()).await {
                    Ok(discarded) => {
                        info!(
                            session_id = %self.session_id,
                            event_id = %interrupt.event_id,
                            discarded_frames = discarded,
                            "Utterance interrupted"
                        );
                        Flow::Continue
                    }
                    Err(err) => ingest_failure(&self.out, err, Some(&interrupt.event_id)).await,
                }
            }
            IncomingCommand::Heartbeat(heartbeat) => {
                if self.app.config.heartbeat_ack {
                    send(
                        &self.out,
                        OutgoingMessage::HeartbeatAck {
                            event_id: heartbeat.event_id,
                            timestamp: heartbeat.timestamp,
                        },
                    )
                    .await;
                }
                Flow::Continue
            }
            IncomingCommand::Special(special) => match sink.special(&special.content).await {
                Ok(()) => Flow::Continue,
                Err(err) => {
                    ingest_failure(&self.out, IngestError::Engine(err), Some(&special.event_id))
                        .await
                }
            },
        }
    }

    /// Release engine resources and apply the final session transition.
    pub async fn finish(&mut self, termination: Option<TerminationReason>) {
        let previous = std::mem::replace(&mut self.state, ConnectionState::Closed);
        if let ConnectionState::Initialized(mut active) = previous {
            let dropped = active.ingest.discard();
            if dropped > 0 {
                debug!(session_id = %self.session_id, frames = dropped, "Dropped unflushed audio on close");
            }
            if let Err(err) = active.sink.close().await {
                warn!(session_id = %self.session_id, "Failed to close render session: {}", err);
            }
        }

        if let Some(reason) = termination
            && self.app.sessions.terminate(&self.session_id, reason).is_some()
        {
            info!(session_id = %self.session_id, reason = %reason, "Session terminated");
        }
    }
}

async fn send(out: &mpsc::Sender<MessageRoute>, message: OutgoingMessage) {
    if out.send(MessageRoute::Outgoing(message)).await.is_err() {
        debug!("Writer task gone, dropping outgoing message");
    }
}

/// Report a protocol violation and close with 1008.
async fn violation(
    out: &mpsc::Sender<MessageRoute>,
    code: ErrorCode,
    message: impl Into<String>,
    event_id: Option<&str>,
    initialized: bool,
) -> Flow {
    let message = message.into();
    warn!(code = ?code, "Protocol violation: {}", message);
    send(out, OutgoingMessage::error(code, message, event_id)).await;
    Flow::Close(Shutdown::new(
        CLOSE_POLICY_VIOLATION,
        "protocol violation",
        initialized.then_some(TerminationReason::ProtocolViolation),
    ))
}

async fn ingest_failure(
    out: &mpsc::Sender<MessageRoute>,
    err: IngestError,
    event_id: Option<&str>,
) -> Flow {
    match &err {
        IngestError::Decode(_) => {
            send(
                out,
                OutgoingMessage::error(ErrorCode::DecodeError, err.to_string(), event_id),
            )
            .await;
            Flow::Continue
        }
        IngestError::TooManyDecodeFailures { .. } => {
            warn!("Closing connection: {}", err);
            send(
                out,
                OutgoingMessage::error(ErrorCode::DecodeFailureLimit, err.to_string(), event_id),
            )
            .await;
            Flow::Close(Shutdown::new(
                CLOSE_POLICY_VIOLATION,
                "too many decode failures",
                Some(TerminationReason::DecodeFailures),
            ))
        }
        IngestError::Engine(_) => {
            error!("Closing connection: {}", err);
            send(
                out,
                OutgoingMessage::error(ErrorCode::EngineError, err.to_string(), event_id),
            )
            .await;
            Flow::Close(Shutdown::new(
                CLOSE_INTERNAL_ERROR,
                "engine failure",
                Some(TerminationReason::EngineFailure),
            ))
        }
    }
}
