//! Shared application state
//!
//! One [`AppState`] is built at startup and shared by every router behind an
//! `Arc`. It owns the session registry, the token signer, the rendering
//! engine, and the WebSocket connection counters.

use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::SessionTokenSigner;
use crate::config::ServerConfig;
use crate::core::{AvatarEngine, CaptureEngine, LoggingEngine};
use crate::session::SessionStore;

/// Why a WebSocket connection slot could not be acquired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionLimitError {
    GlobalLimitReached,
    PerIpLimitReached,
}

pub struct AppState {
    pub config: ServerConfig,
    pub sessions: Arc<SessionStore>,
    pub tokens: SessionTokenSigner,
    pub engine: Arc<dyn AvatarEngine>,
    /// Cancelled on shutdown; stops background tasks
    pub shutdown: CancellationToken,
    ws_connections: AtomicUsize,
    ip_connections: DashMap<IpAddr, usize>,
}

impl AppState {
    /// Build state with the engine selected by the configuration.
    ///
    /// Audio is logged by default, and additionally captured to WAV when
    /// `audio_capture_dir` is set.
    pub async fn new(config: ServerConfig) -> Arc<Self> {
        let engine: Arc<dyn AvatarEngine> = match config.audio_capture_dir.clone() {
            Some(dir) => {
                info!(dir = %dir.display(), "Audio capture enabled");
                Arc::new(CaptureEngine::new(LoggingEngine, dir))
            }
            None => Arc::new(LoggingEngine),
        };
        Self::with_engine(config, engine)
    }

    /// Build state around an explicit rendering engine.
    pub fn with_engine(config: ServerConfig, engine: Arc<dyn AvatarEngine>) -> Arc<Self> {
        let tokens = match config.token_secret.as_deref() {
            Some(secret) => SessionTokenSigner::new(secret.as_bytes(), config.token_ttl_seconds),
            None => {
                warn!(
                    "SESSION_TOKEN_SECRET not set, using a random per-process secret. \
                     Session tokens will not survive a restart."
                );
                let secret: [u8; 32] = rand::random();
                SessionTokenSigner::new(&secret, config.token_ttl_seconds)
            }
        };

        if !config.has_api_keys() {
            warn!("No API keys configured, every control-plane request will be rejected");
        }

        // Tombstones outlive every token minted for them
        let sessions = Arc::new(SessionStore::new(config.token_ttl()));

        Arc::new(Self {
            config,
            sessions,
            tokens,
            engine,
            shutdown: CancellationToken::new(),
            ws_connections: AtomicUsize::new(0),
            ip_connections: DashMap::new(),
        })
    }

    /// Try to reserve a WebSocket connection slot for `ip`.
    pub fn try_acquire_connection(&self, ip: IpAddr) -> Result<(), ConnectionLimitError> {
        // Per-IP check and increment happen under the entry lock
        let mut per_ip = self.ip_connections.entry(ip).or_insert(0);
        if *per_ip >= self.config.max_connections_per_ip as usize {
            return Err(ConnectionLimitError::PerIpLimitReached);
        }

        if let Some(max) = self.config.max_websocket_connections {
            let reserved = self
                .ws_connections
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                    (current < max).then_some(current + 1)
                });
            if reserved.is_err() {
                drop(per_ip);
                self.ip_connections.remove_if(&ip, |_, count| *count == 0);
                return Err(ConnectionLimitError::GlobalLimitReached);
            }
        } else {
            self.ws_connections.fetch_add(1, Ordering::AcqRel);
        }

        *per_ip += 1;
        Ok(())
    }

    /// Release a slot previously acquired with [`try_acquire_connection`].
    ///
    /// [`try_acquire_connection`]: AppState::try_acquire_connection
    pub fn release_connection(&self, ip: IpAddr) {
        let _ = self
            .ws_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            });
        self.ip_connections.remove_if_mut(&ip, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }

    pub fn ws_connection_count(&self) -> usize {
        self.ws_connections.load(Ordering::Acquire)
    }

    pub fn ip_connection_count(&self, ip: &IpAddr) -> usize {
        self.ip_connections.get(ip).map(|count| *count).unwrap_or(0)
    }

    /// Periodically drop terminated sessions whose retention has passed,
    /// along with sessions that never connected before their token expired.
    ///
    /// Runs until [`AppState::shutdown`] is cancelled.
    pub fn spawn_session_purge(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let state = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = state.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = state.sessions.purge_expired();
                        if purged > 0 {
                            info!(purged, remaining = state.sessions.len(), "Purged expired sessions");
                        }
                    }
                }
            }
        })
    }
}
