//! Concurrent session registry
//!
//! Sessions live in a sharded [`DashMap`] of slots. Each slot carries its own
//! mutex, so every status transition is a check-and-set on one session and
//! never contends with other sessions. Shard locks are only held long enough
//! to clone the slot `Arc`; slot mutexes are never held while touching the
//! map.
//!
//! Terminated sessions are kept as tombstones until `tombstone_retention`
//! has elapsed, so an id is never handed out twice while a token minted for
//! it could still verify. The same window bounds how long a session may stay
//! PENDING: once its token has expired no connection can bind to it, so the
//! purge expires and drops it.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Session, SessionConfig, SessionStatus, TerminationReason};
use crate::auth::secrets_match;

struct SessionSlot {
    record: Mutex<Session>,
    /// Cancelled exactly once, when the session terminates
    closed: CancellationToken,
}

/// Result of a stop request
#[derive(Debug)]
pub enum StopOutcome {
    /// This call performed the transition to `TERMINATED`
    Terminated(Session),
    /// Unknown id, or the session was already terminated
    NotFound,
    /// The session exists but the supplied token is not its token
    TokenMismatch,
}

/// Why a connection could not bind to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ActivateError {
    #[error("session not found")]
    NotFound,
    #[error("session is already bound to another connection")]
    AlreadyActive,
    #[error("session has been terminated")]
    Terminated,
}

pub struct SessionStore {
    sessions: DashMap<String, Arc<SessionSlot>>,
    tombstone_retention: Duration,
}

impl SessionStore {
    pub fn new(tombstone_retention: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            tombstone_retention,
        }
    }

    /// Create a PENDING session under a freshly generated id.
    ///
    /// `mint` produces the bearer token for the new id. It runs while the id
    /// is reserved in its shard, so two concurrent starts can never share an
    /// id, and nothing is stored if minting fails.
    pub fn create<E>(
        &self,
        config: SessionConfig,
        mint: impl FnOnce(&str) -> Result<String, E>,
    ) -> Result<Session, E> {
        loop {
            let candidate = uuid::Uuid::new_v4().to_string();
            if let Entry::Vacant(vacant) = self.sessions.entry(candidate) {
                let token = mint(vacant.key())?;
                let session = Session::new(vacant.key().clone(), token, config);
                vacant.insert(Arc::new(SessionSlot {
                    record: Mutex::new(session.clone()),
                    closed: CancellationToken::new(),
                }));
                return Ok(session);
            }
        }
    }

    fn slot(&self, id: &str) -> Option<Arc<SessionSlot>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Snapshot of a session, terminated ones included.
    pub fn get(&self, id: &str) -> Option<Session> {
        self.slot(id).map(|slot| slot.record.lock().clone())
    }

    /// True when the session exists and is not terminated.
    pub fn is_live(&self, id: &str) -> bool {
        self.slot(id)
            .map(|slot| !slot.record.lock().is_terminated())
            .unwrap_or(false)
    }

    /// Token that is cancelled when the session terminates.
    pub fn closed_token(&self, id: &str) -> Option<CancellationToken> {
        self.slot(id).map(|slot| slot.closed.clone())
    }

    /// Bind a streaming connection: PENDING -> ACTIVE.
    pub fn activate(&self, id: &str) -> Result<(Session, CancellationToken), ActivateError> {
        let slot = self.slot(id).ok_or(ActivateError::NotFound)?;
        let mut record = slot.record.lock();
        match record.status {
            SessionStatus::Pending => {
                record.status = SessionStatus::Active;
                Ok((record.clone(), slot.closed.clone()))
            }
            SessionStatus::Active => Err(ActivateError::AlreadyActive),
            SessionStatus::Terminated => Err(ActivateError::Terminated),
        }
    }

    /// Transition to TERMINATED.
    ///
    /// Idempotent: only the call that performs the transition gets `Some`;
    /// every later call (or a call for an unknown id) gets `None`.
    pub fn terminate(&self, id: &str, reason: TerminationReason) -> Option<Session> {
        let slot = self.slot(id)?;
        let mut record = slot.record.lock();
        Self::terminate_locked(&slot, &mut record, reason)
    }

    /// Stop on behalf of the control plane, checking the caller's token.
    pub fn stop(&self, id: &str, token: &str) -> StopOutcome {
        let Some(slot) = self.slot(id) else {
            return StopOutcome::NotFound;
        };
        let mut record = slot.record.lock();
        if record.is_terminated() {
            return StopOutcome::NotFound;
        }
        if !secrets_match(token, &record.token) {
            return StopOutcome::TokenMismatch;
        }
        match Self::terminate_locked(&slot, &mut record, TerminationReason::Stopped) {
            Some(session) => StopOutcome::Terminated(session),
            None => StopOutcome::NotFound,
        }
    }

    fn terminate_locked(
        slot: &SessionSlot,
        record: &mut Session,
        reason: TerminationReason,
    ) -> Option<Session> {
        if record.is_terminated() {
            return None;
        }
        record.status = SessionStatus::Terminated;
        record.terminated_at = Some(OffsetDateTime::now_utc());
        record.termination_reason = Some(reason);
        slot.closed.cancel();
        Some(record.clone())
    }

    /// Drop tombstones older than the retention window, and PENDING
    /// sessions that outlived it. Returns how many records were removed.
    pub fn purge_expired(&self) -> usize {
        let now = OffsetDateTime::now_utc();
        let retention = i64::try_from(self.tombstone_retention.as_secs()).unwrap_or(i64::MAX);
        let before = self.sessions.len();
        self.sessions.retain(|id, slot| {
            let slot: &SessionSlot = slot;
            let mut record = slot.record.lock();
            match record.status {
                SessionStatus::Pending if (now - record.created_at).whole_seconds() >= retention => {
                    Self::terminate_locked(slot, &mut record, TerminationReason::Expired);
                    debug!(session_id = %id, "Expired session that never connected");
                    false
                }
                SessionStatus::Terminated => match record.terminated_at {
                    Some(at) => (now - at).whole_seconds() < retention,
                    None => true,
                },
                _ => true,
            }
        });
        before.saturating_sub(self.sessions.len())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
