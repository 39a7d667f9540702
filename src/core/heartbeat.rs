//! Idle tracking for streaming connections

use std::time::Duration;
use tokio::time::Instant;

/// Tracks the last inbound application message on a connection.
///
/// An idle timeout of `None` disables the deadline entirely.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    idle_timeout: Option<Duration>,
    last_activity: Instant,
}

impl HeartbeatMonitor {
    pub fn new(idle_timeout: Option<Duration>) -> Self {
        Self {
            idle_timeout,
            last_activity: Instant::now(),
        }
    }

    /// Record activity now.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Instant at which the connection is considered idle.
    ///
    /// A window too large to represent never expires.
    pub fn deadline(&self) -> Option<Instant> {
        self.idle_timeout
            .and_then(|timeout| self.last_activity.checked_add(timeout))
    }

    pub fn is_expired(&self) -> bool {
        self.deadline()
            .is_some_and(|deadline| Instant::now() >= deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_expires_after_timeout() {
        let monitor = HeartbeatMonitor::new(Some(Duration::from_secs(2)));
        assert!(!monitor.is_expired());

        tokio::time::advance(Duration::from_millis(1999)).await;
        assert!(!monitor.is_expired());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(monitor.is_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_pushes_deadline() {
        let mut monitor = HeartbeatMonitor::new(Some(Duration::from_secs(2)));
        tokio::time::advance(Duration::from_millis(1500)).await;
        monitor.touch();
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(!monitor.is_expired());
        assert_eq!(
            monitor.deadline(),
            Some(monitor.last_activity() + Duration::from_secs(2))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_never_expires() {
        let monitor = HeartbeatMonitor::new(None);
        tokio::time::advance(Duration::from_secs(24 * 3600)).await;
        assert!(!monitor.is_expired());
        assert!(monitor.deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_window_has_no_deadline() {
        let monitor = HeartbeatMonitor::new(Some(Duration::from_secs(u64::MAX)));
        assert!(monitor.deadline().is_none());
        assert!(!monitor.is_expired());
    }
}
