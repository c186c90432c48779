//! Observable connection status.
//!
//! A watch channel instead of shared mutable state: writers publish the
//! latest probe verdict, subscribers see the current value immediately and
//! can await changes. Dropping the monitor closes every subscription.

use tokio::sync::watch;

use crate::probe::{ConnectionState, ProbeResult};

/// Publishes the most recent connection state for one endpoint.
pub struct ConnectionMonitor {
    tx: watch::Sender<ConnectionState>,
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Publish a new state. Subscribers are only woken on actual changes.
    pub fn update(&self, state: ConnectionState) {
        self.tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            tracing::info!(from = %current, to = %state, "connection_state_changed");
            *current = state;
            true
        });
    }

    /// Publish the state carried by a probe result.
    pub fn observe(&self, result: &ProbeResult) {
        self.update(result.state);
    }

    /// A receiver that sees the current state and all future changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_disconnected() {
        let monitor = ConnectionMonitor::new();
        assert_eq!(monitor.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_subscriber_sees_change() {
        let monitor = ConnectionMonitor::new();
        let mut rx = monitor.subscribe();
        assert_eq!(*rx.borrow(), ConnectionState::Disconnected);

        monitor.update(ConnectionState::Connected);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_unchanged_update_does_not_wake() {
        let monitor = ConnectionMonitor::new();
        let mut rx = monitor.subscribe();
        monitor.update(ConnectionState::Disconnected);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_current_state() {
        let monitor = ConnectionMonitor::new();
        monitor.update(ConnectionState::Degraded);
        let rx = monitor.subscribe();
        assert_eq!(*rx.borrow(), ConnectionState::Degraded);
    }
}
