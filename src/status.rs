//! Push-connection status.
//!
//! The lifecycle is an explicit state machine:
//!
//! ```text
//! Connecting --opened--> Connected --failed--> Error        --retry--> Connecting
//!                                  --closed--> Disconnected --retry--> Connecting
//! ```
//!
//! Every failure waits a fixed backoff before retrying. Observers read a
//! [`StatusReport`] through a lock-free [`StatusHandle`].

use arc_swap::ArcSwap;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened,
    /// Peer closed the stream cleanly.
    Closed,
    Failed,
    /// Backoff elapsed.
    Retry,
}

impl ConnectionStatus {
    /// Next state, or `None` when the event is not valid here.
    pub fn on(self, event: ConnectionEvent) -> Option<ConnectionStatus> {
        use ConnectionEvent::*;
        use ConnectionStatus::*;
        match (self, event) {
            (Connecting, Opened) => Some(Connected),
            (Connecting, Failed) | (Connected, Failed) => Some(Error),
            (Connecting, Closed) | (Connected, Closed) => Some(Disconnected),
            (Error, Retry) | (Disconnected, Retry) => Some(Connecting),
            _ => None,
        }
    }

    /// True for states that wait out the backoff before moving on.
    pub fn is_waiting(self) -> bool {
        matches!(self, ConnectionStatus::Error | ConnectionStatus::Disconnected)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub status: ConnectionStatus,
    /// Time of the last message received over the connection.
    pub last_update_ms: Option<i64>,
    pub last_error: Option<String>,
    pub reconnects: u64,
}

impl Default for StatusReport {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            last_update_ms: None,
            last_error: None,
            reconnects: 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StatusHandle {
    inner: Arc<ArcSwap<StatusReport>>,
}

impl StatusHandle {
    pub fn current(&self) -> Arc<StatusReport> {
        self.inner.load_full()
    }

    fn store(&self, report: StatusReport) {
        self.inner.store(Arc::new(report));
    }
}

/// Single writer of the connection status.
#[derive(Debug)]
pub struct ConnectionTracker {
    report: StatusReport,
    backoff: Duration,
    handle: StatusHandle,
}

impl ConnectionTracker {
    pub fn new(backoff: Duration) -> Self {
        let report = StatusReport {
            status: ConnectionStatus::Connecting,
            ..StatusReport::default()
        };
        let handle = StatusHandle::default();
        handle.store(report.clone());
        Self {
            report,
            backoff,
            handle,
        }
    }

    pub fn handle(&self) -> StatusHandle {
        self.handle.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.report.status
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Apply an event. Invalid transitions are ignored and reported as `false`.
    pub fn apply(&mut self, event: ConnectionEvent) -> bool {
        let Some(next) = self.report.status.on(event) else {
            return false;
        };
        if event == ConnectionEvent::Retry {
            self.report.reconnects += 1;
        }
        if next == ConnectionStatus::Connected {
            self.report.last_error = None;
        }
        self.report.status = next;
        self.handle.store(self.report.clone());
        true
    }

    pub fn fail(&mut self, error: impl fmt::Display) -> bool {
        let moved = self.apply(ConnectionEvent::Failed);
        if moved {
            self.report.last_error = Some(error.to_string());
            self.handle.store(self.report.clone());
        }
        moved
    }

    /// Teardown: the connection is gone for good, whatever state it was in.
    pub fn shut_down(&mut self) {
        self.report.status = ConnectionStatus::Disconnected;
        self.handle.store(self.report.clone());
    }

    pub fn message_received(&mut self, at_ms: i64) {
        self.report.last_update_ms = Some(at_ms);
        self.handle.store(self.report.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionEvent::*;
    use ConnectionStatus::*;

    #[test]
    fn happy_path_and_recovery() {
        assert_eq!(Connecting.on(Opened), Some(Connected));
        assert_eq!(Connected.on(Failed), Some(Error));
        assert_eq!(Error.on(Retry), Some(Connecting));
        assert_eq!(Connected.on(Closed), Some(Disconnected));
        assert_eq!(Disconnected.on(Retry), Some(Connecting));
    }

    #[test]
    fn invalid_transitions_are_rejected() {
        assert_eq!(Connected.on(Opened), None);
        assert_eq!(Connecting.on(Retry), None);
        assert_eq!(Error.on(Opened), None);
        assert_eq!(Disconnected.on(Failed), None);
    }

    #[test]
    fn tracker_publishes_each_transition() {
        let mut tracker = ConnectionTracker::new(Duration::from_millis(3000));
        let handle = tracker.handle();
        assert_eq!(handle.current().status, Connecting);

        assert!(tracker.apply(Opened));
        tracker.message_received(42);
        assert_eq!(handle.current().status, Connected);
        assert_eq!(handle.current().last_update_ms, Some(42));

        assert!(tracker.fail("reset by peer"));
        let report = handle.current();
        assert_eq!(report.status, Error);
        assert_eq!(report.last_error.as_deref(), Some("reset by peer"));
        assert!(report.status.is_waiting());

        assert!(tracker.apply(Retry));
        assert!(tracker.apply(Opened));
        let report = handle.current();
        assert_eq!(report.reconnects, 1);
        assert_eq!(report.last_error, None);
        assert_eq!(report.last_update_ms, Some(42));
    }

    #[test]
    fn invalid_event_leaves_state_alone() {
        let mut tracker = ConnectionTracker::new(Duration::from_secs(1));
        assert!(!tracker.apply(Retry));
        assert_eq!(tracker.status(), Connecting);
        assert_eq!(tracker.handle().current().reconnects, 0);
    }

    #[test]
    fn status_names() {
        assert_eq!(Error.to_string(), "error");
        assert_eq!(
            serde_json::to_string(&Disconnected).unwrap(),
            "\"disconnected\""
        );
    }
}
