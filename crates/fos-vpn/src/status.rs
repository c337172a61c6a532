//! Session Status
//!
//! Connection status values and the broadcast channel observers subscribe
//! to. Broadcasts are fire-and-forget: a slow subscriber skips ahead and
//! uses `sequence` to discard snapshots older than the one it already has.

use crate::error::ErrorEvent;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

const EVENT_CAPACITY: usize = 64;

/// Tunnel connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected { since: DateTime<Utc> },
    /// Connected, but the tunnel is being repaired
    Reasserting,
    Disconnecting,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected { .. } | ConnectionStatus::Reasserting)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected { since } => write!(f, "connected since {}", since),
            ConnectionStatus::Reasserting => write!(f, "reasserting"),
            ConnectionStatus::Disconnecting => write!(f, "disconnecting"),
        }
    }
}

/// A status snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub status: ConnectionStatus,
    pub changed_at: DateTime<Utc>,
    /// Strictly increasing per publisher
    pub sequence: u64,
}

/// Selected server as shown to observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatusInfo {
    pub name: String,
    pub location: String,
    pub address: Option<String>,
}

/// Everything the session broadcasts
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StatusChanged(StatusChange),
    ServerSelected(ServerStatusInfo),
    ConnectivityIssues(bool),
    LatencyReported { server: String, latency: Duration },
    RekeyCompleted,
    Error(ErrorEvent),
}

/// Current status holder and event fan-out
#[derive(Debug)]
pub struct StatusPublisher {
    events: broadcast::Sender<SessionEvent>,
    current: StatusChange,
}

impl StatusPublisher {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            events,
            current: StatusChange {
                status: ConnectionStatus::Disconnected,
                changed_at: Utc::now(),
                sequence: 0,
            },
        }
    }

    pub fn current(&self) -> StatusChange {
        self.current
    }

    pub fn status(&self) -> ConnectionStatus {
        self.current.status
    }

    /// Change the status; unchanged values are not re-broadcast
    pub fn set(&mut self, status: ConnectionStatus) {
        if self.current.status == status {
            return;
        }

        self.current = StatusChange {
            status,
            changed_at: Utc::now(),
            sequence: self.current.sequence + 1,
        };

        info!("Connection status: {}", status);
        self.publish(SessionEvent::StatusChanged(self.current));
    }

    pub fn publish(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Sender for collaborators that publish on their own schedule
    pub fn sender(&self) -> broadcast::Sender<SessionEvent> {
        self.events.clone()
    }
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_changes_are_sequenced() {
        let mut publisher = StatusPublisher::new();
        let mut rx = publisher.subscribe();

        publisher.set(ConnectionStatus::Connecting);
        publisher.set(ConnectionStatus::Connecting);
        publisher.set(ConnectionStatus::Disconnected);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();

        match (first, second) {
            (SessionEvent::StatusChanged(a), SessionEvent::StatusChanged(b)) => {
                assert_eq!(a.status, ConnectionStatus::Connecting);
                assert_eq!(b.status, ConnectionStatus::Disconnected);
                assert!(b.sequence > a.sequence);
            }
            other => panic!("unexpected events {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let mut publisher = StatusPublisher::new();
        publisher.set(ConnectionStatus::Reasserting);

        assert!(publisher.status().is_connected());
        assert_eq!(publisher.current().sequence, 1);
    }
}
