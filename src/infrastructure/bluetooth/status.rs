//! Status Publisher
//!
//! Holds the [`SessionStatus`] snapshot the UI layer subscribes to. The
//! flags are derived from the state machine; only the message is free text.

use crate::domain::models::SessionStatus;
use crate::infrastructure::bluetooth::connection::ConnectionStateMachine;
use tokio::sync::watch;
use tracing::debug;

pub struct StatusPublisher {
    tx: watch::Sender<SessionStatus>,
}

impl Default for StatusPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusPublisher {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SessionStatus::default());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> SessionStatus {
        self.tx.borrow().clone()
    }

    /// Recompute the snapshot from `machine`, replacing the message when one
    /// is given. Subscribers are only woken if something changed.
    pub fn publish(&self, machine: &ConnectionStateMachine, message: Option<&str>) -> bool {
        let next = SessionStatus {
            connected: machine.is_ready(),
            scanning: machine.is_scanning(),
            message: match message {
                Some(message) => message.to_string(),
                None => self.tx.borrow().message.clone(),
            },
        };

        self.tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!("Status: {}", next);
            *current = next;
            true
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::platform::PeripheralHandle;

    #[test]
    fn test_initial_snapshot() {
        let publisher = StatusPublisher::new();
        assert_eq!(publisher.current(), SessionStatus::default());
        assert_eq!(publisher.current().message, "Not Connected");
    }

    #[test]
    fn test_publish_derives_flags() {
        let publisher = StatusPublisher::new();
        let mut machine = ConnectionStateMachine::new();
        let mut rx = publisher.subscribe();

        machine.begin_scanning();
        assert!(publisher.publish(&machine, Some("Scanning...")));
        assert!(rx.has_changed().unwrap());
        let status = rx.borrow_and_update().clone();
        assert!(status.scanning);
        assert!(!status.connected);

        machine.begin_connecting(PeripheralHandle::new("motor"));
        assert!(publisher.publish(&machine, None));
        let status = publisher.current();
        assert!(!status.scanning);
        assert_eq!(status.message, "Scanning...");
    }

    #[test]
    fn test_unchanged_snapshot_does_not_notify() {
        let publisher = StatusPublisher::new();
        let machine = ConnectionStateMachine::new();
        let rx = publisher.subscribe();

        assert!(!publisher.publish(&machine, Some("Not Connected")));
        assert!(!rx.has_changed().unwrap());
    }
}
