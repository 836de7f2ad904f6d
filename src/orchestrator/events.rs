//! Best-effort notification of testrun executions.
//!
//! Listeners subscribe with a bounded channel. Delivery never blocks the
//! orchestrator: a listener whose channel is full misses the event, and a
//! listener whose receiver was dropped is removed.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;
use uuid::Uuid;

use super::SlotId;

/// Emitted every time a testrun is (re-)executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunEvent {
    /// Execution group of the orchestrated run.
    pub group: Uuid,
    pub slot: SlotId,
    pub testrun: String,
    pub attempt: u32,
}

/// Registry of event listeners.
#[derive(Debug, Clone, Default)]
pub struct RunEvents {
    listeners: Arc<Mutex<Vec<mpsc::Sender<RunEvent>>>>,
}

impl RunEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener whose channel buffers up to `capacity` events.
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<RunEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Delivers `event` to every listener that has room for it.
    pub fn emit(&self, event: &RunEvent) {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(testrun = %event.testrun, "Listener is full, skipping event");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(attempt: u32) -> RunEvent {
        RunEvent {
            group: Uuid::nil(),
            slot: SlotId(0),
            testrun: format!("tr-{attempt}"),
            attempt,
        }
    }

    #[tokio::test]
    async fn test_full_listener_is_skipped() {
        let events = RunEvents::new();
        let mut slow = events.subscribe(1);
        let mut fast = events.subscribe(8);

        events.emit(&event(0));
        events.emit(&event(1));

        assert_eq!(slow.recv().await.unwrap().attempt, 0);
        assert!(slow.try_recv().is_err());
        assert_eq!(fast.recv().await.unwrap().attempt, 0);
        assert_eq!(fast.recv().await.unwrap().attempt, 1);
    }

    #[tokio::test]
    async fn test_closed_listener_is_removed() {
        let events = RunEvents::new();
        let dropped = events.subscribe(1);
        let _kept = events.subscribe(1);
        drop(dropped);

        events.emit(&event(0));
        assert_eq!(events.listener_count(), 1);
    }
}
