//! Typed event channel for replication observers.

use parking_lot::Mutex;
use std::sync::mpsc::{self, Receiver, Sender};

/// Lifecycle state of a replicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorState {
    /// Not running.
    Stopped,
    /// Actively replicating.
    Running,
    /// Continuous replication waiting out a connectivity loss.
    Offline,
}

/// An event delivered to replication observers.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicatorEvent {
    /// The replicator changed lifecycle state.
    StateChanged(ReplicatorState),
    /// Progress counters changed.
    Progress {
        /// Revisions processed so far (inserted, uploaded, rejected or
        /// failed).
        processed: u64,
        /// Revisions known about so far.
        total: u64,
    },
}

/// Fans events out to subscriber channels.
///
/// Observers receive on their own threads; emission never runs observer
/// code on the thread that mutates replicator state. Subscribers whose
/// receiver was dropped are pruned on the next emit.
pub(crate) struct EventHub {
    subscribers: Mutex<Vec<Sender<ReplicatorEvent>>>,
}

impl EventHub {
    pub(crate) fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn subscribe(&self) -> Receiver<ReplicatorEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: ReplicatorEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}
