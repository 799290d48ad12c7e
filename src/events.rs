//! Notification types and the subscriber plumbing behind them.
//!
//! The log store and the supervisor both publish events to any number of
//! observers. Each observer holds a `Subscription`, which unsubscribes itself
//! when dropped so no sender outlives the consumer that registered it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::mpsc;

use crate::log_store::LogEntry;
use crate::service::ProcessState;

/// Notifications published by the log store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    /// A single entry was appended.
    Appended(LogEntry),
    /// The whole sequence was replaced (history resync).
    Replaced(Vec<LogEntry>),
    /// The display filter changed.
    FilterChanged(String),
}

/// A service moved to a new lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub service: String,
    pub state: ProcessState,
}

/// Locks a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of live subscribers for one event type.
#[derive(Debug)]
pub struct Subscribers<T> {
    next_id: u64,
    senders: Vec<(u64, mpsc::UnboundedSender<T>)>,
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            senders: Vec::new(),
        }
    }
}

impl<T: Clone> Subscribers<T> {
    /// Delivers `event` to every subscriber, pruning the ones whose receiver is gone.
    pub fn publish(&mut self, event: T) {
        self.senders.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    fn add(&mut self) -> (u64, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id;
        self.next_id += 1;
        self.senders.push((id, tx));
        (id, rx)
    }

    fn remove(&mut self, id: u64) {
        self.senders.retain(|(sid, _)| *sid != id);
    }
}

/// Registers a new subscriber on `registry`.
///
/// Callers that need the registration to be atomic with a snapshot must already
/// hold the lock that serializes publishing.
pub(crate) fn subscribe<T: Clone>(registry: &Arc<Mutex<Subscribers<T>>>) -> Subscription<T> {
    let (id, rx) = lock(registry).add();
    Subscription {
        id,
        rx,
        registry: Arc::downgrade(registry),
    }
}

/// Receiving end of a subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription<T: Clone> {
    id: u64,
    rx: mpsc::UnboundedReceiver<T>,
    registry: Weak<Mutex<Subscribers<T>>>,
}

impl<T: Clone> Subscription<T> {
    /// Waits for the next event. Returns `None` once the publisher is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Returns an already queued event without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Explicitly ends the subscription.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl<T: Clone> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).remove(self.id);
        }
    }
}
