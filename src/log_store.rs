//! The shared, ordered log ledger.
//!
//! `LogStore` records every line emitted by every service plus `SYSTEM`
//! narration. Each entry gets a global, strictly increasing index at append
//! time. The store knows nothing about mute/solo or regex filtering; it only
//! holds the current filter string so consumers can apply it.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::{lock, subscribe, LogEvent, Subscribers, Subscription};
use crate::service::SYSTEM_PROCESS;

/// A single line in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Name of the service (or `SYSTEM`) that produced the line.
    pub process: String,
    /// The line itself, opaque text.
    pub text: String,
    /// Global sequence number.
    pub index: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LogStoreError {
    #[error("entry index {got} is not after the last stored index {last}")]
    OutOfOrder { got: u64, last: u64 },
    #[error("entry index {0} leaves no room for later entries")]
    IndexExhausted(u64),
}

// Index that follows `index`, or an error when `index` is the last one representable.
fn following(index: u64) -> Result<u64, LogStoreError> {
    index
        .checked_add(1)
        .ok_or(LogStoreError::IndexExhausted(index))
}

#[derive(Debug, Default)]
struct LogState {
    entries: Vec<LogEntry>,
    next_index: u64,
    filter: String,
}

/// Cheaply clonable handle to one shared ledger.
#[derive(Debug, Clone, Default)]
pub struct LogStore {
    state: Arc<Mutex<LogState>>,
    subscribers: Arc<Mutex<Subscribers<LogEvent>>>,
}

impl LogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a line for `process` and returns the stored entry.
    pub fn add_log(&self, process: &str, text: impl Into<String>) -> LogEntry {
        let mut state = lock(&self.state);
        let entry = LogEntry {
            process: process.to_string(),
            text: text.into(),
            index: state.next_index,
        };
        state.next_index = state.next_index.saturating_add(1);
        state.entries.push(entry.clone());
        // Publishing under the state lock keeps notification order equal to index order.
        lock(&self.subscribers).publish(LogEvent::Appended(entry.clone()));
        entry
    }

    pub fn add_system_log(&self, text: impl Into<String>) -> LogEntry {
        self.add_log(SYSTEM_PROCESS, text)
    }

    /// Appends an entry produced by another store, keeping its index.
    pub fn ingest(&self, entry: LogEntry) -> Result<(), LogStoreError> {
        let mut state = lock(&self.state);
        if entry.index < state.next_index {
            return Err(LogStoreError::OutOfOrder {
                got: entry.index,
                last: state.next_index.saturating_sub(1),
            });
        }
        state.next_index = following(entry.index)?;
        state.entries.push(entry.clone());
        lock(&self.subscribers).publish(LogEvent::Appended(entry));
        Ok(())
    }

    /// Returns a copy of every entry in append order.
    pub fn get_logs(&self) -> Vec<LogEntry> {
        lock(&self.state).entries.clone()
    }

    /// Replaces the whole sequence. Later appends continue after the last replaced index.
    ///
    /// A sequence whose last index cannot be followed is rejected and the store is left as is.
    pub fn set_logs(&self, entries: Vec<LogEntry>) -> Result<(), LogStoreError> {
        let next_index = match entries.last() {
            Some(last) => following(last.index)?,
            None => 0,
        };
        let mut state = lock(&self.state);
        state.next_index = next_index;
        state.entries = entries.clone();
        lock(&self.subscribers).publish(LogEvent::Replaced(entries));
        Ok(())
    }

    pub fn set_filter(&self, filter: impl Into<String>) {
        let filter = filter.into();
        let mut state = lock(&self.state);
        state.filter = filter.clone();
        lock(&self.subscribers).publish(LogEvent::FilterChanged(filter));
    }

    pub fn get_filter(&self) -> String {
        lock(&self.state).filter.clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.state).entries.is_empty()
    }

    /// Subscribes to append/replace/filter notifications.
    pub fn subscribe(&self) -> Subscription<LogEvent> {
        subscribe(&self.subscribers)
    }

    /// Captures the current history and subscribes in one step, so the caller
    /// sees every later append exactly once and none of the captured ones again.
    pub fn snapshot_and_subscribe(&self) -> (Vec<LogEntry>, Subscription<LogEvent>) {
        let state = lock(&self.state);
        let subscription = subscribe(&self.subscribers);
        (state.entries.clone(), subscription)
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_increase_by_one_across_services() {
        let store = LogStore::new();
        store.add_log("api", "one");
        store.add_system_log("two");
        store.add_log("web", "three");
        let indices: Vec<u64> = store.get_logs().iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(store.get_logs()[1].process, SYSTEM_PROCESS);
    }

    #[test]
    fn get_logs_returns_a_copy() {
        let store = LogStore::new();
        store.add_log("api", "line");
        let mut logs = store.get_logs();
        logs.clear();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn set_logs_round_trips_and_keeps_indices_monotonic() {
        let store = LogStore::new();
        store.add_log("local", "before");
        let history = vec![
            LogEntry {
                process: "api".into(),
                text: "a".into(),
                index: 4,
            },
            LogEntry {
                process: "web".into(),
                text: "b".into(),
                index: 5,
            },
        ];
        store.set_logs(history.clone()).unwrap();
        assert_eq!(store.get_logs(), history);

        let next = store.add_log("api", "c");
        assert_eq!(next.index, 6);
    }

    #[test]
    fn set_logs_with_empty_history_restarts_numbering() {
        let store = LogStore::new();
        store.add_system_log("Connected");
        store.set_logs(Vec::new()).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.add_log("api", "x").index, 0);
    }

    #[test]
    fn ingest_rejects_out_of_order_entries() {
        let store = LogStore::new();
        let entry = |index| LogEntry {
            process: "api".into(),
            text: format!("line {}", index),
            index,
        };
        store.ingest(entry(3)).unwrap();
        store.ingest(entry(4)).unwrap();
        assert_eq!(
            store.ingest(entry(4)),
            Err(LogStoreError::OutOfOrder { got: 4, last: 4 })
        );
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn last_representable_index_is_rejected() {
        let store = LogStore::new();
        let last = LogEntry {
            process: "api".into(),
            text: "end".into(),
            index: u64::MAX,
        };
        assert_eq!(
            store.ingest(last.clone()),
            Err(LogStoreError::IndexExhausted(u64::MAX))
        );
        assert_eq!(
            store.set_logs(vec![last]),
            Err(LogStoreError::IndexExhausted(u64::MAX))
        );
        assert!(store.is_empty());
        assert_eq!(store.add_log("api", "still fine").index, 0);
    }

    #[test]
    fn subscribers_distinguish_append_replace_and_filter() {
        let store = LogStore::new();
        let mut sub = store.subscribe();
        let entry = store.add_log("api", "hello");
        store.set_logs(vec![entry.clone()]).unwrap();
        store.set_filter("err");

        assert_eq!(sub.try_recv(), Some(LogEvent::Appended(entry.clone())));
        assert_eq!(sub.try_recv(), Some(LogEvent::Replaced(vec![entry])));
        assert_eq!(sub.try_recv(), Some(LogEvent::FilterChanged("err".into())));
        assert_eq!(store.get_filter(), "err");
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn snapshot_and_subscribe_splits_history_from_live_entries() {
        let store = LogStore::new();
        store.add_log("api", "old");
        let (history, mut sub) = store.snapshot_and_subscribe();
        let live = store.add_log("api", "new");

        assert_eq!(history.len(), 1);
        assert_eq!(history[0].text, "old");
        assert_eq!(sub.try_recv(), Some(LogEvent::Appended(live)));
        assert_eq!(sub.try_recv(), None);

        drop(sub);
        assert_eq!(store.subscriber_count(), 0);
    }
}
