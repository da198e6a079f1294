//! Bounded outbound history
//!
//! Every append re-broadcasts the whole ring. Observers joining mid-session get
//! the snapshot under the same lock, so they never miss or double-count an
//! append racing with their registration.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::fanout::Fanout;
use crate::types::{HistoryEntry, ObserverId, ServerEvent};

pub struct HistoryLog {
    capacity: usize,
    entries: Mutex<VecDeque<HistoryEntry>>,
    fanout: Fanout,
}

impl HistoryLog {
    pub fn new(capacity: usize, fanout: Fanout) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            fanout,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an entry, evicting the oldest beyond capacity, and broadcast the snapshot
    pub fn append(&self, entry: HistoryEntry) {
        let mut entries = self.entries.lock();
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
        debug!("History now holds {} entries", entries.len());

        // Broadcast while locked so snapshots leave in append order
        let snapshot = Arc::new(entries.iter().cloned().collect::<Vec<_>>());
        self.fanout.broadcast(ServerEvent::History { entries: snapshot });
    }

    /// Ordered copy of the current entries
    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Register an observer and hand it the current snapshot atomically
    pub fn attach(&self, observer: ObserverId, tx: mpsc::Sender<ServerEvent>) {
        let entries = self.entries.lock();
        self.fanout.register(observer, tx);
        let snapshot = Arc::new(entries.iter().cloned().collect::<Vec<_>>());
        self.fanout
            .send_to(&observer, ServerEvent::History { entries: snapshot });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HistoryStatus;
    use uuid::Uuid;

    fn entry(text: &str) -> HistoryEntry {
        HistoryEntry::new("628", text, HistoryStatus::Sent)
    }

    fn texts(entries: &[HistoryEntry]) -> Vec<String> {
        entries.iter().map(|e| e.text.clone()).collect()
    }

    #[test]
    fn test_fifo_eviction() {
        let log = HistoryLog::new(3, Fanout::new());
        for text in ["a", "b", "c", "d", "e"] {
            log.append(entry(text));
            assert!(log.len() <= 3);
        }
        assert_eq!(texts(&log.snapshot()), vec!["c", "d", "e"]);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let log = HistoryLog::new(0, Fanout::new());
        log.append(entry("a"));
        log.append(entry("b"));
        assert_eq!(log.capacity(), 1);
        assert_eq!(texts(&log.snapshot()), vec!["b"]);
    }

    #[tokio::test]
    async fn test_append_broadcasts_full_snapshot() {
        let fanout = Fanout::new();
        let (tx, mut rx) = mpsc::channel(8);
        fanout.register(Uuid::new_v4(), tx);
        let log = HistoryLog::new(10, fanout);

        log.append(entry("first"));
        log.append(entry("second"));

        let _ = rx.recv().await;
        match rx.recv().await {
            Some(ServerEvent::History { entries }) => {
                assert_eq!(texts(&entries), vec!["first", "second"]);
            }
            other => panic!("expected history, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_attach_sends_current_snapshot() {
        let log = HistoryLog::new(10, Fanout::new());
        log.append(entry("before"));

        let (tx, mut rx) = mpsc::channel(8);
        log.attach(Uuid::new_v4(), tx);

        match rx.recv().await {
            Some(ServerEvent::History { entries }) => {
                assert_eq!(*entries, log.snapshot());
            }
            other => panic!("expected history, got {:?}", other),
        }

        log.append(entry("after"));
        match rx.recv().await {
            Some(ServerEvent::History { entries }) => {
                assert_eq!(texts(&entries), vec!["before", "after"]);
            }
            other => panic!("expected history, got {:?}", other),
        }
    }
}
