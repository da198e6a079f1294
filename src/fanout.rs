//! Observer registry and broadcast fan-out

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::types::{ObserverId, ServerEvent};

/// Connected observers: observer_id -> outbound queue
///
/// Delivery is fire-and-forget. A full queue drops the event for that observer
/// only; a closed queue unregisters the observer.
#[derive(Clone, Default)]
pub struct Fanout {
    observers: Arc<DashMap<ObserverId, mpsc::Sender<ServerEvent>>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an observer connection
    pub fn register(&self, observer: ObserverId, tx: mpsc::Sender<ServerEvent>) {
        self.observers.insert(observer, tx);
        info!("Observer {} connected ({} total)", observer, self.observers.len());
    }

    /// Remove an observer connection
    pub fn unregister(&self, observer: &ObserverId) {
        if self.observers.remove(observer).is_some() {
            info!("Observer {} disconnected", observer);
        }
    }

    /// Get connected observer count
    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    /// Relay an event to every observer
    pub fn broadcast(&self, event: ServerEvent) {
        let mut closed = Vec::new();

        for entry in self.observers.iter() {
            if !deliver(*entry.key(), entry.value(), event.clone()) {
                closed.push(*entry.key());
            }
        }

        // Removal happens after iteration; DashMap shards are still read-locked inside the loop
        for observer in closed {
            self.unregister(&observer);
        }
    }

    /// Send an event to a single observer
    pub fn send_to(&self, observer: &ObserverId, event: ServerEvent) {
        let open = match self.observers.get(observer) {
            Some(tx) => deliver(*observer, tx.value(), event),
            None => {
                debug!("Observer {} is gone, dropping event", observer);
                return;
            }
        };

        if !open {
            self.unregister(observer);
        }
    }
}

/// Returns false when the observer's queue is closed
fn deliver(observer: ObserverId, tx: &mpsc::Sender<ServerEvent>, event: ServerEvent) -> bool {
    match tx.try_send(event) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!("Observer {} queue full, event dropped", observer);
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}
