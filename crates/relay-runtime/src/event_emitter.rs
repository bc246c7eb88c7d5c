//! Broadcast-based emitter for [`RelayEvent`] notifications.

use std::sync::atomic::{AtomicU64, Ordering};

use relay_core::events::RelayEvent;
use tokio::sync::broadcast;

/// Default broadcast channel capacity.
pub const DEFAULT_CAPACITY: usize = 256;

/// Fan-out of state changes to any number of observers.
///
/// `emit` never awaits. Slow receivers lag (and see `RecvError::Lagged`)
/// rather than blocking the router.
pub struct EventEmitter {
    tx: broadcast::Sender<RelayEvent>,
    emit_count: AtomicU64,
}

impl EventEmitter {
    /// Create a new emitter with the default channel capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new emitter with a custom channel capacity (at least 1).
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            emit_count: AtomicU64::new(0),
        }
    }

    /// Emit an event. Returns the number of receivers, 0 when nobody listens.
    pub fn emit(&self, event: RelayEvent) -> usize {
        let _ = self.emit_count.fetch_add(1, Ordering::Relaxed);
        self.tx.send(event).unwrap_or(0)
    }

    /// Receiver for all events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.tx.subscribe()
    }

    /// Number of live receivers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Total number of events emitted, including those nobody received.
    pub fn emit_count(&self) -> u64 {
        self.emit_count.load(Ordering::Relaxed)
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}
