//! Event bus implementation using tokio broadcast channels

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::types::{Event, EventEnvelope};

/// Capacity for the broadcast channel
const DEFAULT_CAPACITY: usize = 1000;

/// Event bus for publishing and subscribing to diagnostic events.
///
/// Every published event is stamped with a monotonically increasing sequence
/// number so subscribers can restore publish order across concurrent
/// publishers. Clones share the channel and the sequence.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a new event bus with specified capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event to all subscribers
    ///
    /// Returns the number of subscribers that received the event.
    /// With no subscribers the event is dropped, but still consumes a
    /// sequence number.
    pub fn publish(&self, event: Event) -> usize {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.sender
            .send(EventEnvelope::new(sequence, event))
            .unwrap_or(0)
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Get the number of current subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Get the total number of events published
    pub fn event_count(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .field("event_count", &self.event_count())
            .finish()
    }
}
