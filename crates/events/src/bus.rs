//! Event bus implementation using tokio broadcast channels

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

use crate::types::{Event, EventEnvelope};

/// Capacity for the broadcast channel
const DEFAULT_CAPACITY: usize = 1000;

/// Event bus for publishing and subscribing to events.
///
/// Every published event gets the next sequence number, so subscribers can
/// order events coming from concurrently running phases.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    /// Held while sending so channel order matches sequence order
    sequence: Arc<Mutex<u64>>,
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
            sequence: Arc::new(Mutex::new(0)),
        }
    }

    /// Publish an event to all subscribers
    ///
    /// Returns the number of subscribers that received the event.
    /// If there are no subscribers, returns 0 (the event is dropped).
    pub fn publish(&self, event: Event) -> usize {
        let mut seq = self.lock_sequence();
        *seq += 1;
        self.sender
            .send(EventEnvelope::new(*seq, event))
            .unwrap_or(0)
    }

    /// Subscribe to events
    ///
    /// Events published before subscribing are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    /// Get the number of current subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Sequence number of the last published event
    pub fn current_sequence(&self) -> u64 {
        *self.lock_sequence()
    }

    fn lock_sequence(&self) -> MutexGuard<'_, u64> {
        // The counter stays valid even if a publisher panicked.
        self.sequence
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
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
            .field("sequence", &self.current_sequence())
            .finish()
    }
}
