//! Pending-event storage for offline sends
//!
//! The WebSocket transport does not persist anything itself. Events sent
//! while the socket is down are handed to a [`PendingQueue`], and on the next
//! connection the queue is read back, resolved against the server backlog and
//! cleared once the resolution was delivered.
//!
//! Reading is a snapshot: [`PendingQueue::dequeue_pending`] must not remove
//! anything, so a connection that drops mid-handshake loses no events.

use parking_lot::Mutex;

use crate::event::SyncEvent;

/// Storage callbacks for events that could not be sent
pub trait PendingQueue: Send + Sync {
    /// Every queued event, oldest first, without removing them
    fn dequeue_pending(&self) -> Vec<SyncEvent>;

    /// Append an event that could not be sent
    fn enqueue_pending(&self, event: SyncEvent);

    /// Forget every queued event
    fn clear_pending(&self);
}

/// Volatile in-memory queue
#[derive(Default)]
pub struct MemoryPendingQueue {
    events: Mutex<Vec<SyncEvent>>,
}

impl MemoryPendingQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued events
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl PendingQueue for MemoryPendingQueue {
    fn dequeue_pending(&self) -> Vec<SyncEvent> {
        self.events.lock().clone()
    }

    fn enqueue_pending(&self, event: SyncEvent) {
        self.events.lock().push(event);
    }

    fn clear_pending(&self) {
        self.events.lock().clear();
    }
}
