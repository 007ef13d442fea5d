//! In-process named broadcast channels
//!
//! A [`BroadcastHub`] stands in for a cross-context channel service: any
//! number of endpoints open the same channel name, and a message posted by one
//! endpoint reaches every other endpoint subscribed to that name. An endpoint
//! never receives its own posts.
//!
//! ```text
//!   endpoint A ──post──┐
//!                      ├──> "chatsync:election" ──> every endpoint but A
//!   endpoint B ──post──┘
//! ```
//!
//! Delivery is FIFO per channel. Subscribers that fall more than `capacity`
//! messages behind skip the overflow and log it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{trace, warn};

/// Default per-channel buffer
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Envelope<T> {
    sender: u64,
    message: T,
}

/// Registry of named channels
pub struct BroadcastHub<T: Clone + Send + 'static> {
    channels: Mutex<HashMap<String, broadcast::Sender<Envelope<T>>>>,
    next_endpoint: AtomicU64,
    capacity: usize,
}

impl<T: Clone + Send + 'static> Default for BroadcastHub<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl<T: Clone + Send + 'static> BroadcastHub<T> {
    /// Create a hub whose channels buffer up to `capacity` messages
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            next_endpoint: AtomicU64::new(1),
            capacity,
        }
    }

    /// Open an endpoint on the named channel, creating the channel if needed
    pub fn open(&self, name: &str) -> ChannelEndpoint<T> {
        let sender = self
            .channels
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone();

        ChannelEndpoint {
            name: name.to_string(),
            id: self.next_endpoint.fetch_add(1, Ordering::Relaxed),
            sender,
        }
    }

    /// Forget a channel. Open endpoints keep working among themselves, new
    /// endpoints with the same name start a fresh channel.
    pub fn remove(&self, name: &str) -> bool {
        self.channels.lock().remove(name).is_some()
    }

    /// Number of live channels
    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }
}

/// One participant on a named channel
#[derive(Clone)]
pub struct ChannelEndpoint<T: Clone + Send + 'static> {
    name: String,
    id: u64,
    sender: broadcast::Sender<Envelope<T>>,
}

impl<T: Clone + Send + 'static> ChannelEndpoint<T> {
    /// Channel name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Post to every other subscribed endpoint.
    ///
    /// Returns how many subscriptions the message was queued for, which
    /// includes this endpoint's own subscriptions (they skip it on receive).
    pub fn post(&self, message: T) -> usize {
        match self.sender.send(Envelope {
            sender: self.id,
            message,
        }) {
            Ok(count) => count,
            Err(_) => {
                trace!(channel = %self.name, "Posted to channel with no subscribers");
                0
            }
        }
    }

    /// Start receiving. Only messages posted after this call are delivered.
    pub fn subscribe(&self) -> ChannelReceiver<T> {
        ChannelReceiver {
            name: self.name.clone(),
            id: self.id,
            receiver: self.sender.subscribe(),
        }
    }
}

/// Receiving half of an endpoint
pub struct ChannelReceiver<T: Clone + Send + 'static> {
    name: String,
    id: u64,
    receiver: broadcast::Receiver<Envelope<T>>,
}

impl<T: Clone + Send + 'static> ChannelReceiver<T> {
    /// Next message from another endpoint, or `None` once the channel closed
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) if envelope.sender == self.id => continue,
                Ok(envelope) => return Some(envelope.message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.name, skipped, "Channel receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
