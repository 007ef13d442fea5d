use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{stamp_origin, HandlerSlot, MessageHandler, Transport};
use crate::error::{SyncError, SyncResult};
use crate::event::SyncEvent;
use crate::hub::{BroadcastHub, ChannelEndpoint};

/// Transport over a named in-process broadcast channel.
///
/// Every `BroadcastTransport` opened on the same channel name sees the events
/// the others send, but not its own. Must be created inside a tokio runtime:
/// the receive side runs as a spawned task until [`close`](Transport::close).
pub struct BroadcastTransport {
    id: String,
    endpoint: ChannelEndpoint<SyncEvent>,
    handler: Arc<HandlerSlot>,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl BroadcastTransport {
    pub fn new(
        id: impl Into<String>,
        hub: &BroadcastHub<SyncEvent>,
        channel: &str,
    ) -> Arc<Self> {
        let id = id.into();
        let endpoint = hub.open(channel);
        let mut receiver = endpoint.subscribe();
        let handler = Arc::new(HandlerSlot::default());

        let pump = {
            let id = id.clone();
            let handler = handler.clone();
            tokio::spawn(async move {
                while let Some(mut event) = receiver.recv().await {
                    stamp_origin(&mut event, &id);
                    if !handler.deliver(event) {
                        trace!(transport = %id, "No handler installed, dropping broadcast event");
                    }
                }
                debug!(transport = %id, "Broadcast channel closed");
            })
        };

        Arc::new(Self {
            id,
            endpoint,
            handler,
            pump: Mutex::new(Some(pump)),
            closed: AtomicBool::new(false),
        })
    }

    /// Name of the underlying channel
    pub fn channel(&self) -> &str {
        self.endpoint.name()
    }
}

impl Transport for BroadcastTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn send(&self, mut event: SyncEvent) -> SyncResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Closed(self.id.clone()));
        }
        stamp_origin(&mut event, &self.id);
        self.endpoint.post(event);
        Ok(())
    }

    fn on_message(&self, handler: MessageHandler) {
        self.handler.set(handler);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.handler.clear();
    }
}

impl Drop for BroadcastTransport {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_events_cross_between_transports() {
        let hub = BroadcastHub::<SyncEvent>::default();
        let left = BroadcastTransport::new("left", &hub, "tabs");
        let right = BroadcastTransport::new("right", &hub, "tabs");

        let (tx, mut rx) = mpsc::unbounded_channel();
        right.on_message(Arc::new(move |event| {
            let _ = tx.send(event);
        }));
        let (own_tx, mut own_rx) = mpsc::unbounded_channel();
        left.on_message(Arc::new(move |event| {
            let _ = own_tx.send(event);
        }));

        left.send(SyncEvent::client_id_ack("x")).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.base.origin_transport_id.as_deref(), Some("right"));

        // never echoed back to the sender
        let echoed = tokio::time::timeout(Duration::from_millis(20), own_rx.recv()).await;
        assert!(echoed.is_err());
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_sends() {
        let hub = BroadcastHub::<SyncEvent>::default();
        let transport = BroadcastTransport::new("left", &hub, "tabs");
        transport.close();
        transport.close();
        assert!(transport.send(SyncEvent::ready_for_sync(None)).is_err());
    }
}
