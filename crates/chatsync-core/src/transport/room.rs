use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::{stamp_origin, HandlerSlot, MessageHandler, Transport};
use crate::error::{SyncError, SyncResult};
use crate::event::SyncEvent;

/// Server-side multiplexer over many client transports.
///
/// ```text
///               ┌──> client a
///   room.send ──┼──> client b        room.forward(e from b) ──> a, c
///               └──> client c        room.forward(e, no client) ──> handler
/// ```
///
/// Registering a client immediately sends it a `clientIdSync` carrying the
/// id it was registered under. That id is what the client stamps as
/// `originClientId`, which [`forward`](Self::forward) uses to fan events out
/// to everyone except their producer.
pub struct RoomTransport {
    id: String,
    clients: RwLock<BTreeMap<String, Arc<dyn Transport>>>,
    /// Clients that get no relayed events until released
    held: RwLock<BTreeSet<String>>,
    handler: HandlerSlot,
    closed: AtomicBool,
}

impl RoomTransport {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            clients: RwLock::new(BTreeMap::new()),
            held: RwLock::new(BTreeSet::new()),
            handler: HandlerSlot::default(),
            closed: AtomicBool::new(false),
        })
    }

    /// Register a client and start its handshake
    pub fn add_client(&self, client_id: &str, transport: Arc<dyn Transport>) -> SyncResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Closed(self.id.clone()));
        }
        self.clients
            .write()
            .insert(client_id.to_string(), transport.clone());
        info!(room = %self.id, client_id, "Client joined");

        transport.send(SyncEvent::client_id_sync(client_id))
    }

    pub fn remove_client(&self, client_id: &str) -> Option<Arc<dyn Transport>> {
        let removed = self.clients.write().remove(client_id);
        self.held.write().remove(client_id);
        if removed.is_some() {
            info!(room = %self.id, client_id, "Client left");
        }
        removed
    }

    /// Stop relaying other clients' events to `client_id` until
    /// [`release_relays`](Self::release_relays). Sends addressed to the
    /// client still go through.
    pub fn hold_relays(&self, client_id: &str) -> bool {
        if !self.clients.read().contains_key(client_id) {
            return false;
        }
        self.held.write().insert(client_id.to_string())
    }

    pub fn release_relays(&self, client_id: &str) -> bool {
        let released = self.held.write().remove(client_id);
        if released {
            debug!(room = %self.id, client_id, "Relays released");
        }
        released
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.clients.read().keys().cloned().collect()
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Route an event received from the host.
    ///
    /// Events produced by a known client go to every other client; anything
    /// else goes to the room's own handler.
    pub fn forward(&self, mut event: SyncEvent) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        stamp_origin(&mut event, &self.id);

        let Some(producer) = event.base.origin_client_id.clone() else {
            if !self.handler.deliver(event) {
                debug!(room = %self.id, "No handler installed, dropping event");
            }
            return;
        };

        let targets: Vec<(String, Arc<dyn Transport>)> = {
            let held = self.held.read();
            self.clients
                .read()
                .iter()
                .filter(|(id, _)| **id != producer && !held.contains(*id))
                .map(|(id, t)| (id.clone(), t.clone()))
                .collect()
        };
        for (client_id, transport) in targets {
            if let Err(e) = transport.send(event.clone()) {
                warn!(room = %self.id, %client_id, error = %e, "Failed to relay event");
            }
        }
    }

    /// Send to a single client
    pub fn send_to(&self, client_id: &str, event: SyncEvent) -> SyncResult<()> {
        let transport = self
            .clients
            .read()
            .get(client_id)
            .cloned()
            .ok_or_else(|| SyncError::UnknownTransport(client_id.to_string()))?;
        transport.send(event)
    }
}

impl Transport for RoomTransport {
    fn id(&self) -> &str {
        &self.id
    }

    /// Fan out to every registered client
    fn send(&self, mut event: SyncEvent) -> SyncResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Closed(self.id.clone()));
        }
        stamp_origin(&mut event, &self.id);

        let targets: Vec<(String, Arc<dyn Transport>)> = self
            .clients
            .read()
            .iter()
            .map(|(id, t)| (id.clone(), t.clone()))
            .collect();
        for (client_id, transport) in targets {
            if let Err(e) = transport.send(event.clone()) {
                warn!(room = %self.id, %client_id, error = %e, "Failed to send to client");
            }
        }
        Ok(())
    }

    fn on_message(&self, handler: MessageHandler) {
        self.handler.set(handler);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let clients = std::mem::take(&mut *self.clients.write());
        for transport in clients.values() {
            transport.close();
        }
        self.handler.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventPayload, Message};
    use crate::transport::ForwardingTransport;
    use parking_lot::Mutex;

    fn client(id: &str) -> (Arc<ForwardingTransport>, Arc<Mutex<Vec<SyncEvent>>>) {
        let transport = ForwardingTransport::new(id);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let out = sent.clone();
        transport.set_sink(move |text| {
            out.lock().push(SyncEvent::from_json(&text)?);
            Ok(())
        });
        transport.set_ready(true);
        (transport, sent)
    }

    fn message_from(client_id: &str) -> SyncEvent {
        SyncEvent::new(EventPayload::AddMessage {
            conversation_id: "c1".to_string(),
            message_index: 0,
            message: Message::new("m1"),
        })
        .from_client(client_id)
    }

    #[test]
    fn test_add_client_sends_client_id_sync() {
        let room = RoomTransport::new("room");
        let (a, a_sent) = client("a");
        room.add_client("a", a).unwrap();

        let sent = a_sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].payload,
            EventPayload::ClientIdSync {
                client_id: "a".to_string()
            }
        );
    }

    #[test]
    fn test_forward_skips_producer() {
        let room = RoomTransport::new("room");
        let (a, a_sent) = client("a");
        let (b, b_sent) = client("b");
        room.add_client("a", a).unwrap();
        room.add_client("b", b).unwrap();

        room.forward(message_from("a"));

        assert_eq!(a_sent.lock().len(), 1);
        let b_sent = b_sent.lock();
        assert_eq!(b_sent.len(), 2);
        assert_eq!(b_sent[1].message_id(), Some("m1"));
    }

    #[test]
    fn test_forward_without_client_goes_to_handler() {
        let room = RoomTransport::new("room");
        let received = Arc::new(Mutex::new(Vec::new()));
        let out = received.clone();
        room.on_message(Arc::new(move |event| out.lock().push(event)));

        room.forward(SyncEvent::ready_for_sync(None));

        let received = received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].base.origin_transport_id.as_deref(), Some("room"));
    }

    #[test]
    fn test_held_client_misses_relays_until_released() {
        let room = RoomTransport::new("room");
        let (a, a_sent) = client("a");
        let (b, b_sent) = client("b");
        room.add_client("a", a).unwrap();
        room.add_client("b", b).unwrap();
        assert!(room.hold_relays("b"));
        assert!(!room.hold_relays("ghost"));

        room.forward(message_from("a"));
        room.send_to("b", SyncEvent::ready_for_sync(None)).unwrap();
        assert_eq!(b_sent.lock().len(), 2);
        assert_eq!(b_sent.lock()[1].event_type(), crate::event::EventType::ReadyForSync);

        assert!(room.release_relays("b"));
        room.forward(message_from("a"));
        assert_eq!(b_sent.lock().len(), 3);
        assert_eq!(a_sent.lock().len(), 1);
    }

    #[test]
    fn test_send_to_unknown_client() {
        let room = RoomTransport::new("room");
        let result = room.send_to("ghost", SyncEvent::ready_for_sync(None));
        assert!(matches!(result, Err(SyncError::UnknownTransport(_))));
    }

    #[test]
    fn test_remove_client_stops_delivery() {
        let room = RoomTransport::new("room");
        let (a, a_sent) = client("a");
        room.add_client("a", a).unwrap();
        assert!(room.remove_client("a").is_some());

        room.send(SyncEvent::ready_for_sync(None)).unwrap();
        assert_eq!(a_sent.lock().len(), 1);
        assert_eq!(room.client_count(), 0);
    }
}
