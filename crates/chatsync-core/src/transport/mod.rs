//! Transports move events between a bus and the outside world
//!
//! Every transport has a stable id, accepts outbound events through
//! [`Transport::send`] and delivers inbound events to the single handler
//! installed with [`Transport::on_message`]. Both directions stamp
//! `originTransportId` with the transport's own id, which is what the bus
//! routes pipes on.
//!
//! | Transport | Peer |
//! |-----------|------|
//! | [`ForwardingTransport`] | host-driven sink, e.g. one server-side socket |
//! | [`BroadcastTransport`] | other contexts on a named in-process channel |
//! | [`WebSocketTransport`] | a sync server, with offline queueing |
//! | [`RoomTransport`] | many client transports on the server side |

mod broadcast;
mod forwarding;
mod room;
mod websocket;

pub use broadcast::BroadcastTransport;
pub use forwarding::{ForwardingTransport, Sink};
pub use room::RoomTransport;
pub use websocket::{ConnectionState, ReconnectPolicy, WebSocketTransport, PENDING_QUEUE_LEASE};

use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::SyncResult;
use crate::event::SyncEvent;

/// Inbound event callback
pub type MessageHandler = Arc<dyn Fn(SyncEvent) + Send + Sync>;

/// A bidirectional event channel with a stable id
pub trait Transport: Send + Sync {
    /// Stable identifier, unique within a bus
    fn id(&self) -> &str;

    /// Queue an event for the peer. Never blocks.
    fn send(&self, event: SyncEvent) -> SyncResult<()>;

    /// Install the inbound handler, replacing any previous one
    fn on_message(&self, handler: MessageHandler);

    /// Stop delivering in both directions. Safe to call twice.
    fn close(&self);
}

/// Single-handler slot shared by the transports
#[derive(Default)]
pub(crate) struct HandlerSlot {
    handler: RwLock<Option<MessageHandler>>,
}

impl HandlerSlot {
    pub(crate) fn set(&self, handler: MessageHandler) {
        *self.handler.write() = Some(handler);
    }

    pub(crate) fn clear(&self) {
        *self.handler.write() = None;
    }

    /// Hand the event to the handler. Returns false when none is installed.
    pub(crate) fn deliver(&self, event: SyncEvent) -> bool {
        // clone out so the handler may replace itself
        let handler = self.handler.read().clone();
        match handler {
            Some(handler) => {
                handler(event);
                true
            }
            None => false,
        }
    }
}

/// Overwrite the event's origin with the transport id
pub(crate) fn stamp_origin(event: &mut SyncEvent, transport_id: &str) {
    event.base.origin_transport_id = Some(transport_id.to_string());
}
