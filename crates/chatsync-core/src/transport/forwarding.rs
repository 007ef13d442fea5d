use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use super::{stamp_origin, HandlerSlot, MessageHandler, Transport};
use crate::error::{SyncError, SyncResult};
use crate::event::SyncEvent;

/// Outbound callback receiving serialized events
pub type Sink = Arc<dyn Fn(String) -> SyncResult<()> + Send + Sync>;

/// Transport driven by its host.
///
/// The host pushes inbound events in through [`forward`](Self::forward) and
/// receives outbound events as JSON text through the installed sink. Outbound
/// events are dropped until the host marks the transport ready and installs a
/// sink; there is no retry.
pub struct ForwardingTransport {
    id: String,
    handler: HandlerSlot,
    sink: RwLock<Option<Sink>>,
    ready: AtomicBool,
    closed: AtomicBool,
}

impl ForwardingTransport {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            handler: HandlerSlot::default(),
            sink: RwLock::new(None),
            ready: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Install the outbound sink
    pub fn set_sink<F>(&self, sink: F)
    where
        F: Fn(String) -> SyncResult<()> + Send + Sync + 'static,
    {
        *self.sink.write() = Some(Arc::new(sink));
    }

    pub fn clear_sink(&self) {
        *self.sink.write() = None;
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Deliver an event coming from the host side.
    ///
    /// `owner_id`, when given, is stamped onto the event before delivery.
    pub fn forward(&self, mut event: SyncEvent, owner_id: Option<&str>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(owner) = owner_id {
            event.base.owner_id = Some(owner.to_string());
        }
        stamp_origin(&mut event, &self.id);
        if !self.handler.deliver(event) {
            debug!(transport = %self.id, "No handler installed, dropping inbound event");
        }
    }
}

impl Transport for ForwardingTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn send(&self, mut event: SyncEvent) -> SyncResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Closed(self.id.clone()));
        }
        let sink = self.sink.read().clone();
        let sink = match sink {
            Some(sink) if self.is_ready() => sink,
            _ => {
                debug!(transport = %self.id, event_type = %event.event_type(), "Not ready, dropping outbound event");
                return Err(SyncError::TransportUnavailable(self.id.clone()));
            }
        };

        stamp_origin(&mut event, &self.id);
        let text = event.to_json()?;
        trace!(transport = %self.id, bytes = text.len(), "Forwarding event");
        sink(text)
    }

    fn on_message(&self, handler: MessageHandler) {
        self.handler.set(handler);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ready.store(false, Ordering::SeqCst);
        self.clear_sink();
        self.handler.clear();
    }
}
