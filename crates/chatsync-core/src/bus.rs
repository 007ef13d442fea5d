//! Event bus: typed handlers, transports and pipes
//!
//! ```text
//!             ┌──────────────── EventBus ────────────────┐
//!  transport ─┤ incoming ─> handlers[type] (isolated)    │
//!     "ws"    │          └─> pipes from "ws" ─> transform ├─> transport "tabs"
//!             │                                          │
//!  emit(e) ───┤ stamp timestamp ─> every transport.send  │
//!             └──────────────────────────────────────────┘
//! ```
//!
//! Inbound events must carry `originTransportId`; pipes route on it. Batches
//! are expanded before dispatch so handlers only ever see concrete events.
//! A failing or panicking handler is logged and does not affect other
//! handlers or the pipes.
//!
//! # Example
//!
//! ```ignore
//! let bus = EventBus::new();
//! bus.add_transport(ws.clone())?;
//! bus.add_transport(tabs.clone())?;
//! bus.add_pipe("ws", "tabs", None)?;
//! bus.on(EventType::AddMessage, |event| {
//!     println!("{:?}", event.message_id());
//!     Ok(())
//! });
//! ```

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, error, trace, warn};

use crate::error::{SyncError, SyncResult};
use crate::event::{EventType, SyncEvent};
use crate::transport::Transport;
use crate::types::now_millis;

/// Application callback for one event type
pub type EventHandler = Arc<dyn Fn(&SyncEvent) -> anyhow::Result<()> + Send + Sync>;

/// Rewrites events travelling along a pipe
pub type Transform = Arc<dyn Fn(SyncEvent) -> SyncEvent + Send + Sync>;

/// Handle returned by [`EventBus::on`], used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Pipe {
    from: String,
    to: String,
    transform: Option<Transform>,
}

#[derive(Default)]
struct Registry {
    transports: Vec<Arc<dyn Transport>>,
    handlers: HashMap<EventType, Vec<(HandlerId, EventHandler)>>,
    pipes: Vec<Pipe>,
    destroyed: bool,
}

impl Registry {
    fn transport(&self, id: &str) -> Option<&Arc<dyn Transport>> {
        self.transports.iter().find(|t| t.id() == id)
    }
}

/// Routes events between transports and application handlers
pub struct EventBus {
    registry: Arc<RwLock<Registry>>,
    next_handler: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(RwLock::new(Registry::default())),
            next_handler: AtomicU64::new(1),
        }
    }

    /// Register a transport and start receiving from it
    pub fn add_transport(&self, transport: Arc<dyn Transport>) -> SyncResult<()> {
        let mut registry = self.registry.write();
        if registry.destroyed {
            return Err(SyncError::Closed("event bus".to_string()));
        }
        if registry.transport(transport.id()).is_some() {
            return Err(SyncError::DuplicateTransport(transport.id().to_string()));
        }

        let weak: Weak<RwLock<Registry>> = Arc::downgrade(&self.registry);
        transport.on_message(Arc::new(move |event| {
            if let Some(registry) = weak.upgrade() {
                dispatch(&registry, event);
            }
        }));
        debug!(transport = %transport.id(), "Transport registered");
        registry.transports.push(transport);
        Ok(())
    }

    /// Unregister and close a transport, dropping its pipes
    pub fn remove_transport(&self, id: &str) -> bool {
        let removed = {
            let mut registry = self.registry.write();
            let position = registry.transports.iter().position(|t| t.id() == id);
            registry.pipes.retain(|p| p.from != id && p.to != id);
            position.map(|i| registry.transports.remove(i))
        };
        match removed {
            Some(transport) => {
                transport.close();
                true
            }
            None => false,
        }
    }

    /// Forward every event arriving on `from` to `to`, optionally rewritten
    pub fn add_pipe(&self, from: &str, to: &str, transform: Option<Transform>) -> SyncResult<()> {
        let mut registry = self.registry.write();
        for id in [from, to] {
            if registry.transport(id).is_none() {
                return Err(SyncError::UnknownTransport(id.to_string()));
            }
        }
        if registry.pipes.iter().any(|p| p.from == from && p.to == to) {
            return Err(SyncError::DuplicatePipe {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        registry.pipes.push(Pipe {
            from: from.to_string(),
            to: to.to_string(),
            transform,
        });
        debug!(from, to, "Pipe registered");
        Ok(())
    }

    pub fn remove_pipe(&self, from: &str, to: &str) -> bool {
        let mut registry = self.registry.write();
        let before = registry.pipes.len();
        registry.pipes.retain(|p| !(p.from == from && p.to == to));
        registry.pipes.len() != before
    }

    /// Subscribe to one event type
    pub fn on<F>(&self, event_type: EventType, handler: F) -> HandlerId
    where
        F: Fn(&SyncEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        self.registry
            .write()
            .handlers
            .entry(event_type)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Unsubscribe. Returns false when the handler was not registered.
    pub fn off(&self, event_type: EventType, id: HandlerId) -> bool {
        let mut registry = self.registry.write();
        let Some(handlers) = registry.handlers.get_mut(&event_type) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    /// Stamp the current time and send to every transport.
    ///
    /// Returns how many transports accepted the event. Per-transport
    /// failures are logged.
    pub fn emit(&self, mut event: SyncEvent) -> usize {
        event.base.timestamp = now_millis();
        let transports = self.registry.read().transports.clone();

        let mut accepted = 0;
        for transport in transports {
            match transport.send(event.clone()) {
                Ok(()) => accepted += 1,
                Err(e) => {
                    warn!(transport = %transport.id(), event_type = %event.event_type(), error = %e, "Transport rejected event")
                }
            }
        }
        trace!(event_type = %event.event_type(), accepted, "Event emitted");
        accepted
    }

    /// Process an event as if a transport had delivered it
    pub fn handle_incoming(&self, event: SyncEvent) {
        dispatch(&self.registry, event);
    }

    /// Close every transport and drop all registrations. Safe to call twice.
    pub fn destroy(&self) {
        let transports = {
            let mut registry = self.registry.write();
            if registry.destroyed {
                return;
            }
            registry.destroyed = true;
            registry.handlers.clear();
            registry.pipes.clear();
            std::mem::take(&mut registry.transports)
        };
        for transport in transports {
            transport.close();
        }
        debug!("Event bus destroyed");
    }

    pub fn transport_ids(&self) -> Vec<String> {
        self.registry
            .read()
            .transports
            .iter()
            .map(|t| t.id().to_string())
            .collect()
    }

    pub fn handler_count(&self, event_type: EventType) -> usize {
        self.registry
            .read()
            .handlers
            .get(&event_type)
            .map_or(0, Vec::len)
    }

    pub fn pipe_count(&self) -> usize {
        self.registry.read().pipes.len()
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn dispatch(registry: &Arc<RwLock<Registry>>, event: SyncEvent) {
    if !event.has_origin() {
        warn!(event_type = %event.event_type(), "Protocol violation: inbound event without originTransportId");
        return;
    }

    for event in event.flatten() {
        deliver(registry, event);
    }
}

fn deliver(registry: &Arc<RwLock<Registry>>, event: SyncEvent) {
    let event_type = event.event_type();

    // snapshot so handlers may (un)subscribe or emit while running
    let (handlers, pipes) = {
        let registry = registry.read();
        if registry.destroyed {
            return;
        }
        let handlers: Vec<EventHandler> = registry
            .handlers
            .get(&event_type)
            .map(|hs| hs.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        let origin = event.base.origin_transport_id.as_deref().unwrap_or_default();
        let pipes: Vec<(Arc<dyn Transport>, Option<Transform>)> = registry
            .pipes
            .iter()
            .filter(|p| p.from == origin)
            .filter_map(|p| {
                registry
                    .transport(&p.to)
                    .map(|t| (t.clone(), p.transform.clone()))
            })
            .collect();
        (handlers, pipes)
    };

    for handler in handlers {
        match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(%event_type, error = %e, "Event handler failed");
            }
            Err(_) => {
                error!(%event_type, "Event handler panicked");
            }
        }
    }

    for (target, transform) in pipes {
        let piped = match &transform {
            Some(transform) => transform(event.clone()),
            None => event.clone(),
        };
        if let Err(e) = target.send(piped) {
            warn!(to = %target.id(), %event_type, error = %e, "Pipe delivery failed");
        }
    }
}
