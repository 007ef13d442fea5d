//! Chatsync Core Library
//!
//! Event bus, transports, leader election and conflict resolution for
//! offline-first chat clients.
//!
//! ## Overview
//!
//! A chat client keeps working while offline. Everything it does is an
//! event ([`SyncEvent`]); events flow through an [`EventBus`] that connects
//! application handlers to transports. When the client comes back online the
//! [`WebSocketTransport`] replays what it queued, merges it with what the
//! server saw in the meantime and forks conversations whose message indices
//! collided instead of dropping either side's messages.
//!
//! ## Core Pieces
//!
//! - **Event bus**: typed handlers, transport registry, one-way pipes
//! - **Transports**: forwarding, in-process broadcast, WebSocket client,
//!   server-side room
//! - **Leader coordination**: one leader per worker group, RPC from tabs
//! - **Resolver**: pure merge of local and remote event queues
//!
//! ## Quick Start
//!
//! ```ignore
//! use chatsync_core::{EventBus, EventType, MemoryPendingQueue, LockManager, WebSocketTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ws = WebSocketTransport::new(
//!         "ws",
//!         "ws://127.0.0.1:8787/sync",
//!         Arc::new(MemoryPendingQueue::new()),
//!         Arc::new(LockManager::new()),
//!     )?;
//!
//!     let bus = EventBus::new();
//!     bus.add_transport(ws.clone())?;
//!     bus.on(EventType::AddMessage, |event| {
//!         println!("new message: {:?}", event.message_id());
//!         Ok(())
//!     });
//!
//!     ws.connect();
//!     ws.wait_ready().await?;
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod error;
pub mod event;
pub mod hub;
pub mod leader;
pub mod lease;
pub mod queue;
pub mod resolver;
pub mod transport;
pub mod types;

// Re-exports
pub use bus::{EventBus, EventHandler, HandlerId, Transform};
pub use error::{SyncError, SyncResult};
pub use event::{
    BaseEvent, EventPayload, EventType, Message, MessagePart, MessageUpdate, StreamKind, SyncEvent,
};
pub use hub::{BroadcastHub, ChannelEndpoint, ChannelReceiver};
pub use leader::{
    join, spawn_candidate, CandidateHandle, ControlMessage, Coordination, CoordinatorConfig,
    RpcRouter, TabClient, TabContext,
};
pub use lease::{Lease, LockManager};
pub use queue::{MemoryPendingQueue, PendingQueue};
pub use resolver::{resolve, Resolution};
pub use transport::{
    BroadcastTransport, ConnectionState, ForwardingTransport, MessageHandler, ReconnectPolicy,
    RoomTransport, Transport, WebSocketTransport,
};
pub use types::*;
