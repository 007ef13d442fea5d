//! WebSocket relay server
//!
//! Every socket becomes a [`ForwardingTransport`] registered with one shared
//! [`RoomTransport`]. The room assigns each connection its client id and fans
//! events out to everyone except their producer. Relayed events are kept in
//! a bounded history so a client answering `readyForSync` receives whatever
//! it missed while offline.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chatsync_core::{
    new_id, now_millis, EventPayload, ForwardingTransport, RoomTransport, SyncError, SyncEvent,
    SyncResult, Transport,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;

/// Relayed events in arrival order, each tagged with a server sequence
struct Log {
    next_seq: u64,
    events: VecDeque<SyncEvent>,
}

impl Log {
    fn append(&mut self, mut event: SyncEvent, limit: usize) -> SyncEvent {
        event.base.server_seq = Some(self.next_seq);
        self.next_seq += 1;
        self.events.push_back(event.clone());
        while self.events.len() > limit {
            self.events.pop_front();
        }
        event
    }

    fn since(&self, since: Option<u64>) -> Vec<SyncEvent> {
        self.events
            .iter()
            .filter(|e| match (since, e.base.server_seq) {
                (None, _) => true,
                (Some(since), Some(seq)) => seq > since,
                (Some(_), None) => false,
            })
            .cloned()
            .collect()
    }
}

/// Bounded log of relayed events
pub struct History {
    log: Mutex<Log>,
    limit: usize,
}

impl History {
    /// `first_seq` is the sequence given to the first appended event
    pub fn new(limit: usize, first_seq: u64) -> Self {
        Self {
            log: Mutex::new(Log {
                next_seq: first_seq,
                events: VecDeque::new(),
            }),
            limit,
        }
    }

    /// Events sequenced strictly after `since`, or everything when it is `None`
    pub fn since(&self, since: Option<u64>) -> Vec<SyncEvent> {
        self.log.lock().since(since)
    }

    pub fn len(&self) -> usize {
        self.log.lock().events.len()
    }
}

/// First sequence of a fresh server. The history is not persisted, but
/// clients remember sequences across runs, so a restarted server starts
/// above anything it handed out before.
fn initial_seq() -> u64 {
    u64::try_from(now_millis())
        .unwrap_or_default()
        .saturating_mul(1_000)
}

#[derive(Clone)]
pub struct AppState {
    pub room: Arc<RoomTransport>,
    pub history: Arc<History>,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Self {
        let room = RoomTransport::new("room");
        room.on_message(Arc::new(|event: SyncEvent| {
            debug!(event_type = %event.event_type(), "Room received an event with no client");
        }));
        Self {
            room,
            history: Arc::new(History::new(config.history_limit, initial_seq())),
        }
    }

    /// Register a connection. It gets `clientIdSync` right away but no
    /// relayed events until its backlog was replayed.
    pub fn join(&self, client_id: &str, transport: Arc<dyn Transport>) -> SyncResult<()> {
        // relays append and forward under the log lock
        let _log = self.history.log.lock();
        self.room.add_client(client_id, transport)?;
        self.room.hold_relays(client_id);
        Ok(())
    }

    pub fn leave(&self, client_id: &str) {
        self.room.remove_client(client_id);
    }

    /// Sequence and record an event from `client_id`, then relay it
    pub fn relay(&self, client_id: &str, event: SyncEvent) {
        let mut log = self.history.log.lock();
        for mut member in event.flatten() {
            member.base.origin_client_id = Some(client_id.to_string());
            let member = log.append(member, self.history.limit);
            self.room.forward(member);
        }
    }

    /// Send everything after `since`, answer `readyForSync` and switch the
    /// client to live relays. Returns the number of replayed events.
    pub fn replay(&self, client_id: &str, since: Option<u64>) -> SyncResult<usize> {
        let log = self.history.log.lock();
        let backlog = log.since(since);
        let replayed = backlog.len();
        for event in backlog {
            self.room.send_to(client_id, event)?;
        }
        self.room
            .send_to(client_id, SyncEvent::ready_for_sync(None))?;
        self.room.release_relays(client_id);
        Ok(replayed)
    }
}

pub fn router(config: &ServerConfig, state: AppState) -> Router {
    Router::new()
        .route(&config.path, get(ws_handler))
        .with_state(state)
}

/// Bind and serve until the process is stopped
pub async fn run(config: ServerConfig) -> Result<()> {
    let state = AppState::new(&config);
    let app = router(&config, state);
    let listener = TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;
    info!(addr = %listener.local_addr()?, path = %config.path, "Chatsync server listening");

    axum::serve(listener, app).await?;
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let client_id = new_id();
    let transport = ForwardingTransport::new(format!("client:{}", client_id));
    transport.set_sink(move |text| {
        tx.send(text)
            .map_err(|_| SyncError::Closed("socket writer".to_string()))
    });
    transport.set_ready(true);

    if let Err(e) = state.join(&client_id, transport.clone()) {
        warn!(%client_id, error = %e, "Failed to register client");
        writer.abort();
        return;
    }

    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_frame(&state, &client_id, text.as_str()),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(%client_id, error = %e, "Socket error");
                break;
            }
        }
    }

    state.leave(&client_id);
    transport.close();
    writer.abort();
}

fn handle_frame(state: &AppState, client_id: &str, text: &str) {
    let event = match SyncEvent::from_json(text) {
        Ok(event) => event,
        Err(e) => {
            warn!(%client_id, error = %e, "Dropping malformed frame");
            return;
        }
    };

    match event.payload {
        EventPayload::ClientIdAck { client_id: acked } => {
            if acked != client_id {
                warn!(%client_id, %acked, "Client acknowledged a different id");
            }
        }
        EventPayload::ReadyForSync { since } => match state.replay(client_id, since) {
            Ok(replayed) => info!(
                %client_id,
                ?since,
                replayed,
                history = state.history.len(),
                "Client ready, backlog replayed"
            ),
            Err(e) => warn!(%client_id, error = %e, "Failed to replay backlog"),
        },
        EventPayload::ClientIdSync { .. } => {
            warn!(%client_id, "Client sent a server-only control event");
        }
        _ => state.relay(client_id, event),
    }
}
