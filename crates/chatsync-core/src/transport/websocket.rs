//! Client transport to a sync server, with offline queueing
//!
//! ## Handshake
//!
//! ```text
//!  client                                   server
//!    │── connect ─────────────────────────────>│
//!    │   (load pending queue under lease)      │
//!    │<──────────────────── clientIdSync{id} ──│
//!    │── clientIdAck{id} ─────────────────────>│
//!    │── readyForSync{since} ─────────────────>│
//!    │<──────────── backlog events (buffered) ─│
//!    │<────────────────────────  readyForSync ─│
//!    │   resolve(pending, backlog)             │
//!    │── eventsBatch(send_to_server) ─────────>│
//!    │   replay send_to_client, clear queue    │
//!    │══════════════ Ready ════════════════════│
//! ```
//!
//! While not Ready, [`send`](Transport::send) hands events to the
//! [`PendingQueue`] and returns. The transport reconnects on its own with
//! capped exponential backoff until closed.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use super::{stamp_origin, HandlerSlot, MessageHandler, Transport};
use crate::error::{SyncError, SyncResult};
use crate::event::{EventPayload, EventType, SyncEvent};
use crate::lease::LockManager;
use crate::queue::PendingQueue;
use crate::resolver::resolve;

/// Lease serializing access to the pending queue across contexts
pub const PENDING_QUEUE_LEASE: &str = "chatsync:pending-queue";

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket
    Closed,
    /// Socket open, handshake in progress
    Syncing,
    /// Handshake done, events flow directly
    Ready,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Closed => write!(f, "closed"),
            ConnectionState::Syncing => write!(f, "syncing"),
            ConnectionState::Ready => write!(f, "ready"),
        }
    }
}

/// Backoff between reconnect attempts
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any delay
    pub max_delay: Duration,
    /// Growth factor per failed attempt
    pub multiplier: f64,
    /// Random spread applied to each delay, as a fraction (0.2 = ±20%)
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt.min(32) as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let spread = if self.jitter > 0.0 {
            rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64((capped * spread).clamp(0.0, self.max_delay.as_secs_f64()))
    }
}

/// Per-connection handshake state
struct Session {
    state: ConnectionState,
    outbound: Option<mpsc::UnboundedSender<String>>,
    client_id: Option<String>,
    acked: bool,
    ready_sent: bool,
    /// Local queue as read at connect time
    pending: Option<Vec<SyncEvent>>,
    /// Server events received before the server's readyForSync
    backlog: Vec<SyncEvent>,
    /// Sends issued while syncing; already in the queue as well
    queued_while_syncing: Vec<SyncEvent>,
    /// Newest server sequence applied locally, survives reconnects
    since: Option<u64>,
}

impl Session {
    fn new() -> Self {
        Self {
            state: ConnectionState::Closed,
            outbound: None,
            client_id: None,
            acked: false,
            ready_sent: false,
            pending: None,
            backlog: Vec::new(),
            queued_while_syncing: Vec::new(),
            since: None,
        }
    }

    fn reset(&mut self) {
        self.state = ConnectionState::Closed;
        self.outbound = None;
        self.acked = false;
        self.ready_sent = false;
        self.pending = None;
        self.backlog.clear();
        self.queued_while_syncing.clear();
    }

    fn observe(&mut self, seq: Option<u64>) {
        if let Some(seq) = seq {
            self.since = Some(self.since.map_or(seq, |s| s.max(seq)));
        }
    }

    fn transmit(&self, text: String) -> bool {
        match &self.outbound {
            Some(outbound) => outbound.send(text).is_ok(),
            None => false,
        }
    }
}

/// WebSocket client transport
pub struct WebSocketTransport {
    id: String,
    url: Url,
    queue: Arc<dyn PendingQueue>,
    locks: Arc<LockManager>,
    policy: ReconnectPolicy,
    handler: HandlerSlot,
    session: Mutex<Session>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl WebSocketTransport {
    /// Create a transport. Nothing happens until [`connect`](Self::connect).
    ///
    /// `locks` must be shared by every context that touches the same queue.
    pub fn new(
        id: impl Into<String>,
        url: &str,
        queue: Arc<dyn PendingQueue>,
        locks: Arc<LockManager>,
    ) -> SyncResult<Arc<Self>> {
        Self::with_policy(id, url, queue, locks, ReconnectPolicy::default())
    }

    pub fn with_policy(
        id: impl Into<String>,
        url: &str,
        queue: Arc<dyn PendingQueue>,
        locks: Arc<LockManager>,
        policy: ReconnectPolicy,
    ) -> SyncResult<Arc<Self>> {
        let url = Url::parse(url)?;
        Ok(Arc::new(Self {
            id: id.into(),
            url,
            queue,
            locks,
            policy,
            handler: HandlerSlot::default(),
            session: Mutex::new(Session::new()),
            state_tx: watch::channel(ConnectionState::Closed).0,
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }

    /// Start the connect/reconnect loop in the background
    pub fn connect(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() || self.closed.load(Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        *task = Some(tokio::spawn(async move { this.run().await }));
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch connection state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Wait until the handshake completed
    pub async fn wait_ready(&self) -> SyncResult<()> {
        let mut rx = self.state_tx.subscribe();
        rx.wait_for(|state| *state == ConnectionState::Ready)
            .await
            .map(|_| ())
            .map_err(|_| SyncError::Closed(self.id.clone()))
    }

    /// Client id assigned by the server, once known
    pub fn client_id(&self) -> Option<String> {
        self.session.lock().client_id.clone()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Newest server sequence applied locally
    pub fn last_seen(&self) -> Option<u64> {
        self.session.lock().since
    }

    /// Start from a sequence remembered by an earlier run, so the next
    /// handshake asks only for what came after it
    pub fn resume_from(&self, since: Option<u64>) {
        let mut session = self.session.lock();
        session.since = session.since.max(since);
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!(transport = %self.id, from = %previous, to = %state, "Connection state changed");
        }
    }

    async fn run(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        loop {
            info!(transport = %self.id, url = %self.url, "Connecting");
            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = tokio_tungstenite::connect_async(self.url.as_str()) => result,
            };
            match connected {
                Ok((stream, _)) => {
                    attempt = 0;
                    self.run_session(stream).await;
                }
                Err(e) => {
                    warn!(transport = %self.id, error = %e, "Connection failed");
                }
            }

            if self.shutdown.is_cancelled() {
                break;
            }
            let delay = self.policy.delay(attempt);
            attempt = attempt.saturating_add(1);
            debug!(transport = %self.id, ?delay, attempt, "Reconnecting after delay");
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.end_session();
    }

    async fn run_session(&self, stream: WebSocketStream<MaybeTlsStream<TcpStream>>) {
        let (mut ws_tx, mut ws_rx) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let writer = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        self.open_session(tx).await;

        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                frame = ws_rx.next() => frame,
            };
            match frame {
                Some(Ok(Message::Text(text))) => {
                    let text: String = text.to_string();
                    self.handle_frame(&text).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(transport = %self.id, error = %e, "Socket error");
                    break;
                }
            }
        }

        self.end_session();
        // outbound sender is gone, the writer drains and exits
        let _ = writer.await;
    }

    /// Socket is open: read the pending queue and enter Syncing
    async fn open_session(&self, outbound: mpsc::UnboundedSender<String>) {
        let pending = {
            let _lease = self.locks.request(PENDING_QUEUE_LEASE).await;
            self.queue.dequeue_pending()
        };
        debug!(transport = %self.id, pending = pending.len(), "Loaded pending queue");

        {
            let mut session = self.session.lock();
            session.reset();
            session.outbound = Some(outbound);
            session.pending = Some(pending);
            session.state = ConnectionState::Syncing;
            self.announce_ready(&mut session);
        }
        self.set_state(ConnectionState::Syncing);
    }

    fn end_session(&self) {
        self.session.lock().reset();
        self.set_state(ConnectionState::Closed);
    }

    /// Send readyForSync once the id is acknowledged and the queue is loaded
    fn announce_ready(&self, session: &mut Session) {
        if session.state != ConnectionState::Syncing
            || !session.acked
            || session.pending.is_none()
            || session.ready_sent
        {
            return;
        }
        let mut ready = SyncEvent::ready_for_sync(session.since);
        stamp_origin(&mut ready, &self.id);
        ready.base.origin_client_id = session.client_id.clone();
        match ready.to_json() {
            Ok(text) => {
                session.ready_sent = session.transmit(text);
            }
            Err(e) => warn!(transport = %self.id, error = %e, "Failed to encode readyForSync"),
        }
    }

    async fn handle_frame(&self, text: &str) {
        let mut event = match SyncEvent::from_json(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(transport = %self.id, error = %e, "Dropping malformed frame");
                return;
            }
        };
        stamp_origin(&mut event, &self.id);
        trace!(transport = %self.id, event_type = %event.event_type(), "Frame received");

        match event.event_type() {
            EventType::ClientIdSync => {
                let EventPayload::ClientIdSync { client_id } = &event.payload else {
                    return;
                };
                let mut session = self.session.lock();
                if session.state != ConnectionState::Syncing || session.acked {
                    warn!(transport = %self.id, "Protocol violation: unexpected clientIdSync");
                    return;
                }
                info!(transport = %self.id, %client_id, "Client id assigned");
                session.client_id = Some(client_id.clone());
                let mut ack = SyncEvent::client_id_ack(client_id.clone());
                stamp_origin(&mut ack, &self.id);
                match ack.to_json() {
                    Ok(text) => session.acked = session.transmit(text),
                    Err(e) => warn!(transport = %self.id, error = %e, "Failed to encode clientIdAck"),
                }
                self.announce_ready(&mut session);
            }
            EventType::ClientIdAck => {
                warn!(transport = %self.id, "Protocol violation: clientIdAck from server");
            }
            EventType::ReadyForSync => {
                let expected = {
                    let session = self.session.lock();
                    session.state == ConnectionState::Syncing && session.ready_sent
                };
                if expected {
                    self.complete_sync().await;
                } else {
                    warn!(transport = %self.id, "Protocol violation: unexpected readyForSync");
                }
            }
            _ => {
                let deliver = {
                    let mut session = self.session.lock();
                    match session.state {
                        ConnectionState::Syncing => {
                            session.backlog.push(event);
                            None
                        }
                        ConnectionState::Ready => {
                            session.observe(latest_seq(&event));
                            Some(event)
                        }
                        ConnectionState::Closed => None,
                    }
                };
                if let Some(event) = deliver {
                    self.handler.deliver(event);
                }
            }
        }
    }

    /// Server finished its backlog: resolve, deliver, go Ready
    async fn complete_sync(&self) {
        let (pending, backlog, client_id) = {
            let mut session = self.session.lock();
            let backlog = std::mem::take(&mut session.backlog);
            for event in &backlog {
                session.observe(latest_seq(event));
            }
            (
                session.pending.take().unwrap_or_default(),
                backlog,
                session.client_id.clone(),
            )
        };

        let resolution = resolve(pending, backlog);

        if !resolution.send_to_server.is_empty() {
            let mut batch = SyncEvent::batch(resolution.send_to_server);
            stamp_origin(&mut batch, &self.id);
            batch.base.origin_client_id = client_id;
            match batch.to_json() {
                Ok(text) => {
                    if !self.session.lock().transmit(text) {
                        warn!(transport = %self.id, "Socket closed before sync batch was sent");
                        return;
                    }
                }
                Err(e) => {
                    warn!(transport = %self.id, error = %e, "Failed to encode sync batch");
                    return;
                }
            }
        }

        for mut event in resolution.send_to_client {
            stamp_origin(&mut event, &self.id);
            self.handler.deliver(event);
        }

        let queued = {
            let _lease = self.locks.request(PENDING_QUEUE_LEASE).await;
            let mut session = self.session.lock();
            if session.state != ConnectionState::Syncing {
                // socket dropped meanwhile, keep the queue for the next attempt
                return;
            }
            self.queue.clear_pending();
            session.state = ConnectionState::Ready;
            std::mem::take(&mut session.queued_while_syncing)
        };
        self.set_state(ConnectionState::Ready);
        info!(transport = %self.id, flushed = queued.len(), "Sync complete");

        for event in queued {
            if let Err(e) = self.send(event) {
                warn!(transport = %self.id, error = %e, "Failed to flush queued event");
            }
        }
    }
}

/// Newest server sequence carried by an event or any batch member
fn latest_seq(event: &SyncEvent) -> Option<u64> {
    match &event.payload {
        EventPayload::EventsBatch { events } => events
            .iter()
            .map(latest_seq)
            .fold(event.base.server_seq, Option::max),
        _ => event.base.server_seq,
    }
}

impl Transport for WebSocketTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn send(&self, event: SyncEvent) -> SyncResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            debug!(transport = %self.id, event_type = %event.event_type(), "Closed, queueing event");
            self.queue.enqueue_pending(event);
            return Ok(());
        }

        let mut session = self.session.lock();
        if session.state == ConnectionState::Ready {
            let mut outgoing = event.clone();
            stamp_origin(&mut outgoing, &self.id);
            if outgoing.base.origin_client_id.is_none() {
                outgoing.base.origin_client_id = session.client_id.clone();
            }
            if session.transmit(outgoing.to_json()?) {
                return Ok(());
            }
        }

        debug!(transport = %self.id, state = %session.state, event_type = %event.event_type(), "Queueing event");
        if session.state == ConnectionState::Syncing {
            session.queued_while_syncing.push(event.clone());
        }
        self.queue.enqueue_pending(event);
        Ok(())
    }

    fn on_message(&self, handler: MessageHandler) {
        self.handler.set(handler);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.end_session();
        self.handler.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Message;
    use crate::queue::MemoryPendingQueue;

    struct Harness {
        transport: Arc<WebSocketTransport>,
        queue: Arc<MemoryPendingQueue>,
        wire: mpsc::UnboundedReceiver<String>,
        delivered: Arc<Mutex<Vec<SyncEvent>>>,
    }

    impl Harness {
        fn new() -> Self {
            let queue = Arc::new(MemoryPendingQueue::new());
            let transport = WebSocketTransport::new(
                "ws",
                "ws://127.0.0.1:1/sync",
                queue.clone(),
                Arc::new(LockManager::new()),
            )
            .unwrap();
            let delivered = Arc::new(Mutex::new(Vec::new()));
            let out = delivered.clone();
            transport.on_message(Arc::new(move |event| out.lock().push(event)));
            let (_tx, wire) = mpsc::unbounded_channel();
            Self {
                transport,
                queue,
                wire,
                delivered,
            }
        }

        async fn open(&mut self) {
            let (tx, wire) = mpsc::unbounded_channel();
            self.wire = wire;
            self.transport.open_session(tx).await;
        }

        async fn server_says(&self, event: SyncEvent) {
            self.transport
                .handle_frame(&event.to_json().unwrap())
                .await;
        }

        fn sent(&mut self) -> Vec<SyncEvent> {
            let mut out = Vec::new();
            while let Ok(text) = self.wire.try_recv() {
                out.push(SyncEvent::from_json(&text).unwrap());
            }
            out
        }

        async fn handshake(&mut self) {
            self.open().await;
            self.server_says(SyncEvent::client_id_sync("client-1")).await;
            self.server_says(SyncEvent::ready_for_sync(None)).await;
        }
    }

    fn from_server(mut event: SyncEvent, seq: u64) -> SyncEvent {
        event.base.server_seq = Some(seq);
        event
    }

    fn add(ts: i64, index: u64, id: &str) -> SyncEvent {
        SyncEvent::at(
            ts,
            EventPayload::AddMessage {
                conversation_id: "c1".to_string(),
                message_index: index,
                message: Message::new(id),
            },
        )
    }

    #[test]
    fn test_policy_backoff_is_capped() {
        let policy = ReconnectPolicy {
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(policy.delay(0), Duration::from_millis(500));
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(20), Duration::from_secs(30));
    }

    #[test]
    fn test_policy_jitter_stays_in_bounds() {
        let policy = ReconnectPolicy::default();
        for _ in 0..50 {
            let delay = policy.delay(2);
            assert!(delay >= Duration::from_millis(1600));
            assert!(delay <= Duration::from_millis(2400));
        }
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let result = WebSocketTransport::new(
            "ws",
            "not a url",
            Arc::new(MemoryPendingQueue::new()),
            Arc::new(LockManager::new()),
        );
        assert!(matches!(result, Err(SyncError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_send_while_closed_queues_original_event() {
        let harness = Harness::new();
        let event = add(5, 0, "m1");

        harness.transport.send(event.clone()).unwrap();

        assert_eq!(harness.queue.dequeue_pending(), vec![event]);
        assert!(harness.delivered.lock().is_empty());
    }

    #[tokio::test]
    async fn test_handshake_sequence() {
        let mut harness = Harness::new();
        harness.open().await;
        assert_eq!(harness.transport.state(), ConnectionState::Syncing);
        assert!(harness.sent().is_empty());

        harness.server_says(SyncEvent::client_id_sync("client-1")).await;
        let sent = harness.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            sent[0].payload,
            EventPayload::ClientIdAck {
                client_id: "client-1".to_string()
            }
        );
        assert_eq!(sent[1].payload, EventPayload::ReadyForSync { since: None });
        assert_eq!(harness.transport.client_id().as_deref(), Some("client-1"));

        harness.server_says(SyncEvent::ready_for_sync(None)).await;
        assert_eq!(harness.transport.state(), ConnectionState::Ready);
        // nothing pending, nothing to batch
        assert!(harness.sent().is_empty());
    }

    #[tokio::test]
    async fn test_pending_events_are_batched_and_cleared() {
        let mut harness = Harness::new();
        harness.transport.send(add(1, 0, "offline-1")).unwrap();
        harness.transport.send(add(2, 1, "offline-2")).unwrap();

        harness.handshake().await;

        let sent = harness.sent();
        let batch = sent.last().unwrap();
        match &batch.payload {
            EventPayload::EventsBatch { events } => assert_eq!(events.len(), 2),
            other => panic!("expected batch, got {:?}", other),
        }
        assert_eq!(batch.base.origin_client_id.as_deref(), Some("client-1"));
        assert!(harness.queue.is_empty());
    }

    #[tokio::test]
    async fn test_backlog_is_buffered_until_ready() {
        let mut harness = Harness::new();
        harness.open().await;
        harness.server_says(SyncEvent::client_id_sync("client-1")).await;
        harness.server_says(from_server(add(10, 0, "from-server"), 7)).await;
        assert!(harness.delivered.lock().is_empty());

        harness.server_says(SyncEvent::ready_for_sync(None)).await;
        let delivered = harness.delivered.lock();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].message_id(), Some("from-server"));
        assert_eq!(delivered[0].base.origin_transport_id.as_deref(), Some("ws"));
        drop(delivered);

        // next handshake asks only for newer events
        harness.transport.end_session();
        harness.open().await;
        harness.server_says(SyncEvent::client_id_sync("client-1")).await;
        let sent = harness.sent();
        assert_eq!(sent[1].payload, EventPayload::ReadyForSync { since: Some(7) });
    }

    #[tokio::test]
    async fn test_watermark_follows_server_order_not_clocks() {
        let mut harness = Harness::new();
        harness.handshake().await;

        // a late offline flush: old producer clock, newer server position
        harness.server_says(from_server(add(500, 0, "newer-clock"), 3)).await;
        harness.server_says(from_server(add(100, 1, "older-clock"), 4)).await;
        assert_eq!(harness.transport.last_seen(), Some(4));

        harness
            .server_says(SyncEvent::batch(vec![from_server(add(1, 2, "batched"), 9)]))
            .await;
        assert_eq!(harness.transport.last_seen(), Some(9));

        // events the server never sequenced leave the watermark alone
        harness.server_says(add(9_999, 3, "unsequenced")).await;
        assert_eq!(harness.transport.last_seen(), Some(9));
    }

    #[tokio::test]
    async fn test_resume_from_seeds_first_handshake() {
        let mut harness = Harness::new();
        harness.transport.resume_from(Some(42));
        harness.transport.resume_from(None);
        harness.open().await;
        harness.server_says(SyncEvent::client_id_sync("client-1")).await;

        let sent = harness.sent();
        assert_eq!(sent[1].payload, EventPayload::ReadyForSync { since: Some(42) });
    }

    #[tokio::test]
    async fn test_ready_events_go_straight_out() {
        let mut harness = Harness::new();
        harness.handshake().await;
        harness.sent();

        harness.transport.send(add(3, 0, "live")).unwrap();
        let sent = harness.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].base.origin_client_id.as_deref(), Some("client-1"));
        assert!(harness.queue.is_empty());

        harness.server_says(add(4, 1, "pushed")).await;
        assert_eq!(harness.delivered.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_sends_during_sync_are_flushed_after_ready() {
        let mut harness = Harness::new();
        harness.open().await;
        harness.server_says(SyncEvent::client_id_sync("client-1")).await;
        harness.sent();

        let during = add(7, 0, "during-sync");
        harness.transport.send(during.clone()).unwrap();
        assert_eq!(harness.queue.len(), 1);

        harness.server_says(SyncEvent::ready_for_sync(None)).await;
        let sent = harness.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message_id(), Some("during-sync"));
        assert!(harness.queue.is_empty());
    }

    #[tokio::test]
    async fn test_out_of_sequence_controls_are_ignored() {
        let mut harness = Harness::new();
        harness.open().await;

        // readyForSync before our own was sent
        harness.server_says(SyncEvent::ready_for_sync(None)).await;
        assert_eq!(harness.transport.state(), ConnectionState::Syncing);

        harness.server_says(SyncEvent::client_id_ack("x")).await;
        harness.server_says(SyncEvent::client_id_sync("client-1")).await;
        harness.server_says(SyncEvent::client_id_sync("client-2")).await;
        assert_eq!(harness.transport.client_id().as_deref(), Some("client-1"));
        assert_eq!(harness.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_collision_with_backlog_branches() {
        let mut harness = Harness::new();
        harness.transport.send(add(20, 1, "mine")).unwrap();

        harness.open().await;
        harness.server_says(SyncEvent::client_id_sync("client-1")).await;
        harness.server_says(add(10, 1, "theirs").from_client("other")).await;
        harness.server_says(SyncEvent::ready_for_sync(None)).await;

        let delivered = harness.delivered.lock();
        assert!(delivered
            .iter()
            .any(|e| matches!(e.payload, EventPayload::CreateConversationBranch { .. })));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let harness = Harness::new();
        harness.transport.close();
        harness.transport.close();
        assert_eq!(harness.transport.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_send_after_close_still_queues() {
        let harness = Harness::new();
        harness.transport.close();

        let late = add(1, 0, "late");
        harness.transport.send(late.clone()).unwrap();
        assert_eq!(harness.queue.dequeue_pending(), vec![late]);
    }
}
