//! End-to-end tests of the WebSocket transport against a room server
//!
//! The server here is a small tokio-tungstenite acceptor that hosts a
//! `RoomTransport`, keeps every relayed event as history and answers the
//! client's `readyForSync` with the backlog sequenced after `since`.

use std::sync::Arc;
use std::time::Duration;

use chatsync_core::{
    new_id, ConnectionState, EventBus, EventPayload, EventType, ForwardingTransport, LockManager,
    MemoryPendingQueue, Message, PendingQueue, ReconnectPolicy, RoomTransport, SyncError,
    SyncEvent, Transport, WebSocketTransport,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;

// ============================================================================
// Test server
// ============================================================================

struct TestServer {
    url: String,
    history: Arc<Mutex<Vec<SyncEvent>>>,
    task: JoinHandle<()>,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn start_server() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/sync", listener.local_addr().unwrap());
    let room = RoomTransport::new("room");
    let history = Arc::new(Mutex::new(Vec::new()));

    let task = {
        let history = history.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_client(stream, room.clone(), history.clone()));
            }
        })
    };

    TestServer { url, history, task }
}

async fn serve_client(
    stream: TcpStream,
    room: Arc<RoomTransport>,
    history: Arc<Mutex<Vec<SyncEvent>>>,
) {
    let Ok(socket) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let client_id = new_id();
    let transport = ForwardingTransport::new(format!("client:{}", client_id));
    transport.set_sink(move |text| {
        out_tx
            .send(text)
            .map_err(|_| SyncError::Closed("socket".to_string()))
    });
    transport.set_ready(true);
    room.add_client(&client_id, transport.clone()).unwrap();

    while let Some(Ok(frame)) = ws_rx.next().await {
        let WsMessage::Text(text) = frame else {
            continue;
        };
        let text: String = text.to_string();
        let Ok(event) = SyncEvent::from_json(&text) else {
            continue;
        };
        match event.payload {
            EventPayload::ClientIdAck { .. } => {}
            EventPayload::ReadyForSync { since } => {
                let backlog: Vec<SyncEvent> = history
                    .lock()
                    .iter()
                    .filter(|e| since.map_or(true, |s| e.base.server_seq > Some(s)))
                    .cloned()
                    .collect();
                for event in backlog {
                    let _ = transport.send(event);
                }
                let _ = transport.send(SyncEvent::ready_for_sync(None));
            }
            _ => {
                for mut member in event.flatten() {
                    member.base.origin_client_id = Some(client_id.clone());
                    {
                        let mut history = history.lock();
                        member.base.server_seq = Some(history.len() as u64 + 1);
                        history.push(member.clone());
                    }
                    room.forward(member);
                }
            }
        }
    }
    room.remove_client(&client_id);
}

// ============================================================================
// Client helpers
// ============================================================================

struct Client {
    transport: Arc<WebSocketTransport>,
    queue: Arc<MemoryPendingQueue>,
    bus: EventBus,
    received: mpsc::UnboundedReceiver<SyncEvent>,
}

fn client(url: &str) -> Client {
    let queue = Arc::new(MemoryPendingQueue::new());
    let policy = ReconnectPolicy {
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        ..Default::default()
    };
    let transport = WebSocketTransport::with_policy(
        "ws",
        url,
        queue.clone(),
        Arc::new(LockManager::new()),
        policy,
    )
    .unwrap();

    let bus = EventBus::new();
    bus.add_transport(transport.clone()).unwrap();
    let (tx, received) = mpsc::unbounded_channel();
    for event_type in [EventType::AddMessage, EventType::CreateConversationBranch] {
        let tx = tx.clone();
        bus.on(event_type, move |event| {
            tx.send(event.clone())?;
            Ok(())
        });
    }

    Client {
        transport,
        queue,
        bus,
        received,
    }
}

impl Client {
    async fn connect(&self) {
        self.transport.connect();
        timeout(Duration::from_secs(5), self.transport.wait_ready())
            .await
            .expect("handshake finished in time")
            .unwrap();
    }

    async fn next(&mut self) -> SyncEvent {
        timeout(Duration::from_secs(5), self.received.recv())
            .await
            .expect("event arrived in time")
            .expect("bus alive")
    }
}

fn add(conversation: &str, index: u64, id: &str) -> SyncEvent {
    SyncEvent::new(EventPayload::AddMessage {
        conversation_id: conversation.to_string(),
        message_index: index,
        message: Message::new(id),
    })
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn live_events_relay_between_clients() {
    let _ = tracing_subscriber::fmt::try_init();
    let server = start_server().await;
    let alice = client(&server.url);
    let mut bob = client(&server.url);
    alice.connect().await;
    bob.connect().await;

    assert_eq!(alice.bus.emit(add("c1", 0, "hello")), 1);

    let event = bob.next().await;
    assert_eq!(event.message_id(), Some("hello"));
    assert_eq!(event.base.origin_transport_id.as_deref(), Some("ws"));
    assert_eq!(event.base.origin_client_id, alice.transport.client_id());
}

#[tokio::test]
async fn offline_queue_flushes_on_connect() {
    let _ = tracing_subscriber::fmt::try_init();
    let server = start_server().await;
    let mut observer = client(&server.url);
    observer.connect().await;

    let writer = client(&server.url);
    writer.bus.emit(add("c1", 0, "offline-1"));
    writer.bus.emit(add("c1", 1, "offline-2"));
    assert_eq!(writer.queue.len(), 2);

    writer.connect().await;

    assert_eq!(observer.next().await.message_id(), Some("offline-1"));
    assert_eq!(observer.next().await.message_id(), Some("offline-2"));
    assert!(writer.queue.is_empty());
    assert_eq!(server.history.lock().len(), 2);
}

#[tokio::test]
async fn backlog_is_replayed_to_new_clients() {
    let server = start_server().await;
    let alice = client(&server.url);
    alice.connect().await;
    alice.bus.emit(add("c1", 0, "before-bob"));

    timeout(Duration::from_secs(5), async {
        while server.history.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let mut bob = client(&server.url);
    bob.connect().await;
    assert_eq!(bob.next().await.message_id(), Some("before-bob"));
}

#[tokio::test]
async fn colliding_offline_write_branches_everywhere() {
    let _ = tracing_subscriber::fmt::try_init();
    let server = start_server().await;
    let mut alice = client(&server.url);
    alice.connect().await;
    alice.bus.emit(add("c1", 0, "alice-first"));

    timeout(Duration::from_secs(5), async {
        while server.history.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // bob wrote index 0 while offline, after alice
    tokio::time::sleep(Duration::from_millis(5)).await;
    let mut bob = client(&server.url);
    bob.bus.emit(add("c1", 0, "bob-offline"));
    bob.connect().await;

    // bob: alice's message, the branch, then his own message moved into it
    assert_eq!(bob.next().await.message_id(), Some("alice-first"));
    let branch = bob.next().await;
    assert_eq!(branch.event_type(), EventType::CreateConversationBranch);
    let moved = bob.next().await;
    assert_eq!(moved.conversation_id(), branch.conversation_id());

    // alice learns about the branch through the server
    let relayed = alice.next().await;
    assert_eq!(relayed.event_type(), EventType::CreateConversationBranch);
    assert_eq!(relayed.conversation_id(), branch.conversation_id());
}

/// Queue that records every callback invocation
#[derive(Default)]
struct RecordingQueue {
    enqueued: Mutex<Vec<SyncEvent>>,
}

impl PendingQueue for RecordingQueue {
    fn dequeue_pending(&self) -> Vec<SyncEvent> {
        self.enqueued.lock().clone()
    }

    fn enqueue_pending(&self, event: SyncEvent) {
        self.enqueued.lock().push(event);
    }

    fn clear_pending(&self) {
        self.enqueued.lock().clear();
    }
}

#[tokio::test]
async fn send_without_server_queues_exactly_once() {
    // bind then drop to get a port nobody listens on
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let queue = Arc::new(RecordingQueue::default());
    let transport = WebSocketTransport::new(
        "ws",
        &format!("ws://127.0.0.1:{}/sync", port),
        queue.clone(),
        Arc::new(LockManager::new()),
    )
    .unwrap();
    transport.connect();

    let event = add("c1", 0, "unsent").from_client("me");
    transport.send(event.clone()).unwrap();

    assert_eq!(*queue.enqueued.lock(), vec![event]);
    assert_eq!(transport.state(), ConnectionState::Closed);
    transport.close();
}
