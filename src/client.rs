//! Line-oriented chat client
//!
//! Each line read from stdin is appended to the configured conversation.
//! Messages written while the server is unreachable go to the file-backed
//! queue and are reconciled on the next successful handshake. The resume
//! cursor is saved after every delivered message and on exit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chatsync_core::{
    new_id, EventBus, EventPayload, EventType, LockManager, Message, PendingQueue, SyncEvent,
    Transport, WebSocketTransport,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::cursor::Cursor;
use crate::pending::FilePendingQueue;

pub async fn run(config: ClientConfig) -> Result<()> {
    let queue = Arc::new(FilePendingQueue::open(config.queue_path())?);
    let cursor_path = config.cursor_path();
    let cursor = Cursor::load(&cursor_path)?;
    info!(
        url = %config.url,
        conversation = %config.conversation_id,
        queue = %queue.path().display(),
        queued = queue.len(),
        last_seen = ?cursor.last_seen,
        "Starting client"
    );

    let transport = WebSocketTransport::with_policy(
        "ws",
        &config.url,
        queue.clone(),
        Arc::new(LockManager::new()),
        config.reconnect_policy(),
    )?;
    transport.resume_from(cursor.last_seen);
    let bus = EventBus::new();
    bus.add_transport(transport.clone())?;

    // next free index in our conversation, seeded from the cursor and the
    // queue, advanced by traffic
    let next_index = Arc::new(AtomicU64::new(cursor.next_index(&config.conversation_id)));
    for event in queue.dequeue_pending() {
        observe_index(&next_index, &config.conversation_id, &event);
    }
    let cursor = Arc::new(Mutex::new(cursor));

    {
        let next_index = next_index.clone();
        let conversation = config.conversation_id.clone();
        let transport = transport.clone();
        let cursor = cursor.clone();
        let cursor_path = cursor_path.clone();
        bus.on(EventType::AddMessage, move |event| {
            observe_index(&next_index, &conversation, event);
            println!("{}", describe(event));
            let mut cursor = cursor.lock();
            record_position(&mut cursor, &conversation, transport.last_seen(), &next_index);
            if let Err(e) = cursor.save(&cursor_path) {
                warn!(error = %e, "Failed to save cursor");
            }
            Ok(())
        });
    }
    bus.on(EventType::CreateConversationBranch, |event| {
        println!("{}", describe(event));
        Ok(())
    });

    let mut states = transport.subscribe_state();
    let status = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow();
            eprintln!("-- {}", state);
        }
    });

    transport.connect();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        let index = next_index.fetch_add(1, Ordering::SeqCst);
        let message = Message::new(new_id())
            .with_field("role", json!("user"))
            .with_field("content", json!(text));
        let accepted = bus.emit(SyncEvent::new(EventPayload::AddMessage {
            conversation_id: config.conversation_id.clone(),
            message_index: index,
            message,
        }));
        debug!(index, accepted, "Sent message");
    }

    status.abort();
    bus.destroy();
    transport.close();

    let mut cursor = cursor.lock();
    record_position(
        &mut cursor,
        &config.conversation_id,
        transport.last_seen(),
        &next_index,
    );
    cursor.save(&cursor_path)?;
    Ok(())
}

fn record_position(
    cursor: &mut Cursor,
    conversation: &str,
    last_seen: Option<u64>,
    next_index: &AtomicU64,
) {
    cursor.last_seen = cursor.last_seen.max(last_seen);
    cursor
        .next_index
        .insert(conversation.to_string(), next_index.load(Ordering::SeqCst));
}

fn observe_index(next_index: &AtomicU64, conversation: &str, event: &SyncEvent) {
    if event.conversation_id() != Some(conversation) {
        return;
    }
    if let Some(index) = event.message_index() {
        next_index.fetch_max(index + 1, Ordering::SeqCst);
    }
}

/// One-line rendering of an incoming event
fn describe(event: &SyncEvent) -> String {
    let time = chrono::DateTime::from_timestamp_millis(event.base.timestamp)
        .map(|t| t.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string());

    match &event.payload {
        EventPayload::AddMessage {
            conversation_id,
            message_index,
            message,
        } => {
            let author = event.base.origin_client_id.as_deref().unwrap_or("?");
            let content = message
                .fields
                .get("content")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            format!(
                "[{}] {}#{} <{}> {}",
                time, conversation_id, message_index, author, content
            )
        }
        EventPayload::CreateConversationBranch {
            source_id,
            branch_id,
            message_index,
            ..
        } => format!(
            "[{}] {} forked at #{} into {}",
            time, source_id, message_index, branch_id
        ),
        other => format!("[{}] {:?}", time, other),
    }
}
