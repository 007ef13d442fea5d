//! Conflict resolution between two event streams
//!
//! When a client reconnects it holds two lists: events it produced while
//! offline (the local pending queue) and events the server delivered during
//! the reconnect handshake (the remote backlog). [`resolve`] merges them into
//! one timeline and splits the result into what still has to reach the server
//! and what still has to reach the local handlers.
//!
//! ## Algorithm
//!
//! ```text
//! local  ──┐                                      ┌──> send_to_server
//!          ├─ expand batches ─ stable sort by ts ─┤
//! remote ──┘                                      └──> send_to_client
//! ```
//!
//! Walking the timeline, the resolver tracks the highest occupied
//! `messageIndex` of every conversation. An `addMessage` whose index is not
//! above that mark collides with a message that got there first: instead of
//! dropping either, the conversation is forked at the colliding index and the
//! late message is re-homed into the fork under a fresh id. Later events from
//! the same origin that reference the re-homed message or its conversation
//! follow it into the fork.
//!
//! Streaming deltas, streamed sources and message updates addressed to the
//! same message are coalesced into a single `updateMessage`.
//!
//! Ordering is by producer timestamps with input order as the tie-break.
//! Clocks of different origins are not synchronized, so the timeline is an
//! approximation of causal order rather than a guarantee.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info};

use crate::event::{EventPayload, EventType, MessageUpdate, SyncEvent};
use crate::types::new_id;

/// Output of [`resolve`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    /// Events the server has not seen yet, in timeline order
    pub send_to_server: Vec<SyncEvent>,
    /// Events the local handlers have not applied yet, in timeline order
    pub send_to_client: Vec<SyncEvent>,
}

impl Resolution {
    /// Branch ids created by this resolution
    pub fn branch_ids(&self) -> Vec<&str> {
        self.send_to_client
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::CreateConversationBranch { branch_id, .. } => {
                    Some(branch_id.as_str())
                }
                _ => None,
            })
            .collect()
    }

    /// Whether both queues are empty
    pub fn is_empty(&self) -> bool {
        self.send_to_server.is_empty() && self.send_to_client.is_empty()
    }
}

/// Merge the local pending queue with the remote backlog.
///
/// Pure apart from id generation: the inputs are consumed, nothing else is
/// touched.
pub fn resolve(local: Vec<SyncEvent>, remote: Vec<SyncEvent>) -> Resolution {
    let mut timeline: Vec<(Side, SyncEvent)> = Vec::new();
    for event in local.into_iter().flat_map(SyncEvent::flatten) {
        timeline.push((Side::Local, event));
    }
    for event in remote.into_iter().flat_map(SyncEvent::flatten) {
        timeline.push((Side::Remote, event));
    }
    timeline.sort_by_key(|(_, event)| event.base.timestamp);

    let mut resolver = Resolver::default();
    for (side, event) in timeline {
        resolver.apply(side, event);
    }

    let resolution = resolver.finish();
    info!(
        to_server = resolution.send_to_server.len(),
        to_client = resolution.send_to_client.len(),
        branches = resolution.branch_ids().len(),
        "Resolved event queues"
    );
    resolution
}

/// Which input an event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Side {
    Local,
    Remote,
}

impl Side {
    fn label(&self) -> &'static str {
        match self {
            Side::Local => "local",
            Side::Remote => "remote",
        }
    }

    /// The queue that still needs this side's events
    fn target(&self) -> Target {
        match self {
            Side::Local => Target::Server,
            Side::Remote => Target::Client,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Target {
    Server,
    Client,
}

/// Where a message ended up after remapping
struct Placement {
    conversation_id: String,
    message_id: String,
    moved: bool,
}

#[derive(Default)]
struct Resolver {
    /// conversation -> highest occupied message index
    highest: HashMap<String, u64>,
    /// message ids already placed in the timeline
    placed: HashSet<String>,
    /// (origin, conversation) -> branch the origin's messages now live in
    redirects: HashMap<(String, String), String>,
    /// (origin, conversation, index) -> (branch, message id)
    remapped: HashMap<(String, String, u64), (String, String)>,
    /// (origin, old message id) -> new message id
    renamed: HashMap<(String, String), String>,
    /// (target, message id) -> position of the coalesced update in that queue
    coalesced: HashMap<(Target, String), usize>,
    to_server: Vec<SyncEvent>,
    to_client: Vec<SyncEvent>,
}

impl Resolver {
    fn apply(&mut self, side: Side, event: SyncEvent) {
        let origin = event
            .base
            .origin_client_id
            .clone()
            .unwrap_or_else(|| side.label().to_string());

        match event.event_type() {
            EventType::AddMessage => self.add_message(side, &origin, event),
            EventType::UpdateMessage | EventType::StreamText | EventType::StreamSource => {
                self.message_change(side, &origin, event)
            }
            EventType::CreateConversationBranch => self.branch(side, &origin, event),
            EventType::ClearMessages => self.clear(side, &origin, event),
            EventType::ClientIdSync | EventType::ClientIdAck | EventType::ReadyForSync => {
                debug!(event_type = %event.event_type(), "Dropping control event from queue");
            }
            // Batches were expanded before the walk
            EventType::EventsBatch => {}
            _ => self.pass_through(side, &origin, event),
        }
    }

    fn finish(self) -> Resolution {
        Resolution {
            send_to_server: self.to_server,
            send_to_client: self.to_client,
        }
    }

    fn queue(&mut self, target: Target) -> &mut Vec<SyncEvent> {
        match target {
            Target::Server => &mut self.to_server,
            Target::Client => &mut self.to_client,
        }
    }

    fn redirect(&self, origin: &str, conversation_id: &str) -> Option<&String> {
        self.redirects
            .get(&(origin.to_string(), conversation_id.to_string()))
    }

    fn add_message(&mut self, side: Side, origin: &str, mut event: SyncEvent) {
        let EventPayload::AddMessage {
            conversation_id,
            message_index,
            message,
        } = &mut event.payload
        else {
            return;
        };

        let original_conversation = conversation_id.clone();
        let original_id = message.id.clone();
        let index = *message_index;

        if self.placed.contains(&original_id) {
            debug!(message_id = %original_id, "Dropping duplicate message");
            return;
        }

        let mut moved = false;
        if let Some(branch) = self.redirect(origin, &original_conversation) {
            *conversation_id = branch.clone();
            moved = true;
        }

        let collides = self
            .highest
            .get(conversation_id.as_str())
            .is_some_and(|highest| index <= *highest);

        let mut branch_event = None;
        if collides {
            let branch_id = new_id();
            let new_message_id = new_id();
            info!(
                source = %conversation_id,
                branch = %branch_id,
                message_index = index,
                "Message index collision, forking conversation"
            );

            let mut branch = SyncEvent::at(
                event.base.timestamp,
                EventPayload::CreateConversationBranch {
                    source_id: conversation_id.clone(),
                    branch_id: branch_id.clone(),
                    message_index: index,
                    message_ids: None,
                },
            );
            branch.base.origin_client_id = event.base.origin_client_id.clone();
            branch.base.owner_id = event.base.owner_id.clone();
            branch_event = Some(branch);

            self.redirects.insert(
                (origin.to_string(), original_conversation.clone()),
                branch_id.clone(),
            );
            self.remapped.insert(
                (origin.to_string(), original_conversation, index),
                (branch_id.clone(), new_message_id.clone()),
            );
            self.renamed.insert(
                (origin.to_string(), original_id.clone()),
                new_message_id.clone(),
            );

            *conversation_id = branch_id;
            message.id = new_message_id;
            moved = true;
        }

        self.placed.insert(original_id);
        self.placed.insert(message.id.clone());
        let highest = self.highest.entry(conversation_id.clone()).or_insert(index);
        *highest = (*highest).max(index);

        if let Some(branch) = branch_event {
            self.to_server.push(branch.clone());
            self.to_client.push(branch);
        }
        if moved && side == Side::Local {
            // The local store still holds the message under its old address
            self.to_client.push(event.clone());
        }
        self.queue(side.target()).push(event);
    }

    /// Resolve where an existing message lives for events from `origin`.
    fn place(&self, origin: &str, conversation_id: &str, index: u64, message_id: &str) -> Placement {
        let key = (origin.to_string(), conversation_id.to_string(), index);
        if let Some((branch, id)) = self.remapped.get(&key) {
            return Placement {
                conversation_id: branch.clone(),
                message_id: id.clone(),
                moved: true,
            };
        }

        let renamed = self
            .renamed
            .get(&(origin.to_string(), message_id.to_string()));
        let redirected = self.redirect(origin, conversation_id);
        Placement {
            conversation_id: redirected
                .cloned()
                .unwrap_or_else(|| conversation_id.to_string()),
            message_id: renamed.cloned().unwrap_or_else(|| message_id.to_string()),
            moved: renamed.is_some() || redirected.is_some(),
        }
    }

    fn message_change(&mut self, side: Side, origin: &str, event: SyncEvent) {
        let SyncEvent { base, payload } = event;

        let (message_id, message_index, conversation_id, contribution) = match payload {
            EventPayload::UpdateMessage {
                message_id,
                message_index,
                conversation_id,
                message,
            } => (message_id, message_index, conversation_id, Contribution::Update(message)),
            EventPayload::StreamText {
                message_id,
                message_index,
                conversation_id,
                part,
                stream_kind,
            } => (
                message_id,
                message_index,
                conversation_id,
                Contribution::Text(stream_kind.unwrap_or_default(), part),
            ),
            EventPayload::StreamSource {
                message_id,
                message_index,
                conversation_id,
                source,
            } => (
                message_id,
                message_index,
                conversation_id,
                Contribution::Source(source),
            ),
            _ => return,
        };

        let placement = self.place(origin, &conversation_id, message_index, &message_id);
        let mut targets = vec![side.target()];
        if placement.moved && side == Side::Local {
            targets.push(Target::Client);
        }

        for target in targets {
            let key = (target, placement.message_id.clone());
            if let Some(&position) = self.coalesced.get(&key) {
                let existing = &mut self.queue(target)[position];
                existing.base.timestamp = existing.base.timestamp.max(base.timestamp);
                if let EventPayload::UpdateMessage { message, .. } = &mut existing.payload {
                    contribution.clone().fold_into(message);
                }
                continue;
            }

            let mut update = MessageUpdate::default();
            contribution.clone().fold_into(&mut update);
            let coalesced = SyncEvent {
                base: base.clone(),
                payload: EventPayload::UpdateMessage {
                    message_id: placement.message_id.clone(),
                    message_index,
                    conversation_id: placement.conversation_id.clone(),
                    message: update,
                },
            };
            let queue = self.queue(target);
            queue.push(coalesced);
            let position = queue.len() - 1;
            self.coalesced.insert(key, position);
        }
    }

    fn branch(&mut self, side: Side, origin: &str, mut event: SyncEvent) {
        if let EventPayload::CreateConversationBranch {
            source_id,
            branch_id,
            message_index,
            ..
        } = &mut event.payload
        {
            if let Some(redirected) = self.redirect(origin, source_id) {
                *source_id = redirected.clone();
            }
            // The branch holds copies of everything below the fork index
            match message_index.checked_sub(1) {
                Some(last_copied) => {
                    self.highest.insert(branch_id.clone(), last_copied);
                }
                None => {
                    self.highest.remove(branch_id.as_str());
                }
            }
        }
        self.queue(side.target()).push(event);
    }

    fn clear(&mut self, side: Side, origin: &str, mut event: SyncEvent) {
        if let EventPayload::ClearMessages {
            conversation_id,
            message_index,
        } = &mut event.payload
        {
            if let Some(redirected) = self.redirect(origin, conversation_id) {
                *conversation_id = redirected.clone();
            }
            if let Some(highest) = self.highest.get_mut(conversation_id.as_str()) {
                *highest = (*highest).min(*message_index);
            }
        }
        self.queue(side.target()).push(event);
    }

    fn pass_through(&mut self, side: Side, origin: &str, mut event: SyncEvent) {
        let redirected = event
            .conversation_id()
            .and_then(|c| self.redirect(origin, c))
            .cloned();

        match &mut event.payload {
            EventPayload::UpdateConversation {
                conversation_id, ..
            }
            | EventPayload::GenerateResponse {
                conversation_id, ..
            }
            | EventPayload::AddAttachment {
                conversation_id, ..
            }
            | EventPayload::RemoveAttachment {
                conversation_id, ..
            } => {
                if let Some(branch) = redirected {
                    *conversation_id = branch;
                }
            }
            EventPayload::StopResponse {
                conversation_id,
                message_id,
            } => {
                if let Some(renamed) = self
                    .renamed
                    .get(&(origin.to_string(), message_id.clone()))
                {
                    *message_id = renamed.clone();
                }
                if let Some(branch) = redirected {
                    *conversation_id = branch;
                }
            }
            _ => {}
        }
        self.queue(side.target()).push(event);
    }
}

/// One event's contribution to a coalesced update
#[derive(Clone)]
enum Contribution {
    Update(MessageUpdate),
    Text(crate::event::StreamKind, String),
    Source(serde_json::Value),
}

impl Contribution {
    fn fold_into(self, update: &mut MessageUpdate) {
        match self {
            Contribution::Update(later) => update.merge(later),
            Contribution::Text(kind, delta) => update.push_text(kind, &delta),
            Contribution::Source(source) => update.push_source(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Message, StreamKind};
    use serde_json::json;

    fn add(ts: i64, conversation: &str, index: u64, id: &str) -> SyncEvent {
        SyncEvent::at(
            ts,
            EventPayload::AddMessage {
                conversation_id: conversation.to_string(),
                message_index: index,
                message: Message::new(id),
            },
        )
    }

    fn delta(ts: i64, message: &str, text: &str) -> SyncEvent {
        SyncEvent::at(
            ts,
            EventPayload::StreamText {
                message_id: message.to_string(),
                message_index: 1,
                conversation_id: "c1".to_string(),
                part: text.to_string(),
                stream_kind: None,
            },
        )
    }

    #[test]
    fn test_empty_inputs() {
        assert!(resolve(vec![], vec![]).is_empty());
    }

    #[test]
    fn test_sequential_appends_pass_unchanged() {
        let local = vec![add(1, "c1", 0, "a"), add(2, "c1", 1, "b")];
        let resolution = resolve(local.clone(), vec![]);

        assert_eq!(resolution.send_to_server, local);
        assert!(resolution.send_to_client.is_empty());
        assert!(resolution.branch_ids().is_empty());
    }

    #[test]
    fn test_remote_events_go_to_client() {
        let remote = vec![add(1, "c1", 0, "a")];
        let resolution = resolve(vec![], remote.clone());

        assert!(resolution.send_to_server.is_empty());
        assert_eq!(resolution.send_to_client, remote);
    }

    #[test]
    fn test_timeline_is_sorted_by_timestamp() {
        let local = vec![add(30, "c1", 2, "late")];
        let remote = vec![add(10, "c1", 0, "early"), add(20, "c1", 1, "middle")];
        let resolution = resolve(local, remote);

        assert!(resolution.branch_ids().is_empty());
        assert_eq!(resolution.send_to_server.len(), 1);
        assert_eq!(resolution.send_to_client.len(), 2);
    }

    #[test]
    fn test_cross_side_collision_forks_later_message() {
        let remote = vec![add(10, "c1", 1, "theirs")];
        let local = vec![add(20, "c1", 1, "mine")];
        let resolution = resolve(local, remote);

        let branches = resolution.branch_ids();
        assert_eq!(branches.len(), 1);
        let branch = branches[0].to_string();

        // server: branch + re-homed local message
        assert_eq!(resolution.send_to_server.len(), 2);
        let rehomed = &resolution.send_to_server[1];
        assert_eq!(rehomed.conversation_id(), Some(branch.as_str()));
        assert_ne!(rehomed.message_id(), Some("mine"));

        // client: remote message untouched, then branch and the local copy
        assert_eq!(resolution.send_to_client[0].message_id(), Some("theirs"));
        assert_eq!(resolution.send_to_client.len(), 3);
    }

    #[test]
    fn test_followers_of_forked_message_are_redirected() {
        let remote = vec![add(10, "c1", 1, "theirs").from_client("b")];
        let local = vec![
            add(20, "c1", 1, "mine").from_client("a"),
            add(30, "c1", 2, "mine-next").from_client("a"),
            delta(40, "mine", "streamed").from_client("a"),
        ];
        let resolution = resolve(local, remote);
        let branch = resolution.branch_ids()[0].to_string();

        let server = &resolution.send_to_server;
        assert_eq!(server.len(), 4);
        assert_eq!(server[2].conversation_id(), Some(branch.as_str()));
        assert_eq!(server[2].message_id(), Some("mine-next"));

        let update = &server[3];
        assert_eq!(update.event_type(), EventType::UpdateMessage);
        assert_eq!(update.conversation_id(), Some(branch.as_str()));
        assert_eq!(update.message_id(), server[1].message_id());
    }

    #[test]
    fn test_duplicate_delivery_is_dropped() {
        let event = add(10, "c1", 0, "same");
        let resolution = resolve(vec![event.clone()], vec![event]);

        assert_eq!(resolution.send_to_server.len(), 1);
        assert!(resolution.send_to_client.is_empty());
        assert!(resolution.branch_ids().is_empty());
    }

    #[test]
    fn test_clear_messages_reopens_indices() {
        let local = vec![
            add(1, "c1", 0, "a"),
            add(2, "c1", 1, "b"),
            SyncEvent::at(
                3,
                EventPayload::ClearMessages {
                    conversation_id: "c1".to_string(),
                    message_index: 0,
                },
            ),
            add(4, "c1", 1, "b-regenerated"),
        ];
        let resolution = resolve(local, vec![]);

        assert!(resolution.branch_ids().is_empty());
        assert_eq!(resolution.send_to_server.len(), 4);
    }

    #[test]
    fn test_stream_events_coalesce() {
        let local = vec![
            delta(1, "m1", "Hel"),
            delta(2, "m1", "lo"),
            SyncEvent::at(
                3,
                EventPayload::StreamSource {
                    message_id: "m1".to_string(),
                    message_index: 1,
                    conversation_id: "c1".to_string(),
                    source: json!({"url": "https://example.com"}),
                },
            ),
            SyncEvent::at(
                4,
                EventPayload::StreamText {
                    message_id: "m1".to_string(),
                    message_index: 1,
                    conversation_id: "c1".to_string(),
                    part: "thinking".to_string(),
                    stream_kind: Some(StreamKind::Reasoning),
                },
            ),
        ];
        let resolution = resolve(local, vec![]);

        assert_eq!(resolution.send_to_server.len(), 1);
        let update = &resolution.send_to_server[0];
        assert_eq!(update.base.timestamp, 4);
        match &update.payload {
            EventPayload::UpdateMessage { message, .. } => {
                assert_eq!(message.text(), "Hellothinking");
                assert_eq!(message.parts.as_ref().map(Vec::len), Some(2));
                assert_eq!(message.sources.as_ref().map(Vec::len), Some(1));
            }
            other => panic!("expected updateMessage, got {:?}", other),
        }
    }

    #[test]
    fn test_control_events_are_dropped() {
        let local = vec![SyncEvent::client_id_ack("x"), add(1, "c1", 0, "a")];
        let resolution = resolve(local, vec![SyncEvent::ready_for_sync(None)]);

        assert_eq!(resolution.send_to_server.len(), 1);
        assert!(resolution.send_to_client.is_empty());
    }

    #[test]
    fn test_batches_are_expanded() {
        let local = vec![SyncEvent::batch(vec![add(1, "c1", 0, "a"), add(2, "c1", 1, "b")])];
        let resolution = resolve(local, vec![]);
        assert_eq!(resolution.send_to_server.len(), 2);
    }

    #[test]
    fn test_branch_at_zero_leaves_branch_empty() {
        let local = vec![
            add(1, "c1", 0, "a"),
            add(2, "c1", 0, "b"),
            add(3, "c1", 1, "c"),
        ];
        let resolution = resolve(local, vec![]);

        // "b" collides and forks at 0; "c" follows the origin into the branch
        assert_eq!(resolution.branch_ids().len(), 1);
        let again = resolve(resolution.send_to_server.clone(), vec![]);
        assert!(again.branch_ids().is_empty());
        assert_eq!(again.send_to_server, resolution.send_to_server);
    }
}
