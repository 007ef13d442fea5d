//! Synchronization event model
//!
//! Every event that moves through the bus, a transport or the resolver is a
//! [`SyncEvent`]: shared [`BaseEvent`] metadata plus one [`EventPayload`]
//! variant. On the wire both halves are flattened into a single JSON object
//! discriminated by its `type` field:
//!
//! ```text
//! {
//!   "type": "addMessage",
//!   "timestamp": 1737460000000,
//!   "originTransportId": "ws",
//!   "conversationId": "c1",
//!   "messageIndex": 3,
//!   "message": { "id": "m9", "role": "user", ... }
//! }
//! ```
//!
//! Conversation, message and attachment payloads are opaque JSON. The only
//! fields this crate looks at are the ones named on the variants below, plus a
//! message's `id` and an update's `parts` / `sources`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SyncResult;
use crate::types::{has_id, now_millis};

/// Metadata carried by every event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseEvent {
    /// Milliseconds since the Unix epoch, stamped by the producer's clock
    #[serde(default)]
    pub timestamp: i64,
    /// Transport through which the event entered the current bus
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_transport_id: Option<String>,
    /// Logical client that produced the event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_client_id: Option<String>,
    /// Owner (user) the event belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    /// Position in the server's relay log, assigned on arrival there
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_seq: Option<u64>,
}

/// A chat message payload: an id plus opaque fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Stable message identifier
    pub id: String,
    /// Everything else (role, content, metadata...)
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Message {
    /// Create a message with the given id and no other fields
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Builder-style setter for an opaque field
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

/// Kind of streamed content
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Visible answer text
    #[default]
    Text,
    /// Model reasoning trace
    Reasoning,
}

/// One contiguous run of streamed content inside a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePart {
    /// Which stream this text belongs to
    #[serde(rename = "type")]
    pub kind: StreamKind,
    /// Accumulated text
    pub text: String,
}

/// Partial or full update to a message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageUpdate {
    /// Content parts, in stream order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts: Option<Vec<MessagePart>>,
    /// Citations, in stream order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<Value>>,
    /// Other fields, merged last-writer-wins
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl MessageUpdate {
    /// Fold a later update into this one.
    ///
    /// Opaque fields are overwritten key by key. `parts` and `sources` carried
    /// by the later update are appended to what has accumulated so far, so
    /// streamed content is never lost to a full update.
    pub fn merge(&mut self, later: MessageUpdate) {
        if let Some(parts) = later.parts {
            for part in parts {
                self.push_text(part.kind, &part.text);
            }
            self.parts.get_or_insert_with(Vec::new);
        }
        if let Some(sources) = later.sources {
            self.sources.get_or_insert_with(Vec::new).extend(sources);
        }
        for (key, value) in later.fields {
            self.fields.insert(key, value);
        }
    }

    /// Append a streamed text delta.
    ///
    /// Consecutive deltas of the same kind extend the last part.
    pub fn push_text(&mut self, kind: StreamKind, delta: &str) {
        let parts = self.parts.get_or_insert_with(Vec::new);
        match parts.last_mut() {
            Some(last) if last.kind == kind => last.text.push_str(delta),
            _ => parts.push(MessagePart {
                kind,
                text: delta.to_string(),
            }),
        }
    }

    /// Append a streamed citation.
    pub fn push_source(&mut self, source: Value) {
        self.sources.get_or_insert_with(Vec::new).push(source);
    }

    /// Concatenated text of every part, regardless of kind.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .flatten()
            .map(|p| p.text.as_str())
            .collect()
    }
}

/// Event payloads, tagged by `type` on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EventPayload {
    /// A new conversation (opaque payload carrying its `id`)
    CreateConversation {
        /// Conversation payload
        conversation: Value,
    },
    /// Partial update of a conversation
    UpdateConversation {
        /// Conversation being updated
        conversation_id: String,
        /// Fields to change
        conversation: Value,
    },
    /// Fork `source_id` at `message_index` into `branch_id`
    CreateConversationBranch {
        /// Conversation being forked
        source_id: String,
        /// New conversation id
        branch_id: String,
        /// First index owned by the branch; messages below it are copied
        message_index: u64,
        /// Remapped ids for the copied messages
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_ids: Option<Vec<String>>,
    },
    /// Append a message at an optimistic index
    AddMessage {
        /// Target conversation
        conversation_id: String,
        /// Optimistic zero-based position
        message_index: u64,
        /// Message payload
        message: Message,
    },
    /// Update an existing message
    UpdateMessage {
        /// Message being updated
        message_id: String,
        /// Its position
        message_index: u64,
        /// Its conversation
        conversation_id: String,
        /// Partial or full payload
        message: MessageUpdate,
    },
    /// Stream a text delta into a message
    StreamText {
        /// Message being streamed
        message_id: String,
        /// Its position
        message_index: u64,
        /// Its conversation
        conversation_id: String,
        /// Text delta
        part: String,
        /// Which stream the delta belongs to
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stream_kind: Option<StreamKind>,
    },
    /// Stream a citation into a message
    StreamSource {
        /// Message being streamed
        message_id: String,
        /// Its position
        message_index: u64,
        /// Its conversation
        conversation_id: String,
        /// Opaque citation
        source: Value,
    },
    /// Remove every message after `message_index`
    ClearMessages {
        /// Target conversation
        conversation_id: String,
        /// Last index kept
        message_index: u64,
    },
    /// A list of independent events
    EventsBatch {
        /// Members, expanded before per-type processing
        events: Vec<SyncEvent>,
    },
    /// Server assigns the client its id
    ClientIdSync {
        /// Assigned id
        client_id: String,
    },
    /// Client acknowledges its id
    ClientIdAck {
        /// Acknowledged id
        client_id: String,
    },
    /// Sender is ready for conflict resolution
    ReadyForSync {
        /// Highest server sequence already seen by the client
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since: Option<u64>,
    },
    /// Ask the leader to generate an assistant response
    GenerateResponse {
        /// Target conversation
        conversation_id: String,
        /// Index the response will occupy
        message_index: u64,
        /// Provider options (opaque)
        #[serde(default)]
        options: Value,
    },
    /// Stop a running generation
    StopResponse {
        /// Target conversation
        conversation_id: String,
        /// Message being generated
        message_id: String,
    },
    /// Attach a file to a conversation
    AddAttachment {
        /// Target conversation
        conversation_id: String,
        /// Opaque attachment carrying its `id`
        attachment: Value,
    },
    /// Remove an attachment
    RemoveAttachment {
        /// Target conversation
        conversation_id: String,
        /// Attachment to remove
        attachment_id: String,
    },
    /// An API key changed; consumers should drop cached clients
    ApiKeyChanged {
        /// Provider name
        provider: String,
    },
}

/// Field-less discriminant of [`EventPayload`], used as the handler key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    CreateConversation,
    UpdateConversation,
    CreateConversationBranch,
    AddMessage,
    UpdateMessage,
    StreamText,
    StreamSource,
    ClearMessages,
    EventsBatch,
    ClientIdSync,
    ClientIdAck,
    ReadyForSync,
    GenerateResponse,
    StopResponse,
    AddAttachment,
    RemoveAttachment,
    ApiKeyChanged,
}

impl EventType {
    /// Wire name of the tag
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::CreateConversation => "createConversation",
            EventType::UpdateConversation => "updateConversation",
            EventType::CreateConversationBranch => "createConversationBranch",
            EventType::AddMessage => "addMessage",
            EventType::UpdateMessage => "updateMessage",
            EventType::StreamText => "streamText",
            EventType::StreamSource => "streamSource",
            EventType::ClearMessages => "clearMessages",
            EventType::EventsBatch => "eventsBatch",
            EventType::ClientIdSync => "clientIdSync",
            EventType::ClientIdAck => "clientIdAck",
            EventType::ReadyForSync => "readyForSync",
            EventType::GenerateResponse => "generateResponse",
            EventType::StopResponse => "stopResponse",
            EventType::AddAttachment => "addAttachment",
            EventType::RemoveAttachment => "removeAttachment",
            EventType::ApiKeyChanged => "apiKeyChanged",
        }
    }

    /// Handshake controls are consumed by transports and never reach handlers
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            EventType::ClientIdSync | EventType::ClientIdAck | EventType::ReadyForSync
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EventPayload {
    /// The discriminant of this payload
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::CreateConversation { .. } => EventType::CreateConversation,
            EventPayload::UpdateConversation { .. } => EventType::UpdateConversation,
            EventPayload::CreateConversationBranch { .. } => EventType::CreateConversationBranch,
            EventPayload::AddMessage { .. } => EventType::AddMessage,
            EventPayload::UpdateMessage { .. } => EventType::UpdateMessage,
            EventPayload::StreamText { .. } => EventType::StreamText,
            EventPayload::StreamSource { .. } => EventType::StreamSource,
            EventPayload::ClearMessages { .. } => EventType::ClearMessages,
            EventPayload::EventsBatch { .. } => EventType::EventsBatch,
            EventPayload::ClientIdSync { .. } => EventType::ClientIdSync,
            EventPayload::ClientIdAck { .. } => EventType::ClientIdAck,
            EventPayload::ReadyForSync { .. } => EventType::ReadyForSync,
            EventPayload::GenerateResponse { .. } => EventType::GenerateResponse,
            EventPayload::StopResponse { .. } => EventType::StopResponse,
            EventPayload::AddAttachment { .. } => EventType::AddAttachment,
            EventPayload::RemoveAttachment { .. } => EventType::RemoveAttachment,
            EventPayload::ApiKeyChanged { .. } => EventType::ApiKeyChanged,
        }
    }
}

/// A synchronization event: metadata plus payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    /// Shared metadata
    #[serde(flatten)]
    pub base: BaseEvent,
    /// Variant-specific fields
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl SyncEvent {
    /// Create an event stamped with the current time
    pub fn new(payload: EventPayload) -> Self {
        Self {
            base: BaseEvent {
                timestamp: now_millis(),
                ..Default::default()
            },
            payload,
        }
    }

    /// Create an event with an explicit timestamp
    pub fn at(timestamp: i64, payload: EventPayload) -> Self {
        Self {
            base: BaseEvent {
                timestamp,
                ..Default::default()
            },
            payload,
        }
    }

    /// Wrap events into a batch
    pub fn batch(events: Vec<SyncEvent>) -> Self {
        Self::new(EventPayload::EventsBatch { events })
    }

    /// Server -> client id assignment
    pub fn client_id_sync(client_id: impl Into<String>) -> Self {
        Self::new(EventPayload::ClientIdSync {
            client_id: client_id.into(),
        })
    }

    /// Client -> server id acknowledgement
    pub fn client_id_ack(client_id: impl Into<String>) -> Self {
        Self::new(EventPayload::ClientIdAck {
            client_id: client_id.into(),
        })
    }

    /// Ready-for-sync marker
    pub fn ready_for_sync(since: Option<u64>) -> Self {
        Self::new(EventPayload::ReadyForSync { since })
    }

    /// Builder: set the origin client id
    pub fn from_client(mut self, client_id: impl Into<String>) -> Self {
        self.base.origin_client_id = Some(client_id.into());
        self
    }

    /// Builder: set the origin transport id
    pub fn via(mut self, transport_id: impl Into<String>) -> Self {
        self.base.origin_transport_id = Some(transport_id.into());
        self
    }

    /// The discriminant of this event
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    /// Whether this is a handshake control message
    pub fn is_control(&self) -> bool {
        self.event_type().is_control()
    }

    /// Whether the event names the transport it arrived through
    pub fn has_origin(&self) -> bool {
        has_id(&self.base.origin_transport_id)
    }

    /// Expand batches recursively into their members.
    ///
    /// Members inherit the batch's origin and owner when they carry none, so
    /// they can still be routed after unwrapping.
    pub fn flatten(self) -> Vec<SyncEvent> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into(self, out: &mut Vec<SyncEvent>) {
        match self.payload {
            EventPayload::EventsBatch { events } => {
                for mut member in events {
                    if !has_id(&member.base.origin_transport_id) {
                        member.base.origin_transport_id = self.base.origin_transport_id.clone();
                    }
                    if member.base.origin_client_id.is_none() {
                        member.base.origin_client_id = self.base.origin_client_id.clone();
                    }
                    if member.base.owner_id.is_none() {
                        member.base.owner_id = self.base.owner_id.clone();
                    }
                    member.flatten_into(out);
                }
            }
            _ => out.push(self),
        }
    }

    /// Conversation this event addresses, if any
    pub fn conversation_id(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::CreateConversation { conversation } => {
                conversation.get("id").and_then(Value::as_str)
            }
            EventPayload::UpdateConversation {
                conversation_id, ..
            }
            | EventPayload::AddMessage {
                conversation_id, ..
            }
            | EventPayload::UpdateMessage {
                conversation_id, ..
            }
            | EventPayload::StreamText {
                conversation_id, ..
            }
            | EventPayload::StreamSource {
                conversation_id, ..
            }
            | EventPayload::ClearMessages {
                conversation_id, ..
            }
            | EventPayload::GenerateResponse {
                conversation_id, ..
            }
            | EventPayload::StopResponse {
                conversation_id, ..
            }
            | EventPayload::AddAttachment {
                conversation_id, ..
            }
            | EventPayload::RemoveAttachment {
                conversation_id, ..
            } => Some(conversation_id),
            EventPayload::CreateConversationBranch { branch_id, .. } => Some(branch_id),
            _ => None,
        }
    }

    /// Message this event addresses, if any
    pub fn message_id(&self) -> Option<&str> {
        match &self.payload {
            EventPayload::AddMessage { message, .. } => Some(&message.id),
            EventPayload::UpdateMessage { message_id, .. }
            | EventPayload::StreamText { message_id, .. }
            | EventPayload::StreamSource { message_id, .. }
            | EventPayload::StopResponse { message_id, .. } => Some(message_id),
            _ => None,
        }
    }

    /// Optimistic message index carried by the event, if any
    pub fn message_index(&self) -> Option<u64> {
        match &self.payload {
            EventPayload::CreateConversationBranch { message_index, .. }
            | EventPayload::AddMessage { message_index, .. }
            | EventPayload::UpdateMessage { message_index, .. }
            | EventPayload::StreamText { message_index, .. }
            | EventPayload::StreamSource { message_index, .. }
            | EventPayload::ClearMessages { message_index, .. }
            | EventPayload::GenerateResponse { message_index, .. } => Some(*message_index),
            _ => None,
        }
    }

    /// Encode as a JSON text frame
    pub fn to_json(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from a JSON text frame
    pub fn from_json(text: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
