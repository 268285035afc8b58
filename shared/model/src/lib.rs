//! Conversation and message models shared across QuillChat clients and services.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier assigned to a logical conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub Uuid);

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique identifier for a user account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Identifier of a committed message. Provisional messages carry their
/// provisional uuid here until the store assigns the permanent id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

/// Locally-generated identifier used to correlate an optimistic send with
/// the store's committed row and with the sender's own push echo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProvisionalId(pub Uuid);

impl ProvisionalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Identifier for one optimistic mutation tracked by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionId(pub Uuid);

impl ActionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Payload category of a message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    File,
    Voice,
}

/// Delivery lifecycle of a message as seen by the sending client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

/// One message in a two-party conversation.
///
/// Within a conversation messages are totally ordered by
/// `(created_ms, id)`; a provisional message may shift until committed,
/// after which its position is frozen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    /// Retained after commit so the sender's own push echo can be matched.
    pub provisional_id: Option<ProvisionalId>,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub body: String,
    pub kind: MessageKind,
    pub created_ms: i64,
    pub read_ms: Option<i64>,
    pub state: DeliveryState,
}

impl Message {
    /// Build the optimistic, not-yet-committed form of an outgoing message.
    pub fn provisional(
        conversation_id: ConversationId,
        sender_id: UserId,
        body: String,
        kind: MessageKind,
        created_ms: i64,
    ) -> Self {
        let pid = ProvisionalId::new();
        Self {
            id: MessageId(pid.0),
            provisional_id: Some(pid),
            conversation_id,
            sender_id,
            body,
            kind,
            created_ms,
            read_ms: None,
            state: DeliveryState::Sending,
        }
    }

    /// Total-order key within a conversation.
    pub fn order_key(&self) -> (i64, MessageId) {
        (self.created_ms, self.id)
    }
}

/// Read watermark broadcast by a reader: every message at or before
/// `up_to_ms` counts as read. Monotonic per (message, reader).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceipt {
    pub reader_id: UserId,
    pub up_to_ms: i64,
    pub read_at_ms: i64,
}

/// Events carried over the conversation topic of the event bus.
///
/// Delivery is at-least-once and unordered; consumers must deduplicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConversationEvent {
    #[serde(rename = "message.new")]
    MessageNew { message: Message },
    #[serde(rename = "typing.started")]
    TypingStarted {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    #[serde(rename = "typing.stopped")]
    TypingStopped {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    #[serde(rename = "read.receipt")]
    ReadReceipt {
        conversation_id: ConversationId,
        receipt: ReadReceipt,
    },
}

impl ConversationEvent {
    pub fn conversation_id(&self) -> ConversationId {
        match self {
            Self::MessageNew { message } => message.conversation_id,
            Self::TypingStarted {
                conversation_id, ..
            }
            | Self::TypingStopped {
                conversation_id, ..
            }
            | Self::ReadReceipt {
                conversation_id, ..
            } => *conversation_id,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ModelError::Encode(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| ModelError::Decode(e.to_string()))
    }
}

/// Model-level errors.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("event encoding failed: {0}")]
    Encode(String),
    #[error("event decoding failed: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;
