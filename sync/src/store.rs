//! Durable message-store collaborator port.

use async_trait::async_trait;
use quillchat_model::{ConversationId, Message, MessageId, MessageKind, ProvisionalId, UserId};

/// Pagination cursor: fetch strictly older than this `(created_ms, id)` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    pub created_ms: i64,
    pub id: MessageId,
}

/// Failures reported by the store collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("append rejected: {0}")]
    Rejected(String),
}

/// Append-only access to the durable conversation log.
///
/// All calls must be safely retriable: `append` is idempotent by the
/// caller-supplied provisional id, `range` is a pure read, and `mark_read`
/// is a monotonic watermark (older timestamps are no-ops).
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Durably append a message and return the committed row with its
    /// server-assigned id.
    async fn append(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        provisional_id: ProvisionalId,
        body: String,
        kind: MessageKind,
    ) -> Result<Message, StoreError>;

    /// Fetch up to `limit` messages in reverse-chronological order, strictly
    /// older than `before` when a cursor is given, newest page otherwise.
    async fn range(
        &self,
        conversation_id: ConversationId,
        before: Option<PageCursor>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// Record that `reader_id` has read everything up to `up_to_ms`.
    /// Implementations update read timestamps only where currently null.
    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
        up_to_ms: i64,
    ) -> Result<(), StoreError>;
}
