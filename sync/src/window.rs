//! Materialized view of one conversation: the loaded message window, its
//! pagination cursor, and the idempotent merge rules that keep the window
//! consistent across the send, push, and poll paths.

use crate::store::PageCursor;
use quillchat_model::{
    ConversationId, DeliveryState, Message, MessageId, ProvisionalId, ReadReceipt, UserId,
};

/// Outcome of asking the cursor for a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageRequest {
    /// Fetch started; the caller owns driving it to completion.
    Started,
    /// A fetch is already in flight for this window.
    Busy,
    /// No older messages remain.
    Exhausted,
}

/// Outcome of merging one message into the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Owns the loaded slice of history: page size, oldest-key cursor,
/// exhausted flag, and the single-fetch-in-flight guard.
#[derive(Debug, Clone)]
pub struct PaginationCursor {
    page_size: usize,
    exhausted: bool,
    in_flight: bool,
}

impl PaginationCursor {
    fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            exhausted: false,
            in_flight: false,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }
}

/// The client-side window over one conversation's log, ordered by
/// `(created_ms, id)` and deduplicated by message id.
#[derive(Debug, Clone)]
pub struct ConversationWindow {
    conversation_id: ConversationId,
    messages: Vec<Message>,
    cursor: PaginationCursor,
}

fn state_rank(state: DeliveryState) -> u8 {
    match state {
        DeliveryState::Failed => 0,
        DeliveryState::Sending => 1,
        DeliveryState::Sent => 2,
        DeliveryState::Delivered => 3,
        DeliveryState::Read => 4,
    }
}

impl ConversationWindow {
    pub fn new(conversation_id: ConversationId, page_size: usize) -> Self {
        Self {
            conversation_id,
            messages: Vec::new(),
            cursor: PaginationCursor::new(page_size),
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn cursor(&self) -> &PaginationCursor {
        &self.cursor
    }

    /// Key of the oldest loaded message, the `before` cursor for the next
    /// older page.
    pub fn oldest_key(&self) -> Option<PageCursor> {
        self.messages.first().map(|m| PageCursor {
            created_ms: m.created_ms,
            id: m.id,
        })
    }

    /// Key of the newest committed message, the tail the poll path must
    /// reach back to. Unconfirmed sends carry local timestamps and are
    /// skipped.
    pub fn newest_committed_key(&self) -> Option<PageCursor> {
        self.messages
            .iter()
            .rev()
            .find(|m| !matches!(m.state, DeliveryState::Sending | DeliveryState::Failed))
            .map(|m| PageCursor {
                created_ms: m.created_ms,
                id: m.id,
            })
    }

    /// Claim the fetch slot for an initial load.
    pub fn begin_initial_load(&mut self) -> PageRequest {
        if self.cursor.in_flight {
            return PageRequest::Busy;
        }
        self.cursor.in_flight = true;
        PageRequest::Started
    }

    /// Claim the fetch slot for an older page.
    pub fn begin_older_load(&mut self) -> PageRequest {
        if self.cursor.in_flight {
            return PageRequest::Busy;
        }
        if self.cursor.exhausted {
            return PageRequest::Exhausted;
        }
        self.cursor.in_flight = true;
        PageRequest::Started
    }

    /// Release the fetch slot without touching the window (load failure).
    pub fn abort_load(&mut self) {
        self.cursor.in_flight = false;
    }

    /// Replace the window with the newest page, given newest-first as the
    /// store returns it.
    pub fn finish_initial_load(&mut self, mut page_newest_first: Vec<Message>) {
        self.cursor.in_flight = false;
        self.cursor.exhausted = page_newest_first.len() < self.cursor.page_size;
        page_newest_first.reverse();
        let previous = std::mem::replace(&mut self.messages, page_newest_first);
        // Optimistic sends and push arrivals that beat the fetch survive
        // the replacement.
        for message in previous {
            self.merge(message);
        }
    }

    /// Prepend an older page, given newest-first. Messages already present
    /// are skipped so overlapping pages never duplicate.
    pub fn finish_older_load(&mut self, page_newest_first: Vec<Message>) {
        self.cursor.in_flight = false;
        if page_newest_first.len() < self.cursor.page_size {
            self.cursor.exhausted = true;
        }
        let mut chronological: Vec<Message> = page_newest_first
            .into_iter()
            .rev()
            .filter(|m| !self.contains(m.id))
            .collect();
        chronological.append(&mut self.messages);
        self.messages = chronological;
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.messages.iter().any(|m| m.id == id)
    }

    /// Append a provisional message at the live tail.
    pub fn push_provisional(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Merge one message from the push or poll path: update in place when
    /// the id (or the sender's provisional echo) is already present,
    /// otherwise insert at the ordered position. Idempotent.
    pub fn merge(&mut self, incoming: Message) -> MergeOutcome {
        if let Some(existing) = self.messages.iter_mut().find(|m| m.id == incoming.id) {
            return Self::absorb(existing, &incoming);
        }

        if let Some(pid) = incoming.provisional_id {
            if let Some(existing) = self
                .messages
                .iter_mut()
                .find(|m| m.provisional_id == Some(pid))
            {
                // Our own echo arriving before the append response: commit
                // in place rather than inserting a duplicate.
                existing.id = incoming.id;
                existing.created_ms = incoming.created_ms;
                Self::absorb(existing, &incoming);
                return MergeOutcome::Updated;
            }
        }

        let key = incoming.order_key();
        let index = self
            .messages
            .partition_point(|m| m.order_key() <= key);
        self.messages.insert(index, incoming);
        MergeOutcome::Inserted
    }

    /// Fold delivery/read progress from `incoming` into an already-present
    /// message. State only advances and read marks only grow.
    fn absorb(existing: &mut Message, incoming: &Message) -> MergeOutcome {
        let mut changed = false;
        if state_rank(incoming.state) > state_rank(existing.state) {
            existing.state = incoming.state;
            changed = true;
        }
        match (existing.read_ms, incoming.read_ms) {
            (None, Some(read)) => {
                existing.read_ms = Some(read);
                changed = true;
            }
            (Some(current), Some(read)) if read > current => {
                existing.read_ms = Some(read);
                changed = true;
            }
            _ => {}
        }
        if changed {
            MergeOutcome::Updated
        } else {
            MergeOutcome::Unchanged
        }
    }

    /// Commit an optimistic send in place: adopt the server id and
    /// timestamp, advance to Sent, keep the list position frozen.
    pub fn commit_send(&mut self, provisional_id: ProvisionalId, committed: &Message) -> bool {
        match self
            .messages
            .iter_mut()
            .find(|m| m.provisional_id == Some(provisional_id))
        {
            Some(existing) => {
                existing.id = committed.id;
                existing.created_ms = committed.created_ms;
                if state_rank(existing.state) < state_rank(DeliveryState::Sent) {
                    existing.state = DeliveryState::Sent;
                }
                true
            }
            None => false,
        }
    }

    /// Mark a provisional send failed; it stays visible for retry/dismiss.
    pub fn fail_send(&mut self, provisional_id: ProvisionalId) -> bool {
        match self
            .messages
            .iter_mut()
            .find(|m| m.provisional_id == Some(provisional_id))
        {
            // An echo may have committed the message while the append
            // response was in flight; a commit always wins over a failure.
            Some(existing) if existing.state == DeliveryState::Sending => {
                existing.state = DeliveryState::Failed;
                true
            }
            _ => false,
        }
    }

    /// Put a failed send back into Sending for a retry attempt.
    pub fn restart_send(&mut self, provisional_id: ProvisionalId) -> Option<Message> {
        self.messages
            .iter_mut()
            .find(|m| m.provisional_id == Some(provisional_id) && m.state == DeliveryState::Failed)
            .map(|existing| {
                existing.state = DeliveryState::Sending;
                existing.clone()
            })
    }

    /// Drop a failed send the user dismissed. Only failed messages may be
    /// removed; committed history is append-only.
    pub fn dismiss_failed(&mut self, provisional_id: ProvisionalId) -> bool {
        let before = self.messages.len();
        self.messages
            .retain(|m| !(m.provisional_id == Some(provisional_id) && m.state == DeliveryState::Failed));
        self.messages.len() != before
    }

    /// Mark received messages read in the local view when we read them
    /// ourselves. Same monotonic rule as peer receipts.
    pub fn apply_local_read(&mut self, own_id: UserId, up_to_ms: i64, read_at_ms: i64) -> usize {
        let mut updated = 0;
        for message in self
            .messages
            .iter_mut()
            .filter(|m| m.sender_id != own_id && m.created_ms <= up_to_ms)
        {
            let newer = match message.read_ms {
                None => true,
                Some(current) => read_at_ms > current,
            };
            if newer {
                message.read_ms = Some(read_at_ms);
                if state_rank(message.state) < state_rank(DeliveryState::Read) {
                    message.state = DeliveryState::Read;
                }
                updated += 1;
            }
        }
        updated
    }

    /// Apply a peer's read watermark to our own messages. Monotonic: a
    /// stale watermark never reverts an earlier mark.
    pub fn apply_receipt(&mut self, own_id: UserId, receipt: &ReadReceipt) -> usize {
        if receipt.reader_id == own_id {
            return 0;
        }
        let mut updated = 0;
        for message in self
            .messages
            .iter_mut()
            .filter(|m| m.sender_id == own_id && m.created_ms <= receipt.up_to_ms)
        {
            let newer = match message.read_ms {
                None => true,
                Some(current) => receipt.read_at_ms > current,
            };
            if newer {
                message.read_ms = Some(receipt.read_at_ms);
                updated += 1;
            }
            if state_rank(message.state) < state_rank(DeliveryState::Read) {
                message.state = DeliveryState::Read;
            }
        }
        updated
    }
}
