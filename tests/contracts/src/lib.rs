//! In-memory collaborator fakes and a harness for exercising the engine's
//! external contracts end to end.

use async_trait::async_trait;
use quillchat_model::{
    ConversationId, DeliveryState, Message, MessageId, MessageKind, ProvisionalId, UserId,
};
use quillchat_sync::{
    BusPool, ConversationSnapshot, MemoryBus, MessageStore, PageCursor, StaticIdentity,
    StoreError, SyncConfig, SyncEngine,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Default)]
struct FakeStoreState {
    rows: Vec<Message>,
    read_watermarks: HashMap<(ConversationId, UserId), i64>,
}

/// Durable-log fake: append-only rows, reverse-chronological range scans,
/// monotonic read watermarks, and per-test fault injection.
pub struct FakeStore {
    state: Mutex<FakeStoreState>,
    next_created_ms: AtomicI64,
    /// Appends whose body equals this string fail with `Unavailable`.
    fail_body: Mutex<Option<String>>,
    /// Artificial latency for range scans, to exercise in-flight guards.
    range_delay: Mutex<Duration>,
}

impl Default for FakeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeStoreState::default()),
            next_created_ms: AtomicI64::new(1_000),
            fail_body: Mutex::new(None),
            range_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Seed a committed row directly, bypassing the append path.
    pub fn seed(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        body: &str,
        created_ms: i64,
    ) -> Message {
        let message = Message {
            id: MessageId(Uuid::new_v4()),
            provisional_id: None,
            conversation_id,
            sender_id,
            body: body.to_string(),
            kind: MessageKind::Text,
            created_ms,
            read_ms: None,
            state: DeliveryState::Sent,
        };
        self.state
            .lock()
            .expect("store lock")
            .rows
            .push(message.clone());
        message
    }

    pub fn fail_appends_with_body(&self, body: &str) {
        *self.fail_body.lock().expect("store lock") = Some(body.to_string());
    }

    pub fn clear_failures(&self) {
        *self.fail_body.lock().expect("store lock") = None;
    }

    pub fn set_range_delay(&self, delay: Duration) {
        *self.range_delay.lock().expect("store lock") = delay;
    }

    pub fn committed_row(&self, provisional_id: ProvisionalId) -> Option<Message> {
        self.state
            .lock()
            .expect("store lock")
            .rows
            .iter()
            .find(|m| m.provisional_id == Some(provisional_id))
            .cloned()
    }

    pub fn read_watermark(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
    ) -> Option<i64> {
        self.state
            .lock()
            .expect("store lock")
            .read_watermarks
            .get(&(conversation_id, reader_id))
            .copied()
    }

    pub fn row_count(&self, conversation_id: ConversationId) -> usize {
        self.state
            .lock()
            .expect("store lock")
            .rows
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .count()
    }
}

#[async_trait]
impl MessageStore for FakeStore {
    async fn append(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        provisional_id: ProvisionalId,
        body: String,
        kind: MessageKind,
    ) -> Result<Message, StoreError> {
        if self
            .fail_body
            .lock()
            .expect("store lock")
            .as_deref()
            .is_some_and(|fail| fail == body)
        {
            return Err(StoreError::Unavailable("injected append failure".into()));
        }

        let mut state = self.state.lock().expect("store lock");
        // Idempotent by the caller's provisional id.
        if let Some(existing) = state
            .rows
            .iter()
            .find(|m| m.provisional_id == Some(provisional_id))
        {
            return Ok(existing.clone());
        }

        let message = Message {
            id: MessageId(Uuid::new_v4()),
            provisional_id: Some(provisional_id),
            conversation_id,
            sender_id,
            body,
            kind,
            created_ms: self.next_created_ms.fetch_add(10, Ordering::SeqCst),
            read_ms: None,
            state: DeliveryState::Sent,
        };
        state.rows.push(message.clone());
        Ok(message)
    }

    async fn range(
        &self,
        conversation_id: ConversationId,
        before: Option<PageCursor>,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let delay = *self.range_delay.lock().expect("store lock");
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.lock().expect("store lock");
        let mut page: Vec<Message> = state
            .rows
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .filter(|m| match before {
                Some(cursor) => (m.created_ms, m.id) < (cursor.created_ms, cursor.id),
                None => true,
            })
            .cloned()
            .collect();
        page.sort_by_key(|m| std::cmp::Reverse(m.order_key()));
        page.truncate(limit);
        Ok(page)
    }

    async fn mark_read(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
        up_to_ms: i64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().expect("store lock");
        let watermark = state
            .read_watermarks
            .entry((conversation_id, reader_id))
            .or_insert(0);
        if up_to_ms > *watermark {
            *watermark = up_to_ms;
        }
        let mark = *watermark;
        // Update-if-null, the atomic read-mark semantics of the real store.
        for row in state
            .rows
            .iter_mut()
            .filter(|m| m.sender_id != reader_id && m.created_ms <= mark)
        {
            if row.read_ms.is_none() {
                row.read_ms = Some(mark);
            }
        }
        Ok(())
    }
}

/// Everything one contract test needs, wired over the in-memory fakes.
pub struct Harness {
    pub engine: SyncEngine,
    pub store: Arc<FakeStore>,
    pub bus: MemoryBus,
    pub pool: Arc<BusPool>,
    pub identity: StaticIdentity,
    pub conversation_id: ConversationId,
    pub me: UserId,
    pub peer: UserId,
}

impl Harness {
    pub fn new(config: SyncConfig) -> Self {
        let store = Arc::new(FakeStore::new());
        let bus = MemoryBus::new();
        let pool_bus = bus.clone();
        let pool = BusPool::new(move || {
            Arc::new(pool_bus.clone()) as Arc<dyn quillchat_sync::EventBus>
        });
        let me = UserId::new();
        let identity = StaticIdentity::signed_in(me);
        let engine = SyncEngine::new(
            config,
            Arc::clone(&store) as Arc<dyn MessageStore>,
            Arc::clone(&pool),
            Arc::new(identity.clone()),
        );
        Self {
            engine,
            store,
            bus,
            pool,
            identity,
            conversation_id: ConversationId::new(),
            me,
            peer: UserId::new(),
        }
    }
}

/// Config with short windows so contract tests settle quickly.
pub fn fast_config() -> SyncConfig {
    SyncConfig {
        page_size: 50,
        poll_interval: Duration::from_millis(200),
        typing_expiry: Duration::from_millis(150),
        typing_debounce: Duration::from_millis(40),
        typing_pause: Duration::from_millis(80),
        read_mark_debounce: Duration::from_millis(50),
        mailbox_capacity: 64,
    }
}

/// Await a snapshot matching `pred`, with a hard timeout.
pub async fn wait_for(
    snapshots: &mut watch::Receiver<ConversationSnapshot>,
    mut pred: impl FnMut(&ConversationSnapshot) -> bool,
) -> ConversationSnapshot {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let current = snapshots.borrow_and_update();
                if pred(&current) {
                    return current.clone();
                }
            }
            snapshots
                .changed()
                .await
                .expect("engine stopped before the condition was reached");
        }
    })
    .await
    .expect("condition not reached in time")
}
