//! The reconciliation actor: one task per open conversation merging the
//! send, push, and poll paths into the canonical window.

use super::{ConversationSnapshot, SyncCommand};
use crate::bus::PooledSubscription;
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::identity::IdentityProvider;
use crate::ledger::{ActionNotices, OptimisticLedger};
use crate::presence::{PresenceTracker, TypingThrottle};
use crate::store::{MessageStore, PageCursor, StoreError};
use crate::window::{ConversationWindow, PageRequest};
use quillchat_model::{
    ActionId, ConversationEvent, ConversationId, Message, MessageKind, ProvisionalId, ReadReceipt,
    UserId,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

/// Completions of store calls running off the actor, funneled back into
/// the mailbox loop so every window mutation stays serialized.
enum TaskResult {
    AppendDone {
        action_id: ActionId,
        provisional_id: ProvisionalId,
        result: Result<Message, StoreError>,
    },
    PageLoaded {
        initial: bool,
        result: Result<Vec<Message>, StoreError>,
    },
    PollLoaded {
        result: Result<Vec<Message>, StoreError>,
    },
    ReadMarkFlushed {
        up_to_ms: i64,
        result: Result<(), StoreError>,
    },
}

/// Coalesced read-mark writes: one store call per debounce window, stale
/// watermarks silently skipped.
#[derive(Debug, Default)]
struct ReadMarkBatch {
    pending_ms: Option<i64>,
    deadline_ms: Option<i64>,
    flushed_ms: i64,
}

pub(crate) struct SyncRuntime {
    conversation_id: ConversationId,
    config: SyncConfig,
    store: Arc<dyn MessageStore>,
    identity: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
    subscription: Option<PooledSubscription>,
    subscription_open: bool,
    commands: mpsc::Receiver<SyncCommand>,
    snapshots: watch::Sender<ConversationSnapshot>,
    window: ConversationWindow,
    ledger: OptimisticLedger<ConversationWindow>,
    presence: PresenceTracker,
    throttle: TypingThrottle,
    tasks_tx: mpsc::UnboundedSender<TaskResult>,
    tasks_rx: mpsc::UnboundedReceiver<TaskResult>,
    load_task: Option<JoinHandle<()>>,
    poll_task: Option<JoinHandle<()>>,
    read_marks: ReadMarkBatch,
    notice: Option<String>,
}

impl SyncRuntime {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        conversation_id: ConversationId,
        config: SyncConfig,
        store: Arc<dyn MessageStore>,
        identity: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
        subscription: PooledSubscription,
        commands: mpsc::Receiver<SyncCommand>,
        snapshots: watch::Sender<ConversationSnapshot>,
    ) -> Self {
        let (tasks_tx, tasks_rx) = mpsc::unbounded_channel();
        let window = ConversationWindow::new(conversation_id, config.page_size);
        let presence = PresenceTracker::new(config.typing_expiry);
        let throttle = TypingThrottle::new(config.typing_debounce, config.typing_pause);
        Self {
            conversation_id,
            config,
            store,
            identity,
            clock,
            subscription: Some(subscription),
            subscription_open: true,
            commands,
            snapshots,
            window,
            ledger: OptimisticLedger::new(),
            presence,
            throttle,
            tasks_tx,
            tasks_rx,
            load_task: None,
            poll_task: None,
            read_marks: ReadMarkBatch::default(),
            notice: None,
        }
    }

    pub(crate) async fn run(mut self) {
        self.start_initial_load();

        let mut poll = interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The initial load covers the first tick.
        poll.tick().await;

        loop {
            let wake_ms = self.next_wake_ms();
            let now_ms = self.clock.now_ms();

            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(SyncCommand::Close { responder }) => {
                            self.shutdown().await;
                            let _ = responder.send(());
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd),
                        None => {
                            // Every handle dropped: same as close.
                            self.shutdown().await;
                            break;
                        }
                    }
                }
                event = Self::next_bus_event(&mut self.subscription), if self.subscription_open => {
                    match event {
                        Some(event) => self.handle_bus_event(event),
                        None => {
                            // Bus went away; the poll backstop keeps the
                            // window converging until reopened.
                            warn!(conversation = %self.conversation_id.0, "push channel closed");
                            self.subscription_open = false;
                        }
                    }
                }
                Some(result) = self.tasks_rx.recv() => self.handle_task(result),
                _ = poll.tick() => self.start_poll(),
                _ = sleep_until_ms(wake_ms, now_ms) => self.handle_deadlines(),
            }

            self.publish_snapshot();
        }
    }

    async fn next_bus_event(
        subscription: &mut Option<PooledSubscription>,
    ) -> Option<ConversationEvent> {
        match subscription.as_mut() {
            Some(sub) => sub.recv().await,
            None => None,
        }
    }

    // ---- command path -----------------------------------------------------

    fn handle_command(&mut self, command: SyncCommand) {
        match command {
            SyncCommand::Send {
                body,
                kind,
                responder,
            } => self.handle_send(body, kind, responder),
            SyncCommand::RetrySend {
                provisional_id,
                responder,
            } => self.handle_retry(provisional_id, responder),
            SyncCommand::DismissFailed {
                provisional_id,
                responder,
            } => {
                let _ = responder.send(self.window.dismiss_failed(provisional_id));
            }
            SyncCommand::LoadOlder { responder } => self.handle_load_older(responder),
            SyncCommand::MarkRead { responder } => self.handle_mark_read(responder),
            SyncCommand::Keystroke => self.handle_keystroke(),
            // Close is intercepted in the loop.
            SyncCommand::Close { responder } => {
                let _ = responder.send(());
            }
        }
    }

    fn handle_send(
        &mut self,
        body: String,
        kind: MessageKind,
        responder: oneshot::Sender<crate::error::Result<ProvisionalId>>,
    ) {
        let Some(sender_id) = self.identity.current_user_id() else {
            let _ = responder.send(Err(SyncError::Unauthenticated));
            return;
        };

        let now_ms = self.clock.now_ms();
        let message =
            Message::provisional(self.conversation_id, sender_id, body.clone(), kind, now_ms);
        // The provisional constructor seeds the id from the provisional id.
        let provisional_id = message
            .provisional_id
            .unwrap_or(ProvisionalId(message.id.0));
        let action_id = ActionId::new();

        let applied = message.clone();
        let begun = self.ledger.begin(
            action_id,
            ActionNotices {
                on_success: "message sent".into(),
                on_failure: "message could not be sent".into(),
            },
            &mut self.window,
            move |window| window.push_provisional(applied),
            move |window| {
                window.fail_send(provisional_id);
            },
        );
        if let Err(err) = begun {
            let _ = responder.send(Err(SyncError::AlreadyPending(action_id)));
            warn!(%err, "optimistic apply rejected");
            return;
        }

        // Sending implies the keyboard went quiet.
        if self.throttle.flush_stop() {
            self.publish_typing(sender_id, false);
        }

        self.spawn_append(action_id, provisional_id, sender_id, body, kind);
        let _ = responder.send(Ok(provisional_id));
    }

    fn handle_retry(
        &mut self,
        provisional_id: ProvisionalId,
        responder: oneshot::Sender<crate::error::Result<bool>>,
    ) {
        let Some(sender_id) = self.identity.current_user_id() else {
            let _ = responder.send(Err(SyncError::Unauthenticated));
            return;
        };
        let Some(message) = self.window.restart_send(provisional_id) else {
            let _ = responder.send(Ok(false));
            return;
        };

        let action_id = ActionId::new();
        let begun = self.ledger.begin(
            action_id,
            ActionNotices {
                on_success: "message sent".into(),
                on_failure: "message could not be sent".into(),
            },
            &mut self.window,
            // restart_send already flipped the state back to Sending.
            |_| {},
            move |window| {
                window.fail_send(provisional_id);
            },
        );
        if begun.is_err() {
            let _ = responder.send(Err(SyncError::AlreadyPending(action_id)));
            return;
        }

        self.spawn_append(action_id, provisional_id, sender_id, message.body, message.kind);
        let _ = responder.send(Ok(true));
    }

    fn handle_load_older(
        &mut self,
        responder: oneshot::Sender<crate::error::Result<PageRequest>>,
    ) {
        let request = self.window.begin_older_load();
        if request == PageRequest::Started {
            let before = self.window.oldest_key();
            let store = Arc::clone(&self.store);
            let conversation_id = self.conversation_id;
            let limit = self.window.cursor().page_size();
            let tasks = self.tasks_tx.clone();
            self.load_task = Some(tokio::spawn(async move {
                let result = store.range(conversation_id, before, limit).await;
                let _ = tasks.send(TaskResult::PageLoaded {
                    initial: false,
                    result,
                });
            }));
        }
        let _ = responder.send(Ok(request));
    }

    fn handle_mark_read(&mut self, responder: oneshot::Sender<crate::error::Result<()>>) {
        let Some(reader_id) = self.identity.current_user_id() else {
            let _ = responder.send(Err(SyncError::Unauthenticated));
            return;
        };

        let Some(up_to_ms) = self.window.messages().last().map(|m| m.created_ms) else {
            let _ = responder.send(Ok(()));
            return;
        };
        // Stale watermark: silently skipped, by contract not an error.
        if up_to_ms <= self.read_marks.flushed_ms {
            let _ = responder.send(Ok(()));
            return;
        }

        let now_ms = self.clock.now_ms();
        self.window.apply_local_read(reader_id, up_to_ms, now_ms);
        self.read_marks.pending_ms = Some(match self.read_marks.pending_ms {
            Some(pending) => pending.max(up_to_ms),
            None => up_to_ms,
        });
        let debounce = self.config.read_mark_debounce.as_millis() as i64;
        self.read_marks
            .deadline_ms
            .get_or_insert(now_ms + debounce);

        let _ = responder.send(Ok(()));
    }

    fn handle_keystroke(&mut self) {
        let Some(user_id) = self.identity.current_user_id() else {
            debug!("keystroke without a session, ignoring");
            return;
        };
        if self.throttle.keystroke(self.clock.now_ms()) {
            self.publish_typing(user_id, true);
        }
    }

    // ---- push path --------------------------------------------------------

    fn handle_bus_event(&mut self, event: ConversationEvent) {
        if event.conversation_id() != self.conversation_id {
            debug!("event for another conversation, ignoring");
            return;
        }
        let own_id = self.identity.current_user_id();
        let now_ms = self.clock.now_ms();

        match event {
            ConversationEvent::MessageNew { message } => {
                let outcome = self.window.merge(message);
                debug!(?outcome, "push merge");
            }
            ConversationEvent::TypingStarted { user_id, .. } => {
                if Some(user_id) != own_id {
                    self.presence.observe_start(user_id, now_ms);
                }
            }
            ConversationEvent::TypingStopped { user_id, .. } => {
                if Some(user_id) != own_id {
                    self.presence.observe_stop(user_id);
                }
            }
            ConversationEvent::ReadReceipt { receipt, .. } => {
                if let Some(own_id) = own_id {
                    self.window.apply_receipt(own_id, &receipt);
                }
            }
        }
    }

    // ---- task completions -------------------------------------------------

    fn handle_task(&mut self, result: TaskResult) {
        match result {
            TaskResult::AppendDone {
                action_id,
                provisional_id,
                result,
            } => match result {
                Ok(committed) => {
                    self.window.commit_send(provisional_id, &committed);
                    match self.ledger.commit(action_id) {
                        Ok(notices) => debug!(action = %action_id, "{}", notices.on_success),
                        Err(err) => warn!(%err, "commit for unknown action"),
                    }
                }
                Err(err) => {
                    warn!(%err, action = %action_id, "append failed");
                    match self.ledger.roll_back(action_id, &mut self.window) {
                        Ok(notices) => self.notice = Some(notices.on_failure),
                        Err(err) => warn!(%err, "rollback for unknown action"),
                    }
                }
            },
            TaskResult::PageLoaded { initial, result } => {
                self.load_task = None;
                match result {
                    Ok(page) if initial => self.window.finish_initial_load(page),
                    Ok(page) => self.window.finish_older_load(page),
                    Err(err) => {
                        self.window.abort_load();
                        warn!(%err, "history load failed");
                        self.notice = Some("could not load messages".into());
                    }
                }
            }
            TaskResult::PollLoaded { result } => {
                self.poll_task = None;
                match result {
                    Ok(page) => {
                        for message in page {
                            self.window.merge(message);
                        }
                    }
                    // The next tick is the retry.
                    Err(err) => warn!(%err, "poll fetch failed"),
                }
            }
            TaskResult::ReadMarkFlushed { up_to_ms, result } => match result {
                Ok(()) => {
                    self.read_marks.flushed_ms = self.read_marks.flushed_ms.max(up_to_ms);
                }
                Err(err) => warn!(%err, "read mark flush failed"),
            },
        }
    }

    // ---- timers -----------------------------------------------------------

    fn next_wake_ms(&self) -> Option<i64> {
        [
            self.presence.next_deadline_ms(),
            self.throttle.next_deadline_ms(),
            self.read_marks.deadline_ms,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn handle_deadlines(&mut self) {
        let now_ms = self.clock.now_ms();

        for user in self.presence.sweep(now_ms) {
            debug!(user = %user.0, "typing entry expired");
        }

        if self.throttle.poll_stop(now_ms) {
            if let Some(user_id) = self.identity.current_user_id() {
                self.publish_typing(user_id, false);
            }
        }

        if matches!(self.read_marks.deadline_ms, Some(deadline) if now_ms >= deadline) {
            self.flush_read_marks(now_ms);
        }
    }

    fn flush_read_marks(&mut self, now_ms: i64) {
        self.read_marks.deadline_ms = None;
        let Some(up_to_ms) = self.read_marks.pending_ms.take() else {
            return;
        };
        let Some(reader_id) = self.identity.current_user_id() else {
            return;
        };

        let store = Arc::clone(&self.store);
        let conversation_id = self.conversation_id;
        let tasks = self.tasks_tx.clone();
        tokio::spawn(async move {
            let result = store.mark_read(conversation_id, reader_id, up_to_ms).await;
            let _ = tasks.send(TaskResult::ReadMarkFlushed { up_to_ms, result });
        });

        self.publish_event(ConversationEvent::ReadReceipt {
            conversation_id: self.conversation_id,
            receipt: ReadReceipt {
                reader_id,
                up_to_ms,
                read_at_ms: now_ms,
            },
        });
    }

    // ---- fetch/publish plumbing -------------------------------------------

    fn start_initial_load(&mut self) {
        if self.window.begin_initial_load() != PageRequest::Started {
            return;
        }
        let store = Arc::clone(&self.store);
        let conversation_id = self.conversation_id;
        let limit = self.window.cursor().page_size();
        let tasks = self.tasks_tx.clone();
        self.load_task = Some(tokio::spawn(async move {
            let result = store.range(conversation_id, None, limit).await;
            let _ = tasks.send(TaskResult::PageLoaded {
                initial: true,
                result,
            });
        }));
    }

    fn start_poll(&mut self) {
        // One poll fetch at a time; a slow store must not stack requests.
        if self.poll_task.is_some() {
            return;
        }
        let store = Arc::clone(&self.store);
        let conversation_id = self.conversation_id;
        let limit = self.window.cursor().page_size();
        let tail = self.window.newest_committed_key();
        let tasks = self.tasks_tx.clone();
        self.poll_task = Some(tokio::spawn(async move {
            let result = fetch_since_tail(store, conversation_id, tail, limit).await;
            let _ = tasks.send(TaskResult::PollLoaded { result });
        }));
    }

    fn spawn_append(
        &self,
        action_id: ActionId,
        provisional_id: ProvisionalId,
        sender_id: UserId,
        body: String,
        kind: MessageKind,
    ) {
        let store = Arc::clone(&self.store);
        let conversation_id = self.conversation_id;
        let tasks = self.tasks_tx.clone();
        tokio::spawn(async move {
            let result = store
                .append(conversation_id, sender_id, provisional_id, body, kind)
                .await;
            let _ = tasks.send(TaskResult::AppendDone {
                action_id,
                provisional_id,
                result,
            });
        });
    }

    fn publish_typing(&self, user_id: UserId, started: bool) {
        let event = if started {
            ConversationEvent::TypingStarted {
                conversation_id: self.conversation_id,
                user_id,
            }
        } else {
            ConversationEvent::TypingStopped {
                conversation_id: self.conversation_id,
                user_id,
            }
        };
        self.publish_event(event);
    }

    /// Fire-and-forget broadcast: a lost presence ping is tolerable, the
    /// receiver's expiry bounds the staleness.
    fn publish_event(&self, event: ConversationEvent) {
        let Some(subscription) = self.subscription.as_ref() else {
            return;
        };
        let bus = subscription.bus();
        let topic = crate::bus::Topic::conversation(self.conversation_id);
        tokio::spawn(async move {
            if let Err(err) = bus.publish(&topic, event).await {
                warn!(%err, "ephemeral publish failed");
            }
        });
    }

    fn publish_snapshot(&self) {
        let now_ms = self.clock.now_ms();
        let snapshot = ConversationSnapshot {
            conversation_id: self.conversation_id,
            messages: self.window.messages().to_vec(),
            typing: self.presence.typing_users(now_ms),
            exhausted: self.window.cursor().is_exhausted(),
            notice: self.notice.clone(),
        };
        let _ = self.snapshots.send(snapshot);
    }

    // ---- teardown ---------------------------------------------------------

    /// Subscription, poll, presence timers, and in-flight loads are
    /// released together; no event is processed after this returns.
    async fn shutdown(&mut self) {
        if let Some(task) = self.load_task.take() {
            task.abort();
        }
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }

        if self.throttle.flush_stop() {
            if let Some(user_id) = self.identity.current_user_id() {
                self.publish_typing(user_id, false);
            }
        }
        self.presence.clear();

        // Best-effort final read-mark flush before the actor goes away.
        let now_ms = self.clock.now_ms();
        self.flush_read_marks(now_ms);

        self.subscription_open = false;
        if let Some(subscription) = self.subscription.take() {
            subscription.close().await;
        }
    }
}

/// Page newest-first through the log until the fetched span reaches the
/// window's tail key, or history runs out. A burst larger than one page
/// landing between ticks is recovered in full, not just its newest page.
async fn fetch_since_tail(
    store: Arc<dyn MessageStore>,
    conversation_id: ConversationId,
    tail: Option<PageCursor>,
    limit: usize,
) -> Result<Vec<Message>, StoreError> {
    let mut collected = Vec::new();
    let mut before: Option<PageCursor> = None;
    loop {
        let page = store.range(conversation_id, before, limit).await?;
        let short = page.len() < limit;
        let reached_tail = match tail {
            Some(tail) => page
                .iter()
                .any(|m| m.order_key() <= (tail.created_ms, tail.id)),
            // An empty window has no tail to reach back to; the newest
            // page is the whole catch-up.
            None => true,
        };
        before = page.last().map(|m| PageCursor {
            created_ms: m.created_ms,
            id: m.id,
        });
        collected.extend(page);
        if short || reached_tail {
            return Ok(collected);
        }
    }
}

/// Sleep until a unix-ms deadline, or forever when none is armed.
async fn sleep_until_ms(deadline_ms: Option<i64>, now_ms: i64) {
    match deadline_ms {
        Some(deadline) => {
            let delta = (deadline - now_ms).max(0) as u64;
            tokio::time::sleep(Duration::from_millis(delta)).await;
        }
        None => std::future::pending().await,
    }
}
