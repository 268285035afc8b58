//! Per-conversation synchronization engine: the host-facing handle and the
//! command surface of the reconciliation actor.

mod runtime;

use crate::bus::BusPool;
use crate::clock::{Clock, SystemClock};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::identity::IdentityProvider;
use crate::store::MessageStore;
use crate::window::PageRequest;
use quillchat_model::{ConversationId, Message, MessageKind, ProvisionalId, UserId};
use runtime::SyncRuntime;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

/// Consistent view published to the host after every processed event.
#[derive(Debug, Clone)]
pub struct ConversationSnapshot {
    pub conversation_id: ConversationId,
    pub messages: Vec<Message>,
    /// Peers currently typing, expiry already applied.
    pub typing: Vec<UserId>,
    /// No older history remains to page in.
    pub exhausted: bool,
    /// Latest user-facing notice (send failure, load failure), if any.
    pub notice: Option<String>,
}

impl ConversationSnapshot {
    fn empty(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            messages: Vec::new(),
            typing: Vec::new(),
            exhausted: false,
            notice: None,
        }
    }
}

/// Commands accepted by the reconciliation actor. Every mutation enters the
/// conversation through this mailbox, one at a time.
pub(crate) enum SyncCommand {
    Send {
        body: String,
        kind: MessageKind,
        responder: oneshot::Sender<Result<ProvisionalId>>,
    },
    RetrySend {
        provisional_id: ProvisionalId,
        responder: oneshot::Sender<Result<bool>>,
    },
    DismissFailed {
        provisional_id: ProvisionalId,
        responder: oneshot::Sender<bool>,
    },
    LoadOlder {
        responder: oneshot::Sender<Result<PageRequest>>,
    },
    MarkRead {
        responder: oneshot::Sender<Result<()>>,
    },
    Keystroke,
    Close {
        responder: oneshot::Sender<()>,
    },
}

/// Factory wiring the collaborator ports to per-conversation actors.
pub struct SyncEngine {
    config: SyncConfig,
    store: Arc<dyn MessageStore>,
    bus_pool: Arc<BusPool>,
    identity: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn MessageStore>,
        bus_pool: Arc<BusPool>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            config,
            store,
            bus_pool,
            identity,
            clock: Arc::new(SystemClock),
        }
    }

    /// Swap the wall clock, for deterministic tests.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Open a conversation: subscribe to its topic, start the
    /// reconciliation actor, kick off the initial history load.
    pub async fn open(&self, conversation_id: ConversationId) -> Result<ConversationHandle> {
        let topic = crate::bus::Topic::conversation(conversation_id);
        let subscription = self.bus_pool.subscribe(&topic).await?;

        let (command_tx, command_rx) = mpsc::channel(self.config.mailbox_capacity);
        let (snapshot_tx, snapshot_rx) =
            watch::channel(ConversationSnapshot::empty(conversation_id));

        let actor = SyncRuntime::new(
            conversation_id,
            self.config.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.identity),
            Arc::clone(&self.clock),
            subscription,
            command_rx,
            snapshot_tx,
        );
        tokio::spawn(actor.run());

        Ok(ConversationHandle {
            conversation_id,
            commands: command_tx,
            snapshots: snapshot_rx,
        })
    }
}

/// Host-side handle to one open conversation. All methods return
/// immediately after the actor acknowledges the command; none block on
/// network completion.
pub struct ConversationHandle {
    conversation_id: ConversationId,
    commands: mpsc::Sender<SyncCommand>,
    snapshots: watch::Receiver<ConversationSnapshot>,
}

impl ConversationHandle {
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    /// Watch channel carrying the canonical window; the UI renders from
    /// this.
    pub fn snapshots(&self) -> watch::Receiver<ConversationSnapshot> {
        self.snapshots.clone()
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Optimistically send a message; resolves to the provisional id once
    /// the message is visible in the window.
    pub async fn send(&self, body: impl Into<String>, kind: MessageKind) -> Result<ProvisionalId> {
        self.request(|responder| SyncCommand::Send {
            body: body.into(),
            kind,
            responder,
        })
        .await?
    }

    /// Re-run the append for a failed send; false when there is no failed
    /// message under this provisional id.
    pub async fn retry_send(&self, provisional_id: ProvisionalId) -> Result<bool> {
        self.request(|responder| SyncCommand::RetrySend {
            provisional_id,
            responder,
        })
        .await?
    }

    /// Drop a failed send from the window.
    pub async fn dismiss_failed(&self, provisional_id: ProvisionalId) -> Result<bool> {
        self.request(|responder| SyncCommand::DismissFailed {
            provisional_id,
            responder,
        })
        .await
    }

    /// Page one batch of older history in; `Busy` while another load is in
    /// flight, `Exhausted` once the top of the log is reached.
    pub async fn load_older(&self) -> Result<PageRequest> {
        self.request(|responder| SyncCommand::LoadOlder { responder })
            .await?
    }

    /// Mark everything currently loaded as read. Writes are coalesced; the
    /// peer sees one receipt per debounce window.
    pub async fn mark_read(&self) -> Result<()> {
        self.request(|responder| SyncCommand::MarkRead { responder })
            .await?
    }

    /// Report local keystroke activity; broadcasts are throttled.
    pub async fn keystroke(&self) -> Result<()> {
        self.commands
            .send(SyncCommand::Keystroke)
            .await
            .map_err(|_| SyncError::Closed)
    }

    /// Close the conversation: unsubscribe, cancel timers and in-flight
    /// loads, stop the actor. Resolves once teardown has completed; any
    /// later command on this handle fails with `Closed`. Dropping every
    /// handle closes the conversation the same way.
    pub async fn close(&self) {
        let (responder, done) = oneshot::channel();
        if self
            .commands
            .send(SyncCommand::Close { responder })
            .await
            .is_ok()
        {
            let _ = done.await;
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SyncCommand,
    ) -> Result<T> {
        let (responder, response) = oneshot::channel();
        self.commands
            .send(build(responder))
            .await
            .map_err(|_| SyncError::Closed)?;
        response.await.map_err(|_| SyncError::Closed)
    }
}
