//! Event-bus collaborator port, an in-process implementation, and the
//! reference-counted connection pool shared across conversations.

use async_trait::async_trait;
use quillchat_model::{ConversationEvent, ConversationId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

/// Named channel a conversation's events are published on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic(String);

impl Topic {
    pub fn conversation(id: ConversationId) -> Self {
        Self(format!("conversation.{}", id.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Handle identifying one live subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub Uuid);

/// Failures reported by the bus collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("bus connection failed: {0}")]
    Connection(String),
    #[error("subscription error: {0}")]
    Subscription(String),
    #[error("publish failed: {0}")]
    Publish(String),
}

/// One live subscription: the handle plus its delivery channel.
///
/// Delivery is at-least-once and unordered; events may be duplicated or
/// silently dropped during reconnect windows.
pub struct Subscription {
    pub id: SubscriptionId,
    pub events: mpsc::UnboundedReceiver<ConversationEvent>,
}

/// Publish/subscribe access to conversation topics.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn subscribe(&self, topic: &Topic) -> Result<Subscription, BusError>;
    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BusError>;
    async fn publish(&self, topic: &Topic, event: ConversationEvent) -> Result<(), BusError>;
}

#[derive(Default)]
struct MemoryBusState {
    subscribers: HashMap<String, Vec<(SubscriptionId, mpsc::UnboundedSender<ConversationEvent>)>>,
    topics: HashMap<SubscriptionId, String>,
}

/// In-process bus for single-process hosts and tests: every subscriber of a
/// topic receives every published event.
#[derive(Default, Clone)]
pub struct MemoryBus {
    state: Arc<Mutex<MemoryBusState>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryBusState>, BusError> {
        self.state
            .lock()
            .map_err(|_| BusError::Subscription("lock poisoned".into()))
    }

    /// Number of live subscriptions across all topics.
    pub fn subscriber_count(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.topics.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn subscribe(&self, topic: &Topic) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = SubscriptionId(Uuid::new_v4());

        let mut state = self.lock()?;
        state
            .subscribers
            .entry(topic.0.clone())
            .or_default()
            .push((id, tx));
        state.topics.insert(id, topic.0.clone());

        Ok(Subscription { id, events: rx })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BusError> {
        let mut state = self.lock()?;
        if let Some(topic) = state.topics.remove(&id) {
            if let Some(subs) = state.subscribers.get_mut(&topic) {
                subs.retain(|(sub_id, _)| *sub_id != id);
            }
        }
        Ok(())
    }

    async fn publish(&self, topic: &Topic, event: ConversationEvent) -> Result<(), BusError> {
        let mut state = self.lock()?;
        let mut dead = Vec::new();
        if let Some(subs) = state.subscribers.get_mut(&topic.0) {
            // Drop subscribers whose receivers are gone.
            subs.retain(|(id, tx)| {
                let alive = tx.send(event.clone()).is_ok();
                if !alive {
                    dead.push(*id);
                }
                alive
            });
        }
        for id in dead {
            state.topics.remove(&id);
        }
        Ok(())
    }
}

struct PoolState {
    connection: Option<Arc<dyn EventBus>>,
    refs: usize,
}

/// Reference-counted checkout of one shared bus connection.
///
/// Subscribing checks the connection out; closing the returned subscription
/// checks it back in. The connection is torn down when the count hits zero.
pub struct BusPool {
    connector: Box<dyn Fn() -> Arc<dyn EventBus> + Send + Sync>,
    state: Mutex<PoolState>,
}

impl BusPool {
    pub fn new<F>(connector: F) -> Arc<Self>
    where
        F: Fn() -> Arc<dyn EventBus> + Send + Sync + 'static,
    {
        Arc::new(Self {
            connector: Box::new(connector),
            state: Mutex::new(PoolState {
                connection: None,
                refs: 0,
            }),
        })
    }

    pub async fn subscribe(
        self: &Arc<Self>,
        topic: &Topic,
    ) -> Result<PooledSubscription, BusError> {
        let bus = self.checkout()?;
        match bus.subscribe(topic).await {
            Ok(subscription) => Ok(PooledSubscription {
                pool: Arc::clone(self),
                bus,
                id: subscription.id,
                events: subscription.events,
                released: false,
            }),
            Err(err) => {
                self.release();
                Err(err)
            }
        }
    }

    /// Live checkouts; zero means no connection is held.
    pub fn active_refs(&self) -> usize {
        self.state.lock().map(|state| state.refs).unwrap_or(0)
    }

    pub fn is_connected(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.connection.is_some())
            .unwrap_or(false)
    }

    fn checkout(&self) -> Result<Arc<dyn EventBus>, BusError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| BusError::Connection("pool lock poisoned".into()))?;
        let connection = match &state.connection {
            Some(connection) => Arc::clone(connection),
            None => {
                let connection = (self.connector)();
                state.connection = Some(Arc::clone(&connection));
                connection
            }
        };
        state.refs += 1;
        Ok(connection)
    }

    fn release(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.refs = state.refs.saturating_sub(1);
            if state.refs == 0 {
                state.connection = None;
            }
        }
    }
}

/// Subscription checked out of a `BusPool`.
pub struct PooledSubscription {
    pool: Arc<BusPool>,
    bus: Arc<dyn EventBus>,
    id: SubscriptionId,
    events: mpsc::UnboundedReceiver<ConversationEvent>,
    released: bool,
}

impl PooledSubscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// The underlying connection, for publishing on the same topic family.
    pub fn bus(&self) -> Arc<dyn EventBus> {
        Arc::clone(&self.bus)
    }

    pub async fn recv(&mut self) -> Option<ConversationEvent> {
        self.events.recv().await
    }

    /// Unsubscribe and return the connection slot to the pool.
    pub async fn close(mut self) {
        if let Err(err) = self.bus.unsubscribe(self.id).await {
            warn!(%err, "unsubscribe failed during close");
        }
        self.pool.release();
        self.released = true;
    }
}

impl Drop for PooledSubscription {
    fn drop(&mut self) {
        // close() is the orderly path; dropping still returns the pool slot
        // so a panicking conversation cannot pin the connection open.
        if !self.released {
            self.pool.release();
        }
    }
}
