//! Subscription registry: topic to live subscription, at most one each.
//!
//! The registry never talks to the connection itself; the session sends
//! the `SUBSCRIBE`/`UNSUBSCRIBE` frames and rolls back entries whose frame
//! could not be queued. Deliveries are routed by wire subscription id, so a
//! frame arriving after its topic was released finds nothing and is dropped.

use std::collections::HashMap;
use std::sync::Arc;

use crmsync_proto::topic::{SubscriptionId, Topic};
use parking_lot::Mutex;

/// Delivery callback invoked with the raw JSON body of each message.
pub type Handler = Arc<dyn Fn(&str) + Send + Sync>;

/// Outcome of [`SubscriptionRegistry::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// The topic was already subscribed; the existing handler stays.
    Existing(SubscriptionId),
    /// A new entry was registered; the caller must send `SUBSCRIBE`.
    Created(SubscriptionId),
}

impl Acquired {
    /// The wire id of the subscription, new or existing.
    #[must_use]
    pub const fn id(self) -> SubscriptionId {
        match self {
            Self::Existing(id) | Self::Created(id) => id,
        }
    }

    /// Whether this call created the subscription.
    #[must_use]
    pub const fn is_new(self) -> bool {
        matches!(self, Self::Created(_))
    }
}

struct Entry {
    id: SubscriptionId,
    handler: Handler,
}

#[derive(Default)]
struct Inner {
    by_topic: HashMap<Topic, Entry>,
    by_id: HashMap<SubscriptionId, Topic>,
}

/// Thread-safe map of active subscriptions.
#[derive(Default)]
pub struct SubscriptionRegistry {
    inner: Mutex<Inner>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `topic` with `handler` unless it is already registered.
    pub fn acquire(&self, topic: Topic, handler: Handler) -> Acquired {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.by_topic.get(&topic) {
            return Acquired::Existing(entry.id);
        }
        let id = SubscriptionId::new();
        inner.by_id.insert(id, topic.clone());
        inner.by_topic.insert(topic, Entry { id, handler });
        Acquired::Created(id)
    }

    /// Remove `topic`, returning its wire id if it was registered.
    pub fn release(&self, topic: &Topic) -> Option<SubscriptionId> {
        let mut inner = self.inner.lock();
        let entry = inner.by_topic.remove(topic)?;
        inner.by_id.remove(&entry.id);
        Some(entry.id)
    }

    /// Route one message body to the handler registered under `id`.
    ///
    /// The handler runs outside the registry lock, so it may itself
    /// subscribe or unsubscribe. Returns `false` if `id` is unknown.
    pub fn deliver(&self, id: SubscriptionId, body: &str) -> bool {
        let handler = {
            let inner = self.inner.lock();
            inner
                .by_id
                .get(&id)
                .and_then(|topic| inner.by_topic.get(topic))
                .map(|entry| Arc::clone(&entry.handler))
        };
        match handler {
            Some(handler) => {
                handler(body);
                true
            }
            None => false,
        }
    }

    /// Drop every subscription. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let removed = inner.by_topic.len();
        inner.by_topic.clear();
        inner.by_id.clear();
        removed
    }

    /// Whether `topic` currently has a subscription.
    #[must_use]
    pub fn contains(&self, topic: &Topic) -> bool {
        self.inner.lock().by_topic.contains_key(topic)
    }

    /// Wire id of the subscription for `topic`.
    #[must_use]
    pub fn id_of(&self, topic: &Topic) -> Option<SubscriptionId> {
        self.inner.lock().by_topic.get(topic).map(|e| e.id)
    }

    /// Currently subscribed topics, in no particular order.
    #[must_use]
    pub fn topics(&self) -> Vec<Topic> {
        self.inner.lock().by_topic.keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().by_topic.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
