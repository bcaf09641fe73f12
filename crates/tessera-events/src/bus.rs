use std::sync::RwLock;

use tokio::sync::broadcast;
use tracing::debug;

use tessera_types::{DocKey, FieldId};

use crate::event::UpdateEvent;

/// Filter for subscribing to a subset of update events.
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    /// If set, only events for these documents are delivered.
    pub documents: Option<Vec<DocKey>>,
    /// If set, only events for these fields are delivered.
    pub fields: Option<Vec<FieldId>>,
    /// If `true`, document-level (composite) commits are skipped.
    pub fields_only: bool,
}

impl EventFilter {
    /// Events for a single document.
    pub fn document(doc_key: DocKey) -> Self {
        Self {
            documents: Some(vec![doc_key]),
            ..Self::default()
        }
    }

    /// Returns `true` if the given event matches this filter.
    pub fn matches(&self, event: &UpdateEvent) -> bool {
        if let Some(ref docs) = self.documents {
            if !docs.contains(&event.doc_key) {
                return false;
            }
        }
        match &event.field {
            None => !self.fields_only && self.fields.is_none(),
            Some(field) => self
                .fields
                .as_ref()
                .map_or(true, |fields| fields.contains(field)),
        }
    }
}

/// A broadcast channel receiver for update events.
pub type EventStream = broadcast::Receiver<UpdateEvent>;

struct Subscriber {
    filter: EventFilter,
    sender: broadcast::Sender<UpdateEvent>,
}

/// Fan-out bus that delivers update events to matching subscribers.
///
/// Publishing never blocks: each subscriber owns a bounded broadcast
/// channel, and a subscriber that falls behind observes a lag error on its
/// receiver instead of slowing writers down.
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
    capacity: usize,
}

impl EventBus {
    /// Create a bus whose per-subscriber channels hold `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Register a new subscriber with the given filter.
    pub fn subscribe(&self, filter: EventFilter) -> EventStream {
        let (tx, rx) = broadcast::channel(self.capacity);
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscriber { filter, sender: tx });
        rx
    }

    /// Route an event to all matching subscribers and return how many
    /// received it. Subscribers whose receivers are gone are pruned.
    pub fn publish(&self, event: UpdateEvent) -> usize {
        let mut delivered = 0;
        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        subs.retain(|sub| {
            if sub.filter.matches(&event) {
                let sent = sub.sender.send(event.clone()).is_ok();
                delivered += usize::from(sent);
                sent
            } else {
                sub.sender.receiver_count() > 0
            }
        });
        debug!(
            doc = %event.doc_key,
            cid = %event.cid.short_hex(),
            delivered,
            "update event published"
        );
        delivered
    }

    /// Current number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("capacity", &self.capacity)
            .finish()
    }
}
