//! Publish/subscribe transport for RBAC events
//!
//! [`EventBus`] is the seam between engines: an admin's [`crate::BusPublisher`]
//! publishes on it, and every other instance's [`crate::InvalidationHandler`]
//! listens on it. [`MemoryEventBus`] connects engines living in one process;
//! a networked backend would implement the same trait.
//!
//! Topics are dot-separated (`rbac.role_changed`). Patterns may use `*` for
//! exactly one segment and `#` for any number of segments, including none.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use crate::types::Event;

/// Event bus error types.
#[derive(Debug, Error)]
pub enum EventBusError {
    /// The subscription request was malformed
    #[error("Failed to subscribe: {0}")]
    SubscribeError(String),

    /// An event payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A handler could not apply an event
    #[error("Handler error: {0}")]
    HandlerError(String),

    /// The bus dropped the channel behind a subscription
    #[error("Channel closed")]
    ChannelClosed,
}

impl From<serde_json::Error> for EventBusError {
    fn from(err: serde_json::Error) -> Self {
        EventBusError::SerializationError(err.to_string())
    }
}

/// Result type for event bus operations.
pub type EventBusResult<T> = Result<T, EventBusError>;

/// A live subscription to one topic pattern.
pub struct Subscription {
    /// Id to pass to [`EventBus::unsubscribe`]
    pub id: String,
    /// Pattern this subscription was opened with
    pub topic: String,
    receiver: broadcast::Receiver<Event>,
}

impl Subscription {
    /// Wait for the next matching event.
    ///
    /// A slow subscriber that falls more than the channel capacity behind
    /// loses the oldest events; those are logged and skipped rather than
    /// surfaced as an error.
    pub async fn recv(&mut self) -> EventBusResult<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Ok(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(subscription = %self.id, skipped, "subscription lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(EventBusError::ChannelClosed),
            }
        }
    }
}

/// Consumer of events pushed by the bus.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process one event. Errors are logged by the bus, never retried.
    async fn handle(&self, event: Event) -> EventBusResult<()>;

    /// Patterns this handler wants; an event is delivered once even if
    /// several patterns match it.
    fn topics(&self) -> Vec<String>;
}

/// Transport for RBAC events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Deliver `event` to every matching subscription and handler.
    async fn publish(&self, event: Event) -> EventBusResult<()>;

    /// Open a subscription on a topic pattern, e.g. `rbac.*` or `#`.
    async fn subscribe(&self, topic: &str) -> EventBusResult<Subscription>;

    /// Register a handler for the patterns it reports.
    async fn register_handler(&self, handler: Arc<dyn EventHandler>) -> EventBusResult<()>;

    /// Close a subscription. Unknown ids are ignored.
    async fn unsubscribe(&self, subscription_id: &str) -> EventBusResult<()>;

    /// Delivery counters.
    async fn stats(&self) -> EventBusStats;
}

/// Event bus statistics.
#[derive(Debug, Clone, Default)]
pub struct EventBusStats {
    /// Events accepted by `publish`
    pub events_published: u64,
    /// Deliveries to subscriptions and handlers
    pub events_delivered: u64,
    /// Open subscriptions
    pub active_subscriptions: usize,
    /// Registered handlers
    pub registered_handlers: usize,
}

/// Broadcast channels keyed by pattern, plus which subscription uses which.
#[derive(Default)]
struct Channels {
    by_pattern: HashMap<String, broadcast::Sender<Event>>,
    subscriptions: HashMap<String, String>,
}

/// Process-local [`EventBus`].
///
/// Handlers run on spawned tasks, so `publish` needs a Tokio runtime.
pub struct MemoryEventBus {
    channels: RwLock<Channels>,
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    published: AtomicU64,
    delivered: AtomicU64,
    capacity: usize,
}

impl std::fmt::Debug for MemoryEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEventBus")
            .field("capacity", &self.capacity)
            .field("published", &self.published.load(Ordering::Relaxed))
            .finish()
    }
}

impl MemoryEventBus {
    /// Bus with room for 1024 undelivered events per subscription.
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Bus with a custom per-subscription buffer.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(Channels::default()),
            handlers: RwLock::new(Vec::new()),
            published: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    pub(crate) fn topic_matches(pattern: &str, topic: &str) -> bool {
        let pattern: Vec<&str> = pattern.split('.').collect();
        let topic: Vec<&str> = topic.split('.').collect();
        Self::segments_match(&pattern, &topic)
    }

    fn segments_match(pattern: &[&str], topic: &[&str]) -> bool {
        match pattern.split_first() {
            None => topic.is_empty(),
            Some((&"#", rest)) => {
                (0..=topic.len()).any(|skip| Self::segments_match(rest, &topic[skip..]))
            }
            Some((&"*", rest)) => !topic.is_empty() && Self::segments_match(rest, &topic[1..]),
            Some((segment, rest)) => {
                topic.first() == Some(segment) && Self::segments_match(rest, &topic[1..])
            }
        }
    }

    async fn notify_subscribers(&self, topic: &str, event: &Event) -> u64 {
        let channels = self.channels.read().await;
        channels
            .by_pattern
            .iter()
            .filter(|(pattern, _)| Self::topic_matches(pattern, topic))
            .filter(|(_, sender)| sender.send(event.clone()).is_ok())
            .count() as u64
    }

    async fn spawn_handlers(&self, topic: &str, event: &Event) -> u64 {
        let handlers = self.handlers.read().await;
        let mut spawned = 0;
        for handler in handlers.iter() {
            if !handler.topics().iter().any(|p| Self::topic_matches(p, topic)) {
                continue;
            }

            let handler = handler.clone();
            let event = event.clone();
            tokio::task::spawn(async move {
                let event_id = event.id;
                if let Err(e) = handler.handle(event).await {
                    warn!(%event_id, error = %e, "event handler failed");
                }
            });
            spawned += 1;
        }
        spawned
    }
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, event: Event) -> EventBusResult<()> {
        let topic = event.topic();
        let delivered = self.notify_subscribers(&topic, &event).await
            + self.spawn_handlers(&topic, &event).await;

        self.published.fetch_add(1, Ordering::Relaxed);
        self.delivered.fetch_add(delivered, Ordering::Relaxed);
        debug!(%topic, event_id = %event.id, delivered, "event published");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> EventBusResult<Subscription> {
        if topic.is_empty() {
            return Err(EventBusError::SubscribeError("empty topic pattern".to_string()));
        }

        let id = uuid::Uuid::now_v7().to_string();
        let mut channels = self.channels.write().await;
        let receiver = match channels.by_pattern.get(topic) {
            Some(sender) => sender.subscribe(),
            None => {
                let (sender, receiver) = broadcast::channel(self.capacity);
                channels.by_pattern.insert(topic.to_string(), sender);
                receiver
            }
        };
        channels.subscriptions.insert(id.clone(), topic.to_string());

        Ok(Subscription {
            id,
            topic: topic.to_string(),
            receiver,
        })
    }

    async fn register_handler(&self, handler: Arc<dyn EventHandler>) -> EventBusResult<()> {
        self.handlers.write().await.push(handler);
        Ok(())
    }

    async fn unsubscribe(&self, subscription_id: &str) -> EventBusResult<()> {
        let mut channels = self.channels.write().await;
        let Some(topic) = channels.subscriptions.remove(subscription_id) else {
            return Ok(());
        };

        // Drop the channel once nobody listens on it.
        if channels
            .by_pattern
            .get(&topic)
            .is_some_and(|sender| sender.receiver_count() == 0)
        {
            channels.by_pattern.remove(&topic);
        }
        Ok(())
    }

    async fn stats(&self) -> EventBusStats {
        EventBusStats {
            events_published: self.published.load(Ordering::Relaxed),
            events_delivered: self.delivered.load(Ordering::Relaxed),
            active_subscriptions: self.channels.read().await.subscriptions.len(),
            registered_handlers: self.handlers.read().await.len(),
        }
    }
}
