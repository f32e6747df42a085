//! Bridges between the RBAC engine and the event bus.
//!
//! - [`BusPublisher`] listens to an [`RbacAdmin`](blog_rbac::RbacAdmin) and
//!   forwards every committed mutation to the bus.
//! - [`InvalidationHandler`] receives those events in another engine and
//!   drops the affected cache entries there.
//!
//! Each engine instance has an origin id; a handler ignores events its own
//! instance published, since those were applied before publication.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use blog_rbac::{Mutation, MutationListener, RbacEngine, UserId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, EventBusError, EventBusResult, EventHandler};
use crate::types::{Event, RbacEvent, RBAC_TOPIC_PREFIX};

/// Applies RBAC events from other instances to a local engine.
pub struct InvalidationHandler {
    engine: Arc<RbacEngine>,
    origin: String,
}

impl InvalidationHandler {
    /// Create a handler for `engine`, ignoring events published by `origin`.
    pub fn new(engine: Arc<RbacEngine>, origin: impl Into<String>) -> Self {
        Self {
            engine,
            origin: origin.into(),
        }
    }

    /// Apply one RBAC event. Returns the users whose entries were dropped.
    ///
    /// The announced users are dropped first, so a failed graph reload
    /// still leaves no stale entry behind for them.
    pub fn apply(&self, event: &RbacEvent) -> EventBusResult<BTreeSet<UserId>> {
        let mut users: BTreeSet<UserId> = event.affected_users.iter().copied().collect();
        self.engine.invalidate_users(&users);

        let local = self
            .engine
            .apply(&event.mutation)
            .map_err(|e| EventBusError::HandlerError(e.to_string()))?;
        users.extend(local);
        Ok(users)
    }
}

#[async_trait]
impl EventHandler for InvalidationHandler {
    async fn handle(&self, event: Event) -> EventBusResult<()> {
        if event.source == self.origin {
            return Ok(());
        }

        let payload = RbacEvent::from_event(&event)?;
        let users = self.apply(&payload)?;
        debug!(
            event_id = %event.id,
            source = %event.source,
            mutation = payload.mutation.kind(),
            invalidated = users.len(),
            "applied remote rbac event"
        );
        Ok(())
    }

    fn topics(&self) -> Vec<String> {
        vec![format!("{RBAC_TOPIC_PREFIX}.*")]
    }
}

/// Forwards committed mutations to an event bus.
///
/// Mutations arrive on the synchronous write path, so they are queued on an
/// unbounded channel and published by a background task.
pub struct BusPublisher {
    origin: String,
    sender: mpsc::UnboundedSender<Event>,
}

impl BusPublisher {
    /// Start a publisher for `bus`. Must be called inside a Tokio runtime.
    ///
    /// The background task ends once the publisher is dropped and the queue
    /// has drained.
    pub fn spawn(bus: Arc<dyn EventBus>, origin: impl Into<String>) -> (Arc<Self>, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Event>();
        let origin = origin.into();

        let task = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                let event_id = event.id;
                if let Err(e) = bus.publish(event).await {
                    warn!(%event_id, error = %e, "failed to publish rbac event");
                }
            }
        });

        info!(%origin, "rbac event publisher started");
        (Arc::new(Self { origin, sender }), task)
    }

    /// Origin id stamped on published events.
    pub fn origin(&self) -> &str {
        &self.origin
    }
}

impl MutationListener for BusPublisher {
    fn on_mutation(&self, mutation: &Mutation, affected: &BTreeSet<UserId>) {
        let event = match RbacEvent::new(*mutation, affected).to_event(self.origin.as_str()) {
            Ok(event) => event,
            Err(e) => {
                warn!(mutation = mutation.kind(), error = %e, "failed to encode rbac event");
                return;
            }
        };
        if self.sender.send(event).is_err() {
            warn!(mutation = mutation.kind(), "rbac event publisher stopped, event dropped");
        }
    }
}
