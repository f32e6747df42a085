//! # Blog Events
//!
//! Mutation events for the blog RBAC engine, so that every engine instance
//! drops stale cached permissions when another instance writes.
//!
//! ## Overview
//!
//! The blog-events crate handles:
//! - **Event Types**: an envelope plus a typed [`RbacEvent`] payload
//! - **Event Bus**: publish/subscribe messaging with topic wildcards
//! - **Publishing**: [`BusPublisher`] forwards committed mutations from an admin
//! - **Invalidation**: [`InvalidationHandler`] applies remote events to an engine
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use blog_events::{BusPublisher, EventBus, InvalidationHandler, MemoryEventBus};
//! use blog_rbac::{InMemoryRbacStore, RbacAdmin, RbacConfig, RbacEngine};
//!
//! async fn wire() {
//!     let bus = Arc::new(MemoryEventBus::new());
//!     let store = Arc::new(InMemoryRbacStore::new());
//!     let engine = Arc::new(RbacEngine::new(store.clone(), RbacConfig::default()).unwrap());
//!
//!     let origin = uuid::Uuid::now_v7().to_string();
//!
//!     // Local writes go out on the bus...
//!     let admin = RbacAdmin::new(store, engine.clone());
//!     let (publisher, _task) = BusPublisher::spawn(bus.clone(), origin.clone());
//!     admin.subscribe(publisher);
//!
//!     // ...and remote writes come back in.
//!     let handler = Arc::new(InvalidationHandler::new(engine, origin));
//!     bus.register_handler(handler).await.unwrap();
//! }
//! ```
//!
//! ## Topic Patterns
//!
//! Topics are structured as `rbac.{kind}`:
//! - `rbac.role_changed` - Specific event
//! - `rbac.*` - All RBAC events
//! - `#` - All events
//!
//! Wildcards:
//! - `*` matches exactly one segment
//! - `#` matches zero or more segments

pub mod bus;
pub mod handler;
pub mod types;

// Re-export main types
pub use bus::{
    EventBus, EventBusError, EventBusResult, EventBusStats, EventHandler, MemoryEventBus,
    Subscription,
};
pub use handler::{BusPublisher, InvalidationHandler};
pub use types::{Event, RbacEvent, RBAC_TOPIC_PREFIX};
