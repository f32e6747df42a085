//! Event types for RBAC mutation fan-out
//!
//! Every committed RBAC mutation is wrapped in an [`Event`] envelope and
//! published under `rbac.{kind}`, so that engines in other processes can
//! drop their stale cache entries.

use std::collections::BTreeSet;

use blog_rbac::{Mutation, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Topic namespace of RBAC events.
pub const RBAC_TOPIC_PREFIX: &str = "rbac";

/// Envelope around an RBAC event payload.
///
/// `source` names the publishing instance so that handlers can skip their
/// own events; `version` tracks the payload schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event ID
    pub id: Uuid,

    /// Mutation kind, e.g. `role_changed`
    pub event_type: String,

    /// Instance that published the event
    pub source: String,

    /// When the publisher committed the mutation
    pub timestamp: DateTime<Utc>,

    /// Payload schema version
    pub version: u32,

    /// Serialized [`RbacEvent`]
    pub payload: serde_json::Value,
}

impl Event {
    /// Create a new event.
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_type: event_type.into(),
            source: source.into(),
            timestamp: Utc::now(),
            version: 1,
            payload,
        }
    }

    /// Get the topic for this event: `rbac.{event_type}`.
    pub fn topic(&self) -> String {
        format!("{}.{}", RBAC_TOPIC_PREFIX, self.event_type)
    }

    /// Parse the payload into a specific type.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Payload of an RBAC event: the mutation plus the users the publisher found
/// affected before and after its write.
///
/// Receivers invalidate `affected_users` as given, since the records that
/// identified them (a deleted role, say) may no longer exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RbacEvent {
    /// What changed
    pub mutation: Mutation,

    /// Users whose effective permissions may have changed
    #[serde(default)]
    pub affected_users: Vec<UserId>,
}

impl RbacEvent {
    /// Create an event for `mutation`.
    pub fn new(mutation: Mutation, affected: &BTreeSet<UserId>) -> Self {
        Self {
            mutation,
            affected_users: affected.iter().copied().collect(),
        }
    }

    /// Event type string, e.g. `hierarchy_changed`.
    pub fn event_type(&self) -> &'static str {
        self.mutation.kind()
    }

    /// Wrap in an envelope published by `source`.
    pub fn to_event(&self, source: impl Into<String>) -> Result<Event, serde_json::Error> {
        let payload = serde_json::to_value(self)?;
        Ok(Event::new(self.event_type(), source, payload))
    }

    /// Read the payload of an RBAC envelope.
    pub fn from_event(event: &Event) -> Result<Self, serde_json::Error> {
        event.parse_payload()
    }
}
