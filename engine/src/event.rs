//! Change events and update markers.
//!
//! Events are ephemeral signals that an entity's data may have changed. They
//! carry no record data; receivers re-read through the coordinator.

use crate::{Entity, NaturalKey, Stamp};
use serde::{Deserialize, Serialize};

/// Kind of change reported by a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    /// Unspecified change
    #[serde(rename = "*")]
    All,
}

impl EventType {
    /// Parse a change-notification payload.
    ///
    /// Accepts a bare event type (`UPDATE`) or an object carrying one
    /// (`{"eventType": "UPDATE"}`). Anything else is an unspecified change.
    pub fn from_payload(payload: &str) -> Self {
        let payload = payload.trim();
        if let Some(event_type) = Self::from_name(payload) {
            return event_type;
        }

        serde_json::from_str::<serde_json::Value>(payload)
            .ok()
            .and_then(|value| {
                value
                    .get("eventType")
                    .or_else(|| value.get("event_type"))
                    .and_then(|v| v.as_str())
                    .and_then(Self::from_name)
            })
            .unwrap_or(EventType::All)
    }

    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "INSERT" => Some(EventType::Insert),
            "UPDATE" => Some(EventType::Update),
            "DELETE" => Some(EventType::Delete),
            "*" => Some(EventType::All),
            _ => None,
        }
    }
}

/// Where a change event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventSource {
    /// Pushed over a live remote subscription
    RemoteLive,
    /// Detected by a polling read-through
    RemotePoll,
    /// Update marker written by another context
    LocalBroadcast,
}

/// A change notification for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub entity: Entity,
    pub event_type: EventType,
    pub occurred_at: Stamp,
    pub source: EventSource,
}

impl ChangeEvent {
    pub fn new(
        entity: Entity,
        event_type: EventType,
        source: EventSource,
        occurred_at: Stamp,
    ) -> Self {
        Self {
            entity,
            event_type,
            occurred_at,
            source,
        }
    }
}

/// Value stored under `update_marker_<entity>` after every local write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMarker {
    pub natural_key: NaturalKey,
    pub updated_at: Stamp,
}
