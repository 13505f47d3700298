//! Cross-context change broadcast.
//!
//! Every local write leaves an `update_marker_<entity>` behind. Contexts
//! sharing the storage area see that write as a storage event; this module
//! turns marker events into [`ChangeEvent`]s on a per-entity channel.

use std::sync::Arc;

use dashmap::DashMap;
use tandem_engine::{CacheKey, ChangeEvent, Entity, EventSource, EventType, UpdateMarker};
use tokio::sync::broadcast;

use crate::cache::storage::{StorageBackend, StorageEvent, StorageListener, StorageSubscription};

const CHANNEL_CAPACITY: usize = 64;

type Channels = DashMap<Entity, broadcast::Sender<ChangeEvent>>;

/// Marker listener attached to one context's storage handle.
pub struct LocalBroadcast {
    channels: Arc<Channels>,
    _subscription: StorageSubscription,
}

impl std::fmt::Debug for LocalBroadcast {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBroadcast")
            .field("entities", &self.channels.len())
            .finish()
    }
}

impl LocalBroadcast {
    /// Start listening on `storage`. Stops when the broadcast is dropped.
    pub fn attach(storage: &dyn StorageBackend) -> Self {
        let channels: Arc<Channels> = Arc::new(DashMap::new());
        let sink = channels.clone();

        let listener: StorageListener = Arc::new(move |event: &StorageEvent| {
            if let Some(change) = marker_event(event) {
                if let Some(sender) = sink.get(&change.entity) {
                    let receivers = sender.send(change.clone()).unwrap_or(0);
                    tracing::debug!(
                        entity = %change.entity,
                        receivers,
                        "Local broadcast received"
                    );
                }
            }
        });

        Self {
            channels,
            _subscription: storage.subscribe(listener),
        }
    }

    /// Receive local-broadcast events for `entity`.
    pub fn subscribe(&self, entity: Entity) -> broadcast::Receiver<ChangeEvent> {
        self.channels
            .entry(entity)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }
}

/// Parse a storage event into a change event, if it is a marker write.
fn marker_event(event: &StorageEvent) -> Option<ChangeEvent> {
    let Some(CacheKey::Marker(entity)) = CacheKey::parse(&event.key) else {
        return None;
    };
    let raw = event.new_value.as_deref()?;

    match serde_json::from_str::<UpdateMarker>(raw) {
        Ok(marker) => Some(ChangeEvent::new(
            entity,
            EventType::All,
            EventSource::LocalBroadcast,
            marker.updated_at,
        )),
        Err(e) => {
            tracing::warn!(key = %event.key, error = %e, "Ignoring malformed update marker");
            None
        }
    }
}
