//! Registry of active change subscriptions.
//!
//! Tracks every live [`Subscription`](super::Subscription) so the server can
//! report how many watchers each entity has.

use dashmap::DashMap;
use tandem_engine::Entity;
use tokio::sync::watch;

use super::SubscriptionState;

/// A registered subscription.
#[derive(Debug)]
pub struct SubscriptionEntry {
    pub id: String,
    pub entity: Entity,
    state: watch::Receiver<SubscriptionState>,
}

impl SubscriptionEntry {
    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }
}

/// Thread-safe registry, shared across the notifier and its subscriptions.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscriptions: DashMap<String, SubscriptionEntry>,
    /// Index of subscription ids by entity.
    by_entity: DashMap<Entity, Vec<String>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription and return its id.
    pub fn register(&self, entity: Entity, state: watch::Receiver<SubscriptionState>) -> String {
        let id = uuid::Uuid::new_v4().to_string();

        self.subscriptions.insert(
            id.clone(),
            SubscriptionEntry {
                id: id.clone(),
                entity,
                state,
            },
        );
        self.by_entity.entry(entity).or_default().push(id.clone());

        tracing::debug!(subscription = %id, entity = %entity, "Subscription registered");
        id
    }

    pub fn unregister(&self, id: &str) {
        if let Some((_, entry)) = self.subscriptions.remove(id) {
            if let Some(mut ids) = self.by_entity.get_mut(&entry.entity) {
                ids.retain(|existing| existing != id);
                if ids.is_empty() {
                    drop(ids);
                    self.by_entity.remove(&entry.entity);
                }
            }

            tracing::debug!(
                subscription = %id,
                entity = %entry.entity,
                "Subscription unregistered"
            );
        }
    }

    pub fn count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn count_for(&self, entity: Entity) -> usize {
        self.by_entity.get(&entity).map_or(0, |ids| ids.len())
    }

    /// Current state of every registered subscription.
    pub fn states(&self) -> Vec<(String, Entity, SubscriptionState)> {
        let mut states: Vec<_> = self
            .subscriptions
            .iter()
            .map(|entry| (entry.id.clone(), entry.entity, entry.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}
