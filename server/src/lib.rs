//! Tandem Server - remote-first record sync with a local fallback cache.
//!
//! Reads and writes go to the remote PostgreSQL store when it is configured
//! and reachable, and fall back to a durable local cache otherwise. Change
//! notifications follow the same pattern: a live channel when possible,
//! polling when not, and update markers between contexts sharing a cache.
//!
//! The decision rules (record identity, merge, reconciliation) live in
//! `tandem-engine`; this crate wires them to storage, network and time.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod notifier;
pub mod remote;
pub mod routes;
pub mod scheduler;
pub mod websocket;

use std::sync::Arc;

use axum::Router;
use chrono::{DateTime, Utc};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::coordinator::SyncCoordinator;
use crate::notifier::ChangeNotifier;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SyncCoordinator>,
    pub notifier: Arc<ChangeNotifier>,
    pub config: Arc<Config>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(
        coordinator: Arc<SyncCoordinator>,
        notifier: Arc<ChangeNotifier>,
        config: Config,
    ) -> Self {
        Self {
            coordinator,
            notifier,
            config: Arc::new(config),
            started_at: Utc::now(),
        }
    }
}

/// Build the HTTP application.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn shared_state_crosses_threads() {
        assert_send_sync::<AppState>();
        assert_send_sync::<ChangeNotifier>();
        assert_send_sync::<notifier::LocalBroadcast>();
        assert_send_sync::<cache::StorageSubscription>();
    }
}
