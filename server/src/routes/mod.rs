//! HTTP route definitions.

mod entities;
mod health;
mod watch;

use crate::AppState;
use axum::Router;

/// Create all application routes.
pub fn create_routes() -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(entities::routes())
        .merge(watch::routes())
}
