//! Change stream endpoint.

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};

use tandem_engine::Entity;

use crate::error::{AppError, Result};
use crate::websocket::handle_watch_connection;
use crate::AppState;

/// Create watch routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/watch/{entity}", get(watch_handler))
}

/// GET /watch/{entity} - upgrade to a change stream.
async fn watch_handler(
    State(state): State<AppState>,
    Path(entity): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    let entity: Entity = entity
        .parse()
        .map_err(|_| AppError::NotFound(format!("unknown entity: {entity}")))?;

    let notifier = state.notifier.clone();
    Ok(ws.on_upgrade(move |socket| async move {
        let subscription = notifier.subscribe(entity);
        handle_watch_connection(socket, subscription).await
    }))
}
