//! Entity read/write endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tandem_engine::{CacheEntry, Entity};

use crate::coordinator::ReadSource;
use crate::error::{AppError, Result};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct CollectionResponse {
    pub source: ReadSource,
    pub records: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct RecordResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<ReadSource>,
    pub record: serde_json::Value,
}

/// Create entity routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/entities/{entity}", get(list_handler).put(write_handler))
        .route(
            "/entities/{entity}/{id}",
            get(read_handler).delete(delete_handler),
        )
}

fn parse_entity(raw: &str) -> Result<Entity> {
    raw.parse()
        .map_err(|_| AppError::NotFound(format!("unknown entity: {raw}")))
}

/// GET /entities/{entity}
async fn list_handler(
    State(state): State<AppState>,
    Path(entity): Path<String>,
) -> Result<Json<CollectionResponse>> {
    let entity = parse_entity(&entity)?;
    let fetched = state.coordinator.read_collection(entity).await?;

    Ok(Json(CollectionResponse {
        source: fetched.source,
        records: fetched.data.iter().map(CacheEntry::to_json).collect(),
    }))
}

/// GET /entities/{entity}/{id}
async fn read_handler(
    State(state): State<AppState>,
    Path((entity, id)): Path<(String, String)>,
) -> Result<Json<RecordResponse>> {
    let entity = parse_entity(&entity)?;
    let fetched = state.coordinator.read_one(entity, &id).await?;

    match fetched.data {
        Some(entry) => Ok(Json(RecordResponse {
            source: Some(fetched.source),
            record: entry.to_json(),
        })),
        None => Err(AppError::NotFound(format!("{entity} {id}"))),
    }
}

/// PUT /entities/{entity}
async fn write_handler(
    State(state): State<AppState>,
    Path(entity): Path<String>,
    Json(row): Json<serde_json::Value>,
) -> Result<Json<RecordResponse>> {
    let entity = parse_entity(&entity)?;
    if !row.is_object() {
        return Err(AppError::BadRequest("record must be a JSON object".to_string()));
    }

    let entry = state.coordinator.write(entity, row).await?;
    Ok(Json(RecordResponse {
        source: None,
        record: entry.to_json(),
    }))
}

/// DELETE /entities/{entity}/{id}
async fn delete_handler(
    State(state): State<AppState>,
    Path((entity, id)): Path<(String, String)>,
) -> Result<StatusCode> {
    let entity = parse_entity(&entity)?;
    if state.coordinator.delete(entity, &id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("{entity} {id}")))
    }
}
