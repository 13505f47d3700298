//! PostgreSQL implementation of [`RemoteStore`].
//!
//! Tables are accessed generically through `to_jsonb`, so the adapter needs no
//! per-entity row mapping: whatever columns a table has end up in the record
//! row, and the entity schema decides whether the row is usable.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgListener, PgPoolOptions};
use sqlx::{PgPool, Row};
use tandem_engine::{Entity, EventType, Record, Schema};
use tokio::sync::mpsc;

use super::{ChannelStatus, Filter, LiveChannel, RemoteStore};
use crate::config::RemoteConfig;
use crate::error::{ErrorKind, RemoteError, RemoteResult};
use crate::scheduler::TaskHandle;

/// Remote store backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PgRemoteStore {
    pool: Option<PgPool>,
    schema: Arc<Schema>,
}

impl std::fmt::Debug for PgRemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgRemoteStore")
            .field("configured", &self.pool.is_some())
            .finish()
    }
}

impl PgRemoteStore {
    /// Build a store from optional settings.
    ///
    /// The pool connects lazily: nothing touches the network until the first
    /// query. Must be called inside a Tokio runtime when `config` is set.
    pub fn new(config: Option<&RemoteConfig>, schema: Arc<Schema>) -> RemoteResult<Self> {
        let pool = match config {
            Some(config) => {
                let options = PgConnectOptions::from_str(&config.url)
                    .map_err(|e| RemoteError::new(ErrorKind::Unknown, e.to_string()))?
                    .password(&config.credential);
                Some(
                    PgPoolOptions::new()
                        .max_connections(10)
                        .acquire_timeout(Duration::from_secs(5))
                        .connect_lazy_with(options),
                )
            }
            None => None,
        };
        Ok(Self { pool, schema })
    }

    /// A store with no endpoint. Every call fails with a network error.
    pub fn unconfigured(schema: Arc<Schema>) -> Self {
        Self { pool: None, schema }
    }

    fn pool(&self) -> RemoteResult<&PgPool> {
        self.pool.as_ref().ok_or_else(RemoteError::not_configured)
    }

    /// Lift query results into records, skipping rows the schema rejects.
    fn records(&self, entity: Entity, rows: Vec<serde_json::Value>) -> Vec<Record> {
        rows.into_iter()
            .filter_map(|row| match self.schema.parse(entity, row) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(entity = %entity, error = %e, "Skipping malformed remote row");
                    None
                }
            })
            .collect()
    }
}

/// Quote a table or column name. Only plain lower-case identifiers pass.
fn quote_ident(name: &str) -> Option<String> {
    let plain = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    plain.then(|| format!("\"{name}\""))
}

fn table(entity: Entity) -> String {
    format!("\"{}\"", entity.as_str())
}

fn list_sql(entity: Entity) -> String {
    format!(
        "SELECT to_jsonb(t) AS row FROM {} t WHERE to_jsonb(t) @> $1",
        table(entity)
    )
}

fn get_sql(entity: Entity) -> String {
    format!(
        "SELECT to_jsonb(t) AS row FROM {} t WHERE t.\"id\"::text = $1",
        table(entity)
    )
}

fn delete_sql(entity: Entity) -> String {
    format!("DELETE FROM {} WHERE \"id\"::text = $1", table(entity))
}

/// Upsert statement for the given row columns.
///
/// Columns that are not plain identifiers are dropped. `id` is always present.
fn upsert_sql<'a>(entity: Entity, columns: impl IntoIterator<Item = &'a String>) -> String {
    let mut quoted = vec!["\"id\"".to_string()];
    for column in columns {
        if column == "id" {
            continue;
        }
        match quote_ident(column) {
            Some(q) => quoted.push(q),
            None => {
                tracing::warn!(entity = %entity, column = %column, "Dropping unsupported column")
            }
        }
    }

    let assignments = if quoted.len() > 1 {
        quoted[1..]
            .iter()
            .map(|c| format!("{c} = EXCLUDED.{c}"))
            .collect::<Vec<_>>()
            .join(", ")
    } else {
        // Keeps RETURNING working when only the key was sent.
        "\"id\" = EXCLUDED.\"id\"".to_string()
    };

    let list = quoted.join(", ");
    format!(
        "INSERT INTO {table} AS t ({list}) \
         SELECT {list} FROM jsonb_populate_record(NULL::{table}, $1) \
         ON CONFLICT (\"id\") DO UPDATE SET {assignments} \
         RETURNING to_jsonb(t) AS row",
        table = table(entity),
    )
}

fn notify_channel(entity: Entity) -> String {
    format!("{}_changes", entity.as_str())
}

#[async_trait]
impl RemoteStore for PgRemoteStore {
    fn is_available(&self) -> bool {
        self.pool.is_some()
    }

    async fn list(&self, entity: Entity, filter: &Filter) -> RemoteResult<Vec<Record>> {
        let rows = sqlx::query(&list_sql(entity))
            .bind(filter.to_json())
            .fetch_all(self.pool()?)
            .await?;

        let values = rows
            .iter()
            .map(|row| row.try_get::<serde_json::Value, _>("row"))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(self.records(entity, values))
    }

    async fn get_by_id(&self, entity: Entity, id: &str) -> RemoteResult<Option<Record>> {
        let row = sqlx::query(&get_sql(entity))
            .bind(id)
            .fetch_optional(self.pool()?)
            .await?;

        match row {
            Some(row) => {
                let value: serde_json::Value = row.try_get("row")?;
                Ok(self.records(entity, vec![value]).into_iter().next())
            }
            None => Ok(None),
        }
    }

    async fn upsert(&self, entity: Entity, record: &Record) -> RemoteResult<Record> {
        let row = sqlx::query(&upsert_sql(entity, record.row().keys()))
            .bind(record.to_json())
            .fetch_one(self.pool()?)
            .await?;

        let value: serde_json::Value = row.try_get("row")?;
        self.schema.parse(entity, value).map_err(|e| {
            RemoteError::new(ErrorKind::Unknown, format!("stored row rejected: {e}"))
        })
    }

    async fn delete(&self, entity: Entity, id: &str) -> RemoteResult<bool> {
        let result = sqlx::query(&delete_sql(entity))
            .bind(id)
            .execute(self.pool()?)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn subscribe(&self, entity: Entity) -> RemoteResult<LiveChannel> {
        let pool = self.pool()?.clone();
        let channel = notify_channel(entity);
        let (tx, rx) = mpsc::unbounded_channel();

        let feeder = TaskHandle::spawn(async move {
            let mut listener = match PgListener::connect_with(&pool).await {
                Ok(listener) => listener,
                Err(e) => {
                    let _ = tx.send(ChannelStatus::Error(e.into()));
                    return;
                }
            };

            if let Err(e) = listener.listen(&channel).await {
                let _ = tx.send(ChannelStatus::Error(e.into()));
                return;
            }

            tracing::debug!(channel = %channel, "Listening for remote changes");
            if tx.send(ChannelStatus::Subscribed).is_err() {
                return;
            }

            loop {
                match listener.try_recv().await {
                    Ok(Some(notification)) => {
                        let event_type = EventType::from_payload(notification.payload());
                        if tx.send(ChannelStatus::Message(event_type)).is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        let _ = tx.send(ChannelStatus::Closed);
                        return;
                    }
                    Err(e) => {
                        let _ = tx.send(ChannelStatus::Error(e.into()));
                        return;
                    }
                }
            }
        });

        Ok(LiveChannel::new(rx, feeder))
    }
}
