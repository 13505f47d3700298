//! Remote store adapter.
//!
//! The [`RemoteStore`] trait is the only way the sync layer talks to the
//! remote relational store. Implementations are stateless apart from their
//! connection handle, and every failure they return is already classified.

mod postgres;

pub use postgres::PgRemoteStore;

use std::future::poll_fn;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tandem_engine::{Entity, EventType, Record};
use tokio::sync::mpsc;

use crate::cache::storage::lock;
use crate::error::{RemoteError, RemoteResult};
use crate::scheduler::TaskHandle;

/// Column equality conditions for [`RemoteStore::list`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Map<String, Value>,
}

impl Filter {
    /// Match every row.
    pub fn all() -> Self {
        Self::default()
    }

    /// Add a `column = value` condition.
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.insert(column.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn conditions(&self) -> &Map<String, Value> {
        &self.conditions
    }

    /// The conditions as one JSON object, suitable for containment checks.
    pub fn to_json(&self) -> Value {
        Value::Object(self.conditions.clone())
    }

    /// Whether `row` satisfies every condition.
    pub fn matches(&self, row: &Map<String, Value>) -> bool {
        self.conditions
            .iter()
            .all(|(column, expected)| row.get(column) == Some(expected))
    }
}

/// Status reported by a live change channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelStatus {
    /// The remote confirmed the subscription
    Subscribed,
    /// A change happened on the subscribed table
    Message(EventType),
    Error(RemoteError),
    Closed,
}

/// A live change feed for one entity.
///
/// Closing or dropping the channel cancels the task feeding it.
#[derive(Debug)]
pub struct LiveChannel {
    inner: Arc<ChannelInner>,
}

#[derive(Debug)]
struct ChannelInner {
    statuses: Mutex<mpsc::UnboundedReceiver<ChannelStatus>>,
    feeder: Mutex<Option<TaskHandle>>,
}

impl ChannelInner {
    fn close(&self) {
        if let Some(mut feeder) = lock(&self.feeder).take() {
            feeder.cancel();
        }
        lock(&self.statuses).close();
    }
}

/// Closes a [`LiveChannel`] from outside the task reading it.
#[derive(Debug, Clone)]
pub struct LiveCloser {
    inner: Arc<ChannelInner>,
}

impl LiveCloser {
    /// Same as [`LiveChannel::close`]. Idempotent.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl LiveChannel {
    /// A channel fed by a background task.
    pub fn new(statuses: mpsc::UnboundedReceiver<ChannelStatus>, feeder: TaskHandle) -> Self {
        Self::build(statuses, Some(feeder))
    }

    /// A channel fed by whoever holds the matching sender.
    pub fn from_receiver(statuses: mpsc::UnboundedReceiver<ChannelStatus>) -> Self {
        Self::build(statuses, None)
    }

    fn build(statuses: mpsc::UnboundedReceiver<ChannelStatus>, feeder: Option<TaskHandle>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                statuses: Mutex::new(statuses),
                feeder: Mutex::new(feeder),
            }),
        }
    }

    /// Wait for the next status. A channel whose feeder went away is closed.
    pub async fn next_status(&mut self) -> ChannelStatus {
        let inner = &self.inner;
        poll_fn(|cx| lock(&inner.statuses).poll_recv(cx))
            .await
            .unwrap_or(ChannelStatus::Closed)
    }

    pub fn closer(&self) -> LiveCloser {
        LiveCloser {
            inner: self.inner.clone(),
        }
    }

    /// Stop the feeder and refuse further statuses.
    pub fn close(&mut self) {
        self.inner.close();
    }
}

impl Drop for LiveChannel {
    fn drop(&mut self) {
        self.inner.close();
    }
}

/// Remote relational store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Whether an endpoint and credential are configured.
    ///
    /// Never touches the network.
    fn is_available(&self) -> bool;

    async fn list(&self, entity: Entity, filter: &Filter) -> RemoteResult<Vec<Record>>;

    async fn get_by_id(&self, entity: Entity, id: &str) -> RemoteResult<Option<Record>>;

    /// Insert or update by `id`, returning the stored row.
    async fn upsert(&self, entity: Entity, record: &Record) -> RemoteResult<Record>;

    /// Delete by `id`. Returns whether a row was removed.
    async fn delete(&self, entity: Entity, id: &str) -> RemoteResult<bool>;

    /// Open a live change channel for `entity`.
    async fn subscribe(&self, entity: Entity) -> RemoteResult<LiveChannel>;
}
