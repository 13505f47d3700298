//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tandem_engine::{Entity, EventType, Record, Schema, Stamp};
use tandem_server::cache::{LocalCache, MemoryStorage};
use tandem_server::coordinator::{Clock, SyncCoordinator};
use tandem_server::error::{ErrorKind, RemoteError, RemoteResult};
use tandem_server::remote::{ChannelStatus, Filter, LiveChannel, RemoteStore};
use tokio::sync::mpsc;

/// How [`StubRemote::subscribe`] behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveMode {
    /// Open a channel that never confirms
    Stall,
    /// Open a channel and confirm it immediately
    Confirm,
    /// Refuse the subscription outright
    Reject,
}

/// In-memory remote store with scripted failures.
pub struct StubRemote {
    available: bool,
    schema: Arc<Schema>,
    tables: Mutex<HashMap<Entity, Vec<Record>>>,
    failure: Mutex<Option<RemoteError>>,
    live_mode: Mutex<LiveMode>,
    live: Mutex<Vec<mpsc::UnboundedSender<ChannelStatus>>>,
    list_calls: AtomicUsize,
    upsert_calls: AtomicUsize,
}

impl StubRemote {
    pub fn new() -> Self {
        Self::build(true)
    }

    /// A remote with no endpoint configured.
    pub fn unconfigured() -> Self {
        Self::build(false)
    }

    fn build(available: bool) -> Self {
        Self {
            available,
            schema: Arc::new(Schema::default()),
            tables: Mutex::new(HashMap::new()),
            failure: Mutex::new(None),
            live_mode: Mutex::new(LiveMode::Confirm),
            live: Mutex::new(Vec::new()),
            list_calls: AtomicUsize::new(0),
            upsert_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_live_mode(self, mode: LiveMode) -> Self {
        *self.live_mode.lock().unwrap() = mode;
        self
    }

    /// Store a row as if another client had written it.
    pub fn insert(&self, entity: Entity, row: Value) {
        let record = self.schema.parse(entity, row).unwrap();
        let mut tables = self.tables.lock().unwrap();
        let table = tables.entry(entity).or_default();
        table.retain(|r| r.id() != record.id());
        table.push(record);
    }

    pub fn clear(&self, entity: Entity) {
        self.tables.lock().unwrap().remove(&entity);
    }

    pub fn rows(&self, entity: Entity) -> Vec<Record> {
        self.tables
            .lock()
            .unwrap()
            .get(&entity)
            .cloned()
            .unwrap_or_default()
    }

    /// Make every following call fail with `kind` until [`heal`](Self::heal).
    pub fn fail_with(&self, kind: ErrorKind) {
        let err = RemoteError::new(kind, format!("scripted {kind} failure"));
        *self.failure.lock().unwrap() = Some(err);
    }

    pub fn heal(&self) {
        *self.failure.lock().unwrap() = None;
    }

    /// Push a change notification to every open live channel.
    pub fn push_live(&self, event_type: EventType) {
        self.send_live(ChannelStatus::Message(event_type));
    }

    pub fn break_live(&self) {
        self.send_live(ChannelStatus::Error(RemoteError::new(
            ErrorKind::Network,
            "channel error",
        )));
    }

    /// Drop the feeding side of every live channel.
    pub fn close_live(&self) {
        self.live.lock().unwrap().clear();
    }

    /// Whether every channel handed out has been closed by its reader.
    pub fn live_closed(&self) -> bool {
        self.live.lock().unwrap().iter().all(|tx| tx.is_closed())
    }

    pub fn live_opened(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    fn send_live(&self, status: ChannelStatus) {
        for tx in self.live.lock().unwrap().iter() {
            let _ = tx.send(status.clone());
        }
    }

    fn check(&self) -> RemoteResult<()> {
        match self.failure.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteStore for StubRemote {
    fn is_available(&self) -> bool {
        self.available
    }

    async fn list(&self, entity: Entity, filter: &Filter) -> RemoteResult<Vec<Record>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self
            .rows(entity)
            .into_iter()
            .filter(|r| filter.matches(r.row()))
            .collect())
    }

    async fn get_by_id(&self, entity: Entity, id: &str) -> RemoteResult<Option<Record>> {
        self.check()?;
        Ok(self.rows(entity).into_iter().find(|r| r.id() == id))
    }

    async fn upsert(&self, entity: Entity, record: &Record) -> RemoteResult<Record> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.insert(entity, record.to_json());
        Ok(record.clone())
    }

    async fn delete(&self, entity: Entity, id: &str) -> RemoteResult<bool> {
        self.check()?;
        let mut tables = self.tables.lock().unwrap();
        let table = tables.entry(entity).or_default();
        let before = table.len();
        table.retain(|r| r.id() != id);
        Ok(table.len() != before)
    }

    async fn subscribe(&self, _entity: Entity) -> RemoteResult<LiveChannel> {
        let mode = *self.live_mode.lock().unwrap();
        if mode == LiveMode::Reject {
            return Err(RemoteError::new(ErrorKind::Network, "subscribe refused"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if mode == LiveMode::Confirm {
            let _ = tx.send(ChannelStatus::Subscribed);
        }
        self.live.lock().unwrap().push(tx);
        Ok(LiveChannel::from_receiver(rx))
    }
}

/// A clock tests move by hand.
#[derive(Clone)]
pub struct ManualClock(Arc<AtomicI64>);

impl ManualClock {
    pub fn at(iso: &str) -> Self {
        Self(Arc::new(AtomicI64::new(stamp(iso).millis())))
    }

    pub fn now(&self) -> Stamp {
        Stamp::from_millis(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, iso: &str) {
        self.0.store(stamp(iso).millis(), Ordering::SeqCst);
    }

    pub fn as_clock(&self) -> Clock {
        let inner = self.0.clone();
        Arc::new(move || Stamp::from_millis(inner.load(Ordering::SeqCst)))
    }
}

pub fn stamp(iso: &str) -> Stamp {
    Stamp::parse(iso).unwrap()
}

pub fn cache_on(storage: MemoryStorage) -> Arc<LocalCache> {
    Arc::new(LocalCache::new(Arc::new(storage), Arc::new(Schema::default())))
}

pub fn coordinator(remote: Arc<StubRemote>, storage: MemoryStorage) -> Arc<SyncCoordinator> {
    Arc::new(SyncCoordinator::new(remote, cache_on(storage)))
}

pub fn coordinator_at(
    remote: Arc<StubRemote>,
    storage: MemoryStorage,
    clock: &ManualClock,
) -> Arc<SyncCoordinator> {
    Arc::new(SyncCoordinator::with_clock(remote, cache_on(storage), clock.as_clock()))
}

pub fn user(id: &str, email: &str, name: &str, updated_at: &str) -> Value {
    json!({"id": id, "email": email, "name": name, "updated_at": updated_at})
}
