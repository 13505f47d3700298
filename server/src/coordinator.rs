//! Read/write routing between the remote store and the local cache.
//!
//! # Reads
//!
//! 1. Remote not configured: serve the cache
//! 2. Remote read succeeds: fold it into the cache, serve the merged view
//! 3. Remote read fails with a recoverable kind: warn, serve the cache
//! 4. Auth failure: return it, never mask it with cached data
//!
//! # Writes and deletes
//!
//! The remote attempt always comes first. Success leaves a clean local copy
//! (or removes it); a recoverable failure keeps the change locally as dirty so
//! the user's edit survives until the next successful read.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tandem_engine::{
    reconcile_remote, reconcile_remote_one, CacheEntry, Entity, NaturalKey, Record, Stamp,
};

use crate::cache::LocalCache;
use crate::error::{ErrorKind, RemoteError, RemoteResult, SyncError};
use crate::remote::{Filter, RemoteStore};

/// Clock used to stamp cache entries and fresh records.
pub type Clock = Arc<dyn Fn() -> Stamp + Send + Sync>;

pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Which store answered a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadSource {
    Remote,
    Cache,
}

/// Data together with the store that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub source: ReadSource,
    pub data: T,
}

impl<T> Fetched<T> {
    fn remote(data: T) -> Self {
        Self {
            source: ReadSource::Remote,
            data,
        }
    }

    fn cache(data: T) -> Self {
        Self {
            source: ReadSource::Cache,
            data,
        }
    }
}

pub struct SyncCoordinator {
    remote: Arc<dyn RemoteStore>,
    cache: Arc<LocalCache>,
    clock: Clock,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("remote_available", &self.remote.is_available())
            .field("cache", &self.cache)
            .finish()
    }
}

impl SyncCoordinator {
    pub fn new(remote: Arc<dyn RemoteStore>, cache: Arc<LocalCache>) -> Self {
        Self::with_clock(remote, cache, Arc::new(Stamp::now))
    }

    pub fn with_clock(remote: Arc<dyn RemoteStore>, cache: Arc<LocalCache>, clock: Clock) -> Self {
        Self {
            remote,
            cache,
            clock,
        }
    }

    pub fn cache(&self) -> &Arc<LocalCache> {
        &self.cache
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    pub fn remote_available(&self) -> bool {
        self.remote.is_available()
    }

    /// Every live record of `entity`, one per natural key.
    pub async fn read_collection(&self, entity: Entity) -> SyncResult<Fetched<Vec<CacheEntry>>> {
        if !self.remote.is_available() {
            return Ok(Fetched::cache(self.cache.list_all(entity)?));
        }

        match self.remote.list(entity, &Filter::all()).await {
            Ok(rows) => {
                let local = self.cache.list_with_tombstones(entity)?;
                let outcome = reconcile_remote(rows, local, self.now());
                for conflict in &outcome.conflicts {
                    tracing::debug!(
                        entity = %entity,
                        natural_key = %conflict.natural_key,
                        winner = %conflict.winner_id,
                        "Remote returned duplicate natural keys"
                    );
                }
                self.cache.store_collection(entity, &outcome.entries)?;

                let live = outcome.entries.into_iter().filter(CacheEntry::is_live).collect();
                Ok(Fetched::remote(live))
            }
            Err(err) => {
                self.recover(entity, "read", err)?;
                Ok(Fetched::cache(self.cache.list_all(entity)?))
            }
        }
    }

    /// One live record by `id` or natural key.
    ///
    /// A key matching a cached entry is looked up remotely by that entry's
    /// `id`; an unknown key is tried as an `id`, then as a natural key.
    pub async fn read_one(
        &self,
        entity: Entity,
        id: &str,
    ) -> SyncResult<Fetched<Option<CacheEntry>>> {
        if !self.remote.is_available() {
            return Ok(Fetched::cache(self.cache.get(entity, id)?));
        }

        let natural_field = self.cache.schema().entity(entity)?.natural_key.clone();
        let local = self.cache.get_with_tombstones(entity, id)?;

        match self.fetch_one(entity, id, local.as_ref(), &natural_field).await {
            Ok(remote) => {
                let resolved = reconcile_remote_one(remote, local.clone(), self.now());

                match (&resolved, &local) {
                    (Some(entry), Some(kept)) if entry == kept => {}
                    (Some(entry), _) => self.cache.mirror(entity, entry.clone())?,
                    (None, Some(stale)) => {
                        self.cache.forget(entity, stale.natural_key())?;
                    }
                    (None, None) => {}
                }

                Ok(Fetched::remote(resolved.filter(CacheEntry::is_live)))
            }
            Err(err) => {
                self.recover(entity, "read", err)?;
                Ok(Fetched::cache(self.cache.get(entity, id)?))
            }
        }
    }

    async fn fetch_one(
        &self,
        entity: Entity,
        key: &str,
        local: Option<&CacheEntry>,
        natural_field: &str,
    ) -> RemoteResult<Option<Record>> {
        if let Some(entry) = local {
            return self.remote.get_by_id(entity, entry.record.id()).await;
        }
        if let Some(record) = self.remote.get_by_id(entity, key).await? {
            return Ok(Some(record));
        }
        if natural_field == "id" {
            return Ok(None);
        }

        let wanted = NaturalKey::new(key);
        let filter = Filter::all().eq(natural_field, key.trim());
        let rows = self.remote.list(entity, &filter).await?;
        Ok(reconcile_remote(rows, Vec::new(), self.now())
            .entries
            .into_iter()
            .find(|entry| *entry.natural_key() == wanted)
            .map(|entry| entry.record))
    }

    /// Validate and store a row. Returns the entry now held locally.
    ///
    /// A row without `id` gets a fresh UUID; a row without any timestamp is
    /// stamped with the current time.
    pub async fn write(&self, entity: Entity, row: Value) -> SyncResult<CacheEntry> {
        let record = self.prepare(entity, row)?;

        if self.remote.is_available() {
            match self.remote.upsert(entity, &record).await {
                Ok(stored) => {
                    let entry = CacheEntry::clean(stored, self.now());
                    self.cache.put(entity, entry.clone())?;
                    return Ok(entry);
                }
                Err(err) => self.recover(entity, "write", err)?,
            }
        }

        let entry = CacheEntry::dirty(record, self.now());
        self.cache.put(entity, entry.clone())?;
        Ok(entry)
    }

    /// Delete by `id` (or natural key). Returns whether anything was deleted.
    ///
    /// When the remote cannot confirm, the local copy becomes a tombstone so a
    /// stale read cannot bring it back. A later confirmed delete removes the
    /// tombstone.
    pub async fn delete(&self, entity: Entity, id: &str) -> SyncResult<bool> {
        let local = self.cache.get_with_tombstones(entity, id)?;
        let remote_id = local
            .as_ref()
            .map(|e| e.record.id().to_string())
            .unwrap_or_else(|| id.to_string());

        if self.remote.is_available() {
            match self.remote.delete(entity, &remote_id).await {
                Ok(removed_remotely) => {
                    let removed_locally = match &local {
                        Some(entry) => {
                            self.cache.delete(entity, entry.natural_key())? && entry.is_live()
                        }
                        None => false,
                    };
                    return Ok(removed_remotely || removed_locally);
                }
                Err(err) => self.recover(entity, "delete", err)?,
            }
        }

        match local {
            Some(entry) if entry.is_live() => {
                let now = self.now();
                self.cache.put(entity, entry.into_tombstone(now))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn prepare(&self, entity: Entity, mut row: Value) -> SyncResult<Record> {
        let schema = self.cache.schema().entity(entity)?;

        if let Value::Object(fields) = &mut row {
            let has_id = fields.get("id").is_some_and(|v| !v.is_null());
            if !has_id {
                fields.insert("id".to_string(), Value::String(uuid::Uuid::new_v4().to_string()));
            }
        }

        let mut record = schema.parse(row)?;
        if record.updated_at().is_none() {
            record.touch(self.now());
        }
        Ok(record)
    }

    /// Decide whether a remote failure may fall back to the cache.
    fn recover(&self, entity: Entity, operation: &'static str, err: RemoteError) -> SyncResult<()> {
        if err.kind.is_recoverable() {
            tracing::warn!(
                entity = %entity,
                operation,
                kind = %err.kind,
                error = %err.message,
                "Remote store failed, falling back to local cache"
            );
            Ok(())
        } else {
            if err.kind == ErrorKind::Auth {
                tracing::error!(
                    entity = %entity,
                    operation,
                    error = %err.message,
                    "Remote store rejected the session"
                );
            }
            Err(err.into())
        }
    }

    fn now(&self) -> Stamp {
        (self.clock)()
    }
}
