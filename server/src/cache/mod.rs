//! Durable local cache.
//!
//! A [`LocalCache`] is one execution context's view of a shared storage area.
//! Entries live under the key namespace of [`tandem_engine::keys`]: a
//! collection array per entity plus individually-keyed overrides. Reads fold
//! both through the conflict resolver so callers always see one entry per
//! natural key.
//!
//! Local writes (`put`, `put_override`, `delete`) announce themselves through
//! the entity's update marker. Read-through write-backs (`mirror`,
//! `store_collection`, `forget`) do not, so two contexts reading the same
//! remote data never wake each other up.

pub mod file;
pub mod storage;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use tandem_engine::{
    keys, CacheEntry, Candidate, ConflictResolver, Entity, NaturalKey, Schema, Stamp,
    UpdateMarker,
};

use crate::error::StorageError;
use storage::{lock, StorageBackend};

pub use file::FileStorage;
pub use storage::{MemoryStorage, StorageEvent, StorageListener, StorageSubscription};

pub type CacheResult<T> = std::result::Result<T, StorageError>;

pub struct LocalCache {
    storage: Arc<dyn StorageBackend>,
    schema: Arc<Schema>,
    /// Values that could not be persisted, served for this session only.
    session: Mutex<HashMap<String, String>>,
    /// Serializes read-modify-write of collection keys in this context.
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache")
            .field("unpersisted", &lock(&self.session).len())
            .finish()
    }
}

impl LocalCache {
    pub fn new(storage: Arc<dyn StorageBackend>, schema: Arc<Schema>) -> Self {
        Self {
            storage,
            schema,
            session: Mutex::new(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// The storage handle this context writes through.
    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Live entry whose `id` or natural key matches.
    pub fn get(&self, entity: Entity, id: &str) -> CacheResult<Option<CacheEntry>> {
        Ok(self
            .get_with_tombstones(entity, id)?
            .filter(CacheEntry::is_live))
    }

    /// Like [`get`](Self::get), but tombstones are returned too.
    pub fn get_with_tombstones(&self, entity: Entity, id: &str) -> CacheResult<Option<CacheEntry>> {
        let natural_key = NaturalKey::new(id);
        Ok(self
            .list_with_tombstones(entity)?
            .into_iter()
            .find(|entry| entry.record.id() == id || *entry.natural_key() == natural_key))
    }

    /// Every live entry of `entity`, one per natural key.
    pub fn list_all(&self, entity: Entity) -> CacheResult<Vec<CacheEntry>> {
        let mut entries = self.list_with_tombstones(entity)?;
        entries.retain(CacheEntry::is_live);
        Ok(entries)
    }

    /// Collection and overrides merged, tombstones included.
    pub fn list_with_tombstones(&self, entity: Entity) -> CacheResult<Vec<CacheEntry>> {
        let mut candidates: Vec<Candidate> = self
            .load_collection(entity)?
            .into_iter()
            .map(Candidate::from_collection)
            .collect();

        let prefix = keys::override_prefix(entity);
        for key in self.keys()? {
            if !key.starts_with(&prefix) {
                continue;
            }
            if let Some(entry) = self.load_entry(entity, &key)? {
                candidates.push(Candidate::from_override(entry));
            }
        }

        let outcome = ConflictResolver::merge(candidates);
        for conflict in &outcome.conflicts {
            tracing::debug!(
                entity = %entity,
                natural_key = %conflict.natural_key,
                winner = %conflict.winner_id,
                "Unorderable cache entries, kept deterministic winner"
            );
        }
        Ok(outcome.entries)
    }

    /// Upsert into the collection and announce the write.
    pub fn put(&self, entity: Entity, entry: CacheEntry) -> CacheResult<()> {
        let marker = marker_for(&entry);
        self.upsert(entity, entry)?;
        self.announce(entity, marker)
    }

    /// Write an individually-keyed override and announce the write.
    pub fn put_override(&self, entity: Entity, entry: CacheEntry) -> CacheResult<()> {
        let marker = marker_for(&entry);
        let key = keys::override_key(entity, entry.natural_key());
        self.persist(&key, &entry.to_json().to_string())?;
        self.announce(entity, marker)
    }

    /// Physically remove every copy of `natural_key` and announce it.
    ///
    /// Returns whether anything was removed.
    pub fn delete(&self, entity: Entity, natural_key: &NaturalKey) -> CacheResult<bool> {
        let removed = self.forget(entity, natural_key)?;
        if removed {
            self.announce(
                entity,
                UpdateMarker {
                    natural_key: natural_key.clone(),
                    updated_at: Stamp::now(),
                },
            )?;
        }
        Ok(removed)
    }

    /// Upsert a read-through copy without announcing it.
    pub fn mirror(&self, entity: Entity, entry: CacheEntry) -> CacheResult<()> {
        self.upsert(entity, entry)
    }

    /// Remove every copy of `natural_key` without announcing it.
    pub fn forget(&self, entity: Entity, natural_key: &NaturalKey) -> CacheResult<bool> {
        let _guard = lock(&self.write_lock);

        let mut entries = self.load_collection(entity)?;
        let before = entries.len();
        entries.retain(|e| e.natural_key() != natural_key);
        let mut removed = entries.len() != before;
        if removed {
            self.save_collection(entity, &entries)?;
        }

        let key = keys::override_key(entity, natural_key);
        if self.read(&key)?.is_some() {
            self.unpersist(&key)?;
            removed = true;
        }
        Ok(removed)
    }

    /// Replace the collection with `entries` and drop every override.
    ///
    /// Used after a successful remote read, when `entries` already is the
    /// merged view.
    pub fn store_collection(&self, entity: Entity, entries: &[CacheEntry]) -> CacheResult<()> {
        let _guard = lock(&self.write_lock);
        self.save_collection(entity, entries)?;

        let prefix = keys::override_prefix(entity);
        for key in self.keys()? {
            if key.starts_with(&prefix) {
                self.unpersist(&key)?;
            }
        }
        Ok(())
    }

    fn upsert(&self, entity: Entity, entry: CacheEntry) -> CacheResult<()> {
        let _guard = lock(&self.write_lock);

        let mut entries = self.load_collection(entity)?;
        let override_key = keys::override_key(entity, entry.natural_key());
        match entries
            .iter_mut()
            .find(|e| e.natural_key() == entry.natural_key())
        {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
        self.save_collection(entity, &entries)?;

        // The collection copy now supersedes any override for this key.
        if self.read(&override_key)?.is_some() {
            self.unpersist(&override_key)?;
        }
        Ok(())
    }

    fn announce(&self, entity: Entity, marker: UpdateMarker) -> CacheResult<()> {
        let value = serde_json::to_string(&marker)?;
        self.persist(&keys::marker_key(entity), &value)?;
        Ok(())
    }

    fn load_collection(&self, entity: Entity) -> CacheResult<Vec<CacheEntry>> {
        let key = keys::collection_key(entity);
        let Some(raw) = self.read(&key)? else {
            return Ok(Vec::new());
        };

        let items: Vec<serde_json::Value> = match serde_json::from_str(&raw) {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Ignoring malformed cache collection");
                return Ok(Vec::new());
            }
        };

        let schema = self.schema.entity(entity).map_err(invalid_schema)?;
        Ok(items
            .into_iter()
            .filter_map(|item| match CacheEntry::from_json(schema, item) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping malformed cache entry");
                    None
                }
            })
            .collect())
    }

    fn load_entry(&self, entity: Entity, key: &str) -> CacheResult<Option<CacheEntry>> {
        let Some(raw) = self.read(key)? else {
            return Ok(None);
        };
        let schema = self.schema.entity(entity).map_err(invalid_schema)?;

        let parsed = serde_json::from_str::<serde_json::Value>(&raw)
            .map_err(|e| e.to_string())
            .and_then(|value| CacheEntry::from_json(schema, value).map_err(|e| e.to_string()));
        match parsed {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Skipping malformed cache entry");
                Ok(None)
            }
        }
    }

    fn save_collection(&self, entity: Entity, entries: &[CacheEntry]) -> CacheResult<()> {
        let mut sorted: Vec<&CacheEntry> = entries.iter().collect();
        sorted.sort_by(|a, b| a.natural_key().cmp(b.natural_key()));
        let items: Vec<serde_json::Value> = sorted.into_iter().map(CacheEntry::to_json).collect();
        let value = serde_json::to_string(&items)?;
        self.persist(&keys::collection_key(entity), &value)?;
        Ok(())
    }

    fn read(&self, key: &str) -> CacheResult<Option<String>> {
        if let Some(pending) = lock(&self.session).get(key) {
            return Ok(Some(pending.clone()));
        }
        self.storage.get_item(key)
    }

    fn keys(&self) -> CacheResult<Vec<String>> {
        let mut keys: BTreeSet<String> = self.storage.keys()?.into_iter().collect();
        keys.extend(lock(&self.session).keys().cloned());
        Ok(keys.into_iter().collect())
    }

    /// Write through to storage. A full storage area keeps the value in the
    /// session overlay instead; returns whether it reached storage.
    fn persist(&self, key: &str, value: &str) -> CacheResult<bool> {
        match self.storage.set_item(key, value) {
            Ok(()) => {
                lock(&self.session).remove(key);
                Ok(true)
            }
            Err(StorageError::QuotaExceeded) => {
                tracing::warn!(
                    key = %key,
                    bytes = value.len(),
                    "Local storage full, keeping value for this session only"
                );
                lock(&self.session).insert(key.to_string(), value.to_string());
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn unpersist(&self, key: &str) -> CacheResult<()> {
        self.storage.remove_item(key)?;
        lock(&self.session).remove(key);
        Ok(())
    }
}

fn marker_for(entry: &CacheEntry) -> UpdateMarker {
    UpdateMarker {
        natural_key: entry.natural_key().clone(),
        updated_at: entry.record.updated_at().unwrap_or(entry.cached_at),
    }
}

fn invalid_schema(err: tandem_engine::Error) -> StorageError {
    StorageError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache_on(storage: MemoryStorage) -> LocalCache {
        LocalCache::new(Arc::new(storage), Arc::new(Schema::default()))
    }

    fn user(id: &str, email: &str, updated_at: &str, name: &str) -> tandem_engine::Record {
        Schema::default()
            .parse(
                Entity::Users,
                json!({"id": id, "email": email, "updated_at": updated_at, "name": name}),
            )
            .unwrap()
    }

    fn stamp(s: &str) -> Stamp {
        Stamp::parse(s).unwrap()
    }

    /// `a@x.com` as cached at its own update time.
    fn clean(name: &str, at: &str) -> CacheEntry {
        CacheEntry::clean(user("u-1", "a@x.com", at, name), stamp(at))
    }

    fn dirty(name: &str, at: &str) -> CacheEntry {
        CacheEntry::dirty(user("u-1", "a@x.com", at, name), stamp(at))
    }

    #[test]
    fn put_then_get_by_id_or_natural_key() {
        let cache = cache_on(MemoryStorage::new());
        let entry = CacheEntry::clean(
            user("u-1", "Ada@x.com", "2024-01-01", "Ada"),
            stamp("2024-01-02"),
        );
        cache.put(Entity::Users, entry.clone()).unwrap();

        assert_eq!(cache.get(Entity::Users, "u-1").unwrap(), Some(entry.clone()));
        assert_eq!(cache.get(Entity::Users, "ADA@x.com").unwrap(), Some(entry));
        assert_eq!(cache.get(Entity::Users, "nobody").unwrap(), None);
    }

    #[test]
    fn put_replaces_by_natural_key() {
        let cache = cache_on(MemoryStorage::new());
        cache.put(Entity::Users, clean("Old", "2024-01-01")).unwrap();
        cache.put(Entity::Users, dirty("New", "2024-02-01")).unwrap();

        let all = cache.list_all(Entity::Users).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].record.row()["name"], "New");
        assert!(all[0].dirty);
    }

    #[test]
    fn writes_announce_marker() {
        let storage = MemoryStorage::new();
        let cache = cache_on(storage.clone());
        cache.put(Entity::Users, clean("A", "2024-01-01T00:00:00Z")).unwrap();

        let raw = storage.get_item("update_marker_users").unwrap().unwrap();
        let marker: UpdateMarker = serde_json::from_str(&raw).unwrap();
        assert_eq!(marker.natural_key.as_str(), "a@x.com");
        assert_eq!(marker.updated_at, stamp("2024-01-01T00:00:00Z"));
    }

    #[test]
    fn mirror_and_store_collection_stay_silent() {
        let storage = MemoryStorage::new();
        let cache = cache_on(storage.clone());
        let entry = clean("A", "2024-01-01");

        cache.mirror(Entity::Users, entry.clone()).unwrap();
        cache.store_collection(Entity::Users, &[entry]).unwrap();

        assert_eq!(storage.get_item("update_marker_users").unwrap(), None);
        assert_eq!(cache.list_all(Entity::Users).unwrap().len(), 1);
    }

    #[test]
    fn newer_override_wins_over_collection() {
        let cache = cache_on(MemoryStorage::new());
        cache.put(Entity::Users, clean("Canon", "2024-01-01")).unwrap();
        cache.put_override(Entity::Users, dirty("Edited", "2024-03-01")).unwrap();

        let entry = cache.get(Entity::Users, "u-1").unwrap().unwrap();
        assert_eq!(entry.record.row()["name"], "Edited");
    }

    #[test]
    fn put_drops_superseded_override() {
        let storage = MemoryStorage::new();
        let cache = cache_on(storage.clone());
        cache.put_override(Entity::Users, dirty("Edited", "2024-03-01")).unwrap();
        cache.put(Entity::Users, clean("Synced", "2024-04-01")).unwrap();

        assert_eq!(storage.get_item("record_users_a@x.com").unwrap(), None);
        let entry = cache.get(Entity::Users, "u-1").unwrap().unwrap();
        assert_eq!(entry.record.row()["name"], "Synced");
    }

    #[test]
    fn store_collection_folds_overrides() {
        let storage = MemoryStorage::new();
        let cache = cache_on(storage.clone());
        cache.put_override(Entity::Users, dirty("Edited", "2024-03-01")).unwrap();

        let merged = cache.list_with_tombstones(Entity::Users).unwrap();
        cache.store_collection(Entity::Users, &merged).unwrap();

        assert!(storage
            .keys()
            .unwrap()
            .iter()
            .all(|k| !k.starts_with("record_users_")));
        assert_eq!(cache.list_all(Entity::Users).unwrap(), merged);
    }

    #[test]
    fn delete_removes_every_copy() {
        let cache = cache_on(MemoryStorage::new());
        let record = user("u-1", "a@x.com", "2024-01-01", "A");
        cache.put(Entity::Users, CacheEntry::clean(record.clone(), stamp("2024-01-01"))).unwrap();
        cache.put_override(Entity::Users, CacheEntry::clean(record, stamp("2024-01-01"))).unwrap();

        assert!(cache.delete(Entity::Users, &NaturalKey::new("a@x.com")).unwrap());
        assert!(cache.list_with_tombstones(Entity::Users).unwrap().is_empty());
        assert!(!cache.delete(Entity::Users, &NaturalKey::new("a@x.com")).unwrap());
    }

    #[test]
    fn tombstones_hidden_from_reads() {
        let cache = cache_on(MemoryStorage::new());
        let entry = clean("A", "2024-01-01");
        cache.put(Entity::Users, entry.clone().into_tombstone(stamp("2024-02-01"))).unwrap();

        assert_eq!(cache.get(Entity::Users, "u-1").unwrap(), None);
        assert!(cache.list_all(Entity::Users).unwrap().is_empty());
        assert!(cache.get_with_tombstones(Entity::Users, "u-1").unwrap().unwrap().deleted);
    }

    #[test]
    fn malformed_storage_is_skipped() {
        let storage = MemoryStorage::new();
        storage.set_item("users_collection", "not json").unwrap();
        storage.set_item("record_users_bad@x.com", "{\"email\": 3}").unwrap();
        storage
            .set_item(
                "record_users_ok@x.com",
                &json!({"id": "u-2", "email": "ok@x.com"}).to_string(),
            )
            .unwrap();

        let cache = cache_on(storage);
        let all = cache.list_all(Entity::Users).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].record.id(), "u-2");
    }

    #[test]
    fn full_storage_keeps_session_copy() {
        let storage = MemoryStorage::with_quota(64);
        let cache = cache_on(storage.clone());
        let entry = dirty("A long enough name", "2024-01-01");

        cache.put(Entity::Users, entry.clone()).unwrap();

        assert_eq!(storage.get_item("users_collection").unwrap(), None);
        assert_eq!(cache.get(Entity::Users, "u-1").unwrap(), Some(entry));
    }
}
