//! Key/value storage areas behind the local cache.
//!
//! A storage area is shared by every context on the same machine. Each
//! context holds its own handle; a write through one handle is announced to
//! listeners registered through every other handle, never to the writer's.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::StorageError;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// A change made through another handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    /// `None` when the key was removed
    pub new_value: Option<String>,
}

pub type StorageListener = Arc<dyn Fn(&StorageEvent) + Send + Sync>;

/// Unregisters a listener when dropped.
pub struct StorageSubscription {
    cleanup: Option<Box<dyn FnOnce() + Send + Sync + 'static>>,
}

impl StorageSubscription {
    pub fn new<F>(cleanup: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            cleanup: Some(Box::new(cleanup)),
        }
    }

    pub fn noop() -> Self {
        Self { cleanup: None }
    }
}

impl Default for StorageSubscription {
    fn default() -> Self {
        Self::noop()
    }
}

impl Drop for StorageSubscription {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

impl std::fmt::Debug for StorageSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageSubscription")
            .field("active", &self.cleanup.is_some())
            .finish()
    }
}

/// Synchronous string key/value storage.
pub trait StorageBackend: Send + Sync {
    fn get_item(&self, key: &str) -> StorageResult<Option<String>>;

    fn set_item(&self, key: &str, value: &str) -> StorageResult<()>;

    fn remove_item(&self, key: &str) -> StorageResult<()>;

    fn keys(&self) -> StorageResult<Vec<String>>;

    /// Register for changes made through other handles on the same area.
    fn subscribe(&self, _listener: StorageListener) -> StorageSubscription {
        StorageSubscription::noop()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Listener registry shared by every handle on one area.
#[derive(Default)]
pub(crate) struct Listeners {
    next_id: AtomicUsize,
    entries: Mutex<Vec<(usize, usize, StorageListener)>>,
}

impl Listeners {
    /// Allocate an id for a new handle.
    pub(crate) fn next_handle(&self) -> usize {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn add(
        self: &Arc<Self>,
        handle: usize,
        listener: StorageListener,
    ) -> StorageSubscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.entries).push((id, handle, listener));

        let listeners = Arc::downgrade(self);
        StorageSubscription::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                lock(&listeners.entries).retain(|(listener_id, _, _)| *listener_id != id);
            }
        })
    }

    /// Deliver `event` to every listener not registered through `origin`.
    pub(crate) fn notify(&self, origin: usize, event: StorageEvent) {
        let targets: Vec<StorageListener> = lock(&self.entries)
            .iter()
            .filter(|(_, handle, _)| *handle != origin)
            .map(|(_, _, listener)| listener.clone())
            .collect();

        for listener in targets {
            listener(&event);
        }
    }
}

struct MemoryArea {
    items: Mutex<BTreeMap<String, String>>,
    quota: Option<usize>,
    listeners: Arc<Listeners>,
}

/// In-process storage area with an optional byte quota.
#[derive(Clone)]
pub struct MemoryStorage {
    area: Arc<MemoryArea>,
    handle: usize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// An area holding at most `bytes` of keys plus values.
    pub fn with_quota(bytes: usize) -> Self {
        Self::build(Some(bytes))
    }

    fn build(quota: Option<usize>) -> Self {
        let listeners = Arc::new(Listeners::default());
        let handle = listeners.next_handle();
        Self {
            area: Arc::new(MemoryArea {
                items: Mutex::new(BTreeMap::new()),
                quota,
                listeners,
            }),
            handle,
        }
    }

    /// Another handle on the same area, as a second context would hold.
    pub fn handle(&self) -> Self {
        Self {
            area: self.area.clone(),
            handle: self.area.listeners.next_handle(),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for MemoryStorage {
    fn get_item(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(lock(&self.area.items).get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> StorageResult<()> {
        {
            let mut items = lock(&self.area.items);
            if let Some(quota) = self.area.quota {
                let used: usize = items
                    .iter()
                    .filter(|(k, _)| k.as_str() != key)
                    .map(|(k, v)| k.len() + v.len())
                    .sum();
                if used + key.len() + value.len() > quota {
                    return Err(StorageError::QuotaExceeded);
                }
            }
            items.insert(key.to_string(), value.to_string());
        }

        self.area.listeners.notify(
            self.handle,
            StorageEvent {
                key: key.to_string(),
                new_value: Some(value.to_string()),
            },
        );
        Ok(())
    }

    fn remove_item(&self, key: &str) -> StorageResult<()> {
        let removed = lock(&self.area.items).remove(key).is_some();
        if removed {
            self.area.listeners.notify(
                self.handle,
                StorageEvent {
                    key: key.to_string(),
                    new_value: None,
                },
            );
        }
        Ok(())
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        Ok(lock(&self.area.items).keys().cloned().collect())
    }

    fn subscribe(&self, listener: StorageListener) -> StorageSubscription {
        self.area.listeners.add(self.handle, listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (StorageListener, Arc<Mutex<Vec<StorageEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener: StorageListener = Arc::new(move |event: &StorageEvent| {
            sink.lock().unwrap().push(event.clone());
        });
        (listener, seen)
    }

    #[test]
    fn set_get_remove() {
        let storage = MemoryStorage::new();
        storage.set_item("a", "1").unwrap();
        assert_eq!(storage.get_item("a").unwrap().as_deref(), Some("1"));
        assert_eq!(storage.keys().unwrap(), vec!["a".to_string()]);

        storage.remove_item("a").unwrap();
        assert_eq!(storage.get_item("a").unwrap(), None);
    }

    #[test]
    fn handles_share_data() {
        let first = MemoryStorage::new();
        let second = first.handle();
        first.set_item("k", "v").unwrap();
        assert_eq!(second.get_item("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn events_reach_other_handles_only() {
        let first = MemoryStorage::new();
        let second = first.handle();

        let (own, own_seen) = recorder();
        let (other, other_seen) = recorder();
        let _own_sub = first.subscribe(own);
        let _other_sub = second.subscribe(other);

        first.set_item("k", "v").unwrap();
        first.remove_item("k").unwrap();

        assert!(own_seen.lock().unwrap().is_empty());
        assert_eq!(
            *other_seen.lock().unwrap(),
            vec![
                StorageEvent {
                    key: "k".into(),
                    new_value: Some("v".into())
                },
                StorageEvent {
                    key: "k".into(),
                    new_value: None
                },
            ]
        );
    }

    #[test]
    fn dropping_subscription_stops_events() {
        let first = MemoryStorage::new();
        let second = first.handle();
        let (listener, seen) = recorder();

        let subscription = second.subscribe(listener);
        drop(subscription);
        first.set_item("k", "v").unwrap();

        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn quota_counts_keys_and_values() {
        let storage = MemoryStorage::with_quota(10);
        storage.set_item("ab", "cdef").unwrap();
        assert!(matches!(
            storage.set_item("gh", "ijklm"),
            Err(StorageError::QuotaExceeded)
        ));
        // Replacing a value only counts the new size.
        storage.set_item("ab", "cdefghij").unwrap();
        assert_eq!(storage.get_item("gh").unwrap(), None);
    }
}
