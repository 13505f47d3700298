//! Directory-backed storage area.
//!
//! One file per key. File names are the percent-encoded key, so every key
//! maps to a single flat file name. Handles of the same process hear about
//! each other's writes directly. Writes from other processes sharing the
//! directory are picked up by watching it.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};

use super::storage::{
    lock, Listeners, StorageBackend, StorageEvent, StorageListener, StorageResult,
    StorageSubscription,
};
use crate::error::StorageError;

const ENOSPC: i32 = 28;

/// Last value this process wrote per key, `None` for a removal.
type Written = Mutex<HashMap<String, Option<String>>>;

#[derive(Clone)]
pub struct FileStorage {
    dir: Arc<PathBuf>,
    listeners: Arc<Listeners>,
    written: Arc<Written>,
    handle: usize,
}

impl std::fmt::Debug for FileStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStorage").field("dir", &self.dir).finish()
    }
}

impl FileStorage {
    /// Open (creating if needed) a storage area in `dir`.
    pub fn open(dir: impl AsRef<Path>) -> StorageResult<Self> {
        fs::create_dir_all(dir.as_ref())?;
        let listeners = Arc::new(Listeners::default());
        let handle = listeners.next_handle();
        Ok(Self {
            dir: Arc::new(dir.as_ref().to_path_buf()),
            listeners,
            written: Arc::new(Mutex::new(HashMap::new())),
            handle,
        })
    }

    /// Another handle on the same directory.
    pub fn handle(&self) -> Self {
        Self {
            dir: self.dir.clone(),
            listeners: self.listeners.clone(),
            written: self.written.clone(),
            handle: self.listeners.next_handle(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir
            .join(utf8_percent_encode(key, NON_ALPHANUMERIC).to_string())
    }

    /// Watch the directory for files changed by other processes.
    fn watch(&self, listener: StorageListener) -> notify::Result<Mutex<RecommendedWatcher>> {
        let written = self.written.clone();
        let mut delivered: HashMap<String, Option<String>> = HashMap::new();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(error = %e, "Cache directory watch failed");
                    return;
                }
            };
            if !matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) {
                return;
            }

            for path in &event.paths {
                let Some(key) = path.file_name().and_then(|n| n.to_str()).and_then(decode_name)
                else {
                    continue;
                };
                let value = match fs::read_to_string(path) {
                    Ok(value) => Some(value),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => None,
                    Err(e) => {
                        tracing::debug!(key = %key, error = %e, "Unreadable cache file");
                        continue;
                    }
                };

                // Ours, or already reported
                if lock(&written).get(&key) == Some(&value) {
                    continue;
                }
                if delivered.get(&key) == Some(&value) {
                    continue;
                }
                delivered.insert(key.clone(), value.clone());

                listener(&StorageEvent {
                    key,
                    new_value: value,
                });
            }
        })?;

        watcher.watch(&self.dir, RecursiveMode::NonRecursive)?;
        Ok(Mutex::new(watcher))
    }
}

/// Key stored under file `name`. Temp files and foreign names have none.
fn decode_name(name: &str) -> Option<String> {
    if name.starts_with('.') {
        return None;
    }
    match percent_decode_str(name).decode_utf8() {
        Ok(key) => Some(key.into_owned()),
        Err(_) => {
            tracing::warn!(file = %name, "Ignoring undecodable cache file");
            None
        }
    }
}

fn write_error(err: io::Error) -> StorageError {
    if err.raw_os_error() == Some(ENOSPC) {
        StorageError::QuotaExceeded
    } else {
        StorageError::Io(err)
    }
}

impl StorageBackend for FileStorage {
    fn get_item(&self, key: &str) -> StorageResult<Option<String>> {
        match fs::read_to_string(self.path(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> StorageResult<()> {
        let path = self.path(key);
        // Encoded names never start with '.', so temp files cannot collide.
        let tmp = self.dir.join(format!(
            ".{}.tmp",
            path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
        ));

        lock(&self.written).insert(key.to_string(), Some(value.to_string()));
        if let Err(e) = fs::write(&tmp, value) {
            let _ = fs::remove_file(&tmp);
            return Err(write_error(e));
        }
        fs::rename(&tmp, &path).map_err(write_error)?;

        self.listeners.notify(
            self.handle,
            StorageEvent {
                key: key.to_string(),
                new_value: Some(value.to_string()),
            },
        );
        Ok(())
    }

    fn remove_item(&self, key: &str) -> StorageResult<()> {
        lock(&self.written).insert(key.to_string(), None);
        match fs::remove_file(self.path(key)) {
            Ok(()) => {
                self.listeners.notify(
                    self.handle,
                    StorageEvent {
                        key: key.to_string(),
                        new_value: None,
                    },
                );
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&*self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            if let Some(key) = name.to_str().and_then(decode_name) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn subscribe(&self, listener: StorageListener) -> StorageSubscription {
        let local = self.listeners.add(self.handle, listener.clone());

        match self.watch(listener) {
            Ok(watcher) => StorageSubscription::new(move || {
                drop(watcher);
                drop(local);
            }),
            Err(e) => {
                tracing::warn!(
                    dir = %self.dir.display(),
                    error = %e,
                    "Cannot watch cache directory, other processes' writes show on next read"
                );
                local
            }
        }
    }
}
