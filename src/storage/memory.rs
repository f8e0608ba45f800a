//! In-memory storage with change broadcasting.

use super::{StorageAdapter, StorageEvent};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// A map of strings shared by every store holding the same handle.
///
/// Each write is broadcast to all [`watch`](StorageAdapter::watch) channels,
/// including the writer's own; receivers filter their own echoes.
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, String>>,
    watchers: Mutex<Vec<Sender<StorageEvent>>>,
    /// Max total bytes of keys plus values.
    quota: Option<usize>,
    available: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            watchers: Mutex::new(Vec::new()),
            quota: None,
            available: AtomicBool::new(true),
        }
    }

    /// A backend that rejects writes pushing it past `bytes`.
    pub fn with_quota(bytes: usize) -> Self {
        Self {
            quota: Some(bytes),
            ..Self::new()
        }
    }

    /// Simulate the backend going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Write without broadcasting, as if the entry had been there all along.
    pub fn seed(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.write().insert(key.into(), value.into());
    }

    fn broadcast(&self, event: StorageEvent) {
        let mut watchers = self.watchers.lock();
        watchers.retain(|sender| sender.send(event.clone()).is_ok());
    }

    fn used_bytes(entries: &BTreeMap<String, String>) -> usize {
        entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageAdapter for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        if !self.is_available() {
            return None;
        }
        self.entries.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> bool {
        if !self.is_available() {
            return false;
        }
        let old_value = {
            let mut entries = self.entries.write();
            if let Some(quota) = self.quota {
                let current = Self::used_bytes(&entries);
                let replaced = entries.get(key).map(|v| key.len() + v.len()).unwrap_or(0);
                if current - replaced + key.len() + value.len() > quota {
                    return false;
                }
            }
            entries.insert(key.to_string(), value.to_string())
        };
        self.broadcast(StorageEvent {
            key: Some(key.to_string()),
            old_value,
            new_value: Some(value.to_string()),
        });
        true
    }

    fn remove(&self, key: &str) -> bool {
        if !self.is_available() {
            return false;
        }
        let old_value = self.entries.write().remove(key);
        if old_value.is_some() {
            self.broadcast(StorageEvent {
                key: Some(key.to_string()),
                old_value,
                new_value: None,
            });
        }
        true
    }

    fn clear(&self) -> bool {
        if !self.is_available() {
            return false;
        }
        self.entries.write().clear();
        self.broadcast(StorageEvent {
            key: None,
            old_value: None,
            new_value: None,
        });
        true
    }

    fn keys(&self) -> Vec<String> {
        if !self.is_available() {
            return Vec::new();
        }
        self.entries.read().keys().cloned().collect()
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn watch(&self) -> Option<Receiver<StorageEvent>> {
        let (sender, receiver) = unbounded();
        self.watchers.lock().push(sender);
        Some(receiver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_set_get_remove() {
        let storage = MemoryStorage::new();
        assert!(storage.set("a", "1"));
        assert_eq!(storage.get("a").as_deref(), Some("1"));
        assert_eq!(storage.keys(), vec!["a".to_string()]);
        assert!(storage.remove("a"));
        assert!(storage.get("a").is_none());
    }

    #[test]
    fn test_quota_rejects_write() {
        let storage = MemoryStorage::with_quota(8);
        assert!(storage.set("k", "1234"));
        assert!(!storage.set("other", "12345"));
        // Replacing an entry only counts the difference.
        assert!(storage.set("k", "123456"));
    }

    #[test]
    fn test_unavailable_degrades() {
        let storage = MemoryStorage::new();
        storage.set("a", "1");
        storage.set_available(false);
        assert!(storage.get("a").is_none());
        assert!(!storage.set("b", "2"));
        assert!(storage.keys().is_empty());
    }

    #[test]
    fn test_watch_receives_changes() {
        let storage = MemoryStorage::new();
        let events = storage.watch().unwrap();
        storage.set("a", "1");
        storage.set("a", "2");

        let first = events.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(first.new_value.as_deref(), Some("1"));
        let second = events.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(second.old_value.as_deref(), Some("1"));
        assert_eq!(second.new_value.as_deref(), Some("2"));
    }

    #[test]
    fn test_dropped_watchers_are_pruned() {
        let storage = MemoryStorage::new();
        drop(storage.watch());
        storage.set("a", "1");
        assert!(storage.watchers.lock().is_empty());
    }
}
