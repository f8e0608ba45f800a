//! Snapshot persistence: encode, wrap with metadata, write; and the reverse.

use crate::error::{ErrorContext, Result, StoreError};
use crate::storage::{StorageAdapter, StorageEvent};
use crate::type_registry::TypeRegistry;
use crate::types::{CookieOptions, SessionId, StorageType, Timestamp};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Metadata written next to every persisted state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMeta {
    /// Milliseconds since epoch.
    pub last_updated: i64,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_name: Option<String>,
}

/// Wire format of a persisted state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedSnapshot {
    /// Registry-encoded state.
    pub data: serde_json::Value,
    pub meta: SnapshotMeta,
}

impl PersistedSnapshot {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| StoreError::Deserialization(e.to_string()))
    }

    /// Whether this snapshot is older than `stale_age` at `now`.
    pub fn is_stale(&self, stale_age: Option<Duration>, now: Timestamp) -> bool {
        match stale_age {
            Some(max_age) => Timestamp(self.meta.last_updated).age(now) > max_age,
            None => false,
        }
    }
}

/// Result of reading the persisted state at construction.
#[derive(Debug)]
pub enum LoadOutcome {
    /// Decoded state, not yet merged over the initial state.
    Loaded(Value),
    /// Nothing usable was stored, or the backend is unavailable.
    Missing,
    /// A snapshot older than the staleness window was found and removed.
    Stale { age: Duration },
    /// The stored entry could not be parsed.
    Corrupt(StoreError),
}

/// Where and how a store persists.
#[derive(Clone, Debug)]
pub struct PersistenceOptions {
    pub persist_key: String,
    pub storage_type: StorageType,
    pub cookie_prefix: String,
    pub cookie_options: CookieOptions,
    pub stale_age: Option<Duration>,
    pub store_name: Option<String>,
    pub session_id: SessionId,
}

/// Reads and writes one store's snapshot through a [`StorageAdapter`].
pub struct PersistenceManager {
    storage: Arc<dyn StorageAdapter>,
    registry: Arc<TypeRegistry>,
    options: PersistenceOptions,
    prefix: String,
    key: String,
}

impl PersistenceManager {
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        registry: Arc<TypeRegistry>,
        options: PersistenceOptions,
    ) -> Self {
        let prefix = match options.storage_type {
            StorageType::Cookie => options.cookie_prefix.clone(),
            _ => String::new(),
        };
        let key = format!("{}{}", prefix, options.persist_key);
        Self {
            storage,
            registry,
            options,
            prefix,
            key,
        }
    }

    /// Full backend key, prefix included.
    pub fn storage_key(&self) -> &str {
        &self.key
    }

    pub fn storage_type(&self) -> StorageType {
        self.options.storage_type
    }

    pub fn storage(&self) -> &Arc<dyn StorageAdapter> {
        &self.storage
    }

    /// Encode `state` and write it with fresh metadata.
    pub fn write(&self, state: &Value) -> Result<()> {
        let snapshot = PersistedSnapshot {
            data: self.registry.serialize(state),
            meta: SnapshotMeta {
                last_updated: Timestamp::now().0,
                session_id: self.options.session_id.to_string(),
                store_name: self.options.store_name.clone(),
            },
        };
        let text = serde_json::to_string(&snapshot)?;

        let written = match self.options.storage_type {
            StorageType::Cookie => {
                self.storage
                    .set_with_options(&self.key, &text, &self.options.cookie_options)
            }
            _ => self.storage.set(&self.key, &text),
        };
        if !written {
            return Err(StoreError::persistence(
                "storage backend rejected write",
                ErrorContext::new("persist")
                    .with_info("key", self.key.as_str())
                    .with_info("bytes", text.len()),
            ));
        }
        debug!(key = %self.key, bytes = text.len(), "Persisted state");
        Ok(())
    }

    /// Read the stored snapshot. Stale snapshots are removed.
    pub fn load(&self) -> LoadOutcome {
        if !self.storage.is_available() {
            return LoadOutcome::Missing;
        }
        let Some(text) = self.storage.get(&self.key) else {
            return LoadOutcome::Missing;
        };
        let snapshot = match PersistedSnapshot::parse(&text) {
            Ok(snapshot) => snapshot,
            Err(e) => return LoadOutcome::Corrupt(e),
        };

        let now = Timestamp::now();
        if snapshot.is_stale(self.options.stale_age, now) {
            let age = Timestamp(snapshot.meta.last_updated).age(now);
            warn!(key = %self.key, age_ms = age.as_millis() as u64, "Discarding stale persisted state");
            self.storage.remove(&self.key);
            return LoadOutcome::Stale { age };
        }

        LoadOutcome::Loaded(self.registry.deserialize(snapshot.data))
    }

    /// Remove this store's snapshot.
    pub fn remove(&self) -> bool {
        self.storage.remove(&self.key)
    }

    /// Remove every other stale snapshot under this store's key prefix.
    /// Entries that are not snapshots are left alone. Returns how many were removed.
    pub fn cleanup_stale(&self) -> usize {
        let now = Timestamp::now();
        let mut removed = 0;
        for key in self.storage.keys() {
            if key == self.key || !key.starts_with(&self.prefix) {
                continue;
            }
            let Some(text) = self.storage.get(&key) else {
                continue;
            };
            let Ok(snapshot) = PersistedSnapshot::parse(&text) else {
                continue;
            };
            if snapshot.is_stale(self.options.stale_age, now) && self.storage.remove(&key) {
                warn!(key = %key, "Removed stale persisted state");
                removed += 1;
            }
        }
        removed
    }

    /// Parse a change event for this store's key into the remote snapshot.
    ///
    /// `Ok(None)` for events about other keys or removals.
    pub fn decode_event(&self, event: &StorageEvent) -> Result<Option<(Value, SnapshotMeta)>> {
        if event.key.as_deref() != Some(self.key.as_str()) {
            return Ok(None);
        }
        let Some(text) = event.new_value.as_deref() else {
            return Ok(None);
        };
        let snapshot = PersistedSnapshot::parse(text).map_err(|e| {
            StoreError::sync(
                e.to_string(),
                ErrorContext::new("cross_tab_sync").with_info("key", self.key.as_str()),
            )
        })?;
        Ok(Some((self.registry.deserialize(snapshot.data), snapshot.meta)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn options(storage_type: StorageType) -> PersistenceOptions {
        PersistenceOptions {
            persist_key: "app".into(),
            storage_type,
            cookie_prefix: "ck_".into(),
            cookie_options: CookieOptions::default(),
            stale_age: Some(Duration::from_secs(60)),
            store_name: Some("app-store".into()),
            session_id: SessionId::from("s1"),
        }
    }

    fn manager(storage: &Arc<MemoryStorage>, storage_type: StorageType) -> PersistenceManager {
        PersistenceManager::new(
            storage.clone(),
            Arc::new(TypeRegistry::new()),
            options(storage_type),
        )
    }

    #[test]
    fn test_write_wraps_with_metadata() {
        let storage = Arc::new(MemoryStorage::new());
        let pm = manager(&storage, StorageType::Local);
        pm.write(&Value::from(json!({"count": 5}))).unwrap();

        let stored: serde_json::Value =
            serde_json::from_str(&storage.get("app").unwrap()).unwrap();
        assert_eq!(stored["data"]["count"], 5);
        assert_eq!(stored["meta"]["sessionId"], "s1");
        assert_eq!(stored["meta"]["storeName"], "app-store");
        assert!(stored["meta"]["lastUpdated"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_cookie_prefix_only_for_cookies() {
        let storage = Arc::new(MemoryStorage::new());
        assert_eq!(manager(&storage, StorageType::Cookie).storage_key(), "ck_app");
        assert_eq!(manager(&storage, StorageType::Session).storage_key(), "app");
    }

    #[test]
    fn test_load_round_trip() {
        let storage = Arc::new(MemoryStorage::new());
        let pm = manager(&storage, StorageType::Local);
        let state = Value::from_pairs(vec![("seen", Value::set_of(vec![Value::from(1)]))]);
        pm.write(&state).unwrap();

        match pm.load() {
            LoadOutcome::Loaded(loaded) => assert_eq!(loaded, state),
            other => panic!("expected loaded, got {:?}", other),
        }
    }

    #[test]
    fn test_stale_snapshot_is_removed() {
        let storage = Arc::new(MemoryStorage::new());
        let old = json!({"data": {"count": 9}, "meta": {"lastUpdated": 1_000, "sessionId": "old"}});
        storage.seed("app", old.to_string());

        let pm = manager(&storage, StorageType::Local);
        assert!(matches!(pm.load(), LoadOutcome::Stale { .. }));
        assert!(storage.get("app").is_none());
    }

    #[test]
    fn test_malformed_snapshot_is_corrupt() {
        let storage = Arc::new(MemoryStorage::new());
        storage.seed("app", "{not json");
        let pm = manager(&storage, StorageType::Local);
        assert!(matches!(pm.load(), LoadOutcome::Corrupt(_)));
    }

    #[test]
    fn test_failed_write_is_persistence_error() {
        let storage = Arc::new(MemoryStorage::with_quota(4));
        let pm = manager(&storage, StorageType::Local);
        let err = pm.write(&Value::from(json!({"count": 5}))).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Persistence);
    }

    #[test]
    fn test_cleanup_stale_skips_fresh_and_foreign_entries() {
        let storage = Arc::new(MemoryStorage::new());
        let stale = json!({"data": {}, "meta": {"lastUpdated": 1_000, "sessionId": "x"}});
        storage.seed("other", stale.to_string());
        storage.seed("plain", "hello");

        let pm = manager(&storage, StorageType::Local);
        pm.write(&Value::object()).unwrap();

        assert_eq!(pm.cleanup_stale(), 1);
        assert!(storage.get("other").is_none());
        assert!(storage.get("plain").is_some());
        assert!(storage.get("app").is_some());
    }

    #[test]
    fn test_decode_event_filters_keys() {
        let storage = Arc::new(MemoryStorage::new());
        let pm = manager(&storage, StorageType::Local);
        let event = StorageEvent {
            key: Some("unrelated".into()),
            old_value: None,
            new_value: Some("{}".into()),
        };
        assert!(pm.decode_event(&event).unwrap().is_none());

        let text = json!({"data": {"count": 2}, "meta": {"lastUpdated": 5, "sessionId": "s2"}});
        let event = StorageEvent {
            key: Some("app".into()),
            old_value: None,
            new_value: Some(text.to_string()),
        };
        let (state, meta) = pm.decode_event(&event).unwrap().unwrap();
        assert_eq!(state["count"].as_i64(), Some(2));
        assert_eq!(meta.session_id, "s2");
    }
}
