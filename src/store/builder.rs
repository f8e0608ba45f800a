//! Store construction.

use super::sync::SyncWorker;
use super::{merge_over, ErrorSink, Store, StoreInner, StoreRegistry};
use crate::error::{ErrorContext, Result, StoreError};
use crate::history::History;
use crate::middleware::{from_fn, Middleware, MiddlewareContext, Next};
use crate::persistence::{LoadOutcome, PersistenceManager, PersistenceOptions};
use crate::plugins::{Plugin, PluginHost};
use crate::selectors::{SelectorConfig, SelectorManager, StateSource};
use crate::storage::StorageAdapter;
use crate::type_registry::TypeRegistry;
use crate::types::{CookieOptions, SessionId, StorageType, StoreId};
use crate::action::Action;
use crate::value::Value;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

/// Plain-data store options.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Name written into persisted metadata and log lines.
    pub name: Option<String>,

    /// Storage key of the persisted snapshot (None = no persistence).
    pub persist_key: Option<String>,

    pub storage_type: StorageType,

    /// Apply other sessions' writes. Only effective with `StorageType::Local`.
    pub sync_across_tabs: bool,

    pub cookie_options: CookieOptions,

    /// Key prefix used with `StorageType::Cookie`.
    pub cookie_prefix: String,

    /// Max history entries. 0 disables undo/redo.
    /// Default: 50
    pub history_limit: usize,

    /// Snapshots older than this are discarded on load (None = never stale).
    pub stale_age: Option<Duration>,

    /// Also remove other stale snapshots under the same key prefix on load.
    pub cleanup_stale_states_on_load: bool,

    /// Session this store belongs to (None = the registry's, or a fresh one).
    pub session_id: Option<SessionId>,

    pub selector: SelectorConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: None,
            persist_key: None,
            storage_type: StorageType::None,
            sync_across_tabs: false,
            cookie_options: CookieOptions::default(),
            cookie_prefix: String::new(),
            history_limit: 50,
            stale_age: None,
            cleanup_stale_states_on_load: false,
            session_id: None,
            selector: SelectorConfig::default(),
        }
    }
}

/// Builder for [`Store`].
pub struct StoreBuilder {
    initial: Value,
    config: StoreConfig,
    storage: Option<Arc<dyn StorageAdapter>>,
    plugins: Vec<Arc<dyn Plugin>>,
    middleware: Vec<Arc<dyn Middleware>>,
    on_error: Option<ErrorSink>,
    registry: Option<Arc<StoreRegistry>>,
    type_registry: Option<Arc<TypeRegistry>>,
}

impl StoreBuilder {
    pub fn new(initial: impl Into<Value>) -> Self {
        Self {
            initial: initial.into(),
            config: StoreConfig::default(),
            storage: None,
            plugins: Vec::new(),
            middleware: Vec::new(),
            on_error: None,
            registry: None,
            type_registry: None,
        }
    }

    /// Replace all plain-data options at once.
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = Some(name.into());
        self
    }

    pub fn persist_key(mut self, key: impl Into<String>) -> Self {
        self.config.persist_key = Some(key.into());
        self
    }

    /// Backend and its kind. Persistence also needs a persist key.
    pub fn storage(mut self, storage_type: StorageType, adapter: Arc<dyn StorageAdapter>) -> Self {
        self.config.storage_type = storage_type;
        self.storage = Some(adapter);
        self
    }

    pub fn sync_across_tabs(mut self, enabled: bool) -> Self {
        self.config.sync_across_tabs = enabled;
        self
    }

    pub fn cookie_options(mut self, options: CookieOptions) -> Self {
        self.config.cookie_options = options;
        self
    }

    pub fn cookie_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.cookie_prefix = prefix.into();
        self
    }

    pub fn history_limit(mut self, limit: usize) -> Self {
        self.config.history_limit = limit;
        self
    }

    pub fn stale_age(mut self, age: Duration) -> Self {
        self.config.stale_age = Some(age);
        self
    }

    pub fn cleanup_stale_states_on_load(mut self, enabled: bool) -> Self {
        self.config.cleanup_stale_states_on_load = enabled;
        self
    }

    pub fn session_id(mut self, session_id: impl Into<SessionId>) -> Self {
        self.config.session_id = Some(session_id.into());
        self
    }

    pub fn selector_config(mut self, config: SelectorConfig) -> Self {
        self.config.selector = config;
        self
    }

    pub fn plugin(mut self, plugin: impl Plugin + 'static) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    pub fn shared_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Add a closure as middleware.
    pub fn middleware_fn<F>(self, f: F) -> Self
    where
        F: Fn(Action, &MiddlewareContext<'_>, Next<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.middleware(from_fn(f))
    }

    pub fn on_error<F>(mut self, sink: F) -> Self
    where
        F: Fn(&StoreError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(sink));
        self
    }

    /// Register the store with `registry`, adopting its session unless one
    /// was set explicitly.
    pub fn registry(mut self, registry: Arc<StoreRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn type_registry(mut self, registry: Arc<TypeRegistry>) -> Self {
        self.type_registry = Some(registry);
        self
    }

    /// Build the store, loading any persisted state.
    ///
    /// Fails only on inconsistent configuration. Storage problems during
    /// load are reported and fall back to the initial state.
    pub fn build(self) -> Result<Store> {
        let StoreBuilder {
            initial,
            config,
            storage,
            plugins,
            middleware,
            on_error,
            registry,
            type_registry,
        } = self;

        if config.storage_type != StorageType::None && storage.is_none() {
            return Err(StoreError::validation(
                format!("storage type {:?} requires a storage adapter", config.storage_type),
                ErrorContext::new("build"),
            ));
        }
        if matches!(&config.persist_key, Some(key) if key.is_empty()) {
            return Err(StoreError::validation(
                "persist key must not be empty",
                ErrorContext::new("build"),
            ));
        }

        let session_id = config
            .session_id
            .clone()
            .or_else(|| registry.as_ref().map(|r| r.session_id().clone()))
            .unwrap_or_default();

        let persistence = match (&config.persist_key, &storage, config.storage_type) {
            (Some(key), Some(adapter), storage_type) if storage_type != StorageType::None => {
                Some(PersistenceManager::new(
                    Arc::clone(adapter),
                    type_registry.unwrap_or_default(),
                    PersistenceOptions {
                        persist_key: key.clone(),
                        storage_type,
                        cookie_prefix: config.cookie_prefix.clone(),
                        cookie_options: config.cookie_options.clone(),
                        stale_age: config.stale_age,
                        store_name: config.name.clone(),
                        session_id: session_id.clone(),
                    },
                ))
            }
            _ => None,
        };
        let sync_enabled =
            config.sync_across_tabs && config.storage_type.supports_sync() && persistence.is_some();
        if config.sync_across_tabs && !sync_enabled {
            warn!(
                storage_type = ?config.storage_type,
                "Cross-tab sync needs local storage and a persist key; disabled"
            );
        }

        let plugins = PluginHost::new(plugins);
        let mut deferred: Vec<StoreError> = Vec::new();

        // --- Load ---
        let mut state = initial.clone();
        if let Some(pm) = &persistence {
            if config.cleanup_stale_states_on_load {
                let removed = pm.cleanup_stale();
                debug!(removed, "Cleaned up stale snapshots");
            }
            match pm.load() {
                LoadOutcome::Loaded(loaded) => {
                    let merged = merge_over(&initial, loaded);
                    let (transformed, failures) = plugins.transform("on_state_loaded", merged, |p, v| {
                        p.on_state_loaded(v, &initial)
                    });
                    deferred.extend(failures);
                    state = transformed;
                    debug!(key = pm.storage_key(), "Loaded persisted state");
                }
                LoadOutcome::Corrupt(e) => deferred.push(StoreError::persistence(
                    e.to_string(),
                    ErrorContext::new("load").with_info("key", pm.storage_key()),
                )),
                LoadOutcome::Stale { .. } | LoadOutcome::Missing => {}
            }
        }

        let mut history = History::new(config.history_limit);
        if history.is_enabled() {
            history.seed(state.clone());
        }

        let watch = if sync_enabled {
            storage.as_ref().and_then(|s| s.watch())
        } else {
            None
        };

        let inner = Arc::new_cyclic(|weak: &Weak<StoreInner>| {
            let source: Weak<dyn StateSource> = weak.clone();
            StoreInner {
                id: StoreId(NEXT_STORE_ID.fetch_add(1, std::sync::atomic::Ordering::SeqCst)),
                name: config.name.clone(),
                session_id,
                initial_state: initial,
                state: RwLock::new(state),
                commit_lock: ReentrantMutex::new(()),
                history: Mutex::new(history),
                batch: Mutex::new(Default::default()),
                listeners: RwLock::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
                plugins,
                middleware,
                on_error,
                persistence,
                sync_enabled,
                sync_worker: Mutex::new(None),
                selectors: SelectorManager::new(source, config.selector.clone()),
                registry: registry.clone(),
                destroyed: AtomicBool::new(false),
            }
        });
        let store = Store { inner };

        store.inner.report_all(deferred);

        if let Some(events) = watch {
            match SyncWorker::spawn(Arc::downgrade(&store.inner), events) {
                Ok(worker) => *store.inner.sync_worker.lock() = Some(worker),
                Err(e) => store.inner.report(&StoreError::sync(
                    format!("failed to start sync listener: {}", e),
                    ErrorContext::new("build"),
                )),
            }
        }

        if let Some(registry) = &registry {
            registry.register(&store);
        }

        let failures = store
            .inner
            .plugins
            .each("on_store_create", |p| p.on_store_create(&store));
        store.inner.report_all(failures);

        debug!(
            store = store.name().unwrap_or(""),
            session = %store.session_id(),
            persisted = store.storage_key().is_some(),
            sync = sync_enabled,
            "Created store"
        );
        Ok(store)
    }
}
