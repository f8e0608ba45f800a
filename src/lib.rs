//! # Statehouse
//!
//! An in-process reactive state container with memoized selectors, undo
//! history, durable persistence and cross-tab synchronization.
//!
//! ## Core Concepts
//!
//! - **Store**: owns one state [`Value`] and the update pipeline
//!   (middleware, plugin hooks, apply, persist, history, notify)
//! - **Value**: an immutable tree with structural sharing; untouched subtrees
//!   keep their identity across updates
//! - **Selectors**: memoized derivations and change subscriptions
//! - **Persistence**: snapshots with staleness metadata, written through a
//!   pluggable [`StorageAdapter`] and a [`TypeRegistry`] for sets, maps and
//!   custom types
//!
//! ## Example
//!
//! ```ignore
//! use statehouse::{MemoryStorage, StorageType, Store};
//! use serde_json::json;
//!
//! let store = Store::builder(json!({"count": 0, "todos": []}))
//!     .persist_key("app")
//!     .storage(StorageType::Local, Arc::new(MemoryStorage::new()))
//!     .build()?;
//!
//! store.dispatch(json!({"count": 1}));
//! store.update_path("todos.0", |_| json!({"title": "write docs"}).into());
//! store.transaction(|draft| {
//!     draft.set("count", 2);
//!     Ok(())
//! });
//! store.undo(1);
//!
//! let count = store.selectors().create_selector(|s| s["count"].as_i64());
//! assert_eq!(count.get(), Some(1));
//! ```

pub mod action;
pub mod error;
pub mod history;
pub mod middleware;
pub mod persistence;
pub mod plugins;
pub mod selectors;
pub mod storage;
pub mod store;
pub mod type_registry;
pub mod types;
pub mod value;

// Re-exports
pub use action::Action;
pub use error::{ErrorContext, ErrorKind, Result, StoreError};
pub use history::HistoryOperation;
pub use middleware::{from_fn, Middleware, MiddlewareContext, MiddlewareFn, Next};
pub use persistence::{
    LoadOutcome, PersistedSnapshot, PersistenceManager, PersistenceOptions, SnapshotMeta,
};
pub use plugins::{OmitPaths, Plugin};
pub use selectors::{
    input, input_path, InputSelector, ParameterizedSelector, Selector, SelectorConfig,
    SelectorManager, SelectorValue, StateSource, SubscribeOptions, Subscription, SubscriptionId,
};
pub use storage::{FileStorage, MemoryStorage, StorageAdapter, StorageEvent};
pub use store::{
    BoxFuture, DestroyOptions, ListenerHandle, Store, StoreBuilder, StoreConfig, StoreRegistry,
    ThunkOutcome,
};
pub use type_registry::{TypeRegistration, TypeRegistry};
pub use types::*;
pub use value::{
    deep_equal, get_in, same_value, set_in, shallow_equal, smart_equal, smart_equal_all,
    CustomValue, Draft, Path, PathSegment, Value,
};
