//! Session-scoped bookkeeping of live stores.

use super::{DestroyOptions, Store, StoreInner};
use crate::types::{SessionId, StoreId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Weak;
use tracing::debug;

/// Maps each session to the stores it owns, for bulk teardown.
///
/// Entries are weak: dropping every handle to a store is enough to release
/// it, and dead entries are skipped and pruned on the next lookup.
pub struct StoreRegistry {
    session_id: SessionId,
    stores: RwLock<HashMap<SessionId, Vec<(StoreId, Weak<StoreInner>)>>>,
}

impl StoreRegistry {
    /// A registry whose stores default to a fresh session id.
    pub fn new() -> Self {
        Self::with_session(SessionId::new())
    }

    pub fn with_session(session_id: SessionId) -> Self {
        Self {
            session_id,
            stores: RwLock::new(HashMap::new()),
        }
    }

    /// Session adopted by stores built with this registry.
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn register(&self, store: &Store) {
        let mut stores = self.stores.write();
        let owned = stores.entry(store.session_id().clone()).or_default();
        owned.retain(|(_, weak)| weak.strong_count() > 0);
        owned.push((store.id(), std::sync::Arc::downgrade(&store.inner)));
    }

    /// Forget a store. Returns false if it was not registered.
    pub fn unregister(&self, session_id: &SessionId, store_id: StoreId) -> bool {
        let mut stores = self.stores.write();
        let Some(owned) = stores.get_mut(session_id) else {
            return false;
        };
        let before = owned.len();
        owned.retain(|(id, _)| *id != store_id);
        let removed = owned.len() != before;
        if owned.is_empty() {
            stores.remove(session_id);
        }
        removed
    }

    /// Live stores owned by `session_id`, in registration order.
    pub fn list_by_owner(&self, session_id: &SessionId) -> Vec<Store> {
        self.stores
            .read()
            .get(session_id)
            .map(|owned| {
                owned
                    .iter()
                    .filter_map(|(_, weak)| weak.upgrade())
                    .map(|inner| Store { inner })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Sessions with at least one registered store.
    pub fn sessions(&self) -> Vec<SessionId> {
        self.stores.read().keys().cloned().collect()
    }

    /// Destroy every live store of `session_id`. Returns how many were destroyed.
    pub fn destroy_session(&self, session_id: &SessionId, options: DestroyOptions) -> usize {
        let stores = self.list_by_owner(session_id);
        let count = stores.len();
        for store in stores {
            store.destroy(options);
        }
        self.stores.write().remove(session_id);
        debug!(session = %session_id, count, "Destroyed session stores");
        count
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}
