//! Parameterized selectors with a per-parameter LRU cache and sliding TTL.

use super::interval::IntervalSlot;
use super::manager::{ManagerShared, Sweepable};
use super::types::InputSelector;
use super::StateSource;
use crate::error::{ErrorContext, StoreError};
use crate::value::{same_value, smart_equal_all, Value};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::debug;

type Projector<P, T> = Box<dyn Fn(&P, &[Value]) -> T + Send + Sync>;

struct Entry<T> {
    root: Value,
    inputs: Vec<Value>,
    value: T,
    expires_at: Instant,
}

pub(crate) struct ParamInner<P: ?Sized, T> {
    source: Weak<dyn StateSource>,
    manager: Weak<ManagerShared>,
    inputs: Vec<InputSelector>,
    projector: Projector<P, T>,
    cache: Mutex<LruCache<String, Entry<T>>>,
    ttl: Duration,
    sweep_every: Duration,
    expiry: IntervalSlot,
    fallback_keys: AtomicU64,
    last_accessed: Mutex<Instant>,
    tracked: AtomicBool,
    recomputations: AtomicU64,
}

/// A selector of `(state, params)`.
///
/// Results are cached per parameter set, keyed by the sorted-key JSON of the
/// parameters. Parameters that fail to serialize get a fresh key each call,
/// so they are never served from cache.
pub struct ParameterizedSelector<P: ?Sized, T> {
    inner: Arc<ParamInner<P, T>>,
    _params: PhantomData<fn(&P)>,
}

impl<P: ?Sized, T> Clone for ParameterizedSelector<P, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _params: PhantomData,
        }
    }
}

impl<P, T> ParameterizedSelector<P, T>
where
    P: Serialize + ?Sized + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new(
        manager: &Arc<ManagerShared>,
        inputs: Vec<InputSelector>,
        projector: Projector<P, T>,
    ) -> Self {
        let capacity = NonZeroUsize::new(manager.config.param_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        let ttl = manager.config.param_ttl;
        Self {
            inner: Arc::new(ParamInner {
                source: manager.source.clone(),
                manager: Arc::downgrade(manager),
                inputs,
                projector,
                cache: Mutex::new(LruCache::new(capacity)),
                ttl,
                sweep_every: ttl.min(manager.config.sweep_interval).max(Duration::from_millis(1)),
                expiry: IntervalSlot::default(),
                fallback_keys: AtomicU64::new(0),
                last_accessed: Mutex::new(Instant::now()),
                tracked: AtomicBool::new(false),
                recomputations: AtomicU64::new(0),
            }),
            _params: PhantomData,
        }
    }

    /// Value for `params` against the store's current state.
    pub fn get(&self, params: &P) -> T {
        let state = self
            .inner
            .source
            .upgrade()
            .map(|s| s.current_state())
            .unwrap_or_default();
        self.select(&state, params)
    }

    /// Value for `params` against an explicit state.
    pub fn select(&self, state: &Value, params: &P) -> T {
        self.touch();
        let key = self.cache_key(params);
        let now = Instant::now();
        let expires_at = now + self.inner.ttl;

        let previous_inputs = {
            let mut cache = self.inner.cache.lock();
            match cache.get_mut(&key) {
                Some(entry) if entry.expires_at > now => {
                    if same_value(&entry.root, state) {
                        entry.expires_at = expires_at;
                        return entry.value.clone();
                    }
                    Some(entry.inputs.clone())
                }
                _ => None,
            }
        };

        let inputs: Vec<Value> = self.inner.inputs.iter().map(|input| input(state)).collect();
        if let Some(previous) = previous_inputs {
            if smart_equal_all(&previous, &inputs) {
                let mut cache = self.inner.cache.lock();
                if let Some(entry) = cache.get_mut(&key) {
                    entry.root = state.clone();
                    entry.expires_at = expires_at;
                    return entry.value.clone();
                }
            }
        }

        let value = (self.inner.projector)(params, &inputs);
        self.inner.recomputations.fetch_add(1, Ordering::Relaxed);
        self.inner.cache.lock().put(
            key,
            Entry {
                root: state.clone(),
                inputs,
                value: value.clone(),
                expires_at,
            },
        );
        self.ensure_expiry();
        value
    }

    /// Number of cached parameter sets.
    pub fn cache_len(&self) -> usize {
        self.inner.cache.lock().len()
    }

    /// How many times the projector has run.
    pub fn recomputations(&self) -> u64 {
        self.inner.recomputations.load(Ordering::Relaxed)
    }

    /// Drop every cached entry and stop the expiry thread.
    pub fn clear(&self) {
        self.inner.clear();
    }

    /// Remove expired entries now. Returns how many were removed.
    pub fn remove_expired(&self) -> usize {
        self.inner.remove_expired(Instant::now())
    }

    fn cache_key(&self, params: &P) -> String {
        match serde_json::to_value(params) {
            // Object keys serialize in sorted order.
            Ok(json) => json.to_string(),
            Err(_) => format!(
                "\u{0}unserializable:{}",
                self.inner.fallback_keys.fetch_add(1, Ordering::Relaxed)
            ),
        }
    }

    fn touch(&self) {
        *self.inner.last_accessed.lock() = Instant::now();
        if !self.inner.tracked.swap(true, Ordering::SeqCst) {
            if let Some(manager) = self.inner.manager.upgrade() {
                let weak: Weak<ParamInner<P, T>> = Arc::downgrade(&self.inner);
                manager.track_weak(weak);
            }
        }
    }

    fn ensure_expiry(&self) {
        let weak = Arc::downgrade(&self.inner);
        let started = self.inner.expiry.ensure(
            "statehouse-param-ttl",
            self.inner.sweep_every,
            move |id| match weak.upgrade() {
                Some(inner) => inner.on_tick(id),
                None => false,
            },
        );
        if let Err(e) = started {
            if let Some(manager) = self.inner.manager.upgrade() {
                manager.report(StoreError::store(
                    format!("failed to start parameter cache expiry: {}", e),
                    ErrorContext::new("parameterized_selector"),
                ));
            }
        }
    }
}

impl<P: ?Sized, T> ParamInner<P, T> {
    fn remove_expired(&self, now: Instant) -> usize {
        let mut cache = self.cache.lock();
        let expired: Vec<String> = cache
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            cache.pop(key);
        }
        expired.len()
    }

    fn on_tick(&self, id: u64) -> bool {
        self.expiry
            .with_current(id, |slot| {
                let removed = self.remove_expired(Instant::now());
                if removed > 0 {
                    debug!(removed, "Expired parameterized selector entries");
                }
                if self.cache.lock().is_empty() {
                    slot.retire();
                    return false;
                }
                true
            })
            .unwrap_or(false)
    }

    fn clear(&self) {
        self.cache.lock().clear();
        self.expiry.stop();
    }
}

impl<P: ?Sized + 'static, T: Send + Sync + 'static> Sweepable for ParamInner<P, T> {
    fn idle_since(&self) -> Option<Instant> {
        Some(*self.last_accessed.lock())
    }

    fn evict(&self) {
        self.clear();
        self.tracked.store(false, Ordering::SeqCst);
    }
}

impl<P: ?Sized, T> fmt::Debug for ParameterizedSelector<P, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterizedSelector")
            .field("cached", &self.inner.cache.lock().len())
            .field("ttl", &self.inner.ttl)
            .finish_non_exhaustive()
    }
}
