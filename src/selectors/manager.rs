//! Selector manager: memoized selectors, tracking and the idle sweep.

use super::interval::IntervalSlot;
use super::parameterized::ParameterizedSelector;
use super::subscriptions::{Subscription, SubscriptionInner};
use super::types::{InputSelector, SelectorConfig, SelectorValue, SubscribeOptions, SubscriptionId};
use super::StateSource;
use crate::error::{ErrorContext, StoreError};
use crate::value::{get_in, same_value, smart_equal_all, Path, Value};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::debug;

/// Something the sweep can evict or tear down.
pub(crate) trait Sweepable: Send + Sync {
    /// Last access time, or `None` for entries exempt from idle eviction.
    fn idle_since(&self) -> Option<Instant>;

    /// False once the entry should leave the tracked set.
    fn is_live(&self) -> bool {
        true
    }

    /// Drop cached values. The entry re-tracks itself on next use.
    fn evict(&self);

    /// Final cleanup on `destroy_all`.
    fn teardown(&self) {
        self.evict();
    }
}

enum Tracked {
    Weak(Weak<dyn Sweepable>),
    Strong(Arc<dyn Sweepable>),
}

impl Tracked {
    fn get(&self) -> Option<Arc<dyn Sweepable>> {
        match self {
            Tracked::Weak(weak) => weak.upgrade(),
            Tracked::Strong(strong) => Some(Arc::clone(strong)),
        }
    }
}

pub(crate) struct ManagerShared {
    pub(crate) source: Weak<dyn StateSource>,
    pub(crate) config: SelectorConfig,
    tracked: Mutex<Vec<Tracked>>,
    sweeper: IntervalSlot,
    next_subscription_id: AtomicU64,
    destroyed: AtomicBool,
}

impl ManagerShared {
    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub(crate) fn report(&self, error: StoreError) {
        match self.source.upgrade() {
            Some(source) => source.report_error(&error),
            None => tracing::error!(error = %error, "Selector error with no store"),
        }
    }

    pub(crate) fn track_weak(self: &Arc<Self>, entry: Weak<dyn Sweepable>) {
        self.track(Tracked::Weak(entry));
    }

    pub(crate) fn track_strong(self: &Arc<Self>, entry: Arc<dyn Sweepable>) {
        self.track(Tracked::Strong(entry));
    }

    // Lock order: sweeper slot, then tracked.
    fn track(self: &Arc<Self>, entry: Tracked) {
        if self.is_destroyed() {
            return;
        }
        let weak = Arc::downgrade(self);
        let started = self.sweeper.ensure(
            "statehouse-sweep",
            self.config.sweep_interval,
            move |id| match weak.upgrade() {
                Some(shared) => shared.on_tick(id),
                None => false,
            },
        );
        self.tracked.lock().push(entry);
        match started {
            Ok(true) => debug!("Started selector sweep"),
            Ok(false) => {}
            Err(e) => self.report(StoreError::store(
                format!("failed to start selector sweep: {}", e),
                ErrorContext::new("track_selector"),
            )),
        }
    }

    fn on_tick(&self, id: u64) -> bool {
        self.sweeper
            .with_current(id, |slot| {
                let (_, remaining) = self.sweep(Instant::now());
                if remaining == 0 {
                    debug!("Selector sweep idle, stopping");
                    slot.retire();
                    return false;
                }
                true
            })
            .unwrap_or(false)
    }

    /// Evict idle entries and drop dead ones. Returns `(evicted, remaining)`.
    fn sweep(&self, now: Instant) -> (usize, usize) {
        let threshold = self.config.inactive_threshold;
        let mut evicted = 0;
        let mut tracked = self.tracked.lock();
        tracked.retain(|entry| {
            let Some(entry) = entry.get() else {
                return false;
            };
            if !entry.is_live() {
                return false;
            }
            match entry.idle_since() {
                Some(at) if now.saturating_duration_since(at) >= threshold => {
                    entry.evict();
                    evicted += 1;
                    false
                }
                _ => true,
            }
        });
        if evicted > 0 {
            debug!(evicted, remaining = tracked.len(), "Swept idle selectors");
        }
        (evicted, tracked.len())
    }

    pub(crate) fn next_subscription_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_subscription_id.fetch_add(1, Ordering::SeqCst))
    }
}

/// Builds and tracks selectors and subscriptions over one state source.
pub struct SelectorManager {
    shared: Arc<ManagerShared>,
}

impl SelectorManager {
    pub fn new(source: Weak<dyn StateSource>, config: SelectorConfig) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                source,
                config,
                tracked: Mutex::new(Vec::new()),
                sweeper: IntervalSlot::default(),
                next_subscription_id: AtomicU64::new(1),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.shared.config
    }

    /// A selector that recomputes only when the state root changes.
    pub fn create_selector<T, F>(&self, f: F) -> Selector<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&Value) -> T + Send + Sync + 'static,
    {
        Selector::new(&self.shared, Box::new(f))
    }

    /// A selector over several inputs. `projector` reruns only when the
    /// inputs are not smart-equal to the previous ones.
    pub fn combine_selectors<T, F>(&self, inputs: Vec<InputSelector>, projector: F) -> Selector<T>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&[Value]) -> T + Send + Sync + 'static,
    {
        let memo: Mutex<Option<(Vec<Value>, T)>> = Mutex::new(None);
        self.create_selector(move |state| {
            let args: Vec<Value> = inputs.iter().map(|input| input(state)).collect();
            if let Some((prev, value)) = &*memo.lock() {
                if smart_equal_all(prev, &args) {
                    return value.clone();
                }
            }
            let value = projector(&args);
            *memo.lock() = Some((args, value.clone()));
            value
        })
    }

    /// A selector taking parameters, cached per serialized parameter set.
    pub fn create_parameterized_selector<P, T, F>(
        &self,
        inputs: Vec<InputSelector>,
        projector: F,
    ) -> ParameterizedSelector<P, T>
    where
        P: Serialize + ?Sized + 'static,
        T: Clone + Send + Sync + 'static,
        F: Fn(&P, &[Value]) -> T + Send + Sync + 'static,
    {
        ParameterizedSelector::new(&self.shared, inputs, Box::new(projector))
    }

    /// Call `listener(new, old)` whenever `selector`'s value changes.
    pub fn subscribe_to<T, F>(
        &self,
        selector: &Selector<T>,
        listener: F,
        options: SubscribeOptions<T>,
    ) -> Subscription
    where
        T: SelectorValue,
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        SubscriptionInner::start(&self.shared, selector.clone(), Arc::new(listener), options)
    }

    /// Watch several selectors at once. Fires once per change with the full
    /// new and old value lists.
    pub fn subscribe_to_many<F>(
        &self,
        selectors: Vec<Selector<Value>>,
        listener: F,
        options: SubscribeOptions<Vec<Value>>,
    ) -> Subscription
    where
        F: Fn(&[Value], &[Value]) + Send + Sync + 'static,
    {
        let combined = self.create_selector(move |state| {
            selectors.iter().map(|s| s.select(state)).collect::<Vec<Value>>()
        });
        self.subscribe_to(
            &combined,
            move |new: &Vec<Value>, old: &Vec<Value>| listener(new, old),
            options,
        )
    }

    /// Watch the value at `path`.
    pub fn subscribe_to_path<F>(
        &self,
        path: impl Into<Path>,
        listener: F,
        options: SubscribeOptions<Value>,
    ) -> Subscription
    where
        F: Fn(&Value, &Value) + Send + Sync + 'static,
    {
        let path = path.into();
        let selector = self.create_selector(move |state| {
            get_in(state, path.segments()).cloned().unwrap_or_default()
        });
        self.subscribe_to(&selector, listener, options)
    }

    /// Run the idle sweep now. Returns how many entries were evicted.
    pub fn cleanup_selectors(&self) -> usize {
        self.shared.sweep(Instant::now()).0
    }

    /// Tear down every tracked selector and subscription and stop the sweep.
    /// Later tracking requests are ignored.
    pub fn destroy_all(&self) {
        self.shared.destroyed.store(true, Ordering::SeqCst);
        self.shared.sweeper.stop();
        let entries = std::mem::take(&mut *self.shared.tracked.lock());
        let count = entries.len();
        for entry in entries.iter().filter_map(Tracked::get) {
            entry.teardown();
        }
        debug!(count, "Destroyed selectors");
    }

    /// Number of tracked selectors and subscriptions.
    pub fn tracked_count(&self) -> usize {
        self.shared.tracked.lock().len()
    }

    /// Whether the sweep thread is running.
    pub fn is_sweeping(&self) -> bool {
        self.shared.sweeper.is_running()
    }
}

impl fmt::Debug for SelectorManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectorManager")
            .field("config", &self.shared.config)
            .field("tracked", &self.tracked_count())
            .finish()
    }
}

// --- Selector ---

struct Cached<T> {
    root: Value,
    value: T,
}

pub(crate) struct SelectorInner<T> {
    source: Weak<dyn StateSource>,
    manager: Weak<ManagerShared>,
    compute: Box<dyn Fn(&Value) -> T + Send + Sync>,
    cache: Mutex<Option<Cached<T>>>,
    last_accessed: Mutex<Instant>,
    tracked: AtomicBool,
    recomputations: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> Sweepable for SelectorInner<T> {
    fn idle_since(&self) -> Option<Instant> {
        Some(*self.last_accessed.lock())
    }

    fn evict(&self) {
        self.cache.lock().take();
        self.tracked.store(false, Ordering::SeqCst);
    }
}

/// A memoized derivation of store state.
///
/// Create once and reuse: the cache lives in the selector, and dropping
/// every clone lets the manager forget it.
pub struct Selector<T> {
    inner: Arc<SelectorInner<T>>,
}

impl<T> Clone for Selector<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Selector<T> {
    fn new(manager: &Arc<ManagerShared>, compute: Box<dyn Fn(&Value) -> T + Send + Sync>) -> Self {
        Self {
            inner: Arc::new(SelectorInner {
                source: manager.source.clone(),
                manager: Arc::downgrade(manager),
                compute,
                cache: Mutex::new(None),
                last_accessed: Mutex::new(Instant::now()),
                tracked: AtomicBool::new(false),
                recomputations: AtomicU64::new(0),
            }),
        }
    }

    /// Value for the store's current state. Computes against `Null` once the
    /// store is gone.
    pub fn get(&self) -> T {
        let state = self
            .inner
            .source
            .upgrade()
            .map(|s| s.current_state())
            .unwrap_or_default();
        self.select(&state)
    }

    /// Value for an explicit state.
    pub fn select(&self, state: &Value) -> T {
        self.touch();
        if let Some(cached) = &*self.inner.cache.lock() {
            if same_value(&cached.root, state) {
                return cached.value.clone();
            }
        }
        let value = (self.inner.compute)(state);
        self.inner.recomputations.fetch_add(1, Ordering::Relaxed);
        *self.inner.cache.lock() = Some(Cached {
            root: state.clone(),
            value: value.clone(),
        });
        value
    }

    /// How many times the selector function has run.
    pub fn recomputations(&self) -> u64 {
        self.inner.recomputations.load(Ordering::Relaxed)
    }

    /// Whether a value is cached.
    pub fn is_cached(&self) -> bool {
        self.inner.cache.lock().is_some()
    }

    fn touch(&self) {
        *self.inner.last_accessed.lock() = Instant::now();
        if !self.inner.tracked.swap(true, Ordering::SeqCst) {
            if let Some(manager) = self.inner.manager.upgrade() {
                let weak: Weak<SelectorInner<T>> = Arc::downgrade(&self.inner);
                manager.track_weak(weak);
            }
        }
    }
}

impl Selector<Value> {
    /// Use this selector as an input of a combined selector.
    pub fn as_input(&self) -> InputSelector {
        let selector = self.clone();
        Arc::new(move |state| selector.select(state))
    }
}

impl<T> fmt::Debug for Selector<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector")
            .field("recomputations", &self.inner.recomputations.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
