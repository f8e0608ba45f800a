//! The state container.
//!
//! A [`Store`] owns one state [`Value`] and the pipeline every change goes
//! through:
//!
//! ```text
//! dispatch ─► middleware ─► before_state_change ─► apply ─► persist ─► history ─► listeners ─► on_state_change
//! ```
//!
//! Commits from different threads are serialized by a reentrant commit lock.
//! No other lock is held while user code runs, so listeners, plugins and
//! middleware may call back into the store.

mod builder;
mod registry;
mod sync;
mod thunk;

pub use builder::{StoreBuilder, StoreConfig};
pub use registry::StoreRegistry;
pub use thunk::{BoxFuture, ThunkOutcome};

use crate::action::Action;
use crate::error::{panic_message, ErrorContext, Result, StoreError};
use crate::history::{History, HistoryOperation};
use crate::middleware::{run_chain, Middleware, MiddlewareContext};
use crate::persistence::PersistenceManager;
use crate::plugins::PluginHost;
use crate::selectors::{SelectorManager, StateSource};
use crate::storage::StorageEvent;
use crate::types::{ListenerId, SessionId, StoreId};
use crate::value::{deep_equal, get_in, same_value, set_in, Draft, Path, PathSegment, Value};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use sync::SyncWorker;
use tracing::{debug, error};

/// Raw post-commit listener: `(next, prev, applied_action)`.
pub type Listener = Arc<dyn Fn(&Value, &Value, &Action) + Send + Sync>;

/// Receiver of every reported error.
pub type ErrorSink = Arc<dyn Fn(&StoreError) + Send + Sync>;

/// What [`Store::destroy`] cleans up besides listeners and selectors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DestroyOptions {
    pub clear_history: bool,
    pub remove_persisted_state: bool,
}

/// Where a commit came from. Remote commits are not written back to storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CommitOrigin {
    Local,
    Remote,
}

#[derive(Default)]
struct BatchState {
    depth: usize,
    queue: Vec<Action>,
    /// Thread running the outermost batch.
    owner: Option<ThreadId>,
}

impl BatchState {
    fn is_open_on_current_thread(&self) -> bool {
        self.depth > 0 && self.owner == Some(thread::current().id())
    }
}

pub(crate) struct StoreInner {
    id: StoreId,
    name: Option<String>,
    session_id: SessionId,
    initial_state: Value,

    state: RwLock<Value>,
    commit_lock: ReentrantMutex<()>,
    history: Mutex<History>,
    batch: Mutex<BatchState>,

    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    next_listener_id: AtomicU64,

    plugins: PluginHost,
    middleware: Vec<Arc<dyn Middleware>>,
    on_error: Option<ErrorSink>,

    persistence: Option<PersistenceManager>,
    sync_enabled: bool,
    sync_worker: Mutex<Option<SyncWorker>>,

    selectors: SelectorManager,
    registry: Option<Arc<StoreRegistry>>,
    destroyed: AtomicBool,
}

impl StoreInner {
    fn committed(&self) -> Value {
        self.state.read().clone()
    }

    /// Committed state with any queued batch actions folded in.
    fn snapshot(&self) -> Value {
        let committed = self.committed();
        let queued = {
            let batch = self.batch.lock();
            if batch.queue.is_empty() || !batch.is_open_on_current_thread() {
                return committed;
            }
            batch.queue.clone()
        };
        match Action::fold(queued) {
            Ok(Some(action)) => action
                .apply(&committed)
                .ok()
                .flatten()
                .unwrap_or(committed),
            _ => committed,
        }
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Send an error to the sink (or the log) and to every plugin.
    fn report(&self, reported: &StoreError) {
        match &self.on_error {
            Some(sink) => {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| sink(reported))) {
                    error!(panic = %panic_message(payload.as_ref()), "Error sink panicked");
                }
            }
            None => error!(store = self.name.as_deref().unwrap_or(""), error = %reported, "Store error"),
        }
        self.plugins.notify_error(reported);
    }

    fn report_all(&self, failures: Vec<StoreError>) {
        for failure in &failures {
            self.report(failure);
        }
    }

    fn add_listener(&self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::SeqCst));
        self.listeners.write().push((id, listener));
        id
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Run listeners in subscription order, then `on_state_change`.
    fn notify(&self, next: &Value, prev: &Value, action: &Action) {
        let listeners: Vec<(ListenerId, Listener)> = self.listeners.read().clone();
        for (id, listener) in listeners {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(next, prev, action))) {
                self.report(&StoreError::store(
                    format!("listener panicked: {}", panic_message(payload.as_ref())),
                    ErrorContext::new("notify").with_info("listener", id.0),
                ));
            }
        }
        let failures = self
            .plugins
            .each("on_state_change", |p| p.on_state_change(next, prev, action));
        self.report_all(failures);
    }

    /// Write `state` through `before_persist` to storage. Failures are reported.
    fn persist(&self, state: &Value) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let (to_write, failures) = self
            .plugins
            .transform("before_persist", state.clone(), |p, v| p.before_persist(v));
        self.report_all(failures);

        match persistence.write(&to_write) {
            Ok(()) => {
                let failures = self
                    .plugins
                    .each("on_persisted", |p| p.on_persisted(&to_write));
                self.report_all(failures);
            }
            Err(e) => self.report(&e),
        }
    }
}

impl StateSource for StoreInner {
    fn current_state(&self) -> Value {
        self.snapshot()
    }

    fn add_listener(&self, listener: Listener) -> ListenerId {
        StoreInner::add_listener(self, listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        StoreInner::remove_listener(self, id)
    }

    fn report_error(&self, error: &StoreError) {
        self.report(error);
    }
}

/// Handle to a state container. Cheap to clone; all clones share one store.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<StoreInner>,
}

/// Handle returned by [`Store::subscribe`].
pub struct ListenerHandle {
    id: ListenerId,
    store: Weak<StoreInner>,
}

impl ListenerHandle {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Remove the listener. Returns false if it was already gone.
    pub fn unsubscribe(self) -> bool {
        match self.store.upgrade() {
            Some(inner) => inner.remove_listener(self.id),
            None => false,
        }
    }
}

impl Store {
    /// Start building a store around `initial`.
    pub fn builder(initial: impl Into<Value>) -> StoreBuilder {
        StoreBuilder::new(initial)
    }

    /// A plain in-memory store with default options.
    pub fn new(initial: impl Into<Value>) -> Result<Self> {
        Self::builder(initial).build()
    }

    // --- Introspection ---

    pub fn id(&self) -> StoreId {
        self.inner.id
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }

    pub fn can_undo(&self) -> bool {
        self.inner.history.lock().can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.inner.history.lock().can_redo()
    }

    pub fn history_len(&self) -> usize {
        self.inner.history.lock().len()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }

    /// Names of the installed plugins, in invocation order.
    pub fn plugin_names(&self) -> Vec<String> {
        self.inner.plugins.names()
    }

    /// Backend key of the persisted snapshot, if persistence is configured.
    pub fn storage_key(&self) -> Option<&str> {
        self.inner.persistence.as_ref().map(|p| p.storage_key())
    }

    /// Memoized selectors and dependency subscriptions over this store.
    pub fn selectors(&self) -> &SelectorManager {
        &self.inner.selectors
    }

    /// Report an error through the store's error channel.
    pub fn report_error(&self, error: &StoreError) {
        self.inner.report(error);
    }

    fn ensure_alive(&self, operation: &str) -> bool {
        if self.is_destroyed() {
            self.inner.report(&StoreError::store(
                "store has been destroyed",
                ErrorContext::new(operation),
            ));
            return false;
        }
        true
    }

    // --- Reading ---

    /// Current state. Inside a batch, includes the queued changes.
    pub fn get_state(&self) -> Value {
        self.inner.snapshot()
    }

    /// Value at `path` in the current state (`Null` when missing).
    pub fn get_in(&self, path: impl Into<Path>) -> Value {
        let path = path.into();
        get_in(&self.get_state(), path.segments())
            .cloned()
            .unwrap_or_default()
    }

    // --- Dispatch ---

    /// Run `action` through the update pipeline, or queue it inside a batch.
    ///
    /// Failures are reported through the error channel, never returned.
    pub fn dispatch(&self, action: impl Into<Action>) {
        if !self.ensure_alive("dispatch") {
            return;
        }
        let action = action.into();
        {
            let mut batch = self.inner.batch.lock();
            if batch.is_open_on_current_thread() {
                batch.queue.push(action);
                return;
            }
        }
        self.run_pipeline(action);
    }

    /// Merge `partial` into the state. Same as [`dispatch`](Self::dispatch).
    pub fn set_state(&self, partial: impl Into<Action>) {
        self.dispatch(partial);
    }

    fn run_pipeline(&self, action: Action) {
        let _commit = self.inner.commit_lock.lock();

        let mut terminal = |action: Action| -> Result<()> {
            if let Err(e) = self.commit(action, CommitOrigin::Local) {
                self.inner.report(&e);
            }
            Ok(())
        };

        if self.inner.middleware.is_empty() {
            let _ = terminal(action);
            return;
        }

        let prev_state = self.inner.committed();
        let ctx = MiddlewareContext {
            prev_state: &prev_state,
            store: self,
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            run_chain(&self.inner.middleware, action, &ctx, &mut terminal)
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.inner.report(&e),
            Err(payload) => self.inner.report(&StoreError::middleware(
                format!("middleware panicked: {}", panic_message(payload.as_ref())),
                ErrorContext::new("dispatch"),
            )),
        }
    }

    /// Apply, persist, record and notify. `Ok(false)` for a no-op.
    fn commit(&self, action: Action, origin: CommitOrigin) -> Result<bool> {
        let _commit = self.inner.commit_lock.lock();
        let prev = self.inner.committed();
        let Some(next) = action.apply(&prev)? else {
            return Ok(false);
        };

        let (next, failures) = self.inner.plugins.transform("before_state_change", next, |p, v| {
            p.before_state_change(v, &prev, &action)
        });
        self.inner.report_all(failures);

        *self.inner.state.write() = next.clone();
        debug!(
            store = self.name().unwrap_or(""),
            replace = action.is_replace(),
            remote = origin == CommitOrigin::Remote,
            "Committed state"
        );

        if origin == CommitOrigin::Local {
            self.inner.persist(&next);
        }
        self.inner.history.lock().push(next.clone());
        self.inner.notify(&next, &prev, &action);
        Ok(true)
    }

    /// Call `thunk` with this store.
    ///
    /// Errors (immediate, or from a pending future once it resolves) are
    /// reported and also returned to the caller.
    pub fn dispatch_thunk<T, F>(&self, thunk: F) -> Result<ThunkOutcome<T>>
    where
        F: FnOnce(&Store) -> Result<ThunkOutcome<T>>,
        T: Send + 'static,
    {
        if self.is_destroyed() {
            return Err(StoreError::Destroyed);
        }
        match thunk(self) {
            Ok(ThunkOutcome::Ready(value)) => Ok(ThunkOutcome::Ready(value)),
            Ok(ThunkOutcome::Pending(future)) => {
                let store = self.clone();
                Ok(ThunkOutcome::pending(async move {
                    let result = future.await;
                    if let Err(e) = &result {
                        store.inner.report(e);
                    }
                    result
                }))
            }
            Err(e) => {
                self.inner.report(&e);
                Err(e)
            }
        }
    }

    // --- Structured Updates ---

    /// Replace the value at `path` with `updater(current)`.
    ///
    /// Commits only when the result is not reference-equal to the current
    /// value. Missing containers along the path are created, and everything
    /// off the path keeps its identity. Returns whether a change was dispatched.
    pub fn update_path<F>(&self, path: impl Into<Path>, updater: F) -> bool
    where
        F: FnOnce(&Value) -> Value,
    {
        if !self.ensure_alive("update_path") {
            return false;
        }
        let path = path.into();
        let state = self.get_state();
        let current = get_in(&state, path.segments()).cloned().unwrap_or_default();
        let next_value = updater(&current);
        if same_value(&current, &next_value) {
            return false;
        }

        let updated = set_in(&state, path.segments(), next_value);
        let action = match path.first() {
            Some(PathSegment::Key(key)) if state.is_object() => {
                Action::Merge(Value::from_pairs([(key.clone(), updated[key.as_str()].clone())]))
            }
            _ => Action::Replace(updated),
        };
        self.dispatch(action);
        true
    }

    /// Run `recipe` against a draft of the current state and commit what it
    /// changed.
    ///
    /// Returns `true` when the recipe succeeded, including when it changed
    /// nothing. A recipe error or panic discards the draft, is reported as a
    /// transaction error and returns `false`.
    pub fn transaction<F>(&self, recipe: F) -> bool
    where
        F: FnOnce(&mut Draft) -> Result<()>,
    {
        if !self.ensure_alive("transaction") {
            return false;
        }
        let failures = self.inner.plugins.each("on_transaction_start", |p| p.on_transaction_start());
        self.inner.report_all(failures);

        let mut draft = Draft::new(self.get_state());
        let failure = match catch_unwind(AssertUnwindSafe(|| recipe(&mut draft))) {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(payload) => Some(format!("recipe panicked: {}", panic_message(payload.as_ref()))),
        };

        let success = match failure {
            Some(message) => {
                drop(draft);
                self.inner.report(&StoreError::transaction(message, ErrorContext::new("transaction")));
                false
            }
            None => {
                if let Some(action) = draft.into_action() {
                    self.dispatch(action);
                }
                true
            }
        };

        let failures = self
            .inner
            .plugins
            .each("on_transaction_end", |p| p.on_transaction_end(success));
        self.inner.report_all(failures);
        success
    }

    /// Queue every dispatch made while `f` runs and commit them as one.
    ///
    /// Nested batches join the outermost one. Listeners see a single
    /// notification with the final state.
    ///
    /// A batch belongs to the thread that opened it and holds the commit
    /// lock until it flushes: other threads neither join it nor see its
    /// queued changes, and their commits wait for it to finish.
    pub fn batch<R, F>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _commit = self.inner.commit_lock.lock();
        let outermost = {
            let mut batch = self.inner.batch.lock();
            batch.depth += 1;
            if batch.depth == 1 {
                batch.owner = Some(thread::current().id());
            }
            batch.depth == 1
        };
        if outermost {
            let failures = self.inner.plugins.each("on_batch_start", |p| p.on_batch_start());
            self.inner.report_all(failures);
        }

        let guard = BatchGuard { inner: &self.inner };
        let result = f();
        drop(guard);

        let queued = {
            let mut batch = self.inner.batch.lock();
            batch.depth = batch.depth.saturating_sub(1);
            if batch.depth > 0 {
                return result;
            }
            batch.owner = None;
            std::mem::take(&mut batch.queue)
        };

        match Action::fold(queued.iter().cloned()) {
            Ok(Some(action)) => self.run_pipeline(action),
            Ok(None) => {}
            Err(e) => self.inner.report(&e),
        }

        let state = self.inner.committed();
        let failures = self
            .inner
            .plugins
            .each("on_batch_end", |p| p.on_batch_end(&queued, &state));
        self.inner.report_all(failures);
        result
    }

    // --- History ---

    /// Step back `steps` entries. False when there is nothing to go back to.
    pub fn undo(&self, steps: usize) -> bool {
        self.travel(HistoryOperation::Undo, steps)
    }

    /// Step forward `steps` entries. False past the newest entry.
    pub fn redo(&self, steps: usize) -> bool {
        self.travel(HistoryOperation::Redo, steps)
    }

    fn travel(&self, operation: HistoryOperation, steps: usize) -> bool {
        if !self.ensure_alive("history") {
            return false;
        }
        let _commit = self.inner.commit_lock.lock();
        let Some((index, target)) = self.inner.history.lock().target(operation, steps) else {
            return false;
        };
        let prev = self.inner.committed();

        let failures = self.inner.plugins.each("before_history_change", |p| {
            p.before_history_change(&prev, &target, operation)
        });
        self.inner.report_all(failures);

        self.inner.history.lock().move_to(index);
        self.restore(prev, target, operation);
        true
    }

    /// Swap in a state without touching history, then persist and notify.
    fn restore(&self, prev: Value, next: Value, operation: HistoryOperation) {
        *self.inner.state.write() = next.clone();
        debug!(store = self.name().unwrap_or(""), ?operation, "Restored state");
        self.inner.persist(&next);
        self.inner.notify(&next, &prev, &Action::Replace(next.clone()));
        let failures = self
            .inner
            .plugins
            .each("on_history_changed", |p| p.on_history_changed(&next, operation));
        self.inner.report_all(failures);
    }

    /// Return to the construction-time initial state and restart history.
    pub fn reset(&self) {
        if !self.ensure_alive("reset") {
            return;
        }
        let _commit = self.inner.commit_lock.lock();
        let prev = self.inner.committed();
        let initial = self.inner.initial_state.clone();
        {
            let mut history = self.inner.history.lock();
            history.clear();
            if history.is_enabled() {
                history.seed(initial.clone());
            }
        }
        self.restore(prev, initial, HistoryOperation::Reset);
    }

    // --- Listeners ---

    /// Register a raw post-commit listener.
    pub fn subscribe<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&Value, &Value, &Action) + Send + Sync + 'static,
    {
        let id = self.inner.add_listener(Arc::new(listener));
        ListenerHandle {
            id,
            store: Arc::downgrade(&self.inner),
        }
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.remove_listener(id)
    }

    // --- Cross-Tab Sync ---

    /// Whether this store reacts to storage events at all.
    pub fn syncs_across_tabs(&self) -> bool {
        self.inner.sync_enabled
    }

    /// Apply a change another session made to this store's snapshot.
    ///
    /// Ignores events for other keys, events written by this session, and
    /// states equal to the current one. Accepted states are committed
    /// without being written back. Returns whether a commit happened.
    pub fn handle_storage_event(&self, event: &StorageEvent) -> bool {
        if self.is_destroyed() || !self.inner.sync_enabled {
            return false;
        }
        let Some(persistence) = &self.inner.persistence else {
            return false;
        };
        let (remote, meta) = match persistence.decode_event(event) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => return false,
            Err(e) => {
                self.inner.report(&e);
                return false;
            }
        };
        if meta.session_id == self.session_id().as_str() {
            debug!(key = persistence.storage_key(), "Ignoring storage event from own session");
            return false;
        }

        let _commit = self.inner.commit_lock.lock();
        let current = self.inner.committed();
        let candidate = merge_over(&current, remote);
        if deep_equal(&candidate, &current) {
            debug!(key = persistence.storage_key(), "Remote state matches local state");
            return false;
        }

        let (candidate, failures) = self
            .inner
            .plugins
            .transform("on_cross_tab_sync", candidate, |p, v| {
                p.on_cross_tab_sync(v, &meta.session_id)
            });
        self.inner.report_all(failures);

        debug!(key = persistence.storage_key(), source = %meta.session_id, "Applying remote state");
        match self.commit(Action::Replace(candidate), CommitOrigin::Remote) {
            Ok(committed) => committed,
            Err(e) => {
                self.inner.report(&e);
                false
            }
        }
    }

    // --- Teardown ---

    /// Tear the store down. Later calls do nothing.
    pub fn destroy(&self, options: DestroyOptions) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let failures = self.inner.plugins.each("on_destroy", |p| p.on_destroy());
        self.inner.report_all(failures);

        self.inner.listeners.write().clear();
        self.inner.selectors.destroy_all();
        if let Some(worker) = self.inner.sync_worker.lock().take() {
            worker.stop();
        }
        if options.clear_history {
            self.inner.history.lock().clear();
        }
        if options.remove_persisted_state {
            if let Some(persistence) = &self.inner.persistence {
                persistence.remove();
            }
        }
        if let Some(registry) = &self.inner.registry {
            registry.unregister(&self.inner.session_id, self.inner.id);
        }
        debug!(store = self.name().unwrap_or(""), "Destroyed store");
    }
}

/// Shallow merge of `overlay` over `base` when both are objects; `overlay`
/// otherwise. Keys missing from a persisted or remote snapshot keep their
/// local values.
pub(crate) fn merge_over(base: &Value, overlay: Value) -> Value {
    match (base, &overlay) {
        (Value::Object(_), Value::Object(_)) => Action::Merge(overlay.clone())
            .apply(base)
            .ok()
            .flatten()
            .unwrap_or(overlay),
        _ => overlay,
    }
}

/// Resets batch bookkeeping if the batch body unwinds.
struct BatchGuard<'a> {
    inner: &'a StoreInner,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            let mut batch = self.inner.batch.lock();
            batch.depth = 0;
            batch.queue.clear();
            batch.owner = None;
        }
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("session_id", &self.inner.session_id)
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}
