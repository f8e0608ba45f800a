//! Dependency subscriptions.

use super::manager::{ManagerShared, Selector, Sweepable};
use super::types::{EqualityFn, SelectorValue, SubscribeOptions, SubscriptionId};
use crate::action::Action;
use crate::error::{panic_message, ErrorContext, StoreError};
use crate::types::ListenerId;
use crate::value::Value;
use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

type ChangeListener<T> = Arc<dyn Fn(&T, &T) + Send + Sync>;

/// Type-erased control surface of a running subscription.
trait SubscriptionControl: Send + Sync {
    fn id(&self) -> SubscriptionId;
    fn is_active(&self) -> bool;
    fn cancel(&self) -> bool;
}

pub(crate) struct SubscriptionInner<T: SelectorValue> {
    id: SubscriptionId,
    selector: Selector<T>,
    listener: ChangeListener<T>,
    equality: EqualityFn<T>,
    last_value: Mutex<T>,
    active: AtomicBool,
    listener_id: Mutex<Option<ListenerId>>,
    manager: Weak<ManagerShared>,
    debouncer: Mutex<Option<Sender<(T, T)>>>,
}

impl<T: SelectorValue> SubscriptionInner<T> {
    pub(crate) fn start(
        manager: &Arc<ManagerShared>,
        selector: Selector<T>,
        listener: ChangeListener<T>,
        options: SubscribeOptions<T>,
    ) -> Subscription {
        let equality: EqualityFn<T> = match options.equality {
            Some(equality) => equality,
            None => Arc::new(|a: &T, b: &T| a.selector_eq(b)),
        };
        let initial = selector.get();
        let inner = Arc::new(SubscriptionInner {
            id: manager.next_subscription_id(),
            selector,
            listener,
            equality,
            last_value: Mutex::new(initial.clone()),
            active: AtomicBool::new(true),
            listener_id: Mutex::new(None),
            manager: Arc::downgrade(manager),
            debouncer: Mutex::new(None),
        });

        if manager.is_destroyed() {
            inner.active.store(false, Ordering::SeqCst);
            return Subscription { inner };
        }

        if let Some(delay) = options.debounce {
            match spawn_debouncer(Arc::downgrade(&inner), delay) {
                Ok(sender) => *inner.debouncer.lock() = Some(sender),
                Err(e) => manager.report(StoreError::store(
                    format!("failed to start debounce worker: {}", e),
                    ErrorContext::new("subscribe").with_info("subscription", inner.id.0),
                )),
            }
        }

        if let Some(source) = manager.source.upgrade() {
            let weak = Arc::downgrade(&inner);
            let id = source.add_listener(Arc::new(move |next: &Value, _: &Value, _: &Action| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_state_change(next);
                }
            }));
            *inner.listener_id.lock() = Some(id);
        }
        manager.track_strong(inner.clone());

        if options.immediate {
            inner.fire(&initial, &initial);
        }
        debug!(subscription = %inner.id, debounced = options.debounce.is_some(), "Subscribed");
        Subscription { inner }
    }

    fn on_state_change(&self, next: &Value) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        let new = self.selector.select(next);
        let old = {
            let mut last = self.last_value.lock();
            if (self.equality)(&last, &new) {
                return;
            }
            std::mem::replace(&mut *last, new.clone())
        };

        let debouncer = self.debouncer.lock().clone();
        match debouncer {
            Some(sender) => {
                // Worker gone means we were cancelled.
                let _ = sender.send((new, old));
            }
            None => self.fire(&new, &old),
        }
    }

    fn fire(&self, new: &T, old: &T) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (self.listener)(new, old))) {
            if let Some(manager) = self.manager.upgrade() {
                manager.report(StoreError::store(
                    format!("subscription listener panicked: {}", panic_message(payload.as_ref())),
                    ErrorContext::new("subscription").with_info("subscription", self.id.0),
                ));
            }
        }
    }
}

impl<T: SelectorValue> SubscriptionControl for SubscriptionInner<T> {
    fn id(&self) -> SubscriptionId {
        self.id
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn cancel(&self) -> bool {
        if !self.active.swap(false, Ordering::SeqCst) {
            return false;
        }
        // Closing the channel drops any pending debounced call.
        self.debouncer.lock().take();
        let listener_id = self.listener_id.lock().take();
        if let (Some(id), Some(manager)) = (listener_id, self.manager.upgrade()) {
            if let Some(source) = manager.source.upgrade() {
                source.remove_listener(id);
            }
        }
        debug!(subscription = %self.id, "Unsubscribed");
        true
    }
}

impl<T: SelectorValue> Sweepable for SubscriptionInner<T> {
    // Subscriptions live until unsubscribed or destroyed.
    fn idle_since(&self) -> Option<Instant> {
        None
    }

    fn is_live(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn evict(&self) {}

    fn teardown(&self) {
        self.cancel();
    }
}

/// Trailing-edge worker: waits for `delay` of quiet after the first change,
/// then delivers the latest value against the value before the burst.
fn spawn_debouncer<T: SelectorValue>(
    target: Weak<SubscriptionInner<T>>,
    delay: Duration,
) -> std::io::Result<Sender<(T, T)>> {
    let (tx, rx) = unbounded::<(T, T)>();
    thread::Builder::new()
        .name("statehouse-debounce".into())
        .spawn(move || {
            while let Ok((mut new, old)) = rx.recv() {
                loop {
                    match rx.recv_timeout(delay) {
                        Ok((latest, _)) => new = latest,
                        Err(RecvTimeoutError::Timeout) => break,
                        Err(RecvTimeoutError::Disconnected) => return,
                    }
                }
                let Some(inner) = target.upgrade() else { return };
                inner.fire(&new, &old);
            }
        })?;
    Ok(tx)
}

/// Handle to a dependency subscription.
///
/// Dropping the handle does not unsubscribe; call
/// [`unsubscribe`](Self::unsubscribe) or destroy the store.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<dyn SubscriptionControl>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.inner.id()
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    /// Stop receiving changes. Returns false if already inactive.
    pub fn unsubscribe(&self) -> bool {
        self.inner.cancel()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id())
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::selectors::SubscribeOptions;
    use crate::store::Store;
    use crate::value::Value;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_listener_fires_only_on_change() {
        let store = Store::new(json!({"a": 1, "b": 1})).unwrap();
        let seen: Arc<Mutex<Vec<(i64, i64)>>> = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let a = store.selectors().create_selector(|s| s["a"].as_i64().unwrap_or(0));
        let sub = store.selectors().subscribe_to(
            &a,
            move |new, old| log.lock().push((*new, *old)),
            SubscribeOptions::default(),
        );

        store.dispatch(json!({"b": 2}));
        store.dispatch(json!({"a": 5}));
        assert_eq!(*seen.lock(), vec![(5, 1)]);

        assert!(sub.unsubscribe());
        assert!(!sub.unsubscribe());
        store.dispatch(json!({"a": 6}));
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_immediate_fires_with_initial_pair() {
        let store = Store::new(json!({"a": 1})).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        store.selectors().subscribe_to_path(
            "a",
            move |new: &Value, old: &Value| log.lock().push((new.clone(), old.clone())),
            SubscribeOptions::default().immediate(),
        );
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, seen[0].1);
    }

    #[test]
    fn test_custom_equality_suppresses_notifications() {
        let store = Store::new(json!({"n": 1})).unwrap();
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        let n = store.selectors().create_selector(|s| s["n"].as_i64().unwrap_or(0));
        store.selectors().subscribe_to(
            &n,
            move |_, _| *c.lock() += 1,
            SubscribeOptions::default().equality(|a: &i64, b: &i64| a % 2 == b % 2),
        );
        store.dispatch(json!({"n": 3}));
        assert_eq!(*count.lock(), 0);
        store.dispatch(json!({"n": 4}));
        assert_eq!(*count.lock(), 1);
    }

    #[test]
    fn test_panicking_listener_is_reported() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let store = Store::builder(json!({"a": 1}))
            .on_error(move |e| sink.lock().push(e.to_string()))
            .build()
            .unwrap();
        store.selectors().subscribe_to_path(
            "a",
            |_: &Value, _: &Value| panic!("listener failure"),
            SubscribeOptions::default(),
        );
        store.dispatch(json!({"a": 2}));
        assert_eq!(store.get_state()["a"].as_i64(), Some(2));
        assert_eq!(errors.lock().len(), 1);
        assert!(errors.lock()[0].contains("listener failure"));
    }
}
