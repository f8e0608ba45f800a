//! Selector and subscription behavior against a live store.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use statehouse::{
    input, input_path, DestroyOptions, SelectorConfig, Store, SubscribeOptions, Value,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn numbers() -> Store {
    Store::builder(json!({"a": 1, "b": 2, "c": 0, "user": {"name": "ada", "age": 36}}))
        .build()
        .unwrap()
}

// --- Memoization ---

#[test]
fn test_projector_runs_only_when_inputs_change() {
    let store = numbers();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let sum = store.selectors().combine_selectors(
        vec![input_path("a"), input_path("b")],
        move |inputs| {
            counter.fetch_add(1, Ordering::SeqCst);
            inputs[0].as_i64().unwrap_or(0) + inputs[1].as_i64().unwrap_or(0)
        },
    );

    assert_eq!(sum.get(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    store.dispatch(json!({"c": 5}));
    assert_eq!(sum.get(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    store.dispatch(json!({"a": 10}));
    assert_eq!(sum.get(), 12);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_selectors_compose() {
    let store = numbers();
    let user = store.selectors().create_selector(|s| s["user"].clone());
    let greeting = store.selectors().combine_selectors(
        vec![user.as_input(), input(|s| s["a"].clone())],
        |inputs| format!("{} #{}", inputs[0]["name"].as_str().unwrap_or("?"), inputs[1].as_i64().unwrap_or(0)),
    );
    assert_eq!(greeting.get(), "ada #1");

    store.update_path("user.name", |_| Value::from("grace"));
    assert_eq!(greeting.get(), "grace #1");
    assert_eq!(greeting.recomputations(), 2);
}

#[test]
fn test_select_against_explicit_state() {
    let store = numbers();
    let a = store.selectors().create_selector(|s| s["a"].as_i64());
    let other = Value::from(json!({"a": 99}));
    assert_eq!(a.select(&other), Some(99));
    assert_eq!(a.get(), Some(1));
}

#[derive(Serialize)]
struct Page {
    offset: usize,
    size: usize,
}

#[test]
fn test_parameterized_selector_caches_per_params() {
    let store = Store::builder(json!({"items": [1, 2, 3, 4, 5], "other": 0}))
        .build()
        .unwrap();
    let page = store.selectors().create_parameterized_selector(
        vec![input_path("items")],
        |p: &Page, inputs| {
            inputs[0]
                .as_array()
                .map(|items| items.iter().skip(p.offset).take(p.size).cloned().collect::<Vec<_>>())
                .unwrap_or_default()
        },
    );

    let first = Page { offset: 0, size: 2 };
    let second = Page { offset: 2, size: 2 };
    assert_eq!(page.get(&first).len(), 2);
    assert_eq!(page.get(&second)[0].as_i64(), Some(3));
    assert_eq!(page.recomputations(), 2);

    store.dispatch(json!({"other": 1}));
    page.get(&first);
    assert_eq!(page.recomputations(), 2);

    store.update_path("items.0", |_| Value::from(100));
    assert_eq!(page.get(&first)[0].as_i64(), Some(100));
    assert_eq!(page.recomputations(), 3);

    page.clear();
    assert_eq!(page.cache_len(), 0);
}

// --- Subscriptions ---

#[test]
fn test_subscribe_to_selector() {
    let store = numbers();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let a = store.selectors().create_selector(|s| s["a"].as_i64().unwrap_or(0));
    let sub = store.selectors().subscribe_to(
        &a,
        move |new, old| log.lock().push((*new, *old)),
        SubscribeOptions::default(),
    );

    store.dispatch(json!({"b": 7}));
    store.dispatch(json!({"a": 2}));
    store.dispatch(json!({"a": 3}));
    assert_eq!(*seen.lock(), vec![(2, 1), (3, 2)]);

    assert!(sub.unsubscribe());
    assert!(!sub.is_active());
    store.dispatch(json!({"a": 4}));
    assert_eq!(seen.lock().len(), 2);
    assert!(!sub.unsubscribe());
}

#[test]
fn test_subscribe_to_path() {
    let store = numbers();
    let names = Arc::new(Mutex::new(Vec::new()));
    let log = names.clone();
    let _sub = store.selectors().subscribe_to_path(
        "user.name",
        move |new, _| log.lock().push(new.as_str().unwrap_or_default().to_string()),
        SubscribeOptions::default().immediate(),
    );

    store.update_path("user.age", |_| Value::from(37));
    store.update_path("user.name", |_| Value::from("grace"));
    assert_eq!(*names.lock(), vec!["ada".to_string(), "grace".to_string()]);
}

#[test]
fn test_subscribe_to_many_fires_once_per_change() {
    let store = numbers();
    let a = store.selectors().create_selector(|s| s["a"].clone());
    let b = store.selectors().create_selector(|s| s["b"].clone());
    let calls = Arc::new(Mutex::new(Vec::new()));
    let log = calls.clone();
    let _sub = store.selectors().subscribe_to_many(
        vec![a, b],
        move |new, old| {
            let pair = |values: &[Value]| {
                values.iter().map(|v| v.as_i64().unwrap_or(0)).collect::<Vec<_>>()
            };
            log.lock().push((pair(new), pair(old)));
        },
        SubscribeOptions::default(),
    );

    store.dispatch(json!({"a": 5, "b": 6}));
    store.dispatch(json!({"c": 1}));
    assert_eq!(*calls.lock(), vec![(vec![5, 6], vec![1, 2])]);
}

#[test]
fn test_debounced_subscription_fires_once_after_burst() {
    let store = Store::builder(json!({"count": 0})).build().unwrap();
    let fired = Arc::new(Mutex::new(Vec::new()));
    let log = fired.clone();
    let _sub = store.selectors().subscribe_to_path(
        "count",
        move |new, old| {
            log.lock()
                .push((new.as_i64().unwrap_or(-1), old.as_i64().unwrap_or(-1)))
        },
        SubscribeOptions::default().debounce(Duration::from_millis(50)),
    );

    for n in 1..=3 {
        store.dispatch(json!({ "count": n }));
    }
    assert!(wait_until(|| !fired.lock().is_empty()));
    std::thread::sleep(Duration::from_millis(120));
    assert_eq!(*fired.lock(), vec![(3, 0)]);
}

#[test]
fn test_subscriptions_survive_sweeps() {
    let store = Store::builder(json!({"n": 0}))
        .selector_config(SelectorConfig {
            inactive_threshold: Duration::ZERO,
            ..Default::default()
        })
        .build()
        .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let n = store.selectors().create_selector(|s| s["n"].clone());
    let sub = store.selectors().subscribe_to(
        &n,
        move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        },
        SubscribeOptions::default(),
    );

    std::thread::sleep(Duration::from_millis(5));
    store.selectors().cleanup_selectors();
    assert!(sub.is_active());
    store.dispatch(json!({"n": 1}));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_destroy_tears_down_subscriptions() {
    let store = numbers();
    let a = store.selectors().create_selector(|s| s["a"].clone());
    let sub = store
        .selectors()
        .subscribe_to(&a, |_, _| {}, SubscribeOptions::default());
    assert!(store.selectors().is_sweeping());
    let listeners = store.listener_count();
    assert!(listeners >= 1);

    store.destroy(DestroyOptions::default());
    assert!(!sub.is_active());
    assert!(!store.selectors().is_sweeping());
    assert_eq!(store.selectors().tracked_count(), 0);

    let late = store
        .selectors()
        .subscribe_to(&a, |_, _| {}, SubscribeOptions::default());
    assert!(!late.is_active());
}

#[test]
fn test_subscription_ids_are_distinct() {
    let store = numbers();
    let a = store.selectors().create_selector(|s| s["a"].clone());
    let first = store.selectors().subscribe_to(&a, |_, _| {}, SubscribeOptions::default());
    let second = store.selectors().subscribe_to(&a, |_, _| {}, SubscribeOptions::default());
    assert_ne!(first.id(), second.id());
    assert!(first.id().to_string().starts_with("sub-"));
}
