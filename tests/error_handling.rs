//! Failure isolation: plugins, middleware, listeners, transactions, thunks.

use parking_lot::Mutex;
use serde_json::json;
use statehouse::{
    from_fn, Action, ErrorKind, Plugin, Result, Store, StoreError, ThunkOutcome, Value,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

type Reports = Arc<Mutex<Vec<(ErrorKind, Option<String>, String)>>>;

fn collecting(reports: &Reports) -> impl Fn(&StoreError) + Send + Sync + 'static {
    let reports = reports.clone();
    move |e: &StoreError| {
        let plugin = e.context().and_then(|c| c.plugin_name.clone());
        let operation = e.context().map(|c| c.operation.clone()).unwrap_or_default();
        reports.lock().push((e.kind(), plugin, operation));
    }
}

fn kinds(reports: &Reports) -> Vec<ErrorKind> {
    reports.lock().iter().map(|(kind, _, _)| *kind).collect()
}

struct Failing;

impl Plugin for Failing {
    fn name(&self) -> &str {
        "failing"
    }

    fn before_state_change(&self, _: &Value, _: &Value, _: &Action) -> Result<Option<Value>> {
        Err(StoreError::validation("rejected", statehouse::ErrorContext::new("check")))
    }

    fn on_state_change(&self, _: &Value, _: &Value, _: &Action) -> Result<()> {
        panic!("observer blew up");
    }
}

struct Counting {
    changes: Arc<AtomicUsize>,
    errors: Arc<AtomicUsize>,
}

impl Plugin for Counting {
    fn name(&self) -> &str {
        "counting"
    }

    fn on_state_change(&self, _: &Value, _: &Value, _: &Action) -> Result<()> {
        self.changes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_error(&self, _: &StoreError) -> Result<()> {
        self.errors.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// --- Plugins ---

#[test]
fn test_plugin_failures_are_isolated() {
    let reports = Reports::default();
    let changes = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicUsize::new(0));
    let store = Store::builder(json!({"n": 0}))
        .plugin(Failing)
        .plugin(Counting {
            changes: changes.clone(),
            errors: errors.clone(),
        })
        .on_error(collecting(&reports))
        .build()
        .unwrap();

    store.dispatch(json!({"n": 1}));

    // The commit went through and the healthy plugin still ran.
    assert_eq!(store.get_state()["n"].as_i64(), Some(1));
    assert_eq!(changes.load(Ordering::SeqCst), 1);

    let reported = reports.lock().clone();
    assert_eq!(reported.len(), 2);
    assert_eq!(
        reported[0],
        (ErrorKind::Validation, Some("failing".into()), "before_state_change".into())
    );
    assert_eq!(
        reported[1],
        (ErrorKind::Store, Some("failing".into()), "on_state_change".into())
    );
    // Every report reaches the plugins' error hooks too.
    assert_eq!(errors.load(Ordering::SeqCst), 2);
}

#[test]
fn test_before_state_change_can_rewrite() {
    struct Clamp;

    impl Plugin for Clamp {
        fn name(&self) -> &str {
            "clamp"
        }

        fn before_state_change(&self, next: &Value, _: &Value, _: &Action) -> Result<Option<Value>> {
            match next["n"].as_i64() {
                Some(n) if n > 10 => {
                    let mut clamped = next.clone();
                    clamped.insert("n", 10.0)?;
                    Ok(Some(clamped))
                }
                _ => Ok(None),
            }
        }
    }

    let store = Store::builder(json!({"n": 0})).plugin(Clamp).build().unwrap();
    store.dispatch(json!({"n": 50}));
    assert_eq!(store.get_state()["n"].as_i64(), Some(10));
}

// --- Middleware ---

#[test]
fn test_middleware_error_aborts_dispatch() {
    let reports = Reports::default();
    let store = Store::builder(json!({"n": 0}))
        .middleware(from_fn(|action, _, next| {
            if action.payload()["n"].as_i64() == Some(13) {
                return Err(StoreError::middleware(
                    "unlucky number",
                    statehouse::ErrorContext::new("guard"),
                ));
            }
            next.run(action)
        }))
        .on_error(collecting(&reports))
        .build()
        .unwrap();

    store.dispatch(json!({"n": 13}));
    assert_eq!(store.get_state()["n"].as_i64(), Some(0));
    store.dispatch(json!({"n": 14}));
    assert_eq!(store.get_state()["n"].as_i64(), Some(14));
    assert_eq!(kinds(&reports), vec![ErrorKind::Middleware]);
}

#[test]
fn test_middleware_panic_aborts_dispatch() {
    let reports = Reports::default();
    let store = Store::builder(json!({"n": 0}))
        .middleware_fn(|_, _, _| panic!("broken middleware"))
        .on_error(collecting(&reports))
        .build()
        .unwrap();

    store.dispatch(json!({"n": 1}));
    assert_eq!(store.get_state()["n"].as_i64(), Some(0));
    assert!(!store.can_undo());
    assert_eq!(kinds(&reports), vec![ErrorKind::Middleware]);
}

#[test]
fn test_middleware_can_rewrite_or_drop() {
    let store = Store::builder(json!({"n": 0, "log": 0}))
        .middleware_fn(|action, _, next| {
            // Drop anything touching "log".
            if action.payload().get("log").is_some() {
                return Ok(());
            }
            next.run(action)
        })
        .middleware_fn(|action, ctx, next| {
            let prev = ctx.prev_state["n"].as_i64().unwrap_or(0);
            let n = action.payload()["n"].as_i64().unwrap_or(prev);
            next.run(Action::merge(json!({"n": n * 2})))
        })
        .build()
        .unwrap();

    store.dispatch(json!({"n": 3}));
    assert_eq!(store.get_state()["n"].as_i64(), Some(6));
    store.dispatch(json!({"log": 1}));
    assert_eq!(store.get_state()["log"].as_i64(), Some(0));
    assert_eq!(store.history_len(), 2);
}

#[test]
fn test_middleware_sees_store() {
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let store = Store::builder(json!({"n": 1}))
        .middleware_fn(move |action, ctx, next| {
            let current = ctx.store.get_state()["n"].as_i64().unwrap_or(0);
            counter.store(current as usize, Ordering::SeqCst);
            next.run(action)
        })
        .build()
        .unwrap();
    store.dispatch(json!({"n": 2}));
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

// --- Listeners ---

#[test]
fn test_listener_panic_is_isolated() {
    let reports = Reports::default();
    let store = Store::builder(json!({"n": 0}))
        .on_error(collecting(&reports))
        .build()
        .unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let later = calls.clone();

    store.subscribe(|_, _, _| panic!("listener failed"));
    store.subscribe(move |_, _, _| {
        later.fetch_add(1, Ordering::SeqCst);
    });

    store.dispatch(json!({"n": 1}));
    assert_eq!(store.get_state()["n"].as_i64(), Some(1));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        reports.lock().first().map(|(k, _, op)| (*k, op.clone())),
        Some((ErrorKind::Store, "notify".to_string()))
    );
}

#[test]
fn test_panicking_error_sink_is_contained() {
    let store = Store::builder(json!({"n": 0}))
        .on_error(|_| panic!("sink failed"))
        .build()
        .unwrap();
    store.dispatch(json!(5));
    store.dispatch(json!({"n": 1}));
    assert_eq!(store.get_state()["n"].as_i64(), Some(1));
}

// --- Transactions ---

#[test]
fn test_failed_transaction_rolls_back() {
    let reports = Reports::default();
    let store = Store::builder(json!({"a": 1, "b": {"c": 2}}))
        .on_error(collecting(&reports))
        .build()
        .unwrap();
    let before = store.get_state();

    let ok = store.transaction(|draft| {
        draft.set("a", 100);
        draft.set("b.c", 200);
        Err(StoreError::validation("nope", statehouse::ErrorContext::new("recipe")))
    });
    assert!(!ok);
    assert!(statehouse::same_value(&store.get_state(), &before));

    let ok = store.transaction(|draft| {
        draft.set("a", 100);
        panic!("recipe crashed");
    });
    assert!(!ok);
    assert_eq!(store.get_state()["a"].as_i64(), Some(1));

    assert_eq!(kinds(&reports), vec![ErrorKind::Transaction, ErrorKind::Transaction]);
    assert_eq!(store.history_len(), 1);
}

// --- Thunks ---

#[test]
fn test_thunk_error_is_returned_and_reported() {
    let reports = Reports::default();
    let store = Store::builder(json!({}))
        .on_error(collecting(&reports))
        .build()
        .unwrap();

    let result = store.dispatch_thunk(|_| -> Result<ThunkOutcome<()>> {
        Err(StoreError::store("fetch failed", statehouse::ErrorContext::new("load_todos")))
    });
    let err = result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Store);
    assert_eq!(reports.lock().len(), 1);
    assert_eq!(reports.lock()[0].2, "load_todos");
}

#[tokio::test]
async fn test_pending_thunk_error_is_reported_on_resolve() {
    let reports = Reports::default();
    let store = Store::builder(json!({}))
        .on_error(collecting(&reports))
        .build()
        .unwrap();

    let outcome = store
        .dispatch_thunk(|_| {
            Ok(ThunkOutcome::<u32>::pending(async {
                Err(StoreError::store("timed out", statehouse::ErrorContext::new("remote")))
            }))
        })
        .unwrap();
    assert!(outcome.is_pending());
    assert!(reports.lock().is_empty());

    assert!(outcome.resolve().await.is_err());
    assert_eq!(kinds(&reports), vec![ErrorKind::Store]);
}

#[test]
fn test_destroyed_store_rejects_thunks() {
    let store = Store::new(json!({})).unwrap();
    store.destroy(Default::default());
    let err = store
        .dispatch_thunk(|_| Ok(ThunkOutcome::Ready(())))
        .unwrap_err();
    assert!(matches!(err, StoreError::Destroyed));
}

#[test]
fn test_error_display_names_plugin() {
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = reports.clone();
    let store = Store::builder(json!({}))
        .plugin(Failing)
        .on_error(move |e| sink.lock().push(e.to_string()))
        .build()
        .unwrap();
    store.dispatch(json!({"x": 1}));
    let first = reports.lock()[0].clone();
    assert!(first.contains("failing"), "{}", first);
    assert!(first.contains("rejected"), "{}", first);
}
