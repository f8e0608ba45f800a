//! Selector and subscription types.

use crate::value::{get_in, smart_equal, smart_equal_all, Path, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for a [`SelectorManager`](super::SelectorManager).
#[derive(Clone, Debug)]
pub struct SelectorConfig {
    /// Idle time after which a selector's cached value is evicted.
    /// Default: 5 minutes
    pub inactive_threshold: Duration,

    /// How often the eviction sweep runs.
    /// Default: 1 minute
    pub sweep_interval: Duration,

    /// Sliding lifetime of a parameterized selector's cache entry.
    /// Default: 5 minutes
    pub param_ttl: Duration,

    /// Max cached entries per parameterized selector.
    /// Default: 256
    pub param_cache_capacity: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            inactive_threshold: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            param_ttl: Duration::from_secs(300),
            param_cache_capacity: 256,
        }
    }
}

/// A function from state to one input of a combined selector.
pub type InputSelector = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Wrap a closure as an [`InputSelector`].
pub fn input<F>(f: F) -> InputSelector
where
    F: Fn(&Value) -> Value + Send + Sync + 'static,
{
    Arc::new(f)
}

/// An [`InputSelector`] reading the value at `path` (`Null` when missing).
pub fn input_path(path: impl Into<Path>) -> InputSelector {
    let path = path.into();
    Arc::new(move |state| get_in(state, path.segments()).cloned().unwrap_or_default())
}

/// Equality used to decide whether a subscribed value changed.
pub type EqualityFn<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Values a selector can produce and a subscription can compare.
///
/// `Value` and `Vec<Value>` use smart equality; plain data uses `==`.
pub trait SelectorValue: Clone + Send + Sync + 'static {
    fn selector_eq(&self, other: &Self) -> bool;
}

impl SelectorValue for Value {
    fn selector_eq(&self, other: &Self) -> bool {
        smart_equal(self, other)
    }
}

impl SelectorValue for Vec<Value> {
    fn selector_eq(&self, other: &Self) -> bool {
        smart_equal_all(self, other)
    }
}

impl<T: SelectorValue> SelectorValue for Option<T> {
    fn selector_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Some(a), Some(b)) => a.selector_eq(b),
            (None, None) => true,
            _ => false,
        }
    }
}

macro_rules! impl_selector_value_eq {
    ($($t:ty),*) => {
        $(impl SelectorValue for $t {
            fn selector_eq(&self, other: &Self) -> bool {
                self == other
            }
        })*
    };
}

impl_selector_value_eq!(bool, i32, i64, u32, u64, usize, f64, String, ());

/// Options for a dependency subscription.
pub struct SubscribeOptions<T> {
    /// Call the listener once at subscribe time with `(initial, initial)`.
    pub immediate: bool,

    /// Change detection (None = [`SelectorValue::selector_eq`]).
    pub equality: Option<EqualityFn<T>>,

    /// Trailing-edge delay. Every change inside the window restarts it.
    pub debounce: Option<Duration>,
}

impl<T> Default for SubscribeOptions<T> {
    fn default() -> Self {
        Self {
            immediate: false,
            equality: None,
            debounce: None,
        }
    }
}

impl<T> SubscribeOptions<T> {
    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }

    pub fn equality<F>(mut self, f: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        self.equality = Some(Arc::new(f));
        self
    }

    pub fn debounce(mut self, delay: Duration) -> Self {
        self.debounce = Some(delay);
        self
    }
}

impl<T> fmt::Debug for SubscribeOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("immediate", &self.immediate)
            .field("custom_equality", &self.equality.is_some())
            .field("debounce", &self.debounce)
            .finish()
    }
}

/// Unique identifier for a dependency subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_input_path_reads_missing_as_null() {
        let state = Value::from(json!({"user": {"name": "ada"}}));
        assert_eq!(input_path("user.name")(&state).as_str(), Some("ada"));
        assert!(input_path("user.email")(&state).is_null());
    }

    #[test]
    fn test_selector_value_equality() {
        let a = Value::from(json!([1, {"x": 1}]));
        let b = Value::from(json!([1, {"x": 1}]));
        assert!(a.selector_eq(&b));
        assert!(vec![a.clone()].selector_eq(&vec![b]));
        assert!(Some(3i64).selector_eq(&Some(3)));
        assert!(!None::<i64>.selector_eq(&Some(3)));
    }
}
