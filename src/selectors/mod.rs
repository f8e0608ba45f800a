//! Memoized selectors and dependency subscriptions.
//!
//! Selectors derive values from a store's state and cache them:
//! - a single-function selector recomputes only when the state root changes;
//! - a combined selector also compares its inputs with smart equality before
//!   rerunning the projector;
//! - a parameterized selector keeps an LRU of results per parameter set,
//!   each with a sliding TTL.
//!
//! Subscriptions wrap a selector in a raw store listener and call back only
//! when the selected value changed, optionally debounced.
//!
//! The manager tracks selectors weakly and subscriptions strongly. A sweep
//! thread evicts idle selector caches; it starts with the first tracked entry
//! and stops once nothing is tracked.
//!
//! # Example
//!
//! ```ignore
//! let total = store.selectors().combine_selectors(
//!     vec![input_path("price"), input_path("qty")],
//!     |v| v[0].as_f64().unwrap_or(0.0) * v[1].as_f64().unwrap_or(0.0),
//! );
//! let sub = store.selectors().subscribe_to(&total, |new, old| {
//!     println!("total {} -> {}", old, new);
//! }, SubscribeOptions::default());
//! ```

mod interval;
mod manager;
mod parameterized;
mod subscriptions;
mod types;

pub use manager::{Selector, SelectorManager};
pub use parameterized::ParameterizedSelector;
pub use subscriptions::Subscription;
pub use types::{
    input, input_path, EqualityFn, InputSelector, SelectorConfig, SelectorValue, SubscribeOptions,
    SubscriptionId,
};

use crate::error::StoreError;
use crate::store::Listener;
use crate::types::ListenerId;
use crate::value::Value;

/// What the selector layer needs from a store.
pub trait StateSource: Send + Sync {
    /// Current state, including queued batch changes.
    fn current_state(&self) -> Value;

    fn add_listener(&self, listener: Listener) -> ListenerId;

    fn remove_listener(&self, id: ListenerId) -> bool;

    fn report_error(&self, error: &StoreError);
}
