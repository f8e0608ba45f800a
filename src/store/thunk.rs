//! Thunk results.

use crate::error::Result;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// A boxed, sendable future resolving to a store [`Result`].
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// What a thunk produced: a value now, or work still in flight.
///
/// The store never awaits anything itself. A pending outcome is handed back
/// to the caller, who drives it on whatever executor they use.
pub enum ThunkOutcome<T> {
    Ready(T),
    Pending(BoxFuture<T>),
}

impl<T> ThunkOutcome<T> {
    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        ThunkOutcome::Pending(Box::pin(future))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, ThunkOutcome::Pending(_))
    }

    /// Await the outcome, whichever form it has.
    pub async fn resolve(self) -> Result<T> {
        match self {
            ThunkOutcome::Ready(value) => Ok(value),
            ThunkOutcome::Pending(future) => future.await,
        }
    }

    /// The value of a ready outcome.
    pub fn ready(self) -> Option<T> {
        match self {
            ThunkOutcome::Ready(value) => Some(value),
            ThunkOutcome::Pending(_) => None,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ThunkOutcome<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThunkOutcome::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            ThunkOutcome::Pending(_) => f.write_str("Pending(..)"),
        }
    }
}
