//! Interceptors run around every dispatch.
//!
//! Middleware runs in registration order. Each one receives the action and
//! a [`Next`] continuation; calling [`Next::run`] passes the (possibly
//! rewritten) action on, not calling it drops the action. Returning an
//! error or panicking aborts the dispatch without a commit.

use crate::action::Action;
use crate::error::Result;
use crate::store::Store;
use crate::value::Value;
use std::sync::Arc;

/// What a middleware can see besides the action itself.
pub struct MiddlewareContext<'a> {
    /// Committed state when the dispatch started.
    pub prev_state: &'a Value,
    pub store: &'a Store,
}

/// Continuation to the rest of the chain.
pub struct Next<'a> {
    run: &'a mut dyn FnMut(Action) -> Result<()>,
}

impl Next<'_> {
    pub fn run(self, action: Action) -> Result<()> {
        (self.run)(action)
    }
}

pub trait Middleware: Send + Sync {
    fn handle(&self, action: Action, ctx: &MiddlewareContext<'_>, next: Next<'_>) -> Result<()>;
}

/// Adapter turning a closure into a [`Middleware`].
pub struct MiddlewareFn<F>(pub F);

impl<F> Middleware for MiddlewareFn<F>
where
    F: Fn(Action, &MiddlewareContext<'_>, Next<'_>) -> Result<()> + Send + Sync,
{
    fn handle(&self, action: Action, ctx: &MiddlewareContext<'_>, next: Next<'_>) -> Result<()> {
        (self.0)(action, ctx, next)
    }
}

/// Wrap a closure as middleware.
pub fn from_fn<F>(f: F) -> MiddlewareFn<F>
where
    F: Fn(Action, &MiddlewareContext<'_>, Next<'_>) -> Result<()> + Send + Sync,
{
    MiddlewareFn(f)
}

/// Run `chain` in order, ending in `terminal`.
pub(crate) fn run_chain(
    chain: &[Arc<dyn Middleware>],
    action: Action,
    ctx: &MiddlewareContext<'_>,
    terminal: &mut dyn FnMut(Action) -> Result<()>,
) -> Result<()> {
    match chain.split_first() {
        None => terminal(action),
        Some((first, rest)) => {
            let mut continue_chain = |action: Action| run_chain(rest, action, ctx, &mut *terminal);
            first.handle(
                action,
                ctx,
                Next {
                    run: &mut continue_chain,
                },
            )
        }
    }
}
