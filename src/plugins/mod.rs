//! Store plugins.
//!
//! A plugin observes (and for a few hooks, transforms) the store lifecycle.
//! Every hook has a no-op default. Hooks returning an error or panicking are
//! isolated: the failure is reported with the plugin's name, the remaining
//! plugins still run, and the store operation itself proceeds.
//!
//! Transform hooks return `Ok(Some(value))` to replace the value handed to
//! the next plugin, or `Ok(None)` to keep it.

mod host;
mod omit;

pub(crate) use host::PluginHost;
pub use omit::OmitPaths;

use crate::action::Action;
use crate::error::{Result, StoreError};
use crate::history::HistoryOperation;
use crate::store::Store;
use crate::value::Value;

#[allow(unused_variables)]
pub trait Plugin: Send + Sync {
    /// Name used in error reports.
    fn name(&self) -> &str;

    /// Called once the store is fully constructed and its state loaded.
    fn on_store_create(&self, store: &Store) -> Result<()> {
        Ok(())
    }

    /// Transform the state about to be committed.
    fn before_state_change(&self, next: &Value, prev: &Value, action: &Action) -> Result<Option<Value>> {
        Ok(None)
    }

    fn on_state_change(&self, next: &Value, prev: &Value, action: &Action) -> Result<()> {
        Ok(())
    }

    /// Transform the state about to be persisted. The committed state is unaffected.
    fn before_persist(&self, state: &Value) -> Result<Option<Value>> {
        Ok(None)
    }

    fn on_persisted(&self, state: &Value) -> Result<()> {
        Ok(())
    }

    /// Transform a state read from storage at construction. `initial` is the
    /// state the store was built with.
    fn on_state_loaded(&self, state: &Value, initial: &Value) -> Result<Option<Value>> {
        Ok(None)
    }

    /// Transform a state received from another session.
    fn on_cross_tab_sync(&self, remote: &Value, source_session: &str) -> Result<Option<Value>> {
        Ok(None)
    }

    fn on_batch_start(&self) -> Result<()> {
        Ok(())
    }

    /// `actions` are the queued actions, in dispatch order.
    fn on_batch_end(&self, actions: &[Action], state: &Value) -> Result<()> {
        Ok(())
    }

    fn on_transaction_start(&self) -> Result<()> {
        Ok(())
    }

    fn on_transaction_end(&self, success: bool) -> Result<()> {
        Ok(())
    }

    fn before_history_change(&self, from: &Value, to: &Value, operation: HistoryOperation) -> Result<()> {
        Ok(())
    }

    fn on_history_changed(&self, state: &Value, operation: HistoryOperation) -> Result<()> {
        Ok(())
    }

    /// Every error the store reports. Failures here are only logged.
    fn on_error(&self, error: &StoreError) -> Result<()> {
        Ok(())
    }

    fn on_destroy(&self) -> Result<()> {
        Ok(())
    }
}
