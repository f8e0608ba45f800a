use super::Plugin;
use crate::error::{panic_message, ErrorContext, Result, StoreError};
use crate::value::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::error;

/// Ordered plugin list with per-plugin failure isolation.
#[derive(Default)]
pub(crate) struct PluginHost {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginHost {
    pub(crate) fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    pub(crate) fn len(&self) -> usize {
        self.plugins.len()
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name().to_string()).collect()
    }

    /// Call `hook` on every plugin, collecting failures.
    pub(crate) fn each<F>(&self, operation: &str, mut hook: F) -> Vec<StoreError>
    where
        F: FnMut(&dyn Plugin) -> Result<()>,
    {
        let mut failures = Vec::new();
        for plugin in &self.plugins {
            if let Err(e) = invoke(plugin.as_ref(), operation, |p| hook(p)) {
                failures.push(e);
            }
        }
        failures
    }

    /// Thread `value` through a transform hook on every plugin. A failing
    /// plugin's transform is skipped.
    pub(crate) fn transform<F>(&self, operation: &str, value: Value, mut hook: F) -> (Value, Vec<StoreError>)
    where
        F: FnMut(&dyn Plugin, &Value) -> Result<Option<Value>>,
    {
        let mut current = value;
        let mut failures = Vec::new();
        for plugin in &self.plugins {
            match invoke(plugin.as_ref(), operation, |p| hook(p, &current)) {
                Ok(Some(replaced)) => current = replaced,
                Ok(None) => {}
                Err(e) => failures.push(e),
            }
        }
        (current, failures)
    }

    /// Fan an error out to every plugin's `on_error`. Failures are logged.
    pub(crate) fn notify_error(&self, reported: &StoreError) {
        for plugin in &self.plugins {
            if let Err(e) = invoke(plugin.as_ref(), "on_error", |p| p.on_error(reported)) {
                error!(plugin = plugin.name(), error = %e, "Plugin failed while handling an error");
            }
        }
    }
}

fn invoke<T, F>(plugin: &dyn Plugin, operation: &str, hook: F) -> Result<T>
where
    F: FnOnce(&dyn Plugin) -> Result<T>,
{
    match catch_unwind(AssertUnwindSafe(|| hook(plugin))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.in_plugin(plugin.name(), operation)),
        Err(payload) => Err(StoreError::store(
            format!("plugin panicked: {}", panic_message(payload.as_ref())),
            ErrorContext::new(operation).with_plugin(plugin.name()),
        )),
    }
}
