//! Error types for the state container.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Structured context attached to every reported error.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorContext {
    /// Operation that failed (`dispatch`, `persist`, `load`, ...).
    pub operation: String,
    /// Plugin that raised the error, if any.
    pub plugin_name: Option<String>,
    /// Free-form details.
    pub additional_info: serde_json::Map<String, serde_json::Value>,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Default::default()
        }
    }

    pub fn with_plugin(mut self, name: impl Into<String>) -> Self {
        self.plugin_name = Some(name.into());
        self
    }

    pub fn with_info(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.additional_info.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.plugin_name {
            Some(plugin) => write!(f, "{} (plugin {})", self.operation, plugin),
            None => write!(f, "{}", self.operation),
        }
    }
}

/// Broad category of a [`StoreError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Persistence,
    Sync,
    Middleware,
    Transaction,
    Store,
}

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Validation error in {context}: {message}")]
    Validation { message: String, context: ErrorContext },

    #[error("Persistence error in {context}: {message}")]
    Persistence { message: String, context: ErrorContext },

    #[error("Sync error in {context}: {message}")]
    Sync { message: String, context: ErrorContext },

    #[error("Middleware error in {context}: {message}")]
    Middleware { message: String, context: ErrorContext },

    #[error("Transaction error in {context}: {message}")]
    Transaction { message: String, context: ErrorContext },

    #[error("Store error in {context}: {message}")]
    Store { message: String, context: ErrorContext },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store has been destroyed")]
    Destroyed,
}

impl StoreError {
    pub fn validation(message: impl Into<String>, context: ErrorContext) -> Self {
        StoreError::Validation {
            message: message.into(),
            context,
        }
    }

    pub fn persistence(message: impl Into<String>, context: ErrorContext) -> Self {
        StoreError::Persistence {
            message: message.into(),
            context,
        }
    }

    pub fn sync(message: impl Into<String>, context: ErrorContext) -> Self {
        StoreError::Sync {
            message: message.into(),
            context,
        }
    }

    pub fn middleware(message: impl Into<String>, context: ErrorContext) -> Self {
        StoreError::Middleware {
            message: message.into(),
            context,
        }
    }

    pub fn transaction(message: impl Into<String>, context: ErrorContext) -> Self {
        StoreError::Transaction {
            message: message.into(),
            context,
        }
    }

    pub fn store(message: impl Into<String>, context: ErrorContext) -> Self {
        StoreError::Store {
            message: message.into(),
            context,
        }
    }

    /// Category of this error. Serialization and IO failures only ever
    /// surface through persistence, so they are reported as such.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Validation { .. } => ErrorKind::Validation,
            StoreError::Persistence { .. }
            | StoreError::Serialization(_)
            | StoreError::Deserialization(_)
            | StoreError::Io(_) => ErrorKind::Persistence,
            StoreError::Sync { .. } => ErrorKind::Sync,
            StoreError::Middleware { .. } => ErrorKind::Middleware,
            StoreError::Transaction { .. } => ErrorKind::Transaction,
            StoreError::Store { .. } | StoreError::Destroyed => ErrorKind::Store,
        }
    }

    /// Context of this error, if it carries one.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            StoreError::Validation { context, .. }
            | StoreError::Persistence { context, .. }
            | StoreError::Sync { context, .. }
            | StoreError::Middleware { context, .. }
            | StoreError::Transaction { context, .. }
            | StoreError::Store { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Re-wrap an error raised inside a plugin hook so the report names the plugin.
    pub(crate) fn in_plugin(self, plugin: &str, operation: &str) -> Self {
        let context = ErrorContext::new(operation).with_plugin(plugin);
        match self {
            StoreError::Validation { message, .. } => StoreError::Validation { message, context },
            StoreError::Persistence { message, .. } => StoreError::Persistence { message, context },
            StoreError::Sync { message, .. } => StoreError::Sync { message, context },
            StoreError::Middleware { message, .. } => StoreError::Middleware { message, context },
            StoreError::Transaction { message, .. } => StoreError::Transaction { message, context },
            other => StoreError::Store {
                message: other.to_string(),
                context,
            },
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Convert a caught panic payload into a readable message.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_context() {
        let err = StoreError::persistence(
            "quota exceeded",
            ErrorContext::new("persist").with_plugin("audit"),
        );
        let text = err.to_string();
        assert!(text.contains("quota exceeded"));
        assert!(text.contains("persist"));
        assert!(text.contains("audit"));
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            StoreError::validation("x", ErrorContext::default()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            StoreError::Serialization("x".into()).kind(),
            ErrorKind::Persistence
        );
        assert_eq!(StoreError::Destroyed.kind(), ErrorKind::Store);
    }

    #[test]
    fn test_in_plugin_keeps_kind() {
        let err = StoreError::sync("bad", ErrorContext::new("inner")).in_plugin("p", "on_cross_tab_sync");
        assert_eq!(err.kind(), ErrorKind::Sync);
        let ctx = err.context().unwrap();
        assert_eq!(ctx.plugin_name.as_deref(), Some("p"));
        assert_eq!(ctx.operation, "on_cross_tab_sync");
    }

    #[test]
    fn test_context_info() {
        let ctx = ErrorContext::new("load").with_info("key", "app");
        assert_eq!(ctx.additional_info["key"], "app");
    }
}
