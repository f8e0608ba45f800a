//! Key-value storage backends.
//!
//! The store talks to durable storage only through [`StorageAdapter`]. An
//! adapter never panics or returns errors across this boundary: failures
//! degrade to `false`, `None` or an empty key list, and the persistence layer
//! turns those into reported errors.
//!
//! Two reference backends ship with the crate:
//! - [`MemoryStorage`]: in-process map that broadcasts every change to its
//!   watchers, standing in for storage shared between tabs
//! - [`FileStorage`]: one checksummed file per key under a directory

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use crate::types::CookieOptions;
use crossbeam_channel::Receiver;

/// A change made to a storage backend, possibly by another session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageEvent {
    /// Changed key. `None` when the whole backend was cleared.
    pub key: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// Contract for a string key-value backend.
pub trait StorageAdapter: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    /// Write a value. `false` on failure (quota, unavailable backend).
    fn set(&self, key: &str, value: &str) -> bool;

    /// Write with cookie attributes. Backends without attributes ignore them.
    fn set_with_options(&self, key: &str, value: &str, _options: &CookieOptions) -> bool {
        self.set(key, value)
    }

    fn remove(&self, key: &str) -> bool;

    fn clear(&self) -> bool;

    fn keys(&self) -> Vec<String>;

    fn is_available(&self) -> bool;

    /// Channel of changes made through any handle to the same backend.
    /// `None` if the backend cannot observe changes.
    fn watch(&self) -> Option<Receiver<StorageEvent>> {
        None
    }
}
