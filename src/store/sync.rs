//! Background forwarding of storage change events.

use super::{Store, StoreInner};
use crate::storage::StorageEvent;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::io;
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use tracing::debug;

/// Thread feeding a watched backend's events into one store.
///
/// The thread holds only a weak reference and exits when the store is gone,
/// when the event channel closes, or when the worker is stopped or dropped.
pub(crate) struct SyncWorker {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl SyncWorker {
    pub(crate) fn spawn(store: Weak<StoreInner>, events: Receiver<StorageEvent>) -> io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("statehouse-sync".into())
            .spawn(move || loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    recv(events) -> message => {
                        let Ok(event) = message else { break };
                        let Some(inner) = store.upgrade() else { break };
                        Store { inner }.handle_storage_event(&event);
                    }
                }
            })?;
        debug!("Started cross-tab sync listener");
        Ok(Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it, unless called from the thread itself.
    pub(crate) fn stop(mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for SyncWorker {
    fn drop(&mut self) {
        // Dropping the sender disconnects the stop channel.
        self.stop.take();
    }
}
