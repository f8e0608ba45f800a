//! Self-stopping background timers.

use crossbeam_channel::{bounded, select, tick, Sender};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

static NEXT_INTERVAL_ID: AtomicU64 = AtomicU64::new(1);

/// A named thread calling `on_tick(id)` every `period` until the callback
/// returns false, the interval is stopped, or it is dropped.
pub(crate) struct Interval {
    id: u64,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Interval {
    pub(crate) fn start<F>(name: &str, period: Duration, mut on_tick: F) -> io::Result<Self>
    where
        F: FnMut(u64) -> bool + Send + 'static,
    {
        let id = NEXT_INTERVAL_ID.fetch_add(1, Ordering::SeqCst);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new().name(name.into()).spawn(move || {
            let ticker = tick(period);
            loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    recv(ticker) -> _ => {
                        if !on_tick(id) {
                            break;
                        }
                    }
                }
            }
        })?;
        Ok(Self {
            id,
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn is_finished(&self) -> bool {
        self.handle.as_ref().map(|h| h.is_finished()).unwrap_or(true)
    }

    /// Stop and join, unless called from the interval's own thread.
    pub(crate) fn stop(mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Interval {
    fn drop(&mut self) {
        self.stop.take();
    }
}

/// Holder for at most one running [`Interval`].
///
/// Tick callbacks call [`Retire::retire`] under the slot lock when
/// their tracked set is empty, so a concurrent [`IntervalSlot::ensure`]
/// either sees the running interval or starts a fresh one.
#[derive(Default)]
pub(crate) struct IntervalSlot {
    current: Mutex<Option<Interval>>,
}

impl IntervalSlot {
    /// Start an interval unless one is already running.
    pub(crate) fn ensure<F>(&self, name: &str, period: Duration, on_tick: F) -> io::Result<bool>
    where
        F: FnMut(u64) -> bool + Send + 'static,
    {
        let mut current = self.current.lock();
        if matches!(&*current, Some(running) if !running.is_finished()) {
            return Ok(false);
        }
        *current = Some(Interval::start(name, period, on_tick)?);
        Ok(true)
    }

    /// Run `f` while holding the slot, if `id` is still the running interval.
    /// Returns `None` for a superseded interval, which should stop.
    pub(crate) fn with_current<R>(&self, id: u64, f: impl FnOnce(&mut Retire<'_>) -> R) -> Option<R> {
        let mut current = self.current.lock();
        if current.as_ref().map(|i| i.id()) != Some(id) {
            return None;
        }
        let mut retire = Retire { slot: &mut *current };
        Some(f(&mut retire))
    }

    pub(crate) fn is_running(&self) -> bool {
        matches!(&*self.current.lock(), Some(running) if !running.is_finished())
    }

    /// Stop the running interval and wait for it.
    pub(crate) fn stop(&self) {
        let taken = self.current.lock().take();
        if let Some(interval) = taken {
            interval.stop();
        }
    }
}

/// Lets a tick callback clear its own slot.
pub(crate) struct Retire<'a> {
    slot: &'a mut Option<Interval>,
}

impl Retire<'_> {
    pub(crate) fn retire(&mut self) {
        // Dropped on its own thread: disconnects without joining.
        self.slot.take();
    }
}
