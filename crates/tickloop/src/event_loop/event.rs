//! One-shot and every-step callbacks

use crate::pool::task::panic_message;
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Callback run on the loop thread
pub type EventFn = Box<dyn FnMut() -> anyhow::Result<()> + Send>;

/// A deferred callback.
///
/// Ignoring an event cancels it: the flag is checked right before execution,
/// and every-step events are dropped from the loop the next time it looks at
/// them.
pub struct Event {
    callback: Mutex<EventFn>,
    ignored: AtomicBool,
    every_step: bool,
}

/// Shared handle to an event
pub type EventHandle = Arc<Event>;

impl Event {
    pub(crate) fn new(callback: EventFn, every_step: bool) -> Self {
        Self {
            callback: Mutex::new(callback),
            ignored: AtomicBool::new(false),
            every_step,
        }
    }

    /// Cancel the event
    pub fn ignore(&self) {
        self.ignored.store(true, Ordering::Release);
    }

    /// Whether the event was cancelled
    pub fn is_ignored(&self) -> bool {
        self.ignored.load(Ordering::Acquire)
    }

    /// Whether the event runs on every step
    pub fn is_every_step(&self) -> bool {
        self.every_step
    }

    /// Run the callback. A panic is turned into an error.
    pub(crate) fn call(&self) -> anyhow::Result<()> {
        let mut callback = self.callback.lock();
        match panic::catch_unwind(AssertUnwindSafe(|| (*callback)())) {
            Ok(result) => result,
            Err(payload) => Err(anyhow::anyhow!(
                "event callback panicked: {}",
                panic_message(payload.as_ref())
            )),
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("ignored", &self.is_ignored())
            .field("every_step", &self.every_step)
            .finish()
    }
}
