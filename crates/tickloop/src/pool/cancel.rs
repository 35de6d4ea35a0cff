//! Cooperative cancellation for running tasks
//!
//! A task cannot be interrupted from the outside. `Task::terminate` and the
//! watchdog flip the task's token instead, and the work observes the request
//! at its own safe points through [`checkpoint`], [`is_cancelled`] or
//! [`sleep`]. The token of the task being executed is installed in a
//! thread-local for the duration of the work closure, so these helpers need
//! no handle.

use crate::error::{Terminated, TimedOut};
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why a running task was asked to stop
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// Explicit `terminate`
    Terminate,
    /// The task ran past its timeout
    Timeout,
}

impl CancelReason {
    /// The error a work closure should return for this reason
    pub fn into_error(self) -> anyhow::Error {
        match self {
            CancelReason::Terminate => Terminated.into(),
            CancelReason::Timeout => TimedOut.into(),
        }
    }
}

struct TokenInner {
    reason: Mutex<Option<CancelReason>>,
    cond: Condvar,
}

/// Shared cancellation flag of one task
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("reason", &self.reason())
            .finish()
    }
}

impl CancelToken {
    /// A token nobody has cancelled yet
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                reason: Mutex::new(None),
                cond: Condvar::new(),
            }),
        }
    }

    /// Request cancellation. The first reason wins.
    pub fn cancel(&self, reason: CancelReason) {
        let mut current = self.inner.reason.lock();
        if current.is_none() {
            *current = Some(reason);
        }
        self.inner.cond.notify_all();
    }

    /// The pending cancellation, if any
    pub fn reason(&self) -> Option<CancelReason> {
        *self.inner.reason.lock()
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Fail with `Terminated`/`TimedOut` if cancellation was requested
    pub fn check(&self) -> anyhow::Result<()> {
        match self.reason() {
            Some(reason) => Err(reason.into_error()),
            None => Ok(()),
        }
    }

    /// Sleep for `duration`, waking early when cancelled
    pub fn sleep(&self, duration: Duration) -> anyhow::Result<()> {
        let deadline = Instant::now() + duration;
        let mut reason = self.inner.reason.lock();
        while reason.is_none() {
            if self.inner.cond.wait_until(&mut reason, deadline).timed_out() {
                break;
            }
        }
        match *reason {
            Some(reason) => Err(reason.into_error()),
            None => Ok(()),
        }
    }

    pub(crate) fn clear(&self) {
        *self.inner.reason.lock() = None;
    }
}

thread_local! {
    static CURRENT: RefCell<Option<CancelToken>> = const { RefCell::new(None) };
}

/// Installs a token as the current one until dropped
pub(crate) struct CurrentToken {
    previous: Option<CancelToken>,
}

impl CurrentToken {
    pub(crate) fn install(token: CancelToken) -> Self {
        let previous = CURRENT.with(|current| current.borrow_mut().replace(token));
        CurrentToken { previous }
    }
}

impl Drop for CurrentToken {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

/// Token of the task executing on this thread
pub fn current_token() -> Option<CancelToken> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Safe point for task work: fails if the running task was asked to stop.
///
/// Outside of a task this always succeeds.
pub fn checkpoint() -> anyhow::Result<()> {
    match current_token() {
        Some(token) => token.check(),
        None => Ok(()),
    }
}

/// Whether the task executing on this thread was asked to stop
pub fn is_cancelled() -> bool {
    current_token().is_some_and(|token| token.is_cancelled())
}

/// Sleep that honours cancellation of the current task.
///
/// Outside of a task this is a plain `thread::sleep`.
pub fn sleep(duration: Duration) -> anyhow::Result<()> {
    match current_token() {
        Some(token) => token.sleep(duration),
        None => {
            std::thread::sleep(duration);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_first_reason_wins() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel(CancelReason::Timeout);
        token.cancel(CancelReason::Terminate);
        assert_eq!(token.reason(), Some(CancelReason::Timeout));
        assert!(token.check().unwrap_err().is::<TimedOut>());
    }

    #[test]
    fn test_sleep_wakes_on_cancel() {
        let token = CancelToken::new();
        let remote = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.cancel(CancelReason::Terminate);
        });

        let start = Instant::now();
        let err = token.sleep(Duration::from_secs(5)).unwrap_err();
        assert!(err.is::<Terminated>());
        assert!(start.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();
    }

    #[test]
    fn test_checkpoint_uses_installed_token() {
        assert!(checkpoint().is_ok());
        let token = CancelToken::new();
        {
            let _guard = CurrentToken::install(token.clone());
            assert!(checkpoint().is_ok());
            token.cancel(CancelReason::Terminate);
            assert!(is_cancelled());
            assert!(checkpoint().is_err());
        }
        assert!(!is_cancelled());
        assert!(checkpoint().is_ok());
    }
}
