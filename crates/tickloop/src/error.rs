//! Error types for the thread pool and the event loop

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Errors raised synchronously by the thread pool
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool is shutting down and refuses new work
    #[error("thread pool is shutting down")]
    ShuttingDown,

    /// The task is attached to a running worker
    #[error("task {0} is currently running")]
    TaskRunning(u64),

    /// The task already sits in the queue
    #[error("task {0} is already queued")]
    AlreadyQueued(u64),

    /// Reset was requested on a task that is neither finished nor fresh
    #[error("cannot reset task {0} which is not finished")]
    TaskNotFinished(u64),

    /// A sync key could not be acquired in time
    #[error("sync key could not be acquired within {timeout:?}")]
    SyncTimeout {
        /// How long the caller waited
        timeout: Duration,
    },

    /// Thread bounds do not make sense
    #[error("invalid thread bounds: min {min} > max {max} or max is zero")]
    InvalidBounds {
        /// Requested minimum
        min: usize,
        /// Requested maximum
        max: usize,
    },

    /// The OS refused to spawn a worker thread
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Errors raised by the event loop
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    /// A structural operation was invoked off the loop thread
    #[error("{operation} must be called from the event loop thread")]
    WrongThread {
        /// The offending operation
        operation: &'static str,
    },

    /// The timer is already registered with the loop
    #[error("timer is already registered with the event loop")]
    TimerAlreadyRegistered,

    /// Neither the call nor the timer provides a period
    #[error("no period is given for the timer")]
    MissingPeriod,

    /// The event loop this handle points to is gone
    #[error("event loop has been dropped")]
    Detached,

    /// `wait_for` gave up
    #[error("condition not reached within {timeout:?}")]
    WaitTimeout {
        /// The timeout that elapsed
        timeout: Duration,
    },

    /// Pool failure surfaced through the loop
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Work or callback failure re-raised at a step boundary
    #[error(transparent)]
    Unhandled(#[from] WorkError),
}

impl LoopError {
    /// The re-raised work error, if this is one
    pub fn as_work_error(&self) -> Option<&WorkError> {
        match self {
            LoopError::Unhandled(err) => Some(err),
            _ => None,
        }
    }
}

/// Result alias for loop operations
pub type LoopResult<T> = Result<T, LoopError>;

/// Failure captured from user work or a user callback.
///
/// Clones share the same underlying error, so the same failure can be handed
/// to a task's callback, to the registered error handlers and to the loop's
/// pending-error queue.
#[derive(Clone)]
pub struct WorkError(Arc<anyhow::Error>);

impl WorkError {
    /// Wrap any error
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        WorkError(Arc::new(err.into()))
    }

    /// Build from a plain message
    pub fn msg(message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        WorkError(Arc::new(anyhow::Error::msg(message)))
    }

    /// Whether the underlying error is of type `E`
    pub fn is<E>(&self) -> bool
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.is::<E>()
    }

    /// Downcast the underlying error
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// The wrapped anyhow error
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    /// Backtrace captured when the error was created
    pub fn backtrace(&self) -> &std::backtrace::Backtrace {
        self.0.backtrace()
    }

    /// Whether two handles point at the same failure
    pub fn ptr_eq(&self, other: &WorkError) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<anyhow::Error> for WorkError {
    fn from(err: anyhow::Error) -> Self {
        WorkError(Arc::new(err))
    }
}

impl fmt::Display for WorkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl fmt::Debug for WorkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl std::error::Error for WorkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// Returned by work that observed a termination request
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("task was terminated")]
pub struct Terminated;

/// Returned by work that observed its timeout expiring
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("task timed out")]
pub struct TimedOut;
