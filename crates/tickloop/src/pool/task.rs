//! Task structure and execution state
//!
//! A task runs in three phases driven by whoever executes it: `pre_execute`
//! claims it for the current thread, `execute` runs the work and records the
//! outcome without publishing it, and `finalize` publishes the outcome and
//! invokes the completion callback. The pool calls `finalize` only after the
//! task has left its running set, so a callback may resubmit the task.

use crate::error::{PoolError, Terminated, TimedOut, WorkError};
use crate::pool::cancel::{CancelReason, CancelToken, CurrentToken};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

/// Unique identifier for a Task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    /// Generate a new unique TaskId
    pub fn new() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Mutual-exclusion domain shared by tasks and `sync` blocks.
///
/// At most one holder of a given key runs at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyncKey(KeyRepr);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum KeyRepr {
    Name(Arc<str>),
    Id(u64),
    Unique(u64),
}

static NEXT_UNIQUE_KEY: AtomicU64 = AtomicU64::new(1);

impl SyncKey {
    /// Key identified by a name
    pub fn named(name: impl AsRef<str>) -> Self {
        SyncKey(KeyRepr::Name(Arc::from(name.as_ref())))
    }

    /// Key identified by a number
    pub fn id(id: u64) -> Self {
        SyncKey(KeyRepr::Id(id))
    }

    /// Fresh key equal only to its own clones
    pub fn unique() -> Self {
        SyncKey(KeyRepr::Unique(NEXT_UNIQUE_KEY.fetch_add(1, Ordering::Relaxed)))
    }
}

impl From<&str> for SyncKey {
    fn from(name: &str) -> Self {
        SyncKey::named(name)
    }
}

impl From<String> for SyncKey {
    fn from(name: String) -> Self {
        SyncKey(KeyRepr::Name(Arc::from(name)))
    }
}

impl From<u64> for SyncKey {
    fn from(id: u64) -> Self {
        SyncKey::id(id)
    }
}

impl From<&SyncKey> for SyncKey {
    fn from(key: &SyncKey) -> Self {
        key.clone()
    }
}

/// State of a Task
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// Created or reset, not claimed by a thread yet
    Waiting,
    /// Claimed and executing
    Running,
    /// Asked to stop, still executing
    Stopping,
    /// Work returned a value
    Finished,
    /// Work stopped on a termination request
    Terminated,
    /// Work stopped after its timeout expired
    TimedOut,
    /// Work failed
    Exception,
}

impl TaskState {
    /// Whether this is a final state
    pub fn is_final(self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Terminated | TaskState::TimedOut | TaskState::Exception
        )
    }
}

/// Work closure of a task
pub type Work<T> = Box<dyn FnMut() -> anyhow::Result<T> + Send>;

/// Completion callback: (result or default, error)
pub type Completion<T> = Box<dyn FnMut(Option<T>, Option<WorkError>) -> anyhow::Result<()> + Send>;

/// What a completion callback receives: the result (or the default) and the error
pub(crate) type CallbackArgs<T> = (Option<T>, Option<WorkError>);

/// Type-erased view of a task, as seen by the pool
pub trait Job: Send + Sync {
    /// Task identifier
    fn id(&self) -> TaskId;
    /// Mutual-exclusion key, if any
    fn sync_key(&self) -> Option<&SyncKey>;
    /// Published state
    fn state(&self) -> TaskState;
    /// Human readable description
    fn description(&self) -> Option<String>;
    /// Whether a thread currently owns the task
    fn is_attached(&self) -> bool;
    /// Whether the task sits in a queue waiting for a worker
    fn is_queued(&self) -> bool;
    /// Started and no longer running
    fn is_finished(&self) -> bool;
    /// Clear the outcome of a previous run
    fn reset(&self) -> Result<(), PoolError>;
    /// Stamp the time the task entered a queue
    fn mark_queued(&self, at: Instant);
    /// When the task entered its queue
    fn queued_at(&self) -> Option<Instant>;
    /// Drop the task from its queue without running it
    fn unqueue(&self);
    /// Claim the task for the current thread
    fn pre_execute(&self);
    /// Run the work
    fn execute(&self);
    /// Publish the outcome and invoke the completion callback
    fn finalize(&self);
    /// Cooperatively stop a running task
    fn cancel(&self, reason: CancelReason) -> bool;
    /// Timeout enforced by the watchdog
    fn timeout(&self) -> Option<Duration>;
    /// Adjust the timeout
    fn set_timeout(&self, timeout: Option<Duration>);
    /// Time spent running
    fn time_elapsed(&self) -> Duration;
}

struct TaskInner<T> {
    state: TaskState,
    /// Outcome recorded by `execute`, published by `finalize`
    pending: Option<TaskState>,
    result: Option<T>,
    exception: Option<WorkError>,
    queued_at: Option<Instant>,
    started_at: Option<Instant>,
    stopped_at: Option<Instant>,
    thread: Option<ThreadId>,
    /// Completion callbacks still running for published runs
    finalizing: usize,
    timeout: Option<Duration>,
    description: Option<String>,
}

/// Options accepted when building a [`Task`]
pub struct TaskOptions<T> {
    /// Mutual-exclusion key
    pub sync_key: Option<SyncKey>,
    /// Value handed to the callback when the work fails
    pub default: Option<T>,
    /// Completion callback
    pub callback: Option<Completion<T>>,
    /// Human readable description
    pub description: Option<String>,
    /// Watchdog timeout
    pub timeout: Option<Duration>,
}

impl<T> Default for TaskOptions<T> {
    fn default() -> Self {
        Self {
            sync_key: None,
            default: None,
            callback: None,
            description: None,
            timeout: None,
        }
    }
}

impl<T> TaskOptions<T> {
    /// Set the sync key
    pub fn sync_key(mut self, key: impl Into<SyncKey>) -> Self {
        self.sync_key = Some(key.into());
        self
    }

    /// Set the value reported on failure
    pub fn default_value(mut self, value: T) -> Self {
        self.default = Some(value);
        self
    }

    /// Set the completion callback
    pub fn callback<F>(mut self, callback: F) -> Self
    where
        F: FnMut(Option<T>, Option<WorkError>) -> anyhow::Result<()> + Send + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Set the description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the watchdog timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A unit of deferred work
pub struct Task<T> {
    id: TaskId,
    sync_key: Option<SyncKey>,
    default: Mutex<Option<T>>,
    work: Mutex<Work<T>>,
    callback: Mutex<Option<Completion<T>>>,
    inner: Mutex<TaskInner<T>>,
    /// Signalled every time an outcome is published
    done: Condvar,
    token: CancelToken,
}

/// Shared handle to a task
pub type TaskHandle<T> = Arc<Task<T>>;

impl<T: Clone + Send + 'static> Task<T> {
    /// Create a task without options
    pub fn new<F>(work: F) -> Self
    where
        F: FnMut() -> anyhow::Result<T> + Send + 'static,
    {
        Self::with_options(TaskOptions::default(), work)
    }

    /// Create a task
    pub fn with_options<F>(options: TaskOptions<T>, work: F) -> Self
    where
        F: FnMut() -> anyhow::Result<T> + Send + 'static,
    {
        Self {
            id: TaskId::new(),
            sync_key: options.sync_key,
            default: Mutex::new(options.default),
            work: Mutex::new(Box::new(work)),
            callback: Mutex::new(options.callback),
            inner: Mutex::new(TaskInner {
                state: TaskState::Waiting,
                pending: None,
                result: None,
                exception: None,
                queued_at: None,
                started_at: None,
                stopped_at: None,
                thread: None,
                finalizing: 0,
                timeout: options.timeout,
                description: options.description,
            }),
            done: Condvar::new(),
            token: CancelToken::new(),
        }
    }

    /// Replace the completion callback
    pub fn set_callback<F>(&self, callback: F)
    where
        F: FnMut(Option<T>, Option<WorkError>) -> anyhow::Result<()> + Send + 'static,
    {
        *self.callback.lock() = Some(Box::new(callback));
    }

    /// Set the human readable description
    pub fn set_description(&self, description: impl Into<String>) {
        self.inner.lock().description = Some(description.into());
    }

    /// Result of the last successful run
    pub fn result(&self) -> Option<T> {
        self.inner.lock().result.clone()
    }

    /// Error of the last failed run
    pub fn exception(&self) -> Option<WorkError> {
        self.inner.lock().exception.clone()
    }

    /// Outcome of the last published run
    pub fn outcome(&self) -> Option<Result<T, WorkError>> {
        let inner = self.inner.lock();
        match inner.state {
            TaskState::Finished => inner.result.clone().map(Ok),
            TaskState::Terminated => Some(Err(inner
                .exception
                .clone()
                .unwrap_or_else(|| WorkError::new(Terminated)))),
            TaskState::TimedOut => Some(Err(inner
                .exception
                .clone()
                .unwrap_or_else(|| WorkError::new(TimedOut)))),
            TaskState::Exception => inner.exception.clone().map(Err),
            _ => None,
        }
    }

    /// When the last run started
    pub fn started_at(&self) -> Option<Instant> {
        self.inner.lock().started_at
    }

    /// When the last run stopped
    pub fn stopped_at(&self) -> Option<Instant> {
        self.inner.lock().stopped_at
    }

    /// Thread executing the task
    pub fn thread(&self) -> Option<ThreadId> {
        self.inner.lock().thread
    }

    /// Cancellation token observed by the work
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Current state
    pub fn state(&self) -> TaskState {
        self.inner.lock().state
    }

    /// Checks if the task was started
    pub fn is_started(&self) -> bool {
        self.state() != TaskState::Waiting
    }

    /// Checks if the task is running
    pub fn is_running(&self) -> bool {
        self.state() == TaskState::Running
    }

    /// Checks if the task was asked to stop and is still executing
    pub fn is_stopping(&self) -> bool {
        self.state() == TaskState::Stopping
    }

    /// Checks if the task completed successfully
    pub fn is_successful(&self) -> bool {
        self.state() == TaskState::Finished
    }

    /// Checks if the task was terminated
    pub fn is_terminated(&self) -> bool {
        self.state() == TaskState::Terminated
    }

    /// Checks if the task timed out
    pub fn is_timed_out(&self) -> bool {
        self.state() == TaskState::TimedOut
    }

    /// Checks if the work failed
    pub fn is_exception(&self) -> bool {
        self.state() == TaskState::Exception
    }

    /// Ask a running task to stop. Returns false if it was not running.
    pub fn terminate(&self) -> bool {
        self.cancel(CancelReason::Terminate)
    }

    /// Block until the current run is published and its completion callback
    /// returned. Returns the resulting state.
    pub fn wait(&self) -> TaskState {
        let mut inner = self.inner.lock();
        while Self::in_flight(&inner) {
            self.done.wait(&mut inner);
        }
        inner.state
    }

    /// Block until the current run is published, with a timeout.
    /// Returns the state observed when giving up.
    pub fn wait_timeout(&self, timeout: Duration) -> TaskState {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while Self::in_flight(&inner) {
            if self.done.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
        inner.state
    }

    /// Run the task on the calling thread without invoking its callback.
    ///
    /// Returns what the callback would have received.
    pub(crate) fn run_detached(&self) -> Option<CallbackArgs<T>> {
        self.pre_execute();
        self.execute();
        self.publish(false)
    }

    fn in_flight(inner: &TaskInner<T>) -> bool {
        inner.finalizing > 0
            || matches!(inner.state, TaskState::Running | TaskState::Stopping)
            || (inner.state == TaskState::Waiting && inner.queued_at.is_some())
    }

    fn classify(err: &anyhow::Error) -> TaskState {
        if err.is::<Terminated>() {
            TaskState::Terminated
        } else if err.is::<TimedOut>() {
            TaskState::TimedOut
        } else {
            TaskState::Exception
        }
    }

    /// Move the pending outcome into the visible state, then hand it to the
    /// callback. Without `invoke_callback` the outcome is returned instead.
    fn publish(&self, invoke_callback: bool) -> Option<CallbackArgs<T>> {
        let (value, error) = {
            let mut inner = self.inner.lock();
            let state = inner.pending.take()?;
            inner.state = state;
            inner.thread = None;
            inner.queued_at = None;
            if invoke_callback {
                inner.finalizing += 1;
            }
            let value = if state == TaskState::Finished {
                inner.result.clone()
            } else {
                self.default.lock().clone()
            };
            (value, inner.exception.clone())
        };

        if !invoke_callback {
            self.done.notify_all();
            return Some((value, error));
        }

        {
            let mut callback = self.callback.lock();
            if let Some(callback) = callback.as_mut() {
                match panic::catch_unwind(AssertUnwindSafe(|| callback(value, error))) {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tracing::error!(
                            task = %self.id,
                            error = ?err,
                            "task completion callback failed"
                        );
                    }
                    Err(payload) => {
                        tracing::error!(
                            task = %self.id,
                            panic = %panic_message(payload.as_ref()),
                            "task completion callback panicked"
                        );
                    }
                }
            }
        }
        self.inner.lock().finalizing -= 1;
        self.done.notify_all();
        None
    }
}

impl<T: Clone + Send + 'static> Job for Task<T> {
    fn id(&self) -> TaskId {
        self.id
    }

    fn sync_key(&self) -> Option<&SyncKey> {
        self.sync_key.as_ref()
    }

    fn state(&self) -> TaskState {
        Task::state(self)
    }

    fn description(&self) -> Option<String> {
        self.inner.lock().description.clone()
    }

    fn is_attached(&self) -> bool {
        self.inner.lock().thread.is_some()
    }

    fn is_queued(&self) -> bool {
        let inner = self.inner.lock();
        inner.state == TaskState::Waiting && inner.queued_at.is_some()
    }

    fn is_finished(&self) -> bool {
        self.state().is_final()
    }

    fn reset(&self) -> Result<(), PoolError> {
        let mut inner = self.inner.lock();
        let idle = inner.state.is_final() || inner.state == TaskState::Waiting;
        if !idle || inner.thread.is_some() {
            return Err(PoolError::TaskNotFinished(self.id.as_u64()));
        }
        inner.state = TaskState::Waiting;
        inner.pending = None;
        inner.result = None;
        inner.exception = None;
        inner.queued_at = None;
        inner.started_at = None;
        inner.stopped_at = None;
        self.token.clear();
        Ok(())
    }

    fn mark_queued(&self, at: Instant) {
        self.inner.lock().queued_at = Some(at);
    }

    fn queued_at(&self) -> Option<Instant> {
        self.inner.lock().queued_at
    }

    fn unqueue(&self) {
        let mut inner = self.inner.lock();
        if inner.state == TaskState::Waiting {
            inner.queued_at = None;
        }
        drop(inner);
        self.done.notify_all();
    }

    fn pre_execute(&self) {
        let mut inner = self.inner.lock();
        debug_assert_eq!(inner.state, TaskState::Waiting, "task {} claimed twice", self.id);
        inner.state = TaskState::Running;
        inner.pending = None;
        inner.started_at = Some(Instant::now());
        inner.stopped_at = None;
        inner.thread = Some(thread::current().id());
    }

    fn execute(&self) {
        let cancelled_early = {
            let inner = self.inner.lock();
            match inner.state {
                TaskState::Running => None,
                TaskState::Stopping => self.token.reason(),
                state => {
                    tracing::warn!(
                        task = %self.id,
                        ?state,
                        "execute called on a task which is not running"
                    );
                    return;
                }
            }
        };

        let outcome = match cancelled_early {
            Some(reason) => Ok(Err(reason.into_error())),
            None => {
                let _current = CurrentToken::install(self.token.clone());
                let mut work = self.work.lock();
                panic::catch_unwind(AssertUnwindSafe(|| (*work)()))
            }
        };

        let stopped_at = Instant::now();
        let mut inner = self.inner.lock();
        match outcome {
            Ok(Ok(value)) => {
                inner.result = Some(value);
                inner.exception = None;
                inner.pending = Some(TaskState::Finished);
            }
            Ok(Err(err)) => {
                inner.pending = Some(Self::classify(&err));
                inner.exception = Some(WorkError::from(err));
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(task = %self.id, panic = %message, "task work panicked");
                inner.pending = Some(TaskState::Exception);
                inner.exception = Some(WorkError::msg(format!("task panicked: {}", message)));
            }
        }
        inner.stopped_at = Some(stopped_at);
    }

    fn finalize(&self) {
        self.publish(true);
    }

    fn cancel(&self, reason: CancelReason) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != TaskState::Running {
            return false;
        }
        inner.state = TaskState::Stopping;
        self.token.cancel(reason);
        true
    }

    fn timeout(&self) -> Option<Duration> {
        self.inner.lock().timeout
    }

    fn set_timeout(&self, timeout: Option<Duration>) {
        self.inner.lock().timeout = timeout;
    }

    fn time_elapsed(&self) -> Duration {
        let inner = self.inner.lock();
        match (inner.started_at, inner.stopped_at) {
            (Some(started), Some(stopped)) => stopped.saturating_duration_since(started),
            (Some(started), None) => started.elapsed(),
            _ => Duration::ZERO,
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("sync_key", &self.sync_key)
            .field("state", &inner.state)
            .field("description", &inner.description)
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
