//! Options and completion handling for work deferred to the pool
//!
//! The pool finalizes a deferred task on a worker thread. Its callback only
//! stashes the outcome and queues an event on the loop; the user callbacks,
//! the error disposition and the error reporting all happen on the loop
//! thread, either in that event or inline in `AsyncTimer::execute`.

use crate::error::WorkError;
use crate::event_loop::handlers::{matches, ErrorMatcher};
use crate::pool::task::{CallbackArgs, SyncKey, TaskOptions};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// What happens to a work error after an outcome callback saw it
#[derive(Debug)]
pub enum ErrorDisposition {
    /// Keep the error as is
    Propagate,
    /// Drop the error
    Ignore,
    /// Report this error instead
    Replace(anyhow::Error),
}

/// Callback invoked with the result of deferred work
pub enum Callback<T> {
    /// Called with the result on success only. Errors are never suppressed.
    Success(Box<dyn FnMut(T) -> anyhow::Result<()> + Send>),
    /// Called with the result (or the default) and the error, and decides
    /// what happens to the error.
    Outcome(
        Box<dyn FnMut(Option<T>, Option<WorkError>) -> anyhow::Result<ErrorDisposition> + Send>,
    ),
}

impl<T> Callback<T> {
    /// Success-only callback
    pub fn success<F>(f: F) -> Self
    where
        F: FnMut(T) -> anyhow::Result<()> + Send + 'static,
    {
        Callback::Success(Box::new(f))
    }

    /// Result-or-error callback
    pub fn outcome<F>(f: F) -> Self
    where
        F: FnMut(Option<T>, Option<WorkError>) -> anyhow::Result<ErrorDisposition> + Send + 'static,
    {
        Callback::Outcome(Box::new(f))
    }
}

impl<T> std::fmt::Debug for Callback<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Callback::Success(_) => f.write_str("Callback::Success"),
            Callback::Outcome(_) => f.write_str("Callback::Outcome"),
        }
    }
}

/// Hook run for every error that survives the callbacks
pub type OnError = Box<dyn FnMut(&WorkError) + Send>;

/// Options of [`EventLoop::defer`](crate::EventLoop::defer)
pub struct DeferOptions<T> {
    /// Completion callback
    pub callback: Option<Callback<T>>,
    /// Errors reported to the handlers but not queued for re-raise
    pub known_errors: Vec<ErrorMatcher>,
    /// Called with every error that survives the callback
    pub on_error: Option<OnError>,
    /// Submit the task to the pool right away
    pub queue: bool,
    /// Mutual-exclusion key of the task
    pub sync_key: Option<SyncKey>,
    /// Value handed to an outcome callback when the work fails
    pub default: Option<T>,
    /// Human readable description of the task
    pub description: Option<String>,
    /// Timeout enforced by the pool watchdog
    pub timeout: Option<Duration>,
}

impl<T> Default for DeferOptions<T> {
    fn default() -> Self {
        Self {
            callback: None,
            known_errors: Vec::new(),
            on_error: None,
            queue: true,
            sync_key: None,
            default: None,
            description: None,
            timeout: None,
        }
    }
}

impl<T> DeferOptions<T> {
    /// Set the completion callback
    pub fn callback(mut self, callback: Callback<T>) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Set a success-only callback
    pub fn on_success<F>(self, f: F) -> Self
    where
        F: FnMut(T) -> anyhow::Result<()> + Send + 'static,
    {
        self.callback(Callback::success(f))
    }

    /// Set a result-or-error callback
    pub fn on_outcome<F>(self, f: F) -> Self
    where
        F: FnMut(Option<T>, Option<WorkError>) -> anyhow::Result<ErrorDisposition> + Send + 'static,
    {
        self.callback(Callback::outcome(f))
    }

    /// Treat errors of type `E` as known
    pub fn known_error<E>(mut self) -> Self
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        self.known_errors.push(matches::<E>());
        self
    }

    /// Treat errors accepted by `matcher` as known
    pub fn known_error_if<F>(mut self, matcher: F) -> Self
    where
        F: Fn(&WorkError) -> bool + Send + Sync + 'static,
    {
        self.known_errors.push(Arc::new(matcher));
        self
    }

    /// Set the error hook
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: FnMut(&WorkError) + Send + 'static,
    {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Submit right away, or leave the task for the caller to submit
    pub fn queue(mut self, queue: bool) -> Self {
        self.queue = queue;
        self
    }

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

    /// Split into the task options and the loop-side completion handling
    pub(crate) fn split(self) -> (TaskOptions<T>, CompletionHandler<T>, bool) {
        let task_options = TaskOptions {
            sync_key: self.sync_key,
            default: self.default,
            callback: None,
            description: self.description,
            timeout: self.timeout,
        };
        let handler = CompletionHandler {
            callbacks: Mutex::new(
                self.callback
                    .into_iter()
                    .map(|callback| Arc::new(Mutex::new(callback)))
                    .collect(),
            ),
            known_errors: self.known_errors,
            on_error: self.on_error.map(Mutex::new),
            stashed: Mutex::new(VecDeque::new()),
        };
        (task_options, handler, self.queue)
    }
}

/// Options of [`EventLoop::every_with`](crate::EventLoop::every_with)
#[derive(Debug, Clone, Copy)]
pub struct EveryOptions {
    /// Start the timer right away
    pub start: bool,
    /// Fire on the first step instead of after a full period
    pub queue: bool,
}

impl Default for EveryOptions {
    fn default() -> Self {
        Self {
            start: true,
            queue: true,
        }
    }
}

/// Options of [`EventLoop::async_every`](crate::EventLoop::async_every)
#[derive(Debug, Clone, Copy)]
pub struct AsyncEveryOptions {
    /// Period between two runs
    pub period: Duration,
    /// Start the timer right away
    pub start: bool,
    /// Submit the first run right away instead of after a full period
    pub queue: bool,
}

impl AsyncEveryOptions {
    /// Started and queued, with the given period
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            start: true,
            queue: true,
        }
    }

    /// Set whether the timer starts right away
    pub fn start(mut self, start: bool) -> Self {
        self.start = start;
        self
    }

    /// Set whether the first run is submitted right away
    pub fn queue(mut self, queue: bool) -> Self {
        self.queue = queue;
        self
    }
}

/// Loop-side completion of a deferred task.
///
/// The task callback stashes each outcome here and queues an event that
/// settles it. `AsyncTimer::execute` may settle an outcome itself first, in
/// which case the queued event finds nothing to do.
pub(crate) struct CompletionHandler<T> {
    callbacks: Mutex<Vec<Arc<Mutex<Callback<T>>>>>,
    known_errors: Vec<ErrorMatcher>,
    on_error: Option<Mutex<OnError>>,
    stashed: Mutex<VecDeque<CallbackArgs<T>>>,
}

impl<T: Clone> CompletionHandler<T> {
    pub(crate) fn push(&self, callback: Callback<T>) {
        self.callbacks.lock().push(Arc::new(Mutex::new(callback)));
    }

    pub(crate) fn stash(&self, args: CallbackArgs<T>) {
        self.stashed.lock().push_back(args);
    }

    pub(crate) fn take_stashed(&self) -> Option<CallbackArgs<T>> {
        self.stashed.lock().pop_front()
    }

    /// Take the newest outcome. The events queued for older ones still find
    /// theirs, the last one finds nothing.
    pub(crate) fn take_latest(&self) -> Option<CallbackArgs<T>> {
        self.stashed.lock().pop_back()
    }

    /// Run the callbacks and the error hook on an outcome.
    ///
    /// Returns the error left over, if any, and whether it must be re-raised:
    /// known errors are only reported. A failing callback aborts the
    /// completion and its error is returned instead. No lock is held while
    /// user code runs, so callbacks may add callbacks or settle again.
    pub(crate) fn settle(
        &self,
        value: Option<T>,
        error: Option<WorkError>,
    ) -> Option<(WorkError, bool)> {
        let error = match self.apply_callbacks(value, error) {
            Ok(None) => return None,
            Ok(Some(error)) => error,
            Err(failure) => return Some((WorkError::from(failure), true)),
        };

        if let Some(on_error) = &self.on_error {
            match on_error.try_lock() {
                Some(mut on_error) => (*on_error)(&error),
                None => tracing::warn!(error = %error, "error hook re-entered, skipping it"),
            }
        }
        let known = self.known_errors.iter().any(|matcher| matcher(&error));
        Some((error, !known))
    }

    fn apply_callbacks(
        &self,
        value: Option<T>,
        error: Option<WorkError>,
    ) -> anyhow::Result<Option<WorkError>> {
        let callbacks = self.callbacks.lock().clone();
        let mut error = error;
        for callback in callbacks {
            let Some(mut callback) = callback.try_lock() else {
                tracing::warn!("completion callback re-entered, skipping it");
                continue;
            };
            match &mut *callback {
                Callback::Success(f) => {
                    if error.is_none() {
                        if let Some(value) = value.clone() {
                            f(value)?;
                        }
                    }
                }
                Callback::Outcome(f) => match f(value.clone(), error.clone())? {
                    ErrorDisposition::Propagate => {}
                    ErrorDisposition::Ignore => error = None,
                    ErrorDisposition::Replace(replacement) => {
                        error = Some(WorkError::from(replacement))
                    }
                },
            }
        }
        Ok(error)
    }
}
