//! Forwarding calls to a shared target through the loop
//!
//! A [`Delegator`] wraps an accessor to some target object together with the
//! options every forwarded call shares: a sync key, known errors and an error
//! hook. Each forwarded method becomes either a plain closure (usable with
//! [`EventLoop::defer`] or [`EventLoop::sync`]), a deferred task, or a
//! synchronous call excluded by the sync key.

use crate::error::{LoopResult, WorkError};
use crate::event_loop::defer::{Callback, DeferOptions};
use crate::event_loop::event_loop::EventLoop;
use crate::event_loop::handlers::{matches, ErrorMatcher};
use crate::pool::task::{SyncKey, Task};
use std::sync::Arc;

/// Resolves the target of forwarded calls
pub type Accessor<S> = Arc<dyn Fn() -> anyhow::Result<Arc<S>> + Send + Sync>;

/// Build a closure calling `method` on whatever `accessor` resolves to
pub fn forwarding_task<S, R, M>(
    accessor: Accessor<S>,
    method: M,
) -> impl FnMut() -> anyhow::Result<R> + Send + 'static
where
    S: Send + Sync + ?Sized + 'static,
    M: Fn(&S) -> anyhow::Result<R> + Send + 'static,
{
    move || {
        let target = accessor()?;
        method(target.as_ref())
    }
}

/// Like [`forwarding_task`], passing the result through `filter`
pub fn filtered_task<S, R, O, M, F>(
    accessor: Accessor<S>,
    method: M,
    filter: F,
) -> impl FnMut() -> anyhow::Result<O> + Send + 'static
where
    S: Send + Sync + ?Sized + 'static,
    M: Fn(&S) -> anyhow::Result<R> + Send + 'static,
    F: Fn(R) -> anyhow::Result<O> + Send + 'static,
{
    let mut call = forwarding_task(accessor, method);
    move || filter(call()?)
}

/// Forwards method calls on a shared target through an event loop
pub struct Delegator<S: ?Sized> {
    event_loop: EventLoop,
    accessor: Accessor<S>,
    sync_key: Option<SyncKey>,
    known_errors: Vec<ErrorMatcher>,
    on_error: Option<Arc<dyn Fn(&WorkError) + Send + Sync>>,
}

impl<S: Send + Sync + ?Sized + 'static> Delegator<S> {
    /// Delegator resolving its target through `accessor`
    pub fn new<A>(event_loop: &EventLoop, accessor: A) -> Self
    where
        A: Fn() -> anyhow::Result<Arc<S>> + Send + Sync + 'static,
    {
        Self {
            event_loop: event_loop.clone(),
            accessor: Arc::new(accessor),
            sync_key: None,
            known_errors: Vec::new(),
            on_error: None,
        }
    }

    /// Delegator for a fixed target
    pub fn for_target(event_loop: &EventLoop, target: Arc<S>) -> Self {
        Self::new(event_loop, move || Ok(target.clone()))
    }

    /// Exclude every forwarded call against pool tasks holding `key`
    pub fn sync_key(mut self, key: impl Into<SyncKey>) -> Self {
        self.sync_key = Some(key.into());
        self
    }

    /// Treat errors of type `E` as known in deferred calls
    pub fn known_error<E>(mut self) -> Self
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        self.known_errors.push(matches::<E>());
        self
    }

    /// Call `f` with every error raised by a forwarded call
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&WorkError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Plain closure forwarding to `method`
    pub fn forward<R, M>(&self, method: M) -> impl FnMut() -> anyhow::Result<R> + Send + 'static
    where
        M: Fn(&S) -> anyhow::Result<R> + Send + 'static,
    {
        forwarding_task(self.accessor.clone(), method)
    }

    fn options<T>(&self, callback: Option<Callback<T>>) -> DeferOptions<T> {
        let mut options = DeferOptions::default();
        options.callback = callback;
        options.sync_key = self.sync_key.clone();
        options.known_errors = self.known_errors.clone();
        if let Some(on_error) = self.on_error.clone() {
            options = options.on_error(move |err| on_error(err));
        }
        options
    }

    /// Run `method` in the pool, delivering the result to `callback`
    pub fn defer<R, M>(&self, method: M, callback: Option<Callback<R>>) -> LoopResult<Arc<Task<R>>>
    where
        R: Clone + Send + 'static,
        M: Fn(&S) -> anyhow::Result<R> + Send + 'static,
    {
        self.event_loop
            .defer(self.options(callback), forwarding_task(self.accessor.clone(), method))
    }

    /// Run `method` in the pool and `filter` its result before the callback
    pub fn defer_filtered<R, O, M, F>(
        &self,
        method: M,
        filter: F,
        callback: Option<Callback<O>>,
    ) -> LoopResult<Arc<Task<O>>>
    where
        O: Clone + Send + 'static,
        M: Fn(&S) -> anyhow::Result<R> + Send + 'static,
        F: Fn(R) -> anyhow::Result<O> + Send + 'static,
    {
        self.event_loop.defer(
            self.options(callback),
            filtered_task(self.accessor.clone(), method, filter),
        )
    }

    /// Run `method` on the calling thread, holding the sync key if one is set
    pub fn call<R, M>(&self, method: M) -> Result<R, WorkError>
    where
        M: Fn(&S) -> anyhow::Result<R> + Send + 'static,
    {
        let mut call = forwarding_task(self.accessor.clone(), method);
        let result = match &self.sync_key {
            Some(key) => self.event_loop.sync(key, call),
            None => call(),
        };
        result.map_err(|err| {
            let err = WorkError::from(err);
            if let Some(on_error) = &self.on_error {
                on_error(&err);
            }
            err
        })
    }
}
