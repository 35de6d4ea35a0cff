//! The event loop
//!
//! Every event, timer and completion callback runs on one designated thread,
//! the loop thread, strictly one after the other. Blocking work is handed to
//! the embedded [`ThreadPool`] and its results come back as events.
//!
//! Errors raised by callbacks never unwind through the loop machinery. They
//! are offered to the registered error handlers and, unless known, queued.
//! Queued errors are re-raised one at a time at the start and at the end of
//! every [`step`](EventLoop::step).

use crate::config::LoopConfig;
use crate::error::{LoopError, LoopResult, WorkError};
use crate::event_loop::defer::{
    AsyncEveryOptions, CompletionHandler, DeferOptions, EveryOptions,
};
use crate::event_loop::event::{Event, EventHandle};
use crate::event_loop::handlers::{matches, ErrorHandlers, ErrorMatcher, HandlerFn, HandlerId};
use crate::event_loop::timer::{AsyncTimer, Timer};
use crate::pool::task::{panic_message, SyncKey, Task};
use crate::pool::thread_pool::ThreadPool;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

struct LoopState {
    thread: ThreadId,
    events: VecDeque<EventHandle>,
    every_step: Vec<EventHandle>,
    timers: Vec<Timer>,
    errors: VecDeque<WorkError>,
    handlers: ErrorHandlers,
}

struct LoopShared {
    state: Mutex<LoopState>,
    pool: ThreadPool,
    stop: AtomicBool,
    config: LoopConfig,
}

/// Outcome of [`EventLoop::call`]
#[derive(Debug)]
pub enum Called<R> {
    /// Ran right away on the loop thread
    Inline(anyhow::Result<R>),
    /// Queued for the next step
    Queued(EventHandle),
}

impl<R> Called<R> {
    /// The inline result, if the closure ran
    pub fn into_inline(self) -> Option<anyhow::Result<R>> {
        match self {
            Called::Inline(result) => Some(result),
            Called::Queued(_) => None,
        }
    }
}

/// Something scheduled by [`EventLoop::once_after`]
#[derive(Debug, Clone)]
pub enum Scheduled {
    /// Runs on the next step
    Event(EventHandle),
    /// Single-shot timer
    Timer(Timer),
}

impl Scheduled {
    /// Cancel the scheduled callback
    pub fn cancel(&self) {
        match self {
            Scheduled::Event(event) => event.ignore(),
            Scheduled::Timer(timer) => timer.cancel(),
        }
    }
}

/// Handle to an event loop. Clones refer to the same loop.
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<LoopShared>,
}

/// Non-owning handle to an event loop
#[derive(Clone)]
pub struct WeakEventLoop {
    shared: Weak<LoopShared>,
}

impl WeakEventLoop {
    /// The loop, if it is still alive
    pub fn upgrade(&self) -> Option<EventLoop> {
        self.shared.upgrade().map(|shared| EventLoop { shared })
    }
}

impl fmt::Debug for WeakEventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakEventLoop")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}

impl EventLoop {
    /// Create a loop owned by the calling thread, with default settings
    pub fn new() -> LoopResult<Self> {
        Self::with_config(LoopConfig::default())
    }

    /// Create a loop owned by the calling thread
    pub fn with_config(config: LoopConfig) -> LoopResult<Self> {
        let pool = ThreadPool::with_config(config.pool.clone())?;
        Ok(Self {
            shared: Arc::new(LoopShared {
                state: Mutex::new(LoopState {
                    thread: thread::current().id(),
                    events: VecDeque::new(),
                    every_step: Vec::new(),
                    timers: Vec::new(),
                    errors: VecDeque::new(),
                    handlers: ErrorHandlers::default(),
                }),
                pool,
                stop: AtomicBool::new(false),
                config,
            }),
        })
    }

    /// Non-owning handle
    pub fn downgrade(&self) -> WeakEventLoop {
        WeakEventLoop {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Settings the loop was created with
    pub fn config(&self) -> &LoopConfig {
        &self.shared.config
    }

    /// The embedded thread pool
    pub fn pool(&self) -> &ThreadPool {
        &self.shared.pool
    }

    /// The loop thread
    pub fn thread(&self) -> ThreadId {
        self.shared.state.lock().thread
    }

    /// Hand the loop over to another thread
    pub fn set_thread(&self, thread: ThreadId) {
        self.shared.state.lock().thread = thread;
    }

    /// Whether the calling thread is the loop thread
    pub fn is_loop_thread(&self) -> bool {
        self.shared.state.lock().thread == thread::current().id()
    }

    /// Fail unless called from the loop thread
    pub fn validate_thread(&self, operation: &'static str) -> LoopResult<()> {
        if self.is_loop_thread() {
            Ok(())
        } else {
            Err(LoopError::WrongThread { operation })
        }
    }

    // ---------------------------------------------------------------------
    // Scheduling
    // ---------------------------------------------------------------------

    /// Run `f` on the loop thread during the next step
    pub fn once<F>(&self, f: F) -> EventHandle
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        let event = Arc::new(Event::new(Box::new(f), false));
        self.shared.state.lock().events.push_back(event.clone());
        event
    }

    /// Run `f` once after `delay`. A zero delay queues it for the next step.
    pub fn once_after<F>(&self, delay: Duration, f: F) -> LoopResult<Scheduled>
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        if delay.is_zero() {
            return Ok(Scheduled::Event(self.once(f)));
        }
        let timer = Timer::new(self, Some(delay), true, f);
        timer.start(None, false)?;
        Ok(Scheduled::Timer(timer))
    }

    /// Run `f` right away when called from the loop thread, otherwise queue it
    pub fn call<R, F>(&self, f: F) -> Called<R>
    where
        F: FnOnce() -> anyhow::Result<R> + Send + 'static,
    {
        if self.is_loop_thread() {
            return Called::Inline(f());
        }
        let mut f = Some(f);
        Called::Queued(self.once(move || match f.take() {
            Some(f) => f().map(|_| ()),
            None => Ok(()),
        }))
    }

    /// Run `f` every `period`, starting with the next step
    pub fn every<F>(&self, period: Duration, f: F) -> LoopResult<Timer>
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        self.every_with(period, EveryOptions::default(), f)
    }

    /// Run `f` every `period`
    pub fn every_with<F>(&self, period: Duration, options: EveryOptions, f: F) -> LoopResult<Timer>
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        let timer = Timer::new(self, Some(period), false, f);
        if options.start {
            timer.start(None, options.queue)?;
        }
        Ok(timer)
    }

    /// Run `f` on every step until the returned event is ignored
    pub fn every_step<F>(&self, f: F) -> EventHandle
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        let event = Arc::new(Event::new(Box::new(f), true));
        self.shared.state.lock().every_step.push(event.clone());
        event
    }

    /// Register a timer
    pub fn add_timer(&self, timer: &Timer) -> LoopResult<()> {
        let mut state = self.shared.state.lock();
        if state.timers.contains(timer) {
            return Err(LoopError::TimerAlreadyRegistered);
        }
        state.timers.push(timer.clone());
        Ok(())
    }

    /// Deregister a timer. Returns whether it was registered.
    pub fn cancel_timer(&self, timer: &Timer) -> bool {
        let mut state = self.shared.state.lock();
        let before = state.timers.len();
        state.timers.retain(|registered| registered != timer);
        state.timers.len() != before
    }

    /// Whether the timer is registered
    pub fn is_timer(&self, timer: &Timer) -> bool {
        self.shared.state.lock().timers.contains(timer)
    }

    /// Registered timers
    pub fn timers(&self) -> Vec<Timer> {
        self.shared.state.lock().timers.clone()
    }

    /// Measure the next period of every timer from `time`.
    ///
    /// Queued timers stay queued.
    pub fn reset_timers(&self, time: Instant) {
        let state = self.shared.state.lock();
        for timer in state.timers.iter().filter(|timer| timer.last_fire().is_some()) {
            timer.reset(time);
        }
    }

    // ---------------------------------------------------------------------
    // Deferred work
    // ---------------------------------------------------------------------

    /// Run `work` in the pool and deliver its outcome on the loop thread.
    ///
    /// The callback runs in an event. An error left over after the callback
    /// is passed to `on_error`, offered to the error handlers and queued for
    /// re-raise unless it is a known error.
    pub fn defer<T, F>(&self, options: DeferOptions<T>, work: F) -> LoopResult<Arc<Task<T>>>
    where
        T: Clone + Send + 'static,
        F: FnMut() -> anyhow::Result<T> + Send + 'static,
    {
        let (task_options, handler, queue) = options.split();
        let task = Arc::new(Task::with_options(task_options, work));
        self.attach_completion(&task, Arc::new(handler));
        if queue {
            self.shared.pool.push(task.clone())?;
        }
        Ok(task)
    }

    /// Run `work` in the pool and hand its result to `callback`
    pub fn async_call<T, F, C>(&self, work: F, callback: C) -> LoopResult<Arc<Task<T>>>
    where
        T: Clone + Send + 'static,
        F: FnMut() -> anyhow::Result<T> + Send + 'static,
        C: FnMut(T) -> anyhow::Result<()> + Send + 'static,
    {
        self.defer(DeferOptions::default().on_success(callback), work)
    }

    /// Same as [`defer`](Self::defer)
    pub fn async_with_options<T, F>(
        &self,
        options: DeferOptions<T>,
        work: F,
    ) -> LoopResult<Arc<Task<T>>>
    where
        T: Clone + Send + 'static,
        F: FnMut() -> anyhow::Result<T> + Send + 'static,
    {
        self.defer(options, work)
    }

    /// Run `work` in the pool every period, never overlapping with itself.
    ///
    /// The `queue` flag of `options` is ignored: submission is driven by the
    /// timer.
    pub fn async_every<T, F>(
        &self,
        work: F,
        every: AsyncEveryOptions,
        options: DeferOptions<T>,
    ) -> LoopResult<AsyncTimer<T>>
    where
        T: Clone + Send + 'static,
        F: FnMut() -> anyhow::Result<T> + Send + 'static,
    {
        let (task_options, handler, _) = options.split();
        let task = Arc::new(Task::with_options(task_options, work));
        let handler = Arc::new(handler);
        self.attach_completion(&task, handler.clone());

        let timer = AsyncTimer::new(self, every.period, task, handler);
        if every.start {
            timer.start(None, every.queue)?;
        }
        Ok(timer)
    }

    fn attach_completion<T>(&self, task: &Task<T>, handler: Arc<CompletionHandler<T>>)
    where
        T: Clone + Send + 'static,
    {
        let weak = self.downgrade();
        task.set_callback(move |value, error| {
            handler.stash((value, error));
            let Some(event_loop) = weak.upgrade() else {
                return Ok(());
            };
            let handler = handler.clone();
            let weak = weak.clone();
            event_loop.once(move || {
                let Some(event_loop) = weak.upgrade() else {
                    return Ok(());
                };
                // Already settled by `AsyncTimer::execute`
                let Some((value, error)) = handler.take_stashed() else {
                    return Ok(());
                };
                if let Some((error, reraise)) = handler.settle(value, error) {
                    event_loop.handle_error(error, reraise);
                }
                Ok(())
            });
            Ok(())
        });
    }

    /// Run `f` on the calling thread, excluding pool tasks holding `key`
    pub fn sync<K, R, F>(&self, key: K, f: F) -> R
    where
        K: Into<SyncKey>,
        F: FnOnce() -> R,
    {
        self.shared.pool.sync(key, f)
    }

    /// Like [`sync`](Self::sync), giving up after `timeout`
    pub fn sync_timeout<K, R, F>(&self, key: K, timeout: Duration, f: F) -> LoopResult<R>
    where
        K: Into<SyncKey>,
        F: FnOnce() -> R,
    {
        Ok(self.shared.pool.sync_timeout(key, timeout, f)?)
    }

    // ---------------------------------------------------------------------
    // Stepping
    // ---------------------------------------------------------------------

    /// Process one step at the current time
    pub fn step(&self) -> LoopResult<()> {
        self.step_at(Instant::now())
    }

    /// Process the queued events, the every-step events, then the timers due
    /// at `time`.
    ///
    /// The oldest queued error, if any, is returned before and after.
    pub fn step_at(&self, time: Instant) -> LoopResult<()> {
        self.validate_thread("step")?;
        let span = tracing::trace_span!("step");
        let _entered = span.enter();

        self.reraise_error()?;
        self.drain_events(false);
        self.run_every_step();
        self.fire_timers(time);
        self.reraise_error()
    }

    /// Process the queued events.
    ///
    /// Without `process_new`, events queued while draining wait for the next
    /// call. With it, draining continues until the queue is empty.
    pub fn process_events(&self, process_new: bool) -> LoopResult<()> {
        self.validate_thread("process_events")?;
        self.drain_events(process_new);
        Ok(())
    }

    /// Fire the timers due at `time`
    pub fn process_timers(&self, time: Instant) -> LoopResult<()> {
        self.validate_thread("process_timers")?;
        self.fire_timers(time);
        Ok(())
    }

    fn drain_events(&self, process_new: bool) {
        let mut remaining = if process_new {
            usize::MAX
        } else {
            self.shared.state.lock().events.len()
        };
        while remaining > 0 {
            let Some(event) = self.shared.state.lock().events.pop_front() else {
                break;
            };
            remaining -= 1;
            if event.is_ignored() {
                continue;
            }
            if let Err(err) = event.call() {
                self.handle_error(err.into(), true);
            }
        }
    }

    fn run_every_step(&self) {
        let events: Vec<EventHandle> = {
            let mut state = self.shared.state.lock();
            state.every_step.retain(|event| !event.is_ignored());
            state.every_step.clone()
        };
        for event in events {
            if event.is_ignored() {
                continue;
            }
            if let Err(err) = event.call() {
                self.handle_error(err.into(), true);
            }
        }
    }

    fn fire_timers(&self, time: Instant) {
        let due: Vec<Timer> = {
            let mut state = self.shared.state.lock();
            let mut due = Vec::new();
            state.timers.retain(|timer| {
                if !timer.is_due(time) {
                    return true;
                }
                due.push(timer.clone());
                !timer.is_single_shot()
            });
            due
        };
        for timer in due {
            if timer.is_stopped() {
                continue;
            }
            if let Err(err) = timer.call(time) {
                self.handle_error(err.into(), true);
            }
        }
    }

    /// Whether events are queued
    pub fn has_events(&self) -> bool {
        !self.shared.state.lock().events.is_empty()
    }

    /// Whether events or errors are queued, or a timer is due at `time`
    pub fn has_pending_work(&self, time: Instant) -> bool {
        let state = self.shared.state.lock();
        !state.events.is_empty()
            || !state.errors.is_empty()
            || state.timers.iter().any(|timer| timer.is_due(time))
    }

    /// Run one full cycle, then keep processing events and timers until
    /// nothing is pending.
    ///
    /// With `wait_for_threads`, blocks on the pool while it has unfinished
    /// tasks, since their completion queues new events. Queued errors end the
    /// processing so that the next step raises them. Returns true as soon as
    /// `exit_condition` holds.
    pub fn process_all_pending_work<C>(
        &self,
        time: Instant,
        wait_for_threads: bool,
        mut exit_condition: C,
    ) -> LoopResult<bool>
    where
        C: FnMut() -> bool,
    {
        self.validate_thread("process_all_pending_work")?;
        let span = tracing::trace_span!("process_all_pending_work", wait_for_threads);
        let _entered = span.enter();

        self.drain_events(false);
        self.run_every_step();
        self.fire_timers(time);

        loop {
            let generation = self.shared.pool.completion_generation();
            loop {
                if exit_condition() {
                    return Ok(true);
                }
                if self.pending_errors() > 0 {
                    return Ok(false);
                }
                if !self.has_pending_work(time) {
                    break;
                }
                self.drain_events(true);
                self.fire_timers(time);
            }

            if !wait_for_threads || !self.shared.pool.is_busy() {
                return Ok(false);
            }
            self.shared.pool.wait_for_completion(generation, None);
        }
    }

    /// Process everything, including the completions of the pool's tasks
    pub fn process_all_async_work(&self) -> LoopResult<bool> {
        self.process_all_pending_work(Instant::now(), true, || false)
    }

    /// Process pending work every `period` until `predicate` holds.
    ///
    /// Queued errors are raised as they show up. Fails with
    /// [`LoopError::WaitTimeout`] once `timeout` elapsed.
    pub fn wait_for<P>(
        &self,
        period: Option<Duration>,
        timeout: Option<Duration>,
        mut predicate: P,
    ) -> LoopResult<()>
    where
        P: FnMut() -> bool,
    {
        self.validate_thread("wait_for")?;
        let period = period.unwrap_or(self.shared.config.wait_period);
        let start = Instant::now();
        loop {
            let cycle = Instant::now();
            self.reraise_error()?;
            if self.process_all_pending_work(cycle, false, &mut predicate)? {
                return Ok(());
            }
            self.reraise_error()?;

            if let Some(timeout) = timeout {
                if start.elapsed() >= timeout {
                    return Err(LoopError::WaitTimeout { timeout });
                }
            }
            let spent = cycle.elapsed();
            if spent < period {
                thread::sleep(period - spent);
            }
        }
    }

    /// Step every `period` until [`stop`](Self::stop) is called
    pub fn exec(&self, period: Duration) -> LoopResult<()> {
        self.validate_thread("exec")?;
        self.shared.stop.store(false, Ordering::Release);
        self.reset_timers(Instant::now());
        tracing::debug!(?period, "event loop running");

        while !self.shared.stop.load(Ordering::Acquire) {
            let last_step = Instant::now();
            self.step_at(last_step)?;
            let spent = last_step.elapsed();
            if spent < period {
                thread::sleep(period - spent);
            }
        }
        tracing::debug!("event loop stopped");
        Ok(())
    }

    /// [`exec`](Self::exec) with the configured period
    pub fn run(&self) -> LoopResult<()> {
        self.exec(self.shared.config.exec_period)
    }

    /// Make [`exec`](Self::exec) return after the current step
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    /// Step every `period` while events are queued or the pool is busy, for
    /// at most `max_time`
    pub fn steps(&self, period: Duration, max_time: Option<Duration>) -> LoopResult<()> {
        self.validate_thread("steps")?;
        let start = Instant::now();
        loop {
            let last_step = Instant::now();
            self.step_at(last_step)?;

            let now = Instant::now();
            if max_time.is_some_and(|max_time| now.duration_since(start) >= max_time) {
                break;
            }
            let spent = now.duration_since(last_step);
            if spent < period && !self.has_events() {
                thread::sleep(period - spent);
            }
            if !self.has_events() && !self.shared.pool.is_busy() {
                break;
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Errors
    // ---------------------------------------------------------------------

    /// Call `f` on the loop thread for every error of type `E`
    pub fn on_error<E, F>(&self, f: F) -> HandlerId
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
        F: FnMut(&WorkError) + Send + 'static,
    {
        self.on_errors(vec![matches::<E>()], f)
    }

    /// Call `f` on the loop thread for every error accepted by `predicate`
    pub fn on_error_if<P, F>(&self, predicate: P, f: F) -> HandlerId
    where
        P: Fn(&WorkError) -> bool + Send + Sync + 'static,
        F: FnMut(&WorkError) + Send + 'static,
    {
        let matcher: ErrorMatcher = Arc::new(predicate);
        self.on_errors(vec![matcher], f)
    }

    /// Call `f` on the loop thread for every error accepted by any matcher
    pub fn on_errors<F>(&self, matchers: Vec<ErrorMatcher>, f: F) -> HandlerId
    where
        F: FnMut(&WorkError) + Send + 'static,
    {
        let handler: Box<dyn FnMut(&WorkError) + Send> = Box::new(f);
        let handler: HandlerFn = Arc::new(Mutex::new(handler));
        self.shared.state.lock().handlers.add(matchers, handler)
    }

    /// Unregister an error handler. Returns whether it was registered.
    pub fn remove_error_handler(&self, id: HandlerId) -> bool {
        self.shared.state.lock().handlers.remove(id)
    }

    /// Offer `error` to the matching handlers and, with `save`, queue it for
    /// re-raise
    pub fn handle_error(&self, error: WorkError, save: bool) {
        let handlers = {
            let mut state = self.shared.state.lock();
            if save {
                state.errors.push_back(error.clone());
            }
            state.handlers.matching(&error)
        };
        tracing::debug!(error = %error, handlers = handlers.len(), queued = save, "callback error");

        for handler in handlers {
            let error = error.clone();
            let _ = self.call(move || {
                let Some(mut handler) = handler.try_lock() else {
                    tracing::warn!(error = %error, "error handler re-entered, skipping it");
                    return Ok(());
                };
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| (*handler)(&error))) {
                    tracing::error!(
                        error = %error,
                        panic = %panic_message(payload.as_ref()),
                        "error handler panicked"
                    );
                }
                Ok(())
            });
        }
    }

    /// Raise the oldest queued error, run `f`, then raise again
    pub fn with_error_handling<R, F>(&self, f: F) -> LoopResult<R>
    where
        F: FnOnce() -> anyhow::Result<R>,
    {
        self.reraise_error()?;
        match f() {
            Ok(value) => {
                self.reraise_error()?;
                Ok(value)
            }
            Err(err) => {
                let err = WorkError::from(err);
                self.handle_error(err.clone(), true);
                self.reraise_error()?;
                // a handler cleared the queue
                Err(LoopError::Unhandled(err))
            }
        }
    }

    /// Return the oldest queued error, removing it from the queue
    pub fn reraise_error(&self) -> LoopResult<()> {
        match self.shared.state.lock().errors.pop_front() {
            Some(error) => Err(LoopError::Unhandled(error)),
            None => Ok(()),
        }
    }

    /// Number of errors waiting to be re-raised
    pub fn pending_errors(&self) -> usize {
        self.shared.state.lock().errors.len()
    }

    /// Drop the errors waiting to be re-raised
    pub fn clear_errors(&self) {
        self.shared.state.lock().errors.clear();
    }

    // ---------------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------------

    /// Tasks queued in the pool
    pub fn backlog(&self) -> usize {
        self.shared.pool.backlog()
    }

    /// Cancel every timer and event, drop queued errors and clear the pool
    pub fn clear(&self) -> LoopResult<()> {
        let (timers, events) = {
            let mut state = self.shared.state.lock();
            state.errors.clear();
            let mut events: Vec<EventHandle> = state.events.drain(..).collect();
            events.append(&mut state.every_step);
            (std::mem::take(&mut state.timers), events)
        };
        for event in events {
            event.ignore();
        }
        for timer in timers {
            timer.cancel();
        }
        self.shared.pool.clear()?;
        Ok(())
    }

    /// Shut the pool down
    pub fn shutdown(&self) {
        self.shared.pool.shutdown();
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("EventLoop")
            .field("thread", &state.thread)
            .field("events", &state.events.len())
            .field("every_step", &state.every_step.len())
            .field("timers", &state.timers.len())
            .field("errors", &state.errors.len())
            .finish()
    }
}
