//! Periodic and single-shot timers
//!
//! A timer is due once strictly more than its period has elapsed since it
//! last fired. A timer without a last fire time is always due, which is how
//! `queue` forces it to fire on the next step.

use crate::error::{LoopError, LoopResult, PoolError};
use crate::event_loop::defer::{Callback, CompletionHandler};
use crate::event_loop::event::EventFn;
use crate::event_loop::event_loop::{EventLoop, WeakEventLoop};
use crate::pool::task::{panic_message, Job, Task};
use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use std::fmt;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

enum TimerKind {
    /// Runs a callback on the loop thread
    Callback(Mutex<EventFn>),
    /// Resubmits a task to the pool once the previous run finished
    Task(Arc<dyn Job>),
}

struct TimerInner {
    period: AtomicCell<Option<Duration>>,
    last_fire: AtomicCell<Option<Instant>>,
    single_shot: AtomicBool,
    stopped: AtomicBool,
    kind: TimerKind,
    event_loop: WeakEventLoop,
}

/// Handle to a timer. Clones refer to the same timer.
#[derive(Clone)]
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Timer {}

impl Timer {
    /// Create a detached timer. Nothing happens until [`start`](Self::start).
    pub fn new<F>(
        event_loop: &EventLoop,
        period: Option<Duration>,
        single_shot: bool,
        callback: F,
    ) -> Self
    where
        F: FnMut() -> anyhow::Result<()> + Send + 'static,
    {
        let callback: EventFn = Box::new(callback);
        Self::with_kind(event_loop, period, single_shot, TimerKind::Callback(Mutex::new(callback)))
    }

    fn with_kind(
        event_loop: &EventLoop,
        period: Option<Duration>,
        single_shot: bool,
        kind: TimerKind,
    ) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                period: AtomicCell::new(period),
                last_fire: AtomicCell::new(Some(Instant::now())),
                single_shot: AtomicBool::new(single_shot),
                stopped: AtomicBool::new(false),
                kind,
                event_loop: event_loop.downgrade(),
            }),
        }
    }

    fn event_loop(&self) -> LoopResult<EventLoop> {
        self.inner.event_loop.upgrade().ok_or(LoopError::Detached)
    }

    /// Register the timer with its loop.
    ///
    /// Any previous registration is cancelled first. `period` overrides the
    /// period given at construction. With `instantly` the timer is queued
    /// right away instead of waiting a full period.
    pub fn start(&self, period: Option<Duration>, instantly: bool) -> LoopResult<()> {
        self.start_at(period, instantly, Instant::now())
    }

    /// Like [`start`](Self::start), measuring the first period from `time`
    pub fn start_at(
        &self,
        period: Option<Duration>,
        instantly: bool,
        time: Instant,
    ) -> LoopResult<()> {
        self.cancel();
        self.inner.stopped.store(false, Ordering::Release);
        if let Some(period) = period {
            self.inner.period.store(Some(period));
        }
        if self.inner.period.load().is_none() {
            return Err(LoopError::MissingPeriod);
        }
        self.inner.last_fire.store(Some(time));

        let event_loop = self.event_loop()?;
        event_loop.add_timer(self)?;
        if instantly {
            self.queue()?;
        }
        tracing::trace!(
            period = ?self.period(),
            single_shot = self.is_single_shot(),
            "timer started"
        );
        Ok(())
    }

    /// Deregister the timer. Does nothing if it is not running.
    pub fn cancel(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        if let Some(event_loop) = self.inner.event_loop.upgrade() {
            event_loop.cancel_timer(self);
        }
    }

    /// Whether the timer is registered with its loop
    pub fn is_running(&self) -> bool {
        self.inner
            .event_loop
            .upgrade()
            .is_some_and(|event_loop| event_loop.is_timer(self))
    }

    /// Whether the timer was cancelled
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Whether the timer fires only once
    pub fn is_single_shot(&self) -> bool {
        self.inner.single_shot.load(Ordering::Acquire)
    }

    /// Make the timer fire only once, or periodically
    pub fn set_single_shot(&self, single_shot: bool) {
        self.inner.single_shot.store(single_shot, Ordering::Release);
    }

    /// Current period
    pub fn period(&self) -> Option<Duration> {
        self.inner.period.load()
    }

    /// Change the period
    pub fn set_period(&self, period: Duration) {
        self.inner.period.store(Some(period));
    }

    /// When the timer last fired, `None` when it is queued
    pub fn last_fire(&self) -> Option<Instant> {
        self.inner.last_fire.load()
    }

    /// Whether the timer should fire at `time`
    pub fn is_due(&self, time: Instant) -> bool {
        if self.is_stopped() {
            return false;
        }
        let Some(period) = self.period() else {
            return false;
        };
        match self.inner.last_fire.load() {
            None => true,
            Some(last) => time.saturating_duration_since(last) > period,
        }
    }

    /// Measure the next period from `time`
    pub fn reset(&self, time: Instant) {
        self.inner.last_fire.store(Some(time));
    }

    /// Make the timer fire on the next step.
    ///
    /// A timer driving a pool task submits the task right away instead.
    pub fn queue(&self) -> LoopResult<()> {
        match &self.inner.kind {
            TimerKind::Callback(_) => {
                self.inner.last_fire.store(None);
                Ok(())
            }
            TimerKind::Task(job) => {
                let event_loop = self.event_loop()?;
                event_loop.pool().push_job(job.clone())?;
                Ok(())
            }
        }
    }

    /// Record `time` as the last fire time and run the timer
    pub fn call(&self, time: Instant) -> anyhow::Result<()> {
        self.inner.last_fire.store(Some(time));
        match &self.inner.kind {
            TimerKind::Callback(callback) => {
                let mut callback = callback.lock();
                match panic::catch_unwind(AssertUnwindSafe(|| (*callback)())) {
                    Ok(result) => result,
                    Err(payload) => Err(anyhow::anyhow!(
                        "timer callback panicked: {}",
                        panic_message(payload.as_ref())
                    )),
                }
            }
            TimerKind::Task(job) => {
                if job.is_attached() || job.is_queued() {
                    return Ok(());
                }
                let event_loop = self.event_loop()?;
                match event_loop.pool().push_job(job.clone()) {
                    Ok(()) | Err(PoolError::TaskRunning(_) | PoolError::AlreadyQueued(_)) => Ok(()),
                    Err(err) => Err(err.into()),
                }
            }
        }
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("period", &self.period())
            .field("single_shot", &self.is_single_shot())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Timer that runs a task in the pool every period.
///
/// The task is only resubmitted once its previous run finished, so runs
/// never overlap. Results go through the completion callbacks on the loop
/// thread.
pub struct AsyncTimer<T> {
    timer: Timer,
    task: Arc<Task<T>>,
    completion: Arc<CompletionHandler<T>>,
}

impl<T> Clone for AsyncTimer<T> {
    fn clone(&self) -> Self {
        Self {
            timer: self.timer.clone(),
            task: self.task.clone(),
            completion: self.completion.clone(),
        }
    }
}

impl<T> Deref for AsyncTimer<T> {
    type Target = Timer;

    fn deref(&self) -> &Timer {
        &self.timer
    }
}

impl<T: Clone + Send + 'static> AsyncTimer<T> {
    pub(crate) fn new(
        event_loop: &EventLoop,
        period: Duration,
        task: Arc<Task<T>>,
        completion: Arc<CompletionHandler<T>>,
    ) -> Self {
        let job: Arc<dyn Job> = task.clone();
        let timer = Timer::with_kind(event_loop, Some(period), false, TimerKind::Task(job));
        Self {
            timer,
            task,
            completion,
        }
    }

    /// The task run every period
    pub fn task(&self) -> &Arc<Task<T>> {
        &self.task
    }

    /// The underlying timer
    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    /// Add a callback invoked with every result
    pub fn add_callback(&self, callback: Callback<T>) {
        self.completion.push(callback);
    }

    /// Run the task now and settle its outcome on the calling thread.
    ///
    /// Queued loop events are processed first. A task already in the pool is
    /// waited for, an idle one runs on the calling thread under its sync key.
    /// Either way the completion callbacks and the error hook run inline and
    /// the queued completion event, if any, is left with nothing to do. With
    /// `reset_time`, the next period is measured from that instant.
    ///
    /// Returns the result, or the default value when the error was ignored
    /// or known. An error left over is reported to the handlers and returned,
    /// never queued.
    pub fn execute(&self, reset_time: Option<Instant>) -> LoopResult<Option<T>> {
        let event_loop = self.timer.event_loop()?;
        event_loop.validate_thread("AsyncTimer::execute")?;
        event_loop.process_events(false)?;

        let outcome = if self.task.is_attached() || self.task.is_queued() {
            self.task.wait();
            self.completion.take_latest()
        } else {
            if self.task.is_finished() {
                self.task.reset()?;
            }
            let task = &self.task;
            match task.sync_key() {
                Some(key) => event_loop.pool().sync(key, || task.run_detached()),
                None => task.run_detached(),
            }
        };
        if let Some(time) = reset_time {
            self.timer.reset(time);
        }
        let Some((value, error)) = outcome else {
            return Err(PoolError::ShuttingDown.into());
        };

        let unsettled = self.completion.settle(value.clone(), error);
        let raised = match unsettled {
            Some((error, reraise)) => {
                event_loop.handle_error(error.clone(), false);
                reraise.then_some(error)
            }
            None => None,
        };
        event_loop.process_events(false)?;
        match raised {
            Some(error) => Err(LoopError::Unhandled(error)),
            None => Ok(value),
        }
    }
}

impl<T: Clone + Send + 'static> fmt::Debug for AsyncTimer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncTimer")
            .field("timer", &self.timer)
            .field("task", &self.task.id())
            .finish()
    }
}
