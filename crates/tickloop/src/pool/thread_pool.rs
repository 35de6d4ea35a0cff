//! Growable worker thread pool with sync-key exclusion
//!
//! Workers share one FIFO queue. An idle worker scans it in order and claims
//! the first task whose sync key is free, so a task blocked by a held key
//! never starves unrelated work queued behind it. Threads are spawned on
//! demand up to `max` and trimmed back toward `min` on request.

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::pool::task::{panic_message, Job, SyncKey, Task, TaskHandle, TaskOptions};
use crate::pool::watchdog;
use parking_lot::{Condvar, Mutex, MutexGuard};
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// Weight kept from the previous average on each sample
const AVERAGE_DECAY: f64 = 0.95;

type FinishedHook = Arc<dyn Fn(&dyn Job) + Send + Sync>;

pub(crate) struct PoolState {
    pub(crate) min: usize,
    pub(crate) max: usize,
    pub(crate) spawned: usize,
    /// Workers not executing a task
    pub(crate) waiting: usize,
    pub(crate) trim_requests: usize,
    pub(crate) shutdown: bool,
    pub(crate) auto_trim: bool,
    pub(crate) queue: VecDeque<Arc<dyn Job>>,
    pub(crate) running: Vec<Arc<dyn Job>>,
    held_keys: FxHashSet<SyncKey>,
    workers: FxHashMap<ThreadId, JoinHandle<()>>,
    next_worker: usize,
    avg_run_time: f64,
    avg_wait_time: f64,
    /// Claimed tasks whose finalize has not returned yet
    active: usize,
    /// Bumped after every finalize
    generation: u64,
    pub(crate) watchdog: Option<JoinHandle<()>>,
}

impl PoolState {
    fn claim(&mut self) -> Option<Arc<dyn Job>> {
        let held = &self.held_keys;
        let index = self
            .queue
            .iter()
            .position(|job| job.sync_key().map_or(true, |key| !held.contains(key)))?;
        let job = self.queue.remove(index)?;
        if let Some(key) = job.sync_key() {
            self.held_keys.insert(key.clone());
        }
        if let Some(queued_at) = job.queued_at() {
            let sample = queued_at.elapsed().as_secs_f64();
            self.avg_wait_time = moving_average(self.avg_wait_time, sample);
        }
        job.pre_execute();
        self.running.push(job.clone());
        self.waiting -= 1;
        self.active += 1;
        Some(job)
    }

    /// Tasks left to finalize. A shut down pool never claims its queue.
    fn is_busy(&self) -> bool {
        self.active > 0 || (!self.shutdown && !self.queue.is_empty())
    }
}

fn moving_average(average: f64, sample: f64) -> f64 {
    if average == 0.0 {
        sample
    } else {
        average * AVERAGE_DECAY + sample * (1.0 - AVERAGE_DECAY)
    }
}

pub(crate) struct PoolShared {
    pub(crate) state: Mutex<PoolState>,
    /// Idle workers wait here for queued work or trim requests
    work_cond: Condvar,
    /// `sync` callers wait here for a key to be released
    key_cond: Condvar,
    /// Signalled after every finalize
    completion_cond: Condvar,
    hooks: Mutex<Vec<FinishedHook>>,
    thread_name: String,
    stack_size: Option<usize>,
}

/// Snapshot of the pool counters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolStats {
    /// Lower bound on workers
    pub min: usize,
    /// Upper bound on workers
    pub max: usize,
    /// Workers alive
    pub spawned: usize,
    /// Workers not executing a task
    pub waiting: usize,
    /// Tasks queued and not claimed yet
    pub backlog: usize,
    /// Tasks being executed
    pub running: usize,
    /// Moving average of task run time
    pub avg_run_time: Duration,
    /// Moving average of the time tasks spend queued
    pub avg_wait_time: Duration,
}

/// Worker thread pool
pub struct ThreadPool {
    shared: Arc<PoolShared>,
}

impl ThreadPool {
    /// Create a pool and spawn `min` workers
    pub fn new(min: usize, max: usize) -> Result<Self, PoolError> {
        Self::with_config(PoolConfig::new(min, max))
    }

    /// Create a pool from a configuration
    pub fn with_config(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;

        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                min: config.min_threads,
                max: config.max_threads,
                spawned: 0,
                waiting: 0,
                trim_requests: 0,
                shutdown: false,
                auto_trim: config.auto_trim,
                queue: VecDeque::new(),
                running: Vec::new(),
                held_keys: FxHashSet::default(),
                workers: FxHashMap::default(),
                next_worker: 0,
                avg_run_time: 0.0,
                avg_wait_time: 0.0,
                active: 0,
                generation: 0,
                watchdog: None,
            }),
            work_cond: Condvar::new(),
            key_cond: Condvar::new(),
            completion_cond: Condvar::new(),
            hooks: Mutex::new(Vec::new()),
            thread_name: config.thread_name,
            stack_size: config.stack_size,
        });

        let pool = ThreadPool { shared };
        {
            let mut state = pool.shared.state.lock();
            for _ in 0..config.min_threads {
                spawn_worker(&pool.shared, &mut state)?;
            }
        }
        tracing::debug!(
            min = config.min_threads,
            max = config.max_threads,
            "thread pool started"
        );
        Ok(pool)
    }

    /// Queue a task for execution.
    ///
    /// A finished task is reset first. Fails if the pool is shutting down,
    /// if the task is running, or if it is already queued.
    pub fn push<J: Job + 'static>(&self, task: Arc<J>) -> Result<(), PoolError> {
        self.push_job(task)
    }

    pub(crate) fn push_job(&self, job: Arc<dyn Job>) -> Result<(), PoolError> {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            tracing::warn!(task = %job.id(), "rejecting task, thread pool is shutting down");
            return Err(PoolError::ShuttingDown);
        }
        if job.is_attached() {
            return Err(PoolError::TaskRunning(job.id().as_u64()));
        }
        if job.is_queued() {
            return Err(PoolError::AlreadyQueued(job.id().as_u64()));
        }
        if job.is_finished() {
            job.reset()?;
        }

        job.mark_queued(Instant::now());
        state.queue.push_back(job.clone());
        tracing::trace!(task = %job.id(), backlog = state.queue.len(), "task queued");

        if state.queue.len() > state.waiting && state.spawned < state.max {
            if let Err(err) = spawn_worker(&self.shared, &mut state) {
                if state.spawned == 0 {
                    state.queue.pop_back();
                    job.unqueue();
                    return Err(err);
                }
                tracing::warn!(error = %err, "could not grow thread pool, task stays queued");
            }
        }
        self.shared.work_cond.notify_one();
        Ok(())
    }

    /// Build a task around `work` and queue it
    pub fn process<T, F>(&self, work: F) -> Result<TaskHandle<T>, PoolError>
    where
        T: Clone + Send + 'static,
        F: FnMut() -> anyhow::Result<T> + Send + 'static,
    {
        self.process_with_options(TaskOptions::default(), work)
    }

    /// Build a task with options around `work` and queue it
    pub fn process_with_options<T, F>(
        &self,
        options: TaskOptions<T>,
        work: F,
    ) -> Result<TaskHandle<T>, PoolError>
    where
        T: Clone + Send + 'static,
        F: FnMut() -> anyhow::Result<T> + Send + 'static,
    {
        let task = Arc::new(Task::with_options(options, work));
        self.push(task.clone())?;
        Ok(task)
    }

    /// Run `f` on the calling thread while holding `key`.
    ///
    /// Blocks until no task and no other `sync` block holds the key.
    pub fn sync<K, R, F>(&self, key: K, f: F) -> R
    where
        K: Into<SyncKey>,
        F: FnOnce() -> R,
    {
        let key = key.into();
        let mut state = self.shared.state.lock();
        while state.held_keys.contains(&key) {
            self.shared.key_cond.wait(&mut state);
        }
        state.held_keys.insert(key.clone());
        drop(state);

        let _held = HeldKey {
            shared: &self.shared,
            key,
        };
        f()
    }

    /// Like [`sync`](Self::sync), giving up if the key is not free within `timeout`
    pub fn sync_timeout<K, R, F>(&self, key: K, timeout: Duration, f: F) -> Result<R, PoolError>
    where
        K: Into<SyncKey>,
        F: FnOnce() -> R,
    {
        let key = key.into();
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.held_keys.contains(&key) {
            if self
                .shared
                .key_cond
                .wait_until(&mut state, deadline)
                .timed_out()
                && state.held_keys.contains(&key)
            {
                return Err(PoolError::SyncTimeout { timeout });
            }
        }
        state.held_keys.insert(key.clone());
        drop(state);

        let _held = HeldKey {
            shared: &self.shared,
            key,
        };
        Ok(f())
    }

    /// Change the thread bounds.
    ///
    /// Spawns workers up to `min`, and up to `max` if the backlog warrants it,
    /// then asks idle workers beyond `min` (and any worker beyond `max`) to exit.
    pub fn resize(&self, min: usize, max: usize) -> Result<(), PoolError> {
        let mut state = self.shared.state.lock();
        if max == 0 || min > max {
            return Err(PoolError::InvalidBounds { min, max });
        }
        state.min = min;
        state.max = max;

        // workers already asked to exit no longer count as capacity
        let alive = |state: &PoolState| state.spawned.saturating_sub(state.trim_requests);
        while alive(&state) < min {
            spawn_worker(&self.shared, &mut state)?;
        }
        while state.queue.len() > state.waiting && alive(&state) < max {
            spawn_worker(&self.shared, &mut state)?;
        }

        while alive(&state) > max {
            state.trim_requests += 1;
        }
        while state.waiting > state.trim_requests && alive(&state) > min {
            state.trim_requests += 1;
        }
        tracing::debug!(
            min,
            max,
            spawned = state.spawned,
            trim_requests = state.trim_requests,
            "thread pool resized"
        );
        self.shared.work_cond.notify_all();
        Ok(())
    }

    /// Ask one worker to exit if the pool has more than `min` workers.
    ///
    /// Without `force`, nothing happens unless a worker is idle. Returns
    /// whether a trim request was issued.
    pub fn trim(&self, force: bool) -> bool {
        let mut state = self.shared.state.lock();
        trim_locked(&self.shared, &mut state, force)
    }

    /// Enable or disable trimming after each task
    pub fn set_auto_trim(&self, enabled: bool) {
        self.shared.state.lock().auto_trim = enabled;
    }

    /// Stop accepting work and wake every worker.
    ///
    /// Workers exit once they are between tasks. Tasks still queued stay
    /// queued until [`join`](Self::join) discards them.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        if !state.shutdown {
            tracing::debug!(
                spawned = state.spawned,
                backlog = state.queue.len(),
                "thread pool shutting down"
            );
        }
        state.shutdown = true;
        self.shared.work_cond.notify_all();
        self.shared.completion_cond.notify_all();
    }

    /// Shut down and give every running task at most `timeout` more to
    /// finish.
    ///
    /// Tasks still running after that are cancelled with a timeout by the
    /// watchdog. A task already due sooner keeps its own timeout.
    pub fn shutdown_with_timeout(&self, timeout: Duration) -> Result<(), PoolError> {
        self.shutdown();
        {
            let state = self.shared.state.lock();
            for job in &state.running {
                let deadline = job.time_elapsed() + timeout;
                if job.timeout().map_or(true, |current| current > deadline) {
                    job.set_timeout(Some(deadline));
                }
            }
        }
        self.watchdog()
    }

    /// Start the task timeout monitor. Does nothing if it already runs.
    pub fn watchdog(&self) -> Result<(), PoolError> {
        let mut state = self.shared.state.lock();
        if state.watchdog.is_some() {
            return Ok(());
        }
        let handle = watchdog::spawn(Arc::downgrade(&self.shared))?;
        state.watchdog = Some(handle);
        Ok(())
    }

    /// Wait for every worker to exit, then discard the tasks left in the queue.
    ///
    /// Called from a worker thread, that worker is skipped.
    pub fn join(&self) {
        let current = thread::current().id();
        let (workers, watchdog) = {
            let mut state = self.shared.state.lock();
            let ids: Vec<ThreadId> = state
                .workers
                .keys()
                .copied()
                .filter(|id| *id != current)
                .collect();
            let workers: Vec<JoinHandle<()>> = ids
                .iter()
                .filter_map(|id| state.workers.remove(id))
                .collect();
            let watchdog = if state.shutdown {
                state.watchdog.take()
            } else {
                None
            };
            (workers, watchdog)
        };

        for handle in workers.into_iter().chain(watchdog) {
            let name = handle.thread().name().map(str::to_owned);
            if let Err(payload) = handle.join() {
                tracing::error!(
                    thread = name.as_deref().unwrap_or("<unnamed>"),
                    panic = %panic_message(payload.as_ref()),
                    "pool thread panicked"
                );
            }
        }

        let leftover: Vec<Arc<dyn Job>> = {
            let mut state = self.shared.state.lock();
            if !state.shutdown {
                return;
            }
            state.queue.drain(..).collect()
        };
        for job in leftover {
            tracing::debug!(task = %job.id(), "discarding queued task");
            job.unqueue();
        }
        self.shared.completion_cond.notify_all();
    }

    /// Shut down, wait for the workers, then reopen the pool with `min` fresh workers
    pub fn clear(&self) -> Result<(), PoolError> {
        self.shutdown();
        self.join();

        let mut state = self.shared.state.lock();
        state.shutdown = false;
        state.trim_requests = 0;
        while state.spawned < state.min {
            spawn_worker(&self.shared, &mut state)?;
        }
        tracing::debug!(spawned = state.spawned, "thread pool cleared");
        Ok(())
    }

    /// Register a hook invoked on the worker thread after every finalize
    pub fn on_task_finished<F>(&self, hook: F)
    where
        F: Fn(&dyn Job) + Send + Sync + 'static,
    {
        self.shared.hooks.lock().push(Arc::new(hook));
    }

    /// Running tasks followed by queued ones
    pub fn tasks(&self) -> Vec<Arc<dyn Job>> {
        let state = self.shared.state.lock();
        state
            .running
            .iter()
            .chain(state.queue.iter())
            .cloned()
            .collect()
    }

    /// Number of queued tasks not claimed yet
    pub fn backlog(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Number of workers not executing a task
    pub fn waiting(&self) -> usize {
        self.shared.state.lock().waiting
    }

    /// Number of live workers
    pub fn spawned(&self) -> usize {
        self.shared.state.lock().spawned
    }

    /// Number of tasks being executed
    pub fn running(&self) -> usize {
        self.shared.state.lock().running.len()
    }

    /// Lower bound on workers
    pub fn min(&self) -> usize {
        self.shared.state.lock().min
    }

    /// Upper bound on workers
    pub fn max(&self) -> usize {
        self.shared.state.lock().max
    }

    /// Whether trimming runs after each task
    pub fn auto_trim(&self) -> bool {
        self.shared.state.lock().auto_trim
    }

    /// Whether the pool refuses new work
    pub fn is_shutting_down(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    /// Moving average of task run time
    pub fn avg_run_time(&self) -> Duration {
        Duration::from_secs_f64(self.shared.state.lock().avg_run_time)
    }

    /// Moving average of the time tasks spend queued
    pub fn avg_wait_time(&self) -> Duration {
        Duration::from_secs_f64(self.shared.state.lock().avg_wait_time)
    }

    /// All counters, read under one lock
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            min: state.min,
            max: state.max,
            spawned: state.spawned,
            waiting: state.waiting,
            backlog: state.queue.len(),
            running: state.running.len(),
            avg_run_time: Duration::from_secs_f64(state.avg_run_time),
            avg_wait_time: Duration::from_secs_f64(state.avg_wait_time),
        }
    }

    /// Whether tasks are queued or have not been finalized yet
    pub fn is_busy(&self) -> bool {
        self.shared.state.lock().is_busy()
    }

    /// Counter bumped after every task finalize
    pub fn completion_generation(&self) -> u64 {
        self.shared.state.lock().generation
    }

    /// Block until a task is finalized after generation `since` was observed,
    /// or until the pool has nothing left to finalize.
    ///
    /// Returns the generation seen on wake up.
    pub fn wait_for_completion(&self, since: u64, timeout: Option<Duration>) -> u64 {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.shared.state.lock();
        while state.generation == since && state.is_busy() {
            match deadline {
                Some(deadline) => {
                    if self
                        .shared
                        .completion_cond
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        break;
                    }
                }
                None => self.shared.completion_cond.wait(&mut state),
            }
        }
        state.generation
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
        self.join();
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool").field("stats", &self.stats()).finish()
    }
}

/// Releases a key taken by `sync`, also when the block panics
struct HeldKey<'a> {
    shared: &'a PoolShared,
    key: SyncKey,
}

impl Drop for HeldKey<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.held_keys.remove(&self.key);
        drop(state);
        self.shared.key_cond.notify_all();
        self.shared.work_cond.notify_all();
    }
}

fn trim_locked(shared: &PoolShared, state: &mut PoolState, force: bool) -> bool {
    let surplus = state.spawned.saturating_sub(state.trim_requests) > state.min;
    if (state.waiting > 0 || force) && surplus {
        state.trim_requests += 1;
        shared.work_cond.notify_one();
        tracing::trace!(
            spawned = state.spawned,
            trim_requests = state.trim_requests,
            "trim requested"
        );
        true
    } else {
        false
    }
}

fn spawn_worker(
    shared: &Arc<PoolShared>,
    state: &mut MutexGuard<'_, PoolState>,
) -> Result<(), PoolError> {
    let index = state.next_worker;
    let mut builder = thread::Builder::new().name(format!("{}-{}", shared.thread_name, index));
    if let Some(size) = shared.stack_size {
        builder = builder.stack_size(size);
    }

    let worker_shared = shared.clone();
    let handle = builder.spawn(move || worker_loop(worker_shared, index))?;

    state.next_worker += 1;
    state.spawned += 1;
    state.waiting += 1;
    state.workers.insert(handle.thread().id(), handle);
    tracing::trace!(worker = index, spawned = state.spawned, "worker spawned");
    Ok(())
}

fn worker_loop(shared: Arc<PoolShared>, index: usize) {
    let span = tracing::debug_span!("worker", index);
    let _entered = span.enter();

    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }

        if let Some(job) = state.claim() {
            MutexGuard::unlocked(&mut state, || run_job(&shared, job));
            continue;
        }

        if state.trim_requests > 0 {
            state.trim_requests -= 1;
            state.workers.remove(&thread::current().id());
            tracing::trace!("worker trimmed");
            break;
        }

        shared.work_cond.wait(&mut state);
    }

    state.spawned -= 1;
    state.waiting -= 1;
    tracing::trace!(spawned = state.spawned, "worker exiting");
}

fn run_job(shared: &PoolShared, job: Arc<dyn Job>) {
    let id = job.id();
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job.execute())) {
        let panic = panic_message(payload.as_ref());
        tracing::error!(task = %id, panic = %panic, "task dispatch panicked");
    }

    {
        let mut state = shared.state.lock();
        state.running.retain(|running| running.id() != id);
        if let Some(key) = job.sync_key() {
            state.held_keys.remove(key);
        }
        let sample = job.time_elapsed().as_secs_f64();
        state.avg_run_time = moving_average(state.avg_run_time, sample);
    }
    shared.key_cond.notify_all();
    shared.work_cond.notify_all();

    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job.finalize())) {
        let panic = panic_message(payload.as_ref());
        tracing::error!(task = %id, panic = %panic, "task finalize panicked");
    }
    let hooks = shared.hooks.lock().clone();
    for hook in hooks {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| hook(job.as_ref()))) {
            tracing::error!(
                task = %id,
                panic = %panic_message(payload.as_ref()),
                "task finished hook panicked"
            );
        }
    }

    let mut state = shared.state.lock();
    state.active -= 1;
    state.waiting += 1;
    state.generation = state.generation.wrapping_add(1);
    shared.completion_cond.notify_all();
    if state.auto_trim {
        trim_locked(shared, &mut state, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::task::TaskState;
    use crossbeam::channel;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    #[test]
    fn test_spawns_min_threads() {
        let pool = ThreadPool::new(2, 2).unwrap();
        assert_eq!(pool.spawned(), 2);
        assert_eq!(pool.waiting(), 2);
        assert_eq!(pool.backlog(), 0);
    }

    #[test]
    fn test_rejects_bad_bounds() {
        assert!(matches!(
            ThreadPool::new(3, 1),
            Err(PoolError::InvalidBounds { min: 3, max: 1 })
        ));
    }

    #[test]
    fn test_process_runs_task() {
        let pool = ThreadPool::new(1, 1).unwrap();
        let task = pool.process(|| Ok(6 * 7)).unwrap();
        assert_eq!(task.wait(), TaskState::Finished);
        assert_eq!(task.result(), Some(42));
    }

    #[test]
    fn test_callback_runs_on_worker() {
        let pool = ThreadPool::new(1, 1).unwrap();
        let (tx, rx) = channel::unbounded();
        pool.process_with_options(
            TaskOptions::default().callback(move |value, error| {
                tx.send((value, error.is_none(), thread::current().id()))?;
                Ok(())
            }),
            || Ok("done"),
        )
        .unwrap();
        let (value, ok, thread_id) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(value, Some("done"));
        assert!(ok);
        assert_ne!(thread_id, thread::current().id());
    }

    #[test]
    fn test_grows_up_to_max() {
        let pool = ThreadPool::new(0, 5).unwrap();
        assert_eq!(pool.spawned(), 0);

        let (release_tx, release_rx) = channel::unbounded::<()>();
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let release = release_rx.clone();
                pool.process(move || {
                    let _ = release.recv();
                    Ok(())
                })
                .unwrap()
            })
            .collect();

        assert!(wait_until(Duration::from_secs(5), || {
            let stats = pool.stats();
            stats.running == 5 && stats.backlog == 3
        }));
        let stats = pool.stats();
        assert_eq!(stats.spawned, 5);
        assert_eq!(stats.waiting, 0);
        assert_eq!(stats.backlog, 3);

        drop(release_tx);
        for task in &tasks {
            assert_eq!(task.wait(), TaskState::Finished);
        }
    }

    #[test]
    fn test_sync_key_excludes_tasks() {
        let pool = ThreadPool::new(4, 4).unwrap();
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let concurrent = concurrent.clone();
                let peak = peak.clone();
                pool.process_with_options(TaskOptions::default().sync_key("shared"), move || {
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap()
            })
            .collect();

        for task in &tasks {
            task.wait();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_blocked_key_does_not_starve_others() {
        let pool = ThreadPool::new(2, 2).unwrap();
        let (release_tx, release_rx) = channel::unbounded::<()>();

        let first = pool
            .process_with_options(TaskOptions::default().sync_key("a"), move || {
                let _ = release_rx.recv();
                Ok(1)
            })
            .unwrap();
        let second = pool
            .process_with_options(TaskOptions::default().sync_key("a"), || Ok(2))
            .unwrap();
        let third = pool
            .process_with_options(TaskOptions::default().sync_key("b"), || Ok(3))
            .unwrap();

        assert_eq!(third.wait_timeout(Duration::from_secs(5)), TaskState::Finished);
        assert!(!second.is_started());
        assert!(first.is_running());

        drop(release_tx);
        assert_eq!(second.wait(), TaskState::Finished);
        assert_eq!(first.result(), Some(1));
    }

    #[test]
    fn test_sync_excludes_tasks_with_same_key() {
        let pool = ThreadPool::new(1, 1).unwrap();
        let (entered_tx, entered_rx) = channel::unbounded::<()>();

        let task = pool.sync("key", || {
            let task = pool
                .process_with_options(TaskOptions::default().sync_key("key"), move || {
                    entered_tx.send(())?;
                    Ok(())
                })
                .unwrap();
            assert!(entered_rx.recv_timeout(Duration::from_millis(50)).is_err());
            assert!(!task.is_started());
            task
        });

        assert_eq!(task.wait_timeout(Duration::from_secs(5)), TaskState::Finished);
    }

    #[test]
    fn test_sync_timeout() {
        let pool = ThreadPool::new(1, 1).unwrap();
        let (started_tx, started_rx) = channel::unbounded::<()>();
        let (release_tx, release_rx) = channel::unbounded::<()>();
        let task = pool
            .process_with_options(TaskOptions::default().sync_key(7u64), move || {
                started_tx.send(())?;
                let _ = release_rx.recv();
                Ok(())
            })
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let result = pool.sync_timeout(7u64, Duration::from_millis(20), || 1);
        assert!(matches!(result, Err(PoolError::SyncTimeout { .. })));

        drop(release_tx);
        task.wait();
        assert_eq!(pool.sync_timeout(7u64, Duration::from_secs(5), || 2).unwrap(), 2);
    }

    #[test]
    fn test_sync_releases_key_on_panic() {
        let pool = ThreadPool::new(1, 1).unwrap();
        let result =
            panic::catch_unwind(AssertUnwindSafe(|| pool.sync("k", || panic!("inside sync"))));
        assert!(result.is_err());
        assert_eq!(pool.sync_timeout("k", Duration::from_secs(1), || 3).unwrap(), 3);
    }

    #[test]
    fn test_push_rejects_running_and_queued() {
        let pool = ThreadPool::new(1, 1).unwrap();
        let (release_tx, release_rx) = channel::unbounded::<()>();
        let blocker = pool
            .process(move || {
                let _ = release_rx.recv();
                Ok(())
            })
            .unwrap();
        assert!(wait_until(Duration::from_secs(5), || blocker.is_running()));
        assert!(matches!(pool.push(blocker.clone()), Err(PoolError::TaskRunning(_))));

        let queued = pool.process(|| Ok(())).unwrap();
        assert!(matches!(pool.push(queued.clone()), Err(PoolError::AlreadyQueued(_))));

        drop(release_tx);
        queued.wait();
    }

    #[test]
    fn test_push_resets_finished_task() {
        let pool = ThreadPool::new(1, 1).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let count = counter.clone();
        let task = pool
            .process(move || Ok(count.fetch_add(1, Ordering::SeqCst) + 1))
            .unwrap();
        task.wait();
        assert_eq!(task.result(), Some(1));

        pool.push(task.clone()).unwrap();
        task.wait();
        assert_eq!(task.result(), Some(2));
    }

    #[test]
    fn test_shutdown_rejects_new_work() {
        let pool = ThreadPool::new(2, 2).unwrap();
        pool.shutdown();
        assert!(matches!(pool.process(|| Ok(())), Err(PoolError::ShuttingDown)));
        pool.join();
        assert_eq!(pool.spawned(), 0);
    }

    #[test]
    fn test_clear_respawns_min_workers() {
        let pool = ThreadPool::new(2, 4).unwrap();
        pool.clear().unwrap();
        assert!(!pool.is_shutting_down());
        assert_eq!(pool.spawned(), 2);
        let task = pool.process(|| Ok(1)).unwrap();
        assert_eq!(task.wait(), TaskState::Finished);
    }

    #[test]
    fn test_trim() {
        let pool = ThreadPool::new(1, 3).unwrap();
        pool.resize(3, 3).unwrap();
        assert_eq!(pool.spawned(), 3);

        pool.resize(1, 3).unwrap();
        assert!(wait_until(Duration::from_secs(5), || pool.spawned() == 1));
        assert!(!pool.trim(false));
        assert!(!pool.trim(true));
    }

    #[test]
    fn test_resize_below_spawned() {
        let pool = ThreadPool::new(4, 4).unwrap();
        pool.resize(1, 2).unwrap();
        assert!(wait_until(Duration::from_secs(5), || pool.spawned() == 1));
        assert_eq!(pool.max(), 2);
    }

    #[test]
    fn test_auto_trim() {
        let pool = ThreadPool::with_config(PoolConfig::new(5, 20).auto_trim(true)).unwrap();
        let (release_tx, release_rx) = channel::unbounded::<()>();
        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let release = release_rx.clone();
                pool.process(move || {
                    let _ = release.recv();
                    Ok(())
                })
                .unwrap()
            })
            .collect();
        assert!(wait_until(Duration::from_secs(5), || pool.running() == 20));
        assert_eq!(pool.spawned(), 20);

        drop(release_tx);
        for task in &tasks {
            task.wait();
        }
        assert!(wait_until(Duration::from_secs(5), || pool.spawned() == 5));
    }

    #[test]
    fn test_on_task_finished_and_stats() {
        let pool = ThreadPool::new(1, 1).unwrap();
        let finished = Arc::new(AtomicUsize::new(0));
        let count = finished.clone();
        pool.on_task_finished(move |job| {
            assert!(job.is_finished());
            count.fetch_add(1, Ordering::SeqCst);
        });

        let ok = pool.process(|| {
            thread::sleep(Duration::from_millis(10));
            Ok(())
        }).unwrap();
        let failed = pool.process(|| -> anyhow::Result<()> { anyhow::bail!("nope") }).unwrap();
        ok.wait();
        failed.wait();

        assert!(wait_until(Duration::from_secs(5), || finished.load(Ordering::SeqCst) == 2));
        assert!(pool.avg_run_time() > Duration::ZERO);
        // the second task sat in the queue behind the sleeping one
        assert!(pool.avg_wait_time() > Duration::ZERO);
        assert!(failed.is_exception());
    }

    #[test]
    fn test_hook_may_register_hooks() {
        let pool = Arc::new(ThreadPool::new(1, 1).unwrap());
        let late = Arc::new(AtomicUsize::new(0));
        let registrar = Arc::downgrade(&pool);
        let counter = late.clone();
        let registered = AtomicBool::new(false);
        pool.on_task_finished(move |_| {
            if registered.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Some(pool) = registrar.upgrade() {
                let counter = counter.clone();
                pool.on_task_finished(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        });

        pool.process(|| Ok(())).unwrap().wait();
        pool.process(|| Ok(())).unwrap().wait();
        assert!(wait_until(Duration::from_secs(5), || late.load(Ordering::SeqCst) == 1));
    }

    #[test]
    fn test_moving_average() {
        assert_eq!(moving_average(0.0, 2.0), 2.0);
        let next = moving_average(2.0, 4.0);
        assert!((next - (2.0 * 0.95 + 4.0 * 0.05)).abs() < 1e-12);
        assert!(next > 2.0 && next < 4.0);
    }

    #[test]
    fn test_shutdown_with_timeout_keeps_shorter_timeout() {
        let pool = ThreadPool::new(2, 2).unwrap();
        let (release_tx, release_rx) = channel::unbounded::<()>();
        let short = pool
            .process_with_options(TaskOptions::default().timeout(Duration::from_millis(50)), || {
                crate::pool::sleep(Duration::from_secs(30))?;
                Ok(())
            })
            .unwrap();
        let open = pool
            .process(move || {
                let _ = release_rx.recv();
                Ok(())
            })
            .unwrap();
        assert!(wait_until(Duration::from_secs(5), || short.is_running() && open.is_running()));

        pool.shutdown_with_timeout(Duration::from_secs(60)).unwrap();
        assert_eq!(short.timeout(), Some(Duration::from_millis(50)));
        assert!(open.timeout().is_some_and(|timeout| timeout >= Duration::from_secs(60)));

        assert_eq!(short.wait_timeout(Duration::from_secs(5)), TaskState::TimedOut);
        drop(release_tx);
        assert_eq!(open.wait_timeout(Duration::from_secs(5)), TaskState::Finished);
        pool.join();
    }

    #[test]
    fn test_tasks_lists_running_then_queued() {
        let pool = ThreadPool::new(1, 1).unwrap();
        let (release_tx, release_rx) = channel::unbounded::<()>();
        let running = pool
            .process(move || {
                let _ = release_rx.recv();
                Ok(())
            })
            .unwrap();
        assert!(wait_until(Duration::from_secs(5), || running.is_running()));
        let queued = pool.process(|| Ok(())).unwrap();

        let ids: Vec<_> = pool.tasks().iter().map(|job| job.id()).collect();
        assert_eq!(ids, vec![running.id(), queued.id()]);

        drop(release_tx);
        queued.wait();
    }

    #[test]
    fn test_wait_for_completion() {
        let pool = ThreadPool::new(1, 1).unwrap();
        let generation = pool.completion_generation();
        pool.process(|| {
            thread::sleep(Duration::from_millis(10));
            Ok(())
        })
        .unwrap();
        let next = pool.wait_for_completion(generation, Some(Duration::from_secs(5)));
        assert_eq!(next, generation + 1);
        assert!(!pool.is_busy());
    }

    #[test]
    fn test_join_discards_queued_tasks() {
        let pool = ThreadPool::new(1, 1).unwrap();
        let (release_tx, release_rx) = channel::unbounded::<()>();
        let running = pool
            .process(move || {
                let _ = release_rx.recv();
                Ok(())
            })
            .unwrap();
        assert!(wait_until(Duration::from_secs(5), || running.is_running()));
        let queued = pool.process(|| Ok(())).unwrap();

        pool.shutdown();
        drop(release_tx);
        pool.join();

        assert!(running.is_successful());
        assert_eq!(queued.wait_timeout(Duration::from_secs(1)), TaskState::Waiting);
        assert!(!queued.is_queued());
    }
}
