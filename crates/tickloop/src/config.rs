//! Configuration for the thread pool and the event loop

use crate::error::PoolError;
use std::time::Duration;

/// Default number of worker threads kept alive by a pool
pub const DEFAULT_MIN_THREADS: usize = 5;

/// Default cadence of [`EventLoop::exec`](crate::EventLoop::exec)
pub const DEFAULT_EXEC_PERIOD: Duration = Duration::from_millis(50);

/// Default cadence of [`EventLoop::wait_for`](crate::EventLoop::wait_for)
pub const DEFAULT_WAIT_PERIOD: Duration = Duration::from_millis(10);

/// Thread pool sizing and worker thread settings
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Workers spawned up front and never trimmed away
    pub min_threads: usize,

    /// Upper bound on spawned workers
    pub max_threads: usize,

    /// Trim idle workers back toward `min_threads` after each task
    pub auto_trim: bool,

    /// Prefix for worker thread names
    pub thread_name: String,

    /// Stack size for worker threads in bytes (None = platform default)
    pub stack_size: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_threads: DEFAULT_MIN_THREADS,
            max_threads: DEFAULT_MIN_THREADS,
            auto_trim: false,
            thread_name: "tickloop-worker".to_string(),
            stack_size: None,
        }
    }
}

impl PoolConfig {
    /// Pool with fixed bounds
    pub fn new(min_threads: usize, max_threads: usize) -> Self {
        Self {
            min_threads,
            max_threads,
            ..Self::default()
        }
    }

    /// Keep the default minimum but allow growing up to one worker per core
    pub fn per_cpu() -> Self {
        let cores = num_cpus::get();
        Self::new(DEFAULT_MIN_THREADS.min(cores), cores.max(DEFAULT_MIN_THREADS))
    }

    /// Set the minimum number of workers
    pub fn min_threads(mut self, min: usize) -> Self {
        self.min_threads = min;
        self
    }

    /// Set the maximum number of workers
    pub fn max_threads(mut self, max: usize) -> Self {
        self.max_threads = max;
        self
    }

    /// Enable or disable auto trimming
    pub fn auto_trim(mut self, enabled: bool) -> Self {
        self.auto_trim = enabled;
        self
    }

    /// Set the worker thread name prefix
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Set the worker stack size
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = Some(bytes);
        self
    }

    /// Check the bounds
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_threads == 0 || self.min_threads > self.max_threads {
            return Err(PoolError::InvalidBounds {
                min: self.min_threads,
                max: self.max_threads,
            });
        }
        Ok(())
    }
}

/// Event loop settings
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Settings of the embedded thread pool
    pub pool: PoolConfig,

    /// Step cadence used by `exec` and `steps` when none is given
    pub exec_period: Duration,

    /// Polling cadence used by `wait_for` when none is given
    pub wait_period: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            exec_period: DEFAULT_EXEC_PERIOD,
            wait_period: DEFAULT_WAIT_PERIOD,
        }
    }
}

impl LoopConfig {
    /// Replace the pool settings
    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Set the exec period
    pub fn exec_period(mut self, period: Duration) -> Self {
        self.exec_period = period;
        self
    }

    /// Set the wait period
    pub fn wait_period(mut self, period: Duration) -> Self {
        self.wait_period = period;
        self
    }
}
