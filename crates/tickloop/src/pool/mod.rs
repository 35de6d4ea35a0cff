//! Worker thread pool
//!
//! Tasks, sync keys, cooperative cancellation and the pool that runs them.

pub mod cancel;
pub mod task;
pub mod thread_pool;
pub mod watchdog;

pub use cancel::{checkpoint, current_token, is_cancelled, sleep, CancelReason, CancelToken};
pub use task::{Completion, Job, SyncKey, Task, TaskHandle, TaskId, TaskOptions, TaskState, Work};
pub use thread_pool::{PoolStats, ThreadPool};
pub use watchdog::WATCHDOG_INTERVAL;
