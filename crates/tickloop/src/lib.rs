//! tickloop: a cooperative event loop backed by a worker thread pool
//!
//! - **Event loop**: one-shot events, periodic and single-shot timers and
//!   every-step callbacks, all run on one designated thread (`event_loop`)
//! - **Thread pool**: a pool that grows from a minimum to a maximum number of
//!   workers on demand, with per-key mutual exclusion between tasks and
//!   callers (`pool`)
//!
//! Work deferred from the loop runs in the pool; its result is handed back to
//! the loop thread as an event, so user callbacks never run concurrently.
//!
//! # Example
//!
//! ```rust,ignore
//! use tickloop::{DeferOptions, EventLoop};
//!
//! let event_loop = EventLoop::new()?;
//! event_loop.defer(
//!     DeferOptions::default().on_success(|len: usize| {
//!         println!("read {} bytes", len);
//!         Ok(())
//!     }),
//!     || Ok(std::fs::read("Cargo.toml")?.len()),
//! )?;
//! event_loop.process_all_async_work()?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod event_loop;
pub mod pool;

pub use config::{LoopConfig, PoolConfig};
pub use error::{LoopError, LoopResult, PoolError, Terminated, TimedOut, WorkError};
pub use event_loop::{
    AsyncEveryOptions, AsyncTimer, Callback, Called, Delegator, DeferOptions, ErrorDisposition,
    ErrorMatcher, Event, EventHandle, EventLoop, EveryOptions, HandlerId, Scheduled, Timer,
    WeakEventLoop,
};
pub use pool::{
    checkpoint, current_token, is_cancelled, sleep, CancelReason, CancelToken, Job, PoolStats,
    SyncKey, Task, TaskHandle, TaskId, TaskOptions, TaskState, ThreadPool,
};
