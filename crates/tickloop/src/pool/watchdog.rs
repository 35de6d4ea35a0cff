//! Task timeout monitor
//!
//! A single background thread polls the running tasks of a pool and cancels,
//! with [`CancelReason::Timeout`], every task that ran longer than its
//! timeout. The thread holds only a weak reference to the pool and exits once
//! the pool is gone, or shut down with nothing left running.

use crate::error::PoolError;
use crate::pool::cancel::CancelReason;
use crate::pool::task::TaskState;
use crate::pool::thread_pool::PoolShared;
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How often running tasks are checked against their timeout
pub const WATCHDOG_INTERVAL: Duration = Duration::from_millis(10);

pub(crate) fn spawn(pool: Weak<PoolShared>) -> Result<JoinHandle<()>, PoolError> {
    let handle = thread::Builder::new()
        .name("tickloop-watchdog".to_string())
        .spawn(move || monitor_loop(pool))?;
    Ok(handle)
}

fn monitor_loop(pool: Weak<PoolShared>) {
    tracing::debug!("task watchdog started");
    loop {
        let Some(shared) = pool.upgrade() else {
            break;
        };
        {
            let state = shared.state.lock();
            if state.shutdown && state.running.is_empty() {
                break;
            }
            for job in &state.running {
                let Some(timeout) = job.timeout() else {
                    continue;
                };
                if job.state() != TaskState::Running {
                    continue;
                }
                let elapsed = job.time_elapsed();
                if elapsed > timeout && job.cancel(CancelReason::Timeout) {
                    tracing::warn!(
                        task = %job.id(),
                        description = job.description().as_deref().unwrap_or(""),
                        ?elapsed,
                        ?timeout,
                        "task timed out"
                    );
                }
            }
        }
        drop(shared);
        thread::sleep(WATCHDOG_INTERVAL);
    }
    tracing::debug!("task watchdog stopped");
}
