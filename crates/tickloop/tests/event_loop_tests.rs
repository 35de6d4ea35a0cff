//! Event loop integration tests
//!
//! Deferred work round trips through the pool and back onto the loop thread:
//! - Callbacks, error dispositions and known errors
//! - Errors raised at the next step boundary
//! - Periodic pool work with `async_every` and off-cycle `execute`
//! - Loop thread checks and exclusion with pool tasks
//!
//! # Running Tests
//! ```bash
//! cargo test --test event_loop_tests
//! ```

mod common;

use common::{init_tracing, Occupancy};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tickloop::Job;
use tickloop::{
    AsyncEveryOptions, Callback, DeferOptions, ErrorDisposition, EventLoop, LoopConfig, LoopError,
    PoolConfig, TaskState, WorkError,
};

#[derive(Debug, thiserror::Error)]
#[error("boom")]
struct Boom;

#[derive(Debug, thiserror::Error)]
#[error("replaced")]
struct Replaced;

fn small_loop() -> EventLoop {
    EventLoop::with_config(LoopConfig::default().pool(PoolConfig::new(2, 4))).unwrap()
}

fn unhandled(err: LoopError) -> WorkError {
    match err {
        LoopError::Unhandled(err) => err,
        other => panic!("expected an unhandled work error, got {:?}", other),
    }
}

// ===== Deferred results =====

#[test]
fn test_success_callback_runs_on_loop_thread() {
    init_tracing();
    let el = small_loop();
    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();

    let task = el
        .async_call(
            || Ok(thread::current().id()),
            move |worker| {
                *sink.lock() = Some((worker, thread::current().id()));
                Ok(())
            },
        )
        .unwrap();

    el.process_all_async_work().unwrap();
    assert!(task.is_successful());
    let (worker, callback_thread) = seen.lock().take().unwrap();
    assert_ne!(worker, thread::current().id());
    assert_eq!(callback_thread, thread::current().id());
}

#[test]
fn test_deferred_error_raised_on_next_step() {
    let el = small_loop();
    let called = Arc::new(AtomicBool::new(false));
    let flag = called.clone();
    el.defer(
        DeferOptions::default().on_success(move |_: ()| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        }),
        || Err(Boom.into()),
    )
    .unwrap();

    assert!(el.process_all_async_work().is_ok());
    let err = unhandled(el.step().unwrap_err());
    assert!(err.is::<Boom>());
    assert!(!called.load(Ordering::SeqCst), "success callbacks skip failures");
    assert!(el.step().is_ok(), "each error is raised once");
}

#[test]
fn test_outcome_callback_replaces_error() {
    let el = small_loop();
    el.defer(
        DeferOptions::default().on_outcome(|_: Option<u8>, error| {
            assert!(error.is_some_and(|err| err.is::<Boom>()));
            Ok(ErrorDisposition::Replace(Replaced.into()))
        }),
        || Err(Boom.into()),
    )
    .unwrap();

    el.process_all_async_work().unwrap();
    let err = unhandled(el.step().unwrap_err());
    assert!(err.is::<Replaced>());
}

#[test]
fn test_outcome_callback_ignores_error_and_gets_default() {
    let el = small_loop();
    let seen = Arc::new(Mutex::new(None));
    let sink = seen.clone();
    el.defer(
        DeferOptions::default()
            .default_value(7)
            .on_outcome(move |value, error: Option<WorkError>| {
                *sink.lock() = Some((value, error.is_some()));
                Ok(ErrorDisposition::Ignore)
            }),
        || Err(Boom.into()),
    )
    .unwrap();

    el.process_all_async_work().unwrap();
    el.step().unwrap();
    assert_eq!(*seen.lock(), Some((Some(7), true)));
}

#[test]
fn test_known_error_reaches_handlers_without_reraise() {
    let el = small_loop();
    let handled = Arc::new(AtomicUsize::new(0));
    let hooked = Arc::new(AtomicUsize::new(0));
    let count = handled.clone();
    el.on_error::<Boom, _>(move |_| {
        count.fetch_add(1, Ordering::SeqCst);
    });

    let hook = hooked.clone();
    el.defer(
        DeferOptions::<()>::default()
            .known_error::<Boom>()
            .on_error(move |err| {
                assert!(err.is::<Boom>());
                hook.fetch_add(1, Ordering::SeqCst);
            }),
        || Err(Boom.into()),
    )
    .unwrap();

    el.process_all_async_work().unwrap();
    el.step().unwrap();
    assert_eq!(handled.load(Ordering::SeqCst), 1);
    assert_eq!(hooked.load(Ordering::SeqCst), 1);
}

#[test]
fn test_unqueued_defer_waits_for_explicit_push() {
    let el = small_loop();
    let task = el
        .defer(DeferOptions::default().queue(false), || Ok(5))
        .unwrap();
    el.process_all_async_work().unwrap();
    assert_eq!(task.state(), TaskState::Waiting);

    el.pool().push(task.clone()).unwrap();
    el.process_all_async_work().unwrap();
    assert_eq!(task.result(), Some(5));
}

// ===== Periodic pool work =====

#[test]
fn test_async_every_reruns_after_each_completion() {
    init_tracing();
    let el = small_loop();
    let runs = Arc::new(AtomicUsize::new(0));
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    let sink = delivered.clone();

    let timer = el
        .async_every(
            move || Ok(counter.fetch_add(1, Ordering::SeqCst)),
            AsyncEveryOptions::new(Duration::from_millis(5)),
            DeferOptions::default().on_success(move |_| {
                sink.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();
    assert!(timer.is_running());

    el.wait_for(Some(Duration::from_millis(1)), Some(Duration::from_secs(5)), || {
        delivered.load(Ordering::SeqCst) >= 3
    })
    .unwrap();
    timer.cancel();
    assert!(!timer.is_running());

    el.process_all_async_work().unwrap();
    let settled = runs.load(Ordering::SeqCst);
    el.process_all_pending_work(Instant::now() + Duration::from_secs(1), true, || false)
        .unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), settled, "cancelled timer stays quiet");
}

#[test]
fn test_async_timer_execute_runs_inline() {
    let el = small_loop();
    let runs = Arc::new(AtomicUsize::new(0));
    let delivered = Arc::new(Mutex::new(Vec::new()));
    let counter = runs.clone();
    let sink = delivered.clone();

    let timer = el
        .async_every(
            move || Ok(counter.fetch_add(1, Ordering::SeqCst) + 1),
            AsyncEveryOptions::new(Duration::from_secs(60)).start(false),
            DeferOptions::default().on_success(move |n| {
                sink.lock().push(n);
                Ok(())
            }),
        )
        .unwrap();

    assert_eq!(timer.execute(None).unwrap(), Some(1));
    assert_eq!(timer.execute(Some(Instant::now())).unwrap(), Some(2));
    assert_eq!(*delivered.lock(), vec![1, 2]);
    assert_eq!(el.pending_errors(), 0);
}

#[test]
fn test_async_timer_execute_propagates_work_error() {
    let el = small_loop();
    let offered = Arc::new(AtomicUsize::new(0));
    let hooked = Arc::new(AtomicUsize::new(0));
    let count = offered.clone();
    el.on_error::<Boom, _>(move |_| {
        count.fetch_add(1, Ordering::SeqCst);
    });
    let hook = hooked.clone();
    let timer = el
        .async_every(
            || -> anyhow::Result<()> { Err(Boom.into()) },
            AsyncEveryOptions::new(Duration::from_secs(60)).start(false),
            DeferOptions::default().on_error(move |_| {
                hook.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

    let err = unhandled(timer.execute(None).unwrap_err());
    assert!(err.is::<Boom>());
    assert!(timer.task().is_exception());

    // returned, not queued as well
    assert!(el.step().is_ok());
    assert_eq!(el.pending_errors(), 0);
    assert_eq!(offered.load(Ordering::SeqCst), 1);
    assert_eq!(hooked.load(Ordering::SeqCst), 1);
}

#[test]
fn test_async_timer_execute_waits_for_pooled_failure() {
    init_tracing();
    let el = small_loop();
    let offered = Arc::new(AtomicUsize::new(0));
    let hooked = Arc::new(AtomicUsize::new(0));
    let count = offered.clone();
    el.on_error::<Boom, _>(move |_| {
        count.fetch_add(1, Ordering::SeqCst);
    });
    let hook = hooked.clone();
    let timer = el
        .async_every(
            || -> anyhow::Result<u32> {
                thread::sleep(Duration::from_millis(30));
                Err(Boom.into())
            },
            AsyncEveryOptions::new(Duration::from_secs(60)),
            DeferOptions::default().on_error(move |_| {
                hook.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
    assert!(timer.task().is_queued() || timer.task().is_attached());

    let err = unhandled(timer.execute(None).unwrap_err());
    assert!(err.is::<Boom>());

    // the completion event queued by the worker finds nothing left to settle
    el.process_all_async_work().unwrap();
    assert!(el.step().is_ok());
    assert_eq!(el.pending_errors(), 0);
    assert_eq!(offered.load(Ordering::SeqCst), 1);
    assert_eq!(hooked.load(Ordering::SeqCst), 1);
}

#[test]
fn test_async_timer_execute_honours_ignore() {
    let el = small_loop();
    let hooked = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let hook = hooked.clone();
    let sink = seen.clone();
    let timer = el
        .async_every(
            || -> anyhow::Result<i32> { Err(Boom.into()) },
            AsyncEveryOptions::new(Duration::from_secs(60)).start(false),
            DeferOptions::default()
                .default_value(7)
                .on_outcome(move |value, error| {
                    sink.lock().push((value, error.is_some()));
                    Ok(ErrorDisposition::Ignore)
                })
                .on_error(move |_| {
                    hook.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .unwrap();

    assert_eq!(timer.execute(None).unwrap(), Some(7));
    assert_eq!(*seen.lock(), vec![(Some(7), true)]);
    assert_eq!(hooked.load(Ordering::SeqCst), 0);
    assert!(el.step().is_ok());
}

#[test]
fn test_async_timer_execute_reports_known_error() {
    let el = small_loop();
    let offered = Arc::new(AtomicUsize::new(0));
    let count = offered.clone();
    el.on_error::<Boom, _>(move |_| {
        count.fetch_add(1, Ordering::SeqCst);
    });
    let timer = el
        .async_every(
            || -> anyhow::Result<i32> { Err(Boom.into()) },
            AsyncEveryOptions::new(Duration::from_secs(60)).start(false),
            DeferOptions::default().known_error::<Boom>(),
        )
        .unwrap();

    assert_eq!(timer.execute(None).unwrap(), None);
    assert_eq!(offered.load(Ordering::SeqCst), 1);
    assert!(el.step().is_ok());
}

#[test]
fn test_completion_callback_may_add_callbacks() {
    let el = small_loop();
    let timer = el
        .async_every(
            || Ok(1),
            AsyncEveryOptions::new(Duration::from_secs(60)).start(false),
            DeferOptions::default(),
        )
        .unwrap();
    let late = Arc::new(AtomicUsize::new(0));
    let registrar = timer.clone();
    let counter = late.clone();
    let mut pending = Some(counter);
    timer.add_callback(Callback::success(move |_| {
        if let Some(counter) = pending.take() {
            registrar.add_callback(Callback::success(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        Ok(())
    }));

    timer.execute(None).unwrap();
    assert_eq!(late.load(Ordering::SeqCst), 0);
    timer.execute(None).unwrap();
    assert_eq!(late.load(Ordering::SeqCst), 1);
}

#[test]
fn test_async_timer_added_callback_sees_results() {
    let el = small_loop();
    let timer = el
        .async_every(
            || Ok("tick"),
            AsyncEveryOptions::new(Duration::from_secs(60)).start(false),
            DeferOptions::default(),
        )
        .unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    timer.add_callback(Callback::success(move |value| {
        sink.lock().push(value);
        Ok(())
    }));

    timer.execute(None).unwrap();
    assert_eq!(*seen.lock(), vec!["tick"]);
}

// ===== Threads =====

#[test]
fn test_step_rejected_off_loop_thread() {
    let el = small_loop();
    let remote = el.clone();
    let err = thread::spawn(move || remote.step()).join().unwrap().unwrap_err();
    assert!(matches!(err, LoopError::WrongThread { .. }));

    let mover = el.clone();
    let moved = thread::spawn(move || {
        mover.set_thread(thread::current().id());
        mover.step()
    })
    .join()
    .unwrap();
    assert!(moved.is_ok());
    assert!(!el.is_loop_thread());
}

#[test]
fn test_loop_sync_excludes_deferred_tasks() {
    let el = small_loop();
    let occupancy = Arc::new(Occupancy::default());

    for _ in 0..4 {
        let occupancy = occupancy.clone();
        el.defer(DeferOptions::default().sync_key("shared"), move || {
            occupancy.enter();
            thread::sleep(Duration::from_millis(3));
            occupancy.leave();
            Ok(())
        })
        .unwrap();
    }
    for _ in 0..3 {
        el.sync("shared", || {
            occupancy.enter();
            thread::sleep(Duration::from_millis(2));
            occupancy.leave();
        });
    }

    el.process_all_async_work().unwrap();
    assert_eq!(occupancy.peak(), 1);
}

// ===== Running =====

#[test]
fn test_wait_for_sees_delayed_event() {
    let el = small_loop();
    let fired = Arc::new(AtomicBool::new(false));
    let flag = fired.clone();
    el.once_after(Duration::from_millis(15), move || {
        flag.store(true, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();

    el.wait_for(Some(Duration::from_millis(2)), Some(Duration::from_secs(5)), || {
        fired.load(Ordering::SeqCst)
    })
    .unwrap();
}

#[test]
fn test_steps_until_deferred_work_delivered() {
    let el = small_loop();
    let delivered = Arc::new(AtomicBool::new(false));
    let flag = delivered.clone();
    el.async_call(
        || {
            thread::sleep(Duration::from_millis(20));
            Ok(())
        },
        move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        },
    )
    .unwrap();

    el.steps(Duration::from_millis(2), Some(Duration::from_secs(5))).unwrap();
    assert!(delivered.load(Ordering::SeqCst));
}

#[test]
fn test_exec_runs_timers_until_stopped() {
    let el = small_loop();
    let ticks = Arc::new(AtomicUsize::new(0));
    let counter = ticks.clone();
    let stopper = el.downgrade();
    el.every(Duration::from_millis(2), move || {
        if counter.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
            if let Some(el) = stopper.upgrade() {
                el.stop();
            }
        }
        Ok(())
    })
    .unwrap();

    el.exec(Duration::from_millis(1)).unwrap();
    assert_eq!(ticks.load(Ordering::SeqCst), 3);
}
