//! Single-threaded cooperative event loop
//!
//! Events, timers and every-step callbacks run on the loop thread. Blocking
//! work is deferred to the embedded [`ThreadPool`](crate::ThreadPool) and its
//! completion is queued back onto the loop as an event.

pub mod defer;
pub mod event;
#[allow(clippy::module_inception)]
pub mod event_loop;
pub mod forward;
pub mod handlers;
pub mod timer;

pub use defer::{AsyncEveryOptions, Callback, DeferOptions, ErrorDisposition, EveryOptions, OnError};
pub use event::{Event, EventFn, EventHandle};
pub use event_loop::{Called, EventLoop, Scheduled, WeakEventLoop};
pub use forward::{filtered_task, forwarding_task, Accessor, Delegator};
pub use handlers::{matches, ErrorMatcher, HandlerId};
pub use timer::{AsyncTimer, Timer};
