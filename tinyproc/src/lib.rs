//! Tiny cooperative actor runtime.
//!
//! A [`ProcessQueue`] multiplexes a fixed-capacity pool of lightweight
//! processes over a small set of worker threads. Processes are addressed
//! by generation-stamped [`Pid`]s, communicate exclusively by asynchronous
//! message passing, and yield only by returning from their handler. Slots
//! are recycled without ever being freed, so a queue of a million slots
//! can churn through short-lived processes indefinitely with no per-actor
//! OS resources and no garbage collector.
//!
//! # Architecture
//!
//! ```text
//! Layer 0: spin, queue      (atomic primitives: release lock, MPMC ring)
//! Layer 1: pid, process     (addressing, per-slot record, lifecycle)
//! Layer 2: scheduler        (pool + run queue + workers + send/receive)
//! ```
//!
//! The same bounded MPMC ring backs the run queue, the free-slot pool,
//! and every mailbox; the lifecycle protocol (generation counter plus a
//! per-slot release lock) makes sends to dead-and-recycled slots fail
//! safely instead of reaching the wrong recipient.
//!
//! # Example
//!
//! ```
//! use std::ptr;
//! use tinyproc::{ProcessControl, ProcessQueue, ProcessSpawnParameters};
//!
//! fn one_shot(_q: &ProcessQueue, _state: *mut (), _msg: *mut ()) -> ProcessControl {
//!     ProcessControl::Stop
//! }
//!
//! let queue = ProcessQueue::new(16, 2);
//! // SAFETY: null state, no callbacks that dereference it.
//! let pid = unsafe {
//!     queue.spawn(ProcessSpawnParameters {
//!         handler: one_shot,
//!         initial_state: ptr::null_mut(),
//!         release_state: None,
//!         message_release: None,
//!         message_cap: 4,
//!         max_messages_per_cycle: 4,
//!     })
//! };
//! assert!(pid.is_some());
//! queue.shutdown();
//! ```
//!
//! Messages and user state are opaque pointers owned by the host; the
//! runtime only ever hands them back — to handlers on delivery, or to the
//! registered release callbacks at termination and teardown.

pub mod pid;
pub mod process;
pub mod queue;
pub mod scheduler;
mod spin;

pub use pid::Pid;
pub use process::{
    MessageAction, ProcessControl, ProcessHandler, ProcessSpawnParameters, ReleaseFn, SendResult,
};
pub use queue::{BoundedQueue, ElementRelease};
pub use scheduler::{ProcessQueue, QueueMetrics, MAX_WORKERS};
