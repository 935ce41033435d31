//! Per-process record, handler contract, and the termination protocol.
//!
//! A [`Process`] is one slot of the scheduler's stable record array. Slots
//! are never freed; a terminating process is *released* — generation
//! bumped, user state and mailbox reclaimed, slot returned to the free
//! pool — and later reused by a fresh spawn under a new generation.
//!
//! The release protocol and the send path synchronize on the per-slot
//! [`SpinLock`]: the generation is only ever advanced while the lock is
//! held, so a sender that acquires the lock and still sees its PID's
//! generation is guaranteed the occupant it addressed is alive and its
//! mailbox intact.

use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::queue::BoundedQueue;
use crate::scheduler::ProcessQueue;
use crate::spin::SpinLock;

/// Handler invoked by a worker thread on behalf of a process.
///
/// Receives the owning queue, the process's opaque state pointer, and
/// either a just-delivered mailbox message or null (null whenever the
/// process is in the running state rather than waiting). The return value
/// steers the scheduler; see [`ProcessControl`].
pub type ProcessHandler = fn(&ProcessQueue, *mut (), *mut ()) -> ProcessControl;

/// Callback reclaiming an opaque pointer owned by the runtime at the time
/// of the call (user state at termination, undelivered messages at
/// teardown).
pub type ReleaseFn = unsafe fn(*mut ());

/// Handler verdict at the end of one invocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessControl {
    /// Terminate: release state and mailbox, recycle the slot.
    Stop,
    /// Sleep until a mailbox message arrives.
    WaitMessage,
    /// Stay runnable; the handler is re-entered with a null message.
    Continue,
}

/// Outcome of a send attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use = "a failed send leaves message ownership with the caller"]
pub enum SendResult {
    /// The message is now owned by the destination mailbox.
    Success,
    /// Mailbox full or destination mid-termination. On overflow the
    /// caller's [`MessageAction`] decided the message's fate; a
    /// terminating destination always leaves ownership with the caller.
    Fail,
    /// The slot generation no longer matches: the addressee is gone and
    /// this PID will never be deliverable again.
    ActorIsDead,
}

/// Disposition of a message that could not be enqueued.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageAction {
    /// The caller keeps ownership and may retry.
    Keep,
    /// Discard through the destination mailbox's release callback.
    Remove,
}

/// What a spawned process is made of.
///
/// `message_cap` must be non-zero; `max_messages_per_cycle` is clamped
/// into `1..=message_cap` at spawn time.
#[derive(Clone, Copy, Debug)]
pub struct ProcessSpawnParameters {
    pub handler: ProcessHandler,
    /// Opaque user state handed to every handler invocation.
    pub initial_state: *mut (),
    /// Reclaims `initial_state` at termination (or on a rejected spawn).
    pub release_state: Option<ReleaseFn>,
    /// Reclaims messages still undelivered when the mailbox is torn down,
    /// and messages discarded by [`MessageAction::Remove`].
    pub message_release: Option<ReleaseFn>,
    /// Mailbox capacity in messages.
    pub message_cap: u32,
    /// Upper bound on handler invocations per scheduling cycle.
    pub max_messages_per_cycle: u32,
}

/// Scheduling state of a live process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RunState {
    /// Re-enter the handler with no message.
    Running,
    /// Enter the handler only when a mailbox message arrives.
    Waiting,
}

/// One slot of the process array.
///
/// Field access follows a strict ownership protocol rather than per-field
/// locking:
///
/// - `id` and `owner` are fixed at queue construction.
/// - `gen` is advanced only under `release_lock`; senders read it under
///   the same lock, the spawner and PID mints read it while they own the
///   slot exclusively.
/// - All `Cell` fields are written by the spawner (which owns the slot
///   exclusively between free-pool pop and run-queue push) and thereafter
///   only touched by the single worker currently running the process.
/// - The mailbox's producer side is entered only under `release_lock`
///   with a matching generation; the consumer side only by the worker
///   currently running the process. The `Option` itself is replaced only
///   by the exclusive spawner or by the release protocol.
pub(crate) struct Process {
    /// Stable slot index.
    pub(crate) id: u32,
    /// Occupancy generation; `(id, gen)` is the address.
    pub(crate) gen: AtomicU32,
    /// Serializes termination against concurrent senders.
    pub(crate) release_lock: SpinLock,
    pub(crate) running_state: Cell<RunState>,
    pub(crate) handler: Cell<Option<ProcessHandler>>,
    pub(crate) state: Cell<*mut ()>,
    pub(crate) release_state: Cell<Option<ReleaseFn>>,
    /// `(slot, gen)` of the spawning process, captured at spawn time.
    /// A weak back-reference: holding it keeps nothing alive.
    pub(crate) parent: Cell<Option<(u32, u32)>>,
    pub(crate) mailbox: UnsafeCell<Option<BoundedQueue>>,
    pub(crate) max_messages_per_cycle: Cell<u32>,
    /// The queue owning this slot; fixed at queue construction.
    pub(crate) owner: Cell<*const ProcessQueue>,
}

// SAFETY: cross-thread access to every field is governed by the protocol
// documented on the struct: atomics for `gen`, the release lock for the
// send/termination race, and exclusive slot ownership (free-pool pop /
// single running worker) for the Cell fields. No field is reachable
// outside that protocol through the crate's public API.
unsafe impl Sync for Process {}
// SAFETY: as above; the raw pointers held in Cells are opaque handles
// whose validity is the host's contract, not a thread-affinity concern.
unsafe impl Send for Process {}

impl Process {
    pub(crate) fn new(id: u32) -> Self {
        Self {
            id,
            gen: AtomicU32::new(0),
            release_lock: SpinLock::new(),
            running_state: Cell::new(RunState::Running),
            handler: Cell::new(None),
            state: Cell::new(std::ptr::null_mut()),
            release_state: Cell::new(None),
            parent: Cell::new(None),
            mailbox: UnsafeCell::new(None),
            max_messages_per_cycle: Cell::new(0),
            owner: Cell::new(std::ptr::null()),
        }
    }

    /// Run the termination protocol and return the slot to the free pool.
    ///
    /// Order matters and is all under the release lock: the generation is
    /// advanced first, so a late sender that subsequently acquires the
    /// lock sees the mismatch; the slot is pushed back to the pool before
    /// the lock drops, so a sender that races the pool-side reuse still
    /// backs off on the held lock.
    pub(crate) fn release(&self) {
        let _guard = self.release_lock.lock();
        self.gen.fetch_add(1, Ordering::AcqRel);

        if let Some(release_state) = self.release_state.get() {
            // SAFETY: the state pointer was installed by spawn together
            // with this callback; the slot is terminating, so the runtime
            // owns the state exclusively.
            unsafe { release_state(self.state.get()) };
        }

        // Dropping the mailbox drains undelivered messages through its
        // release callback.
        // SAFETY: exclusive access — senders are excluded by the held
        // lock, and only the releasing worker consumes this mailbox.
        unsafe { *self.mailbox.get() = None };

        // SAFETY: `owner` was fixed at queue construction and the queue
        // outlives every slot operation.
        let owner = unsafe { &*self.owner.get() };
        let pushed = owner.proc_pool.push(self as *const Process as *mut ());
        debug_assert!(pushed, "free pool sized to hold every slot");
        owner.note_process_retired();
        // Guard drops last: generation bump and pool push are both
        // published before the lock is released.
    }
}
