//! The process queue: slot pool, run queue, and worker threads.
//!
//! A [`ProcessQueue`] owns a fixed array of process slots, a free pool and
//! a run queue (both [`BoundedQueue`]s of slot pointers), and a set of
//! worker threads. Workers drain the run queue, give each process one
//! scheduling cycle (up to its per-cycle message budget), and either
//! re-enqueue it or retire it. Processes execute cooperatively: the only
//! suspension points are handler returns, and a handler that never
//! returns parks its worker thread forever.
//!
//! Spawning and sending are callable from any thread, including from
//! inside handlers. All runtime failures are returned as values — a full
//! mailbox, a dead addressee, an exhausted slot pool — never raised.

use std::cell::Cell;
use std::num::NonZeroUsize;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crate::pid::Pid;
use crate::process::{
    MessageAction, Process, ProcessControl, ProcessSpawnParameters, RunState, SendResult,
};
use crate::queue::BoundedQueue;

/// Hard ceiling on worker threads per queue.
pub const MAX_WORKERS: usize = 256;

// ── Thread-local current process ────────────────────────────────────────

thread_local! {
    /// The process currently being dispatched on this worker thread.
    static CURRENT_PROCESS: Cell<*const Process> = const { Cell::new(ptr::null()) };
}

/// Set the current process for this thread, returning the previous value.
fn set_current_process(proc: *const Process) -> *const Process {
    CURRENT_PROCESS.with(|c| c.replace(proc))
}

fn current_process() -> *const Process {
    CURRENT_PROCESS.with(Cell::get)
}

// ── Process queue ───────────────────────────────────────────────────────

/// A pool of cooperative processes multiplexed over worker threads.
///
/// Created with [`ProcessQueue::new`]; torn down by [`shutdown`] (also run
/// on drop), which joins the workers and releases every still-live
/// process. Multiple independent queues may coexist; they do not share
/// processes.
///
/// [`shutdown`]: ProcessQueue::shutdown
pub struct ProcessQueue {
    // Drop order is load-bearing: the run queue's teardown callback
    // releases still-live processes, which touches the free pool and the
    // process array below it.
    run_queue: BoundedQueue,
    pub(crate) proc_pool: BoundedQueue,
    processes: Box<[Process]>,
    process_cap: u32,
    proc_count: AtomicU32,
    stopped: AtomicBool,
    /// Worker handles, `take`-n at shutdown (`JoinHandle` is not `Sync`).
    workers: Mutex<Vec<Option<JoinHandle<()>>>>,

    // ── Observability counters ──────────────────────────────────────────
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    processes_spawned: AtomicU64,
    processes_retired: AtomicU64,
}

/// Consolidated counter snapshot; fields are captured at approximately the
/// same instant.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueMetrics {
    /// Messages accepted by a mailbox since queue creation.
    pub messages_sent: u64,
    /// Messages delivered to or drained by a handler's process.
    pub messages_received: u64,
    /// Successful spawns since queue creation.
    pub processes_spawned: u64,
    /// Completed releases (self-stopped or shutdown-drained).
    pub processes_retired: u64,
    /// Processes currently alive.
    pub live_processes: u32,
    /// Approximate run-queue depth.
    pub run_queue_len: u32,
}

/// Raw queue pointer handed to worker threads.
#[derive(Clone, Copy)]
struct QueueRef(*const ProcessQueue);

// SAFETY: workers are joined before the queue is freed, so the pointer
// outlives every thread that holds it.
unsafe impl Send for QueueRef {}

/// Run-queue teardown hook: any process still enqueued when the queue
/// shuts down goes through the full release protocol.
unsafe fn release_enqueued_process(data: *mut ()) {
    // SAFETY: only process-slot pointers are ever pushed onto the run
    // queue, and slots live as long as their owning ProcessQueue.
    unsafe { (*data.cast::<Process>().cast_const()).release() };
}

/// Pick the worker count: `0` selects the machine's parallelism, anything
/// above [`MAX_WORKERS`] is clamped.
fn resolve_worker_count(requested: usize) -> usize {
    let count = if requested == 0 {
        thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(4)
    } else {
        requested
    };
    if count > MAX_WORKERS {
        log::warn!("worker count {count} exceeds {MAX_WORKERS}, clamping");
        MAX_WORKERS
    } else {
        count
    }
}

fn lock_workers(queue: &ProcessQueue) -> MutexGuard<'_, Vec<Option<JoinHandle<()>>>> {
    match queue.workers.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl ProcessQueue {
    /// Create a queue with `process_cap` slots and `thread_count` workers
    /// (`0` = one per available core).
    ///
    /// The returned box must stay where it is for the lifetime of the
    /// queue; workers and PIDs hold its address.
    ///
    /// # Panics
    ///
    /// Panics if `process_cap` is zero or a worker thread cannot be
    /// spawned (fatal by design — a queue without its workers is
    /// useless).
    pub fn new(process_cap: u32, thread_count: usize) -> Box<ProcessQueue> {
        assert!(process_cap > 0, "process capacity must be non-zero");
        let worker_count = resolve_worker_count(thread_count);

        let queue = Box::new(ProcessQueue {
            // SAFETY: the run queue only ever holds process-slot pointers,
            // which outlive it (see struct drop-order note).
            run_queue: unsafe {
                BoundedQueue::new(process_cap, Some(release_enqueued_process))
            },
            // SAFETY: same pointers, no teardown callback — pooled slots
            // hold no resources.
            proc_pool: unsafe { BoundedQueue::new(process_cap, None) },
            processes: (0..process_cap).map(Process::new).collect(),
            process_cap,
            proc_count: AtomicU32::new(0),
            stopped: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            processes_spawned: AtomicU64::new(0),
            processes_retired: AtomicU64::new(0),
        });

        let owner: *const ProcessQueue = &*queue;
        for proc in queue.processes.iter() {
            proc.owner.set(owner);
            let pushed = queue.proc_pool.push(proc as *const Process as *mut ());
            debug_assert!(pushed, "pool capacity equals slot count");
        }

        let mut handles = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let queue_ref = QueueRef(owner);
            let handle = thread::Builder::new()
                .name(format!("tinyproc-worker-{id}"))
                .spawn(move || worker_loop(queue_ref))
                .expect("failed to spawn worker thread");
            handles.push(Some(handle));
        }
        *lock_workers(&queue) = handles;

        queue
    }

    /// Spawn a process and schedule it.
    ///
    /// Returns `None` when the pool is at capacity; the rejected
    /// `initial_state` is passed to `release_state` (if any) exactly once.
    ///
    /// Callable from any thread; inside a handler, the spawning process is
    /// recorded as the child's parent. The returned PID is live
    /// immediately — the process is on the run queue before this returns.
    ///
    /// # Panics
    ///
    /// Panics if `params.message_cap` is zero.
    ///
    /// # Safety
    ///
    /// - `initial_state` must satisfy the contract of `params.handler` and
    ///   `params.release_state`.
    /// - The call must not race [`shutdown`](ProcessQueue::shutdown): a
    ///   process enqueued after the final drain would never be released.
    pub unsafe fn spawn(&self, params: ProcessSpawnParameters) -> Option<Pid> {
        // Reserve before touching the pool; undo on overflow.
        let prior = self.proc_count.fetch_add(1, Ordering::AcqRel);
        if prior >= self.process_cap {
            self.proc_count.fetch_sub(1, Ordering::AcqRel);
            if let Some(release_state) = params.release_state {
                // SAFETY: the rejected state is still exclusively the
                // caller's; the callback consumes it per its contract.
                unsafe { release_state(params.initial_state) };
            }
            return None;
        }

        // The reservation guarantees a slot, but a terminating process
        // publishes its slot in two steps (pool push under the release
        // lock, count decrement after), so the pool may look empty for a
        // moment.
        let proc = loop {
            match self.proc_pool.pop() {
                // SAFETY: the pool only holds slot pointers and slots live
                // as long as the queue.
                Some(data) => break unsafe { &*data.cast::<Process>().cast_const() },
                None => thread::yield_now(),
            }
        };

        let parent = current_process();
        proc.parent.set(if parent.is_null() {
            None
        } else {
            // SAFETY: the current process is mid-handler on this thread
            // and cannot be released concurrently.
            let parent = unsafe { &*parent };
            Some((parent.id, parent.gen.load(Ordering::Acquire)))
        });
        proc.handler.set(Some(params.handler));
        proc.state.set(params.initial_state);
        proc.release_state.set(params.release_state);
        proc.running_state.set(RunState::Running);
        proc.max_messages_per_cycle
            .set(params.max_messages_per_cycle.min(params.message_cap).max(1));
        // SAFETY: the slot is exclusively ours between pool pop and run
        // queue push; stale senders bail on the generation check before
        // touching the mailbox.
        unsafe {
            *proc.mailbox.get() =
                Some(BoundedQueue::new(params.message_cap, params.message_release));
        }

        let pid = Pid {
            queue: self,
            slot: proc.id,
            gen: proc.gen.load(Ordering::Acquire),
        };

        // Sized to the slot count, so this only stalls while other threads
        // are mid-publication.
        let data = proc as *const Process as *mut ();
        while !self.run_queue.push(data) {
            thread::yield_now();
        }

        self.processes_spawned.fetch_add(1, Ordering::Relaxed);
        Some(pid)
    }

    /// Pop one message from the calling handler's own mailbox.
    ///
    /// Non-blocking; `None` when the mailbox is empty or when called from
    /// outside a handler. Lets a [`ProcessControl::Continue`] process
    /// drain opportunistically. The caller assumes ownership of the
    /// returned message.
    pub fn receive(&self) -> Option<*mut ()> {
        let proc = current_process();
        if proc.is_null() {
            return None;
        }
        // SAFETY: the current process is mid-handler on this thread.
        let proc = unsafe { &*proc };
        // SAFETY: a live process always has a mailbox; only this worker
        // consumes it.
        let mailbox = unsafe { (*proc.mailbox.get()).as_ref() };
        let message = mailbox.expect("live process has a mailbox").pop();
        if message.is_some() {
            self.messages_received.fetch_add(1, Ordering::Relaxed);
        }
        message
    }

    /// PID of the process the calling handler runs as, or `None` outside
    /// a handler.
    pub fn self_pid(&self) -> Option<Pid> {
        let proc = current_process();
        if proc.is_null() {
            return None;
        }
        // SAFETY: the current process is mid-handler on this thread.
        let proc = unsafe { &*proc };
        Some(Pid {
            queue: proc.owner.get(),
            slot: proc.id,
            gen: proc.gen.load(Ordering::Acquire),
        })
    }

    /// PID of the process that spawned the caller, or `None` for a root
    /// process (or outside a handler).
    ///
    /// The parent link is the `(slot, generation)` pair captured at spawn
    /// time, resolved against the caller's owning queue; if the parent
    /// has since terminated, sends through the returned PID report
    /// [`SendResult::ActorIsDead`].
    pub fn parent(&self) -> Option<Pid> {
        let proc = current_process();
        if proc.is_null() {
            return None;
        }
        // SAFETY: the current process is mid-handler on this thread.
        let proc = unsafe { &*proc };
        let (slot, gen) = proc.parent.get()?;
        Some(Pid {
            queue: proc.owner.get(),
            slot,
            gen,
        })
    }

    /// Number of live processes.
    pub fn process_count(&self) -> u32 {
        self.proc_count.load(Ordering::Acquire)
    }

    /// Snapshot of the queue's counters.
    pub fn metrics(&self) -> QueueMetrics {
        QueueMetrics {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            processes_spawned: self.processes_spawned.load(Ordering::Relaxed),
            processes_retired: self.processes_retired.load(Ordering::Relaxed),
            live_processes: self.proc_count.load(Ordering::Acquire),
            run_queue_len: self.run_queue.len(),
        }
    }

    /// Stop the runtime: flag the workers, join them, then release every
    /// still-live process (reclaiming user state and undelivered
    /// messages). Idempotent; also run on drop.
    ///
    /// Must not be called from inside a handler — a worker cannot join
    /// itself.
    pub fn shutdown(&self) {
        if self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let mut workers = lock_workers(self);
        for handle in workers.iter_mut() {
            if let Some(handle) = handle.take() {
                let _ = handle.join();
            }
        }
        drop(workers);

        // With the workers gone, every live process sits on the run
        // queue; drain them through the same teardown hook the queue's
        // own drop would use.
        log::debug!(
            "process queue stopped, draining {} live processes",
            self.proc_count.load(Ordering::Acquire)
        );
        while let Some(data) = self.run_queue.pop() {
            // SAFETY: run-queue elements are live slot pointers.
            unsafe { release_enqueued_process(data) };
            // Mirror the worker retire path: the slot is back in the pool,
            // so the live count must drop with it.
            self.proc_count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    // ── Internals ───────────────────────────────────────────────────────

    /// Send path; see [`Pid::send`] for the public contract.
    pub(crate) unsafe fn send_to(
        &self,
        dest: Pid,
        message: *mut (),
        action: MessageAction,
    ) -> SendResult {
        debug_assert!(ptr::eq(dest.queue, self), "PID routed to foreign queue");
        let proc = &self.processes[dest.slot as usize];

        // Try-only: a destination mid-termination holds the lock, and
        // stalling senders on a dying process helps nobody.
        let Some(_guard) = proc.release_lock.try_lock() else {
            return SendResult::Fail;
        };

        if proc.gen.load(Ordering::Acquire) != dest.gen {
            return SendResult::ActorIsDead;
        }

        // SAFETY: generation matched under the lock — the occupant is
        // alive, so its mailbox is initialized and cannot be torn down
        // until the lock is released.
        let mailbox = unsafe { (*proc.mailbox.get()).as_ref() };
        let mailbox = mailbox.expect("live process has a mailbox");
        if mailbox.push(message) {
            self.messages_sent.fetch_add(1, Ordering::Relaxed);
            SendResult::Success
        } else {
            if action == MessageAction::Remove {
                if let Some(release) = mailbox.element_release() {
                    // SAFETY: the caller handed the message over for
                    // disposal; the callback consumes it exactly once.
                    unsafe { release(message) };
                }
            }
            SendResult::Fail
        }
        // Guard drops here: the lock is released on every path.
    }

    pub(crate) fn note_process_retired(&self) {
        self.processes_retired.fetch_add(1, Ordering::Relaxed);
    }

    /// One scheduling cycle for `proc`: up to its per-cycle budget of
    /// handler invocations, then re-enqueue or retire.
    fn run_cycle(&self, proc: &Process) {
        let previous = set_current_process(proc);
        let budget = proc.max_messages_per_cycle.get();
        let mut push_back = true;
        let mut dispatched = 0;

        while dispatched < budget && push_back {
            if proc.running_state.get() == RunState::Running {
                push_back = self.dispatch(proc, ptr::null_mut());
            } else {
                // SAFETY: a live process always has a mailbox; this worker
                // is its only consumer.
                let mailbox = unsafe { (*proc.mailbox.get()).as_ref() };
                match mailbox.expect("live process has a mailbox").pop() {
                    Some(message) => {
                        self.messages_received.fetch_add(1, Ordering::Relaxed);
                        push_back = self.dispatch(proc, message);
                    }
                    // Still waiting; ends the cycle, stays enqueued.
                    None => break,
                }
            }
            dispatched += 1;
        }
        set_current_process(previous);

        if push_back {
            // Sized to the slot count; transient fullness only.
            let data = proc as *const Process as *mut ();
            while !self.run_queue.push(data) {
                thread::yield_now();
            }
        } else {
            // Retired. The slot was repooled inside the release protocol;
            // the count drops second, which is why spawn tolerates a
            // transiently empty pool.
            self.proc_count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Invoke the handler once and apply its verdict. Returns whether the
    /// process stays scheduled.
    fn dispatch(&self, proc: &Process, message: *mut ()) -> bool {
        let handler = proc.handler.get().expect("spawned process has a handler");
        match handler(self, proc.state.get(), message) {
            ProcessControl::Stop => {
                proc.release();
                false
            }
            ProcessControl::WaitMessage => {
                proc.running_state.set(RunState::Waiting);
                true
            }
            ProcessControl::Continue => {
                proc.running_state.set(RunState::Running);
                true
            }
        }
    }
}

impl Drop for ProcessQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Main loop executed by each worker thread.
fn worker_loop(queue: QueueRef) {
    // SAFETY: shutdown joins every worker before the queue is freed.
    let queue = unsafe { &*queue.0 };
    while !queue.stopped.load(Ordering::Acquire) {
        match queue.run_queue.pop() {
            // SAFETY: run-queue elements are live slot pointers.
            Some(data) => queue.run_cycle(unsafe { &*data.cast::<Process>().cast_const() }),
            None => thread::yield_now(),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────
