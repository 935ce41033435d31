//! Lock-free bounded MPMC queue with sequence-stamped slots.
//!
//! One queue type serves three roles in the runtime: the global run queue,
//! the free-slot pool, and every per-process mailbox. Elements are raw
//! pointers (`*mut ()`) because all three traffic in scheduler-managed
//! handles; the scheduler casts them to the appropriate type and is
//! responsible for their validity.
//!
//! The algorithm is the classic sequence-counter ring: each slot carries a
//! `u32` sequence, producers claim tickets by CAS on `last`, consumers by
//! CAS on `first`, and the slot sequence publishes completion. A slot is
//! writable for ticket `t` when `seq == t`, readable when `seq == t + 1`,
//! and recycled for the next lap by storing `seq = t + cap`. All counters
//! wrap; only `ticket % cap` and the sign of `seq - ticket` are ever
//! observed, so wraparound is benign.
//!
//! Neither `push` nor `pop` ever blocks: the only failures are a full queue
//! (`push` returns `false`) and an empty one (`pop` returns `None`). A
//! producer that sleeps between claiming its ticket and publishing the
//! sequence stalls consumers that catch up to that slot, but cannot stall
//! anyone otherwise; in the normal regime producers are ahead.

#[cfg(loom)]
use loom::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
#[cfg(not(loom))]
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use std::ptr;

/// Teardown callback invoked on every element still queued when the queue
/// is dropped.
pub type ElementRelease = unsafe fn(*mut ());

/// Pad-and-align wrapper keeping the two ring counters on separate cache
/// lines.
#[repr(align(64))]
struct CachePadded<T> {
    value: T,
}

struct Slot {
    seq: AtomicU32,
    data: AtomicPtr<()>,
}

/// Fixed-capacity lock-free MPMC ring of pointer-sized elements.
pub struct BoundedQueue {
    slots: Box<[Slot]>,
    cap: u32,
    /// Consumer ticket counter (monotonic, wrapping).
    first: CachePadded<AtomicU32>,
    /// Producer ticket counter (monotonic, wrapping).
    last: CachePadded<AtomicU32>,
    element_release: Option<ElementRelease>,
}

impl BoundedQueue {
    /// Create a queue of `cap` slots. Slot `i` starts with sequence `i`.
    ///
    /// # Panics
    ///
    /// Panics if `cap` is zero.
    ///
    /// # Safety
    ///
    /// Every pointer pushed into the queue must remain valid until it is
    /// popped or, when `element_release` is registered, until the queue is
    /// dropped and the callback has consumed it.
    pub unsafe fn new(cap: u32, element_release: Option<ElementRelease>) -> Self {
        assert!(cap > 0, "queue capacity must be non-zero");
        let slots = (0..cap)
            .map(|i| Slot {
                seq: AtomicU32::new(i),
                data: AtomicPtr::new(ptr::null_mut()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            cap,
            first: CachePadded {
                value: AtomicU32::new(0),
            },
            last: CachePadded {
                value: AtomicU32::new(0),
            },
            element_release,
        }
    }

    /// Attempt to enqueue `data`. Returns `false` iff the queue is full.
    pub fn push(&self, data: *mut ()) -> bool {
        let mut last = self.last.value.load(Ordering::Acquire);
        loop {
            let slot = &self.slots[(last % self.cap) as usize];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(last) as i32;
            if diff == 0 {
                match self.last.value.compare_exchange_weak(
                    last,
                    last.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        // Ticket claimed: the slot is ours until the seq
                        // store publishes it to the paired pop.
                        slot.data.store(data, Ordering::Release);
                        slot.seq.store(last.wrapping_add(1), Ordering::Release);
                        return true;
                    }
                    Err(current) => last = current,
                }
            } else if diff < 0 {
                // The slot still holds an element from `cap` tickets ago.
                return false;
            } else {
                last = self.last.value.load(Ordering::Acquire);
            }
        }
    }

    /// Attempt to dequeue. Returns `None` iff the queue is empty.
    pub fn pop(&self) -> Option<*mut ()> {
        let mut first = self.first.value.load(Ordering::Acquire);
        loop {
            let slot = &self.slots[(first % self.cap) as usize];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(first.wrapping_add(1)) as i32;
            if diff == 0 {
                match self.first.value.compare_exchange_weak(
                    first,
                    first.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        let data = slot.data.load(Ordering::Acquire);
                        // Free the slot for the producer one lap ahead.
                        slot.seq
                            .store(first.wrapping_add(self.cap), Ordering::Release);
                        return Some(data);
                    }
                    Err(current) => first = current,
                }
            } else if diff < 0 {
                return None;
            } else {
                first = self.first.value.load(Ordering::Acquire);
            }
        }
    }

    /// Queue capacity in slots.
    pub fn capacity(&self) -> u32 {
        self.cap
    }

    /// Approximate number of stored elements (racy).
    pub fn len(&self) -> u32 {
        let first = self.first.value.load(Ordering::Relaxed);
        let last = self.last.value.load(Ordering::Relaxed);
        last.wrapping_sub(first)
    }

    /// Whether the queue appears empty (racy).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The teardown callback registered at construction, if any.
    pub fn element_release(&self) -> Option<ElementRelease> {
        self.element_release
    }
}

impl Drop for BoundedQueue {
    fn drop(&mut self) {
        // Drain leftovers through the registered callback. Without one the
        // remaining pointers are borrowed handles and are simply forgotten.
        if let Some(release) = self.element_release {
            while let Some(data) = self.pop() {
                // SAFETY: `new` requires pushed pointers to stay valid until
                // the callback consumes them.
                unsafe { release(data) };
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    fn tagged(value: usize) -> *mut () {
        value as *mut ()
    }

    #[test]
    fn push_pop_is_fifo() {
        // SAFETY: test elements are integers cast to pointers.
        let queue = unsafe { BoundedQueue::new(4, None) };
        assert!(queue.push(tagged(1)));
        assert!(queue.push(tagged(2)));
        assert!(queue.push(tagged(3)));
        assert_eq!(queue.pop(), Some(tagged(1)));
        assert_eq!(queue.pop(), Some(tagged(2)));
        assert_eq!(queue.pop(), Some(tagged(3)));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn push_fails_when_full() {
        // SAFETY: integer-cast test pointers.
        let queue = unsafe { BoundedQueue::new(2, None) };
        assert!(queue.push(tagged(1)));
        assert!(queue.push(tagged(2)));
        assert!(!queue.push(tagged(3)));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(), Some(tagged(1)));
        assert!(queue.push(tagged(3)));
    }

    #[test]
    fn pop_on_empty_returns_none() {
        // SAFETY: integer-cast test pointers.
        let queue = unsafe { BoundedQueue::new(2, None) };
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn order_survives_counter_wraparound() {
        // Many laps around a tiny ring exercise the wrapping arithmetic on
        // tickets and slot sequences.
        // SAFETY: integer-cast test pointers.
        let queue = unsafe { BoundedQueue::new(2, None) };
        for lap in 0..10_000usize {
            assert!(queue.push(tagged(2 * lap + 1)));
            assert!(queue.push(tagged(2 * lap + 2)));
            assert_eq!(queue.pop(), Some(tagged(2 * lap + 1)));
            assert_eq!(queue.pop(), Some(tagged(2 * lap + 2)));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn drop_releases_remaining_elements() {
        static RELEASED: AtomicUsize = AtomicUsize::new(0);

        unsafe fn count_and_free(data: *mut ()) {
            // SAFETY: every element in this test is a leaked Box<u32>.
            drop(unsafe { Box::from_raw(data.cast::<u32>()) });
            RELEASED.fetch_add(1, Ordering::SeqCst);
        }

        // SAFETY: elements are leaked boxes consumed exactly once by the
        // callback.
        let queue = unsafe { BoundedQueue::new(8, Some(count_and_free)) };
        for i in 0..5u32 {
            assert!(queue.push(Box::into_raw(Box::new(i)).cast::<()>()));
        }
        let popped = queue.pop().expect("queue holds five elements");
        // SAFETY: popped element is a leaked Box<u32> now owned here.
        drop(unsafe { Box::from_raw(popped.cast::<u32>()) });

        drop(queue);
        assert_eq!(RELEASED.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn concurrent_producers_and_consumers_lose_nothing() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: usize = 1_000;

        // SAFETY: integer-cast test pointers (offset by one so that no
        // element is the null pointer).
        let queue = Arc::new(unsafe { BoundedQueue::new(64, None) });
        let consumed = Arc::new(AtomicUsize::new(0));
        let sum = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let value = p * PER_PRODUCER + i + 1;
                    while !queue.push(tagged(value)) {
                        thread::yield_now();
                    }
                }
            }));
        }
        for _ in 0..CONSUMERS {
            let queue = Arc::clone(&queue);
            let consumed = Arc::clone(&consumed);
            let sum = Arc::clone(&sum);
            handles.push(thread::spawn(move || loop {
                if consumed.load(Ordering::SeqCst) >= PRODUCERS * PER_PRODUCER {
                    break;
                }
                match queue.pop() {
                    Some(data) => {
                        sum.fetch_add(data as usize, Ordering::SeqCst);
                        consumed.fetch_add(1, Ordering::SeqCst);
                    }
                    None => thread::yield_now(),
                }
            }));
        }
        for handle in handles {
            handle.join().expect("queue test thread panicked");
        }

        let total = PRODUCERS * PER_PRODUCER;
        assert_eq!(consumed.load(Ordering::SeqCst), total);
        assert_eq!(sum.load(Ordering::SeqCst), total * (total + 1) / 2);
        assert!(queue.is_empty());
    }
}
