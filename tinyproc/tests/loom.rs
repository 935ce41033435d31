#![cfg(loom)]
//! Loom models for the lock-free core. Build with
//! `RUSTFLAGS="--cfg loom" cargo test --test loom --release`.

use loom::sync::Arc;
use loom::thread;

use tinyproc::BoundedQueue;

fn tagged(value: usize) -> *mut () {
    value as *mut ()
}

#[test]
fn loom_spsc_delivers_in_order() {
    loom::model(|| {
        // SAFETY: integer-cast test pointers.
        let queue = Arc::new(unsafe { BoundedQueue::new(2, None) });
        let producer_queue = Arc::clone(&queue);

        let producer = thread::spawn(move || {
            for value in 1..=2usize {
                while !producer_queue.push(tagged(value)) {
                    thread::yield_now();
                }
            }
        });

        let mut received = Vec::new();
        while received.len() < 2 {
            match queue.pop() {
                Some(data) => received.push(data as usize),
                None => thread::yield_now(),
            }
        }
        producer.join().unwrap();
        assert_eq!(received, vec![1, 2]);
    });
}

#[test]
fn loom_racing_producers_never_overfill() {
    loom::model(|| {
        // SAFETY: integer-cast test pointers.
        let queue = Arc::new(unsafe { BoundedQueue::new(1, None) });
        let a = Arc::clone(&queue);
        let b = Arc::clone(&queue);

        let t1 = thread::spawn(move || a.push(tagged(1)));
        let t2 = thread::spawn(move || b.push(tagged(2)));
        let first_won = t1.join().unwrap();
        let second_won = t2.join().unwrap();

        // Capacity one: exactly one racer wins.
        assert!(first_won ^ second_won);
        assert!(queue.pop().is_some());
        assert_eq!(queue.pop(), None);
    });
}

#[test]
fn loom_pop_sees_published_element() {
    loom::model(|| {
        // SAFETY: integer-cast test pointers.
        let queue = Arc::new(unsafe { BoundedQueue::new(2, None) });
        let producer_queue = Arc::clone(&queue);

        let producer = thread::spawn(move || {
            assert!(producer_queue.push(tagged(7)));
        });

        // Either the push has not published yet (None) or the element is
        // fully visible — never a torn slot.
        if let Some(data) = queue.pop() {
            assert_eq!(data as usize, 7);
        }
        producer.join().unwrap();
    });
}
