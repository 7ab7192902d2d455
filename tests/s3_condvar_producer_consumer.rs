//! One producer, one consumer, a shared queue protected by mutex `m` with
//! condition `c`. The producer submits integers 0..99; the consumer must
//! receive them in submission order.

use std::cell::UnsafeCell;
use std::sync::Arc;

use ghostrt::{Condvar, Mutex, MutexKind};

mod common;

struct SharedQueue {
    mutex: Mutex,
    cv: Condvar,
    items: UnsafeCell<Vec<i32>>,
}

// SAFETY: `items` is only ever touched while `mutex` is held.
unsafe impl Send for SharedQueue {}
unsafe impl Sync for SharedQueue {}

#[test]
fn s3_condvar_producer_consumer() {
    common::init_tracing();
    let shared = Arc::new(SharedQueue {
        mutex: Mutex::new(MutexKind::Normal).unwrap(),
        cv: Condvar::new().unwrap(),
        items: UnsafeCell::new(Vec::new()),
    });

    let consumer_shared = Arc::clone(&shared);
    let consumer = std::thread::spawn(move || {
        let mut received = Vec::new();
        while received.len() < 100 {
            consumer_shared.mutex.lock().unwrap();
            // SAFETY: the mutex above is held for every access to `items`.
            while unsafe { &*consumer_shared.items.get() }.is_empty() {
                consumer_shared.cv.wait(&consumer_shared.mutex).unwrap();
            }
            let value = unsafe { &mut *consumer_shared.items.get() }.remove(0);
            received.push(value);
            consumer_shared.mutex.unlock().unwrap();
        }
        received
    });

    for i in 0..100 {
        shared.mutex.lock().unwrap();
        // SAFETY: the mutex above is held for every access to `items`.
        unsafe { &mut *shared.items.get() }.push(i);
        shared.cv.signal();
        shared.mutex.unlock().unwrap();
    }

    let received = consumer.join().unwrap();
    assert_eq!(received, (0..100).collect::<Vec<_>>());
}
