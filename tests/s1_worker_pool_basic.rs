//! 4 workers, 1000 tasks each incrementing a shared counter under a single
//! mutex. After `wait` + `shutdown`, the counter must read exactly 1000.

use std::sync::Arc;

use ghostrt::{Mutex, MutexKind, WorkerPool};

mod common;

struct Counter {
    mutex: Mutex,
    value: std::cell::UnsafeCell<u64>,
}

// SAFETY: `value` is only ever read/written while `mutex` is held.
unsafe impl Send for Counter {}
unsafe impl Sync for Counter {}

#[test]
fn s1_worker_pool_basic() {
    common::init_tracing();
    let pool = WorkerPool::new(4).unwrap();
    let counter = Arc::new(Counter {
        mutex: Mutex::new(MutexKind::Normal).unwrap(),
        value: std::cell::UnsafeCell::new(0),
    });

    for _ in 0..1000 {
        let counter = Arc::clone(&counter);
        pool.submit(move || {
            counter.mutex.lock().unwrap();
            // SAFETY: the mutex above serializes every access to `value`.
            unsafe {
                *counter.value.get() += 1;
            }
            counter.mutex.unlock().unwrap();
        })
        .unwrap();
    }

    pool.wait();
    std::thread::sleep(std::time::Duration::from_millis(50));
    pool.shutdown();

    // SAFETY: every submitted task has completed by the time `shutdown`
    // (which joins every worker) returns.
    let total = unsafe { *counter.value.get() };
    assert_eq!(total, 1000);
}
