//! Condition variable coupled to a [`Mutex`].
//!
//! Backed by a generation counter used directly as a futex word: every
//! signal/broadcast bumps the counter and wakes parked waiters; every
//! waiter captures the generation it observed before releasing the mutex
//! and parks on that exact value. Bumping a counter and waking everyone
//! parked on its old value is the standard way to turn a bare futex word
//! into a wait/notify primitive.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::futex::{self, WaitResult};
use crate::mutex::Mutex;

/// Condition variable paired with a [`Mutex`] at each wait call.
pub struct Condvar {
    generation: AtomicI32,
    waiters: AtomicU32,
    initialized: AtomicU32,
}

impl Condvar {
    pub fn new() -> Result<Self> {
        Ok(Self {
            generation: AtomicI32::new(0),
            waiters: AtomicU32::new(0),
            initialized: AtomicU32::new(1),
        })
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire) != 0
    }

    /// Precondition: the calling context owns `mutex`. Atomically releases
    /// `mutex` and suspends; re-acquires `mutex` before returning, on every
    /// exit path (normal wakeup, spurious wakeup).
    pub fn wait(&self, mutex: &Mutex) -> Result<()> {
        if !self.is_initialized() {
            return Err(Error::InvalidArgument);
        }
        self.waiters.fetch_add(1, Ordering::AcqRel);
        let seen_generation = self.generation.load(Ordering::Acquire);

        if mutex.unlock().is_err() {
            self.waiters.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::Internal);
        }

        futex::wait(&self.generation, seen_generation);

        let relock = mutex.lock();
        self.waiters.fetch_sub(1, Ordering::AcqRel);
        relock
    }

    /// Same as [`Self::wait`] but bounded by `timeout`, measured from entry.
    /// The mutex is re-acquired before returning on every path, including
    /// the timeout path.
    pub fn wait_timeout(&self, mutex: &Mutex, timeout: Duration) -> Result<()> {
        if !self.is_initialized() {
            return Err(Error::InvalidArgument);
        }
        self.waiters.fetch_add(1, Ordering::AcqRel);
        let seen_generation = self.generation.load(Ordering::Acquire);

        if mutex.unlock().is_err() {
            self.waiters.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::Internal);
        }

        let outcome = futex::wait_timeout(&self.generation, seen_generation, timeout);

        let relock = mutex.lock();
        self.waiters.fetch_sub(1, Ordering::AcqRel);
        relock?;

        match outcome {
            WaitResult::Woken => Ok(()),
            WaitResult::TimedOut => Err(Error::TimedOut),
        }
    }

    /// Convenience form taking a millisecond timeout.
    pub fn timed_wait_ms(&self, mutex: &Mutex, timeout_ms: u64) -> Result<()> {
        self.wait_timeout(mutex, Duration::from_millis(timeout_ms))
    }

    /// Wakes at most one waiter. No effect if none are parked.
    pub fn signal(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        futex::wake(&self.generation, 1);
    }

    /// Wakes every current waiter, who then re-contend for the paired mutex.
    pub fn broadcast(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        futex::wake(&self.generation, i32::MAX);
    }

    /// Advisory observable waiter count, updated on entry and every exit
    /// path of a wait.
    #[must_use]
    pub fn waiter_count(&self) -> u32 {
        self.waiters.load(Ordering::Relaxed)
    }

    /// Idempotent. Must not be invoked while any thread is waiting — a
    /// caller precondition.
    pub fn dispose(&mut self) {
        self.generation.store(0, Ordering::Release);
        self.waiters.store(0, Ordering::Release);
        self.initialized.store(0, Ordering::Release);
    }

    pub fn init(&mut self) -> Result<()> {
        self.generation.store(0, Ordering::Release);
        self.waiters.store(0, Ordering::Release);
        self.initialized.store(1, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutex::MutexKind;
    use std::sync::Arc;

    #[test]
    fn signal_with_zero_waiters_has_no_observable_effect() {
        let cv = Condvar::new().unwrap();
        cv.signal();
        assert_eq!(cv.waiter_count(), 0);
    }

    #[test]
    fn dispose_then_init_yields_usable_condvar() {
        let mut cv = Condvar::new().unwrap();
        cv.dispose();
        cv.init().unwrap();
        assert_eq!(cv.waiter_count(), 0);
    }

    #[test]
    fn wait_times_out_and_still_owns_mutex_on_return() {
        let mutex = Arc::new(Mutex::new(MutexKind::Normal).unwrap());
        let cv = Condvar::new().unwrap();
        mutex.lock().unwrap();
        let result = cv.wait_timeout(&mutex, Duration::from_millis(20));
        assert_eq!(result, Err(Error::TimedOut));
        // Mutex must be owned on return even after a timeout.
        assert_eq!(mutex.try_lock().unwrap(), crate::mutex::TryLockOutcome::Busy);
        mutex.unlock().unwrap();
    }

    #[test]
    fn producer_consumer_delivers_values_in_order() {
        let mutex = Arc::new(Mutex::new(MutexKind::Normal).unwrap());
        let cv = Arc::new(Condvar::new().unwrap());
        let queue = Arc::new(std::sync::Mutex::new(Vec::<i32>::new()));

        let m2 = Arc::clone(&mutex);
        let cv2 = Arc::clone(&cv);
        let q2 = Arc::clone(&queue);
        let consumer = std::thread::spawn(move || {
            let mut received = Vec::new();
            while received.len() < 100 {
                m2.lock().unwrap();
                while q2.lock().unwrap().is_empty() {
                    cv2.wait(&m2).unwrap();
                }
                let mut q = q2.lock().unwrap();
                received.push(q.remove(0));
                drop(q);
                m2.unlock().unwrap();
            }
            received
        });

        for i in 0..100 {
            mutex.lock().unwrap();
            queue.lock().unwrap().push(i);
            cv.signal();
            mutex.unlock().unwrap();
        }

        let received = consumer.join().unwrap();
        assert_eq!(received, (0..100).collect::<Vec<_>>());
    }
}
