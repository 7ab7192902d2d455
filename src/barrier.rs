//! N-party rendezvous, one-shot or cyclic, optional timeout.
//!
//! Built atop [`Mutex`] + [`Condvar`]. The count/generation/destroyed/
//! exhausted bookkeeping is protected entirely by the embedded mutex; the
//! fields don't need to be atomic themselves because the mutex already
//! serializes every access, so they're plain `UnsafeCell`s with
//! `Send + Sync` granted explicitly once that invariant is established.

use std::cell::UnsafeCell;
use std::time::{Duration, Instant};

use crate::condvar::Condvar;
use crate::error::{Error, Result};
use crate::mutex::{Mutex, MutexKind};

/// N-party rendezvous barrier.
pub struct Barrier {
    mutex: Mutex,
    cv: Condvar,
    threshold: u32,
    cyclic: bool,
    count: UnsafeCell<u32>,
    generation: UnsafeCell<u64>,
    destroyed: UnsafeCell<bool>,
    /// Set once a one-shot barrier has released its single cohort: further
    /// waits on an exhausted one-shot barrier block forever rather than
    /// erroring.
    exhausted: UnsafeCell<bool>,
}

// SAFETY: every field below is read or written only while `self.mutex` is
// held by the accessing thread (enforced entirely inside this module).
unsafe impl Send for Barrier {}
unsafe impl Sync for Barrier {}

impl Barrier {
    /// `threshold == 0` is rejected with [`Error::InvalidArgument`].
    pub fn new(threshold: u32, cyclic: bool) -> Result<Self> {
        if threshold == 0 {
            return Err(Error::InvalidArgument);
        }
        Ok(Self {
            mutex: Mutex::new(MutexKind::Normal)?,
            cv: Condvar::new()?,
            threshold,
            cyclic,
            count: UnsafeCell::new(0),
            generation: UnsafeCell::new(0),
            destroyed: UnsafeCell::new(false),
            exhausted: UnsafeCell::new(false),
        })
    }

    /// # Safety invariant
    /// Only ever called while `self.mutex` is locked by the caller.
    fn count_mut(&self) -> &mut u32 {
        // SAFETY: caller holds `self.mutex`.
        unsafe { &mut *self.count.get() }
    }
    fn generation_mut(&self) -> &mut u64 {
        // SAFETY: caller holds `self.mutex`.
        unsafe { &mut *self.generation.get() }
    }
    fn destroyed_mut(&self) -> &mut bool {
        // SAFETY: caller holds `self.mutex`.
        unsafe { &mut *self.destroyed.get() }
    }
    fn exhausted_mut(&self) -> &mut bool {
        // SAFETY: caller holds `self.mutex`.
        unsafe { &mut *self.exhausted.get() }
    }

    /// Blocks until `threshold` parties have called `wait`.
    pub fn wait(&self) -> Result<()> {
        let guard = self.mutex.lock_guard()?;

        if *self.destroyed_mut() {
            return Err(Error::InvalidArgument);
        }

        // An exhausted one-shot barrier never releases another cohort:
        // any further wait blocks forever.
        if !self.cyclic && *self.exhausted_mut() {
            let observed_generation = *self.generation_mut();
            loop {
                self.cv.wait(&self.mutex)?;
                if *self.destroyed_mut() {
                    return Err(Error::InvalidArgument);
                }
                if *self.generation_mut() != observed_generation {
                    return Ok(());
                }
            }
        }

        *self.count_mut() += 1;
        if *self.count_mut() == self.threshold {
            *self.generation_mut() += 1;
            *self.count_mut() = 0;
            if !self.cyclic {
                *self.exhausted_mut() = true;
            }
            tracing::debug!(generation = *self.generation_mut(), "barrier generation advanced");
            self.cv.broadcast();
            drop(guard);
            return Ok(());
        }

        let observed_generation = *self.generation_mut();
        loop {
            self.cv.wait(&self.mutex)?;
            if *self.destroyed_mut() {
                return Err(Error::InvalidArgument);
            }
            if *self.generation_mut() != observed_generation {
                return Ok(());
            }
        }
    }

    /// Same as [`Self::wait`] but returns [`Error::TimedOut`] if `timeout`
    /// elapses before the generation advances.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let guard = self.mutex.lock_guard()?;

        if *self.destroyed_mut() {
            return Err(Error::InvalidArgument);
        }

        if !self.cyclic && *self.exhausted_mut() {
            let observed_generation = *self.generation_mut();
            return self.wait_for_generation_change(observed_generation, deadline);
        }

        *self.count_mut() += 1;
        if *self.count_mut() == self.threshold {
            *self.generation_mut() += 1;
            *self.count_mut() = 0;
            if !self.cyclic {
                *self.exhausted_mut() = true;
            }
            tracing::debug!(generation = *self.generation_mut(), "barrier generation advanced");
            self.cv.broadcast();
            drop(guard);
            return Ok(());
        }

        let observed_generation = *self.generation_mut();
        self.wait_for_generation_change(observed_generation, deadline)
    }

    fn wait_for_generation_change(&self, observed_generation: u64, deadline: Instant) -> Result<()> {
        loop {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) if !d.is_zero() => d,
                _ => return Err(Error::TimedOut),
            };
            self.cv.wait_timeout(&self.mutex, remaining)?;
            if *self.destroyed_mut() {
                return Err(Error::InvalidArgument);
            }
            if *self.generation_mut() != observed_generation {
                return Ok(());
            }
        }
    }

    /// Cyclic barriers only: advances the generation, zeros the count, and
    /// broadcasts. In-flight waiters observe the generation change and
    /// return success. One-shot barriers ignore this call.
    pub fn reset(&self) -> Result<()> {
        if !self.cyclic {
            return Ok(());
        }
        let _guard = self.mutex.lock_guard()?;
        *self.generation_mut() += 1;
        *self.count_mut() = 0;
        tracing::debug!(generation = *self.generation_mut(), "barrier reset");
        self.cv.broadcast();
        Ok(())
    }

    /// The generation this barrier is currently on (advisory, for tests and
    /// diagnostics).
    pub fn generation(&self) -> Result<u64> {
        let _guard = self.mutex.lock_guard()?;
        Ok(*self.generation_mut())
    }

    /// Sets destroyed, wakes all waiters (who must then return
    /// [`Error::InvalidArgument`]), and disposes the embedded condition
    /// variable and mutex in that order.
    ///
    /// Takes `&self`, like every other Barrier method, so a barrier shared
    /// via `Arc` can be destroyed from one thread while others are mid-wait
    /// — the caller precondition is that `destroy` itself is not called
    /// twice concurrently, not that no one is waiting.
    pub fn destroy(&self) {
        {
            let _guard = self.mutex.lock_guard().ok();
            // SAFETY: the guard above (when acquired) serializes this write
            // with every other read/write of `destroyed`.
            unsafe { *self.destroyed.get() = true };
            self.cv.broadcast();
        }
        tracing::debug!("barrier destroyed");
        // SAFETY: `destroyed` is now visible to every thread that acquires
        // the mutex afterward, and this function is documented as callable
        // at most once, so no concurrent reader of `mutex`/`cv` state
        // survives past this point without having observed `destroyed`.
        let cv_mut = unsafe { &mut *(std::ptr::addr_of!(self.cv) as *mut Condvar) };
        let mutex_mut = unsafe { &mut *(std::ptr::addr_of!(self.mutex) as *mut Mutex) };
        cv_mut.dispose();
        mutex_mut.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn threshold_zero_is_rejected() {
        assert_eq!(Barrier::new(0, true).unwrap_err(), Error::InvalidArgument);
    }

    #[test]
    fn cyclic_barrier_advances_generation_each_round() {
        let barrier = Arc::new(Barrier::new(3, true).unwrap());
        let rounds = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..3 {
            let b = Arc::clone(&barrier);
            let r = Arc::clone(&rounds);
            handles.push(std::thread::spawn(move || {
                for _ in 0..5 {
                    b.wait().unwrap();
                    r.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(rounds.load(Ordering::SeqCst), 15);
        assert_eq!(barrier.generation().unwrap(), 5);
    }

    #[test]
    fn one_shot_barrier_releases_exactly_once() {
        let barrier = Arc::new(Barrier::new(2, false).unwrap());
        let b2 = Arc::clone(&barrier);
        let handle = std::thread::spawn(move || b2.wait());
        assert!(barrier.wait().is_ok());
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn destroyed_barrier_wakes_waiters_with_error() {
        let barrier = Arc::new(Barrier::new(2, true).unwrap());
        let b2 = Arc::clone(&barrier);
        let handle = std::thread::spawn(move || b2.wait());
        std::thread::sleep(Duration::from_millis(20));
        barrier.destroy();
        let result = handle.join().unwrap();
        assert_eq!(result, Err(Error::InvalidArgument));
    }

    #[test]
    fn wait_timeout_elapses_without_enough_parties() {
        let barrier = Barrier::new(2, true).unwrap();
        let result = barrier.wait_timeout(Duration::from_millis(20));
        assert_eq!(result, Err(Error::TimedOut));
    }
}
