//! Blocking mutual-exclusion lock with non-blocking try-acquire.
//!
//! The backing kernel object is a single futex word with a three-state
//! scheme (`0` unlocked, `1` locked-uncontended, `2` locked-contended), the
//! standard fast-path-uncontended / slow-path-parks discipline for a futex
//! mutex. Owner tracking (needed for the recursive/error-checking variants
//! and for `NotPermitted` detection on unlock) is layered on top via a
//! second atomic holding the owning kernel tid, rather than baking ownership
//! into the bare futex word itself.

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, Ordering};

use crate::error::{Error, Result};
use crate::futex;

/// `pthread_mutex_t`-style type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexKind {
    /// No error checking, no recursive locking. A self-relock blocks
    /// forever rather than erroring, matching `PTHREAD_MUTEX_NORMAL`
    /// semantics.
    Normal,
    /// The owning thread may re-lock without deadlock; each lock must be
    /// matched by an unlock.
    Recursive,
    /// Returns [`Error::Deadlock`] on a recursive lock attempt instead of
    /// blocking.
    ErrorCheck,
}

/// Outcome of a non-blocking acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryLockOutcome {
    Acquired,
    Busy,
}

const UNLOCKED: i32 = 0;
const LOCKED_UNCONTENDED: i32 = 1;
const LOCKED_CONTENDED: i32 = 2;

/// Blocking mutual-exclusion lock.
pub struct Mutex {
    word: AtomicI32,
    kind: MutexKind,
    owner: AtomicI64,
    recursion_depth: AtomicU32,
    initialized: AtomicU32,
}

impl Mutex {
    /// Produces an initialized, unlocked mutex of the given kind.
    ///
    /// The in-process futex word needs no kernel or heap resource beyond
    /// the struct itself, so `ResourceExhausted` cannot occur for this
    /// backend; the `Result` is kept so callers porting against a backend
    /// that *does* allocate (e.g. a named/shared-memory futex) aren't
    /// broken by a signature change.
    pub fn new(kind: MutexKind) -> Result<Self> {
        Ok(Self {
            word: AtomicI32::new(UNLOCKED),
            kind,
            owner: AtomicI64::new(0),
            recursion_depth: AtomicU32::new(0),
            initialized: AtomicU32::new(1),
        })
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire) != 0
    }

    /// Blocks until the mutex is acquired.
    pub fn lock(&self) -> Result<()> {
        if !self.is_initialized() {
            return Err(Error::InvalidArgument);
        }

        let me = current_tid();
        if self.owner.load(Ordering::Acquire) == me {
            return match self.kind {
                MutexKind::Recursive => {
                    self.recursion_depth.fetch_add(1, Ordering::AcqRel);
                    Ok(())
                }
                MutexKind::ErrorCheck => Err(Error::Deadlock),
                MutexKind::Normal => {
                    // Self-relock on a Normal mutex blocks forever rather
                    // than erroring.
                    self.park_until_acquired();
                    unreachable!("a single owner thread cannot unlock while parked on itself")
                }
            };
        }

        if self
            .word
            .compare_exchange(UNLOCKED, LOCKED_UNCONTENDED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(me, Ordering::Release);
            return Ok(());
        }

        self.park_until_acquired();
        self.owner.store(me, Ordering::Release);
        Ok(())
    }

    /// Spins/parks until the futex word transitions from unlocked to
    /// locked-contended under this caller, mirroring
    /// `futex_lock_normal`'s spin-then-park classification.
    fn park_until_acquired(&self) {
        loop {
            let observed = self.word.load(Ordering::Relaxed);
            if observed == UNLOCKED
                && self
                    .word
                    .compare_exchange(UNLOCKED, LOCKED_CONTENDED, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            if observed == LOCKED_UNCONTENDED {
                let _ = self.word.compare_exchange(
                    LOCKED_UNCONTENDED,
                    LOCKED_CONTENDED,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
            }
            futex::wait(&self.word, LOCKED_CONTENDED);
        }
    }

    /// Non-blocking acquire attempt. Never blocks, never spins beyond the
    /// underlying CAS's fast path.
    pub fn try_lock(&self) -> Result<TryLockOutcome> {
        if !self.is_initialized() {
            return Err(Error::InvalidArgument);
        }

        let me = current_tid();
        if self.owner.load(Ordering::Acquire) == me {
            return match self.kind {
                MutexKind::Recursive => {
                    self.recursion_depth.fetch_add(1, Ordering::AcqRel);
                    Ok(TryLockOutcome::Acquired)
                }
                MutexKind::Normal | MutexKind::ErrorCheck => Ok(TryLockOutcome::Busy),
            };
        }

        if self
            .word
            .compare_exchange(UNLOCKED, LOCKED_UNCONTENDED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(me, Ordering::Release);
            Ok(TryLockOutcome::Acquired)
        } else {
            Ok(TryLockOutcome::Busy)
        }
    }

    /// Releases the mutex. Fails with [`Error::NotPermitted`] if the
    /// calling context does not own it.
    pub fn unlock(&self) -> Result<()> {
        if !self.is_initialized() {
            return Err(Error::InvalidArgument);
        }

        let me = current_tid();
        if self.owner.load(Ordering::Acquire) != me {
            return Err(Error::NotPermitted);
        }

        if matches!(self.kind, MutexKind::Recursive) {
            let depth = self.recursion_depth.load(Ordering::Acquire);
            if depth > 0 {
                self.recursion_depth.store(depth - 1, Ordering::Release);
                return Ok(());
            }
        }

        self.owner.store(0, Ordering::Release);
        let prev = self.word.swap(UNLOCKED, Ordering::Release);
        if prev == LOCKED_CONTENDED {
            futex::wake(&self.word, 1);
        }
        Ok(())
    }

    /// Best-effort, advisory observable locked hint.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) != UNLOCKED
    }

    /// Idempotent; safe on an already-disposed (or never-locked) mutex.
    /// Must not be invoked while the mutex is held by any thread — that is
    /// a caller precondition, not something this backend can safely detect
    /// without a race.
    pub fn dispose(&mut self) {
        self.owner.store(0, Ordering::Release);
        self.recursion_depth.store(0, Ordering::Release);
        self.word.store(UNLOCKED, Ordering::Release);
        self.initialized.store(0, Ordering::Release);
    }

    /// Reinitializes a disposed mutex in place, keeping its kind.
    pub fn init(&mut self) -> Result<()> {
        self.word.store(UNLOCKED, Ordering::Release);
        self.owner.store(0, Ordering::Release);
        self.recursion_depth.store(0, Ordering::Release);
        self.initialized.store(1, Ordering::Release);
        Ok(())
    }

    /// Locks and returns an RAII guard that unlocks on drop. Internal
    /// plumbing for components (barrier, worker pool) that compose this
    /// mutex as bookkeeping rather than exposing it to their own callers;
    /// the public `lock`/`unlock` pair above stays bare, matching the plain
    /// `pthread_mutex_t` shape.
    pub(crate) fn lock_guard(&self) -> Result<Guard<'_>> {
        self.lock()?;
        Ok(Guard(self))
    }
}

pub(crate) struct Guard<'a>(&'a Mutex);

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        let _ = self.0.unlock();
    }
}

/// Kernel thread id of the calling thread, used for mutex ownership
/// tracking and thread identity.
#[cfg(target_os = "linux")]
pub(crate) fn current_tid() -> i64 {
    // SAFETY: SYS_gettid takes no arguments and always succeeds on Linux.
    unsafe { libc::syscall(libc::SYS_gettid) }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn current_tid() -> i64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    std::thread::current().id().hash(&mut hasher);
    (hasher.finish() as i64).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn init_lock_unlock_dispose_reaches_zeroed_state() {
        let mut m = Mutex::new(MutexKind::Normal).unwrap();
        m.lock().unwrap();
        m.unlock().unwrap();
        m.dispose();
        assert!(!m.is_initialized());
        assert!(!m.is_locked());
    }

    #[test]
    fn dispose_then_init_yields_usable_mutex() {
        let mut m = Mutex::new(MutexKind::Normal).unwrap();
        m.dispose();
        m.init().unwrap();
        assert!(m.try_lock().unwrap() == TryLockOutcome::Acquired);
        m.unlock().unwrap();
    }

    #[test]
    fn try_lock_on_contended_mutex_returns_busy() {
        let m = Arc::new(Mutex::new(MutexKind::Normal).unwrap());
        m.lock().unwrap();
        let m2 = Arc::clone(&m);
        let handle = std::thread::spawn(move || m2.try_lock().unwrap());
        assert_eq!(handle.join().unwrap(), TryLockOutcome::Busy);
        m.unlock().unwrap();
    }

    #[test]
    fn unlock_by_non_owner_is_not_permitted() {
        let m = Arc::new(Mutex::new(MutexKind::Normal).unwrap());
        m.lock().unwrap();
        let m2 = Arc::clone(&m);
        let result = std::thread::spawn(move || m2.unlock()).join().unwrap();
        assert_eq!(result, Err(Error::NotPermitted));
        m.unlock().unwrap();
    }

    #[test]
    fn recursive_mutex_relock_is_nonblocking_and_balanced() {
        let m = Mutex::new(MutexKind::Recursive).unwrap();
        m.lock().unwrap();
        m.lock().unwrap();
        assert!(m.is_locked());
        m.unlock().unwrap();
        assert!(m.is_locked());
        m.unlock().unwrap();
        assert!(!m.is_locked());
    }

    #[test]
    fn error_check_mutex_relock_is_deadlock() {
        let m = Mutex::new(MutexKind::ErrorCheck).unwrap();
        m.lock().unwrap();
        assert_eq!(m.lock(), Err(Error::Deadlock));
        m.unlock().unwrap();
    }

    #[test]
    fn error_check_try_lock_relock_is_busy_not_deadlock() {
        let m = Mutex::new(MutexKind::ErrorCheck).unwrap();
        m.lock().unwrap();
        assert_eq!(m.try_lock().unwrap(), TryLockOutcome::Busy);
        m.unlock().unwrap();
    }

    #[test]
    fn lock_on_uninitialized_mutex_is_invalid_argument() {
        let mut m = Mutex::new(MutexKind::Normal).unwrap();
        m.dispose();
        assert_eq!(m.lock(), Err(Error::InvalidArgument));
    }

    #[test]
    fn contended_lock_is_observed_by_a_second_thread() {
        let m = Arc::new(Mutex::new(MutexKind::Normal).unwrap());
        m.lock().unwrap();
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let m2 = Arc::clone(&m);
        let c2 = Arc::clone(&counter);
        let handle = std::thread::spawn(move || {
            m2.lock().unwrap();
            c2.fetch_add(1, Ordering::SeqCst);
            m2.unlock().unwrap();
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        m.unlock().unwrap();
        handle.join().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
