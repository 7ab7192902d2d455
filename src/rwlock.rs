//! Reader-writer lock.
//!
//! A single `i32` futex word encodes the lock state — `0` unlocked, `-1`
//! write-locked, `N > 0` for `N` live readers — and every transition is a
//! CAS loop that falls back to a futex wait on contention, using the same
//! [`crate::futex::wait`]/[`crate::futex::wake`] helpers [`crate::mutex`]
//! and [`crate::condvar`] already share.
//!
//! This lock is reader-preferring and carries no writer-preference variant
//! selection: the CAS loop's natural behavior already has new readers join
//! as long as the word is `>= 0`, so a pending writer does not block new
//! readers.

use std::sync::atomic::{AtomicI32, Ordering};

use crate::error::{Error, Result};

const UNLOCKED: i32 = 0;
const WRITE_LOCKED: i32 = -1;

/// Reader-writer lock over a bare futex word (no data wrapping, matching
/// [`crate::mutex::Mutex`]'s "bare primitive, caller pairs it with data"
/// convention).
pub struct RwLock {
    word: AtomicI32,
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RwLock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            word: AtomicI32::new(UNLOCKED),
        }
    }

    /// Acquires a shared (reader) hold. Blocks while a writer holds the
    /// lock; any number of readers may hold it concurrently up to
    /// `i32::MAX - 1`, past which [`Error::ResourceExhausted`] is returned.
    pub fn read_lock(&self) -> Result<()> {
        loop {
            let state = self.word.load(Ordering::Acquire);
            if state >= 0 {
                if state == i32::MAX {
                    return Err(Error::ResourceExhausted);
                }
                if self
                    .word
                    .compare_exchange(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return Ok(());
                }
                continue;
            }
            crate::futex::wait(&self.word, state);
        }
    }

    /// Non-blocking reader acquire; returns [`Error::Busy`] if a writer
    /// currently holds the lock.
    pub fn try_read_lock(&self) -> Result<()> {
        let state = self.word.load(Ordering::Acquire);
        if state < 0 {
            return Err(Error::Busy);
        }
        if state == i32::MAX {
            return Err(Error::ResourceExhausted);
        }
        self.word
            .compare_exchange(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
            .map(|_| ())
            .map_err(|_| Error::Busy)
    }

    /// Acquires an exclusive (writer) hold. Blocks while any reader or
    /// writer holds the lock.
    pub fn write_lock(&self) -> Result<()> {
        loop {
            if self
                .word
                .compare_exchange(UNLOCKED, WRITE_LOCKED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(());
            }
            let state = self.word.load(Ordering::Relaxed);
            crate::futex::wait(&self.word, state);
        }
    }

    /// Non-blocking writer acquire; returns [`Error::Busy`] if any hold is
    /// already outstanding.
    pub fn try_write_lock(&self) -> Result<()> {
        self.word
            .compare_exchange(UNLOCKED, WRITE_LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .map(|_| ())
            .map_err(|_| Error::Busy)
    }

    /// Releases one hold, reader or writer. Returns [`Error::NotPermitted`]
    /// if the lock is not currently held by anyone — the caller is
    /// responsible for only unlocking a hold it owns, the same contract
    /// [`crate::mutex::Mutex::unlock`] documents.
    pub fn unlock(&self) -> Result<()> {
        loop {
            let state = self.word.load(Ordering::Acquire);
            if state == UNLOCKED {
                return Err(Error::NotPermitted);
            }
            if state == WRITE_LOCKED {
                if self
                    .word
                    .compare_exchange(WRITE_LOCKED, UNLOCKED, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    crate::futex::wake(&self.word, i32::MAX);
                    return Ok(());
                }
                continue;
            }
            // state > 0: one fewer reader.
            if self
                .word
                .compare_exchange(state, state - 1, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                if state == 1 {
                    crate::futex::wake(&self.word, i32::MAX);
                }
                return Ok(());
            }
        }
    }

    /// Advisory reader count (0 if unlocked or write-locked), for tests and
    /// diagnostics.
    #[must_use]
    pub fn reader_count(&self) -> u32 {
        match self.word.load(Ordering::Acquire) {
            n if n > 0 => n as u32,
            _ => 0,
        }
    }

    #[must_use]
    pub fn is_write_locked(&self) -> bool {
        self.word.load(Ordering::Acquire) == WRITE_LOCKED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::time::Duration;

    #[test]
    fn unlock_without_a_hold_is_not_permitted() {
        let lock = RwLock::new();
        assert_eq!(lock.unlock().unwrap_err(), Error::NotPermitted);
    }

    #[test]
    fn multiple_readers_hold_concurrently() {
        let lock = RwLock::new();
        lock.read_lock().unwrap();
        lock.read_lock().unwrap();
        assert_eq!(lock.reader_count(), 2);
        lock.unlock().unwrap();
        lock.unlock().unwrap();
        assert_eq!(lock.reader_count(), 0);
    }

    #[test]
    fn try_write_lock_fails_while_a_reader_holds_it() {
        let lock = RwLock::new();
        lock.read_lock().unwrap();
        assert_eq!(lock.try_write_lock().unwrap_err(), Error::Busy);
        lock.unlock().unwrap();
    }

    #[test]
    fn try_read_lock_fails_while_a_writer_holds_it() {
        let lock = RwLock::new();
        lock.write_lock().unwrap();
        assert_eq!(lock.try_read_lock().unwrap_err(), Error::Busy);
        lock.unlock().unwrap();
    }

    #[test]
    fn writer_excludes_concurrent_readers() {
        let lock = Arc::new(RwLock::new());
        let seen_during_write = Arc::new(AtomicUsize::new(0));

        lock.write_lock().unwrap();
        let l2 = Arc::clone(&lock);
        let seen = Arc::clone(&seen_during_write);
        let reader = std::thread::spawn(move || {
            l2.read_lock().unwrap();
            seen.fetch_add(1, AtomicOrdering::SeqCst);
            l2.unlock().unwrap();
        });
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(seen_during_write.load(AtomicOrdering::SeqCst), 0);
        lock.unlock().unwrap();
        reader.join().unwrap();
        assert_eq!(seen_during_write.load(AtomicOrdering::SeqCst), 1);
    }
}
