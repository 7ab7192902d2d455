//! Linux futex wait/wake helpers shared by [`crate::mutex`], [`crate::condvar`],
//! and [`crate::rwlock`].
//!
//! Calls the raw futex syscall directly rather than going through a glibc
//! wrapper. This module is the one place platform syscall selection lives:
//! `cfg(target_os = "linux")` is the seam today, and a second backend (e.g.
//! a parking-based one for non-Linux targets) slots in here without
//! touching callers.

use std::sync::atomic::AtomicI32;
use std::time::Duration;

/// Outcome of a bounded futex wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The word changed (or a spurious wakeup occurred) before the deadline.
    Woken,
    /// The deadline elapsed first.
    TimedOut,
}

/// Block while `word` still holds `expected`. Returns as soon as the kernel
/// observes a different value. Spurious wakeups are possible; the caller is
/// expected to re-check its own predicate after returning.
#[cfg(target_os = "linux")]
pub fn wait(word: &AtomicI32, expected: i32) {
    loop {
        // SAFETY: `word` is a valid, aligned `i32`-sized atomic for the duration of this call.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word as *const AtomicI32 as *const i32,
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                expected,
                std::ptr::null::<libc::timespec>(),
            )
        };
        if rc == 0 {
            return;
        }
        let errno = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(0);
        match errno {
            libc::EAGAIN => return, // word already changed before we parked
            libc::EINTR => continue,
            _ => return,
        }
    }
}

/// Block while `word` still holds `expected`, for at most `timeout`. The
/// deadline is measured from entry; an interrupted wait is restarted
/// against whatever budget remains.
#[cfg(target_os = "linux")]
pub fn wait_timeout(word: &AtomicI32, expected: i32, timeout: Duration) -> WaitResult {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        let remaining = match deadline.checked_duration_since(std::time::Instant::now()) {
            Some(d) if !d.is_zero() => d,
            _ => return WaitResult::TimedOut,
        };
        let ts = libc::timespec {
            tv_sec: remaining.as_secs() as libc::time_t,
            tv_nsec: libc::c_long::from(remaining.subsec_nanos()),
        };
        // SAFETY: `word` is a valid, aligned `i32`-sized atomic; `ts` is a local, valid relative timeout.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_futex,
                word as *const AtomicI32 as *const i32,
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                expected,
                &ts as *const libc::timespec,
            )
        };
        if rc == 0 {
            return WaitResult::Woken;
        }
        let errno = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(0);
        match errno {
            libc::EAGAIN => return WaitResult::Woken,
            libc::ETIMEDOUT => return WaitResult::TimedOut,
            libc::EINTR => continue,
            _ => return WaitResult::Woken,
        }
    }
}

/// Wake up to `count` waiters parked on `word`.
#[cfg(target_os = "linux")]
pub fn wake(word: &AtomicI32, count: i32) {
    // SAFETY: `word` is a valid, aligned `i32`-sized atomic.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word as *const AtomicI32 as *const i32,
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            count,
        );
    }
}

#[cfg(not(target_os = "linux"))]
pub fn wait(_word: &AtomicI32, _expected: i32) {
    std::thread::yield_now();
}

#[cfg(not(target_os = "linux"))]
pub fn wait_timeout(_word: &AtomicI32, _expected: i32, timeout: Duration) -> WaitResult {
    std::thread::sleep(std::cmp::min(timeout, Duration::from_millis(1)));
    WaitResult::Woken
}

#[cfg(not(target_os = "linux"))]
pub fn wake(_word: &AtomicI32, _count: i32) {}
