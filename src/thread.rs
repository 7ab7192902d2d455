//! Preemptive OS-thread lifecycle: create, join, detach, dispose.
//!
//! OS thread creation itself is delegated to [`std::thread::Builder`] rather
//! than a hand-rolled `clone(2)`/mmap-stack trampoline; `std::thread` already
//! gives a sound, portable primitive to build the lifecycle state machine on
//! top of. The state machine itself is the interesting part: a `state` word
//! with compare-exchange transitions (Fresh → Started → Finished → Joined,
//! with a Detached branch off to the side), a retval slot written exactly
//! once by the running thread before it publishes Finished, and "a future
//! joiner (or disposer) reaps whatever is left" for a thread that finished
//! while detached.
//!
//! Retval/timestamps/tid are plain atomics rather than an `UnsafeCell`
//! behind an `unsafe impl Send`/`Sync` — `std::thread` already gives a full
//! runtime underneath, so there is no reason to hand-roll a data race where
//! an atomic already expresses the same happens-before relationship.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::futex;

const FRESH: u32 = 0;
const STARTED: u32 = 1;
const DETACHED: u32 = 2;
const FINISHED: u32 = 3;
const JOINED: u32 = 4;
const DISPOSED: u32 = 5;

/// Observable lifecycle state of a [`Thread`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Fresh,
    Started,
    Detached,
    Finished,
    Joined,
    Disposed,
}

impl ThreadState {
    fn from_repr(repr: u32) -> Self {
        match repr {
            FRESH => ThreadState::Fresh,
            STARTED => ThreadState::Started,
            DETACHED => ThreadState::Detached,
            FINISHED => ThreadState::Finished,
            JOINED => ThreadState::Joined,
            _ => ThreadState::Disposed,
        }
    }
}

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

fn now_nanos() -> u64 {
    epoch().elapsed().as_nanos() as u64
}

struct Shared {
    state: AtomicU32,
    /// Futex word doubling as the "has the running thread finished" signal:
    /// 0 while Started/Detached, 1 once the running thread has published
    /// Finished. `join`/`dispose` park on this instead of spin-polling
    /// `state` directly.
    finished_word: AtomicI32,
    retval: AtomicUsize,
    cancel_requested: AtomicBool,
    start_nanos: AtomicU64,
    finish_nanos: AtomicU64,
    /// The kernel thread id of the spawned thread, written once from inside
    /// the trampoline right after it starts running. Zero until then.
    tid: AtomicI64,
}

/// A single OS thread's lifecycle handle.
///
/// Not `Clone`: like a `pthread_t` handle, a `Thread` is meant to be owned
/// by whoever is responsible for eventually joining or detaching it.
pub struct Thread {
    shared: Arc<Shared>,
    join_handle: StdMutex<Option<std::thread::JoinHandle<()>>>,
    name: Option<String>,
}

impl Thread {
    /// A handle in the Fresh state; no OS thread exists yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: AtomicU32::new(FRESH),
                finished_word: AtomicI32::new(0),
                retval: AtomicUsize::new(0),
                cancel_requested: AtomicBool::new(false),
                start_nanos: AtomicU64::new(0),
                finish_nanos: AtomicU64::new(0),
                tid: AtomicI64::new(0),
            }),
            join_handle: StdMutex::new(None),
            name: None,
        }
    }

    /// `Thread::new()` followed by `start(entry)` in one call.
    pub fn spawn<F>(entry: F) -> Result<Self>
    where
        F: FnOnce() -> usize + Send + 'static,
    {
        let thread = Self::new();
        thread.start(entry)?;
        Ok(thread)
    }

    /// Same as [`Self::spawn`] but names the underlying OS thread, which
    /// shows up in debuggers/`/proc`/panic messages.
    pub fn spawn_named<F>(name: impl Into<String>, entry: F) -> Result<Self>
    where
        F: FnOnce() -> usize + Send + 'static,
    {
        let mut thread = Self::new();
        thread.name = Some(name.into());
        thread.start(entry)?;
        Ok(thread)
    }

    /// Creation contract: Fresh → Started, then spawns the OS thread running
    /// `entry`. Fails with [`Error::Busy`] if not Fresh,
    /// [`Error::ResourceExhausted`] if the OS refuses to create the thread.
    pub fn start<F>(&self, entry: F) -> Result<()>
    where
        F: FnOnce() -> usize + Send + 'static,
    {
        self.shared
            .state
            .compare_exchange(FRESH, STARTED, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::Busy)?;
        self.shared.start_nanos.store(now_nanos(), Ordering::Release);
        tracing::debug!(thread = self.name.as_deref().unwrap_or("<unnamed>"), "thread started");

        let shared = Arc::clone(&self.shared);
        let thread_name = self.name.clone();
        let mut builder = std::thread::Builder::new();
        if let Some(name) = &self.name {
            builder = builder.name(name.clone());
        }

        let spawned = builder.spawn(move || {
            shared.tid.store(crate::mutex::current_tid(), Ordering::Release);
            let retval = entry();
            shared.retval.store(retval, Ordering::Relaxed);
            shared.finish_nanos.store(now_nanos(), Ordering::Relaxed);
            tracing::debug!(thread = thread_name.as_deref().unwrap_or("<unnamed>"), "thread finished");

            // Publish Finished regardless of whether we were detached
            // meanwhile: both Started and Detached transition to Finished.
            loop {
                let cur = shared.state.load(Ordering::Acquire);
                if shared
                    .state
                    .compare_exchange(cur, FINISHED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
            }
            shared.finished_word.store(1, Ordering::Release);
            futex::wake(&shared.finished_word, i32::MAX);
        });

        match spawned {
            Ok(handle) => {
                *self.join_handle.lock().unwrap() = Some(handle);
                Ok(())
            }
            Err(_) => {
                self.shared.state.store(FRESH, Ordering::Release);
                Err(Error::ResourceExhausted)
            }
        }
    }

    fn block_until_finished(&self) {
        while self.shared.finished_word.load(Ordering::Acquire) == 0 {
            futex::wait(&self.shared.finished_word, 0);
        }
    }

    /// Blocks until Finished, transfers the return value, transitions to
    /// Joined. Join is once-only — a second join (or a join after detach)
    /// returns [`Error::Detached`].
    pub fn join(&self) -> Result<usize> {
        loop {
            match self.state() {
                ThreadState::Fresh => return Err(Error::NotStarted),
                ThreadState::Detached | ThreadState::Joined => return Err(Error::Detached),
                ThreadState::Disposed => return Err(Error::InvalidArgument),
                ThreadState::Started => {
                    self.block_until_finished();
                    continue;
                }
                ThreadState::Finished => {
                    let won = self
                        .shared
                        .state
                        .compare_exchange(FINISHED, JOINED, Ordering::AcqRel, Ordering::Acquire);
                    if won.is_err() {
                        // Lost a race against a concurrent join(); retry and
                        // observe Joined.
                        continue;
                    }
                    if let Some(handle) = self.join_handle.lock().unwrap().take() {
                        let _ = handle.join();
                    }
                    let retval = self.shared.retval.load(Ordering::Acquire);
                    tracing::debug!(thread = self.name.as_deref().unwrap_or("<unnamed>"), "thread joined");
                    return Ok(retval);
                }
            }
        }
    }

    /// Marks the handle non-joinable; OS teardown becomes the runtime's
    /// responsibility (the stored `JoinHandle` is dropped, which detaches it
    /// at the OS level). Detach is once-only and mutually exclusive with
    /// join.
    pub fn detach(&self) -> Result<()> {
        loop {
            match self.state() {
                ThreadState::Fresh => return Err(Error::NotStarted),
                ThreadState::Joined => return Err(Error::Detached),
                ThreadState::Detached | ThreadState::Finished => return Err(Error::Busy),
                ThreadState::Disposed => return Err(Error::InvalidArgument),
                ThreadState::Started => {
                    let won = self
                        .shared
                        .state
                        .compare_exchange(STARTED, DETACHED, Ordering::AcqRel, Ordering::Acquire);
                    if won.is_err() {
                        continue;
                    }
                    drop(self.join_handle.lock().unwrap().take());
                    tracing::debug!(thread = self.name.as_deref().unwrap_or("<unnamed>"), "thread detached");
                    return Ok(());
                }
            }
        }
    }

    /// Safe on Fresh, Joined, or Detached/Finished. If the thread is still
    /// running (Started, or Detached-but-not-yet-Finished), blocks until
    /// Finished rather than leaking the OS thread or racing its finished
    /// flag.
    ///
    /// Calling `dispose` concurrently with `join`/`detach`/`dispose` on the
    /// same handle is a caller precondition violation, the same as disposing
    /// a [`crate::mutex::Mutex`] while another thread holds it.
    pub fn dispose(&mut self) -> Result<()> {
        match self.state() {
            ThreadState::Disposed => return Err(Error::InvalidArgument),
            ThreadState::Started | ThreadState::Detached | ThreadState::Finished => {
                self.block_until_finished();
            }
            ThreadState::Fresh | ThreadState::Joined => {}
        }
        if let Some(handle) = self.join_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.shared.state.store(DISPOSED, Ordering::Release);
        Ok(())
    }

    /// Sets the cooperative cancel-requested flag. There is no forced
    /// termination; the running thread must poll [`Self::cancel_requested`]
    /// at its own safe points.
    pub fn request_cancel(&self) {
        self.shared.cancel_requested.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn cancel_requested(&self) -> bool {
        self.shared.cancel_requested.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn state(&self) -> ThreadState {
        ThreadState::from_repr(self.shared.state.load(Ordering::Acquire))
    }

    /// Time between `start` and now-or-forever, or `None` before `start`.
    #[must_use]
    pub fn started_at(&self) -> Option<Duration> {
        match self.shared.start_nanos.load(Ordering::Acquire) {
            0 => None,
            n => Some(Duration::from_nanos(n)),
        }
    }

    /// Time the running thread finished, or `None` before it has.
    #[must_use]
    pub fn finished_at(&self) -> Option<Duration> {
        match self.shared.finish_nanos.load(Ordering::Acquire) {
            0 => None,
            n => Some(Duration::from_nanos(n)),
        }
    }

    /// The spawned thread's kernel thread id, once it has started running.
    /// `None` before `start` has been called or before the new thread has
    /// had a chance to record its tid.
    #[must_use]
    pub fn tid(&self) -> Option<i64> {
        match self.shared.tid.load(Ordering::Acquire) {
            0 => None,
            tid => Some(tid),
        }
    }

    /// Two handles compare equal iff they refer to the same live OS thread,
    /// identified by kernel thread id. Identity of a handle that has not yet
    /// started, or that has finished/been disposed, is undefined, so this is
    /// advisory only.
    #[must_use]
    pub fn is_same_thread(&self, other: &Thread) -> bool {
        match (self.tid(), other.tid()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl Default for Thread {
    fn default() -> Self {
        Self::new()
    }
}

/// Yields the current OS thread's remaining timeslice.
pub fn yield_now() {
    std::thread::yield_now();
}

/// Sleeps for at least `duration`. `std::thread::sleep` already restarts
/// against the remaining budget across signal interruptions on this
/// platform, so there is no need for a hand-rolled `nanosleep` retry loop.
pub fn sleep(duration: Duration) {
    std::thread::sleep(duration);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    #[test]
    fn spawn_and_join_returns_value() {
        let thread = Thread::spawn(|| 42usize).unwrap();
        assert_eq!(thread.join().unwrap(), 42);
    }

    #[test]
    fn join_is_once_only() {
        let thread = Thread::spawn(|| 7usize).unwrap();
        assert_eq!(thread.join().unwrap(), 7);
        assert_eq!(thread.join().unwrap_err(), Error::Detached);
    }

    #[test]
    fn join_before_start_is_not_started() {
        let thread = Thread::new();
        assert_eq!(thread.join().unwrap_err(), Error::NotStarted);
    }

    #[test]
    fn start_on_non_fresh_handle_is_busy() {
        let thread = Thread::spawn(|| 0usize).unwrap();
        let err = thread.start(|| 0usize).unwrap_err();
        assert_eq!(err, Error::Busy);
        thread.join().unwrap();
    }

    #[test]
    fn detach_is_once_only_and_exclusive_with_join() {
        let thread = Thread::spawn(|| {
            std::thread::sleep(Duration::from_millis(10));
            0usize
        })
        .unwrap();
        thread.detach().unwrap();
        assert_eq!(thread.detach().unwrap_err(), Error::Busy);
        assert_eq!(thread.join().unwrap_err(), Error::Detached);
    }

    #[test]
    fn dispose_blocks_until_detached_thread_finishes() {
        let done = Arc::new(StdAtomicUsize::new(0));
        let done2 = Arc::clone(&done);
        let mut thread = Thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            done2.store(1, Ordering::SeqCst);
            0usize
        })
        .unwrap();
        thread.detach().unwrap();
        thread.dispose().unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(thread.state(), ThreadState::Disposed);
    }

    #[test]
    fn dispose_is_safe_on_fresh_and_joined() {
        let mut fresh = Thread::new();
        fresh.dispose().unwrap();
        assert_eq!(fresh.state(), ThreadState::Disposed);

        let mut joined = Thread::spawn(|| 0usize).unwrap();
        joined.join().unwrap();
        joined.dispose().unwrap();
        assert_eq!(joined.state(), ThreadState::Disposed);
    }

    #[test]
    fn cancel_flag_is_observable_from_running_thread() {
        let thread = Thread::new();
        thread.request_cancel();
        assert!(thread.cancel_requested());
    }

    #[test]
    fn started_and_finished_timestamps_are_ordered() {
        let thread = Thread::spawn(|| {
            std::thread::sleep(Duration::from_millis(5));
            0usize
        })
        .unwrap();
        thread.join().unwrap();
        assert!(thread.started_at().unwrap() <= thread.finished_at().unwrap());
    }

    #[test]
    fn tid_is_recorded_once_started_and_is_same_thread_agrees() {
        let fresh = Thread::new();
        assert_eq!(fresh.tid(), None);

        let mut thread = Thread::spawn(|| {
            std::thread::sleep(Duration::from_millis(20));
            0usize
        })
        .unwrap();
        while thread.tid().is_none() {
            std::thread::yield_now();
        }
        assert!(thread.is_same_thread(&thread));
        assert!(!thread.is_same_thread(&fresh));
        thread.join().unwrap();
        thread.dispose().unwrap();
    }
}
