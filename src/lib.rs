//! # ghostrt
//!
//! Portable low-level concurrency primitives, built bottom-up on raw Linux
//! futexes: a mutex and condition variable, an n-party barrier, a thread
//! lifecycle wrapper, a fixed-size worker pool, cooperative x86_64 fibers,
//! and a deterministic ghost-step engine for speculative branching state.
//!
//! Each component builds only on the ones beneath it, per the layering
//! `mutex`/`condvar` → `barrier` → `thread` → `pool` → `fiber` → `ghost`,
//! with `rwlock` a sibling of `mutex` at the bottom. Errors across every
//! component share one [`error::Error`] taxonomy mapped to POSIX errno
//! values, so callers bridging to C-style return codes have one mapping
//! to learn rather than one per component.

pub mod barrier;
pub mod condvar;
pub mod error;
pub mod fiber;
pub mod futex;
pub mod ghost;
pub mod mutex;
pub mod pool;
pub mod rwlock;
pub mod thread;

pub use barrier::Barrier;
pub use condvar::Condvar;
pub use error::{Error, Result};
pub use fiber::Fiber;
pub use ghost::{Candidate, GhostEngine, GhostHandle, LedgerEntry};
pub use mutex::{Mutex, MutexKind};
pub use pool::WorkerPool;
pub use rwlock::RwLock;
pub use thread::{Thread, ThreadState};
