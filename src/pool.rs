//! Fixed worker count, FIFO task queue, quiesce + shutdown.
//!
//! Built atop [`crate::thread::Thread`] + [`crate::mutex::Mutex`] +
//! [`crate::condvar::Condvar`]. The queue mutex/condvar pairing and the
//! worker loop's "acquire, wait while empty and not stopping, detach head,
//! release, invoke outside the lock" discipline follows the same
//! single-lock-owns-these-fields pattern as [`crate::barrier::Barrier`].
//! `shutdown` takes `&self` for the same reason `Barrier::destroy` does:
//! a pool shared via `Arc` must be shuttable-down from one thread while
//! others are mid-`submit`, so they observe the stop flag and return
//! `Cancelled` rather than racing a by-value consuming call.
//!
//! A task is a boxed `FnOnce` rather than a C-style function-pointer +
//! argument pair — a Rust closure already carries its argument, so the
//! pair collapses into one type without losing anything the protocol needs.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crate::condvar::Condvar;
use crate::error::{Error, Result};
use crate::mutex::{Mutex, MutexKind};
use crate::thread::Thread;

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    mutex: Mutex,
    not_empty: Condvar,
    queue: UnsafeCell<VecDeque<Task>>,
    stop: UnsafeCell<bool>,
}

// SAFETY: `queue` and `stop` are read or written only while `mutex` is held
// by the accessing thread (enforced entirely inside this module), the same
// discipline `Barrier` uses for its own fields.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

impl Inner {
    fn queue_mut(&self) -> &mut VecDeque<Task> {
        // SAFETY: caller holds `self.mutex`.
        unsafe { &mut *self.queue.get() }
    }
    fn stop_mut(&self) -> &mut bool {
        // SAFETY: caller holds `self.mutex`.
        unsafe { &mut *self.stop.get() }
    }
}

fn worker_loop(inner: Arc<Inner>) {
    loop {
        let guard = match inner.mutex.lock_guard() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        loop {
            if !inner.queue_mut().is_empty() || *inner.stop_mut() {
                break;
            }
            if inner.not_empty.wait(&inner.mutex).is_err() {
                return;
            }
        }
        if *inner.stop_mut() {
            drop(guard);
            return;
        }
        let task = inner.queue_mut().pop_front();
        drop(guard);
        if let Some(task) = task {
            // Task functions are the caller's responsibility not to panic;
            // a panicking task takes only this worker down, same as a
            // misbehaving pthread worker would.
            task();
        }
    }
}

/// Fixed-size pool of worker threads draining a FIFO task queue.
pub struct WorkerPool {
    inner: Arc<Inner>,
    workers: StdMutex<Vec<Thread>>,
}

impl WorkerPool {
    /// Spawns `num_workers` worker threads. Rejects `num_workers == 0`
    /// with [`Error::InvalidArgument`].
    pub fn new(num_workers: usize) -> Result<Self> {
        if num_workers == 0 {
            return Err(Error::InvalidArgument);
        }
        let inner = Arc::new(Inner {
            mutex: Mutex::new(MutexKind::Normal)?,
            not_empty: Condvar::new()?,
            queue: UnsafeCell::new(VecDeque::new()),
            stop: UnsafeCell::new(false),
        });
        let mut workers = Vec::with_capacity(num_workers);
        for index in 0..num_workers {
            let worker_inner = Arc::clone(&inner);
            let thread = Thread::spawn_named(format!("ghostrt-worker-{index}"), move || {
                worker_loop(worker_inner);
                0usize
            })?;
            workers.push(thread);
        }
        Ok(Self {
            inner,
            workers: StdMutex::new(workers),
        })
    }

    /// Rejects with [`Error::Cancelled`] once [`Self::shutdown`] has been
    /// requested; otherwise appends to the tail and signals one waiting
    /// worker. Never blocks on queue capacity — the queue is unbounded.
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.inner.mutex.lock_guard()?;
        if *self.inner.stop_mut() {
            return Err(Error::Cancelled);
        }
        self.inner.queue_mut().push_back(Box::new(task));
        self.inner.not_empty.signal();
        drop(guard);
        Ok(())
    }

    /// Quiesces the pool: polls the queue length with a 1ms sleep between
    /// polls until it is empty. Does **not** wait for in-flight tasks to
    /// finish executing — only for the queue to drain — since workers run
    /// tasks outside the lock and report no per-task completion signal.
    pub fn wait(&self) {
        loop {
            let empty = {
                let _guard = match self.inner.mutex.lock_guard() {
                    Ok(guard) => guard,
                    Err(_) => return,
                };
                self.inner.queue_mut().is_empty()
            };
            if empty {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Sets stop, broadcasts, joins every worker, frees any tasks left in
    /// the queue unexecuted, then disposes the queue mutex and condition
    /// variable.
    ///
    /// Must not be called twice concurrently (same precondition as
    /// [`crate::barrier::Barrier::destroy`]); a second, later call after the
    /// first has returned is a harmless no-op since the worker list is
    /// already empty and `stop` is already set.
    pub fn shutdown(&self) {
        {
            let guard = match self.inner.mutex.lock_guard() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            *self.inner.stop_mut() = true;
            self.inner.not_empty.broadcast();
            drop(guard);
        }
        tracing::debug!("worker pool shutdown requested");

        let mut workers = self.workers.lock().unwrap();
        for mut worker in workers.drain(..) {
            let _ = worker.join();
            let _ = worker.dispose();
        }
        drop(workers);

        {
            let guard = self.inner.mutex.lock_guard().ok();
            self.inner.queue_mut().clear();
            drop(guard);
        }

        // SAFETY: every worker has been joined above, so no thread holds a
        // cloned `Arc<Inner>` anymore; `self.inner`'s mutex/condvar are only
        // ever touched through `&self` methods that take the lock first, and
        // this function is documented as not re-entrant, so treating them as
        // exclusively ours here is sound in the same way `Barrier::destroy`
        // treats its embedded mutex/condvar after broadcasting `destroyed`.
        let mutex_mut = unsafe { &mut *(std::ptr::addr_of!(self.inner.mutex) as *mut Mutex) };
        let cv_mut = unsafe { &mut *(std::ptr::addr_of!(self.inner.not_empty) as *mut Condvar) };
        cv_mut.dispose();
        mutex_mut.dispose();
        tracing::debug!("worker pool shutdown complete");
    }

    /// Number of tasks currently queued but not yet picked up by a worker
    /// (advisory, for tests and diagnostics).
    #[must_use]
    pub fn queue_len(&self) -> usize {
        match self.inner.mutex.lock_guard() {
            Ok(_guard) => self.inner.queue_mut().len(),
            Err(_) => 0,
        }
    }
}
