//! Cooperative, stack-switching fibers with a per-OS-thread "current fiber"
//! pointer.
//!
//! The context switch itself is a minimal x86_64 SysV callee-saved-register
//! switch, the same technique used by mainstream Rust stack-switching
//! crates. The surrounding shape (explicit dispose, `thiserror`-mapped
//! errors, doc-comment density) follows the rest of this crate.
//!
//! `Fiber` is deliberately `!Send`/`!Sync` (a bare `*mut FiberInner` is
//! neither by default) — this gives the "resuming a fiber from a different
//! OS thread is undefined" constraint compile-time teeth instead of a
//! runtime check.

use std::cell::Cell;
use std::time::Duration;

use crate::error::{Error, Result};

#[cfg(target_arch = "x86_64")]
mod arch {
    use std::arch::global_asm;

    #[repr(C)]
    pub struct Context {
        pub rsp: *mut u8,
    }

    impl Context {
        pub const fn empty() -> Self {
            Self {
                rsp: std::ptr::null_mut(),
            }
        }
    }

    // Saves the six SysV callee-saved general registers (and the frame
    // pointer) onto the *current* stack, stashes the resulting `rsp` into
    // `*save_rsp`, loads `rsp` from `new_rsp`, and pops the same six
    // registers back off — which for a freshly-initialized stack (see
    // `init_stack`) are the zeroed placeholders, and the final `ret` lands
    // on the trampoline address planted there.
    global_asm!(
        ".text",
        ".global ghostrt_fiber_switch",
        "ghostrt_fiber_switch:",
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, rsi",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
    );

    extern "C" {
        pub fn ghostrt_fiber_switch(save_rsp: *mut *mut u8, new_rsp: *mut u8);
    }

    /// Lays out a brand-new stack so that switching into it for the first
    /// time lands on `trampoline`, as if `trampoline` had just been `call`ed
    /// from a 16-byte-aligned `rsp` (the SysV entry invariant).
    ///
    /// Layout from `rsp` upward: six zeroed callee-saved-register slots,
    /// then the trampoline address. `top` must be 16-byte aligned; the
    /// chosen offset (64 bytes back from `top`) keeps the computed `rsp`
    /// itself 16-byte aligned, which is what makes the post-`ret` stack
    /// pointer land at `top - 8` — the SysV "just called" alignment.
    ///
    /// # Safety
    /// `top` must point one-past-the-end of a writable region of at least
    /// 64 bytes belonging exclusively to this stack.
    pub unsafe fn init_stack(top: *mut u8, trampoline: extern "C" fn() -> !) -> *mut u8 {
        let base = top.sub(64);
        for slot in 0..6 {
            (base.add(slot * 8) as *mut u64).write(0);
        }
        (base.add(48) as *mut u64).write(trampoline as usize as u64);
        base
    }
}

#[cfg(not(target_arch = "x86_64"))]
mod arch {
    pub struct Context;
    impl Context {
        pub const fn empty() -> Self {
            Self
        }
    }
}

use arch::Context;

struct FiberInner {
    context: Context,
    stack: Option<StackBuffer>,
    entry: Option<Box<dyn FnOnce()>>,
    finished: Cell<bool>,
    started: Cell<bool>,
    /// The fiber that most recently resumed this one; control transfers
    /// here when this fiber's entry function returns.
    link: Cell<*mut FiberInner>,
}

struct StackBuffer {
    ptr: *mut u8,
    layout: std::alloc::Layout,
}

impl StackBuffer {
    fn new(size: usize) -> Result<Self> {
        let size = (size.max(64) + 15) & !15;
        let layout =
            std::alloc::Layout::from_size_align(size, 16).map_err(|_| Error::InvalidArgument)?;
        // SAFETY: `layout` has nonzero size.
        let ptr = unsafe { std::alloc::alloc(layout) };
        if ptr.is_null() {
            return Err(Error::ResourceExhausted);
        }
        Ok(Self { ptr, layout })
    }

    fn top(&self) -> *mut u8 {
        // SAFETY: `ptr` and `layout.size()` describe one allocation.
        unsafe { self.ptr.add(self.layout.size()) }
    }
}

impl Drop for StackBuffer {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`layout` are exactly as returned by `alloc` above.
        unsafe { std::alloc::dealloc(self.ptr, self.layout) };
    }
}

std::thread_local! {
    static CURRENT: Cell<*mut FiberInner> = const { Cell::new(std::ptr::null_mut()) };
    static MAIN_ESTABLISHED: Cell<bool> = const { Cell::new(false) };
}

const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// A cooperative fiber bound to the OS thread it was created/established on.
/// Not `Clone`, not `Send`, not `Sync`.
pub struct Fiber {
    raw: *mut FiberInner,
}

impl Fiber {
    /// Converts the calling OS thread into a fiber context. One-time per OS
    /// thread; a second call on the same thread fails with [`Error::Busy`].
    /// [`Self::create`] fails with [`Error::InvalidArgument`] until this has
    /// been called on that thread.
    pub fn establish_main() -> Result<Self> {
        if MAIN_ESTABLISHED.with(Cell::get) {
            return Err(Error::Busy);
        }
        let inner = Box::new(FiberInner {
            context: Context::empty(),
            stack: None,
            entry: None,
            finished: Cell::new(false),
            started: Cell::new(true),
            link: Cell::new(std::ptr::null_mut()),
        });
        let raw = Box::into_raw(inner);
        CURRENT.with(|c| c.set(raw));
        MAIN_ESTABLISHED.with(|e| e.set(true));
        Ok(Self { raw })
    }

    /// Allocates a `stack_size`-byte stack (default 64 KiB when `None`) and
    /// a context that, first time resumed, runs `entry` then transfers
    /// control to whichever fiber most recently resumed it.
    #[cfg(target_arch = "x86_64")]
    pub fn create<F>(entry: F, stack_size: Option<usize>) -> Result<Self>
    where
        F: FnOnce() + 'static,
    {
        if !MAIN_ESTABLISHED.with(Cell::get) {
            return Err(Error::InvalidArgument);
        }
        let stack = StackBuffer::new(stack_size.unwrap_or(DEFAULT_STACK_SIZE))?;
        let inner = Box::new(FiberInner {
            context: Context::empty(),
            stack: Some(stack),
            entry: Some(Box::new(entry)),
            finished: Cell::new(false),
            started: Cell::new(false),
            link: Cell::new(std::ptr::null_mut()),
        });
        let raw = Box::into_raw(inner);
        // SAFETY: the stack was just allocated exclusively for this fiber
        // and is at least 64 bytes (enforced by `StackBuffer::new`).
        let rsp = unsafe {
            let inner = &*raw;
            let top = inner.stack.as_ref().unwrap().top();
            arch::init_stack(top, fiber_trampoline)
        };
        // SAFETY: `raw` is freshly boxed and not yet shared.
        unsafe { (*raw).context.rsp = rsp };
        Ok(Self { raw })
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub fn create<F>(_entry: F, _stack_size: Option<usize>) -> Result<Self>
    where
        F: FnOnce() + 'static,
    {
        Err(Error::Unsupported)
    }

    /// Transfers control to `target` on the current OS thread. Equivalent
    /// to [`Self::yield_to`] — the two names distinguish caller intent
    /// (resuming a suspended fiber vs. yielding back), not mechanism.
    #[cfg(target_arch = "x86_64")]
    pub fn resume(&self, target: &Fiber) -> Result<()> {
        self.transfer_to(target)
    }

    /// See [`Self::resume`].
    #[cfg(target_arch = "x86_64")]
    pub fn yield_to(&self, target: &Fiber) -> Result<()> {
        self.transfer_to(target)
    }

    #[cfg(target_arch = "x86_64")]
    fn transfer_to(&self, target: &Fiber) -> Result<()> {
        if std::ptr::eq(self.raw, target.raw) {
            return Err(Error::InvalidArgument);
        }
        if !CURRENT.with(|c| c.get() == self.raw) {
            return Err(Error::InvalidArgument);
        }
        // SAFETY: both fibers were created on (and, by the `CURRENT` check
        // above, `self` is executing on) this OS thread; the caller is
        // responsible for never resuming a fiber from another thread —
        // unenforceable in general since fibers are `!Send`, but a raw
        // pointer smuggled across threads some other way is still the
        // caller's violation to avoid.
        unsafe {
            (*target.raw).link.set(self.raw);
            (*target.raw).started.set(true);
            CURRENT.with(|c| c.set(target.raw));
            arch::ghostrt_fiber_switch(&mut (*self.raw).context.rsp, (*target.raw).context.rsp);
        }
        Ok(())
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub fn resume(&self, _target: &Fiber) -> Result<()> {
        Err(Error::Unsupported)
    }
    #[cfg(not(target_arch = "x86_64"))]
    pub fn yield_to(&self, _target: &Fiber) -> Result<()> {
        Err(Error::Unsupported)
    }

    /// Frees the stack and context of a non-current fiber. Disposing the
    /// current fiber is rejected with [`Error::Busy`].
    pub fn dispose(self) -> Result<()> {
        if CURRENT.with(|c| c.get() == self.raw) {
            return Err(Error::Busy);
        }
        // SAFETY: `raw` was produced by `Box::into_raw` in `create`/
        // `establish_main` and this `Fiber` is its sole owner (not `Clone`).
        let inner = unsafe { Box::from_raw(self.raw) };
        drop(inner);
        Ok(())
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        // SAFETY: `raw` is valid for the lifetime of `self`.
        unsafe { (*self.raw).finished.get() }
    }

    #[must_use]
    pub fn is_current(&self) -> bool {
        CURRENT.with(|c| c.get() == self.raw)
    }
}

/// Entry point every freshly-created fiber's stack is rigged to jump to on
/// its first resume.
extern "C" fn fiber_trampoline() -> ! {
    let raw = CURRENT.with(Cell::get);
    // SAFETY: `raw` was published into `CURRENT` by `transfer_to` immediately
    // before switching here.
    let inner = unsafe { &mut *raw };
    if let Some(entry) = inner.entry.take() {
        entry();
    }
    inner.finished.set(true);

    let link = inner.link.get();
    if link.is_null() {
        // No fiber ever resumed us through the public API (unreachable in
        // correct usage); park rather than return into undefined stack state.
        loop {
            crate::thread::sleep(Duration::from_millis(50));
        }
    }

    // SAFETY: `link` points at the fiber that most recently resumed `raw`,
    // kept alive by the caller per this module's ownership contract.
    unsafe {
        CURRENT.with(|c| c.set(link));
        let mut discarded = std::ptr::null_mut();
        arch::ghostrt_fiber_switch(&mut discarded, (*link).context.rsp);
    }
    unreachable!("a finished fiber was resumed again")
}
