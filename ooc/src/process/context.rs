//! `ucontext_t` wrappers.
//!
//! The teacher kernel switches contexts with a hand-written, naked-asm
//! callee-saved register save/restore (`switch_context` in
//! `process/context.rs`) because it *is* the only context in town — ring 0,
//! one page table, no libc. This crate runs in a hosted process where the
//! standard mechanism for a second stack of execution is POSIX
//! `ucontext_t`/`getcontext`/`makecontext`/`swapcontext`/`setcontext`, which
//! is what `sched.c` itself is built on, so that's what this wraps instead
//! of reinventing the teacher's inline assembly for a problem libc already
//! solves.
//!
//! One deliberate deviation from `sched.c`: the original passes the fiber
//! index to `S_kernel_trampoline`/`S_sigsegv_handler1` through
//! `makecontext`'s C variadic argument list (`makecontext(ctx, fn, 1, i)`).
//! That mechanism depends on `int`-sized variadic slots matching the
//! platform's calling convention, which is exactly the kind of detail that
//! does not survive translation through Rust's FFI variadics cleanly. This
//! version instead stashes the "fiber currently running on this thread" id
//! in a `thread_local!`, mirroring the original's own `S_me` thread-local,
//! and has every trampoline read it from there.

use std::cell::Cell;

thread_local! {
    /// Index of the fiber whose context is presently executing on this
    /// thread — the Rust analogue of `sched.c`'s `static __thread size_t
    /// S_me`.
    static CURRENT_FIBER: Cell<usize> = const { Cell::new(0) };
}

pub fn current_fiber() -> usize {
    CURRENT_FIBER.with(|c| c.get())
}

pub fn set_current_fiber(id: usize) {
    CURRENT_FIBER.with(|c| c.set(id));
}

/// An owned `ucontext_t` plus the stack it was built to run on (`None` for
/// a context obtained via `getcontext` to capture "here", which runs on
/// whatever stack was already active).
pub struct Context {
    ucp: libc::ucontext_t,
    _stack: Option<Box<[u8]>>,
}

impl Context {
    /// A context with no particular stack or entry point, meant to be
    /// filled in by `getcontext` or used as a `swapcontext` save target.
    pub fn empty() -> Self {
        Context {
            ucp: unsafe { std::mem::zeroed() },
            _stack: None,
        }
    }

    /// Captures the calling context, equivalent to the original's
    /// `getcontext(&S_main)` at the top of `S_init`.
    pub fn capture() -> Self {
        let mut ctx = Self::empty();
        let ret = unsafe { libc::getcontext(&mut ctx.ucp) };
        assert_eq!(ret, 0, "getcontext failed");
        ctx
    }

    /// Builds a fresh context that begins executing `entry` on its own
    /// `stack_size`-byte stack once swapped or set into, falling back to
    /// `link` when `entry` returns normally (mirrors `makecontext`'s
    /// `uc_link`).
    pub fn new(entry: extern "C" fn(), stack_size: usize, link: Option<&Context>) -> Self {
        let mut stack = vec![0u8; stack_size].into_boxed_slice();
        let mut ctx = Self::empty();
        unsafe {
            libc::getcontext(&mut ctx.ucp);
            ctx.ucp.uc_stack.ss_sp = stack.as_mut_ptr() as *mut libc::c_void;
            ctx.ucp.uc_stack.ss_size = stack_size;
            ctx.ucp.uc_stack.ss_flags = 0;
            ctx.ucp.uc_link = link
                .map(|l| &l.ucp as *const _ as *mut libc::ucontext_t)
                .unwrap_or(std::ptr::null_mut());
            libc::makecontext(&mut ctx.ucp, entry, 0);
        }
        ctx._stack = Some(stack);
        ctx
    }

    /// Saves the calling context into `self` and resumes `target`.
    /// Returns when some other context later swaps back into `self`.
    pub fn swap_to(&mut self, target: &Context) {
        let ret = unsafe { libc::swapcontext(&mut self.ucp, &target.ucp) };
        assert_eq!(ret, 0, "swapcontext failed");
    }

    /// Resumes `self` without saving anywhere. Does not return.
    pub fn set(&self) -> ! {
        unsafe {
            libc::setcontext(&self.ucp);
        }
        unreachable!("setcontext only returns on failure");
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut libc::ucontext_t {
        &mut self.ucp
    }

    pub(crate) fn as_ptr(&self) -> *const libc::ucontext_t {
        &self.ucp
    }
}
