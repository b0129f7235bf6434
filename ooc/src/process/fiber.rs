//! Per-fiber bookkeeping.
//!
//! One `Fiber<R>` per slot in the scheduler's fixed-size fiber table,
//! mirroring the parallel arrays `sched.c` keeps per thread
//! (`S_kernel`/`S_args`/`S_iter`/`S_kern`/`S_trampoline`/`S_addr`/
//! `S_aioreq`), folded into a single struct indexed by fiber id.

use crate::process::context::Context;

pub type KernelFn = fn(usize, *mut std::ffi::c_void);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    /// Not scheduled with any work.
    Idle,
    /// Currently executing on the thread.
    Running,
    /// Parked on the wait list behind an outstanding asynchronous read.
    Waiting,
    /// On the wait list with its read already complete; eligible to run.
    Ready,
}

pub(crate) struct Fiber<R> {
    pub state: FiberState,
    pub kernel: Option<KernelFn>,
    pub iter: usize,
    pub args: *mut std::ffi::c_void,
    /// The fiber's own execution context (`S_kern[i]` in the original).
    pub kern_ctx: Context,
    /// Saved context of whatever was interrupted by this fiber's last
    /// SIGSEGV, resumed once the faulting page becomes resident
    /// (`S_trampoline[i]`).
    pub trampoline_ctx: Context,
    /// Saved mid-fault-resolution context: where execution parks while
    /// waiting on an async read, and resumes from when the scheduler
    /// later finds the fiber ready (`S_handler[i]`).
    pub handler_ctx: Context,
    /// Entry context for the fault-resolution body (`sigsegv_handler_body`),
    /// built once with its own dedicated stack at scheduler `init()` time
    /// and reused on every fault this fiber takes. Built once rather than
    /// from inside the signal handler itself: `Context::new` allocates a
    /// heap-backed stack, and heap allocation is not on the short list of
    /// operations an async-signal-safe handler may perform (the interrupted
    /// thread could have faulted from inside `malloc` itself, which would
    /// deadlock re-entering the same thread's non-reentrant allocator arena
    /// from the handler).
    pub fault_ctx: Context,
    pub fault_addr: Option<usize>,
    pub aio_req: Option<R>,
}

impl<R> Fiber<R> {
    pub fn idle() -> Self {
        Fiber {
            state: FiberState::Idle,
            kernel: None,
            iter: 0,
            args: std::ptr::null_mut(),
            kern_ctx: Context::empty(),
            trampoline_ctx: Context::empty(),
            handler_ctx: Context::empty(),
            fault_ctx: Context::empty(),
            fault_addr: None,
            aio_req: None,
        }
    }
}

// Fiber carries a raw `args` pointer supplied by the caller of `schedule`;
// soundness of sending it across threads is the caller's responsibility,
// same as the original passing a bare `void *` across pthreads.
unsafe impl<R: Send> Send for Fiber<R> {}
