//! The fiber scheduler — the core of the runtime.
//!
//! Grounded line-for-line on `sched.c`: `ooc_sched`/`ooc_wait`/`ooc_finalize`
//! become [`schedule`]/[`wait`]/[`finalize`]; `S_sigsegv_trampoline` and
//! `S_sigsegv_handler1` become [`sigsegv_entry`] and
//! [`sigsegv_handler_body`], split across the same real/ephemeral-context
//! boundary the original uses; `S_kernel_trampoline` becomes
//! [`kernel_trampoline`]. All scheduler state is `thread_local!`, matching
//! every `static __thread` array in the original — each thread that calls
//! `schedule` gets its own independent fiber pool, wait list, and installed
//! signal handler.

use std::cell::RefCell;
use std::ffi::c_void;

use log::{debug, trace};

use crate::aio::posix::{PosixAio, PosixRequest};
use crate::aio::AsyncIo;
use crate::config::{self, Config};
use crate::error::{OocError, Result};
use crate::memory::page_table;
use crate::process::context::{self, Context};
use crate::process::fiber::{Fiber, FiberState, KernelFn};

struct Scheduler {
    fibers: Vec<Fiber<PosixRequest>>,
    idle: Vec<usize>,
    wait: Vec<usize>,
    main_ctx: Context,
    old_act: libc::sigaction,
    aio: PosixAio,
    page_size: usize,
}

thread_local! {
    static STATE: RefCell<Option<Scheduler>> = const { RefCell::new(None) };
}

fn with_state<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    STATE.with(|s| {
        let mut guard = s.borrow_mut();
        let state = guard
            .as_mut()
            .expect("scheduler not initialized on this thread");
        f(state)
    })
}

fn ensure_init() -> Result<()> {
    let need_init = STATE.with(|s| s.borrow().is_none());
    if need_init {
        init(Config::default())?;
    }
    Ok(())
}

fn init(cfg: Config) -> Result<()> {
    let page_size = config::page_size();
    debug!("ooc: library initialized, pagesize={page_size}, fibers={}", cfg.num_fibers);

    let mut fibers = Vec::with_capacity(cfg.num_fibers);
    let mut idle = Vec::with_capacity(cfg.num_fibers);
    for i in 0..cfg.num_fibers {
        let mut f = Fiber::idle();
        f.kern_ctx = Context::new(kernel_trampoline, cfg.fiber_stack_size, None);
        f.fault_ctx = Context::new(sigsegv_handler_body, cfg.fiber_stack_size, None);
        fibers.push(f);
        idle.push(i);
    }

    let mut act: libc::sigaction = unsafe { std::mem::zeroed() };
    act.sa_sigaction = sigsegv_entry as usize;
    act.sa_flags = libc::SA_SIGINFO;
    unsafe {
        libc::sigemptyset(&mut act.sa_mask);
    }
    let mut old_act: libc::sigaction = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::sigaction(libc::SIGSEGV, &act, &mut old_act) };
    if ret != 0 {
        return Err(OocError::SignalSetupFailed(errno::errno()));
    }

    let state = Scheduler {
        fibers,
        idle,
        wait: Vec::new(),
        main_ctx: Context::empty(),
        old_act,
        aio: PosixAio::new(),
        page_size,
    };
    STATE.with(|s| *s.borrow_mut() = Some(state));
    Ok(())
}

/// Restores the previously-installed `SIGSEGV` handler and discards this
/// thread's scheduler state. Mirrors `ooc_finalize`.
pub fn finalize() -> Result<()> {
    STATE.with(|s| {
        let mut guard = s.borrow_mut();
        let Some(state) = guard.take() else {
            return Err(OocError::NotInitialized);
        };
        let ret = unsafe { libc::sigaction(libc::SIGSEGV, &state.old_act, std::ptr::null_mut()) };
        if ret != 0 {
            return Err(OocError::SignalSetupFailed(errno::errno()));
        }
        debug!("ooc: finalize, previous SIGSEGV handler restored");
        Ok(())
    })
}

/// Initializes this thread's scheduler state with a non-default
/// [`Config`], instead of the defaults `schedule`/`wait` would otherwise
/// lazily install on first use. Must be called before the first
/// `schedule`/`wait` call on this thread.
pub fn configure(cfg: Config) -> Result<()> {
    let already = STATE.with(|s| s.borrow().is_some());
    if already {
        return Err(OocError::AlreadyInitialized);
    }
    init(cfg)
}

fn page_resident(page: usize, page_size: usize) -> Result<bool> {
    let mut byte: u8 = 0;
    let ret = unsafe {
        libc::mincore(
            page as *mut libc::c_void,
            page_size,
            &mut byte as *mut u8,
        )
    };
    if ret != 0 {
        return Err(OocError::ResidencyCheckFailed(errno::errno()));
    }
    Ok(byte & 1 != 0)
}

/// Mirrors `S_is_runnable`: a fiber with no outstanding read is runnable
/// exactly when its last-faulted page is already resident; a fiber with an
/// outstanding read is runnable once the backend reports completion.
fn is_runnable(st: &Scheduler, id: usize) -> Result<bool> {
    let fiber = &st.fibers[id];
    match &fiber.aio_req {
        Some(req) => st.aio.poll(req),
        None => {
            let addr = fiber
                .fault_addr
                .expect("fiber on the wait list with no recorded fault address");
            page_resident(addr & !(st.page_size - 1), st.page_size)
        }
    }
}

fn find_runnable_in_wait(st: &mut Scheduler) -> Result<Option<usize>> {
    let mut found = None;
    for (idx, &fid) in st.wait.iter().enumerate() {
        if is_runnable(st, fid)? {
            found = Some(idx);
            break;
        }
    }
    Ok(found.map(|idx| st.wait.swap_remove(idx)))
}

/// Blocks until at least one outstanding request completes, or returns
/// immediately if nothing in the wait list has one (every waiter is
/// blocked purely on page residency established by some other fiber).
fn suspend_on_wait_list(st: &Scheduler) -> Result<()> {
    let reqs: Vec<&PosixRequest> = st
        .wait
        .iter()
        .filter_map(|&id| st.fibers[id].aio_req.as_ref())
        .collect();
    if reqs.is_empty() {
        return Ok(());
    }
    st.aio.suspend(&reqs, None)
}

/// Schedules iteration `i` of `kern` with `args` onto an idle fiber, or
/// onto the main context while other fibers make progress through the
/// wait list. Returns once iteration `i` itself has been handed to a
/// fiber — mirrors `ooc_sched`'s single `break` point.
pub fn schedule(kern: KernelFn, i: usize, args: *mut c_void) -> Result<()> {
    ensure_init()?;
    trace!("ooc: scheduling iteration {i}");

    loop {
        let idle = with_state(|st| st.idle.pop());
        if let Some(id) = idle {
            with_state(|st| {
                let fiber = &mut st.fibers[id];
                fiber.iter = i;
                fiber.kernel = Some(kern);
                fiber.args = args;
                fiber.state = FiberState::Running;
            });
            context::set_current_fiber(id);
            trace!("ooc: fiber {id} -> kern for iter {i}");
            let (main_ptr, kern_ptr) = with_state(|st| {
                (
                    &mut st.main_ctx as *mut Context,
                    &st.fibers[id].kern_ctx as *const Context,
                )
            });
            unsafe { (*main_ptr).swap_to(&*kern_ptr) };
            trace!("ooc: returned from fiber {id} for iter {i}");
            return Ok(());
        }

        let found = with_state(find_runnable_in_wait)?;
        if let Some(id) = found {
            with_state(|st| st.fibers[id].state = FiberState::Running);
            context::set_current_fiber(id);
            let (main_ptr, handler_ptr) = with_state(|st| {
                (
                    &mut st.main_ctx as *mut Context,
                    &st.fibers[id].handler_ctx as *const Context,
                )
            });
            unsafe { (*main_ptr).swap_to(&*handler_ptr) };
            continue;
        }

        with_state(|st| suspend_on_wait_list(st))?;
    }
}

/// Drains the wait list, letting every outstanding fiber finish. Mirrors
/// `ooc_wait`.
pub fn wait() -> Result<()> {
    ensure_init()?;
    debug!("ooc: waiting for outstanding fibers");

    loop {
        let any_waiting = with_state(|st| !st.wait.is_empty());
        if !any_waiting {
            return Ok(());
        }

        let found = with_state(find_runnable_in_wait)?;
        if let Some(id) = found {
            with_state(|st| st.fibers[id].state = FiberState::Running);
            context::set_current_fiber(id);
            let (main_ptr, handler_ptr) = with_state(|st| {
                (
                    &mut st.main_ctx as *mut Context,
                    &st.fibers[id].handler_ctx as *const Context,
                )
            });
            unsafe { (*main_ptr).swap_to(&*handler_ptr) };
        } else {
            with_state(|st| suspend_on_wait_list(st))?;
        }
    }
}

/// `S_kernel_trampoline`: runs the scheduled kernel to completion on the
/// fiber's own stack, then hands control back to the main context.
extern "C" fn kernel_trampoline() {
    let me = context::current_fiber();
    let (kern, iter, args) = with_state(|st| {
        let f = &st.fibers[me];
        (f.kernel.expect("fiber scheduled with no kernel"), f.iter, f.args)
    });

    kern(iter, args);
    flush();

    let main_ptr = with_state(|st| {
        st.fibers[me].state = FiberState::Idle;
        st.fibers[me].kernel = None;
        st.idle.push(me);
        &st.main_ctx as *const Context
    });
    unsafe { (&*main_ptr).set() }
}

/// `S_flush1`: deliberately a no-op. The original never wires a real
/// flush-to-disk step into this path either (`S_flush2`, which would, is
/// `#if 0`-disabled alongside the rest of the two-stage promotion design).
fn flush() {}

/// `S_sigsegv_trampoline`: the function actually registered with
/// `sigaction`. Records the faulting address and swaps into the fiber's
/// pre-built `fault_ctx` (allocated once at `init()` time, never from
/// signal context — see the comment on `Fiber::fault_ctx`) to run
/// [`sigsegv_handler_body`], saving "here" so that a later `setcontext`
/// back to it causes this handler to return normally and let the kernel
/// resume the instruction that faulted.
extern "C" fn sigsegv_entry(sig: libc::c_int, info: *mut libc::siginfo_t, _ucontext: *mut c_void) {
    debug_assert_eq!(sig, libc::SIGSEGV);
    let me = context::current_fiber();
    let addr = unsafe { (*info).si_addr() } as usize;

    with_state(|st| {
        trace!("ooc: fiber {me} received SIGSEGV at {addr:#x}");
        st.fibers[me].fault_addr = Some(addr);
    });

    let (trampoline_ptr, fault_ptr) = with_state(|st| {
        (
            &mut st.fibers[me].trampoline_ctx as *mut Context,
            &st.fibers[me].fault_ctx as *const Context,
        )
    });
    unsafe { (*trampoline_ptr).swap_to(&*fault_ptr) };
    // Reached again once `sigsegv_handler_body` resolves the fault and
    // `setcontext`s back to `trampoline_ctx`. Falling off the end here
    // returns from the signal handler, letting the kernel resume the
    // faulting instruction with the now-updated page protections.
}

/// `S_sigsegv_handler1`: decides whether the faulting page needs an
/// asynchronous fetch, parks the fiber on the wait list if so, and once
/// the page is resident grants `PROT_READ | PROT_WRITE` before returning
/// control to the interrupted instruction via `trampoline_ctx`.
extern "C" fn sigsegv_handler_body() {
    let me = context::current_fiber();
    let (addr, page_size) =
        with_state(|st| (st.fibers[me].fault_addr.expect("no fault address"), st.page_size));
    let page = addr & !(page_size - 1);

    let runnable = with_state(|st| is_runnable(st, me)).expect("is_runnable failed");

    if !runnable {
        let file_offset = page_table::find_and_lock(page).and_then(|vma| {
            let fo = vma.file_offset_of(page);
            vma.unlock();
            fo
        });

        if let Some((fd, offset)) = file_offset {
            // The fetch writes into the faulting page itself, so it must be
            // made writable before the read is posted, not after: the
            // kernel checks the destination VMA's protection on every
            // write it services on our behalf, asynchronous or not.
            let ret = unsafe {
                libc::mprotect(
                    page as *mut libc::c_void,
                    page_size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            };
            assert_eq!(ret, 0, "mprotect failed while staging fetch at {page:#x}");

            with_state(|st| {
                let req = unsafe { st.aio.read(fd, page as *mut u8, page_size, offset) }
                    .expect("aio_read submission failed");
                st.fibers[me].aio_req = Some(req);
                st.fibers[me].state = FiberState::Waiting;
                st.wait.push(me);
            });
            trace!("ooc: fiber {me} not runnable, parking on wait list");

            let (handler_ptr, main_ptr) = with_state(|st| {
                (
                    &mut st.fibers[me].handler_ctx as *mut Context,
                    &st.main_ctx as *const Context,
                )
            });
            unsafe { (*handler_ptr).swap_to(&*main_ptr) };

            let n = with_state(|st| {
                let req = st.fibers[me].aio_req.take().expect("no pending request");
                req.result()
            })
            .expect("asynchronous read failed");
            assert_eq!(n, page_size, "short read while paging in {page:#x}");
        }
        // An anonymous (or untracked) page needs no fetch: the kernel's
        // own zero-fill already did the only work there was to do.
    } else {
        trace!("ooc: fiber {me} runnable");
    }

    let ret = unsafe {
        libc::mprotect(
            page as *mut libc::c_void,
            page_size,
            libc::PROT_READ | libc::PROT_WRITE,
        )
    };
    assert_eq!(ret, 0, "mprotect failed while resolving fault at {page:#x}");

    if let Some(vma) = page_table::find_and_lock(page) {
        vma.mark_resident();
        vma.unlock();
    }

    let trampoline_ptr = with_state(|st| &st.fibers[me].trampoline_ctx as *const Context);
    unsafe { (&*trampoline_ptr).set() }
}
