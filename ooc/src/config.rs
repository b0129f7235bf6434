//! Tunable constants and the small runtime `Config` that overrides them.
//!
//! The original C sources hardcode these as preprocessor defines
//! (`OOC_NUM_FIBERS`, `OOC_PAGE_SIZE`, `BLOCK_SIZE`, `UNDES_BIN_NUM`). Page
//! size in particular was never really a compile-time constant there either
//! (`#define OOC_PAGE_SIZE sysconf(_SC_PAGESIZE)`), so it stays a runtime
//! lookup here too.

/// Maximum number of fibers a single scheduler thread can host.
pub const OOC_NUM_FIBERS: usize = 10;

/// Size in bytes of one node-allocator block (2^18 = 256 KiB).
pub const BLOCK_SIZE: usize = 1 << 18;

/// Maximum number of fully-freed blocks kept on the process-wide
/// undesignated stack before a block is returned to the OS.
pub const UNDES_BIN_NUM: usize = 4;

/// Size of each fiber's dedicated kernel/handler stack.
///
/// `SIGSTKSZ` stopped being a compile-time constant in glibc 2.34, so a
/// fixed size is used instead rather than chasing the platform macro.
pub const FIBER_STACK_SIZE: usize = 256 * 1024;

/// Returns the OS page size, resolved once via `sysconf(_SC_PAGESIZE)`.
pub fn page_size() -> usize {
    let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    debug_assert!(ps > 0, "sysconf(_SC_PAGESIZE) failed");
    ps as usize
}

/// Per-thread scheduler configuration, read once at the first `schedule()`
/// call on a given thread.
///
/// `UNDES_BIN_NUM` has no counterpart here: the undesignated-block stack
/// (`memory::node_alloc`) is a single process-wide singleton shared by every
/// thread's page table, not a piece of any one thread's scheduler state, so
/// a per-thread `Config` has no meaningful way to override its capacity —
/// same as the original, where `UNDES_BIN_NUM` is a process-wide `#define`
/// with no per-thread equivalent either.
#[derive(Debug, Clone)]
pub struct Config {
    pub num_fibers: usize,
    pub fiber_stack_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            num_fibers: OOC_NUM_FIBERS,
            fiber_stack_size: FIBER_STACK_SIZE,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }
}
