//! The VMA record and the advisory registration helper built on top of it.
//!
//! A VMA here describes a page-aligned, externally `mmap`'d region the
//! caller wants the scheduler's fault path to manage: pages start out
//! `PROT_NONE`, and the scheduler grants `PROT_READ | PROT_WRITE` lazily as
//! each page is first touched, driving an async read to fill it first.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use crate::config;
use crate::error::{OocError, Result};
use crate::memory::page_table;

/// What backs a VMA's pages once they are faulted in.
///
/// The retrieved original source never wires up which file descriptor
/// backs a given VMA (`S_sigsegv_handler1` posts an `aio_read` with no
/// visible association between a VMA and an `fd`, and the header
/// declaring that association was not part of the retrieved sources) —
/// this is the concrete resolution: a VMA either has no backing store, in
/// which case the kernel's own anonymous-mapping zero-fill is all a fault
/// needs, or it is backed by a file region, in which case the fault path
/// posts a real asynchronous read before granting access.
#[derive(Clone, Copy, Debug)]
pub enum Backing {
    Anonymous,
    File { fd: RawFd, offset: i64 },
}

bitflags! {
    /// Per-page residency/dirty bookkeeping carried by every VMA.
    ///
    /// `RESIDENT` is set the first time a page's backing read completes;
    /// `DIRTY` is set the first time a page is written. Neither bit is ever
    /// read back by the fault path shipped here — the handler always
    /// re-reads a page from its backing store on the first touch and never
    /// distinguishes a read fault from a write fault for promotion
    /// purposes. A two-stage promotion scheme that *does* consult these
    /// bits (resident-but-read-only -> writable only once `DIRTY`) exists
    /// in the historical design this is based on but was left disabled
    /// there and stays unimplemented here; see DESIGN.md.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct VmaFlags: u8 {
        const RESIDENT = 0b01;
        const DIRTY    = 0b10;
    }
}

/// A registered out-of-core region.
///
/// `start`/`size` are immutable for the VMA's lifetime (they are the splay
/// tree's key). `flags` and `lock` are the only interior-mutable state.
pub struct Vma {
    pub start: usize,
    pub size: usize,
    pub backing: Backing,
    flags: Mutex<VmaFlags>,
    /// Manual mutual-exclusion token, acquired by `page_table::find_and_lock`
    /// and released explicitly by the caller — mirroring the original's
    /// `lock_get`/`lock_let` pairing rather than a scope guard, since the
    /// lock is typically held across a fault-handling sequence that spans
    /// more than one function.
    held: AtomicBool,
}

impl Vma {
    pub(crate) fn new(start: usize, size: usize, backing: Backing) -> Self {
        Vma {
            start,
            size,
            backing,
            flags: Mutex::new(VmaFlags::empty()),
            held: AtomicBool::new(false),
        }
    }

    /// File offset backing the page starting at `page_addr`, if any.
    pub fn file_offset_of(&self, page_addr: usize) -> Option<(RawFd, i64)> {
        match self.backing {
            Backing::Anonymous => None,
            Backing::File { fd, offset } => {
                Some((fd, offset + (page_addr - self.start) as i64))
            }
        }
    }

    pub fn end(&self) -> usize {
        self.start + self.size
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }

    pub fn mark_resident(&self) {
        self.flags.lock().insert(VmaFlags::RESIDENT);
    }

    pub fn mark_dirty(&self) {
        self.flags.lock().insert(VmaFlags::DIRTY);
    }

    pub fn flags(&self) -> VmaFlags {
        *self.flags.lock()
    }

    /// Acquires the manual per-VMA lock. Spins; callers hold this only
    /// across short fault-resolution critical sections.
    pub(crate) fn lock(&self) {
        while self
            .held
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
    }

    /// Releases the manual per-VMA lock. The caller must hold it.
    pub(crate) fn unlock(&self) {
        self.held.store(false, Ordering::Release);
    }
}

/// RAII guard returned by [`register_region`]. Dropping it removes the
/// region from the page table, so that a forgotten `unregister` call can't
/// leave a stale entry pointing at memory the caller has since `munmap`'d.
pub struct RegisteredRegion {
    start: usize,
    active: bool,
}

impl RegisteredRegion {
    pub fn start(&self) -> usize {
        self.start
    }

    /// Removes the region from the page table early. Equivalent to letting
    /// the guard drop, spelled out for callers that want the error.
    pub fn unregister(mut self) -> Result<()> {
        self.active = false;
        page_table::remove(self.start)
    }
}

impl Drop for RegisteredRegion {
    fn drop(&mut self) {
        if self.active {
            let _ = page_table::remove(self.start);
        }
    }
}

/// Registers an already-`mmap`'d, page-aligned region of `size` bytes
/// starting at `start` with the page table.
///
/// This is the advisory counterpart of the original's `ooc_malloc`: it
/// never allocates or `mmap`s memory itself, it only makes a region the
/// caller already owns visible to the fault path. See DESIGN.md for why
/// the authoritative alternative (the scheduler owns the allocation) was
/// not implemented.
pub fn register_region(start: usize, size: usize) -> Result<RegisteredRegion> {
    register(start, size, Backing::Anonymous)
}

/// Like [`register_region`], but pages are filled from `fd` starting at
/// `offset` the first time each is touched, instead of the kernel's
/// anonymous zero-fill.
pub fn register_file_backed_region(
    start: usize,
    size: usize,
    fd: RawFd,
    offset: i64,
) -> Result<RegisteredRegion> {
    register(start, size, Backing::File { fd, offset })
}

fn register(start: usize, size: usize, backing: Backing) -> Result<RegisteredRegion> {
    let ps = config::page_size();
    if start % ps != 0 {
        return Err(OocError::Misaligned { addr: start });
    }
    page_table::insert(start, size, backing)?;
    Ok(RegisteredRegion {
        start,
        active: true,
    })
}
