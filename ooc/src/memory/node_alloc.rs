//! Fixed-size slab pool for page-table node records.
//!
//! Grounded on `vma_alloc.c`'s block/slot design: large, page-aligned
//! blocks are carved into fixed-size slots; a freshly-designated block
//! links its slots into a free chain lazily, one slot at a time, instead of
//! touching every slot up front. A block that becomes entirely free is
//! pushed onto a small process-wide "undesignated" stack so the next thread
//! that needs a block can reuse one instead of asking the OS for fresh
//! pages; only once that stack is full does a block actually get
//! `munmap`'d.
//!
//! The original specializes this pool to `struct vma`. This version is
//! generic over the record type `T` so the page table can use it directly
//! for its tree nodes without duplicating the block bookkeeping.

use std::cell::Cell;
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};

use spin::Mutex;

use crate::config::{BLOCK_SIZE, UNDES_BIN_NUM};
use crate::error::{OocError, Result};

/// One block's free-chain and bookkeeping header, stored at the front of
/// the block itself.
struct BlockHeader {
    /// Number of slots ever linked into the free chain. Slots at indices
    /// `>= touched` have never been written to and carry no valid chain
    /// link yet (the lazy-initialization trick).
    touched: Cell<usize>,
    capacity: usize,
    free_head: Cell<Option<NonNull<u8>>>,
    /// Slots currently handed out from this block. A block becomes
    /// eligible for the undesignated stack when this drops to zero,
    /// regardless of how many of its slots have ever been touched.
    in_use: Cell<usize>,
    /// Intrusive link used both by a thread's active-block list and by the
    /// process-wide undesignated stack; a block is on at most one of
    /// those at a time.
    list_link: Cell<Option<NonNull<BlockHeader>>>,
}

/// A slot-sized pool of fixed-size records, backed by `BLOCK_SIZE`
/// page-aligned blocks obtained from the OS via `mmap`.
pub struct Pool<T> {
    slot_size: usize,
    slots_per_block: usize,
    undesignated: Mutex<Undesignated>,
    _marker: PhantomData<T>,
}

struct Undesignated {
    top: Option<NonNull<BlockHeader>>,
    count: usize,
}

unsafe impl Send for Undesignated {}

thread_local! {
    static ACTIVE_BLOCKS: Cell<Option<NonNull<BlockHeader>>> = const { Cell::new(None) };
}

impl<T> Pool<T> {
    pub fn new() -> Self {
        let slot_size = mem::size_of::<T>().max(mem::size_of::<*mut u8>());
        let header = mem::size_of::<BlockHeader>();
        let slots_per_block = (BLOCK_SIZE - header) / slot_size;
        assert!(slots_per_block > 0, "BLOCK_SIZE too small for node type");
        Pool {
            slot_size,
            slots_per_block,
            undesignated: Mutex::new(Undesignated {
                top: None,
                count: 0,
            }),
            _marker: PhantomData,
        }
    }

    /// Returns an uninitialized slot for a value of `T`. The caller must
    /// `ptr::write` a valid `T` into it before use and must call
    /// [`Pool::free`] (not `drop_in_place` directly) to release it.
    pub fn alloc(&self) -> Result<NonNull<T>> {
        let block = self.block_with_free_slot()?;
        let hdr = unsafe { block.as_ref() };
        let slot = self.take_free_slot(hdr);
        hdr.in_use.set(hdr.in_use.get() + 1);
        Ok(slot.cast())
    }

    /// Returns a slot previously handed out by [`Pool::alloc`] to the pool.
    ///
    /// # Safety
    /// `node` must be a slot this pool allocated and must not be read or
    /// written again afterwards.
    pub unsafe fn free(&self, node: NonNull<T>) {
        let slot: NonNull<u8> = node.cast();
        let block = self.owning_block(slot);
        let hdr = block.as_ref();
        let old_head = hdr.free_head.get();
        ptr::write(slot.as_ptr() as *mut Option<NonNull<u8>>, old_head);
        hdr.free_head.set(Some(slot));
        hdr.in_use.set(hdr.in_use.get() - 1);

        if hdr.in_use.get() == 0 {
            self.retire_block(block);
        }
    }

    fn block_with_free_slot(&self) -> Result<NonNull<BlockHeader>> {
        if let Some(b) = ACTIVE_BLOCKS.with(|a| a.get()) {
            if unsafe { b.as_ref() }.free_head.get().is_some()
                || unsafe { b.as_ref() }.touched.get() < unsafe { b.as_ref() }.capacity
            {
                return Ok(b);
            }
        }
        let block = self.acquire_block()?;
        ACTIVE_BLOCKS.with(|a| a.set(Some(block)));
        Ok(block)
    }

    fn take_free_slot(&self, hdr: &BlockHeader) -> NonNull<u8> {
        if hdr.free_head.get().is_none() {
            debug_assert!(hdr.touched.get() < hdr.capacity);
            let idx = hdr.touched.get();
            hdr.touched.set(idx + 1);
            let slot = self.slot_ptr_from_header(hdr, idx);
            return slot;
        }
        let head = hdr.free_head.get().unwrap();
        let next = unsafe { ptr::read(head.as_ptr() as *const Option<NonNull<u8>>) };
        hdr.free_head.set(next);
        head
    }

    fn slot_ptr_from_header(&self, hdr: &BlockHeader, idx: usize) -> NonNull<u8> {
        let header_end = hdr as *const BlockHeader as usize + mem::size_of::<BlockHeader>();
        let addr = header_end + idx * self.slot_size;
        NonNull::new(addr as *mut u8).unwrap()
    }

    fn owning_block(&self, slot: NonNull<u8>) -> NonNull<BlockHeader> {
        let addr = slot.as_ptr() as usize & !(BLOCK_SIZE - 1);
        NonNull::new(addr as *mut BlockHeader).unwrap()
    }

    fn acquire_block(&self) -> Result<NonNull<BlockHeader>> {
        {
            let mut undes = self.undesignated.lock();
            if let Some(block) = undes.top {
                undes.top = unsafe { block.as_ref() }.list_link.get();
                undes.count -= 1;
                return Ok(block);
            }
        }
        self.mmap_block()
    }

    fn retire_block(&self, block: NonNull<BlockHeader>) {
        let hdr = unsafe { block.as_ref() };
        hdr.free_head.set(None);
        hdr.touched.set(0);

        let mut undes = self.undesignated.lock();
        if undes.count < UNDES_BIN_NUM {
            hdr.list_link.set(undes.top);
            undes.top = Some(block);
            undes.count += 1;
        } else {
            drop(undes);
            unsafe { self.munmap_block(block) };
        }
    }

    /// Reserves `2 * BLOCK_SIZE` bytes and carves out the first
    /// `BLOCK_SIZE`-aligned sub-range, releasing the unused slack on both
    /// sides. `mmap` only promises page alignment, not `BLOCK_SIZE`
    /// alignment, which the slot-to-block address mask in
    /// [`Pool::owning_block`] depends on.
    fn mmap_block(&self) -> Result<NonNull<BlockHeader>> {
        unsafe {
            let raw = libc::mmap(
                ptr::null_mut(),
                2 * BLOCK_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if raw == libc::MAP_FAILED {
                return Err(OocError::BlockAllocFailed(errno::errno()));
            }
            let raw = raw as usize;
            let aligned = (raw + BLOCK_SIZE - 1) & !(BLOCK_SIZE - 1);
            let head_slack = aligned - raw;
            let tail_slack = 2 * BLOCK_SIZE - head_slack - BLOCK_SIZE;
            if head_slack > 0 {
                libc::munmap(raw as *mut libc::c_void, head_slack);
            }
            if tail_slack > 0 {
                libc::munmap((aligned + BLOCK_SIZE) as *mut libc::c_void, tail_slack);
            }

            let hdr_ptr = aligned as *mut BlockHeader;
            ptr::write(
                hdr_ptr,
                BlockHeader {
                    touched: Cell::new(0),
                    capacity: self.slots_per_block,
                    free_head: Cell::new(None),
                    in_use: Cell::new(0),
                    list_link: Cell::new(None),
                },
            );
            Ok(NonNull::new_unchecked(hdr_ptr))
        }
    }

    unsafe fn munmap_block(&self, block: NonNull<BlockHeader>) {
        libc::munmap(block.as_ptr() as *mut libc::c_void, BLOCK_SIZE);
    }
}

// Blocks are only ever touched while the owning thread's ACTIVE_BLOCKS
// slot references them, or while protected by `undesignated`'s mutex, so
// the pool itself is safe to share across threads.
unsafe impl<T> Sync for Pool<T> {}
unsafe impl<T> Send for Pool<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct Dummy {
        a: usize,
        b: usize,
    }

    #[test]
    fn alloc_free_churn() {
        let pool: Pool<Dummy> = Pool::new();
        let mut live = Vec::new();
        for i in 0..1000 {
            let slot = pool.alloc().expect("alloc");
            unsafe {
                ptr::write(slot.as_ptr(), Dummy { a: i, b: i * 2 });
            }
            live.push(slot);
        }
        for slot in live.iter().rev() {
            unsafe {
                assert_eq!((*slot.as_ptr()).b, (*slot.as_ptr()).a * 2);
                pool.free(*slot);
            }
        }
    }

    #[test]
    fn block_reuse_after_full_free() {
        let pool: Pool<Dummy> = Pool::new();
        let first = pool.alloc().unwrap();
        unsafe {
            ptr::write(first.as_ptr(), Dummy { a: 1, b: 2 });
            pool.free(first);
        }
        let second = pool.alloc().unwrap();
        assert_eq!(first, second);
        unsafe {
            ptr::write(second.as_ptr(), Dummy { a: 3, b: 4 });
            pool.free(second);
        }
    }
}
