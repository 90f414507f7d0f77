//! A single size class
//!
//! A [SizeClassPool] hands out slots of exactly one size. Slots are carved
//! sequentially out of large blocks obtained from the system allocator, and
//! freed slots are recycled through a lock-free (Treiber stack) free list
//! whose links live inside the free slots themselves.
//!
//! Block growth is serialized behind a mutex. Only the thread that finds
//! the current block exhausted while holding the lock asks the system
//! allocator for a new one, so racing threads never acquire redundant blocks.
//!
//! Blocks are never returned to the system while the pool is alive.
//! This is what makes the free list safe to traverse without any
//! reclamation scheme: a stale `next` read always hits mapped memory,
//! and the tag in the free list head makes the CAS of such a stale reader fail.

use std::{
    alloc::{self, Layout},
    cmp,
    fmt::Debug,
    mem::{align_of, size_of},
    ptr::{self, NonNull},
    sync::{atomic::Ordering, PoisonError},
};

use tracing::Level;

use crate::{
    config::{BLOCK_HDR_SZ, SLOT_ALIGN},
    error::AllocError,
    loom_testing::*,
    util::{checked_roundto, UsizePtr},
};

/// Alignment of every block requested from the system allocator
const BLOCK_ALIGN: usize = if SLOT_ALIGN > align_of::<*mut u8>() {
    SLOT_ALIGN
} else {
    align_of::<*mut u8>()
};

/// Bit position where the ABA tag starts in the free list head
///
/// Below this are the address bits of the head slot.
const TAG_SHIFT: u32 = if usize::BITS >= 64 { 48 } else { 32 };
const ADDR_MASK: u64 = (1 << TAG_SHIFT) - 1;
const TAG_MASK: u64 = (1 << (64 - TAG_SHIFT)) - 1;

#[inline]
fn head_slot(head: u64) -> *mut Slot {
    (head & ADDR_MASK) as usize as *mut Slot
}

#[inline]
fn head_tag(head: u64) -> u64 {
    head >> TAG_SHIFT
}

#[inline]
fn make_head(slot_addr: u64, tag: u64) -> u64 {
    debug_assert!(slot_addr & !ADDR_MASK == 0);
    ((tag & TAG_MASK) << TAG_SHIFT) | slot_addr
}

/// Whether every slot address in the block `[block, block + block_size)`
/// survives being packed into a free list head
#[inline]
fn block_fits_in_head(block: usize, block_size: usize) -> bool {
    (block as u64)
        .checked_add(block_size as u64)
        .is_some_and(|end| end <= 1 << TAG_SHIFT)
}

/// Contents of a slot while it is free (i.e. free chain)
///
/// This is only an overlay: `size_of::<Slot>()` is *not* the slot size of
/// any pool. Once a slot is handed out the same bytes belong to the caller.
#[repr(C)]
pub struct Slot {
    // note that, even though this is accessed atomically, callers write
    // the same bytes non-atomically while the slot is allocated.
    // a pop can only load `next` of a slot it saw at the head of the list,
    // and if that slot has since been handed out, the head has moved on
    // and the CAS of that pop fails
    next: AtomicU64,
}

impl Slot {
    /// Load next pointer with an atomic op (relaxed)
    #[inline]
    fn load_next(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }

    /// Store next pointer with an atomic op (relaxed)
    #[inline]
    fn store_next(&self, next: u64) {
        self.next.store(next, Ordering::Relaxed);
    }
}

impl Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("@addr", &(self as *const _))
            .field("next", &UsizePtr(self.load_next() as usize))
            .finish()
    }
}

/// Bump cursor over the current block, plus the chain of every block
/// (only ever touched with the pool mutex held)
struct BlockCursor {
    /// Most recently acquired block. The first word of each block
    /// points at the block acquired before it (or null).
    newest_block: *mut u8,
    /// Next never-handed-out slot in the newest block
    cur_slot: *mut u8,
    /// Last position in the newest block that can hold a full slot
    last_slot: *mut u8,
    /// Number of blocks in the chain
    num_blocks: usize,
}

// safety: the blocks are owned exclusively by the pool containing this,
// and the cursor is only accessed behind that pool's mutex
unsafe impl Send for BlockCursor {}

impl BlockCursor {
    fn new() -> Self {
        Self {
            newest_block: ptr::null_mut(),
            cur_slot: ptr::null_mut(),
            last_slot: ptr::null_mut(),
            num_blocks: 0,
        }
    }

    #[inline]
    fn is_exhausted(&self) -> bool {
        self.cur_slot.is_null() || self.cur_slot > self.last_slot
    }
}

/// Pool serving allocations of one fixed slot size
pub struct SizeClassPool {
    /// Size of every slot, fixed at initialization
    slot_size: usize,
    /// [Layout] of every block
    block_layout: Layout,
    /// Head of the free list
    ///
    /// Low [TAG_SHIFT] bits hold the address of the first free [Slot],
    /// the bits above hold a counter bumped by every push
    free_list: AtomicU64,
    /// Block chain and carving cursor
    blocks: Mutex<BlockCursor>,
}

impl Debug for SizeClassPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let free_list = self.free_list.load(Ordering::Relaxed);
        f.debug_struct("SizeClassPool")
            .field("@addr", &(self as *const _))
            .field("slot_size", &self.slot_size)
            .field("block_layout", &self.block_layout)
            .field("free_list", &UsizePtr::from(head_slot(free_list)))
            .field("free_list_tag", &head_tag(free_list))
            .finish_non_exhaustive()
    }
}

impl SizeClassPool {
    /// Create an empty pool
    ///
    /// `slot_size` is rounded up so that every slot can hold the free list
    /// link and starts aligned. No block is acquired until the first
    /// allocation needs one.
    pub fn new(slot_size: usize, block_size: usize) -> Result<Self, AllocError> {
        if slot_size == 0 {
            return Err(AllocError::InvalidConfig("slot size must be nonzero"));
        }
        let slot_size = cmp::max(slot_size, size_of::<Slot>());
        let Some(slot_size) = checked_roundto(slot_size, SLOT_ALIGN) else {
            return Err(AllocError::InvalidConfig("slot size overflows"));
        };
        let Some(min_block_size) = slot_size.checked_add(BLOCK_HDR_SZ) else {
            return Err(AllocError::InvalidConfig("slot size overflows"));
        };
        if block_size < min_block_size {
            return Err(AllocError::InvalidConfig(
                "block size cannot hold a single slot",
            ));
        }
        let block_layout = Layout::from_size_align(block_size, BLOCK_ALIGN)
            .map_err(|_| AllocError::InvalidConfig("block size overflows"))?;

        Ok(Self {
            slot_size,
            block_layout,
            free_list: AtomicU64::new(0),
            blocks: Mutex::new(BlockCursor::new()),
        })
    }

    /// Reset this pool to the empty state with new sizes
    ///
    /// Every block the pool previously owned is released, so any
    /// slot handed out before must no longer be in use.
    pub fn init(&mut self, slot_size: usize, block_size: usize) -> Result<(), AllocError> {
        *self = Self::new(slot_size, block_size)?;
        Ok(())
    }

    #[inline]
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_layout.size()
    }

    /// Number of slots carved out of each block
    #[inline]
    pub fn slots_per_block(&self) -> usize {
        (self.block_layout.size() - BLOCK_HDR_SZ) / self.slot_size
    }

    /// Number of blocks acquired from the system allocator so far
    pub fn num_blocks(&self) -> usize {
        self.lock_blocks().num_blocks
    }

    #[inline]
    fn lock_blocks(&self) -> MutexGuard<'_, BlockCursor> {
        // nothing panics while the cursor is half-updated
        self.blocks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get one slot of [slot_size](Self::slot_size) bytes
    ///
    /// Does *NOT* initialize any of the resulting memory. Only fails if a
    /// new block was needed and the system allocator could not supply it.
    pub fn allocate(&self) -> Result<NonNull<u8>, AllocError> {
        match self.pop_free_list() {
            Some(slot) => Ok(slot.cast()), // fast path
            None => self.allocate_slow(),
        }
    }

    /// Allocation slow path: carve a never-used slot, growing if needed
    fn allocate_slow(&self) -> Result<NonNull<u8>, AllocError> {
        let trace_span = tracing::span!(
            Level::TRACE,
            "size_class::allocate_slow",
            slot_size = self.slot_size
        );
        let _span_enter = trace_span.enter();

        let mut blocks = self.lock_blocks();
        if blocks.is_exhausted() {
            self.new_block(&mut blocks)?;
        }

        let slot = blocks.cur_slot;
        blocks.cur_slot = slot.wrapping_add(self.slot_size);
        tracing::event!(Level::TRACE, ptr = ?UsizePtr::from(slot));

        // safety: slot lies within a block that was just checked to be non-null
        Ok(unsafe { NonNull::new_unchecked(slot) })
    }

    /// Acquire a new block, link it into the chain,
    /// and point the cursor at its first slot
    fn new_block(&self, blocks: &mut BlockCursor) -> Result<(), AllocError> {
        let block = unsafe { alloc::alloc(self.block_layout) };
        if block.is_null() {
            tracing::event!(
                Level::WARN,
                slot_size = self.slot_size,
                layout = ?self.block_layout,
                "system allocator could not supply a block"
            );
            return Err(AllocError::ResourceExhaustion {
                layout: self.block_layout,
            });
        }

        if !block_fits_in_head(block as usize, self.block_layout.size()) {
            tracing::event!(
                Level::WARN,
                slot_size = self.slot_size,
                block = ?UsizePtr::from(block),
                "block lies above the addressable range of the free list"
            );
            unsafe { alloc::dealloc(block, self.block_layout) };
            return Err(AllocError::ResourceExhaustion {
                layout: self.block_layout,
            });
        }

        unsafe {
            // safety: the block is at least BLOCK_HDR_SZ + slot_size bytes
            // and aligned for a pointer (checked in new)
            (block as *mut *mut u8).write(blocks.newest_block);
            blocks.newest_block = block;
            blocks.cur_slot = block.add(BLOCK_HDR_SZ);
            blocks.last_slot = block.add(self.block_layout.size() - self.slot_size);
        }
        blocks.num_blocks += 1;

        tracing::event!(
            Level::DEBUG,
            slot_size = self.slot_size,
            block = ?UsizePtr::from(block),
            num_blocks = blocks.num_blocks,
            "acquired new block"
        );
        Ok(())
    }

    /// Return a slot to this pool
    ///
    /// # Safety
    ///
    /// `ptr` must have come from [allocate](Self::allocate) on this same pool,
    /// must not already be free, and must not be used after this call.
    /// None of this is checked.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        self.push_free_list(ptr.cast());
    }

    /// Lock-free push onto the free list
    unsafe fn push_free_list(&self, slot: NonNull<Slot>) {
        let mut head = self.free_list.load(Ordering::Relaxed);
        // the slot was caller storage until now, so give it a fresh link.
        // a stale pop may still be loading this word, so keep it atomic
        #[cfg(not(loom))]
        AtomicU64::from_ptr(slot.as_ptr().cast::<u64>())
            .store(head & ADDR_MASK, Ordering::Relaxed);
        #[cfg(loom)]
        slot.as_ptr().write(Slot {
            next: AtomicU64::new(head & ADDR_MASK),
        });
        let slot = slot.as_ref();
        let slot_addr = slot as *const Slot as usize as u64;

        loop {
            let new_head = make_head(slot_addr, head_tag(head).wrapping_add(1));
            // order: on success, we are the most recent modification to the head.
            // release so that the write to slot.next happens-before
            // any pop that acquires this head
            match self.free_list.compare_exchange_weak(
                head,
                new_head,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => {
                    head = x;
                    slot.store_next(head & ADDR_MASK);
                    spin_hint();
                }
            }
        }
    }

    /// Lock-free pop from the free list
    fn pop_free_list(&self) -> Option<NonNull<Slot>> {
        // order: need to see the next pointer written by whoever pushed
        // the head we observe, so acquire (on both the load and a failed CAS)
        let mut head = self.free_list.load(Ordering::Acquire);
        loop {
            let slot = NonNull::new(head_slot(head))?;
            // safety: anything that was ever on this list lives in one of our
            // blocks, and blocks outlive &self. if the slot was popped and
            // handed out in the meantime this reads garbage, but then the
            // head has changed and the CAS below fails.
            let next = unsafe { slot.as_ref() }.load_next();
            match self.free_list.compare_exchange_weak(
                head,
                make_head(next & ADDR_MASK, head_tag(head)),
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(slot),
                Err(x) => {
                    head = x;
                    spin_hint();
                }
            }
        }
    }
}

impl Drop for SizeClassPool {
    fn drop(&mut self) {
        let mut blocks = self.lock_blocks();
        let mut block = blocks.newest_block;
        while !block.is_null() {
            unsafe {
                // safety: every block in the chain came from alloc with block_layout
                // and nothing else can reach them since we have &mut self
                let prev = (block as *mut *mut u8).read();
                alloc::dealloc(block, self.block_layout);
                block = prev;
            }
        }
        *blocks = BlockCursor::new();
    }
}
