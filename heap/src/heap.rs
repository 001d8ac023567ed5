//! The heap core: initialization, arena extension, coalescing, placement
//! and the public allocation interface.
//!
//! The arena holds a prologue word, a sequence of 16-byte-aligned blocks
//! and an epilogue word. Every mutation keeps the neighbor-description bits
//! (`prev_alloc`, `prev_mini`) of the successor in sync, so a block can
//! always tell whether its physical predecessor is reachable.

use core::ptr;

use loam_arena::Arena;

use crate::block::Block;
use crate::error::{HeapError, HeapResult};
use crate::free_list::SegregatedLists;
use crate::header::{self, HeaderFlags};
use crate::heap_constants::{
    CHUNK_SIZE, CLOSE_ENOUGH, DWORD_SIZE, MIN_BLOCK_SIZE, NUM_SIZE_CLASSES, SEARCH_LIMIT,
    WORD_SIZE, align_up,
};
use crate::size_class;

/// Point-in-time heap counters, returned by value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes the arena currently spans, sentinels included.
    pub heap_size: usize,
    /// Bytes held by live allocations, headers included.
    pub allocated_bytes: usize,
    /// Allocations served since init.
    pub allocation_count: u64,
    /// Frees served since init.
    pub free_count: u64,
}

/// A segregated-free-list heap over a growable byte arena.
///
/// Const-constructible in an unbound state; [`init`](Heap::init) binds an
/// arena and lays out the sentinels. Before init every allocation returns
/// null.
pub struct Heap {
    pub(crate) arena: Arena,
    pub(crate) lists: SegregatedLists,
    /// Address of the first block header, one word past the arena base.
    pub(crate) first_block: Block,
    pub(crate) initialized: bool,
    allocated_bytes: usize,
    allocation_count: u64,
    free_count: u64,
}

unsafe impl Send for Heap {}

impl Heap {
    pub const fn new() -> Self {
        Self {
            arena: Arena::empty(),
            lists: SegregatedLists::new(),
            first_block: Block::NULL,
            initialized: false,
            allocated_bytes: 0,
            allocation_count: 0,
            free_count: 0,
        }
    }

    /// Binds `arena` and lays out the initial heap: prologue and epilogue
    /// words from a 16-byte extension, then one seed free block of
    /// [`CHUNK_SIZE`] bytes. Idempotent once it has succeeded.
    pub fn init(&mut self, arena: Arena) -> HeapResult {
        if self.initialized {
            return Ok(());
        }

        self.arena = arena;
        self.lists.reset();

        let start = self
            .arena
            .extend(2 * WORD_SIZE)
            .map_err(|_| HeapError::NoMemory)?
            .as_ptr()
            .cast::<u64>();
        let sentinel = header::pack(0, HeaderFlags::ALLOC | HeaderFlags::PREV_ALLOC);
        unsafe {
            // Prologue, then the epilogue it abuts; the first extension
            // turns the epilogue into the seed block's header.
            start.write(sentinel);
            start.add(1).write(sentinel);
        }
        self.first_block = Block::from_header(unsafe { start.add(1) }.cast());

        if self.extend_heap(CHUNK_SIZE).is_null() {
            return Err(HeapError::NoMemory);
        }

        self.initialized = true;
        log::debug!(
            "heap initialized at {:p}, {} bytes seeded",
            self.arena.lo(),
            self.arena.len()
        );
        Ok(())
    }

    /// Counters plus the current arena span.
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            heap_size: self.arena.len(),
            allocated_bytes: self.allocated_bytes,
            allocation_count: self.allocation_count,
            free_count: self.free_count,
        }
    }

    /// Allocates `size` bytes and returns a 16-byte-aligned payload pointer,
    /// or null when `size` is zero, the heap is uninitialized, or the arena
    /// cannot grow far enough.
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        debug_assert!(self.check_heap(line!()));

        if !self.initialized {
            log::debug!("allocate: heap not initialized");
            return ptr::null_mut();
        }
        if size == 0 {
            return ptr::null_mut();
        }

        // One header word of overhead, rounded to the alignment unit; the
        // smallest requests collapse into a mini block.
        let asize = if size <= WORD_SIZE {
            MIN_BLOCK_SIZE
        } else {
            align_up(size.saturating_add(WORD_SIZE), DWORD_SIZE)
        };

        unsafe {
            let mut block = self.find_fit(asize);
            if block.is_null() {
                block = self.extend_heap(asize.max(CHUNK_SIZE));
                if block.is_null() {
                    return ptr::null_mut();
                }
            }
            debug_assert!(!block.is_alloc());

            self.lists.remove(block);

            let block_size = block.size();
            block.write(
                block_size,
                HeaderFlags::new(true, block.prev_alloc(), block.prev_mini()),
            );
            block
                .next()
                .set_prev_flags(true, block_size == MIN_BLOCK_SIZE);

            self.split(block, asize);

            self.allocated_bytes += block.size();
            self.allocation_count += 1;

            debug_assert!(self.check_heap(line!()));
            block.payload()
        }
    }

    /// Releases the allocation behind `payload`. Null is a no-op.
    ///
    /// # Safety
    ///
    /// `payload` must be null or a pointer returned by this heap's
    /// allocation calls that has not been freed since.
    pub unsafe fn free(&mut self, payload: *mut u8) {
        if payload.is_null() {
            return;
        }
        if !self.initialized || !self.arena.contains(payload) {
            log::debug!("free: pointer {:p} is not from this heap", payload);
            return;
        }
        debug_assert!(self.check_heap(line!()));

        let block = Block::from_payload(payload);
        debug_assert!(block.is_alloc());

        let size = block.size();
        block.write(
            size,
            HeaderFlags::new(false, block.prev_alloc(), block.prev_mini()),
        );
        block.next().set_prev_flags(false, size == MIN_BLOCK_SIZE);

        self.allocated_bytes = self.allocated_bytes.saturating_sub(size);
        self.free_count += 1;

        self.coalesce(block);
        debug_assert!(self.check_heap(line!()));
    }

    /// Moves the allocation behind `payload` to a region of `size` bytes,
    /// preserving the smaller of the old and new payload sizes. Null input
    /// degenerates to [`allocate`](Heap::allocate); zero size degenerates to
    /// [`free`](Heap::free) and returns null.
    ///
    /// # Safety
    ///
    /// As [`free`](Heap::free) for `payload`.
    pub unsafe fn reallocate(&mut self, payload: *mut u8, size: usize) -> *mut u8 {
        if size == 0 {
            self.free(payload);
            return ptr::null_mut();
        }
        if payload.is_null() {
            return self.allocate(size);
        }

        let new_payload = self.allocate(size);
        if new_payload.is_null() {
            // The original allocation is left untouched.
            return ptr::null_mut();
        }

        let old_block = Block::from_payload(payload);
        let copy_len = old_block.payload_size().min(size);
        self.arena.copy(new_payload, payload, copy_len);

        self.free(payload);
        new_payload
    }

    /// Allocates room for `count` elements of `size` bytes each and zeroes
    /// it. Returns null on a zero count, on overflow of `count * size`, or
    /// on allocation failure.
    pub fn allocate_zeroed(&mut self, count: usize, size: usize) -> *mut u8 {
        if count == 0 {
            return ptr::null_mut();
        }
        let Some(total) = count.checked_mul(size) else {
            return ptr::null_mut();
        };

        let payload = self.allocate(total);
        if payload.is_null() {
            return ptr::null_mut();
        }
        unsafe {
            self.arena.fill(payload, 0, total);
        }
        payload
    }

    /// Grows the arena by at least `size` bytes and returns the resulting
    /// free block, already coalesced with a free block ending at the old
    /// epilogue. Null when the arena refuses.
    ///
    /// The old epilogue word becomes the new block's header and a fresh
    /// epilogue is written past the grown region.
    pub(crate) fn extend_heap(&mut self, size: usize) -> Block {
        let size = align_up(size, DWORD_SIZE);
        let Ok(region) = self.arena.extend(size) else {
            return Block::NULL;
        };

        unsafe {
            let block = Block::from_payload(region.as_ptr());
            block.write(
                size,
                HeaderFlags::new(false, block.prev_alloc(), block.prev_mini()),
            );

            let epilogue = block.next();
            epilogue.set_header_word(header::pack(
                0,
                HeaderFlags::new(true, false, size == MIN_BLOCK_SIZE),
            ));

            self.coalesce(block)
        }
    }

    /// Merges a just-freed block with free physical neighbors, inserts the
    /// result into its free list, and refreshes the successor's
    /// neighbor-description bits. Returns the merged block.
    ///
    /// # Safety
    ///
    /// `block` must be marked free, off every list, with its successor's
    /// `prev_alloc` already cleared.
    unsafe fn coalesce(&mut self, mut block: Block) -> Block {
        let next = block.next();
        let prev_alloc = block.prev_alloc();
        let next_alloc = next.is_alloc();

        match (prev_alloc, next_alloc) {
            (true, true) => {
                self.lists.insert(block);
            }
            (false, true) => {
                let prev = block.prev();
                let merged = prev.size() + block.size();
                let flags = HeaderFlags::new(false, prev.prev_alloc(), prev.prev_mini());
                self.lists.remove(prev);
                block = prev;
                block.write(merged, flags);
                self.lists.insert(block);
            }
            (true, false) => {
                let merged = block.size() + next.size();
                let flags = HeaderFlags::new(false, block.prev_alloc(), block.prev_mini());
                self.lists.remove(next);
                block.write(merged, flags);
                self.lists.insert(block);
            }
            (false, false) => {
                let prev = block.prev();
                let merged = prev.size() + block.size() + next.size();
                let flags = HeaderFlags::new(false, prev.prev_alloc(), prev.prev_mini());
                self.lists.remove(next);
                self.lists.remove(prev);
                block = prev;
                block.write(merged, flags);
                self.lists.insert(block);
            }
        }

        // Only the untouched-neighbors case can leave a mini block behind.
        block
            .next()
            .set_prev_flags(false, block.size() == MIN_BLOCK_SIZE);
        block
    }

    /// Bounded best-fit over the segregated lists.
    ///
    /// Mini requests take the mini-list head outright when one exists.
    /// Otherwise each bucket from the target class upward is scanned up to
    /// [`SEARCH_LIMIT`] entries, carrying the best fit so far; a surplus of
    /// at most [`CLOSE_ENOUGH`] bytes ends the search early.
    ///
    /// # Safety
    ///
    /// The heap must be initialized and consistent.
    unsafe fn find_fit(&self, asize: usize) -> Block {
        let seg = size_class::bucket(asize);
        if seg == 0 {
            let head = self.lists.head(0);
            if !head.is_null() {
                return head;
            }
        }

        let mut best = Block::NULL;
        let mut min_surplus = usize::MAX;

        for index in seg.max(1)..NUM_SIZE_CLASSES {
            let mut scanned = 0;
            let mut block = self.lists.head(index);
            while !block.is_null() && scanned < SEARCH_LIMIT {
                let size = block.size();
                if size >= asize {
                    let surplus = size - asize;
                    if surplus < min_surplus {
                        min_surplus = surplus;
                        best = block;
                    }
                    if min_surplus <= CLOSE_ENOUGH {
                        return best;
                    }
                }
                block = block.link_next();
                scanned += 1;
            }
        }

        best
    }

    /// Carves an `asize`-byte allocated block out of `block`, returning the
    /// surplus to the free lists when it can stand as a block of its own.
    ///
    /// # Safety
    ///
    /// `block` must be allocated, off every list, at least `asize` bytes.
    unsafe fn split(&mut self, block: Block, asize: usize) {
        debug_assert!(block.is_alloc());
        let block_size = block.size();
        if block_size - asize < MIN_BLOCK_SIZE {
            return;
        }

        block.write(
            asize,
            HeaderFlags::new(true, block.prev_alloc(), block.prev_mini()),
        );

        let remainder_size = block_size - asize;
        let remainder = block.next();
        remainder.write(
            remainder_size,
            HeaderFlags::new(false, true, asize == MIN_BLOCK_SIZE),
        );

        remainder
            .next()
            .set_prev_flags(false, remainder_size == MIN_BLOCK_SIZE);

        self.lists.insert(remainder);
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
