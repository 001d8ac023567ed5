//! Block navigation over the arena.
//!
//! A [`Block`] is a thin copyable handle pointing at a block's header word.
//! It is a projection over arena bytes, not a durable object: every accessor
//! re-reads the header, and the handle stays valid only as long as the block
//! it names exists (coalescing destroys blocks).
//!
//! The intrusive free-list slots ([`link_prev`](Block::link_prev),
//! [`link_next`](Block::link_next), [`mini_next`](Block::mini_next)) occupy
//! payload bytes and are only meaningful while the block is free; the
//! accessors assert that state in debug builds.

use core::ptr;

use crate::header::{self, HeaderFlags};
use crate::heap_constants::{MIN_BLOCK_SIZE, WORD_SIZE};

/// Handle to one physical block, identified by its header word address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Block {
    header: *mut u64,
}

impl Block {
    pub const NULL: Block = Block {
        header: ptr::null_mut(),
    };

    /// Handle for the block whose header word sits at `ptr`.
    pub fn from_header(ptr: *mut u8) -> Block {
        Block {
            header: ptr.cast(),
        }
    }

    /// Handle for the block owning the payload at `payload`.
    ///
    /// # Safety
    ///
    /// `payload` must be a payload pointer previously produced by this
    /// allocator, one word past a live header.
    pub unsafe fn from_payload(payload: *mut u8) -> Block {
        Block {
            header: payload.cast::<u64>().sub(1),
        }
    }

    pub fn is_null(self) -> bool {
        self.header.is_null()
    }

    /// Address of the header word, as a byte pointer.
    pub fn addr(self) -> *mut u8 {
        self.header.cast()
    }

    /// # Safety
    ///
    /// The handle must point at a readable header word.
    pub unsafe fn header_word(self) -> u64 {
        self.header.read()
    }

    /// # Safety
    ///
    /// The handle must point at a writable header word.
    pub unsafe fn set_header_word(self, word: u64) {
        self.header.write(word);
    }

    /// # Safety
    ///
    /// The handle must point at a readable header word.
    pub unsafe fn size(self) -> usize {
        header::extract_size(self.header_word())
    }

    /// # Safety
    ///
    /// The handle must point at a readable header word.
    pub unsafe fn flags(self) -> HeaderFlags {
        header::extract_flags(self.header_word())
    }

    /// # Safety
    ///
    /// The handle must point at a readable header word.
    pub unsafe fn is_alloc(self) -> bool {
        self.flags().contains(HeaderFlags::ALLOC)
    }

    /// # Safety
    ///
    /// The handle must point at a readable header word.
    pub unsafe fn prev_alloc(self) -> bool {
        self.flags().contains(HeaderFlags::PREV_ALLOC)
    }

    /// # Safety
    ///
    /// The handle must point at a readable header word.
    pub unsafe fn prev_mini(self) -> bool {
        self.flags().contains(HeaderFlags::PREV_MINI)
    }

    /// # Safety
    ///
    /// The handle must point at a readable header word.
    pub unsafe fn is_mini(self) -> bool {
        self.size() == MIN_BLOCK_SIZE
    }

    /// Pointer to the payload, one word past the header.
    ///
    /// # Safety
    ///
    /// The handle must name a real block, not a sentinel.
    pub unsafe fn payload(self) -> *mut u8 {
        self.header.add(1).cast()
    }

    /// Bytes of payload the block can hold: its size minus the header word.
    ///
    /// # Safety
    ///
    /// The handle must name a real block, not a sentinel.
    pub unsafe fn payload_size(self) -> usize {
        self.size() - WORD_SIZE
    }

    /// The physically following block (or the epilogue sentinel).
    ///
    /// # Safety
    ///
    /// The handle must name a real block within the arena.
    pub unsafe fn next(self) -> Block {
        Block::from_header(self.addr().add(self.size()))
    }

    /// The physically preceding block.
    ///
    /// Returns [`Block::NULL`] when the predecessor is the prologue.
    ///
    /// # Safety
    ///
    /// Callable only when the predecessor is free or is a mini block: a
    /// mini predecessor is found by its fixed size, any other predecessor
    /// through its footer, which exists only while it is free.
    pub unsafe fn prev(self) -> Block {
        if self.prev_mini() {
            return Block::from_header(self.addr().sub(MIN_BLOCK_SIZE));
        }
        let footer = self.header.sub(1).read();
        let size = header::extract_size(footer);
        if size == 0 {
            return Block::NULL;
        }
        Block::from_header(self.addr().sub(size))
    }

    /// Pointer to the footer word, the last word of the block.
    ///
    /// # Safety
    ///
    /// Meaningful only for a free normal block; mini and allocated blocks
    /// have payload bytes there.
    pub unsafe fn footer(self) -> *mut u64 {
        self.addr().add(self.size() - WORD_SIZE).cast()
    }

    /// Rewrites the header (and the footer, for a free normal block).
    ///
    /// # Safety
    ///
    /// The handle must name a writable region of at least `size` bytes.
    pub unsafe fn write(self, size: usize, flags: HeaderFlags) {
        let word = header::pack(size, flags);
        self.set_header_word(word);
        if !flags.contains(HeaderFlags::ALLOC) && size > MIN_BLOCK_SIZE {
            self.footer().write(word);
        }
    }

    /// Updates the predecessor-description bits, leaving size and allocation
    /// status untouched. Used on the successor of a block whose state just
    /// changed; the successor never carries a footer at that point.
    ///
    /// # Safety
    ///
    /// The handle must point at a writable header word.
    pub unsafe fn set_prev_flags(self, prev_alloc: bool, prev_mini: bool) {
        let mut flags = self.flags();
        flags.set(HeaderFlags::PREV_ALLOC, prev_alloc);
        flags.set(HeaderFlags::PREV_MINI, prev_mini);
        self.set_header_word(header::pack(self.size(), flags));
    }

    fn slot(self, index: usize) -> *mut u64 {
        unsafe { self.header.add(1 + index) }
    }

    unsafe fn read_slot(self, index: usize) -> Block {
        Block {
            header: self.slot(index).read() as *mut u64,
        }
    }

    unsafe fn write_slot(self, index: usize, target: Block) {
        self.slot(index).write(target.header as u64);
    }

    /// Previous block on the free list (first payload word).
    ///
    /// # Safety
    ///
    /// The block must be a free normal block.
    pub unsafe fn link_prev(self) -> Block {
        debug_assert!(!self.is_alloc() && !self.is_mini());
        self.read_slot(0)
    }

    /// # Safety
    ///
    /// The block must be a free normal block.
    pub unsafe fn set_link_prev(self, target: Block) {
        debug_assert!(!self.is_alloc() && !self.is_mini());
        self.write_slot(0, target);
    }

    /// Next block on the free list (second payload word).
    ///
    /// # Safety
    ///
    /// The block must be a free normal block.
    pub unsafe fn link_next(self) -> Block {
        debug_assert!(!self.is_alloc() && !self.is_mini());
        self.read_slot(1)
    }

    /// # Safety
    ///
    /// The block must be a free normal block.
    pub unsafe fn set_link_next(self, target: Block) {
        debug_assert!(!self.is_alloc() && !self.is_mini());
        self.write_slot(1, target);
    }

    /// Next block on the mini free list (the single payload word).
    ///
    /// # Safety
    ///
    /// The block must be a free mini block.
    pub unsafe fn mini_next(self) -> Block {
        debug_assert!(!self.is_alloc() && self.is_mini());
        self.read_slot(0)
    }

    /// # Safety
    ///
    /// The block must be a free mini block.
    pub unsafe fn set_mini_next(self, target: Block) {
        debug_assert!(!self.is_alloc() && self.is_mini());
        self.write_slot(0, target);
    }
}
