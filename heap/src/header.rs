//! Packed block header codec.
//!
//! One 64-bit word carries the block size in its upper bits and three flag
//! bits below. Block sizes are multiples of 16, so the low four bits of the
//! size are always zero and the flags live there. This module is the sole
//! authority over the bit layout; everything else goes through [`pack`],
//! [`extract_size`] and [`extract_flags`].

use bitflags::bitflags;

use crate::heap_constants::DWORD_SIZE;

bitflags! {
    /// Flag bits of a packed header word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u64 {
        /// This block is allocated.
        const ALLOC = 1 << 0;
        /// The physically preceding block is allocated.
        const PREV_ALLOC = 1 << 1;
        /// The physically preceding block is a mini block.
        const PREV_MINI = 1 << 2;
    }
}

impl HeaderFlags {
    /// Builds a flag set from the three block attributes.
    pub fn new(alloc: bool, prev_alloc: bool, prev_mini: bool) -> Self {
        let mut flags = Self::empty();
        flags.set(Self::ALLOC, alloc);
        flags.set(Self::PREV_ALLOC, prev_alloc);
        flags.set(Self::PREV_MINI, prev_mini);
        flags
    }
}

const SIZE_MASK: u64 = !0xF;

/// Packs a block size and its flags into one header word.
pub fn pack(size: usize, flags: HeaderFlags) -> u64 {
    debug_assert!(size % DWORD_SIZE == 0, "block size must be a multiple of 16");
    size as u64 | flags.bits()
}

/// Size carried by a packed word.
pub fn extract_size(word: u64) -> usize {
    (word & SIZE_MASK) as usize
}

/// Flag bits carried by a packed word.
pub fn extract_flags(word: u64) -> HeaderFlags {
    HeaderFlags::from_bits_truncate(word)
}
