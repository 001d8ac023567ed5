//! Size-class index: maps a block size to one of the fifteen buckets.

use crate::heap_constants::{MIN_BLOCK_SIZE, NUM_SIZE_CLASSES, SIZE_CLASS_LIMITS};

/// Bucket index for a block of `size` bytes.
///
/// Bucket 0 is reserved for mini blocks; bucket `i` (1..=13) holds sizes up
/// to `SIZE_CLASS_LIMITS[i - 1]`; bucket 14 holds the rest.
pub(crate) fn bucket(size: usize) -> usize {
    debug_assert!(size >= MIN_BLOCK_SIZE);
    if size == MIN_BLOCK_SIZE {
        return 0;
    }
    for (idx, limit) in SIZE_CLASS_LIMITS.iter().enumerate() {
        if size <= *limit {
            return idx + 1;
        }
    }
    NUM_SIZE_CLASSES - 1
}
