//! Error types for heap initialization.
//!
//! Allocation itself reports failure through a null payload pointer, as the
//! classical contract requires; only the fallible setup path carries a
//! typed error.

use core::fmt;

/// Heap setup error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// The arena refused the extension needed to lay out the heap.
    NoMemory,
    /// The backing region handed to the heap is not 16-byte aligned.
    MisalignedArena,
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMemory => write!(f, "arena out of memory"),
            Self::MisalignedArena => write!(f, "arena base not 16-byte aligned"),
        }
    }
}

/// Convenience result type for heap setup operations.
pub type HeapResult<T = ()> = Result<T, HeapError>;
