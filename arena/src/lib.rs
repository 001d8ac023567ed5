//! Growable byte arena for the loam heap.
//!
//! An [`Arena`] is a single contiguous byte region that only ever grows at
//! the high end, in the manner of the classical `sbrk` break pointer. The
//! heap core never touches backing memory directly; it asks the arena to
//! [`extend`](Arena::extend) and uses the arena's [`fill`](Arena::fill) and
//! [`copy`](Arena::copy) primitives for bulk byte movement.
//!
//! The arena does not allocate its own backing storage. The host binds a
//! region once via [`Arena::from_raw`] and the break pointer advances inside
//! that capacity; a refused extension leaves the break untouched.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_op_in_unsafe_fn)]

use core::fmt;
use core::ptr::{self, NonNull};

/// Required alignment of the arena base address.
pub const ARENA_ALIGN: usize = 16;

/// Errors produced by arena operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArenaError {
    /// The arena has no backing region bound.
    Unbound,
    /// The requested extension does not fit in the remaining capacity.
    Exhausted { requested: usize, available: usize },
    /// The backing region base is not 16-byte aligned.
    Misaligned { base: usize },
}

impl fmt::Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unbound => write!(f, "arena has no backing region"),
            Self::Exhausted {
                requested,
                available,
            } => {
                write!(
                    f,
                    "arena exhausted: requested {} bytes, {} available",
                    requested, available
                )
            }
            Self::Misaligned { base } => {
                write!(f, "arena base {:#x} not aligned to {}", base, ARENA_ALIGN)
            }
        }
    }
}

/// Convenience result type for arena operations.
pub type ArenaResult<T = ()> = Result<T, ArenaError>;

/// A monotonically-growable byte region.
///
/// `lo()` and `hi()` are the inclusive bounds of the *extended* part of the
/// region; bytes past the break are capacity, not arena.
pub struct Arena {
    base: *mut u8,
    capacity: usize,
    brk: usize,
}

unsafe impl Send for Arena {}

impl Arena {
    /// An arena with no backing region. Every extension fails until a region
    /// is bound; this is the state a const-constructed heap starts in.
    pub const fn empty() -> Self {
        Self {
            base: ptr::null_mut(),
            capacity: 0,
            brk: 0,
        }
    }

    /// Binds a backing region of `capacity` bytes starting at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point to a readable and writable region of at least
    /// `capacity` bytes that outlives the arena and is not accessed through
    /// any other path while the arena is alive.
    pub unsafe fn from_raw(base: NonNull<u8>, capacity: usize) -> ArenaResult<Self> {
        let addr = base.as_ptr() as usize;
        if addr % ARENA_ALIGN != 0 {
            return Err(ArenaError::Misaligned { base: addr });
        }
        Ok(Self {
            base: base.as_ptr(),
            capacity,
            brk: 0,
        })
    }

    /// Whether a backing region has been bound.
    pub fn is_bound(&self) -> bool {
        !self.base.is_null()
    }

    /// Grows the arena by `n` bytes and returns the base of the new region.
    ///
    /// On refusal the break pointer is unchanged and the arena remains
    /// exactly as it was.
    pub fn extend(&mut self, n: usize) -> ArenaResult<NonNull<u8>> {
        if self.base.is_null() {
            return Err(ArenaError::Unbound);
        }
        let available = self.capacity - self.brk;
        if n > available {
            log::debug!(
                "arena: refusing extension of {} bytes ({} available)",
                n,
                available
            );
            return Err(ArenaError::Exhausted {
                requested: n,
                available,
            });
        }
        let region = unsafe { self.base.add(self.brk) };
        self.brk += n;
        log::trace!("arena: extended by {} bytes to {}", n, self.brk);
        Ok(unsafe { NonNull::new_unchecked(region) })
    }

    /// First byte of the arena.
    pub fn lo(&self) -> *mut u8 {
        self.base
    }

    /// Last extended byte of the arena (inclusive). One below `lo()` while
    /// the arena is empty, mirroring the break-pointer convention.
    pub fn hi(&self) -> *mut u8 {
        self.base.wrapping_add(self.brk).wrapping_sub(1)
    }

    /// Number of bytes extended so far.
    pub fn len(&self) -> usize {
        self.brk
    }

    /// Whether nothing has been extended yet.
    pub fn is_empty(&self) -> bool {
        self.brk == 0
    }

    /// Total bytes the backing region can ever hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether `p` points into the extended part of the arena.
    pub fn contains(&self, p: *const u8) -> bool {
        let addr = p as usize;
        let lo = self.base as usize;
        addr >= lo && addr < lo + self.brk
    }

    /// Writes `n` copies of `value` starting at `dst`.
    ///
    /// # Safety
    ///
    /// `[dst, dst + n)` must lie within the extended arena.
    pub unsafe fn fill(&mut self, dst: *mut u8, value: u8, n: usize) {
        debug_assert!(n == 0 || self.contains(dst));
        debug_assert!(n == 0 || self.contains(dst.wrapping_add(n - 1)));
        ptr::write_bytes(dst, value, n);
    }

    /// Copies `n` bytes from `src` to `dst`. The ranges may overlap.
    ///
    /// # Safety
    ///
    /// Both `[src, src + n)` and `[dst, dst + n)` must lie within the
    /// extended arena.
    pub unsafe fn copy(&mut self, dst: *mut u8, src: *const u8, n: usize) {
        debug_assert!(n == 0 || (self.contains(src) && self.contains(dst)));
        ptr::copy(src, dst, n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::Layout;

    fn backing(capacity: usize) -> NonNull<u8> {
        let layout = Layout::from_size_align(capacity, ARENA_ALIGN).unwrap();
        let base = unsafe { std::alloc::alloc(layout) };
        NonNull::new(base).expect("backing allocation failed")
    }

    #[test]
    fn extend_bumps_the_break() {
        let mut arena = unsafe { Arena::from_raw(backing(256), 256) }.unwrap();
        assert!(arena.is_empty());

        let first = arena.extend(64).unwrap();
        assert_eq!(first.as_ptr(), arena.lo());
        assert_eq!(arena.len(), 64);

        let second = arena.extend(32).unwrap();
        assert_eq!(second.as_ptr() as usize, arena.lo() as usize + 64);
        assert_eq!(arena.len(), 96);
        assert_eq!(arena.hi() as usize, arena.lo() as usize + 95);
    }

    #[test]
    fn refused_extension_leaves_state_untouched() {
        let mut arena = unsafe { Arena::from_raw(backing(128), 128) }.unwrap();
        arena.extend(96).unwrap();

        let err = arena.extend(64).unwrap_err();
        assert_eq!(
            err,
            ArenaError::Exhausted {
                requested: 64,
                available: 32,
            }
        );
        assert_eq!(arena.len(), 96);

        // The remainder is still claimable after a refusal.
        arena.extend(32).unwrap();
        assert_eq!(arena.len(), 128);
    }

    #[test]
    fn unbound_arena_refuses_everything() {
        let mut arena = Arena::empty();
        assert!(!arena.is_bound());
        assert_eq!(arena.extend(16).unwrap_err(), ArenaError::Unbound);
    }

    #[test]
    fn contains_tracks_the_break() {
        let mut arena = unsafe { Arena::from_raw(backing(128), 128) }.unwrap();
        arena.extend(64).unwrap();

        assert!(arena.contains(arena.lo()));
        assert!(arena.contains(arena.hi()));
        assert!(!arena.contains(arena.hi().wrapping_add(1)));
    }
}
