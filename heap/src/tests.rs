//! Directed allocator scenarios and randomized trace tests.
//!
//! The directed tests pin down the observable layout decisions (mini
//! blocks, best-fit reuse, coalescing steps); the trace tests hammer the
//! allocator with pseudo-random allocate/free sequences and re-verify every
//! structural invariant after each operation.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

use loam_arena::Arena;

use crate::LockedHeap;
use crate::block::Block;
use crate::heap::Heap;
use crate::heap_constants::{CHUNK_SIZE, DWORD_SIZE, MIN_BLOCK_SIZE};

fn backing(capacity: usize) -> NonNull<u8> {
    let layout = Layout::from_size_align(capacity, DWORD_SIZE).unwrap();
    let base = unsafe { std::alloc::alloc(layout) };
    NonNull::new(base).expect("backing allocation failed")
}

fn new_heap(capacity: usize) -> Heap {
    let arena = unsafe { Arena::from_raw(backing(capacity), capacity) }.unwrap();
    let mut heap = Heap::new();
    heap.init(arena).unwrap();
    heap
}

/// `(header address, size)` of every free block, in physical order.
fn free_blocks(heap: &Heap) -> Vec<(usize, usize)> {
    let mut frees = Vec::new();
    let mut block = heap.first_block;
    unsafe {
        while block.size() > 0 {
            if !block.is_alloc() {
                frees.push((block.addr() as usize, block.size()));
            }
            block = block.next();
        }
    }
    frees
}

/// The xorshift step used for trace generation; seeded, so every run sees
/// the same trace.
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

#[test]
fn single_byte_allocation_uses_a_mini_block() {
    let mut heap = new_heap(1 << 16);

    let p = heap.allocate(1);
    assert!(!p.is_null());
    assert_eq!(p as usize % DWORD_SIZE, 0);
    unsafe {
        assert_eq!(Block::from_payload(p).size(), MIN_BLOCK_SIZE);
        heap.free(p);
    }

    // The freed mini coalesces back into one block spanning the seed.
    assert_eq!(free_blocks(&heap), vec![(heap.first_block.addr() as usize, CHUNK_SIZE)]);
    assert!(heap.check_heap(line!()));
}

#[test]
fn freeing_neighbors_coalesces_stepwise() {
    let mut heap = new_heap(1 << 16);

    let a = heap.allocate(24);
    let b = heap.allocate(24);
    let c = heap.allocate(24);
    assert!(!a.is_null() && !b.is_null() && !c.is_null());
    assert_ne!(a, b);
    assert_ne!(b, c);
    unsafe {
        assert_eq!(Block::from_payload(a).size(), 32);
        assert_eq!(Block::from_payload(b).size(), 32);
        assert_eq!(Block::from_payload(c).size(), 32);
    }
    let tail = CHUNK_SIZE - 3 * 32;

    unsafe {
        // Middle: both neighbors allocated, no merge.
        heap.free(b);
        let sizes: Vec<usize> = free_blocks(&heap).iter().map(|&(_, s)| s).collect();
        assert_eq!(sizes, vec![32, tail]);

        // First: merges forward into the middle hole.
        heap.free(a);
        let sizes: Vec<usize> = free_blocks(&heap).iter().map(|&(_, s)| s).collect();
        assert_eq!(sizes, vec![64, tail]);

        // Third: bridges the hole and the tail into one region.
        heap.free(c);
    }
    let sizes: Vec<usize> = free_blocks(&heap).iter().map(|&(_, s)| s).collect();
    assert_eq!(sizes, vec![CHUNK_SIZE]);
    assert!(heap.check_heap(line!()));
}

#[test]
fn best_fit_reuses_the_freed_hole() {
    let mut heap = new_heap(1 << 16);

    let a = heap.allocate(40);
    let b = heap.allocate(40);
    assert!(!a.is_null() && !b.is_null());
    unsafe {
        heap.free(a);
    }

    // The 48-byte hole beats the large tail; the surplus becomes a mini
    // block on bucket 0.
    let c = heap.allocate(24);
    assert_eq!(c, a);
    unsafe {
        assert_eq!(Block::from_payload(c).size(), 32);
    }
    let mini = heap.lists.head(0);
    assert!(!mini.is_null());
    unsafe {
        assert_eq!(mini.size(), MIN_BLOCK_SIZE);
        assert_eq!(mini.addr(), Block::from_payload(c).addr().add(32));
    }
    assert!(heap.check_heap(line!()));
}

#[test]
fn zeroed_allocation_returns_zero_bytes() {
    let mut heap = new_heap(1 << 16);

    let p = heap.allocate_zeroed(4, 16);
    assert!(!p.is_null());
    unsafe {
        for offset in 0..64 {
            assert_eq!(p.add(offset).read(), 0);
        }
        // Dirty the region, release it, and demand zeroed memory again.
        ptr::write_bytes(p, 0xA5, 64);
        heap.free(p);
    }
    let q = heap.allocate_zeroed(4, 16);
    assert!(!q.is_null());
    unsafe {
        for offset in 0..64 {
            assert_eq!(q.add(offset).read(), 0);
        }
    }
}

#[test]
fn zeroed_allocation_rejects_degenerate_requests() {
    let mut heap = new_heap(1 << 16);
    assert!(heap.allocate_zeroed(0, 16).is_null());
    assert!(heap.allocate_zeroed(usize::MAX, 2).is_null());
    assert!(heap.check_heap(line!()));
}

#[test]
fn reallocation_preserves_contents() {
    let mut heap = new_heap(1 << 16);

    let p = heap.allocate(4);
    assert!(!p.is_null());
    unsafe {
        p.copy_from_nonoverlapping(b"ABCD".as_ptr(), 4);
        let q = heap.reallocate(p, 100);
        assert!(!q.is_null());
        for (offset, expected) in b"ABCD".iter().enumerate() {
            assert_eq!(q.add(offset).read(), *expected);
        }

        // Shrinking keeps the prefix that still fits.
        let r = heap.reallocate(q, 2);
        assert!(!r.is_null());
        assert_eq!(r.read(), b'A');
        assert_eq!(r.add(1).read(), b'B');
        heap.free(r);
    }
    assert!(heap.check_heap(line!()));
}

#[test]
fn null_and_zero_degenerate_cases() {
    let mut heap = new_heap(1 << 16);

    assert!(heap.allocate(0).is_null());
    unsafe {
        // free(null) is a no-op.
        heap.free(ptr::null_mut());
        assert!(heap.check_heap(line!()));

        // reallocate(null, n) allocates.
        let p = heap.reallocate(ptr::null_mut(), 32);
        assert!(!p.is_null());

        // reallocate(p, 0) frees and reports null.
        assert!(heap.reallocate(p, 0).is_null());
    }
    assert_eq!(free_blocks(&heap).len(), 1);
    assert!(heap.check_heap(line!()));
}

#[test]
fn oversized_request_forces_extension() {
    let mut heap = new_heap(1 << 20);
    // Two sentinel words plus the seed block.
    assert_eq!(heap.stats().heap_size, CHUNK_SIZE + DWORD_SIZE);

    let p = heap.allocate(300_000);
    assert!(!p.is_null());
    assert_eq!(p as usize % DWORD_SIZE, 0);
    assert!(heap.stats().heap_size > 300_000);
    assert!(heap.check_heap(line!()));

    // The seed block merged into the grown region, so freeing leaves a
    // single free block spanning the whole heap.
    unsafe {
        heap.free(p);
    }
    assert_eq!(free_blocks(&heap).len(), 1);
    assert!(heap.check_heap(line!()));
}

#[test]
fn no_growth_when_a_freed_block_is_reused() {
    let mut heap = new_heap(1 << 16);

    let p = heap.allocate(17);
    assert!(!p.is_null());
    let span = heap.stats().heap_size;
    unsafe {
        heap.free(p);
    }

    let q = heap.allocate(17);
    assert_eq!(q, p);
    assert_eq!(heap.stats().heap_size, span);
    assert!(heap.check_heap(line!()));
}

#[test]
fn mini_blocks_recycle_through_the_mini_list() {
    let mut heap = new_heap(1 << 16);

    let held: Vec<*mut u8> = (0..16).map(|_| heap.allocate(8)).collect();
    assert!(held.iter().all(|p| !p.is_null()));

    // Free every other one; each freed mini has allocated neighbors, so
    // all of them land on bucket 0.
    for p in held.iter().step_by(2) {
        unsafe {
            heap.free(*p);
        }
    }
    assert!(!heap.lists.head(0).is_null());

    let span = heap.stats().heap_size;
    let p = heap.allocate(8);
    assert!(!p.is_null());
    unsafe {
        assert!(Block::from_payload(p).is_mini());
    }
    assert_eq!(heap.stats().heap_size, span, "mini reuse must not grow the arena");
    assert!(heap.check_heap(line!()));
}

#[test]
fn uninitialized_heap_refuses_allocation() {
    let mut heap = Heap::new();
    assert!(heap.allocate(32).is_null());
    assert!(heap.allocate_zeroed(2, 8).is_null());
    assert!(heap.check_heap(line!()));
}

#[test]
fn init_is_idempotent_once_bound() {
    let mut heap = new_heap(1 << 16);
    let p = heap.allocate(64);
    assert!(!p.is_null());
    unsafe {
        ptr::write_bytes(p, 0x42, 64);
    }

    let span = heap.stats().heap_size;
    let second = unsafe { Arena::from_raw(backing(1 << 16), 1 << 16) }.unwrap();
    heap.init(second).unwrap();

    assert_eq!(heap.stats().heap_size, span);
    unsafe {
        assert_eq!(p.read(), 0x42);
        heap.free(p);
    }
    assert!(heap.check_heap(line!()));
}

#[test]
fn exhaustion_fails_cleanly_and_recovers() {
    let mut heap = new_heap(8192);

    let mut held = Vec::new();
    loop {
        let p = heap.allocate(512);
        if p.is_null() {
            break;
        }
        held.push(p);
    }
    assert!(!held.is_empty());
    // The refused extension left no partial mutation behind.
    assert!(heap.check_heap(line!()));

    for p in held.drain(..) {
        unsafe {
            heap.free(p);
        }
    }
    assert_eq!(free_blocks(&heap).len(), 1);

    let p = heap.allocate(1024);
    assert!(!p.is_null());
    assert!(heap.check_heap(line!()));
}

#[test]
fn freeing_yields_a_spanning_free_region() {
    let mut heap = new_heap(1 << 18);

    let held: Vec<*mut u8> = (0..24).map(|i| heap.allocate(16 + 8 * i)).collect();
    assert!(held.iter().all(|p| !p.is_null()));

    let mut rng = XorShift(0xDEAD_BEEF_CAFE_F00D);
    let mut remaining = held;
    while !remaining.is_empty() {
        let victim = (rng.next() as usize) % remaining.len();
        let p = remaining.swap_remove(victim);

        let (start, size) = unsafe {
            let block = Block::from_payload(p);
            (block.addr() as usize, block.size())
        };
        unsafe {
            heap.free(p);
        }

        // Some free region must now cover the freed block whole.
        let spanning = free_blocks(&heap)
            .iter()
            .any(|&(addr, len)| addr <= start && addr + len >= start + size && len >= size);
        assert!(spanning, "free block not covered by a free region");
        assert!(heap.check_heap(line!()));
    }
}

#[test]
fn random_traces_preserve_every_invariant() {
    let mut heap = new_heap(1 << 22);
    let mut rng = XorShift(0x9E37_79B9_7F4A_7C15);
    let mut live: Vec<(*mut u8, usize, u8)> = Vec::new();

    for step in 0..4000u64 {
        let roll = rng.next();
        if live.is_empty() || roll % 100 < 60 {
            let size = match roll % 10 {
                0 => 1 + (rng.next() % 8) as usize,
                9 => 256 + (rng.next() % 4096) as usize,
                _ => 1 + (rng.next() % 200) as usize,
            };
            let p = heap.allocate(size);
            assert!(!p.is_null(), "trace should fit the arena");
            assert_eq!(p as usize % DWORD_SIZE, 0);
            assert!(p as usize >= heap.arena.lo() as usize + 8);
            assert!(p as usize + size <= heap.arena.hi() as usize - 7);

            for &(q, q_size, _) in &live {
                let disjoint =
                    p as usize + size <= q as usize || q as usize + q_size <= p as usize;
                assert!(disjoint, "overlapping live payloads");
            }

            let tag = (step & 0xFF) as u8;
            unsafe {
                ptr::write_bytes(p, tag, size);
            }
            live.push((p, size, tag));
        } else {
            let victim = (rng.next() as usize) % live.len();
            let (p, size, tag) = live.swap_remove(victim);
            unsafe {
                for offset in 0..size {
                    assert_eq!(p.add(offset).read(), tag, "payload clobbered");
                }
                heap.free(p);
            }
        }
        assert!(heap.check_heap(line!()));
    }

    for (p, _, _) in live.drain(..) {
        unsafe {
            heap.free(p);
        }
    }
    assert!(heap.check_heap(line!()));
    assert_eq!(free_blocks(&heap).len(), 1, "everything coalesces back");
}

#[test]
fn locked_heap_serves_global_alloc_layouts() {
    let locked = LockedHeap::new();
    unsafe {
        locked.init(backing(1 << 16), 1 << 16).unwrap();
    }

    unsafe {
        let small = Layout::from_size_align(24, 8).unwrap();
        let p = locked.alloc(small);
        assert!(!p.is_null());
        assert_eq!(p as usize % DWORD_SIZE, 0);

        // Alignments beyond 16 go through the stashed-base path.
        let strict = Layout::from_size_align(100, 64).unwrap();
        let q = locked.alloc(strict);
        assert!(!q.is_null());
        assert_eq!(q as usize % 64, 0);
        ptr::write_bytes(q, 0x5A, 100);

        let zeroed = Layout::from_size_align(48, 16).unwrap();
        let z = locked.alloc_zeroed(zeroed);
        assert!(!z.is_null());
        for offset in 0..48 {
            assert_eq!(z.add(offset).read(), 0);
        }

        locked.dealloc(p, small);
        locked.dealloc(q, strict);
        locked.dealloc(z, zeroed);
    }

    let heap = locked.lock();
    assert!(heap.check_heap(line!()));
    assert_eq!(free_blocks(&heap).len(), 1, "all regions returned");
}

#[test]
fn stats_track_allocations_and_frees() {
    let mut heap = new_heap(1 << 16);

    let p = heap.allocate(100);
    let q = heap.allocate(50);
    let stats = heap.stats();
    assert_eq!(stats.allocation_count, 2);
    assert_eq!(stats.free_count, 0);
    // 100 -> 112-byte block, 50 -> 64-byte block, headers included.
    assert_eq!(stats.allocated_bytes, 112 + 64);

    unsafe {
        heap.free(p);
        heap.free(q);
    }
    let stats = heap.stats();
    assert_eq!(stats.free_count, 2);
    assert_eq!(stats.allocated_bytes, 0);
}
