//! Heap consistency checker.
//!
//! Every sub-check inspects one property of the physical block sequence or
//! of the free lists and reports failures through `log::debug!`, tagged
//! with the caller's probe line. [`Heap::check_heap`] is the AND of all
//! sub-checks; it never short-circuits, so one probe reports every broken
//! property at once.

use crate::block::Block;
use crate::header;
use crate::heap::Heap;
use crate::heap_constants::{DWORD_SIZE, MIN_BLOCK_SIZE, NUM_SIZE_CLASSES, WORD_SIZE};
use crate::size_class;

impl Heap {
    /// Verifies the heap against its structural invariants. `line` tags the
    /// diagnostics with the call site. An uninitialized heap is trivially
    /// consistent.
    pub fn check_heap(&self, line: u32) -> bool {
        if !self.initialized {
            return true;
        }

        let mut consistent = true;
        consistent &= self.check_prologue(line);
        consistent &= self.check_epilogue(line);
        consistent &= self.check_block_sequence(line);
        consistent &= self.check_mini_list(line);
        for index in 1..NUM_SIZE_CLASSES {
            consistent &= self.check_list_cycle(index, line);
            consistent &= self.check_list_nodes(index, line);
        }
        consistent &= self.check_free_counts(line);
        consistent
    }

    /// Ceiling on list walks; no consistent heap holds more blocks.
    fn walk_limit(&self) -> usize {
        self.arena.len() / MIN_BLOCK_SIZE + 2
    }

    fn in_arena(&self, block: Block) -> bool {
        self.arena.contains(block.addr())
    }

    fn check_prologue(&self, line: u32) -> bool {
        let word = unsafe { self.first_block.addr().sub(WORD_SIZE).cast::<u64>().read() };
        if header::extract_size(word) != 0
            || !header::extract_flags(word).contains(header::HeaderFlags::ALLOC)
        {
            log::debug!("check_heap: bad prologue word (probe at line {})", line);
            return false;
        }
        true
    }

    fn check_epilogue(&self, line: u32) -> bool {
        let mut block = self.first_block;
        unsafe {
            while self.in_arena(block) && block.size() > 0 {
                block = block.next();
            }
            if !self.in_arena(block) || !block.is_alloc() {
                log::debug!(
                    "check_heap: epilogue missing or not allocated (probe at line {})",
                    line
                );
                return false;
            }
            // The epilogue is the last word of the arena.
            if block.addr().wrapping_add(WORD_SIZE).wrapping_sub(1) != self.arena.hi() {
                log::debug!(
                    "check_heap: epilogue not at the arena end (probe at line {})",
                    line
                );
                return false;
            }
        }
        true
    }

    /// One pass over the physical sequence: bounds, size multiples, minimum
    /// size, footer agreement for free normal blocks, successor flag
    /// consistency, and the no-two-adjacent-frees rule.
    fn check_block_sequence(&self, line: u32) -> bool {
        let mut consistent = true;
        let mut block = self.first_block;
        unsafe {
            while self.in_arena(block) && block.size() > 0 {
                let size = block.size();
                if size % DWORD_SIZE != 0 || (block.payload() as usize) % DWORD_SIZE != 0 {
                    log::debug!(
                        "check_heap: block {:p} misaligned (probe at line {})",
                        block.addr(),
                        line
                    );
                    consistent = false;
                }
                if size < MIN_BLOCK_SIZE {
                    log::debug!(
                        "check_heap: block {:p} below minimum size (probe at line {})",
                        block.addr(),
                        line
                    );
                    consistent = false;
                    break;
                }
                if !block.is_alloc() && size > MIN_BLOCK_SIZE && block.footer().read() != block.header_word()
                {
                    log::debug!(
                        "check_heap: block {:p} footer disagrees with header (probe at line {})",
                        block.addr(),
                        line
                    );
                    consistent = false;
                }

                let next = block.next();
                if !self.in_arena(next) {
                    log::debug!(
                        "check_heap: block {:p} runs past the arena (probe at line {})",
                        block.addr(),
                        line
                    );
                    consistent = false;
                    break;
                }
                if next.prev_alloc() != block.is_alloc() {
                    log::debug!(
                        "check_heap: {:p} prev_alloc out of sync (probe at line {})",
                        next.addr(),
                        line
                    );
                    consistent = false;
                }
                if next.prev_mini() != block.is_mini() {
                    log::debug!(
                        "check_heap: {:p} prev_mini out of sync (probe at line {})",
                        next.addr(),
                        line
                    );
                    consistent = false;
                }
                if !block.is_alloc() && next.size() > 0 && !next.is_alloc() {
                    log::debug!(
                        "check_heap: adjacent free blocks at {:p} (probe at line {})",
                        block.addr(),
                        line
                    );
                    consistent = false;
                }

                block = next;
            }
        }
        consistent
    }

    /// The mini list: acyclic, every entry free, in bounds, exactly 16 bytes.
    fn check_mini_list(&self, line: u32) -> bool {
        let mut consistent = true;
        let mut steps = 0;
        let mut block = self.lists.head(0);
        unsafe {
            while !block.is_null() {
                if steps > self.walk_limit() {
                    log::debug!("check_heap: cycle in the mini list (probe at line {})", line);
                    return false;
                }
                if !self.in_arena(block) {
                    log::debug!(
                        "check_heap: mini list entry {:p} out of bounds (probe at line {})",
                        block.addr(),
                        line
                    );
                    return false;
                }
                if block.is_alloc() || !block.is_mini() {
                    log::debug!(
                        "check_heap: mini list entry {:p} not a free mini block (probe at line {})",
                        block.addr(),
                        line
                    );
                    consistent = false;
                }
                block = block.mini_next();
                steps += 1;
            }
        }
        consistent
    }

    /// Hare-and-tortoise cycle detection on one normal list.
    fn check_list_cycle(&self, index: usize, line: u32) -> bool {
        unsafe {
            let mut tortoise = self.lists.head(index);
            let mut hare = tortoise;
            while !hare.is_null() && !hare.link_next().is_null() {
                hare = hare.link_next().link_next();
                tortoise = tortoise.link_next();
                if hare == tortoise {
                    log::debug!(
                        "check_heap: cycle in free list {} (probe at line {})",
                        index,
                        line
                    );
                    return false;
                }
            }
        }
        true
    }

    /// Every node on one normal list: free, in bounds, back-linked to its
    /// predecessor, and in the bucket its size selects.
    fn check_list_nodes(&self, index: usize, line: u32) -> bool {
        let mut consistent = true;
        let mut steps = 0;
        let mut block = self.lists.head(index);
        unsafe {
            while !block.is_null() && steps <= self.walk_limit() {
                if !self.in_arena(block) {
                    log::debug!(
                        "check_heap: list {} entry {:p} out of bounds (probe at line {})",
                        index,
                        block.addr(),
                        line
                    );
                    return false;
                }
                if block.is_alloc() {
                    log::debug!(
                        "check_heap: allocated block {:p} on free list {} (probe at line {})",
                        block.addr(),
                        index,
                        line
                    );
                    consistent = false;
                }
                if size_class::bucket(block.size()) != index {
                    log::debug!(
                        "check_heap: block {:p} of {} bytes on list {} (probe at line {})",
                        block.addr(),
                        block.size(),
                        index,
                        line
                    );
                    consistent = false;
                }
                let next = block.link_next();
                if !next.is_null() && next.link_prev() != block {
                    log::debug!(
                        "check_heap: broken prev link after {:p} on list {} (probe at line {})",
                        block.addr(),
                        index,
                        line
                    );
                    consistent = false;
                }
                block = next;
                steps += 1;
            }
        }
        consistent
    }

    /// Free blocks counted along the physical sequence must equal free
    /// blocks counted across every list: on a list iff free.
    fn check_free_counts(&self, line: u32) -> bool {
        let mut by_sequence = 0usize;
        let mut block = self.first_block;
        unsafe {
            while self.in_arena(block) && block.size() > 0 {
                if !block.is_alloc() {
                    by_sequence += 1;
                }
                block = block.next();
            }
        }

        let mut by_lists = 0usize;
        unsafe {
            let mut steps = 0;
            let mut mini = self.lists.head(0);
            while !mini.is_null() && steps <= self.walk_limit() {
                by_lists += 1;
                mini = mini.mini_next();
                steps += 1;
            }
            for index in 1..NUM_SIZE_CLASSES {
                let mut steps = 0;
                let mut node = self.lists.head(index);
                while !node.is_null() && steps <= self.walk_limit() {
                    by_lists += 1;
                    node = node.link_next();
                    steps += 1;
                }
            }
        }

        if by_sequence != by_lists {
            log::debug!(
                "check_heap: {} free blocks in sequence, {} on lists (probe at line {})",
                by_sequence,
                by_lists,
                line
            );
            return false;
        }
        true
    }

    /// Logs one line per physical block plus the list population, at trace
    /// level. Debug aid; not part of the checker verdict.
    pub fn dump_heap(&self) {
        if !self.initialized {
            log::trace!("heap dump: uninitialized");
            return;
        }
        log::trace!(
            "heap dump: {} bytes [{:p}..{:p}]",
            self.arena.len(),
            self.arena.lo(),
            self.arena.hi()
        );
        let mut block = self.first_block;
        unsafe {
            while self.in_arena(block) && block.size() > 0 {
                log::trace!(
                    "  {:p} size {:>7} {} prev_alloc={} prev_mini={}",
                    block.addr(),
                    block.size(),
                    if block.is_alloc() { "alloc" } else { "free " },
                    block.prev_alloc(),
                    block.prev_mini(),
                );
                block = block.next();
            }
        }
        for index in 0..NUM_SIZE_CLASSES {
            let mut population = 0;
            let mut steps = 0;
            let mut node = self.lists.head(index);
            unsafe {
                while !node.is_null() && steps <= self.walk_limit() {
                    population += 1;
                    if index == 0 {
                        node = node.mini_next();
                    } else {
                        node = node.link_next();
                    }
                    steps += 1;
                }
            }
            if population > 0 {
                log::trace!("  list {:>2}: {} free blocks", index, population);
            }
        }
    }
}
