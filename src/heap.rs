//! The block management engine: request normalization, fit search, block
//! splitting, coalescing and heap growth. [`Heap`] owns the segment, the
//! free-list index and the heap bounds; everything here takes `&mut self`
//! and leaves thread safety to the wrapper in [`crate::allocator`].
//!
//! The heap always looks like this:
//!
//! ```text
//! +----------+---------+---------+-- ... --+---------+----------+
//! | prologue | block 1 | block 2 |         | block N | epilogue |
//! +----------+---------+---------+-- ... --+---------+----------+
//!   8 bytes                                             8 bytes
//! ```
//!
//! The prologue is a zero-size allocated tag acting as block 0, the epilogue
//! a zero-size allocated tag acting as block N + 1. Both exist purely so
//! that coalescing and walking never have to special-case the heap ends,
//! and the prologue doubles as the padding that puts every payload on a
//! 16-byte boundary.

use std::{
    cmp,
    ptr::{self, NonNull},
};

use crate::{
    block::{Block, ALIGNMENT, MINI_BLOCK_SIZE, MINI_PAYLOAD_SIZE, MIN_BLOCK_SIZE},
    freelist::SegregatedList,
    segment::{Segment, DEFAULT_MAX_HEAP},
    tag::{Tag, Word, WORD_SIZE},
    Pointer,
};

/// Growth quantum: the heap never grows by less than this.
pub(crate) const DEFAULT_CHUNK_SIZE: usize = 4096;

/// How many blocks per size class the bounded best-fit search examines.
pub(crate) const DEFAULT_FIT_SCAN_LIMIT: usize = 10;

/// Tuning knobs. The defaults are fine for mixed workloads; tests and
/// benchmarks use custom values to force specific behavior.
#[derive(Clone, Copy, Debug)]
pub struct HeapConfig {
    /// Minimum number of bytes requested from the segment per growth step.
    /// Larger values trade address space for fewer growth calls.
    pub chunk_size: usize,
    /// Cap on blocks examined per size class when the search falls through
    /// to classes above the request's own. Raising it improves utilization
    /// slightly on fragmented heaps at a throughput cost.
    pub fit_scan_limit: usize,
    /// Reservation ceiling for the heap segment. Address space only.
    pub max_heap: usize,
}

impl HeapConfig {
    pub const fn new() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            fit_scan_limit: DEFAULT_FIT_SCAN_LIMIT,
            max_heap: DEFAULT_MAX_HEAP,
        }
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Rounds `size` up to the next multiple of `align` (a power of two), or
/// `None` on overflow so that absurd requests fail instead of wrapping.
fn round_up(size: usize, align: usize) -> Option<usize> {
    Some(size.checked_add(align - 1)? & !(align - 1))
}

/// The allocator state: segment, free-list index and the first block.
/// Uninitialized until the first allocation or an explicit [`Heap::init`].
pub(crate) struct Heap {
    pub segment: Segment,
    pub free: SegregatedList,
    pub first_block: Option<Block>,
    pub config: HeapConfig,
}

impl Heap {
    pub const fn new(config: HeapConfig) -> Self {
        Self {
            segment: Segment::new(),
            free: SegregatedList::new(),
            first_block: None,
            config,
        }
    }

    /// Maps the segment and writes the initial prologue/epilogue pair, then
    /// grows the heap by one chunk. Returns `false` if the platform refuses
    /// memory. Calling it again later is a successful no-op.
    pub unsafe fn init(&mut self) -> bool {
        if self.first_block.is_some() {
            return true;
        }

        if !self.segment.is_mapped() && !self.segment.map(self.config.max_heap) {
            return false;
        }

        let Some(start) = self.segment.sbrk(2 * WORD_SIZE) else {
            return false;
        };

        let words = start.as_ptr().cast::<Word>();
        // Prologue: pretends to be an allocated block 0.
        words.write(Tag::pack(0, true, true, false).to_raw());
        // Epilogue, sitting where the first real block's header will go once
        // the heap grows.
        words.add(1).write(Tag::pack(0, true, true, false).to_raw());

        self.first_block = Some(Block::from_header(NonNull::new_unchecked(
            words.add(1).cast(),
        )));

        self.extend(self.config.chunk_size).is_some()
    }

    /// Allocates at least `size` bytes, 16-aligned. Returns `None` for zero
    /// sized requests and when the segment is exhausted.
    pub unsafe fn allocate(&mut self, size: usize) -> Pointer<u8> {
        self.debug_check();

        if self.first_block.is_none() && !self.init() {
            return None;
        }

        if size == 0 {
            return None;
        }

        // Normalize the request: a word of header overhead, rounded to the
        // alignment quantum, floored at the minimum regular size. Requests
        // that fit in one word get a mini block instead. The checked math
        // turns near-usize::MAX requests into a clean failure.
        let asize = if size <= MINI_PAYLOAD_SIZE {
            MINI_BLOCK_SIZE
        } else {
            let padded = round_up(size.checked_add(WORD_SIZE)?, ALIGNMENT)?;
            cmp::max(padded, MIN_BLOCK_SIZE)
        };

        let fit = self.free.find_fit(asize, self.config.fit_scan_limit);

        // A mini block serves a mini request whole: there is nothing left to
        // split off a 16-byte block.
        if asize == MINI_BLOCK_SIZE {
            if let Some(block) = fit {
                if block.is_mini() {
                    self.free.remove_mini(block);
                    block.write(MINI_BLOCK_SIZE, true, block.prev_alloc(), block.prev_mini());
                    block.sync_flags_to_next();

                    self.debug_check();
                    return Some(block.payload());
                }
            }
        }

        let block = match fit {
            Some(block) => block,
            None => {
                let request = cmp::max(asize, self.config.chunk_size);
                self.extend(request)?
            }
        };

        debug_assert!(!block.is_alloc());

        self.free.remove_regular(block);
        self.split(block, asize);

        self.debug_check();
        Some(block.payload())
    }

    /// Returns a block to the heap, merging it with free neighbors.
    ///
    /// # Safety
    ///
    /// `address` must come from [`Heap::allocate`] on this heap and must not
    /// have been freed already.
    pub unsafe fn deallocate(&mut self, address: NonNull<u8>) {
        self.debug_check();

        let block = Block::from_payload(address);
        debug_assert!(block.is_alloc(), "freeing a block that is not allocated");

        block.write(block.size(), false, block.prev_alloc(), block.prev_mini());

        let block = self.coalesce(block);
        self.free.insert(block);

        self.debug_check();
    }

    /// Moves an allocation to a block of at least `size` bytes, preserving
    /// the payload prefix. `None` address allocates, zero size frees. On
    /// failure the old block is left untouched and `None` is returned.
    pub unsafe fn reallocate(&mut self, address: Pointer<u8>, size: usize) -> Pointer<u8> {
        let Some(address) = address else {
            return self.allocate(size);
        };

        if size == 0 {
            self.deallocate(address);
            return None;
        }

        let block = Block::from_payload(address);
        let new_address = self.allocate(size)?;

        // The source block is allocated, so its payload is everything past
        // the header word.
        let count = cmp::min(size, block.payload_size());
        ptr::copy_nonoverlapping(address.as_ptr(), new_address.as_ptr(), count);

        self.deallocate(address);

        Some(new_address)
    }

    /// Allocates `count * size` bytes of zeroed memory. Fails on overflow
    /// and when either argument is zero.
    pub unsafe fn allocate_zeroed(&mut self, count: usize, size: usize) -> Pointer<u8> {
        let total = count.checked_mul(size)?;

        let address = self.allocate(total)?;
        address.as_ptr().write_bytes(0, total);

        Some(address)
    }

    /// Grows the heap by at least `request` bytes and hands back the free
    /// block covering the new range, already merged with a free tail block
    /// and inserted into the index. `None` if the segment refuses.
    unsafe fn extend(&mut self, request: usize) -> Option<Block> {
        let size = round_up(request, ALIGNMENT)?;
        let payload = self.segment.sbrk(size)?;

        // The old epilogue word becomes the new block's header. Its tag was
        // keeping the prev_alloc/prev_mini bits for the old tail block alive
        // and the new block inherits them unchanged.
        let block = Block::from_payload(payload);
        block.write(size, false, block.prev_alloc(), block.prev_mini());
        block.next().write_epilogue();

        // Only the previous neighbor can be free: the next one is the fresh
        // epilogue, which reads as allocated.
        let block = self.coalesce(block);
        self.free.insert(block);

        Some(block)
    }

    /// Merges a just-freed block with its free neighbors. The block must
    /// not be in any free list yet; merged neighbors are removed from
    /// theirs. Returns the merged block, which still has to be inserted.
    unsafe fn coalesce(&mut self, block: Block) -> Block {
        debug_assert!(!block.is_alloc());

        let next = block.next();
        // An allocated predecessor has no footer to navigate by, and a
        // corrupted heap could make `prev` hit the prologue; both read as
        // "nothing to merge on the left".
        let prev = if block.prev_alloc() { None } else { block.prev() };

        match (prev, next.is_alloc()) {
            // Both neighbors allocated: no merge, just refresh the
            // successor's view of this block.
            (None, true) => {
                block.sync_flags_to_next();
                block
            }
            // Free predecessor absorbs this block.
            (Some(prev), true) => {
                self.free.remove(prev);
                prev.write(
                    prev.size() + block.size(),
                    false,
                    prev.prev_alloc(),
                    prev.prev_mini(),
                );
                prev.sync_flags_to_next();
                prev
            }
            // This block absorbs its free successor.
            (None, false) => {
                self.free.remove(next);
                block.write(
                    block.size() + next.size(),
                    false,
                    block.prev_alloc(),
                    block.prev_mini(),
                );
                block.sync_flags_to_next();
                block
            }
            // Free on both sides: everything collapses into the predecessor.
            (Some(prev), false) => {
                self.free.remove(prev);
                self.free.remove(next);
                prev.write(
                    prev.size() + block.size() + next.size(),
                    false,
                    prev.prev_alloc(),
                    prev.prev_mini(),
                );
                prev.sync_flags_to_next();
                prev
            }
        }
    }

    /// Marks `block` (free, regular, not in any list) as allocated with
    /// `asize` bytes and gives the remainder its own life as a regular or
    /// mini free block. Sizes are all multiples of 16, so the remainder is
    /// never in the unrepresentable 1..16 or 17..32 gaps.
    unsafe fn split(&mut self, block: Block, asize: usize) {
        debug_assert!(!block.is_alloc() && !block.is_mini());
        debug_assert!(asize >= MINI_BLOCK_SIZE && asize % ALIGNMENT == 0);

        let total = block.size();
        let remainder = total - asize;

        if remainder >= MIN_BLOCK_SIZE {
            block.write(asize, true, block.prev_alloc(), block.prev_mini());

            let rest = block.next();
            rest.write(remainder, false, true, asize == MINI_BLOCK_SIZE);
            self.free.insert_regular(rest);
            rest.sync_flags_to_next();
        } else if remainder == MINI_BLOCK_SIZE {
            block.write(asize, true, block.prev_alloc(), block.prev_mini());

            let rest = block.next();
            rest.write(MINI_BLOCK_SIZE, false, true, asize == MINI_BLOCK_SIZE);
            self.free.insert_mini(rest);
            rest.sync_flags_to_next();
        } else {
            // Remainder too small to stand alone; the caller keeps it as
            // padding.
            block.write(total, true, block.prev_alloc(), block.prev_mini());
            block.sync_flags_to_next();
        }
    }

    /// Runs the invariant checker around every public operation in debug
    /// builds, the primary correctness discipline while hacking on the
    /// engine. Release builds compile this away.
    #[cfg(debug_assertions)]
    unsafe fn debug_check(&self) {
        if let Err(error) = self.check_heap() {
            panic!("heap invariant violated: {error}");
        }
    }

    #[cfg(not(debug_assertions))]
    #[inline]
    unsafe fn debug_check(&self) {}
}

impl Drop for Heap {
    fn drop(&mut self) {
        // The reservation goes back in one piece. A heap living in a static
        // is simply never dropped.
        unsafe { self.segment.unmap() };
    }
}

#[cfg(test)]
impl Heap {
    /// Free bytes visible from a full heap walk.
    pub(crate) unsafe fn free_bytes(&self) -> usize {
        let mut total = 0;
        let mut block = match self.first_block {
            Some(block) => block,
            None => return 0,
        };

        while block.size() > 0 {
            if !block.is_alloc() {
                total += block.size();
            }
            block = block.next();
        }

        total
    }

    pub(crate) unsafe fn free_block_count(&self) -> usize {
        let mut count = 0;
        let mut block = match self.first_block {
            Some(block) => block,
            None => return 0,
        };

        while block.size() > 0 {
            if !block.is_alloc() {
                count += 1;
            }
            block = block.next();
        }

        count
    }

    pub(crate) unsafe fn mini_list_len(&self) -> usize {
        let mut count = 0;
        let mut current = self.free.mini_head;
        while let Some(node) = current {
            count += 1;
            current = node.as_ref().next;
        }
        count
    }
}
