//! Read-only heap validation. [`Heap::check_heap`] walks every block and
//! every free list, cross-checking one against the other, and reports the
//! first violated invariant. Debug builds run it around every public
//! operation; release builds only pay for it when the caller asks.

use std::fmt;

use crate::{
    block::{Block, ALIGNMENT, MINI_BLOCK_SIZE, MIN_BLOCK_SIZE},
    freelist::{class_of, FreeNode},
    heap::Heap,
    tag::{Tag, Word, WORD_SIZE},
    Pointer,
};

/// A violated heap invariant, with the address of the offending block.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CheckError {
    /// The prologue word was overwritten.
    BadPrologue,
    /// The word terminating the heap walk is not a zero-size allocated tag.
    BadEpilogue { at: usize },
    /// A block lies outside the mapped heap range, or runs past its end.
    OutOfBounds { at: usize },
    /// A payload address is not 16-aligned.
    Misaligned { at: usize },
    /// A block size is not a multiple of 16, or sits in the unrepresentable
    /// gaps below 16 or between 16 and 32.
    BadSize { at: usize, size: usize },
    /// A block's cached `prev_alloc`/`prev_mini` bits disagree with the
    /// actual state of its predecessor.
    StaleFlags { at: usize },
    /// Two neighboring blocks are both free; coalescing missed them.
    AdjacentFree { at: usize },
    /// A free regular block's footer is not a bit-for-bit copy of its
    /// header.
    FooterMismatch { at: usize },
    /// A size-class list entry points at an allocated block.
    ListedNotFree { at: usize },
    /// A block is filed in a size class whose bracket excludes its size.
    WrongClass { at: usize, size: usize, class: usize },
    /// A doubly-linked list node's `prev` does not point back where the
    /// walk came from.
    BrokenLink { at: usize },
    /// A mini list entry is not a free 16-byte block.
    BadMiniEntry { at: usize },
    /// The heap walk and the free lists disagree on how many free blocks
    /// exist.
    CountMismatch { walked: usize, listed: usize },
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::BadPrologue => write!(f, "prologue tag was overwritten"),
            Self::BadEpilogue { at } => {
                write!(f, "epilogue at {at:#x} is not a zero-size allocated tag")
            }
            Self::OutOfBounds { at } => {
                write!(f, "block at {at:#x} lies outside the mapped heap")
            }
            Self::Misaligned { at } => {
                write!(f, "payload of block at {at:#x} is not 16-aligned")
            }
            Self::BadSize { at, size } => {
                write!(f, "block at {at:#x} has impossible size {size}")
            }
            Self::StaleFlags { at } => {
                write!(f, "cached neighbor flags at {at:#x} disagree with the predecessor")
            }
            Self::AdjacentFree { at } => {
                write!(f, "free block at {at:#x} has a free successor")
            }
            Self::FooterMismatch { at } => {
                write!(f, "footer of free block at {at:#x} does not mirror its header")
            }
            Self::ListedNotFree { at } => {
                write!(f, "free list entry at {at:#x} points at an allocated block")
            }
            Self::WrongClass { at, size, class } => {
                write!(f, "block at {at:#x} of size {size} is filed in class {class}")
            }
            Self::BrokenLink { at } => {
                write!(f, "free list around {at:#x} is not doubly linked")
            }
            Self::BadMiniEntry { at } => {
                write!(f, "mini list entry at {at:#x} is not a free mini block")
            }
            Self::CountMismatch { walked, listed } => {
                write!(
                    f,
                    "heap walk found {walked} free blocks but the lists hold {listed}"
                )
            }
        }
    }
}

impl Heap {
    /// Validates every invariant the heap relies on. Never mutates
    /// anything. An uninitialized heap is trivially valid.
    pub(crate) unsafe fn check_heap(&self) -> Result<(), CheckError> {
        let Some(first) = self.first_block else {
            return Ok(());
        };

        let (low, high) = match (self.segment.low(), self.segment.high()) {
            (Some(low), Some(high)) => (low.as_ptr() as usize, high.as_ptr() as usize),
            _ => return Ok(()),
        };

        // The prologue holds still for the whole life of the heap.
        let prologue = Tag::from_raw(self.segment.low().unwrap().as_ptr().cast::<Word>().read());
        if prologue != Tag::pack(0, true, true, false) {
            return Err(CheckError::BadPrologue);
        }

        if !first.prev_alloc() || first.prev_mini() {
            return Err(CheckError::StaleFlags { at: first.address() });
        }

        let mut walked_free = 0usize;
        let mut previous: Option<Block> = None;
        let mut block = first;

        while block.size() > 0 {
            let at = block.address();
            let size = block.size();

            if at < low || at > high {
                return Err(CheckError::OutOfBounds { at });
            }
            if (at + WORD_SIZE) % ALIGNMENT != 0 {
                return Err(CheckError::Misaligned { at });
            }
            if size % ALIGNMENT != 0 || size < MINI_BLOCK_SIZE
                || (size > MINI_BLOCK_SIZE && size < MIN_BLOCK_SIZE)
            {
                return Err(CheckError::BadSize { at, size });
            }
            // The block plus its successor's header word must stay inside
            // the mapped range, otherwise the walk itself would read off
            // the heap. Checked math, since a corrupted size can be
            // anything.
            match at.checked_add(size) {
                Some(next_header) if next_header <= high - (WORD_SIZE - 1) => {}
                _ => return Err(CheckError::OutOfBounds { at }),
            }

            if let Some(previous) = previous {
                if block.prev_alloc() != previous.is_alloc()
                    || block.prev_mini() != previous.is_mini()
                {
                    return Err(CheckError::StaleFlags { at });
                }
            }

            if !block.is_alloc() {
                let next = block.next();
                if next.size() > 0 && !next.is_alloc() {
                    return Err(CheckError::AdjacentFree { at });
                }
                if !block.is_mini() && block.footer_tag() != block.tag() {
                    return Err(CheckError::FooterMismatch { at });
                }
                walked_free += 1;
            }

            previous = Some(block);
            block = block.next();
        }

        // `block` is now whatever terminated the walk; it has to be the
        // epilogue, sitting in the heap's last word with live flags
        // describing the real tail block. Landing exactly there also proves
        // the block sizes tile the heap with no gap or overlap.
        let epilogue = block.tag();
        if !epilogue.is_alloc() || block.address() != high - (WORD_SIZE - 1) {
            return Err(CheckError::BadEpilogue { at: block.address() });
        }
        if let Some(previous) = previous {
            if epilogue.prev_alloc() != previous.is_alloc()
                || epilogue.prev_mini() != previous.is_mini()
            {
                return Err(CheckError::StaleFlags { at: block.address() });
            }
        }

        // Second pass: every free list, counting nodes to compare against
        // the walk.
        let mut listed_free = 0usize;

        for (class, head) in self.free.classes.iter().enumerate() {
            let mut came_from: Pointer<FreeNode> = None;
            let mut current = *head;

            while let Some(node) = current {
                let block = Block::from_free_node(node);
                let at = block.address();
                let size = block.size();

                if block.is_alloc() {
                    return Err(CheckError::ListedNotFree { at });
                }
                if size == MINI_BLOCK_SIZE || class_of(size) != class {
                    return Err(CheckError::WrongClass { at, size, class });
                }
                if node.as_ref().prev != came_from {
                    return Err(CheckError::BrokenLink { at });
                }

                listed_free += 1;
                came_from = current;
                current = node.as_ref().next;
            }
        }

        let mut current = self.free.mini_head;
        while let Some(node) = current {
            let block = Block::from_mini_node(node);

            if block.is_alloc() || !block.is_mini() {
                return Err(CheckError::BadMiniEntry { at: block.address() });
            }

            listed_free += 1;
            current = node.as_ref().next;
        }

        if walked_free != listed_free {
            return Err(CheckError::CountMismatch {
                walked: walked_free,
                listed: listed_free,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HeapConfig;

    fn live_heap() -> Heap {
        let mut heap = Heap::new(HeapConfig::new());
        unsafe { assert!(heap.init()) };
        heap
    }

    #[test]
    fn clean_heaps_pass() {
        unsafe {
            let heap = Heap::new(HeapConfig::new());
            assert_eq!(heap.check_heap(), Ok(()), "uninitialized heap");

            let mut heap = live_heap();
            assert_eq!(heap.check_heap(), Ok(()));

            let a = heap.allocate(100).unwrap();
            let b = heap.allocate(8).unwrap();
            heap.deallocate(a);
            assert_eq!(heap.check_heap(), Ok(()));
            heap.deallocate(b);
            assert_eq!(heap.check_heap(), Ok(()));
        }
    }

    #[test]
    fn detects_prologue_corruption() {
        unsafe {
            let heap = live_heap();

            heap.segment.low().unwrap().as_ptr().cast::<Word>().write(0);

            assert_eq!(heap.check_heap(), Err(CheckError::BadPrologue));
        }
    }

    #[test]
    fn detects_epilogue_corruption() {
        unsafe {
            let heap = live_heap();

            // The epilogue is the last word of the heap.
            let high = heap.segment.high().unwrap().as_ptr();
            high.sub(WORD_SIZE - 1).cast::<Word>().write(0);

            assert_eq!(
                heap.check_heap(),
                Err(CheckError::BadEpilogue {
                    at: high as usize - (WORD_SIZE - 1)
                })
            );
        }
    }

    #[test]
    fn detects_free_block_missing_from_the_lists() {
        unsafe {
            let mut heap = live_heap();

            let a = heap.allocate(24).unwrap();
            let _fence = heap.allocate(24).unwrap();

            // Flip the block to free without telling the index.
            let block = Block::from_payload(a);
            block.write(block.size(), false, block.prev_alloc(), block.prev_mini());
            block.sync_flags_to_next();

            assert!(matches!(
                heap.check_heap(),
                Err(CheckError::CountMismatch {
                    walked: 2,
                    listed: 1
                })
            ));
        }
    }

    #[test]
    fn detects_stale_neighbor_flags() {
        unsafe {
            let mut heap = live_heap();

            let _a = heap.allocate(24).unwrap();
            let b = heap.allocate(24).unwrap();
            let _fence = heap.allocate(24).unwrap();

            // Claim b's predecessor is free even though it is allocated.
            let block = Block::from_payload(b);
            block.set_prev_alloc(false);

            assert_eq!(
                heap.check_heap(),
                Err(CheckError::StaleFlags {
                    at: block.address()
                })
            );
        }
    }

    #[test]
    fn detects_missed_coalescing() {
        unsafe {
            let mut heap = live_heap();

            let a = heap.allocate(24).unwrap();
            let b = heap.allocate(24).unwrap();
            let _fence = heap.allocate(24).unwrap();

            // Hand-free both neighbors behind the engine's back.
            let block_b = Block::from_payload(b);
            block_b.write(block_b.size(), false, block_b.prev_alloc(), block_b.prev_mini());
            block_b.sync_flags_to_next();
            let block_a = Block::from_payload(a);
            block_a.write(block_a.size(), false, block_a.prev_alloc(), block_a.prev_mini());
            block_a.sync_flags_to_next();

            assert_eq!(
                heap.check_heap(),
                Err(CheckError::AdjacentFree {
                    at: block_a.address()
                })
            );
        }
    }

    #[test]
    fn detects_footer_corruption() {
        unsafe {
            let mut heap = live_heap();

            let a = heap.allocate(24).unwrap();
            let _fence = heap.allocate(24).unwrap();
            heap.deallocate(a);

            // The freed block is 32 bytes; its footer is the last payload
            // word, 16 bytes past the payload start.
            a.as_ptr().add(16).cast::<Word>().write(0);

            assert_eq!(
                heap.check_heap(),
                Err(CheckError::FooterMismatch {
                    at: Block::from_payload(a).address()
                })
            );
        }
    }

    #[test]
    fn errors_render_with_addresses() {
        let error = CheckError::BadSize {
            at: 0x1000,
            size: 24,
        };
        assert_eq!(
            error.to_string(),
            "block at 0x1000 has impossible size 24"
        );

        let error = CheckError::CountMismatch {
            walked: 3,
            listed: 2,
        };
        assert_eq!(
            error.to_string(),
            "heap walk found 3 free blocks but the lists hold 2"
        );
    }
}
