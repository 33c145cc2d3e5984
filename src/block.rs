//! Typed view of one heap block and the navigation between neighbors. All
//! pointer casts between headers, payloads, footers and free-list nodes are
//! confined to this module and [`crate::freelist`]; the rest of the code
//! traffics in [`Block`] values.
//!
//! A regular block looks like this in memory:
//!
//! ```text
//!             +------------------------+
//! header ->   | tag (size + flags)     | <- 8 bytes
//!             +------------------------+
//! payload ->  | user data,             |
//!             | or if the block is     |
//!             | free: next free ptr,   | <- 16-aligned
//!             |       prev free ptr,   |
//!             |       unused space     |
//!             +------------------------+
//!             | footer (free only)     | <- 8 bytes, mirrors the header
//!             +------------------------+
//! ```
//!
//! A mini block is exactly 16 bytes: the 8-byte tag plus one word that holds
//! user data while allocated and the next-free pointer while free. It has no
//! room for a footer or a prev pointer, which is why mini blocks get their
//! own singly-linked list in [`crate::freelist`] and a `prev_mini` shortcut
//! bit in their successor's tag instead of a footer.

use std::{mem, ptr::NonNull};

use crate::{
    freelist::{FreeNode, MiniNode},
    tag::{Tag, Word, WORD_SIZE},
};

/// Alignment quantum. Payloads are 16-aligned and block sizes are multiples
/// of 16.
pub(crate) const ALIGNMENT: usize = 16;

/// Total size of a mini block: one tag word plus one payload word.
pub(crate) const MINI_BLOCK_SIZE: usize = WORD_SIZE + mem::size_of::<MiniNode>();

/// Largest request served by a mini block.
pub(crate) const MINI_PAYLOAD_SIZE: usize = MINI_BLOCK_SIZE - WORD_SIZE;

/// Minimum regular block size: header, both free-list links and footer must
/// fit while the block is free.
pub(crate) const MIN_BLOCK_SIZE: usize = 2 * WORD_SIZE + mem::size_of::<FreeNode>();

/// A block, addressed by its header word. `Copy` on purpose: this is a
/// reference into the heap, not an owner of anything.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Block(NonNull<Word>);

impl Block {
    /// Block whose header lives at `address`.
    #[inline]
    pub unsafe fn from_header(address: NonNull<u8>) -> Self {
        Block(address.cast())
    }

    /// Block owning the payload at `address`. The header sits one word below.
    ///
    /// # Safety
    ///
    /// `address` must be a payload address previously produced by this
    /// allocator (or the address right after the old epilogue during heap
    /// growth, which is the same arithmetic).
    #[inline]
    pub unsafe fn from_payload(address: NonNull<u8>) -> Self {
        debug_assert_eq!(address.as_ptr() as usize % ALIGNMENT, 0);
        Block(NonNull::new_unchecked(address.as_ptr().cast::<Word>().sub(1)))
    }

    /// The block a regular free-list node is embedded in.
    #[inline]
    pub unsafe fn from_free_node(node: NonNull<FreeNode>) -> Self {
        Self::from_payload(node.cast())
    }

    /// The block a mini free-list node is embedded in.
    #[inline]
    pub unsafe fn from_mini_node(node: NonNull<MiniNode>) -> Self {
        Self::from_payload(node.cast())
    }

    /// Header address, for bounds checks and diagnostics.
    #[inline]
    pub fn address(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// First payload byte, one word past the header.
    #[inline]
    pub unsafe fn payload(self) -> NonNull<u8> {
        NonNull::new_unchecked(self.0.as_ptr().add(1).cast())
    }

    /// The free-list node stored in a free regular block's payload.
    #[inline]
    pub unsafe fn free_node(self) -> NonNull<FreeNode> {
        debug_assert!(!self.is_alloc() && !self.is_mini());
        self.payload().cast()
    }

    /// The list node stored in a free mini block's payload word.
    #[inline]
    pub unsafe fn mini_node(self) -> NonNull<MiniNode> {
        debug_assert!(!self.is_alloc() && self.is_mini());
        self.payload().cast()
    }

    #[inline]
    pub unsafe fn tag(self) -> Tag {
        Tag::from_raw(self.0.as_ptr().read())
    }

    #[inline]
    pub unsafe fn size(self) -> usize {
        self.tag().size()
    }

    #[inline]
    pub unsafe fn is_alloc(self) -> bool {
        self.tag().is_alloc()
    }

    #[inline]
    pub unsafe fn is_mini(self) -> bool {
        self.size() == MINI_BLOCK_SIZE
    }

    #[inline]
    pub unsafe fn prev_alloc(self) -> bool {
        self.tag().prev_alloc()
    }

    #[inline]
    pub unsafe fn prev_mini(self) -> bool {
        self.tag().prev_mini()
    }

    /// Bytes usable by the caller. Only meaningful for allocated blocks,
    /// which carry no footer, so everything past the header belongs to the
    /// payload.
    #[inline]
    pub unsafe fn payload_size(self) -> usize {
        debug_assert!(self.is_alloc());
        self.size() - WORD_SIZE
    }

    /// Footer slot of a block of `size` bytes starting at this header. Only
    /// free regular blocks actually keep a footer there.
    #[inline]
    unsafe fn footer(self, size: usize) -> *mut Word {
        self.0.as_ptr().cast::<u8>().add(size - WORD_SIZE).cast()
    }

    /// Reads the footer of a free regular block.
    pub unsafe fn footer_tag(self) -> Tag {
        debug_assert!(!self.is_alloc() && !self.is_mini());
        Tag::from_raw(self.footer(self.size()).read())
    }

    /// Writes `tag` as this block's header and, when the tag describes a
    /// free regular block, mirrors it into the footer.
    unsafe fn store(self, tag: Tag) {
        self.0.as_ptr().write(tag.to_raw());

        if !tag.is_alloc() && tag.size() != MINI_BLOCK_SIZE {
            self.footer(tag.size()).write(tag.to_raw());
        }
    }

    /// Writes a complete block at this address.
    pub unsafe fn write(self, size: usize, alloc: bool, prev_alloc: bool, prev_mini: bool) {
        debug_assert!(size >= MINI_BLOCK_SIZE);
        self.store(Tag::pack(size, alloc, prev_alloc, prev_mini));
    }

    /// Writes the epilogue sentinel at this address: size 0, allocated. The
    /// prev bits start clear; whoever rewrites the tail block is responsible
    /// for refreshing them via [`Block::sync_flags_to_next`].
    pub unsafe fn write_epilogue(self) {
        self.0.as_ptr().write(Tag::pack(0, true, false, false).to_raw());
    }

    pub unsafe fn set_prev_alloc(self, prev_alloc: bool) {
        self.store(self.tag().with_prev_alloc(prev_alloc));
    }

    pub unsafe fn set_prev_mini(self, prev_mini: bool) {
        self.store(self.tag().with_prev_mini(prev_mini));
    }

    /// Refreshes the successor's cached `prev_alloc`/`prev_mini` bits from
    /// this block's current state. Every state transition ends with a call
    /// to this, so the redundant flags can never drift from the truth.
    pub unsafe fn sync_flags_to_next(self) {
        let next = self.next();
        next.set_prev_alloc(self.is_alloc());
        next.set_prev_mini(self.is_mini());
    }

    /// The block that starts right after this one. Yields the epilogue when
    /// called on the tail block, so callers can stop on `size() == 0`.
    #[inline]
    pub unsafe fn next(self) -> Block {
        debug_assert!(self.size() != 0, "walked past the epilogue");
        Block::from_header(NonNull::new_unchecked(
            self.0.as_ptr().cast::<u8>().add(self.size()),
        ))
    }

    /// The block that ends right before this one. Callable only when the
    /// predecessor is free (`prev_alloc` clear): allocated predecessors have
    /// no footer to read. A free mini predecessor has no footer either, but
    /// the `prev_mini` bit pins its size to 16 so we can step over it
    /// directly.
    ///
    /// Returns `None` if the word below turns out to be the prologue. The
    /// prologue is allocated, so a block with `prev_alloc` clear should
    /// never sit right above it; the check is a guard against heap
    /// corruption, not an expected path.
    pub unsafe fn prev(self) -> Option<Block> {
        debug_assert!(!self.prev_alloc());

        if self.prev_mini() {
            return Some(Block::from_header(NonNull::new_unchecked(
                self.0.as_ptr().cast::<u8>().sub(MINI_BLOCK_SIZE),
            )));
        }

        let footer = Tag::from_raw(self.0.as_ptr().sub(1).read());
        if footer.size() == 0 {
            return None;
        }

        Some(Block::from_header(NonNull::new_unchecked(
            self.0.as_ptr().cast::<u8>().sub(footer.size()),
        )))
    }
}
