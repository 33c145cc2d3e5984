//! The public allocator type. [`Segalloc`] wraps the single-threaded
//! [`Heap`] engine in a [`Mutex`] and exposes three faces:
//!
//! - a raw, malloc-shaped API (`malloc`, `free`, `realloc`, `calloc`) that
//!   speaks `Option<NonNull<u8>>`,
//! - the [`std::alloc::Allocator`] trait, so collections can allocate into
//!   it directly,
//! - the [`std::alloc::GlobalAlloc`] trait, so it can serve as
//!   `#[global_allocator]`.
//!
//! Alignment stops at 16: the heap is built around a 16-byte quantum and
//! requests above that are refused rather than mis-served.

use std::{
    alloc::{AllocError, Allocator, GlobalAlloc, Layout},
    cmp,
    ptr::{self, NonNull},
    sync::Mutex,
};

use crate::{
    block::{Block, ALIGNMENT},
    check::CheckError,
    heap::{Heap, HeapConfig},
    AllocResult,
};

/// Segregated free-list allocator over one grow-only heap segment.
///
/// # Examples
///
/// ## Raw API
///
/// ```rust
/// use segalloc::Segalloc;
///
/// let segalloc = Segalloc::new();
///
/// let p = segalloc.malloc(64).unwrap();
/// unsafe {
///     p.as_ptr().write_bytes(0xAB, 64);
///     segalloc.free(Some(p));
/// }
/// assert!(segalloc.check_heap().is_ok());
/// ```
///
/// ## Standalone [`Allocator`]
///
/// ```rust
/// #![feature(allocator_api)]
/// #![feature(slice_ptr_get)]
///
/// use std::alloc::{Allocator, Layout};
///
/// use segalloc::Segalloc;
///
/// let segalloc = Segalloc::new();
/// let layout = Layout::from_size_align(128, 16).unwrap();
///
/// unsafe {
///     let address = segalloc.allocate(layout).unwrap();
///     // The allocator can return more space than requested.
///     assert!(address.len() >= 128);
///     // Payloads are always 16-aligned.
///     assert_eq!(address.as_mut_ptr() as usize % 16, 0);
///     segalloc.deallocate(address.cast(), layout);
/// }
/// ```
///
/// ## Global allocator
///
/// ```no_run
/// use segalloc::Segalloc;
///
/// #[global_allocator]
/// static ALLOCATOR: Segalloc = Segalloc::new();
///
/// fn main() {
///     let num = Box::new(5);
///     assert_eq!(*num, 5);
/// }
/// ```
pub struct Segalloc {
    /// The engine itself is single threaded by design; this lock is the
    /// "caller provided" serialization layered above it. One global lock is
    /// crude but honest: allocation pressure from many threads should use
    /// one allocator per thread instead.
    heap: Mutex<Heap>,
}

/// The heap only holds raw pointers into its own segment and every access
/// goes through the lock.
unsafe impl Sync for Segalloc {}

impl Segalloc {
    /// Allocator with default tuning. See [`HeapConfig`].
    pub const fn new() -> Self {
        Self::with_config(HeapConfig::new())
    }

    /// Allocator with custom tuning knobs.
    ///
    /// ```rust
    /// use segalloc::{HeapConfig, Segalloc};
    ///
    /// // Bigger growth quantum, deeper best-fit scans.
    /// let segalloc = Segalloc::with_config(HeapConfig {
    ///     chunk_size: 1 << 16,
    ///     fit_scan_limit: 32,
    ///     ..HeapConfig::new()
    /// });
    ///
    /// let p = segalloc.malloc(100).unwrap();
    /// unsafe { segalloc.free(Some(p)) };
    /// ```
    pub const fn with_config(config: HeapConfig) -> Self {
        Self {
            heap: Mutex::new(Heap::new(config)),
        }
    }

    /// Maps the heap segment and carves the initial chunk. Optional: the
    /// first allocation does this lazily. Returns `false` if the platform
    /// refuses memory; calling it on a live heap returns `true`.
    pub fn init(&self) -> bool {
        match self.heap.lock() {
            Ok(mut heap) => unsafe { heap.init() },
            Err(_) => false,
        }
    }

    /// Allocates at least `size` bytes, 16-aligned. `None` for `size == 0`
    /// or when memory is exhausted.
    pub fn malloc(&self, size: usize) -> Option<NonNull<u8>> {
        match self.heap.lock() {
            Ok(mut heap) => unsafe { heap.allocate(size) },
            Err(_) => None,
        }
    }

    /// Returns an allocation to the heap. `None` is a no-op.
    ///
    /// # Safety
    ///
    /// A non-null `address` must come from this allocator and must not have
    /// been freed already.
    pub unsafe fn free(&self, address: Option<NonNull<u8>>) {
        let Some(address) = address else {
            return;
        };

        if let Ok(mut heap) = self.heap.lock() {
            heap.deallocate(address);
        }
    }

    /// Resizes an allocation, preserving the payload prefix. `None` address
    /// allocates; `size == 0` frees and returns `None`. On failure the old
    /// allocation is untouched.
    ///
    /// # Safety
    ///
    /// Same contract as [`Segalloc::free`] for non-null addresses.
    pub unsafe fn realloc(
        &self,
        address: Option<NonNull<u8>>,
        size: usize,
    ) -> Option<NonNull<u8>> {
        match self.heap.lock() {
            Ok(mut heap) => heap.reallocate(address, size),
            Err(_) => None,
        }
    }

    /// Allocates `count * size` zeroed bytes. `None` on overflow, when
    /// either argument is zero, or when memory is exhausted.
    pub fn calloc(&self, count: usize, size: usize) -> Option<NonNull<u8>> {
        match self.heap.lock() {
            Ok(mut heap) => unsafe { heap.allocate_zeroed(count, size) },
            Err(_) => None,
        }
    }

    /// Validates every heap invariant. Cheap enough for tests, too slow for
    /// hot paths; debug builds already run it around every operation.
    pub fn check_heap(&self) -> Result<(), CheckError> {
        match self.heap.lock() {
            Ok(heap) => unsafe { heap.check_heap() },
            // A panic mid-operation poisons the lock; inspecting the heap
            // state is exactly what we still want then.
            Err(poisoned) => unsafe { poisoned.into_inner().check_heap() },
        }
    }

    /// Shared tail of [`Allocator::grow`] and [`Allocator::shrink`].
    unsafe fn reallocate_impl(&self, address: NonNull<u8>, new_layout: Layout) -> AllocResult {
        if new_layout.align() > ALIGNMENT {
            return Err(AllocError);
        }

        let Ok(mut heap) = self.heap.lock() else {
            return Err(AllocError);
        };

        // Never pass zero to the engine: that would free the block, and on
        // this path the caller keeps ownership even on failure.
        let size = cmp::max(new_layout.size(), 1);

        match heap.reallocate(Some(address), size) {
            Some(new_address) => {
                let payload = Block::from_payload(new_address).payload_size();
                Ok(NonNull::slice_from_raw_parts(new_address, payload))
            }
            None => Err(AllocError),
        }
    }
}

impl Default for Segalloc {
    fn default() -> Self {
        Segalloc::new()
    }
}

unsafe impl Allocator for Segalloc {
    fn allocate(&self, layout: Layout) -> AllocResult {
        if layout.align() > ALIGNMENT {
            return Err(AllocError);
        }

        let Ok(mut heap) = self.heap.lock() else {
            return Err(AllocError);
        };

        // Zero sized layouts are legal here. They get a real mini block so
        // that deallocate stays uniform.
        let size = cmp::max(layout.size(), 1);

        match unsafe { heap.allocate(size) } {
            Some(address) => {
                let payload = unsafe { Block::from_payload(address).payload_size() };
                Ok(NonNull::slice_from_raw_parts(address, payload))
            }
            None => Err(AllocError),
        }
    }

    unsafe fn deallocate(&self, address: NonNull<u8>, _layout: Layout) {
        if let Ok(mut heap) = self.heap.lock() {
            heap.deallocate(address);
        }
    }

    unsafe fn grow(
        &self,
        address: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> AllocResult {
        debug_assert!(new_layout.size() >= old_layout.size());
        self.reallocate_impl(address, new_layout)
    }

    unsafe fn grow_zeroed(
        &self,
        address: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> AllocResult {
        let new_address = self.grow(address, old_layout, new_layout)?;

        let zero_from = new_address.as_mut_ptr().add(old_layout.size());
        zero_from.write_bytes(0, new_layout.size() - old_layout.size());

        Ok(new_address)
    }

    unsafe fn shrink(
        &self,
        address: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> AllocResult {
        debug_assert!(new_layout.size() <= old_layout.size());
        self.reallocate_impl(address, new_layout)
    }
}

unsafe impl GlobalAlloc for Segalloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        match self.malloc(layout.size()) {
            Some(address) => address.as_ptr(),
            None => ptr::null_mut(),
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        match self.calloc(1, layout.size()) {
            Some(address) => address.as_ptr(),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, address: *mut u8, _layout: Layout) {
        self.free(NonNull::new(address));
    }

    unsafe fn realloc(&self, address: *mut u8, _layout: Layout, new_size: usize) -> *mut u8 {
        match self.realloc(NonNull::new(address), new_size) {
            Some(new_address) => new_address.as_ptr(),
            None => ptr::null_mut(),
        }
    }
}
