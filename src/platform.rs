//! Abstraction for platform specific virtual memory handling. The heap
//! segment needs one big reservation of address space up front and, on some
//! platforms, explicit commits as the break advances. It doesn't care about
//! the APIs offered by the underlying kernel or libraries.

use std::ptr::NonNull;

use crate::Pointer;

trait PlatformVirtualMemory {
    /// Reserves `length` bytes of address space. The memory doesn't have to
    /// be backed by physical pages yet; it only has to stay ours.
    unsafe fn reserve(length: usize) -> Pointer<u8>;

    /// Makes `length` bytes starting at `address` writable. Called with
    /// ranges inside a previous reservation, in address order, as the heap
    /// break moves up.
    unsafe fn commit(address: NonNull<u8>, length: usize) -> bool;

    /// Returns a whole reservation to the kernel.
    unsafe fn release(address: NonNull<u8>, length: usize);

    /// Virtual memory page size in bytes.
    unsafe fn page_size() -> usize;
}

/// Zero sized type that implements [`PlatformVirtualMemory`] for each OS.
pub(crate) struct Platform;

/// Virtual memory page size. 4096 bytes on most computers. This should be a
/// constant but we don't know the value at compile time.
static mut PAGE_SIZE: usize = 0;

/// We only know the value of the page size at runtime by calling into C
/// libraries, so we'll mutate a global variable and reuse it afterwards.
#[inline]
pub(crate) fn page_size() -> usize {
    unsafe {
        if PAGE_SIZE == 0 {
            PAGE_SIZE = Platform::page_size();
        }

        PAGE_SIZE
    }
}

/// Convenience wrapper for [`PlatformVirtualMemory::reserve`].
#[inline]
pub(crate) unsafe fn reserve(length: usize) -> Pointer<u8> {
    Platform::reserve(length)
}

/// Convenience wrapper for [`PlatformVirtualMemory::commit`].
#[inline]
pub(crate) unsafe fn commit(address: NonNull<u8>, length: usize) -> bool {
    Platform::commit(address, length)
}

/// Convenience wrapper for [`PlatformVirtualMemory::release`].
#[inline]
pub(crate) unsafe fn release(address: NonNull<u8>, length: usize) {
    Platform::release(address, length)
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use libc;

    use super::{Platform, PlatformVirtualMemory};
    use crate::Pointer;

    impl PlatformVirtualMemory for Platform {
        unsafe fn reserve(length: usize) -> Pointer<u8> {
            // Read-write, private to our process, not mapped to any file.
            let protection = libc::PROT_READ | libc::PROT_WRITE;

            #[allow(unused_mut)]
            let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            // Ask Linux not to account the whole reservation against the
            // overcommit limit; pages get backed as they are touched.
            #[cfg(target_os = "linux")]
            {
                flags |= libc::MAP_NORESERVE;
            }

            let address = libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0);
            if address == libc::MAP_FAILED {
                None
            } else {
                Some(NonNull::new_unchecked(address).cast())
            }
        }

        unsafe fn commit(_address: NonNull<u8>, _length: usize) -> bool {
            // The reservation is already mapped read-write, the kernel backs
            // pages lazily on first touch.
            true
        }

        unsafe fn release(address: NonNull<u8>, length: usize) {
            if libc::munmap(address.cast().as_ptr(), length) != 0 {
                // TODO: What should we do here? Panic? Memory region is
                // still valid here, it wasn't unmapped.
            }
        }

        unsafe fn page_size() -> usize {
            libc::sysconf(libc::_SC_PAGE_SIZE) as usize
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::{mem::MaybeUninit, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    use super::{Platform, PlatformVirtualMemory};
    use crate::Pointer;

    impl PlatformVirtualMemory for Platform {
        unsafe fn reserve(length: usize) -> Pointer<u8> {
            // Unlike mmap, memory has to be reserved first and then
            // committed in order to become usable, which fits the grow-only
            // segment perfectly: reserve the whole budget here, commit in
            // `commit` as the break advances.
            let address = Memory::VirtualAlloc(
                None,
                length,
                Memory::MEM_RESERVE,
                Memory::PAGE_NOACCESS,
            );

            NonNull::new(address.cast())
        }

        unsafe fn commit(address: NonNull<u8>, length: usize) -> bool {
            let address = Memory::VirtualAlloc(
                Some(address.cast().as_ptr()),
                length,
                Memory::MEM_COMMIT,
                Memory::PAGE_READWRITE,
            );

            !address.is_null()
        }

        unsafe fn release(address: NonNull<u8>, _length: usize) {
            // Length 0 with MEM_RELEASE frees the entire reservation.
            let address = address.cast().as_ptr();

            if !Memory::VirtualFree(address, 0, Memory::MEM_RELEASE).as_bool() {
                // TODO: Release failed, don't know what to do here yet. Same
                // problem as munmap on Unix.
            }
        }

        unsafe fn page_size() -> usize {
            let mut system_info = MaybeUninit::uninit();
            SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

            system_info.assume_init().dwPageSize as usize
        }
    }
}

#[cfg(miri)]
mod miri {
    //! When using Miri, we can't rely on system calls such as `mmap` because
    //! there's no FFI support, so instead we'll use the global allocator to
    //! mock low level memory management. This also lets Miri catch segments
    //! that are never released.

    use std::{alloc, ptr::NonNull};

    use super::{page_size, Platform, PlatformVirtualMemory};
    use crate::Pointer;

    fn to_layout(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, page_size()).unwrap()
    }

    impl PlatformVirtualMemory for Platform {
        unsafe fn reserve(length: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc(to_layout(length)))
        }

        unsafe fn commit(_address: NonNull<u8>, _length: usize) -> bool {
            true
        }

        unsafe fn release(address: NonNull<u8>, length: usize) {
            alloc::dealloc(address.as_ptr(), to_layout(length));
        }

        unsafe fn page_size() -> usize {
            4096
        }
    }
}
