use std::ptr::NonNull;

use crate::Pointer;

/// Abstraction for platform specific memory handling. The allocator needs
/// one large reservation of address space that it can commit page by page
/// as the heap grows, but it doesn't care about the APIs offered by the
/// underlying kernel or libraries.
trait PlatformSpecificMemory {
    /// Reserves `length` bytes of address space, preferably at `address`.
    /// The hint is best effort; the reservation may land anywhere. Reserved
    /// memory is not yet readable or writable.
    unsafe fn reserve(address: usize, length: usize) -> Pointer<u8>;

    /// Makes `length` bytes starting at `address` readable and writable.
    /// Both values must be page aligned and inside a previous reservation.
    unsafe fn commit(address: NonNull<u8>, length: usize) -> bool;

    /// Returns a whole reservation of `length` bytes starting at `address`
    /// to the kernel, committed or not.
    unsafe fn release(address: NonNull<u8>, length: usize);

    /// Virtual memory page size in bytes.
    unsafe fn page_size() -> usize;
}

/// Zero sized type that implements [`PlatformSpecificMemory`] for each OS.
pub(crate) struct Platform;

/// Virtual memory page size. 4096 bytes on most computers. This should be a
/// constant but we don't know the value at compile time.
pub(crate) static mut PAGE_SIZE: usize = 0;

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

/// Convenience wrapper for [`PlatformSpecificMemory::reserve`].
#[inline]
pub(crate) unsafe fn reserve(address: usize, length: usize) -> Pointer<u8> {
    Platform::reserve(address, length)
}

/// Convenience wrapper for [`PlatformSpecificMemory::commit`].
#[inline]
pub(crate) unsafe fn commit(address: NonNull<u8>, length: usize) -> bool {
    Platform::commit(address, length)
}

/// Convenience wrapper for [`PlatformSpecificMemory::release`].
#[inline]
pub(crate) unsafe fn release(address: NonNull<u8>, length: usize) {
    Platform::release(address, length)
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::NonNull;

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    impl PlatformSpecificMemory for Platform {
        unsafe fn reserve(address: usize, length: usize) -> Pointer<u8> {
            // No access at all until pages are committed.
            let protection = libc::PROT_NONE;

            // Private, not backed by any file, and not counted against
            // overcommit limits until committed.
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;

            // The address is a hint, not MAP_FIXED; if the spot is taken
            // the kernel picks another one, which is fine because all the
            // allocator's internal offsets are relative to whatever base
            // it ends up with. See
            // https://man7.org/linux/man-pages/man2/mmap.2.html
            let region = libc::mmap(address as *mut libc::c_void, length, protection, flags, -1, 0);

            if region == libc::MAP_FAILED {
                None
            } else {
                Some(NonNull::new_unchecked(region).cast())
            }
        }

        unsafe fn commit(address: NonNull<u8>, length: usize) -> bool {
            let protection = libc::PROT_READ | libc::PROT_WRITE;

            libc::mprotect(address.cast().as_ptr(), length, protection) == 0
        }

        unsafe fn release(address: NonNull<u8>, length: usize) {
            // A failed munmap leaves the reservation mapped. There is no
            // caller that could act on the error, so it is swallowed.
            libc::munmap(address.cast().as_ptr(), length);
        }

        unsafe fn page_size() -> usize {
            libc::sysconf(libc::_SC_PAGE_SIZE) as usize
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod windows {
    use std::{ffi::c_void, mem::MaybeUninit, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    use super::{Platform, PlatformSpecificMemory};
    use crate::Pointer;

    impl PlatformSpecificMemory for Platform {
        unsafe fn reserve(address: usize, length: usize) -> Pointer<u8> {
            let protection = Memory::PAGE_NOACCESS;
            let flags = Memory::MEM_RESERVE;

            // Unlike mmap, VirtualAlloc fails instead of falling back when
            // the hinted address is unavailable, so retry without the hint.
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualalloc#parameters
            let hint = address as *const c_void;
            let mut region = Memory::VirtualAlloc(Some(hint), length, flags, protection);
            if region.is_null() {
                region = Memory::VirtualAlloc(None, length, flags, protection);
            }

            NonNull::new(region.cast())
        }

        unsafe fn commit(address: NonNull<u8>, length: usize) -> bool {
            let region = Memory::VirtualAlloc(
                Some(address.cast().as_ptr() as *const c_void),
                length,
                Memory::MEM_COMMIT,
                Memory::PAGE_READWRITE,
            );

            !region.is_null()
        }

        unsafe fn release(address: NonNull<u8>, _length: usize) {
            // Releasing the reservation decommits everything in it, so a
            // single call with length 0 and MEM_RELEASE is enough. See
            // https://learn.microsoft.com/en-us/windows/win32/api/memoryapi/nf-memoryapi-virtualfree#parameters
            let address = address.cast().as_ptr();
            let length = 0;
            let flags = Memory::MEM_RELEASE;

            // Same situation as munmap on unix: a failed release has no
            // caller that could act on it.
            Memory::VirtualFree(address, length, flags);
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
    //! When using Miri, we can't rely on system calls such as `mmap`
    //! because there's no FFI support, so instead we'll use the global
    //! allocator to mock low level memory management. There is no notion
    //! of committing here, the whole reservation is usable immediately;
    //! the allocator on top never reads memory it hasn't written, so the
    //! difference is not observable.

    use std::{alloc, ptr::NonNull};

    use super::{page_size, Platform, PlatformSpecificMemory};
    use crate::Pointer;

    fn to_layout(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, page_size()).unwrap()
    }

    impl PlatformSpecificMemory for Platform {
        unsafe fn reserve(_address: usize, length: usize) -> Pointer<u8> {
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
