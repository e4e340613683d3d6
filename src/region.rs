use std::ptr::NonNull;

use crate::platform::{self, page_size};
use crate::Pointer;

/// Where we'd like the heap to live. Plenty of unused address space on
/// 64 bit machines sits above the usual program mappings, so the hint is
/// almost always honored, but nothing breaks if it isn't; every internal
/// offset is relative to the base the reservation actually got.
pub(crate) const BASE_ADDRESS: usize = 0x8_0000_0000;

/// Default reservation: 256 MiB of address space. Only the pages the heap
/// has actually grown into are ever committed.
pub(crate) const DEFAULT_MAX_HEAP: usize = 256 * 1024 * 1024;

/// The single contiguous segment of memory the allocator carves blocks out
/// of. It grows linearly and never shrinks:
///
/// ```text
///  base                    limit = base + len
///  |                       |
///  v                       v
///  +-----------------------+---------------+- - - - - - - - - - -+
///  |   heap (committed)    |   committed   |  reserved, no access |
///  +-----------------------+---------------+- - - - - - - - - - -+
///  <--------- len --------->
///  <------------- committed -------------->
///  <------------------------- reserved ------------------------->
/// ```
///
/// [`Region::sbrk`] hands out bytes from the committed area and commits
/// more pages when it runs past it, failing cleanly once the reservation
/// is exhausted. The reservation bound is what makes out-of-memory
/// behavior testable: build a region with a small `max_heap` and growth
/// starts failing exactly when expected, with no state changes.
pub(crate) struct Region {
    base: NonNull<u8>,
    /// Bytes handed out so far.
    brk: usize,
    /// Bytes committed so far. Always a multiple of the page size and at
    /// least `brk`.
    committed: usize,
    /// Total reservation length.
    reserved: usize,
}

impl Region {
    /// Reserves address space for a heap of at most `max_heap` bytes.
    /// Nothing is committed yet.
    ///
    /// Fails if the reservation cannot be obtained or if `max_heap` is
    /// zero or too large for block offsets to fit in 32 bits.
    pub unsafe fn reserve(max_heap: usize) -> Option<Self> {
        if max_heap == 0 {
            return None;
        }

        let reserved = round_to_pages(max_heap)?;

        // Offsets from the base are stored as 32-bit words.
        if reserved as u128 > 1 << 32 {
            return None;
        }

        let base = platform::reserve(BASE_ADDRESS, reserved)?;

        Some(Self {
            base,
            brk: 0,
            committed: 0,
            reserved,
        })
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// One byte past the end of the heap.
    #[inline]
    pub fn limit(&self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.brk)) }
    }

    /// Current heap length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.brk
    }

    /// Grows the heap by `length` bytes, returning the old limit, which is
    /// where the fresh bytes start. On failure nothing changes: no pages
    /// are handed out and the limit stays where it was.
    pub unsafe fn sbrk(&mut self, length: usize) -> Pointer<u8> {
        let new_brk = self.brk.checked_add(length)?;

        if new_brk > self.reserved {
            return None;
        }

        if new_brk > self.committed {
            let target = round_to_pages(new_brk)?.min(self.reserved);
            let start = NonNull::new_unchecked(self.base.as_ptr().add(self.committed));
            if !platform::commit(start, target - self.committed) {
                return None;
            }
            self.committed = target;
        }

        let old_limit = self.limit();
        self.brk = new_brk;

        Some(old_limit)
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe { platform::release(self.base, self.reserved) }
    }
}

fn round_to_pages(length: usize) -> Option<usize> {
    let page = page_size();
    length.checked_add(page - 1).map(|n| n & !(page - 1))
}
