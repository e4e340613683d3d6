use std::ptr::NonNull;

use log::trace;

use crate::heap::Heap;
use crate::region::{Region, DEFAULT_MAX_HEAP};
use crate::AllocError;

/// A malloc-style allocator over one contiguous, linearly growing heap.
///
/// The classic four operations are methods on the allocator object, so
/// initialization is explicit and exclusive access is enforced by the
/// borrow checker instead of a lock: the allocator is single threaded by
/// contract, callers that need sharing must serialize externally.
///
/// All payloads are aligned to 8 bytes. Stronger alignments are not
/// supported, and a single allocation cannot exceed what the 32-bit block
/// size field can frame.
///
/// # Examples
///
/// ```rust
/// use segalloc::Segalloc;
///
/// let mut allocator = Segalloc::new().unwrap();
///
/// let address = allocator.malloc(128).unwrap();
/// assert_eq!(address.as_ptr() as usize % 8, 0);
///
/// unsafe {
///     address.as_ptr().write_bytes(42, 128);
///     assert_eq!(address.as_ptr().read(), 42);
///
///     allocator.free(Some(address));
/// }
/// ```
///
/// Reallocation keeps data and fails softly, leaving the old block alive:
///
/// ```rust
/// use segalloc::Segalloc;
///
/// let mut allocator = Segalloc::new().unwrap();
///
/// let address = allocator.malloc(16).unwrap();
/// unsafe {
///     address.as_ptr().write(7);
///
///     let bigger = allocator.realloc(Some(address), 1024).unwrap();
///     assert_eq!(bigger.as_ptr().read(), 7);
///
///     allocator.free(Some(bigger));
/// }
/// ```
pub struct Segalloc {
    heap: Heap,
}

impl Segalloc {
    /// Creates an allocator backed by the default address space
    /// reservation. Fails if the reservation or the initial heap page
    /// cannot be obtained.
    pub fn new() -> Result<Self, AllocError> {
        Self::with_max_heap(DEFAULT_MAX_HEAP)
    }

    /// Creates an allocator whose heap can never grow beyond `max_heap`
    /// bytes. Once the heap reaches that bound, allocations start
    /// returning `None` while everything already allocated stays valid.
    ///
    /// Useful for capping memory and for exercising out-of-memory paths
    /// deterministically.
    pub fn with_max_heap(max_heap: usize) -> Result<Self, AllocError> {
        unsafe {
            let region = Region::reserve(max_heap).ok_or(AllocError)?;
            let heap = Heap::bootstrap(region).ok_or(AllocError)?;

            Ok(Self { heap })
        }
    }

    /// Allocates `size` bytes and returns the 8-aligned payload address,
    /// or `None` when `size` is zero or memory is exhausted.
    pub fn malloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let address = unsafe { self.heap.malloc(size) };
        trace!("malloc({size}) -> {address:?}");

        address
    }

    /// Releases an allocation. `None` is accepted and ignored.
    ///
    /// # Safety
    ///
    /// `address` must have been returned by this allocator and not freed
    /// since; foreign or dangling pointers corrupt the heap.
    pub unsafe fn free(&mut self, address: Option<NonNull<u8>>) {
        trace!("free({address:?})");
        self.heap.free(address);
    }

    /// Resizes an allocation, preserving its contents up to the smaller of
    /// the old and new sizes. Returns `None` on exhaustion, in which case
    /// the old allocation remains valid and untouched. `realloc(None, n)`
    /// allocates, `realloc(p, 0)` frees.
    ///
    /// # Safety
    ///
    /// Same contract as [`Segalloc::free`].
    pub unsafe fn realloc(
        &mut self,
        address: Option<NonNull<u8>>,
        size: usize,
    ) -> Option<NonNull<u8>> {
        let new_address = self.heap.realloc(address, size);
        trace!("realloc({address:?}, {size}) -> {new_address:?}");

        new_address
    }

    /// Allocates zeroed memory for `nmemb` elements of `size` bytes.
    /// Fails on exhaustion and on arithmetic overflow of the total.
    pub fn calloc(&mut self, nmemb: usize, size: usize) -> Option<NonNull<u8>> {
        let address = unsafe { self.heap.calloc(nmemb, size) };
        trace!("calloc({nmemb}, {size}) -> {address:?}");

        address
    }

    /// Runs the heap consistency checker, returning the number of
    /// invariant violations. See [`Heap::check_heap`] for what is
    /// verified. Intended for tests and debugging sessions; a healthy
    /// heap always reports zero.
    #[track_caller]
    pub fn check_heap(&self) -> usize {
        self.heap.check_heap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_sizes_round_trip() {
        let mut allocator = Segalloc::with_max_heap(1 << 20).unwrap();

        unsafe {
            let sizes = [1usize, 8, 24, 100, 448, 1024, 4096, 10000];
            let mut addresses = Vec::new();

            for size in sizes {
                let address = allocator.malloc(size).unwrap();
                address.as_ptr().write_bytes(69, size);
                addresses.push((address, size));
            }

            assert_eq!(allocator.check_heap(), 0);

            // Nothing stepped on anything else.
            for (address, size) in &addresses {
                for i in 0..*size {
                    assert_eq!(address.as_ptr().add(i).read(), 69);
                }
            }

            for (address, _) in addresses {
                allocator.free(Some(address));
            }

            assert_eq!(allocator.check_heap(), 0);
        }
    }

    #[test]
    fn freed_memory_is_reused() {
        let mut allocator = Segalloc::with_max_heap(1 << 20).unwrap();

        unsafe {
            let first = allocator.malloc(512).unwrap();
            allocator.free(Some(first));

            let second = allocator.malloc(512).unwrap();
            assert_eq!(first, second);

            allocator.free(Some(second));
        }
    }

    #[test]
    fn edge_inputs() {
        let mut allocator = Segalloc::with_max_heap(1 << 20).unwrap();

        assert_eq!(allocator.malloc(0), None);
        unsafe {
            allocator.free(None);
            assert_eq!(allocator.realloc(None, 0), None);
        }
        assert_eq!(allocator.calloc(0, 100), None);
        assert_eq!(allocator.check_heap(), 0);
    }

    #[test]
    fn exhaustion_is_not_fatal() {
        let mut allocator = Segalloc::with_max_heap(16 * 1024).unwrap();

        unsafe {
            let mut addresses = Vec::new();
            loop {
                match allocator.malloc(1024) {
                    Some(address) => addresses.push(address),
                    None => break,
                }
            }

            assert!(!addresses.is_empty());
            assert_eq!(allocator.check_heap(), 0);

            // Freeing makes the memory allocatable again.
            for address in addresses {
                allocator.free(Some(address));
            }
            assert_eq!(allocator.check_heap(), 0);
            assert!(allocator.malloc(1024).is_some());
        }
    }

    #[test]
    fn tiny_reservations_fail_to_build() {
        // Not even the first heap page fits.
        assert!(Segalloc::with_max_heap(0).is_err());
    }
}
