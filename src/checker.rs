use std::panic::Location;
use std::ptr::NonNull;

use log::error;

use crate::block::{Block, MIN_BLOCK_SIZE};
use crate::freelist::{SegregatedLists, FIRST_CLASS, LAST_CLASS};
use crate::heap::{Heap, FIRST_BLOCK_OFFSET};

impl Heap {
    /// Verifies every structural invariant of the heap and returns the
    /// number of violations found, reporting each one through
    /// [`log::error!`] together with the caller's source location. Never
    /// mutates anything.
    ///
    /// Two passes. The linear pass walks blocks in physical order checking
    /// the boundary tags: sane sizes, successor flags caching the right
    /// state, no two adjacent free blocks, and footers agreeing with
    /// headers. The list pass walks every size class checking membership
    /// bounds and link discipline, and finally the number of free blocks
    /// seen on the heap has to match the number of listed nodes, so a
    /// block can neither be lost from the lists nor linked while
    /// allocated.
    ///
    /// This is a debugging aid with linear cost; call it from tests and
    /// instrumented builds, not from the allocation paths.
    #[track_caller]
    pub fn check_heap(&self) -> usize {
        let caller = Location::caller();
        let heap_len = self.region.len();
        let mut violations = 0;

        unsafe {
            let mut free_in_heap = 0;
            let mut offset = FIRST_BLOCK_OFFSET;

            while offset < heap_len {
                let block = Block::from_payload(NonNull::new_unchecked(
                    self.base().as_ptr().add(offset),
                ));
                let size = block.size();

                if size < MIN_BLOCK_SIZE || size % 8 != 0 || offset + size as usize > heap_len {
                    error!("{caller}: block at offset {offset} has corrupt size {size}");
                    violations += 1;
                    // The walk cannot continue over a broken size.
                    break;
                }

                let next = block.next();
                if block.is_allocated() != next.is_prev_allocated() {
                    error!(
                        "{caller}: block at offset {offset} is allocated={} but its successor \
                         caches prev_allocated={}",
                        block.is_allocated(),
                        next.is_prev_allocated()
                    );
                    violations += 1;
                }

                if !block.is_allocated() {
                    free_in_heap += 1;

                    if !next.is_allocated() {
                        error!("{caller}: adjacent free blocks at offset {offset}");
                        violations += 1;
                    }

                    if block.footer() != size {
                        error!(
                            "{caller}: free block at offset {offset} has footer {} but header \
                             size {size}",
                            block.footer()
                        );
                        violations += 1;
                    }
                }

                offset += size as usize;
            }

            let mut listed = 0;
            let node_cap = heap_len / MIN_BLOCK_SIZE as usize + 1;

            for class in FIRST_CLASS..=LAST_CLASS {
                let (min, max) = SegregatedLists::class_bounds(class);
                let end = self.lists.sentinel(class);
                let mut node = self.lists.next_of(end);
                let mut walked = 0;

                while node != end {
                    walked += 1;
                    if walked > node_cap {
                        error!("{caller}: list of class {class} does not terminate");
                        violations += 1;
                        break;
                    }

                    let node_offset = self.lists.offset_of(node) as usize;
                    if node_offset < FIRST_BLOCK_OFFSET
                        || node_offset >= heap_len
                        || node_offset % 8 != 0
                    {
                        error!(
                            "{caller}: list of class {class} links to invalid offset {node_offset}"
                        );
                        violations += 1;
                        break;
                    }

                    let block = Block::from_payload(node);

                    if block.is_allocated() {
                        error!(
                            "{caller}: allocated block at offset {node_offset} is linked in \
                             class {class}"
                        );
                        violations += 1;
                    }

                    let size = block.size();
                    if size < min || size >= max {
                        error!(
                            "{caller}: block of size {size} at offset {node_offset} is linked in \
                             class {class} which holds [{min}, {max})"
                        );
                        violations += 1;
                    }

                    if self.lists.prev_of(self.lists.next_of(node)) != node {
                        error!(
                            "{caller}: broken backlink after block at offset {node_offset} in \
                             class {class}"
                        );
                        violations += 1;
                    }

                    listed += 1;
                    node = self.lists.next_of(node);
                }
            }

            if free_in_heap != listed {
                error!(
                    "{caller}: {free_in_heap} free blocks on the heap but {listed} nodes in the \
                     lists"
                );
                violations += 1;
            }
        }

        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Region;

    unsafe fn test_heap() -> Heap {
        Heap::bootstrap(Region::reserve(1 << 20).unwrap()).unwrap()
    }

    #[test]
    fn clean_heaps_report_nothing() {
        unsafe {
            let mut heap = test_heap();
            assert_eq!(heap.check_heap(), 0);

            let a = heap.malloc(100).unwrap();
            let b = heap.calloc(4, 32).unwrap();
            assert_eq!(heap.check_heap(), 0);

            let a = heap.realloc(Some(a), 300).unwrap();
            heap.free(Some(b));
            assert_eq!(heap.check_heap(), 0);

            heap.free(Some(a));
            assert_eq!(heap.check_heap(), 0);
        }
    }

    #[test]
    fn stale_successor_flag_is_reported() {
        unsafe {
            let mut heap = test_heap();
            let address = heap.malloc(24).unwrap();

            // The successor no longer knows its predecessor is in use.
            Block::from_payload(address).next().clear_prev_allocated();

            assert!(heap.check_heap() > 0);
        }
    }

    #[test]
    fn corrupt_footer_is_reported() {
        unsafe {
            let heap = test_heap();

            let free_block = heap.first_block();
            let size = free_block.size();
            free_block
                .payload()
                .as_ptr()
                .add(size as usize - 8)
                .cast::<u32>()
                .write(size + 8);

            assert!(heap.check_heap() > 0);
        }
    }

    #[test]
    fn free_block_outside_the_lists_is_reported() {
        unsafe {
            let mut heap = test_heap();
            let address = heap.malloc(24).unwrap();

            // Marking an allocated block free by hand leaves the free
            // count and the list count out of sync.
            let block = Block::from_payload(address);
            block.set_size(block.size());
            block.mark_free();
            Block::from_payload(address).next().clear_prev_allocated();

            assert!(heap.check_heap() > 0);
        }
    }

    #[test]
    fn allocated_block_left_in_a_list_is_reported() {
        unsafe {
            let mut heap = test_heap();
            let address = heap.malloc(24).unwrap();
            let _guard = heap.malloc(24).unwrap();
            heap.free(Some(address));

            // Resurrect the freed block by hand, leaving it linked. The
            // successor flag is patched so only the list checks fire.
            let block = Block::from_payload(address);
            block.mark_allocated();
            block.next().set_prev_allocated();

            assert!(heap.check_heap() > 0);
        }
    }
}
