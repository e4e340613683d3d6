use std::ptr::{self, NonNull};

use crate::align::align_request;
use crate::block::{Block, MIN_BLOCK_SIZE};
use crate::header::{Tag, WORD_SIZE};
use crate::heap::Heap;
use crate::Pointer;

impl Heap {
    /// Resizes an allocation, moving it only as a last resort. The cheap
    /// paths, tried in order:
    ///
    /// 1. The new size fits in the current block: shrink in place.
    /// 2. The physical successor is free and large enough: absorb the
    ///    missing bytes from it.
    /// 3. The block is the last one in the heap: grow the region by
    ///    exactly the deficit.
    ///
    /// Only then the contents move to a freshly allocated block. If that
    /// allocation fails, `None` is returned and the old block is left
    /// exactly as it was, contents included.
    ///
    /// `realloc(None, size)` allocates and `realloc(address, 0)` frees,
    /// mirroring [`Heap::malloc`] and [`Heap::free`].
    pub unsafe fn realloc(&mut self, address: Pointer<u8>, size: usize) -> Pointer<u8> {
        let Some(address) = address else {
            return self.malloc(size);
        };

        if size == 0 {
            self.free(Some(address));
            return None;
        }

        let block = Block::from_payload(address);
        let old_size = block.size();
        let new_size = align_request(size)?;

        if new_size <= old_size {
            return Some(self.shrink(block, new_size));
        }

        let deficit = new_size - old_size;
        let next = block.next();

        if !next.is_allocated() && deficit <= next.size() {
            let residue = next.size() - deficit;
            self.lists.unlink(next);

            if residue >= MIN_BLOCK_SIZE {
                // Take only the deficit; what's left of the successor
                // stays a free block, just smaller and further right.
                let rest = Block::from_payload(NonNull::new_unchecked(
                    next.payload().as_ptr().add(deficit as usize),
                ));
                rest.write_free(residue, true);
                self.lists.insert(rest);

                block.set_size_header_only(new_size);
            } else {
                // The residue can't stand on its own, consume the whole
                // successor and let the block after it know.
                block.set_size_header_only(old_size + next.size());
                block.next().set_prev_allocated();
            }

            return Some(address);
        }

        if next.payload() == self.region.limit() {
            // Growing the last block needs no searching and no copying,
            // just the missing bytes from the region.
            self.region.sbrk(deficit as usize)?;

            block.set_size_header_only(new_size);
            self.terminal().set_tag(Tag::terminal(true));

            return Some(address);
        }

        let new_address = self.malloc(size)?;
        ptr::copy_nonoverlapping(
            address.as_ptr(),
            new_address.as_ptr(),
            old_size as usize - WORD_SIZE,
        );
        self.free(Some(address));

        Some(new_address)
    }

    /// Trims an allocated block down to `new_size`, releasing the tail as
    /// a free block. Like placement, the cut is skipped entirely when the
    /// tail would be below the minimum block size. Unlike placement, the
    /// freed tail may sit right before another free block, so it is merged
    /// forward before joining a list.
    pub(crate) unsafe fn shrink(&mut self, block: Block, new_size: u32) -> NonNull<u8> {
        let remainder = block.size() - new_size;

        if remainder < MIN_BLOCK_SIZE {
            return block.payload();
        }

        block.set_size_header_only(new_size);

        let rest = block.next();
        rest.write_free(remainder, true);

        let after = rest.next();
        if after.is_allocated() {
            self.lists.insert(rest);
            after.clear_prev_allocated();
        } else {
            self.lists.unlink(after);
            rest.set_size(remainder + after.size());
            self.lists.insert(rest);
        }

        block.payload()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{EXTEND_SIZE, FIRST_BLOCK_OFFSET};
    use crate::region::Region;

    unsafe fn test_heap(max_heap: usize) -> Heap {
        Heap::bootstrap(Region::reserve(max_heap).unwrap()).unwrap()
    }

    const INITIAL_FREE: u32 = EXTEND_SIZE - FIRST_BLOCK_OFFSET as u32;

    #[test]
    fn null_and_zero_behave_like_malloc_and_free() {
        unsafe {
            let mut heap = test_heap(1 << 20);

            let address = heap.realloc(None, 100).unwrap();
            assert_eq!(heap.blocks()[0], (112, true));

            assert_eq!(heap.realloc(Some(address), 0), None);
            assert_eq!(heap.blocks(), vec![(INITIAL_FREE, false)]);
            assert_eq!(heap.check_heap(), 0);
        }
    }

    #[test]
    fn shrink_in_place_releases_the_tail() {
        unsafe {
            let mut heap = test_heap(1 << 20);

            let address = heap.malloc(512).unwrap();
            assert_eq!(heap.blocks()[0], (520, true));

            let resized = heap.realloc(Some(address), 64).unwrap();
            assert_eq!(resized, address);

            // The 448-byte tail merges with the free block next to it.
            assert_eq!(heap.blocks(), vec![(72, true), (INITIAL_FREE - 72, false)]);
            assert_eq!(heap.check_heap(), 0);
        }
    }

    #[test]
    fn shrink_residue_joins_a_list_when_the_successor_is_allocated() {
        unsafe {
            let mut heap = test_heap(1 << 20);

            let first = heap.malloc(512).unwrap();
            let guard = heap.malloc(24).unwrap();

            let resized = heap.realloc(Some(first), 64).unwrap();
            assert_eq!(resized, first);
            assert_eq!(
                heap.blocks(),
                vec![
                    (72, true),
                    (448, false),
                    (32, true),
                    (INITIAL_FREE - 552, false)
                ]
            );
            assert_eq!(heap.check_heap(), 0);

            heap.free(Some(guard));
            heap.free(Some(resized));
            assert_eq!(heap.blocks(), vec![(INITIAL_FREE, false)]);
            assert_eq!(heap.check_heap(), 0);
        }
    }

    #[test]
    fn tiny_shrink_changes_nothing() {
        unsafe {
            let mut heap = test_heap(1 << 20);

            let address = heap.malloc(100).unwrap();
            let resized = heap.realloc(Some(address), 100).unwrap();
            assert_eq!(resized, address);
            assert_eq!(heap.blocks()[0], (112, true));

            // One alignment unit less still leaves no room for a block.
            let resized = heap.realloc(Some(address), 96).unwrap();
            assert_eq!(resized, address);
            assert_eq!(heap.blocks()[0], (112, true));
            assert_eq!(heap.check_heap(), 0);
        }
    }

    #[test]
    fn grow_absorbs_part_of_a_free_successor() {
        unsafe {
            let mut heap = test_heap(1 << 20);

            let first = heap.malloc(64).unwrap();
            let second = heap.malloc(64).unwrap();
            heap.free(Some(second));

            let resized = heap.realloc(Some(first), 96).unwrap();
            assert_eq!(resized, first);
            assert_eq!(
                heap.blocks(),
                vec![(104, true), (INITIAL_FREE - 104, false)]
            );
            assert_eq!(heap.check_heap(), 0);
        }
    }

    #[test]
    fn grow_consumes_a_free_successor_entirely() {
        unsafe {
            let mut heap = test_heap(1 << 20);

            let first = heap.malloc(24).unwrap();
            let middle = heap.malloc(24).unwrap();
            let guard = heap.malloc(24).unwrap();
            heap.free(Some(middle));
            assert_eq!(
                heap.blocks(),
                vec![
                    (32, true),
                    (32, false),
                    (32, true),
                    (INITIAL_FREE - 96, false)
                ]
            );

            // 56 bytes are needed, the free successor holds 32 and the
            // residue of 8 cannot stand alone, so all of it is consumed.
            let resized = heap.realloc(Some(first), 48).unwrap();
            assert_eq!(resized, first);
            assert_eq!(
                heap.blocks(),
                vec![(64, true), (32, true), (INITIAL_FREE - 96, false)]
            );
            assert!(Block::from_payload(guard).is_prev_allocated());
            assert_eq!(heap.check_heap(), 0);
        }
    }

    #[test]
    fn grow_at_the_heap_tail_extends_by_the_deficit() {
        unsafe {
            let mut heap = test_heap(1 << 20);

            // Swallow the whole initial block so the free lists are empty
            // and the block ends at the terminal.
            let address = heap.malloc(INITIAL_FREE as usize - 4).unwrap();
            assert_eq!(heap.free_block_sizes(), Vec::<u32>::new());

            let resized = heap.realloc(Some(address), 4096).unwrap();
            assert_eq!(resized, address);

            // 4104 - 3960 bytes were missing.
            assert_eq!(heap.region.len(), 4096 + 144);
            assert_eq!(heap.blocks(), vec![(4104, true)]);
            assert!(heap.terminal().is_prev_allocated());
            assert_eq!(heap.check_heap(), 0);
        }
    }

    #[test]
    fn grow_moves_and_copies_as_a_last_resort() {
        unsafe {
            let mut heap = test_heap(1 << 20);

            let first = heap.malloc(32).unwrap();
            let guard = heap.malloc(32).unwrap();

            for i in 0..32 {
                first.as_ptr().add(i).write(i as u8);
            }

            let moved = heap.realloc(Some(first), 200).unwrap();
            assert_ne!(moved, first);

            for i in 0..32 {
                assert_eq!(moved.as_ptr().add(i).read(), i as u8);
            }

            assert_eq!(
                heap.blocks(),
                vec![
                    (40, false),
                    (40, true),
                    (208, true),
                    (INITIAL_FREE - 288, false)
                ]
            );
            assert_eq!(heap.check_heap(), 0);

            heap.free(Some(guard));
            heap.free(Some(moved));
            assert_eq!(heap.blocks(), vec![(INITIAL_FREE, false)]);
        }
    }

    #[test]
    fn failed_growth_preserves_the_old_block() {
        unsafe {
            let mut heap = test_heap(EXTEND_SIZE as usize);

            let first = heap.malloc(100).unwrap();
            let _guard = heap.malloc(24).unwrap();
            first.as_ptr().write_bytes(0xC3, 100);

            // Nothing can satisfy this: the successor is allocated and
            // the reservation is already exhausted.
            assert_eq!(heap.realloc(Some(first), 8000), None);

            let block = Block::from_payload(first);
            assert!(block.is_allocated());
            assert_eq!(block.size(), 112);
            for i in 0..100 {
                assert_eq!(first.as_ptr().add(i).read(), 0xC3);
            }
            assert_eq!(heap.check_heap(), 0);
        }
    }
}
