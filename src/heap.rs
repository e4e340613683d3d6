use std::ptr::NonNull;

use log::debug;

use crate::align::align_request;
use crate::block::{Block, MIN_BLOCK_SIZE};
use crate::freelist::{SegregatedLists, FIRST_CLASS, SENTINEL_AREA_SIZE};
use crate::header::Tag;
use crate::region::Region;
use crate::Pointer;

/// Growth quantum. The region is extended by at least this many bytes at a
/// time so that small allocations don't turn into one provider call each.
pub(crate) const EXTEND_SIZE: u32 = 4096;

/// Offset of the first block's payload: the sentinel area, 4 bytes of
/// padding to restore 8-byte payload alignment, and the block's 4-byte
/// header.
pub(crate) const FIRST_BLOCK_OFFSET: usize = SENTINEL_AREA_SIZE + 8;

/// The allocator engine: one [`Region`] partitioned into boundary-tagged
/// blocks, with free blocks threaded through the segregated lists stored
/// in the region's own prefix.
///
/// Right after [`Heap::bootstrap`] the region looks like this:
///
/// ```text
///  base                                                     base + 4096
///  |                                                        |
///  v                                                        v
///  +-----------+-----+------+--------------------------+----+
///  | sentinels | pad | hdr  |    one big free block    | T  |
///  +-----------+-----+------+--------------------------+----+
///  0           128   132    136                        4092
/// ```
///
/// `T` is the terminal: a zero-size header marked allocated so that the
/// coalescing logic never has to ask whether a successor exists. Its
/// prev-allocated bit tracks the state of the last real block, which is
/// how [`Heap::extend`] knows whether fresh bytes can be merged into a
/// free tail.
///
/// Every mutation keeps the structural invariants intact: a block's
/// successor always caches the block's allocation state, free blocks are
/// never adjacent, and a block is linked into exactly one size class list
/// while and only while it is free. [`Heap::check_heap`] walks the whole
/// structure and reports any violation.
pub(crate) struct Heap {
    pub(crate) region: Region,
    pub(crate) lists: SegregatedLists,
}

impl Heap {
    /// Builds the initial heap image on a fresh region: sentinel prefix,
    /// one free block spanning the rest of the first extension, and the
    /// terminal header.
    pub unsafe fn bootstrap(mut region: Region) -> Option<Self> {
        region.sbrk(EXTEND_SIZE as usize)?;

        let lists = SegregatedLists::new(region.base());
        lists.init();

        let heap = Self { region, lists };

        // The sentinel prefix plays the role of an allocated predecessor
        // for the first block.
        let first = heap.first_block();
        first.write_free(EXTEND_SIZE - FIRST_BLOCK_OFFSET as u32, true);
        heap.terminal().set_tag(Tag::terminal(false));

        heap.lists.insert(first);

        Some(heap)
    }

    #[inline]
    pub(crate) fn base(&self) -> NonNull<u8> {
        self.region.base()
    }

    /// The block starting right after the sentinel prefix.
    #[inline]
    pub(crate) unsafe fn first_block(&self) -> Block {
        Block::from_payload(NonNull::new_unchecked(
            self.base().as_ptr().add(FIRST_BLOCK_OFFSET),
        ))
    }

    /// The terminal pseudo-block at the current end of the heap. Only its
    /// header exists.
    #[inline]
    pub(crate) unsafe fn terminal(&self) -> Block {
        Block::from_payload(self.region.limit())
    }

    /// Allocates a block for `size` bytes and returns its payload address,
    /// aligned to 8 bytes. Zero-size requests and requests the region
    /// cannot accommodate return `None`.
    pub unsafe fn malloc(&mut self, size: usize) -> Pointer<u8> {
        if size == 0 {
            return None;
        }

        let aligned = align_request(size)?;

        if let Some(address) = self.find_fit(aligned) {
            return Some(address);
        }

        self.extend(aligned)
    }

    /// First fit over the segregated lists, starting at the tightest class
    /// that can hold `aligned` and moving towards the classes of strictly
    /// larger blocks. Any block found in a lower-index class is guaranteed
    /// big enough, but within the starting class sizes mix, hence the size
    /// check on every candidate.
    unsafe fn find_fit(&mut self, aligned: u32) -> Pointer<u8> {
        let mut class = SegregatedLists::class_of(aligned);

        loop {
            let end = self.lists.sentinel(class);
            let mut node = self.lists.next_of(end);

            while node != end {
                let block = Block::from_payload(node);
                let block_size = block.size();

                if block_size >= aligned {
                    self.lists.unlink(block);
                    return Some(self.place(block, aligned, block_size));
                }

                node = self.lists.next_of(node);
            }

            if class == FIRST_CLASS {
                return None;
            }
            class -= 1;
        }
    }

    /// Carves an `aligned`-byte allocated block out of a free block that
    /// has already been unlinked from its list. If the remainder is too
    /// small to stand on its own the whole block is used; otherwise the
    /// tail becomes a new free block:
    ///
    /// ```text
    ///  before:  +---------------- block_size ---------------+
    ///           | free                                      |
    ///           +-------------------------------------------+
    ///
    ///  after:   +---- aligned ----+------- remainder -------+
    ///           | allocated       | free, back in its list  |
    ///           +-----------------+-------------------------+
    /// ```
    unsafe fn place(&mut self, block: Block, aligned: u32, block_size: u32) -> NonNull<u8> {
        let remainder = block_size - aligned;

        if remainder < MIN_BLOCK_SIZE {
            block.mark_allocated();
            block.next().set_prev_allocated();
            return block.payload();
        }

        block.set_size_header_only(aligned);
        block.mark_allocated();

        let rest = block.next();
        rest.write_free(remainder, true);
        self.lists.insert(rest);

        // The block after `rest` already has its prev-allocated bit clear,
        // since all of this memory was one free block a moment ago.

        block.payload()
    }

    /// Grows the region to satisfy an allocation no free block could.
    ///
    /// When the heap ends in a free block, only the missing bytes are
    /// requested and merged into it; a fresh free block is created at the
    /// old limit otherwise. Either way the terminal moves to the new end
    /// and placement runs on the resulting block. The region is asked for
    /// memory before any list surgery, so a refused growth leaves the heap
    /// exactly as it was.
    unsafe fn extend(&mut self, aligned: u32) -> Pointer<u8> {
        let terminal = self.terminal();

        if terminal.is_prev_allocated() {
            let growth = aligned.max(EXTEND_SIZE);
            let old_limit = self.region.sbrk(growth as usize)?;

            debug!("extending heap by {growth} bytes");

            // The old terminal header becomes the header of the new block.
            let block = Block::from_payload(old_limit);
            block.write_free(growth, true);
            self.terminal().set_tag(Tag::terminal(false));

            Some(self.place(block, aligned, growth))
        } else {
            let tail = terminal.prev_free();
            let tail_size = tail.size();

            // The search failed, so the free tail is known to be too
            // small; request only what's missing.
            debug_assert!(tail_size < aligned);
            let growth = (aligned - tail_size).max(EXTEND_SIZE);
            self.region.sbrk(growth as usize)?;

            debug!("extending heap by {growth} bytes into the free tail");

            self.lists.unlink(tail);
            tail.set_size(tail_size + growth);
            self.terminal().set_tag(Tag::terminal(false));

            Some(self.place(tail, aligned, tail_size + growth))
        }
    }

    /// Releases a block, eagerly merging it with free physical neighbors
    /// so that no two free blocks are ever adjacent:
    ///
    /// | predecessor | successor | result                                |
    /// |-------------|-----------|---------------------------------------|
    /// | allocated   | allocated | block joins a list as is              |
    /// | free        | allocated | predecessor absorbs block             |
    /// | allocated   | free      | block absorbs successor               |
    /// | free        | free      | predecessor absorbs both              |
    ///
    /// Freeing `None` is a no-op.
    pub unsafe fn free(&mut self, address: Pointer<u8>) {
        let Some(address) = address else {
            return;
        };

        let block = Block::from_payload(address);
        let next = block.next();

        match (block.is_prev_allocated(), next.is_allocated()) {
            (true, true) => {
                let size = block.size();
                block.set_size(size);
                block.mark_free();
                next.clear_prev_allocated();
                self.lists.insert(block);
            }
            (false, true) => {
                let prev = block.prev_free();
                self.lists.unlink(prev);
                prev.set_size(prev.size() + block.size());
                next.clear_prev_allocated();
                self.lists.insert(prev);
            }
            (true, false) => {
                self.lists.unlink(next);
                block.set_size(block.size() + next.size());
                block.mark_free();
                self.lists.insert(block);
            }
            (false, false) => {
                let prev = block.prev_free();
                self.lists.unlink(prev);
                self.lists.unlink(next);
                prev.set_size(prev.size() + block.size() + next.size());
                self.lists.insert(prev);
            }
        }
    }

    /// Allocates zeroed memory for `nmemb` elements of `size` bytes each.
    /// Fails cleanly when the total overflows.
    pub unsafe fn calloc(&mut self, nmemb: usize, size: usize) -> Pointer<u8> {
        let total = nmemb.checked_mul(size)?;
        let address = self.malloc(total)?;

        address.as_ptr().write_bytes(0, total);

        Some(address)
    }

    /// Every block in physical order as `(size, allocated)` pairs, the
    /// terminal excluded.
    #[cfg(test)]
    pub(crate) unsafe fn blocks(&self) -> Vec<(u32, bool)> {
        let mut blocks = Vec::new();
        let mut offset = FIRST_BLOCK_OFFSET;

        while offset < self.region.len() {
            let block = Block::from_payload(NonNull::new_unchecked(
                self.base().as_ptr().add(offset),
            ));
            blocks.push((block.size(), block.is_allocated()));
            offset += block.size() as usize;
        }

        blocks
    }

    /// Sizes of all listed free blocks, grouped by class from the largest
    /// class index (smallest sizes) down.
    #[cfg(test)]
    pub(crate) unsafe fn free_block_sizes(&self) -> Vec<u32> {
        use crate::freelist::LAST_CLASS;

        let mut sizes = Vec::new();
        for class in (FIRST_CLASS..=LAST_CLASS).rev() {
            sizes.extend(self.lists.class_sizes(class));
        }
        sizes
    }
}
