use std::ptr::NonNull;

use crate::block::Block;
use crate::header::WORD_SIZE;

/// Size classes are indexed by the number of leading zeros of the block
/// size, viewed as a 32-bit integer. The smallest blocks (16 bytes) have
/// 27 leading zeros and the classes get exponentially larger from there.
pub(crate) const FIRST_CLASS: u32 = 12;
pub(crate) const LAST_CLASS: u32 = 27;

/// Number of size classes.
pub(crate) const CLASS_COUNT: usize = (LAST_CLASS - FIRST_CLASS + 1) as usize;

/// Bytes reserved at the very start of the heap for the class sentinels,
/// one 8-byte node per class.
pub(crate) const SENTINEL_AREA_SIZE: usize = CLASS_COUNT * 8;

/// The segregated free lists. One circular doubly linked list per size
/// class, each anchored by a sentinel node stored in the reserved prefix
/// of the heap itself:
///
/// ```text
///  heap base
///  |
///  v
///  +----------+----------+- - - - - -+----------+--------+-------------
///  | sentinel | sentinel |    ...    | sentinel |  gap   | first block
///  | class 27 | class 26 |           | class 12 |        |     ...
///  +----------+----------+- - - - - -+----------+--------+-------------
///  0          8          16          120        128      136
/// ```
///
/// A node is 8 bytes: a `prev` offset word followed by a `next` offset
/// word. Free blocks store their node in the first 8 bytes of their
/// payload, so a sentinel and a free block look identical to the link
/// operations. Links are 32-bit offsets from the heap base rather than
/// addresses; the heap never exceeds what 32 bits can address, and
/// offsets keep the node format at 8 bytes, which is what makes the
/// 16-byte minimum block possible.
///
/// An empty list is a sentinel whose `next` offset points back at itself:
///
/// ```text
///      +------+------+        +-------------+       +-------------+
///   +->| prev | next |--+     |  sentinel   |--+    | free block  |--+
///   |  +------+------+  |     +-------------+  |    +-------------+  |
///   +--------+----------+         ^  ^         |        ^    |       |
///                                 |  +---------|--------+    |       |
///            empty class          |            +-------------+       |
///                                 +----------------------------------+
///                                          class with one block
/// ```
///
/// Insertion appends right before the sentinel, so the list is walked
/// oldest first. Both `insert` and `unlink` are O(1); the class index is
/// a single count-leading-zeros, no scanning involved.
///
/// Sentinels are never inspected as blocks. They have no header and no
/// flags, they exist purely as list endpoints, which removes every branch
/// on "is the list empty" from the link operations.
#[derive(Clone, Copy)]
pub(crate) struct SegregatedLists {
    base: NonNull<u8>,
}

impl SegregatedLists {
    pub fn new(base: NonNull<u8>) -> Self {
        debug_assert_eq!(base.as_ptr() as usize % 8, 0);
        Self { base }
    }

    /// The class a block of `size` bytes belongs to. Sizes of a megabyte
    /// and beyond have fewer than [`FIRST_CLASS`] leading zeros and all
    /// share the catch-all class; the upper clamp can never fire for
    /// sizes of at least 16 bytes but costs nothing.
    #[inline]
    pub fn class_of(size: u32) -> u32 {
        size.leading_zeros().clamp(FIRST_CLASS, LAST_CLASS)
    }

    /// Nominal `[min, max)` size bounds of a class. The catch-all class
    /// has no real upper bound.
    pub fn class_bounds(class: u32) -> (u32, u32) {
        debug_assert!((FIRST_CLASS..=LAST_CLASS).contains(&class));
        let min = 1 << (31 - class);
        let max = if class == FIRST_CLASS {
            u32::MAX
        } else {
            1 << (32 - class)
        };
        (min, max)
    }

    /// Writes all sentinels as empty lists pointing back at themselves.
    ///
    /// # Safety
    ///
    /// The first [`SENTINEL_AREA_SIZE`] bytes after the base must be
    /// writable and not yet holding any block.
    pub unsafe fn init(self) {
        for class in FIRST_CLASS..=LAST_CLASS {
            let sentinel = self.sentinel(class);
            self.set_prev(sentinel, sentinel);
            self.set_next(sentinel, sentinel);
        }
    }

    /// Address of the sentinel node for `class`. Class [`LAST_CLASS`]
    /// (the smallest sizes) sits at the base; the catch-all sits last.
    #[inline]
    pub unsafe fn sentinel(self, class: u32) -> NonNull<u8> {
        debug_assert!((FIRST_CLASS..=LAST_CLASS).contains(&class));
        self.node_at(((LAST_CLASS - class) * 8) as u32)
    }

    #[inline]
    pub fn offset_of(self, node: NonNull<u8>) -> u32 {
        (node.as_ptr() as usize - self.base.as_ptr() as usize) as u32
    }

    #[inline]
    unsafe fn node_at(self, offset: u32) -> NonNull<u8> {
        NonNull::new_unchecked(self.base.as_ptr().add(offset as usize))
    }

    #[inline]
    pub unsafe fn prev_of(self, node: NonNull<u8>) -> NonNull<u8> {
        self.node_at(node.as_ptr().cast::<u32>().read())
    }

    #[inline]
    pub unsafe fn next_of(self, node: NonNull<u8>) -> NonNull<u8> {
        self.node_at(node.as_ptr().add(WORD_SIZE).cast::<u32>().read())
    }

    #[inline]
    unsafe fn set_prev(self, node: NonNull<u8>, to: NonNull<u8>) {
        node.as_ptr().cast::<u32>().write(self.offset_of(to));
    }

    #[inline]
    unsafe fn set_next(self, node: NonNull<u8>, to: NonNull<u8>) {
        node.as_ptr()
            .add(WORD_SIZE)
            .cast::<u32>()
            .write(self.offset_of(to));
    }

    /// Links a free block into the list of its size class, right before
    /// the sentinel.
    ///
    /// # Safety
    ///
    /// `block` must be a free block with a valid header that is not
    /// currently in any list, otherwise the links of its old neighbors
    /// are left dangling.
    pub unsafe fn insert(self, block: Block) {
        let node = block.payload();
        let end = self.sentinel(Self::class_of(block.size()));
        let prev = self.prev_of(end);

        self.set_prev(end, node);
        self.set_prev(node, prev);
        self.set_next(node, end);
        self.set_next(prev, node);
    }

    /// Unlinks a block from whatever list it is in, through its own
    /// stored prev and next offsets.
    ///
    /// # Safety
    ///
    /// `block` must currently be linked into a list.
    pub unsafe fn unlink(self, block: Block) {
        let node = block.payload();
        let prev = self.prev_of(node);
        let next = self.next_of(node);

        self.set_next(prev, next);
        self.set_prev(next, prev);
    }

    /// Sizes of the blocks in one class, in list order.
    #[cfg(test)]
    pub unsafe fn class_sizes(self, class: u32) -> Vec<u32> {
        let mut sizes = Vec::new();
        let end = self.sentinel(class);
        let mut node = self.next_of(end);
        while node != end {
            sizes.push(Block::from_payload(node).size());
            node = self.next_of(node);
        }
        sizes
    }
}
