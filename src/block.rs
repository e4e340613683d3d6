use std::ptr::NonNull;

use crate::header::{Tag, WORD_SIZE};

/// Smallest block we ever create: a 4-byte header, the two 4-byte list
/// links a free block stores in its payload, and a 4-byte footer, rounded
/// up to the 8-byte alignment unit.
pub(crate) const MIN_BLOCK_SIZE: u32 = 16;

/// A view over one block of the heap, identified by its payload address,
/// which is the address handed to the caller. The header sits in the 4
/// bytes right before the payload and the footer, present only while the
/// block is free, occupies the last 4 bytes of the block:
///
/// ```text
///        +-----------------------+
///   ^    |  size         | flags |  <- header, Tag word.
///   |    +-----------------------+  <- payload address, aligned to 8.
///   |    |      prev offset      |     This is what malloc returns.
///   |    +-----------------------+
/// size   |      next offset      |
///   |    +-----------------------+
///   |    |          ...          |
///   |    +-----------------------+
///   v    |  size (footer)        |  <- only meaningful while free.
///        +-----------------------+
/// ```
///
/// While a block is allocated the link words and the footer are plain
/// payload bytes owned by the caller. The footer exists so that a block
/// being freed can locate the header of a free physical predecessor in
/// O(1); when the predecessor is allocated there is no footer to read,
/// which is why every header caches the predecessor's state in its
/// prev-allocated bit.
///
/// `Block` is a raw cursor over heap memory. Every method is unsafe
/// because nothing ties the lifetime of the view to the heap it points
/// into; the allocator guarantees validity by only constructing blocks
/// from addresses inside its own region.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Block(NonNull<u8>);

impl Block {
    /// Builds a view from a payload address.
    ///
    /// # Safety
    ///
    /// `payload` must point 4 bytes past a live header inside the heap
    /// region. For pointers coming back from the caller this holds as long
    /// as the pointer was previously returned by the allocator.
    #[inline]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        debug_assert_eq!(payload.as_ptr() as usize % 8, 0);
        Self(payload)
    }

    #[inline]
    pub fn payload(self) -> NonNull<u8> {
        self.0
    }

    #[inline]
    unsafe fn header_ptr(self) -> *mut u32 {
        self.0.as_ptr().sub(WORD_SIZE).cast()
    }

    #[inline]
    unsafe fn footer_ptr(self, size: u32) -> *mut u32 {
        self.0.as_ptr().add(size as usize - 2 * WORD_SIZE).cast()
    }

    #[inline]
    pub unsafe fn tag(self) -> Tag {
        Tag::from_bits(self.header_ptr().read())
    }

    #[inline]
    pub unsafe fn set_tag(self, tag: Tag) {
        self.header_ptr().write(tag.bits());
    }

    #[inline]
    pub unsafe fn size(self) -> u32 {
        self.tag().size()
    }

    #[inline]
    pub unsafe fn is_allocated(self) -> bool {
        self.tag().is_allocated()
    }

    #[inline]
    pub unsafe fn is_prev_allocated(self) -> bool {
        self.tag().is_prev_allocated()
    }

    #[inline]
    pub unsafe fn mark_allocated(self) {
        self.set_tag(self.tag().allocated());
    }

    #[inline]
    pub unsafe fn mark_free(self) {
        self.set_tag(self.tag().freed());
    }

    #[inline]
    pub unsafe fn set_prev_allocated(self) {
        self.set_tag(self.tag().prev_allocated());
    }

    #[inline]
    pub unsafe fn clear_prev_allocated(self) {
        self.set_tag(self.tag().prev_freed());
    }

    /// The footer word of a free block.
    ///
    /// # Safety
    ///
    /// The block must be free, otherwise the footer bytes belong to the
    /// caller's payload and hold arbitrary data.
    #[inline]
    pub unsafe fn footer(self) -> u32 {
        self.footer_ptr(self.size()).read()
    }

    /// Resizes the block, updating both header and footer and preserving
    /// the flag bits. This is the resize used for free blocks; the footer
    /// must land inside the block, so `size` must already be the final
    /// extent.
    #[inline]
    pub unsafe fn set_size(self, size: u32) {
        self.set_tag(self.tag().with_size(size));
        self.footer_ptr(size).write(size);
    }

    /// Resizes the block touching only the header. Used when the block is
    /// (or is becoming) allocated and the footer bytes are payload.
    #[inline]
    pub unsafe fn set_size_header_only(self, size: u32) {
        self.set_tag(self.tag().with_size(size));
    }

    /// Writes a complete free-block frame: fresh header with the given
    /// prev-allocated state plus matching footer. Any previous contents of
    /// the header are discarded, which is what a newly carved block needs
    /// since its header bytes are whatever the memory held before.
    #[inline]
    pub unsafe fn write_free(self, size: u32, prev_allocated: bool) {
        let tag = Tag::new(size);
        let tag = if prev_allocated { tag.prev_allocated() } else { tag };
        self.set_tag(tag);
        self.footer_ptr(size).write(size);
    }

    /// The physically next block. Always exists: the heap ends with a
    /// zero-size allocated terminal header.
    #[inline]
    pub unsafe fn next(self) -> Block {
        Block(NonNull::new_unchecked(
            self.0.as_ptr().add(self.size() as usize),
        ))
    }

    /// The physically previous block, located through its footer.
    ///
    /// # Safety
    ///
    /// Only valid when this block's prev-allocated bit is clear; an
    /// allocated predecessor has no footer.
    #[inline]
    pub unsafe fn prev_free(self) -> Block {
        let prev_size = self.0.as_ptr().sub(2 * WORD_SIZE).cast::<u32>().read();
        Block(NonNull::new_unchecked(
            self.0.as_ptr().sub(prev_size as usize),
        ))
    }
}
