// =============================================================================
// EmberRT — Heap Block Header
// =============================================================================
//
// Every heap block — free or allocated — is prefixed by a `BlockHeader`.
// The header packs three pieces of state into two machine words:
//
//   ┌─────────────────────┐
//   │ link: usize         │ ← free-list link / end-of-list / ownership marker
//   │ size: BlockSize     │ ← total block size, MSB = "allocated" flag
//   │ (head_canary)       │ ← only with the memory-error-detection feature
//   ├─────────────────────┤
//   │ ... payload ...     │
//   └─────────────────────┘
//
// LINK ENCODING:
//   The link word serves three roles: pointer to the next free block,
//   end-of-list marker, and "this block is allocated" marker. The raw word
//   stays private and all access goes through the `Link` sum type:
//
//     aligned non-zero address → Link::Next   (free block, in the list)
//     0                        → Link::End    (the end sentinel terminator)
//     usize::MAX               → Link::Owned  (allocated, owned by a caller)
//     usize::MAX - 1           → Link::Reserved (one-shot reserved carve)
//
//   The marker values are never valid header addresses because headers are
//   always aligned to `PLATFORM_ALIGNMENT`.
//
// SIZE ENCODING:
//   The most-significant bit of the size word is the allocated flag; the
//   remaining bits are the true size in bytes (header included). `BlockSize`
//   is a newtype so no caller can read the raw word and forget to mask.
//   A side effect is that no allocation larger than half the address space
//   is representable — requests that large are rejected up front.
//
// =============================================================================

use core::ptr::NonNull;

// =============================================================================
// Platform layout constants
// =============================================================================

/// Alignment of every header address and every block size.
/// 16 bytes on 64-bit targets (ARM64), 8 bytes on 32-bit targets (ARM).
pub const PLATFORM_ALIGNMENT: usize = 2 * core::mem::size_of::<usize>();

/// Low-bit mask corresponding to [`PLATFORM_ALIGNMENT`].
pub const PLATFORM_ALIGNMENT_MASK: usize = PLATFORM_ALIGNMENT - 1;

/// One machine word in bytes. The tail canary occupies exactly one word.
pub const WORD_SIZE: usize = core::mem::size_of::<usize>();

/// Size of the header prefix, rounded up to the platform alignment.
///
/// Without error detection this is exactly two words; with it, the extra
/// canary word widens the header to the next alignment boundary.
pub const HEADER_SIZE: usize =
    (core::mem::size_of::<BlockHeader>() + PLATFORM_ALIGNMENT_MASK) & !PLATFORM_ALIGNMENT_MASK;

/// Blocks smaller than this are never created by splitting: the remainder
/// stays attached to the allocation instead.
pub const MIN_BLOCK_SIZE: usize = HEADER_SIZE * 2;

/// The MSB of the size word. Set when the block is owned by the application.
pub const ALLOCATED_BIT: usize = 1 << (usize::BITS - 1);

/// Link-word marker for an allocated block (see module docs).
const LINK_OWNED: usize = usize::MAX;

/// Link-word marker for a reserved (non-freeable) carve.
const LINK_RESERVED: usize = usize::MAX - 1;

/// Fixed pattern written into the `head_canary` word of every header.
#[cfg(feature = "memory-error-detection")]
pub const HEAD_CANARY_PATTERN: usize = 0x5051_5253_5455_5657_u64 as usize;

/// Fixed pattern written into the last word of every allocated block.
#[cfg(feature = "memory-error-detection")]
pub const TAIL_CANARY_PATTERN: usize = 0x6061_6263_6465_6667_u64 as usize;

/// Aligns `value` up to the nearest multiple of [`PLATFORM_ALIGNMENT`].
#[inline]
pub const fn align_up(value: usize) -> usize {
    (value + PLATFORM_ALIGNMENT_MASK) & !PLATFORM_ALIGNMENT_MASK
}

/// Aligns `value` down to the nearest multiple of [`PLATFORM_ALIGNMENT`].
#[inline]
pub const fn align_down(value: usize) -> usize {
    value & !PLATFORM_ALIGNMENT_MASK
}

// =============================================================================
// Link — decoded state of the header link word
// =============================================================================

/// Decoded value of a header's link word.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Link {
    /// Free block: address of the next free block in ascending address order.
    Next(NonNull<BlockHeader>),
    /// The end sentinel terminates the list; nothing follows it.
    End,
    /// Allocated block, owned by the caller that received it.
    Owned,
    /// Reserved carve. Never re-enters the free list; `free` rejects it.
    Reserved,
}

// =============================================================================
// BlockSize — size word with the allocated flag packed into the MSB
// =============================================================================

/// The size word of a block header.
///
/// Total size in bytes including the header, with the allocated flag stored
/// in the most-significant bit. The raw word is never exposed; use
/// [`bytes`](Self::bytes) and [`is_allocated`](Self::is_allocated).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct BlockSize(usize);

impl BlockSize {
    /// Creates a size word for a free block of `bytes` total bytes.
    ///
    /// # Panics
    /// Debug-asserts that the allocated bit is clear in `bytes`.
    #[inline]
    pub const fn free(bytes: usize) -> Self {
        debug_assert!(bytes & ALLOCATED_BIT == 0, "block size overflows into the allocated bit");
        Self(bytes)
    }

    /// The true size in bytes, with the allocated flag masked off.
    #[inline]
    pub const fn bytes(self) -> usize {
        self.0 & !ALLOCATED_BIT
    }

    /// Whether the allocated flag is set.
    #[inline]
    pub const fn is_allocated(self) -> bool {
        self.0 & ALLOCATED_BIT != 0
    }

    /// Returns this size with the allocated flag set.
    #[inline]
    pub const fn allocated(self) -> Self {
        Self(self.0 | ALLOCATED_BIT)
    }

    /// Returns this size with the allocated flag cleared.
    #[inline]
    pub const fn freed(self) -> Self {
        Self(self.0 & !ALLOCATED_BIT)
    }
}

// =============================================================================
// BlockHeader
// =============================================================================

/// Bookkeeping prefix at the start of every heap block.
///
/// Headers live inside the donated regions at `PLATFORM_ALIGNMENT`-aligned
/// addresses, except for the list-head sentinel which is a plain struct
/// inside the [`Heap`](super::free_list::Heap) (nothing ever points at it,
/// so its address does not matter).
#[repr(C)]
pub struct BlockHeader {
    /// Raw link word; decode through [`link`](Self::link).
    link: usize,
    /// Total block size including this header; MSB is the allocated flag.
    pub size: BlockSize,
    /// Redzone pattern guarding the header against underflow writes.
    #[cfg(feature = "memory-error-detection")]
    pub head_canary: usize,
}

impl BlockHeader {
    /// A detached header: not linked anywhere, size zero.
    pub const fn detached() -> Self {
        Self {
            link: 0,
            size: BlockSize::free(0),
            #[cfg(feature = "memory-error-detection")]
            head_canary: HEAD_CANARY_PATTERN,
        }
    }

    /// Decodes the link word.
    #[inline]
    pub fn link(&self) -> Link {
        match self.link {
            0 => Link::End,
            LINK_OWNED => Link::Owned,
            LINK_RESERVED => Link::Reserved,
            // SAFETY: addr is non-zero (the zero case is matched above).
            addr => Link::Next(unsafe { NonNull::new_unchecked(addr as *mut BlockHeader) }),
        }
    }

    /// Points this header at the next free block in the list.
    #[inline]
    pub fn set_next(&mut self, next: NonNull<BlockHeader>) {
        self.link = next.as_ptr() as usize;
    }

    /// Marks this header as the end-of-list terminator.
    #[inline]
    pub fn set_end(&mut self) {
        self.link = 0;
    }

    /// Marks this block as allocated and owned by the caller.
    #[inline]
    pub fn set_owned(&mut self) {
        self.link = LINK_OWNED;
    }

    /// Marks this block as a reserved, non-freeable carve.
    #[inline]
    pub fn set_reserved(&mut self) {
        self.link = LINK_RESERVED;
    }

    /// Copies another header's link word verbatim. Used when splicing a
    /// block out of the list or when a carved header takes over its donor's
    /// position in the chain.
    #[inline]
    pub fn inherit_link(&mut self, other: &BlockHeader) {
        self.link = other.link;
    }

    /// The address of the first free block the list head points at, as a raw
    /// integer. Used only for the ordered-insert address comparison.
    #[inline]
    pub fn link_addr(&self) -> usize {
        self.link
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_aligned_and_at_least_two_words() {
        assert_eq!(HEADER_SIZE % PLATFORM_ALIGNMENT, 0);
        assert!(HEADER_SIZE >= 2 * WORD_SIZE);
        assert_eq!(MIN_BLOCK_SIZE, 2 * HEADER_SIZE);
    }

    #[test]
    fn size_word_masks_the_allocated_flag() {
        let size = BlockSize::free(0x40);
        assert_eq!(size.bytes(), 0x40);
        assert!(!size.is_allocated());

        let taken = size.allocated();
        assert_eq!(taken.bytes(), 0x40);
        assert!(taken.is_allocated());
        assert_eq!(taken.freed(), size);
    }

    #[test]
    fn link_markers_round_trip() {
        let mut header = BlockHeader::detached();
        assert_eq!(header.link(), Link::End);

        header.set_owned();
        assert_eq!(header.link(), Link::Owned);

        header.set_reserved();
        assert_eq!(header.link(), Link::Reserved);

        let mut other = BlockHeader::detached();
        let target = NonNull::from(&mut other);
        header.set_next(target);
        assert_eq!(header.link(), Link::Next(target));
    }
}
