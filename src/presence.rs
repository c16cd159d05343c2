//! The presence index: which offsets currently begin a free block.
//!
//! A buddy's header may sit in memory that is allocated to a caller, so the
//! heap never reads a candidate buddy's header until this index says the
//! buddy is free.

use core::alloc::Layout;

use crate::{base::MIN_BLOCK_SIZE, bitmap::Bitmap};

/// One flag per `MIN_BLOCK_SIZE` granule of the region.
///
/// Block headers only ever start on granule boundaries, so keying by
/// `offset / MIN_BLOCK_SIZE` loses nothing over a per-byte table.
pub struct PresenceIndex {
    bits: Bitmap,
}

impl PresenceIndex {
    /// Returns the layout of the storage needed to index a region of
    /// `region_size` bytes.
    pub fn layout(region_size: usize) -> Layout {
        Bitmap::map_layout(Self::num_granules(region_size))
    }

    fn num_granules(region_size: usize) -> usize {
        region_size / MIN_BLOCK_SIZE
    }

    /// Creates an index with every flag clear.
    ///
    /// # Safety
    ///
    /// `map` must satisfy `Self::layout(region_size)`, be valid for reads and
    /// writes for its full size, and not be accessed through any other path
    /// while the index is live.
    pub unsafe fn new(region_size: usize, map: *mut u64) -> PresenceIndex {
        PresenceIndex {
            bits: unsafe { Bitmap::new(Self::num_granules(region_size), map) },
        }
    }

    #[inline]
    fn granule(ofs: usize) -> usize {
        debug_assert_eq!(ofs % MIN_BLOCK_SIZE, 0, "offset {ofs:#x} is not a block boundary");
        ofs / MIN_BLOCK_SIZE
    }

    /// Sets the presence flag of the block at `ofs`.
    #[inline]
    pub fn mark(&mut self, ofs: usize, present: bool) {
        self.bits.set(Self::granule(ofs), present);
    }

    /// Returns `true` if a free block begins at `ofs`.
    #[inline]
    pub fn is_present(&self, ofs: usize) -> bool {
        self.bits.get(Self::granule(ofs))
    }

    pub fn clear(&mut self) {
        self.bits.clear();
    }

    /// Returns the number of offsets currently marked present.
    #[cfg(test)]
    pub fn count(&self) -> usize {
        self.bits.count_ones()
    }
}
