//! Buddy arithmetic and the split/merge passes.
//!
//! Every block is aligned, as an offset from the region base, to its own
//! size. The buddy of a block is therefore the block whose offset differs
//! only in the bit equal to the block size.

use crate::{BackingAllocator, Heap, MIN_BLOCK_SIZE};

/// Returns the offset of the buddy of the block of `size` bytes at `ofs`.
///
/// The result may lie outside the region; callers must bounds-check it.
#[inline]
pub fn buddy_of(ofs: usize, size: usize) -> usize {
    debug_assert!(size.is_power_of_two());
    debug_assert_eq!(ofs % size, 0);

    ofs ^ size
}

/// Returns every block size a region of `region_size` bytes can hold, from
/// `MIN_BLOCK_SIZE` up to the region itself.
#[inline]
pub fn levels(region_size: usize) -> impl Iterator<Item = usize> {
    debug_assert!(region_size.is_power_of_two());

    (MIN_BLOCK_SIZE.trailing_zeros()..=region_size.trailing_zeros()).map(|shift| 1 << shift)
}

impl<A: BackingAllocator> Heap<A> {
    /// Finds the first free block that can hold `total` bytes and splits it
    /// down to the smallest power of two that still does.
    ///
    /// The block stays in the free list; returns its offset.
    pub(crate) fn find_free_block(&mut self, total: usize) -> Option<usize> {
        let base = self.base();
        let mut current = self.free_list().head(base);

        while let Some(cur) = current {
            // SAFETY: `cur` is in the free list.
            if unsafe { base.block_size(cur) } >= total {
                return Some(unsafe { self.try_split(cur, total) });
            }

            current = unsafe { self.free_list().next_of(base, cur) };
        }

        None
    }

    /// Halves the free block at `block` while its halves can still hold
    /// `target` bytes.
    ///
    /// Each upper half becomes a free block of its own, linked directly after
    /// `block`. Returns `block`.
    ///
    /// # Safety
    ///
    /// `block` must be in the free list.
    pub(crate) unsafe fn try_split(&mut self, block: usize, target: usize) -> usize {
        let base = self.base();
        let mut size = unsafe { base.block_size(block) };

        while size / 2 >= target {
            size /= 2;
            let upper = block + size;

            unsafe {
                base.header_mut(block).size = size;
                self.free_list_mut().insert_after(base, block, upper, size);
            }
        }

        block
    }

    /// Coalesces the free block at `block` with its buddy, repeatedly, until
    /// the buddy is allocated, split further, or outside the region.
    ///
    /// Returns the offset of the resulting block.
    ///
    /// # Safety
    ///
    /// `block` must be in the free list.
    pub(crate) unsafe fn try_merge(&mut self, mut block: usize) -> usize {
        let base = self.base();

        loop {
            let size = unsafe { base.block_size(block) };
            if size >= base.extent() {
                break;
            }

            let buddy = buddy_of(block, size);
            if !base.contains_ofs(buddy) {
                break;
            }

            // The buddy's header may be inside a caller's allocation unless
            // the presence index says otherwise; only then is its size read.
            if !self.free_list().is_present(buddy) || unsafe { base.block_size(buddy) } != size {
                break;
            }

            let (survivor, absorbed) = if block < buddy {
                (block, buddy)
            } else {
                (buddy, block)
            };

            unsafe {
                self.free_list_mut().unlink(base, absorbed);
                base.header_mut(survivor).size = size * 2;
            }

            block = survivor;
        }

        block
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::prelude::rust_2021::*;

    use super::*;
    use crate::{FreeBlock, Global, HEADER_SIZE};

    #[test]
    fn buddy_of_flips_the_size_bit() {
        assert_eq!(buddy_of(0, 512), 512);
        assert_eq!(buddy_of(512, 512), 0);
        assert_eq!(buddy_of(256, 128), 384);
        assert_eq!(buddy_of(384, 128), 256);
        // The full region's "buddy" is outside of it.
        assert_eq!(buddy_of(0, 1024), 1024);
    }

    #[test]
    fn levels_span_min_block_to_region() {
        let sizes: Vec<_> = levels(256).collect();
        assert_eq!(sizes.first(), Some(&MIN_BLOCK_SIZE));
        assert_eq!(sizes.last(), Some(&256));
        assert!(sizes.windows(2).all(|w| w[1] == 2 * w[0]));

        assert_eq!(levels(MIN_BLOCK_SIZE).collect::<Vec<_>>(), [MIN_BLOCK_SIZE]);

        // The largest representable region ends the walk without overflowing.
        let top = 1 << (usize::BITS - 1);
        assert_eq!(levels(top).last(), Some(top));
    }

    #[test]
    fn split_links_upper_halves_after_block() {
        let mut heap = Heap::try_new(1024).unwrap();

        let block = heap.find_free_block(100 + HEADER_SIZE).unwrap();
        assert_eq!(block, 0);

        let blocks: Vec<_> = heap.free_blocks().collect();
        assert_eq!(
            blocks,
            [
                FreeBlock { offset: 0, size: 128 },
                FreeBlock { offset: 128, size: 128 },
                FreeBlock { offset: 256, size: 256 },
                FreeBlock { offset: 512, size: 512 },
            ]
        );
        for ofs in [0, 128, 256, 512] {
            assert!(heap.free_list().is_present(ofs));
        }
        assert_eq!(heap.free_list().presence().count(), 4);
    }

    #[test]
    fn split_stops_at_min_block() {
        let mut heap = Heap::try_new(1024).unwrap();

        let block = heap.find_free_block(HEADER_SIZE).unwrap();
        assert_eq!(heap.free_blocks().next().unwrap().size, MIN_BLOCK_SIZE);

        // Merging straight back restores the single block.
        let merged = unsafe { heap.try_merge(block) };
        assert_eq!(merged, 0);
        assert_eq!(
            heap.free_blocks().collect::<Vec<_>>(),
            [FreeBlock { offset: 0, size: 1024 }]
        );
        heap.assert_invariants();
    }

    #[test]
    fn merge_stops_at_allocated_buddy() {
        let mut heap: Heap<Global> = Heap::try_new(1024).unwrap();

        let a = heap.allocate(100).unwrap();
        let b = heap.allocate(100).unwrap();

        unsafe { heap.release(b).unwrap() };

        // `a` is still allocated, so the 128-byte block at 128 cannot merge.
        assert!(heap
            .free_blocks()
            .any(|blk| blk == FreeBlock { offset: 128, size: 128 }));
        heap.assert_invariants();

        unsafe { heap.release(a).unwrap() };
        assert_eq!(
            heap.free_blocks().collect::<Vec<_>>(),
            [FreeBlock { offset: 0, size: 1024 }]
        );
    }

    #[test]
    fn merge_stops_at_split_buddy() {
        let mut heap = Heap::try_new(1024).unwrap();

        // Carve the region into 128 | 128 | 256 | 512 and hold the first two.
        let a = heap.allocate(100).unwrap();
        let b = heap.allocate(100).unwrap();
        // Split the 256 buddy of the `a`/`b` pair into two 128s; hold one.
        let c = heap.allocate(100).unwrap();

        unsafe {
            heap.release(a).unwrap();
            heap.release(b).unwrap();
        }

        // The pair merged to 256 at 0, but its buddy at 256 is split.
        let blocks: Vec<_> = heap.free_blocks().collect();
        assert!(blocks.contains(&FreeBlock { offset: 0, size: 256 }));
        assert!(blocks.contains(&FreeBlock { offset: 384, size: 128 }));
        heap.assert_invariants();

        unsafe { heap.release(c).unwrap() };
        assert_eq!(
            heap.free_blocks().collect::<Vec<_>>(),
            [FreeBlock { offset: 0, size: 1024 }]
        );
    }
}
