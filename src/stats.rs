//! Introspection of the free list.

use core::fmt;

use crate::{base::BasePtr, free_list::FreeList};

/// A block on the free list.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct FreeBlock {
    /// Offset of the block header from the start of the region.
    pub offset: usize,
    /// Size of the block in bytes, header included.
    pub size: usize,
}

/// An iterator over the free list of a [`Heap`], in list order.
///
/// List order is most-recently-freed first; it is not sorted by address or
/// size.
///
/// [`Heap`]: crate::Heap
#[derive(Clone)]
pub struct FreeBlocks<'a> {
    base: BasePtr,
    free_list: &'a FreeList,
    current: Option<usize>,
}

impl<'a> FreeBlocks<'a> {
    pub(crate) fn new(base: BasePtr, free_list: &'a FreeList) -> FreeBlocks<'a> {
        FreeBlocks {
            base,
            free_list,
            current: free_list.head(base),
        }
    }
}

impl Iterator for FreeBlocks<'_> {
    type Item = FreeBlock;

    fn next(&mut self) -> Option<FreeBlock> {
        let offset = self.current?;

        // SAFETY: `offset` was reached by walking the free list, which cannot
        // change while it is borrowed.
        unsafe {
            self.current = self.free_list.next_of(self.base, offset);

            Some(FreeBlock {
                offset,
                size: self.base.block_size(offset),
            })
        }
    }
}

impl fmt::Debug for FreeBlocks<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.clone()).finish()
    }
}

/// Aggregate statistics over the free list.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// The number of free blocks.
    pub free_blocks: usize,
    /// The total size of all free blocks, headers included.
    pub free_bytes: usize,
    /// The size of the smallest free block, if there is one.
    pub min_block: Option<usize>,
    /// The size of the largest free block, if there is one.
    pub max_block: Option<usize>,
}

impl FromIterator<FreeBlock> for HeapStats {
    fn from_iter<I: IntoIterator<Item = FreeBlock>>(iter: I) -> HeapStats {
        iter.into_iter()
            .fold(HeapStats::default(), |stats, block| HeapStats {
                free_blocks: stats.free_blocks + 1,
                free_bytes: stats.free_bytes + block.size,
                min_block: Some(stats.min_block.map_or(block.size, |m| m.min(block.size))),
                max_block: Some(stats.max_block.map_or(block.size, |m| m.max(block.size))),
            })
    }
}

impl fmt::Display for HeapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Free blocks:     {}", self.free_blocks)?;
        writeln!(f, "Free bytes:      0x{:x}", self.free_bytes)?;
        match (self.min_block, self.max_block) {
            (Some(min), Some(max)) => {
                writeln!(f, "Min block size:  0x{:x}", min)?;
                writeln!(f, "Max block size:  0x{:x}", max)
            }
            _ => writeln!(f, "Min block size:  -\nMax block size:  -"),
        }
    }
}

/// A printable listing of a heap's free list followed by its [`HeapStats`].
#[derive(Clone, Debug)]
pub struct Report<'a> {
    blocks: FreeBlocks<'a>,
}

impl<'a> Report<'a> {
    pub(crate) fn new(blocks: FreeBlocks<'a>) -> Report<'a> {
        Report { blocks }
    }
}

impl fmt::Display for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const TITLE: &str = "Heap";

        writeln!(f, "{TITLE}")?;
        TITLE.chars().try_for_each(|_| write!(f, "~"))?;
        writeln!(f)?;

        for block in self.blocks.clone() {
            writeln!(f, "Block at 0x{:x}, size 0x{:x}", block.offset, block.size)?;
        }

        write!(f, "{}", self.blocks.clone().collect::<HeapStats>())?;

        TITLE.chars().try_for_each(|_| write!(f, "~"))?;
        writeln!(f)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use std::{format, prelude::rust_2021::*};

    use super::*;
    use crate::Heap;

    #[test]
    fn stats_of_nothing() {
        let stats: HeapStats = core::iter::empty().collect();

        assert_eq!(stats, HeapStats::default());
        assert!(format!("{stats}").contains("Min block size:  -"));
    }

    #[test]
    fn stats_fold_blocks() {
        let stats: HeapStats = [
            FreeBlock { offset: 0, size: 64 },
            FreeBlock { offset: 256, size: 256 },
            FreeBlock { offset: 64, size: 64 },
        ]
        .into_iter()
        .collect();

        assert_eq!(
            stats,
            HeapStats {
                free_blocks: 3,
                free_bytes: 384,
                min_block: Some(64),
                max_block: Some(256),
            }
        );
    }

    #[test]
    fn report_lists_blocks_in_list_order() {
        let mut heap = Heap::try_new(1024).unwrap();
        let _a = heap.allocate(100).unwrap();

        let report = format!("{}", heap.report());
        let lines: Vec<&str> = report.lines().collect();

        assert_eq!(lines[0], "Heap");
        assert_eq!(lines[2], "Block at 0x80, size 0x80");
        assert_eq!(lines[3], "Block at 0x100, size 0x100");
        assert_eq!(lines[4], "Block at 0x200, size 0x200");
        assert_eq!(lines[5], "Free blocks:     3");
        assert_eq!(lines[6], "Free bytes:      0x380");
    }
}
