//! The unsynchronized heap.

use core::{alloc::Layout, fmt, mem, num::NonZeroUsize, ptr::NonNull};

use crate::{
    base::{BasePtr, BlockHeader, HEADER_SIZE, MIN_BLOCK_SIZE},
    buddy::levels,
    free_list::FreeList,
    polyfill::NonNullStrict,
    presence::PresenceIndex,
    stats::{FreeBlocks, HeapStats, Report},
    AllocInitError, BackingAllocator, HeapError, Raw,
};

#[cfg(any(feature = "alloc", test))]
use crate::Global;

/// The byte pattern written over the payload of every released block.
pub const JUNK: u8 = 0x01;

/// The alignment of every pointer returned by [`Heap::allocate`].
pub const PAYLOAD_ALIGN: usize = mem::align_of::<BlockHeader>();

/// A binary-buddy heap over a single power-of-two region.
///
/// The heap starts out as one free block spanning the whole region. Requests
/// are served first-fit from the free list, splitting the first block that is
/// large enough down to the smallest power of two holding the request plus
/// its [`HEADER_SIZE`]-byte header. Released blocks are coalesced with their
/// buddies as far as possible.
///
/// `Heap` performs no locking; wrap it in a [`LockedHeap`] to share it.
///
/// [`LockedHeap`]: crate::LockedHeap
pub struct Heap<A: BackingAllocator = Raw> {
    /// Pointer to the region managed by this heap.
    base: BasePtr,
    /// Pointer to the region that backs the presence index.
    ///
    /// This must not be used while the heap exists; it is stored solely so
    /// that it may be returned to the backing allocator.
    metadata: NonNull<u8>,
    free_list: FreeList,
    backing_allocator: A,
}

// SAFETY: the heap exclusively owns its region and metadata; the raw pointers
// it holds are never shared outside of `&mut self` methods.
unsafe impl<A: BackingAllocator + Send> Send for Heap<A> {}

impl Heap<Raw> {
    /// Constructs a heap over the region `start..end`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if `end - start` is not a
    /// power of two of at least [`MIN_BLOCK_SIZE`] bytes, or if `start` or
    /// `metadata` is insufficiently aligned.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `start..end` must be valid for reads and writes, and owned
    ///   exclusively by the returned heap for as long as it exists.
    /// - `metadata` must be a pointer to a region that satisfies the
    ///   [`Layout`] returned by [`Self::metadata_layout(end - start)`], and
    ///   it must be valid for reads and writes for the entire size indicated
    ///   by that `Layout`.
    ///
    /// [`Self::metadata_layout(end - start)`]: Self::metadata_layout
    pub unsafe fn new_raw(
        metadata: NonNull<u8>,
        start: NonNull<u8>,
        end: NonNull<u8>,
    ) -> Result<Heap<Raw>, AllocInitError> {
        let size = end
            .addr()
            .get()
            .checked_sub(start.addr().get())
            .ok_or(AllocInitError::InvalidConfig)?;

        let parts = unsafe { HeapParts::new(metadata, start, size)? };

        Ok(parts.with_backing_allocator(Raw))
    }

    /// Returns the layout requirements of a region of `size` bytes.
    ///
    /// The region is aligned to its own size so that offsets and addresses
    /// share the same buddy structure.
    pub fn region_layout(size: usize) -> Result<Layout, AllocInitError> {
        check_region_size(size)?;

        Layout::from_size_align(size, size).map_err(|_| AllocInitError::InvalidConfig)
    }

    /// Returns the layout requirements of the metadata for a region of
    /// `size` bytes.
    pub fn metadata_layout(size: usize) -> Result<Layout, AllocInitError> {
        check_region_size(size)?;

        Ok(PresenceIndex::layout(size))
    }
}

#[cfg(any(feature = "alloc", test))]
impl Heap<Global> {
    /// Attempts to construct a heap of `size` bytes backed by the global
    /// allocator.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if `size` is not a power of
    /// two of at least [`MIN_BLOCK_SIZE`] bytes, and
    /// [`AllocInitError::AllocFailed`] if the region or its metadata cannot
    /// be allocated.
    #[cfg_attr(docs_rs, doc(cfg(feature = "alloc")))]
    pub fn try_new(size: usize) -> Result<Heap<Global>, AllocInitError> {
        let region_layout = Heap::region_layout(size)?;
        let metadata_layout = Heap::metadata_layout(size)?;

        unsafe {
            let region = NonNull::new(alloc::alloc::alloc(region_layout))
                .ok_or(AllocInitError::AllocFailed(region_layout))?;

            let metadata = match NonNull::new(alloc::alloc::alloc(metadata_layout)) {
                Some(m) => m,
                None => {
                    alloc::alloc::dealloc(region.as_ptr(), region_layout);
                    return Err(AllocInitError::AllocFailed(metadata_layout));
                }
            };

            match HeapParts::new(metadata, region, size) {
                Ok(parts) => Ok(parts.with_backing_allocator(Global)),
                Err(e) => {
                    alloc::alloc::dealloc(region.as_ptr(), region_layout);
                    alloc::alloc::dealloc(metadata.as_ptr(), metadata_layout);
                    Err(e)
                }
            }
        }
    }
}

impl<A: BackingAllocator> Drop for Heap<A> {
    fn drop(&mut self) {
        let size = self.base.extent();

        if let (Ok(region_layout), Ok(metadata_layout)) =
            (Heap::region_layout(size), Heap::metadata_layout(size))
        {
            unsafe {
                self.backing_allocator
                    .deallocate(self.base.ptr(), region_layout);
                self.backing_allocator
                    .deallocate(self.metadata, metadata_layout);
            }
        }
    }
}

impl<A: BackingAllocator> Heap<A> {
    /// Returns the start of the managed region.
    pub fn start(&self) -> NonNull<u8> {
        self.base.ptr()
    }

    /// Returns the size of the managed region in bytes.
    pub fn size(&self) -> usize {
        self.base.extent()
    }

    /// Allocates at least `size` bytes.
    ///
    /// The returned pointer is aligned to [`PAYLOAD_ALIGN`] and is valid for
    /// reads and writes of [`usable_size`](Self::usable_size) bytes. Its
    /// contents are unspecified.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::Exhausted`] if no free block can hold `size`
    /// bytes plus a header.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        let allocated = self.allocate_block(size)?;
        allocated.log(size);

        Ok(allocated.ptr)
    }

    /// Like [`allocate`](Self::allocate), but leaves logging to the caller.
    pub(crate) fn allocate_block(&mut self, size: usize) -> Result<Allocated, HeapError> {
        let total = size
            .checked_add(HEADER_SIZE)
            .filter(|&total| total <= self.size())
            .ok_or(HeapError::Exhausted)?;

        let block = self.find_free_block(total).ok_or(HeapError::Exhausted)?;

        unsafe { self.free_list.unlink(self.base, block) };

        Ok(Allocated {
            ptr: self.base.with_offset(block + HEADER_SIZE),
            block,
            size: unsafe { self.base.block_size(block) },
        })
    }

    /// Returns the block at `ptr` to the heap.
    ///
    /// The payload is overwritten with [`JUNK`] and the block is merged with
    /// its buddy as far as possible. Releasing a block that is already free,
    /// or that has since been merged into a larger free block, does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if `ptr` cannot have been returned by
    /// [`allocate`](Self::allocate): [`HeapError::OutOfRange`] if its header
    /// would lie outside the region, [`HeapError::Misaligned`] if the header
    /// is not on a block boundary, and [`HeapError::CorruptHeader`] if the
    /// header holds an impossible size. The heap is unchanged in every case.
    ///
    /// # Safety
    ///
    /// If `ptr` was returned by `allocate` and has not since been released,
    /// the caller must not access the block again.
    pub unsafe fn release(&mut self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let released = unsafe { self.release_block(ptr)? };
        released.log(ptr);

        Ok(())
    }

    /// Like [`release`](Self::release), but leaves logging to the caller.
    ///
    /// # Safety
    ///
    /// See [`release`](Self::release).
    pub(crate) unsafe fn release_block(&mut self, ptr: NonNull<u8>) -> Result<Released, HeapError> {
        let block = self.header_ofs(ptr)?;

        if let Some(free) = self.free_block_covering(block) {
            return Ok(Released::AlreadyFree { block, free });
        }

        let size = unsafe { self.base.block_size(block) };
        if !self.is_block(block, size) {
            return Err(HeapError::CorruptHeader);
        }

        let payload = self
            .base
            .with_offset_and_size(block + HEADER_SIZE, size - HEADER_SIZE);

        unsafe {
            payload.cast::<u8>().as_ptr().write_bytes(JUNK, payload.len());
            self.free_list.push_front(self.base, block, size);
        }

        let merged = unsafe { self.try_merge(block) };

        Ok(Released::Freed {
            block,
            size,
            merged,
            merged_size: unsafe { self.base.block_size(merged) },
        })
    }

    /// Returns the number of bytes usable through a pointer returned by
    /// [`allocate`](Self::allocate).
    ///
    /// # Errors
    ///
    /// Fails under the same conditions as [`release`](Self::release), and
    /// with [`HeapError::CorruptHeader`] if the block is currently free.
    ///
    /// # Safety
    ///
    /// If `ptr` lies inside the region, it must be a pointer returned by
    /// `allocate` that has not been released.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize, HeapError> {
        let block = self.header_ofs(ptr)?;

        if self.free_block_covering(block).is_some() {
            return Err(HeapError::CorruptHeader);
        }

        let size = unsafe { self.base.block_size(block) };
        if !self.is_block(block, size) {
            return Err(HeapError::CorruptHeader);
        }

        Ok(size - HEADER_SIZE)
    }

    /// Returns an iterator over the free list, in list order.
    pub fn free_blocks(&self) -> FreeBlocks<'_> {
        FreeBlocks::new(self.base, &self.free_list)
    }

    /// Summarizes the free list.
    pub fn stats(&self) -> HeapStats {
        self.free_blocks().collect()
    }

    /// Returns a printable listing of the free list and its statistics.
    pub fn report(&self) -> Report<'_> {
        Report::new(self.free_blocks())
    }

    /// Computes the offset of the header belonging to `ptr`.
    fn header_ofs(&self, ptr: NonNull<u8>) -> Result<usize, HeapError> {
        let header = ptr
            .addr()
            .get()
            .checked_sub(HEADER_SIZE)
            .and_then(NonZeroUsize::new)
            .ok_or(HeapError::OutOfRange)?;

        let ofs = self.base.offset_to(header).ok_or(HeapError::OutOfRange)?;

        if ofs % MIN_BLOCK_SIZE != 0 {
            return Err(HeapError::Misaligned);
        }

        Ok(ofs)
    }

    /// Returns the offset of the free block containing `ofs`, if any.
    ///
    /// Only offsets marked present are read, one candidate per split level.
    fn free_block_covering(&self, ofs: usize) -> Option<usize> {
        levels(self.size())
            .map(|size| ofs & !(size - 1))
            .find(|&candidate| {
                self.free_list.is_present(candidate)
                    && unsafe { self.base.block_size(candidate) } > ofs - candidate
            })
    }

    /// Returns `true` if a block of `size` bytes may begin at `ofs`.
    fn is_block(&self, ofs: usize, size: usize) -> bool {
        size.is_power_of_two() && size >= MIN_BLOCK_SIZE && size <= self.size() && ofs % size == 0
    }

    pub(crate) fn base(&self) -> BasePtr {
        self.base
    }

    pub(crate) fn free_list(&self) -> &FreeList {
        &self.free_list
    }

    pub(crate) fn free_list_mut(&mut self) -> &mut FreeList {
        &mut self.free_list
    }
}

/// The outcome of a successful allocation.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Allocated {
    pub ptr: NonNull<u8>,
    pub block: usize,
    pub size: usize,
}

impl Allocated {
    pub(crate) fn log(&self, requested: usize) {
        log::debug!(
            "allocate({requested:#x}): block {:#x}, size {:#x}",
            self.block,
            self.size
        );
    }
}

/// The outcome of a successful release.
#[derive(Copy, Clone, Debug)]
pub(crate) enum Released {
    /// The block returned to the free list and coalesced into `merged`.
    Freed {
        block: usize,
        size: usize,
        merged: usize,
        merged_size: usize,
    },
    /// The block lies inside the free block at `free`; nothing changed.
    AlreadyFree { block: usize, free: usize },
}

impl Released {
    pub(crate) fn log(&self, ptr: NonNull<u8>) {
        match *self {
            Released::Freed {
                block,
                size,
                merged,
                merged_size,
            } => log::debug!(
                "release({ptr:p}): block {block:#x}, size {size:#x}, \
                 merged into {merged:#x}, size {merged_size:#x}"
            ),
            Released::AlreadyFree { block, free } => {
                log::warn!("release({ptr:p}): block {block:#x} is already free (in {free:#x})")
            }
        }
    }
}

impl<A: BackingAllocator> fmt::Debug for Heap<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("start", &self.base.ptr())
            .field("size", &self.size())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn check_region_size(size: usize) -> Result<(), AllocInitError> {
    if size.is_power_of_two() && size >= MIN_BLOCK_SIZE {
        Ok(())
    } else {
        Err(AllocInitError::InvalidConfig)
    }
}

/// Like a `Heap`, but without a `Drop` impl or an associated allocator.
///
/// This assists in tacking on the allocator type parameter because this struct
/// can be moved out of, while `Heap` itself cannot.
struct HeapParts {
    base: BasePtr,
    metadata: NonNull<u8>,
    free_list: FreeList,
}

impl HeapParts {
    fn with_backing_allocator<A: BackingAllocator>(self, backing_allocator: A) -> Heap<A> {
        let HeapParts {
            base,
            metadata,
            free_list,
        } = self;

        Heap {
            base,
            metadata,
            free_list,
            backing_allocator,
        }
    }

    /// Lays out an empty heap: one free block spanning the whole region.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `region` must be valid for reads and writes for `size` bytes and
    ///   owned exclusively by the heap.
    /// - `metadata` must be valid for reads and writes for
    ///   `PresenceIndex::layout(size).size()` bytes and owned exclusively by
    ///   the heap.
    unsafe fn new(
        metadata: NonNull<u8>,
        region: NonNull<u8>,
        size: usize,
    ) -> Result<HeapParts, AllocInitError> {
        check_region_size(size)?;

        let presence_layout = PresenceIndex::layout(size);
        if region.as_ptr().align_offset(PAYLOAD_ALIGN) != 0
            || metadata.as_ptr().align_offset(presence_layout.align()) != 0
        {
            return Err(AllocInitError::InvalidConfig);
        }

        let base = BasePtr::new(region, size).ok_or(AllocInitError::InvalidConfig)?;

        let presence = unsafe { PresenceIndex::new(size, metadata.cast::<u64>().as_ptr()) };
        let mut free_list = FreeList::new(presence);

        unsafe { free_list.push_front(base, 0, size) };

        log::debug!("heap initialized: {size:#x} bytes at {:p}", region);

        Ok(HeapParts {
            base,
            metadata,
            free_list,
        })
    }
}

#[cfg(test)]
impl<A: BackingAllocator> Heap<A> {
    /// Checks the free list, the presence index and the buddy structure
    /// against each other.
    pub(crate) fn assert_invariants(&self) {
        use alloc::vec::Vec;

        use crate::buddy::buddy_of;

        let base = self.base;
        let mut blocks = Vec::new();
        let mut prev = None;
        let mut current = self.free_list.head(base);

        while let Some(ofs) = current {
            let header = unsafe { base.header_mut(ofs) };

            assert!(self.is_block(ofs, header.size), "bad block {ofs:#x}: {:#x}", header.size);
            assert!(self.free_list.is_present(ofs), "block {ofs:#x} not present");
            assert_eq!(header.prev, prev.map(|p| base.addr_of(p)), "bad prev link at {ofs:#x}");

            blocks.push((ofs, header.size));
            prev = Some(ofs);
            current = unsafe { self.free_list.next_of(base, ofs) };
        }

        assert_eq!(
            self.free_list.presence().count(),
            blocks.len(),
            "presence index disagrees with free list"
        );

        blocks.sort_unstable();
        for pair in blocks.windows(2) {
            let ((a, a_size), (b, _)) = (pair[0], pair[1]);
            assert!(a + a_size <= b, "free blocks {a:#x} and {b:#x} overlap");
        }

        // No two free buddies are left uncoalesced.
        for &(ofs, size) in &blocks {
            if size < self.size() {
                let buddy = buddy_of(ofs, size);
                assert!(
                    !blocks.contains(&(buddy, size)),
                    "free buddies {ofs:#x} and {buddy:#x} not merged"
                );
            }
        }
    }
}
