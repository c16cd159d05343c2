use core::{
    mem,
    num::NonZeroUsize,
    ptr::{self, NonNull},
};

use crate::polyfill::NonNullStrict;

/// The size of the header embedded at the start of every block.
pub const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

/// The smallest block the heap will ever create.
///
/// Every block offset is a multiple of this value.
pub const MIN_BLOCK_SIZE: usize = HEADER_SIZE.next_power_of_two();

/// The header embedded at the start of every block.
///
/// While a block is allocated only `size` is meaningful; the link fields are
/// rewritten when the block returns to the free list.
///
/// Rather than using pointers, the links store only the addresses of the
/// previous and next free blocks. This avoids accidentally violating stacked
/// borrows; the links "point to" other blocks, but by forgoing actual
/// pointers, no borrow is implied.
///
/// NOTE: any actual pointer to a block must be acquired via the heap's base
/// pointer, and NOT by casting these addresses directly!
#[repr(C)]
#[derive(Debug)]
pub struct BlockHeader {
    /// Size of the block in bytes, header included.
    pub size: usize,
    /// Address of the previous free block, if any.
    pub prev: Option<NonZeroUsize>,
    /// Address of the next free block, if any.
    pub next: Option<NonZeroUsize>,
}

/// A pointer to the base of the region of memory managed by a heap.
///
/// All block arithmetic is done on offsets relative to this pointer; raw
/// addresses only appear when a pointer enters or leaves the heap.
#[derive(Copy, Clone, Debug)]
pub struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr`.
    ///
    /// The returned value assumes the provenance of `ptr`.
    #[inline]
    pub fn new(ptr: NonNull<u8>, extent: usize) -> Option<BasePtr> {
        ptr.addr().get().checked_add(extent)?;

        Some(BasePtr { ptr, extent })
    }

    /// Returns the base pointer as a `NonNull<u8>`.
    #[inline]
    pub fn ptr(self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the size of the region in bytes.
    #[inline]
    pub fn extent(self) -> usize {
        self.extent
    }

    #[inline]
    pub fn contains_ofs(self, ofs: usize) -> bool {
        ofs < self.extent
    }

    #[inline]
    pub fn contains_addr(self, addr: NonZeroUsize) -> bool {
        self.offset_to(addr).is_some()
    }

    /// Returns the address of the byte `ofs` bytes past the base.
    #[inline]
    pub fn addr_of(self, ofs: usize) -> NonZeroUsize {
        debug_assert!(ofs <= self.extent);

        // Cannot overflow: `new` checked that the region limit fits a usize.
        NonZeroUsize::new(self.ptr.addr().get() + ofs).unwrap()
    }

    /// Calculates the offset from `self` to `addr`.
    ///
    /// Returns `None` if `addr` is not inside the region.
    #[inline]
    pub fn offset_to(self, addr: NonZeroUsize) -> Option<usize> {
        let ofs = addr.get().checked_sub(self.ptr.addr().get())?;
        self.contains_ofs(ofs).then_some(ofs)
    }

    /// Creates a new pointer with the given offset.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_offset(self, ofs: usize) -> NonNull<u8> {
        assert!(ofs <= self.extent, "offset out of region");

        self.ptr.with_addr(self.addr_of(ofs))
    }

    /// Returns a pointer to `len` bytes starting at `ofs`.
    #[inline]
    pub fn with_offset_and_size(self, ofs: usize, len: usize) -> NonNull<[u8]> {
        debug_assert!(ofs.checked_add(len).map_or(false, |end| end <= self.extent));

        let raw_slice = ptr::slice_from_raw_parts_mut(self.with_offset(ofs).as_ptr(), len);

        // SAFETY: derived from a non-null pointer.
        unsafe { NonNull::new_unchecked(raw_slice) }
    }

    /// Initializes a `BlockHeader` at the given offset.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ofs` must be a multiple of `MIN_BLOCK_SIZE`.
    /// - The memory at `ofs` must be valid for reads and writes for
    ///   `HEADER_SIZE` bytes.
    /// - The memory at `ofs` must not be part of a caller's payload.
    #[inline]
    pub unsafe fn init_header_at(self, ofs: usize, header: BlockHeader) {
        debug_assert!(self.contains_ofs(ofs));
        debug_assert!(
            header.next.map_or(true, |next| self.contains_addr(next)),
            "next link out of region"
        );
        debug_assert!(
            header.prev.map_or(true, |prev| self.contains_addr(prev)),
            "prev link out of region"
        );

        unsafe {
            self.with_offset(ofs)
                .cast::<BlockHeader>()
                .as_ptr()
                .write(header)
        };
    }

    /// Returns a mutable reference to the `BlockHeader` at `ofs`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - The memory at `ofs` must contain a properly initialized `BlockHeader`.
    /// - The block at `ofs` must be free, or be a block whose ownership has
    ///   just been returned to the heap.
    /// - No other reference to the same header may be live.
    #[inline]
    pub unsafe fn header_mut<'a>(self, ofs: usize) -> &'a mut BlockHeader {
        debug_assert!(self.contains_ofs(ofs));
        debug_assert_eq!(ofs % MIN_BLOCK_SIZE, 0);

        let header = unsafe { self.with_offset(ofs).cast::<BlockHeader>().as_mut() };

        debug_assert!(
            header.next.map_or(true, |next| self.contains_addr(next)),
            "next link out of region"
        );
        debug_assert!(
            header.prev.map_or(true, |prev| self.contains_addr(prev)),
            "prev link out of region"
        );

        header
    }

    /// Reads the size field of the block header at `ofs`.
    ///
    /// Unlike [`header_mut`](Self::header_mut) this never touches the link
    /// fields, so it may be used on allocated blocks.
    ///
    /// # Safety
    ///
    /// The memory at `ofs` must hold the header of a block, free or allocated.
    #[inline]
    pub unsafe fn block_size(self, ofs: usize) -> usize {
        debug_assert!(self.contains_ofs(ofs));

        let header = self.with_offset(ofs).cast::<BlockHeader>().as_ptr();

        unsafe { ptr::addr_of!((*header).size).read() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fits_min_block() {
        assert_eq!(HEADER_SIZE, 3 * mem::size_of::<usize>());
        assert!(MIN_BLOCK_SIZE.is_power_of_two());
        assert!(MIN_BLOCK_SIZE >= HEADER_SIZE);
        assert_eq!(HEADER_SIZE % mem::align_of::<BlockHeader>(), 0);
    }

    #[test]
    fn offset_to_rejects_foreign_addresses() {
        let mut buf = [0u64; 8];
        let base = BasePtr::new(NonNull::from(&mut buf).cast(), 64).unwrap();
        let start = base.ptr().addr();

        assert_eq!(base.offset_to(start), Some(0));
        assert_eq!(
            base.offset_to(NonZeroUsize::new(start.get() + 63).unwrap()),
            Some(63)
        );
        assert_eq!(
            base.offset_to(NonZeroUsize::new(start.get() + 64).unwrap()),
            None
        );
        assert_eq!(
            base.offset_to(NonZeroUsize::new(start.get() - 1).unwrap()),
            None
        );
    }
}
