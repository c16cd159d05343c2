//! A fixed-region binary-buddy allocator for kernel heaps.
//!
//! The allocator manages a single contiguous region whose size is a power of
//! two. Every block, free or allocated, begins with a [`BlockHeader`]; free
//! blocks are threaded onto an unordered, doubly-linked free list and flagged
//! in a presence bitmap so that a block's buddy can be recognized as free
//! without reading memory that belongs to a caller.
//!
//! [`Heap`] is the unsynchronized allocator. [`LockedHeap`] wraps it in a spin
//! lock, can live in a `static`, and implements [`GlobalAlloc`].
//!
//! ```
//! use buddy_heap::{Heap, LockedHeap};
//!
//! # #[cfg(feature = "alloc")]
//! # fn main() {
//! let heap = LockedHeap::new(Heap::try_new(4096).unwrap());
//!
//! let ptr = heap.allocate(100);
//! unsafe { heap.release(ptr) };
//!
//! assert_eq!(heap.stats().free_blocks, 1);
//! # }
//! # #[cfg(not(feature = "alloc"))]
//! # fn main() {}
//! ```
//!
//! [`BlockHeader`]: crate::base::BlockHeader
//! [`GlobalAlloc`]: core::alloc::GlobalAlloc

#![doc(html_root_url = "https://docs.rs/buddy_heap/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(not(feature = "std"), no_std)]
#![cfg_attr(docs_rs, feature(doc_cfg))]
// This is necessary to allow `sptr` and `polyfill` to shadow methods that are
// inherent on newer toolchains.
#![allow(unstable_name_collisions)]

#[cfg(any(feature = "alloc", test))]
extern crate alloc;

mod base;
mod bitmap;
mod buddy;
mod free_list;
mod heap;
mod locked;
mod polyfill;
mod presence;
mod stats;


use core::{alloc::Layout, fmt, ptr::NonNull};

pub use crate::{
    base::{BlockHeader, HEADER_SIZE, MIN_BLOCK_SIZE},
    heap::{Heap, JUNK, PAYLOAD_ALIGN},
    locked::LockedHeap,
    stats::{FreeBlock, FreeBlocks, HeapStats, Report},
};

/// The error type for heap constructors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocInitError {
    /// A necessary allocation failed.
    ///
    /// This variant is returned when a constructor attempts to allocate
    /// memory, either for metadata or the managed region, but the
    /// underlying allocator fails.
    ///
    /// The variant contains the [`Layout`] that could not be allocated.
    AllocFailed(Layout),

    /// The configuration of the heap is invalid.
    ///
    /// This variant is returned when the region size is not a power of two,
    /// is smaller than [`MIN_BLOCK_SIZE`], or when the region start is not
    /// suitably aligned.
    InvalidConfig,
}

impl fmt::Display for AllocInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocInitError::AllocFailed(layout) => write!(
                f,
                "failed to allocate {} bytes aligned to {}",
                layout.size(),
                layout.align()
            ),
            AllocInitError::InvalidConfig => f.write_str("invalid heap configuration"),
        }
    }
}

/// Errors reported by heap operations.
///
/// [`Heap`] and [`LockedHeap::try_allocate`] surface these as values;
/// [`LockedHeap::allocate`] and [`LockedHeap::release`] treat every one of
/// them as fatal.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum HeapError {
    /// No free block, after splitting, can hold the request.
    Exhausted,

    /// The header implied by a released pointer lies outside the region.
    OutOfRange,

    /// The header implied by a released pointer is not on a block boundary.
    Misaligned,

    /// The header of a released block holds an impossible size.
    CorruptHeader,
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HeapError::Exhausted => "heap exhausted",
            HeapError::OutOfRange => "pointer out of heap range",
            HeapError::Misaligned => "pointer is not on a block boundary",
            HeapError::CorruptHeader => "corrupt block header",
        })
    }
}

/// Types which provide memory which backs a heap.
///
/// This trait is implemented by the following types:
/// - The `Raw` marker type indicates that a heap is not backed by another
///   allocator. This is the case when constructing the heap from raw
///   pointers, typically regions handed over by the boot-time memory layout.
/// - The `Global` marker type indicates that a heap is backed by the global
///   allocator. The heap will free its memory on drop.
pub trait BackingAllocator: Sealed {
    /// Deallocates the memory referenced by `ptr`.
    ///
    /// # Safety
    ///
    /// * `ptr` must denote a block of memory currently allocated via this allocator, and
    /// * `layout` must fit that block of memory.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// A marker type indicating that a heap is backed by raw pointers.
#[derive(Clone, Debug)]
pub struct Raw;
impl Sealed for Raw {}
impl BackingAllocator for Raw {
    unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {}
}

#[cfg(any(feature = "alloc", test))]
/// The global memory allocator.
#[derive(Clone, Debug)]
pub struct Global;

#[cfg(any(feature = "alloc", test))]
impl Sealed for Global {}

#[cfg(any(feature = "alloc", test))]
impl BackingAllocator for Global {
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) };
    }
}

#[doc(hidden)]
mod private {
    pub trait Sealed {}
}
use private::Sealed;
