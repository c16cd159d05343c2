//! The lock-guarded heap facade.

use core::{
    alloc::{GlobalAlloc, Layout},
    fmt,
    ptr::{self, NonNull},
};

use spin::Mutex;

use crate::{heap::PAYLOAD_ALIGN, BackingAllocator, Heap, HeapError, HeapStats, Raw};

/// A [`Heap`] behind a spin lock.
///
/// Every operation holds the lock for its full duration, so no caller can
/// observe a block mid-split or mid-merge. A `LockedHeap` can be created empty
/// in a `static` and initialized once the heap bounds are known:
///
/// ```no_run
/// use core::ptr::NonNull;
///
/// use buddy_heap::{Heap, LockedHeap, MIN_BLOCK_SIZE};
///
/// const HEAP_SIZE: usize = 1 << 20;
/// const PRESENCE_WORDS: usize = HEAP_SIZE / MIN_BLOCK_SIZE / 64;
///
/// #[global_allocator]
/// static HEAP: LockedHeap = LockedHeap::empty();
///
/// static mut PRESENCE: [u64; PRESENCE_WORDS] = [0; PRESENCE_WORDS];
///
/// unsafe fn init_heap(start: NonNull<u8>, end: NonNull<u8>) {
///     let metadata = NonNull::new(core::ptr::addr_of_mut!(PRESENCE).cast()).unwrap();
///     let heap = unsafe { Heap::new_raw(metadata, start, end) }.expect("bad heap bounds");
///     HEAP.init(heap);
/// }
/// # fn main() {}
/// ```
///
/// The methods without a `try_` prefix treat every [`HeapError`] as fatal and
/// panic, after releasing the lock. Logging also happens after the lock is
/// released, so a logger may allocate from the heap it is logging for.
pub struct LockedHeap<A: BackingAllocator = Raw> {
    inner: Mutex<Option<Heap<A>>>,
}

impl<A: BackingAllocator> LockedHeap<A> {
    /// Creates an uninitialized heap.
    ///
    /// [`init`](Self::init) must be called before any other method.
    pub const fn empty() -> LockedHeap<A> {
        LockedHeap {
            inner: Mutex::new(None),
        }
    }

    /// Creates a locked heap around `heap`.
    pub fn new(heap: Heap<A>) -> LockedHeap<A> {
        LockedHeap {
            inner: Mutex::new(Some(heap)),
        }
    }

    /// Installs `heap`.
    ///
    /// # Panics
    ///
    /// Panics if the heap is already initialized.
    pub fn init(&self, heap: Heap<A>) {
        let installed = {
            let mut inner = self.inner.lock();
            match *inner {
                Some(_) => false,
                None => {
                    *inner = Some(heap);
                    true
                }
            }
        };

        assert!(installed, "heap already initialized");
    }

    /// Returns `true` if the heap has been initialized.
    pub fn is_initialized(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Runs `f` on the heap under the lock.
    ///
    /// The guard is dropped before this returns.
    fn with_heap<R>(&self, f: impl FnOnce(&mut Heap<A>) -> R) -> Option<R> {
        self.inner.lock().as_mut().map(f)
    }

    /// Allocates at least `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::Exhausted`] if the request cannot be satisfied.
    ///
    /// # Panics
    ///
    /// Panics if the heap is not initialized.
    pub fn try_allocate(&self, size: usize) -> Result<NonNull<u8>, HeapError> {
        let allocated = self
            .with_heap(|heap| heap.allocate_block(size))
            .unwrap_or_else(|| uninitialized())?;
        allocated.log(size);

        Ok(allocated.ptr)
    }

    /// Allocates at least `size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if the heap is exhausted or not initialized.
    pub fn allocate(&self, size: usize) -> NonNull<u8> {
        match self.try_allocate(size) {
            Ok(ptr) => ptr,
            Err(e) => panic!("allocate({size:#x}): {e}"),
        }
    }

    /// Returns the block at `ptr` to the heap.
    ///
    /// Releasing a block that is already free does nothing.
    ///
    /// # Errors
    ///
    /// See [`Heap::release`].
    ///
    /// # Panics
    ///
    /// Panics if the heap is not initialized.
    ///
    /// # Safety
    ///
    /// See [`Heap::release`].
    pub unsafe fn try_release(&self, ptr: NonNull<u8>) -> Result<(), HeapError> {
        let released = self
            .with_heap(|heap| unsafe { heap.release_block(ptr) })
            .unwrap_or_else(|| uninitialized())?;
        released.log(ptr);

        Ok(())
    }

    /// Returns the block at `ptr` to the heap.
    ///
    /// Releasing a block that is already free does nothing.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` cannot have come from this heap, or if the heap is not
    /// initialized.
    ///
    /// # Safety
    ///
    /// See [`Heap::release`].
    pub unsafe fn release(&self, ptr: NonNull<u8>) {
        if let Err(e) = unsafe { self.try_release(ptr) } {
            panic!("release({ptr:p}): {e}");
        }
    }

    /// Summarizes the free list.
    ///
    /// # Panics
    ///
    /// Panics if the heap is not initialized.
    pub fn stats(&self) -> HeapStats {
        self.with_heap(|heap| heap.stats())
            .unwrap_or_else(|| uninitialized())
    }

    /// Writes a listing of the free list and its statistics to `out`.
    ///
    /// The lock is held while writing, so `out` must not allocate from this
    /// heap.
    ///
    /// # Panics
    ///
    /// Panics if the heap is not initialized.
    pub fn introspect<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        self.with_heap(|heap| write!(out, "{}", heap.report()))
            .unwrap_or_else(|| uninitialized())
    }
}

#[cold]
fn uninitialized() -> ! {
    panic!("heap used before initialization");
}

/// Reports a `dealloc` of a pointer the heap cannot take back.
///
/// The block is leaked; with `std` the process aborts instead.
#[cold]
fn rejected_dealloc(ptr: NonNull<u8>, error: Option<HeapError>) {
    match error {
        Some(e) => log::error!("dealloc({ptr:p}): {e}; block leaked"),
        None => log::error!("dealloc({ptr:p}): heap used before initialization; block leaked"),
    }

    #[cfg(feature = "std")]
    std::process::abort();
}

impl<A: BackingAllocator> fmt::Debug for LockedHeap<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_lock() {
            Some(inner) => f.debug_struct("LockedHeap").field("heap", &*inner).finish(),
            None => f.debug_struct("LockedHeap").finish_non_exhaustive(),
        }
    }
}

// SAFETY:
//
// - Allocated blocks point to memory owned by the heap and stay valid until it
//   is dropped; a `static` heap is never dropped.
// - Every pointer is at least `PAYLOAD_ALIGN`-aligned and over-aligned
//   layouts are refused with a null pointer.
// - Neither method unwinds. `alloc` reports exhaustion and an uninitialized
//   heap as a null pointer. `dealloc` leaks a block it cannot release, or
//   aborts with `std`.
// - Neither method holds the lock while logging.
unsafe impl<A: BackingAllocator> GlobalAlloc for LockedHeap<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > PAYLOAD_ALIGN {
            return ptr::null_mut();
        }

        match self.with_heap(|heap| heap.allocate_block(layout.size())) {
            Some(Ok(allocated)) => {
                allocated.log(layout.size());
                allocated.ptr.as_ptr()
            }
            _ => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let ptr = match NonNull::new(ptr) {
            Some(p) => p,
            None => return,
        };

        match self.with_heap(|heap| unsafe { heap.release_block(ptr) }) {
            Some(Ok(released)) => released.log(ptr),
            Some(Err(e)) => rejected_dealloc(ptr, Some(e)),
            None => rejected_dealloc(ptr, None),
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::{
        cell::Cell,
        slice,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use std::{
        panic::{self, AssertUnwindSafe},
        prelude::rust_2021::*,
        string::String,
        sync::mpsc,
        thread,
    };

    use super::*;
    use crate::{FreeBlock, Global, HEADER_SIZE};

    fn locked(size: usize) -> LockedHeap<Global> {
        LockedHeap::new(Heap::try_new(size).unwrap())
    }

    #[test]
    fn allocate_and_release() {
        let heap = locked(1024);

        let a = heap.allocate(100);
        let b = heap.allocate(100);
        assert_ne!(a, b);

        unsafe {
            heap.release(a);
            heap.release(b);
        }

        assert_eq!(
            heap.stats(),
            HeapStats {
                free_blocks: 1,
                free_bytes: 1024,
                min_block: Some(1024),
                max_block: Some(1024),
            }
        );
    }

    #[test]
    fn init_installs_heap_once() {
        let heap = LockedHeap::empty();
        assert!(!heap.is_initialized());

        heap.init(Heap::try_new(1024).unwrap());
        assert!(heap.is_initialized());
        assert_eq!(heap.stats().free_bytes, 1024);
    }

    #[test]
    #[should_panic(expected = "heap already initialized")]
    fn init_twice_panics() {
        let heap = locked(1024);
        heap.init(Heap::try_new(1024).unwrap());
    }

    #[test]
    #[should_panic(expected = "heap used before initialization")]
    fn uninitialized_heap_panics() {
        let heap = LockedHeap::<Global>::empty();
        heap.allocate(1);
    }

    #[test]
    #[should_panic(expected = "heap exhausted")]
    fn exhaustion_is_fatal() {
        let heap = locked(1024);

        let _whole = heap.allocate(1024 - HEADER_SIZE);
        heap.allocate(1);
    }

    #[test]
    fn exhaustion_releases_the_lock() {
        let heap = locked(1024);
        let whole = heap.allocate(1024 - HEADER_SIZE);

        let res = panic::catch_unwind(AssertUnwindSafe(|| heap.allocate(1)));
        assert!(res.is_err());

        // The lock is free again.
        assert_eq!(heap.try_allocate(1), Err(HeapError::Exhausted));
        unsafe { heap.release(whole) };
        assert_eq!(heap.stats().free_blocks, 1);
    }

    #[test]
    #[should_panic(expected = "pointer out of heap range")]
    fn foreign_release_is_fatal() {
        let heap = locked(1024);
        let mut outside = 0u64;

        unsafe { heap.release(NonNull::from(&mut outside).cast()) };
    }

    #[test]
    fn double_release_leaves_report_unchanged() {
        let heap = locked(1024);

        let a = heap.allocate(100);
        let _b = heap.allocate(100);

        unsafe { heap.release(a) };
        let mut once = String::new();
        heap.introspect(&mut once).unwrap();

        unsafe { heap.release(a) };
        let mut twice = String::new();
        heap.introspect(&mut twice).unwrap();

        assert_eq!(once, twice);
        assert!(once.contains("Block at 0x0, size 0x80"));
    }

    #[test]
    fn concurrent_callers() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 200;

        let heap = locked(1 << 16);

        thread::scope(|s| {
            for t in 0..THREADS {
                let heap = &heap;
                s.spawn(move || {
                    let mut held: Vec<(NonNull<u8>, usize)> = Vec::new();

                    for round in 0..ROUNDS {
                        let len = 1 + (t * 37 + round * 11) % 300;
                        let ptr = heap.allocate(len);

                        unsafe { ptr.as_ptr().write_bytes(t as u8, len) };
                        held.push((ptr, len));

                        if round % 3 == 2 {
                            for (ptr, len) in held.drain(..) {
                                let bytes = unsafe { slice::from_raw_parts(ptr.as_ptr(), len) };
                                assert!(bytes.iter().all(|&b| b == t as u8));
                                unsafe { heap.release(ptr) };
                            }
                        }
                    }

                    for (ptr, _) in held {
                        unsafe { heap.release(ptr) };
                    }
                });
            }
        });

        let guard = heap.inner.lock();
        let inner = (*guard).as_ref().unwrap();
        inner.assert_invariants();
        assert_eq!(
            inner.free_blocks().collect::<Vec<_>>(),
            [FreeBlock {
                offset: 0,
                size: 1 << 16,
            }]
        );
    }

    #[test]
    fn global_alloc_respects_alignment() {
        let heap = locked(4096);

        unsafe {
            let layout = Layout::from_size_align(64, PAYLOAD_ALIGN).unwrap();
            let ptr = heap.alloc(layout);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % PAYLOAD_ALIGN, 0);

            let over_aligned = Layout::from_size_align(64, PAYLOAD_ALIGN * 2).unwrap();
            assert!(heap.alloc(over_aligned).is_null());

            let too_big = Layout::from_size_align(4096, 1).unwrap();
            assert!(heap.alloc(too_big).is_null());

            heap.dealloc(ptr, layout);
        }

        assert_eq!(heap.stats().free_blocks, 1);
    }

    #[test]
    fn global_alloc_on_uninitialized_heap_is_null() {
        let heap = LockedHeap::<Global>::empty();
        let layout = Layout::from_size_align(8, 8).unwrap();

        assert!(unsafe { heap.alloc(layout) }.is_null());
    }

    static LOGGING_HEAP: LockedHeap<Global> = LockedHeap::empty();
    static LOGGER_ALLOCATIONS: AtomicUsize = AtomicUsize::new(0);

    std::thread_local! {
        static IN_LOGGER: Cell<bool> = Cell::new(false);
    }

    /// A logger that allocates from `LOGGING_HEAP` for every record.
    struct AllocatingLogger;

    impl log::Log for AllocatingLogger {
        fn enabled(&self, _: &log::Metadata<'_>) -> bool {
            true
        }

        fn log(&self, _: &log::Record<'_>) {
            // Records emitted by the logger's own allocations end here.
            if IN_LOGGER.with(|busy| busy.replace(true)) {
                return;
            }

            if LOGGING_HEAP.is_initialized() {
                if let Ok(ptr) = LOGGING_HEAP.try_allocate(16) {
                    unsafe { LOGGING_HEAP.release(ptr) };
                    LOGGER_ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
                }
            }

            IN_LOGGER.with(|busy| busy.set(false));
        }

        fn flush(&self) {}
    }

    static LOGGER: AllocatingLogger = AllocatingLogger;

    #[test]
    fn logger_may_allocate_from_its_own_heap() {
        LOGGING_HEAP.init(Heap::try_new(1 << 12).unwrap());
        let _ = log::set_logger(&LOGGER);
        log::set_max_level(log::LevelFilter::Debug);

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let ptr = LOGGING_HEAP.allocate(100);
            unsafe { LOGGING_HEAP.release(ptr) };

            let double = LOGGING_HEAP.allocate(100);
            unsafe {
                LOGGING_HEAP.release(double);
                LOGGING_HEAP.release(double);
            }

            tx.send(()).unwrap();
        });

        assert!(
            rx.recv_timeout(Duration::from_secs(5)).is_ok(),
            "heap deadlocked in its own logger"
        );
        assert!(LOGGER_ALLOCATIONS.load(Ordering::Relaxed) > 0);
        assert_eq!(LOGGING_HEAP.stats().free_blocks, 1);
    }

    // With `std`, a rejected `dealloc` aborts the process instead.
    #[cfg(not(feature = "std"))]
    #[test]
    fn global_dealloc_never_unwinds() {
        let heap = locked(1024);
        let layout = Layout::new::<u64>();
        let mut outside = 0u64;
        let foreign = NonNull::from(&mut outside).cast::<u8>().as_ptr();

        let res = panic::catch_unwind(AssertUnwindSafe(|| unsafe {
            heap.dealloc(foreign, layout)
        }));
        assert!(res.is_ok());
        assert_eq!(outside, 0);
        assert_eq!(heap.stats().free_blocks, 1);

        // A pointer into the middle of a block leaks instead of releasing.
        let ptr = heap.allocate(100);
        let res = panic::catch_unwind(AssertUnwindSafe(|| unsafe {
            heap.dealloc(ptr.as_ptr().add(8), layout)
        }));
        assert!(res.is_ok());
        assert_eq!(heap.stats().free_bytes, 1024 - 128);

        unsafe { heap.dealloc(ptr.as_ptr(), layout) };
        assert_eq!(heap.stats().free_blocks, 1);

        let empty = LockedHeap::<Global>::empty();
        let res = panic::catch_unwind(AssertUnwindSafe(|| unsafe {
            empty.dealloc(foreign, layout)
        }));
        assert!(res.is_ok());
    }
}
