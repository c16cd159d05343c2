#![no_main]

use std::ptr::NonNull;

use alloc_hater::{AllocatorOp, Evaluator, Subject};
use arbitrary::Arbitrary;
use buddy_heap::{Global, Heap, HeapError, MIN_BLOCK_SIZE};
use libfuzzer_sys::fuzz_target;

const MAX_ORDER: u32 = 20;

struct HeapSubject(Heap<Global>);

impl Subject for HeapSubject {
    type AllocError = HeapError;

    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.0.allocate(size)
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>) {
        unsafe { self.0.release(ptr) }.expect("release of a live block failed");
    }

    fn is_consistent(&self) -> bool {
        // Free blocks never exceed the region and are all valid sizes.
        let size = self.0.size();
        let stats = self.0.stats();

        stats.free_bytes <= size
            && self
                .0
                .free_blocks()
                .all(|b| b.size.is_power_of_two() && b.size <= size && b.offset % b.size == 0)
    }
}

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    order: u8,
    ops: Vec<AllocatorOp>,
}

fuzz_target!(|args: Args| {
    let min_order = MIN_BLOCK_SIZE.trailing_zeros();
    let order = min_order + u32::from(args.order) % (MAX_ORDER - min_order + 1);

    let heap = Heap::try_new(1 << order).expect("heap construction failed");
    let size = heap.size();

    let mut eval = Evaluator::new(HeapSubject(heap));
    eval.evaluate(args.ops).unwrap();

    // Everything was released, so the heap is whole again.
    let HeapSubject(heap) = eval.into_subject();
    assert_eq!(heap.stats().free_bytes, size);
    assert_eq!(heap.stats().free_blocks, 1);
});
