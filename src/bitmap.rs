use core::{alloc::Layout, mem};

pub struct Bitmap {
    num_bits: usize,
    map: *mut u64,
}

impl Bitmap {
    /// Returns the layout of the storage backing a bitmap of `num_bits` bits.
    pub fn map_layout(num_bits: usize) -> Layout {
        Layout::array::<u64>(Self::num_blocks(num_bits)).expect("bitmap metadata layout error")
    }

    /// Constructs a new bitmap of `num_bits` bits, backed by `map`.
    ///
    /// All bits are initially clear.
    ///
    /// A `Layout` describing a suitable region for `map` can be obtained with
    /// `Bitmap::map_layout(num_bits)`.
    ///
    /// # Safety
    ///
    /// Behavior is undefined if any of the following conditions are violated:
    /// - `map` must be valid for reads and writes for
    ///   `Self::num_blocks(num_bits) * mem::size_of::<u64>()` many bytes, and
    ///   it must be properly aligned.
    /// - No other reference to the memory at `map` may exist while the bitmap
    ///   is live.
    pub unsafe fn new(num_bits: usize, map: *mut u64) -> Bitmap {
        assert!(num_bits > 0);
        assert!(!map.is_null());
        assert!(map.align_offset(mem::align_of::<u64>()) == 0);

        let mut bitmap = Bitmap { num_bits, map };
        bitmap.clear();
        bitmap
    }

    #[inline]
    pub const fn num_blocks(num_bits: usize) -> usize {
        (num_bits + u64::BITS as usize - 1) / u64::BITS as usize
    }

    /// Returns a tuple of the index of the `u64` containing `bit` and a mask
    /// which extracts it.
    #[inline]
    const fn index_and_mask(bit: usize) -> (usize, u64) {
        (
            bit / u64::BITS as usize,
            1 << (bit as u64 % u64::BITS as u64),
        )
    }

    /// Clears every bit.
    pub fn clear(&mut self) {
        for i in 0..Self::num_blocks(self.num_bits) {
            unsafe { self.map.add(i).write(0) };
        }
    }

    /// Gets the value of the indexed bit.
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.num_bits);

        let (block_idx, mask) = Self::index_and_mask(index);

        unsafe { self.map.add(block_idx).read() & mask != 0 }
    }

    /// Sets the value of the indexed bit.
    #[inline]
    pub fn set(&mut self, index: usize, value: bool) {
        assert!(index < self.num_bits);

        let (block_idx, mask) = Self::index_and_mask(index);

        unsafe {
            let block_ptr = self.map.add(block_idx);
            let block = block_ptr.read();
            block_ptr.write(match value {
                true => block | mask,
                false => block & !mask,
            });
        }
    }

    /// Returns the number of set bits.
    #[cfg(test)]
    pub fn count_ones(&self) -> usize {
        (0..Self::num_blocks(self.num_bits))
            .map(|i| unsafe { self.map.add(i).read() }.count_ones() as usize)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use core::mem::ManuallyDrop;
    use std::prelude::rust_2021::*;

    use super::*;

    struct VecBitmap {
        bitmap: ManuallyDrop<Bitmap>,
        len: usize,
        cap: usize,
    }

    impl VecBitmap {
        fn new(num_bits: usize) -> VecBitmap {
            let num_blocks = Bitmap::num_blocks(num_bits);

            // Fill with garbage to check that construction clears it.
            let mut v = Vec::with_capacity(num_blocks);
            v.resize(num_blocks, u64::MAX);

            let mut v = ManuallyDrop::new(v);
            let map = v.as_mut_ptr();
            let len = v.len();
            let cap = v.capacity();

            VecBitmap {
                bitmap: ManuallyDrop::new(unsafe { Bitmap::new(num_bits, map) }),
                len,
                cap,
            }
        }
    }

    impl Drop for VecBitmap {
        fn drop(&mut self) {
            unsafe {
                let Bitmap { map, .. } = ManuallyDrop::take(&mut self.bitmap);

                // Reconstitute the original Vec.
                let v = Vec::from_raw_parts(map, self.len, self.cap);

                // Explicit for clarity.
                drop(v);
            }
        }
    }

    #[test]
    fn init_many() {
        for num_bits in 1..=256 {
            let v = VecBitmap::new(num_bits);
            assert_eq!(v.bitmap.count_ones(), 0);
        }
    }

    #[test]
    fn set_and_clear() {
        let mut v = VecBitmap::new(130);
        let bitmap = &mut *v.bitmap;

        for bit in [0, 63, 64, 129] {
            bitmap.set(bit, true);
            assert!(bitmap.get(bit));
        }
        assert_eq!(bitmap.count_ones(), 4);
        assert!(!bitmap.get(1));

        bitmap.set(64, false);
        assert!(!bitmap.get(64));
        assert!(bitmap.get(63));

        bitmap.clear();
        assert_eq!(bitmap.count_ones(), 0);
    }

    #[test]
    #[should_panic]
    fn get_out_of_bounds() {
        let v = VecBitmap::new(10);
        v.bitmap.get(10);
    }
}
