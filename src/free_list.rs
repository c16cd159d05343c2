//! The intrusive free list.
//!
//! `push_front`, `insert_after` and `unlink` are the only operations that
//! mutate the list, and each of them updates the presence index in the same
//! step, so a block is in the list iff it is marked present.

use core::num::NonZeroUsize;

use crate::{
    base::{BasePtr, BlockHeader},
    presence::PresenceIndex,
};

pub struct FreeList {
    head: Option<NonZeroUsize>,
    presence: PresenceIndex,
}

impl FreeList {
    /// Creates an empty list over a cleared presence index.
    pub fn new(mut presence: PresenceIndex) -> FreeList {
        presence.clear();

        FreeList {
            head: None,
            presence,
        }
    }

    /// Returns the offset of the first block in the list.
    #[inline]
    pub fn head(&self, base: BasePtr) -> Option<usize> {
        self.head.map(|h| link_ofs(base, h))
    }

    #[inline]
    pub fn is_present(&self, ofs: usize) -> bool {
        self.presence.is_present(ofs)
    }

    #[cfg(test)]
    pub fn presence(&self) -> &PresenceIndex {
        &self.presence
    }

    /// Pushes the block at `ofs` onto the head of the list.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ofs` must be a block boundary inside the region of `base`.
    /// - The block at `ofs` must not be in the list and must not be owned by
    ///   a caller.
    pub unsafe fn push_front(&mut self, base: BasePtr, ofs: usize, size: usize) {
        let new_head = base.addr_of(ofs);
        let old_head = self.head;

        if let Some(old) = old_head {
            // `old_head` points back to `new_head`.
            unsafe { base.header_mut(link_ofs(base, old)).prev = Some(new_head) };
        }

        // `new_head` points forward to `old_head`.
        unsafe {
            base.init_header_at(
                ofs,
                BlockHeader {
                    size,
                    prev: None,
                    next: old_head,
                },
            )
        };

        self.head = Some(new_head);
        self.presence.mark(ofs, true);
    }

    /// Inserts the block at `ofs` directly after the block at `anchor`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `anchor` must be in the list.
    /// - `ofs` must be a block boundary inside the region of `base`, not in
    ///   the list, and not owned by a caller.
    pub unsafe fn insert_after(&mut self, base: BasePtr, anchor: usize, ofs: usize, size: usize) {
        debug_assert!(self.is_present(anchor));

        let new = base.addr_of(ofs);
        let anchor_mut = unsafe { base.header_mut(anchor) };
        let next = anchor_mut.next.replace(new);

        if let Some(n) = next {
            unsafe { base.header_mut(link_ofs(base, n)).prev = Some(new) };
        }

        unsafe {
            base.init_header_at(
                ofs,
                BlockHeader {
                    size,
                    prev: Some(base.addr_of(anchor)),
                    next,
                },
            )
        };

        self.presence.mark(ofs, true);
    }

    /// Removes the block at `ofs` from the list.
    ///
    /// # Safety
    ///
    /// The block at `ofs` must be in the list.
    pub unsafe fn unlink(&mut self, base: BasePtr, ofs: usize) {
        debug_assert!(self.is_present(ofs));

        let (prev, next) = {
            let removed = unsafe { base.header_mut(ofs) };
            (removed.prev.take(), removed.next.take())
        };

        match prev {
            // Link `prev` forward to `next`.
            Some(p) => unsafe { base.header_mut(link_ofs(base, p)).next = next },

            // If there's no previous block, then the removed block is the head
            // of the list.
            None => self.head = next,
        }

        if let Some(n) = next {
            // Link `next` back to `prev`.
            unsafe { base.header_mut(link_ofs(base, n)).prev = prev };
        }

        self.presence.mark(ofs, false);
    }

    /// Returns the offset of the block following `ofs` in the list.
    ///
    /// # Safety
    ///
    /// The block at `ofs` must be in the list.
    #[inline]
    pub unsafe fn next_of(&self, base: BasePtr, ofs: usize) -> Option<usize> {
        unsafe { base.header_mut(ofs).next }.map(|n| link_ofs(base, n))
    }
}

#[inline]
fn link_ofs(base: BasePtr, link: NonZeroUsize) -> usize {
    base.offset_to(link).expect("free list link out of region")
}
