//! # Mini-Transaction Memo
//!
//! The ordered record of every latch and fix a mini-transaction acquired.
//! Slots are appended in acquisition order and released strictly in
//! reverse on commit or rollback; releasing a slot nulls its resource in
//! place, the slot itself is never removed. A `Modify` slot is a marker
//! with a page reference but no resource of its own: it records that the
//! page appears in the flush-list insertion pass exactly once.
//!
//! The slot is a type tag plus an opaque resource handle. One release
//! entry point dispatches on the tag:
//!
//! | type       | release action                    |
//! |------------|-----------------------------------|
//! | `Modify`   | nothing                           |
//! | `SLock`    | unlock S on the rw-latch          |
//! | `SxLock`   | unlock SX on the rw-latch         |
//! | `XLock`    | unlock X on the rw-latch          |
//! | `BufFix`   | unfix the page                    |
//! | `PageSFix` | unlock S on the page latch, unfix |
//! | `PageSxFix`| unlock SX, unfix                  |
//! | `PageXFix` | unlock X, unfix                   |

use std::sync::Arc;

use crate::buf::{PageBlock, RwLatch};

/// What a memo slot holds and how to let go of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoType {
    /// Marker: the page was modified in this mini-transaction.
    Modify,
    SLock,
    SxLock,
    XLock,
    BufFix,
    PageSFix,
    PageSxFix,
    PageXFix,
}

impl MemoType {
    /// Slot types whose page lands in the flush list on commit.
    pub fn dirties_page(self) -> bool {
        matches!(self, MemoType::PageXFix | MemoType::PageSxFix)
    }

    pub fn is_page_fix(self) -> bool {
        matches!(
            self,
            MemoType::BufFix | MemoType::PageSFix | MemoType::PageSxFix | MemoType::PageXFix
        )
    }
}

/// The opaque resource a slot refers to.
#[derive(Debug, Clone)]
pub enum MemoObject {
    Page(Arc<PageBlock>),
    Latch(Arc<RwLatch>),
}

/// One memo entry. `object` is `None` once the slot has been released.
#[derive(Debug)]
pub struct MemoSlot {
    pub object: Option<MemoObject>,
    pub slot_type: MemoType,
}

impl MemoSlot {
    pub fn page(block: Arc<PageBlock>, slot_type: MemoType) -> Self {
        debug_assert!(slot_type.is_page_fix() || slot_type == MemoType::Modify);
        Self {
            object: Some(MemoObject::Page(block)),
            slot_type,
        }
    }

    pub fn latch(latch: Arc<RwLatch>, slot_type: MemoType) -> Self {
        debug_assert!(matches!(
            slot_type,
            MemoType::SLock | MemoType::SxLock | MemoType::XLock
        ));
        Self {
            object: Some(MemoObject::Latch(latch)),
            slot_type,
        }
    }

    pub fn page_ref(&self) -> Option<&Arc<PageBlock>> {
        match &self.object {
            Some(MemoObject::Page(block)) => Some(block),
            _ => None,
        }
    }

    pub fn latch_ref(&self) -> Option<&Arc<RwLatch>> {
        match &self.object {
            Some(MemoObject::Latch(latch)) => Some(latch),
            _ => None,
        }
    }

    /// Release the held resource and null the slot in place. Idempotent
    /// for already released slots.
    pub fn release(&mut self) {
        let Some(object) = self.object.take() else {
            return;
        };
        match (self.slot_type, object) {
            (MemoType::Modify, _) => {}
            (MemoType::SLock, MemoObject::Latch(latch)) => latch.unlock_s(),
            (MemoType::SxLock, MemoObject::Latch(latch)) => latch.unlock_sx(),
            (MemoType::XLock, MemoObject::Latch(latch)) => latch.unlock_x(),
            (MemoType::BufFix, MemoObject::Page(block)) => block.unfix(),
            (MemoType::PageSFix, MemoObject::Page(block)) => {
                block.latch.unlock_s();
                block.unfix();
            }
            (MemoType::PageSxFix, MemoObject::Page(block)) => {
                block.latch.unlock_sx();
                block.unfix();
            }
            (MemoType::PageXFix, MemoObject::Page(block)) => {
                block.latch.unlock_x();
                block.unfix();
            }
            (slot_type, _) => {
                debug_assert!(false, "memo slot {:?} holds the wrong resource", slot_type)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::{BufferPool, PageId};

    #[test]
    fn release_nulls_slot_in_place() {
        let pool = BufferPool::new();
        let page = pool.page(PageId::new(1, 1));
        page.fix();

        let mut slot = MemoSlot::page(Arc::clone(&page), MemoType::BufFix);
        assert!(slot.object.is_some());

        slot.release();
        assert!(slot.object.is_none());
        assert_eq!(page.fix_count(), 0);

        // Releasing again is a no-op.
        slot.release();
    }

    #[test]
    fn page_x_fix_release_drops_latch_and_fix() {
        let pool = BufferPool::new();
        let page = pool.page(PageId::new(1, 2));
        page.fix();
        page.latch.lock_x();

        let mut slot = MemoSlot::page(Arc::clone(&page), MemoType::PageXFix);
        slot.release();

        assert_eq!(page.fix_count(), 0);
        assert!(!page.latch.is_x_locked());
        // The latch is free again.
        page.latch.lock_s();
        page.latch.unlock_s();
    }

    #[test]
    fn standalone_latch_release() {
        let latch = Arc::new(RwLatch::new());
        latch.lock_sx();

        let mut slot = MemoSlot::latch(Arc::clone(&latch), MemoType::SxLock);
        slot.release();

        latch.lock_sx();
        latch.unlock_sx();
    }

    #[test]
    fn modify_marker_releases_to_nothing() {
        let pool = BufferPool::new();
        let page = pool.page(PageId::new(1, 3));

        let mut slot = MemoSlot::page(Arc::clone(&page), MemoType::Modify);
        slot.release();
        assert!(slot.object.is_none());
    }

    #[test]
    fn dirties_page_only_for_exclusive_fixes() {
        assert!(MemoType::PageXFix.dirties_page());
        assert!(MemoType::PageSxFix.dirties_page());
        assert!(!MemoType::PageSFix.dirties_page());
        assert!(!MemoType::BufFix.dirties_page());
        assert!(!MemoType::Modify.dirties_page());
    }
}
