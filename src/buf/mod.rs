//! # Buffer Pool Interface
//!
//! The log engine does not own page frames; it coordinates with a buffer
//! pool through a narrow interface: fixing and unfixing blocks, reporting
//! the oldest dirty-page LSN, accepting flush-list insertions stamped with
//! an LSN interval, and preflushing pages up to a target LSN. This module
//! is the smallest pool that honours those interfaces; real frame storage
//! and page write-out belong to the embedder.
//!
//! ## Flush list
//!
//! The write-ahead-logging contract hangs off one ordered structure:
//!
//! ```text
//! flush list (by oldest_modification, ascending)
//! front ──► [page 7: oldest=120] [page 3: oldest=150] [page 9: oldest=310]
//!            ▲
//!            └── oldest_modification(), the checkpoint bound
//! ```
//!
//! A page enters the list the first time a mini-transaction dirties it,
//! stamped with the interval `(start_lsn, end_lsn]` of that commit.
//! Because insertions happen under the log's flush-order mutex, the
//! `start_lsn` stamps arrive monotonically and the list stays sorted by
//! construction; a debug assertion guards the invariant.
//!
//! ## Page blocks
//!
//! `PageBlock` carries the pieces the log cares about: a fix count (the
//! ownership reference while a mini-transaction works on the frame), the
//! S/SX/X latch, and the modification LSN pair. "Writing a page out" here
//! clears the modification LSNs; durability of the covering redo is the
//! caller's business and the engine flushes the log before asking for a
//! preflush.

pub mod latch;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::Lsn;

pub use latch::RwLatch;

/// Identifier of a page frame: tablespace id and page number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId {
    pub space_id: u32,
    pub page_no: u32,
}

impl PageId {
    pub fn new(space_id: u32, page_no: u32) -> Self {
        Self { space_id, page_no }
    }
}

/// Control block of one buffered page.
#[derive(Debug)]
pub struct PageBlock {
    id: PageId,
    /// Page latch taken through the mini-transaction memo.
    pub latch: RwLatch,
    fix_count: AtomicU32,
    /// LSN of the first unflushed modification, 0 when clean.
    oldest_modification: AtomicU64,
    /// LSN of the latest modification.
    newest_modification: AtomicU64,
}

impl PageBlock {
    fn new(id: PageId) -> Self {
        Self {
            id,
            latch: RwLatch::new(),
            fix_count: AtomicU32::new(0),
            oldest_modification: AtomicU64::new(0),
            newest_modification: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn fix(&self) {
        self.fix_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unfix(&self) {
        let previous = self.fix_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0);
    }

    pub fn fix_count(&self) -> u32 {
        self.fix_count.load(Ordering::Acquire)
    }

    pub fn oldest_modification(&self) -> Lsn {
        self.oldest_modification.load(Ordering::Acquire)
    }

    pub fn newest_modification(&self) -> Lsn {
        self.newest_modification.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.oldest_modification() != 0
    }
}

#[derive(Debug, Default)]
struct FlushList {
    entries: VecDeque<Arc<PageBlock>>,
    /// Last start LSN stamped; insertions must not go backwards.
    last_inserted: Lsn,
    /// A preflush batch is running; a second one must not start.
    flush_active: bool,
}

/// The in-memory pool of page control blocks plus the flush list.
#[derive(Debug, Default)]
pub struct BufferPool {
    pages: Mutex<HashMap<PageId, Arc<PageBlock>>>,
    flush_list: Mutex<FlushList>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the control block for a page, materializing it on first use.
    pub fn page(&self, id: PageId) -> Arc<PageBlock> {
        let mut pages = self.pages.lock();
        Arc::clone(
            pages
                .entry(id)
                .or_insert_with(|| Arc::new(PageBlock::new(id))),
        )
    }

    /// Oldest unflushed modification in the pool, 0 when everything is
    /// clean.
    pub fn oldest_modification(&self) -> Lsn {
        let list = self.flush_list.lock();
        list.entries
            .front()
            .map(|block| block.oldest_modification())
            .unwrap_or(0)
    }

    pub fn dirty_count(&self) -> usize {
        self.flush_list.lock().entries.len()
    }

    /// Stamp a page with the LSN interval of the committing
    /// mini-transaction and insert it into the flush list if it just
    /// became dirty. The caller serializes these through the log's
    /// flush-order mutex, which is what keeps `start_lsn` monotonic.
    pub fn note_modification(&self, block: &Arc<PageBlock>, start_lsn: Lsn, end_lsn: Lsn) {
        debug_assert!(start_lsn > 0 && end_lsn >= start_lsn);

        let mut list = self.flush_list.lock();
        block
            .newest_modification
            .store(end_lsn, Ordering::Release);
        if block.oldest_modification() == 0 {
            // First-time insertions are serialized by the flush-order
            // mutex; only they carry the ordering obligation.
            debug_assert!(
                start_lsn >= list.last_inserted,
                "flush list insertion went backwards: {} < {}",
                start_lsn,
                list.last_inserted
            );
            list.last_inserted = start_lsn;
            block
                .oldest_modification
                .store(start_lsn, Ordering::Release);
            list.entries.push_back(Arc::clone(block));
        }
    }

    /// Write out pages whose oldest modification is below `new_oldest`,
    /// so that `oldest_modification()` afterwards is at least
    /// `new_oldest` (or the pool is clean). Returns false without doing
    /// anything if another batch is already running.
    pub fn flush_pages_up_to(&self, new_oldest: Lsn) -> bool {
        {
            let mut list = self.flush_list.lock();
            if list.flush_active {
                return false;
            }
            list.flush_active = true;
        }

        loop {
            let block = {
                let mut list = self.flush_list.lock();
                let due = list
                    .entries
                    .front()
                    .is_some_and(|front| front.oldest_modification() < new_oldest);
                if !due {
                    break;
                }
                list.entries.pop_front()
            };
            if let Some(block) = block {
                // The frame write-out itself belongs to the embedder; the
                // pool's contract ends at clearing the modification LSNs.
                block.oldest_modification.store(0, Ordering::Release);
                block.newest_modification.store(0, Ordering::Release);
            }
        }

        self.flush_list.lock().flush_active = false;
        true
    }

    /// Whether a preflush batch is currently running.
    pub fn flush_batch_active(&self) -> bool {
        self.flush_list.lock().flush_active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_materialize_once() {
        let pool = BufferPool::new();
        let a = pool.page(PageId::new(1, 7));
        let b = pool.page(PageId::new(1, 7));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.id(), PageId::new(1, 7));
    }

    #[test]
    fn fix_counts_nest() {
        let pool = BufferPool::new();
        let page = pool.page(PageId::new(1, 1));

        page.fix();
        page.fix();
        assert_eq!(page.fix_count(), 2);
        page.unfix();
        page.unfix();
        assert_eq!(page.fix_count(), 0);
    }

    #[test]
    fn flush_list_tracks_oldest() {
        let pool = BufferPool::new();
        let a = pool.page(PageId::new(1, 1));
        let b = pool.page(PageId::new(1, 2));

        assert_eq!(pool.oldest_modification(), 0);

        pool.note_modification(&a, 100, 120);
        pool.note_modification(&b, 150, 160);
        assert_eq!(pool.oldest_modification(), 100);
        assert_eq!(pool.dirty_count(), 2);

        // A second interval on a dirty page moves newest, not oldest.
        pool.note_modification(&a, 200, 220);
        assert_eq!(a.oldest_modification(), 100);
        assert_eq!(a.newest_modification(), 220);
        assert_eq!(pool.dirty_count(), 2);
    }

    #[test]
    fn preflush_clears_below_target() {
        let pool = BufferPool::new();
        let a = pool.page(PageId::new(1, 1));
        let b = pool.page(PageId::new(1, 2));
        pool.note_modification(&a, 100, 120);
        pool.note_modification(&b, 150, 160);

        assert!(pool.flush_pages_up_to(150));
        assert_eq!(pool.oldest_modification(), 150);
        assert!(!a.is_dirty());
        assert!(b.is_dirty());

        assert!(pool.flush_pages_up_to(Lsn::MAX));
        assert_eq!(pool.oldest_modification(), 0);
    }

    #[test]
    #[should_panic]
    #[cfg(debug_assertions)]
    fn backwards_insertion_asserts() {
        let pool = BufferPool::new();
        let a = pool.page(PageId::new(1, 1));
        let b = pool.page(PageId::new(1, 2));
        pool.note_modification(&a, 200, 210);
        pool.note_modification(&b, 100, 110);
    }
}
