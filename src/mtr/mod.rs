//! # Mini-Transactions
//!
//! A mini-transaction is the atomic unit of page-level modification:
//! it groups the redo records and page latches of one change set, and
//! its commit installs the records into the global log as one contiguous
//! LSN interval while stamping every dirtied page into the flush list.
//!
//! ## Commit protocol
//!
//! ```text
//! 1. prepare:  append the end-of-group sentinel, extend the log buffer
//!              for oversize records, take the log mutex, run the
//!              checkpoint age gate
//! 2. finish:   fast single-block append, or reserve + stream the chain
//!              + close the group; frame the record into the data file
//!              -> (start_lsn, commit_lsn]
//! 3. order:    take the flush-order mutex (made_dirty only), release
//!              the log mutex, insert dirty pages into the flush list
//!              stamped (start_lsn, commit_lsn), drop the flush-order
//!              mutex
//! 4. release:  walk the memo in reverse, unlatching and unfixing
//! ```
//!
//! Step 3 is the write-ahead-logging linchpin: because the flush-order
//! mutex is acquired before the log mutex is released, flush-list
//! insertion order equals log-mutex order even though the insertions
//! themselves happen after the mutex is gone.
//!
//! Read-only mini-transactions (and `LogMode::None`) skip straight to
//! step 4. Dropping an uncommitted mini-transaction releases its memo;
//! modifications without a commit are a contract violation caught by
//! debug assertions.

pub mod buf;
pub mod memo;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::MutexGuard;
use smallvec::SmallVec;

use crate::buf::{PageBlock, RwLatch};
use crate::log::buffer::LogInner;
use crate::log::{io_fatal, RedoLog};
use crate::Lsn;

use buf::RecBuf;
use memo::{MemoSlot, MemoType};

/// What the mini-transaction writes to the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    /// Log every modification (the default).
    All,
    /// Modify pages without redo (bulk loads into fresh files whose
    /// durability is handled elsewhere).
    NoRedo,
    /// Neither log nor modify; reads only.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MtrState {
    Active,
    Committed,
}

/// One mini-transaction. Create with [`MiniTransaction::start`], finish
/// with [`MiniTransaction::commit`] (or [`rollback`](Self::rollback) for
/// read-only work).
pub struct MiniTransaction {
    redo: Arc<RedoLog>,
    state: MtrState,
    log_mode: LogMode,
    log: RecBuf,
    memo: SmallVec<[MemoSlot; 16]>,
    modifications: bool,
    made_dirty: bool,
    inside_ibuf: bool,
    commit_lsn: Lsn,
}

impl MiniTransaction {
    pub fn start(redo: Arc<RedoLog>) -> Self {
        redo.active_mtrs.fetch_add(1, Ordering::AcqRel);
        Self {
            redo,
            state: MtrState::Active,
            log_mode: LogMode::All,
            log: RecBuf::new(),
            memo: SmallVec::new(),
            modifications: false,
            made_dirty: false,
            inside_ibuf: false,
            commit_lsn: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == MtrState::Active
    }

    pub fn log_mode(&self) -> LogMode {
        self.log_mode
    }

    /// Switch the logging mode; returns the previous one.
    pub fn set_log_mode(&mut self, mode: LogMode) -> LogMode {
        debug_assert!(self.is_active());
        std::mem::replace(&mut self.log_mode, mode)
    }

    pub fn set_inside_ibuf(&mut self, inside: bool) {
        self.inside_ibuf = inside;
    }

    /// LSN of the commit, 0 until committed or when nothing was logged.
    pub fn commit_lsn(&self) -> Lsn {
        self.commit_lsn
    }

    pub fn made_dirty(&self) -> bool {
        self.made_dirty
    }

    // ------------------------------------------------------------------
    // Memo: latching and fixing
    // ------------------------------------------------------------------

    /// Fix a page without latching it.
    pub fn buf_fix_page(&mut self, page: &Arc<PageBlock>) {
        debug_assert!(self.is_active());
        page.fix();
        self.memo
            .push(MemoSlot::page(Arc::clone(page), MemoType::BufFix));
    }

    /// Fix and S-latch a page.
    pub fn s_latch_page(&mut self, page: &Arc<PageBlock>) {
        debug_assert!(self.is_active());
        page.fix();
        page.latch.lock_s();
        self.memo
            .push(MemoSlot::page(Arc::clone(page), MemoType::PageSFix));
    }

    /// Fix and SX-latch a page.
    pub fn sx_latch_page(&mut self, page: &Arc<PageBlock>) {
        debug_assert!(self.is_active());
        page.fix();
        page.latch.lock_sx();
        self.memo
            .push(MemoSlot::page(Arc::clone(page), MemoType::PageSxFix));
    }

    /// Fix and X-latch a page.
    pub fn x_latch_page(&mut self, page: &Arc<PageBlock>) {
        debug_assert!(self.is_active());
        page.fix();
        page.latch.lock_x();
        self.memo
            .push(MemoSlot::page(Arc::clone(page), MemoType::PageXFix));
    }

    /// Take a standalone rw-latch in S mode.
    pub fn s_lock(&mut self, latch: &Arc<RwLatch>) {
        debug_assert!(self.is_active());
        latch.lock_s();
        self.memo
            .push(MemoSlot::latch(Arc::clone(latch), MemoType::SLock));
    }

    /// Take a standalone rw-latch in SX mode.
    pub fn sx_lock(&mut self, latch: &Arc<RwLatch>) {
        debug_assert!(self.is_active());
        latch.lock_sx();
        self.memo
            .push(MemoSlot::latch(Arc::clone(latch), MemoType::SxLock));
    }

    /// Take a standalone rw-latch in X mode.
    pub fn x_lock(&mut self, latch: &Arc<RwLatch>) {
        debug_assert!(self.is_active());
        latch.lock_x();
        self.memo
            .push(MemoSlot::latch(Arc::clone(latch), MemoType::XLock));
    }

    /// Whether the memo holds a live slot of this type for the page.
    pub fn memo_contains_page(&self, page: &Arc<PageBlock>, slot_type: MemoType) -> bool {
        self.memo.iter().rev().any(|slot| {
            slot.slot_type == slot_type
                && slot.page_ref().is_some_and(|held| Arc::ptr_eq(held, page))
        })
    }

    /// Mark a latched page as modified. The page must already be X- or
    /// SX-latched through this mini-transaction; the `Modify` marker is
    /// pushed at most once per page.
    pub fn modify_page(&mut self, page: &Arc<PageBlock>) {
        debug_assert!(self.is_active());
        debug_assert!(
            self.memo_contains_page(page, MemoType::PageXFix)
                || self.memo_contains_page(page, MemoType::PageSxFix),
            "page modified without an exclusive latch in the memo"
        );

        self.modifications = true;
        if !page.is_dirty() {
            self.made_dirty = true;
        }
        if !self.memo_contains_page(page, MemoType::Modify) {
            self.memo
                .push(MemoSlot::page(Arc::clone(page), MemoType::Modify));
        }
    }

    /// Release one page's latch and fix before commit, nulling its slot
    /// in place. A page written to in this mini-transaction must stay
    /// latched until commit.
    pub fn release_page(&mut self, page: &Arc<PageBlock>, slot_type: MemoType) {
        debug_assert!(self.is_active());
        debug_assert!(!(self.modifications && slot_type == MemoType::PageXFix));

        for slot in self.memo.iter_mut().rev() {
            if slot.slot_type == slot_type
                && slot.page_ref().is_some_and(|held| Arc::ptr_eq(held, page))
            {
                slot.release();
                return;
            }
        }
        debug_assert!(false, "released page not found in the memo");
    }

    // ------------------------------------------------------------------
    // Record staging
    // ------------------------------------------------------------------

    /// Append redo record bytes to this mini-transaction's local buffer.
    /// Ignored outside `LogMode::All`.
    pub fn append_log(&mut self, bytes: &[u8]) {
        debug_assert!(self.is_active());
        debug_assert!(!bytes.is_empty());
        if self.log_mode != LogMode::All {
            return;
        }
        self.log.push(bytes);
        self.modifications = true;
    }

    /// Bytes staged so far.
    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    // ------------------------------------------------------------------
    // Commit
    // ------------------------------------------------------------------

    /// Commit: install the records into the log, stamp dirtied pages
    /// into the flush list and release every latch in reverse order.
    /// Returns the commit LSN, 0 when nothing was logged. Durability is
    /// the caller's choice via [`RedoLog::write_up_to`].
    pub fn commit(mut self) -> Lsn {
        debug_assert!(self.is_active());
        debug_assert!(!self.inside_ibuf);
        debug_assert!(
            !(self.modifications && self.log_mode == LogMode::None),
            "modifications under LogMode::None"
        );

        if self.modifications && (self.log_mode == LogMode::NoRedo || !self.log.is_empty()) {
            let redo = Arc::clone(&self.redo);

            let (inner, len) = self.prepare_write(&redo);
            let (inner, start_lsn) = if len > 0 {
                self.finish_write(&redo, inner, len)
            } else {
                (inner, self.commit_lsn)
            };

            // Taking the flush-order mutex before the log mutex goes
            // away is what makes the insertions below land in LSN order.
            let order_guard = self.made_dirty.then(|| redo.flush_order_mutex.lock());
            drop(inner);

            for slot in self.memo.iter().rev() {
                if slot.slot_type.dirties_page() {
                    if let Some(page) = slot.page_ref() {
                        redo.buffer_pool()
                            .note_modification(page, start_lsn, self.commit_lsn);
                    }
                }
            }
            drop(order_guard);

            self.release_all();
        } else {
            self.release_all();
        }

        self.log.erase();
        self.state = MtrState::Committed;
        self.commit_lsn
    }

    /// Discard a read-only mini-transaction, releasing its memo.
    pub fn rollback(mut self) {
        debug_assert!(self.is_active());
        debug_assert!(!self.modifications, "rollback of a modifying mini-transaction");
        self.release_all();
        self.log.erase();
        self.state = MtrState::Committed;
    }

    /// Step 1: sentinel byte, buffer extension, log mutex, age gate.
    /// Returns the guard and the number of bytes to install (0 for
    /// `NoRedo`, which only snapshots the LSN).
    fn prepare_write<'a>(
        &mut self,
        redo: &'a RedoLog,
    ) -> (MutexGuard<'a, LogInner>, usize) {
        if self.log_mode != LogMode::All {
            debug_assert_eq!(self.log_mode, LogMode::NoRedo);
            debug_assert!(self.log.is_empty());
            let inner = redo.inner.lock();
            self.commit_lsn = inner.lsn;
            return (inner, 0);
        }

        debug_assert!(!self.log.is_empty());
        // End-of-group sentinel: recovery knows the group is complete
        // when it reads it.
        self.log.push_byte(0);
        let len = self.log.len();

        let half = redo.inner.lock().half_size;
        if len > half / 2 {
            redo.extend_buffer((len + 1) * 2);
        }

        let inner = redo.inner.lock();
        let inner = redo.margin_checkpoint_age(inner, len as u64);
        (inner, len)
    }

    /// Step 2: install the record bytes under the log mutex. Returns the
    /// guard still held and the start LSN.
    fn finish_write<'a>(
        &mut self,
        redo: &'a RedoLog,
        inner: MutexGuard<'a, LogInner>,
        len: usize,
    ) -> (MutexGuard<'a, LogInner>, Lsn) {
        debug_assert_eq!(self.log_mode, LogMode::All);
        debug_assert_eq!(self.log.len(), len);

        let (inner, start_lsn) = if self.log.is_small() {
            let mut inner = inner;
            match inner.reserve_and_write_fast(self.log.front()) {
                Some((start, end)) => {
                    self.commit_lsn = end;
                    (inner, start)
                }
                None => {
                    let (inner, start) = self.finish_write_slow(redo, inner, len);
                    (inner, start)
                }
            }
        } else {
            self.finish_write_slow(redo, inner, len)
        };

        // Mirror the group into the record-framed data file, in the same
        // log-mutex order as the staging buffer.
        {
            let chunks = self.log.chunks();
            let mut files = redo.files.lock();
            match files.append_record(&chunks) {
                Ok(pos) => files.note_record(start_lsn, pos),
                Err(err) => io_fatal(err),
            }
        }

        debug_assert!(self.commit_lsn >= start_lsn);
        (inner, start_lsn)
    }

    fn finish_write_slow<'a>(
        &mut self,
        redo: &'a RedoLog,
        inner: MutexGuard<'a, LogInner>,
        len: usize,
    ) -> (MutexGuard<'a, LogInner>, Lsn) {
        let (mut inner, start_lsn) = redo.reserve_and_open(inner, len);
        self.log.for_each_block(|bytes| inner.write_low(bytes));
        self.commit_lsn = redo.close_group(&mut inner);
        (inner, start_lsn)
    }

    /// Step 4: walk the memo in reverse and let go of everything.
    fn release_all(&mut self) {
        for slot in self.memo.iter_mut().rev() {
            slot.release();
        }
    }
}

impl Drop for MiniTransaction {
    fn drop(&mut self) {
        if self.state == MtrState::Active {
            // Abandoned without commit: release the memo so no latch
            // leaks. Modifications without a commit trip the assertions
            // above in debug builds.
            self.release_all();
        }
        self.redo.active_mtrs.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::{BufferPool, PageId};
    use crate::config::LogConfig;
    use tempfile::tempdir;

    fn engine(dir: &std::path::Path) -> (Arc<RedoLog>, Arc<BufferPool>) {
        let pool = Arc::new(BufferPool::new());
        let config = LogConfig::new(dir).with_file_size(4 * 1024 * 1024);
        let redo = RedoLog::create(config, Arc::clone(&pool)).unwrap();
        (redo, pool)
    }

    #[test]
    fn read_only_commit_leaves_lsn_alone() {
        let dir = tempdir().unwrap();
        let (redo, pool) = engine(dir.path());

        let lsn_before = redo.lsn();
        let page = pool.page(PageId::new(1, 1));

        let mut mtr = MiniTransaction::start(Arc::clone(&redo));
        mtr.s_latch_page(&page);
        let commit_lsn = mtr.commit();

        assert_eq!(commit_lsn, 0);
        assert_eq!(redo.lsn(), lsn_before);
        assert_eq!(page.fix_count(), 0);
    }

    #[test]
    fn modify_requires_exclusive_latch() {
        let dir = tempdir().unwrap();
        let (redo, pool) = engine(dir.path());
        let page = pool.page(PageId::new(1, 1));

        let mut mtr = MiniTransaction::start(redo);
        mtr.x_latch_page(&page);
        mtr.append_log(b"update");
        mtr.modify_page(&page);
        mtr.modify_page(&page);

        // One Modify marker despite two calls.
        let markers = mtr
            .memo
            .iter()
            .filter(|slot| slot.slot_type == MemoType::Modify)
            .count();
        assert_eq!(markers, 1);
        mtr.commit();
    }

    #[test]
    fn commit_stamps_dirty_page_interval() {
        let dir = tempdir().unwrap();
        let (redo, pool) = engine(dir.path());
        let page = pool.page(PageId::new(1, 7));

        let start = redo.lsn();
        let mut mtr = MiniTransaction::start(Arc::clone(&redo));
        mtr.x_latch_page(&page);
        mtr.append_log(b"UPDATE P");
        mtr.modify_page(&page);
        assert!(mtr.made_dirty());
        let commit_lsn = mtr.commit();

        // 8 payload bytes + 1 sentinel, all within one block.
        assert_eq!(commit_lsn, start + 9);
        assert_eq!(page.oldest_modification(), start);
        assert_eq!(page.newest_modification(), commit_lsn);
        assert_eq!(pool.dirty_count(), 1);
        assert_eq!(page.fix_count(), 0);
        assert!(!page.latch.is_x_locked());
    }

    #[test]
    fn no_redo_mode_dirties_without_logging() {
        let dir = tempdir().unwrap();
        let (redo, pool) = engine(dir.path());
        let page = pool.page(PageId::new(2, 1));

        let lsn_before = redo.lsn();
        let mut mtr = MiniTransaction::start(Arc::clone(&redo));
        mtr.set_log_mode(LogMode::NoRedo);
        mtr.x_latch_page(&page);
        mtr.append_log(b"not logged");
        mtr.modify_page(&page);
        let commit_lsn = mtr.commit();

        assert_eq!(redo.lsn(), lsn_before);
        assert_eq!(commit_lsn, lsn_before);
        assert!(page.is_dirty());
    }

    #[test]
    fn drop_releases_latches() {
        let dir = tempdir().unwrap();
        let (redo, pool) = engine(dir.path());
        let page = pool.page(PageId::new(1, 3));

        {
            let mut mtr = MiniTransaction::start(Arc::clone(&redo));
            mtr.s_latch_page(&page);
        }
        assert_eq!(page.fix_count(), 0);
        page.latch.lock_x();
        page.latch.unlock_x();
        assert_eq!(redo.active_mtrs.load(Ordering::Acquire), 0);
    }

    #[test]
    fn early_release_nulls_slot() {
        let dir = tempdir().unwrap();
        let (redo, pool) = engine(dir.path());
        let a = pool.page(PageId::new(1, 1));
        let b = pool.page(PageId::new(1, 2));

        let mut mtr = MiniTransaction::start(redo);
        mtr.s_latch_page(&a);
        mtr.s_latch_page(&b);
        mtr.release_page(&a, MemoType::PageSFix);

        assert_eq!(a.fix_count(), 0);
        assert_eq!(b.fix_count(), 1);
        assert!(!mtr.memo_contains_page(&a, MemoType::PageSFix));
        mtr.rollback();
        assert_eq!(b.fix_count(), 0);
    }
}
