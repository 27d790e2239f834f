//! # Checkpoint Engine
//!
//! A checkpoint is a durable record stating "all page state before this
//! LSN is safe": every dirty page covered by older redo has either been
//! written out or its covering redo is durable. Checkpoints bound crash
//! recovery and free the circular files for reuse.
//!
//! ## Age arithmetic
//!
//! Everything derives from two ages, computed under the log mutex:
//!
//! ```text
//! checkpoint_age   = lsn - last_checkpoint_lsn
//! modification_age = lsn - oldest_dirty_lsn      (0 when clean)
//! ```
//!
//! and four ceilings derived from the log capacity at startup:
//!
//! ```text
//! max_modified_age_async   margin - margin/8    preflush, background
//! max_modified_age_sync    margin - margin/16   preflush, caller waits
//! max_checkpoint_age_async margin - margin/32   checkpoint, background
//! max_checkpoint_age       margin               hard gate
//! ```
//!
//! where `margin` is the file size minus a 10% safety cut and a free
//! reserve per concurrent thread (a thread mid-statement must always be
//! able to append its records; running out of log space is fatal to the
//! server, so the reserve errs large).
//!
//! ## Writers' gate
//!
//! `margin_checkpoint_age` runs in every commit's prepare step: if the
//! incoming record bytes would push the checkpoint age past capacity it
//! makes a synchronous checkpoint right there, sleeping briefly first
//! when the oldest dirty page itself is what is holding the age back. A
//! record larger than the whole capacity gets a rate-limited error and
//! proceeds; the append will fail downstream and that failure is the
//! caller's to surface.

use std::time::{Duration, Instant};

use eyre::{ensure, Result};
use parking_lot::MutexGuard;
use tracing::error;

use crate::config::constants::{
    CHECKPOINT_EXTRA_FREE, CHECKPOINT_FREE_PER_THREAD, LOG_POOL_CHECKPOINT_RATIO_ASYNC,
    LOG_POOL_PREFLUSH_RATIO_ASYNC, LOG_POOL_PREFLUSH_RATIO_SYNC, LSN_MAX, POLL_INTERVAL_MS,
    WARNING_INTERVAL_SECS,
};
use crate::Lsn;

use super::buffer::LogInner;
use super::{io_fatal, RedoLog};

impl RedoLog {
    /// Oldest modification in the buffer pool, or the current LSN when
    /// the pool is clean (the log may still contain dummy bytes that no
    /// page refers to).
    fn oldest_modification_or_lsn(&self, inner: &LogInner) -> Lsn {
        let oldest = self.buffer_pool().oldest_modification();
        if oldest == 0 {
            inner.lsn
        } else {
            oldest
        }
    }

    /// Derive the capacity and the age ceilings from the log file size.
    /// Fails when the file cannot reserve enough free space for the
    /// configured thread concurrency.
    pub fn set_capacity(&self, file_size: u64) -> Result<()> {
        let mut capacity = file_size;
        capacity -= capacity / 10;

        let free = CHECKPOINT_FREE_PER_THREAD * (10 + self.thread_concurrency as u64)
            + CHECKPOINT_EXTRA_FREE;
        ensure!(
            free < capacity / 2,
            "log file size {} is too small for thread_concurrency={}; it must exceed {} bytes",
            file_size,
            self.thread_concurrency,
            free * 2 * 10 / 9
        );

        let mut margin = capacity - free;
        margin -= margin / 10;

        let mut inner = self.inner.lock();
        inner.log_capacity = capacity;
        inner.max_modified_age_async = margin - margin / LOG_POOL_PREFLUSH_RATIO_ASYNC;
        inner.max_modified_age_sync = margin - margin / LOG_POOL_PREFLUSH_RATIO_SYNC;
        inner.max_checkpoint_age_async = margin - margin / LOG_POOL_CHECKPOINT_RATIO_ASYNC;
        inner.max_checkpoint_age = margin;
        Ok(())
    }

    /// Gate run by every commit: keep `margin` more bytes from
    /// overwriting the last checkpoint. May release the log mutex,
    /// checkpoint synchronously and re-acquire it.
    pub(crate) fn margin_checkpoint_age<'a>(
        &'a self,
        mut inner: MutexGuard<'a, LogInner>,
        margin: u64,
    ) -> MutexGuard<'a, LogInner> {
        if margin > inner.log_capacity {
            // Warn instead of waiting for a checkpoint that can never
            // cover this; the append itself will fail downstream.
            let now = Instant::now();
            let stale = inner
                .last_capacity_warning
                .map_or(true, |at| now.duration_since(at).as_secs() > WARNING_INTERVAL_SECS);
            if stale {
                inner.last_capacity_warning = Some(now);
                error!(
                    margin,
                    capacity = inner.log_capacity,
                    "mini-transaction log exceeds the log capacity; \
                     the checkpoint age may overrun it"
                );
            }
            return inner;
        }

        if inner.lsn - inner.last_checkpoint_lsn + margin > inner.log_capacity {
            // The append would overwrite un-checkpointed log. Checkpoint
            // once; we cannot wait in a loop while this thread may hold
            // the latch on the oldest dirty page.
            let flushed_enough = inner.lsn - self.oldest_modification_or_lsn(&inner) + margin
                <= inner.log_capacity;
            inner.check_flush_or_checkpoint = true;
            drop(inner);

            if !flushed_enough {
                std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
            }
            self.checkpoint();

            inner = self.inner.lock();
        }

        inner
    }

    /// Close a record group: finish the staging-buffer bookkeeping, then
    /// look at the ages and raise the attention flag (and a rate-limited
    /// error once the age has outrun the capacity). Returns the group's
    /// end LSN.
    pub(crate) fn close_group(&self, inner: &mut LogInner) -> Lsn {
        let lsn = inner.close_group();

        let checkpoint_age = lsn - inner.last_checkpoint_lsn;
        if checkpoint_age >= inner.log_capacity {
            let now = Instant::now();
            let stale = inner
                .last_age_warning
                .map_or(true, |at| now.duration_since(at).as_secs() > WARNING_INTERVAL_SECS);
            if stale {
                inner.last_age_warning = Some(now);
                error!(
                    checkpoint_age,
                    capacity = inner.log_capacity,
                    "the age of the last checkpoint exceeds the log capacity"
                );
            }
        }

        if checkpoint_age > inner.max_modified_age_sync {
            let oldest = self.buffer_pool().oldest_modification();
            if oldest == 0
                || lsn - oldest > inner.max_modified_age_sync
                || checkpoint_age > inner.max_checkpoint_age_async
            {
                inner.check_flush_or_checkpoint = true;
            }
        }

        lsn
    }

    /// Flush dirty pages until the pool's oldest modification reaches
    /// `new_oldest`, with the covering redo made durable first. Returns
    /// false when another preflush batch was already running.
    pub fn preflush_pages(&self, new_oldest: Lsn) -> bool {
        // Write-ahead: no page may reach its file before its redo.
        self.flush_to_disk(true);
        self.buffer_pool().flush_pages_up_to(new_oldest)
    }

    /// Make a checkpoint at the oldest dirty LSN (or the current LSN on
    /// a clean pool) without flushing any pages. Returns false when a
    /// concurrent checkpoint writer won the race.
    pub fn checkpoint(&self) -> bool {
        let inner = self.inner.lock();
        let flush_lsn = self.oldest_modification_or_lsn(&inner);
        debug_assert!(flush_lsn >= inner.last_checkpoint_lsn);

        if flush_lsn == inner.last_checkpoint_lsn {
            // Nothing was logged since the previous checkpoint.
            return true;
        }
        drop(inner);

        // The write-ahead-logging protocol guarantees redo up to the
        // oldest dirty LSN covers every written page; make it durable.
        self.write_up_to(flush_lsn, true);

        let mut inner = self.inner.lock();
        debug_assert!(inner.flushed_to_disk_lsn >= flush_lsn);
        if inner.last_checkpoint_lsn == flush_lsn {
            return true;
        }
        if inner.n_pending_checkpoint_writes > 0 {
            return false;
        }

        inner.next_checkpoint_lsn = flush_lsn;
        inner.n_pending_checkpoint_writes += 1;
        let checkpoint_no = inner.next_checkpoint_no;
        drop(inner);

        {
            let mut files = self.files.lock();
            let pos = files.checkpoint_pos(flush_lsn);
            if let Err(err) = files.append_checkpoint_durable(flush_lsn, pos, checkpoint_no) {
                io_fatal(err);
            }
            files.prune_index(flush_lsn);
        }
        self.note_log_io();

        let mut inner = self.inner.lock();
        inner.n_pending_checkpoint_writes -= 1;
        debug_assert_eq!(inner.n_pending_checkpoint_writes, 0);
        inner.last_checkpoint_lsn = inner.next_checkpoint_lsn;
        inner.next_checkpoint_no += 1;
        true
    }

    /// Preflush everything and retry until a checkpoint lands at the
    /// latest LSN.
    pub fn make_checkpoint(&self) {
        while !self.preflush_pages(LSN_MAX) {
            std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
        }
        while !self.checkpoint() {
            std::thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
        }
    }

    /// Re-establish the age margins: preflush pages when the
    /// modification age is past its sync ceiling, checkpoint when the
    /// checkpoint age is past its async ceiling. Loops until the
    /// attention flag clears. The caller must hold no latches.
    pub fn checkpoint_margin(&self) {
        loop {
            let mut inner = self.inner.lock();
            if !inner.check_flush_or_checkpoint {
                return;
            }

            let oldest = self.oldest_modification_or_lsn(&inner);
            let modification_age = inner.lsn - oldest;
            let advance = if modification_age > inner.max_modified_age_sync {
                modification_age - inner.max_modified_age_sync
            } else {
                0
            };

            let checkpoint_age = inner.lsn - inner.last_checkpoint_lsn;
            debug_assert!(inner.max_checkpoint_age >= inner.max_checkpoint_age_async);
            let do_checkpoint = checkpoint_age > inner.max_checkpoint_age_async;
            if checkpoint_age <= inner.max_checkpoint_age {
                inner.check_flush_or_checkpoint = false;
            }
            drop(inner);

            if advance > 0 {
                let new_oldest = oldest + advance;
                if !self.preflush_pages(new_oldest) {
                    // Another batch was flushing; have another look.
                    self.inner.lock().check_flush_or_checkpoint = true;
                    continue;
                }
            }

            if do_checkpoint {
                self.checkpoint();
            }
            return;
        }
    }

    /// Drive a write wave when the buffer has run past its free-space
    /// ceiling, so appends keep finding room.
    pub fn flush_margin(&self) {
        let lsn = {
            let inner = self.inner.lock();
            if inner.buf_free > inner.max_buf_free {
                inner.lsn
            } else {
                0
            }
        };
        if lsn != 0 {
            self.write_up_to(lsn, false);
        }
    }

    /// Re-establish both margins until nothing is left to do. The caller
    /// must hold no latches.
    pub fn check_margins(&self) {
        loop {
            self.flush_margin();
            self.checkpoint_margin();
            if !self.inner.lock().check_flush_or_checkpoint {
                return;
            }
        }
    }

    /// Pre-statement gate: cheap check of the attention flag, with the
    /// full margin work only when it is set. Call before starting a
    /// statement that may dirty pages, never while holding latches.
    pub fn free_check(&self) {
        let flagged = self.inner.lock().check_flush_or_checkpoint;
        if flagged {
            self.check_margins();
        }
    }
}
