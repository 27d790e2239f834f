//! # Redo Log
//!
//! The append-only, monotonically numbered, group-committed log stream
//! and its lifecycle. One `RedoLog` instance owns:
//!
//! - the **log mutex** guarding the LSN, the staging buffer and the
//!   checkpoint bookkeeping (`LogInner`),
//! - the **flush-order mutex**, held by committing mini-transactions
//!   across the release of the log mutex so flush-list insertions happen
//!   in LSN order,
//! - the **write lock** and **flush lock**, group-commit structures
//!   serializing the two pipelined durability stages,
//! - the **files mutex** guarding the on-disk cursor state.
//!
//! ```text
//!  mtr commit ──► log mutex ──► staging buffer + data file append
//!                     │
//!  write_up_to ──► write lock ──► snapshot + switch ──► block file write
//!                     │                (log mutex released before I/O)
//!                 flush lock ──► fdatasync ──► flushed_to_disk_lsn
//! ```
//!
//! Lock order: log mutex, then flush-order mutex, then files mutex;
//! never the reverse. The physical block write of a wave runs without
//! the log mutex; the wave snapshots the write area and performs the
//! buffer switch before releasing it, and the next switch cannot happen
//! until this wave releases the write lock.
//!
//! ## Failure policy
//!
//! The log is the last line of durability and does not retry I/O: a
//! failed write or flush on the hot path emits one structured error line
//! and aborts the process. Setup paths (creation, capacity) return
//! `Result` normally.

pub mod block;
pub mod buffer;
pub mod checkpoint;
pub mod files;
pub mod group_commit;
pub mod varint;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use parking_lot::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::buf::BufferPool;
use crate::config::constants::{
    BLOCK_SIZE, FIRST_LSN, LOG_BUF_WRITE_MARGIN, POLL_INTERVAL_MS,
};
use crate::config::LogConfig;
use crate::Lsn;

use buffer::{align_down_block, align_up_block, LogInner};
use files::RedoFiles;
use group_commit::{AcquireResult, GroupCommitLock};

/// Abort the process after a redo I/O failure; the engine surfaces
/// nothing recoverable upward from the write path.
pub(crate) fn io_fatal(err: eyre::Report) -> ! {
    tracing::error!("redo log I/O failure: {:#}", err);
    std::process::abort();
}

/// Point-in-time counters for the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogStats {
    pub lsn: Lsn,
    pub write_lsn: Lsn,
    pub flushed_to_disk_lsn: Lsn,
    pub last_checkpoint_lsn: Lsn,
    pub n_log_ios: u64,
    pub flushes: u64,
    pub pending_flushes: usize,
    pub dirty_pages: usize,
}

/// The redo log engine. Mini-transactions hold an `Arc` of this.
pub struct RedoLog {
    pub(crate) inner: Mutex<LogInner>,
    /// Serializes flush-list insertion order across the log mutex
    /// release in mini-transaction commit.
    pub(crate) flush_order_mutex: Mutex<()>,
    write_lock: GroupCommitLock,
    flush_lock: GroupCommitLock,
    pub(crate) files: Mutex<RedoFiles>,
    pool: Arc<BufferPool>,
    pub(crate) write_ahead_size: usize,
    pub(crate) thread_concurrency: u32,
    pub(crate) active_mtrs: AtomicUsize,
    n_log_ios: AtomicU64,
    pending_flushes: AtomicUsize,
    flushes: AtomicU64,
}

impl RedoLog {
    /// Create a fresh log in `config.dir` and return the running engine.
    pub fn create(config: LogConfig, pool: Arc<BufferPool>) -> Result<Arc<Self>> {
        config.validate()?;
        let files = RedoFiles::create(&config, FIRST_LSN)?;
        let inner = LogInner::new(config.log_buffer_size, config.encrypt_log);

        let log = Arc::new(Self {
            inner: Mutex::new(inner),
            flush_order_mutex: Mutex::new(()),
            write_lock: GroupCommitLock::new(),
            flush_lock: GroupCommitLock::new(),
            files: Mutex::new(files),
            pool,
            write_ahead_size: config.write_ahead_size,
            thread_concurrency: config.thread_concurrency,
            active_mtrs: AtomicUsize::new(0),
            n_log_ios: AtomicU64::new(0),
            pending_flushes: AtomicUsize::new(0),
            flushes: AtomicU64::new(0),
        });
        log.set_capacity(config.log_file_size)?;

        info!(
            dir = %config.dir.display(),
            file_size = config.log_file_size,
            buffer = config.log_buffer_size,
            "redo log created"
        );
        Ok(log)
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub(crate) fn note_log_io(&self) {
        self.n_log_ios.fetch_add(1, Ordering::Relaxed);
    }

    /// Current LSN.
    pub fn lsn(&self) -> Lsn {
        self.inner.lock().lsn
    }

    /// Current LSN without blocking; `None` when the log mutex is busy.
    pub fn peek_lsn(&self) -> Option<Lsn> {
        self.inner.try_lock().map(|inner| inner.lsn)
    }

    pub fn flushed_to_disk_lsn(&self) -> Lsn {
        self.inner.lock().flushed_to_disk_lsn
    }

    pub fn last_checkpoint_lsn(&self) -> Lsn {
        self.inner.lock().last_checkpoint_lsn
    }

    pub fn stats(&self) -> LogStats {
        let inner = self.inner.lock();
        LogStats {
            lsn: inner.lsn,
            write_lsn: inner.write_lsn,
            flushed_to_disk_lsn: inner.flushed_to_disk_lsn,
            last_checkpoint_lsn: inner.last_checkpoint_lsn,
            n_log_ios: self.n_log_ios.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            pending_flushes: self.pending_flushes.load(Ordering::Relaxed),
            dirty_pages: self.pool.dirty_count(),
        }
    }

    /// Read a block-framed segment of the log stream back from disk.
    /// `start_lsn` is rounded down to its block; `buf` must be a multiple
    /// of the block size.
    pub fn read_log_segment(&self, start_lsn: Lsn, buf: &mut [u8]) -> Result<()> {
        let aligned = start_lsn & !(BLOCK_SIZE as Lsn - 1);
        self.files.lock().read_block_segment(aligned, buf)
    }

    /// The most recent durable checkpoint in the main file ring.
    pub fn latest_checkpoint(&self) -> Result<Option<files::CheckpointRecord>> {
        self.files.lock().read_latest_checkpoint()
    }

    /// Durably add a tablespace to the enumeration in the main file.
    pub fn register_tablespace(&self, space_id: u32, path: &str) -> Result<()> {
        self.files.lock().append_file_id_durable(space_id, path)
    }

    /// Scan record frames from a checkpoint position, honouring the
    /// sequence bit; recovery's entry point into the data file.
    pub fn read_records(&self, from: files::DataPos, max: usize) -> Result<Vec<Vec<u8>>> {
        self.files.lock().read_records(from, max)
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Ensure the log is written to the OS (and, when `flush_to_disk`,
    /// durable on the medium) up to `lsn`. Starts a new wave or
    /// piggy-backs on one already covering the request.
    pub fn write_up_to(&self, lsn: Lsn, flush_to_disk: bool) {
        if flush_to_disk && self.flush_lock.acquire(lsn) != AcquireResult::Acquired {
            return;
        }

        if self.write_lock.acquire(lsn) == AcquireResult::Acquired {
            let inner = self.inner.lock();
            let write_lsn = inner.lsn;
            self.write_lock.set_pending(write_lsn);
            self.write_buffer(inner);
            self.write_lock.release(write_lsn);
        }

        if !flush_to_disk {
            return;
        }

        // Flush the highest written LSN, unless a previous wave already
        // made it durable.
        let flush_lsn = self.write_lock.value();
        self.flush_lock.set_pending(flush_lsn);

        let durable = self.files.lock().data_writes_are_durable();
        if !durable {
            let behind = self.inner.lock().flushed_to_disk_lsn < flush_lsn;
            if behind {
                self.pending_flushes.fetch_add(1, Ordering::AcqRel);
                let result = {
                    let mut files = self.files.lock();
                    // Square the data file off at the write-ahead unit
                    // with a skip frame, then make it durable.
                    files
                        .pad_data_to(self.write_ahead_size)
                        .and_then(|()| files.flush_data())
                };
                self.pending_flushes.fetch_sub(1, Ordering::AcqRel);
                self.flushes.fetch_add(1, Ordering::Relaxed);
                if let Err(err) = result {
                    io_fatal(err);
                }

                let mut inner = self.inner.lock();
                debug_assert!(flush_lsn >= inner.flushed_to_disk_lsn);
                inner.flushed_to_disk_lsn = flush_lsn;
            }
        }

        self.flush_lock.release(flush_lsn);
    }

    /// Write the buffer to the log files up to the current LSN; with
    /// `durable` also flush it to the medium.
    pub fn flush_to_disk(&self, durable: bool) {
        let lsn = self.lsn();
        self.write_up_to(lsn, durable);
    }

    /// Background variant: returns immediately if a flush would be
    /// redundant.
    pub(crate) fn write_buffer_in_background(&self, flush: bool) {
        let lsn = {
            let inner = self.inner.lock();
            if flush && inner.flushed_to_disk_lsn >= inner.lsn {
                return;
            }
            inner.lsn
        };
        self.write_up_to(lsn, flush);
    }

    /// The write wave: snapshot the unwritten area, switch buffers,
    /// release the log mutex, then land the blocks on disk. Caller holds
    /// the write lock.
    fn write_buffer(&self, mut inner: MutexGuard<'_, LogInner>) {
        if inner.buf_free == inner.buf_next_to_write {
            // Nothing to write.
            return;
        }

        let start_offset = inner.buf_next_to_write;
        let end_offset = inner.buf_free;
        let area_start = align_down_block(start_offset);
        let area_end = align_up_block(end_offset);
        debug_assert!(area_end > area_start);

        let encrypted = inner.encrypted;
        let checkpoint_no = inner.next_checkpoint_no;
        {
            let base = if inner.first_in_use { 0 } else { inner.half_size };
            let buf = &mut inner.buf[base..];
            // The first block of the wave carries the flush bit; the last
            // block gets the current checkpoint number stamped now that it
            // is leaving memory.
            block::set_flush_bit(&mut buf[area_start..area_start + BLOCK_SIZE], true);
            block::set_checkpoint_no(
                &mut buf[area_end - BLOCK_SIZE..area_end],
                checkpoint_no,
            );
        }

        let write_end_lsn = inner.lsn;
        let base_lsn = inner.write_lsn & !(BLOCK_SIZE as Lsn - 1);
        let mut wave = inner.active()[area_start..area_end].to_vec();

        inner.buffer_switch();
        drop(inner);

        // Erase whatever the snapshot carried beyond the live bytes of
        // the last block.
        let live = end_offset - area_start;
        wave[live..].fill(0);

        for chunk in wave.chunks_mut(BLOCK_SIZE) {
            block::store_checksum(chunk, encrypted);
        }

        // Pad to the write-ahead unit so the device never has to
        // read-modify-write a partially covered unit.
        if self.write_ahead_size > BLOCK_SIZE {
            let end_pos = base_lsn as usize + wave.len();
            let in_unit = end_pos % self.write_ahead_size;
            if in_unit > 0 && wave.len() > in_unit {
                wave.resize(wave.len() + (self.write_ahead_size - in_unit), 0);
            }
        }

        let durable = {
            let files = self.files.lock();
            if let Err(err) = files.write_blocks(base_lsn, &wave) {
                io_fatal(err);
            }
            files.data_writes_are_durable()
        };
        self.n_log_ios.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock();
        inner.write_lsn = write_end_lsn;
        if durable && write_end_lsn > inner.flushed_to_disk_lsn {
            inner.flushed_to_disk_lsn = write_end_lsn;
        }
    }

    // ------------------------------------------------------------------
    // Reservation and extension
    // ------------------------------------------------------------------

    /// Make room for `len` record bytes in the staging buffer, driving
    /// background write waves while the buffer is too full. Returns with
    /// the log mutex held and the start LSN of the coming append.
    pub(crate) fn reserve_and_open<'a>(
        &'a self,
        mut inner: MutexGuard<'a, LogInner>,
        len: usize,
    ) -> (MutexGuard<'a, LogInner>, Lsn) {
        let mut tries = 0u32;
        loop {
            // Upper bound for the space the bytes may take with block
            // framing and write-ahead padding.
            let upper_limit = LOG_BUF_WRITE_MARGIN + self.write_ahead_size + (5 * len) / 4;

            if inner.buf_free + upper_limit <= inner.half_size {
                let lsn = inner.lsn;
                return (inner, lsn);
            }

            if upper_limit + BLOCK_SIZE > inner.half_size {
                // No write wave can ever make this reservation fit; the
                // buffer itself has to grow.
                inner.extend_to(2 * upper_limit);
                continue;
            }

            drop(inner);
            self.write_buffer_in_background(false);
            tries += 1;
            debug_assert!(tries < 50);
            inner = self.inner.lock();
        }
    }

    /// Grow the staging buffer so a mini-transaction of `len` record
    /// bytes fits comfortably. No queued bytes are lost.
    pub(crate) fn extend_buffer(&self, len: usize) {
        let mut inner = self.inner.lock();
        if len <= inner.half_size {
            // Someone else already extended far enough.
            return;
        }

        warn!(
            requested = len,
            current = inner.half_size,
            "mini-transaction exceeds half the log buffer; extending"
        );
        inner.extend_to(len);
        let new_size = inner.half_size;
        drop(inner);

        info!(new_size, "log buffer extended");
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Quiescent shutdown barrier. Waits until no mini-transactions, no
    /// pending checkpoint writes and no pending flushes remain, then
    /// makes a final checkpoint (unless `fast_shutdown == 2`, which only
    /// flushes the log and leaves crash recovery to do the rest), flushes
    /// and closes the files. Returns the final LSN for the embedder to
    /// stamp into its data file headers.
    pub fn shutdown_and_mark_files(&self, fast_shutdown: u32) -> Lsn {
        info!(fast_shutdown, "starting redo log shutdown");
        let poll = Duration::from_millis(POLL_INTERVAL_MS);

        loop {
            if self.active_mtrs.load(Ordering::Acquire) > 0 {
                std::thread::sleep(poll);
                continue;
            }

            let pending_checkpoints = self.inner.lock().n_pending_checkpoint_writes;
            if pending_checkpoints > 0
                || self.pending_flushes.load(Ordering::Acquire) > 0
                || self.pool.flush_batch_active()
            {
                std::thread::sleep(poll);
                continue;
            }

            if fast_shutdown == 2 {
                // Crash-consistent shutdown: make the log durable and let
                // recovery rebuild the rest at the next startup.
                info!("fast shutdown: flushing the log without a checkpoint");
                self.flush_to_disk(true);
                break;
            }

            self.make_checkpoint();

            let inner = self.inner.lock();
            let quiet = inner.lsn == inner.last_checkpoint_lsn;
            drop(inner);
            if !quiet {
                // Something slipped in between the checkpoint and now.
                std::thread::sleep(poll);
                continue;
            }

            if let Err(err) = self.files.lock().flush_data() {
                io_fatal(err);
            }
            break;
        }

        let lsn = self.inner.lock().lsn;
        if let Err(err) = self.files.lock().close() {
            io_fatal(err);
        }
        info!(lsn, "redo log shutdown complete");
        lsn
    }
}
