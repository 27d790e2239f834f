//! # In-Memory Log Buffer
//!
//! The double-buffered staging area of the log. One allocation holds two
//! halves of `half_size` bytes; `first_in_use` selects the active half
//! that appends go into, while a write wave may still be landing the
//! other half on disk.
//!
//! ```text
//!        ┌────────── half 0 ──────────┬────────── half 1 ──────────┐
//! buf:   │ B0 | B1 | B2 | B3(partial) │          (idle)            │
//!        └────────────────────────────┴────────────────────────────┘
//!               ▲ buf_next_to_write         ▲ buf_free
//!
//! switch: copy B3 to the front of half 1, flip first_in_use,
//!         buf_free %= 512, buf_next_to_write = buf_free
//! ```
//!
//! The copy of the last partial block is what lets a record group that
//! straddles the switch continue coherently in the other half. A switch
//! only happens inside a write wave, which the write lock serializes, so
//! the half being landed is never appended to.
//!
//! Appends keep the block headers of the active half correct as they go:
//! a block that fills up gets its final data length and checkpoint number
//! stamped and the next block's header initialized, advancing the LSN by
//! the framing overhead on top of the payload bytes. Checksums are not
//! maintained here; the write wave stamps them on its snapshot.
//!
//! All of this state lives inside the log mutex; nothing here takes
//! locks.

use crate::config::constants::{
    BLOCK_HDR_SIZE, BLOCK_SIZE, FIRST_LSN, LOG_BUF_FLUSH_MARGIN, LOG_BUF_FLUSH_RATIO, PAGE_SIZE,
};
use crate::log::block;
use crate::Lsn;
use std::time::Instant;

/// Round down to a block boundary.
pub fn align_down_block(value: usize) -> usize {
    value & !(BLOCK_SIZE - 1)
}

/// Round up to a block boundary.
pub fn align_up_block(value: usize) -> usize {
    (value + BLOCK_SIZE - 1) & !(BLOCK_SIZE - 1)
}

/// Everything the log mutex protects.
pub(crate) struct LogInner {
    /// Current log sequence number.
    pub lsn: Lsn,
    /// Both halves of the staging buffer, back to back.
    pub buf: Vec<u8>,
    /// Size of one half.
    pub half_size: usize,
    /// Which half appends currently go into.
    pub first_in_use: bool,
    /// First free offset within the active half.
    pub buf_free: usize,
    /// Boundary between bytes already landed by a write wave and bytes
    /// only in memory.
    pub buf_next_to_write: usize,
    /// Recommended ceiling for `buf_free`; beyond it the margin code
    /// drives a write wave.
    pub max_buf_free: usize,
    /// Set when the buffer, the pool or the checkpoint age needs
    /// attention; peeked by the pre-statement gate.
    pub check_flush_or_checkpoint: bool,
    /// Last LSN landed by a write wave.
    pub write_lsn: Lsn,
    /// Last LSN known durable on the medium.
    pub flushed_to_disk_lsn: Lsn,
    pub last_checkpoint_lsn: Lsn,
    pub next_checkpoint_lsn: Lsn,
    pub next_checkpoint_no: u64,
    pub n_pending_checkpoint_writes: usize,
    /// Age ceilings derived from the file size; see the checkpoint
    /// engine.
    pub log_capacity: Lsn,
    pub max_modified_age_async: Lsn,
    pub max_modified_age_sync: Lsn,
    pub max_checkpoint_age_async: Lsn,
    pub max_checkpoint_age: Lsn,
    /// Whether blocks reserve the encryption key slot.
    pub encrypted: bool,
    pub last_capacity_warning: Option<Instant>,
    pub last_age_warning: Option<Instant>,
}

impl LogInner {
    pub fn new(half_size: usize, encrypted: bool) -> Self {
        let mut inner = Self {
            lsn: FIRST_LSN,
            buf: vec![0u8; half_size * 2],
            half_size,
            first_in_use: true,
            buf_free: BLOCK_HDR_SIZE,
            buf_next_to_write: BLOCK_HDR_SIZE,
            max_buf_free: 0,
            check_flush_or_checkpoint: true,
            write_lsn: FIRST_LSN,
            flushed_to_disk_lsn: FIRST_LSN,
            last_checkpoint_lsn: FIRST_LSN,
            next_checkpoint_lsn: FIRST_LSN,
            next_checkpoint_no: 0,
            n_pending_checkpoint_writes: 0,
            log_capacity: 0,
            max_modified_age_async: 0,
            max_modified_age_sync: 0,
            max_checkpoint_age_async: 0,
            max_checkpoint_age: 0,
            encrypted,
            last_capacity_warning: None,
            last_age_warning: None,
        };
        inner.recompute_max_buf_free();
        block::init_block(inner.block_mut(0), FIRST_LSN);
        block::set_first_rec_group(inner.block_mut(0), BLOCK_HDR_SIZE);
        inner
    }

    pub fn recompute_max_buf_free(&mut self) {
        // Degenerate test-sized buffers would go negative under the
        // margin; floor at a quarter of the half.
        self.max_buf_free = (self.half_size / LOG_BUF_FLUSH_RATIO)
            .saturating_sub(LOG_BUF_FLUSH_MARGIN)
            .max(self.half_size / 4);
    }

    fn active_base(&self) -> usize {
        if self.first_in_use {
            0
        } else {
            self.half_size
        }
    }

    /// The active half.
    pub fn active(&self) -> &[u8] {
        let base = self.active_base();
        &self.buf[base..base + self.half_size]
    }

    /// One block of the active half, by offset of its first byte.
    fn block_mut(&mut self, block_start: usize) -> &mut [u8] {
        debug_assert_eq!(block_start % BLOCK_SIZE, 0);
        let base = self.active_base();
        &mut self.buf[base + block_start..base + block_start + BLOCK_SIZE]
    }

    /// Append record bytes at `buf_free`, maintaining block headers and
    /// advancing the LSN, block framing included. The caller has reserved
    /// enough room.
    pub fn write_low(&mut self, mut bytes: &[u8]) {
        let trailer = block::trailer_offset(self.encrypted);
        let framing = block::framing_size(self.encrypted);

        while !bytes.is_empty() {
            let in_block = self.buf_free % BLOCK_SIZE;
            let block_start = self.buf_free - in_block;
            let mut data_len = in_block + bytes.len();

            let len = if data_len <= trailer {
                bytes.len()
            } else {
                data_len = trailer;
                trailer - in_block
            };

            let base = self.active_base();
            self.buf[base + self.buf_free..base + self.buf_free + len]
                .copy_from_slice(&bytes[..len]);
            bytes = &bytes[len..];

            block::set_data_len(self.block_mut(block_start), data_len);

            if data_len == trailer {
                // The block became full.
                let checkpoint_no = self.next_checkpoint_no;
                let block = self.block_mut(block_start);
                block::set_data_len(block, BLOCK_SIZE);
                block::set_checkpoint_no(block, checkpoint_no);

                let advance = len + framing;
                self.lsn += advance as Lsn;
                self.buf_free += advance;
                let lsn = self.lsn;
                block::init_block(self.block_mut(block_start + BLOCK_SIZE), lsn);
            } else {
                self.lsn += len as Lsn;
                self.buf_free += len;
            }

            debug_assert!(self.buf_free <= self.half_size);
        }
    }

    /// Single-block fast append: succeeds only when the bytes fit the
    /// current block without filling it. Returns the LSN interval.
    pub fn reserve_and_write_fast(&mut self, bytes: &[u8]) -> Option<(Lsn, Lsn)> {
        let trailer = block::trailer_offset(self.encrypted);
        let in_block = self.buf_free % BLOCK_SIZE;
        let data_len = in_block + bytes.len();
        if data_len >= trailer {
            return None;
        }

        let start_lsn = self.lsn;
        let block_start = self.buf_free - in_block;
        let base = self.active_base();
        self.buf[base + self.buf_free..base + self.buf_free + bytes.len()]
            .copy_from_slice(bytes);
        block::set_data_len(self.block_mut(block_start), data_len);

        self.buf_free += bytes.len();
        self.lsn += bytes.len() as Lsn;
        Some((start_lsn, self.lsn))
    }

    /// Close the record group: give a freshly initialized block its
    /// first-record-group offset and flag the margin check when the
    /// buffer ran past its ceiling. Returns the group's end LSN.
    pub fn close_group(&mut self) -> Lsn {
        let lsn = self.lsn;
        let block_start = align_down_block(self.buf_free);
        let block = self.block_mut(block_start);
        if block::get_first_rec_group(block) == 0 {
            // This mini-transaction initialized the block; the next record
            // group will start where its data ends.
            let data_len = block::get_data_len(block);
            block::set_first_rec_group(block, data_len);
        }

        if self.buf_free > self.max_buf_free {
            self.check_flush_or_checkpoint = true;
        }
        lsn
    }

    /// Switch halves: copy the last, possibly partial, block to the head
    /// of the idle half and continue appending there. Only a write wave
    /// calls this, with the previous wave already completed.
    pub fn buffer_switch(&mut self) {
        let area_end = align_up_block(self.buf_free);
        let old_base = self.active_base();

        self.first_in_use = !self.first_in_use;
        let new_base = self.active_base();

        let src = old_base + area_end - BLOCK_SIZE;
        self.buf.copy_within(src..src + BLOCK_SIZE, new_base);

        self.buf_free %= BLOCK_SIZE;
        self.buf_next_to_write = self.buf_free;
    }

    /// Grow both halves to at least `new_half` bytes, preserving the
    /// active content. Runs when one mini-transaction's records exceed
    /// half the buffer.
    pub fn extend_to(&mut self, new_half: usize) {
        let new_half = (new_half + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        debug_assert!(new_half > self.half_size);

        let mut new_buf = vec![0u8; new_half * 2];
        let base = self.active_base();
        new_buf[..self.buf_free].copy_from_slice(&self.buf[base..base + self.buf_free]);

        self.buf = new_buf;
        self.first_in_use = true;
        self.half_size = new_half;
        self.recompute_max_buf_free();
    }
}
