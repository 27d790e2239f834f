//! # TurLog Configuration Constants
//!
//! This module centralizes the layout and tuning constants of the redo log,
//! grouping interdependent values together. Constants that depend on each
//! other are co-located so a change to one is checked against the others.
//!
//! ## Dependency Graph
//!
//! ```text
//! BLOCK_SIZE (512 bytes)
//!       │
//!       ├─> BLOCK_HDR_SIZE (12) + BLOCK_TRAILER_SIZE (4)
//!       │     Fixed framing of every log block. The payload of an
//!       │     unencrypted block is BLOCK_SIZE - 12 - 4 = 496 bytes.
//!       │
//!       ├─> BLOCK_KEY_SIZE (10)
//!       │     Reserved before the trailer when the log is encrypted;
//!       │     payload shrinks to 486 bytes.
//!       │
//!       ├─> MAIN_FILE_SIZE (4 blocks)
//!       │     Header block + two checkpoint slots + one reserved block.
//!       │
//!       └─> LOG_BUF_WRITE_MARGIN (4 blocks)
//!             Free space a reservation keeps ahead of the append cursor.
//!
//! PAGE_SIZE (4096 bytes)
//!       │
//!       ├─> LOG_BUF_FLUSH_MARGIN (write margin + 4 pages)
//!       │     Subtracted from half the buffer to get max_buf_free.
//!       │
//!       └─> CHECKPOINT_FREE_PER_THREAD (4 pages) and
//!           CHECKPOINT_EXTRA_FREE (8 pages)
//!             Per-thread reserve in the capacity formula. The log file has
//!             to be large enough that every concurrent query step can
//!             append its records without overtaking the last checkpoint.
//!
//! LOG_POOL_* ratios
//!       PREFLUSH_RATIO_ASYNC (8) < PREFLUSH_RATIO_SYNC (16)
//!                                < CHECKPOINT_RATIO_ASYNC (32)
//!       Age thresholds derived from capacity: margin - margin / ratio.
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `MAIN_FILE_SIZE == 4 * BLOCK_SIZE` (checkpoint slots at blocks 1 and 3)
//! 2. `BLOCK_HDR_SIZE + BLOCK_KEY_SIZE + BLOCK_TRAILER_SIZE < BLOCK_SIZE`
//! 3. `CHECKPOINT_SIZE == 1 + 8 + 6 + 4` (tag, LSN, packed position, CRC)
//!
//! These are enforced by compile-time assertions below.

use crate::Lsn;

// ============================================================================
// BLOCK LAYOUT
// The fundamental framing unit of the log stream
// ============================================================================

/// Size of one log block in bytes. Every on-disk log structure is built
/// from blocks of this size.
pub const BLOCK_SIZE: usize = 512;

/// Size of the block header: block number (4), data length (2),
/// first-record-group offset (2), checkpoint number low bits (4).
pub const BLOCK_HDR_SIZE: usize = 12;

/// Size of the block trailer: CRC-32C of everything before it.
pub const BLOCK_TRAILER_SIZE: usize = 4;

/// Bytes reserved before the trailer for the per-block encryption key slot
/// when the log is encrypted. Key management itself is external.
pub const BLOCK_KEY_SIZE: usize = 10;

/// Mask for the flush bit stored in the top bit of the block number field.
pub const BLOCK_FLUSH_BIT_MASK: u32 = 0x8000_0000;

/// Block numbers are 31 bits wide and wrap; 0 is never a valid number.
pub const BLOCK_NO_MASK: u32 = 0x7FFF_FFFF;

const _: () = assert!(BLOCK_HDR_SIZE + BLOCK_KEY_SIZE + BLOCK_TRAILER_SIZE < BLOCK_SIZE);

// ============================================================================
// LSN
// ============================================================================

/// LSNs are 63-bit; the top bit never becomes meaningful.
pub const LSN_MAX: Lsn = (1 << 63) - 1;

/// The LSN of the first payload byte of a fresh log. Block arithmetic
/// requires `lsn % BLOCK_SIZE` to point at the byte's offset within its
/// block, so the stream starts just past the first block header. 0 remains
/// the reserved "no changes" value.
pub const FIRST_LSN: Lsn = BLOCK_HDR_SIZE as Lsn;

// ============================================================================
// MAIN FILE LAYOUT
// Header block, checkpoint ring, reserved block
// ============================================================================

/// The main file is exactly four blocks: header, checkpoint slot, reserved,
/// checkpoint slot.
pub const MAIN_FILE_SIZE: usize = 4 * BLOCK_SIZE;

/// Byte offsets of the two checkpoint ring slots. Checkpoints alternate
/// between them by checkpoint-number parity so a torn write can always be
/// recovered from the other slot.
pub const CHECKPOINT_SLOT_1: usize = BLOCK_SIZE;
pub const CHECKPOINT_SLOT_2: usize = 3 * BLOCK_SIZE;

/// On-disk size of a checkpoint record:
/// tag (1) + LSN (8) + packed sequence bit / data offset (6) + CRC (4).
pub const CHECKPOINT_SIZE: usize = 19;

const _: () = assert!(CHECKPOINT_SIZE == 1 + 8 + 6 + 4);
const _: () = assert!(MAIN_FILE_SIZE == 4 * BLOCK_SIZE);

/// Record tag for a checkpoint; the stored tag byte is `0xf0 | 14` where 14
/// is the body length (LSN + packed position).
pub const TAG_FILE_CHECKPOINT: u8 = 0xf0;

/// Record tag for a tablespace enumeration record in the main file header
/// block.
pub const TAG_FILE_ID: u8 = 0xa0;

/// Log format identifier stored big-endian at the start of the main file.
pub const LOG_FORMAT_CURRENT: u32 = 0x5048_5953;

/// NUL-padded creator string stored in the main file header.
pub const LOG_CREATOR: &[u8; 32] = b"TurLog 0.1\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0\0";

/// The data file size is packed into 47 bits next to the sequence bit, so
/// it can never exceed this.
pub const MAX_DATA_FILE_SIZE: u64 = 1 << 47;

// ============================================================================
// PAGE SIZE
// Buffer pool page size; only margin arithmetic depends on it here
// ============================================================================

/// Page size of the buffer pool this log serves.
pub const PAGE_SIZE: usize = 4096;

// ============================================================================
// BUFFER MARGINS
// Free-space margins that keep appends from stalling on the write path
// ============================================================================

/// Free space a reservation keeps ahead of the append cursor before a
/// record is catenated.
pub const LOG_BUF_WRITE_MARGIN: usize = 4 * BLOCK_SIZE;

/// Divisor of the buffer half size when deriving `max_buf_free`.
pub const LOG_BUF_FLUSH_RATIO: usize = 2;

/// Margin subtracted after the ratio division.
pub const LOG_BUF_FLUSH_MARGIN: usize = LOG_BUF_WRITE_MARGIN + 4 * PAGE_SIZE;

// ============================================================================
// CHECKPOINT AGE RATIOS
// Empirical; preflush must trigger before a checkpoint becomes urgent
// ============================================================================

/// Asynchronous preflush of modified pages starts at
/// `margin - margin / this`.
pub const LOG_POOL_PREFLUSH_RATIO_ASYNC: u64 = 8;

/// Synchronous preflush threshold ratio; must exceed the async ratio.
pub const LOG_POOL_PREFLUSH_RATIO_SYNC: u64 = 16;

/// Asynchronous checkpoint threshold ratio; must exceed the sync preflush
/// ratio.
pub const LOG_POOL_CHECKPOINT_RATIO_ASYNC: u64 = 32;

const _: () = assert!(LOG_POOL_PREFLUSH_RATIO_ASYNC < LOG_POOL_PREFLUSH_RATIO_SYNC);
const _: () = assert!(LOG_POOL_PREFLUSH_RATIO_SYNC < LOG_POOL_CHECKPOINT_RATIO_ASYNC);

/// Free space reserved per concurrent thread in the capacity formula.
pub const CHECKPOINT_FREE_PER_THREAD: u64 = (4 * PAGE_SIZE) as u64;

/// Flat extra reserve in the capacity formula.
pub const CHECKPOINT_EXTRA_FREE: u64 = (8 * PAGE_SIZE) as u64;

// ============================================================================
// MISC
// ============================================================================

/// Minimum log buffer half size in blocks.
pub const MIN_LOG_BUFFER_BLOCKS: usize = 16;

/// Minimum log buffer half size in pages.
pub const MIN_LOG_BUFFER_PAGES: usize = 4;

/// Interval between repeated capacity warnings.
pub const WARNING_INTERVAL_SECS: u64 = 15;

/// Poll interval of the quiescence loops (shutdown, margin waits).
pub const POLL_INTERVAL_MS: u64 = 100;
