//! # Redo Log Files
//!
//! The on-disk footprint of the log: three files in the log directory.
//!
//! ```text
//! turlog.main    4 x 512 bytes, block framed
//! ┌─────────────────┬──────────────┬──────────┬──────────────┐
//! │ block 0: header │ block 1:     │ block 2: │ block 3:     │
//! │ + file ids      │ checkpoint   │ reserved │ checkpoint   │
//! │ + 1st checkpoint│ slot (even)  │          │ slot (odd)   │
//! └─────────────────┴──────────────┴──────────┴──────────────┘
//!
//! turlog.data    log_file_size bytes, circular, record framed
//! │ varint((size<<2)|skip<<1|seq) · payload · CRC-32C │ ... wraps
//!
//! turlog.blocks  log_file_size bytes, circular, block framed
//! │ 512-byte blocks landed by write waves at lsn-derived offsets │
//! ```
//!
//! ## Sequence bit
//!
//! The data file needs no per-wrap header: every record frame stores a one
//! bit wrap counter. The writer flips its bit when an append splits at
//! end-of-file; an append landing exactly on end-of-file only resets the
//! cursor. A reader scanning from a checkpoint mirrors the same rule and
//! treats the first frame whose bit differs from the expected one as the
//! end of the live log.
//!
//! ## Skip frames
//!
//! A frame with the skip bit set occupies stream space without carrying
//! a record: scans verify it and pass over it. They stand in for the
//! dummy no-op redo records (`append_skip_record`) and square the cursor
//! off at the write-ahead unit before a flush (`pad_data_to`), so the
//! device never read-modify-writes a partially covered unit. Their
//! headers use the fixed-width length form so any gap down to the bare
//! frame overhead is hit exactly.
//!
//! ## Checkpoint ring
//!
//! Checkpoints alternate between the two slots by checkpoint-number
//! parity. A torn checkpoint write fails its CRC and the other slot wins
//! arbitration on read. Each record packs the sequence bit and 47-bit data
//! file offset where a recovery scan for its LSN must begin; the cursor
//! positions of recent record frames are kept in a pruned index so the
//! stored position is exact.
//!
//! ## Locking
//!
//! `RedoFiles` sits behind one mutex owned by the log. Record appends run
//! at commit time with the log mutex held (taking this mutex inside it);
//! write waves and checkpoints take only this mutex. The lock order
//! "log mutex, then files mutex" is never reversed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use zerocopy::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::constants::{
    BLOCK_SIZE, CHECKPOINT_SIZE, CHECKPOINT_SLOT_1, CHECKPOINT_SLOT_2, LOG_CREATOR,
    LOG_FORMAT_CURRENT, MAIN_FILE_SIZE, MAX_DATA_FILE_SIZE, TAG_FILE_CHECKPOINT, TAG_FILE_ID,
};
use crate::config::LogConfig;
use crate::io::{create_log_file, LogFile};
use crate::log::block::{self, CRC32C};
use crate::log::varint::{self, MAX_VARINT_LEN};
use crate::Lsn;

pub const MAIN_FILE_NAME: &str = "turlog.main";
pub const DATA_FILE_NAME: &str = "turlog.data";
pub const BLOCK_FILE_NAME: &str = "turlog.blocks";

/// Offset of the crypt material slots in the header block.
const HEADER_CRYPT_OFFSET: usize = 48;
/// First byte after the fixed header fields where appended records start.
const HEADER_RECORDS_OFFSET: usize = HEADER_CRYPT_OFFSET + 3 * 16;

/// Bytes a skip frame occupies beyond its payload: the fixed-width
/// header plus the CRC.
const SKIP_FRAME_OVERHEAD: usize = 4 + 4;

/// A position in the circular data file: byte offset plus the wrap bit
/// frames at that offset are expected to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPos {
    pub offset: u64,
    pub sequence_bit: u8,
}

/// A checkpoint read back from the main file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointRecord {
    pub lsn: Lsn,
    pub pos: DataPos,
}

/// Fixed fields at the start of the main file header block. Big-endian.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct MainHeader {
    /// Physical format identifier.
    format: U32,
    /// Encryption key version, 0 when the log is not encrypted.
    key_version: U32,
    /// Data file size in the low 47 bits; the top bit is the sequence bit
    /// a fresh data file starts with.
    size_and_seq: U64,
    /// NUL-padded creator string.
    creator: [u8; 32],
}

const _: () = assert!(std::mem::size_of::<MainHeader>() == HEADER_CRYPT_OFFSET);

pub struct RedoFiles {
    main: LogFile,
    data: LogFile,
    blocks: LogFile,
    dir: PathBuf,
    file_size: u64,
    encrypted: bool,
    /// Append cursor in the data file.
    data_pos: u64,
    /// Wrap bit the next appended frame will carry.
    sequence_bit: u8,
    /// Start LSN -> data file position of recent record frames, pruned to
    /// the last checkpoint. Lets a checkpoint store the exact scan
    /// position for its LSN.
    record_index: BTreeMap<Lsn, DataPos>,
    closed: bool,
}

impl RedoFiles {
    pub fn main_path(dir: &Path) -> PathBuf {
        dir.join(MAIN_FILE_NAME)
    }

    pub fn data_path(dir: &Path) -> PathBuf {
        dir.join(DATA_FILE_NAME)
    }

    pub fn block_path(dir: &Path) -> PathBuf {
        dir.join(BLOCK_FILE_NAME)
    }

    /// Create the three files fresh and write the initial main file
    /// content: header block with file-id records and a first checkpoint
    /// at `first_lsn` / data offset 0, sequence bit 1 (so the all-zero
    /// data file reads as empty).
    pub fn create(config: &LogConfig, first_lsn: Lsn) -> Result<Self> {
        std::fs::create_dir_all(&config.dir).wrap_err_with(|| {
            format!(
                "failed to create log directory '{}'",
                config.dir.display()
            )
        })?;

        create_log_file(&Self::main_path(&config.dir), MAIN_FILE_SIZE as u64)?;
        create_log_file(&Self::data_path(&config.dir), config.log_file_size)?;
        create_log_file(&Self::block_path(&config.dir), config.log_file_size)?;

        let mut files = Self::open_files(config)?;
        files.initialize_main(config, first_lsn)?;
        Ok(files)
    }

    /// Open existing files and position the data cursor at the most
    /// recent durable checkpoint.
    pub fn open(config: &LogConfig) -> Result<(Self, CheckpointRecord)> {
        let mut files = Self::open_files(config)?;

        let mut header_block = vec![0u8; BLOCK_SIZE];
        files.main.read(0, &mut header_block)?;
        ensure!(
            block::verify_checksum(&header_block, false),
            "main file header block of '{}' fails its checksum",
            files.main.path().display()
        );

        let header = MainHeader::ref_from_bytes(&header_block[..HEADER_CRYPT_OFFSET])
            .map_err(|e| eyre::eyre!("invalid main file header: {:?}", e))?;
        ensure!(
            header.format.get() == LOG_FORMAT_CURRENT,
            "unsupported log format {:#x}",
            header.format.get()
        );
        ensure!(
            header.key_version.get() == 0,
            "log was written with encryption key version {}, which this build cannot read",
            header.key_version.get()
        );
        let stored_size = header.size_and_seq.get() & (MAX_DATA_FILE_SIZE - 1);
        ensure!(
            stored_size == config.log_file_size,
            "log file size {} does not match the configured {}",
            stored_size,
            config.log_file_size
        );
        let creator = String::from_utf8_lossy(&header.creator);
        tracing::debug!(creator = %creator.trim_end_matches('\0'), "opened redo log files");

        let checkpoint = files
            .read_latest_checkpoint()?
            .ok_or_else(|| eyre::eyre!("no valid checkpoint in '{}'", files.main.path().display()))?;

        files.data_pos = checkpoint.pos.offset;
        files.sequence_bit = checkpoint.pos.sequence_bit;
        Ok((files, checkpoint))
    }

    fn open_files(config: &LogConfig) -> Result<Self> {
        let main = LogFile::open(
            &Self::main_path(&config.dir),
            false,
            config.flush_method,
            config.use_pmem,
        )?;
        let data = LogFile::open(
            &Self::data_path(&config.dir),
            false,
            config.flush_method,
            config.use_pmem,
        )?;
        let blocks = LogFile::open(
            &Self::block_path(&config.dir),
            false,
            config.flush_method,
            config.use_pmem,
        )?;

        let file_size = data.size()?;
        ensure!(
            file_size == config.log_file_size,
            "data file '{}' has size {}, expected {}",
            data.path().display(),
            file_size,
            config.log_file_size
        );

        Ok(Self {
            main,
            data,
            blocks,
            dir: config.dir.clone(),
            file_size,
            encrypted: config.encrypt_log,
            data_pos: 0,
            sequence_bit: 1,
            record_index: BTreeMap::new(),
            closed: false,
        })
    }

    /// Write the header block: fixed fields, one record per registered
    /// tablespace, then the first checkpoint record, then the block
    /// checksum.
    fn initialize_main(&mut self, config: &LogConfig, first_lsn: Lsn) -> Result<()> {
        let mut buf = vec![0u8; BLOCK_SIZE];

        let header = MainHeader {
            format: U32::new(LOG_FORMAT_CURRENT),
            key_version: U32::new(0),
            // Sequence bit 1 so the zero-filled data file appears empty.
            size_and_seq: U64::new(MAX_DATA_FILE_SIZE | config.log_file_size),
            creator: *LOG_CREATOR,
        };
        buf[..HEADER_CRYPT_OFFSET].copy_from_slice(header.as_bytes());
        // Crypt slots stay zero until key management fills them in.

        let mut tail = Vec::with_capacity(64);
        for space in &config.tablespaces {
            encode_file_id_record(&mut tail, space.space_id, &space.path);
        }
        tail.extend_from_slice(&encode_checkpoint(
            first_lsn,
            DataPos {
                offset: 0,
                sequence_bit: 1,
            },
        ));

        let limit = block::trailer_offset(false);
        ensure!(
            HEADER_RECORDS_OFFSET + tail.len() <= limit,
            "{} tablespace records do not fit the main file header block",
            config.tablespaces.len()
        );
        buf[HEADER_RECORDS_OFFSET..HEADER_RECORDS_OFFSET + tail.len()].copy_from_slice(&tail);

        block::store_checksum(&mut buf, false);
        self.write_main_durable(0, &buf)?;

        self.data_pos = 0;
        self.sequence_bit = 1;
        Ok(())
    }

    fn write_main_durable(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.main.write(offset, buf)?;
        if !self.main.writes_are_durable() {
            self.main.flush_data_only()?;
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        ensure!(!self.closed, "redo log files are closed");
        Ok(())
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Current data file cursor.
    pub fn data_position(&self) -> DataPos {
        DataPos {
            offset: self.data_pos,
            sequence_bit: self.sequence_bit,
        }
    }

    /// Whether writes to the circular files are durable without an
    /// explicit flush.
    pub fn data_writes_are_durable(&self) -> bool {
        self.data.writes_are_durable() && self.blocks.writes_are_durable()
    }

    /// Flush the circular files (not their metadata) to the medium.
    pub fn flush_data(&self) -> Result<()> {
        self.ensure_open()?;
        self.data.flush_data_only()?;
        self.blocks.flush_data_only()
    }

    /// Flush and mark the files closed; later writes fail.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.flush_data()?;
        self.closed = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Circular data file
    // ------------------------------------------------------------------

    /// Append bytes at the cursor, splitting at end-of-file. A split
    /// flips the sequence bit; an exact landing on end-of-file only
    /// resets the cursor.
    pub fn append_wrapped(&mut self, mut buf: &[u8]) -> Result<()> {
        self.ensure_open()?;
        debug_assert!(self.data_pos < self.file_size);
        // A single append must not bite its own tail.
        debug_assert!((buf.len() as u64) < self.file_size);

        if self.data_pos + buf.len() as u64 > self.file_size {
            let tail = (self.file_size - self.data_pos) as usize;
            self.data.write(self.data_pos, &buf[..tail])?;
            buf = &buf[tail..];
            self.data_pos = 0;
            self.sequence_bit ^= 1;
        }

        self.data.write(self.data_pos, buf)?;
        self.data_pos += buf.len() as u64;
        if self.data_pos == self.file_size {
            self.data_pos = 0;
        }
        Ok(())
    }

    /// Read bytes starting at `offset`, continuing at the file start when
    /// the span crosses end-of-file.
    pub fn read_wrapped(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.ensure_open()?;
        debug_assert!((buf.len() as u64) < self.file_size);

        if offset + buf.len() as u64 > self.file_size {
            let tail = (self.file_size - offset) as usize;
            let (head, rest) = buf.split_at_mut(tail);
            self.data.read(offset, head)?;
            self.data.read(0, rest)?;
        } else {
            self.data.read(offset, buf)?;
        }
        Ok(())
    }

    /// Frame a committed mini-transaction's record bytes and append them
    /// at the cursor. Returns the position of the frame for the record
    /// index.
    pub fn append_record(&mut self, chunks: &[&[u8]]) -> Result<DataPos> {
        self.ensure_open()?;
        let payload_len: usize = chunks.iter().map(|c| c.len()).sum();
        let size = payload_len as u64 + 4;
        let header_val = size << 2 | u64::from(self.sequence_bit);
        let total = varint::encoded_len(header_val) + payload_len + 4;
        ensure!(
            (total as u64) < self.file_size,
            "record of {} bytes does not fit the {} byte log file",
            total,
            self.file_size
        );

        let mut frame = Vec::with_capacity(total);
        let mut header = [0u8; MAX_VARINT_LEN];
        let header_len = varint::encode(header_val, &mut header);
        frame.extend_from_slice(&header[..header_len]);
        for chunk in chunks {
            frame.extend_from_slice(chunk);
        }
        let crc = CRC32C.checksum(&frame);
        frame.extend_from_slice(&crc.to_be_bytes());

        let pos = self.data_position();
        self.append_wrapped(&frame)?;
        Ok(pos)
    }

    /// Append a no-op frame carrying `payload_len` zero bytes. A scan
    /// passes over it without yielding anything; the cursor advances as
    /// for any other frame. The original's dummy redo records.
    pub fn append_skip_record(&mut self, payload_len: usize) -> Result<DataPos> {
        let pos = self.data_position();
        self.append_skip_frame(payload_len + SKIP_FRAME_OVERHEAD)?;
        Ok(pos)
    }

    /// Pad the data cursor forward to a multiple of `unit` with a skip
    /// frame, so a following flush never leaves a device unit partially
    /// covered. A gap too small for a frame is extended by one unit.
    pub fn pad_data_to(&mut self, unit: usize) -> Result<()> {
        self.ensure_open()?;
        debug_assert!(unit.is_power_of_two());
        let in_unit = (self.data_pos % unit as u64) as usize;
        if in_unit == 0 {
            return Ok(());
        }
        let mut gap = unit - in_unit;
        if gap < SKIP_FRAME_OVERHEAD {
            gap += unit;
        }
        self.append_skip_frame(gap)
    }

    /// Write a skip frame of exactly `total` bytes. The wide header
    /// width is fixed, so any total down to the bare frame overhead is
    /// reachable.
    fn append_skip_frame(&mut self, total: usize) -> Result<()> {
        self.ensure_open()?;
        debug_assert!(total >= SKIP_FRAME_OVERHEAD);
        ensure!(
            (total as u64) < self.file_size,
            "skip frame of {} bytes does not fit the {} byte log file",
            total,
            self.file_size
        );
        // The fixed-width header carries (size << 2) in 30 bits.
        ensure!(
            total < 1 << 28,
            "skip frame of {} bytes exceeds the fixed-width header range",
            total
        );

        let payload_len = total - SKIP_FRAME_OVERHEAD;
        let size = payload_len as u64 + 4;
        let header_val = size << 2 | 1 << 1 | u64::from(self.sequence_bit);

        let mut frame = vec![0u8; total];
        let header_len = varint::encode_wide(header_val, &mut frame);
        debug_assert_eq!(header_len + payload_len + 4, total);
        let crc = CRC32C.checksum(&frame[..total - 4]);
        frame[total - 4..].copy_from_slice(&crc.to_be_bytes());

        self.append_wrapped(&frame)
    }

    /// Remember where the frame of the mini-transaction starting at
    /// `start_lsn` lives.
    pub fn note_record(&mut self, start_lsn: Lsn, pos: DataPos) {
        self.record_index.insert(start_lsn, pos);
    }

    /// Drop index entries below the latest checkpoint; they can never be
    /// a scan start again.
    pub fn prune_index(&mut self, keep_from: Lsn) {
        self.record_index.retain(|&lsn, _| lsn >= keep_from);
    }

    /// Data file position where a scan replaying everything after `lsn`
    /// must begin.
    pub fn checkpoint_pos(&self, lsn: Lsn) -> DataPos {
        if let Some((&start, &pos)) = self.record_index.range(lsn..).next() {
            if start == lsn {
                return pos;
            }
            // No frame starts exactly at lsn; begin at the closest frame
            // before it so nothing is skipped.
            return self
                .record_index
                .range(..lsn)
                .next_back()
                .map(|(_, &p)| p)
                .unwrap_or(pos);
        }
        self.data_position()
    }

    /// Scan record frames from `from`, stopping at the first frame whose
    /// sequence bit does not match, whose checksum fails, or whose header
    /// is implausible. Returns the frame payloads in order.
    pub fn read_records(&self, from: DataPos, max: usize) -> Result<Vec<Vec<u8>>> {
        self.ensure_open()?;
        let mut pos = from.offset;
        let mut expected = from.sequence_bit;
        let mut out = Vec::new();

        while out.len() < max {
            let mut header = [0u8; MAX_VARINT_LEN];
            self.read_wrapped(pos, &mut header)?;
            let Ok((value, header_len)) = varint::decode(&header) else {
                break;
            };

            let size = value >> 2;
            let skip = (value >> 1) & 1 == 1;
            let seq = (value & 1) as u8;
            if seq != expected {
                break;
            }
            if size < 4 || header_len as u64 + size >= self.file_size {
                break;
            }

            let total = header_len + size as usize;
            let mut frame = vec![0u8; total];
            self.read_wrapped(pos, &mut frame)?;

            let stored = u32::from_be_bytes(frame[total - 4..].try_into().unwrap());
            if CRC32C.checksum(&frame[..total - 4]) != stored {
                break;
            }

            if !skip {
                out.push(frame[header_len..total - 4].to_vec());
            }

            if pos + total as u64 > self.file_size {
                pos = pos + total as u64 - self.file_size;
                expected ^= 1;
            } else {
                pos += total as u64;
                if pos == self.file_size {
                    pos = 0;
                }
            }
        }

        Ok(out)
    }

    // ------------------------------------------------------------------
    // Block file
    // ------------------------------------------------------------------

    /// Land a block-framed write wave at its LSN-derived offset, splitting
    /// at end-of-file. `start_lsn` must be block aligned.
    pub fn write_blocks(&self, start_lsn: Lsn, mut buf: &[u8]) -> Result<()> {
        self.ensure_open()?;
        debug_assert_eq!(start_lsn % BLOCK_SIZE as Lsn, 0);
        debug_assert_eq!(buf.len() % BLOCK_SIZE, 0);

        let mut offset = start_lsn % self.file_size;
        while !buf.is_empty() {
            let span = ((self.file_size - offset) as usize).min(buf.len());
            self.blocks.write(offset, &buf[..span])?;
            buf = &buf[span..];
            offset = (offset + span as u64) % self.file_size;
        }
        Ok(())
    }

    /// Read a block-framed segment back from its LSN-derived offset.
    pub fn read_block_segment(&self, start_lsn: Lsn, buf: &mut [u8]) -> Result<()> {
        self.ensure_open()?;
        debug_assert_eq!(start_lsn % BLOCK_SIZE as Lsn, 0);
        debug_assert_eq!(buf.len() % BLOCK_SIZE, 0);

        let mut offset = start_lsn % self.file_size;
        let mut buf = &mut buf[..];
        while !buf.is_empty() {
            let span = ((self.file_size - offset) as usize).min(buf.len());
            let (head, rest) = buf.split_at_mut(span);
            self.blocks.read(offset, head)?;
            buf = rest;
            offset = (offset + span as u64) % self.file_size;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    /// Durably write a checkpoint record into the ring slot selected by
    /// the checkpoint number's parity.
    pub fn append_checkpoint_durable(
        &mut self,
        lsn: Lsn,
        pos: DataPos,
        checkpoint_no: u64,
    ) -> Result<()> {
        self.ensure_open()?;
        let slot = if checkpoint_no % 2 == 0 {
            CHECKPOINT_SLOT_1
        } else {
            CHECKPOINT_SLOT_2
        };
        let record = encode_checkpoint(lsn, pos);
        self.write_main_durable(slot as u64, &record)
    }

    /// Read back the most recent valid checkpoint: the ring slots win by
    /// LSN, with the first checkpoint embedded in the header block as the
    /// fallback for a fresh log.
    pub fn read_latest_checkpoint(&self) -> Result<Option<CheckpointRecord>> {
        let mut best: Option<CheckpointRecord> = None;

        for slot in [CHECKPOINT_SLOT_1, CHECKPOINT_SLOT_2] {
            let mut buf = [0u8; CHECKPOINT_SIZE];
            self.main.read(slot as u64, &mut buf)?;
            if let Some(record) = decode_checkpoint(&buf) {
                if best.map_or(true, |b| record.lsn > b.lsn) {
                    best = Some(record);
                }
            }
        }

        if best.is_none() {
            best = self.header_block_checkpoint()?;
        }
        Ok(best)
    }

    /// Durably add a tablespace enumeration record to the header block,
    /// keeping the embedded first checkpoint and the block checksum
    /// intact.
    pub fn append_file_id_durable(&mut self, space_id: u32, path: &str) -> Result<()> {
        self.ensure_open()?;
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.main.read(0, &mut buf)?;
        ensure!(
            block::verify_checksum(&buf, false),
            "main file header block fails its checksum"
        );
        let (spaces, checkpoint) = parse_header_records(&buf)?;
        let checkpoint = checkpoint
            .ok_or_else(|| eyre::eyre!("main file header block carries no checkpoint"))?;

        let mut tail = Vec::with_capacity(64);
        for (id, existing) in &spaces {
            encode_file_id_record(&mut tail, *id, existing);
        }
        encode_file_id_record(&mut tail, space_id, path);
        tail.extend_from_slice(&encode_checkpoint(checkpoint.lsn, checkpoint.pos));

        let limit = block::trailer_offset(false);
        ensure!(
            HEADER_RECORDS_OFFSET + tail.len() <= limit,
            "tablespace record for space {} does not fit the main file header block",
            space_id
        );
        buf[HEADER_RECORDS_OFFSET..limit].fill(0);
        buf[HEADER_RECORDS_OFFSET..HEADER_RECORDS_OFFSET + tail.len()].copy_from_slice(&tail);
        block::store_checksum(&mut buf, false);
        self.write_main_durable(0, &buf)
    }

    /// Tablespace enumeration records stored in the header block.
    pub fn enumerate_tablespaces(&self) -> Result<Vec<(u32, String)>> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.main.read(0, &mut buf)?;
        ensure!(
            block::verify_checksum(&buf, false),
            "main file header block fails its checksum"
        );
        let (spaces, _) = parse_header_records(&buf)?;
        Ok(spaces)
    }

    fn header_block_checkpoint(&self) -> Result<Option<CheckpointRecord>> {
        let mut buf = vec![0u8; BLOCK_SIZE];
        self.main.read(0, &mut buf)?;
        if !block::verify_checksum(&buf, false) {
            return Ok(None);
        }
        let (_, checkpoint) = parse_header_records(&buf)?;
        Ok(checkpoint)
    }

    /// Whether records are stored with the encrypted block layout.
    pub fn encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Encode a checkpoint record: tag, LSN, packed sequence bit and offset,
/// CRC-32C.
pub fn encode_checkpoint(lsn: Lsn, pos: DataPos) -> [u8; CHECKPOINT_SIZE] {
    debug_assert!(pos.sequence_bit <= 1);
    debug_assert!(pos.offset < MAX_DATA_FILE_SIZE);

    let mut buf = [0u8; CHECKPOINT_SIZE];
    buf[0] = TAG_FILE_CHECKPOINT | 14;
    buf[1..9].copy_from_slice(&lsn.to_be_bytes());
    let packed = u64::from(pos.sequence_bit) << 47 | pos.offset;
    buf[9..15].copy_from_slice(&packed.to_be_bytes()[2..]);
    let crc = CRC32C.checksum(&buf[..15]);
    buf[15..].copy_from_slice(&crc.to_be_bytes());
    buf
}

/// Decode and validate a checkpoint record.
pub fn decode_checkpoint(buf: &[u8]) -> Option<CheckpointRecord> {
    if buf.len() < CHECKPOINT_SIZE || buf[0] != TAG_FILE_CHECKPOINT | 14 {
        return None;
    }
    let stored = u32::from_be_bytes(buf[15..19].try_into().unwrap());
    if CRC32C.checksum(&buf[..15]) != stored {
        return None;
    }
    let lsn = u64::from_be_bytes(buf[1..9].try_into().unwrap());
    let mut packed_bytes = [0u8; 8];
    packed_bytes[2..].copy_from_slice(&buf[9..15]);
    let packed = u64::from_be_bytes(packed_bytes);
    Some(CheckpointRecord {
        lsn,
        pos: DataPos {
            offset: packed & (MAX_DATA_FILE_SIZE - 1),
            sequence_bit: (packed >> 47) as u8 & 1,
        },
    })
}

/// Append a tablespace enumeration record: tag with inline body length (or
/// a separate varint for long bodies), varint space id, path bytes, CRC.
fn encode_file_id_record(out: &mut Vec<u8>, space_id: u32, path: &str) {
    let start = out.len();
    let body_len = varint::encoded_len(space_id as u64) + path.len();

    if body_len < 16 {
        out.push(TAG_FILE_ID | body_len as u8);
    } else {
        out.push(TAG_FILE_ID);
        let mut len_buf = [0u8; MAX_VARINT_LEN];
        let n = varint::encode(body_len as u64, &mut len_buf);
        out.extend_from_slice(&len_buf[..n]);
    }

    let mut id_buf = [0u8; MAX_VARINT_LEN];
    let n = varint::encode(space_id as u64, &mut id_buf);
    out.extend_from_slice(&id_buf[..n]);
    out.extend_from_slice(path.as_bytes());

    let crc = CRC32C.checksum(&out[start..]);
    out.extend_from_slice(&crc.to_be_bytes());
}

/// Walk the records appended after the fixed header fields: file-id
/// records first, then the first checkpoint.
fn parse_header_records(buf: &[u8]) -> Result<(Vec<(u32, String)>, Option<CheckpointRecord>)> {
    let mut spaces = Vec::new();
    let mut cursor = HEADER_RECORDS_OFFSET;
    let limit = block::trailer_offset(false);

    while cursor < limit {
        let tag = buf[cursor];
        if tag == 0 {
            break;
        }
        if tag == TAG_FILE_CHECKPOINT | 14 {
            return Ok((spaces, decode_checkpoint(&buf[cursor..])));
        }
        ensure!(
            tag & 0xf0 == TAG_FILE_ID,
            "unknown record tag {:#x} in main file header",
            tag
        );

        let record_start = cursor;
        cursor += 1;
        let body_len = if tag & 0x0f != 0 {
            (tag & 0x0f) as usize
        } else {
            let (len, n) = varint::decode(&buf[cursor..limit])?;
            cursor += n;
            len as usize
        };
        ensure!(
            cursor + body_len + 4 <= limit,
            "file-id record overruns the main file header block"
        );

        let (space_id, n) = varint::decode(&buf[cursor..cursor + body_len])?;
        let path = std::str::from_utf8(&buf[cursor + n..cursor + body_len])
            .wrap_err("file-id record path is not valid UTF-8")?
            .to_string();
        cursor += body_len;

        let stored = u32::from_be_bytes(buf[cursor..cursor + 4].try_into().unwrap());
        ensure!(
            CRC32C.checksum(&buf[record_start..cursor]) == stored,
            "file-id record for space {} fails its checksum",
            space_id
        );
        cursor += 4;

        spaces.push((space_id as u32, path));
    }

    Ok((spaces, None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::constants::FIRST_LSN;
    use tempfile::tempdir;

    fn test_config(dir: &Path, file_size: u64) -> LogConfig {
        LogConfig::new(dir).with_file_size(file_size)
    }

    #[test]
    fn checkpoint_record_round_trip() {
        let record = CheckpointRecord {
            lsn: 0x1234_5678_9ABC,
            pos: DataPos {
                offset: (1 << 40) + 12345,
                sequence_bit: 1,
            },
        };
        let encoded = encode_checkpoint(record.lsn, record.pos);
        assert_eq!(decode_checkpoint(&encoded), Some(record));
    }

    #[test]
    fn torn_checkpoint_fails_decode() {
        let mut encoded = encode_checkpoint(
            999,
            DataPos {
                offset: 42,
                sequence_bit: 0,
            },
        );
        encoded[5] ^= 0x01;
        assert_eq!(decode_checkpoint(&encoded), None);
    }

    #[test]
    fn create_writes_header_and_first_checkpoint() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), 64 * 1024)
            .with_tablespace(5, "root/users.tbd")
            .with_tablespace(1000, "analytics/events.tbd");

        let files = RedoFiles::create(&config, FIRST_LSN).unwrap();

        let checkpoint = files.read_latest_checkpoint().unwrap().unwrap();
        assert_eq!(checkpoint.lsn, FIRST_LSN);
        assert_eq!(checkpoint.pos.offset, 0);
        assert_eq!(checkpoint.pos.sequence_bit, 1);

        let spaces = files.enumerate_tablespaces().unwrap();
        assert_eq!(
            spaces,
            vec![
                (5, "root/users.tbd".to_string()),
                (1000, "analytics/events.tbd".to_string())
            ]
        );
    }

    #[test]
    fn file_id_records_append_after_creation() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), 64 * 1024).with_tablespace(1, "root/a.tbd");
        let mut files = RedoFiles::create(&config, FIRST_LSN).unwrap();

        files.append_file_id_durable(2, "root/b.tbd").unwrap();
        files
            .append_file_id_durable(70000, "analytics/long_table_name.tbd")
            .unwrap();

        assert_eq!(
            files.enumerate_tablespaces().unwrap(),
            vec![
                (1, "root/a.tbd".to_string()),
                (2, "root/b.tbd".to_string()),
                (70000, "analytics/long_table_name.tbd".to_string())
            ]
        );
        // The embedded first checkpoint survived the rewrite.
        let checkpoint = files.read_latest_checkpoint().unwrap().unwrap();
        assert_eq!(checkpoint.lsn, FIRST_LSN);
    }

    #[test]
    fn checkpoint_ring_alternates_and_survives_reopen() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), 64 * 1024);
        let mut files = RedoFiles::create(&config, FIRST_LSN).unwrap();

        files
            .append_checkpoint_durable(
                1000,
                DataPos {
                    offset: 100,
                    sequence_bit: 1,
                },
                0,
            )
            .unwrap();
        files
            .append_checkpoint_durable(
                2000,
                DataPos {
                    offset: 200,
                    sequence_bit: 1,
                },
                1,
            )
            .unwrap();
        drop(files);

        let (files, checkpoint) = RedoFiles::open(&config).unwrap();
        assert_eq!(checkpoint.lsn, 2000);
        assert_eq!(checkpoint.pos.offset, 200);
        assert_eq!(files.data_position().offset, 200);
    }

    #[test]
    fn torn_slot_loses_arbitration() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), 64 * 1024);
        let mut files = RedoFiles::create(&config, FIRST_LSN).unwrap();

        files
            .append_checkpoint_durable(
                1000,
                DataPos {
                    offset: 100,
                    sequence_bit: 1,
                },
                0,
            )
            .unwrap();
        files
            .append_checkpoint_durable(
                2000,
                DataPos {
                    offset: 200,
                    sequence_bit: 1,
                },
                1,
            )
            .unwrap();

        // Tear the newer slot; the older one must win arbitration.
        let mut garbage = encode_checkpoint(
            2000,
            DataPos {
                offset: 200,
                sequence_bit: 1,
            },
        );
        garbage[3] ^= 0xFF;
        files.main.write(CHECKPOINT_SLOT_2 as u64, &garbage).unwrap();

        let checkpoint = files.read_latest_checkpoint().unwrap().unwrap();
        assert_eq!(checkpoint.lsn, 1000);
    }

    #[test]
    fn append_exact_fit_resets_without_flip() {
        let dir = tempdir().unwrap();
        let file_size = 4 * BLOCK_SIZE as u64;
        let config = test_config(dir.path(), file_size);
        let mut files = RedoFiles::create(&config, FIRST_LSN).unwrap();

        assert_eq!(files.data_position().sequence_bit, 1);
        files.append_wrapped(&vec![0xAB; file_size as usize - 1]).unwrap();
        files.append_wrapped(&[0xCD]).unwrap();

        // Landed exactly on end-of-file: cursor reset, bit untouched.
        let pos = files.data_position();
        assert_eq!(pos.offset, 0);
        assert_eq!(pos.sequence_bit, 1);
    }

    #[test]
    fn append_crossing_eof_splits_and_flips_once() {
        let dir = tempdir().unwrap();
        let file_size = 4 * BLOCK_SIZE as u64;
        let config = test_config(dir.path(), file_size);
        let mut files = RedoFiles::create(&config, FIRST_LSN).unwrap();

        files
            .append_wrapped(&vec![0x11; file_size as usize - 8])
            .unwrap();
        // 16 bytes with only 8 before end-of-file: two-segment write.
        files.append_wrapped(&[0x22; 16]).unwrap();

        let pos = files.data_position();
        assert_eq!(pos.offset, 8);
        assert_eq!(pos.sequence_bit, 0);

        let mut read_back = [0u8; 16];
        files.read_wrapped(file_size - 8, &mut read_back).unwrap();
        assert_eq!(read_back, [0x22; 16]);
    }

    #[test]
    fn record_round_trip_across_wrap() {
        let dir = tempdir().unwrap();
        let file_size = 4 * BLOCK_SIZE as u64;
        let config = test_config(dir.path(), file_size);
        let mut files = RedoFiles::create(&config, FIRST_LSN).unwrap();

        // Enough records to wrap the 2 KiB file more than once; scan from
        // the cursor of the 14th append (in real use the start position
        // comes from the record index).
        let mut tail_start = files.data_position();
        let mut all = Vec::new();
        for i in 0..20u8 {
            let payload = vec![i; 150 + i as usize];
            if i == 14 {
                tail_start = files.data_position();
            }
            files.append_record(&[&payload]).unwrap();
            all.push(payload);
        }

        let records = files.read_records(tail_start, usize::MAX).unwrap();
        assert_eq!(records, all[14..].to_vec());
    }

    #[test]
    fn scan_stops_at_sequence_bit_mismatch() {
        let dir = tempdir().unwrap();
        let file_size = 16 * BLOCK_SIZE as u64;
        let config = test_config(dir.path(), file_size);
        let mut files = RedoFiles::create(&config, FIRST_LSN).unwrap();

        let start = files.data_position();
        files.append_record(&[b"first"]).unwrap();
        files.append_record(&[b"second"]).unwrap();

        let records = files.read_records(start, usize::MAX).unwrap();
        // The zero-filled remainder decodes as size 0 with sequence bit 0,
        // which mismatches the expected bit 1 and ends the scan.
        assert_eq!(records, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[test]
    fn skip_frames_advance_the_cursor_but_yield_nothing() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), 64 * 1024);
        let mut files = RedoFiles::create(&config, FIRST_LSN).unwrap();

        let start = files.data_position();
        files.append_record(&[b"before"]).unwrap();
        let skip_pos = files.append_skip_record(100).unwrap();
        files.append_record(&[b"after"]).unwrap();

        // The skip frame occupies its header, payload and CRC.
        let after_skip = files.data_position();
        assert_eq!(
            after_skip.offset - skip_pos.offset,
            (100 + SKIP_FRAME_OVERHEAD) as u64
        );

        // The scan passes over it without yielding its payload.
        let records = files.read_records(start, usize::MAX).unwrap();
        assert_eq!(records, vec![b"before".to_vec(), b"after".to_vec()]);
    }

    #[test]
    fn pad_squares_the_cursor_off_at_the_unit() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), 64 * 1024);
        let mut files = RedoFiles::create(&config, FIRST_LSN).unwrap();

        let start = files.data_position();
        files.append_record(&[b"unaligned tail"]).unwrap();
        files.pad_data_to(4096).unwrap();
        assert_eq!(files.data_position().offset % 4096, 0);

        // Aligned already: a second pad writes nothing.
        let aligned = files.data_position();
        files.pad_data_to(4096).unwrap();
        assert_eq!(files.data_position(), aligned);

        // Frames appended after the pad scan back cleanly.
        files.append_record(&[b"next unit"]).unwrap();
        let records = files.read_records(start, usize::MAX).unwrap();
        assert_eq!(
            records,
            vec![b"unaligned tail".to_vec(), b"next unit".to_vec()]
        );
    }

    #[test]
    fn pad_extends_a_gap_too_small_for_a_frame() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), 64 * 1024);
        let mut files = RedoFiles::create(&config, FIRST_LSN).unwrap();

        // Leave 4 bytes to the boundary, less than a frame needs.
        files.append_skip_record(512 - SKIP_FRAME_OVERHEAD - 4).unwrap();
        assert_eq!(files.data_position().offset, 508);

        files.pad_data_to(512).unwrap();
        assert_eq!(files.data_position().offset, 1024);
    }

    #[test]
    fn record_index_resolves_checkpoint_positions() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), 64 * 1024);
        let mut files = RedoFiles::create(&config, FIRST_LSN).unwrap();

        let p1 = files.append_record(&[b"aaaa"]).unwrap();
        files.note_record(100, p1);
        let p2 = files.append_record(&[b"bbbb"]).unwrap();
        files.note_record(200, p2);

        assert_eq!(files.checkpoint_pos(100), p1);
        assert_eq!(files.checkpoint_pos(200), p2);
        // Between two starts: the earlier frame wins.
        assert_eq!(files.checkpoint_pos(150), p1);
        // Beyond every start: the cursor is the scan position.
        assert_eq!(files.checkpoint_pos(5000), files.data_position());

        files.prune_index(200);
        assert_eq!(files.checkpoint_pos(100), p2);
    }

    #[test]
    fn block_file_write_read_with_wrap() {
        let dir = tempdir().unwrap();
        let file_size = 8 * BLOCK_SIZE as u64;
        let config = test_config(dir.path(), file_size);
        let files = RedoFiles::create(&config, FIRST_LSN).unwrap();

        // A two-block wave whose lsn-derived offset is the last block of
        // the file: it must wrap to offset 0.
        let start_lsn = 7 * BLOCK_SIZE as Lsn;
        let mut wave = vec![0u8; 2 * BLOCK_SIZE];
        wave[..BLOCK_SIZE].fill(0x33);
        wave[BLOCK_SIZE..].fill(0x44);
        files.write_blocks(start_lsn, &wave).unwrap();

        let mut read_back = vec![0u8; 2 * BLOCK_SIZE];
        files.read_block_segment(start_lsn, &mut read_back).unwrap();
        assert_eq!(read_back, wave);
    }

    #[test]
    fn closed_files_reject_writes() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path(), 64 * 1024);
        let mut files = RedoFiles::create(&config, FIRST_LSN).unwrap();

        files.close().unwrap();
        assert!(files.append_wrapped(b"late").is_err());
    }
}
