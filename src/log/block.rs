//! # Log Block Codec
//!
//! Framing of the 512-byte log blocks that make up the staging buffer and
//! the block file. The encoding is purely positional:
//!
//! ```text
//! +--------+----------+-----------------+---------------+
//! | offset | size     | field           | notes         |
//! +--------+----------+-----------------+---------------+
//! | 0      | 4        | block number    | top bit: flush|
//! | 4      | 2        | data length     | incl. header  |
//! | 6      | 2        | first rec group | 0 = none yet  |
//! | 8      | 4        | checkpoint no   | low 32 bits   |
//! | 12     | payload  |                 | 496 or 486 B  |
//! | 498    | 10       | key slot        | encrypted only|
//! | 508    | 4        | CRC-32C         | of bytes 0..  |
//! +--------+----------+-----------------+---------------+
//! ```
//!
//! The trailer checksum covers every byte before the trailer (508 bytes
//! unencrypted, 498 with the key slot reserved). Block numbers are 31 bits
//! wide, 1-based, and wrap: `block_no(lsn) = 1 + (lsn / 512) mod 2^31`.
//!
//! A full block stores `data_len == BLOCK_SIZE` by convention and stamps
//! the checkpoint number it was completed under; a partial block defers
//! the checkpoint-number stamp until it is flushed.

use crc::{Crc, CRC_32_ISCSI};
use zerocopy::big_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::constants::{
    BLOCK_FLUSH_BIT_MASK, BLOCK_HDR_SIZE, BLOCK_KEY_SIZE, BLOCK_NO_MASK, BLOCK_SIZE,
    BLOCK_TRAILER_SIZE,
};
use crate::Lsn;

pub const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Header at the start of every log block. All fields big-endian.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct BlockHeader {
    /// 31-bit block number; the top bit is the flush bit marking the first
    /// block of a write wave.
    hdr_no: U32,
    /// Bytes of log in this block counted from the block start, header
    /// included. `BLOCK_SIZE` means the block is full.
    data_len: U16,
    /// Offset of the first record group starting in this block, 0 if none.
    first_rec_group: U16,
    /// Low 32 bits of the checkpoint number current when the block was
    /// last written.
    checkpoint_no: U32,
}

const _: () = assert!(std::mem::size_of::<BlockHeader>() == BLOCK_HDR_SIZE);

fn header(block: &[u8]) -> &BlockHeader {
    debug_assert!(block.len() >= BLOCK_HDR_SIZE);
    // Length checked above; the derive guarantees any bytes are valid.
    BlockHeader::ref_from_bytes(&block[..BLOCK_HDR_SIZE]).unwrap()
}

fn header_mut(block: &mut [u8]) -> &mut BlockHeader {
    debug_assert!(block.len() >= BLOCK_HDR_SIZE);
    BlockHeader::mut_from_bytes(&mut block[..BLOCK_HDR_SIZE]).unwrap()
}

/// Convert an LSN to the 1-based block number of the block containing it.
pub fn block_no_for_lsn(lsn: Lsn) -> u32 {
    (1 + (lsn / BLOCK_SIZE as Lsn) % (1 << 31)) as u32
}

/// Offset of the CRC trailer, which is also the payload limit.
pub fn trailer_offset(encrypted: bool) -> usize {
    if encrypted {
        BLOCK_SIZE - BLOCK_TRAILER_SIZE - BLOCK_KEY_SIZE
    } else {
        BLOCK_SIZE - BLOCK_TRAILER_SIZE
    }
}

/// Payload capacity of one block.
pub fn payload_size(encrypted: bool) -> usize {
    trailer_offset(encrypted) - BLOCK_HDR_SIZE
}

/// Header plus trailer overhead the LSN advances by when a block fills.
pub fn framing_size(encrypted: bool) -> usize {
    BLOCK_SIZE - payload_size(encrypted)
}

/// Initialize a block for the given LSN: block number set, no data beyond
/// the header, no record group yet.
pub fn init_block(block: &mut [u8], lsn: Lsn) {
    let hdr = header_mut(block);
    hdr.hdr_no = U32::new(block_no_for_lsn(lsn));
    hdr.data_len = U16::new(BLOCK_HDR_SIZE as u16);
    hdr.first_rec_group = U16::new(0);
    hdr.checkpoint_no = U32::new(0);
}

pub fn get_block_no(block: &[u8]) -> u32 {
    header(block).hdr_no.get() & BLOCK_NO_MASK
}

pub fn get_flush_bit(block: &[u8]) -> bool {
    header(block).hdr_no.get() & BLOCK_FLUSH_BIT_MASK != 0
}

pub fn set_flush_bit(block: &mut [u8], value: bool) {
    let hdr = header_mut(block);
    let no = hdr.hdr_no.get();
    hdr.hdr_no = U32::new(if value {
        no | BLOCK_FLUSH_BIT_MASK
    } else {
        no & BLOCK_NO_MASK
    });
}

pub fn get_data_len(block: &[u8]) -> usize {
    header(block).data_len.get() as usize
}

pub fn set_data_len(block: &mut [u8], len: usize) {
    debug_assert!(len <= BLOCK_SIZE);
    header_mut(block).data_len = U16::new(len as u16);
}

pub fn get_first_rec_group(block: &[u8]) -> usize {
    header(block).first_rec_group.get() as usize
}

pub fn set_first_rec_group(block: &mut [u8], offset: usize) {
    debug_assert!(offset < BLOCK_SIZE);
    header_mut(block).first_rec_group = U16::new(offset as u16);
}

pub fn get_checkpoint_no(block: &[u8]) -> u32 {
    header(block).checkpoint_no.get()
}

pub fn set_checkpoint_no(block: &mut [u8], checkpoint_no: u64) {
    header_mut(block).checkpoint_no = U32::new(checkpoint_no as u32);
}

/// Compute and store the trailer checksum.
pub fn store_checksum(block: &mut [u8], encrypted: bool) {
    debug_assert_eq!(block.len(), BLOCK_SIZE);
    let limit = trailer_offset(encrypted);
    let crc = CRC32C.checksum(&block[..limit]);
    block[BLOCK_SIZE - BLOCK_TRAILER_SIZE..].copy_from_slice(&crc.to_be_bytes());
}

/// Verify the trailer checksum.
pub fn verify_checksum(block: &[u8], encrypted: bool) -> bool {
    debug_assert_eq!(block.len(), BLOCK_SIZE);
    let limit = trailer_offset(encrypted);
    let stored = u32::from_be_bytes(
        block[BLOCK_SIZE - BLOCK_TRAILER_SIZE..]
            .try_into()
            .unwrap(),
    );
    CRC32C.checksum(&block[..limit]) == stored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_no_invariant() {
        for lsn in [0u64, 1, 12, 511, 512, 513, 1024, 8192, 1 << 40] {
            assert_eq!(block_no_for_lsn(lsn), (1 + (lsn / 512) % (1 << 31)) as u32);
        }
    }

    #[test]
    fn block_no_stays_in_mask_range() {
        let huge = (1u64 << 31) * 512 * 3 + 77;
        let no = block_no_for_lsn(huge);
        assert!(no <= BLOCK_NO_MASK);
    }

    #[test]
    fn init_sets_header_fields() {
        let mut block = [0u8; BLOCK_SIZE];
        init_block(&mut block, 512);

        assert_eq!(get_block_no(&block), 2);
        assert_eq!(get_data_len(&block), BLOCK_HDR_SIZE);
        assert_eq!(get_first_rec_group(&block), 0);
        assert!(!get_flush_bit(&block));
    }

    #[test]
    fn flush_bit_does_not_disturb_block_no() {
        let mut block = [0u8; BLOCK_SIZE];
        init_block(&mut block, 1024);
        let no = get_block_no(&block);

        set_flush_bit(&mut block, true);
        assert!(get_flush_bit(&block));
        assert_eq!(get_block_no(&block), no);

        set_flush_bit(&mut block, false);
        assert!(!get_flush_bit(&block));
        assert_eq!(get_block_no(&block), no);
    }

    #[test]
    fn checksum_round_trip() {
        let mut block = [0u8; BLOCK_SIZE];
        init_block(&mut block, 12);
        block[BLOCK_HDR_SIZE..BLOCK_HDR_SIZE + 5].copy_from_slice(b"hello");
        set_data_len(&mut block, BLOCK_HDR_SIZE + 5);

        store_checksum(&mut block, false);
        assert!(verify_checksum(&block, false));

        block[20] ^= 0xFF;
        assert!(!verify_checksum(&block, false));
    }

    #[test]
    fn encrypted_blocks_reserve_key_slot() {
        assert_eq!(payload_size(false), 496);
        assert_eq!(payload_size(true), 486);
        assert_eq!(trailer_offset(false), 508);
        assert_eq!(trailer_offset(true), 498);
        assert_eq!(framing_size(false), 16);
        assert_eq!(framing_size(true), 26);
    }

    #[test]
    fn checkpoint_no_stores_low_bits() {
        let mut block = [0u8; BLOCK_SIZE];
        init_block(&mut block, 12);
        set_checkpoint_no(&mut block, 0x1_2345_6789);
        assert_eq!(get_checkpoint_no(&block), 0x2345_6789);
    }
}
