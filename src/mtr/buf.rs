//! # Mini-Transaction Record Buffer
//!
//! Staging buffer for the redo bytes of one mini-transaction: a chain of
//! fixed-capacity heap blocks. Appends never move previously written
//! bytes (so the commit path can stream the chain out block by block) and
//! the single-block case, which covers almost every mini-transaction,
//! costs one allocation.

/// Capacity of one chain block.
pub const REC_BLOCK_CAPACITY: usize = 512;

#[derive(Debug)]
struct RecBlock {
    used: usize,
    data: Box<[u8; REC_BLOCK_CAPACITY]>,
}

impl RecBlock {
    fn new() -> Self {
        Self {
            used: 0,
            data: Box::new([0u8; REC_BLOCK_CAPACITY]),
        }
    }

    fn bytes(&self) -> &[u8] {
        &self.data[..self.used]
    }

    fn free(&self) -> usize {
        REC_BLOCK_CAPACITY - self.used
    }
}

/// A chain of fixed-capacity blocks holding record bytes.
#[derive(Debug, Default)]
pub struct RecBuf {
    blocks: Vec<RecBlock>,
    len: usize,
}

impl RecBuf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes staged.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the content fits one chain block; the commit fast path
    /// applies only then.
    pub fn is_small(&self) -> bool {
        self.blocks.len() <= 1
    }

    /// Append bytes, growing the chain as needed.
    pub fn push(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            if self.blocks.last().map_or(true, |b| b.free() == 0) {
                self.blocks.push(RecBlock::new());
            }
            let block = self.blocks.last_mut().unwrap();
            let take = bytes.len().min(block.free());
            block.data[block.used..block.used + take].copy_from_slice(&bytes[..take]);
            block.used += take;
            self.len += take;
            bytes = &bytes[take..];
        }
    }

    /// Append a single byte.
    pub fn push_byte(&mut self, byte: u8) {
        self.push(&[byte]);
    }

    /// The first block's bytes; the whole content when `is_small()`.
    pub fn front(&self) -> &[u8] {
        self.blocks.first().map(|b| b.bytes()).unwrap_or(&[])
    }

    /// Visit the chain in order.
    pub fn for_each_block<F: FnMut(&[u8])>(&self, mut visit: F) {
        for block in &self.blocks {
            visit(block.bytes());
        }
    }

    /// Borrow every block's bytes in order.
    pub fn chunks(&self) -> Vec<&[u8]> {
        self.blocks.iter().map(|b| b.bytes()).collect()
    }

    /// Drop the content, keeping nothing allocated.
    pub fn erase(&mut self) {
        self.blocks.clear();
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty_and_small() {
        let buf = RecBuf::new();
        assert!(buf.is_empty());
        assert!(buf.is_small());
        assert_eq!(buf.front(), b"");
    }

    #[test]
    fn single_block_stays_small() {
        let mut buf = RecBuf::new();
        buf.push(b"redo record");
        buf.push_byte(0);

        assert_eq!(buf.len(), 12);
        assert!(buf.is_small());
        assert_eq!(buf.front(), b"redo record\0");
    }

    #[test]
    fn chains_across_blocks_without_moving_bytes() {
        let mut buf = RecBuf::new();
        let payload: Vec<u8> = (0..1500).map(|i| (i % 251) as u8).collect();
        buf.push(&payload);

        assert_eq!(buf.len(), 1500);
        assert!(!buf.is_small());

        let mut collected = Vec::new();
        buf.for_each_block(|bytes| collected.extend_from_slice(bytes));
        assert_eq!(collected, payload);

        let chunk_total: usize = buf.chunks().iter().map(|c| c.len()).sum();
        assert_eq!(chunk_total, 1500);
    }

    #[test]
    fn exact_block_boundary() {
        let mut buf = RecBuf::new();
        buf.push(&vec![7u8; REC_BLOCK_CAPACITY]);
        assert!(buf.is_small());

        buf.push_byte(8);
        assert!(!buf.is_small());
        assert_eq!(buf.len(), REC_BLOCK_CAPACITY + 1);
    }

    #[test]
    fn erase_resets() {
        let mut buf = RecBuf::new();
        buf.push(&vec![1u8; 2000]);
        buf.erase();
        assert!(buf.is_empty());
        assert!(buf.is_small());
    }
}
