//! # Log Configuration
//!
//! Validated settings for a redo log instance. `LogConfig` is a plain
//! struct with chainable setters; `validate()` is called once when the log
//! is created and rejects combinations the engine cannot serve.
//!
//! ## Settings
//!
//! | Setting              | Default   | Constraint                          |
//! |----------------------|-----------|-------------------------------------|
//! | `log_buffer_size`    | 2 MiB     | >= 16 blocks and >= 4 pages         |
//! | `log_file_size`      | 32 MiB    | multiple of 512, < 2^47, > main file|
//! | `thread_concurrency` | 4         | used only for capacity sizing       |
//! | `encrypt_log`        | false     | reserves the block key slot         |
//! | `flush_method`       | Fsync     | ODsync / Fsync / Nosync             |
//! | `write_ahead_size`   | 8 KiB     | power of two, >= one block          |
//! | `use_pmem`           | false     | mapped persistent-memory backend    |
//!
//! `log_buffer_size` is the size of one half of the double buffer; twice
//! that much memory is allocated.

pub mod constants;

use std::path::{Path, PathBuf};

use eyre::{ensure, Result};

use constants::{
    BLOCK_SIZE, MAIN_FILE_SIZE, MAX_DATA_FILE_SIZE, MIN_LOG_BUFFER_BLOCKS, MIN_LOG_BUFFER_PAGES,
    PAGE_SIZE,
};

/// How writes to the log files reach the storage medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMethod {
    /// Files are opened with `O_DSYNC`; every write is durable on return.
    ODsync,
    /// Writes land in the OS cache; durability requires `fdatasync`.
    Fsync,
    /// No flushing at all. Only for throwaway data.
    Nosync,
}

/// A tablespace registered with the log at creation time. An enumeration
/// record for each one is written into the main file header block.
#[derive(Debug, Clone)]
pub struct TablespaceRef {
    pub space_id: u32,
    pub path: String,
}

/// Configuration for one redo log instance.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory holding the log files.
    pub dir: PathBuf,
    /// Size of one half of the in-memory double buffer.
    pub log_buffer_size: usize,
    /// Size of the circular data and block files.
    pub log_file_size: u64,
    /// Expected number of concurrently appending threads; feeds the
    /// capacity formula.
    pub thread_concurrency: u32,
    /// Reserve the per-block encryption key slot.
    pub encrypt_log: bool,
    /// Durability mode of the log files.
    pub flush_method: FlushMethod,
    /// Write waves are padded up to this unit to avoid read-modify-write
    /// of device blocks.
    pub write_ahead_size: usize,
    /// Back the data files with memory-mapped persistent memory.
    pub use_pmem: bool,
    /// Tablespaces enumerated into the main file on creation.
    pub tablespaces: Vec<TablespaceRef>,
}

impl LogConfig {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            log_buffer_size: 2 * 1024 * 1024,
            log_file_size: 32 * 1024 * 1024,
            thread_concurrency: 4,
            encrypt_log: false,
            flush_method: FlushMethod::Fsync,
            write_ahead_size: 8192,
            use_pmem: false,
            tablespaces: Vec::new(),
        }
    }

    pub fn with_buffer_size(mut self, bytes: usize) -> Self {
        self.log_buffer_size = bytes;
        self
    }

    pub fn with_file_size(mut self, bytes: u64) -> Self {
        self.log_file_size = bytes;
        self
    }

    pub fn with_thread_concurrency(mut self, threads: u32) -> Self {
        self.thread_concurrency = threads;
        self
    }

    pub fn with_flush_method(mut self, method: FlushMethod) -> Self {
        self.flush_method = method;
        self
    }

    pub fn with_write_ahead_size(mut self, bytes: usize) -> Self {
        self.write_ahead_size = bytes;
        self
    }

    pub fn with_encryption(mut self, encrypt: bool) -> Self {
        self.encrypt_log = encrypt;
        self
    }

    pub fn with_pmem(mut self, use_pmem: bool) -> Self {
        self.use_pmem = use_pmem;
        self
    }

    pub fn with_tablespace(mut self, space_id: u32, path: impl Into<String>) -> Self {
        self.tablespaces.push(TablespaceRef {
            space_id,
            path: path.into(),
        });
        self
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.log_buffer_size >= MIN_LOG_BUFFER_BLOCKS * BLOCK_SIZE,
            "log buffer size {} is below the minimum of {} blocks",
            self.log_buffer_size,
            MIN_LOG_BUFFER_BLOCKS
        );
        ensure!(
            self.log_buffer_size >= MIN_LOG_BUFFER_PAGES * PAGE_SIZE,
            "log buffer size {} is below the minimum of {} pages",
            self.log_buffer_size,
            MIN_LOG_BUFFER_PAGES
        );
        ensure!(
            self.log_file_size % BLOCK_SIZE as u64 == 0,
            "log file size {} is not a multiple of the block size {}",
            self.log_file_size,
            BLOCK_SIZE
        );
        ensure!(
            self.log_file_size < MAX_DATA_FILE_SIZE,
            "log file size {} does not fit in the 47-bit checkpoint offset",
            self.log_file_size
        );
        ensure!(
            self.log_file_size > MAIN_FILE_SIZE as u64,
            "log file size {} is smaller than the main file",
            self.log_file_size
        );
        ensure!(
            self.write_ahead_size.is_power_of_two() && self.write_ahead_size >= BLOCK_SIZE,
            "write-ahead size {} must be a power of two of at least one block",
            self.write_ahead_size
        );
        ensure!(
            self.write_ahead_size <= self.log_buffer_size,
            "write-ahead size {} exceeds the log buffer size {}",
            self.write_ahead_size,
            self.log_buffer_size
        );
        ensure!(
            self.log_file_size % self.write_ahead_size as u64 == 0,
            "log file size {} is not a multiple of the write-ahead size {}",
            self.log_file_size,
            self.write_ahead_size
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = LogConfig::new("/tmp/turlog");
        config.validate().unwrap();
    }

    #[test]
    fn tiny_buffer_rejected() {
        let config = LogConfig::new("/tmp/turlog").with_buffer_size(1024);
        assert!(config.validate().is_err());
    }

    #[test]
    fn unaligned_file_size_rejected() {
        let config = LogConfig::new("/tmp/turlog").with_file_size(1000);
        assert!(config.validate().is_err());
    }

    #[test]
    fn write_ahead_must_be_power_of_two() {
        let config = LogConfig::new("/tmp/turlog").with_write_ahead_size(3000);
        assert!(config.validate().is_err());

        let config = LogConfig::new("/tmp/turlog").with_write_ahead_size(4096);
        config.validate().unwrap();
    }

    #[test]
    fn minimum_buffer_accepted() {
        let config = LogConfig::new("/tmp/turlog")
            .with_buffer_size(4 * PAGE_SIZE)
            .with_write_ahead_size(BLOCK_SIZE);
        config.validate().unwrap();
    }
}
