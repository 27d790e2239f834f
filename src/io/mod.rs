//! # Log File I/O
//!
//! Uniform positioned I/O over the redo log files. Two backends exist:
//!
//! - `OsLogFile`: an ordinary file accessed with positioned reads and
//!   writes. Writes are durable on return only when the file was opened
//!   with `O_DSYNC`; otherwise callers that need medium durability must
//!   invoke `flush_data_only()`.
//! - `PmemLogFile`: a memory-mapped file on persistent memory. Writes copy
//!   into the mapping and flush the affected cache lines, so they are
//!   always durable and `flush_data_only()` is a no-op.
//!
//! ## Contract
//!
//! A successful `write` means the bytes are at least in the OS page cache.
//! `writes_are_durable()` tells callers whether `flush_data_only()` is
//! required on top. All errors are surfaced as `eyre` reports with the
//! path and operation attached; the log layer escalates them to fatal.
//!
//! ## Thread Safety
//!
//! All operations take `&self` and are safe to issue concurrently; the
//! backends use positioned I/O and never seek a shared cursor. (The pmem
//! backend serializes writes internally because overlapping writes to a
//! mapping would race; the log layer never issues overlapping writes.)

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::config::FlushMethod;

/// Create a log file of the given size, zero-filled and flushed, replacing
/// any previous file at the path.
pub fn create_log_file(path: &Path, size: u64) -> Result<()> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .wrap_err_with(|| format!("failed to create log file '{}'", path.display()))?;

    file.set_len(size)
        .wrap_err_with(|| format!("failed to size '{}' to {} bytes", path.display(), size))?;

    file.sync_all()
        .wrap_err_with(|| format!("failed to flush new log file '{}'", path.display()))?;

    Ok(())
}

/// One open redo log file.
#[derive(Debug)]
pub enum LogFile {
    Os(OsLogFile),
    Pmem(PmemLogFile),
}

impl LogFile {
    /// Open an existing log file with the backend selected by the
    /// configuration.
    pub fn open(
        path: &Path,
        read_only: bool,
        flush_method: FlushMethod,
        use_pmem: bool,
    ) -> Result<Self> {
        if use_pmem {
            Ok(LogFile::Pmem(PmemLogFile::open(path, read_only)?))
        } else {
            Ok(LogFile::Os(OsLogFile::open(path, read_only, flush_method)?))
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            LogFile::Os(f) => &f.path,
            LogFile::Pmem(f) => &f.path,
        }
    }

    /// Whether a successful `write` already implies medium durability.
    pub fn writes_are_durable(&self) -> bool {
        match self {
            LogFile::Os(f) => f.durable_writes,
            LogFile::Pmem(_) => true,
        }
    }

    pub fn size(&self) -> Result<u64> {
        match self {
            LogFile::Os(f) => {
                let meta = f
                    .file
                    .metadata()
                    .wrap_err_with(|| format!("failed to stat '{}'", f.path.display()))?;
                Ok(meta.len())
            }
            LogFile::Pmem(f) => Ok(f.mmap.lock().len() as u64),
        }
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            LogFile::Os(f) => {
                use std::os::unix::fs::FileExt;
                f.file.read_exact_at(buf, offset).wrap_err_with(|| {
                    format!(
                        "failed to read {} bytes at {} from '{}'",
                        buf.len(),
                        offset,
                        f.path.display()
                    )
                })
            }
            LogFile::Pmem(f) => f.read(offset, buf),
        }
    }

    pub fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        match self {
            LogFile::Os(f) => {
                use std::os::unix::fs::FileExt;
                f.file.write_all_at(buf, offset).wrap_err_with(|| {
                    format!(
                        "failed to write {} bytes at {} to '{}'",
                        buf.len(),
                        offset,
                        f.path.display()
                    )
                })
            }
            LogFile::Pmem(f) => f.write(offset, buf),
        }
    }

    /// Flush file data (not metadata) to the storage medium.
    pub fn flush_data_only(&self) -> Result<()> {
        match self {
            LogFile::Os(f) => {
                if f.flush_method == FlushMethod::Nosync {
                    return Ok(());
                }
                f.file
                    .sync_data()
                    .wrap_err_with(|| format!("failed to flush '{}'", f.path.display()))
            }
            LogFile::Pmem(_) => Ok(()),
        }
    }

    /// Rename the file in place; the handle stays valid.
    pub fn rename(&mut self, new_path: &Path) -> Result<()> {
        let old = self.path().to_path_buf();
        std::fs::rename(&old, new_path).wrap_err_with(|| {
            format!(
                "failed to rename '{}' to '{}'",
                old.display(),
                new_path.display()
            )
        })?;
        match self {
            LogFile::Os(f) => f.path = new_path.to_path_buf(),
            LogFile::Pmem(f) => f.path = new_path.to_path_buf(),
        }
        Ok(())
    }
}

/// Ordinary OS file backend.
#[derive(Debug)]
pub struct OsLogFile {
    file: File,
    path: PathBuf,
    flush_method: FlushMethod,
    durable_writes: bool,
}

impl OsLogFile {
    pub fn open(path: &Path, read_only: bool, flush_method: FlushMethod) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true).write(!read_only);

        if flush_method == FlushMethod::ODsync && !read_only {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(libc::O_DSYNC);
        }

        let file = options
            .open(path)
            .wrap_err_with(|| format!("failed to open log file '{}'", path.display()))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            flush_method,
            durable_writes: flush_method == FlushMethod::ODsync,
        })
    }
}

/// Memory-mapped persistent-memory backend.
#[derive(Debug)]
pub struct PmemLogFile {
    mmap: Mutex<MmapMut>,
    path: PathBuf,
}

impl PmemLogFile {
    pub fn open(path: &Path, read_only: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .wrap_err_with(|| format!("failed to open pmem log file '{}'", path.display()))?;

        // SAFETY: mapping a file mutably is unsafe because another process
        // could truncate or modify it underneath us. The log files are
        // owned exclusively by this engine, are created with a fixed size
        // before being opened, and every access below is bounds-checked
        // against the mapping length.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            mmap: Mutex::new(mmap),
            path: path.to_path_buf(),
        })
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mmap = self.mmap.lock();
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= mmap.len())
            .ok_or_else(|| {
                eyre::eyre!(
                    "read of {} bytes at {} beyond mapped size {} of '{}'",
                    buf.len(),
                    offset,
                    mmap.len(),
                    self.path.display()
                )
            })?;
        buf.copy_from_slice(&mmap[start..end]);
        Ok(())
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut mmap = self.mmap.lock();
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= mmap.len())
            .ok_or_else(|| {
                eyre::eyre!(
                    "write of {} bytes at {} beyond mapped size {} of '{}'",
                    buf.len(),
                    offset,
                    mmap.len(),
                    self.path.display()
                )
            })?;
        mmap[start..end].copy_from_slice(buf);
        mmap.flush_range(start, buf.len()).wrap_err_with(|| {
            format!("failed to flush mapped range of '{}'", self.path.display())
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_sizes_and_zero_fills() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.data");

        create_log_file(&path, 4096).unwrap();

        let file = LogFile::open(&path, true, FlushMethod::Fsync, false).unwrap();
        assert_eq!(file.size().unwrap(), 4096);

        let mut buf = [0xAAu8; 64];
        file.read(1000, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn os_file_positioned_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.data");
        create_log_file(&path, 8192).unwrap();

        let file = LogFile::open(&path, false, FlushMethod::Fsync, false).unwrap();
        assert!(!file.writes_are_durable());

        file.write(512, b"redo bytes").unwrap();
        file.flush_data_only().unwrap();

        let mut buf = [0u8; 10];
        file.read(512, &mut buf).unwrap();
        assert_eq!(&buf, b"redo bytes");
    }

    #[test]
    fn odsync_writes_are_durable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.data");
        create_log_file(&path, 4096).unwrap();

        let file = LogFile::open(&path, false, FlushMethod::ODsync, false).unwrap();
        assert!(file.writes_are_durable());
        file.write(0, b"durable").unwrap();
    }

    #[test]
    fn pmem_round_trip_and_durability() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.data");
        create_log_file(&path, 4096).unwrap();

        let file = LogFile::open(&path, false, FlushMethod::Fsync, true).unwrap();
        assert!(file.writes_are_durable());

        file.write(100, b"pmem bytes").unwrap();
        let mut buf = [0u8; 10];
        file.read(100, &mut buf).unwrap();
        assert_eq!(&buf, b"pmem bytes");
    }

    #[test]
    fn pmem_rejects_out_of_bounds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.data");
        create_log_file(&path, 512).unwrap();

        let file = LogFile::open(&path, false, FlushMethod::Fsync, true).unwrap();
        assert!(file.write(500, &[0u8; 64]).is_err());
    }

    #[test]
    fn rename_keeps_handle_valid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.data");
        let new_path = dir.path().join("log.renamed");
        create_log_file(&path, 4096).unwrap();

        let mut file = LogFile::open(&path, false, FlushMethod::Fsync, false).unwrap();
        file.write(0, b"before rename").unwrap();
        file.rename(&new_path).unwrap();

        let mut buf = [0u8; 13];
        file.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"before rename");
        assert!(new_path.exists());
        assert!(!path.exists());
    }
}
