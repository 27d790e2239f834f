//! # TurLog - Embedded Redo Log Engine
//!
//! TurLog is the redo log core of a transactional storage engine: it
//! turns fine-grained page-level modifications into a durable,
//! recoverable byte stream on stable storage, and coordinates the buffer
//! pool's dirty-page lifecycle against that stream.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use turlog::{BufferPool, LogConfig, MiniTransaction, PageId, RedoLog};
//!
//! let pool = Arc::new(BufferPool::new());
//! let redo = RedoLog::create(LogConfig::new("./redo"), Arc::clone(&pool))?;
//!
//! let page = pool.page(PageId::new(1, 7));
//! let mut mtr = MiniTransaction::start(Arc::clone(&redo));
//! mtr.x_latch_page(&page);
//! mtr.append_log(b"page 7: set header field");
//! mtr.modify_page(&page);
//! let commit_lsn = mtr.commit();
//!
//! // Group commit: block until the record is on the medium.
//! redo.write_up_to(commit_lsn, true);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │   Mini-transactions (mtr)                │
//! │   record staging · latch memo · commit   │
//! ├────────────────────┬─────────────────────┤
//! │  Redo log (log)    │  Buffer pool (buf)  │
//! │  LSN · staging     │  page blocks        │
//! │  buffer · group    │  S/SX/X latches     │
//! │  commit · ckpt     │  flush list         │
//! ├────────────────────┴─────────────────────┤
//! │  Block / record codecs, circular files   │
//! ├──────────────────────────────────────────┤
//! │  File I/O (io): OS files · pmem mmap     │
//! └──────────────────────────────────────────┘
//! ```
//!
//! The write-ahead-logging contract in one sentence: a page may reach
//! its data file only after the redo covering its changes is durable,
//! and a checkpoint may claim an LSN only after every older page state
//! is either written out or covered by durable redo.
//!
//! ## Module Overview
//!
//! - [`config`]: validated settings and the layout constants
//! - [`io`]: positioned file I/O over OS files and persistent memory
//! - [`log`]: the log itself - blocks, buffer, files, group commit,
//!   checkpoints, lifecycle
//! - [`mtr`]: mini-transactions and their commit protocol
//! - [`buf`]: the buffer-pool interface the log coordinates with

pub mod buf;
pub mod config;
pub mod io;
pub mod log;
pub mod mtr;

/// Log sequence number: a monotonic byte counter over the log stream.
/// 63-bit; 0 is reserved for "no changes".
pub type Lsn = u64;

pub use buf::{BufferPool, PageBlock, PageId, RwLatch};
pub use config::{FlushMethod, LogConfig, TablespaceRef};
pub use log::files::{CheckpointRecord, DataPos};
pub use log::{LogStats, RedoLog};
pub use mtr::{LogMode, MiniTransaction};
