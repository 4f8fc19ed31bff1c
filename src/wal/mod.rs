//! Write-Ahead Log segments.
//!
//! Every committed write group is appended to the tail segment as a single
//! record before any of it reaches a memtable. Segments are rotated when the
//! active memtable is switched and deleted once every memtable that depends
//! on them has been flushed.
//!
//! # File Format
//!
//! ```text
//! +------------------+
//! | Header (64 bytes)|
//! +------------------+
//! | Record 1         |
//! +------------------+
//! | Record 2         |
//! +------------------+
//! | ...              |
//! +------------------+
//! ```
//!
//! ## Record Format
//!
//! ```text
//! +-----------+--------------------+-----------+
//! |  len:u32  | payload (len bytes)| crc32:u32 |
//! +-----------+--------------------+-----------+
//! ```
//!
//! - Frame integers are big-endian
//! - The CRC32C checksum covers the payload
//! - The payload is an encoded write batch (see `crate::batch`)
//!
//! A crash can leave a partially written record at the tail. How such a tail,
//! or a checksum failure further in, is handled on replay is controlled by
//! [`WalRecoveryMode`].

pub mod header;
pub mod reader;
pub mod writer;

use std::fs::File;
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_32_ISCSI};

use crate::error::Result;

pub use reader::LogReader;
pub use writer::LogWriter;

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Bytes of framing around each payload.
pub const FRAME_OVERHEAD: usize = 8;

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
const WAL_DIR: &str = "wal";

/// What replay does when it meets a damaged record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WalRecoveryMode {
    /// Any damage fails recovery.
    AbsoluteConsistency,
    /// A torn final record is ignored, anything else fails recovery.
    TolerateCorruptedTailRecords,
    /// Replay stops at the first damaged record; the rest of the segment and
    /// all later segments are dropped.
    #[default]
    PointInTimeRecovery,
    /// Damaged records are skipped.
    SkipAnyCorruptedRecords,
}

#[derive(Debug, Clone)]
pub struct WalOptions {
    pub buffer_size: usize,
    /// Leave appended records in the writer buffer until `flush` is called.
    pub manual_flush: bool,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            manual_flush: false,
        }
    }
}

pub fn wal_dir(db_dir: &Path) -> PathBuf {
    db_dir.join(WAL_DIR)
}

pub fn log_file_path(db_dir: &Path, number: u64) -> PathBuf {
    wal_dir(db_dir).join(format!("{:06}.log", number))
}

/// Log numbers of all segments in the WAL directory, ascending.
pub fn list_log_numbers(db_dir: &Path) -> Result<Vec<u64>> {
    let dir = wal_dir(db_dir);
    let mut numbers: Vec<u64> = std::fs::read_dir(&dir)?
        .filter_map(|entry| {
            let path = entry.ok()?.path();
            if path.extension()?.to_str()? != "log" {
                return None;
            }
            path.file_stem()?.to_str()?.parse::<u64>().ok()
        })
        .collect();
    numbers.sort_unstable();
    Ok(numbers)
}

/// fsyncs a directory so newly created entries survive a crash.
pub fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}
