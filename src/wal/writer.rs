use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, WriteBytesExt};

use super::header::{Header, HEADER_SIZE};
use super::{log_file_path, WalOptions, CRC32, FRAME_OVERHEAD};
use crate::error::{Error, Result};

/// The length prefix of a frame is a u32.
fn frame_len(len: usize) -> Result<u32> {
    u32::try_from(len)
        .map_err(|_| Error::InvalidArgument(format!("WAL record of {} bytes is too large", len)))
}

/// Appends framed records to one WAL segment.
pub struct LogWriter {
    number: u64,
    path: PathBuf,
    file: File,
    writer: BufWriter<File>,
    /// Bytes handed to the writer, header included.
    size: u64,
    manual_flush: bool,
    #[cfg(test)]
    pub(crate) fail_appends: bool,
}

impl std::fmt::Debug for LogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWriter")
            .field("number", &self.number)
            .field("path", &self.path)
            .field("size", &self.size)
            .finish()
    }
}

impl LogWriter {
    /// Creates segment `number` under `db_dir`, failing if it already exists.
    /// `start_sequence` is the last sequence published before the segment.
    pub fn create(db_dir: &Path, number: u64, start_sequence: u64, opts: &WalOptions) -> Result<Self> {
        let path = log_file_path(db_dir, number);
        let file = File::options()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let mut writer = BufWriter::with_capacity(opts.buffer_size, file.try_clone()?);
        writer.write_all(&Header::new(number, start_sequence).encode())?;
        writer.flush()?;

        Ok(Self {
            number,
            path,
            file,
            writer,
            size: HEADER_SIZE as u64,
            manual_flush: opts.manual_flush,
            #[cfg(test)]
            fail_appends: false,
        })
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_size(&self) -> u64 {
        self.size
    }

    /// True when nothing but the header has been written.
    pub fn is_empty(&self) -> bool {
        self.size == HEADER_SIZE as u64
    }

    /// Appends one framed record and returns the number of bytes it took.
    pub fn add_record(&mut self, payload: &[u8]) -> Result<u64> {
        #[cfg(test)]
        if self.fail_appends {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "injected WAL failure").into());
        }

        let len = frame_len(payload.len())?;
        let checksum = CRC32.checksum(payload);
        self.writer.write_u32::<BigEndian>(len)?;
        self.writer.write_all(payload)?;
        self.writer.write_u32::<BigEndian>(checksum)?;
        if !self.manual_flush {
            self.writer.flush()?;
        }

        let written = (payload.len() + FRAME_OVERHEAD) as u64;
        self.size += written;
        Ok(written)
    }

    /// Hands buffered records to the operating system.
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flushes and fsyncs the segment.
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::{wal_dir, LogReader, WalRecoveryMode};
    use tempfile::TempDir;

    fn setup() -> TempDir {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        std::fs::create_dir_all(wal_dir(temp_dir.path())).expect("Failed to create wal dir");
        temp_dir
    }

    #[test]
    fn test_oversized_record_rejected() {
        assert_eq!(frame_len(1024).expect("Failed to size frame"), 1024);
        assert_eq!(frame_len(u32::MAX as usize).expect("Failed to size frame"), u32::MAX);
        assert!(matches!(
            frame_len(u32::MAX as usize + 1),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_append_and_sync() -> Result<()> {
        let temp_dir = setup();
        let mut writer = LogWriter::create(temp_dir.path(), 7, 0, &WalOptions::default())?;
        assert!(writer.is_empty());

        let written = writer.add_record(b"hello")?;
        assert_eq!(written, 5 + FRAME_OVERHEAD as u64);
        writer.sync()?;

        let on_disk = std::fs::metadata(writer.path())?.len();
        assert_eq!(on_disk, writer.file_size());
        assert_eq!(writer.number(), 7);
        Ok(())
    }

    #[test]
    fn test_create_refuses_existing_segment() -> Result<()> {
        let temp_dir = setup();
        let _writer = LogWriter::create(temp_dir.path(), 1, 0, &WalOptions::default())?;
        assert!(LogWriter::create(temp_dir.path(), 1, 0, &WalOptions::default()).is_err());
        Ok(())
    }

    #[test]
    fn test_manual_flush_keeps_records_buffered() -> Result<()> {
        let temp_dir = setup();
        let opts = WalOptions {
            manual_flush: true,
            ..Default::default()
        };
        let mut writer = LogWriter::create(temp_dir.path(), 3, 0, &opts)?;
        writer.add_record(b"pending")?;
        assert_eq!(std::fs::metadata(writer.path())?.len(), HEADER_SIZE as u64);

        writer.flush()?;
        let records: Vec<_> = LogReader::open(writer.path(), WalRecoveryMode::AbsoluteConsistency)?
            .collect::<Result<Vec<_>>>()?;
        assert_eq!(records, vec![b"pending".to_vec()]);
        Ok(())
    }
}
