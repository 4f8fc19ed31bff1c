use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt};

use super::header::{Header, HEADER_SIZE};
use super::{WalRecoveryMode, CRC32, FRAME_OVERHEAD};
use crate::error::{Error, Result};

enum Frame {
    Record(Vec<u8>),
    End,
    /// The segment ends inside a frame.
    Torn,
    /// A complete frame failed its checksum.
    Damaged(String),
}

/// Replays the records of one WAL segment.
///
/// Damaged records are handled according to the [`WalRecoveryMode`] the
/// reader was opened with; when replay ends early, `valid_len` is the offset
/// just past the last good record.
pub struct LogReader {
    reader: BufReader<File>,
    path: PathBuf,
    number: u64,
    start_sequence: u64,
    mode: WalRecoveryMode,
    file_len: u64,
    offset: u64,
    valid_len: u64,
    done: bool,
    stopped_early: bool,
    skipped: usize,
}

impl LogReader {
    pub fn open(path: &Path, mode: WalRecoveryMode) -> Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut buf = [0u8; HEADER_SIZE];
        if file_len < HEADER_SIZE as u64 {
            return Err(Error::Corruption(format!(
                "truncated WAL header in {:?}",
                path
            )));
        }
        reader.read_exact(&mut buf)?;
        let header = Header::decode(&buf)?;

        Ok(Self {
            reader,
            path: path.to_path_buf(),
            number: header.log_number,
            start_sequence: header.start_sequence,
            mode,
            file_len,
            offset: HEADER_SIZE as u64,
            valid_len: HEADER_SIZE as u64,
            done: false,
            stopped_early: false,
            skipped: 0,
        })
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last sequence published before the segment was created.
    pub fn start_sequence(&self) -> u64 {
        self.start_sequence
    }

    /// True when replay ended on a torn or damaged record instead of a clean
    /// end of file.
    pub fn stopped_early(&self) -> bool {
        self.stopped_early
    }

    pub fn valid_len(&self) -> u64 {
        self.valid_len
    }

    /// Damaged records skipped under `SkipAnyCorruptedRecords`.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn next_frame(&mut self) -> Result<Frame> {
        let remaining = self.file_len - self.offset;
        if remaining == 0 {
            return Ok(Frame::End);
        }
        if remaining < FRAME_OVERHEAD as u64 {
            return Ok(Frame::Torn);
        }

        let start = self.offset;
        let len = u64::from(self.reader.read_u32::<BigEndian>()?);
        // Writers never emit empty payloads; zeroes mean a preallocated tail.
        if len == 0 || len + FRAME_OVERHEAD as u64 > remaining {
            return Ok(Frame::Torn);
        }

        let mut payload = vec![0u8; len as usize];
        self.reader.read_exact(&mut payload)?;
        let stored = self.reader.read_u32::<BigEndian>()?;
        self.offset += len + FRAME_OVERHEAD as u64;

        if CRC32.checksum(&payload) != stored {
            return Ok(Frame::Damaged(format!(
                "checksum mismatch in log {} at offset {}",
                self.number, start
            )));
        }
        self.valid_len = self.offset;
        Ok(Frame::Record(payload))
    }
}

impl Iterator for LogReader {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let frame = match self.next_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            match frame {
                Frame::Record(payload) => return Some(Ok(payload)),
                Frame::End => self.done = true,
                Frame::Torn => {
                    self.done = true;
                    self.stopped_early = true;
                    if self.mode == WalRecoveryMode::AbsoluteConsistency {
                        return Some(Err(Error::Corruption(format!(
                            "truncated record at end of log {}",
                            self.number
                        ))));
                    }
                    tracing::warn!(
                        log_number = self.number,
                        valid_len = self.valid_len,
                        "Ignoring torn record at end of WAL segment"
                    );
                }
                Frame::Damaged(msg) => match self.mode {
                    WalRecoveryMode::SkipAnyCorruptedRecords => {
                        self.skipped += 1;
                        tracing::warn!(log_number = self.number, "Skipping damaged record: {}", msg);
                    }
                    WalRecoveryMode::PointInTimeRecovery => {
                        self.done = true;
                        self.stopped_early = true;
                        tracing::warn!(log_number = self.number, "Stopping replay: {}", msg);
                    }
                    WalRecoveryMode::AbsoluteConsistency
                    | WalRecoveryMode::TolerateCorruptedTailRecords => {
                        self.done = true;
                        self.stopped_early = true;
                        return Some(Err(Error::Corruption(msg)));
                    }
                },
            }
        }
        None
    }
}
