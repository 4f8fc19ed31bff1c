//! Mutation batches and their wire format.
//!
//! A batch is the unit handed to the write pipeline and the payload of one
//! WAL record.
//!
//! # Format
//!
//! ```text
//! +--------------+-----------+-----------+-----------+-----+
//! | sequence:u64 | count:u32 | record 1  | record 2  | ... |
//! +--------------+-----------+-----------+-----------+-----+
//! ```
//!
//! Header integers are little-endian. Every record starts with a one-byte
//! [`Tag`]; the column-family variants carry a varint32 family id, followed
//! by varint32 length-prefixed key and value as the tag requires.
//!
//! `count` covers puts, deletes, single deletes, range deletes, merges and
//! blob indexes. Log data and transaction markers are not counted.

pub mod handler;
pub mod protection;
pub mod record;

use std::sync::atomic::{AtomicU32, Ordering};

use byteorder::{ByteOrder, LittleEndian};

use crate::coding::{put_length_prefixed_slice, put_varint32};
use crate::error::{Error, Result};
pub use handler::Handler;
use protection::ProtectionInfo;
pub use record::{read_record, PrepareKind, Record, Tag};

/// Bytes of the fixed header: sequence (8) and count (4).
pub const HEADER_SIZE: usize = 12;

pub const DEFAULT_COLUMN_FAMILY: u32 = 0;

/// Bits describing which kinds of records a batch holds.
pub mod content_flags {
    /// Flags have not been computed yet.
    pub const DEFERRED: u32 = 1 << 0;
    pub const HAS_PUT: u32 = 1 << 1;
    pub const HAS_DELETE: u32 = 1 << 2;
    pub const HAS_SINGLE_DELETE: u32 = 1 << 3;
    pub const HAS_MERGE: u32 = 1 << 4;
    pub const HAS_BEGIN_PREPARE: u32 = 1 << 5;
    pub const HAS_END_PREPARE: u32 = 1 << 6;
    pub const HAS_COMMIT: u32 = 1 << 7;
    pub const HAS_ROLLBACK: u32 = 1 << 8;
    pub const HAS_DELETE_RANGE: u32 = 1 << 9;
    pub const HAS_BLOB_INDEX: u32 = 1 << 10;
    pub const HAS_BEGIN_UNPREPARE: u32 = 1 << 11;
}

use content_flags::*;

/// Snapshot of a batch used by save points and the WAL termination point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SavePoint {
    pub size: usize,
    pub count: u32,
    pub content_flags: u32,
}

pub(crate) fn decode_count(contents: &[u8]) -> u32 {
    LittleEndian::read_u32(&contents[8..HEADER_SIZE])
}

/// Size of the batch produced by appending a batch of `right` bytes to one of
/// `left` bytes. Either side may be empty (zero).
pub fn appended_byte_size(left: usize, right: usize) -> usize {
    if left == 0 || right == 0 {
        left + right
    } else {
        left + right - HEADER_SIZE
    }
}

fn check_length(data: &[u8], what: &str) -> Result<()> {
    if data.len() > u32::MAX as usize {
        return Err(Error::InvalidArgument(format!("{} is too large", what)));
    }
    Ok(())
}

/// An ordered set of mutations applied atomically.
#[derive(Debug)]
pub struct WriteBatch {
    rep: Vec<u8>,
    content_flags: AtomicU32,
    save_points: Vec<SavePoint>,
    wal_term_point: Option<SavePoint>,
    /// Zero means unbounded.
    max_bytes: usize,
    protection: Option<ProtectionInfo>,
}

impl Clone for WriteBatch {
    fn clone(&self) -> Self {
        Self {
            rep: self.rep.clone(),
            content_flags: AtomicU32::new(self.content_flags.load(Ordering::Relaxed)),
            save_points: self.save_points.clone(),
            wal_term_point: self.wal_term_point,
            max_bytes: self.max_bytes,
            protection: self.protection.clone(),
        }
    }
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for WriteBatch {
    fn eq(&self, other: &Self) -> bool {
        self.rep == other.rep
    }
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::with_capacity(0, 0)
    }

    /// Creates a batch that refuses to grow beyond `max_bytes` (0 = unbounded).
    pub fn with_capacity(reserved_bytes: usize, max_bytes: usize) -> Self {
        let mut rep = Vec::with_capacity(reserved_bytes.max(HEADER_SIZE));
        rep.resize(HEADER_SIZE, 0);
        Self {
            rep,
            content_flags: AtomicU32::new(0),
            save_points: Vec::new(),
            wal_term_point: None,
            max_bytes,
            protection: None,
        }
    }

    /// Creates a batch that keeps a checksum per record.
    pub fn with_protection() -> Self {
        let mut batch = Self::new();
        batch.protection = Some(ProtectionInfo::default());
        batch
    }

    /// Wraps an encoded batch, e.g. one read back from the WAL.
    pub fn from_data(rep: Vec<u8>) -> Self {
        Self {
            rep,
            content_flags: AtomicU32::new(DEFERRED),
            save_points: Vec::new(),
            wal_term_point: None,
            max_bytes: 0,
            protection: None,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.rep
    }

    pub fn into_data(self) -> Vec<u8> {
        self.rep
    }

    pub fn data_size(&self) -> usize {
        self.rep.len()
    }

    pub fn count(&self) -> u32 {
        if self.rep.len() < HEADER_SIZE {
            return 0;
        }
        decode_count(&self.rep)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub(crate) fn set_count(&mut self, count: u32) {
        LittleEndian::write_u32(&mut self.rep[8..HEADER_SIZE], count);
    }

    pub fn sequence(&self) -> u64 {
        if self.rep.len() < HEADER_SIZE {
            return 0;
        }
        LittleEndian::read_u64(&self.rep[0..8])
    }

    pub fn set_sequence(&mut self, seq: u64) {
        LittleEndian::write_u64(&mut self.rep[0..8], seq);
    }

    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(HEADER_SIZE, 0);
        self.content_flags.store(0, Ordering::Relaxed);
        self.save_points.clear();
        self.wal_term_point = None;
        if let Some(protection) = &mut self.protection {
            protection.clear();
        }
    }

    pub fn has_protection(&self) -> bool {
        self.protection.is_some()
    }

    // ===== Content flags =====

    pub fn content_flags(&self) -> u32 {
        let flags = self.content_flags.load(Ordering::Relaxed);
        if flags & DEFERRED == 0 {
            return flags;
        }
        let mut classifier = ContentClassifier::default();
        // A batch that fails to parse is reported as holding nothing; the
        // error resurfaces when it is iterated.
        let _ = self.iterate(&mut classifier);
        self.content_flags.store(classifier.flags, Ordering::Relaxed);
        classifier.flags
    }

    fn add_flags(&self, flags: u32) {
        let current = self.content_flags.load(Ordering::Relaxed);
        self.content_flags.store(current | flags, Ordering::Relaxed);
    }

    pub fn has_put(&self) -> bool {
        self.content_flags() & HAS_PUT != 0
    }

    pub fn has_delete(&self) -> bool {
        self.content_flags() & HAS_DELETE != 0
    }

    pub fn has_single_delete(&self) -> bool {
        self.content_flags() & HAS_SINGLE_DELETE != 0
    }

    pub fn has_delete_range(&self) -> bool {
        self.content_flags() & HAS_DELETE_RANGE != 0
    }

    pub fn has_merge(&self) -> bool {
        self.content_flags() & HAS_MERGE != 0
    }

    pub fn has_begin_prepare(&self) -> bool {
        self.content_flags() & (HAS_BEGIN_PREPARE | HAS_BEGIN_UNPREPARE) != 0
    }

    pub fn has_end_prepare(&self) -> bool {
        self.content_flags() & HAS_END_PREPARE != 0
    }

    pub fn has_commit(&self) -> bool {
        self.content_flags() & HAS_COMMIT != 0
    }

    pub fn has_rollback(&self) -> bool {
        self.content_flags() & HAS_ROLLBACK != 0
    }

    // ===== Appends =====

    fn local_save_point(&self) -> SavePoint {
        SavePoint {
            size: self.rep.len(),
            count: self.count(),
            content_flags: self.content_flags.load(Ordering::Relaxed),
        }
    }

    /// Undoes the append that started at `save` if it broke the size ceiling.
    fn commit_append(&mut self, save: SavePoint) -> Result<()> {
        if self.max_bytes != 0 && self.rep.len() > self.max_bytes {
            self.rep.truncate(save.size);
            self.set_count(save.count);
            self.content_flags.store(save.content_flags, Ordering::Relaxed);
            return Err(Error::MemoryLimit);
        }
        Ok(())
    }

    fn push_tag(&mut self, plain: Tag, with_cf: Tag, cf: u32) {
        if cf == DEFAULT_COLUMN_FAMILY {
            self.rep.push(plain as u8);
        } else {
            self.rep.push(with_cf as u8);
            put_varint32(&mut self.rep, cf);
        }
    }

    fn append_entry(
        &mut self,
        (plain, with_cf): (Tag, Tag),
        cf: u32,
        key: &[u8],
        value: Option<&[u8]>,
        flag: u32,
    ) -> Result<()> {
        check_length(key, "key")?;
        if let Some(value) = value {
            check_length(value, "value")?;
        }

        let save = self.local_save_point();
        self.set_count(save.count + 1);
        self.push_tag(plain, with_cf, cf);
        put_length_prefixed_slice(&mut self.rep, key);
        if let Some(value) = value {
            put_length_prefixed_slice(&mut self.rep, value);
        }
        self.add_flags(flag);
        self.commit_append(save)?;

        if let Some(protection) = &mut self.protection {
            protection.push(plain, cf, key, value.unwrap_or_default());
        }
        Ok(())
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_cf(DEFAULT_COLUMN_FAMILY, key, value)
    }

    pub fn put_cf(&mut self, cf: u32, key: &[u8], value: &[u8]) -> Result<()> {
        self.append_entry(
            (Tag::Value, Tag::ColumnFamilyValue),
            cf,
            key,
            Some(value),
            HAS_PUT,
        )
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.delete_cf(DEFAULT_COLUMN_FAMILY, key)
    }

    pub fn delete_cf(&mut self, cf: u32, key: &[u8]) -> Result<()> {
        self.append_entry(
            (Tag::Deletion, Tag::ColumnFamilyDeletion),
            cf,
            key,
            None,
            HAS_DELETE,
        )
    }

    pub fn single_delete(&mut self, key: &[u8]) -> Result<()> {
        self.single_delete_cf(DEFAULT_COLUMN_FAMILY, key)
    }

    pub fn single_delete_cf(&mut self, cf: u32, key: &[u8]) -> Result<()> {
        self.append_entry(
            (Tag::SingleDeletion, Tag::ColumnFamilySingleDeletion),
            cf,
            key,
            None,
            HAS_SINGLE_DELETE,
        )
    }

    /// Deletes every key in `[begin, end)`.
    pub fn delete_range(&mut self, begin: &[u8], end: &[u8]) -> Result<()> {
        self.delete_range_cf(DEFAULT_COLUMN_FAMILY, begin, end)
    }

    pub fn delete_range_cf(&mut self, cf: u32, begin: &[u8], end: &[u8]) -> Result<()> {
        self.append_entry(
            (Tag::RangeDeletion, Tag::ColumnFamilyRangeDeletion),
            cf,
            begin,
            Some(end),
            HAS_DELETE_RANGE,
        )
    }

    pub fn merge(&mut self, key: &[u8], operand: &[u8]) -> Result<()> {
        self.merge_cf(DEFAULT_COLUMN_FAMILY, key, operand)
    }

    pub fn merge_cf(&mut self, cf: u32, key: &[u8], operand: &[u8]) -> Result<()> {
        self.append_entry(
            (Tag::Merge, Tag::ColumnFamilyMerge),
            cf,
            key,
            Some(operand),
            HAS_MERGE,
        )
    }

    pub fn put_blob_index_cf(&mut self, cf: u32, key: &[u8], blob_index: &[u8]) -> Result<()> {
        self.append_entry(
            (Tag::BlobIndex, Tag::ColumnFamilyBlobIndex),
            cf,
            key,
            Some(blob_index),
            HAS_BLOB_INDEX,
        )
    }

    /// Appends an opaque blob that reaches the WAL but is never applied.
    pub fn put_log_data(&mut self, blob: &[u8]) -> Result<()> {
        check_length(blob, "blob")?;
        let save = self.local_save_point();
        self.rep.push(Tag::LogData as u8);
        put_length_prefixed_slice(&mut self.rep, blob);
        self.commit_append(save)
    }

    // ===== Save points =====

    pub fn set_save_point(&mut self) {
        let save = self.local_save_point();
        self.save_points.push(save);
    }

    /// Reverts to the most recent save point, or clears the batch when there
    /// is none.
    pub fn rollback_to_save_point(&mut self) -> Result<()> {
        let Some(save) = self.save_points.pop() else {
            self.clear();
            return Ok(());
        };

        if save.size > self.rep.len() {
            return Err(Error::Corruption("save point is past the end of the batch".into()));
        }
        if save.size == self.rep.len() {
            return Ok(());
        }
        if save.size < HEADER_SIZE {
            self.clear();
            return Ok(());
        }
        self.rep.truncate(save.size);
        self.set_count(save.count);
        self.content_flags.store(save.content_flags, Ordering::Relaxed);
        if let Some(protection) = &mut self.protection {
            protection.truncate(save.count as usize);
        }
        if let Some(term) = self.wal_term_point {
            if term.size > save.size {
                self.wal_term_point = None;
            }
        }
        Ok(())
    }

    /// Drops the most recent save point without reverting anything.
    pub fn pop_save_point(&mut self) -> Result<()> {
        self.save_points
            .pop()
            .map(|_| ())
            .ok_or_else(|| Error::NotFound("no save point to pop".into()))
    }

    /// Records the current end of the batch; later appends still reach the
    /// memtable but are left out when the batch is appended WAL-only.
    pub fn mark_wal_termination_point(&mut self) {
        self.wal_term_point = Some(self.local_save_point());
    }

    pub fn wal_termination_point(&self) -> Option<SavePoint> {
        self.wal_term_point
    }

    // ===== Two-phase commit markers =====

    /// Reserves the slot for a begin-prepare marker.
    pub fn insert_noop(&mut self) {
        self.rep.push(Tag::Noop as u8);
    }

    /// Turns a batch started with `insert_noop` into a prepared section.
    pub fn mark_end_prepare(&mut self, xid: &[u8], kind: PrepareKind) -> Result<()> {
        if self.rep.get(HEADER_SIZE) != Some(&(Tag::Noop as u8)) {
            return Err(Error::InvalidArgument(
                "prepared batch must start with a noop marker".into(),
            ));
        }
        // A prepared section cannot be partially rolled back.
        self.save_points.clear();

        let (begin, flag) = match kind {
            PrepareKind::Committed => (Tag::BeginPrepareXid, HAS_BEGIN_PREPARE),
            PrepareKind::Persisted => (Tag::BeginPersistedPrepareXid, HAS_BEGIN_PREPARE),
            PrepareKind::Unprepared => (Tag::BeginUnprepareXid, HAS_BEGIN_UNPREPARE),
        };
        self.rep[HEADER_SIZE] = begin as u8;
        self.rep.push(Tag::EndPrepareXid as u8);
        put_length_prefixed_slice(&mut self.rep, xid);
        self.add_flags(flag | HAS_END_PREPARE);
        Ok(())
    }

    pub fn mark_commit(&mut self, xid: &[u8]) {
        self.rep.push(Tag::CommitXid as u8);
        put_length_prefixed_slice(&mut self.rep, xid);
        self.add_flags(HAS_COMMIT);
    }

    pub fn mark_rollback(&mut self, xid: &[u8]) {
        self.rep.push(Tag::RollbackXid as u8);
        put_length_prefixed_slice(&mut self.rep, xid);
        self.add_flags(HAS_ROLLBACK);
    }

    // ===== Iteration =====

    /// Replays every record into `handler` in encoding order.
    pub fn iterate(&self, handler: &mut dyn Handler) -> Result<()> {
        if self.rep.len() < HEADER_SIZE {
            return Err(Error::Corruption("malformed WriteBatch (too small)".into()));
        }
        handler::iterate(&self.rep, handler, HEADER_SIZE, self.rep.len())
    }

    /// Replays `[begin, end)` of the encoded buffer without checking the count.
    pub fn iterate_range(&self, handler: &mut dyn Handler, begin: usize, end: usize) -> Result<()> {
        handler::iterate(&self.rep, handler, begin, end)
    }

    /// Rejects records no memtable would accept: inverted delete ranges,
    /// delete ranges when `supports_range_deletion` is false and merges
    /// without a merge operator.
    pub fn check_arguments(&self, supports_range_deletion: bool, has_merge_operator: bool) -> Result<()> {
        let needs_merge_operator = self.has_merge() && !has_merge_operator;
        if !self.has_delete_range() && !needs_merge_operator {
            return Ok(());
        }
        if self.rep.len() < HEADER_SIZE {
            return Err(Error::Corruption("malformed WriteBatch (too small)".into()));
        }

        let mut input = &self.rep[HEADER_SIZE..];
        while !input.is_empty() {
            match read_record(&mut input)? {
                Record::DeleteRange { cf, begin, end } => {
                    if !supports_range_deletion {
                        return Err(Error::NotSupported(format!(
                            "DeleteRange not supported for table type in CF {}",
                            cf
                        )));
                    }
                    if begin > end {
                        return Err(Error::InvalidArgument("end key comes before start key".into()));
                    }
                }
                Record::Merge { .. } if !has_merge_operator => {
                    return Err(Error::InvalidArgument(
                        "Merge requires a configured merge operator".into(),
                    ));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Verifies the per-record checksums of a protected batch.
    pub fn verify_checksum(&self) -> Result<()> {
        match &self.protection {
            Some(info) => protection::verify(&self.rep[HEADER_SIZE..], info),
            None => Ok(()),
        }
    }

    // ===== Internal helpers =====

    /// Appends the records of `src` to `self`. With `wal_only` only the part
    /// of `src` before its WAL termination point is copied.
    pub(crate) fn append(&mut self, src: &WriteBatch, wal_only: bool) -> Result<()> {
        let (len, count, flags) = match src.wal_term_point {
            Some(term) if wal_only => (term.size - HEADER_SIZE, term.count, term.content_flags),
            _ => (src.rep.len() - HEADER_SIZE, src.count(), src.content_flags()),
        };

        self.set_count(self.count() + count);
        self.rep
            .extend_from_slice(&src.rep[HEADER_SIZE..HEADER_SIZE + len]);
        self.add_flags(flags);

        match (&mut self.protection, &src.protection) {
            (Some(dst), Some(info)) => dst.extend(info, count as usize),
            (Some(_), None) => self.protection = None,
            _ => {}
        }
        Ok(())
    }

    /// Replaces the records of `self` with an encoded buffer.
    pub(crate) fn set_contents(&mut self, contents: &[u8]) -> Result<()> {
        if contents.len() < HEADER_SIZE {
            return Err(Error::Corruption("malformed WriteBatch (too small)".into()));
        }
        self.rep.clear();
        self.rep.extend_from_slice(contents);
        self.content_flags.store(DEFERRED, Ordering::Relaxed);
        self.protection = None;
        Ok(())
    }
}

#[derive(Default)]
struct ContentClassifier {
    flags: u32,
}

impl ContentClassifier {
    fn set(&mut self, flag: u32) -> Result<()> {
        self.flags |= flag;
        Ok(())
    }
}

impl Handler for ContentClassifier {
    fn put_cf(&mut self, _cf: u32, _key: &[u8], _value: &[u8]) -> Result<()> {
        self.set(HAS_PUT)
    }

    fn delete_cf(&mut self, _cf: u32, _key: &[u8]) -> Result<()> {
        self.set(HAS_DELETE)
    }

    fn single_delete_cf(&mut self, _cf: u32, _key: &[u8]) -> Result<()> {
        self.set(HAS_SINGLE_DELETE)
    }

    fn delete_range_cf(&mut self, _cf: u32, _begin: &[u8], _end: &[u8]) -> Result<()> {
        self.set(HAS_DELETE_RANGE)
    }

    fn merge_cf(&mut self, _cf: u32, _key: &[u8], _value: &[u8]) -> Result<()> {
        self.set(HAS_MERGE)
    }

    fn put_blob_index_cf(&mut self, _cf: u32, _key: &[u8], _value: &[u8]) -> Result<()> {
        self.set(HAS_BLOB_INDEX)
    }

    fn mark_begin_prepare(&mut self, unprepared: bool) -> Result<()> {
        let flag = if unprepared {
            HAS_BEGIN_UNPREPARE
        } else {
            HAS_BEGIN_PREPARE
        };
        self.set(flag)
    }

    fn mark_end_prepare(&mut self, _xid: &[u8]) -> Result<()> {
        self.set(HAS_END_PREPARE)
    }

    fn mark_noop(&mut self, _empty_batch: bool) -> Result<()> {
        Ok(())
    }

    fn mark_commit(&mut self, _xid: &[u8]) -> Result<()> {
        self.set(HAS_COMMIT)
    }

    fn mark_rollback(&mut self, _xid: &[u8]) -> Result<()> {
        self.set(HAS_ROLLBACK)
    }
}
