//! In-memory write buffer built on a concurrent skip list.
//!
//! Entries are keyed by [`InternalKey`]: user key ascending, then newest
//! sequence first. Point entries and range tombstones live in separate
//! skip lists so a lookup can find the covering tombstones without scanning
//! the point data.
//!
//! # Lifecycle
//!
//! 1. **Mutable**: the single memtable of a column family that accepts writes.
//! 2. **Sealed**: frozen by a memtable switch, queued in the [`MemtableList`].
//! 3. **Flushed**: handed to the flush sink and dropped, which releases its
//!    memory from the [`WriteBufferManager`].
//!
//! Each memtable records the WAL segment that was active when it was created.
//! Once it is flushed, segments older than that number are no longer needed
//! by its column family.

pub mod key;
pub mod list;

use std::collections::HashMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::error::{Error, Result};
use crate::merge::MergeOperator;
use crate::write_buffer_manager::WriteBufferManager;

pub use key::{InternalKey, ValueKind};
pub use list::MemtableList;

/// Per-entry bookkeeping overhead charged on top of key and value bytes.
const ENTRY_OVERHEAD: usize = 32;

/// Counters accumulated by a concurrent inserter and applied once per batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PostProcessInfo {
    pub data_size: u64,
    pub num_entries: u64,
    pub num_deletes: u64,
}

/// Per-memtable counters for one concurrent batch, created on first use.
pub type PostProcessMap = HashMap<u64, (Arc<Memtable>, PostProcessInfo)>;

/// Result of a point lookup in one memtable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(Vec<u8>),
    Deleted,
    /// Nothing conclusive here; older data (and any collected merge
    /// operands) must be consulted.
    NotFound,
}

/// A sealed or mutable write buffer for one column family.
#[derive(Debug)]
pub struct Memtable {
    id: u64,
    table: SkipMap<InternalKey, Vec<u8>>,
    /// Begin key and sequence of each tombstone, mapped to its end key.
    range_tombstones: SkipMap<InternalKey, Vec<u8>>,
    log_number: u64,
    next_log_number: AtomicU64,
    first_seq: AtomicU64,
    num_entries: AtomicU64,
    num_deletes: AtomicU64,
    data_size: AtomicU64,
    memory_usage: AtomicUsize,
    write_buffer_size: usize,
    frozen: AtomicBool,
    flush_scheduled: AtomicBool,
    /// Oldest WAL segment holding a prepared section whose commit landed
    /// here. Zero when none.
    min_prep_log: AtomicU64,
    write_buffer_manager: Option<Arc<WriteBufferManager>>,
}

impl Memtable {
    pub fn new(
        id: u64,
        log_number: u64,
        write_buffer_size: usize,
        write_buffer_manager: Option<Arc<WriteBufferManager>>,
    ) -> Self {
        Self {
            id,
            table: SkipMap::new(),
            range_tombstones: SkipMap::new(),
            log_number,
            next_log_number: AtomicU64::new(0),
            first_seq: AtomicU64::new(u64::MAX),
            num_entries: AtomicU64::new(0),
            num_deletes: AtomicU64::new(0),
            data_size: AtomicU64::new(0),
            memory_usage: AtomicUsize::new(0),
            write_buffer_size,
            frozen: AtomicBool::new(false),
            flush_scheduled: AtomicBool::new(false),
            min_prep_log: AtomicU64::new(0),
            write_buffer_manager,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// WAL segment that was active when this memtable was created.
    pub fn log_number(&self) -> u64 {
        self.log_number
    }

    /// WAL segment opened when this memtable was sealed; zero while mutable.
    pub fn next_log_number(&self) -> u64 {
        self.next_log_number.load(Ordering::Acquire)
    }

    pub fn set_next_log_number(&self, number: u64) {
        self.next_log_number.store(number, Ordering::Release);
    }

    /// Inserts one entry.
    ///
    /// Fails with `TryAgain` when the user key already has an entry at
    /// `sequence`; the caller is expected to retry at the next sequence.
    /// When `post` is given, entry counters accumulate there instead of in
    /// the shared atomics.
    pub fn add(
        &self,
        sequence: u64,
        kind: ValueKind,
        key: &[u8],
        value: &[u8],
        post: Option<&mut PostProcessInfo>,
    ) -> Result<()> {
        if self.contains_sequence(key, sequence) {
            return Err(Error::TryAgain("key+seq exists".into()));
        }

        let internal_key = InternalKey::new(key, sequence, kind);
        if kind == ValueKind::RangeDeletion {
            self.range_tombstones.insert(internal_key.clone(), value.to_vec());
        }
        self.table.insert(internal_key, value.to_vec());

        let encoded_len = (key.len() + value.len() + 8) as u64;
        let is_delete = kind.is_deletion();
        match post {
            Some(info) => {
                info.data_size += encoded_len;
                info.num_entries += 1;
                if is_delete {
                    info.num_deletes += 1;
                }
            }
            None => {
                self.data_size.fetch_add(encoded_len, Ordering::Relaxed);
                self.num_entries.fetch_add(1, Ordering::Relaxed);
                if is_delete {
                    self.num_deletes.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        self.first_seq.fetch_min(sequence, Ordering::AcqRel);
        self.charge(key.len() + value.len() + ENTRY_OVERHEAD);
        Ok(())
    }

    /// Overwrites the newest value of `key` in place when it is a plain value
    /// at least as large as `value`; otherwise adds a new entry.
    pub fn update(&self, sequence: u64, key: &[u8], value: &[u8]) -> Result<()> {
        let seek = InternalKey::seek_key(key, u64::MAX);
        if let Some(entry) = self.table.lower_bound(Bound::Included(&seek)) {
            let existing = entry.key();
            if existing.user_key == key
                && existing.kind == ValueKind::Value
                && entry.value().len() >= value.len()
            {
                self.table.insert(existing.clone(), value.to_vec());
                return Ok(());
            }
        }
        self.add(sequence, ValueKind::Value, key, value, None)
    }

    fn contains_sequence(&self, key: &[u8], sequence: u64) -> bool {
        let seek = InternalKey::seek_key(key, sequence);
        self.table
            .lower_bound(Bound::Included(&seek))
            .map(|entry| entry.key().user_key == key && entry.key().sequence == sequence)
            .unwrap_or(false)
    }

    fn charge(&self, bytes: usize) {
        self.memory_usage.fetch_add(bytes, Ordering::Relaxed);
        if let Some(wbm) = &self.write_buffer_manager {
            wbm.reserve_mem(bytes);
        }
    }

    /// Folds counters gathered by a concurrent inserter into this memtable.
    pub fn batch_post_process(&self, info: &PostProcessInfo) {
        self.data_size.fetch_add(info.data_size, Ordering::Relaxed);
        self.num_entries.fetch_add(info.num_entries, Ordering::Relaxed);
        self.num_deletes.fetch_add(info.num_deletes, Ordering::Relaxed);
    }

    /// Resolves `key` as of `snapshot`.
    ///
    /// Merge operands found before a base value are pushed onto `operands`,
    /// newest first, and folded once a value, a deletion or the end of the
    /// key's history is reached.
    pub fn get(
        &self,
        key: &[u8],
        snapshot: u64,
        operands: &mut Vec<Vec<u8>>,
        merge_operator: Option<&dyn MergeOperator>,
    ) -> Result<Lookup> {
        let tombstone_seq = self.max_covering_tombstone(key, snapshot);

        let seek = InternalKey::seek_key(key, snapshot);
        for entry in self.table.range(seek..) {
            let ikey = entry.key();
            if ikey.user_key != key {
                break;
            }
            if ikey.sequence < tombstone_seq {
                return fold(key, None, operands, merge_operator).map(deleted_or_found);
            }
            match ikey.kind {
                ValueKind::Value | ValueKind::BlobIndex => {
                    return fold(key, Some(entry.value()), operands, merge_operator)
                        .map(|value| Lookup::Found(value.unwrap_or_default()));
                }
                ValueKind::Deletion | ValueKind::SingleDeletion => {
                    return fold(key, None, operands, merge_operator).map(deleted_or_found);
                }
                ValueKind::Merge => operands.push(entry.value().clone()),
                // Tombstones are resolved through `range_tombstones`.
                ValueKind::RangeDeletion => {}
            }
        }

        if tombstone_seq > 0 {
            return fold(key, None, operands, merge_operator).map(deleted_or_found);
        }
        Ok(Lookup::NotFound)
    }

    /// Newest sequence, visible at `snapshot`, of a range tombstone covering `key`.
    fn max_covering_tombstone(&self, key: &[u8], snapshot: u64) -> u64 {
        self.range_tombstones
            .iter()
            .take_while(|entry| entry.key().user_key.as_slice() <= key)
            .filter(|entry| {
                entry.key().sequence <= snapshot && key < entry.value().as_slice()
            })
            .map(|entry| entry.key().sequence)
            .max()
            .unwrap_or(0)
    }

    /// Snapshot of every point entry and tombstone, in key order.
    pub fn entries(&self) -> Vec<(InternalKey, Vec<u8>)> {
        self.table
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn freeze(&self) {
        if !self.frozen.swap(true, Ordering::AcqRel) {
            if let Some(wbm) = &self.write_buffer_manager {
                wbm.schedule_free_mem(self.approximate_memory_usage());
            }
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Smallest sequence inserted so far.
    pub fn first_sequence(&self) -> Option<u64> {
        match self.first_seq.load(Ordering::Acquire) {
            u64::MAX => None,
            seq => Some(seq),
        }
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries.load(Ordering::Relaxed)
    }

    pub fn num_deletes(&self) -> u64 {
        self.num_deletes.load(Ordering::Relaxed)
    }

    pub fn data_size(&self) -> u64 {
        self.data_size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn approximate_memory_usage(&self) -> usize {
        self.memory_usage.load(Ordering::Relaxed)
    }

    pub fn should_flush(&self) -> bool {
        self.approximate_memory_usage() >= self.write_buffer_size
    }

    /// Returns true for exactly one caller once the memtable is full.
    pub fn mark_flush_scheduled(&self) -> bool {
        !self.flush_scheduled.swap(true, Ordering::AcqRel)
    }

    /// Keeps WAL segment `log` alive until this memtable is flushed.
    pub fn ref_log_containing_prep(&self, log: u64) {
        let _ = self
            .min_prep_log
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current == 0 || log < current).then_some(log)
            });
    }

    /// Zero when no prepared section is referenced.
    pub fn min_log_containing_prep(&self) -> u64 {
        self.min_prep_log.load(Ordering::Acquire)
    }
}

impl Drop for Memtable {
    fn drop(&mut self) {
        if let Some(wbm) = &self.write_buffer_manager {
            let usage = self.approximate_memory_usage();
            if !self.is_frozen() {
                wbm.schedule_free_mem(usage);
            }
            wbm.free_mem(usage);
        }
    }
}

fn deleted_or_found(value: Option<Vec<u8>>) -> Lookup {
    match value {
        Some(value) => Lookup::Found(value),
        None => Lookup::Deleted,
    }
}

/// Applies pending merge operands (newest first) on top of `base`.
fn fold(
    key: &[u8],
    base: Option<&Vec<u8>>,
    operands: &mut Vec<Vec<u8>>,
    merge_operator: Option<&dyn MergeOperator>,
) -> Result<Option<Vec<u8>>> {
    if operands.is_empty() {
        return Ok(base.cloned());
    }
    let op = merge_operator
        .ok_or_else(|| Error::InvalidArgument("merge operator not configured".into()))?;
    let ordered: Vec<&[u8]> = operands.iter().rev().map(Vec::as_slice).collect();
    let merged = op.full_merge(key, base.map(Vec::as_slice), &ordered)?;
    operands.clear();
    Ok(Some(merged))
}

/// Folds operands that outlived every memtable into a value with no base.
pub fn finish_merge(
    key: &[u8],
    operands: &mut Vec<Vec<u8>>,
    merge_operator: Option<&dyn MergeOperator>,
) -> Result<Option<Vec<u8>>> {
    fold(key, None, operands, merge_operator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::StringAppendOperator;

    fn memtable() -> Memtable {
        Memtable::new(1, 1, 1 << 20, None)
    }

    fn lookup(mem: &Memtable, key: &[u8], snapshot: u64) -> Lookup {
        let mut operands = Vec::new();
        mem.get(key, snapshot, &mut operands, None)
            .expect("Lookup failed")
    }

    #[test]
    fn test_newest_visible_version_wins() -> Result<()> {
        let mem = memtable();
        mem.add(1, ValueKind::Value, b"k", b"v1", None)?;
        mem.add(2, ValueKind::Deletion, b"k", b"", None)?;
        mem.add(3, ValueKind::Value, b"k", b"v2", None)?;

        assert_eq!(lookup(&mem, b"k", 3), Lookup::Found(b"v2".to_vec()));
        assert_eq!(lookup(&mem, b"k", 2), Lookup::Deleted);
        assert_eq!(lookup(&mem, b"k", 1), Lookup::Found(b"v1".to_vec()));
        assert_eq!(lookup(&mem, b"other", 3), Lookup::NotFound);

        assert_eq!(mem.num_entries(), 3);
        assert_eq!(mem.num_deletes(), 1);
        assert_eq!(mem.first_sequence(), Some(1));
        Ok(())
    }

    #[test]
    fn test_duplicate_key_and_sequence() -> Result<()> {
        let mem = memtable();
        mem.add(5, ValueKind::Value, b"k", b"a", None)?;
        let err = mem
            .add(5, ValueKind::Merge, b"k", b"b", None)
            .expect_err("Duplicate must be rejected");
        assert!(err.is_try_again());
        mem.add(6, ValueKind::Value, b"k", b"b", None)?;
        Ok(())
    }

    #[test]
    fn test_range_tombstone_hides_older_entries() -> Result<()> {
        let mem = memtable();
        mem.add(1, ValueKind::Value, b"b", b"old", None)?;
        mem.add(2, ValueKind::RangeDeletion, b"a", b"c", None)?;
        mem.add(3, ValueKind::Value, b"b", b"new", None)?;

        assert_eq!(lookup(&mem, b"b", 1), Lookup::Found(b"old".to_vec()));
        assert_eq!(lookup(&mem, b"b", 2), Lookup::Deleted);
        assert_eq!(lookup(&mem, b"b", 3), Lookup::Found(b"new".to_vec()));
        // End key is exclusive.
        assert_eq!(lookup(&mem, b"c", 3), Lookup::NotFound);
        Ok(())
    }

    #[test]
    fn test_merge_operands_fold_onto_base() -> Result<()> {
        let mem = memtable();
        let op = StringAppendOperator::new(b',');
        mem.add(1, ValueKind::Value, b"k", b"a", None)?;
        mem.add(2, ValueKind::Merge, b"k", b"b", None)?;
        mem.add(3, ValueKind::Merge, b"k", b"c", None)?;

        let mut operands = Vec::new();
        assert_eq!(
            mem.get(b"k", 3, &mut operands, Some(&op))?,
            Lookup::Found(b"a,b,c".to_vec())
        );

        // Without a base the operands are left for older data.
        let mem = memtable();
        mem.add(4, ValueKind::Merge, b"k", b"x", None)?;
        let mut operands = Vec::new();
        assert_eq!(mem.get(b"k", 4, &mut operands, Some(&op))?, Lookup::NotFound);
        assert_eq!(operands, vec![b"x".to_vec()]);
        assert_eq!(finish_merge(b"k", &mut operands, Some(&op))?, Some(b"x".to_vec()));
        Ok(())
    }

    #[test]
    fn test_in_place_update() -> Result<()> {
        let mem = memtable();
        mem.update(1, b"k", b"longer")?;
        mem.update(2, b"k", b"short")?;
        assert_eq!(mem.num_entries(), 1);
        assert_eq!(lookup(&mem, b"k", 10), Lookup::Found(b"short".to_vec()));

        // A larger value no longer fits and becomes a new version.
        mem.update(3, b"k", b"much longer value")?;
        assert_eq!(mem.num_entries(), 2);
        assert_eq!(lookup(&mem, b"k", 10), Lookup::Found(b"much longer value".to_vec()));
        Ok(())
    }

    #[test]
    fn test_post_process_defers_counters() -> Result<()> {
        let mem = memtable();
        let mut info = PostProcessInfo::default();
        mem.add(1, ValueKind::Value, b"a", b"1", Some(&mut info))?;
        mem.add(2, ValueKind::Deletion, b"b", b"", Some(&mut info))?;
        assert_eq!(mem.num_entries(), 0);

        mem.batch_post_process(&info);
        assert_eq!(mem.num_entries(), 2);
        assert_eq!(mem.num_deletes(), 1);
        Ok(())
    }

    #[test]
    fn test_memory_accounting_with_write_buffer_manager() -> Result<()> {
        let wbm = Arc::new(WriteBufferManager::new(1 << 20, false));
        let mem = Memtable::new(1, 1, 32, Some(wbm.clone()));
        assert!(!mem.should_flush());
        mem.add(1, ValueKind::Value, b"key", b"value", None)?;
        assert!(mem.should_flush());
        let used = wbm.memory_usage();
        assert!(used > 0);
        assert_eq!(wbm.mutable_memtable_memory_usage(), used);

        mem.freeze();
        assert_eq!(wbm.mutable_memtable_memory_usage(), 0);
        drop(mem);
        assert_eq!(wbm.memory_usage(), 0);
        Ok(())
    }

    #[test]
    fn test_prep_log_reference_keeps_minimum() {
        let mem = memtable();
        assert_eq!(mem.min_log_containing_prep(), 0);
        mem.ref_log_containing_prep(9);
        mem.ref_log_containing_prep(4);
        mem.ref_log_containing_prep(7);
        assert_eq!(mem.min_log_containing_prep(), 4);
    }

    #[test]
    fn test_flush_scheduled_once() {
        let mem = memtable();
        assert!(mem.mark_flush_scheduled());
        assert!(!mem.mark_flush_scheduled());
    }
}
