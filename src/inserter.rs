//! Applies write batches to memtables.
//!
//! [`MemtableInserter`] is a batch [`Handler`] that resolves each record's
//! column family, assigns it a sequence number and inserts it into that
//! family's mutable memtable. During WAL replay it also rebuilds prepared
//! but undecided two-phase-commit transactions.
//!
//! Sequence numbers advance once per key, or, with `seq_per_batch`, once per
//! sub-batch. Sub-batches end at end-prepare, commit, rollback and non-empty
//! noop markers, and wherever a key repeats within the current sub-batch.

use std::collections::{HashMap, HashSet};

use crate::batch::{Handler, WriteBatch};
use crate::column_family::{CfMemtable, ColumnFamilyMemtables};
use crate::error::{Error, Result};
use crate::flush_scheduler::FlushScheduler;
use crate::memtable::{Memtable, PostProcessInfo, PostProcessMap, ValueKind};
use crate::merge::MergeOperator;

/// A prepared transaction found in the WAL without a matching commit or
/// rollback.
#[derive(Debug, Clone)]
pub struct RecoveredTransaction {
    pub name: Vec<u8>,
    /// WAL segment holding the prepared section.
    pub log_number: u64,
    pub batch: WriteBatch,
    /// Sequence the prepared section started at.
    pub sequence: u64,
    /// Sequences the section consumed; zero when unknown.
    pub batch_cnt: u64,
    pub unprepared: bool,
}

pub type RecoveredTransactions = HashMap<Vec<u8>, RecoveredTransaction>;

#[derive(Debug, Clone, Copy)]
pub struct InsertOptions {
    pub ignore_missing_column_families: bool,
    /// WAL segment being replayed; zero outside recovery.
    pub recovering_log_number: u64,
    pub concurrent_memtable_writes: bool,
    pub seq_per_batch: bool,
    pub inplace_update_support: bool,
    pub supports_range_deletion: bool,
}

impl Default for InsertOptions {
    fn default() -> Self {
        Self {
            ignore_missing_column_families: false,
            recovering_log_number: 0,
            concurrent_memtable_writes: false,
            seq_per_batch: false,
            inplace_update_support: false,
            supports_range_deletion: true,
        }
    }
}

/// Keys seen in the current sub-batch, by column family.
#[derive(Debug, Default)]
struct DuplicateDetector {
    batch_seq: u64,
    keys: HashSet<(u32, Vec<u8>)>,
}

impl DuplicateDetector {
    fn is_duplicate_key_seq(&mut self, cf: u32, key: &[u8], sequence: u64) -> bool {
        if self.batch_seq != sequence {
            self.keys.clear();
        }
        self.batch_seq = sequence;
        if self.keys.insert((cf, key.to_vec())) {
            return false;
        }
        self.keys.clear();
        self.keys.insert((cf, key.to_vec()));
        true
    }
}

pub struct MemtableInserter<'a> {
    sequence: u64,
    memtables: &'a ColumnFamilyMemtables,
    opts: InsertOptions,
    merge_operator: Option<&'a dyn MergeOperator>,
    flush_scheduler: Option<&'a FlushScheduler>,
    recovered: Option<&'a mut RecoveredTransactions>,
    /// WAL segment every touched memtable must keep alive.
    log_number_ref: u64,
    post_process: Option<PostProcessMap>,
    rebuilding_trx: Option<WriteBatch>,
    rebuilding_trx_seq: u64,
    unprepared_batch: bool,
    duplicate_detector: Option<DuplicateDetector>,
    /// Records inserted since the last sequence advance under `seq_per_batch`.
    open_sub_batch: bool,
    has_valid_writes: bool,
}

impl<'a> MemtableInserter<'a> {
    pub fn new(sequence: u64, memtables: &'a ColumnFamilyMemtables, opts: InsertOptions) -> Self {
        Self {
            sequence,
            memtables,
            opts,
            merge_operator: None,
            flush_scheduler: None,
            recovered: None,
            log_number_ref: 0,
            post_process: None,
            rebuilding_trx: None,
            rebuilding_trx_seq: 0,
            unprepared_batch: false,
            duplicate_detector: None,
            open_sub_batch: false,
            has_valid_writes: false,
        }
    }

    pub fn with_merge_operator(mut self, op: Option<&'a dyn MergeOperator>) -> Self {
        self.merge_operator = op;
        self
    }

    pub fn with_flush_scheduler(mut self, scheduler: &'a FlushScheduler) -> Self {
        self.flush_scheduler = Some(scheduler);
        self
    }

    /// Collects prepared sections into `recovered` during replay.
    pub fn with_recovered_transactions(mut self, recovered: &'a mut RecoveredTransactions) -> Self {
        self.recovered = Some(recovered);
        self
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
        self.open_sub_batch = false;
    }

    pub fn set_log_number_ref(&mut self, log: u64) {
        self.log_number_ref = log;
    }

    /// True once any record reached a live column family.
    pub fn has_valid_writes(&self) -> bool {
        self.has_valid_writes
    }

    /// Write-committed transactions apply their data at commit time.
    fn writes_after_commit(&self) -> bool {
        !self.opts.seq_per_batch
    }

    /// Advances per key, or per sub-batch when `batch_boundary` is set and
    /// sequences are assigned per batch.
    pub fn maybe_advance_seq(&mut self, batch_boundary: bool) {
        if batch_boundary == self.opts.seq_per_batch {
            self.sequence += 1;
            self.open_sub_batch = false;
        } else if self.opts.seq_per_batch {
            self.open_sub_batch = true;
        }
    }

    /// Closes a trailing sub-batch that no marker terminated, so the next
    /// batch starts at a fresh sequence.
    pub fn finish_batch(&mut self, start: u64) {
        if self.opts.seq_per_batch && (self.open_sub_batch || self.sequence == start) {
            self.maybe_advance_seq(true);
        }
    }

    /// Folds counters gathered in concurrent mode into their memtables.
    pub fn post_process(&mut self) {
        if let Some(map) = self.post_process.take() {
            for (mem, info) in map.values() {
                mem.batch_post_process(info);
            }
        }
    }

    /// Applies `batch` starting at the inserter's current sequence.
    pub fn insert(&mut self, batch: &WriteBatch) -> Result<()> {
        batch.iterate(self)
    }

    fn seek_to_column_family(&mut self, cf: u32) -> Result<Option<&'a CfMemtable>> {
        let memtables = self.memtables;
        let Some(cfm) = memtables.get(cf) else {
            if self.opts.ignore_missing_column_families {
                return Ok(None);
            }
            return Err(Error::InvalidArgument(
                "Invalid column family specified in write batch".into(),
            ));
        };
        let recovering = self.opts.recovering_log_number;
        if recovering != 0 && recovering < cfm.log_number {
            // The family already holds everything from this segment.
            return Ok(None);
        }
        self.has_valid_writes = true;
        if self.log_number_ref > 0 {
            cfm.mem.ref_log_containing_prep(self.log_number_ref);
        }
        Ok(Some(cfm))
    }

    fn post_info(&mut self, mem: &std::sync::Arc<Memtable>) -> Option<&mut PostProcessInfo> {
        if !self.opts.concurrent_memtable_writes {
            return None;
        }
        let map = self.post_process.get_or_insert_with(HashMap::new);
        let slot = map
            .entry(mem.id())
            .or_insert_with(|| (mem.clone(), PostProcessInfo::default()));
        Some(&mut slot.1)
    }

    fn check_memtable_full(&self, cfm: &CfMemtable) {
        if let Some(scheduler) = self.flush_scheduler {
            if cfm.mem.should_flush() && cfm.mem.mark_flush_scheduled() {
                scheduler.schedule_work(cfm.id);
            }
        }
    }

    fn record_in_trx(&mut self, kind: ValueKind, cf: u32, key: &[u8], value: &[u8]) -> Result<()> {
        let Some(trx) = self.rebuilding_trx.as_mut() else {
            return Ok(());
        };
        match kind {
            ValueKind::Value => trx.put_cf(cf, key, value),
            ValueKind::Deletion => trx.delete_cf(cf, key),
            ValueKind::SingleDeletion => trx.single_delete_cf(cf, key),
            ValueKind::RangeDeletion => trx.delete_range_cf(cf, key, value),
            ValueKind::Merge => trx.merge_cf(cf, key, value),
            ValueKind::BlobIndex => trx.put_blob_index_cf(cf, key, value),
        }
    }

    /// Handles a record whose column family is skipped.
    fn skip_record(&mut self, kind: ValueKind, cf: u32, key: &[u8], value: &[u8]) -> Result<()> {
        if self.rebuilding_trx.is_some() {
            // Keep tracking the keys so a later commit or rollback sees them.
            self.record_in_trx(kind, cf, key, value)?;
            let sequence = self.sequence;
            let duplicate = self
                .duplicate_detector
                .get_or_insert_with(DuplicateDetector::default)
                .is_duplicate_key_seq(cf, key, sequence);
            self.maybe_advance_seq(duplicate);
        } else {
            self.maybe_advance_seq(false);
        }
        Ok(())
    }

    fn apply(&mut self, kind: ValueKind, cf: u32, key: &[u8], value: &[u8]) -> Result<()> {
        if self.writes_after_commit() && self.rebuilding_trx.is_some() {
            return self.record_in_trx(kind, cf, key, value);
        }

        let Some(cfm) = self.seek_to_column_family(cf)? else {
            return self.skip_record(kind, cf, key, value);
        };

        match kind {
            ValueKind::RangeDeletion => {
                if !self.opts.supports_range_deletion {
                    return Err(Error::NotSupported(format!(
                        "DeleteRange not supported for table type in CF {}",
                        cf
                    )));
                }
                match key.cmp(value) {
                    std::cmp::Ordering::Greater => {
                        return Err(Error::InvalidArgument(
                            "end key comes before start key".into(),
                        ))
                    }
                    // Empty range.
                    std::cmp::Ordering::Equal => return Ok(()),
                    std::cmp::Ordering::Less => {}
                }
            }
            ValueKind::Merge if self.merge_operator.is_none() => {
                return Err(Error::InvalidArgument(
                    "Merge requires a configured merge operator".into(),
                ));
            }
            _ => {}
        }

        let sequence = self.sequence;
        let result = if kind == ValueKind::Value
            && self.opts.inplace_update_support
            && !self.opts.concurrent_memtable_writes
        {
            cfm.mem.update(sequence, key, value)
        } else {
            let post = self.post_info(&cfm.mem);
            cfm.mem.add(sequence, kind, key, value, post)
        };

        match result {
            Err(Error::TryAgain(msg)) => {
                // Duplicate key within the sub-batch: start a new one.
                self.maybe_advance_seq(true);
                Err(Error::TryAgain(msg))
            }
            Err(e) => Err(e),
            Ok(()) => {
                self.maybe_advance_seq(false);
                self.check_memtable_full(cfm);
                if !self.writes_after_commit() {
                    self.record_in_trx(kind, cf, key, value)?;
                }
                Ok(())
            }
        }
    }
}

impl Handler for MemtableInserter<'_> {
    fn put_cf(&mut self, cf: u32, key: &[u8], value: &[u8]) -> Result<()> {
        self.apply(ValueKind::Value, cf, key, value)
    }

    fn delete_cf(&mut self, cf: u32, key: &[u8]) -> Result<()> {
        self.apply(ValueKind::Deletion, cf, key, &[])
    }

    fn single_delete_cf(&mut self, cf: u32, key: &[u8]) -> Result<()> {
        self.apply(ValueKind::SingleDeletion, cf, key, &[])
    }

    fn delete_range_cf(&mut self, cf: u32, begin: &[u8], end: &[u8]) -> Result<()> {
        self.apply(ValueKind::RangeDeletion, cf, begin, end)
    }

    fn merge_cf(&mut self, cf: u32, key: &[u8], value: &[u8]) -> Result<()> {
        self.apply(ValueKind::Merge, cf, key, value)
    }

    fn put_blob_index_cf(&mut self, cf: u32, key: &[u8], value: &[u8]) -> Result<()> {
        self.apply(ValueKind::BlobIndex, cf, key, value)
    }

    fn mark_begin_prepare(&mut self, unprepared: bool) -> Result<()> {
        if self.opts.recovering_log_number != 0 {
            if self.rebuilding_trx.is_some() {
                return Err(Error::Corruption(
                    "nested prepare section in WAL".into(),
                ));
            }
            self.rebuilding_trx = Some(WriteBatch::new());
            self.rebuilding_trx_seq = self.sequence;
            self.unprepared_batch = unprepared;
            self.has_valid_writes = true;
        }
        Ok(())
    }

    fn mark_end_prepare(&mut self, xid: &[u8]) -> Result<()> {
        let recovering = self.opts.recovering_log_number;
        if recovering != 0 {
            let batch = self.rebuilding_trx.take().ok_or_else(|| {
                Error::Corruption("end prepare marker without begin".into())
            })?;
            let batch_cnt = if self.writes_after_commit() {
                0
            } else {
                self.sequence - self.rebuilding_trx_seq + 1
            };
            let unprepared = std::mem::take(&mut self.unprepared_batch);
            if let Some(recovered) = self.recovered.as_deref_mut() {
                insert_recovered_transaction(
                    recovered,
                    RecoveredTransaction {
                        name: xid.to_vec(),
                        log_number: recovering,
                        batch,
                        sequence: self.rebuilding_trx_seq,
                        batch_cnt,
                        unprepared,
                    },
                )?;
            }
        }
        self.maybe_advance_seq(true);
        Ok(())
    }

    fn mark_noop(&mut self, empty_batch: bool) -> Result<()> {
        // A leading noop carries no sub-batch of its own.
        if !empty_batch {
            self.maybe_advance_seq(true);
        }
        Ok(())
    }

    fn mark_commit(&mut self, xid: &[u8]) -> Result<()> {
        let mut result = Ok(());
        if self.opts.recovering_log_number != 0 {
            let trx = self
                .recovered
                .as_deref_mut()
                .and_then(|recovered| recovered.remove(xid));
            // A missing transaction was flushed and released earlier.
            if let Some(trx) = trx {
                if self.writes_after_commit() {
                    self.log_number_ref = trx.log_number;
                    result = trx.batch.iterate(self);
                    self.log_number_ref = 0;
                }
                if result.is_err() {
                    if let Some(recovered) = self.recovered.as_deref_mut() {
                        recovered.insert(trx.name.clone(), trx);
                    }
                }
                self.has_valid_writes = true;
            }
        }
        self.maybe_advance_seq(true);
        result
    }

    fn mark_rollback(&mut self, xid: &[u8]) -> Result<()> {
        if self.opts.recovering_log_number != 0 {
            if let Some(recovered) = self.recovered.as_deref_mut() {
                recovered.remove(xid);
            }
        }
        self.maybe_advance_seq(true);
        Ok(())
    }

    fn write_after_commit(&self) -> bool {
        self.writes_after_commit()
    }
}

/// Unprepared transactions may be logged in several sections; they are
/// concatenated under one name.
fn insert_recovered_transaction(
    recovered: &mut RecoveredTransactions,
    trx: RecoveredTransaction,
) -> Result<()> {
    match recovered.get_mut(&trx.name) {
        Some(existing) if trx.unprepared => {
            existing.batch.append(&trx.batch, false)?;
            existing.batch_cnt += trx.batch_cnt;
            existing.log_number = existing.log_number.min(trx.log_number);
        }
        _ => {
            recovered.insert(trx.name.clone(), trx);
        }
    }
    Ok(())
}

/// Counts the sequences a batch consumes when sequences are assigned per
/// sub-batch.
#[derive(Debug, Default)]
struct SubBatchCounter {
    batches: u64,
    open: bool,
    keys: HashSet<(u32, Vec<u8>)>,
}

impl SubBatchCounter {
    fn add_key(&mut self, cf: u32, key: &[u8]) -> Result<()> {
        if !self.keys.insert((cf, key.to_vec())) {
            self.batches += 1;
            self.keys.clear();
            self.keys.insert((cf, key.to_vec()));
        }
        self.open = true;
        Ok(())
    }

    fn boundary(&mut self) -> Result<()> {
        self.batches += 1;
        self.keys.clear();
        self.open = false;
        Ok(())
    }
}

impl Handler for SubBatchCounter {
    fn put_cf(&mut self, cf: u32, key: &[u8], _value: &[u8]) -> Result<()> {
        self.add_key(cf, key)
    }

    fn delete_cf(&mut self, cf: u32, key: &[u8]) -> Result<()> {
        self.add_key(cf, key)
    }

    fn single_delete_cf(&mut self, cf: u32, key: &[u8]) -> Result<()> {
        self.add_key(cf, key)
    }

    fn delete_range_cf(&mut self, cf: u32, begin: &[u8], _end: &[u8]) -> Result<()> {
        self.add_key(cf, begin)
    }

    fn merge_cf(&mut self, cf: u32, key: &[u8], _value: &[u8]) -> Result<()> {
        self.add_key(cf, key)
    }

    fn put_blob_index_cf(&mut self, cf: u32, key: &[u8], _value: &[u8]) -> Result<()> {
        self.add_key(cf, key)
    }

    fn mark_begin_prepare(&mut self, _unprepared: bool) -> Result<()> {
        Ok(())
    }

    fn mark_end_prepare(&mut self, _xid: &[u8]) -> Result<()> {
        self.boundary()
    }

    fn mark_noop(&mut self, empty_batch: bool) -> Result<()> {
        if empty_batch {
            return Ok(());
        }
        self.boundary()
    }

    fn mark_commit(&mut self, _xid: &[u8]) -> Result<()> {
        self.boundary()
    }

    fn mark_rollback(&mut self, _xid: &[u8]) -> Result<()> {
        self.boundary()
    }

    fn write_after_commit(&self) -> bool {
        false
    }
}

/// Sequences `batch` consumes under `seq_per_batch`: one per sub-batch,
/// and at least one.
pub fn sub_batch_count(batch: &WriteBatch) -> Result<u64> {
    let mut counter = SubBatchCounter::default();
    batch.iterate(&mut counter)?;
    let open = u64::from(counter.open || counter.batches == 0);
    Ok(counter.batches + open)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::PrepareKind;
    use crate::column_family::ColumnFamilySet;
    use crate::memtable::Lookup;
    use crate::merge::StringAppendOperator;
    use std::sync::Arc;

    fn families(names: &[&str]) -> ColumnFamilySet {
        let mut set = ColumnFamilySet::new(Arc::new(Memtable::new(0, 1, 1 << 20, None)));
        for (i, name) in names.iter().enumerate() {
            set.create(name, Arc::new(Memtable::new(i as u64 + 1, 1, 1 << 20, None)))
                .expect("Failed to create column family");
        }
        set
    }

    fn get(set: &ColumnFamilySet, cf: u32, key: &[u8]) -> Lookup {
        let mut operands = Vec::new();
        set.get(cf)
            .expect("column family")
            .mem()
            .get(key, u64::MAX, &mut operands, None)
            .expect("Lookup failed")
    }

    #[test]
    fn test_put_delete_put_leaves_latest_value() -> Result<()> {
        let set = families(&[]);
        let memtables = set.memtables();
        let mut batch = WriteBatch::new();
        batch.put(b"k", b"v1")?;
        batch.delete(b"k")?;
        batch.put(b"k", b"v2")?;

        let mut inserter = MemtableInserter::new(10, &memtables, InsertOptions::default());
        inserter.insert(&batch)?;
        assert_eq!(inserter.sequence(), 13);

        let mem = set.get(0).expect("default").mem();
        let mut operands = Vec::new();
        assert_eq!(mem.get(b"k", 12, &mut operands, None)?, Lookup::Found(b"v2".to_vec()));
        assert_eq!(mem.get(b"k", 11, &mut operands, None)?, Lookup::Deleted);
        let newest = mem.entries().into_iter().next().expect("entry");
        assert_eq!(newest.0.sequence, 12);
        Ok(())
    }

    #[test]
    fn test_delete_range_bounds() -> Result<()> {
        let set = families(&[]);
        let memtables = set.memtables();

        let mut empty = WriteBatch::new();
        empty.delete_range(b"a", b"a")?;
        MemtableInserter::new(1, &memtables, InsertOptions::default()).insert(&empty)?;
        assert!(set.get(0).expect("default").mem().is_empty());

        let mut inverted = WriteBatch::new();
        inverted.delete_range(b"b", b"a")?;
        let err = MemtableInserter::new(2, &memtables, InsertOptions::default())
            .insert(&inverted)
            .expect_err("Inverted range must fail");
        assert!(matches!(err, Error::InvalidArgument(_)));

        let opts = InsertOptions {
            supports_range_deletion: false,
            ..Default::default()
        };
        let mut range = WriteBatch::new();
        range.delete_range(b"a", b"z")?;
        let err = MemtableInserter::new(3, &memtables, opts)
            .insert(&range)
            .expect_err("Range deletion must be refused");
        assert!(matches!(err, Error::NotSupported(_)));
        Ok(())
    }

    #[test]
    fn test_missing_column_family() -> Result<()> {
        let set = families(&["users"]);
        let memtables = set.memtables();
        let mut batch = WriteBatch::new();
        batch.put_cf(7, b"k", b"v")?;
        batch.put_cf(1, b"k", b"v")?;

        let err = MemtableInserter::new(1, &memtables, InsertOptions::default())
            .insert(&batch)
            .expect_err("Unknown family must fail");
        assert!(matches!(err, Error::InvalidArgument(_)));

        let opts = InsertOptions {
            ignore_missing_column_families: true,
            ..Default::default()
        };
        let mut inserter = MemtableInserter::new(1, &memtables, opts);
        inserter.insert(&batch)?;
        // The skipped record still consumed its sequence.
        assert_eq!(inserter.sequence(), 3);
        assert_eq!(get(&set, 1, b"k"), Lookup::Found(b"v".to_vec()));
        Ok(())
    }

    #[test]
    fn test_merge_requires_operator() -> Result<()> {
        let set = families(&[]);
        let memtables = set.memtables();
        let mut batch = WriteBatch::new();
        batch.merge(b"k", b"x")?;

        let err = MemtableInserter::new(1, &memtables, InsertOptions::default())
            .insert(&batch)
            .expect_err("Merge without operator must fail");
        assert!(matches!(err, Error::InvalidArgument(_)));

        let op = StringAppendOperator::new(b',');
        MemtableInserter::new(1, &memtables, InsertOptions::default())
            .with_merge_operator(Some(&op))
            .insert(&batch)?;
        assert_eq!(set.get(0).expect("default").mem().num_entries(), 1);
        Ok(())
    }

    #[test]
    fn test_seq_per_batch_duplicate_key_takes_next_sequence() -> Result<()> {
        let set = families(&[]);
        let memtables = set.memtables();
        let opts = InsertOptions {
            seq_per_batch: true,
            ..Default::default()
        };
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1")?;
        batch.put(b"b", b"1")?;
        batch.put(b"a", b"2")?;
        assert_eq!(sub_batch_count(&batch)?, 2);

        let mut inserter = MemtableInserter::new(5, &memtables, opts);
        inserter.insert(&batch)?;
        inserter.finish_batch(5);
        assert_eq!(inserter.sequence(), 7);

        let entries = set.get(0).expect("default").mem().entries();
        let seqs: Vec<_> = entries
            .iter()
            .map(|(k, _)| (k.user_key.clone(), k.sequence))
            .collect();
        assert_eq!(
            seqs,
            vec![(b"a".to_vec(), 6), (b"a".to_vec(), 5), (b"b".to_vec(), 5)]
        );
        Ok(())
    }

    #[test]
    fn test_recovery_skips_families_newer_than_segment() -> Result<()> {
        let mut set = families(&[]);
        set.get_mut(0).expect("default").set_log_number(5);
        let memtables = set.memtables();
        let mut batch = WriteBatch::new();
        batch.put(b"k", b"v")?;

        let opts = InsertOptions {
            recovering_log_number: 3,
            ignore_missing_column_families: true,
            ..Default::default()
        };
        let mut inserter = MemtableInserter::new(1, &memtables, opts);
        inserter.insert(&batch)?;
        assert!(!inserter.has_valid_writes());
        assert!(set.get(0).expect("default").mem().is_empty());
        Ok(())
    }

    fn prepared(xid: &[u8], key: &[u8]) -> WriteBatch {
        let mut batch = WriteBatch::new();
        batch.insert_noop();
        batch.put(key, b"prepared").expect("Failed to put");
        batch
            .mark_end_prepare(xid, PrepareKind::Committed)
            .expect("Failed to mark end prepare");
        batch
    }

    #[test]
    fn test_recovery_rebuilds_prepared_transactions() -> Result<()> {
        let set = families(&[]);
        let memtables = set.memtables();
        let mut recovered = RecoveredTransactions::new();

        let opts = InsertOptions {
            recovering_log_number: 4,
            ..Default::default()
        };
        let mut inserter =
            MemtableInserter::new(1, &memtables, opts).with_recovered_transactions(&mut recovered);
        inserter.insert(&prepared(b"tx1", b"a"))?;
        inserter.insert(&prepared(b"tx2", b"b"))?;
        drop(inserter);

        // Prepared data stays out of the memtable.
        assert!(set.get(0).expect("default").mem().is_empty());
        assert_eq!(recovered.len(), 2);
        assert_eq!(recovered[b"tx1".as_slice()].log_number, 4);

        let mut decisions = WriteBatch::new();
        decisions.mark_commit(b"tx1");
        decisions.mark_rollback(b"tx2");
        let opts = InsertOptions {
            recovering_log_number: 5,
            ..Default::default()
        };
        let mut inserter =
            MemtableInserter::new(10, &memtables, opts).with_recovered_transactions(&mut recovered);
        inserter.insert(&decisions)?;
        drop(inserter);

        assert!(recovered.is_empty());
        assert_eq!(get(&set, 0, b"a"), Lookup::Found(b"prepared".to_vec()));
        assert_eq!(get(&set, 0, b"b"), Lookup::NotFound);
        // The committed data keeps the prepare segment alive.
        assert_eq!(
            set.get(0).expect("default").mem().min_log_containing_prep(),
            4
        );
        Ok(())
    }

    #[test]
    fn test_markers_outside_recovery_are_ignored() -> Result<()> {
        let set = families(&[]);
        let memtables = set.memtables();
        let mut inserter = MemtableInserter::new(1, &memtables, InsertOptions::default());
        inserter.insert(&prepared(b"tx", b"k"))?;
        assert_eq!(get(&set, 0, b"k"), Lookup::Found(b"prepared".to_vec()));
        Ok(())
    }

    #[test]
    fn test_concurrent_mode_defers_counters() -> Result<()> {
        let set = families(&[]);
        let memtables = set.memtables();
        let opts = InsertOptions {
            concurrent_memtable_writes: true,
            ..Default::default()
        };
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1")?;
        batch.delete(b"b")?;

        let mut inserter = MemtableInserter::new(1, &memtables, opts);
        inserter.insert(&batch)?;
        let mem = set.get(0).expect("default").mem();
        assert_eq!(mem.num_entries(), 0);
        inserter.post_process();
        assert_eq!(mem.num_entries(), 2);
        assert_eq!(mem.num_deletes(), 1);
        Ok(())
    }

    #[test]
    fn test_full_memtable_is_scheduled_once() -> Result<()> {
        let set = ColumnFamilySet::new(Arc::new(Memtable::new(0, 1, 16, None)));
        let memtables = set.memtables();
        let scheduler = FlushScheduler::new();
        let mut batch = WriteBatch::new();
        batch.put(b"a", b"1")?;
        batch.put(b"b", b"2")?;

        MemtableInserter::new(1, &memtables, InsertOptions::default())
            .with_flush_scheduler(&scheduler)
            .insert(&batch)?;
        assert_eq!(scheduler.take_next(), Some(0));
        assert_eq!(scheduler.take_next(), None);
        Ok(())
    }
}
