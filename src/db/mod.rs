//! The database handle.
//!
//! A [`Db`] owns the WAL directory of one database: it replays the WAL on
//! open, runs concurrent writes through group commit and hands sealed
//! memtables to the configured flush sink in the background.

pub mod flush;
mod recovery;
mod state;
mod switch;
mod tasks;
mod wal_cleanup;
mod write;

use std::fs;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::MutexGuard;

use crate::batch::WriteBatch;
use crate::config::{DbConfig, WriteMode, WriteOptions};
use crate::error::{Error, Result};
use crate::flock::DirLock;
use crate::inserter::RecoveredTransaction;
use crate::memtable::{finish_merge, Lookup};
use crate::scheduler::Scheduler;
use crate::write_buffer_manager::WriteBufferManager;
use crate::write_controller::WriteController;
use crate::write_thread::Writer;

pub use flush::{DiscardSink, FlushSink, FlushedTable, MemorySink};
pub use write::WriteOutcome;

use state::{DbInner, DbState};
use tasks::FlushTask;
use wal_cleanup::WalCleanupTask;

/// An open database.
pub struct Db {
    inner: Arc<DbInner>,
    scheduler: Scheduler,
    _lock: DirLock,
}

impl Db {
    /// Opens the database in `config.dir`, replaying whatever the WAL holds.
    pub fn open(config: DbConfig) -> Result<Self> {
        validate_config(&config)?;

        if !config.dir.exists() {
            if !config.create_if_missing {
                return Err(Error::InvalidArgument(format!(
                    "{:?} does not exist (create_if_missing is false)",
                    config.dir
                )));
            }
            fs::create_dir_all(&config.dir)?;
        }
        let lock = DirLock::acquire(&config.dir)?;

        let write_buffer_manager = config.write_buffer_manager.clone().unwrap_or_else(|| {
            Arc::new(WriteBufferManager::new(
                config.db_write_buffer_size,
                config.allow_stall,
            ))
        });
        let recovered = recovery::recover(&config, &write_buffer_manager)?;
        let last_sequence = recovered.last_sequence;
        let inner = Arc::new(DbInner::new(
            config,
            write_buffer_manager,
            recovered.state,
            recovered.current,
            last_sequence,
            recovered.next_memtable_id,
        ));

        {
            let state = inner.state.lock();
            for trx in state.recovered.values() {
                inner.prep_tracker.mark_log_containing_prep(trx.log_number);
            }
            // Memtables that came back full are switched by the first write.
            for cfd in state.cfs.iter() {
                if cfd.mem().should_flush() && cfd.mem().mark_flush_scheduled() {
                    inner.flush_scheduler.schedule_work(cfd.id());
                }
            }
        }
        inner.purge_obsolete_wals();

        let scheduler = Scheduler::new();
        scheduler
            .register(Arc::new(FlushTask::new(inner.clone())))?
            .register(Arc::new(WalCleanupTask::new(inner.clone())))?;

        tracing::info!(
            dir = ?inner.config.dir,
            last_sequence,
            write_mode = ?inner.config.write_mode,
            "Database opened"
        );
        Ok(Self {
            inner,
            scheduler,
            _lock: lock,
        })
    }

    // ===== Single-record writes =====

    pub fn put(&self, opts: &WriteOptions, key: &[u8], value: &[u8]) -> Result<()> {
        self.put_cf(opts, 0, key, value)
    }

    pub fn put_cf(&self, opts: &WriteOptions, cf: u32, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put_cf(cf, key, value)?;
        self.write(opts, batch)
    }

    pub fn delete(&self, opts: &WriteOptions, key: &[u8]) -> Result<()> {
        self.delete_cf(opts, 0, key)
    }

    pub fn delete_cf(&self, opts: &WriteOptions, cf: u32, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete_cf(cf, key)?;
        self.write(opts, batch)
    }

    pub fn single_delete(&self, opts: &WriteOptions, key: &[u8]) -> Result<()> {
        self.single_delete_cf(opts, 0, key)
    }

    pub fn single_delete_cf(&self, opts: &WriteOptions, cf: u32, key: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.single_delete_cf(cf, key)?;
        self.write(opts, batch)
    }

    /// Deletes every key in `[begin, end)`.
    pub fn delete_range(&self, opts: &WriteOptions, begin: &[u8], end: &[u8]) -> Result<()> {
        self.delete_range_cf(opts, 0, begin, end)
    }

    pub fn delete_range_cf(&self, opts: &WriteOptions, cf: u32, begin: &[u8], end: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete_range_cf(cf, begin, end)?;
        self.write(opts, batch)
    }

    pub fn merge(&self, opts: &WriteOptions, key: &[u8], operand: &[u8]) -> Result<()> {
        self.merge_cf(opts, 0, key, operand)
    }

    pub fn merge_cf(&self, opts: &WriteOptions, cf: u32, key: &[u8], operand: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.merge_cf(cf, key, operand)?;
        self.write(opts, batch)
    }

    // ===== Reads =====

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get_cf(0, key)
    }

    /// Newest published value of `key` in the unflushed memtables of `cf`.
    pub fn get_cf(&self, cf: u32, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let snapshot = self.inner.last_sequence();
        let tables = {
            let state = self.inner.state.lock();
            let cfd = state
                .cfs
                .get(cf)
                .ok_or_else(|| Error::InvalidArgument(format!("Invalid column family: {}", cf)))?;
            let mut tables = vec![cfd.mem().clone()];
            tables.extend(cfd.imm().iter_newest_first().cloned());
            tables
        };

        let merge_operator = self.inner.config.merge_operator.as_deref();
        let mut operands = Vec::new();
        for table in &tables {
            match table.get(key, snapshot, &mut operands, merge_operator)? {
                Lookup::Found(value) => return Ok(Some(value)),
                Lookup::Deleted => return Ok(None),
                Lookup::NotFound => {}
            }
        }
        finish_merge(key, &mut operands, merge_operator)
    }

    /// Last sequence visible to readers.
    pub fn latest_sequence(&self) -> u64 {
        self.inner.last_sequence()
    }

    pub fn write_controller(&self) -> &WriteController {
        &self.inner.write_controller
    }

    pub fn write_buffer_manager(&self) -> &Arc<WriteBufferManager> {
        &self.inner.write_buffer_manager
    }

    /// The error that stopped writes, if any.
    pub fn background_error(&self) -> Option<Error> {
        self.inner.bg_error()
    }

    // ===== Column families =====

    pub fn column_family_id(&self, name: &str) -> Option<u32> {
        self.inner.state.lock().cfs.id_of(name)
    }

    pub fn create_column_family(&self, name: &str) -> Result<u32> {
        let id = self.with_exclusive_writes(|inner, state| {
            let mem = inner.new_memtable(state.logfile_number);
            let id = state.cfs.create(name, mem)?;
            inner.install_memtables(state);
            Ok(id)
        })?;
        tracing::info!(cf = name, cf_id = id, "Created column family");
        Ok(id)
    }

    /// Drops a column family and everything it holds in memory. Later
    /// batches see it as missing.
    pub fn drop_column_family(&self, cf: u32) -> Result<()> {
        let dropped = self.with_exclusive_writes(|inner, state| {
            let dropped = state.cfs.drop_family(cf)?;
            inner.install_memtables(state);
            inner.recalculate_write_stall(state);
            Ok(dropped)
        })?;
        tracing::info!(cf = dropped.name(), cf_id = cf, "Dropped column family");
        drop(dropped);
        self.inner.purge_obsolete_wals();
        Ok(())
    }

    // ===== WAL and flush =====

    /// fsyncs every WAL segment written so far.
    pub fn sync_wal(&self) -> Result<()> {
        self.inner.sync_wal()
    }

    /// Writes out records held back by `manual_wal_flush`; with `sync` they
    /// are fsynced too.
    pub fn flush_wal(&self, sync: bool) -> Result<()> {
        self.inner.flush_wal(sync)
    }

    /// Seals every non-empty memtable, flushes all sealed memtables to the
    /// sink and deletes the WAL segments that are no longer needed.
    pub fn flush(&self) -> Result<()> {
        self.with_exclusive_writes(|inner, state| {
            if let Some(e) = &state.bg_error {
                return Err(e.clone());
            }
            inner.wait_for_pending_writes(state);
            switch_non_empty(inner, state)
        })?;
        self.inner.flush_immutable_memtables()?;
        self.inner.purge_obsolete_wals();
        Ok(())
    }

    /// Clears the background error and continues on a fresh WAL segment.
    ///
    /// The memtables are sealed and flushed to the sink first, so no later
    /// replay depends on the old tail, which may end in a partial record.
    pub fn resume(&self) -> Result<()> {
        let result = self.with_exclusive_writes(|inner, state| {
            let Some(previous) = state.bg_error.clone() else {
                return Ok(false);
            };
            tracing::info!(error = %previous, "Resuming from background error");
            inner.wait_for_pending_writes(state);
            inner.roll_log(state)?;
            // Writers may continue once the tail is a fresh segment.
            state.bg_error = None;
            switch_non_empty(inner, state)?;
            Ok(true)
        });
        let result = result.and_then(|resumed| {
            if resumed {
                self.inner.flush_immutable_memtables()?;
            }
            Ok(resumed)
        });

        match result {
            Ok(false) => Ok(()),
            Ok(true) => {
                self.inner.purge_obsolete_wals();
                tracing::info!("Resumed writes");
                Ok(())
            }
            Err(e) => {
                let mut state = self.inner.state.lock();
                self.inner.set_bg_error(&mut state, e.clone());
                Err(e)
            }
        }
    }

    // ===== Two-phase commit =====

    /// Prepared transactions found in the WAL without a commit or rollback.
    pub fn recovered_transactions(&self) -> Vec<RecoveredTransaction> {
        let state = self.inner.state.lock();
        let mut transactions: Vec<_> = state.recovered.values().cloned().collect();
        transactions.sort_by(|a, b| a.log_number.cmp(&b.log_number).then_with(|| a.name.cmp(&b.name)));
        transactions
    }

    /// Forgets a recovered transaction so its WAL segment can be purged.
    pub fn delete_recovered_transaction(&self, name: &[u8]) -> Option<RecoveredTransaction> {
        let trx = self.inner.state.lock().recovered.remove(name)?;
        self.inner
            .prep_tracker
            .mark_prep_section_completed(trx.log_number);
        tracing::debug!(log_number = trx.log_number, "Deleted recovered transaction");
        Some(trx)
    }

    // ===== Shutdown =====

    /// Stops background work and writes out buffered WAL records.
    pub fn close(self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&self) -> Result<()> {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.scheduler.shutdown();
        self.inner.bg_cv.notify_all();
        let result = self.inner.log_write.lock().writer.lock().flush();
        tracing::info!(
            dir = ?self.inner.config.dir,
            last_sequence = self.inner.last_sequence(),
            "Database closed"
        );
        result
    }

    /// Runs `f` with both write queues to itself and the mutex held.
    fn with_exclusive_writes<T>(
        &self,
        f: impl FnOnce(&DbInner, &mut MutexGuard<'_, DbState>) -> Result<T>,
    ) -> Result<T> {
        let inner = &*self.inner;
        let w = Arc::new(Writer::unbatched());
        inner.write_thread.enter_unbatched(&w);
        let nonmem = inner
            .config
            .two_write_queues
            .then(|| Arc::new(Writer::unbatched()));
        if let Some(nw) = &nonmem {
            inner.nonmem_write_thread.enter_unbatched(nw);
        }

        let mut state = inner.state.lock();
        let result = f(inner, &mut state);
        inner.unlock_and_free_logs(state);

        if let Some(nw) = &nonmem {
            inner.nonmem_write_thread.exit_unbatched(nw);
        }
        inner.write_thread.exit_unbatched(&w);
        result
    }

    #[cfg(test)]
    pub(crate) fn fail_wal_appends(&self, fail: bool) {
        self.inner.log_write.lock().writer.lock().fail_appends = fail;
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "Failed to flush WAL on close");
        }
    }
}

fn switch_non_empty(inner: &DbInner, state: &mut MutexGuard<'_, DbState>) -> Result<()> {
    let cf_ids: Vec<u32> = state
        .cfs
        .iter()
        .filter(|cfd| !cfd.mem().is_empty())
        .map(|cfd| cfd.id())
        .collect();
    for cf_id in cf_ids {
        inner.switch_memtable(state, cf_id)?;
    }
    Ok(())
}

fn validate_config(config: &DbConfig) -> Result<()> {
    if config.inplace_update_support && config.allow_concurrent_memtable_write {
        return Err(Error::InvalidArgument(
            "In-place memtable updates (inplace_update_support) is not compatible with \
             concurrent writes (allow_concurrent_memtable_write)"
                .into(),
        ));
    }
    if config.write_mode == WriteMode::Unordered && !config.allow_concurrent_memtable_write {
        return Err(Error::InvalidArgument(
            "unordered_write is incompatible with !allow_concurrent_memtable_write".into(),
        ));
    }
    if config.write_mode == WriteMode::Pipelined && (config.two_write_queues || config.seq_per_batch) {
        return Err(Error::NotSupported(
            "pipelined_writes is not compatible with concurrent prepares or seq_per_batch".into(),
        ));
    }
    if config.column_families.iter().any(|name| name.is_empty()) {
        return Err(Error::InvalidArgument("empty column family name".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::PrepareKind;
    use crate::merge::StringAppendOperator;
    use crate::wal::{list_log_numbers, log_file_path, LogReader, WalRecoveryMode};
    use crate::write_thread::{PreReleaseCallback, WriteCallback, WriteRequest};
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &Path) -> DbConfig {
        DbConfig::new(dir).flush_interval(Duration::from_millis(20))
    }

    /// Only explicit `flush` calls reach the sink.
    fn manual_flush_config(dir: &Path) -> DbConfig {
        DbConfig::new(dir).flush_interval(Duration::from_secs(3600))
    }

    fn open(dir: &Path) -> Db {
        Db::open(config(dir)).expect("Failed to open database")
    }

    /// First sequence and entry count of every record in the WAL, oldest
    /// segment first.
    fn wal_records(dir: &Path) -> Vec<(u64, u32)> {
        let mut records = Vec::new();
        for number in list_log_numbers(dir).expect("Failed to list segments") {
            let reader = LogReader::open(&log_file_path(dir, number), WalRecoveryMode::AbsoluteConsistency)
                .expect("Failed to open segment");
            for record in reader {
                let batch = WriteBatch::from_data(record.expect("Failed to read record"));
                records.push((batch.sequence(), batch.count()));
            }
        }
        records
    }

    #[test]
    fn test_batch_applies_in_order() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = open(temp_dir.path());

        let mut batch = WriteBatch::new();
        batch.put(b"k", b"v1")?;
        batch.delete(b"k")?;
        batch.put(b"k", b"v2")?;
        let outcome = db.write_request(&WriteOptions::default(), WriteRequest::new(batch))?;

        assert_eq!(outcome.sequence, 1);
        assert_eq!(outcome.log_used, 1);
        assert_eq!(db.latest_sequence(), 3);
        assert_eq!(db.get(b"k")?, Some(b"v2".to_vec()));
        Ok(())
    }

    #[test]
    fn test_single_record_operations() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = open(temp_dir.path());
        let opts = WriteOptions::default();

        db.put(&opts, b"a", b"1")?;
        db.put(&opts, b"b", b"2")?;
        db.put(&opts, b"c", b"3")?;
        db.delete(&opts, b"a")?;
        db.single_delete(&opts, b"b")?;
        assert_eq!(db.get(b"a")?, None);
        assert_eq!(db.get(b"b")?, None);

        db.delete_range(&opts, b"c", b"d")?;
        assert_eq!(db.get(b"c")?, None);
        assert_eq!(db.latest_sequence(), 6);
        Ok(())
    }

    #[test]
    fn test_delete_range_bounds() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = open(temp_dir.path());
        let opts = WriteOptions::default();
        db.put(&opts, b"a", b"1")?;

        // An empty range is accepted and removes nothing.
        db.delete_range(&opts, b"a", b"a")?;
        assert_eq!(db.get(b"a")?, Some(b"1".to_vec()));

        let result = db.delete_range(&opts, b"b", b"a");
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert!(db.background_error().is_none());

        // Nothing of a batch with an inverted range is applied or logged.
        let mut batch = WriteBatch::new();
        batch.put(b"x", b"1")?;
        batch.delete_range(b"b", b"a")?;
        assert!(matches!(db.write(&opts, batch), Err(Error::InvalidArgument(_))));
        assert_eq!(db.get(b"x")?, None);
        assert_eq!(db.latest_sequence(), 2);
        assert_eq!(wal_records(temp_dir.path()).len(), 2);

        db.put(&opts, b"after", b"ok")?;
        drop(db);

        let db = open(temp_dir.path());
        assert_eq!(db.get(b"a")?, Some(b"1".to_vec()));
        assert_eq!(db.get(b"after")?, Some(b"ok".to_vec()));
        assert_eq!(db.get(b"x")?, None);
        Ok(())
    }

    #[test]
    fn test_merge_without_operator_rejected_before_wal() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = open(temp_dir.path());
        let opts = WriteOptions::default();

        let mut batch = WriteBatch::new();
        batch.put(b"k", b"v")?;
        batch.merge(b"k", b"more")?;
        assert!(matches!(db.write(&opts, batch), Err(Error::InvalidArgument(_))));
        assert_eq!(db.get(b"k")?, None);
        assert_eq!(db.latest_sequence(), 0);
        assert!(wal_records(temp_dir.path()).is_empty());
        Ok(())
    }

    #[test]
    fn test_concurrent_sync_writes_get_consecutive_sequences() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = Arc::new(open(temp_dir.path()));
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|i| {
                let db = db.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let key = format!("key{}", i);
                    barrier.wait();
                    db.put(&WriteOptions::new().sync(true), key.as_bytes(), b"value")
                        .expect("Failed to write");
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("Writer panicked");
        }

        // The two writes may or may not share a record.
        let mut sequences: Vec<u64> = wal_records(temp_dir.path())
            .into_iter()
            .flat_map(|(first, count)| first..first + u64::from(count))
            .collect();
        sequences.sort_unstable();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[test]
    fn test_no_slowdown_fails_while_stopped() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = open(temp_dir.path());

        let token = db.write_controller().get_stop_token();
        let result = db.put(&WriteOptions::new().no_slowdown(true), b"k", b"v");
        assert!(matches!(result, Err(Error::Incomplete(_))));
        assert_eq!(db.get(b"k")?, None);

        drop(token);
        db.put(&WriteOptions::new().no_slowdown(true), b"k", b"v")?;
        assert_eq!(db.get(b"k")?, Some(b"v".to_vec()));
        Ok(())
    }

    #[test]
    fn test_stopped_writer_resumes_when_stop_lifts() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = Arc::new(open(temp_dir.path()));

        let token = db.write_controller().get_stop_token();
        let writer = {
            let db = db.clone();
            thread::spawn(move || db.put(&WriteOptions::default(), b"k", b"v"))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(db.get(b"k")?, None);

        drop(token);
        writer.join().expect("Writer panicked")?;
        assert_eq!(db.get(b"k")?, Some(b"v".to_vec()));
        Ok(())
    }

    fn assert_contiguous_sequences(config: DbConfig) {
        const THREADS: usize = 8;
        const WRITES: usize = 50;

        let db = Arc::new(Db::open(config).expect("Failed to open database"));
        let barrier = Arc::new(Barrier::new(THREADS));
        let sequences = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let db = db.clone();
                let barrier = barrier.clone();
                let sequences = sequences.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..WRITES {
                        let mut batch = WriteBatch::new();
                        batch
                            .put(format!("t{}-{}", t, i).as_bytes(), b"value")
                            .expect("Failed to build batch");
                        let outcome = db
                            .write_request(&WriteOptions::default(), WriteRequest::new(batch))
                            .expect("Failed to write");
                        sequences.lock().push(outcome.sequence);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("Writer panicked");
        }

        let mut sequences = sequences.lock().clone();
        sequences.sort_unstable();
        let expected: Vec<u64> = (1..=(THREADS * WRITES) as u64).collect();
        assert_eq!(sequences, expected);
        assert_eq!(db.latest_sequence(), (THREADS * WRITES) as u64);
        for t in 0..THREADS {
            let key = format!("t{}-{}", t, WRITES - 1);
            assert_eq!(
                db.get(key.as_bytes()).expect("Failed to read"),
                Some(b"value".to_vec())
            );
        }
    }

    #[test]
    fn test_group_commit_sequences_are_contiguous() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        assert_contiguous_sequences(config(temp_dir.path()));
    }

    #[test]
    fn test_serial_memtable_writes_sequences_are_contiguous() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        assert_contiguous_sequences(config(temp_dir.path()).allow_concurrent_memtable_write(false));
    }

    #[test]
    fn test_pipelined_sequences_are_contiguous() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        assert_contiguous_sequences(config(temp_dir.path()).write_mode(WriteMode::Pipelined));
    }

    #[test]
    fn test_unordered_sequences_are_contiguous() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        assert_contiguous_sequences(config(temp_dir.path()).write_mode(WriteMode::Unordered));
    }

    #[test]
    fn test_two_write_queues_sequences_are_contiguous() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        assert_contiguous_sequences(config(temp_dir.path()).two_write_queues(true));
    }

    #[test]
    fn test_wal_failure_applies_nothing() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let sink = Arc::new(MemorySink::new());
        let opts = WriteOptions::default();
        {
            let db = Db::open(manual_flush_config(temp_dir.path()).flush_sink(sink.clone()))?;
            db.put(&opts, b"before", b"1")?;

            db.fail_wal_appends(true);
            let mut batch = WriteBatch::new();
            batch.put(b"x", b"1")?;
            batch.put(b"y", b"2")?;
            let result = db.write(&opts, batch);
            assert!(matches!(result, Err(Error::Io(_))));
            assert_eq!(db.get(b"x")?, None);
            assert_eq!(db.get(b"y")?, None);
            assert_eq!(db.latest_sequence(), 1);

            // The database refuses writes until resumed.
            db.fail_wal_appends(false);
            assert!(db.background_error().is_some());
            assert!(matches!(db.put(&opts, b"z", b"3"), Err(Error::Io(_))));

            db.resume()?;
            assert!(db.background_error().is_none());
            // Resuming hands everything written before the failure to the sink.
            let flushed: Vec<Vec<u8>> = sink
                .tables()
                .into_iter()
                .flat_map(|t| t.entries.into_iter().map(|(k, _)| k.user_key))
                .collect();
            assert_eq!(flushed, vec![b"before".to_vec()]);

            db.put(&opts, b"z", b"3")?;
            assert_eq!(db.get(b"z")?, Some(b"3".to_vec()));
        }

        // Writes after the resume land in a fresh segment and survive a reopen.
        let db = open(temp_dir.path());
        assert_eq!(db.get(b"z")?, Some(b"3".to_vec()));
        assert_eq!(db.latest_sequence(), 2);
        Ok(())
    }

    #[test]
    fn test_resume_without_error_is_noop() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = open(temp_dir.path());
        db.put(&WriteOptions::default(), b"k", b"v")?;

        db.resume()?;
        assert_eq!(db.inner.state.lock().logfile_number, 1);
        assert_eq!(db.get(b"k")?, Some(b"v".to_vec()));
        Ok(())
    }

    #[test]
    fn test_wal_failure_fails_whole_group() -> Result<()> {
        const FOLLOWERS: usize = 6;

        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = Arc::new(open(temp_dir.path()));
        db.put(&WriteOptions::default(), b"before", b"1")?;

        // Hold the queue so every writer lines up behind one leader.
        let blocker = Arc::new(Writer::unbatched());
        db.inner.write_thread.enter_unbatched(&blocker);

        let handles: Vec<_> = (0..FOLLOWERS)
            .map(|i| {
                let db = db.clone();
                thread::spawn(move || {
                    let key = format!("member{}", i);
                    db.put(&WriteOptions::default(), key.as_bytes(), b"value")
                })
            })
            .collect();
        while db.inner.write_thread.queue_len() < FOLLOWERS + 1 {
            thread::sleep(Duration::from_millis(1));
        }

        db.fail_wal_appends(true);
        db.inner.write_thread.exit_unbatched(&blocker);

        for handle in handles {
            let result = handle.join().expect("Writer panicked");
            assert!(matches!(result, Err(Error::Io(_))), "unexpected result {:?}", result);
        }
        for i in 0..FOLLOWERS {
            assert_eq!(db.get(format!("member{}", i).as_bytes())?, None);
        }
        assert_eq!(db.latest_sequence(), 1);
        assert!(db.background_error().is_some());
        Ok(())
    }

    #[test]
    fn test_reopen_recovers_writes() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        {
            let db = open(temp_dir.path());
            let opts = WriteOptions::default();
            db.put(&opts, b"a", b"1")?;
            db.put(&opts, b"b", b"2")?;
            db.delete(&opts, b"a")?;
            db.close()?;
        }

        let db = open(temp_dir.path());
        assert_eq!(db.latest_sequence(), 3);
        assert_eq!(db.get(b"a")?, None);
        assert_eq!(db.get(b"b")?, Some(b"2".to_vec()));

        db.put(&WriteOptions::default(), b"c", b"3")?;
        assert_eq!(db.latest_sequence(), 4);
        Ok(())
    }

    #[test]
    fn test_replay_is_idempotent() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        {
            let db = open(temp_dir.path());
            let opts = WriteOptions::default();
            for i in 0..20u32 {
                db.put(&opts, format!("key{}", i % 7).as_bytes(), &i.to_be_bytes())?;
            }
        }

        let snapshot = |db: &Db| -> Vec<Option<Vec<u8>>> {
            (0..7)
                .map(|i| db.get(format!("key{}", i).as_bytes()).expect("Failed to read"))
                .collect()
        };
        let first = {
            let db = open(temp_dir.path());
            (snapshot(&db), db.latest_sequence())
        };
        let second = {
            let db = open(temp_dir.path());
            (snapshot(&db), db.latest_sequence())
        };
        assert_eq!(first, second);
        assert_eq!(first.1, 20);
        Ok(())
    }

    #[test]
    fn test_sequence_survives_flush_and_purge() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let sink = Arc::new(MemorySink::new());
        {
            let db = Db::open(manual_flush_config(temp_dir.path()).flush_sink(sink.clone()))?;
            let opts = WriteOptions::default();
            db.put(&opts, b"a", b"1")?;
            db.put(&opts, b"b", b"2")?;
            db.put(&opts, b"c", b"3")?;
            db.flush()?;

            assert_eq!(sink.len(), 1);
            assert_eq!(sink.tables()[0].entries.len(), 3);
            assert!(!log_file_path(temp_dir.path(), 1).exists());
        }

        let db = open(temp_dir.path());
        assert_eq!(db.latest_sequence(), 3);
        // Flushed data lives in the sink now.
        assert_eq!(db.get(b"a")?, None);
        db.put(&WriteOptions::default(), b"d", b"4")?;
        assert_eq!(db.latest_sequence(), 4);
        Ok(())
    }

    #[test]
    fn test_wal_size_limit_rotates_segments() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = Db::open(
            config(temp_dir.path())
                .max_total_wal_size(4 * 1024)
                .max_write_buffer_number(16),
        )?;
        let opts = WriteOptions::default();
        let value = vec![b'x'; 512];
        for i in 0..64u32 {
            db.put(&opts, &i.to_be_bytes(), &value)?;
        }

        let logfile_number = db.inner.state.lock().logfile_number;
        assert!(logfile_number > 1, "WAL never rotated");
        for i in 0..64u32 {
            assert_eq!(db.get(&i.to_be_bytes())?, Some(value.clone()));
        }
        Ok(())
    }

    #[test]
    fn test_full_memtable_is_switched_and_flushed() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let sink = Arc::new(MemorySink::new());
        let db = Db::open(
            manual_flush_config(temp_dir.path())
                .write_buffer_size(8 * 1024)
                .max_write_buffer_number(64)
                .flush_sink(sink.clone()),
        )?;
        let opts = WriteOptions::default();
        let value = vec![b'v'; 256];
        for i in 0..200u32 {
            db.put(&opts, &i.to_be_bytes(), &value)?;
        }
        db.flush()?;

        let flushed: usize = sink.tables().iter().map(|t| t.entries.len()).sum();
        assert_eq!(flushed, 200);
        assert!(sink.len() > 1);
        assert_eq!(db.inner.state.lock().cfs.num_immutable(), 0);
        Ok(())
    }

    struct Veto;

    impl WriteCallback for Veto {
        fn callback(&self, _db: &Db) -> Result<()> {
            Err(Error::Busy("conflict".into()))
        }

        fn allow_write_batching(&self) -> bool {
            true
        }
    }

    #[test]
    fn test_callback_veto_discards_write() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = open(temp_dir.path());
        db.put(&WriteOptions::default(), b"a", b"1")?;

        let mut batch = WriteBatch::new();
        batch.put(b"vetoed", b"value")?;
        let result = db.write_request(&WriteOptions::default(), WriteRequest::new(batch).callback(Veto));
        assert!(matches!(result, Err(Error::Busy(_))));
        assert_eq!(db.get(b"vetoed")?, None);
        assert_eq!(db.latest_sequence(), 1);
        assert!(db.background_error().is_none());
        assert_eq!(wal_records(temp_dir.path()).len(), 1);
        Ok(())
    }

    struct RecordSequence(Arc<Mutex<Vec<(u64, u64)>>>);

    impl PreReleaseCallback for RecordSequence {
        fn callback(
            &self,
            sequence: u64,
            _disable_memtable: bool,
            log_number: u64,
            _index: usize,
            _total: usize,
        ) -> Result<()> {
            self.0.lock().push((sequence, log_number));
            Ok(())
        }
    }

    #[test]
    fn test_pre_release_callback_sees_assigned_sequence() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = open(temp_dir.path());
        db.put(&WriteOptions::default(), b"a", b"1")?;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut batch = WriteBatch::new();
        batch.put(b"b", b"2")?;
        let outcome = db.write_request(
            &WriteOptions::default(),
            WriteRequest::new(batch).pre_release_callback(RecordSequence(seen.clone())),
        )?;

        assert_eq!(outcome.sequence, 2);
        assert_eq!(*seen.lock(), vec![(2, outcome.log_used)]);
        Ok(())
    }

    #[test]
    fn test_wal_only_write_on_second_queue() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = Db::open(config(temp_dir.path()).two_write_queues(true))?;
        db.put(&WriteOptions::default(), b"a", b"1")?;

        let mut batch = WriteBatch::new();
        batch.put(b"wal_only", b"value")?;
        let outcome = db.write_request(
            &WriteOptions::default(),
            WriteRequest::new(batch).disable_memtable(true),
        )?;

        assert_ne!(outcome.log_used, 0);
        assert_eq!(db.get(b"wal_only")?, None);
        assert_eq!(wal_records(temp_dir.path()).len(), 2);

        db.put(&WriteOptions::default(), b"b", b"2")?;
        assert_eq!(db.get(b"b")?, Some(b"2".to_vec()));
        Ok(())
    }

    #[test]
    fn test_sync_with_disabled_wal_rejected() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = open(temp_dir.path());
        let result = db.put(&WriteOptions::new().sync(true).disable_wal(true), b"k", b"v");
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_disabled_wal_write_is_visible_but_not_logged() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = open(temp_dir.path());
        db.put(&WriteOptions::new().disable_wal(true), b"k", b"v")?;
        assert_eq!(db.get(b"k")?, Some(b"v".to_vec()));
        assert_eq!(db.latest_sequence(), 1);
        assert!(wal_records(temp_dir.path()).is_empty());
        Ok(())
    }

    #[test]
    fn test_column_family_lifecycle() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = Db::open(config(temp_dir.path()).column_family("users"))?;
        let opts = WriteOptions::default();
        assert_eq!(db.column_family_id("users"), Some(1));

        let orders = db.create_column_family("orders")?;
        assert_eq!(orders, 2);
        assert!(db.create_column_family("orders").is_err());

        db.put_cf(&opts, orders, b"k", b"v")?;
        assert_eq!(db.get_cf(orders, b"k")?, Some(b"v".to_vec()));
        assert_eq!(db.get(b"k")?, None);

        db.drop_column_family(orders)?;
        assert_eq!(db.column_family_id("orders"), None);
        let result = db.put_cf(&opts, orders, b"k", b"v2");
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        db.put_cf(&WriteOptions::new().ignore_missing_column_families(true), orders, b"k", b"v2")?;
        assert!(matches!(db.drop_column_family(0), Err(Error::InvalidArgument(_))));
        Ok(())
    }

    #[test]
    fn test_merge_operands_fold_on_read() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = Db::open(config(temp_dir.path()).merge_operator(Arc::new(StringAppendOperator::new(b','))))?;
        let opts = WriteOptions::default();

        db.merge(&opts, b"list", b"a")?;
        db.merge(&opts, b"list", b"b")?;
        assert_eq!(db.get(b"list")?, Some(b"a,b".to_vec()));

        db.put(&opts, b"list", b"base")?;
        db.merge(&opts, b"list", b"c")?;
        assert_eq!(db.get(b"list")?, Some(b"base,c".to_vec()));
        Ok(())
    }

    #[test]
    fn test_low_priority_write_throttled() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = open(temp_dir.path());
        let low_pri = WriteOptions::new().low_priority(true).no_slowdown(true);

        db.put(&low_pri, b"a", b"1")?;

        let _pressure = db.write_controller().get_compaction_pressure_token();
        let result = db.put(&low_pri, b"b", b"2");
        assert!(matches!(result, Err(Error::Incomplete(_))));

        // Commits are never throttled.
        let mut commit = WriteBatch::new();
        commit.mark_commit(b"xid");
        db.write(&low_pri, commit)?;

        db.put(&WriteOptions::new().no_slowdown(true), b"c", b"3")?;
        Ok(())
    }

    #[test]
    fn test_manual_wal_flush() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = Db::open(config(temp_dir.path()).manual_wal_flush(true))?;
        let path = log_file_path(temp_dir.path(), 1);
        let empty_len = fs::metadata(&path)?.len();

        db.put(&WriteOptions::default(), b"k", b"v")?;
        assert_eq!(fs::metadata(&path)?.len(), empty_len);

        db.flush_wal(false)?;
        assert!(fs::metadata(&path)?.len() > empty_len);
        db.flush_wal(true)?;
        Ok(())
    }

    #[test]
    fn test_prepared_transaction_recovered_after_reopen() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        {
            let db = open(temp_dir.path());
            let mut prepared = WriteBatch::new();
            prepared.insert_noop();
            prepared.put(b"tx_key", b"tx_value")?;
            prepared.mark_end_prepare(b"xid", PrepareKind::Committed)?;
            db.write_request(
                &WriteOptions::new().sync(true),
                WriteRequest::new(prepared).disable_memtable(true),
            )?;
        }

        let db = open(temp_dir.path());
        let transactions = db.recovered_transactions();
        assert_eq!(transactions.len(), 1);
        assert_eq!(transactions[0].name, b"xid".to_vec());
        assert_eq!(transactions[0].log_number, 1);
        // The segment holding the prepared section stays around.
        assert!(log_file_path(temp_dir.path(), 1).exists());

        let trx = db.delete_recovered_transaction(b"xid");
        assert!(trx.is_some());
        assert!(db.recovered_transactions().is_empty());
        assert!(db.delete_recovered_transaction(b"xid").is_none());
        Ok(())
    }

    #[test]
    fn test_open_fails_while_locked() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let _db = open(temp_dir.path());
        let result = Db::open(config(temp_dir.path()));
        assert!(matches!(result, Err(Error::Busy(_))));
    }

    #[test]
    fn test_open_rejects_incompatible_options() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");

        let result = Db::open(
            config(temp_dir.path())
                .write_mode(WriteMode::Pipelined)
                .two_write_queues(true),
        );
        assert!(matches!(result, Err(Error::NotSupported(_))));

        let result = Db::open(config(temp_dir.path()).inplace_update_support(true));
        assert!(matches!(result, Err(Error::InvalidArgument(_))));

        let result = Db::open(
            config(temp_dir.path())
                .write_mode(WriteMode::Unordered)
                .allow_concurrent_memtable_write(false),
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_open_missing_dir_without_create() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let missing = temp_dir.path().join("missing");
        let result = Db::open(config(&missing).create_if_missing(false));
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert!(!missing.exists());
    }

    #[test]
    fn test_writes_after_close_are_rejected() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db = open(temp_dir.path());
        db.shutdown()?;
        let result = db.put(&WriteOptions::default(), b"k", b"v");
        assert!(matches!(result, Err(Error::ShutdownInProgress)));
        Ok(())
    }

    #[test]
    fn test_distinct_keys_survive_concurrent_flushes() -> Result<()> {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let sink = Arc::new(MemorySink::new());
        let db = Arc::new(Db::open(
            manual_flush_config(temp_dir.path())
                .write_buffer_size(4 * 1024)
                .max_write_buffer_number(64)
                .flush_sink(sink.clone()),
        )?);

        let handles: Vec<_> = (0..4)
            .map(|t| {
                let db = db.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        db.put(&WriteOptions::default(), format!("{}-{}", t, i).as_bytes(), &[b'x'; 128])
                            .expect("Failed to write");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("Writer panicked");
        }
        db.flush()?;

        let keys: HashSet<Vec<u8>> = sink
            .tables()
            .into_iter()
            .flat_map(|t| t.entries.into_iter().map(|(k, _)| k.user_key))
            .collect();
        assert_eq!(keys.len(), 400);
        Ok(())
    }
}
