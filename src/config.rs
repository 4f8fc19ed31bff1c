use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::db::flush::{DiscardSink, FlushSink};
use crate::merge::MergeOperator;
use crate::wal::WalRecoveryMode;
use crate::write_buffer_manager::WriteBufferManager;

/// How the write pipeline orders WAL appends and memtable inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// One leader appends to the WAL and applies the whole group to the
    /// memtable before the next group starts.
    #[default]
    GroupCommit,
    /// WAL append and memtable insert run as two separately grouped phases.
    Pipelined,
    /// Sequences are assigned by a WAL-only round, memtable inserts happen
    /// afterwards outside of any group.
    Unordered,
}

/// Configuration for the engine
#[derive(Clone)]
pub struct DbConfig {
    /// Directory path for the database
    pub dir: PathBuf,

    /// Create the directory when it does not exist (default: true)
    pub create_if_missing: bool,

    /// Size at which the active memtable is sealed (default: 64MB)
    pub write_buffer_size: usize,

    /// Sealed plus active memtables allowed before writes stop (default: 2)
    pub max_write_buffer_number: usize,

    /// Memory budget shared by all memtables, 0 disables it (default: 0)
    pub db_write_buffer_size: usize,

    /// Explicit budget shared across engine instances, overrides `db_write_buffer_size`
    pub write_buffer_manager: Option<Arc<WriteBufferManager>>,

    /// Block writers while the shared budget is exceeded (default: false)
    pub allow_stall: bool,

    /// WAL bytes that force the oldest memtables out, 0 means 4x the
    /// in-memory budget (default: 0)
    pub max_total_wal_size: u64,

    /// WAL writer buffer size (default: 64KB)
    pub wal_buffer_size: usize,

    /// Leave WAL buffers in memory until `flush_wal` is called (default: false)
    pub manual_wal_flush: bool,

    /// What to do with corrupted WAL records on open
    pub wal_recovery_mode: WalRecoveryMode,

    /// Write scheduling policy
    pub write_mode: WriteMode,

    /// Route WAL-only writes through a second queue (default: false)
    pub two_write_queues: bool,

    /// Consume one sequence per sub-batch rather than per key (default: false)
    pub seq_per_batch: bool,

    /// Let group followers insert into the memtable in parallel (default: true)
    pub allow_concurrent_memtable_write: bool,

    /// Overwrite puts in place (default: false)
    pub inplace_update_support: bool,

    /// Upper bound for the bytes of one write group (default: 1MB)
    pub max_write_batch_group_size_bytes: usize,

    /// Escalate non-I/O write errors into the background error (default: true)
    pub paranoid_checks: bool,

    /// Bytes per second allowed while writes are delayed (default: 16MB/s)
    pub delayed_write_rate: u64,

    /// Bytes per second for low priority writes while compaction lags (default: 1MB/s)
    pub low_pri_write_rate: u64,

    /// Column families created on open, ids are assigned from 1 in order
    pub column_families: Vec<String>,

    /// Operator used to fold merge operands
    pub merge_operator: Option<Arc<dyn MergeOperator>>,

    /// Destination for flushed memtables
    pub flush_sink: Arc<dyn FlushSink>,

    /// How often the background worker drains the flush queue (default: 1s)
    pub flush_interval: Duration,

    /// How often obsolete WAL segments are removed (default: 30s)
    pub wal_cleanup_interval: Duration,
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("dir", &self.dir)
            .field("write_buffer_size", &self.write_buffer_size)
            .field("max_write_buffer_number", &self.max_write_buffer_number)
            .field("db_write_buffer_size", &self.db_write_buffer_size)
            .field("max_total_wal_size", &self.max_total_wal_size)
            .field("write_mode", &self.write_mode)
            .field("two_write_queues", &self.two_write_queues)
            .field("seq_per_batch", &self.seq_per_batch)
            .field(
                "allow_concurrent_memtable_write",
                &self.allow_concurrent_memtable_write,
            )
            .field("column_families", &self.column_families)
            .field("merge_operator", &self.merge_operator.as_ref().map(|m| m.name()))
            .finish_non_exhaustive()
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./cinderdb"),
            create_if_missing: true,
            write_buffer_size: 64 * 1024 * 1024, // 64MB
            max_write_buffer_number: 2,
            db_write_buffer_size: 0,
            write_buffer_manager: None,
            allow_stall: false,
            max_total_wal_size: 0,
            wal_buffer_size: 64 * 1024, // 64KB
            manual_wal_flush: false,
            wal_recovery_mode: WalRecoveryMode::default(),
            write_mode: WriteMode::default(),
            two_write_queues: false,
            seq_per_batch: false,
            allow_concurrent_memtable_write: true,
            inplace_update_support: false,
            max_write_batch_group_size_bytes: 1 << 20,
            paranoid_checks: true,
            delayed_write_rate: 16 * 1024 * 1024,
            low_pri_write_rate: 1024 * 1024,
            column_families: Vec::new(),
            merge_operator: None,
            flush_sink: Arc::new(DiscardSink),
            flush_interval: Duration::from_secs(1),
            wal_cleanup_interval: Duration::from_secs(30),
        }
    }
}

impl DbConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    /// Set the memtable seal threshold
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    pub fn max_write_buffer_number(mut self, count: usize) -> Self {
        self.max_write_buffer_number = count;
        self
    }

    /// Set the memory budget shared by all memtables
    pub fn db_write_buffer_size(mut self, size: usize) -> Self {
        self.db_write_buffer_size = size;
        self
    }

    /// Share a memory budget with other engine instances
    pub fn write_buffer_manager(mut self, manager: Arc<WriteBufferManager>) -> Self {
        self.write_buffer_manager = Some(manager);
        self
    }

    pub fn allow_stall(mut self, allow: bool) -> Self {
        self.allow_stall = allow;
        self
    }

    pub fn max_total_wal_size(mut self, size: u64) -> Self {
        self.max_total_wal_size = size;
        self
    }

    /// Set WAL buffer size
    pub fn wal_buffer_size(mut self, size: usize) -> Self {
        self.wal_buffer_size = size;
        self
    }

    pub fn manual_wal_flush(mut self, manual: bool) -> Self {
        self.manual_wal_flush = manual;
        self
    }

    pub fn wal_recovery_mode(mut self, mode: WalRecoveryMode) -> Self {
        self.wal_recovery_mode = mode;
        self
    }

    /// Select the write scheduling policy
    pub fn write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }

    pub fn two_write_queues(mut self, enabled: bool) -> Self {
        self.two_write_queues = enabled;
        self
    }

    pub fn seq_per_batch(mut self, enabled: bool) -> Self {
        self.seq_per_batch = enabled;
        self
    }

    pub fn allow_concurrent_memtable_write(mut self, allow: bool) -> Self {
        self.allow_concurrent_memtable_write = allow;
        self
    }

    pub fn inplace_update_support(mut self, enabled: bool) -> Self {
        self.inplace_update_support = enabled;
        self
    }

    pub fn max_write_batch_group_size_bytes(mut self, size: usize) -> Self {
        self.max_write_batch_group_size_bytes = size;
        self
    }

    pub fn paranoid_checks(mut self, enabled: bool) -> Self {
        self.paranoid_checks = enabled;
        self
    }

    pub fn delayed_write_rate(mut self, bytes_per_sec: u64) -> Self {
        self.delayed_write_rate = bytes_per_sec;
        self
    }

    pub fn low_pri_write_rate(mut self, bytes_per_sec: u64) -> Self {
        self.low_pri_write_rate = bytes_per_sec;
        self
    }

    /// Add a named column family created on open
    pub fn column_family(mut self, name: impl Into<String>) -> Self {
        self.column_families.push(name.into());
        self
    }

    pub fn merge_operator(mut self, operator: Arc<dyn MergeOperator>) -> Self {
        self.merge_operator = Some(operator);
        self
    }

    pub fn flush_sink(mut self, sink: Arc<dyn FlushSink>) -> Self {
        self.flush_sink = sink;
        self
    }

    /// Set flush check interval
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Set WAL cleanup interval
    pub fn wal_cleanup_interval(mut self, interval: Duration) -> Self {
        self.wal_cleanup_interval = interval;
        self
    }

    /// WAL size ceiling after resolving the default.
    pub(crate) fn effective_max_total_wal_size(&self) -> u64 {
        if self.max_total_wal_size != 0 {
            return self.max_total_wal_size;
        }
        let column_families = self.column_families.len() as u64 + 1;
        4 * column_families * self.write_buffer_size as u64 * self.max_write_buffer_number as u64
    }
}

/// Per-call options for `Db::write`
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// fsync the WAL before returning
    pub sync: bool,
    /// Skip the WAL append entirely
    pub disable_wal: bool,
    /// Fail with `Error::Incomplete` instead of blocking on backpressure
    pub no_slowdown: bool,
    /// Subject the write to the low priority rate limiter
    pub low_priority: bool,
    /// Silently skip records for column families that do not exist
    pub ignore_missing_column_families: bool,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn disable_wal(mut self, disable: bool) -> Self {
        self.disable_wal = disable;
        self
    }

    pub fn no_slowdown(mut self, no_slowdown: bool) -> Self {
        self.no_slowdown = no_slowdown;
        self
    }

    pub fn low_priority(mut self, low_priority: bool) -> Self {
        self.low_priority = low_priority;
        self
    }

    pub fn ignore_missing_column_families(mut self, ignore: bool) -> Self {
        self.ignore_missing_column_families = ignore;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DbConfig::default();
        assert_eq!(config.dir, PathBuf::from("./cinderdb"));
        assert_eq!(config.write_buffer_size, 64 * 1024 * 1024);
        assert_eq!(config.wal_buffer_size, 64 * 1024);
        assert_eq!(config.write_mode, WriteMode::GroupCommit);
        assert_eq!(config.max_write_batch_group_size_bytes, 1 << 20);
        assert!(config.allow_concurrent_memtable_write);
        assert!(config.paranoid_checks);
        assert!(!config.two_write_queues);
        assert_eq!(config.wal_recovery_mode, WalRecoveryMode::PointInTimeRecovery);

        // 4 x (1 family x 64MB x 2 buffers)
        assert_eq!(config.effective_max_total_wal_size(), 4 * 128 * 1024 * 1024);
    }

    #[test]
    fn test_config_builder() {
        let config = DbConfig::new("/tmp/test")
            .write_buffer_size(4 * 1024 * 1024)
            .max_write_buffer_number(4)
            .max_total_wal_size(1024)
            .write_mode(WriteMode::Pipelined)
            .allow_concurrent_memtable_write(false)
            .column_family("users")
            .column_family("events")
            .flush_interval(Duration::from_millis(500))
            .wal_cleanup_interval(Duration::from_secs(15));

        assert_eq!(config.dir, PathBuf::from("/tmp/test"));
        assert_eq!(config.write_buffer_size, 4 * 1024 * 1024);
        assert_eq!(config.max_write_buffer_number, 4);
        assert_eq!(config.effective_max_total_wal_size(), 1024);
        assert_eq!(config.write_mode, WriteMode::Pipelined);
        assert!(!config.allow_concurrent_memtable_write);
        assert_eq!(config.column_families, vec!["users", "events"]);

        // Test background task intervals
        assert_eq!(config.flush_interval, Duration::from_millis(500));
        assert_eq!(config.wal_cleanup_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_write_options_builder() {
        let opts = WriteOptions::new().sync(true).no_slowdown(true);
        assert!(opts.sync);
        assert!(opts.no_slowdown);
        assert!(!opts.disable_wal);
        assert!(!opts.low_priority);
    }
}
