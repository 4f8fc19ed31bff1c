use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use crate::column_family::{ColumnFamilyMemtables, ColumnFamilySet};
use crate::config::{DbConfig, WriteMode};
use crate::error::Error;
use crate::flush_scheduler::FlushScheduler;
use crate::inserter::RecoveredTransactions;
use crate::memtable::Memtable;
use crate::prep_tracker::PrepTracker;
use crate::wal::{LogWriter, WalOptions};
use crate::write_buffer_manager::WriteBufferManager;
use crate::write_controller::{DelayWriteToken, StopWriteToken, WriteController};
use crate::write_thread::WriteThread;

pub(crate) type SharedLogWriter = Arc<Mutex<LogWriter>>;

/// A WAL segment that may still need an fsync.
#[derive(Debug)]
pub(crate) struct LogFile {
    pub number: u64,
    pub writer: SharedLogWriter,
    /// A sync of this segment is in flight; nobody may retire it.
    pub getting_synced: bool,
}

/// A WAL segment whose data is not yet flushed everywhere.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AliveLog {
    pub number: u64,
    /// Record bytes, known once the segment stops being the tail.
    pub size: u64,
    pub getting_flushed: bool,
}

/// The tail segment every WAL append goes to.
#[derive(Debug)]
pub(crate) struct CurrentLog {
    pub number: u64,
    pub writer: SharedLogWriter,
    /// Nothing was appended since the segment was created.
    pub empty: bool,
    /// Record bytes appended so far.
    pub bytes: u64,
}

/// Everything guarded by the database mutex.
#[derive(Debug)]
pub(crate) struct DbState {
    pub cfs: ColumnFamilySet,
    /// Segments not yet known to be synced, oldest first; the last one is
    /// the tail.
    pub logs: VecDeque<LogFile>,
    pub alive_logs: VecDeque<AliveLog>,
    pub logfile_number: u64,
    pub next_file_number: u64,
    pub log_dir_synced: bool,
    pub bg_error: Option<Error>,
    pub recovered: RecoveredTransactions,
    pub unable_to_release_oldest_log: bool,
    /// Writers retired while the mutex was held; closed once it is released.
    pub logs_to_free: Vec<SharedLogWriter>,
    pub stop_token: Option<StopWriteToken>,
    pub delay_token: Option<DelayWriteToken>,
}

/// Shared core of an open database.
pub(crate) struct DbInner {
    pub config: DbConfig,
    pub state: Mutex<DbState>,
    /// Signalled when a flush completes or the background error changes.
    pub bg_cv: Condvar,
    pub log_sync_cv: Condvar,

    pub write_thread: WriteThread,
    /// Second queue for WAL-only writes when `two_write_queues` is set.
    pub nonmem_write_thread: WriteThread,
    pub write_controller: WriteController,
    pub write_buffer_manager: Arc<WriteBufferManager>,
    pub flush_scheduler: FlushScheduler,
    pub prep_tracker: PrepTracker,

    memtables: RwLock<Arc<ColumnFamilyMemtables>>,
    next_memtable_id: AtomicU64,

    /// Last published sequence; everything at or below it is visible.
    last_sequence: AtomicU64,
    /// Last sequence handed out by a WAL write, ahead of `last_sequence`
    /// while memtable inserts are in flight.
    last_allocated_sequence: AtomicU64,

    /// Record bytes in alive WAL segments.
    pub total_log_size: AtomicU64,
    /// Byte size of the previous write group, used to pace delayed writes.
    pub last_batch_group_size: AtomicU64,
    /// Unordered writes past their WAL round but not yet in the memtable.
    pub pending_memtable_writes: AtomicUsize,
    pub switch_mutex: Mutex<()>,
    pub switch_cv: Condvar,

    /// Held across every WAL append so records reach the tail in sequence order.
    pub log_write: Mutex<CurrentLog>,
    pub shutting_down: AtomicBool,
}

impl DbInner {
    pub fn new(
        config: DbConfig,
        write_buffer_manager: Arc<WriteBufferManager>,
        state: DbState,
        current: CurrentLog,
        last_sequence: u64,
        next_memtable_id: u64,
    ) -> Self {
        let pipelined = config.write_mode == WriteMode::Pipelined;
        let group_size = config.max_write_batch_group_size_bytes;
        let concurrent = config.allow_concurrent_memtable_write;
        let memtables = Arc::new(state.cfs.memtables());

        Self {
            write_thread: WriteThread::new(group_size, concurrent, pipelined),
            nonmem_write_thread: WriteThread::new(group_size, false, false),
            write_controller: WriteController::new(
                config.delayed_write_rate,
                config.low_pri_write_rate,
            ),
            write_buffer_manager,
            flush_scheduler: FlushScheduler::new(),
            prep_tracker: PrepTracker::new(),
            memtables: RwLock::new(memtables),
            next_memtable_id: AtomicU64::new(next_memtable_id),
            last_sequence: AtomicU64::new(last_sequence),
            last_allocated_sequence: AtomicU64::new(last_sequence),
            total_log_size: AtomicU64::new(state.alive_logs.iter().map(|l| l.size).sum()),
            last_batch_group_size: AtomicU64::new(0),
            pending_memtable_writes: AtomicUsize::new(0),
            switch_mutex: Mutex::new(()),
            switch_cv: Condvar::new(),
            log_write: Mutex::new(current),
            shutting_down: AtomicBool::new(false),
            state: Mutex::new(state),
            bg_cv: Condvar::new(),
            log_sync_cv: Condvar::new(),
            config,
        }
    }

    pub fn wal_options(&self) -> WalOptions {
        WalOptions {
            buffer_size: self.config.wal_buffer_size,
            manual_flush: self.config.manual_wal_flush,
        }
    }

    pub fn new_memtable(&self, log_number: u64) -> Arc<Memtable> {
        let id = self.next_memtable_id.fetch_add(1, Ordering::Relaxed);
        Arc::new(Memtable::new(
            id,
            log_number,
            self.config.write_buffer_size,
            Some(self.write_buffer_manager.clone()),
        ))
    }

    /// The mutable memtables writers insert into.
    pub fn memtables(&self) -> Arc<ColumnFamilyMemtables> {
        self.memtables.read().clone()
    }

    /// Publishes the memtable set after a switch or a family change.
    pub fn install_memtables(&self, state: &DbState) {
        *self.memtables.write() = Arc::new(state.cfs.memtables());
    }

    // ===== Sequences =====

    pub fn last_sequence(&self) -> u64 {
        self.last_sequence.load(Ordering::Acquire)
    }

    pub fn set_last_sequence(&self, sequence: u64) {
        self.last_sequence.fetch_max(sequence, Ordering::AcqRel);
        self.last_allocated_sequence
            .fetch_max(sequence, Ordering::AcqRel);
    }

    /// Reserves `count` sequences and returns the last one already taken.
    pub fn fetch_add_last_allocated_sequence(&self, count: u64) -> u64 {
        self.last_allocated_sequence
            .fetch_add(count, Ordering::AcqRel)
    }

    // ===== Background error =====

    pub fn bg_error(&self) -> Option<Error> {
        self.state.lock().bg_error.clone()
    }

    /// Records `err` as the background error unless one is already set.
    /// Every later write fails with it until `resume`.
    pub fn set_bg_error(&self, state: &mut DbState, err: Error) {
        if state.bg_error.is_none() {
            tracing::error!(error = %err, "Entering background error state");
            state.bg_error = Some(err);
        }
        self.bg_cv.notify_all();
    }

    /// I/O failures always stop the database.
    pub fn io_status_check(&self, err: &Error) {
        let mut state = self.state.lock();
        self.set_bg_error(&mut state, err.clone());
    }

    /// Escalates a failure of a callback, a pre-release hook or a memtable
    /// insert. Errors the caller can fix stay with the writer.
    pub fn write_status_check(&self, err: &Error) {
        let escalate = err.is_io()
            || (self.config.paranoid_checks
                && !matches!(
                    err,
                    Error::Busy(_)
                        | Error::Incomplete(_)
                        | Error::InvalidArgument(_)
                        | Error::NotSupported(_)
                ));
        if escalate {
            let mut state = self.state.lock();
            self.set_bg_error(&mut state, err.clone());
        }
    }

    // ===== Write stalls =====

    /// Derives stop and delay conditions from the number of sealed
    /// memtables waiting for a flush.
    pub fn recalculate_write_stall(&self, state: &mut DbState) {
        let limit = self.config.max_write_buffer_number;
        let worst = state.cfs.iter().map(|cfd| cfd.imm().len()).max().unwrap_or(0);

        if limit > 0 && worst >= limit {
            state.delay_token = None;
            if state.stop_token.is_none() {
                tracing::warn!(
                    immutable = worst,
                    limit,
                    "Stopping writes because of too many memtables"
                );
                state.stop_token = Some(self.write_controller.get_stop_token());
            }
        } else if limit > 3 && worst >= limit - 1 {
            state.stop_token = None;
            if state.delay_token.is_none() {
                tracing::warn!(
                    immutable = worst,
                    limit,
                    rate = self.config.delayed_write_rate,
                    "Delaying writes because of too many memtables"
                );
                state.delay_token = Some(
                    self.write_controller
                        .get_delay_token(self.config.delayed_write_rate),
                );
            }
        } else if state.stop_token.is_some() || state.delay_token.is_some() {
            tracing::info!(immutable = worst, "Write stall cleared");
            state.stop_token = None;
            state.delay_token = None;
        }
    }

    /// Releases the mutex, then closes the writers retired under it.
    pub fn unlock_and_free_logs(&self, mut state: MutexGuard<'_, DbState>) {
        let retired = std::mem::take(&mut state.logs_to_free);
        drop(state);
        drop(retired);
    }
}
