//! The write path.
//!
//! Every write joins a [`WriteThread`] queue. The writer at the front leads
//! a group: it clears pending switches and stalls, appends one WAL record for
//! the whole group, hands out sequences and gets the batches into the
//! memtables. How the memtable step overlaps with the next group depends on
//! the configured [`WriteMode`].

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::MutexGuard;

use super::state::{DbInner, DbState, SharedLogWriter};
use super::Db;
use crate::batch::{appended_byte_size, WriteBatch};
use crate::column_family::ColumnFamilyMemtables;
use crate::config::{WriteMode, WriteOptions};
use crate::error::{Error, Result};
use crate::inserter::{sub_batch_count, InsertOptions, MemtableInserter};
use crate::wal::{sync_dir, wal_dir};
use crate::write_thread::{WriteGroup, WriteRequest, WriteThread, Writer, WriterState};

/// Granularity of the sleep of a delayed writer.
const DELAY_INTERVAL: Duration = Duration::from_millis(1);
/// How long a stopped writer waits before checking again.
const STOP_WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// What a successful write was assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Sequence of the first entry of the batch.
    pub sequence: u64,
    /// WAL segment the batch went to, zero when it skipped the WAL.
    pub log_used: u64,
}

impl WriteOutcome {
    fn of(w: &Writer) -> Self {
        Self {
            sequence: w.sequence(),
            log_used: w.log_used(),
        }
    }
}

/// Sync duties a group leader took on in `preprocess_write`.
#[derive(Default)]
pub(crate) struct LogSync {
    need_log_sync: bool,
    need_log_dir_sync: bool,
    /// Segments marked `getting_synced` on behalf of this group.
    logs: Vec<SharedLogWriter>,
}

impl LogSync {
    fn new(need_log_sync: bool) -> Self {
        Self {
            need_log_sync,
            ..Self::default()
        }
    }
}

impl Db {
    /// Atomically applies `batch`.
    pub fn write(&self, opts: &WriteOptions, batch: WriteBatch) -> Result<()> {
        self.write_request(opts, WriteRequest::new(batch)).map(|_| ())
    }

    /// Applies a write with callbacks or WAL-only settings and reports the
    /// sequence and WAL segment it was given.
    pub fn write_request(&self, opts: &WriteOptions, mut request: WriteRequest) -> Result<WriteOutcome> {
        let inner = &*self.inner;
        let config = &inner.config;

        if inner.shutting_down.load(Ordering::Acquire) {
            return Err(Error::ShutdownInProgress);
        }
        if opts.sync && opts.disable_wal {
            return Err(Error::InvalidArgument("Sync writes has to enable WAL.".into()));
        }
        if config.write_mode == WriteMode::Pipelined && config.two_write_queues {
            return Err(Error::NotSupported(
                "pipelined_writes is not compatible with concurrent prepares".into(),
            ));
        }
        if config.write_mode == WriteMode::Pipelined && config.seq_per_batch {
            return Err(Error::NotSupported(
                "pipelined_writes is not compatible with seq_per_batch".into(),
            ));
        }

        // Refused here, a record never reaches the WAL to fail again on replay.
        request.batch.check_arguments(
            config.flush_sink.supports_range_deletion(),
            config.merge_operator.is_some(),
        )?;

        if request.batch_cnt == 0 {
            request.batch_cnt = if config.seq_per_batch {
                sub_batch_count(&request.batch)?
            } else {
                u64::from(request.batch.count())
            };
        }

        if opts.low_priority {
            inner.throttle_low_pri_write(opts, &request.batch)?;
        }

        if config.two_write_queues && request.disable_memtable {
            let w = Arc::new(Writer::new(opts, request));
            return self.write_wal_only(&inner.nonmem_write_thread, opts, &w, config.seq_per_batch, false);
        }

        match config.write_mode {
            WriteMode::Unordered => self.unordered_write(opts, request),
            WriteMode::Pipelined => self.pipelined_write(opts, request),
            WriteMode::GroupCommit => self.group_commit_write(opts, request),
        }
    }

    fn group_commit_write(&self, opts: &WriteOptions, request: WriteRequest) -> Result<WriteOutcome> {
        let inner = &*self.inner;
        let w = Arc::new(Writer::new(opts, request));

        if inner.write_thread.join_batch_group(&w) == WriterState::ParallelMemtableWriter {
            // The leader already wrote the WAL and assigned our sequence.
            inner.insert_writer(&w, &inner.memtables(), true);
            if inner.write_thread.complete_parallel_memtable_writer(&w) {
                if let Some(group) = w.group() {
                    inner.set_last_sequence(group.last_sequence());
                }
                inner.write_thread.exit_as_batch_group_follower(&w);
            }
        }
        if w.state() == WriterState::Completed {
            w.final_status()?;
            return Ok(WriteOutcome::of(&w));
        }
        debug_assert_eq!(w.state(), WriterState::GroupLeader);
        self.lead_write_group(opts, &w)
    }

    fn lead_write_group(&self, opts: &WriteOptions, w: &Arc<Writer>) -> Result<WriteOutcome> {
        let inner = &*self.inner;
        let config = &inner.config;
        let two_queues = config.two_write_queues;

        let mut sync = LogSync::new(opts.sync);
        let mut last_sequence = 0;
        let mut status = Ok(());
        {
            let mut state = inner.state.lock();
            if !two_queues || !w.disable_memtable {
                status = inner.preprocess_write(&mut state, opts, &mut sync);
            }
            if !two_queues {
                last_sequence = inner.last_sequence();
            }
            inner.unlock_and_free_logs(state);
        }

        let group = inner.write_thread.enter_as_batch_group_leader(w);
        let mut escalate = None;
        let mut in_parallel_group = false;

        if status.is_ok() {
            let mut parallel = config.allow_concurrent_memtable_write
                && group.len() > 1
                && !config.inplace_update_support;
            let mut total_count = 0u64;
            let mut valid_batches = 0u64;
            let mut total_bytes = 0usize;
            let mut pre_release_cnt = 0usize;
            for writer in group.writers() {
                if !writer.check_callback(self) {
                    continue;
                }
                valid_batches += writer.batch_cnt;
                if writer.should_write_to_memtable() {
                    total_count += u64::from(writer.batch.count());
                    parallel = parallel && !writer.batch.has_merge();
                }
                total_bytes = appended_byte_size(total_bytes, writer.batch.data_size());
                if writer.pre_release.is_some() {
                    pre_release_cnt += 1;
                }
            }
            inner
                .last_batch_group_size
                .store(total_bytes as u64, Ordering::Relaxed);
            let seq_inc = if config.seq_per_batch {
                valid_batches
            } else {
                total_count
            };

            if opts.disable_wal {
                if two_queues {
                    last_sequence = inner.fetch_add_last_allocated_sequence(seq_inc);
                }
            } else {
                let allocate = two_queues.then_some(seq_inc);
                status = inner
                    .append_group(&group, allocate, last_sequence + 1)
                    .and_then(|last| {
                        last_sequence = last;
                        inner.sync_logs(&sync)
                    });
                if let Err(e) = &status {
                    escalate = Some(e.clone());
                }
            }
            let current_sequence = last_sequence + 1;
            last_sequence += seq_inc;

            if status.is_ok() {
                status = assign_sequences(&group, current_sequence, config.seq_per_batch, pre_release_cnt);
                if let Err(e) = &status {
                    escalate = Some(e.clone());
                }
            }

            if status.is_ok() {
                if parallel {
                    group.set_last_sequence(last_sequence);
                    inner.write_thread.launch_parallel_memtable_writers(&group);
                    in_parallel_group = true;
                    inner.insert_writer(w, &inner.memtables(), true);
                } else {
                    inner.insert_group(&group);
                }
            }
        }

        if let Some(e) = &escalate {
            if !w.callback_failed() {
                inner.write_status_check(e);
            }
        }
        inner.finish_log_sync(&sync, status.is_ok());

        let should_exit = !in_parallel_group || inner.write_thread.complete_parallel_memtable_writer(w);
        if should_exit {
            if status.is_ok() {
                inner.set_last_sequence(last_sequence);
            }
            inner.write_thread.exit_as_batch_group_leader(&group, status.clone());
        }
        status?;
        w.final_status()?;
        Ok(WriteOutcome::of(w))
    }

    fn pipelined_write(&self, opts: &WriteOptions, request: WriteRequest) -> Result<WriteOutcome> {
        let inner = &*self.inner;
        let w = Arc::new(Writer::new(opts, request));

        if inner.write_thread.join_batch_group(&w) == WriterState::GroupLeader {
            if !w.allows_batching() {
                inner.write_thread.wait_for_memtable_writers();
            }
            let mut sync = LogSync::new(opts.sync && !opts.disable_wal);
            let mut status = {
                let mut state = inner.state.lock();
                let status = inner.preprocess_write(&mut state, opts, &mut sync);
                inner.unlock_and_free_logs(state);
                status
            };

            let group = inner.write_thread.enter_as_batch_group_leader(&w);
            if status.is_ok() {
                let mut total_count = 0u64;
                let mut total_bytes = 0usize;
                for writer in group.writers() {
                    if !writer.check_callback(self) {
                        continue;
                    }
                    total_bytes = appended_byte_size(total_bytes, writer.batch.data_size());
                    if writer.should_write_to_memtable() {
                        total_count += u64::from(writer.batch.count());
                    }
                }
                inner
                    .last_batch_group_size
                    .store(total_bytes as u64, Ordering::Relaxed);

                // Earlier groups may still be in their memtable stage, so the
                // next sequence comes from the allocation counter.
                let current_sequence = inner.fetch_add_last_allocated_sequence(total_count) + 1;
                let mut next = current_sequence;
                for writer in group.writers() {
                    if writer.should_write_to_memtable() {
                        writer.set_sequence(next);
                        next += u64::from(writer.batch.count());
                    }
                }

                if !opts.disable_wal {
                    status = inner
                        .append_group(&group, None, current_sequence)
                        .and_then(|_| inner.sync_logs(&sync));
                    if let Err(e) = &status {
                        if !w.callback_failed() {
                            inner.write_status_check(e);
                        }
                    }
                }
            }
            inner.finish_log_sync(&sync, status.is_ok());
            inner.write_thread.exit_as_batch_group_leader(&group, status);
        }

        if w.state() == WriterState::MemtableWriterLeader {
            let group = inner.write_thread.enter_as_memtable_writer(&w);
            if group.len() > 1 && inner.config.allow_concurrent_memtable_write {
                inner.write_thread.launch_parallel_memtable_writers(&group);
            } else {
                inner.insert_group(&group);
                inner.set_last_sequence(group.last_sequence());
                inner.write_thread.exit_as_memtable_writer(&group);
            }
        }

        if w.state() == WriterState::ParallelMemtableWriter {
            inner.insert_writer(&w, &inner.memtables(), true);
            if inner.write_thread.complete_parallel_memtable_writer(&w) {
                if let Some(group) = w.group() {
                    inner.set_last_sequence(group.last_sequence());
                    inner.write_thread.exit_as_memtable_writer(&group);
                }
            }
        }

        w.final_status()?;
        Ok(WriteOutcome::of(&w))
    }

    fn unordered_write(&self, opts: &WriteOptions, request: WriteRequest) -> Result<WriteOutcome> {
        let inner = &*self.inner;
        let w = Arc::new(Writer::new(opts, request));
        let outcome = self.write_wal_only(&inner.write_thread, opts, &w, true, true)?;
        if !w.disable_memtable {
            inner.unordered_write_memtable(&w)?;
        }
        Ok(outcome)
    }

    /// Group commit that stops after the WAL. With `assign_order` writers
    /// get sequences; with `publish_last_seq` those are published right away
    /// and the memtable inserts follow outside the queue.
    fn write_wal_only(
        &self,
        write_thread: &WriteThread,
        opts: &WriteOptions,
        w: &Arc<Writer>,
        assign_order: bool,
        publish_last_seq: bool,
    ) -> Result<WriteOutcome> {
        let inner = &*self.inner;
        let config = &inner.config;

        if write_thread.join_batch_group(w) == WriterState::Completed {
            w.final_status()?;
            return Ok(WriteOutcome::of(w));
        }

        let status = {
            let mut state = inner.state.lock();
            let status = if publish_last_seq {
                let mut sync = LogSync::default();
                inner.preprocess_write(&mut state, opts, &mut sync)
            } else {
                state.bg_error.clone().map_or(Ok(()), Err)
            };
            inner.unlock_and_free_logs(state);
            status
        };
        let group = write_thread.enter_as_batch_group_leader(w);
        if let Err(e) = status {
            write_thread.exit_as_batch_group_leader(&group, Err(e.clone()));
            return Err(e);
        }

        let mut total_bytes = 0usize;
        let mut seq_inc = 0u64;
        let mut pre_release_cnt = 0usize;
        for writer in group.writers() {
            if !writer.check_callback(self) {
                continue;
            }
            total_bytes = appended_byte_size(total_bytes, writer.batch.data_size());
            if assign_order {
                seq_inc += writer.batch_cnt;
            }
            if writer.pre_release.is_some() {
                pre_release_cnt += 1;
            }
        }
        if publish_last_seq {
            inner
                .last_batch_group_size
                .store(total_bytes as u64, Ordering::Relaxed);
        }

        let last_sequence = if opts.disable_wal {
            inner.fetch_add_last_allocated_sequence(seq_inc)
        } else {
            match inner.append_group(&group, Some(seq_inc), 0) {
                Ok(last) => last,
                Err(e) => {
                    if !w.callback_failed() {
                        inner.write_status_check(&e);
                    }
                    write_thread.exit_as_batch_group_leader(&group, Err(e.clone()));
                    return Err(e);
                }
            }
        };

        let mut memtable_write_cnt = 0usize;
        let mut next = last_sequence + 1;
        for writer in group.writers() {
            if writer.callback_failed() {
                continue;
            }
            writer.set_sequence(next);
            if assign_order {
                next += writer.batch_cnt;
            }
            if !writer.disable_memtable {
                memtable_write_cnt += 1;
            }
        }

        let mut status = Ok(());
        if opts.sync {
            status = if config.manual_wal_flush {
                inner.flush_wal(true)
            } else {
                inner.sync_wal()
            };
        }
        if status.is_ok() {
            status = run_pre_release_callbacks(&group, pre_release_cnt);
        }
        if let Err(e) = &status {
            if !w.callback_failed() {
                inner.write_status_check(e);
            }
        }

        if publish_last_seq {
            inner.set_last_sequence(last_sequence + seq_inc);
        }
        if config.write_mode == WriteMode::Unordered && status.is_ok() {
            inner
                .pending_memtable_writes
                .fetch_add(memtable_write_cnt, Ordering::AcqRel);
        }
        write_thread.exit_as_batch_group_leader(&group, status.clone());
        status?;
        w.final_status()?;
        Ok(WriteOutcome::of(w))
    }
}

/// Gives each writer that passed its callback its first sequence, then runs
/// the pre-release callbacks in group order.
fn assign_sequences(
    group: &WriteGroup,
    first: u64,
    seq_per_batch: bool,
    pre_release_cnt: usize,
) -> Result<()> {
    let mut next = first;
    for writer in group.writers() {
        if writer.callback_failed() {
            continue;
        }
        writer.set_sequence(next);
        if seq_per_batch {
            next += writer.batch_cnt;
        } else if writer.should_write_to_memtable() {
            next += u64::from(writer.batch.count());
        }
    }
    run_pre_release_callbacks(group, pre_release_cnt)
}

fn run_pre_release_callbacks(group: &WriteGroup, total: usize) -> Result<()> {
    let mut index = 0;
    for writer in group.writers() {
        if writer.callback_failed() {
            continue;
        }
        if let Some(callback) = &writer.pre_release {
            callback.callback(
                writer.sequence(),
                writer.disable_memtable,
                writer.log_used(),
                index,
                total,
            )?;
            index += 1;
        }
    }
    Ok(())
}

/// One batch carrying the WAL part of every member that passed its
/// callback; `None` when no member reaches the WAL.
fn merge_batch(group: &WriteGroup) -> Result<Option<WriteBatch>> {
    let leader = group.leader();
    if group.len() == 1
        && !leader.callback_failed()
        && leader.status().is_none()
        && leader.batch.wal_termination_point().is_none()
    {
        return Ok(Some(leader.batch.clone()));
    }

    let mut merged = WriteBatch::new();
    let mut members = 0;
    for writer in group.writers() {
        if writer.callback_failed() || writer.status().is_some() {
            continue;
        }
        merged.append(&writer.batch, true)?;
        members += 1;
    }
    Ok((members > 0).then_some(merged))
}

impl DbInner {
    fn throttle_low_pri_write(&self, opts: &WriteOptions, batch: &WriteBatch) -> Result<()> {
        if !self.write_controller.needs_speedup_compaction() {
            return Ok(());
        }
        // Only prepares are paced; commits release what was already written.
        if batch.has_commit() || batch.has_rollback() {
            return Ok(());
        }
        if opts.no_slowdown {
            return Err(Error::Incomplete("Low priority write stall".into()));
        }
        self.write_controller
            .low_pri_rate_limiter()
            .request(batch.data_size() as u64);
        Ok(())
    }

    /// Brings the database into a state where the next group may write:
    /// rotates the WAL or switches memtables when limits are hit, applies
    /// write stalls and, for sync writes, claims the segments to fsync.
    pub(crate) fn preprocess_write(
        &self,
        state: &mut MutexGuard<'_, DbState>,
        opts: &WriteOptions,
        sync: &mut LogSync,
    ) -> Result<()> {
        let result = self.prepare_for_write(state, opts);
        if result.is_err() || !sync.need_log_sync {
            sync.need_log_sync = false;
            return result;
        }

        while state.logs.front().map_or(false, |log| log.getting_synced) {
            self.log_sync_cv.wait(state);
        }
        for log in state.logs.iter_mut() {
            log.getting_synced = true;
            sync.logs.push(log.writer.clone());
        }
        sync.need_log_dir_sync = !state.log_dir_synced;
        Ok(())
    }

    fn prepare_for_write(&self, state: &mut MutexGuard<'_, DbState>, opts: &WriteOptions) -> Result<()> {
        if let Some(e) = &state.bg_error {
            return Err(e.clone());
        }

        if self.total_log_size.load(Ordering::Acquire) > self.config.effective_max_total_wal_size() {
            self.wait_for_pending_writes(state);
            self.switch_wal(state)?;
        }
        if self.write_buffer_manager.should_flush() {
            self.wait_for_pending_writes(state);
            self.handle_write_buffer_full(state)?;
        }
        if !self.flush_scheduler.is_empty() {
            self.wait_for_pending_writes(state);
            self.schedule_flushes(state)?;
        }

        if self.write_controller.is_stopped() || self.write_controller.needs_delay() {
            let bytes = self.last_batch_group_size.load(Ordering::Relaxed);
            self.delay_write(state, bytes, opts)?;
        }

        if self.write_buffer_manager.should_stall() {
            if opts.no_slowdown {
                return Err(Error::Incomplete("Write stall".into()));
            }
            tracing::debug!(
                memory_usage = self.write_buffer_manager.memory_usage(),
                "Stalling writes on write buffer memory"
            );
            self.write_thread.begin_write_stall();
            MutexGuard::unlocked(state, || self.write_buffer_manager.wait_for_stall_end());
            self.write_thread.end_write_stall();
        }
        Ok(())
    }

    /// Sleeps off the delay the controller asks for `num_bytes`, then waits
    /// while writes are stopped.
    fn delay_write(&self, state: &mut MutexGuard<'_, DbState>, num_bytes: u64, opts: &WriteOptions) -> Result<()> {
        let start = Instant::now();
        let delay = self.write_controller.get_delay(num_bytes);
        if !delay.is_zero() {
            if opts.no_slowdown {
                return Err(Error::Incomplete("Write stall".into()));
            }
            tracing::debug!(delay_us = delay.as_micros() as u64, num_bytes, "Delaying write");
            self.write_thread.begin_write_stall();
            MutexGuard::unlocked(state, || {
                let deadline = start + delay;
                while self.write_controller.needs_delay() && Instant::now() < deadline {
                    std::thread::sleep(DELAY_INTERVAL);
                }
            });
            self.write_thread.end_write_stall();
        }

        while state.bg_error.is_none() && self.write_controller.is_stopped() {
            if opts.no_slowdown {
                return Err(Error::Incomplete("Write stall".into()));
            }
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(Error::ShutdownInProgress);
            }
            self.write_thread.begin_write_stall();
            self.bg_cv.wait_for(state, STOP_WAIT_INTERVAL);
            self.write_thread.end_write_stall();
        }

        match &state.bg_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Appends the group's merged batch to the tail segment and returns the
    /// sequence right before it. With `allocate` the sequences are reserved
    /// under the log lock, otherwise the batch starts at `first_sequence`.
    fn append_group(&self, group: &WriteGroup, allocate: Option<u64>, first_sequence: u64) -> Result<u64> {
        let reserve = || match allocate {
            Some(count) => self.fetch_add_last_allocated_sequence(count),
            None => first_sequence.saturating_sub(1),
        };
        let Some(mut merged) = merge_batch(group)? else {
            return Ok(reserve());
        };

        let mut current = self.log_write.lock();
        let last = reserve();
        merged.set_sequence(last + 1);
        let written = current.writer.lock().add_record(merged.data())?;
        current.empty = false;
        current.bytes += written;
        let log_number = current.number;
        drop(current);

        self.total_log_size.fetch_add(written, Ordering::AcqRel);
        for writer in group.writers() {
            if !writer.callback_failed() && writer.status().is_none() {
                writer.set_log_used(log_number);
            }
        }
        Ok(last)
    }

    /// fsyncs the segments claimed in `preprocess_write`.
    fn sync_logs(&self, sync: &LogSync) -> Result<()> {
        if !sync.need_log_sync {
            return Ok(());
        }
        for log in &sync.logs {
            log.lock().sync()?;
        }
        if sync.need_log_dir_sync {
            sync_dir(&wal_dir(&self.config.dir))?;
        }
        Ok(())
    }

    fn finish_log_sync(&self, sync: &LogSync, synced: bool) {
        if !sync.need_log_sync {
            return;
        }
        let mut state = self.state.lock();
        let up_to = state.logfile_number;
        if synced {
            self.mark_logs_synced(&mut state, up_to, sync.need_log_dir_sync);
        } else {
            self.mark_logs_not_synced(&mut state, up_to);
        }
        self.unlock_and_free_logs(state);
    }

    pub(crate) fn mark_logs_synced(&self, state: &mut DbState, up_to: u64, synced_dir: bool) {
        if synced_dir && state.logfile_number == up_to {
            state.log_dir_synced = true;
        }
        while state.logs.len() > 1 && state.logs.front().map_or(false, |log| log.number <= up_to) {
            if let Some(log) = state.logs.pop_front() {
                state.logs_to_free.push(log.writer);
            }
        }
        for log in state.logs.iter_mut().filter(|log| log.number <= up_to) {
            log.getting_synced = false;
        }
        self.log_sync_cv.notify_all();
    }

    pub(crate) fn mark_logs_not_synced(&self, state: &mut DbState, up_to: u64) {
        for log in state.logs.iter_mut().filter(|log| log.number <= up_to) {
            log.getting_synced = false;
        }
        self.log_sync_cv.notify_all();
    }

    fn insert_options(&self, w: &Writer, concurrent: bool) -> InsertOptions {
        InsertOptions {
            ignore_missing_column_families: w.ignore_missing_column_families,
            recovering_log_number: 0,
            concurrent_memtable_writes: concurrent,
            seq_per_batch: self.config.seq_per_batch,
            inplace_update_support: self.config.inplace_update_support,
            supports_range_deletion: self.config.flush_sink.supports_range_deletion(),
        }
    }

    /// Applies one writer's batch at its assigned sequence. A failure stays
    /// with that writer unless it has to stop the database.
    fn insert_writer(&self, w: &Writer, memtables: &ColumnFamilyMemtables, concurrent: bool) {
        if !w.should_write_to_memtable() {
            return;
        }
        let mut inserter = MemtableInserter::new(w.sequence(), memtables, self.insert_options(w, concurrent))
            .with_merge_operator(self.config.merge_operator.as_deref())
            .with_flush_scheduler(&self.flush_scheduler);
        inserter.set_log_number_ref(w.log_ref);
        let result = inserter.insert(&w.batch);
        inserter.post_process();

        if let Err(e) = result {
            tracing::debug!(sequence = w.sequence(), error = %e, "Memtable insert failed");
            w.fail(e.clone());
            self.write_status_check(&e);
        }
    }

    /// Applies every member of `group` from the calling thread.
    fn insert_group(&self, group: &WriteGroup) {
        let memtables = self.memtables();
        for writer in group.writers() {
            self.insert_writer(writer, &memtables, false);
        }
    }

    fn unordered_write_memtable(&self, w: &Writer) -> Result<()> {
        self.insert_writer(w, &self.memtables(), true);
        if self.pending_memtable_writes.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _guard = self.switch_mutex.lock();
            self.switch_cv.notify_all();
        }
        w.final_status()
    }

    /// fsyncs every segment up to the tail.
    pub(crate) fn sync_wal(&self) -> Result<()> {
        let (up_to, logs, need_dir_sync) = {
            let mut state = self.state.lock();
            let up_to = state.logfile_number;
            while state
                .logs
                .front()
                .map_or(false, |log| log.number <= up_to && log.getting_synced)
            {
                self.log_sync_cv.wait(&mut state);
            }
            let mut logs = Vec::new();
            for log in state.logs.iter_mut().filter(|log| log.number <= up_to) {
                log.getting_synced = true;
                logs.push(log.writer.clone());
            }
            (up_to, logs, !state.log_dir_synced)
        };

        let sync = LogSync {
            need_log_sync: true,
            need_log_dir_sync: need_dir_sync,
            logs,
        };
        let result = self.sync_logs(&sync);
        if let Err(e) = &result {
            tracing::error!(error = %e, "WAL sync failed");
        }

        let mut state = self.state.lock();
        if result.is_ok() {
            self.mark_logs_synced(&mut state, up_to, need_dir_sync);
        } else {
            self.mark_logs_not_synced(&mut state, up_to);
        }
        self.unlock_and_free_logs(state);
        result
    }

    /// Writes out records held back by `manual_wal_flush`, then fsyncs when
    /// `sync` is set.
    pub(crate) fn flush_wal(&self, sync: bool) -> Result<()> {
        if self.config.manual_wal_flush {
            let flushed = self.log_write.lock().writer.lock().flush();
            if let Err(e) = flushed {
                tracing::error!(error = %e, "WAL flush failed");
                self.io_status_check(&e);
                return Err(e);
            }
        }
        if sync {
            self.sync_wal()
        } else {
            Ok(())
        }
    }
}
