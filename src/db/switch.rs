//! Memtable switches and WAL rotation.
//!
//! All of these run with the database mutex held and with exclusive use of
//! the write queue, either as the current group leader or through an
//! unbatched writer. The mutex is released only around file creation and
//! while waiting for the second write queue.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use super::state::{AliveLog, CurrentLog, DbInner, DbState, LogFile};
use crate::config::WriteMode;
use crate::error::Result;
use crate::wal::LogWriter;
use crate::write_thread::Writer;

impl DbInner {
    /// Waits until no memtable insert of an earlier write is in flight.
    pub(crate) fn wait_for_pending_writes(&self, state: &mut MutexGuard<'_, DbState>) {
        match self.config.write_mode {
            WriteMode::Pipelined => {
                MutexGuard::unlocked(state, || self.write_thread.wait_for_memtable_writers());
            }
            WriteMode::Unordered => {
                if self.pending_memtable_writes.load(Ordering::Acquire) == 0 {
                    return;
                }
                MutexGuard::unlocked(state, || {
                    let mut guard = self.switch_mutex.lock();
                    while self.pending_memtable_writes.load(Ordering::Acquire) != 0 {
                        self.switch_cv.wait(&mut guard);
                    }
                });
            }
            WriteMode::GroupCommit => {}
        }
    }

    /// Opens a new tail segment and retires the current one.
    ///
    /// A failure here may lose whatever the old tail still buffered, so it
    /// becomes the background error.
    pub(crate) fn roll_log(&self, state: &mut MutexGuard<'_, DbState>) -> Result<()> {
        let number = state.next_file_number;
        state.next_file_number += 1;
        let start_sequence = self.last_sequence();
        let opts = self.wal_options();

        let created = MutexGuard::unlocked(state, || {
            LogWriter::create(&self.config.dir, number, start_sequence, &opts)
        });
        let installed = created.and_then(|writer| {
            let writer = Arc::new(Mutex::new(writer));
            let mut current = self.log_write.lock();
            current.writer.lock().flush()?;
            let retired = std::mem::replace(
                &mut *current,
                CurrentLog {
                    number,
                    writer: writer.clone(),
                    empty: true,
                    bytes: 0,
                },
            );
            Ok((retired, writer))
        });

        match installed {
            Ok((retired, writer)) => {
                if let Some(alive) = state.alive_logs.back_mut() {
                    if alive.number == retired.number {
                        alive.size = retired.bytes;
                    }
                }
                state.logfile_number = number;
                state.log_dir_synced = false;
                state.logs.push_back(LogFile {
                    number,
                    writer,
                    getting_synced: false,
                });
                state.alive_logs.push_back(AliveLog {
                    number,
                    size: 0,
                    getting_flushed: false,
                });
                tracing::info!(
                    log_number = number,
                    previous = retired.number,
                    start_sequence,
                    "Switched to new WAL segment"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(log_number = number, error = %e, "Failed to switch WAL segment");
                self.set_bg_error(state, e.clone());
                Err(e)
            }
        }
    }

    /// Seals the mutable memtable of `cf_id` and installs a fresh one,
    /// rolling the WAL first unless the tail is still empty.
    pub(crate) fn switch_memtable(
        &self,
        state: &mut MutexGuard<'_, DbState>,
        cf_id: u32,
    ) -> Result<()> {
        if !self.log_write.lock().empty {
            self.roll_log(state)?;
        }
        let logfile_number = state.logfile_number;

        // Families without data do not need any older segment.
        for cfd in state.cfs.iter_mut() {
            if !cfd.has_unflushed_data() {
                cfd.set_log_number(logfile_number);
            }
        }

        let mem = self.new_memtable(logfile_number);
        let Some(cfd) = state.cfs.get_mut(cf_id) else {
            return Ok(());
        };
        if cfd.mem().is_empty() {
            return Ok(());
        }
        let sealed = cfd.switch_memtable(mem);
        tracing::debug!(
            cf = cfd.name(),
            memtable_id = sealed.id(),
            entries = sealed.num_entries(),
            immutable = cfd.imm().len(),
            log_number = logfile_number,
            "Switched memtable"
        );

        self.install_memtables(state);
        self.recalculate_write_stall(state);
        Ok(())
    }

    /// Switches the memtables of `cf_ids`, holding the second write queue
    /// so no WAL-only write races the rotation.
    fn switch_memtables(&self, state: &mut MutexGuard<'_, DbState>, cf_ids: &[u32]) -> Result<()> {
        let nonmem = self
            .config
            .two_write_queues
            .then(|| Arc::new(Writer::unbatched()));
        if let Some(w) = &nonmem {
            MutexGuard::unlocked(state, || self.nonmem_write_thread.enter_unbatched(w));
        }

        let mut result = Ok(());
        for &cf_id in cf_ids {
            result = self.switch_memtable(state, cf_id);
            if result.is_err() {
                break;
            }
        }

        if let Some(w) = &nonmem {
            self.nonmem_write_thread.exit_unbatched(w);
        }
        result
    }

    /// Frees the oldest WAL segment by switching every family with data in
    /// it. Called when the WAL outgrew `max_total_wal_size`.
    pub(crate) fn switch_wal(&self, state: &mut MutexGuard<'_, DbState>) -> Result<()> {
        let Some(oldest) = state.alive_logs.front().copied() else {
            return Ok(());
        };
        if oldest.getting_flushed {
            return Ok(());
        }

        let mut flush_wont_release_oldest_log = false;
        let oldest_prep_log = self.prep_tracker.min_log_with_outstanding_prep();
        if oldest_prep_log != 0 && oldest_prep_log == oldest.number {
            if state.unable_to_release_oldest_log {
                // Flushing already failed to free it; only a commit can.
                return Ok(());
            }
            tracing::warn!(
                log_number = oldest.number,
                "Unable to release oldest log due to uncommitted transaction"
            );
            state.unable_to_release_oldest_log = true;
            flush_wont_release_oldest_log = true;
        }
        if !flush_wont_release_oldest_log {
            state.unable_to_release_oldest_log = false;
            if let Some(front) = state.alive_logs.front_mut() {
                front.getting_flushed = true;
            }
        }

        tracing::info!(
            log_number = oldest.number,
            total_log_size = self.total_log_size.load(Ordering::Acquire),
            max_total_wal_size = self.config.effective_max_total_wal_size(),
            "Flushing all column families with data in oldest WAL segment"
        );
        let cf_ids: Vec<u32> = state
            .cfs
            .iter()
            .filter(|cfd| cfd.oldest_unflushed_log() <= oldest.number)
            .map(|cfd| cfd.id())
            .collect();
        self.switch_memtables(state, &cf_ids)
    }

    /// Relieves the shared write buffer budget by switching the family whose
    /// mutable memtable holds the oldest data.
    pub(crate) fn handle_write_buffer_full(&self, state: &mut MutexGuard<'_, DbState>) -> Result<()> {
        let picked = state
            .cfs
            .iter()
            .filter(|cfd| !cfd.is_dropped())
            .filter_map(|cfd| cfd.mem().first_sequence().map(|seq| (seq, cfd.id())))
            .min()
            .map(|(_, id)| id);

        tracing::info!(
            memory_usage = self.write_buffer_manager.memory_usage(),
            buffer_size = self.write_buffer_manager.buffer_size(),
            cf_id = ?picked,
            "Flushing column family with oldest memtable entry"
        );
        match picked {
            Some(cf_id) => self.switch_memtables(state, &[cf_id]),
            None => Ok(()),
        }
    }

    /// Switches the memtables that inserters reported as full.
    pub(crate) fn schedule_flushes(&self, state: &mut MutexGuard<'_, DbState>) -> Result<()> {
        let mut cf_ids = Vec::new();
        while let Some(cf_id) = self.flush_scheduler.take_next() {
            let non_empty = state
                .cfs
                .get(cf_id)
                .map_or(false, |cfd| !cfd.mem().is_empty());
            if non_empty && !cf_ids.contains(&cf_id) {
                cf_ids.push(cf_id);
            }
        }
        self.switch_memtables(state, &cf_ids)
    }
}
