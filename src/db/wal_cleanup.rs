use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::MutexGuard;

use super::state::{DbInner, DbState};
use crate::error::Result;
use crate::scheduler::{BackgroundTask, Context};
use crate::wal::log_file_path;

impl DbInner {
    /// Oldest WAL segment that still holds data some memtable or prepared
    /// transaction depends on.
    fn min_log_to_keep(&self, state: &DbState) -> u64 {
        let mut min_log = state.cfs.min_log_number_to_keep();
        for prep_log in [
            self.prep_tracker.min_log_with_outstanding_prep(),
            state.cfs.min_log_containing_prep(),
        ] {
            if prep_log != 0 {
                min_log = min_log.min(prep_log);
            }
        }
        // The tail segment is never obsolete.
        min_log.min(state.logfile_number)
    }

    /// Retires every alive segment older than what the column families
    /// still need and returns their numbers. Files are removed by the caller
    /// once the mutex is released.
    pub(crate) fn find_obsolete_wals(&self, state: &mut MutexGuard<'_, DbState>) -> Vec<u64> {
        let min_log = self.min_log_to_keep(state);

        let mut obsolete = Vec::new();
        while state.alive_logs.len() > 1 {
            let Some(oldest) = state.alive_logs.front().copied() else {
                break;
            };
            if oldest.number >= min_log {
                break;
            }
            let _ = self.total_log_size.fetch_update(
                Ordering::AcqRel,
                Ordering::Acquire,
                |total| Some(total.saturating_sub(oldest.size)),
            );
            state.alive_logs.pop_front();
            obsolete.push(oldest.number);
        }

        while state.logs.len() > 1 {
            let Some(front) = state.logs.front() else {
                break;
            };
            if front.number >= min_log {
                break;
            }
            if front.getting_synced {
                self.log_sync_cv.wait(state);
                continue;
            }
            if let Some(log) = state.logs.pop_front() {
                state.logs_to_free.push(log.writer);
            }
        }

        if !obsolete.is_empty() {
            tracing::debug!(min_log, obsolete = ?obsolete, "Found obsolete WAL segments");
        }
        obsolete
    }

    pub(crate) fn delete_wal_files(&self, numbers: &[u64]) {
        for &number in numbers {
            let path = log_file_path(&self.config.dir, number);
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    tracing::info!(log_number = number, "Deleted WAL segment");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(
                        log_number = number,
                        error = %e,
                        "Failed to delete WAL segment"
                    );
                }
            }
        }
    }

    /// Deletes the WAL segments no memtable needs anymore.
    pub(crate) fn purge_obsolete_wals(&self) -> usize {
        let mut state = self.state.lock();
        let obsolete = self.find_obsolete_wals(&mut state);
        self.unlock_and_free_logs(state);
        self.delete_wal_files(&obsolete);
        obsolete.len()
    }
}

pub struct WalCleanupTask {
    inner: Arc<DbInner>,
}

impl WalCleanupTask {
    pub(crate) fn new(inner: Arc<DbInner>) -> Self {
        Self { inner }
    }
}

impl BackgroundTask for WalCleanupTask {
    fn name(&self) -> &'static str {
        "wal-cleanup"
    }

    fn interval(&self) -> Duration {
        self.inner.config.wal_cleanup_interval
    }

    fn execute(&self, ctx: Context) -> Result<()> {
        if ctx.is_shutting_down() {
            return Ok(());
        }
        let purged = self.inner.purge_obsolete_wals();
        if purged > 0 {
            tracing::debug!(run_id = ctx.run_id, purged, "WAL cleanup pass");
        }
        Ok(())
    }
}
