//! Flushing sealed memtables.
//!
//! Persistent table building lives outside this crate. A flush hands each
//! sealed memtable to a [`FlushSink`]; once the sink accepted it the memtable
//! is dropped, its column family stops needing the WAL segments it was
//! built from, and those segments become candidates for purging.

use std::sync::Arc;

use parking_lot::Mutex;

use super::state::DbInner;
use crate::error::Result;
use crate::memtable::{InternalKey, Memtable};

/// Destination of flushed memtables.
pub trait FlushSink: Send + Sync {
    /// Whether range tombstones can be persisted. When false, batches with a
    /// range deletion are rejected with `NotSupported`.
    fn supports_range_deletion(&self) -> bool {
        true
    }

    /// Persists one sealed memtable of column family `cf_id`.
    fn flush(&self, cf_id: u32, cf_name: &str, memtable: &Memtable) -> Result<()>;
}

/// Drops flushed data. Everything not yet flushed is still in the WAL.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

impl FlushSink for DiscardSink {
    fn flush(&self, cf_id: u32, cf_name: &str, memtable: &Memtable) -> Result<()> {
        tracing::debug!(
            cf_id,
            cf_name,
            memtable_id = memtable.id(),
            entries = memtable.num_entries(),
            "Discarding flushed memtable"
        );
        Ok(())
    }
}

/// A flushed memtable as captured by [`MemorySink`].
#[derive(Debug, Clone)]
pub struct FlushedTable {
    pub cf_id: u32,
    pub cf_name: String,
    pub memtable_id: u64,
    pub entries: Vec<(InternalKey, Vec<u8>)>,
}

/// Keeps flushed memtables in memory, in flush order.
#[derive(Debug, Default)]
pub struct MemorySink {
    tables: Mutex<Vec<FlushedTable>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tables(&self) -> Vec<FlushedTable> {
        self.tables.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.tables.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.lock().is_empty()
    }
}

impl FlushSink for MemorySink {
    fn flush(&self, cf_id: u32, cf_name: &str, memtable: &Memtable) -> Result<()> {
        self.tables.lock().push(FlushedTable {
            cf_id,
            cf_name: cf_name.to_string(),
            memtable_id: memtable.id(),
            entries: memtable.entries(),
        });
        Ok(())
    }
}

struct FlushJob {
    cf_id: u32,
    cf_name: String,
    memtables: Vec<Arc<Memtable>>,
}

impl FlushJob {
    fn ids(&self) -> Vec<u64> {
        self.memtables.iter().map(|m| m.id()).collect()
    }
}

impl DbInner {
    /// Flushes every sealed memtable not already being flushed and returns
    /// how many were flushed.
    pub(crate) fn flush_immutable_memtables(&self) -> Result<usize> {
        let jobs: Vec<FlushJob> = {
            let mut state = self.state.lock();
            state
                .cfs
                .iter_mut()
                .filter_map(|cfd| {
                    let memtables = cfd.imm_mut().pick_memtables_to_flush();
                    if memtables.is_empty() {
                        return None;
                    }
                    Some(FlushJob {
                        cf_id: cfd.id(),
                        cf_name: cfd.name().to_string(),
                        memtables,
                    })
                })
                .collect()
        };
        if jobs.is_empty() {
            return Ok(0);
        }

        let sink = self.config.flush_sink.clone();
        let mut first_error = None;
        let mut done = Vec::with_capacity(jobs.len());
        let mut failed = Vec::new();
        for job in jobs {
            let result = job
                .memtables
                .iter()
                .filter(|m| !m.is_empty())
                .try_for_each(|m| sink.flush(job.cf_id, &job.cf_name, m));
            match result {
                Ok(()) => done.push(job),
                Err(e) => {
                    tracing::error!(
                        cf = job.cf_name.as_str(),
                        error = %e,
                        "Memtable flush failed"
                    );
                    first_error.get_or_insert(e);
                    failed.push(job);
                }
            }
        }

        let flushed: usize = done.iter().map(|job| job.memtables.len()).sum();
        let obsolete = {
            let mut state = self.state.lock();
            for job in &failed {
                if let Some(cfd) = state.cfs.get_mut(job.cf_id) {
                    cfd.imm_mut().rollback_flush(&job.ids());
                }
            }
            for job in &done {
                // Dropped families have nothing left to account for.
                let Some(cfd) = state.cfs.get_mut(job.cf_id) else {
                    continue;
                };
                cfd.imm_mut().remove_flushed(&job.ids());
                if let Some(next_log) = job.memtables.last().map(|m| m.next_log_number()) {
                    cfd.set_log_number(next_log);
                }
                tracing::info!(
                    cf = job.cf_name.as_str(),
                    memtables = job.memtables.len(),
                    log_number = cfd.log_number(),
                    "Flushed memtables"
                );
            }
            if let Some(e) = &first_error {
                if e.is_io() {
                    self.set_bg_error(&mut state, e.clone());
                }
            }
            self.recalculate_write_stall(&mut state);
            let obsolete = self.find_obsolete_wals(&mut state);
            self.bg_cv.notify_all();
            self.unlock_and_free_logs(state);
            obsolete
        };
        // Dropping the flushed memtables returns their memory to the budget.
        drop(done);
        self.delete_wal_files(&obsolete);

        match first_error {
            Some(e) => Err(e),
            None => Ok(flushed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memtable::ValueKind;

    #[test]
    fn test_memory_sink_captures_entries() -> Result<()> {
        let sink = MemorySink::new();
        let mem = Memtable::new(7, 1, 1 << 20, None);
        mem.add(5, ValueKind::Value, b"apple", b"red", None)?;
        mem.add(6, ValueKind::Deletion, b"pear", b"", None)?;

        sink.flush(0, "default", &mem)?;

        let tables = sink.tables();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].memtable_id, 7);
        assert_eq!(tables[0].cf_name, "default");
        assert_eq!(tables[0].entries.len(), 2);
        assert_eq!(tables[0].entries[0].0.user_key, b"apple");
        Ok(())
    }

    #[test]
    fn test_discard_sink_supports_range_deletion() {
        assert!(DiscardSink.supports_range_deletion());
    }
}
