use std::collections::VecDeque;
use std::sync::Arc;

use super::Memtable;

/// Sealed memtables of one column family, oldest first.
#[derive(Debug, Default)]
pub struct MemtableList {
    memtables: VecDeque<Arc<Memtable>>,
    /// Ids of memtables currently handed to a flush.
    flushing: Vec<u64>,
}

impl MemtableList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, memtable: Arc<Memtable>) {
        memtable.freeze();
        self.memtables.push_back(memtable);
    }

    pub fn len(&self) -> usize {
        self.memtables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memtables.is_empty()
    }

    /// Newest first, the order a lookup consults them in.
    pub fn iter_newest_first(&self) -> impl Iterator<Item = &Arc<Memtable>> {
        self.memtables.iter().rev()
    }

    /// Claims every sealed memtable not already being flushed, oldest first.
    pub fn pick_memtables_to_flush(&mut self) -> Vec<Arc<Memtable>> {
        let picked: Vec<_> = self
            .memtables
            .iter()
            .filter(|m| !self.flushing.contains(&m.id()))
            .cloned()
            .collect();
        self.flushing.extend(picked.iter().map(|m| m.id()));
        picked
    }

    /// Returns claimed memtables to the pool after a failed flush.
    pub fn rollback_flush(&mut self, ids: &[u64]) {
        self.flushing.retain(|id| !ids.contains(id));
    }

    /// Drops flushed memtables and returns the oldest WAL segment the
    /// remaining ones still need, if any.
    pub fn remove_flushed(&mut self, ids: &[u64]) -> Option<u64> {
        self.memtables.retain(|m| !ids.contains(&m.id()));
        self.flushing.retain(|id| !ids.contains(id));
        self.memtables.front().map(|m| m.log_number())
    }

    /// Smallest WAL segment referenced by a prepared section, zero when none.
    pub fn min_log_containing_prep(&self) -> u64 {
        self.memtables
            .iter()
            .map(|m| m.min_log_containing_prep())
            .filter(|&log| log != 0)
            .min()
            .unwrap_or(0)
    }

    pub fn approximate_memory_usage(&self) -> usize {
        self.memtables
            .iter()
            .map(|m| m.approximate_memory_usage())
            .sum()
    }
}
