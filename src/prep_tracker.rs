use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

/// WAL segments that hold prepared sections whose commit or rollback has
/// not reached a memtable yet. Such segments must outlive any flush.
#[derive(Debug, Default)]
pub struct PrepTracker {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    /// Prepared sections per segment.
    prepared: BTreeMap<u64, usize>,
    /// Sections per segment that have since been decided.
    completed: HashMap<u64, usize>,
}

impl PrepTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_log_containing_prep(&self, log: u64) {
        debug_assert_ne!(log, 0);
        *self.inner.lock().prepared.entry(log).or_insert(0) += 1;
    }

    pub fn mark_prep_section_completed(&self, log: u64) {
        debug_assert_ne!(log, 0);
        *self.inner.lock().completed.entry(log).or_insert(0) += 1;
    }

    /// Oldest segment with an undecided prepared section, zero when none.
    pub fn min_log_with_outstanding_prep(&self) -> u64 {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        while let Some((&log, &prepared)) = inner.prepared.iter().next() {
            let done = inner.completed.get(&log).copied().unwrap_or(0);
            if done < prepared {
                return log;
            }
            inner.prepared.remove(&log);
            inner.completed.remove(&log);
        }
        0
    }
}
