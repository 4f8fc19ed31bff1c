use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// Column families whose mutable memtable filled up during an insert.
///
/// Inserters push work here without holding the database mutex; the next
/// write leader drains it and switches the affected memtables.
#[derive(Debug, Default)]
pub struct FlushScheduler {
    queue: Mutex<VecDeque<u32>>,
    has_work: AtomicBool,
}

impl FlushScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule_work(&self, cf: u32) {
        let mut queue = self.queue.lock();
        if !queue.contains(&cf) {
            queue.push_back(cf);
        }
        self.has_work.store(true, Ordering::Release);
    }

    pub fn is_empty(&self) -> bool {
        !self.has_work.load(Ordering::Acquire)
    }

    pub fn take_next(&self) -> Option<u32> {
        let mut queue = self.queue.lock();
        let next = queue.pop_front();
        if queue.is_empty() {
            self.has_work.store(false, Ordering::Release);
        }
        next
    }

    pub fn clear(&self) {
        self.queue.lock().clear();
        self.has_work.store(false, Ordering::Release);
    }
}
