//! Memory budget shared by the memtables of one or more engines.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

/// Tracks memtable memory against a budget.
///
/// Memory is reserved as entries are inserted, moves from "mutable" to
/// "immutable" when a memtable is sealed, and is released once the memtable
/// has been flushed. A budget of zero disables every check.
#[derive(Debug)]
pub struct WriteBufferManager {
    buffer_size: AtomicUsize,
    mutable_limit: AtomicUsize,
    memory_used: AtomicUsize,
    memory_active: AtomicUsize,
    allow_stall: bool,
    stall_active: AtomicBool,
    stall_mu: Mutex<()>,
    stall_cv: Condvar,
}

impl WriteBufferManager {
    pub fn new(buffer_size: usize, allow_stall: bool) -> Self {
        Self {
            buffer_size: AtomicUsize::new(buffer_size),
            mutable_limit: AtomicUsize::new(buffer_size * 7 / 8),
            memory_used: AtomicUsize::new(0),
            memory_active: AtomicUsize::new(0),
            allow_stall,
            stall_active: AtomicBool::new(false),
            stall_mu: Mutex::new(()),
            stall_cv: Condvar::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.buffer_size() > 0
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size.load(Ordering::Relaxed)
    }

    pub fn set_buffer_size(&self, size: usize) {
        self.buffer_size.store(size, Ordering::Relaxed);
        self.mutable_limit.store(size * 7 / 8, Ordering::Relaxed);
        self.maybe_end_write_stall();
    }

    pub fn memory_usage(&self) -> usize {
        self.memory_used.load(Ordering::Relaxed)
    }

    pub fn mutable_memtable_memory_usage(&self) -> usize {
        self.memory_active.load(Ordering::Relaxed)
    }

    /// Called as memtable entries are inserted.
    pub fn reserve_mem(&self, bytes: usize) {
        self.memory_used.fetch_add(bytes, Ordering::Relaxed);
        self.memory_active.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Called when a memtable is sealed; its memory stays charged until freed.
    pub fn schedule_free_mem(&self, bytes: usize) {
        saturating_sub(&self.memory_active, bytes);
    }

    /// Called when a sealed memtable has been flushed and dropped.
    pub fn free_mem(&self, bytes: usize) {
        saturating_sub(&self.memory_used, bytes);
        self.maybe_end_write_stall();
    }

    /// Whether some memtable should be sealed and flushed to honor the budget.
    pub fn should_flush(&self) -> bool {
        if !self.enabled() {
            return false;
        }
        if self.mutable_memtable_memory_usage() > self.mutable_limit.load(Ordering::Relaxed) {
            return true;
        }
        let buffer_size = self.buffer_size();
        self.memory_usage() >= buffer_size
            && self.mutable_memtable_memory_usage() >= buffer_size / 2
    }

    /// Whether writers must wait for memory to be released.
    pub fn should_stall(&self) -> bool {
        if !self.allow_stall || !self.enabled() {
            return false;
        }
        self.stall_active.load(Ordering::Relaxed) || self.is_stall_threshold_exceeded()
    }

    fn is_stall_threshold_exceeded(&self) -> bool {
        self.memory_usage() >= self.buffer_size()
    }

    /// Blocks until memory usage drops below the budget.
    pub fn wait_for_stall_end(&self) {
        let mut guard = self.stall_mu.lock();
        self.stall_active.store(true, Ordering::Relaxed);
        tracing::info!(
            memory_usage = self.memory_usage(),
            buffer_size = self.buffer_size(),
            "Write stalled on shared write buffer budget"
        );
        while self.enabled() && self.is_stall_threshold_exceeded() {
            self.stall_cv.wait(&mut guard);
        }
        self.stall_active.store(false, Ordering::Relaxed);
    }

    fn maybe_end_write_stall(&self) {
        if !self.is_stall_threshold_exceeded() || !self.enabled() {
            let _guard = self.stall_mu.lock();
            self.stall_active.store(false, Ordering::Relaxed);
            self.stall_cv.notify_all();
        }
    }
}

fn saturating_sub(counter: &AtomicUsize, bytes: usize) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(current.saturating_sub(bytes))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_disabled_manager_never_flushes() {
        let wbm = WriteBufferManager::new(0, true);
        wbm.reserve_mem(1 << 30);
        assert!(!wbm.should_flush());
        assert!(!wbm.should_stall());
    }

    #[test]
    fn test_should_flush_thresholds() {
        let wbm = WriteBufferManager::new(800, false);
        wbm.reserve_mem(700);
        assert!(!wbm.should_flush());

        // Past 7/8 of the budget in mutable memory.
        wbm.reserve_mem(1);
        assert!(wbm.should_flush());

        // Sealing moves memory out of the mutable share.
        wbm.schedule_free_mem(701);
        assert!(!wbm.should_flush());
        assert_eq!(wbm.memory_usage(), 701);

        // Over budget with at least half of it mutable.
        wbm.reserve_mem(400);
        assert!(wbm.should_flush());
    }

    #[test]
    fn test_stall_released_by_free() {
        let wbm = Arc::new(WriteBufferManager::new(100, true));
        wbm.reserve_mem(150);
        assert!(wbm.should_stall());

        let waiter = {
            let wbm = wbm.clone();
            thread::spawn(move || wbm.wait_for_stall_end())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        wbm.schedule_free_mem(150);
        wbm.free_mem(150);
        waiter.join().expect("Waiter panicked");
        assert!(!wbm.should_stall());
    }
}
