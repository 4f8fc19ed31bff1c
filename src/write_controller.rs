//! Write-rate control: hard stops, delays and the low-priority limiter.
//!
//! Stall conditions are expressed as tokens. While any [`StopWriteToken`] is
//! alive writers block (or fail fast); while any [`DelayWriteToken`] is alive
//! writers are paced at the delayed write rate. Dropping a token lifts its
//! condition.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

const MICROS_PER_SECOND: u64 = 1_000_000;
const REFILL_INTERVAL_MICROS: u64 = 1024;
const MIN_DELAY_MICROS: u64 = 1000;

#[derive(Debug)]
struct Counters {
    stopped: AtomicUsize,
    delayed: AtomicUsize,
    compaction_pressure: AtomicUsize,
}

#[derive(Debug)]
struct Credit {
    bytes: u64,
    /// Micros since `epoch` at which the next refill is due; zero before the
    /// first delayed write.
    next_refill: u64,
}

#[derive(Debug)]
pub struct WriteController {
    counters: Arc<Counters>,
    delayed_write_rate: AtomicU64,
    max_delayed_write_rate: u64,
    credit: Mutex<Credit>,
    epoch: Instant,
    low_pri_rate_limiter: RateLimiter,
}

impl WriteController {
    pub fn new(delayed_write_rate: u64, low_pri_write_rate: u64) -> Self {
        let rate = delayed_write_rate.max(1);
        Self {
            counters: Arc::new(Counters {
                stopped: AtomicUsize::new(0),
                delayed: AtomicUsize::new(0),
                compaction_pressure: AtomicUsize::new(0),
            }),
            delayed_write_rate: AtomicU64::new(rate),
            max_delayed_write_rate: rate,
            credit: Mutex::new(Credit {
                bytes: 0,
                next_refill: 0,
            }),
            epoch: Instant::now(),
            low_pri_rate_limiter: RateLimiter::new(low_pri_write_rate),
        }
    }

    pub fn get_stop_token(&self) -> StopWriteToken {
        self.counters.stopped.fetch_add(1, Ordering::AcqRel);
        StopWriteToken {
            counters: self.counters.clone(),
        }
    }

    pub fn get_delay_token(&self, delayed_write_rate: u64) -> DelayWriteToken {
        if self.counters.delayed.fetch_add(1, Ordering::AcqRel) == 0 {
            // Starting a new delay period resets the credit.
            let mut credit = self.credit.lock();
            credit.bytes = 0;
            credit.next_refill = 0;
        }
        self.set_delayed_write_rate(delayed_write_rate);
        DelayWriteToken {
            counters: self.counters.clone(),
        }
    }

    pub fn get_compaction_pressure_token(&self) -> CompactionPressureToken {
        self.counters
            .compaction_pressure
            .fetch_add(1, Ordering::AcqRel);
        CompactionPressureToken {
            counters: self.counters.clone(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.counters.stopped.load(Ordering::Acquire) > 0
    }

    /// Writers must pace themselves while the controller is stopped or delayed.
    pub fn needs_delay(&self) -> bool {
        self.counters.delayed.load(Ordering::Acquire) > 0
    }

    pub fn needs_speedup_compaction(&self) -> bool {
        self.is_stopped()
            || self.needs_delay()
            || self.counters.compaction_pressure.load(Ordering::Acquire) > 0
    }

    pub fn delayed_write_rate(&self) -> u64 {
        self.delayed_write_rate.load(Ordering::Relaxed)
    }

    pub fn set_delayed_write_rate(&self, rate: u64) {
        let rate = rate.clamp(1, self.max_delayed_write_rate);
        self.delayed_write_rate.store(rate, Ordering::Relaxed);
    }

    pub fn low_pri_rate_limiter(&self) -> &RateLimiter {
        &self.low_pri_rate_limiter
    }

    fn now_micros(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// How long a write of `num_bytes` must sleep under the current delay.
    ///
    /// Zero when writes are not delayed, or when they are stopped (stops are
    /// waited out separately).
    pub fn get_delay(&self, num_bytes: u64) -> Duration {
        if self.is_stopped() || !self.needs_delay() {
            return Duration::ZERO;
        }

        let rate = self.delayed_write_rate();
        let mut credit = self.credit.lock();
        if credit.bytes >= num_bytes {
            credit.bytes -= num_bytes;
            return Duration::ZERO;
        }

        let now = self.now_micros();
        if credit.next_refill == 0 {
            credit.next_refill = now;
        }
        if credit.next_refill <= now {
            let elapsed = now - credit.next_refill + REFILL_INTERVAL_MICROS;
            credit.bytes += (elapsed as f64 / MICROS_PER_SECOND as f64 * rate as f64).ceil() as u64;
            credit.next_refill = now + REFILL_INTERVAL_MICROS;
            if credit.bytes >= num_bytes {
                credit.bytes -= num_bytes;
                return Duration::ZERO;
            }
        }

        let over_budget = num_bytes - credit.bytes;
        let needed = (over_budget as f64 / rate as f64 * MICROS_PER_SECOND as f64) as u64;
        credit.bytes = 0;
        credit.next_refill += needed;
        let delay = credit.next_refill.saturating_sub(now).max(MIN_DELAY_MICROS);
        Duration::from_micros(delay)
    }
}

/// Writes are stopped while this token is alive.
#[derive(Debug)]
pub struct StopWriteToken {
    counters: Arc<Counters>,
}

impl Drop for StopWriteToken {
    fn drop(&mut self) {
        self.counters.stopped.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Writes are paced while this token is alive.
#[derive(Debug)]
pub struct DelayWriteToken {
    counters: Arc<Counters>,
}

impl Drop for DelayWriteToken {
    fn drop(&mut self) {
        self.counters.delayed.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug)]
pub struct CompactionPressureToken {
    counters: Arc<Counters>,
}

impl Drop for CompactionPressureToken {
    fn drop(&mut self) {
        self.counters
            .compaction_pressure
            .fetch_sub(1, Ordering::AcqRel);
    }
}

/// Token bucket limiting the byte rate of low-priority writes.
///
/// Requests larger than the available tokens run the bucket into debt and
/// sleep until the debt is repaid, so callers are paced at `bytes_per_sec`
/// on average.
#[derive(Debug)]
pub struct RateLimiter {
    bytes_per_sec: u64,
    state: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    available: i64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec: bytes_per_sec.max(1),
            state: Mutex::new(Bucket {
                available: 0,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec
    }

    /// Time a caller must wait before `bytes` may be written. Charges the
    /// bucket immediately.
    pub fn reserve(&self, bytes: u64) -> Duration {
        let mut bucket = self.state.lock();
        let now = Instant::now();
        let refill = now.duration_since(bucket.last_refill).as_secs_f64() * self.bytes_per_sec as f64;
        // At most one second of burst.
        bucket.available = (bucket.available + refill as i64).min(self.bytes_per_sec as i64);
        bucket.last_refill = now;
        bucket.available -= bytes as i64;

        if bucket.available >= 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.available as f64 / self.bytes_per_sec as f64)
        }
    }

    /// Blocks until `bytes` may be written.
    pub fn request(&self, bytes: u64) {
        let wait = self.reserve(bytes);
        if !wait.is_zero() {
            std::thread::sleep(wait);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_lift_on_drop() {
        let controller = WriteController::new(1 << 20, 1 << 20);
        assert!(!controller.is_stopped());

        let stop = controller.get_stop_token();
        let stop2 = controller.get_stop_token();
        assert!(controller.is_stopped());
        drop(stop);
        assert!(controller.is_stopped());
        drop(stop2);
        assert!(!controller.is_stopped());

        let delay = controller.get_delay_token(1 << 10);
        assert!(controller.needs_delay());
        assert!(controller.needs_speedup_compaction());
        drop(delay);
        assert!(!controller.needs_delay());
        assert!(!controller.needs_speedup_compaction());
    }

    #[test]
    fn test_get_delay() {
        let controller = WriteController::new(1 << 20, 1 << 20);
        assert_eq!(controller.get_delay(1 << 20), Duration::ZERO);

        let _delay = controller.get_delay_token(1000);
        assert_eq!(controller.delayed_write_rate(), 1000);
        // A write worth two seconds at the delayed rate sleeps for a while.
        let delay = controller.get_delay(2000);
        assert!(delay >= Duration::from_millis(1000), "delay was {:?}", delay);

        // Stops are handled separately and report no delay.
        let _stop = controller.get_stop_token();
        assert_eq!(controller.get_delay(2000), Duration::ZERO);
    }

    #[test]
    fn test_delay_rate_capped_at_configured_maximum() {
        let controller = WriteController::new(4096, 1 << 20);
        let _delay = controller.get_delay_token(1 << 30);
        assert_eq!(controller.delayed_write_rate(), 4096);
    }

    #[test]
    fn test_rate_limiter_paces_after_burst() {
        let limiter = RateLimiter::new(1000);
        assert!(limiter.reserve(500) > Duration::ZERO);
        let wait = limiter.reserve(1000);
        assert!(wait >= Duration::from_millis(1400), "wait was {:?}", wait);
    }
}
