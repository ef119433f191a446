//! Allocation statistics and timing
//!
//! Lock-free counters for pool requests and driver calls, plus a named-span
//! timer for the hot paths. All updates use atomic operations so the stats
//! can be read from any thread without taking the pool lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A count/bytes pair for one operation kind (allocs or frees).
#[derive(Debug, Default)]
pub struct OpCounter {
    count: AtomicU64,
    bytes: AtomicU64,
}

impl OpCounter {
    /// Record one operation of `nbytes`.
    pub fn record(&self, nbytes: usize) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(nbytes as u64, Ordering::Relaxed);
    }

    /// Number of operations recorded.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Total bytes recorded.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Accumulating timer for a named span.
///
/// Wraps `std::time::Instant` measurements and accumulates them, so the
/// total time spent inside a hot path (e.g. every `alloc` call) can be
/// reported at process exit. Use [`SpanTimer::scoped`] for drop-based
/// timing of a block.
#[derive(Debug)]
pub struct SpanTimer {
    name: &'static str,
    calls: AtomicU64,
    elapsed_ns: AtomicU64,
}

impl SpanTimer {
    /// Create a new timer for the named span
    pub const fn new(name: &'static str) -> Self {
        SpanTimer {
            name,
            calls: AtomicU64::new(0),
            elapsed_ns: AtomicU64::new(0),
        }
    }

    /// Get the name of the span being timed
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Start a scoped measurement; elapsed time is accumulated on drop.
    pub fn scoped(&self) -> ScopedSpan<'_> {
        ScopedSpan {
            timer: self,
            start: Instant::now(),
        }
    }

    /// Time a closure, accumulating its elapsed time.
    pub fn time<T>(&self, f: impl FnOnce() -> T) -> T {
        let _span = self.scoped();
        f()
    }

    /// Number of completed measurements.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Total accumulated time in milliseconds.
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed_ns.load(Ordering::Relaxed) as f64 / 1.0e6
    }

    fn accumulate(&self, ns: u64) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.elapsed_ns.fetch_add(ns, Ordering::Relaxed);
    }
}

/// Scoped span measurement that accumulates into its [`SpanTimer`] when dropped
#[derive(Debug)]
pub struct ScopedSpan<'a> {
    timer: &'a SpanTimer,
    start: Instant,
}

impl Drop for ScopedSpan<'_> {
    fn drop(&mut self) {
        let ns = self.start.elapsed().as_nanos() as u64;
        self.timer.accumulate(ns);
    }
}

/// Counters for the pool-facing surface (application requests).
#[derive(Debug)]
pub struct PoolStats {
    /// Application alloc requests
    pub alloc: OpCounter,
    /// Application free requests
    pub free: OpCounter,
    /// Time spent inside pool alloc
    pub alloc_time: SpanTimer,
    /// Time spent inside pool free
    pub free_time: SpanTimer,
}

impl PoolStats {
    pub fn new() -> Self {
        PoolStats {
            alloc: OpCounter::default(),
            free: OpCounter::default(),
            alloc_time: SpanTimer::new("pool_alloc"),
            free_time: SpanTimer::new("pool_free"),
        }
    }
}

impl Default for PoolStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters for the driver-facing surface (actual device calls).
#[derive(Debug)]
pub struct DriverStats {
    /// Driver allocations that succeeded
    pub alloc: OpCounter,
    /// Driver frees issued
    pub free: OpCounter,
    /// Time spent inside device_alloc
    pub alloc_time: SpanTimer,
    /// Time spent inside device_free
    pub free_time: SpanTimer,
}

impl DriverStats {
    pub fn new() -> Self {
        DriverStats {
            alloc: OpCounter::default(),
            free: OpCounter::default(),
            alloc_time: SpanTimer::new("device_alloc"),
            free_time: SpanTimer::new("device_free"),
        }
    }
}

impl Default for DriverStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_counter_accumulates() {
        let counter = OpCounter::default();
        counter.record(1024);
        counter.record(2048);
        assert_eq!(counter.count(), 2);
        assert_eq!(counter.bytes(), 3072);
    }

    #[test]
    fn test_span_timer_accumulates() {
        let timer = SpanTimer::new("test_span");
        assert_eq!(timer.name(), "test_span");
        assert_eq!(timer.calls(), 0);

        timer.time(|| std::thread::sleep(std::time::Duration::from_millis(5)));
        timer.time(|| std::thread::sleep(std::time::Duration::from_millis(5)));

        assert_eq!(timer.calls(), 2);
        let elapsed = timer.elapsed_ms();
        assert!(elapsed >= 10.0, "expected at least 10ms, got {:.2} ms", elapsed);
        assert!(elapsed < 1000.0, "expected less than 1000ms, got {:.2} ms", elapsed);
    }

    #[test]
    fn test_span_timer_returns_closure_value() {
        let timer = SpanTimer::new("value_span");
        let value = timer.time(|| 41 + 1);
        assert_eq!(value, 42);
        assert_eq!(timer.calls(), 1);
    }

    #[test]
    fn test_scoped_span_records_on_drop() {
        let timer = SpanTimer::new("scoped");
        {
            let _span = timer.scoped();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert_eq!(timer.calls(), 1);
        assert!(timer.elapsed_ms() >= 2.0);
    }
}
