//! Underlying allocator: the thin layer between the pools and the driver
//!
//! Tracks how many bytes are currently held from the driver, enforces the
//! optional byte limit, and records driver-call statistics. Out-of-memory
//! (from the driver or from the limit) is reported as `Ok(None)` rather
//! than an error so the fallback ladder can make deterministic retry
//! decisions; every other driver failure propagates.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::driver::{DeviceBuffer, DeviceDriver};
use crate::error::{DriverError, PoolResult};
use crate::stats::DriverStats;

/// Byte-accounted gateway to the raw driver.
pub struct DeviceAllocator {
    driver: Arc<dyn DeviceDriver>,
    /// Bytes currently held from the driver
    usage: AtomicUsize,
    /// Optional cap on `usage`
    limit: Option<usize>,
    stats: DriverStats,
}

impl DeviceAllocator {
    /// Create an allocator over `driver`, optionally capped at `limit` bytes.
    pub fn new(driver: Arc<dyn DeviceDriver>, limit: Option<usize>) -> Self {
        if let Some(limit) = limit {
            tracing::info!("device memory limit set: {} bytes", limit);
        }
        DeviceAllocator {
            driver,
            usage: AtomicUsize::new(0),
            limit,
            stats: DriverStats::new(),
        }
    }

    /// Allocate `nbytes` from the driver.
    ///
    /// Returns `Ok(None)` when the limit would be exceeded or the driver
    /// reports out-of-memory. Non-OOM driver failures propagate.
    pub fn actual_alloc(&self, nbytes: usize) -> PoolResult<Option<DeviceBuffer>> {
        if !self.reserve(nbytes) {
            tracing::debug!(
                "limit would be exceeded: {} in use, {} requested, limit {}",
                self.usage(),
                nbytes,
                self.limit.unwrap_or(0)
            );
            return Ok(None);
        }

        let result = self.stats.alloc_time.time(|| self.driver.device_alloc(nbytes));
        match result {
            Ok(buf) => {
                debug_assert_eq!(buf.size(), nbytes);
                self.stats.alloc.record(nbytes);
                tracing::debug!("driver alloc: {} bytes at 0x{:x}", nbytes, buf.addr());
                Ok(Some(buf))
            }
            Err(DriverError::OutOfMemory) => {
                self.release(nbytes);
                tracing::debug!("driver OOM for {} bytes", nbytes);
                Ok(None)
            }
            Err(err @ DriverError::Fault(_)) => {
                self.release(nbytes);
                Err(err.into())
            }
        }
    }

    /// Return a buffer to the driver.
    ///
    /// Buffers whose device context is gone are dropped silently (the
    /// owning context already released them at teardown). Usage accounting
    /// and stats are updated either way. Driver faults during free are
    /// logged, not propagated: free paths run from application `free` calls
    /// and from reclaim inside `alloc`, and neither may lose the
    /// bookkeeping update that keeps `usage` truthful.
    pub fn actual_free(&self, buf: &DeviceBuffer) {
        if self.driver.is_context_valid(buf) {
            let result = self.stats.free_time.time(|| self.driver.device_free(buf));
            if let Err(err) = result {
                tracing::error!(
                    "driver free failed for {} bytes at 0x{:x}: {}",
                    buf.size(),
                    buf.addr(),
                    err
                );
            } else {
                tracing::debug!("driver free: {} bytes at 0x{:x}", buf.size(), buf.addr());
            }
        } else {
            tracing::debug!(
                "dropping buffer at 0x{:x}: device context no longer valid",
                buf.addr()
            );
        }

        self.stats.free.record(buf.size());
        self.release(buf.size());
    }

    /// Bytes currently held from the driver.
    pub fn usage(&self) -> usize {
        self.usage.load(Ordering::Relaxed)
    }

    /// The configured byte limit, if any.
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Driver-call statistics.
    pub fn stats(&self) -> &DriverStats {
        &self.stats
    }

    /// Atomically reserve `nbytes` of budget, honouring the limit.
    fn reserve(&self, nbytes: usize) -> bool {
        match self.limit {
            None => {
                self.usage.fetch_add(nbytes, Ordering::Relaxed);
                true
            }
            Some(limit) => self
                .usage
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |usage| {
                    usage.checked_add(nbytes).filter(|&total| total <= limit)
                })
                .is_ok(),
        }
    }

    fn release(&self, nbytes: usize) {
        let prev = self.usage.fetch_sub(nbytes, Ordering::Relaxed);
        debug_assert!(prev >= nbytes, "usage underflow: {} - {}", prev, nbytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Driver stub minting sequential addresses from a fake address space.
    struct StubDriver {
        next_addr: Mutex<usize>,
        fail_after: Option<usize>,
        allocs: AtomicUsize,
        frees: AtomicUsize,
        context_valid: bool,
    }

    impl StubDriver {
        fn new() -> Self {
            StubDriver {
                next_addr: Mutex::new(0x1000),
                fail_after: None,
                allocs: AtomicUsize::new(0),
                frees: AtomicUsize::new(0),
                context_valid: true,
            }
        }

        fn with_capacity_allocs(mut self, n: usize) -> Self {
            self.fail_after = Some(n);
            self
        }

        fn with_dead_context(mut self) -> Self {
            self.context_valid = false;
            self
        }
    }

    impl DeviceDriver for StubDriver {
        fn device_alloc(&self, nbytes: usize) -> Result<DeviceBuffer, DriverError> {
            if let Some(max) = self.fail_after {
                if self.allocs.load(Ordering::SeqCst) >= max {
                    return Err(DriverError::OutOfMemory);
                }
            }
            self.allocs.fetch_add(1, Ordering::SeqCst);
            let mut next = self.next_addr.lock();
            let addr = *next;
            *next += nbytes.max(1);
            Ok(DeviceBuffer::from_raw_parts(addr, nbytes, 0))
        }

        fn device_free(&self, _buf: &DeviceBuffer) -> Result<(), DriverError> {
            self.frees.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_context_valid(&self, _buf: &DeviceBuffer) -> bool {
            self.context_valid
        }
    }

    #[test]
    fn test_alloc_tracks_usage() {
        let alloc = DeviceAllocator::new(Arc::new(StubDriver::new()), None);
        let a = alloc.actual_alloc(1024).unwrap().unwrap();
        let b = alloc.actual_alloc(2048).unwrap().unwrap();
        assert_eq!(alloc.usage(), 3072);
        assert_eq!(alloc.stats().alloc.count(), 2);

        alloc.actual_free(&a);
        alloc.actual_free(&b);
        assert_eq!(alloc.usage(), 0);
        assert_eq!(alloc.stats().free.count(), 2);
        assert_eq!(alloc.stats().free.bytes(), 3072);
    }

    #[test]
    fn test_limit_enforced_without_driver_call() {
        let driver = Arc::new(StubDriver::new());
        let alloc = DeviceAllocator::new(driver.clone(), Some(1 << 20));
        assert!(alloc.actual_alloc(2 << 20).unwrap().is_none());
        // Driver never saw the request
        assert_eq!(driver.allocs.load(Ordering::SeqCst), 0);
        assert_eq!(alloc.usage(), 0);
    }

    #[test]
    fn test_limit_allows_up_to_bound() {
        let alloc = DeviceAllocator::new(Arc::new(StubDriver::new()), Some(4096));
        let a = alloc.actual_alloc(4096).unwrap();
        assert!(a.is_some());
        assert!(alloc.actual_alloc(1).unwrap().is_none());
        alloc.actual_free(&a.unwrap());
        assert!(alloc.actual_alloc(1).unwrap().is_some());
    }

    #[test]
    fn test_driver_oom_is_none_and_usage_restored() {
        let alloc =
            DeviceAllocator::new(Arc::new(StubDriver::new().with_capacity_allocs(1)), None);
        assert!(alloc.actual_alloc(512).unwrap().is_some());
        assert!(alloc.actual_alloc(512).unwrap().is_none());
        assert_eq!(alloc.usage(), 512);
    }

    #[test]
    fn test_context_invalid_free_skips_driver_but_updates_usage() {
        let driver = Arc::new(StubDriver::new().with_dead_context());
        let alloc = DeviceAllocator::new(driver.clone(), None);
        let buf = alloc.actual_alloc(256).unwrap().unwrap();
        alloc.actual_free(&buf);
        assert_eq!(driver.frees.load(Ordering::SeqCst), 0);
        assert_eq!(alloc.usage(), 0);
        assert_eq!(alloc.stats().free.count(), 1);
    }
}
