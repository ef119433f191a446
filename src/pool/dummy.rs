//! Passthrough pool
//!
//! No caching: every allocation goes straight to the driver (with
//! GC-assisted retries) and every free returns the buffer immediately.
//! Exists as a baseline and for debugging the surrounding system.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::driver::{DeviceAllocator, DeviceBuffer};
use crate::error::{PoolError, PoolResult};
use crate::pool::{run_ladder, GcHook, MemoryPool};

/// Pool that forwards every request to the driver.
pub struct DummyPool {
    allocator: Arc<DeviceAllocator>,
    gc: Option<GcHook>,
    /// Live handles by address, for double-free detection and the deinit
    /// assertion.
    allocated: Mutex<HashMap<usize, DeviceBuffer>>,
    used: AtomicUsize,
}

impl DummyPool {
    pub fn new(allocator: Arc<DeviceAllocator>) -> Self {
        DummyPool {
            allocator,
            gc: None,
            allocated: Mutex::new(HashMap::new()),
            used: AtomicUsize::new(0),
        }
    }

    /// Install the host GC hint invoked by the fallback ladder.
    pub fn with_gc_hook(mut self, gc: GcHook) -> Self {
        self.gc = Some(gc);
        self
    }
}

impl MemoryPool for DummyPool {
    fn alloc(&self, nbytes: usize) -> PoolResult<DeviceBuffer> {
        // Ladder with only the driver sub-step: there is no free-list to
        // scan and nothing to reclaim.
        let buf = run_ladder(self.gc.as_ref(), |_phase| self.allocator.actual_alloc(nbytes))?;

        match buf {
            Some(buf) => {
                self.allocated.lock().insert(buf.addr(), buf.clone());
                self.used.fetch_add(buf.size(), Ordering::Relaxed);
                Ok(buf)
            }
            None => Err(PoolError::OutOfMemory {
                requested: nbytes,
                used: self.used_bytes(),
                cached: 0,
            }),
        }
    }

    fn free(&self, buf: DeviceBuffer) {
        let owned = self.allocated.lock().remove(&buf.addr());
        let owned = owned.unwrap_or_else(|| {
            panic!(
                "freed a handle this pool did not issue (or double-free) at 0x{:x}",
                buf.addr()
            )
        });
        self.used.fetch_sub(owned.size(), Ordering::Relaxed);
        self.allocator.actual_free(&owned);
    }

    fn used_bytes(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    fn cached_bytes(&self) -> usize {
        0
    }

    fn reclaim(&self, _nbytes: usize) -> usize {
        0
    }

    fn deinit(&self) {
        let allocated = self.allocated.lock();
        assert!(
            allocated.is_empty(),
            "deinit with {} outstanding handles",
            allocated.len()
        );
    }

    fn name(&self) -> &'static str {
        "dummy"
    }
}
