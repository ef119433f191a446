//! Common test fixtures for pool testing
//!
//! Provides a host-side mock driver so the pool suites run without a GPU.
//! The mock hands out non-overlapping address ranges, enforces an optional
//! capacity, and asserts that every free matches a buffer it minted - a
//! split block leaked to the driver fails loudly here.

// Each test binary uses its own subset of these fixtures.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use hippool::{DeviceBuffer, DeviceDriver, DriverError};

pub const KIB: usize = 1024;
pub const MIB: usize = 1024 * 1024;

/// Mock device driver over a fake address space.
pub struct MockDriver {
    state: Mutex<MockState>,
    capacity: Option<usize>,
    pub alloc_count: AtomicU64,
    pub free_count: AtomicU64,
}

struct MockState {
    next_addr: usize,
    /// Outstanding base buffers by address -> size.
    outstanding: HashMap<usize, usize>,
    outstanding_bytes: usize,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Self::with_capacity_opt(None)
    }

    /// Driver that reports OOM once more than `capacity` bytes are live.
    pub fn with_capacity(capacity: usize) -> Arc<Self> {
        Self::with_capacity_opt(Some(capacity))
    }

    fn with_capacity_opt(capacity: Option<usize>) -> Arc<Self> {
        Arc::new(MockDriver {
            state: Mutex::new(MockState {
                next_addr: 0x1000_0000,
                outstanding: HashMap::new(),
                outstanding_bytes: 0,
            }),
            capacity,
            alloc_count: AtomicU64::new(0),
            free_count: AtomicU64::new(0),
        })
    }

    pub fn allocs(&self) -> u64 {
        self.alloc_count.load(Ordering::SeqCst)
    }

    pub fn frees(&self) -> u64 {
        self.free_count.load(Ordering::SeqCst)
    }

    /// Bytes currently held by callers (conservation oracle).
    pub fn outstanding_bytes(&self) -> usize {
        self.state.lock().outstanding_bytes
    }

    /// Number of outstanding base buffers.
    pub fn outstanding_buffers(&self) -> usize {
        self.state.lock().outstanding.len()
    }
}

impl DeviceDriver for MockDriver {
    fn device_alloc(&self, nbytes: usize) -> Result<DeviceBuffer, DriverError> {
        let mut state = self.state.lock();
        if let Some(capacity) = self.capacity {
            if state.outstanding_bytes + nbytes > capacity {
                return Err(DriverError::OutOfMemory);
            }
        }
        let addr = state.next_addr;
        // Leave a gap so adjacent base buffers are never contiguous; block
        // chains must stay within one base.
        state.next_addr += nbytes.max(1) + 0x1000;
        state.outstanding.insert(addr, nbytes);
        state.outstanding_bytes += nbytes;
        self.alloc_count.fetch_add(1, Ordering::SeqCst);
        Ok(DeviceBuffer::from_raw_parts(addr, nbytes, 0))
    }

    fn device_free(&self, buf: &DeviceBuffer) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        let size = state
            .outstanding
            .remove(&buf.addr())
            .unwrap_or_else(|| panic!("driver free of unknown buffer at 0x{:x}", buf.addr()));
        assert_eq!(
            size,
            buf.size(),
            "driver free of a partial buffer at 0x{:x}: {} of {} bytes",
            buf.addr(),
            buf.size(),
            size
        );
        state.outstanding_bytes -= size;
        self.free_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_context_valid(&self, _buf: &DeviceBuffer) -> bool {
        true
    }
}

/// Assert that no two live handles overlap.
pub fn assert_no_double_issue(handles: &[DeviceBuffer]) {
    for (i, a) in handles.iter().enumerate() {
        for b in handles.iter().skip(i + 1) {
            let disjoint = a.addr() + a.size() <= b.addr() || b.addr() + b.size() <= a.addr();
            assert!(
                disjoint,
                "handles overlap: 0x{:x}+{} and 0x{:x}+{}",
                a.addr(),
                a.size(),
                b.addr(),
                b.size()
            );
        }
    }
}
