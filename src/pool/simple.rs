//! Linear free-list pool
//!
//! Caches whole driver buffers in a single ordered free-list keyed by
//! `(size, address)`. A buffer keeps the exact size the driver gave it;
//! there is no splitting or merging. Reuse is size-bounded so a small
//! request cannot hoard a wildly oversized buffer.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::driver::{DeviceAllocator, DeviceBuffer};
use crate::error::{PoolError, PoolResult};
use crate::pool::{run_ladder, GcHook, MemoryPool, SMALL_MAX};

/// Free-list state guarded by the pool lock.
#[derive(Default)]
struct FreeList {
    /// AVAILABLE buffers ordered by `(size, addr)`: a range scan from the
    /// requested size upward visits the smallest satisfying buffer first,
    /// and the address keeps keys unique despite equal sizes.
    available: BTreeMap<(usize, usize), DeviceBuffer>,
}

/// Pool of whole driver buffers with size-bounded reuse.
pub struct SimplePool {
    allocator: Arc<DeviceAllocator>,
    gc: Option<GcHook>,
    free_list: Mutex<FreeList>,
    /// Frees that arrived while the free-list lock was held by a scan or
    /// reclaim; drained by the next lock holder. Keeps `free` from ever
    /// blocking on a scan.
    staged: Mutex<Vec<DeviceBuffer>>,
    /// Live handles by address.
    allocated: Mutex<HashMap<usize, DeviceBuffer>>,
    used: AtomicUsize,
    cached: AtomicUsize,
}

impl SimplePool {
    pub fn new(allocator: Arc<DeviceAllocator>) -> Self {
        SimplePool {
            allocator,
            gc: None,
            free_list: Mutex::new(FreeList::default()),
            staged: Mutex::new(Vec::new()),
            allocated: Mutex::new(HashMap::new()),
            used: AtomicUsize::new(0),
            cached: AtomicUsize::new(0),
        }
    }

    /// Install the host GC hint invoked by the fallback ladder.
    pub fn with_gc_hook(mut self, gc: GcHook) -> Self {
        self.gc = Some(gc);
        self
    }

    /// Whether a cached buffer of size `have` may serve a request for
    /// `want` bytes.
    ///
    /// Small buffers (<= 1 MiB) are recycled for any fitting request: they
    /// rarely waste much, and refusing them shreds the driver with tiny
    /// allocations. A bigger buffer is only reused while it stays under
    /// four times the request, or a single request could hoard hundreds of
    /// megabytes.
    fn reusable(want: usize, have: usize) -> bool {
        debug_assert!(have >= want);
        have <= SMALL_MAX || have < 4 * want
    }

    /// Move staged frees into the free-list. Caller holds the pool lock.
    fn drain_staged(&self, free_list: &mut FreeList) {
        let staged: Vec<DeviceBuffer> = std::mem::take(&mut *self.staged.lock());
        for buf in staged {
            free_list.available.insert((buf.size(), buf.addr()), buf);
        }
    }

    /// Take the smallest cached buffer satisfying `nbytes`, if reuse policy
    /// allows it.
    fn scan(&self, nbytes: usize) -> Option<DeviceBuffer> {
        let mut free_list = self.free_list.lock();
        self.drain_staged(&mut free_list);

        // The first entry at or above the requested size is the smallest
        // candidate; if it fails the oversize bound, every later (larger)
        // one fails it too.
        let key = *free_list.available.range((nbytes, 0)..).next().map(|(k, _)| k)?;
        if !Self::reusable(nbytes, key.0) {
            return None;
        }
        let buf = free_list.available.remove(&key).expect("scanned key vanished");
        self.cached.fetch_sub(buf.size(), Ordering::Relaxed);
        tracing::trace!("recycled {} bytes for a {} byte request", buf.size(), nbytes);
        Some(buf)
    }

    /// Record a buffer as handed out to the application.
    fn admit(&self, buf: DeviceBuffer) -> DeviceBuffer {
        self.used.fetch_add(buf.size(), Ordering::Relaxed);
        self.allocated.lock().insert(buf.addr(), buf.clone());
        buf
    }
}

impl MemoryPool for SimplePool {
    fn alloc(&self, nbytes: usize) -> PoolResult<DeviceBuffer> {
        let buf = run_ladder(self.gc.as_ref(), |_phase| {
            // (a) scan the free-list
            if let Some(buf) = self.scan(nbytes) {
                return Ok(Some(buf));
            }
            // (b) driver
            if let Some(buf) = self.allocator.actual_alloc(nbytes)? {
                return Ok(Some(buf));
            }
            // (c) reclaim, then retry the driver
            if self.reclaim(nbytes) > 0 {
                if let Some(buf) = self.allocator.actual_alloc(nbytes)? {
                    return Ok(Some(buf));
                }
            }
            Ok(None)
        })?;

        match buf {
            Some(buf) => Ok(self.admit(buf)),
            None => Err(PoolError::OutOfMemory {
                requested: nbytes,
                used: self.used_bytes(),
                cached: self.cached_bytes(),
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
        self.cached.fetch_add(owned.size(), Ordering::Relaxed);

        // Never wait on a scan holding the free-list lock; a free arriving
        // mid-scan is staged and picked up by the next lock holder.
        match self.free_list.try_lock() {
            Some(mut free_list) => {
                free_list
                    .available
                    .insert((owned.size(), owned.addr()), owned);
            }
            None => self.staged.lock().push(owned),
        }
    }

    fn used_bytes(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    fn cached_bytes(&self) -> usize {
        self.cached.load(Ordering::Relaxed)
    }

    fn reclaim(&self, nbytes: usize) -> usize {
        let mut free_list = self.free_list.lock();
        self.drain_staged(&mut free_list);

        let mut released = 0;
        // Largest buffers first: fewest driver calls to satisfy the target.
        while released < nbytes {
            let key = match free_list.available.keys().next_back() {
                Some(key) => *key,
                None => break,
            };
            let buf = free_list.available.remove(&key).expect("reclaim key vanished");
            self.cached.fetch_sub(buf.size(), Ordering::Relaxed);
            released += buf.size();
            self.allocator.actual_free(&buf);
        }
        if released > 0 {
            tracing::debug!("reclaimed {} bytes from the free-list", released);
        }
        released
    }

    fn deinit(&self) {
        {
            let allocated = self.allocated.lock();
            assert!(
                allocated.is_empty(),
                "deinit with {} outstanding handles",
                allocated.len()
            );
        }
        let mut free_list = self.free_list.lock();
        self.drain_staged(&mut free_list);
        for (_, buf) in std::mem::take(&mut free_list.available) {
            self.cached.fetch_sub(buf.size(), Ordering::Relaxed);
            self.allocator.actual_free(&buf);
        }
    }

    fn name(&self) -> &'static str {
        "simple"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuse_policy_small_buffers_always_fit() {
        assert!(SimplePool::reusable(16, 1024));
        assert!(SimplePool::reusable(16, SMALL_MAX));
    }

    #[test]
    fn test_reuse_policy_large_buffers_bounded() {
        // 2 MiB buffer for a 512 KiB request: 4x bound hit exactly, rejected
        assert!(!SimplePool::reusable(512 << 10, 2 << 20));
        // ...but fine for a request over a quarter of its size
        assert!(SimplePool::reusable((512 << 10) + 1, 2 << 20));
        assert!(SimplePool::reusable(2 << 20, 2 << 20));
    }
}
