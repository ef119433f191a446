//! Pool dispatcher
//!
//! Selects one pool implementation at construction, routes `alloc`/`free`
//! to it, and keeps the request-side counters and timers. A process-wide
//! instance is available through [`global`] (behind the `rocm` feature)
//! to preserve the environment-variable contract; library consumers
//! normally construct an explicit [`PoolManager`] over their own driver.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::{PoolConfig, PoolKind};
use crate::driver::{DeviceAllocator, DeviceBuffer, DeviceDriver};
use crate::error::PoolResult;
use crate::pool::{DummyPool, GcHook, MemoryPool, SimplePool, SplittingPool};
use crate::stats::{DriverStats, PoolStats};

/// Routes allocation traffic to the configured pool.
pub struct PoolManager {
    config: PoolConfig,
    allocator: Arc<DeviceAllocator>,
    gc: Option<GcHook>,
    pool: RwLock<Box<dyn MemoryPool>>,
    stats: PoolStats,
}

impl std::fmt::Debug for PoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolManager")
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish()
    }
}

impl PoolManager {
    /// Build a manager over `driver` with an explicit configuration.
    pub fn new(driver: Arc<dyn DeviceDriver>, config: PoolConfig) -> Self {
        Self::with_gc_hook_inner(driver, config, None)
    }

    /// Build a manager whose pools issue host-GC hints through `gc`.
    pub fn with_gc_hook(driver: Arc<dyn DeviceDriver>, config: PoolConfig, gc: GcHook) -> Self {
        Self::with_gc_hook_inner(driver, config, Some(gc))
    }

    fn with_gc_hook_inner(
        driver: Arc<dyn DeviceDriver>,
        config: PoolConfig,
        gc: Option<GcHook>,
    ) -> Self {
        crate::logging::init_logging_from_env();
        let allocator = Arc::new(DeviceAllocator::new(driver, config.memory_limit));
        let pool = build_pool(config.kind, &allocator, config.split, gc.clone());
        tracing::info!("memory pool installed: {}", config.kind.name());
        PoolManager {
            config,
            allocator,
            gc,
            pool: RwLock::new(pool),
            stats: PoolStats::new(),
        }
    }

    /// Build a manager from the `HIPPOOL_*` environment.
    pub fn from_env(driver: Arc<dyn DeviceDriver>) -> PoolResult<Self> {
        Ok(Self::new(driver, PoolConfig::from_env()?))
    }

    /// Allocate at least `nbytes` of device memory through the pool.
    pub fn alloc(&self, nbytes: usize) -> PoolResult<DeviceBuffer> {
        self.stats.alloc.record(nbytes);
        let _span = self.stats.alloc_time.scoped();
        let buf = self.pool.read().alloc(nbytes)?;
        assert!(
            buf.size() >= nbytes,
            "pool returned a short handle: {} < {}",
            buf.size(),
            nbytes
        );
        Ok(buf)
    }

    /// Release a handle back to the pool.
    pub fn free(&self, buf: DeviceBuffer) {
        self.stats.free.record(buf.size());
        let _span = self.stats.free_time.scoped();
        self.pool.read().free(buf);
    }

    /// Tear the current pool down and install `kind` in its place.
    ///
    /// The running pool's deinit asserts that the application holds no
    /// outstanding handles.
    pub fn switch_pool(&self, kind: PoolKind) {
        let mut pool = self.pool.write();
        pool.deinit();
        *pool = build_pool(kind, &self.allocator, self.config.split, self.gc.clone());
        tracing::info!("memory pool switched: {}", kind.name());
    }

    /// Sum of sizes of currently-handed-out handles.
    pub fn used_bytes(&self) -> usize {
        self.pool.read().used_bytes()
    }

    /// Sum of sizes held in the pool's free-list(s).
    pub fn cached_bytes(&self) -> usize {
        self.pool.read().cached_bytes()
    }

    /// Name of the installed pool.
    pub fn pool_name(&self) -> &'static str {
        self.pool.read().name()
    }

    /// Request-side counters and timers.
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Driver-side counters and timers.
    pub fn driver_stats(&self) -> &DriverStats {
        self.allocator.stats()
    }

    /// Bytes currently held from the driver.
    pub fn driver_usage(&self) -> usize {
        self.allocator.usage()
    }

    /// Print the one-line pool summary to stderr.
    pub fn report(&self) {
        eprintln!("{}", self.summary_line());
    }

    fn summary_line(&self) -> String {
        let driver = self.allocator.stats();
        format!(
            "hippool {}: {} allocs ({} bytes), {} frees ({} bytes), \
             {} driver allocs ({} bytes), {} driver frees ({} bytes), \
             alloc {:.3} ms, free {:.3} ms",
            self.pool_name(),
            self.stats.alloc.count(),
            self.stats.alloc.bytes(),
            self.stats.free.count(),
            self.stats.free.bytes(),
            driver.alloc.count(),
            driver.alloc.bytes(),
            driver.free.count(),
            driver.free.bytes(),
            self.stats.alloc_time.elapsed_ms(),
            self.stats.free_time.elapsed_ms(),
        )
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        // The summary is an explicit opt-in: either the user selected a
        // pool by hand or asked for trace output.
        if self.config.explicit_kind || self.config.trace {
            self.report();
        }
        if self.config.trace {
            let driver = self.allocator.stats();
            eprintln!(
                "hippool {}: driver usage {} bytes, cached {} bytes, used {} bytes, \
                 device_alloc {:.3} ms, device_free {:.3} ms",
                self.pool_name(),
                self.allocator.usage(),
                self.cached_bytes(),
                self.used_bytes(),
                driver.alloc_time.elapsed_ms(),
                driver.free_time.elapsed_ms(),
            );
        }
    }
}

/// Instantiate one pool implementation.
fn build_pool(
    kind: PoolKind,
    allocator: &Arc<DeviceAllocator>,
    split: bool,
    gc: Option<GcHook>,
) -> Box<dyn MemoryPool> {
    match kind {
        PoolKind::Dummy => {
            let pool = DummyPool::new(allocator.clone());
            match gc {
                Some(gc) => Box::new(pool.with_gc_hook(gc)),
                None => Box::new(pool),
            }
        }
        PoolKind::Simple => {
            let pool = SimplePool::new(allocator.clone());
            match gc {
                Some(gc) => Box::new(pool.with_gc_hook(gc)),
                None => Box::new(pool),
            }
        }
        PoolKind::Split => {
            let pool = SplittingPool::new(allocator.clone()).with_split(split);
            match gc {
                Some(gc) => Box::new(pool.with_gc_hook(gc)),
                None => Box::new(pool),
            }
        }
    }
}

/// Process-wide manager over device 0, configured from the environment.
///
/// Only the outermost shim should use this; everything else takes an
/// explicit [`PoolManager`]. The exit summary for the global instance is
/// emitted by calling [`PoolManager::report`] at shutdown (a `'static`
/// is never dropped).
#[cfg(feature = "rocm")]
pub fn global() -> PoolResult<&'static PoolManager> {
    use once_cell::sync::OnceCell;
    static GLOBAL: OnceCell<PoolManager> = OnceCell::new();
    GLOBAL.get_or_try_init(|| {
        let driver = Arc::new(crate::driver::HipDriver::new(0)?);
        PoolManager::from_env(driver)
    })
}
