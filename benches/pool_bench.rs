//! Pool Benchmark Suite
//!
//! Compares allocation strategies over a host-side stub driver:
//! - steady-state reuse (alloc/free of one size)
//! - mixed-size churn across the size classes
//! - split/coalesce pressure in the splitting pool
//!
//! Run with: `cargo bench --bench pool_bench`
//! The stub driver charges a fixed delay per call to mimic the cost gap
//! between driver and pool allocations.

use std::hint::black_box;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use hippool::{
    DeviceAllocator, DeviceBuffer, DeviceDriver, DriverError, DummyPool, MemoryPool, SimplePool,
    SplittingPool,
};

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

/// Stub driver with a synthetic per-call cost.
struct BenchDriver {
    next_addr: Mutex<usize>,
    delay: Duration,
    calls: AtomicUsize,
}

impl BenchDriver {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(BenchDriver {
            next_addr: Mutex::new(0x1000_0000),
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DeviceDriver for BenchDriver {
    fn device_alloc(&self, nbytes: usize) -> Result<DeviceBuffer, DriverError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        let mut next = self.next_addr.lock();
        let addr = *next;
        *next += nbytes.max(1);
        Ok(DeviceBuffer::from_raw_parts(addr, nbytes, 0))
    }

    fn device_free(&self, _buf: &DeviceBuffer) -> Result<(), DriverError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        Ok(())
    }

    fn is_context_valid(&self, _buf: &DeviceBuffer) -> bool {
        true
    }
}

fn bench_pool(name: &str, pool: &dyn MemoryPool, driver: &BenchDriver) {
    // Steady-state reuse: one size, alloc/free in a tight loop
    let iterations = 10_000;
    let start = Instant::now();
    for _ in 0..iterations {
        let buf = pool.alloc(black_box(64 * KIB)).unwrap();
        pool.free(buf);
    }
    let steady = start.elapsed();

    // Mixed churn: a ring of live handles across the size classes
    let sizes = [512, 4 * KIB, 64 * KIB, 512 * KIB, 2 * MIB];
    let mut live: Vec<DeviceBuffer> = Vec::new();
    let start = Instant::now();
    for i in 0..2_000 {
        live.push(pool.alloc(black_box(sizes[i % sizes.len()])).unwrap());
        if live.len() > 16 {
            pool.free(live.remove(0));
        }
    }
    for buf in live.drain(..) {
        pool.free(buf);
    }
    let churn = start.elapsed();

    pool.deinit();
    println!(
        "{:<8} steady {:>8.2} ms   churn {:>8.2} ms   driver calls {:>6}",
        name,
        steady.as_secs_f64() * 1000.0,
        churn.as_secs_f64() * 1000.0,
        driver.calls()
    );
}

fn run_all(delay: Duration) {
    println!("driver delay: {:?}", delay);
    for name in ["dummy", "simple", "split"] {
        let driver = BenchDriver::new(delay);
        let allocator = Arc::new(DeviceAllocator::new(
            driver.clone() as Arc<dyn DeviceDriver>,
            None,
        ));
        let pool: Box<dyn MemoryPool> = match name {
            "dummy" => Box::new(DummyPool::new(allocator)),
            "simple" => Box::new(SimplePool::new(allocator)),
            _ => Box::new(SplittingPool::new(allocator)),
        };
        bench_pool(name, pool.as_ref(), &driver);
    }
}

fn main() {
    println!("====================================");
    println!("hippool Benchmark Suite");
    println!("====================================");

    // Free driver calls isolate pool bookkeeping overhead; a 20 us delay
    // approximates a cheap driver allocation.
    run_all(Duration::ZERO);
    run_all(Duration::from_micros(20));

    println!("====================================");
    println!("Benchmark Complete");
    println!("====================================");
}
