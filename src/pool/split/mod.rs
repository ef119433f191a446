//! Size-class-segregated splitting pool
//!
//! Caches blocks carved from driver buffers in three free-lists, one per
//! size class. A scan that finds an oversized block splits the remainder
//! off into the same class; freed neighbouring blocks coalesce back into
//! larger ones; whole blocks (spanning an entire base buffer) can be
//! reclaimed to the driver under memory pressure.
//!
//! Splitting a large base buffer to serve a small request would pin the
//! base forever, so classes never mix: a scan only considers its own
//! class's list, and a split remainder that would land in a different
//! class is not carved off at all. HUGE blocks are served exact-fit and
//! never split so they can always be returned whole.

mod block;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::driver::{DeviceAllocator, DeviceBuffer};
use crate::error::{PoolError, PoolResult};
use crate::pool::{run_ladder, GcHook, MemoryPool, SizeClass};

use self::block::{Block, BlockArena, BlockId, BlockState};

/// Free-lists and block graph guarded by the pool lock.
struct PoolState {
    arena: BlockArena,
    /// Per-class AVAILABLE blocks ordered by `(size, addr)`.
    available: [BTreeMap<(usize, usize), BlockId>; 3],
}

impl PoolState {
    fn new() -> Self {
        PoolState {
            arena: BlockArena::new(),
            available: [BTreeMap::new(), BTreeMap::new(), BTreeMap::new()],
        }
    }
}

/// Pool of split/coalesced blocks in three size classes.
pub struct SplittingPool {
    allocator: Arc<DeviceAllocator>,
    gc: Option<GcHook>,
    /// Whether oversized scan hits may have their remainder carved off.
    split: bool,
    state: Mutex<PoolState>,
    /// Frees that arrived while the lock was held by a scan, compact or
    /// reclaim. Blocks stay ALLOCATED while staged; the next lock holder
    /// admits them into the free-lists.
    staged: Mutex<Vec<BlockId>>,
    /// Live handles by address.
    allocated: Mutex<HashMap<usize, BlockId>>,
    used: AtomicUsize,
    cached: AtomicUsize,
}

impl SplittingPool {
    pub fn new(allocator: Arc<DeviceAllocator>) -> Self {
        SplittingPool {
            allocator,
            gc: None,
            split: true,
            state: Mutex::new(PoolState::new()),
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

    /// Enable or disable split-on-alloc (enabled by default).
    pub fn with_split(mut self, split: bool) -> Self {
        self.split = split;
        self
    }

    /// Coalesce every maximal run of available siblings, in all classes.
    pub fn compact(&self) {
        let mut state = self.state.lock();
        self.drain_staged_locked(&mut state);
        Self::compact_locked(&mut state);
    }

    /// Number of blocks currently sitting in the free-lists.
    pub fn cached_blocks(&self) -> usize {
        let mut state = self.state.lock();
        self.drain_staged_locked(&mut state);
        state.available.iter().map(|list| list.len()).sum()
    }

    /// Admit staged frees into the free-lists. Caller holds the pool lock.
    fn drain_staged_locked(&self, state: &mut PoolState) {
        let staged: Vec<BlockId> = std::mem::take(&mut *self.staged.lock());
        for id in staged {
            Self::admit_free_locked(state, id);
        }
    }

    /// Mark a block AVAILABLE and index it under its class.
    fn admit_free_locked(state: &mut PoolState, id: BlockId) {
        let block = state.arena.get_mut(id);
        assert!(
            block.state == BlockState::Allocated,
            "freed a block in state {:?} at 0x{:x}",
            block.state,
            block.addr
        );
        block.state = BlockState::Available;
        let (size, addr) = (block.size, block.addr);
        state.available[SizeClass::of(size).index()].insert((size, addr), id);
    }

    /// Take the first cached block of this class satisfying the rounded
    /// request, splitting the remainder off when the class allows it.
    fn scan_locked(
        &self,
        state: &mut PoolState,
        class: SizeClass,
        rounded: usize,
    ) -> Option<DeviceBuffer> {
        let list = &mut state.available[class.index()];
        let key = *list.range((rounded, 0)..).next().map(|(k, _)| k)?;
        if key.0 > rounded.saturating_add(class.max_overhead()) {
            return None;
        }
        let id = list.remove(&key).expect("scanned key vanished");

        if self.split && class.may_split() {
            let remainder = key.0 - rounded;
            // A remainder that would fall into a smaller class is left
            // attached: carving it off would let a tiny tail keep the
            // larger parent alive forever.
            if remainder > 0 && SizeClass::of(remainder) == class {
                let tail = state.arena.split(id, rounded);
                let (tail_size, tail_addr) = {
                    let t = state.arena.get(tail);
                    (t.size, t.addr)
                };
                state.available[class.index()].insert((tail_size, tail_addr), tail);
                tracing::trace!(
                    "split a {} byte block: {} handed out, {} remains cached",
                    key.0,
                    rounded,
                    tail_size
                );
            }
        }

        let block = state.arena.get_mut(id);
        block.state = BlockState::Allocated;
        let handle = block.handle();
        self.cached.fetch_sub(handle.size(), Ordering::Relaxed);
        self.used.fetch_add(handle.size(), Ordering::Relaxed);
        self.allocated.lock().insert(handle.addr(), id);
        Some(handle)
    }

    /// Allocate a fresh base buffer from the driver as a whole block.
    fn fresh_base(&self, rounded: usize) -> PoolResult<Option<DeviceBuffer>> {
        let buf = match self.allocator.actual_alloc(rounded)? {
            Some(buf) => buf,
            None => return Ok(None),
        };
        let id = {
            let mut state = self.state.lock();
            state.arena.insert(Block::whole(&buf, BlockState::Allocated))
        };
        self.allocated.lock().insert(buf.addr(), id);
        self.used.fetch_add(buf.size(), Ordering::Relaxed);
        Ok(Some(buf))
    }

    /// Coalesce the maximal available run containing `id`.
    fn coalesce_chain_locked(state: &mut PoolState, id: BlockId) {
        let head = state.arena.run_head(id);
        let run = state.arena.collect_run(head);
        if run.len() < 2 {
            return;
        }
        for &member in &run {
            let block = state.arena.get(member);
            let removed = state.available[SizeClass::of(block.size).index()]
                .remove(&(block.size, block.addr));
            debug_assert!(removed.is_some(), "available block missing from its free-list");
        }
        let merged = state.arena.merge(&run);
        let block = state.arena.get(merged);
        // Reinsert keyed by the class of the merged size.
        state.available[SizeClass::of(block.size).index()]
            .insert((block.size, block.addr), merged);
    }

    /// Coalesce every chain reachable from the free-lists.
    fn compact_locked(state: &mut PoolState) {
        let ids: Vec<BlockId> = state
            .available
            .iter()
            .flat_map(|list| list.values().copied())
            .collect();
        for id in ids {
            // Ids merged away earlier in this pass are gone from the arena.
            let alive = matches!(
                state.arena.get_opt(id),
                Some(block) if block.state == BlockState::Available
            );
            if alive {
                Self::coalesce_chain_locked(state, id);
            }
        }
    }

    /// Return every whole available block of one class to the driver.
    fn sweep_class_locked(&self, state: &mut PoolState, class: SizeClass) -> usize {
        let whole: Vec<(usize, usize)> = state.available[class.index()]
            .iter()
            .filter(|&(_, &id)| state.arena.get(id).is_whole())
            .map(|(&key, _)| key)
            .collect();

        let mut released = 0;
        for key in whole {
            let id = state.available[class.index()]
                .remove(&key)
                .expect("swept key vanished");
            let block = state.arena.release(id);
            self.cached.fetch_sub(block.size, Ordering::Relaxed);
            released += block.size;
            self.allocator.actual_free(&block.handle());
        }
        if released > 0 {
            tracing::debug!("reclaimed {} bytes of {} blocks", released, class.name());
        }
        released
    }

    /// Log every allocated and available block ahead of an OOM report.
    fn dump_locked(&self, state: &PoolState) {
        let allocated = self.allocated.lock();
        tracing::error!(
            "split pool exhausted: {} allocated blocks, {} available blocks",
            allocated.len(),
            state.available.iter().map(|l| l.len()).sum::<usize>()
        );
        for (&addr, &id) in allocated.iter() {
            let block = state.arena.get(id);
            tracing::error!("  allocated: {:>12} bytes at 0x{:x}", block.size, addr);
        }
        for class in SizeClass::ALL {
            for (&(size, addr), _) in &state.available[class.index()] {
                tracing::error!("  available ({}): {:>12} bytes at 0x{:x}", class.name(), size, addr);
            }
        }
    }
}

impl MemoryPool for SplittingPool {
    fn alloc(&self, nbytes: usize) -> PoolResult<DeviceBuffer> {
        let request = nbytes.max(1);
        let class = SizeClass::of(request);
        let rounded = class.round_up(request);

        let result = run_ladder(self.gc.as_ref(), |phase| {
            // (a) scan this class's free-list
            {
                let mut state = self.state.lock();
                self.drain_staged_locked(&mut state);
                if let Some(buf) = self.scan_locked(&mut state, class, rounded) {
                    return Ok(Some(buf));
                }
            }
            // (b) fresh base buffer from the driver
            if let Some(buf) = self.fresh_base(rounded)? {
                return Ok(Some(buf));
            }
            // (c) on retry phases, coalesce everything and rescan
            if phase.compacts() {
                let mut state = self.state.lock();
                self.drain_staged_locked(&mut state);
                Self::compact_locked(&mut state);
                if let Some(buf) = self.scan_locked(&mut state, class, rounded) {
                    return Ok(Some(buf));
                }
            }
            // (d) reclaim whole blocks across all classes, retry the driver.
            // A HUGE request cannot find space in the other classes' lists,
            // so everything reclaimable goes.
            if self.reclaim(rounded) > 0 {
                if let Some(buf) = self.fresh_base(rounded)? {
                    return Ok(Some(buf));
                }
            }
            Ok(None)
        })?;

        match result {
            Some(buf) => Ok(buf),
            None => {
                {
                    let state = self.state.lock();
                    self.dump_locked(&state);
                }
                Err(PoolError::OutOfMemory {
                    requested: nbytes,
                    used: self.used_bytes(),
                    cached: self.cached_bytes(),
                })
            }
        }
    }

    fn free(&self, buf: DeviceBuffer) {
        let id = self.allocated.lock().remove(&buf.addr());
        let id = id.unwrap_or_else(|| {
            panic!(
                "freed a handle this pool did not issue (or double-free) at 0x{:x}",
                buf.addr()
            )
        });
        self.used.fetch_sub(buf.size(), Ordering::Relaxed);
        self.cached.fetch_add(buf.size(), Ordering::Relaxed);

        // Never wait on a scan holding the pool lock; and only coalesce
        // when the lock was free, since a scan mid-flight keeps transient
        // state in the block graph.
        match self.state.try_lock() {
            Some(mut state) => {
                Self::admit_free_locked(&mut state, id);
                Self::coalesce_chain_locked(&mut state, id);
            }
            None => self.staged.lock().push(id),
        }
    }

    fn used_bytes(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    fn cached_bytes(&self) -> usize {
        self.cached.load(Ordering::Relaxed)
    }

    fn reclaim(&self, nbytes: usize) -> usize {
        let mut state = self.state.lock();
        self.drain_staged_locked(&mut state);

        let mut released = 0;
        for class in SizeClass::ALL {
            if released >= nbytes {
                break;
            }
            released += self.sweep_class_locked(&mut state, class);
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
        let mut state = self.state.lock();
        self.drain_staged_locked(&mut state);
        // With nothing allocated every chain coalesces to a whole block,
        // so a full compact followed by a sweep empties the pool.
        Self::compact_locked(&mut state);
        for class in SizeClass::ALL {
            self.sweep_class_locked(&mut state, class);
        }
        for list in &state.available {
            assert!(list.is_empty(), "blocks survived the deinit sweep");
        }
        debug_assert_eq!(self.cached_bytes(), 0);
    }

    fn name(&self) -> &'static str {
        "split"
    }
}
