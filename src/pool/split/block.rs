//! Block graph for the splitting pool
//!
//! A *block* is a view over part of a base driver buffer. Blocks within
//! one base buffer form a doubly-linked sibling chain that always covers
//! the base contiguously: splitting carves a tail off a block, coalescing
//! fuses a run of available siblings back together. Nodes live in an
//! arena and are addressed by [`BlockId`] indices, so the graph has no
//! ownership cycles and sibling links are plain data.
//!
//! Only a *whole* block (no siblings on either side) may be returned to
//! the driver: its address and size are exactly the base buffer's.

use crate::driver::DeviceBuffer;

/// Index of a block node in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct BlockId(u32);

/// Lifecycle of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockState {
    /// Sitting in a free-list, eligible for scan/split/coalesce
    Available,
    /// Handed out to the application
    Allocated,
    /// Returned to the driver. Terminal: a freed block must never appear
    /// in a free-list or be freed again.
    Freed,
}

/// One node of the sibling graph.
#[derive(Debug)]
pub(crate) struct Block {
    pub addr: usize,
    pub size: usize,
    pub device: i32,
    pub state: BlockState,
    pub prev: Option<BlockId>,
    pub next: Option<BlockId>,
}

impl Block {
    /// A fresh whole block covering an entire base driver buffer.
    pub fn whole(buf: &DeviceBuffer, state: BlockState) -> Self {
        Block {
            addr: buf.addr(),
            size: buf.size(),
            device: buf.device(),
            state,
            prev: None,
            next: None,
        }
    }

    /// The handle corresponding to this block's extent.
    pub fn handle(&self) -> DeviceBuffer {
        DeviceBuffer::from_raw_parts(self.addr, self.size, self.device)
    }

    /// Whether this block spans its whole base buffer.
    pub fn is_whole(&self) -> bool {
        self.prev.is_none() && self.next.is_none()
    }
}

/// Arena of block nodes with slot recycling.
pub(crate) struct BlockArena {
    slots: Vec<Option<Block>>,
    vacant: Vec<u32>,
}

impl BlockArena {
    pub fn new() -> Self {
        BlockArena {
            slots: Vec::new(),
            vacant: Vec::new(),
        }
    }

    pub fn insert(&mut self, block: Block) -> BlockId {
        match self.vacant.pop() {
            Some(slot) => {
                debug_assert!(self.slots[slot as usize].is_none());
                self.slots[slot as usize] = Some(block);
                BlockId(slot)
            }
            None => {
                self.slots.push(Some(block));
                BlockId((self.slots.len() - 1) as u32)
            }
        }
    }

    pub fn get(&self, id: BlockId) -> &Block {
        self.slots[id.0 as usize]
            .as_ref()
            .expect("stale block id")
    }

    pub fn get_opt(&self, id: BlockId) -> Option<&Block> {
        self.slots.get(id.0 as usize).and_then(|slot| slot.as_ref())
    }

    pub fn get_mut(&mut self, id: BlockId) -> &mut Block {
        self.slots[id.0 as usize]
            .as_mut()
            .expect("stale block id")
    }

    /// Destroy a whole AVAILABLE block ahead of returning its buffer to
    /// the driver. Freeing a split block to the driver would release its
    /// siblings' memory with it.
    pub fn release(&mut self, id: BlockId) -> Block {
        {
            let block = self.get_mut(id);
            assert!(
                block.is_whole(),
                "only whole blocks may be returned to the driver (block at 0x{:x})",
                block.addr
            );
            assert!(
                block.state == BlockState::Available,
                "released a block that was not available (state {:?})",
                block.state
            );
            block.state = BlockState::Freed;
        }
        self.vacate(id)
    }

    /// Carve the tail off `id`, keeping `keep` bytes in place. The new
    /// tail inherits the forward sibling link and becomes AVAILABLE.
    /// Returns the tail's id.
    pub fn split(&mut self, id: BlockId, keep: usize) -> BlockId {
        let (tail, old_next) = {
            let block = self.get(id);
            debug_assert!(block.state == BlockState::Available);
            assert!(
                keep > 0 && keep < block.size,
                "split of {} bytes out of a {} byte block",
                keep,
                block.size
            );
            (
                Block {
                    addr: block.addr + keep,
                    size: block.size - keep,
                    device: block.device,
                    state: BlockState::Available,
                    prev: Some(id),
                    next: block.next,
                },
                block.next,
            )
        };

        let tail_id = self.insert(tail);
        if let Some(next) = old_next {
            self.get_mut(next).prev = Some(tail_id);
        }
        let block = self.get_mut(id);
        block.size = keep;
        block.next = Some(tail_id);
        tail_id
    }

    /// Head of the maximal AVAILABLE run containing `id`.
    pub fn run_head(&self, id: BlockId) -> BlockId {
        debug_assert!(self.get(id).state == BlockState::Available);
        let mut head = id;
        while let Some(prev) = self.get(head).prev {
            if self.get(prev).state != BlockState::Available {
                break;
            }
            head = prev;
        }
        head
    }

    /// The maximal AVAILABLE run starting at `head`, in address order.
    pub fn collect_run(&self, head: BlockId) -> Vec<BlockId> {
        let mut run = vec![head];
        let mut cur = head;
        while let Some(next) = self.get(cur).next {
            if self.get(next).state != BlockState::Available {
                break;
            }
            run.push(next);
            cur = next;
        }
        run
    }

    /// Fuse a run of contiguous AVAILABLE siblings into its head block.
    /// The head inherits the run's extent and outer links; the other
    /// nodes are destroyed. Returns the head.
    pub fn merge(&mut self, run: &[BlockId]) -> BlockId {
        let head = run[0];
        if run.len() == 1 {
            return head;
        }

        let mut total = self.get(head).size;
        let mut expected_addr = self.get(head).addr + total;
        for &id in &run[1..] {
            let block = self.get(id);
            debug_assert!(block.state == BlockState::Available);
            debug_assert_eq!(
                block.addr, expected_addr,
                "merge run is not contiguous"
            );
            total += block.size;
            expected_addr = block.addr + block.size;
        }

        let tail_next = self.get(*run.last().expect("empty merge run")).next;
        for &id in &run[1..] {
            self.vacate(id);
        }

        let head_block = self.get_mut(head);
        head_block.size = total;
        head_block.next = tail_next;
        if let Some(next) = tail_next {
            self.get_mut(next).prev = Some(head);
        }
        head
    }

    fn vacate(&mut self, id: BlockId) -> Block {
        let block = self.slots[id.0 as usize]
            .take()
            .expect("vacated a stale block id");
        self.vacant.push(id.0);
        block
    }
}
