//! Block Allocator for the paged KV cache
//!
//! Owns the fixed pool of physical blocks, records which request owns each
//! block and tracks per-block recency for LRU eviction.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use super::block_table::BlockTable;
use super::{AllocatorError, AllocatorStats, Eviction};
use crate::config::ConfigError;
use crate::RequestId;

/// Unique identifier for a physical memory block
///
/// Physical IDs are dense in `[0, num_blocks)` and double as indices into
/// the allocator's block array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct BlockId(pub usize);

impl BlockId {
    /// Get the raw block ID value
    pub fn value(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Block({})", self.0)
    }
}

/// One physical block of the pool
#[derive(Debug, Clone, Copy)]
struct Block {
    /// Request currently holding the block, `None` when free
    owner: Option<RequestId>,

    /// Value of the access clock the last time the block was used
    last_access: u64,
}

/// Manages allocation, release and eviction of physical memory blocks
///
/// The allocator maintains:
/// - A FIFO free list
/// - One [`BlockTable`] per owning request
/// - A global access clock stamped onto blocks on allocation and `touch`
///
/// Request records themselves live in the scheduler; the allocator only
/// keeps the request → blocks back-reference.
#[derive(Debug)]
pub struct BlockAllocator {
    /// Tokens per block
    block_size: usize,

    /// Every block in the pool, indexed by `BlockId`
    blocks: Vec<Block>,

    /// Queue of free block IDs (FIFO for allocation)
    free_blocks: VecDeque<BlockId>,

    /// Blocks owned by each request, in logical order
    tables: HashMap<RequestId, BlockTable>,

    /// Monotonic access counter
    clock: u64,
}

impl BlockAllocator {
    /// Create a new allocator with `num_blocks` blocks of `block_size` tokens
    pub fn new(num_blocks: usize, block_size: usize) -> Result<Self, ConfigError> {
        if num_blocks == 0 {
            return Err(ConfigError::invalid("num_blocks must be greater than 0"));
        }
        if block_size == 0 {
            return Err(ConfigError::invalid("block_size must be greater than 0"));
        }

        Ok(Self {
            block_size,
            blocks: vec![Block { owner: None, last_access: 0 }; num_blocks],
            free_blocks: (0..num_blocks).map(BlockId).collect(),
            tables: HashMap::new(),
            clock: 0,
        })
    }

    /// Assign `count` free blocks to a request
    ///
    /// Blocks are appended to whatever the request already owns, so the same
    /// call serves both first admission and growth. Nothing is assigned when
    /// the pool cannot satisfy the whole request; the caller gets a
    /// [`AllocatorError::Shortfall`] carrying the deficit instead.
    pub fn allocate(
        &mut self,
        request_id: RequestId,
        count: usize,
    ) -> Result<Vec<BlockId>, AllocatorError> {
        if count == 0 {
            return Err(AllocatorError::EmptyAllocation);
        }

        let available = self.free_blocks.len();
        if available < count {
            return Err(AllocatorError::Shortfall {
                requested: count,
                available,
                deficit: count - available,
            });
        }

        let block_size = self.block_size;
        let table = self.tables.entry(request_id).or_insert_with(|| BlockTable::new(block_size));

        let mut assigned = Vec::with_capacity(count);
        for block_id in self.free_blocks.drain(..count) {
            self.clock += 1;
            let block = &mut self.blocks[block_id.0];
            block.owner = Some(request_id);
            block.last_access = self.clock;
            table.push(block_id);
            assigned.push(block_id);
        }

        debug!(request_id, blocks = count, free = self.free_blocks.len(), "allocated blocks");
        Ok(assigned)
    }

    /// Mark every block of a request as most-recently-used
    pub fn touch(&mut self, request_id: RequestId) {
        let Some(table) = self.tables.get(&request_id) else {
            return;
        };

        self.clock += 1;
        for block_id in table.block_ids() {
            self.blocks[block_id.0].last_access = self.clock;
        }
    }

    /// Release all blocks owned by a request
    ///
    /// Returns the released block IDs; empty (and no state change) when the
    /// request owns nothing.
    pub fn free(&mut self, request_id: RequestId) -> Vec<BlockId> {
        let Some(table) = self.tables.remove(&request_id) else {
            return Vec::new();
        };

        let block_ids = table.into_block_ids();
        for &block_id in &block_ids {
            self.blocks[block_id.0].owner = None;
            self.free_blocks.push_back(block_id);
        }

        debug!(request_id, blocks = block_ids.len(), free = self.free_blocks.len(), "freed blocks");
        block_ids
    }

    /// Reclaim at least `count` blocks, oldest access first
    ///
    /// Only blocks whose owner passes `is_evictable` are considered. Blocks are
    /// visited in ascending access order across the whole pool; choosing a
    /// block reclaims every block of its owner, so more than `count` blocks may
    /// come back. Fails without touching any state when fewer than `count`
    /// blocks are evictable.
    pub fn evict_least_recently_used<F>(
        &mut self,
        count: usize,
        is_evictable: F,
    ) -> Result<Eviction, AllocatorError>
    where
        F: Fn(RequestId) -> bool,
    {
        let mut candidates: Vec<(u64, usize, RequestId)> = self
            .blocks
            .iter()
            .enumerate()
            .filter_map(|(idx, block)| {
                let owner = block.owner?;
                is_evictable(owner).then_some((block.last_access, idx, owner))
            })
            .collect();

        if candidates.len() < count {
            return Err(AllocatorError::InsufficientEvictable {
                requested: count,
                evictable: candidates.len(),
            });
        }

        candidates.sort_unstable();

        let mut eviction = Eviction::default();
        for (_, _, owner) in candidates {
            if eviction.freed_blocks.len() >= count {
                break;
            }
            if eviction.evicted_requests.contains(&owner) {
                continue;
            }
            eviction.evicted_requests.push(owner);
            eviction.freed_blocks.extend(self.free(owner));
        }

        Ok(eviction)
    }

    /// Get the blocks owned by a request
    pub fn block_table(&self, request_id: RequestId) -> Option<&BlockTable> {
        self.tables.get(&request_id)
    }

    /// Get the block IDs owned by a request (empty if none)
    pub fn block_ids(&self, request_id: RequestId) -> &[BlockId] {
        self.tables.get(&request_id).map(BlockTable::block_ids).unwrap_or(&[])
    }

    /// Get the number of blocks owned by a request
    pub fn num_owned(&self, request_id: RequestId) -> usize {
        self.tables.get(&request_id).map_or(0, BlockTable::num_blocks)
    }

    /// Most recent access stamp among a request's blocks
    pub fn last_access(&self, request_id: RequestId) -> Option<u64> {
        self.tables
            .get(&request_id)?
            .block_ids()
            .iter()
            .map(|b| self.blocks[b.0].last_access)
            .max()
    }

    /// Get the request owning a physical block
    pub fn owner_of(&self, block_id: BlockId) -> Option<RequestId> {
        self.blocks.get(block_id.0)?.owner
    }

    /// Number of blocks needed to hold `num_tokens` tokens
    pub fn blocks_for_tokens(&self, num_tokens: usize) -> usize {
        num_tokens.div_ceil(self.block_size)
    }

    /// Get the number of free blocks
    pub fn free_block_count(&self) -> usize {
        self.free_blocks.len()
    }

    /// Get the total number of blocks
    pub fn num_total_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Get the number of allocated blocks
    pub fn num_allocated_blocks(&self) -> usize {
        self.blocks.len() - self.free_blocks.len()
    }

    /// Get the block size in tokens
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Get the number of requests currently owning blocks
    pub fn num_owners(&self) -> usize {
        self.tables.len()
    }

    /// Sum of the block tables of every owning request
    pub fn num_owned_blocks(&self) -> usize {
        self.tables.values().map(BlockTable::num_blocks).sum()
    }

    /// Get memory utilization (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        self.num_allocated_blocks() as f64 / self.blocks.len() as f64
    }

    /// Check if a specific number of blocks can be allocated
    pub fn can_allocate(&self, num_blocks: usize) -> bool {
        self.free_blocks.len() >= num_blocks
    }

    /// Get statistics about current block usage
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            total_blocks: self.num_total_blocks(),
            used_blocks: self.num_allocated_blocks(),
            free_blocks: self.free_block_count(),
            num_owners: self.num_owners(),
            utilization: self.utilization(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(num_blocks: usize) -> BlockAllocator {
        BlockAllocator::new(num_blocks, 16).unwrap()
    }

    #[test]
    fn test_new_allocator() {
        let allocator = allocator(10);
        assert_eq!(allocator.num_total_blocks(), 10);
        assert_eq!(allocator.free_block_count(), 10);
        assert_eq!(allocator.num_allocated_blocks(), 0);
        assert_eq!(allocator.utilization(), 0.0);
    }

    #[test]
    fn test_invalid_construction() {
        assert!(matches!(BlockAllocator::new(0, 16), Err(ConfigError::InvalidConfig(_))));
        assert!(matches!(BlockAllocator::new(8, 0), Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_allocate_and_free() {
        let mut allocator = allocator(5);

        let blocks = allocator.allocate(1, 2).unwrap();
        assert_eq!(blocks, vec![BlockId(0), BlockId(1)]);
        assert_eq!(allocator.free_block_count(), 3);
        assert_eq!(allocator.owner_of(BlockId(1)), Some(1));

        let freed = allocator.free(1);
        assert_eq!(freed, blocks);
        assert_eq!(allocator.free_block_count(), 5);
        assert_eq!(allocator.owner_of(BlockId(1)), None);
    }

    #[test]
    fn test_allocate_appends_to_existing_table() {
        let mut allocator = allocator(4);

        allocator.allocate(7, 1).unwrap();
        allocator.allocate(7, 2).unwrap();

        assert_eq!(allocator.num_owned(7), 3);
        assert_eq!(allocator.block_ids(7), &[BlockId(0), BlockId(1), BlockId(2)]);
    }

    #[test]
    fn test_shortfall_leaves_state_untouched() {
        let mut allocator = allocator(3);
        allocator.allocate(1, 2).unwrap();

        let result = allocator.allocate(2, 3);
        assert_eq!(
            result,
            Err(AllocatorError::Shortfall { requested: 3, available: 1, deficit: 2 })
        );
        assert_eq!(allocator.free_block_count(), 1);
        assert_eq!(allocator.num_owned(2), 0);
        assert!(allocator.block_table(2).is_none());
    }

    #[test]
    fn test_zero_allocation_rejected() {
        let mut allocator = allocator(3);
        assert_eq!(allocator.allocate(1, 0), Err(AllocatorError::EmptyAllocation));
    }

    #[test]
    fn test_free_is_idempotent() {
        let mut allocator = allocator(4);
        allocator.allocate(1, 2).unwrap();

        assert_eq!(allocator.free(1).len(), 2);
        assert!(allocator.free(1).is_empty());
        assert!(allocator.free(99).is_empty());
        assert_eq!(allocator.free_block_count(), 4);
    }

    #[test]
    fn test_touch_updates_recency() {
        let mut allocator = allocator(4);
        allocator.allocate(1, 1).unwrap();
        allocator.allocate(2, 1).unwrap();

        assert!(allocator.last_access(1) < allocator.last_access(2));

        allocator.touch(1);
        assert!(allocator.last_access(1) > allocator.last_access(2));

        // Unknown request is ignored
        allocator.touch(42);
        assert_eq!(allocator.last_access(42), None);
    }

    #[test]
    fn test_evict_least_recently_used() {
        let mut allocator = allocator(3);
        allocator.allocate(1, 1).unwrap();
        allocator.allocate(2, 1).unwrap();
        allocator.allocate(3, 1).unwrap();

        allocator.touch(1);
        allocator.touch(2);
        allocator.touch(3);

        let eviction = allocator.evict_least_recently_used(1, |_| true).unwrap();
        assert_eq!(eviction.evicted_requests, vec![1]);
        assert_eq!(eviction.freed_blocks, vec![BlockId(0)]);
        assert_eq!(allocator.free_block_count(), 1);
    }

    #[test]
    fn test_eviction_cascades_to_sibling_blocks() {
        let mut allocator = allocator(4);
        allocator.allocate(1, 3).unwrap();
        allocator.allocate(2, 1).unwrap();

        let eviction = allocator.evict_least_recently_used(1, |_| true).unwrap();

        assert_eq!(eviction.evicted_requests, vec![1]);
        assert_eq!(eviction.freed_blocks.len(), 3);
        assert_eq!(allocator.free_block_count(), 3);
        assert_eq!(allocator.num_owned(2), 1);
    }

    #[test]
    fn test_eviction_respects_predicate() {
        let mut allocator = allocator(2);
        allocator.allocate(1, 1).unwrap();
        allocator.allocate(2, 1).unwrap();

        let eviction = allocator.evict_least_recently_used(1, |owner| owner != 1).unwrap();
        assert_eq!(eviction.evicted_requests, vec![2]);
        assert_eq!(allocator.num_owned(1), 1);
    }

    #[test]
    fn test_insufficient_evictable() {
        let mut allocator = allocator(3);
        allocator.allocate(1, 2).unwrap();
        allocator.allocate(2, 1).unwrap();

        let result = allocator.evict_least_recently_used(2, |owner| owner == 2);
        assert_eq!(
            result,
            Err(AllocatorError::InsufficientEvictable { requested: 2, evictable: 1 })
        );
        assert_eq!(allocator.free_block_count(), 0);
        assert_eq!(allocator.num_owners(), 2);
    }

    #[test]
    fn test_no_double_allocation() {
        let mut allocator = allocator(6);
        let a = allocator.allocate(1, 3).unwrap();
        allocator.free(1);
        let b = allocator.allocate(2, 2).unwrap();
        let c = allocator.allocate(3, 5).unwrap_err();

        assert!(matches!(c, AllocatorError::Shortfall { deficit: 1, .. }));
        for block in &b {
            assert_eq!(allocator.owner_of(*block), Some(2));
        }
        // Freed blocks go to the back of the queue
        assert!(b.iter().all(|id| !a.contains(id)));
    }

    #[test]
    fn test_stats_and_capacity() {
        let mut allocator = allocator(8);
        allocator.allocate(1, 3).unwrap();
        allocator.allocate(2, 1).unwrap();

        let stats = allocator.stats();
        assert_eq!(stats.used_blocks, 4);
        assert_eq!(stats.free_blocks, 4);
        assert_eq!(stats.num_owners, 2);
        assert!((stats.utilization - 0.5).abs() < 0.01);
        assert_eq!(allocator.free_block_count() + allocator.num_owned_blocks(), 8);
    }

    #[test]
    fn test_blocks_for_tokens() {
        let allocator = allocator(4);
        assert_eq!(allocator.blocks_for_tokens(0), 0);
        assert_eq!(allocator.blocks_for_tokens(1), 1);
        assert_eq!(allocator.blocks_for_tokens(16), 1);
        assert_eq!(allocator.blocks_for_tokens(17), 2);
    }

    #[test]
    fn test_block_id_display() {
        let block = BlockId(42);
        assert_eq!(format!("{}", block), "Block(42)");
        assert_eq!(block.value(), 42);
    }
}
