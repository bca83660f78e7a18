//! Paged KV Cache Block Management
//!
//! The KV cache is divided into fixed-size blocks. Each request owns a list
//! of physical blocks mapped from its logical block indices, and blocks are
//! handed out and reclaimed as whole units.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        BlockAllocator                            │
//! │  ┌─────────────────┐  ┌───────────────────────────────────────┐  │
//! │  │  Free Blocks    │  │     BlockTables (per request)          │  │
//! │  │  [B5,B6,B7]     │  │  ┌────────┐ ┌────────┐ ┌────────┐      │  │
//! │  └─────────────────┘  │  │ Req 1  │ │ Req 2  │ │ Req 3  │      │  │
//! │  ┌─────────────────┐  │  │[B0,B2] │ │[B1,B3] │ │[B4]    │      │  │
//! │  │ Access clock    │  │  └────────┘ └────────┘ └────────┘      │  │
//! │  └─────────────────┘  └───────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Running out of blocks is an expected condition, not a failure:
//! [`BlockAllocator::allocate`] reports [`AllocatorError::Shortfall`] with the
//! missing block count and the scheduler resolves it by eviction or by leaving
//! the request queued.
//!
//! # Example
//!
//! ```rust
//! use minivllm_core::kv_cache::{AllocatorError, BlockAllocator};
//!
//! let mut allocator = BlockAllocator::new(4, 16).unwrap();
//!
//! let blocks = allocator.allocate(1, 3).unwrap();
//! assert_eq!(blocks.len(), 3);
//!
//! // Not enough room: the deficit is reported, nothing is assigned
//! let err = allocator.allocate(2, 2).unwrap_err();
//! assert!(matches!(err, AllocatorError::Shortfall { deficit: 1, .. }));
//!
//! // Reclaim the least recently used request
//! let eviction = allocator.evict_least_recently_used(1, |_| true).unwrap();
//! assert_eq!(eviction.evicted_requests, vec![1]);
//! assert_eq!(allocator.free_block_count(), 4);
//! ```

mod block_allocator;
mod block_table;

pub use block_allocator::{BlockAllocator, BlockId};
pub use block_table::BlockTable;

use serde::Serialize;
use thiserror::Error;

use crate::RequestId;

/// Default number of tokens per block
pub const DEFAULT_BLOCK_SIZE: usize = 16;

/// Errors that can occur during block allocation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocatorError {
    /// Not enough free blocks; recoverable through eviction
    #[error("shortfall: requested {requested} blocks, {available} free ({deficit} missing)")]
    Shortfall { requested: usize, available: usize, deficit: usize },

    /// Eviction was asked for more blocks than evictable requests hold
    #[error("cannot evict {requested} blocks: only {evictable} evictable")]
    InsufficientEvictable { requested: usize, evictable: usize },

    /// Allocation of zero blocks
    #[error("allocation must request at least one block")]
    EmptyAllocation,
}

impl AllocatorError {
    /// Missing block count for a shortfall
    pub fn deficit(&self) -> Option<usize> {
        match self {
            AllocatorError::Shortfall { deficit, .. } => Some(*deficit),
            _ => None,
        }
    }
}

/// Result of an LRU eviction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Eviction {
    /// Blocks returned to the free list, in release order
    pub freed_blocks: Vec<BlockId>,

    /// Requests whose blocks were reclaimed, least recently used first
    pub evicted_requests: Vec<RequestId>,
}

/// Statistics about allocator block usage
#[derive(Debug, Clone, Serialize)]
pub struct AllocatorStats {
    pub total_blocks: usize,
    pub used_blocks: usize,
    pub free_blocks: usize,
    pub num_owners: usize,
    pub utilization: f64,
}

impl std::fmt::Display for AllocatorStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BlockAllocator: {}/{} blocks used ({:.1}%), {} owners",
            self.used_blocks,
            self.total_blocks,
            self.utilization * 100.0,
            self.num_owners
        )
    }
}
