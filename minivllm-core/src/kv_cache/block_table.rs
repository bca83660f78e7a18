//! Request Block Table
//!
//! Maps the logical block indices of one request to the physical blocks
//! handed out by the allocator.

use super::block_allocator::BlockId;

/// Logical → physical block mapping for a single request
///
/// Entry `i` is the physical block holding tokens
/// `[i * block_size, (i + 1) * block_size)` of the request. Blocks are
/// appended as the request grows and are only ever released all at once.
#[derive(Debug, Clone)]
pub struct BlockTable {
    /// Physical block IDs in logical order
    block_ids: Vec<BlockId>,

    /// Tokens per block
    block_size: usize,
}

impl BlockTable {
    /// Create a new empty block table
    pub fn new(block_size: usize) -> Self {
        Self { block_ids: Vec::new(), block_size }
    }

    /// Get the number of blocks mapped
    pub fn num_blocks(&self) -> usize {
        self.block_ids.len()
    }

    /// Get the block size
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Check whether the table maps no blocks
    pub fn is_empty(&self) -> bool {
        self.block_ids.is_empty()
    }

    /// Get the physical block IDs in logical order
    pub fn block_ids(&self) -> &[BlockId] {
        &self.block_ids
    }

    /// Get the physical block ID for a logical block index
    pub fn get_block(&self, logical_idx: usize) -> Option<BlockId> {
        self.block_ids.get(logical_idx).copied()
    }

    /// Get the physical block ID holding a token position
    pub fn get_block_for_token(&self, token_pos: usize) -> Option<BlockId> {
        self.get_block(token_pos / self.block_size)
    }

    /// Get the offset within a block for a token position
    pub fn get_offset_in_block(&self, token_pos: usize) -> usize {
        token_pos % self.block_size
    }

    /// Number of tokens the mapped blocks can hold
    pub fn token_capacity(&self) -> usize {
        self.block_ids.len() * self.block_size
    }

    pub(crate) fn push(&mut self, block_id: BlockId) {
        self.block_ids.push(block_id);
    }

    pub(crate) fn into_block_ids(self) -> Vec<BlockId> {
        self.block_ids
    }
}
