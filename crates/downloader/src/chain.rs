//! Chain-store capabilities the engine drives. The store is strictly a
//! sink: nothing here calls back into the downloader.

use std::fmt;

use emberd_primitives::{Block, BlockHeader, Hash256, Receipt, U256};

/// Failure inside a batched insert, pointing at the offending element.
#[derive(Clone, Debug)]
pub struct ChainInsertError {
    pub index: usize,
    pub message: String,
}

impl fmt::Display for ChainInsertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "insert failed at batch index {}: {}", self.index, self.message)
    }
}

impl std::error::Error for ChainInsertError {}

/// Header-chain store, sufficient for light sync.
pub trait LightChain: Send + Sync {
    fn has_header(&self, hash: &Hash256, number: u64) -> bool;

    fn header_by_hash(&self, hash: &Hash256) -> Option<BlockHeader>;

    fn current_header(&self) -> BlockHeader;

    /// Cumulative difficulty of a known header, None if unknown.
    fn total_difficulty(&self, hash: &Hash256, number: u64) -> Option<U256>;

    /// Insert a contiguous run, verifying every `verify_frequency`-th
    /// header fully. Returns `ChainInsertError` with the failing index.
    fn insert_header_chain(
        &self,
        headers: &[BlockHeader],
        verify_frequency: usize,
    ) -> Result<(), ChainInsertError>;

    /// Roll the header chain (and any dependent heads) back to `height`.
    fn set_head(&self, height: u64) -> Result<(), String>;
}

/// Full block store, extending the header chain with bodies, receipts,
/// and the fast-sync commit entry point.
pub trait BlockChain: LightChain {
    fn has_block(&self, hash: &Hash256, number: u64) -> bool;

    /// Whether the block's body and receipts are present (fast-sync data
    /// availability, regardless of execution).
    fn has_fast_block(&self, hash: &Hash256, number: u64) -> bool;

    fn block_by_hash(&self, hash: &Hash256) -> Option<Block>;

    fn current_block(&self) -> Block;

    fn current_fast_block(&self) -> Block;

    /// Promote an already-stored block to the head of the executed chain
    /// once its state has been synchronised.
    fn fast_sync_commit_head(&self, hash: &Hash256) -> Result<(), String>;

    fn insert_chain(&self, blocks: Vec<Block>) -> Result<(), ChainInsertError>;

    /// Insert block+receipt pairs without execution. Batches entirely
    /// below `ancient_limit` take the frozen append-only write path.
    fn insert_receipt_chain(
        &self,
        blocks: Vec<Block>,
        receipts: Vec<Vec<Receipt>>,
        ancient_limit: u64,
    ) -> Result<(), ChainInsertError>;

    /// Frontier of the frozen (ancient) region: number of frozen blocks.
    fn ancients(&self) -> u64;
}
