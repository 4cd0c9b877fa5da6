use anyhow::Result;
use im::{HashMap, HashSet};
use types::{
    containers::{Block, BlockSummary},
    primitives::{BlockHash, Rank, ValidatorId},
};

/// Hashes of all blocks at one rank. The `topo_sort*` queries produce
/// non-empty groups of these, ascending by rank.
pub type RankGroup = (Rank, Vec<BlockHash>);

/// Query/mutation surface of a block DAG representation.
///
/// Implemented identically by the durable store and by the decorators
/// composed in front of it. Fork-choice and block ingestion only ever see
/// this trait; which layers sit between them and disk is a wiring decision.
pub trait BlockDagStore {
    /// All direct children of `block_hash`.
    fn children(&self, block_hash: BlockHash) -> Result<HashSet<BlockHash>>;

    /// All blocks citing `block_hash` as a justification.
    fn justification_to_blocks(&self, block_hash: BlockHash) -> Result<HashSet<BlockHash>>;

    /// Whether `block_hash` identifies a known block.
    fn contains(&self, block_hash: BlockHash) -> Result<bool>;

    /// Metadata of a known block, `None` if unknown.
    fn lookup(&self, block_hash: BlockHash) -> Result<Option<BlockSummary>>;

    fn latest_message_hash(&self, validator: ValidatorId) -> Result<Option<BlockHash>>;

    fn latest_message(&self, validator: ValidatorId) -> Result<Option<BlockSummary>>;

    fn latest_message_hashes(&self) -> Result<HashMap<ValidatorId, BlockHash>>;

    fn latest_messages(&self) -> Result<HashMap<ValidatorId, BlockSummary>>;

    /// Blocks with ranks in `start_rank..=end_rank`, grouped per rank,
    /// ascending. The iterator is lazy; each call starts a fresh traversal.
    fn topo_sort(
        &self,
        start_rank: Rank,
        end_rank: Rank,
    ) -> Result<impl Iterator<Item = Result<RankGroup>>>;

    /// Open-ended variant of [`topo_sort`](Self::topo_sort).
    fn topo_sort_from(&self, start_rank: Rank)
        -> Result<impl Iterator<Item = Result<RankGroup>>>;

    /// The last `length` ranks of the DAG.
    fn topo_sort_tail(&self, length: u64) -> Result<impl Iterator<Item = Result<RankGroup>>>;

    /// Adds a block. Re-inserting a known block is a no-op.
    fn insert(&self, block: &Block) -> Result<()>;

    /// Flush point. Implementations whose writes commit eagerly need no work
    /// here.
    fn checkpoint(&self) -> Result<()>;

    /// Resets the representation to empty. Used for full node resyncs.
    fn clear(&self) -> Result<()>;

    /// Releases underlying resources. Consuming the receiver makes
    /// use-after-close unrepresentable.
    fn close(self) -> Result<()>;
}
