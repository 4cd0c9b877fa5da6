use serde::{Deserialize, Serialize};

use crate::primitives::{BlockHash, Rank, ValidatorId};

/// A claim embedded in a block recording the last block `validator` had
/// observed when the containing block was created.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct Justification {
    pub validator: ValidatorId,
    pub latest_block_hash: BlockHash,
}

/// The metadata projection of a [`Block`]. This is what lookup queries return
/// and what the DAG store persists; block bodies live in the block store.
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct BlockSummary {
    pub block_hash: BlockHash,
    pub creator: ValidatorId,
    pub rank: Rank,
    pub parent_hashes: Vec<BlockHash>,
    pub justifications: Vec<Justification>,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Block {
    pub block_hash: BlockHash,
    pub creator: ValidatorId,
    pub rank: Rank,
    pub parent_hashes: Vec<BlockHash>,
    pub justifications: Vec<Justification>,
    /// Opaque payload (deploys). Not interpreted by the storage layer.
    pub body: Vec<u8>,
}

impl Block {
    #[must_use]
    pub fn to_summary(&self) -> BlockSummary {
        BlockSummary {
            block_hash: self.block_hash,
            creator: self.creator,
            rank: self.rank,
            parent_hashes: self.parent_hashes.clone(),
            justifications: self.justifications.clone(),
        }
    }

    pub fn justified_hashes(&self) -> impl Iterator<Item = BlockHash> + '_ {
        self.justifications
            .iter()
            .map(|justification| justification.latest_block_hash)
    }
}
