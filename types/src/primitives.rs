pub use ethereum_types::H256;

/// Content identifier of a block: the 32-byte hash of its serialized header.
pub type BlockHash = H256;

/// Public-key-derived identifier of a block-producing validator.
pub type ValidatorId = H256;

/// Topological generation number of a block, used for range-bounded traversal.
pub type Rank = u64;
