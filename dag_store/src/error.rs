use thiserror::Error;
use types::primitives::{BlockHash, ValidatorId};

#[derive(Debug, PartialEq, Eq, Error)]
pub enum Error {
    #[error("stored block record for {block_hash:?} is corrupted")]
    CorruptedBlockRecord { block_hash: BlockHash },
    #[error("stored index entry for {block_hash:?} is corrupted")]
    CorruptedIndexEntry { block_hash: BlockHash },
    #[error("stored latest message for {validator:?} is corrupted")]
    CorruptedLatestMessage { validator: ValidatorId },
    #[error("latest message for {validator:?} points to unknown block {block_hash:?}")]
    DanglingLatestMessage {
        validator: ValidatorId,
        block_hash: BlockHash,
    },
    #[error("malformed key in latest message index: {key:?}")]
    MalformedLatestMessageKey { key: Vec<u8> },
    #[error("malformed key in rank index: {key:?}")]
    MalformedRankIndexKey { key: Vec<u8> },
}
