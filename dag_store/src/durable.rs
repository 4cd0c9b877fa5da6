use anyhow::Result;
use database::Database;
use im::{HashMap, HashSet};
use itertools::Either;
use log::info;
use parking_lot::Mutex;
use types::{
    containers::{Block, BlockSummary},
    primitives::{BlockHash, Rank, ValidatorId},
};

use crate::{
    error::Error,
    store::{BlockDagStore, RankGroup},
};

const HASH_SIZE: usize = size_of::<BlockHash>();
const RANK_SIZE: usize = size_of::<Rank>();

const BLOCK_RECORD_PREFIX: u8 = b'b';
const CHILD_INDEX_PREFIX: u8 = b'c';
const JUSTIFICATION_INDEX_PREFIX: u8 = b'j';
const LATEST_MESSAGE_PREFIX: u8 = b'm';
const RANK_INDEX_PREFIX: u8 = b'r';

type HashKey = [u8; 1 + HASH_SIZE];
type RankKey = [u8; 1 + RANK_SIZE + HASH_SIZE];

// Prefix,BlockHash -> BlockSummary
fn block_record_key(block_hash: BlockHash) -> HashKey {
    prefixed_hash_key(BLOCK_RECORD_PREFIX, block_hash)
}

// Prefix,BlockHash -> Vec<BlockHash> of direct children
fn child_index_key(block_hash: BlockHash) -> HashKey {
    prefixed_hash_key(CHILD_INDEX_PREFIX, block_hash)
}

// Prefix,BlockHash -> Vec<BlockHash> of blocks citing it as a justification
fn justification_index_key(block_hash: BlockHash) -> HashKey {
    prefixed_hash_key(JUSTIFICATION_INDEX_PREFIX, block_hash)
}

// Prefix,ValidatorId -> BlockHash of the validator's latest message
fn latest_message_key(validator: ValidatorId) -> HashKey {
    prefixed_hash_key(LATEST_MESSAGE_PREFIX, validator)
}

// Prefix,Rank,BlockHash -> (), ordered by rank for range traversal
fn rank_index_key(rank: Rank, block_hash: BlockHash) -> RankKey {
    let mut key = [0; 1 + RANK_SIZE + HASH_SIZE];
    key[0] = RANK_INDEX_PREFIX;
    key[1..=RANK_SIZE].copy_from_slice(&rank.to_be_bytes());
    key[1 + RANK_SIZE..].copy_from_slice(block_hash.as_bytes());
    key
}

fn rank_scan_key(rank: Rank) -> [u8; 1 + RANK_SIZE] {
    let mut key = [0; 1 + RANK_SIZE];
    key[0] = RANK_INDEX_PREFIX;
    key[1..].copy_from_slice(&rank.to_be_bytes());
    key
}

fn prefixed_hash_key(prefix: u8, hash: BlockHash) -> HashKey {
    let mut key = [0; 1 + HASH_SIZE];
    key[0] = prefix;
    key[1..].copy_from_slice(hash.as_bytes());
    key
}

fn decode_rank_index_key(key: &[u8]) -> Result<(Rank, BlockHash), Error> {
    let malformed = || Error::MalformedRankIndexKey { key: key.to_vec() };

    if key.len() != 1 + RANK_SIZE + HASH_SIZE || key[0] != RANK_INDEX_PREFIX {
        return Err(malformed());
    }

    let rank_bytes = key[1..=RANK_SIZE].try_into().map_err(|_| malformed())?;
    let rank = Rank::from_be_bytes(rank_bytes);
    let block_hash = BlockHash::from_slice(&key[1 + RANK_SIZE..]);

    Ok((rank, block_hash))
}

/// The authoritative DAG representation, persisted in a [`Database`].
///
/// Block records, both reverse-indices, the latest-message map, and the rank
/// index all live under distinct single-byte key prefixes. One `insert`
/// commits all of its key-value pairs as a single batch.
pub struct DurableDagStore {
    database: Database,
    // Serializes the read-modify-write of the derived indices in `insert`.
    insert_lock: Mutex<()>,
}

impl DurableDagStore {
    #[must_use]
    pub const fn new(database: Database) -> Self {
        Self {
            database,
            insert_lock: Mutex::new(()),
        }
    }

    fn stored_hash_list(&self, key: HashKey, block_hash: BlockHash) -> Result<Vec<BlockHash>> {
        match self.database.get(key)? {
            Some(bytes) => {
                let hashes = bincode::deserialize(&bytes)
                    .map_err(|_| Error::CorruptedIndexEntry { block_hash })?;
                Ok(hashes)
            }
            None => Ok(vec![]),
        }
    }

    fn max_rank(&self) -> Result<Option<Rank>> {
        let last_key = rank_index_key(Rank::MAX, BlockHash::repeat_byte(u8::MAX));

        // The rank index occupies the highest key region, so the last rank
        // key is the last key of the whole database.
        let Some(result) = self.database.iterator_descending(..=last_key)?.next() else {
            return Ok(None);
        };

        let (key, _) = result?;

        if key.first() != Some(&RANK_INDEX_PREFIX) {
            return Ok(None);
        }

        let (rank, _) = decode_rank_index_key(&key)?;

        Ok(Some(rank))
    }

    fn ranked_hashes(
        &self,
        start_rank: Rank,
        end_rank: Rank,
    ) -> Result<impl Iterator<Item = Result<(Rank, BlockHash)>> + '_> {
        let entries = self
            .database
            .iterator_ascending(rank_scan_key(start_rank)..)?
            .map_while(move |result| match result {
                Ok((key, _)) => {
                    if key.first() != Some(&RANK_INDEX_PREFIX) {
                        return None;
                    }

                    match decode_rank_index_key(&key) {
                        Ok((rank, _)) if rank > end_rank => None,
                        Ok(pair) => Some(Ok(pair)),
                        Err(error) => Some(Err(error.into())),
                    }
                }
                Err(error) => Some(Err(error)),
            });

        Ok(entries)
    }
}

impl BlockDagStore for DurableDagStore {
    fn children(&self, block_hash: BlockHash) -> Result<HashSet<BlockHash>> {
        self.stored_hash_list(child_index_key(block_hash), block_hash)
            .map(Vec::into_iter)
            .map(HashSet::from_iter)
    }

    fn justification_to_blocks(&self, block_hash: BlockHash) -> Result<HashSet<BlockHash>> {
        self.stored_hash_list(justification_index_key(block_hash), block_hash)
            .map(Vec::into_iter)
            .map(HashSet::from_iter)
    }

    fn contains(&self, block_hash: BlockHash) -> Result<bool> {
        self.database.contains_key(block_record_key(block_hash))
    }

    fn lookup(&self, block_hash: BlockHash) -> Result<Option<BlockSummary>> {
        let Some(bytes) = self.database.get(block_record_key(block_hash))? else {
            return Ok(None);
        };

        let summary = bincode::deserialize(&bytes)
            .map_err(|_| Error::CorruptedBlockRecord { block_hash })?;

        Ok(Some(summary))
    }

    fn latest_message_hash(&self, validator: ValidatorId) -> Result<Option<BlockHash>> {
        let Some(bytes) = self.database.get(latest_message_key(validator))? else {
            return Ok(None);
        };

        if bytes.len() != HASH_SIZE {
            return Err(Error::CorruptedLatestMessage { validator }.into());
        }

        Ok(Some(BlockHash::from_slice(&bytes)))
    }

    fn latest_message(&self, validator: ValidatorId) -> Result<Option<BlockSummary>> {
        let Some(block_hash) = self.latest_message_hash(validator)? else {
            return Ok(None);
        };

        let summary = self.lookup(block_hash)?.ok_or(Error::DanglingLatestMessage {
            validator,
            block_hash,
        })?;

        Ok(Some(summary))
    }

    fn latest_message_hashes(&self) -> Result<HashMap<ValidatorId, BlockHash>> {
        self.database
            .iterator_ascending([LATEST_MESSAGE_PREFIX]..)?
            .map_while(|result| match result {
                Ok((key, value)) => {
                    if key.first() != Some(&LATEST_MESSAGE_PREFIX) {
                        return None;
                    }

                    Some(decode_latest_message_pair(&key, &value))
                }
                Err(error) => Some(Err(error)),
            })
            .collect()
    }

    fn latest_messages(&self) -> Result<HashMap<ValidatorId, BlockSummary>> {
        self.latest_message_hashes()?
            .into_iter()
            .map(|(validator, block_hash)| {
                let summary = self.lookup(block_hash)?.ok_or(Error::DanglingLatestMessage {
                    validator,
                    block_hash,
                })?;

                Ok((validator, summary))
            })
            .collect()
    }

    fn topo_sort(
        &self,
        start_rank: Rank,
        end_rank: Rank,
    ) -> Result<impl Iterator<Item = Result<RankGroup>>> {
        Ok(RankGroups {
            entries: self.ranked_hashes(start_rank, end_rank)?,
            pending: None,
        })
    }

    fn topo_sort_from(
        &self,
        start_rank: Rank,
    ) -> Result<impl Iterator<Item = Result<RankGroup>>> {
        self.topo_sort(start_rank, Rank::MAX)
    }

    fn topo_sort_tail(&self, length: u64) -> Result<impl Iterator<Item = Result<RankGroup>>> {
        let Some(max_rank) = self.max_rank()? else {
            return Ok(Either::Left(core::iter::empty::<Result<RankGroup>>()));
        };

        if length == 0 {
            return Ok(Either::Left(core::iter::empty::<Result<RankGroup>>()));
        }

        let start_rank = max_rank.saturating_sub(length - 1);

        self.topo_sort(start_rank, max_rank).map(Either::Right)
    }

    fn insert(&self, block: &Block) -> Result<()> {
        let _guard = self.insert_lock.lock();

        let block_hash = block.block_hash;

        if self.contains(block_hash)? {
            return Ok(());
        }

        let mut pairs = Vec::with_capacity(
            3 + block.parent_hashes.len() + block.justifications.len(),
        );

        pairs.push((
            block_record_key(block_hash).to_vec(),
            bincode::serialize(&block.to_summary())?,
        ));

        for parent in &block.parent_hashes {
            let mut hashes = self.stored_hash_list(child_index_key(*parent), *parent)?;

            if !hashes.contains(&block_hash) {
                hashes.push(block_hash);
            }

            pairs.push((child_index_key(*parent).to_vec(), bincode::serialize(&hashes)?));
        }

        for justified in block.justified_hashes() {
            let mut hashes =
                self.stored_hash_list(justification_index_key(justified), justified)?;

            if !hashes.contains(&block_hash) {
                hashes.push(block_hash);
            }

            pairs.push((
                justification_index_key(justified).to_vec(),
                bincode::serialize(&hashes)?,
            ));
        }

        pairs.push((
            latest_message_key(block.creator).to_vec(),
            block_hash.as_bytes().to_vec(),
        ));

        pairs.push((rank_index_key(block.rank, block_hash).to_vec(), vec![]));

        self.database.put_batch(pairs)
    }

    fn checkpoint(&self) -> Result<()> {
        // Every insert commits a transaction of its own.
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        info!("clearing block DAG store");
        self.database.clear()
    }

    fn close(self) -> Result<()> {
        Ok(())
    }
}

fn decode_latest_message_pair(key: &[u8], value: &[u8]) -> Result<(ValidatorId, BlockHash)> {
    if key.len() != 1 + HASH_SIZE {
        return Err(Error::MalformedLatestMessageKey { key: key.to_vec() }.into());
    }

    let validator = ValidatorId::from_slice(&key[1..]);

    if value.len() != HASH_SIZE {
        return Err(Error::CorruptedLatestMessage { validator }.into());
    }

    Ok((validator, BlockHash::from_slice(value)))
}

/// Groups an ascending stream of `(rank, hash)` entries into per-rank groups.
struct RankGroups<I> {
    entries: I,
    pending: Option<RankGroup>,
}

impl<I: Iterator<Item = Result<(Rank, BlockHash)>>> Iterator for RankGroups<I> {
    type Item = Result<RankGroup>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.entries.next() {
                Some(Ok((rank, block_hash))) => match &mut self.pending {
                    Some((pending_rank, hashes)) if *pending_rank == rank => {
                        hashes.push(block_hash);
                    }
                    Some(_) => {
                        let finished = self.pending.replace((rank, vec![block_hash]));
                        return finished.map(Ok);
                    }
                    None => self.pending = Some((rank, vec![block_hash])),
                },
                Some(Err(error)) => return Some(Err(error)),
                None => return self.pending.take().map(Ok),
            }
        }
    }
}
