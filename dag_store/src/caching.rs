use std::sync::Arc;

use anyhow::Result;
use bytesize::ByteSize;
use im::{HashMap, HashSet};
use storage_metrics::StorageMetrics;
use types::{
    containers::{Block, BlockSummary},
    primitives::{BlockHash, Rank, ValidatorId},
};

use crate::{
    index_cache::WeightedIndexCache,
    store::{BlockDagStore, RankGroup},
};

const CHILD_INDEX: &str = "children";
const JUSTIFICATION_INDEX: &str = "justifications";

/// Caches the child and justification reverse-indices of an inner store.
///
/// Only `insert` populates the caches. A read miss is answered by the inner
/// store and deliberately not cached; the reverse-indices are hot for blocks
/// near the tips, which the insert path keeps cached, while blocks read once
/// during historical traversals would only displace them.
pub struct CachingDagStore<S> {
    store: S,
    name: &'static str,
    children: WeightedIndexCache,
    justifications: WeightedIndexCache,
    metrics: Option<Arc<StorageMetrics>>,
}

impl<S: BlockDagStore> CachingDagStore<S> {
    /// `cache_budget` is shared evenly between the two index caches.
    #[must_use]
    pub fn new(
        store: S,
        name: &'static str,
        cache_budget: ByteSize,
        metrics: Option<Arc<StorageMetrics>>,
    ) -> Self {
        let index_budget = ByteSize::b(cache_budget.as_u64() / 2);

        Self {
            store,
            name,
            children: WeightedIndexCache::new(index_budget),
            justifications: WeightedIndexCache::new(index_budget),
            metrics,
        }
    }

    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    fn record_child_edge(&self, parent: BlockHash, child: BlockHash) -> Result<()> {
        // When the entry is not cached (never cached or evicted) it is
        // re-created from the inner store inside the cache's per-key critical
        // section, so the written-back relation is complete and cannot be
        // clobbered by a concurrent insert touching the same parent.
        self.children
            .extend_or_rebuild(parent, child, || self.store.children(parent))
    }

    fn record_justification_edge(&self, justified: BlockHash, block: BlockHash) -> Result<()> {
        self.justifications.extend_or_rebuild(justified, block, || {
            self.store.justification_to_blocks(justified)
        })
    }

    fn record_hit(&self, index: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_index_cache_hit(self.name, index);
        }
    }

    fn record_miss(&self, index: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_index_cache_miss(self.name, index);
        }
    }

    fn report_cache_sizes(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_index_cache_size(
                self.name,
                CHILD_INDEX,
                self.children.weight(),
                self.children.len(),
            );

            metrics.set_index_cache_size(
                self.name,
                JUSTIFICATION_INDEX,
                self.justifications.weight(),
                self.justifications.len(),
            );
        }
    }
}

impl<S: BlockDagStore> BlockDagStore for CachingDagStore<S> {
    fn children(&self, block_hash: BlockHash) -> Result<HashSet<BlockHash>> {
        if let Some(cached) = self.children.get(block_hash) {
            self.record_hit(CHILD_INDEX);
            return Ok(cached);
        }

        self.record_miss(CHILD_INDEX);
        self.store.children(block_hash)
    }

    fn justification_to_blocks(&self, block_hash: BlockHash) -> Result<HashSet<BlockHash>> {
        if let Some(cached) = self.justifications.get(block_hash) {
            self.record_hit(JUSTIFICATION_INDEX);
            return Ok(cached);
        }

        self.record_miss(JUSTIFICATION_INDEX);
        self.store.justification_to_blocks(block_hash)
    }

    fn contains(&self, block_hash: BlockHash) -> Result<bool> {
        // A block cached as somebody's child is known. Only children values
        // are inspected; a negative answer still requires the inner store.
        if self.children.contains_member(block_hash) {
            return Ok(true);
        }

        self.store.contains(block_hash)
    }

    fn lookup(&self, block_hash: BlockHash) -> Result<Option<BlockSummary>> {
        self.store.lookup(block_hash)
    }

    fn latest_message_hash(&self, validator: ValidatorId) -> Result<Option<BlockHash>> {
        self.store.latest_message_hash(validator)
    }

    fn latest_message(&self, validator: ValidatorId) -> Result<Option<BlockSummary>> {
        self.store.latest_message(validator)
    }

    fn latest_message_hashes(&self) -> Result<HashMap<ValidatorId, BlockHash>> {
        self.store.latest_message_hashes()
    }

    fn latest_messages(&self) -> Result<HashMap<ValidatorId, BlockSummary>> {
        self.store.latest_messages()
    }

    fn topo_sort(
        &self,
        start_rank: Rank,
        end_rank: Rank,
    ) -> Result<impl Iterator<Item = Result<RankGroup>>> {
        self.store.topo_sort(start_rank, end_rank)
    }

    fn topo_sort_from(
        &self,
        start_rank: Rank,
    ) -> Result<impl Iterator<Item = Result<RankGroup>>> {
        self.store.topo_sort_from(start_rank)
    }

    fn topo_sort_tail(&self, length: u64) -> Result<impl Iterator<Item = Result<RankGroup>>> {
        self.store.topo_sort_tail(length)
    }

    fn insert(&self, block: &Block) -> Result<()> {
        // The inner store commits first. The caches never get ahead of it,
        // so a crash between the two steps loses nothing.
        self.store.insert(block)?;

        for parent in &block.parent_hashes {
            self.record_child_edge(*parent, block.block_hash)?;
        }

        for justified in block.justified_hashes() {
            self.record_justification_edge(justified, block.block_hash)?;
        }

        self.report_cache_sizes();

        Ok(())
    }

    fn checkpoint(&self) -> Result<()> {
        self.store.checkpoint()
    }

    fn clear(&self) -> Result<()> {
        // Invalidate before delegating so a failure below cannot leave stale
        // relations cached over an emptied store.
        self.children.clear();
        self.justifications.clear();
        self.store.clear()
    }

    fn close(self) -> Result<()> {
        self.store.close()
    }
}

#[cfg(test)]
mod tests {
    use database::Database;
    use types::containers::Justification;

    use crate::durable::DurableDagStore;

    use super::*;

    const GENESIS_HASH: BlockHash = BlockHash::repeat_byte(1);
    const VALIDATOR_1: ValidatorId = ValidatorId::repeat_byte(0xa1);
    const VALIDATOR_2: ValidatorId = ValidatorId::repeat_byte(0xa2);

    fn build_store(budget: ByteSize) -> CachingDagStore<DurableDagStore> {
        CachingDagStore::new(
            DurableDagStore::new(Database::in_memory()),
            "test",
            budget,
            None,
        )
    }

    fn genesis() -> Block {
        Block {
            block_hash: GENESIS_HASH,
            creator: ValidatorId::zero(),
            rank: 0,
            parent_hashes: vec![],
            justifications: vec![],
            body: vec![],
        }
    }

    fn child(hash_byte: u8, parent: BlockHash, creator: ValidatorId) -> Block {
        Block {
            block_hash: BlockHash::repeat_byte(hash_byte),
            creator,
            rank: 1,
            parent_hashes: vec![parent],
            justifications: vec![],
            body: vec![],
        }
    }

    #[test]
    fn insert_populates_cache_and_inner_store() -> Result<()> {
        let store = build_store(ByteSize::kib(64));

        store.insert(&genesis())?;
        store.insert(&child(2, GENESIS_HASH, VALIDATOR_1))?;

        assert_eq!(
            store.children(GENESIS_HASH)?,
            HashSet::from_iter([BlockHash::repeat_byte(2)]),
        );

        assert_eq!(
            store.store().children(GENESIS_HASH)?,
            HashSet::from_iter([BlockHash::repeat_byte(2)]),
        );

        Ok(())
    }

    #[test]
    fn read_misses_are_not_cached() -> Result<()> {
        let store = build_store(ByteSize::kib(64));

        // Writes through the inner store bypass the caches entirely.
        store.store().insert(&genesis())?;
        store.store().insert(&child(2, GENESIS_HASH, VALIDATOR_1))?;

        assert_eq!(store.children(GENESIS_HASH)?.len(), 1);

        // A cached read would now be stale. A second miss observes the
        // new inner state, proving the first miss populated nothing.
        store.store().insert(&child(3, GENESIS_HASH, VALIDATOR_2))?;

        assert_eq!(store.children(GENESIS_HASH)?.len(), 2);

        Ok(())
    }

    #[test]
    fn all_indices_accumulate_across_inserts() -> Result<()> {
        let store = build_store(ByteSize::kib(64));

        store.insert(&genesis())?;
        store.insert(&child(2, GENESIS_HASH, VALIDATOR_1))?;
        store.insert(&child(3, GENESIS_HASH, VALIDATOR_2))?;

        let mut grandchild = child(4, BlockHash::repeat_byte(2), VALIDATOR_1);
        grandchild.rank = 2;
        grandchild.justifications = vec![Justification {
            validator: VALIDATOR_1,
            latest_block_hash: GENESIS_HASH,
        }];

        store.insert(&grandchild)?;

        assert_eq!(
            store.children(GENESIS_HASH)?,
            HashSet::from_iter([BlockHash::repeat_byte(2), BlockHash::repeat_byte(3)]),
        );

        assert_eq!(
            store.children(BlockHash::repeat_byte(2))?,
            HashSet::from_iter([BlockHash::repeat_byte(4)]),
        );

        assert_eq!(
            store.justification_to_blocks(GENESIS_HASH)?,
            HashSet::from_iter([BlockHash::repeat_byte(4)]),
        );

        Ok(())
    }

    #[test]
    fn contains_answers_from_cached_members() -> Result<()> {
        let store = build_store(ByteSize::kib(64));

        store.insert(&genesis())?;
        store.insert(&child(2, GENESIS_HASH, VALIDATOR_1))?;

        // Emptying the inner store exposes which lookups touch it. The new
        // block is cached as a child of genesis and still answers true;
        // genesis itself only occurs as a cache key and is delegated.
        store.store().clear()?;

        assert!(store.contains(BlockHash::repeat_byte(2))?);
        assert!(!store.contains(GENESIS_HASH)?);

        Ok(())
    }

    #[test]
    fn justification_index_is_cached_on_insert() -> Result<()> {
        let store = build_store(ByteSize::kib(64));

        store.insert(&genesis())?;

        let mut block = child(2, GENESIS_HASH, VALIDATOR_1);
        block.justifications = vec![Justification {
            validator: VALIDATOR_2,
            latest_block_hash: GENESIS_HASH,
        }];

        store.insert(&block)?;
        store.store().clear()?;

        // Still answered from the cache after the inner store is emptied.
        assert_eq!(
            store.justification_to_blocks(GENESIS_HASH)?,
            HashSet::from_iter([BlockHash::repeat_byte(2)]),
        );

        Ok(())
    }

    #[test]
    fn recreated_entries_are_complete_after_eviction() -> Result<()> {
        // A budget this small holds one entry per cache shard at most.
        let store = build_store(ByteSize::b(64));

        // Both parents land in the same cache shard (their low bytes are
        // equal modulo the shard count), so inserting children of one keeps
        // evicting the other's entry.
        let parent_a = GENESIS_HASH;
        let parent_b = BlockHash::repeat_byte(17);

        store.insert(&genesis())?;

        let mut second_root = genesis();
        second_root.block_hash = parent_b;
        store.insert(&second_root)?;

        for hash_byte in 32_u8..72 {
            let parent = if hash_byte % 2 == 0 { parent_a } else { parent_b };
            store.insert(&child(hash_byte, parent, VALIDATOR_1))?;
        }

        // Evicted entries were re-created from the inner store on the next
        // insert, so neither relation is missing earlier children.
        assert_eq!(store.children(parent_a)?, store.store().children(parent_a)?);
        assert_eq!(store.children(parent_b)?, store.store().children(parent_b)?);
        assert_eq!(store.children(parent_a)?.len(), 20);

        Ok(())
    }

    #[test]
    fn concurrent_inserts_lose_no_edges() -> Result<()> {
        let store = build_store(ByteSize::kib(64));

        store.insert(&genesis())?;

        std::thread::scope(|scope| {
            for thread in 0_u8..4 {
                let store = &store;

                scope.spawn(move || {
                    for index in 0_u8..10 {
                        let hash_byte = 2 + thread * 10 + index;
                        store
                            .insert(&child(hash_byte, GENESIS_HASH, VALIDATOR_1))
                            .expect("insert succeeds");
                    }
                });
            }
        });

        assert_eq!(store.children(GENESIS_HASH)?.len(), 40);
        assert_eq!(store.store().children(GENESIS_HASH)?.len(), 40);

        Ok(())
    }

    #[test]
    fn concurrent_inserts_under_eviction_pressure_keep_relations_complete() -> Result<()> {
        // A budget this small keeps evicting and re-creating the entries for
        // the two parents (same cache shard) while threads race on them. A
        // re-creation racing another insert of the same parent must not write
        // back a relation missing that insert's edge.
        let store = build_store(ByteSize::b(64));

        let parent_a = GENESIS_HASH;
        let parent_b = BlockHash::repeat_byte(17);

        store.insert(&genesis())?;

        let mut second_root = genesis();
        second_root.block_hash = parent_b;
        store.insert(&second_root)?;

        std::thread::scope(|scope| {
            for thread in 0_u8..4 {
                let store = &store;

                scope.spawn(move || {
                    for index in 0_u8..10 {
                        let hash_byte = 32 + thread * 10 + index;
                        let parent = if hash_byte % 2 == 0 { parent_a } else { parent_b };
                        store
                            .insert(&child(hash_byte, parent, VALIDATOR_1))
                            .expect("insert succeeds");
                    }
                });
            }
        });

        // Cached or delegated, the observed relations must match the
        // authoritative ones exactly.
        assert_eq!(store.children(parent_a)?, store.store().children(parent_a)?);
        assert_eq!(store.children(parent_b)?, store.store().children(parent_b)?);
        assert_eq!(store.children(parent_a)?.len(), 20);
        assert_eq!(store.children(parent_b)?.len(), 20);

        Ok(())
    }

    #[test]
    fn clear_invalidates_caches() -> Result<()> {
        let store = build_store(ByteSize::kib(64));

        store.insert(&genesis())?;
        store.insert(&child(2, GENESIS_HASH, VALIDATOR_1))?;

        store.clear()?;

        assert!(!store.contains(BlockHash::repeat_byte(2))?);
        assert_eq!(store.children(GENESIS_HASH)?, HashSet::new());

        Ok(())
    }

    #[test]
    fn hits_and_misses_are_counted() -> Result<()> {
        let metrics = Arc::new(StorageMetrics::new()?);

        let store = CachingDagStore::new(
            DurableDagStore::new(Database::in_memory()),
            "test",
            ByteSize::kib(64),
            Some(Arc::clone(&metrics)),
        );

        store.insert(&genesis())?;
        store.insert(&child(2, GENESIS_HASH, VALIDATOR_1))?;

        store.children(GENESIS_HASH)?;
        store.children(BlockHash::repeat_byte(9))?;

        let hits = metrics
            .index_cache_hits
            .get_metric_with_label_values(&["test", CHILD_INDEX])?
            .get();

        let misses = metrics
            .index_cache_misses
            .get_metric_with_label_values(&["test", CHILD_INDEX])?
            .get();

        assert_eq!(hits, 1);
        assert_eq!(misses, 1);

        Ok(())
    }
}
