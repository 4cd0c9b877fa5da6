use std::sync::Arc;

use anyhow::Result;
use im::{HashMap, HashSet};
use storage_metrics::StorageMetrics;
use types::{
    containers::{Block, BlockSummary},
    primitives::{BlockHash, Rank, ValidatorId},
};

use crate::store::{BlockDagStore, RankGroup};

/// Records call counts and latencies of every operation of an inner store.
///
/// Compositional like [`CachingDagStore`](crate::CachingDagStore); the two
/// are typically stacked as metered-over-caching-over-durable, with distinct
/// `name` labels when metered layers are stacked more than once.
pub struct MeteredDagStore<S> {
    store: S,
    name: &'static str,
    metrics: Arc<StorageMetrics>,
}

impl<S: BlockDagStore> MeteredDagStore<S> {
    #[must_use]
    pub const fn new(store: S, name: &'static str, metrics: Arc<StorageMetrics>) -> Self {
        Self {
            store,
            name,
            metrics,
        }
    }

    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }
}

impl<S: BlockDagStore> BlockDagStore for MeteredDagStore<S> {
    fn children(&self, block_hash: BlockHash) -> Result<HashSet<BlockHash>> {
        let _timer = self.metrics.observe_operation(self.name, "children");
        self.store.children(block_hash)
    }

    fn justification_to_blocks(&self, block_hash: BlockHash) -> Result<HashSet<BlockHash>> {
        let _timer = self
            .metrics
            .observe_operation(self.name, "justification_to_blocks");
        self.store.justification_to_blocks(block_hash)
    }

    fn contains(&self, block_hash: BlockHash) -> Result<bool> {
        let _timer = self.metrics.observe_operation(self.name, "contains");
        self.store.contains(block_hash)
    }

    fn lookup(&self, block_hash: BlockHash) -> Result<Option<BlockSummary>> {
        let _timer = self.metrics.observe_operation(self.name, "lookup");
        self.store.lookup(block_hash)
    }

    fn latest_message_hash(&self, validator: ValidatorId) -> Result<Option<BlockHash>> {
        let _timer = self
            .metrics
            .observe_operation(self.name, "latest_message_hash");
        self.store.latest_message_hash(validator)
    }

    fn latest_message(&self, validator: ValidatorId) -> Result<Option<BlockSummary>> {
        let _timer = self.metrics.observe_operation(self.name, "latest_message");
        self.store.latest_message(validator)
    }

    fn latest_message_hashes(&self) -> Result<HashMap<ValidatorId, BlockHash>> {
        let _timer = self
            .metrics
            .observe_operation(self.name, "latest_message_hashes");
        self.store.latest_message_hashes()
    }

    fn latest_messages(&self) -> Result<HashMap<ValidatorId, BlockSummary>> {
        let _timer = self.metrics.observe_operation(self.name, "latest_messages");
        self.store.latest_messages()
    }

    // The timers below only cover setting up the traversal, not consuming
    // the returned iterator.

    fn topo_sort(
        &self,
        start_rank: Rank,
        end_rank: Rank,
    ) -> Result<impl Iterator<Item = Result<RankGroup>>> {
        let _timer = self.metrics.observe_operation(self.name, "topo_sort");
        self.store.topo_sort(start_rank, end_rank)
    }

    fn topo_sort_from(
        &self,
        start_rank: Rank,
    ) -> Result<impl Iterator<Item = Result<RankGroup>>> {
        let _timer = self.metrics.observe_operation(self.name, "topo_sort_from");
        self.store.topo_sort_from(start_rank)
    }

    fn topo_sort_tail(&self, length: u64) -> Result<impl Iterator<Item = Result<RankGroup>>> {
        let _timer = self.metrics.observe_operation(self.name, "topo_sort_tail");
        self.store.topo_sort_tail(length)
    }

    fn insert(&self, block: &Block) -> Result<()> {
        let _timer = self.metrics.observe_operation(self.name, "insert");
        self.store.insert(block)
    }

    fn checkpoint(&self) -> Result<()> {
        let _timer = self.metrics.observe_operation(self.name, "checkpoint");
        self.store.checkpoint()
    }

    fn clear(&self) -> Result<()> {
        let _timer = self.metrics.observe_operation(self.name, "clear");
        self.store.clear()
    }

    fn close(self) -> Result<()> {
        let _timer = self.metrics.observe_operation(self.name, "close");
        self.store.close()
    }
}

#[cfg(test)]
mod tests {
    use database::Database;

    use crate::durable::DurableDagStore;

    use super::*;

    #[test]
    fn operations_are_counted_and_delegated() -> Result<()> {
        let metrics = Arc::new(StorageMetrics::new()?);

        let store = MeteredDagStore::new(
            DurableDagStore::new(Database::in_memory()),
            "dag",
            Arc::clone(&metrics),
        );

        let block = Block {
            block_hash: BlockHash::repeat_byte(1),
            creator: ValidatorId::repeat_byte(2),
            rank: 0,
            parent_hashes: vec![],
            justifications: vec![],
            body: vec![],
        };

        store.insert(&block)?;

        assert!(store.contains(block.block_hash)?);
        assert!(store.contains(block.block_hash)?);

        let inserts = metrics
            .operation_calls
            .get_metric_with_label_values(&["dag", "insert"])?
            .get();

        let contains_calls = metrics
            .operation_calls
            .get_metric_with_label_values(&["dag", "contains"])?
            .get();

        assert_eq!(inserts, 1);
        assert_eq!(contains_calls, 2);

        Ok(())
    }
}
