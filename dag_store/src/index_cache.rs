use anyhow::Result;
use bytesize::ByteSize;
use im::HashSet;
use lru::LruCache;
use parking_lot::Mutex;
use types::primitives::BlockHash;

const SHARD_COUNT: usize = 16;

// Cached relations are sets of 32 byte hashes. An entry is charged for its
// members plus one hash worth of overhead for the key.
const HASH_WEIGHT: u64 = size_of::<BlockHash>() as u64;

fn entry_weight(value: &HashSet<BlockHash>) -> u64 {
    (value.len() as u64 + 1) * HASH_WEIGHT
}

struct Shard {
    entries: LruCache<BlockHash, HashSet<BlockHash>>,
    weight: u64,
}

impl Default for Shard {
    fn default() -> Self {
        Self {
            entries: LruCache::unbounded(),
            weight: 0,
        }
    }
}

/// A byte-budgeted map from block hashes to sets of block hashes.
///
/// Keys are striped over [`SHARD_COUNT`] independently locked LRU shards, so
/// operations on different keys rarely contend. Each shard holds an equal
/// share of the byte budget and evicts its least recently used entries when
/// over it. A shard always retains its most recent entry, so a lone entry
/// larger than the shard budget is admitted rather than thrashed.
pub struct WeightedIndexCache {
    shards: Vec<Mutex<Shard>>,
    shard_budget: u64,
}

impl WeightedIndexCache {
    #[must_use]
    pub fn new(budget: ByteSize) -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::default()).collect(),
            shard_budget: budget.as_u64() / SHARD_COUNT as u64,
        }
    }

    fn shard(&self, key: BlockHash) -> &Mutex<Shard> {
        let index = key.to_low_u64_be() as usize % SHARD_COUNT;
        &self.shards[index]
    }

    pub fn get(&self, key: BlockHash) -> Option<HashSet<BlockHash>> {
        self.shard(key).lock().entries.get(&key).cloned()
    }

    /// Adds `member` to the cached relation for `key`, calling `rebuild` for
    /// the authoritative relation when none is cached.
    ///
    /// The whole operation, including `rebuild`, runs under the shard lock.
    /// Updates of one key therefore serialize: a rebuild can neither be
    /// overwritten by a concurrent update it did not observe nor write back
    /// a relation that went stale while it ran. The price is that `rebuild`
    /// may block other keys of the same shard.
    pub fn extend_or_rebuild(
        &self,
        key: BlockHash,
        member: BlockHash,
        rebuild: impl FnOnce() -> Result<HashSet<BlockHash>>,
    ) -> Result<()> {
        let mut shard = self.shard(key).lock();

        if let Some(value) = shard.entries.get_mut(&key) {
            if value.insert(member).is_none() {
                shard.weight += HASH_WEIGHT;
                Self::evict(&mut shard, self.shard_budget);
            }

            return Ok(());
        }

        let value = rebuild()?.update(member);
        Self::put_locked(&mut shard, key, value, self.shard_budget);

        Ok(())
    }

    /// Caches `value` for `key`, replacing any cached relation.
    pub fn put(&self, key: BlockHash, value: HashSet<BlockHash>) {
        let mut shard = self.shard(key).lock();
        Self::put_locked(&mut shard, key, value, self.shard_budget);
    }

    /// Whether `member` occurs in any cached relation. Inspects cached values
    /// only and never touches the authoritative representation.
    #[must_use]
    pub fn contains_member(&self, member: BlockHash) -> bool {
        self.shards.iter().any(|shard| {
            shard
                .lock()
                .entries
                .iter()
                .any(|(_, value)| value.contains(&member))
        })
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            let mut shard = shard.lock();
            shard.entries.clear();
            shard.weight = 0;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().entries.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn weight(&self) -> u64 {
        self.shards.iter().map(|shard| shard.lock().weight).sum()
    }

    fn put_locked(shard: &mut Shard, key: BlockHash, value: HashSet<BlockHash>, shard_budget: u64) {
        shard.weight += entry_weight(&value);

        if let Some(replaced) = shard.entries.put(key, value) {
            shard.weight -= entry_weight(&replaced);
        }

        Self::evict(shard, shard_budget);
    }

    fn evict(shard: &mut Shard, shard_budget: u64) {
        while shard.weight > shard_budget && shard.entries.len() > 1 {
            if let Some((_, evicted)) = shard.entries.pop_lru() {
                shard.weight -= entry_weight(&evicted);
            }
        }
    }
}
