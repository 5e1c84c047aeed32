//! Client-side cache of shard maps and mappings
//!
//! The cache is an accelerator only. It is written after the store commits and
//! entries are evicted whenever the store reports that a cached shard map or
//! mapping no longer exists.

pub mod memory;

pub use memory::InMemoryCacheStore;

use crate::key::{ShardKey, ShardRange};
use crate::store::{StoreMapping, StoreShardMap};

/// How a mapping write treats an entry that is already cached.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheStoreMappingUpdatePolicy {
    /// Replace the entry and restart its timer.
    OverwriteExisting,
    /// Restart the timer of the same mapping without touching its content.
    UpdateTimeToLive,
}

/// Storage for cached shard maps and mappings. Implementations must be safe
/// to share between threads.
pub trait CacheStore: Send + Sync {
    fn add_or_update_shard_map(&self, shard_map: &StoreShardMap);

    /// Forget a shard map and every mapping cached for it.
    fn delete_shard_map(&self, shard_map: &StoreShardMap);

    fn lookup_shard_map_by_name(&self, name: &str) -> Option<StoreShardMap>;

    fn add_or_update_mapping(&self, mapping: &StoreMapping, policy: CacheStoreMappingUpdatePolicy);

    fn delete_mapping(&self, mapping: &StoreMapping);

    /// The live mapping covering `key`, if one is cached.
    fn lookup_mapping_by_key(&self, shard_map: &StoreShardMap, key: &ShardKey) -> Option<StoreMapping>;

    fn lookup_mappings_for_range(&self, shard_map: &StoreShardMap, range: &ShardRange) -> Vec<StoreMapping>;

    fn clear(&self);

    /// Drop expired entries, returning how many were removed.
    fn purge_expired(&self) -> usize;
}
