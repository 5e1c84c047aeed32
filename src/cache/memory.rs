//! Process-local cache behind a read/write lock

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use uuid::Uuid;

use super::{CacheStore, CacheStoreMappingUpdatePolicy};
use crate::key::{ShardKey, ShardRange};
use crate::store::{StoreMapping, StoreShardMap};

struct CacheEntry {
    mapping: StoreMapping,
    refreshed_at: Instant,
}

#[derive(Default)]
struct CacheState {
    shard_maps: HashMap<String, StoreShardMap>,
    /// Per shard map id, entries keyed by their low key.
    mappings: HashMap<Uuid, BTreeMap<ShardKey, CacheEntry>>,
}

pub struct InMemoryCacheStore {
    state: RwLock<CacheState>,
    time_to_live: Option<Duration>,
}

impl Default for InMemoryCacheStore {
    fn default() -> Self {
        Self::new(None)
    }
}

impl InMemoryCacheStore {
    /// `None` keeps entries until they are replaced or evicted.
    pub fn new(time_to_live: Option<Duration>) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            time_to_live,
        }
    }

    pub fn time_to_live(&self) -> Option<Duration> {
        self.time_to_live
    }

    /// Number of cached mappings for a shard map, expired ones included.
    pub fn mapping_count(&self, shard_map_id: Uuid) -> usize {
        self.read().mappings.get(&shard_map_id).map_or(0, BTreeMap::len)
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_live(&self, entry: &CacheEntry, now: Instant) -> bool {
        self.time_to_live
            .map_or(true, |ttl| now.duration_since(entry.refreshed_at) < ttl)
    }
}

impl CacheStore for InMemoryCacheStore {
    fn add_or_update_shard_map(&self, shard_map: &StoreShardMap) {
        let mut state = self.write();
        let replaced = state.shard_maps.insert(shard_map.name.clone(), shard_map.clone());
        if let Some(old) = replaced {
            if old.id != shard_map.id {
                state.mappings.remove(&old.id);
            }
        }
    }

    fn delete_shard_map(&self, shard_map: &StoreShardMap) {
        let mut state = self.write();
        state.shard_maps.remove(&shard_map.name);
        state.mappings.remove(&shard_map.id);
        log::debug!("evicted shard map '{}' from cache", shard_map.name);
    }

    fn lookup_shard_map_by_name(&self, name: &str) -> Option<StoreShardMap> {
        self.read().shard_maps.get(name).cloned()
    }

    fn add_or_update_mapping(&self, mapping: &StoreMapping, policy: CacheStoreMappingUpdatePolicy) {
        let mut state = self.write();
        let entries = state.mappings.entry(mapping.shard_map_id).or_default();
        let now = Instant::now();

        if policy == CacheStoreMappingUpdatePolicy::UpdateTimeToLive {
            if let Some(entry) = entries.get_mut(&mapping.min_value) {
                if entry.mapping.id == mapping.id {
                    entry.refreshed_at = now;
                    return;
                }
            }
        }

        // Anything the new entry overlaps is stale.
        let stale: Vec<ShardKey> = entries
            .iter()
            .filter(|(_, e)| e.mapping.overlaps(mapping))
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            entries.remove(&key);
        }
        entries.insert(
            mapping.min_value.clone(),
            CacheEntry {
                mapping: mapping.clone(),
                refreshed_at: now,
            },
        );
    }

    fn delete_mapping(&self, mapping: &StoreMapping) {
        let mut state = self.write();
        if let Some(entries) = state.mappings.get_mut(&mapping.shard_map_id) {
            if entries.remove(&mapping.min_value).is_some() {
                log::debug!("evicted mapping {} from cache", mapping.describe());
            }
        }
    }

    fn lookup_mapping_by_key(&self, shard_map: &StoreShardMap, key: &ShardKey) -> Option<StoreMapping> {
        let state = self.read();
        let entries = state.mappings.get(&shard_map.id)?;
        let (_, entry) = entries.range(..=key.clone()).next_back()?;
        if entry.mapping.covers(key) && self.is_live(entry, Instant::now()) {
            Some(entry.mapping.clone())
        } else {
            None
        }
    }

    fn lookup_mappings_for_range(&self, shard_map: &StoreShardMap, range: &ShardRange) -> Vec<StoreMapping> {
        let state = self.read();
        let now = Instant::now();
        state
            .mappings
            .get(&shard_map.id)
            .map(|entries| {
                entries
                    .values()
                    .filter(|e| e.mapping.intersects_range(range) && self.is_live(e, now))
                    .map(|e| e.mapping.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn clear(&self) {
        let mut state = self.write();
        state.shard_maps.clear();
        state.mappings.clear();
    }

    fn purge_expired(&self) -> usize {
        if self.time_to_live.is_none() {
            return 0;
        }
        let mut state = self.write();
        let now = Instant::now();
        let mut purged = 0;
        for entries in state.mappings.values_mut() {
            let before = entries.len();
            entries.retain(|_, e| self.is_live(e, now));
            purged += before - entries.len();
        }
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ShardKeyType;
    use crate::store::{MappingStatus, ShardLocation, ShardMapKind, ShardStatus, StoreShard};

    fn shard_map() -> StoreShardMap {
        StoreShardMap::new("orders", ShardMapKind::Range, ShardKeyType::Int32)
    }

    fn range_mapping(map: &StoreShardMap, low: i32, high: i32, db: &str) -> StoreMapping {
        let shard = StoreShard::new(map.id, ShardLocation::new("srv", db), ShardStatus::Online);
        StoreMapping::range(map.id, &ShardRange::i32(low, high).unwrap(), shard, MappingStatus::Online)
    }

    #[test]
    fn test_lookup_by_key_uses_floor_entry() {
        let cache = InMemoryCacheStore::default();
        let map = shard_map();
        cache.add_or_update_mapping(&range_mapping(&map, 0, 100, "a"), CacheStoreMappingUpdatePolicy::OverwriteExisting);
        cache.add_or_update_mapping(&range_mapping(&map, 200, 300, "b"), CacheStoreMappingUpdatePolicy::OverwriteExisting);

        let hit = cache.lookup_mapping_by_key(&map, &ShardKey::from_i32(50)).unwrap();
        assert_eq!(hit.shard.location.database, "a");
        assert!(cache.lookup_mapping_by_key(&map, &ShardKey::from_i32(150)).is_none());
        assert!(cache.lookup_mapping_by_key(&map, &ShardKey::from_i32(-1)).is_none());
        assert_eq!(
            cache.lookup_mappings_for_range(&map, &ShardRange::i32(50, 250).unwrap()).len(),
            2
        );
    }

    #[test]
    fn test_overlapping_entry_replaces_stale_ones() {
        let cache = InMemoryCacheStore::default();
        let map = shard_map();
        cache.add_or_update_mapping(&range_mapping(&map, 0, 50, "a"), CacheStoreMappingUpdatePolicy::OverwriteExisting);
        cache.add_or_update_mapping(&range_mapping(&map, 50, 100, "a"), CacheStoreMappingUpdatePolicy::OverwriteExisting);
        cache.add_or_update_mapping(&range_mapping(&map, 0, 100, "b"), CacheStoreMappingUpdatePolicy::OverwriteExisting);

        assert_eq!(cache.mapping_count(map.id), 1);
        let hit = cache.lookup_mapping_by_key(&map, &ShardKey::from_i32(75)).unwrap();
        assert_eq!(hit.shard.location.database, "b");
    }

    #[test]
    fn test_expired_entries_are_misses() {
        let cache = InMemoryCacheStore::new(Some(Duration::from_millis(20)));
        let map = shard_map();
        let mapping = range_mapping(&map, 0, 100, "a");
        cache.add_or_update_mapping(&mapping, CacheStoreMappingUpdatePolicy::OverwriteExisting);
        assert!(cache.lookup_mapping_by_key(&map, &ShardKey::from_i32(1)).is_some());

        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.lookup_mapping_by_key(&map, &ShardKey::from_i32(1)).is_none());

        // Refreshing the timer brings the same entry back.
        cache.add_or_update_mapping(&mapping, CacheStoreMappingUpdatePolicy::UpdateTimeToLive);
        assert!(cache.lookup_mapping_by_key(&map, &ShardKey::from_i32(1)).is_some());

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.mapping_count(map.id), 0);
    }

    #[test]
    fn test_update_time_to_live_keeps_content() {
        let cache = InMemoryCacheStore::default();
        let map = shard_map();
        let mapping = range_mapping(&map, 0, 100, "a");
        cache.add_or_update_mapping(&mapping, CacheStoreMappingUpdatePolicy::OverwriteExisting);

        let changed = mapping.with_status(MappingStatus::Offline);
        cache.add_or_update_mapping(&changed, CacheStoreMappingUpdatePolicy::UpdateTimeToLive);
        let hit = cache.lookup_mapping_by_key(&map, &ShardKey::from_i32(1)).unwrap();
        assert_eq!(hit.status, MappingStatus::Online);
    }

    #[test]
    fn test_delete_shard_map_drops_its_mappings() {
        let cache = InMemoryCacheStore::default();
        let map = shard_map();
        cache.add_or_update_shard_map(&map);
        cache.add_or_update_mapping(&range_mapping(&map, 0, 100, "a"), CacheStoreMappingUpdatePolicy::OverwriteExisting);

        assert_eq!(cache.lookup_shard_map_by_name("orders").unwrap().id, map.id);
        cache.delete_shard_map(&map);
        assert!(cache.lookup_shard_map_by_name("orders").is_none());
        assert!(cache.lookup_mapping_by_key(&map, &ShardKey::from_i32(1)).is_none());
    }

    #[test]
    fn test_concurrent_lookups() {
        let cache = std::sync::Arc::new(InMemoryCacheStore::default());
        let map = shard_map();
        cache.add_or_update_mapping(&range_mapping(&map, 0, 1000, "a"), CacheStoreMappingUpdatePolicy::OverwriteExisting);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                let map = map.clone();
                std::thread::spawn(move || {
                    for k in 0..100 {
                        assert!(cache.lookup_mapping_by_key(&map, &ShardKey::from_i32(i * 100 + k)).is_some());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
