//! Range shard maps: contiguous half-open key ranges map to shards

use std::ops::Deref;

use uuid::Uuid;

use super::mapper::{ConnectionOptions, LookupOptions, MappingLockToken, MappingUpdate, ShardConnection};
use super::shard_map::{Shard, ShardMap};
use crate::errors::handler::ErrorSite;
use crate::errors::{Result, ShardManagementError, ShardManagementErrorCategory, ShardManagementErrorCode};
use crate::key::{ShardKey, ShardRange};
use crate::operations::OperationCode;
use crate::store::{MappingRemoval, MappingStatus, ShardMapKind, StoreMapping};

/// A key range `[low, high)` mapped to a shard.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeMapping {
    inner: StoreMapping,
}

impl RangeMapping {
    pub(crate) fn new(inner: StoreMapping) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn range(&self) -> Option<ShardRange> {
        self.inner.key_range()
    }

    pub fn low(&self) -> &ShardKey {
        &self.inner.min_value
    }

    pub fn high(&self) -> Option<&ShardKey> {
        self.inner.max_value.as_ref()
    }

    pub fn shard(&self) -> Shard {
        Shard::new(self.inner.shard.clone())
    }

    pub fn status(&self) -> MappingStatus {
        self.inner.status
    }

    pub fn store_mapping(&self) -> &StoreMapping {
        &self.inner
    }
}

#[derive(Clone, Debug)]
pub struct RangeShardMap {
    map: ShardMap,
}

impl Deref for RangeShardMap {
    type Target = ShardMap;

    fn deref(&self) -> &ShardMap {
        &self.map
    }
}

impl TryFrom<ShardMap> for RangeShardMap {
    type Error = ShardManagementError;

    fn try_from(map: ShardMap) -> Result<Self> {
        if map.kind() != ShardMapKind::Range {
            return Err(ShardManagementError::new(
                ShardManagementErrorCategory::ShardMapManager,
                ShardManagementErrorCode::ShardMapTypeConversionError,
                format!("shard map '{}' is a {:?} shard map, not a range shard map", map.name(), map.kind()),
            )
            .with_shard_map(map.name()));
        }
        Ok(Self { map })
    }
}

impl RangeShardMap {
    pub(crate) fn from_shard_map_unchecked(map: ShardMap) -> Self {
        Self { map }
    }

    fn site<'a>(&'a self, operation: &'a str) -> ErrorSite<'a> {
        ErrorSite::new(ShardManagementErrorCategory::RangeShardMap, operation).shard_map(self.store_shard_map())
    }

    fn span(&self, mapping: &StoreMapping, operation: &str) -> Result<ShardRange> {
        mapping.key_range().ok_or_else(|| {
            self.site(operation).error(
                ShardManagementErrorCode::InvalidArgument,
                format!("mapping {} is not a range mapping", mapping.describe()),
            )
        })
    }

    pub fn create_range_mapping(&self, range: ShardRange, shard: &Shard) -> Result<RangeMapping> {
        self.create_range_mapping_with_status(range, shard, MappingStatus::Online)
    }

    pub fn create_range_mapping_with_status(
        &self,
        range: ShardRange,
        shard: &Shard,
        status: MappingStatus,
    ) -> Result<RangeMapping> {
        let mapping = StoreMapping::range(self.id(), &range, shard.store_shard().clone(), status);
        self.mapper().add(mapping, "CreateRangeMapping").map(RangeMapping::new)
    }

    pub fn get_mapping_for_key(&self, key: &ShardKey) -> Result<RangeMapping> {
        self.get_mapping_for_key_with_options(key, LookupOptions::CacheAndStore)
    }

    pub fn get_mapping_for_key_with_options(&self, key: &ShardKey, options: LookupOptions) -> Result<RangeMapping> {
        self.mapper().lookup_required(key, options).map(RangeMapping::new)
    }

    pub fn try_get_mapping_for_key(&self, key: &ShardKey) -> Result<Option<RangeMapping>> {
        Ok(self
            .mapper()
            .lookup(key, LookupOptions::CacheAndStore)?
            .map(RangeMapping::new))
    }

    pub fn get_mappings(&self) -> Result<Vec<RangeMapping>> {
        Ok(self.mapper().get_mappings(None, None)?.into_iter().map(RangeMapping::new).collect())
    }

    /// Mappings intersecting `range`.
    pub fn get_mappings_for_range(&self, range: &ShardRange) -> Result<Vec<RangeMapping>> {
        Ok(self
            .mapper()
            .get_mappings(Some(range), None)?
            .into_iter()
            .map(RangeMapping::new)
            .collect())
    }

    pub fn get_mappings_for_shard(&self, shard: &Shard) -> Result<Vec<RangeMapping>> {
        Ok(self
            .mapper()
            .get_mappings(None, Some(shard))?
            .into_iter()
            .map(RangeMapping::new)
            .collect())
    }

    /// Remove an offline mapping.
    pub fn delete_mapping(&self, mapping: &RangeMapping) -> Result<()> {
        self.delete_mapping_with_lock(mapping, MappingLockToken::NO_LOCK)
    }

    pub fn delete_mapping_with_lock(&self, mapping: &RangeMapping, lock: MappingLockToken) -> Result<()> {
        self.mapper().remove(mapping.store_mapping(), lock)
    }

    pub fn mark_mapping_offline(&self, mapping: &RangeMapping) -> Result<RangeMapping> {
        self.update_mapping(mapping, MappingUpdate::status(MappingStatus::Offline))
    }

    pub fn mark_mapping_online(&self, mapping: &RangeMapping) -> Result<RangeMapping> {
        self.update_mapping(mapping, MappingUpdate::status(MappingStatus::Online))
    }

    pub fn update_mapping(&self, mapping: &RangeMapping, update: MappingUpdate) -> Result<RangeMapping> {
        self.update_mapping_with_lock(mapping, update, MappingLockToken::NO_LOCK)
    }

    pub fn update_mapping_with_lock(
        &self,
        mapping: &RangeMapping,
        update: MappingUpdate,
        lock: MappingLockToken,
    ) -> Result<RangeMapping> {
        self.mapper()
            .update(mapping.store_mapping(), update, lock)
            .map(RangeMapping::new)
    }

    /// Split a mapping in two at `key`. Both halves keep the shard, status
    /// and lock of the original.
    pub fn split_mapping(&self, mapping: &RangeMapping, key: &ShardKey) -> Result<(RangeMapping, RangeMapping)> {
        self.split_mapping_with_lock(mapping, key, MappingLockToken::NO_LOCK)
    }

    pub fn split_mapping_with_lock(
        &self,
        mapping: &RangeMapping,
        key: &ShardKey,
        lock: MappingLockToken,
    ) -> Result<(RangeMapping, RangeMapping)> {
        let mapper = self.mapper();
        let current = mapper.refresh(mapping.store_mapping(), "SplitMapping")?;
        let (low, high) = self.span(&current, "SplitMapping")?.split_at(key)?;

        let left = StoreMapping {
            min_value: low.low().clone(),
            max_value: Some(low.high().clone()),
            ..current.with_new_id()
        };
        let right = StoreMapping {
            min_value: high.low().clone(),
            max_value: Some(high.high().clone()),
            ..current.with_new_id()
        };
        let removal = MappingRemoval {
            mapping: current.clone(),
            lock_owner_id: lock.id(),
        };
        let mut added = mapper.replace(
            OperationCode::SplitMapping,
            current.shard.clone(),
            vec![removal],
            vec![left, right],
        )?;
        log::debug!("split {} at {} in '{}'", current.describe(), key, self.name());
        let right = added.pop().map(RangeMapping::new);
        let left = added.pop().map(RangeMapping::new);
        match (left, right) {
            (Some(left), Some(right)) => Ok((left, right)),
            _ => Err(self.site("SplitMapping").error(
                ShardManagementErrorCode::UnexpectedError,
                "split did not produce two mappings",
            )),
        }
    }

    /// Merge two adjacent mappings on the same shard into one.
    pub fn merge_mappings(&self, left: &RangeMapping, right: &RangeMapping) -> Result<RangeMapping> {
        self.merge_mappings_with_locks(left, right, MappingLockToken::NO_LOCK, MappingLockToken::NO_LOCK)
    }

    pub fn merge_mappings_with_locks(
        &self,
        left: &RangeMapping,
        right: &RangeMapping,
        left_lock: MappingLockToken,
        right_lock: MappingLockToken,
    ) -> Result<RangeMapping> {
        let mapper = self.mapper();
        let left = mapper.refresh(left.store_mapping(), "MergeMappings")?;
        let right = mapper.refresh(right.store_mapping(), "MergeMappings")?;

        if left.shard.id != right.shard.id {
            return Err(self.site("MergeMappings").error(
                ShardManagementErrorCode::InvalidArgument,
                format!(
                    "{} and {} are on different shards",
                    left.describe(),
                    right.describe()
                ),
            ));
        }
        let left_span = self.span(&left, "MergeMappings")?;
        let right_span = self.span(&right, "MergeMappings")?;
        if !left_span.is_adjacent_to(&right_span) {
            return Err(self.site("MergeMappings").error(
                ShardManagementErrorCode::InvalidArgument,
                format!("{} is not immediately followed by {}", left_span, right_span),
            ));
        }

        let merged = StoreMapping {
            max_value: right.max_value.clone(),
            ..left.with_new_id()
        };
        let removals = vec![
            MappingRemoval {
                mapping: left.clone(),
                lock_owner_id: left_lock.id(),
            },
            MappingRemoval {
                mapping: right,
                lock_owner_id: right_lock.id(),
            },
        ];
        let mut added = mapper.replace(OperationCode::MergeMappings, left.shard.clone(), removals, vec![merged])?;
        added.pop().map(RangeMapping::new).ok_or_else(|| {
            self.site("MergeMappings")
                .error(ShardManagementErrorCode::UnexpectedError, "merge did not produce a mapping")
        })
    }

    pub fn lock_mapping(&self, mapping: &RangeMapping, lock: MappingLockToken) -> Result<()> {
        self.mapper().lock(mapping.store_mapping(), lock)
    }

    pub fn unlock_mapping(&self, mapping: &RangeMapping, lock: MappingLockToken) -> Result<()> {
        self.mapper().unlock(mapping.store_mapping(), lock)
    }

    pub fn get_mapping_lock_owner(&self, mapping: &RangeMapping) -> Result<MappingLockToken> {
        self.mapper().lock_owner(mapping.store_mapping())
    }

    pub fn unlock_all_mappings(&self) -> Result<()> {
        self.mapper().unlock_all(None)
    }

    pub fn unlock_all_mappings_for_owner(&self, lock: MappingLockToken) -> Result<()> {
        self.mapper().unlock_all(Some(lock))
    }

    pub fn open_connection_for_key(&self, key: &ShardKey, options: ConnectionOptions) -> Result<ShardConnection> {
        self.mapper().open_connection(key, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ShardKeyType;
    use crate::test_support::Harness;

    fn range_map(harness: &Harness) -> (RangeShardMap, Shard) {
        let map = harness
            .manager
            .create_range_shard_map("orders", ShardKeyType::Int32)
            .unwrap()
            .into_inner();
        let shard = map.create_shard(harness.shard_location("shard1")).unwrap();
        (map, shard)
    }

    fn spans(map: &RangeShardMap) -> Vec<(i32, i32)> {
        map.get_mappings()
            .unwrap()
            .iter()
            .map(|m| (m.low().as_i32().unwrap(), m.high().and_then(|h| h.as_i32()).unwrap()))
            .collect()
    }

    #[test]
    fn test_overlapping_ranges_are_rejected() {
        let harness = Harness::new();
        let (map, shard) = range_map(&harness);
        map.create_range_mapping(ShardRange::i32(0, 100).unwrap(), &shard).unwrap();

        let err = map
            .create_range_mapping(ShardRange::i32(50, 150).unwrap(), &shard)
            .err()
            .unwrap();
        assert_eq!(err.code, ShardManagementErrorCode::MappingRangeAlreadyMapped);

        map.create_range_mapping(ShardRange::i32(100, 150).unwrap(), &shard).unwrap();
        assert_eq!(spans(&map), vec![(0, 100), (100, 150)]);
        assert_eq!(map.get_mappings_for_range(&ShardRange::i32(90, 110).unwrap()).unwrap().len(), 2);
    }

    #[test]
    fn test_split_then_merge() {
        let harness = Harness::new();
        let (map, shard) = range_map(&harness);
        let whole = map.create_range_mapping(ShardRange::i32(0, 100).unwrap(), &shard).unwrap();

        let (left, right) = map.split_mapping(&whole, &ShardKey::from_i32(40)).unwrap();
        assert_eq!(spans(&map), vec![(0, 40), (40, 100)]);
        assert_eq!(map.get_mapping_for_key(&ShardKey::from_i32(39)).unwrap().id(), left.id());
        assert_eq!(map.get_mapping_for_key(&ShardKey::from_i32(40)).unwrap().id(), right.id());

        let err = map.merge_mappings(&right, &left).err().unwrap();
        assert_eq!(err.code, ShardManagementErrorCode::InvalidArgument);

        let merged = map.merge_mappings(&left, &right).unwrap();
        assert_eq!(merged.range(), Some(ShardRange::i32(0, 100).unwrap()));
        assert_eq!(spans(&map), vec![(0, 100)]);

        let lsm = harness.store.local_state(shard.location()).unwrap();
        assert_eq!(lsm.mappings.len(), 1);
        assert_eq!(lsm.mappings[0].id, merged.id());
    }

    #[test]
    fn test_split_outside_range_fails() {
        let harness = Harness::new();
        let (map, shard) = range_map(&harness);
        let whole = map.create_range_mapping(ShardRange::i32(0, 10).unwrap(), &shard).unwrap();
        assert!(map.split_mapping(&whole, &ShardKey::from_i32(10)).is_err());
        assert!(map.split_mapping(&whole, &ShardKey::from_i32(0)).is_err());
        assert_eq!(spans(&map), vec![(0, 10)]);
    }

    #[test]
    fn test_merge_across_shards_fails() {
        let harness = Harness::new();
        let (map, first) = range_map(&harness);
        let second = map.create_shard(harness.shard_location("shard2")).unwrap();
        let left = map.create_range_mapping(ShardRange::i32(0, 10).unwrap(), &first).unwrap();
        let right = map.create_range_mapping(ShardRange::i32(10, 20).unwrap(), &second).unwrap();

        let err = map.merge_mappings(&left, &right).err().unwrap();
        assert_eq!(err.code, ShardManagementErrorCode::InvalidArgument);
    }
}
