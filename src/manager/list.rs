//! List shard maps: each key maps to a shard individually

use std::ops::Deref;

use uuid::Uuid;

use super::mapper::{ConnectionOptions, LookupOptions, MappingLockToken, MappingUpdate, ShardConnection};
use super::shard_map::{Shard, ShardMap};
use crate::errors::{Result, ShardManagementError, ShardManagementErrorCategory, ShardManagementErrorCode};
use crate::key::ShardKey;
use crate::store::{MappingStatus, ShardMapKind, StoreMapping};

/// A single key mapped to a shard.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PointMapping {
    inner: StoreMapping,
}

impl PointMapping {
    pub(crate) fn new(inner: StoreMapping) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn key(&self) -> &ShardKey {
        &self.inner.min_value
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
pub struct ListShardMap {
    map: ShardMap,
}

impl Deref for ListShardMap {
    type Target = ShardMap;

    fn deref(&self) -> &ShardMap {
        &self.map
    }
}

impl TryFrom<ShardMap> for ListShardMap {
    type Error = ShardManagementError;

    fn try_from(map: ShardMap) -> Result<Self> {
        if map.kind() != ShardMapKind::List {
            return Err(ShardManagementError::new(
                ShardManagementErrorCategory::ShardMapManager,
                ShardManagementErrorCode::ShardMapTypeConversionError,
                format!("shard map '{}' is a {:?} shard map, not a list shard map", map.name(), map.kind()),
            )
            .with_shard_map(map.name()));
        }
        Ok(Self { map })
    }
}

impl ListShardMap {
    pub(crate) fn from_shard_map_unchecked(map: ShardMap) -> Self {
        Self { map }
    }

    pub fn create_point_mapping(&self, key: ShardKey, shard: &Shard) -> Result<PointMapping> {
        self.create_point_mapping_with_status(key, shard, MappingStatus::Online)
    }

    pub fn create_point_mapping_with_status(
        &self,
        key: ShardKey,
        shard: &Shard,
        status: MappingStatus,
    ) -> Result<PointMapping> {
        let mapping = StoreMapping::point(self.id(), key, shard.store_shard().clone(), status);
        self.mapper().add(mapping, "CreatePointMapping").map(PointMapping::new)
    }

    pub fn get_mapping_for_key(&self, key: &ShardKey) -> Result<PointMapping> {
        self.get_mapping_for_key_with_options(key, LookupOptions::CacheAndStore)
    }

    pub fn get_mapping_for_key_with_options(&self, key: &ShardKey, options: LookupOptions) -> Result<PointMapping> {
        self.mapper().lookup_required(key, options).map(PointMapping::new)
    }

    pub fn try_get_mapping_for_key(&self, key: &ShardKey) -> Result<Option<PointMapping>> {
        Ok(self
            .mapper()
            .lookup(key, LookupOptions::CacheAndStore)?
            .map(PointMapping::new))
    }

    pub fn get_mappings(&self) -> Result<Vec<PointMapping>> {
        Ok(self.mapper().get_mappings(None, None)?.into_iter().map(PointMapping::new).collect())
    }

    pub fn get_mappings_for_shard(&self, shard: &Shard) -> Result<Vec<PointMapping>> {
        Ok(self
            .mapper()
            .get_mappings(None, Some(shard))?
            .into_iter()
            .map(PointMapping::new)
            .collect())
    }

    /// Remove an offline mapping.
    pub fn delete_mapping(&self, mapping: &PointMapping) -> Result<()> {
        self.delete_mapping_with_lock(mapping, MappingLockToken::NO_LOCK)
    }

    pub fn delete_mapping_with_lock(&self, mapping: &PointMapping, lock: MappingLockToken) -> Result<()> {
        self.mapper().remove(mapping.store_mapping(), lock)
    }

    pub fn mark_mapping_offline(&self, mapping: &PointMapping) -> Result<PointMapping> {
        self.update_mapping(mapping, MappingUpdate::status(MappingStatus::Offline))
    }

    pub fn mark_mapping_online(&self, mapping: &PointMapping) -> Result<PointMapping> {
        self.update_mapping(mapping, MappingUpdate::status(MappingStatus::Online))
    }

    pub fn update_mapping(&self, mapping: &PointMapping, update: MappingUpdate) -> Result<PointMapping> {
        self.update_mapping_with_lock(mapping, update, MappingLockToken::NO_LOCK)
    }

    pub fn update_mapping_with_lock(
        &self,
        mapping: &PointMapping,
        update: MappingUpdate,
        lock: MappingLockToken,
    ) -> Result<PointMapping> {
        self.mapper()
            .update(mapping.store_mapping(), update, lock)
            .map(PointMapping::new)
    }

    pub fn lock_mapping(&self, mapping: &PointMapping, lock: MappingLockToken) -> Result<()> {
        self.mapper().lock(mapping.store_mapping(), lock)
    }

    pub fn unlock_mapping(&self, mapping: &PointMapping, lock: MappingLockToken) -> Result<()> {
        self.mapper().unlock(mapping.store_mapping(), lock)
    }

    pub fn get_mapping_lock_owner(&self, mapping: &PointMapping) -> Result<MappingLockToken> {
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

    fn list_map(harness: &Harness) -> (ListShardMap, Shard, Shard) {
        let map = harness
            .manager
            .create_list_shard_map("customers", ShardKeyType::Int64)
            .unwrap()
            .into_inner();
        let a = map.create_shard(harness.shard_location("a")).unwrap();
        let b = map.create_shard(harness.shard_location("b")).unwrap();
        (map, a, b)
    }

    #[test]
    fn test_point_mapping_lifecycle() {
        let harness = Harness::new();
        let (map, a, _) = list_map(&harness);

        let mapping = map.create_point_mapping(ShardKey::from_i64(7), &a).unwrap();
        assert_eq!(mapping.status(), MappingStatus::Online);
        assert_eq!(map.get_mapping_for_key(&ShardKey::from_i64(7)).unwrap().id(), mapping.id());
        assert!(map.try_get_mapping_for_key(&ShardKey::from_i64(8)).unwrap().is_none());

        let err = map.create_point_mapping(ShardKey::from_i64(7), &a).err().unwrap();
        assert_eq!(err.code, ShardManagementErrorCode::MappingPointAlreadyMapped);

        // Online mappings cannot be removed.
        let err = map.delete_mapping(&mapping).err().unwrap();
        assert_eq!(err.code, ShardManagementErrorCode::MappingIsNotOffline);

        let offline = map.mark_mapping_offline(&mapping).unwrap();
        assert_eq!(offline.id(), mapping.id());
        assert_eq!(offline.status(), MappingStatus::Offline);
        map.delete_mapping(&offline).unwrap();

        let err = map.get_mapping_for_key(&ShardKey::from_i64(7)).err().unwrap();
        assert_eq!(err.code, ShardManagementErrorCode::MappingNotFoundForKey);
    }

    #[test]
    fn test_move_mapping_between_shards() {
        let harness = Harness::new();
        let (map, a, b) = list_map(&harness);
        let mapping = map.create_point_mapping(ShardKey::from_i64(1), &a).unwrap();

        let err = map.update_mapping(&mapping, MappingUpdate::shard(b.clone())).err().unwrap();
        assert_eq!(err.code, ShardManagementErrorCode::MappingIsNotOffline);

        let offline = map.mark_mapping_offline(&mapping).unwrap();
        let moved = map.update_mapping(&offline, MappingUpdate::shard(b.clone())).unwrap();
        assert_eq!(moved.shard().id(), b.id());
        assert_eq!(map.get_mappings_for_shard(&a).unwrap().len(), 0);
        assert_eq!(map.get_mappings_for_shard(&b).unwrap().len(), 1);

        let lsm_a = harness.store.local_state(a.location()).unwrap();
        let lsm_b = harness.store.local_state(b.location()).unwrap();
        assert!(lsm_a.mappings.is_empty());
        assert_eq!(lsm_b.mappings.len(), 1);
        assert_eq!(lsm_b.mappings[0].id, mapping.id());
    }

    #[test]
    fn test_locks_guard_changes() {
        let harness = Harness::new();
        let (map, a, _) = list_map(&harness);
        let mapping = map.create_point_mapping(ShardKey::from_i64(3), &a).unwrap();
        let token = MappingLockToken::create();

        map.lock_mapping(&mapping, token).unwrap();
        assert_eq!(map.get_mapping_lock_owner(&mapping).unwrap(), token);

        let err = map.lock_mapping(&mapping, MappingLockToken::create()).err().unwrap();
        assert_eq!(err.code, ShardManagementErrorCode::MappingIsAlreadyLocked);

        let err = map.mark_mapping_offline(&mapping).err().unwrap();
        assert_eq!(err.code, ShardManagementErrorCode::MappingLockOwnerIdDoesNotMatch);

        let offline = map
            .update_mapping_with_lock(&mapping, MappingUpdate::status(MappingStatus::Offline), token)
            .unwrap();
        assert_eq!(map.get_mapping_lock_owner(&offline).unwrap(), token);

        map.unlock_all_mappings_for_owner(token).unwrap();
        assert_eq!(map.get_mapping_lock_owner(&offline).unwrap(), MappingLockToken::NO_LOCK);

        map.lock_mapping(&offline, token).unwrap();
        map.unlock_all_mappings().unwrap();
        map.delete_mapping(&offline).unwrap();
    }

    #[test]
    fn test_key_type_is_checked() {
        let harness = Harness::new();
        let (map, a, _) = list_map(&harness);
        let err = map.create_point_mapping(ShardKey::from_i32(1), &a).err().unwrap();
        assert_eq!(err.code, ShardManagementErrorCode::InvalidArgument);
    }

    #[test]
    fn test_open_connection_validates() {
        let harness = Harness::new();
        let (map, a, _) = list_map(&harness);
        map.create_point_mapping(ShardKey::from_i64(5), &a).unwrap();

        let connection = map
            .open_connection_for_key(&ShardKey::from_i64(5), ConnectionOptions::Validate)
            .unwrap();
        assert_eq!(connection.location(), a.location());

        let err = map
            .open_connection_for_key(&ShardKey::from_i64(6), ConnectionOptions::Validate)
            .err()
            .unwrap();
        assert_eq!(err.code, ShardManagementErrorCode::MappingNotFoundForKey);
    }
}
