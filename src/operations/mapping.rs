//! Logged mapping operations
//!
//! Every mapping change bumps the version of each shard it touches. The new
//! versions are chosen up front and carried in the payload so that an undo
//! from the log can fence on them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::engine::{LocalStep, StoreOperationSteps};
use crate::cache::{CacheStore, CacheStoreMappingUpdatePolicy};
use crate::errors::handler::{
    on_recovery_manager_error_global, on_recovery_manager_error_local, on_shard_mapper_error_global,
    on_shard_mapper_error_local, ErrorSite,
};
use crate::errors::{ShardManagementError, ShardManagementErrorCategory, ShardManagementErrorCode};
use crate::store::{
    GlobalChange, MappingRemoval, ShardLocation, ShardMapKind, StoreLogEntry, StoreMapping, StoreRequest,
    StoreResult, StoreShard, StoreShardMap,
};

pub(crate) fn mapper_category(shard_map: &StoreShardMap) -> ShardManagementErrorCategory {
    match shard_map.kind {
        ShardMapKind::List => ShardManagementErrorCategory::ListShardMap,
        ShardMapKind::Range => ShardManagementErrorCategory::RangeShardMap,
    }
}

fn bulk(
    operation_id: Uuid,
    shard_map: &StoreShardMap,
    shard: StoreShard,
    removes: Vec<StoreMapping>,
    adds: Vec<StoreMapping>,
    expected_versions: Option<Vec<Uuid>>,
) -> LocalStep {
    LocalStep::Request(StoreRequest::BulkOperationShardMappingsLocal {
        operation_id,
        shard_map: shard_map.clone(),
        shard,
        removes,
        adds,
        expected_versions,
    })
}

fn evict_on_missing(cache: &dyn CacheStore, shard_map: &StoreShardMap, error: &ShardManagementError, mappings: &[&StoreMapping]) {
    match error.code {
        ShardManagementErrorCode::ShardMapDoesNotExist => cache.delete_shard_map(shard_map),
        ShardManagementErrorCode::MappingDoesNotExist => {
            for mapping in mappings {
                cache.delete_mapping(mapping);
            }
        }
        _ => {}
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AddMappingOperation {
    pub shard_map: StoreShardMap,
    pub mapping: StoreMapping,
    pub new_shard_version: Uuid,
}

impl StoreOperationSteps for AddMappingOperation {
    fn shard_map(&self) -> &StoreShardMap {
        &self.shard_map
    }

    fn category(&self) -> ShardManagementErrorCategory {
        mapper_category(&self.shard_map)
    }

    fn shard_id_adds(&self) -> Option<Uuid> {
        Some(self.mapping.shard.id)
    }

    fn global_change(&self) -> GlobalChange {
        GlobalChange::Mappings {
            removes: Vec::new(),
            adds: vec![self.mapping.clone()],
            require_offline_removes: false,
            new_versions: vec![(self.mapping.shard.id, self.new_shard_version)],
        }
    }

    fn source_location(&self) -> Option<&ShardLocation> {
        Some(&self.mapping.shard.location)
    }

    fn local_source_do(&self, operation_id: Uuid) -> Vec<LocalStep> {
        vec![bulk(
            operation_id,
            &self.shard_map,
            self.mapping.shard.with_version(self.new_shard_version),
            Vec::new(),
            vec![self.mapping.clone()],
            None,
        )]
    }

    fn local_source_undo(&self, operation_id: Uuid, entry: &StoreLogEntry) -> Vec<LocalStep> {
        let original = entry.original_shard_version_adds.unwrap_or(self.mapping.shard.version);
        vec![bulk(
            operation_id,
            &self.shard_map,
            self.mapping.shard.with_version(original),
            vec![self.mapping.clone()],
            Vec::new(),
            Some(vec![original, self.new_shard_version]),
        )]
    }

    fn on_global_error(&self, result: StoreResult, site: &ErrorSite<'_>) -> ShardManagementError {
        on_shard_mapper_error_global(result, site)
    }

    fn on_local_error(&self, result: StoreResult, site: &ErrorSite<'_>) -> ShardManagementError {
        on_shard_mapper_error_local(result, site)
    }

    fn update_cache_post(&self, cache: &dyn CacheStore) {
        let shard = self.mapping.shard.with_version(self.new_shard_version);
        cache.add_or_update_mapping(
            &self.mapping.with_shard(shard),
            CacheStoreMappingUpdatePolicy::OverwriteExisting,
        );
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RemoveMappingOperation {
    pub shard_map: StoreShardMap,
    pub mapping: StoreMapping,
    pub lock_owner_id: Uuid,
    pub new_shard_version: Uuid,
}

impl StoreOperationSteps for RemoveMappingOperation {
    fn shard_map(&self) -> &StoreShardMap {
        &self.shard_map
    }

    fn category(&self) -> ShardManagementErrorCategory {
        mapper_category(&self.shard_map)
    }

    fn shard_id_removes(&self) -> Option<Uuid> {
        Some(self.mapping.shard.id)
    }

    fn global_change(&self) -> GlobalChange {
        GlobalChange::Mappings {
            removes: vec![MappingRemoval {
                mapping: self.mapping.clone(),
                lock_owner_id: self.lock_owner_id,
            }],
            adds: Vec::new(),
            require_offline_removes: true,
            new_versions: vec![(self.mapping.shard.id, self.new_shard_version)],
        }
    }

    fn source_location(&self) -> Option<&ShardLocation> {
        Some(&self.mapping.shard.location)
    }

    fn local_source_do(&self, operation_id: Uuid) -> Vec<LocalStep> {
        vec![bulk(
            operation_id,
            &self.shard_map,
            self.mapping.shard.with_version(self.new_shard_version),
            vec![self.mapping.clone()],
            Vec::new(),
            None,
        )]
    }

    fn local_source_undo(&self, operation_id: Uuid, entry: &StoreLogEntry) -> Vec<LocalStep> {
        let original = entry.original_shard_version_removes.unwrap_or(self.mapping.shard.version);
        vec![bulk(
            operation_id,
            &self.shard_map,
            self.mapping.shard.with_version(original),
            Vec::new(),
            vec![self.mapping.clone()],
            Some(vec![original, self.new_shard_version]),
        )]
    }

    fn on_global_error(&self, result: StoreResult, site: &ErrorSite<'_>) -> ShardManagementError {
        on_shard_mapper_error_global(result, site)
    }

    fn on_local_error(&self, result: StoreResult, site: &ErrorSite<'_>) -> ShardManagementError {
        on_shard_mapper_error_local(result, site)
    }

    fn update_cache_pre(&self, cache: &dyn CacheStore, error: &ShardManagementError) {
        evict_on_missing(cache, &self.shard_map, error, &[&self.mapping]);
    }

    fn update_cache_post(&self, cache: &dyn CacheStore) {
        cache.delete_mapping(&self.mapping);
    }
}

/// Change a mapping's status or move it to another shard. The mapping keeps
/// its id. Moving between shards touches two local stores: the source loses
/// the mapping and the target gains it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UpdateMappingOperation {
    pub shard_map: StoreShardMap,
    pub current: StoreMapping,
    pub updated: StoreMapping,
    pub lock_owner_id: Uuid,
    pub new_source_version: Uuid,
    pub new_target_version: Uuid,
    /// Terminate connections using the mapping before changing it.
    pub kill_sessions: bool,
}

impl UpdateMappingOperation {
    pub fn moves_shard(&self) -> bool {
        self.current.shard.id != self.updated.shard.id
    }

    fn updated_with_version(&self) -> StoreMapping {
        let version = if self.moves_shard() {
            self.new_target_version
        } else {
            self.new_source_version
        };
        self.updated.with_shard(self.updated.shard.with_version(version))
    }
}

impl StoreOperationSteps for UpdateMappingOperation {
    fn shard_map(&self) -> &StoreShardMap {
        &self.shard_map
    }

    fn category(&self) -> ShardManagementErrorCategory {
        mapper_category(&self.shard_map)
    }

    fn shard_id_removes(&self) -> Option<Uuid> {
        Some(self.current.shard.id)
    }

    fn shard_id_adds(&self) -> Option<Uuid> {
        Some(self.updated.shard.id)
    }

    fn global_change(&self) -> GlobalChange {
        let mut new_versions = vec![(self.current.shard.id, self.new_source_version)];
        if self.moves_shard() {
            new_versions.push((self.updated.shard.id, self.new_target_version));
        }
        GlobalChange::Mappings {
            removes: vec![MappingRemoval {
                mapping: self.current.clone(),
                lock_owner_id: self.lock_owner_id,
            }],
            adds: vec![self.updated.clone()],
            require_offline_removes: self.moves_shard(),
            new_versions,
        }
    }

    fn source_location(&self) -> Option<&ShardLocation> {
        Some(&self.current.shard.location)
    }

    fn target_location(&self) -> Option<&ShardLocation> {
        self.moves_shard().then_some(&self.updated.shard.location)
    }

    fn local_source_do(&self, operation_id: Uuid) -> Vec<LocalStep> {
        let mut steps = Vec::new();
        if self.kill_sessions {
            steps.push(LocalStep::Request(StoreRequest::KillSessionsForShardMappingLocal {
                mapping: self.current.clone(),
            }));
        }
        let adds = if self.moves_shard() {
            Vec::new()
        } else {
            vec![self.updated.clone()]
        };
        steps.push(bulk(
            operation_id,
            &self.shard_map,
            self.current.shard.with_version(self.new_source_version),
            vec![self.current.clone()],
            adds,
            None,
        ));
        steps
    }

    fn local_source_undo(&self, operation_id: Uuid, entry: &StoreLogEntry) -> Vec<LocalStep> {
        let original = entry.original_shard_version_removes.unwrap_or(self.current.shard.version);
        let removes = if self.moves_shard() {
            Vec::new()
        } else {
            vec![self.updated.clone()]
        };
        vec![bulk(
            operation_id,
            &self.shard_map,
            self.current.shard.with_version(original),
            removes,
            vec![self.current.clone()],
            Some(vec![original, self.new_source_version]),
        )]
    }

    fn local_target_do(&self, operation_id: Uuid) -> Vec<LocalStep> {
        if !self.moves_shard() {
            return Vec::new();
        }
        vec![bulk(
            operation_id,
            &self.shard_map,
            self.updated.shard.with_version(self.new_target_version),
            Vec::new(),
            vec![self.updated.clone()],
            None,
        )]
    }

    fn local_target_undo(&self, operation_id: Uuid, entry: &StoreLogEntry) -> Vec<LocalStep> {
        if !self.moves_shard() {
            return Vec::new();
        }
        let original = entry.original_shard_version_adds.unwrap_or(self.updated.shard.version);
        vec![bulk(
            operation_id,
            &self.shard_map,
            self.updated.shard.with_version(original),
            vec![self.updated.clone()],
            Vec::new(),
            Some(vec![original, self.new_target_version]),
        )]
    }

    fn on_global_error(&self, result: StoreResult, site: &ErrorSite<'_>) -> ShardManagementError {
        on_shard_mapper_error_global(result, site)
    }

    fn on_local_error(&self, result: StoreResult, site: &ErrorSite<'_>) -> ShardManagementError {
        on_shard_mapper_error_local(result, site)
    }

    fn update_cache_pre(&self, cache: &dyn CacheStore, error: &ShardManagementError) {
        evict_on_missing(cache, &self.shard_map, error, &[&self.current]);
    }

    fn update_cache_post(&self, cache: &dyn CacheStore) {
        cache.delete_mapping(&self.current);
        cache.add_or_update_mapping(&self.updated_with_version(), CacheStoreMappingUpdatePolicy::OverwriteExisting);
    }
}

/// Replace a set of mappings on one shard with another set. Split and merge
/// change the global and local stores alike; recovery resolutions change only
/// one side and re-stamp the shard version on both.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReplaceMappingsOperation {
    pub shard_map: StoreShardMap,
    pub shard: StoreShard,
    pub global_removes: Vec<MappingRemoval>,
    pub global_adds: Vec<StoreMapping>,
    pub local_removes: Vec<StoreMapping>,
    pub local_adds: Vec<StoreMapping>,
    pub new_shard_version: Uuid,
    /// Raised by recovery rather than by a shard map.
    pub recovery: bool,
}

impl ReplaceMappingsOperation {
    /// Same change on both stores.
    pub fn mirrored(
        shard_map: StoreShardMap,
        shard: StoreShard,
        removes: Vec<MappingRemoval>,
        adds: Vec<StoreMapping>,
    ) -> Self {
        let local_removes = removes.iter().map(|r| r.mapping.clone()).collect();
        Self {
            shard_map,
            shard,
            global_removes: removes,
            local_adds: adds.clone(),
            global_adds: adds,
            local_removes,
            new_shard_version: Uuid::new_v4(),
            recovery: false,
        }
    }

    /// Rewrite the local store's mappings to match the global store.
    pub fn restore_local(
        shard_map: StoreShardMap,
        shard: StoreShard,
        local_removes: Vec<StoreMapping>,
        local_adds: Vec<StoreMapping>,
    ) -> Self {
        Self {
            shard_map,
            shard,
            global_removes: Vec::new(),
            global_adds: Vec::new(),
            local_removes,
            local_adds,
            new_shard_version: Uuid::new_v4(),
            recovery: true,
        }
    }

    /// Rewrite the global store's mappings to match the local store.
    pub fn restore_global(
        shard_map: StoreShardMap,
        shard: StoreShard,
        global_removes: Vec<MappingRemoval>,
        global_adds: Vec<StoreMapping>,
    ) -> Self {
        Self {
            shard_map,
            shard,
            global_removes,
            global_adds,
            local_removes: Vec::new(),
            local_adds: Vec::new(),
            new_shard_version: Uuid::new_v4(),
            recovery: true,
        }
    }
}

impl StoreOperationSteps for ReplaceMappingsOperation {
    fn shard_map(&self) -> &StoreShardMap {
        &self.shard_map
    }

    fn category(&self) -> ShardManagementErrorCategory {
        if self.recovery {
            ShardManagementErrorCategory::Recovery
        } else {
            mapper_category(&self.shard_map)
        }
    }

    fn shard_id_removes(&self) -> Option<Uuid> {
        Some(self.shard.id)
    }

    fn shard_id_adds(&self) -> Option<Uuid> {
        Some(self.shard.id)
    }

    fn global_change(&self) -> GlobalChange {
        GlobalChange::Mappings {
            removes: self.global_removes.clone(),
            adds: self.global_adds.clone(),
            require_offline_removes: false,
            new_versions: vec![(self.shard.id, self.new_shard_version)],
        }
    }

    fn source_location(&self) -> Option<&ShardLocation> {
        Some(&self.shard.location)
    }

    fn local_source_do(&self, operation_id: Uuid) -> Vec<LocalStep> {
        vec![bulk(
            operation_id,
            &self.shard_map,
            self.shard.with_version(self.new_shard_version),
            self.local_removes.clone(),
            self.local_adds.clone(),
            None,
        )]
    }

    fn local_source_undo(&self, operation_id: Uuid, entry: &StoreLogEntry) -> Vec<LocalStep> {
        let original = entry.original_shard_version_adds.unwrap_or(self.shard.version);
        vec![bulk(
            operation_id,
            &self.shard_map,
            self.shard.with_version(original),
            self.local_adds.clone(),
            self.local_removes.clone(),
            Some(vec![original, self.new_shard_version]),
        )]
    }

    fn on_global_error(&self, result: StoreResult, site: &ErrorSite<'_>) -> ShardManagementError {
        if self.recovery {
            on_recovery_manager_error_global(result, site)
        } else {
            on_shard_mapper_error_global(result, site)
        }
    }

    fn on_local_error(&self, result: StoreResult, site: &ErrorSite<'_>) -> ShardManagementError {
        if self.recovery {
            on_recovery_manager_error_local(result, site)
        } else {
            on_shard_mapper_error_local(result, site)
        }
    }

    fn update_cache_pre(&self, cache: &dyn CacheStore, error: &ShardManagementError) {
        let removed: Vec<&StoreMapping> = self.global_removes.iter().map(|r| &r.mapping).collect();
        evict_on_missing(cache, &self.shard_map, error, &removed);
    }

    fn update_cache_post(&self, cache: &dyn CacheStore) {
        for removal in &self.global_removes {
            cache.delete_mapping(&removal.mapping);
        }
        let shard = self.shard.with_version(self.new_shard_version);
        for mapping in &self.global_adds {
            cache.add_or_update_mapping(
                &mapping.with_shard(shard.clone()),
                CacheStoreMappingUpdatePolicy::OverwriteExisting,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{ShardKeyType, ShardRange};
    use crate::store::{MappingStatus, ShardStatus};

    fn shard(map: &StoreShardMap, db: &str) -> StoreShard {
        StoreShard::new(map.id, ShardLocation::new("srv", db), ShardStatus::Online)
    }

    #[test]
    fn test_update_within_shard_has_no_target_step() {
        let map = StoreShardMap::new("orders", ShardMapKind::Range, ShardKeyType::Int32);
        let s1 = shard(&map, "s1");
        let current = StoreMapping::range(map.id, &ShardRange::i32(0, 10).unwrap(), s1, MappingStatus::Online);
        let op = UpdateMappingOperation {
            shard_map: map,
            updated: current.with_status(MappingStatus::Offline),
            current,
            lock_owner_id: Uuid::nil(),
            new_source_version: Uuid::new_v4(),
            new_target_version: Uuid::new_v4(),
            kill_sessions: true,
        };
        assert!(!op.moves_shard());
        assert!(op.target_location().is_none());
        let steps = op.local_source_do(Uuid::new_v4());
        assert!(matches!(
            steps[0],
            LocalStep::Request(StoreRequest::KillSessionsForShardMappingLocal { .. })
        ));
        assert_eq!(steps.len(), 2);
        match op.global_change() {
            GlobalChange::Mappings {
                require_offline_removes,
                new_versions,
                ..
            } => {
                assert!(!require_offline_removes);
                assert_eq!(new_versions.len(), 1);
            }
            other => panic!("unexpected change {:?}", other),
        }
    }

    #[test]
    fn test_moving_mapping_requires_offline_and_touches_both_shards() {
        let map = StoreShardMap::new("orders", ShardMapKind::List, ShardKeyType::Int64);
        let s1 = shard(&map, "s1");
        let s2 = shard(&map, "s2");
        let current = StoreMapping::point(map.id, crate::key::ShardKey::from_i64(7), s1, MappingStatus::Offline);
        let op = UpdateMappingOperation {
            shard_map: map,
            updated: current.with_shard(s2.clone()),
            current,
            lock_owner_id: Uuid::nil(),
            new_source_version: Uuid::new_v4(),
            new_target_version: Uuid::new_v4(),
            kill_sessions: false,
        };
        assert!(op.moves_shard());
        assert_eq!(op.target_location(), Some(&s2.location));
        assert_eq!(op.category(), ShardManagementErrorCategory::ListShardMap);
        match op.global_change() {
            GlobalChange::Mappings {
                require_offline_removes,
                new_versions,
                ..
            } => {
                assert!(require_offline_removes);
                assert_eq!(new_versions.len(), 2);
            }
            other => panic!("unexpected change {:?}", other),
        }
    }

    #[test]
    fn test_recovery_replacement_changes_one_side_only() {
        let map = StoreShardMap::new("orders", ShardMapKind::Range, ShardKeyType::Int32);
        let s1 = shard(&map, "s1");
        let global = StoreMapping::range(map.id, &ShardRange::i32(0, 10).unwrap(), s1.clone(), MappingStatus::Online);
        let op = ReplaceMappingsOperation::restore_local(map, s1, Vec::new(), vec![global]);
        assert_eq!(op.category(), ShardManagementErrorCategory::Recovery);
        match op.global_change() {
            GlobalChange::Mappings { removes, adds, .. } => assert!(removes.is_empty() && adds.is_empty()),
            other => panic!("unexpected change {:?}", other),
        }
    }
}
