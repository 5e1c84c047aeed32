//! Logged shard operations

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::engine::{LocalStep, StoreOperationSteps};
use crate::cache::CacheStore;
use crate::errors::handler::{
    on_recovery_manager_error_global, on_recovery_manager_error_local, on_shard_map_error_global,
    on_shard_map_error_local, ErrorSite,
};
use crate::errors::{ShardManagementError, ShardManagementErrorCategory};
use crate::store::{
    GlobalChange, ShardLocation, StoreLogEntry, StoreMapping, StoreRequest, StoreResult, StoreShard, StoreShardMap,
};

/// Register a new shard. Deploys the local store on the shard database if
/// needed.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AddShardOperation {
    pub shard_map: StoreShardMap,
    pub shard: StoreShard,
}

impl StoreOperationSteps for AddShardOperation {
    fn shard_map(&self) -> &StoreShardMap {
        &self.shard_map
    }

    fn category(&self) -> ShardManagementErrorCategory {
        ShardManagementErrorCategory::ShardMap
    }

    fn shard_id_adds(&self) -> Option<Uuid> {
        Some(self.shard.id)
    }

    fn global_change(&self) -> GlobalChange {
        GlobalChange::Shards {
            removes: Vec::new(),
            adds: vec![self.shard.clone()],
        }
    }

    fn source_location(&self) -> Option<&ShardLocation> {
        Some(&self.shard.location)
    }

    fn local_source_do(&self, operation_id: Uuid) -> Vec<LocalStep> {
        vec![
            LocalStep::EnsureDeployed,
            LocalStep::Request(StoreRequest::AddShardLocal {
                operation_id,
                shard_map: self.shard_map.clone(),
                shard: self.shard.clone(),
                undo: false,
            }),
        ]
    }

    fn local_source_undo(&self, operation_id: Uuid, _entry: &StoreLogEntry) -> Vec<LocalStep> {
        vec![LocalStep::IfDeployed(StoreRequest::AddShardLocal {
            operation_id,
            shard_map: self.shard_map.clone(),
            shard: self.shard.clone(),
            undo: true,
        })]
    }

    fn on_global_error(&self, result: StoreResult, site: &ErrorSite<'_>) -> ShardManagementError {
        on_shard_map_error_global(result, site)
    }

    fn on_local_error(&self, result: StoreResult, site: &ErrorSite<'_>) -> ShardManagementError {
        on_shard_map_error_local(result, site)
    }
}

/// Unregister a shard that has no mappings. The shard's local records are
/// dropped too; the database itself is left alone.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RemoveShardOperation {
    pub shard_map: StoreShardMap,
    pub shard: StoreShard,
}

impl StoreOperationSteps for RemoveShardOperation {
    fn shard_map(&self) -> &StoreShardMap {
        &self.shard_map
    }

    fn category(&self) -> ShardManagementErrorCategory {
        ShardManagementErrorCategory::ShardMap
    }

    fn shard_id_removes(&self) -> Option<Uuid> {
        Some(self.shard.id)
    }

    fn global_change(&self) -> GlobalChange {
        GlobalChange::Shards {
            removes: vec![self.shard.clone()],
            adds: Vec::new(),
        }
    }

    fn source_location(&self) -> Option<&ShardLocation> {
        Some(&self.shard.location)
    }

    fn local_source_do(&self, operation_id: Uuid) -> Vec<LocalStep> {
        vec![LocalStep::IfDeployed(StoreRequest::RemoveShardLocal {
            operation_id,
            shard_map: self.shard_map.clone(),
            shard: self.shard.clone(),
        })]
    }

    fn local_source_undo(&self, operation_id: Uuid, entry: &StoreLogEntry) -> Vec<LocalStep> {
        let version = entry.original_shard_version_removes.unwrap_or(self.shard.version);
        vec![LocalStep::IfDeployed(StoreRequest::AddShardLocal {
            operation_id,
            shard_map: self.shard_map.clone(),
            shard: self.shard.with_version(version),
            undo: false,
        })]
    }

    fn on_global_error(&self, result: StoreResult, site: &ErrorSite<'_>) -> ShardManagementError {
        on_shard_map_error_global(result, site)
    }

    fn on_local_error(&self, result: StoreResult, site: &ErrorSite<'_>) -> ShardManagementError {
        on_shard_map_error_local(result, site)
    }
}

/// Change a shard's status. The shard gets a new version.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UpdateShardOperation {
    pub shard_map: StoreShardMap,
    pub current: StoreShard,
    pub updated: StoreShard,
}

impl StoreOperationSteps for UpdateShardOperation {
    fn shard_map(&self) -> &StoreShardMap {
        &self.shard_map
    }

    fn category(&self) -> ShardManagementErrorCategory {
        ShardManagementErrorCategory::ShardMap
    }

    fn shard_id_removes(&self) -> Option<Uuid> {
        Some(self.current.id)
    }

    fn shard_id_adds(&self) -> Option<Uuid> {
        Some(self.updated.id)
    }

    fn global_change(&self) -> GlobalChange {
        GlobalChange::Shards {
            removes: vec![self.current.clone()],
            adds: vec![self.updated.clone()],
        }
    }

    fn source_location(&self) -> Option<&ShardLocation> {
        Some(&self.current.location)
    }

    fn local_source_do(&self, operation_id: Uuid) -> Vec<LocalStep> {
        vec![LocalStep::Request(StoreRequest::UpdateShardLocal {
            operation_id,
            shard_map: self.shard_map.clone(),
            shard: self.updated.clone(),
        })]
    }

    fn local_source_undo(&self, operation_id: Uuid, entry: &StoreLogEntry) -> Vec<LocalStep> {
        let version = entry.original_shard_version_removes.unwrap_or(self.current.version);
        vec![LocalStep::Request(StoreRequest::UpdateShardLocal {
            operation_id,
            shard_map: self.shard_map.clone(),
            shard: self.current.with_version(version),
        })]
    }

    fn on_global_error(&self, result: StoreResult, site: &ErrorSite<'_>) -> ShardManagementError {
        on_shard_map_error_global(result, site)
    }

    fn on_local_error(&self, result: StoreResult, site: &ErrorSite<'_>) -> ShardManagementError {
        on_shard_map_error_local(result, site)
    }
}

/// Register a shard, and its mappings, that a local store already describes.
/// Creates the shard map in the global store when it is missing. The local
/// shard record is re-stamped with the version the global store receives.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AttachShardOperation {
    pub shard_map: StoreShardMap,
    /// The shard as recorded locally before attaching.
    pub local_shard: StoreShard,
    /// The shard as it will be recorded globally.
    pub shard: StoreShard,
    pub mappings: Vec<StoreMapping>,
}

impl StoreOperationSteps for AttachShardOperation {
    fn shard_map(&self) -> &StoreShardMap {
        &self.shard_map
    }

    fn category(&self) -> ShardManagementErrorCategory {
        ShardManagementErrorCategory::Recovery
    }

    fn shard_id_adds(&self) -> Option<Uuid> {
        Some(self.shard.id)
    }

    fn global_change(&self) -> GlobalChange {
        GlobalChange::Attach {
            shard_map: self.shard_map.clone(),
            shard: self.shard.clone(),
            mappings: self.mappings.clone(),
        }
    }

    fn source_location(&self) -> Option<&ShardLocation> {
        Some(&self.shard.location)
    }

    fn local_source_do(&self, operation_id: Uuid) -> Vec<LocalStep> {
        vec![LocalStep::Request(StoreRequest::UpdateShardLocal {
            operation_id,
            shard_map: self.shard_map.clone(),
            shard: self.shard.clone(),
        })]
    }

    fn local_source_undo(&self, operation_id: Uuid, _entry: &StoreLogEntry) -> Vec<LocalStep> {
        vec![LocalStep::Request(StoreRequest::UpdateShardLocal {
            operation_id,
            shard_map: self.shard_map.clone(),
            shard: self.local_shard.clone(),
        })]
    }

    fn on_global_error(&self, result: StoreResult, site: &ErrorSite<'_>) -> ShardManagementError {
        on_recovery_manager_error_global(result, site)
    }

    fn on_local_error(&self, result: StoreResult, site: &ErrorSite<'_>) -> ShardManagementError {
        on_recovery_manager_error_local(result, site)
    }

    fn update_cache_post(&self, cache: &dyn CacheStore) {
        // A new shard map may have been created under an existing cached name.
        if let Some(cached) = cache.lookup_shard_map_by_name(&self.shard_map.name) {
            if cached.id != self.shard_map.id {
                cache.delete_shard_map(&cached);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ShardKeyType;
    use crate::store::{ShardMapKind, ShardStatus};

    fn fixture() -> (StoreShardMap, StoreShard) {
        let map = StoreShardMap::new("orders", ShardMapKind::Range, ShardKeyType::Int32);
        let shard = StoreShard::new(map.id, ShardLocation::new("srv", "shard1"), ShardStatus::Online);
        (map, shard)
    }

    #[test]
    fn test_add_shard_deploys_before_adding() {
        let (shard_map, shard) = fixture();
        let op = AddShardOperation { shard_map, shard };
        let steps = op.local_source_do(Uuid::new_v4());
        assert_eq!(steps[0], LocalStep::EnsureDeployed);
        assert!(matches!(steps[1], LocalStep::Request(StoreRequest::AddShardLocal { undo: false, .. })));
        assert_eq!(op.shard_id_adds(), Some(op.shard.id));
        assert_eq!(op.shard_id_removes(), None);
    }

    #[test]
    fn test_update_shard_undo_restores_original_version() {
        let (shard_map, shard) = fixture();
        let updated = shard.with_status(ShardStatus::Offline).with_version(Uuid::new_v4());
        let op = UpdateShardOperation {
            shard_map,
            current: shard.clone(),
            updated,
        };
        let mut entry = crate::store::request::new_log_entry(
            Uuid::new_v4(),
            crate::operations::OperationCode::UpdateShard,
            Vec::new(),
            Some(shard.id),
            Some(shard.id),
        );
        entry.original_shard_version_removes = Some(shard.version);

        let undo = op.local_source_undo(entry.id, &entry);
        match &undo[0] {
            LocalStep::Request(StoreRequest::UpdateShardLocal { shard: restored, .. }) => {
                assert_eq!(restored.version, shard.version);
                assert_eq!(restored.status, ShardStatus::Online);
            }
            other => panic!("unexpected step {:?}", other),
        }
    }
}
