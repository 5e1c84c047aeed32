//! Requests understood by the global and local stores
//!
//! Each variant corresponds to one named store procedure. A request is either
//! addressed to the global store (GSM) or to a shard's local store (LSM).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::{
    ShardLocation, StoreLogEntry, StoreMapping, StoreSchemaInfo, StoreShard, StoreShardMap,
};
use crate::key::{ShardKey, ShardRange};
use crate::operations::{OperationCode, StoreOperationState};

/// Which store a request is addressed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreTarget {
    Global,
    Local,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum LockOwnerIdOpType {
    Lock,
    UnlockMappingForId,
    UnlockAllMappingsForId,
    UnlockAllMappings,
}

/// A mapping to remove together with the lock owner the caller presents.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MappingRemoval {
    pub mapping: StoreMapping,
    pub lock_owner_id: Uuid,
}

/// Change recorded by `BeginOperationGlobal` and applied by
/// `EndOperationGlobal`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum GlobalChange {
    Shards {
        removes: Vec<StoreShard>,
        adds: Vec<StoreShard>,
    },
    Mappings {
        removes: Vec<MappingRemoval>,
        adds: Vec<StoreMapping>,
        /// Removed mappings must be offline.
        require_offline_removes: bool,
        /// Shard versions installed when the change is applied.
        new_versions: Vec<(Uuid, Uuid)>,
    },
    Attach {
        shard_map: StoreShardMap,
        shard: StoreShard,
        mappings: Vec<StoreMapping>,
    },
}

/// Control batch commands (deployment).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreCommand {
    DeployGlobalStore,
    DropGlobalStore,
    DeployLocalStore,
    DropLocalStore,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StoreRequest {
    // Global store
    GetStoreVersionGlobal,
    GetShardMapsGlobal,
    FindShardMapByNameGlobal {
        name: String,
    },
    AddShardMapGlobal {
        shard_map: StoreShardMap,
    },
    RemoveShardMapGlobal {
        shard_map: StoreShardMap,
    },
    GetShardsGlobal {
        shard_map: StoreShardMap,
    },
    FindShardByLocationGlobal {
        shard_map: StoreShardMap,
        location: ShardLocation,
    },
    GetDistinctShardLocationsGlobal,
    GetMappingsByRangeGlobal {
        shard_map: StoreShardMap,
        shard: Option<StoreShard>,
        range: Option<ShardRange>,
    },
    FindMappingByKeyGlobal {
        shard_map: StoreShardMap,
        key: ShardKey,
    },
    FindMappingByIdGlobal {
        shard_map: StoreShardMap,
        mapping_id: Uuid,
    },
    LockOrUnlockMappingsGlobal {
        shard_map: StoreShardMap,
        mapping: Option<StoreMapping>,
        lock_owner_id: Uuid,
        lock_op: LockOwnerIdOpType,
    },
    BeginOperationGlobal {
        entry: StoreLogEntry,
        shard_map: StoreShardMap,
        change: GlobalChange,
    },
    EndOperationGlobal {
        operation_id: Uuid,
        shard_map: StoreShardMap,
        change: GlobalChange,
        undo: bool,
    },
    FindAndUpdateOperationLogEntryByIdGlobal {
        operation_id: Uuid,
        undo_start_state: StoreOperationState,
    },
    GetOperationLogEntriesGlobal,
    DetachShardGlobal {
        location: ShardLocation,
        shard_map_name: Option<String>,
    },
    GetAllSchemaInfosGlobal,
    FindSchemaInfoGlobal {
        name: String,
    },
    AddSchemaInfoGlobal {
        schema_info: StoreSchemaInfo,
    },
    UpdateSchemaInfoGlobal {
        schema_info: StoreSchemaInfo,
    },
    RemoveSchemaInfoGlobal {
        name: String,
    },

    // Local store
    GetStoreVersionLocal,
    GetShardsLocal,
    GetMappingsByRangeLocal {
        shard_map: StoreShardMap,
        shard: StoreShard,
        range: Option<ShardRange>,
    },
    AddShardLocal {
        operation_id: Uuid,
        shard_map: StoreShardMap,
        shard: StoreShard,
        undo: bool,
    },
    RemoveShardLocal {
        operation_id: Uuid,
        shard_map: StoreShardMap,
        shard: StoreShard,
    },
    UpdateShardLocal {
        operation_id: Uuid,
        shard_map: StoreShardMap,
        shard: StoreShard,
    },
    BulkOperationShardMappingsLocal {
        operation_id: Uuid,
        shard_map: StoreShardMap,
        /// Carries the version to install on the local shard record.
        shard: StoreShard,
        removes: Vec<StoreMapping>,
        adds: Vec<StoreMapping>,
        /// When set, the local shard version must be one of these.
        expected_versions: Option<Vec<Uuid>>,
    },
    KillSessionsForShardMappingLocal {
        mapping: StoreMapping,
    },
    ValidateShardLocal {
        shard_map_id: Uuid,
        shard_id: Uuid,
        shard_version: Uuid,
    },
    ValidateShardMappingLocal {
        shard_map_id: Uuid,
        mapping_id: Uuid,
    },
}

impl StoreRequest {
    pub fn target(&self) -> StoreTarget {
        match self {
            StoreRequest::GetStoreVersionLocal
            | StoreRequest::GetShardsLocal
            | StoreRequest::GetMappingsByRangeLocal { .. }
            | StoreRequest::AddShardLocal { .. }
            | StoreRequest::RemoveShardLocal { .. }
            | StoreRequest::UpdateShardLocal { .. }
            | StoreRequest::BulkOperationShardMappingsLocal { .. }
            | StoreRequest::KillSessionsForShardMappingLocal { .. }
            | StoreRequest::ValidateShardLocal { .. }
            | StoreRequest::ValidateShardMappingLocal { .. } => StoreTarget::Local,
            _ => StoreTarget::Global,
        }
    }

    /// Procedure name, used for logging and fault injection.
    pub fn name(&self) -> &'static str {
        match self {
            StoreRequest::GetStoreVersionGlobal => "GetStoreVersionGlobal",
            StoreRequest::GetShardMapsGlobal => "GetShardMapsGlobal",
            StoreRequest::FindShardMapByNameGlobal { .. } => "FindShardMapByNameGlobal",
            StoreRequest::AddShardMapGlobal { .. } => "AddShardMapGlobal",
            StoreRequest::RemoveShardMapGlobal { .. } => "RemoveShardMapGlobal",
            StoreRequest::GetShardsGlobal { .. } => "GetShardsGlobal",
            StoreRequest::FindShardByLocationGlobal { .. } => "FindShardByLocationGlobal",
            StoreRequest::GetDistinctShardLocationsGlobal => "GetDistinctShardLocationsGlobal",
            StoreRequest::GetMappingsByRangeGlobal { .. } => "GetMappingsByRangeGlobal",
            StoreRequest::FindMappingByKeyGlobal { .. } => "FindMappingByKeyGlobal",
            StoreRequest::FindMappingByIdGlobal { .. } => "FindMappingByIdGlobal",
            StoreRequest::LockOrUnlockMappingsGlobal { .. } => "LockOrUnlockMappingsGlobal",
            StoreRequest::BeginOperationGlobal { .. } => "BeginOperationGlobal",
            StoreRequest::EndOperationGlobal { .. } => "EndOperationGlobal",
            StoreRequest::FindAndUpdateOperationLogEntryByIdGlobal { .. } => {
                "FindAndUpdateOperationLogEntryByIdGlobal"
            }
            StoreRequest::GetOperationLogEntriesGlobal => "GetOperationLogEntriesGlobal",
            StoreRequest::DetachShardGlobal { .. } => "DetachShardGlobal",
            StoreRequest::GetAllSchemaInfosGlobal => "GetAllSchemaInfosGlobal",
            StoreRequest::FindSchemaInfoGlobal { .. } => "FindSchemaInfoGlobal",
            StoreRequest::AddSchemaInfoGlobal { .. } => "AddSchemaInfoGlobal",
            StoreRequest::UpdateSchemaInfoGlobal { .. } => "UpdateSchemaInfoGlobal",
            StoreRequest::RemoveSchemaInfoGlobal { .. } => "RemoveSchemaInfoGlobal",
            StoreRequest::GetStoreVersionLocal => "GetStoreVersionLocal",
            StoreRequest::GetShardsLocal => "GetShardsLocal",
            StoreRequest::GetMappingsByRangeLocal { .. } => "GetMappingsByRangeLocal",
            StoreRequest::AddShardLocal { .. } => "AddShardLocal",
            StoreRequest::RemoveShardLocal { .. } => "RemoveShardLocal",
            StoreRequest::UpdateShardLocal { .. } => "UpdateShardLocal",
            StoreRequest::BulkOperationShardMappingsLocal { .. } => {
                "BulkOperationShardMappingsLocal"
            }
            StoreRequest::KillSessionsForShardMappingLocal { .. } => {
                "KillSessionsForShardMappingLocal"
            }
            StoreRequest::ValidateShardLocal { .. } => "ValidateShardLocal",
            StoreRequest::ValidateShardMappingLocal { .. } => "ValidateShardMappingLocal",
        }
    }
}

/// Log entry skeleton for a new operation. The global store fills in the
/// original shard versions when it records the entry.
pub fn new_log_entry(
    operation_id: Uuid,
    operation_code: OperationCode,
    data: Vec<u8>,
    shard_id_removes: Option<Uuid>,
    shard_id_adds: Option<Uuid>,
) -> StoreLogEntry {
    StoreLogEntry {
        id: operation_id,
        operation_code,
        data,
        undo_start_state: StoreOperationState::UndoBegin,
        shard_id_removes,
        shard_id_adds,
        original_shard_version_removes: None,
        original_shard_version_adds: None,
        created_at: chrono::Utc::now(),
    }
}
