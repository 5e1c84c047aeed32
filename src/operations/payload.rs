//! Serialized form of a logged operation
//!
//! The payload is stored as JSON in the log entry's `data` so that an
//! operation interrupted in one process can be undone by another.

use serde::{Deserialize, Serialize};

use super::engine::StoreOperationSteps;
use super::mapping::{
    AddMappingOperation, RemoveMappingOperation, ReplaceMappingsOperation, UpdateMappingOperation,
};
use super::shard::{AddShardOperation, AttachShardOperation, RemoveShardOperation, UpdateShardOperation};
use super::state::OperationCode;
use crate::errors::{Result, ShardManagementError, ShardManagementErrorCategory, ShardManagementErrorCode};
use crate::store::{StoreError, StoreLogEntry};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "operation")]
pub enum OperationPayload {
    AddShard(AddShardOperation),
    RemoveShard(RemoveShardOperation),
    UpdateShard(UpdateShardOperation),
    AddMapping(AddMappingOperation),
    RemoveMapping(RemoveMappingOperation),
    UpdateMapping(UpdateMappingOperation),
    ReplaceMappings(ReplaceMappingsOperation),
    AttachShard(AttachShardOperation),
}

impl OperationPayload {
    pub fn steps(&self) -> &dyn StoreOperationSteps {
        match self {
            OperationPayload::AddShard(op) => op,
            OperationPayload::RemoveShard(op) => op,
            OperationPayload::UpdateShard(op) => op,
            OperationPayload::AddMapping(op) => op,
            OperationPayload::RemoveMapping(op) => op,
            OperationPayload::UpdateMapping(op) => op,
            OperationPayload::ReplaceMappings(op) => op,
            OperationPayload::AttachShard(op) => op,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| corrupt(self.steps().category(), StoreError::from(e)))
    }

    /// Decode the payload of a log entry.
    pub fn from_log_entry(entry: &StoreLogEntry) -> Result<Self> {
        let payload: OperationPayload = serde_json::from_slice(&entry.data)
            .map_err(|e| corrupt(ShardManagementErrorCategory::Recovery, StoreError::from(e)))?;
        if !payload.accepts(entry.operation_code) {
            return Err(ShardManagementError::new(
                ShardManagementErrorCategory::Recovery,
                ShardManagementErrorCode::UnexpectedError,
                format!(
                    "log entry {} has code {} but carries a {} payload",
                    entry.id,
                    entry.operation_code.name(),
                    payload.kind_name()
                ),
            ));
        }
        Ok(payload)
    }

    fn kind_name(&self) -> &'static str {
        match self {
            OperationPayload::AddShard(_) => "AddShard",
            OperationPayload::RemoveShard(_) => "RemoveShard",
            OperationPayload::UpdateShard(_) => "UpdateShard",
            OperationPayload::AddMapping(_) => "AddMapping",
            OperationPayload::RemoveMapping(_) => "RemoveMapping",
            OperationPayload::UpdateMapping(_) => "UpdateMapping",
            OperationPayload::ReplaceMappings(_) => "ReplaceMappings",
            OperationPayload::AttachShard(_) => "AttachShard",
        }
    }

    /// Whether `code` is a valid operation code for this payload.
    pub fn accepts(&self, code: OperationCode) -> bool {
        use OperationCode::*;
        match self {
            OperationPayload::AddShard(_) => code == AddShard,
            OperationPayload::RemoveShard(_) => code == RemoveShard,
            OperationPayload::UpdateShard(_) => code == UpdateShard,
            OperationPayload::AddMapping(_) => matches!(code, AddPointMapping | AddRangeMapping),
            OperationPayload::RemoveMapping(_) => matches!(code, RemovePointMapping | RemoveRangeMapping),
            OperationPayload::UpdateMapping(_) => matches!(
                code,
                UpdatePointMapping | UpdatePointMappingWithOffline | UpdateRangeMapping | UpdateRangeMappingWithOffline
            ),
            OperationPayload::ReplaceMappings(_) => matches!(code, SplitMapping | MergeMappings | ReplaceMappings),
            OperationPayload::AttachShard(_) => code == AttachShard,
        }
    }
}

fn corrupt(category: ShardManagementErrorCategory, error: StoreError) -> ShardManagementError {
    ShardManagementError::new(
        category,
        ShardManagementErrorCode::UnexpectedError,
        format!("operation payload could not be encoded or decoded: {}", error),
    )
    .with_source(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ShardKeyType;
    use crate::store::request::new_log_entry;
    use crate::store::{ShardLocation, ShardMapKind, ShardStatus, StoreShard, StoreShardMap};
    use uuid::Uuid;

    fn add_shard() -> OperationPayload {
        let shard_map = StoreShardMap::new("orders", ShardMapKind::Range, ShardKeyType::Int32);
        let shard = StoreShard::new(shard_map.id, ShardLocation::new("srv", "s1"), ShardStatus::Online);
        OperationPayload::AddShard(AddShardOperation { shard_map, shard })
    }

    #[test]
    fn test_decodes_from_log_entry() {
        let payload = add_shard();
        let entry = new_log_entry(Uuid::new_v4(), OperationCode::AddShard, payload.to_bytes().unwrap(), None, None);
        assert_eq!(OperationPayload::from_log_entry(&entry).unwrap(), payload);
    }

    #[test]
    fn test_code_must_match_payload() {
        let payload = add_shard();
        let entry = new_log_entry(Uuid::new_v4(), OperationCode::SplitMapping, payload.to_bytes().unwrap(), None, None);
        let err = OperationPayload::from_log_entry(&entry).err().unwrap();
        assert_eq!(err.code, ShardManagementErrorCode::UnexpectedError);
        assert_eq!(err.category, ShardManagementErrorCategory::Recovery);
    }

    #[test]
    fn test_garbage_data_is_rejected() {
        let entry = new_log_entry(Uuid::new_v4(), OperationCode::AddShard, b"not json".to_vec(), None, None);
        assert!(OperationPayload::from_log_entry(&entry).is_err());
    }
}
