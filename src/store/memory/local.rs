//! Local (per-shard) store semantics over in-memory tables

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::global::MappingRow;
use crate::key::ShardRange;
use crate::store::request::StoreRequest;
use crate::store::result::{StoreResult, StoreResults};
use crate::store::types::{MappingStatus, StoreMapping, StoreShard, StoreShardMap, StoreVersion};
use crate::store::StoreError;

/// A shard's own copy of the metadata that concerns it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LocalState {
    pub version: StoreVersion,
    pub shard_maps: Vec<StoreShardMap>,
    pub shards: Vec<StoreShard>,
    pub mappings: Vec<MappingRow>,
}

impl LocalState {
    pub fn new(version: StoreVersion) -> Self {
        Self {
            version,
            shard_maps: Vec::new(),
            shards: Vec::new(),
            mappings: Vec::new(),
        }
    }

    pub fn shard(&self, id: Uuid) -> Option<&StoreShard> {
        self.shards.iter().find(|s| s.id == id)
    }

    /// Mappings of one shard map held here, ordered by key.
    pub fn mappings_for(&self, shard_map_id: Uuid) -> Vec<StoreMapping> {
        let mut rows: Vec<&MappingRow> = self.mappings.iter().filter(|m| m.shard_map_id == shard_map_id).collect();
        rows.sort_by(|a, b| a.min_value.cmp(&b.min_value));
        rows.into_iter()
            .filter_map(|row| self.shard(row.shard_id).map(|shard| row.to_mapping(shard)))
            .collect()
    }

    pub fn execute(&mut self, request: &StoreRequest) -> Result<StoreResults, StoreError> {
        let results = match request {
            StoreRequest::GetShardsLocal => StoreResults::success()
                .with_shard_maps(self.shard_maps.clone())
                .with_shards(self.shards.clone()),
            StoreRequest::GetMappingsByRangeLocal { shard_map, shard, range } => {
                self.get_mappings(shard_map, shard, range.as_ref())
            }
            StoreRequest::AddShardLocal {
                shard_map, shard, undo, ..
            } => {
                if *undo {
                    self.drop_shard(shard);
                } else {
                    self.upsert_shard_map(shard_map);
                    self.upsert_shard(shard);
                }
                StoreResults::success()
            }
            StoreRequest::RemoveShardLocal { shard, .. } => {
                self.drop_shard(shard);
                StoreResults::success()
            }
            StoreRequest::UpdateShardLocal { shard_map, shard, .. } => {
                self.upsert_shard_map(shard_map);
                self.upsert_shard(shard);
                StoreResults::success()
            }
            StoreRequest::BulkOperationShardMappingsLocal {
                shard_map,
                shard,
                removes,
                adds,
                expected_versions,
                ..
            } => {
                if let (Some(expected), Some(current)) = (expected_versions, self.shard(shard.id)) {
                    if !expected.contains(&current.version) {
                        return Ok(StoreResults::new(StoreResult::ShardVersionMismatch));
                    }
                }
                self.upsert_shard_map(shard_map);
                self.upsert_shard(shard);
                let touched: HashSet<Uuid> = removes.iter().chain(adds.iter()).map(|m| m.id).collect();
                self.mappings.retain(|m| !touched.contains(&m.id));
                self.mappings.extend(adds.iter().map(|m| {
                    let mut row = MappingRow::from_mapping(m);
                    row.shard_id = shard.id;
                    row
                }));
                StoreResults::success()
            }
            StoreRequest::KillSessionsForShardMappingLocal { .. } => StoreResults::success(),
            StoreRequest::ValidateShardLocal {
                shard_map_id,
                shard_id,
                shard_version,
            } => {
                if !self.shard_maps.iter().any(|m| m.id == *shard_map_id) {
                    StoreResults::new(StoreResult::ShardMapDoesNotExist)
                } else {
                    match self.shard(*shard_id) {
                        None => StoreResults::new(StoreResult::ShardDoesNotExist),
                        Some(s) if s.version != *shard_version => StoreResults::new(StoreResult::ShardVersionMismatch),
                        Some(_) => StoreResults::success(),
                    }
                }
            }
            StoreRequest::ValidateShardMappingLocal {
                shard_map_id,
                mapping_id,
            } => {
                if !self.shard_maps.iter().any(|m| m.id == *shard_map_id) {
                    StoreResults::new(StoreResult::ShardMapDoesNotExist)
                } else {
                    match self.mappings.iter().find(|m| m.id == *mapping_id && m.shard_map_id == *shard_map_id) {
                        None => StoreResults::new(StoreResult::MappingDoesNotExist),
                        Some(m) if m.status == MappingStatus::Offline => {
                            StoreResults::new(StoreResult::MappingIsOffline)
                        }
                        Some(_) => StoreResults::success(),
                    }
                }
            }
            other => {
                return Err(StoreError::InvalidRequest(format!(
                    "{} is not a local store request",
                    other.name()
                )))
            }
        };
        Ok(results)
    }

    fn get_mappings(&self, shard_map: &StoreShardMap, shard: &StoreShard, range: Option<&ShardRange>) -> StoreResults {
        if !self.shard_maps.iter().any(|m| m.id == shard_map.id) {
            return StoreResults::new(StoreResult::ShardMapDoesNotExist);
        }
        if self.shard(shard.id).is_none() {
            return StoreResults::new(StoreResult::ShardDoesNotExist);
        }
        let mappings = self
            .mappings_for(shard_map.id)
            .into_iter()
            .filter(|m| m.shard.id == shard.id)
            .filter(|m| range.map_or(true, |r| m.intersects_range(r)))
            .collect();
        StoreResults::success().with_mappings(mappings)
    }

    fn upsert_shard_map(&mut self, shard_map: &StoreShardMap) {
        match self.shard_maps.iter_mut().find(|m| m.id == shard_map.id) {
            Some(existing) => *existing = shard_map.clone(),
            None => self.shard_maps.push(shard_map.clone()),
        }
    }

    fn upsert_shard(&mut self, shard: &StoreShard) {
        match self.shards.iter_mut().find(|s| s.id == shard.id) {
            Some(existing) => *existing = shard.clone(),
            None => self.shards.push(shard.clone()),
        }
    }

    /// Remove a shard, its mappings, and its shard map once no shard of that
    /// map remains.
    fn drop_shard(&mut self, shard: &StoreShard) {
        self.mappings.retain(|m| m.shard_id != shard.id);
        self.shards.retain(|s| s.id != shard.id);
        let shard_map_id = shard.shard_map_id;
        if !self.shards.iter().any(|s| s.shard_map_id == shard_map_id) {
            self.shard_maps.retain(|m| m.id != shard_map_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{ShardKeyType, ShardRange};
    use crate::store::types::{MappingStatus, ShardLocation, ShardMapKind, ShardStatus, LOCAL_STORE_VERSION};

    fn fixture() -> (LocalState, StoreShardMap, StoreShard) {
        let map = StoreShardMap::new("orders", ShardMapKind::Range, ShardKeyType::Int32);
        let shard = StoreShard::new(map.id, ShardLocation::new("srv", "shard1"), ShardStatus::Online);
        let mut lsm = LocalState::new(LOCAL_STORE_VERSION);
        lsm.execute(&StoreRequest::AddShardLocal {
            operation_id: Uuid::new_v4(),
            shard_map: map.clone(),
            shard: shard.clone(),
            undo: false,
        })
        .unwrap();
        (lsm, map, shard)
    }

    fn bulk(map: &StoreShardMap, shard: &StoreShard, adds: Vec<StoreMapping>) -> StoreRequest {
        StoreRequest::BulkOperationShardMappingsLocal {
            operation_id: Uuid::new_v4(),
            shard_map: map.clone(),
            shard: shard.clone(),
            removes: Vec::new(),
            adds,
            expected_versions: None,
        }
    }

    #[test]
    fn test_bulk_add_is_idempotent() {
        let (mut lsm, map, shard) = fixture();
        let mapping = StoreMapping::range(map.id, &ShardRange::i32(0, 100).unwrap(), shard.clone(), MappingStatus::Online);
        let request = bulk(&map, &shard, vec![mapping]);

        lsm.execute(&request).unwrap();
        let once = lsm.clone();
        lsm.execute(&request).unwrap();

        assert_eq!(lsm, once);
        assert_eq!(lsm.mappings.len(), 1);
    }

    #[test]
    fn test_version_fence_rejects_foreign_version() {
        let (mut lsm, map, shard) = fixture();
        let request = StoreRequest::BulkOperationShardMappingsLocal {
            operation_id: Uuid::new_v4(),
            shard_map: map.clone(),
            shard: shard.with_version(Uuid::new_v4()),
            removes: Vec::new(),
            adds: Vec::new(),
            expected_versions: Some(vec![Uuid::new_v4()]),
        };
        let results = lsm.execute(&request).unwrap();
        assert_eq!(results.result, StoreResult::ShardVersionMismatch);
        assert_eq!(lsm.shard(shard.id).unwrap().version, shard.version);
    }

    #[test]
    fn test_validate_mapping() {
        let (mut lsm, map, shard) = fixture();
        let online = StoreMapping::point(map.id, crate::key::ShardKey::from_i32(1), shard.clone(), MappingStatus::Online);
        let offline = StoreMapping::point(map.id, crate::key::ShardKey::from_i32(2), shard.clone(), MappingStatus::Offline);
        lsm.execute(&bulk(&map, &shard, vec![online.clone(), offline.clone()])).unwrap();

        let check = |lsm: &mut LocalState, id| {
            lsm.execute(&StoreRequest::ValidateShardMappingLocal {
                shard_map_id: map.id,
                mapping_id: id,
            })
            .unwrap()
            .result
        };
        assert_eq!(check(&mut lsm, online.id), StoreResult::Success);
        assert_eq!(check(&mut lsm, offline.id), StoreResult::MappingIsOffline);
        assert_eq!(check(&mut lsm, Uuid::new_v4()), StoreResult::MappingDoesNotExist);
    }

    #[test]
    fn test_undo_add_shard_removes_everything() {
        let (mut lsm, map, shard) = fixture();
        lsm.execute(&StoreRequest::AddShardLocal {
            operation_id: Uuid::new_v4(),
            shard_map: map,
            shard,
            undo: true,
        })
        .unwrap();
        assert!(lsm.shards.is_empty());
        assert!(lsm.shard_maps.is_empty());
    }
}
