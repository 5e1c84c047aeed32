//! Global store semantics over in-memory tables

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::key::{ShardKey, ShardRange};
use crate::store::request::{GlobalChange, LockOwnerIdOpType, MappingRemoval, StoreRequest};
use crate::store::result::{StoreResult, StoreResults};
use crate::store::types::{
    MappingStatus, ShardLocation, StoreLogEntry, StoreMapping, StoreSchemaInfo, StoreShard,
    StoreShardMap, StoreVersion, FORCE_UNLOCK_OWNER_ID,
};
use crate::store::StoreError;

/// Stored form of a mapping; the shard is joined in on read.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MappingRow {
    pub id: Uuid,
    pub shard_map_id: Uuid,
    pub min_value: ShardKey,
    pub max_value: Option<ShardKey>,
    pub status: MappingStatus,
    pub lock_owner_id: Option<Uuid>,
    pub shard_id: Uuid,
}

impl MappingRow {
    pub fn from_mapping(mapping: &StoreMapping) -> Self {
        Self {
            id: mapping.id,
            shard_map_id: mapping.shard_map_id,
            min_value: mapping.min_value.clone(),
            max_value: mapping.max_value.clone(),
            status: mapping.status,
            lock_owner_id: mapping.lock_owner_id,
            shard_id: mapping.shard.id,
        }
    }

    pub fn to_mapping(&self, shard: &StoreShard) -> StoreMapping {
        StoreMapping {
            id: self.id,
            shard_map_id: self.shard_map_id,
            min_value: self.min_value.clone(),
            max_value: self.max_value.clone(),
            status: self.status,
            lock_owner_id: self.lock_owner_id,
            shard: shard.clone(),
        }
    }

    pub fn overlaps(&self, mapping: &StoreMapping) -> bool {
        spans_overlap(
            &self.min_value,
            self.max_value.as_ref(),
            &mapping.min_value,
            mapping.max_value.as_ref(),
        )
    }

    pub fn covers(&self, key: &ShardKey) -> bool {
        match &self.max_value {
            None => self.min_value == *key,
            Some(high) => self.min_value <= *key && key < high,
        }
    }

    pub fn intersects(&self, range: &ShardRange) -> bool {
        match &self.max_value {
            None => range.contains(&self.min_value),
            Some(high) => self.min_value < *range.high() && *range.low() < *high,
        }
    }
}

fn spans_overlap(a_min: &ShardKey, a_max: Option<&ShardKey>, b_min: &ShardKey, b_max: Option<&ShardKey>) -> bool {
    match (a_max, b_max) {
        (None, None) => a_min == b_min,
        (Some(a_high), None) => a_min <= b_min && b_min < a_high,
        (None, Some(b_high)) => b_min <= a_min && a_min < b_high,
        (Some(a_high), Some(b_high)) => a_min < b_high && b_min < a_high,
    }
}

fn lock_matches(current: Option<Uuid>, presented: Uuid) -> bool {
    presented == FORCE_UNLOCK_OWNER_ID || current.unwrap_or_else(Uuid::nil) == presented
}

fn already_mapped(mapping: &StoreMapping) -> StoreResult {
    if mapping.is_point() {
        StoreResult::MappingPointAlreadyMapped
    } else {
        StoreResult::MappingRangeAlreadyMapped
    }
}

/// Global store tables.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GlobalState {
    pub version: StoreVersion,
    pub shard_maps: Vec<StoreShardMap>,
    pub shards: Vec<StoreShard>,
    pub mappings: Vec<MappingRow>,
    pub log_entries: Vec<StoreLogEntry>,
    pub schema_info: Vec<StoreSchemaInfo>,
}

impl GlobalState {
    pub fn new(version: StoreVersion) -> Self {
        Self {
            version,
            shard_maps: Vec::new(),
            shards: Vec::new(),
            mappings: Vec::new(),
            log_entries: Vec::new(),
            schema_info: Vec::new(),
        }
    }

    pub fn shard_map(&self, id: Uuid) -> Option<&StoreShardMap> {
        self.shard_maps.iter().find(|m| m.id == id)
    }

    pub fn shard(&self, id: Uuid) -> Option<&StoreShard> {
        self.shards.iter().find(|s| s.id == id)
    }

    /// Mappings of a shard map joined with their shards, ordered by key.
    pub fn mappings_for(&self, shard_map_id: Uuid) -> Vec<StoreMapping> {
        let mut rows: Vec<&MappingRow> = self.mappings.iter().filter(|m| m.shard_map_id == shard_map_id).collect();
        rows.sort_by(|a, b| a.min_value.cmp(&b.min_value));
        rows.into_iter()
            .filter_map(|row| self.shard(row.shard_id).map(|shard| row.to_mapping(shard)))
            .collect()
    }

    fn join(&self, row: &MappingRow) -> Option<StoreMapping> {
        self.shard(row.shard_id).map(|shard| row.to_mapping(shard))
    }

    pub fn execute(&mut self, request: &StoreRequest) -> Result<StoreResults, StoreError> {
        let results = match request {
            StoreRequest::GetShardMapsGlobal => StoreResults::success().with_shard_maps(self.shard_maps.clone()),
            StoreRequest::FindShardMapByNameGlobal { name } => {
                let found = self.shard_maps.iter().filter(|m| m.name == *name).cloned().collect();
                StoreResults::success().with_shard_maps(found)
            }
            StoreRequest::AddShardMapGlobal { shard_map } => self.add_shard_map(shard_map),
            StoreRequest::RemoveShardMapGlobal { shard_map } => self.remove_shard_map(shard_map),
            StoreRequest::GetShardsGlobal { shard_map } => {
                if self.shard_map(shard_map.id).is_none() {
                    return Ok(StoreResults::new(StoreResult::ShardMapDoesNotExist));
                }
                let shards = self.shards.iter().filter(|s| s.shard_map_id == shard_map.id).cloned().collect();
                StoreResults::success().with_shards(shards)
            }
            StoreRequest::FindShardByLocationGlobal { shard_map, location } => {
                if self.shard_map(shard_map.id).is_none() {
                    return Ok(StoreResults::new(StoreResult::ShardMapDoesNotExist));
                }
                let shards = self
                    .shards
                    .iter()
                    .filter(|s| s.shard_map_id == shard_map.id && s.location == *location)
                    .cloned()
                    .collect();
                StoreResults::success().with_shards(shards)
            }
            StoreRequest::GetDistinctShardLocationsGlobal => {
                let mut locations: Vec<ShardLocation> = self.shards.iter().map(|s| s.location.clone()).collect();
                locations.sort();
                locations.dedup();
                StoreResults::success().with_locations(locations)
            }
            StoreRequest::GetMappingsByRangeGlobal { shard_map, shard, range } => {
                self.get_mappings(shard_map, shard.as_ref(), range.as_ref())
            }
            StoreRequest::FindMappingByKeyGlobal { shard_map, key } => {
                if self.shard_map(shard_map.id).is_none() {
                    return Ok(StoreResults::new(StoreResult::ShardMapDoesNotExist));
                }
                let found = self
                    .mappings
                    .iter()
                    .find(|m| m.shard_map_id == shard_map.id && m.covers(key))
                    .and_then(|row| self.join(row));
                match found {
                    Some(mapping) => StoreResults::success().with_mappings(vec![mapping]),
                    None => StoreResults::new(StoreResult::MappingNotFoundForKey),
                }
            }
            StoreRequest::FindMappingByIdGlobal { shard_map, mapping_id } => {
                if self.shard_map(shard_map.id).is_none() {
                    return Ok(StoreResults::new(StoreResult::ShardMapDoesNotExist));
                }
                let found = self
                    .mappings
                    .iter()
                    .find(|m| m.shard_map_id == shard_map.id && m.id == *mapping_id)
                    .and_then(|row| self.join(row));
                match found {
                    Some(mapping) => StoreResults::success().with_mappings(vec![mapping]),
                    None => StoreResults::new(StoreResult::MappingDoesNotExist),
                }
            }
            StoreRequest::LockOrUnlockMappingsGlobal {
                shard_map,
                mapping,
                lock_owner_id,
                lock_op,
            } => self.lock_or_unlock(shard_map, mapping.as_ref(), *lock_owner_id, *lock_op),
            StoreRequest::BeginOperationGlobal { entry, shard_map, change } => {
                self.begin_operation(entry, shard_map, change)
            }
            StoreRequest::EndOperationGlobal {
                operation_id,
                shard_map,
                change,
                undo,
            } => self.end_operation(*operation_id, shard_map, change, *undo),
            StoreRequest::FindAndUpdateOperationLogEntryByIdGlobal {
                operation_id,
                undo_start_state,
            } => {
                match self.log_entries.iter_mut().find(|e| e.id == *operation_id) {
                    Some(entry) => {
                        entry.undo_start_state = *undo_start_state;
                        StoreResults::success().with_log_entries(vec![entry.clone()])
                    }
                    None => StoreResults::success(),
                }
            }
            StoreRequest::GetOperationLogEntriesGlobal => {
                let mut entries = self.log_entries.clone();
                entries.sort_by_key(|e| e.created_at);
                StoreResults::success().with_log_entries(entries)
            }
            StoreRequest::DetachShardGlobal {
                location,
                shard_map_name,
            } => self.detach_shard(location, shard_map_name.as_deref()),
            StoreRequest::GetAllSchemaInfosGlobal => StoreResults::success().with_schema_info(self.schema_info.clone()),
            StoreRequest::FindSchemaInfoGlobal { name } => match self.schema_info.iter().find(|s| s.name == *name) {
                Some(info) => StoreResults::success().with_schema_info(vec![info.clone()]),
                None => StoreResults::new(StoreResult::SchemaInfoNameDoesNotExist),
            },
            StoreRequest::AddSchemaInfoGlobal { schema_info } => {
                if self.schema_info.iter().any(|s| s.name == schema_info.name) {
                    StoreResults::new(StoreResult::SchemaInfoNameConflict)
                } else {
                    self.schema_info.push(schema_info.clone());
                    StoreResults::success()
                }
            }
            StoreRequest::UpdateSchemaInfoGlobal { schema_info } => {
                match self.schema_info.iter_mut().find(|s| s.name == schema_info.name) {
                    Some(existing) => {
                        *existing = schema_info.clone();
                        StoreResults::success()
                    }
                    None => StoreResults::new(StoreResult::SchemaInfoNameDoesNotExist),
                }
            }
            StoreRequest::RemoveSchemaInfoGlobal { name } => {
                let before = self.schema_info.len();
                self.schema_info.retain(|s| s.name != *name);
                if self.schema_info.len() == before {
                    StoreResults::new(StoreResult::SchemaInfoNameDoesNotExist)
                } else {
                    StoreResults::success()
                }
            }
            other => {
                return Err(StoreError::InvalidRequest(format!(
                    "{} is not a global store request",
                    other.name()
                )))
            }
        };
        Ok(results)
    }

    fn add_shard_map(&mut self, shard_map: &StoreShardMap) -> StoreResults {
        if self.shard_maps.iter().any(|m| m.id == shard_map.id || m.name == shard_map.name) {
            return StoreResults::new(StoreResult::ShardMapExists);
        }
        self.shard_maps.push(shard_map.clone());
        StoreResults::success()
    }

    fn remove_shard_map(&mut self, shard_map: &StoreShardMap) -> StoreResults {
        if self.shard_map(shard_map.id).is_none() {
            return StoreResults::new(StoreResult::ShardMapDoesNotExist);
        }
        if self.shards.iter().any(|s| s.shard_map_id == shard_map.id) {
            return StoreResults::new(StoreResult::ShardMapHasShards);
        }
        self.shard_maps.retain(|m| m.id != shard_map.id);
        StoreResults::success()
    }

    fn get_mappings(&self, shard_map: &StoreShardMap, shard: Option<&StoreShard>, range: Option<&ShardRange>) -> StoreResults {
        if self.shard_map(shard_map.id).is_none() {
            return StoreResults::new(StoreResult::ShardMapDoesNotExist);
        }
        if let Some(shard) = shard {
            if self.shard(shard.id).is_none() {
                return StoreResults::new(StoreResult::ShardDoesNotExist);
            }
        }
        let mappings = self
            .mappings_for(shard_map.id)
            .into_iter()
            .filter(|m| shard.map_or(true, |s| m.shard.id == s.id))
            .filter(|m| range.map_or(true, |r| m.intersects_range(r)))
            .collect();
        StoreResults::success().with_mappings(mappings)
    }

    fn lock_or_unlock(
        &mut self,
        shard_map: &StoreShardMap,
        mapping: Option<&StoreMapping>,
        lock_owner_id: Uuid,
        lock_op: LockOwnerIdOpType,
    ) -> StoreResults {
        if self.shard_map(shard_map.id).is_none() {
            return StoreResults::new(StoreResult::ShardMapDoesNotExist);
        }
        match lock_op {
            LockOwnerIdOpType::Lock | LockOwnerIdOpType::UnlockMappingForId => {
                let Some(mapping) = mapping else {
                    return StoreResults::new(StoreResult::MissingParametersForStoredProcedure);
                };
                let Some(row) = self.mappings.iter_mut().find(|m| m.id == mapping.id) else {
                    return StoreResults::new(StoreResult::MappingDoesNotExist);
                };
                if lock_op == LockOwnerIdOpType::Lock {
                    if row.lock_owner_id.is_some() {
                        return StoreResults::new(StoreResult::MappingIsAlreadyLocked);
                    }
                    row.lock_owner_id = Some(lock_owner_id);
                } else {
                    if row.lock_owner_id.is_none() || !lock_matches(row.lock_owner_id, lock_owner_id) {
                        return StoreResults::new(StoreResult::MappingLockOwnerIdDoesNotMatch);
                    }
                    row.lock_owner_id = None;
                }
            }
            LockOwnerIdOpType::UnlockAllMappingsForId => {
                for row in self.mappings.iter_mut().filter(|m| m.shard_map_id == shard_map.id) {
                    if row.lock_owner_id == Some(lock_owner_id) {
                        row.lock_owner_id = None;
                    }
                }
            }
            LockOwnerIdOpType::UnlockAllMappings => {
                for row in self.mappings.iter_mut().filter(|m| m.shard_map_id == shard_map.id) {
                    row.lock_owner_id = None;
                }
            }
        }
        StoreResults::success()
    }

    fn begin_operation(&mut self, entry: &StoreLogEntry, shard_map: &StoreShardMap, change: &GlobalChange) -> StoreResults {
        if let Some(existing) = self.log_entries.iter().find(|e| e.id == entry.id) {
            return StoreResults::success().with_log_entries(vec![existing.clone()]);
        }

        let map_check = self.check_shard_map(shard_map, change);
        if map_check != StoreResult::Success {
            return StoreResults::new(map_check);
        }

        let touched: Vec<Uuid> = [entry.shard_id_removes, entry.shard_id_adds].into_iter().flatten().collect();
        if let Some(pending) = self
            .log_entries
            .iter()
            .find(|e| touched.iter().any(|id| e.touches_shard(*id)))
        {
            return StoreResults::new(StoreResult::ShardPendingOperation).with_log_entries(vec![pending.clone()]);
        }

        let validated = self.validate_change(shard_map, change);
        if validated != StoreResult::Success {
            return StoreResults::new(validated);
        }

        let mut recorded = entry.clone();
        recorded.original_shard_version_removes =
            entry.shard_id_removes.and_then(|id| self.shard(id)).map(|s| s.version);
        recorded.original_shard_version_adds = entry.shard_id_adds.and_then(|id| self.shard(id)).map(|s| s.version);
        self.log_entries.push(recorded.clone());
        StoreResults::success().with_log_entries(vec![recorded])
    }

    fn check_shard_map(&self, shard_map: &StoreShardMap, change: &GlobalChange) -> StoreResult {
        if self.shard_map(shard_map.id).is_some() {
            return StoreResult::Success;
        }
        match change {
            GlobalChange::Attach { shard_map: attached, .. } => {
                if self.shard_maps.iter().any(|m| m.name == attached.name) {
                    StoreResult::ShardMapExists
                } else {
                    StoreResult::Success
                }
            }
            _ => StoreResult::ShardMapDoesNotExist,
        }
    }

    fn validate_change(&self, shard_map: &StoreShardMap, change: &GlobalChange) -> StoreResult {
        match change {
            GlobalChange::Shards { removes, adds } => {
                for shard in removes {
                    let Some(current) = self.shard(shard.id) else {
                        return StoreResult::ShardDoesNotExist;
                    };
                    if current.version != shard.version {
                        return StoreResult::ShardVersionMismatch;
                    }
                    let replaced = adds.iter().any(|a| a.id == shard.id);
                    if !replaced && self.mappings.iter().any(|m| m.shard_id == shard.id) {
                        return StoreResult::ShardHasMappings;
                    }
                }
                for shard in adds {
                    let replacing = removes.iter().any(|r| r.id == shard.id);
                    if !replacing && self.shard(shard.id).is_some() {
                        return StoreResult::ShardExists;
                    }
                    if self.location_taken(shard) {
                        return StoreResult::ShardLocationExists;
                    }
                }
                StoreResult::Success
            }
            GlobalChange::Mappings {
                removes,
                adds,
                require_offline_removes,
                ..
            } => self.validate_mapping_change(shard_map, removes, adds, *require_offline_removes, None),
            GlobalChange::Attach { shard, mappings, .. } => {
                if self.shard(shard.id).is_some() {
                    return StoreResult::ShardExists;
                }
                if self.location_taken(shard) {
                    return StoreResult::ShardLocationExists;
                }
                self.validate_mapping_change(shard_map, &[], mappings, false, Some(shard.id))
            }
        }
    }

    fn location_taken(&self, shard: &StoreShard) -> bool {
        self.shards
            .iter()
            .any(|s| s.shard_map_id == shard.shard_map_id && s.id != shard.id && s.location == shard.location)
    }

    fn validate_mapping_change(
        &self,
        shard_map: &StoreShardMap,
        removes: &[MappingRemoval],
        adds: &[StoreMapping],
        require_offline_removes: bool,
        incoming_shard: Option<Uuid>,
    ) -> StoreResult {
        for removal in removes {
            let Some(row) = self.mappings.iter().find(|m| m.id == removal.mapping.id) else {
                return StoreResult::MappingDoesNotExist;
            };
            if !lock_matches(row.lock_owner_id, removal.lock_owner_id) {
                return StoreResult::MappingLockOwnerIdDoesNotMatch;
            }
            if require_offline_removes && row.status != MappingStatus::Offline {
                return StoreResult::MappingIsNotOffline;
            }
        }

        for add in adds {
            if self.shard(add.shard.id).is_none() && incoming_shard != Some(add.shard.id) {
                return StoreResult::ShardDoesNotExist;
            }
        }
        self.check_key_space(shard_map, removes, adds)
    }

    /// Added mappings must not overlap each other or any mapping that stays.
    fn check_key_space(&self, shard_map: &StoreShardMap, removes: &[MappingRemoval], adds: &[StoreMapping]) -> StoreResult {
        let removed: HashSet<Uuid> = removes.iter().map(|r| r.mapping.id).collect();
        for (i, add) in adds.iter().enumerate() {
            let clashes_existing = self
                .mappings
                .iter()
                .filter(|m| m.shard_map_id == shard_map.id && !removed.contains(&m.id))
                .any(|m| m.overlaps(add));
            let clashes_new = adds[..i].iter().any(|other| other.overlaps(add));
            if clashes_existing || clashes_new {
                return already_mapped(add);
            }
        }
        StoreResult::Success
    }

    fn end_operation(&mut self, operation_id: Uuid, shard_map: &StoreShardMap, change: &GlobalChange, undo: bool) -> StoreResults {
        let position = self.log_entries.iter().position(|e| e.id == operation_id);

        if undo {
            let Some(position) = position else {
                return StoreResults::success();
            };
            let entry = &self.log_entries[position];
            let fences = [
                (entry.shard_id_removes, entry.original_shard_version_removes),
                (entry.shard_id_adds, entry.original_shard_version_adds),
            ];
            for (shard_id, original) in fences {
                if let (Some(shard_id), Some(original)) = (shard_id, original) {
                    if self.shard(shard_id).map_or(false, |s| s.version != original) {
                        return StoreResults::new(StoreResult::ShardVersionMismatch);
                    }
                }
            }
            self.log_entries.remove(position);
            return StoreResults::success();
        }

        let Some(position) = position else {
            // Replay after the change was already applied.
            return if self.change_applied(change) {
                StoreResults::success()
            } else {
                StoreResults::new(StoreResult::UnexpectedStoreError)
            };
        };

        // Operations on other shards may have claimed the same keys since Begin.
        let key_space = match change {
            GlobalChange::Mappings { removes, adds, .. } => self.check_key_space(shard_map, removes, adds),
            GlobalChange::Attach { mappings, .. } => self.check_key_space(shard_map, &[], mappings),
            GlobalChange::Shards { .. } => StoreResult::Success,
        };
        if key_space != StoreResult::Success {
            return StoreResults::new(key_space);
        }

        self.apply_change(shard_map, change);
        self.log_entries.remove(position);
        StoreResults::success()
    }

    fn change_applied(&self, change: &GlobalChange) -> bool {
        match change {
            GlobalChange::Shards { removes, adds } => {
                adds.iter().all(|a| self.shard(a.id).map_or(false, |s| s.version == a.version))
                    && removes
                        .iter()
                        .filter(|r| !adds.iter().any(|a| a.id == r.id))
                        .all(|r| self.shard(r.id).is_none())
            }
            GlobalChange::Mappings { removes, adds, .. } => {
                adds.iter().all(|a| self.mappings.iter().any(|m| m.id == a.id))
                    && removes
                        .iter()
                        .filter(|r| !adds.iter().any(|a| a.id == r.mapping.id))
                        .all(|r| !self.mappings.iter().any(|m| m.id == r.mapping.id))
            }
            GlobalChange::Attach { shard, .. } => self.shard(shard.id).is_some(),
        }
    }

    fn apply_change(&mut self, shard_map: &StoreShardMap, change: &GlobalChange) {
        match change {
            GlobalChange::Shards { removes, adds } => {
                let removed: HashSet<Uuid> = removes.iter().map(|s| s.id).collect();
                self.shards.retain(|s| !removed.contains(&s.id));
                self.shards.extend(adds.iter().cloned());
            }
            GlobalChange::Mappings {
                removes,
                adds,
                new_versions,
                ..
            } => {
                let removed: HashSet<Uuid> = removes.iter().map(|r| r.mapping.id).collect();
                self.mappings.retain(|m| !removed.contains(&m.id));
                self.mappings.extend(adds.iter().map(MappingRow::from_mapping));
                for (shard_id, version) in new_versions {
                    if let Some(shard) = self.shards.iter_mut().find(|s| s.id == *shard_id) {
                        shard.version = *version;
                    }
                }
            }
            GlobalChange::Attach {
                shard_map: attached,
                shard,
                mappings,
            } => {
                if self.shard_map(attached.id).is_none() {
                    self.shard_maps.push(attached.clone());
                }
                self.shards.push(shard.clone());
                self.mappings.extend(mappings.iter().map(MappingRow::from_mapping));
            }
        }
        log::trace!("applied change to shard map {}", shard_map.name);
    }

    fn detach_shard(&mut self, location: &ShardLocation, shard_map_name: Option<&str>) -> StoreResults {
        let maps: Vec<Uuid> = match shard_map_name {
            Some(name) => match self.shard_maps.iter().find(|m| m.name == name) {
                Some(map) => vec![map.id],
                None => return StoreResults::new(StoreResult::ShardMapDoesNotExist),
            },
            None => self.shard_maps.iter().map(|m| m.id).collect(),
        };
        let doomed: HashSet<Uuid> = self
            .shards
            .iter()
            .filter(|s| maps.contains(&s.shard_map_id) && s.location == *location)
            .map(|s| s.id)
            .collect();

        self.mappings.retain(|m| !doomed.contains(&m.shard_id));
        self.shards.retain(|s| !doomed.contains(&s.id));
        self.log_entries
            .retain(|e| !doomed.iter().any(|id| e.touches_shard(*id)));
        StoreResults::success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ShardKeyType;
    use crate::operations::OperationCode;
    use crate::store::request::new_log_entry;
    use crate::store::types::{ShardMapKind, ShardStatus, GLOBAL_STORE_VERSION};

    struct Fixture {
        gsm: GlobalState,
        map: StoreShardMap,
        shard: StoreShard,
    }

    fn fixture() -> Fixture {
        let map = StoreShardMap::new("orders", ShardMapKind::Range, ShardKeyType::Int32);
        let shard = StoreShard::new(map.id, ShardLocation::new("srv", "shard1"), ShardStatus::Online);
        let mut gsm = GlobalState::new(GLOBAL_STORE_VERSION);
        gsm.shard_maps.push(map.clone());
        gsm.shards.push(shard.clone());
        Fixture { gsm, map, shard }
    }

    fn add_mapping(f: &Fixture, low: i32, high: i32) -> (StoreLogEntry, GlobalChange) {
        let mapping = StoreMapping::range(f.map.id, &ShardRange::i32(low, high).unwrap(), f.shard.clone(), MappingStatus::Online);
        let entry = new_log_entry(Uuid::new_v4(), OperationCode::AddRangeMapping, Vec::new(), None, Some(f.shard.id));
        let change = GlobalChange::Mappings {
            removes: Vec::new(),
            adds: vec![mapping],
            require_offline_removes: false,
            new_versions: vec![(f.shard.id, Uuid::new_v4())],
        };
        (entry, change)
    }

    fn begin(f: &mut Fixture, entry: &StoreLogEntry, change: &GlobalChange) -> StoreResults {
        f.gsm
            .execute(&StoreRequest::BeginOperationGlobal {
                entry: entry.clone(),
                shard_map: f.map.clone(),
                change: change.clone(),
            })
            .unwrap()
    }

    fn end(f: &mut Fixture, entry: &StoreLogEntry, change: &GlobalChange, undo: bool) -> StoreResults {
        f.gsm
            .execute(&StoreRequest::EndOperationGlobal {
                operation_id: entry.id,
                shard_map: f.map.clone(),
                change: change.clone(),
                undo,
            })
            .unwrap()
    }

    #[test]
    fn test_begin_records_original_versions() {
        let mut f = fixture();
        let (entry, change) = add_mapping(&f, 0, 10);
        let results = begin(&mut f, &entry, &change);
        assert!(results.is_success());
        assert_eq!(results.log_entries[0].original_shard_version_adds, Some(f.shard.version));

        // Same operation id again is a no-op.
        assert!(begin(&mut f, &entry, &change).is_success());
        assert_eq!(f.gsm.log_entries.len(), 1);
    }

    #[test]
    fn test_second_operation_on_same_shard_is_pending() {
        let mut f = fixture();
        let (first, first_change) = add_mapping(&f, 0, 10);
        let (second, second_change) = add_mapping(&f, 20, 30);
        begin(&mut f, &first, &first_change);

        let results = begin(&mut f, &second, &second_change);
        assert_eq!(results.result, StoreResult::ShardPendingOperation);
        assert_eq!(results.log_entries[0].id, first.id);
    }

    #[test]
    fn test_end_applies_and_bumps_version() {
        let mut f = fixture();
        let (entry, change) = add_mapping(&f, 0, 10);
        begin(&mut f, &entry, &change);
        assert!(end(&mut f, &entry, &change, false).is_success());

        assert!(f.gsm.log_entries.is_empty());
        assert_eq!(f.gsm.mappings.len(), 1);
        let GlobalChange::Mappings { new_versions, .. } = &change else {
            unreachable!()
        };
        assert_eq!(f.gsm.shard(f.shard.id).unwrap().version, new_versions[0].1);

        // Replaying End once the change holds still succeeds.
        assert!(end(&mut f, &entry, &change, false).is_success());
    }

    #[test]
    fn test_overlap_is_rejected() {
        let mut f = fixture();
        let (entry, change) = add_mapping(&f, 0, 10);
        begin(&mut f, &entry, &change);
        end(&mut f, &entry, &change, false);

        let (entry, change) = add_mapping(&f, 5, 15);
        assert_eq!(begin(&mut f, &entry, &change).result, StoreResult::MappingRangeAlreadyMapped);
        assert!(f.gsm.log_entries.is_empty());
    }

    #[test]
    fn test_interleaved_operations_cannot_both_claim_keys() {
        let mut f = fixture();
        let other = StoreShard::new(f.map.id, ShardLocation::new("srv", "shard2"), ShardStatus::Online);
        f.gsm.shards.push(other.clone());

        let (first, first_change) = add_mapping(&f, 0, 10);
        let second_mapping =
            StoreMapping::range(f.map.id, &ShardRange::i32(5, 15).unwrap(), other.clone(), MappingStatus::Online);
        let second = new_log_entry(Uuid::new_v4(), OperationCode::AddRangeMapping, Vec::new(), None, Some(other.id));
        let second_change = GlobalChange::Mappings {
            removes: Vec::new(),
            adds: vec![second_mapping],
            require_offline_removes: false,
            new_versions: vec![(other.id, Uuid::new_v4())],
        };

        // Different shards, so neither Begin sees the other as pending.
        assert!(begin(&mut f, &first, &first_change).is_success());
        assert!(begin(&mut f, &second, &second_change).is_success());
        assert!(end(&mut f, &first, &first_change, false).is_success());

        let results = end(&mut f, &second, &second_change, false);
        assert_eq!(results.result, StoreResult::MappingRangeAlreadyMapped);
        assert_eq!(f.gsm.mappings.len(), 1);
        assert_eq!(f.gsm.log_entries.len(), 1);

        assert!(end(&mut f, &second, &second_change, true).is_success());
        assert!(f.gsm.log_entries.is_empty());
        assert_eq!(f.gsm.mappings[0].shard_id, f.shard.id);
    }

    #[test]
    fn test_undo_end_fences_on_version() {
        let mut f = fixture();
        let (entry, change) = add_mapping(&f, 0, 10);
        begin(&mut f, &entry, &change);
        f.gsm.shards[0].version = Uuid::new_v4();

        assert_eq!(end(&mut f, &entry, &change, true).result, StoreResult::ShardVersionMismatch);
        f.gsm.shards[0].version = f.shard.version;
        assert!(end(&mut f, &entry, &change, true).is_success());
        assert!(f.gsm.log_entries.is_empty());
        assert!(f.gsm.mappings.is_empty());
    }

    #[test]
    fn test_locked_mapping_cannot_be_removed_by_other_owner() {
        let mut f = fixture();
        let (entry, change) = add_mapping(&f, 0, 10);
        begin(&mut f, &entry, &change);
        end(&mut f, &entry, &change, false);
        let mapping = f.gsm.mappings_for(f.map.id).remove(0);
        let owner = Uuid::new_v4();

        let lock = |f: &mut Fixture, op| {
            f.gsm
                .execute(&StoreRequest::LockOrUnlockMappingsGlobal {
                    shard_map: f.map.clone(),
                    mapping: Some(mapping.clone()),
                    lock_owner_id: owner,
                    lock_op: op,
                })
                .unwrap()
                .result
        };
        assert_eq!(lock(&mut f, LockOwnerIdOpType::Lock), StoreResult::Success);
        assert_eq!(lock(&mut f, LockOwnerIdOpType::Lock), StoreResult::MappingIsAlreadyLocked);

        let remove = GlobalChange::Mappings {
            removes: vec![MappingRemoval {
                mapping: mapping.with_status(MappingStatus::Offline),
                lock_owner_id: Uuid::nil(),
            }],
            adds: Vec::new(),
            require_offline_removes: false,
            new_versions: Vec::new(),
        };
        let entry = new_log_entry(Uuid::new_v4(), OperationCode::RemoveRangeMapping, Vec::new(), Some(f.shard.id), None);
        assert_eq!(begin(&mut f, &entry, &remove).result, StoreResult::MappingLockOwnerIdDoesNotMatch);

        assert_eq!(lock(&mut f, LockOwnerIdOpType::UnlockMappingForId), StoreResult::Success);
    }

    #[test]
    fn test_detach_removes_shard_and_mappings() {
        let mut f = fixture();
        let (entry, change) = add_mapping(&f, 0, 10);
        begin(&mut f, &entry, &change);
        end(&mut f, &entry, &change, false);

        let results = f
            .gsm
            .execute(&StoreRequest::DetachShardGlobal {
                location: f.shard.location.clone(),
                shard_map_name: None,
            })
            .unwrap();
        assert!(results.is_success());
        assert!(f.gsm.shards.is_empty());
        assert!(f.gsm.mappings.is_empty());
        assert_eq!(f.gsm.shard_maps.len(), 1);
    }
}
