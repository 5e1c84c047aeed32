//! Recovery manager
//!
//! Detects where a shard's own record of its mappings disagrees with the
//! global store and resolves each difference in favour of one side. Also
//! detaches shards from, and attaches shards to, the global store.

mod compare;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use uuid::Uuid;

use crate::errors::handler::{on_recovery_manager_error_global, on_recovery_manager_error_local, ErrorSite};
use crate::errors::{
    Result, ShardManagementAggregateError, ShardManagementError, ShardManagementErrorCategory,
    ShardManagementErrorCode,
};
use crate::key::ShardRange;
use crate::operations::{
    run_global, run_local, AttachShardOperation, GlobalRequest, LocalRequest, OperationCode, OperationContext,
    OperationPayload, ReplaceMappingsOperation, StoreOperation,
};
use crate::store::{
    MappingRemoval, ShardLocation, ShardMapKind, StoreMapping, StoreRequest, StoreShard, StoreShardMap,
    FORCE_UNLOCK_OWNER_ID, LOCAL_STORE_VERSION,
};

/// Handle to the differences found by one detection pass on one shard map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RecoveryToken(Uuid);

impl RecoveryToken {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn id(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for RecoveryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MappingDifferenceType {
    List,
    Range,
}

/// Which side holds the mappings of a difference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MappingLocation {
    MappingInShardMapOnly,
    MappingInShardOnly,
    MappingInShardMapAndShard,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MappingDifferenceResolution {
    /// Forget the difference without changing either store.
    Ignore,
    /// Make the shard match the global store.
    KeepShardMapMapping,
    /// Make the global store match the shard.
    KeepShardMapping,
}

/// A group of overlapping mappings on which the two stores disagree.
#[derive(Clone, Debug, PartialEq)]
pub struct MappingDifference {
    pub id: Uuid,
    pub kind: MappingDifferenceType,
    pub location: MappingLocation,
    pub shard_map: StoreShardMap,
    /// Key span covered by the group, for range shard maps.
    pub range: Option<ShardRange>,
    pub mappings_for_shard_map: Vec<StoreMapping>,
    pub mappings_for_shard: Vec<StoreMapping>,
}

struct RecoverySession {
    location: ShardLocation,
    shard_map: StoreShardMap,
    /// The shard as registered globally, if it is.
    global_shard: Option<StoreShard>,
    local_shard: StoreShard,
    differences: Vec<MappingDifference>,
}

pub struct RecoveryManager {
    ctx: OperationContext,
    sessions: Mutex<HashMap<RecoveryToken, RecoverySession>>,
}

impl fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("sessions", &self.sessions().len())
            .finish()
    }
}

impl RecoveryManager {
    pub(crate) fn new(ctx: OperationContext) -> Self {
        Self {
            ctx,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<RecoveryToken, RecoverySession>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn site<'a>(&self, operation: &'a str) -> ErrorSite<'a> {
        ErrorSite::new(ShardManagementErrorCategory::Recovery, operation)
    }

    fn token_not_found(&self, operation: &str, token: RecoveryToken) -> ShardManagementError {
        self.site(operation).error(
            ShardManagementErrorCode::RecoveryTokenNotFound,
            format!("recovery token {} is not known", token),
        )
    }

    /// Confirm that `location` holds a compatible local store.
    fn check_shard_local(&self, location: &ShardLocation) -> Result<()> {
        let operation = "CheckShardLocal";
        let request = LocalRequest::new(
            operation,
            ShardManagementErrorCategory::Recovery,
            location,
            StoreRequest::GetStoreVersionLocal,
            &on_recovery_manager_error_local,
        );
        let site = self.site(operation).location(location);
        match run_local(&self.ctx, &request)?.version {
            None => Err(site.error(
                ShardManagementErrorCode::ShardNotValid,
                format!("{} does not hold a shard map manager local store", location),
            )),
            Some(version) if !LOCAL_STORE_VERSION.is_compatible_with(&version) => Err(site.error(
                ShardManagementErrorCode::LocalStoreVersionMismatch,
                format!("local store version {} at {} is not supported", version, location),
            )),
            Some(_) => Ok(()),
        }
    }

    fn local_shards(&self, location: &ShardLocation) -> Result<(Vec<StoreShardMap>, Vec<StoreShard>)> {
        let request = LocalRequest::new(
            "GetShardsLocal",
            ShardManagementErrorCategory::Recovery,
            location,
            StoreRequest::GetShardsLocal,
            &on_recovery_manager_error_local,
        );
        let results = run_local(&self.ctx, &request)?;
        Ok((results.shard_maps, results.shards))
    }

    fn local_mappings(&self, shard_map: &StoreShardMap, shard: &StoreShard) -> Result<Vec<StoreMapping>> {
        let request = LocalRequest::new(
            "GetMappingsByRangeLocal",
            ShardManagementErrorCategory::Recovery,
            &shard.location,
            StoreRequest::GetMappingsByRangeLocal {
                shard_map: shard_map.clone(),
                shard: shard.clone(),
                range: None,
            },
            &on_recovery_manager_error_local,
        )
        .shard_map(shard_map);
        Ok(run_local(&self.ctx, &request)?.mappings)
    }

    /// The shard registered at `location` in the global copy of `shard_map`,
    /// if the global store knows both.
    fn global_shard(&self, shard_map: &StoreShardMap, location: &ShardLocation) -> Result<Option<StoreShard>> {
        let request = GlobalRequest::new(
            "FindShardMapByName",
            ShardManagementErrorCategory::Recovery,
            StoreRequest::FindShardMapByNameGlobal {
                name: shard_map.name.clone(),
            },
            &on_recovery_manager_error_global,
        )
        .read_only();
        let exists = run_global(&self.ctx, &request)?
            .shard_maps
            .iter()
            .any(|m| m.id == shard_map.id);
        if !exists {
            return Ok(None);
        }

        let request = GlobalRequest::new(
            "FindShardByLocation",
            ShardManagementErrorCategory::Recovery,
            StoreRequest::FindShardByLocationGlobal {
                shard_map: shard_map.clone(),
                location: location.clone(),
            },
            &on_recovery_manager_error_global,
        )
        .read_only()
        .shard_map(shard_map)
        .location(location);
        Ok(run_global(&self.ctx, &request)?.shards.into_iter().next())
    }

    fn global_mappings(&self, shard_map: &StoreShardMap, shard: &StoreShard) -> Result<Vec<StoreMapping>> {
        let request = GlobalRequest::new(
            "GetMappingsByRangeGlobal",
            ShardManagementErrorCategory::Recovery,
            StoreRequest::GetMappingsByRangeGlobal {
                shard_map: shard_map.clone(),
                shard: Some(shard.clone()),
                range: None,
            },
            &on_recovery_manager_error_global,
        )
        .read_only()
        .shard_map(shard_map)
        .location(&shard.location);
        Ok(run_global(&self.ctx, &request)?.mappings)
    }

    /// Compare the mappings recorded on the shard at `location` with the
    /// global store, one token per shard map found on the shard.
    pub fn detect_mapping_differences(
        &self,
        location: &ShardLocation,
        shard_map_name: Option<&str>,
    ) -> Result<Vec<RecoveryToken>> {
        self.check_shard_local(location)?;
        let (shard_maps, shards) = self.local_shards(location)?;

        let mut tokens = Vec::new();
        for shard_map in shard_maps {
            if shard_map_name.map_or(false, |name| name != shard_map.name) {
                continue;
            }
            let Some(local_shard) = shards.iter().find(|s| s.shard_map_id == shard_map.id).cloned() else {
                continue;
            };

            let global_shard = self.global_shard(&shard_map, location)?;
            let global = match &global_shard {
                Some(shard) => self.global_mappings(&shard_map, shard)?,
                None => Vec::new(),
            };
            let local = self.local_mappings(&shard_map, &local_shard)?;

            let kind = match shard_map.kind {
                ShardMapKind::List => MappingDifferenceType::List,
                ShardMapKind::Range => MappingDifferenceType::Range,
            };
            let differences: Vec<MappingDifference> = compare::compare_mappings(&global, &local)
                .into_iter()
                .map(|group| MappingDifference {
                    id: Uuid::new_v4(),
                    kind,
                    location: group.location,
                    shard_map: shard_map.clone(),
                    range: group.range,
                    mappings_for_shard_map: group.global,
                    mappings_for_shard: group.local,
                })
                .collect();

            log::info!(
                "found {} mapping differences for '{}' at {}",
                differences.len(),
                shard_map.name,
                location
            );
            let token = RecoveryToken::new();
            self.sessions().insert(
                token,
                RecoverySession {
                    location: location.clone(),
                    shard_map,
                    global_shard,
                    local_shard,
                    differences,
                },
            );
            tokens.push(token);
        }
        Ok(tokens)
    }

    pub fn get_mapping_differences(&self, token: RecoveryToken) -> Result<Vec<MappingDifference>> {
        self.sessions()
            .get(&token)
            .map(|s| s.differences.clone())
            .ok_or_else(|| self.token_not_found("GetMappingDifferences", token))
    }

    pub fn get_shard_map(&self, token: RecoveryToken) -> Result<StoreShardMap> {
        self.sessions()
            .get(&token)
            .map(|s| s.shard_map.clone())
            .ok_or_else(|| self.token_not_found("GetShardMap", token))
    }

    pub fn get_shard_location(&self, token: RecoveryToken) -> Result<ShardLocation> {
        self.sessions()
            .get(&token)
            .map(|s| s.location.clone())
            .ok_or_else(|| self.token_not_found("GetShardLocation", token))
    }

    /// Resolve one difference. Resolved and ignored differences are removed
    /// from the token.
    pub fn resolve_mapping_difference(
        &self,
        token: RecoveryToken,
        difference_id: Uuid,
        resolution: MappingDifferenceResolution,
    ) -> Result<()> {
        let operation = "ResolveMappingDifference";
        let (difference, global_shard, local_shard) = {
            let sessions = self.sessions();
            let session = sessions.get(&token).ok_or_else(|| self.token_not_found(operation, token))?;
            let difference = session
                .differences
                .iter()
                .find(|d| d.id == difference_id)
                .cloned()
                .ok_or_else(|| {
                    self.site(operation).error(
                        ShardManagementErrorCode::MappingDifferenceNotFound,
                        format!("difference {} is not part of recovery token {}", difference_id, token),
                    )
                })?;
            (difference, session.global_shard.clone(), session.local_shard.clone())
        };

        match resolution {
            MappingDifferenceResolution::Ignore => {}
            MappingDifferenceResolution::KeepShardMapMapping => {
                let shard = global_shard.unwrap_or(local_shard);
                let adds = difference
                    .mappings_for_shard_map
                    .iter()
                    .map(|m| m.with_shard(shard.clone()))
                    .collect();
                let op = ReplaceMappingsOperation::restore_local(
                    difference.shard_map.clone(),
                    shard,
                    difference.mappings_for_shard.clone(),
                    adds,
                );
                StoreOperation::new(OperationCode::ReplaceMappings, OperationPayload::ReplaceMappings(op))
                    .execute(&self.ctx)?;
            }
            MappingDifferenceResolution::KeepShardMapping => {
                let shard = global_shard.ok_or_else(|| {
                    self.site(operation)
                        .shard_map(&difference.shard_map)
                        .location(&local_shard.location)
                        .error(
                            ShardManagementErrorCode::ShardDoesNotExist,
                            "the shard is not registered in the global store; attach it first",
                        )
                })?;
                let removes = difference
                    .mappings_for_shard_map
                    .iter()
                    .map(|m| MappingRemoval {
                        mapping: m.clone(),
                        lock_owner_id: FORCE_UNLOCK_OWNER_ID,
                    })
                    .collect();
                let adds = difference
                    .mappings_for_shard
                    .iter()
                    .map(|m| m.with_shard(shard.clone()))
                    .collect();
                let op = ReplaceMappingsOperation::restore_global(difference.shard_map.clone(), shard, removes, adds);
                StoreOperation::new(OperationCode::ReplaceMappings, OperationPayload::ReplaceMappings(op))
                    .execute(&self.ctx)?;
            }
        }

        if let Some(session) = self.sessions().get_mut(&token) {
            session.differences.retain(|d| d.id != difference_id);
        }
        log::debug!("resolved difference {} of {} with {:?}", difference_id, token, resolution);
        Ok(())
    }

    /// Resolve every outstanding difference of `token` the same way.
    pub fn resolve_all_mapping_differences(
        &self,
        token: RecoveryToken,
        resolution: MappingDifferenceResolution,
    ) -> std::result::Result<(), ShardManagementAggregateError> {
        let differences = self.get_mapping_differences(token).map_err(|e| ShardManagementAggregateError {
            attempted: 1,
            errors: vec![e],
        })?;
        let attempted = differences.len();
        let errors: Vec<ShardManagementError> = differences
            .iter()
            .filter_map(|d| self.resolve_mapping_difference(token, d.id, resolution).err())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ShardManagementAggregateError { attempted, errors })
        }
    }

    /// Remove the shard at `location`, and its mappings, from the global
    /// store only. The shard database is left untouched.
    pub fn detach_shard(&self, location: &ShardLocation, shard_map_name: Option<&str>) -> Result<()> {
        let request = GlobalRequest::new(
            "DetachShard",
            ShardManagementErrorCategory::Recovery,
            StoreRequest::DetachShardGlobal {
                location: location.clone(),
                shard_map_name: shard_map_name.map(str::to_string),
            },
            &on_recovery_manager_error_global,
        )
        .location(location);
        run_global(&self.ctx, &request)?;

        match shard_map_name.and_then(|name| self.ctx.cache.lookup_shard_map_by_name(name)) {
            Some(shard_map) => self.ctx.cache.delete_shard_map(&shard_map),
            None => self.ctx.cache.clear(),
        }
        log::info!("detached {} from the global store", location);
        Ok(())
    }

    /// Register the shard maps, shard and mappings recorded on the shard at
    /// `location` in the global store.
    pub fn attach_shard(&self, location: &ShardLocation, shard_map_name: Option<&str>) -> Result<()> {
        self.check_shard_local(location)?;
        let (shard_maps, shards) = self.local_shards(location)?;
        for shard_map in shard_maps {
            if shard_map_name.map_or(false, |name| name != shard_map.name) {
                continue;
            }
            let Some(local_shard) = shards.iter().find(|s| s.shard_map_id == shard_map.id).cloned() else {
                continue;
            };
            let shard = local_shard.with_version(Uuid::new_v4());
            let mappings = self
                .local_mappings(&shard_map, &local_shard)?
                .into_iter()
                .map(|m| m.with_shard(shard.clone()))
                .collect();
            let op = AttachShardOperation {
                shard_map,
                local_shard,
                shard,
                mappings,
            };
            StoreOperation::new(OperationCode::AttachShard, OperationPayload::AttachShard(op)).execute(&self.ctx)?;
        }
        log::info!("attached {} to the global store", location);
        Ok(())
    }

    /// Make the global store agree with each shard's own mappings.
    pub fn rebuild_mappings_on_shard_map_manager_from_shards(
        &self,
        locations: &[ShardLocation],
    ) -> std::result::Result<(), ShardManagementAggregateError> {
        let mut errors = Vec::new();
        for location in locations {
            let tokens = match self.detect_mapping_differences(location, None) {
                Ok(tokens) => tokens,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };
            for token in tokens {
                if let Err(aggregate) =
                    self.resolve_all_mapping_differences(token, MappingDifferenceResolution::KeepShardMapping)
                {
                    errors.extend(aggregate.errors);
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ShardManagementAggregateError {
                attempted: locations.len(),
                errors,
            })
        }
    }
}
