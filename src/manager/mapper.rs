//! Mapping logic shared by list and range shard maps

use std::fmt;

use uuid::Uuid;

use super::shard_map::Shard;
use crate::cache::CacheStoreMappingUpdatePolicy;
use crate::errors::handler::{on_shard_mapper_error_global, on_validation_error_local, ErrorSite};
use crate::errors::{Result, ShardManagementError, ShardManagementErrorCode};
use crate::key::{ShardKey, ShardRange};
use crate::operations::mapping::mapper_category;
use crate::operations::{
    run_global, AddMappingOperation, GlobalRequest, OperationCode, OperationContext, OperationPayload,
    RemoveMappingOperation, ReplaceMappingsOperation, StoreOperation, UpdateMappingOperation,
};
use crate::store::{
    LockOwnerIdOpType, MappingRemoval, MappingStatus, ShardLocation, ShardMapKind, StoreConnection,
    StoreConnectionKind, StoreMapping, StoreRequest, StoreResult, StoreShard, StoreShardMap,
    StoreTransactionScopeKind, FORCE_UNLOCK_OWNER_ID,
};

/// Where a key lookup may be answered from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LookupOptions {
    #[default]
    CacheAndStore,
    StoreOnly,
    CacheOnly,
}

/// Whether opening a connection checks the mapping against the shard first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionOptions {
    None,
    #[default]
    Validate,
}

/// Owner token for mapping locks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MappingLockToken(Uuid);

impl MappingLockToken {
    /// Presented by callers that do not hold a lock.
    pub const NO_LOCK: MappingLockToken = MappingLockToken(Uuid::nil());

    /// Overrides whatever lock a mapping holds.
    pub const FORCE_UNLOCK: MappingLockToken = MappingLockToken(FORCE_UNLOCK_OWNER_ID);

    pub fn create() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn id(&self) -> Uuid {
        self.0
    }
}

impl Default for MappingLockToken {
    fn default() -> Self {
        Self::NO_LOCK
    }
}

impl fmt::Display for MappingLockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Requested changes to a mapping. Unset fields are left alone.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MappingUpdate {
    pub status: Option<MappingStatus>,
    pub shard: Option<Shard>,
}

impl MappingUpdate {
    pub fn status(status: MappingStatus) -> Self {
        Self {
            status: Some(status),
            shard: None,
        }
    }

    pub fn shard(shard: Shard) -> Self {
        Self {
            status: None,
            shard: Some(shard),
        }
    }
}

/// An open connection to the shard holding a key, with the mapping it was
/// resolved through. The connection is closed on drop.
pub struct ShardConnection {
    mapping: StoreMapping,
    connection: Box<dyn StoreConnection>,
}

impl ShardConnection {
    pub fn mapping(&self) -> &StoreMapping {
        &self.mapping
    }

    pub fn location(&self) -> &ShardLocation {
        self.connection.location()
    }

    pub fn connection(&mut self) -> &mut dyn StoreConnection {
        &mut *self.connection
    }
}

impl fmt::Debug for ShardConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardConnection")
            .field("mapping", &self.mapping.id)
            .field("location", self.connection.location())
            .finish()
    }
}

impl Drop for ShardConnection {
    fn drop(&mut self) {
        self.connection.close();
    }
}

fn is_stale(error: &ShardManagementError) -> bool {
    matches!(
        error.code,
        ShardManagementErrorCode::MappingDoesNotExist
            | ShardManagementErrorCode::MappingIsOffline
            | ShardManagementErrorCode::ShardMapDoesNotExist
    )
}

/// Operation codes for one shard map kind.
struct Codes {
    add: OperationCode,
    remove: OperationCode,
    update: OperationCode,
    update_with_offline: OperationCode,
}

impl Codes {
    fn for_kind(kind: ShardMapKind) -> Self {
        match kind {
            ShardMapKind::List => Codes {
                add: OperationCode::AddPointMapping,
                remove: OperationCode::RemovePointMapping,
                update: OperationCode::UpdatePointMapping,
                update_with_offline: OperationCode::UpdatePointMappingWithOffline,
            },
            ShardMapKind::Range => Codes {
                add: OperationCode::AddRangeMapping,
                remove: OperationCode::RemoveRangeMapping,
                update: OperationCode::UpdateRangeMapping,
                update_with_offline: OperationCode::UpdateRangeMappingWithOffline,
            },
        }
    }
}

/// Mapping operations against one shard map.
pub(crate) struct Mapper<'a> {
    ctx: &'a OperationContext,
    shard_map: &'a StoreShardMap,
    codes: Codes,
}

impl<'a> Mapper<'a> {
    pub(crate) fn new(ctx: &'a OperationContext, shard_map: &'a StoreShardMap) -> Self {
        Self {
            ctx,
            shard_map,
            codes: Codes::for_kind(shard_map.kind),
        }
    }

    fn site<'s>(&'s self, operation: &'s str) -> ErrorSite<'s> {
        ErrorSite::new(mapper_category(self.shard_map), operation).shard_map(self.shard_map)
    }

    fn check_key(&self, key: &ShardKey, operation: &str) -> Result<()> {
        if key.key_type() != self.shard_map.key_type {
            return Err(self.site(operation).error(
                ShardManagementErrorCode::InvalidArgument,
                format!(
                    "key type {:?} does not match shard map key type {:?}",
                    key.key_type(),
                    self.shard_map.key_type
                ),
            ));
        }
        Ok(())
    }

    fn check_shard(&self, shard: &StoreShard, operation: &str) -> Result<()> {
        if shard.shard_map_id != self.shard_map.id {
            return Err(self.site(operation).error(
                ShardManagementErrorCode::InvalidArgument,
                format!("shard at {} belongs to a different shard map", shard.location),
            ));
        }
        Ok(())
    }

    fn check_mapping(&self, mapping: &StoreMapping, operation: &str) -> Result<()> {
        if mapping.shard_map_id != self.shard_map.id {
            return Err(self.site(operation).error(
                ShardManagementErrorCode::InvalidArgument,
                format!("mapping {} belongs to a different shard map", mapping.describe()),
            ));
        }
        Ok(())
    }

    fn check_lock(&self, token: MappingLockToken, operation: &str) -> Result<()> {
        if token == MappingLockToken::NO_LOCK {
            return Err(self
                .site(operation)
                .error(ShardManagementErrorCode::InvalidArgument, "a lock token is required"));
        }
        Ok(())
    }

    /// Add a point or range mapping to `shard`.
    pub(crate) fn add(&self, mapping: StoreMapping, operation: &str) -> Result<StoreMapping> {
        self.check_key(&mapping.min_value, operation)?;
        self.check_shard(&mapping.shard, operation)?;
        let op = AddMappingOperation {
            shard_map: self.shard_map.clone(),
            mapping,
            new_shard_version: Uuid::new_v4(),
        };
        let added = op.mapping.with_shard(op.mapping.shard.with_version(op.new_shard_version));
        StoreOperation::new(self.codes.add, OperationPayload::AddMapping(op)).execute(self.ctx)?;
        Ok(added)
    }

    /// Resolve `key` to its mapping, if one exists.
    pub(crate) fn lookup(&self, key: &ShardKey, options: LookupOptions) -> Result<Option<StoreMapping>> {
        self.check_key(key, "LookupMapping")?;
        if options != LookupOptions::StoreOnly {
            if let Some(cached) = self.ctx.cache.lookup_mapping_by_key(self.shard_map, key) {
                return Ok(Some(cached));
            }
            if options == LookupOptions::CacheOnly {
                return Ok(None);
            }
        }

        let request = GlobalRequest::new(
            "FindMappingByKey",
            mapper_category(self.shard_map),
            StoreRequest::FindMappingByKeyGlobal {
                shard_map: self.shard_map.clone(),
                key: key.clone(),
            },
            &on_shard_mapper_error_global,
        )
        .read_only()
        .shard_map(self.shard_map)
        .accepting(&[StoreResult::MappingNotFoundForKey]);
        let found = run_global(self.ctx, &request)?.mappings.into_iter().next();
        if let Some(mapping) = &found {
            self.ctx
                .cache
                .add_or_update_mapping(mapping, CacheStoreMappingUpdatePolicy::OverwriteExisting);
        }
        Ok(found)
    }

    pub(crate) fn lookup_required(&self, key: &ShardKey, options: LookupOptions) -> Result<StoreMapping> {
        self.lookup(key, options)?.ok_or_else(|| {
            self.site("LookupMapping").error(
                ShardManagementErrorCode::MappingNotFoundForKey,
                format!("no mapping for key {} in shard map '{}'", key, self.shard_map.name),
            )
        })
    }

    /// Mappings intersecting `range` (all when `None`), optionally restricted
    /// to one shard.
    pub(crate) fn get_mappings(&self, range: Option<&ShardRange>, shard: Option<&Shard>) -> Result<Vec<StoreMapping>> {
        if let Some(range) = range {
            self.check_key(range.low(), "GetMappings")?;
        }
        if let Some(shard) = shard {
            self.check_shard(shard.store_shard(), "GetMappings")?;
        }
        let mut request = GlobalRequest::new(
            "GetMappings",
            mapper_category(self.shard_map),
            StoreRequest::GetMappingsByRangeGlobal {
                shard_map: self.shard_map.clone(),
                shard: shard.map(|s| s.store_shard().clone()),
                range: range.cloned(),
            },
            &on_shard_mapper_error_global,
        )
        .read_only()
        .shard_map(self.shard_map);
        if let Some(shard) = shard {
            request = request.location(shard.location());
        }
        Ok(run_global(self.ctx, &request)?.mappings)
    }

    /// Re-read a mapping from the global store.
    pub(crate) fn refresh(&self, mapping: &StoreMapping, operation: &str) -> Result<StoreMapping> {
        self.check_mapping(mapping, operation)?;
        let request = GlobalRequest::new(
            operation,
            mapper_category(self.shard_map),
            StoreRequest::FindMappingByIdGlobal {
                shard_map: self.shard_map.clone(),
                mapping_id: mapping.id,
            },
            &on_shard_mapper_error_global,
        )
        .read_only()
        .shard_map(self.shard_map)
        .evicting(mapping);
        run_global(self.ctx, &request)?.mappings.into_iter().next().ok_or_else(|| {
            self.site(operation).error(
                ShardManagementErrorCode::MappingDoesNotExist,
                format!("mapping {} does not exist", mapping.describe()),
            )
        })
    }

    /// Remove an offline mapping.
    pub(crate) fn remove(&self, mapping: &StoreMapping, lock: MappingLockToken) -> Result<()> {
        let current = self.refresh(mapping, "DeleteMapping")?;
        let op = RemoveMappingOperation {
            shard_map: self.shard_map.clone(),
            mapping: current,
            lock_owner_id: lock.id(),
            new_shard_version: Uuid::new_v4(),
        };
        StoreOperation::new(self.codes.remove, OperationPayload::RemoveMapping(op)).execute(self.ctx)
    }

    /// Change a mapping's status or shard. Moving to another shard requires
    /// the mapping to be offline. Taking an online mapping offline also
    /// terminates connections that use it.
    pub(crate) fn update(
        &self,
        mapping: &StoreMapping,
        update: MappingUpdate,
        lock: MappingLockToken,
    ) -> Result<StoreMapping> {
        let current = self.refresh(mapping, "UpdateMapping")?;
        let mut updated = current.clone();
        if let Some(status) = update.status {
            updated = updated.with_status(status);
        }
        if let Some(shard) = update.shard {
            self.check_shard(shard.store_shard(), "UpdateMapping")?;
            updated = updated.with_shard(shard.store_shard().clone());
        }
        if updated == current {
            return Ok(current);
        }

        let going_offline = current.status == MappingStatus::Online && updated.status == MappingStatus::Offline;
        let code = if going_offline {
            self.codes.update_with_offline
        } else {
            self.codes.update
        };
        let op = UpdateMappingOperation {
            shard_map: self.shard_map.clone(),
            current,
            updated,
            lock_owner_id: lock.id(),
            new_source_version: Uuid::new_v4(),
            new_target_version: Uuid::new_v4(),
            kill_sessions: going_offline,
        };
        let version = if op.moves_shard() {
            op.new_target_version
        } else {
            op.new_source_version
        };
        let result = op.updated.with_shard(op.updated.shard.with_version(version));
        StoreOperation::new(code, OperationPayload::UpdateMapping(op)).execute(self.ctx)?;
        Ok(result)
    }

    /// Replace `removes` with `adds` on `shard` in one logged operation.
    pub(crate) fn replace(
        &self,
        code: OperationCode,
        shard: StoreShard,
        removes: Vec<MappingRemoval>,
        adds: Vec<StoreMapping>,
    ) -> Result<Vec<StoreMapping>> {
        let op = ReplaceMappingsOperation::mirrored(self.shard_map.clone(), shard, removes, adds);
        let stamped = op.shard.with_version(op.new_shard_version);
        let added = op.global_adds.iter().map(|m| m.with_shard(stamped.clone())).collect();
        StoreOperation::new(code, OperationPayload::ReplaceMappings(op)).execute(self.ctx)?;
        Ok(added)
    }

    fn lock_request(
        &self,
        operation: &str,
        mapping: Option<&StoreMapping>,
        token: MappingLockToken,
        lock_op: LockOwnerIdOpType,
    ) -> Result<()> {
        let mut request = GlobalRequest::new(
            operation,
            mapper_category(self.shard_map),
            StoreRequest::LockOrUnlockMappingsGlobal {
                shard_map: self.shard_map.clone(),
                mapping: mapping.cloned(),
                lock_owner_id: token.id(),
                lock_op,
            },
            &on_shard_mapper_error_global,
        )
        .shard_map(self.shard_map);
        if let Some(mapping) = mapping {
            request = request.evicting(mapping);
        }
        run_global(self.ctx, &request)?;
        Ok(())
    }

    pub(crate) fn lock(&self, mapping: &StoreMapping, token: MappingLockToken) -> Result<()> {
        self.check_mapping(mapping, "LockMapping")?;
        self.check_lock(token, "LockMapping")?;
        self.lock_request("LockMapping", Some(mapping), token, LockOwnerIdOpType::Lock)
    }

    pub(crate) fn unlock(&self, mapping: &StoreMapping, token: MappingLockToken) -> Result<()> {
        self.check_mapping(mapping, "UnlockMapping")?;
        self.check_lock(token, "UnlockMapping")?;
        self.lock_request("UnlockMapping", Some(mapping), token, LockOwnerIdOpType::UnlockMappingForId)
    }

    /// Release every lock held by `token`, or every lock in the shard map
    /// when `token` is `None`.
    pub(crate) fn unlock_all(&self, token: Option<MappingLockToken>) -> Result<()> {
        match token {
            Some(token) => {
                self.check_lock(token, "UnlockAllMappings")?;
                self.lock_request("UnlockAllMappings", None, token, LockOwnerIdOpType::UnlockAllMappingsForId)
            }
            None => self.lock_request(
                "UnlockAllMappings",
                None,
                MappingLockToken::NO_LOCK,
                LockOwnerIdOpType::UnlockAllMappings,
            ),
        }
    }

    pub(crate) fn lock_owner(&self, mapping: &StoreMapping) -> Result<MappingLockToken> {
        let current = self.refresh(mapping, "GetMappingLockOwner")?;
        Ok(MappingLockToken(current.lock_owner_id.unwrap_or_else(Uuid::nil)))
    }

    /// Open a connection to the shard holding `key`. With validation, a
    /// cached mapping the shard no longer agrees with is evicted and the key
    /// is resolved again from the global store.
    pub(crate) fn open_connection(&self, key: &ShardKey, options: ConnectionOptions) -> Result<ShardConnection> {
        self.check_key(key, "OpenConnectionForKey")?;
        let cached = self.ctx.cache.lookup_mapping_by_key(self.shard_map, key);
        let from_cache = cached.is_some();
        let mapping = match cached {
            Some(mapping) => mapping,
            None => self.lookup_required(key, LookupOptions::StoreOnly)?,
        };

        match self.connect(&mapping, options) {
            Ok(connection) => {
                if from_cache && options == ConnectionOptions::Validate {
                    self.ctx
                        .cache
                        .add_or_update_mapping(&mapping, CacheStoreMappingUpdatePolicy::UpdateTimeToLive);
                }
                Ok(ShardConnection { mapping, connection })
            }
            Err(error) if from_cache && is_stale(&error) => {
                log::debug!(
                    "cached mapping {} in '{}' is stale ({:?}), refreshing",
                    mapping.describe(),
                    self.shard_map.name,
                    error.code
                );
                self.ctx.cache.delete_mapping(&mapping);
                let fresh = self.lookup_required(key, LookupOptions::StoreOnly)?;
                let connection = self.connect(&fresh, options)?;
                Ok(ShardConnection {
                    mapping: fresh,
                    connection,
                })
            }
            Err(error) => Err(error),
        }
    }

    fn connect(&self, mapping: &StoreMapping, options: ConnectionOptions) -> Result<Box<dyn StoreConnection>> {
        let operation = "OpenConnectionForKey";
        let category = mapper_category(self.shard_map);
        let location = &mapping.shard.location;
        self.ctx.retry.execute(operation, || {
            let mut connection =
                self.ctx
                    .connect(StoreConnectionKind::LocalSource, location, None, category, operation)?;
            if options == ConnectionOptions::Validate {
                let wrap = |e| {
                    ShardManagementError::from_store_error(category, operation, e).with_location(location.clone())
                };
                let validated = {
                    let mut scope = connection
                        .get_transaction_scope(StoreTransactionScopeKind::ReadOnly)
                        .map_err(wrap)?;
                    scope
                        .execute_operation(&StoreRequest::ValidateShardMappingLocal {
                            shard_map_id: self.shard_map.id,
                            mapping_id: mapping.id,
                        })
                        .map_err(wrap)?
                };
                if !validated.is_success() {
                    connection.close();
                    let site = ErrorSite::new(category, operation)
                        .shard_map(self.shard_map)
                        .location(location);
                    return Err(on_validation_error_local(validated.result, &site));
                }
            }
            Ok(connection)
        })
    }
}
