//! Shard map handle and shard registration

use uuid::Uuid;

use super::mapper::Mapper;
use crate::errors::handler::{on_shard_map_error_global, ErrorSite};
use crate::errors::{Result, ShardManagementError, ShardManagementErrorCategory, ShardManagementErrorCode};
use crate::key::ShardKeyType;
use crate::operations::{
    run_global, AddShardOperation, GlobalRequest, OperationCode, OperationContext, OperationPayload,
    RemoveShardOperation, StoreOperation, UpdateShardOperation,
};
use crate::store::{ShardLocation, ShardMapKind, ShardStatus, StoreRequest, StoreShard, StoreShardMap};

/// A database registered as a shard of a shard map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shard {
    inner: StoreShard,
}

impl Shard {
    pub(crate) fn new(inner: StoreShard) -> Self {
        Self { inner }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn version(&self) -> Uuid {
        self.inner.version
    }

    pub fn shard_map_id(&self) -> Uuid {
        self.inner.shard_map_id
    }

    pub fn location(&self) -> &ShardLocation {
        &self.inner.location
    }

    pub fn status(&self) -> ShardStatus {
        self.inner.status
    }

    pub fn store_shard(&self) -> &StoreShard {
        &self.inner
    }
}

impl From<StoreShard> for Shard {
    fn from(inner: StoreShard) -> Self {
        Self::new(inner)
    }
}

/// A named shard map. List and range shard maps dereference to this for
/// shard management.
#[derive(Clone)]
pub struct ShardMap {
    ctx: OperationContext,
    shard_map: StoreShardMap,
}

impl std::fmt::Debug for ShardMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardMap").field("shard_map", &self.shard_map).finish()
    }
}

impl ShardMap {
    pub(crate) fn new(ctx: OperationContext, shard_map: StoreShardMap) -> Self {
        Self { ctx, shard_map }
    }

    pub fn name(&self) -> &str {
        &self.shard_map.name
    }

    pub fn id(&self) -> Uuid {
        self.shard_map.id
    }

    pub fn kind(&self) -> ShardMapKind {
        self.shard_map.kind
    }

    pub fn key_type(&self) -> ShardKeyType {
        self.shard_map.key_type
    }

    pub fn store_shard_map(&self) -> &StoreShardMap {
        &self.shard_map
    }

    pub(crate) fn context(&self) -> &OperationContext {
        &self.ctx
    }

    pub(crate) fn mapper(&self) -> Mapper<'_> {
        Mapper::new(&self.ctx, &self.shard_map)
    }

    fn site<'a>(&'a self, operation: &'a str) -> ErrorSite<'a> {
        ErrorSite::new(ShardManagementErrorCategory::ShardMap, operation).shard_map(&self.shard_map)
    }

    fn check_owned(&self, shard: &Shard, operation: &str) -> Result<()> {
        if shard.shard_map_id() != self.shard_map.id {
            return Err(self.site(operation).error(
                ShardManagementErrorCode::InvalidArgument,
                format!("shard at {} belongs to a different shard map", shard.location()),
            ));
        }
        Ok(())
    }

    /// Register the database at `location` as a new online shard. The local
    /// store is deployed on it if needed.
    pub fn create_shard(&self, location: ShardLocation) -> Result<Shard> {
        self.create_shard_with_status(location, ShardStatus::Online)
    }

    /// The global store's own database cannot hold a shard: the logged
    /// operation keeps its global connection open while it writes the shard.
    pub fn create_shard_with_status(&self, location: ShardLocation, status: ShardStatus) -> Result<Shard> {
        if location == *self.ctx.global_location() {
            return Err(ShardManagementError::invalid_argument(
                ShardManagementErrorCategory::ShardMap,
                format!("{} holds the shard map manager and cannot be a shard", location),
            )
            .with_shard_map(self.shard_map.name.clone()));
        }
        let shard = StoreShard::new(self.shard_map.id, location, status);
        let operation = StoreOperation::new(
            OperationCode::AddShard,
            OperationPayload::AddShard(AddShardOperation {
                shard_map: self.shard_map.clone(),
                shard: shard.clone(),
            }),
        );
        operation.execute(&self.ctx)?;
        Ok(Shard::new(shard))
    }

    pub fn try_get_shard(&self, location: &ShardLocation) -> Result<Option<Shard>> {
        let request = GlobalRequest::new(
            "GetShard",
            ShardManagementErrorCategory::ShardMap,
            StoreRequest::FindShardByLocationGlobal {
                shard_map: self.shard_map.clone(),
                location: location.clone(),
            },
            &on_shard_map_error_global,
        )
        .read_only()
        .shard_map(&self.shard_map)
        .location(location);
        let results = run_global(&self.ctx, &request)?;
        Ok(results.shards.into_iter().next().map(Shard::new))
    }

    pub fn get_shard(&self, location: &ShardLocation) -> Result<Shard> {
        self.try_get_shard(location)?.ok_or_else(|| {
            self.site("GetShard").location(location).error(
                ShardManagementErrorCode::ShardDoesNotExist,
                format!("no shard at {} in shard map '{}'", location, self.shard_map.name),
            )
        })
    }

    pub fn get_shards(&self) -> Result<Vec<Shard>> {
        let request = GlobalRequest::new(
            "GetShards",
            ShardManagementErrorCategory::ShardMap,
            StoreRequest::GetShardsGlobal {
                shard_map: self.shard_map.clone(),
            },
            &on_shard_map_error_global,
        )
        .read_only()
        .shard_map(&self.shard_map);
        let results = run_global(&self.ctx, &request)?;
        Ok(results.shards.into_iter().map(Shard::new).collect())
    }

    /// Unregister a shard. The shard must have no mappings.
    pub fn delete_shard(&self, shard: &Shard) -> Result<()> {
        self.check_owned(shard, "DeleteShard")?;
        let operation = StoreOperation::new(
            OperationCode::RemoveShard,
            OperationPayload::RemoveShard(RemoveShardOperation {
                shard_map: self.shard_map.clone(),
                shard: shard.store_shard().clone(),
            }),
        );
        operation.execute(&self.ctx)
    }

    /// Change a shard's status. `shard` must carry the current version.
    pub fn update_shard(&self, shard: &Shard, status: ShardStatus) -> Result<Shard> {
        self.check_owned(shard, "UpdateShard")?;
        let current = shard.store_shard().clone();
        let updated = current.with_status(status).with_version(Uuid::new_v4());
        let operation = StoreOperation::new(
            OperationCode::UpdateShard,
            OperationPayload::UpdateShard(UpdateShardOperation {
                shard_map: self.shard_map.clone(),
                current,
                updated: updated.clone(),
            }),
        );
        operation.execute(&self.ctx)?;
        Ok(Shard::new(updated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Harness;

    #[test]
    fn test_shard_lifecycle() {
        let harness = Harness::new();
        let map = harness.manager.create_range_shard_map("orders", ShardKeyType::Int32).unwrap().into_inner();
        let location = harness.shard_location("shard1");

        let shard = map.create_shard(location.clone()).unwrap();
        assert_eq!(shard.status(), ShardStatus::Online);
        assert_eq!(map.get_shard(&location).unwrap(), shard);
        assert!(harness.store.local_state(&location).is_some());

        let err = map.create_shard(location.clone()).err().unwrap();
        assert_eq!(err.code, ShardManagementErrorCode::ShardLocationAlreadyExists);

        let offline = map.update_shard(&shard, ShardStatus::Offline).unwrap();
        assert_ne!(offline.version(), shard.version());
        assert_eq!(map.get_shards().unwrap(), vec![offline.clone()]);

        // The pre-update handle carries a stale version.
        let err = map.update_shard(&shard, ShardStatus::Online).err().unwrap();
        assert_eq!(err.code, ShardManagementErrorCode::ShardVersionMismatch);

        map.delete_shard(&offline).unwrap();
        assert!(map.try_get_shard(&location).unwrap().is_none());
        let err = map.get_shard(&location).err().unwrap();
        assert_eq!(err.code, ShardManagementErrorCode::ShardDoesNotExist);
    }

    #[test]
    fn test_shard_from_another_map_is_rejected() {
        let harness = Harness::new();
        let orders = harness.manager.create_list_shard_map("orders", ShardKeyType::Int32).unwrap().into_inner();
        let users = harness.manager.create_list_shard_map("users", ShardKeyType::Int32).unwrap().into_inner();
        let shard = orders.create_shard(harness.shard_location("shard1")).unwrap();

        let err = users.delete_shard(&shard).err().unwrap();
        assert_eq!(err.code, ShardManagementErrorCode::InvalidArgument);
    }
}
