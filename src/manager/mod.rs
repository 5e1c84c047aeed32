//! Shard map manager façade
//!
//! [`ShardMapManagerFactory`] deploys or opens the global store and hands out
//! a [`ShardMapManager`], from which list and range shard maps are created and
//! looked up.

pub mod list;
pub mod mapper;
pub mod range;
pub mod shard_map;

pub use list::{ListShardMap, PointMapping};
pub use mapper::{ConnectionOptions, LookupOptions, MappingLockToken, MappingUpdate, ShardConnection};
pub use range::{RangeMapping, RangeShardMap};
pub use shard_map::{Shard, ShardMap};

use std::cell::Cell;
use std::sync::Arc;

use crate::cache::{CacheStore, CacheStoreMappingUpdatePolicy, InMemoryCacheStore};
use crate::config::{ShardMapManagerConfig, StoreCredentials};
use crate::errors::handler::{on_common_error_global, on_shard_map_manager_error_global, ErrorSite};
use crate::errors::{Result, ShardManagementErrorCategory, ShardManagementErrorCode};
use crate::key::ShardKeyType;
use crate::operations::{run_global, GlobalOperation, GlobalRequest, OperationContext};
use crate::recovery::RecoveryManager;
use crate::retry::RetryPolicy;
use crate::schema::SchemaInfoCollection;
use crate::store::{
    ShardLocation, ShardMapKind, StoreCommand, StoreConnectionFactory, StoreError, StoreRequest, StoreResult,
    StoreResults, StoreShardMap, StoreTransactionScope, GLOBAL_STORE_VERSION,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShardMapManagerCreateMode {
    /// Fail if the global store is already deployed.
    KeepExisting,
    /// Drop any existing global store and deploy a fresh one.
    ReplaceExisting,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShardMapManagerLoadPolicy {
    /// Populate the cache on demand.
    Lazy,
    /// Load every shard map and mapping into the cache up front.
    Eager,
}

/// Result of a create call that tolerates an identical existing object.
#[derive(Clone, Debug, PartialEq)]
pub enum CreateOutcome<T> {
    Created(T),
    AlreadyExists(T),
}

impl<T> CreateOutcome<T> {
    pub fn is_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            CreateOutcome::Created(value) | CreateOutcome::AlreadyExists(value) => value,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CreateOutcome<U> {
        match self {
            CreateOutcome::Created(value) => CreateOutcome::Created(f(value)),
            CreateOutcome::AlreadyExists(value) => CreateOutcome::AlreadyExists(f(value)),
        }
    }
}

pub struct ShardMapManagerFactory;

impl ShardMapManagerFactory {
    /// Deploy the global store and return a manager for it.
    pub fn create_shard_map_manager(
        credentials: StoreCredentials,
        connections: Arc<dyn StoreConnectionFactory>,
        mode: ShardMapManagerCreateMode,
        config: ShardMapManagerConfig,
    ) -> Result<ShardMapManager> {
        let manager = ShardMapManager::new(credentials, connections, config);
        run_global(
            &manager.ctx,
            &DeployGlobalStore {
                mode,
                existed: Cell::new(false),
            },
        )?;
        log::info!("shard map manager deployed at {}", manager.ctx.global_location());
        Ok(manager)
    }

    /// Open an existing global store. Fails with
    /// `ShardMapManagerStoreDoesNotExist` if none is deployed.
    pub fn get_shard_map_manager(
        credentials: StoreCredentials,
        connections: Arc<dyn StoreConnectionFactory>,
        load_policy: ShardMapManagerLoadPolicy,
        config: ShardMapManagerConfig,
    ) -> Result<ShardMapManager> {
        let manager = ShardMapManager::new(credentials, connections, config);
        manager.check_global_store()?;
        if load_policy == ShardMapManagerLoadPolicy::Eager {
            manager.load_cache()?;
        }
        Ok(manager)
    }

    /// Like [`get_shard_map_manager`](Self::get_shard_map_manager) but
    /// returns `None` when no global store is deployed.
    pub fn try_get_shard_map_manager(
        credentials: StoreCredentials,
        connections: Arc<dyn StoreConnectionFactory>,
        load_policy: ShardMapManagerLoadPolicy,
        config: ShardMapManagerConfig,
    ) -> Result<Option<ShardMapManager>> {
        match Self::get_shard_map_manager(credentials, connections, load_policy, config) {
            Ok(manager) => Ok(Some(manager)),
            Err(e) if e.code == ShardManagementErrorCode::ShardMapManagerStoreDoesNotExist => Ok(None),
            Err(e) => Err(e),
        }
    }
}

struct DeployGlobalStore {
    mode: ShardMapManagerCreateMode,
    existed: Cell<bool>,
}

impl GlobalOperation for DeployGlobalStore {
    type Output = ();

    fn name(&self) -> &str {
        "CreateShardMapManager"
    }

    fn category(&self) -> ShardManagementErrorCategory {
        ShardManagementErrorCategory::ShardMapManagerFactory
    }

    fn execute(&self, scope: &mut dyn StoreTransactionScope) -> std::result::Result<StoreResults, StoreError> {
        let current = scope.execute_operation(&StoreRequest::GetStoreVersionGlobal)?.version;
        self.existed.set(current.is_some());
        match (current, self.mode) {
            (Some(version), ShardMapManagerCreateMode::KeepExisting) => {
                Ok(StoreResults::success().with_version(Some(version)))
            }
            (Some(_), ShardMapManagerCreateMode::ReplaceExisting) => {
                scope.execute_command_batch(&[StoreCommand::DropGlobalStore, StoreCommand::DeployGlobalStore])?;
                Ok(StoreResults::success().with_version(Some(GLOBAL_STORE_VERSION)))
            }
            (None, _) => {
                scope.execute_command_batch(&[StoreCommand::DeployGlobalStore])?;
                Ok(StoreResults::success().with_version(Some(GLOBAL_STORE_VERSION)))
            }
        }
    }

    fn handle_results(&self, results: StoreResults) -> Result<()> {
        let site = ErrorSite::new(self.category(), self.name());
        if !results.is_success() {
            return Err(on_common_error_global(results.result, &site));
        }
        if self.existed.get() && self.mode == ShardMapManagerCreateMode::KeepExisting {
            return Err(site.error(
                ShardManagementErrorCode::ShardMapManagerStoreAlreadyExists,
                "a shard map manager is already deployed in the global store",
            ));
        }
        Ok(())
    }
}

/// Entry point for shard map management against one global store.
pub struct ShardMapManager {
    ctx: OperationContext,
    config: ShardMapManagerConfig,
    recovery: RecoveryManager,
}

impl ShardMapManager {
    fn new(
        credentials: StoreCredentials,
        connections: Arc<dyn StoreConnectionFactory>,
        config: ShardMapManagerConfig,
    ) -> Self {
        let cache: Arc<dyn CacheStore> = Arc::new(InMemoryCacheStore::new(config.cache.mapping_time_to_live()));
        let ctx = OperationContext::new(credentials, connections, RetryPolicy::from_config(&config.retry), cache);
        Self {
            recovery: RecoveryManager::new(ctx.clone()),
            ctx,
            config,
        }
    }

    pub fn credentials(&self) -> &StoreCredentials {
        &self.ctx.credentials
    }

    pub fn config(&self) -> &ShardMapManagerConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.ctx.cache
    }

    pub fn recovery_manager(&self) -> &RecoveryManager {
        &self.recovery
    }

    pub fn schema_info_collection(&self) -> SchemaInfoCollection {
        SchemaInfoCollection::new(self.ctx.clone())
    }

    fn site<'a>(&self, operation: &'a str) -> ErrorSite<'a> {
        ErrorSite::new(ShardManagementErrorCategory::ShardMapManager, operation)
    }

    fn check_global_store(&self) -> Result<()> {
        let operation = "GetShardMapManager";
        let request = GlobalRequest::new(
            operation,
            ShardManagementErrorCategory::ShardMapManagerFactory,
            StoreRequest::GetStoreVersionGlobal,
            &on_shard_map_manager_error_global,
        )
        .read_only();
        let results = run_global(&self.ctx, &request)?;
        let site = ErrorSite::new(ShardManagementErrorCategory::ShardMapManagerFactory, operation);
        match results.version {
            None => Err(site.error(
                ShardManagementErrorCode::ShardMapManagerStoreDoesNotExist,
                format!("no shard map manager is deployed at {}", self.ctx.global_location()),
            )),
            Some(version) if !GLOBAL_STORE_VERSION.is_compatible_with(&version) => {
                Err(on_common_error_global(StoreResult::StoreVersionMismatch, &site))
            }
            Some(_) => Ok(()),
        }
    }

    fn load_cache(&self) -> Result<()> {
        let shard_maps = self.fetch_shard_maps()?;
        for shard_map in &shard_maps {
            self.ctx.cache.add_or_update_shard_map(shard_map);
            let request = GlobalRequest::new(
                "LoadMappings",
                ShardManagementErrorCategory::ShardMapManager,
                StoreRequest::GetMappingsByRangeGlobal {
                    shard_map: shard_map.clone(),
                    shard: None,
                    range: None,
                },
                &on_shard_map_manager_error_global,
            )
            .read_only()
            .shard_map(shard_map);
            for mapping in run_global(&self.ctx, &request)?.mappings {
                self.ctx
                    .cache
                    .add_or_update_mapping(&mapping, CacheStoreMappingUpdatePolicy::OverwriteExisting);
            }
        }
        log::debug!("loaded {} shard maps into cache", shard_maps.len());
        Ok(())
    }

    fn fetch_shard_maps(&self) -> Result<Vec<StoreShardMap>> {
        let request = GlobalRequest::new(
            "GetShardMaps",
            ShardManagementErrorCategory::ShardMapManager,
            StoreRequest::GetShardMapsGlobal,
            &on_shard_map_manager_error_global,
        )
        .read_only();
        Ok(run_global(&self.ctx, &request)?.shard_maps)
    }

    fn find_shard_map(&self, name: &str) -> Result<Option<StoreShardMap>> {
        if let Some(cached) = self.ctx.cache.lookup_shard_map_by_name(name) {
            return Ok(Some(cached));
        }
        let request = GlobalRequest::new(
            "FindShardMapByName",
            ShardManagementErrorCategory::ShardMapManager,
            StoreRequest::FindShardMapByNameGlobal { name: name.to_string() },
            &on_shard_map_manager_error_global,
        )
        .read_only();
        let found = run_global(&self.ctx, &request)?.shard_maps.into_iter().next();
        if let Some(shard_map) = &found {
            self.ctx.cache.add_or_update_shard_map(shard_map);
        }
        Ok(found)
    }

    fn create_shard_map(&self, shard_map: StoreShardMap) -> Result<CreateOutcome<ShardMap>> {
        if shard_map.name.trim().is_empty() {
            return Err(self
                .site("CreateShardMap")
                .error(ShardManagementErrorCode::InvalidArgument, "shard map name must not be empty"));
        }
        let request = GlobalRequest::new(
            "CreateShardMap",
            ShardManagementErrorCategory::ShardMapManager,
            StoreRequest::AddShardMapGlobal {
                shard_map: shard_map.clone(),
            },
            &on_shard_map_manager_error_global,
        )
        .shard_map(&shard_map)
        .accepting(&[StoreResult::ShardMapExists]);
        let results = run_global(&self.ctx, &request)?;

        if results.is_success() {
            self.ctx.cache.add_or_update_shard_map(&shard_map);
            log::info!("created {:?} shard map '{}'", shard_map.kind, shard_map.name);
            return Ok(CreateOutcome::Created(ShardMap::new(self.ctx.clone(), shard_map)));
        }

        // The name is taken; an identical map counts as already created.
        self.ctx.cache.delete_shard_map(&shard_map);
        match self.find_shard_map(&shard_map.name)? {
            Some(existing) if existing.kind == shard_map.kind && existing.key_type == shard_map.key_type => {
                Ok(CreateOutcome::AlreadyExists(ShardMap::new(self.ctx.clone(), existing)))
            }
            _ => Err(on_shard_map_manager_error_global(
                StoreResult::ShardMapExists,
                &self.site("CreateShardMap").shard_map(&shard_map),
            )),
        }
    }

    pub fn create_list_shard_map(&self, name: &str, key_type: ShardKeyType) -> Result<CreateOutcome<ListShardMap>> {
        let shard_map = StoreShardMap::new(name, ShardMapKind::List, key_type);
        Ok(self.create_shard_map(shard_map)?.map(ListShardMap::from_shard_map_unchecked))
    }

    pub fn create_range_shard_map(&self, name: &str, key_type: ShardKeyType) -> Result<CreateOutcome<RangeShardMap>> {
        let shard_map = StoreShardMap::new(name, ShardMapKind::Range, key_type);
        Ok(self.create_shard_map(shard_map)?.map(RangeShardMap::from_shard_map_unchecked))
    }

    pub fn try_get_shard_map(&self, name: &str) -> Result<Option<ShardMap>> {
        Ok(self
            .find_shard_map(name)?
            .map(|shard_map| ShardMap::new(self.ctx.clone(), shard_map)))
    }

    pub fn get_shard_map(&self, name: &str) -> Result<ShardMap> {
        self.try_get_shard_map(name)?.ok_or_else(|| {
            self.site("GetShardMap").error(
                ShardManagementErrorCode::ShardMapDoesNotExist,
                format!("shard map '{}' does not exist", name),
            )
        })
    }

    pub fn get_list_shard_map(&self, name: &str) -> Result<ListShardMap> {
        ListShardMap::try_from(self.get_shard_map(name)?)
    }

    pub fn get_range_shard_map(&self, name: &str) -> Result<RangeShardMap> {
        RangeShardMap::try_from(self.get_shard_map(name)?)
    }

    pub fn get_shard_maps(&self) -> Result<Vec<ShardMap>> {
        let shard_maps = self.fetch_shard_maps()?;
        Ok(shard_maps
            .into_iter()
            .map(|shard_map| {
                self.ctx.cache.add_or_update_shard_map(&shard_map);
                ShardMap::new(self.ctx.clone(), shard_map)
            })
            .collect())
    }

    /// Remove a shard map that has no shards. Removing a map that is already
    /// gone succeeds.
    pub fn delete_shard_map(&self, shard_map: &ShardMap) -> Result<()> {
        let store_map = shard_map.store_shard_map();
        let request = GlobalRequest::new(
            "DeleteShardMap",
            ShardManagementErrorCategory::ShardMapManager,
            StoreRequest::RemoveShardMapGlobal {
                shard_map: store_map.clone(),
            },
            &on_shard_map_manager_error_global,
        )
        .shard_map(store_map)
        .accepting(&[StoreResult::ShardMapDoesNotExist]);
        run_global(&self.ctx, &request)?;
        self.ctx.cache.delete_shard_map(store_map);
        log::info!("deleted shard map '{}'", store_map.name);
        Ok(())
    }

    /// Every location used by a shard of any shard map.
    pub fn get_distinct_shard_locations(&self) -> Result<Vec<ShardLocation>> {
        let request = GlobalRequest::new(
            "GetDistinctShardLocations",
            ShardManagementErrorCategory::ShardMapManager,
            StoreRequest::GetDistinctShardLocationsGlobal,
            &on_shard_map_manager_error_global,
        )
        .read_only();
        Ok(run_global(&self.ctx, &request)?.locations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicyConfig;
    use crate::store::MemoryStore;

    fn setup() -> (MemoryStore, StoreCredentials, ShardMapManagerConfig) {
        let store = MemoryStore::new();
        let location = ShardLocation::new("gsm-server", "shardmapmanager");
        store.create_database(&location);
        let config = ShardMapManagerConfig {
            retry: RetryPolicyConfig {
                retry_count: 1,
                min_backoff_ms: 0,
                max_backoff_ms: 1,
                delta_backoff_ms: 0,
            },
            ..ShardMapManagerConfig::default()
        };
        (store, StoreCredentials::new(location), config)
    }

    #[test]
    fn test_create_then_get() {
        let (store, credentials, config) = setup();
        let factory = Arc::new(store.connection_factory());

        assert!(ShardMapManagerFactory::try_get_shard_map_manager(
            credentials.clone(),
            factory.clone(),
            ShardMapManagerLoadPolicy::Lazy,
            config.clone()
        )
        .unwrap()
        .is_none());

        ShardMapManagerFactory::create_shard_map_manager(
            credentials.clone(),
            factory.clone(),
            ShardMapManagerCreateMode::KeepExisting,
            config.clone(),
        )
        .unwrap();

        let err = ShardMapManagerFactory::create_shard_map_manager(
            credentials.clone(),
            factory.clone(),
            ShardMapManagerCreateMode::KeepExisting,
            config.clone(),
        )
        .err()
        .unwrap();
        assert_eq!(err.code, ShardManagementErrorCode::ShardMapManagerStoreAlreadyExists);

        ShardMapManagerFactory::create_shard_map_manager(
            credentials.clone(),
            factory.clone(),
            ShardMapManagerCreateMode::ReplaceExisting,
            config.clone(),
        )
        .unwrap();
        assert!(ShardMapManagerFactory::get_shard_map_manager(
            credentials,
            factory,
            ShardMapManagerLoadPolicy::Eager,
            config
        )
        .is_ok());
    }

    #[test]
    fn test_create_shard_map_is_idempotent_for_identical_maps() {
        let (store, credentials, config) = setup();
        let manager = ShardMapManagerFactory::create_shard_map_manager(
            credentials,
            Arc::new(store.connection_factory()),
            ShardMapManagerCreateMode::ReplaceExisting,
            config,
        )
        .unwrap();

        assert!(manager.create_range_shard_map("orders", ShardKeyType::Int32).unwrap().is_created());
        let again = manager.create_range_shard_map("orders", ShardKeyType::Int32).unwrap();
        assert!(!again.is_created());

        let err = manager.create_list_shard_map("orders", ShardKeyType::Int32).err().unwrap();
        assert_eq!(err.code, ShardManagementErrorCode::ShardMapAlreadyExists);

        let err = manager.get_list_shard_map("orders").err().unwrap();
        assert_eq!(err.code, ShardManagementErrorCode::ShardMapTypeConversionError);
        assert_eq!(manager.get_shard_maps().unwrap().len(), 1);

        let map = manager.get_shard_map("orders").unwrap();
        manager.delete_shard_map(&map).unwrap();
        manager.delete_shard_map(&map).unwrap();
        assert!(manager.try_get_shard_map("orders").unwrap().is_none());
    }
}
