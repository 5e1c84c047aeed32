//! Recovery of diverged global and local stores
//!
//! Damages one side of a shard's metadata directly in the in-memory store and
//! checks that the recovery manager finds and repairs the difference.
//!
//! Run with:
//!   cargo test --test recovery

use std::sync::Arc;

use shardmap::{
    CacheStore, ListShardMap, MappingDifferenceResolution, MappingDifferenceType, MappingLocation, MemoryStore,
    RetryPolicyConfig, Shard, ShardKey, ShardKeyType, ShardLocation, ShardManagementErrorCode, ShardMapManager,
    ShardMapManagerConfig, ShardMapManagerCreateMode, ShardMapManagerFactory, StoreCredentials,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const SERVER: &str = "recovery";

fn gsm_location() -> ShardLocation {
    ShardLocation::new(SERVER, "shardmapmanager")
}

fn deploy(store: &MemoryStore) -> ShardMapManager {
    let _ = env_logger::builder().is_test(true).try_init();
    store.create_database(&gsm_location());
    let config = ShardMapManagerConfig {
        retry: RetryPolicyConfig {
            retry_count: 1,
            min_backoff_ms: 0,
            max_backoff_ms: 1,
            delta_backoff_ms: 0,
        },
        ..ShardMapManagerConfig::default()
    };
    ShardMapManagerFactory::create_shard_map_manager(
        StoreCredentials::new(gsm_location()),
        Arc::new(store.connection_factory()),
        ShardMapManagerCreateMode::ReplaceExisting,
        config,
    )
    .unwrap()
}

fn users_map(store: &MemoryStore, manager: &ShardMapManager) -> (ListShardMap, Shard) {
    let map = manager
        .create_list_shard_map("users", ShardKeyType::Int64)
        .unwrap()
        .into_inner();
    let location = ShardLocation::new(SERVER, "users0");
    store.create_database(&location);
    let shard = map.create_shard(location).unwrap();
    for user in [1, 2, 3] {
        map.create_point_mapping(ShardKey::from_i64(user), &shard).unwrap();
    }
    (map, shard)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn rebuild_restores_lost_global_mappings() {
    let store = MemoryStore::new();
    let manager = deploy(&store);
    let (map, shard) = users_map(&store, &manager);

    store
        .modify(&gsm_location(), |db| {
            if let Some(global) = db.global.as_mut() {
                global.mappings.clear();
            }
        })
        .unwrap();
    manager.cache().clear();
    assert!(map.get_mappings().unwrap().is_empty());

    let recovery = manager.recovery_manager();
    let token = recovery.detect_mapping_differences(shard.location(), Some("users")).unwrap()[0];
    let differences = recovery.get_mapping_differences(token).unwrap();
    assert_eq!(differences.len(), 3);
    assert!(differences
        .iter()
        .all(|d| d.location == MappingLocation::MappingInShardOnly && d.kind == MappingDifferenceType::List));

    recovery
        .rebuild_mappings_on_shard_map_manager_from_shards(&[shard.location().clone()])
        .unwrap();
    assert_eq!(map.get_mappings().unwrap().len(), 3);
    assert_eq!(
        map.get_mapping_for_key(&ShardKey::from_i64(2)).unwrap().shard().location(),
        shard.location()
    );

    let token = recovery.detect_mapping_differences(shard.location(), None).unwrap()[0];
    assert!(recovery.get_mapping_differences(token).unwrap().is_empty());
}

#[test]
fn keep_shard_mapping_drops_global_only_mapping() {
    let store = MemoryStore::new();
    let manager = deploy(&store);
    let (map, shard) = users_map(&store, &manager);

    // The shard forgets user 3.
    let forgotten = map.get_mapping_for_key(&ShardKey::from_i64(3)).unwrap();
    store
        .modify(shard.location(), |db| {
            if let Some(local) = db.local.as_mut() {
                local.mappings.retain(|m| m.id != forgotten.id());
            }
        })
        .unwrap();

    let recovery = manager.recovery_manager();
    let token = recovery.detect_mapping_differences(shard.location(), None).unwrap()[0];
    let differences = recovery.get_mapping_differences(token).unwrap();
    assert_eq!(differences.len(), 1);
    assert_eq!(differences[0].location, MappingLocation::MappingInShardMapOnly);
    assert_eq!(differences[0].mappings_for_shard_map[0].id, forgotten.id());

    recovery
        .resolve_mapping_difference(token, differences[0].id, MappingDifferenceResolution::KeepShardMapping)
        .unwrap();

    let err = map.get_mapping_for_key(&ShardKey::from_i64(3)).err().unwrap();
    assert_eq!(err.code, ShardManagementErrorCode::MappingNotFoundForKey);
    assert_eq!(map.get_mappings().unwrap().len(), 2);

    let again = recovery.detect_mapping_differences(shard.location(), None).unwrap()[0];
    assert!(recovery.get_mapping_differences(again).unwrap().is_empty());

    let err = recovery
        .resolve_mapping_difference(token, differences[0].id, MappingDifferenceResolution::Ignore)
        .err()
        .unwrap();
    assert_eq!(err.code, ShardManagementErrorCode::MappingDifferenceNotFound);
}

#[test]
fn detached_shard_can_be_attached_to_a_fresh_store() {
    let store = MemoryStore::new();
    let manager = deploy(&store);
    let (_, shard) = users_map(&store, &manager);

    // Redeploy the global store; the shard keeps its own metadata.
    let manager = ShardMapManagerFactory::create_shard_map_manager(
        StoreCredentials::new(gsm_location()),
        Arc::new(store.connection_factory()),
        ShardMapManagerCreateMode::ReplaceExisting,
        manager.config().clone(),
    )
    .unwrap();
    assert!(manager.get_shard_maps().unwrap().is_empty());

    manager
        .recovery_manager()
        .attach_shard(shard.location(), None)
        .unwrap();

    let map = manager.get_list_shard_map("users").unwrap();
    assert_eq!(map.get_shards().unwrap().len(), 1);
    assert_eq!(map.get_mappings().unwrap().len(), 3);
    assert_eq!(manager.get_distinct_shard_locations().unwrap(), vec![shard.location().clone()]);

    manager
        .recovery_manager()
        .detach_shard(shard.location(), None)
        .unwrap();
    assert!(map.get_shards().unwrap().is_empty());
    assert!(map.get_mappings().unwrap().is_empty());
}
