// Shardmap - Client-side shard map management

pub mod cache;
pub mod config;
pub mod errors;
pub mod key;
pub mod manager;
pub mod operations;
pub mod recovery;
pub mod retry;
pub mod schema;
pub mod store;

pub use cache::{CacheStore, CacheStoreMappingUpdatePolicy, InMemoryCacheStore};
pub use config::{CacheConfig, ConfigError, RetryPolicyConfig, ShardMapManagerConfig, StoreCredentials};
pub use errors::{
    Result, ShardManagementAggregateError, ShardManagementError, ShardManagementErrorCategory,
    ShardManagementErrorCode,
};
pub use key::{ShardKey, ShardKeyType, ShardRange};
pub use manager::{
    ConnectionOptions, CreateOutcome, ListShardMap, LookupOptions, MappingLockToken, MappingUpdate, PointMapping,
    RangeMapping, RangeShardMap, Shard, ShardConnection, ShardMap, ShardMapManager, ShardMapManagerCreateMode,
    ShardMapManagerFactory, ShardMapManagerLoadPolicy,
};
pub use recovery::{
    MappingDifference, MappingDifferenceResolution, MappingDifferenceType, MappingLocation, RecoveryManager,
    RecoveryToken,
};
pub use retry::RetryPolicy;
pub use schema::{ReferenceTableInfo, SchemaInfo, SchemaInfoCollection, ShardedTableInfo};
pub use store::{MappingStatus, MemoryStore, ShardLocation, ShardMapKind, ShardStatus};
