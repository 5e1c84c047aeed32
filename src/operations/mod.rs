//! Store operations
//!
//! Operations that change both the global store and one or two shards run
//! through the logged engine in [`engine`]: the intent is recorded in the
//! global operation log first, the shard databases are updated next, and the
//! global change is applied last. Any failure in between is undone from the log
//! entry. Single-store reads and writes go through [`global`] and [`local`].

pub mod engine;
pub mod global;
pub mod local;
pub mod mapping;
pub mod payload;
pub mod shard;
pub mod state;

pub use engine::{StoreOperation, StoreOperationSteps};
pub use global::{run_global, GlobalOperation, GlobalRequest};
pub use local::{run_local, LocalOperation, LocalRequest};
pub use mapping::{
    AddMappingOperation, RemoveMappingOperation, ReplaceMappingsOperation, UpdateMappingOperation,
};
pub use payload::OperationPayload;
pub use shard::{AddShardOperation, AttachShardOperation, RemoveShardOperation, UpdateShardOperation};
pub use state::{OperationCode, StoreOperationState};

use std::sync::Arc;

use uuid::Uuid;

use crate::cache::CacheStore;
use crate::config::StoreCredentials;
use crate::errors::{Result, ShardManagementError, ShardManagementErrorCategory};
use crate::retry::RetryPolicy;
use crate::store::{ShardLocation, StoreConnection, StoreConnectionFactory, StoreConnectionKind};

/// Everything an operation needs to reach the stores.
#[derive(Clone)]
pub struct OperationContext {
    pub credentials: StoreCredentials,
    pub connections: Arc<dyn StoreConnectionFactory>,
    pub retry: RetryPolicy,
    pub cache: Arc<dyn CacheStore>,
}

impl OperationContext {
    pub fn new(
        credentials: StoreCredentials,
        connections: Arc<dyn StoreConnectionFactory>,
        retry: RetryPolicy,
        cache: Arc<dyn CacheStore>,
    ) -> Self {
        Self {
            credentials,
            connections,
            retry,
            cache,
        }
    }

    pub fn global_location(&self) -> &ShardLocation {
        &self.credentials.location
    }

    /// Open a connection, optionally holding the application lock `lock_id`
    /// until it is closed.
    pub(crate) fn connect(
        &self,
        kind: StoreConnectionKind,
        location: &ShardLocation,
        lock_id: Option<Uuid>,
        category: ShardManagementErrorCategory,
        operation: &str,
    ) -> Result<Box<dyn StoreConnection>> {
        let wrap = |e| ShardManagementError::from_store_error(category, operation, e).with_location(location.clone());
        let mut connection = self.connections.get_connection(kind, location).map_err(wrap)?;
        match lock_id {
            Some(id) => connection.open_with_lock(id),
            None => connection.open(),
        }
        .map_err(wrap)?;
        log::trace!("{}: opened {:?} connection to {}", operation, kind, location);
        Ok(connection)
    }
}
