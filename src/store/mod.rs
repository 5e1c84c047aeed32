//! Backing-store boundary
//!
//! The global store (GSM) and each shard's local store (LSM) are reached
//! through [`StoreConnection`]s handed out by a [`StoreConnectionFactory`].
//! Every request runs inside a [`StoreTransactionScope`] and returns a
//! [`StoreResults`] envelope.

pub mod connection;
pub mod memory;
pub mod request;
pub mod result;
pub mod types;

pub use connection::{
    StoreConnection, StoreConnectionFactory, StoreConnectionKind, StoreTransactionScope,
    StoreTransactionScopeKind,
};
pub use memory::{
    DatabaseState, FaultInjection, FaultOutcome, GlobalState, LocalState, MemoryStore,
    MemoryStoreConnectionFactory,
};
pub use request::{GlobalChange, LockOwnerIdOpType, MappingRemoval, StoreCommand, StoreRequest, StoreTarget};
pub use result::{StoreResult, StoreResults};
pub use types::{
    MappingStatus, ShardLocation, ShardMapKind, ShardStatus, SqlProtocol, StoreLogEntry,
    StoreMapping, StoreSchemaInfo, StoreShard, StoreShardMap, StoreVersion, FORCE_UNLOCK_OWNER_ID,
    GLOBAL_STORE_VERSION, LOCAL_STORE_VERSION,
};

use thiserror::Error;
use uuid::Uuid;

/// Infrastructure failure talking to a store. Logical outcomes travel as
/// [`StoreResult`] instead.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("connection to {location} failed: {reason}")]
    ConnectionFailed { location: ShardLocation, reason: String },

    #[error("database {0} does not exist")]
    DatabaseNotFound(ShardLocation),

    #[error("timed out acquiring application lock {0}")]
    LockTimeout(Uuid),

    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("store command timed out: {0}")]
    Timeout(String),

    #[error("store structures are not deployed: {0}")]
    NotDeployed(String),

    #[error("connection is not open")]
    ConnectionNotOpen,

    #[error("invalid store request: {0}")]
    InvalidRequest(String),

    #[error("unknown store result code {0}")]
    UnknownResultCode(i32),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("store failure: {0}")]
    Fatal(String),
}

impl StoreError {
    /// Default transient-error predicate used by the retry policy.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::ConnectionFailed { .. }
                | StoreError::LockTimeout(_)
                | StoreError::Transient(_)
                | StoreError::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}
