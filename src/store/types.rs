//! Store-side records
//!
//! These are immutable value records exchanged with the backing store. Changes
//! produce new values (`with_*`) so a log entry always captures exactly what an
//! operation saw.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::key::{ShardKey, ShardKeyType, ShardRange};
use crate::operations::{OperationCode, StoreOperationState};

/// Network protocol used to reach a shard.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SqlProtocol {
    Default,
    Tcp,
    NamedPipes,
    SharedMemory,
}

/// Physical location of a shard database.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardLocation {
    pub server: String,
    pub database: String,
    pub protocol: SqlProtocol,
    pub port: u16,
}

impl ShardLocation {
    pub fn new(server: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            database: database.into(),
            protocol: SqlProtocol::Default,
            port: 0,
        }
    }

    pub fn with_protocol(mut self, protocol: SqlProtocol, port: u16) -> Self {
        self.protocol = protocol;
        self.port = port;
        self
    }
}

impl fmt::Display for ShardLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.protocol {
            SqlProtocol::Default => "",
            SqlProtocol::Tcp => "tcp:",
            SqlProtocol::NamedPipes => "np:",
            SqlProtocol::SharedMemory => "lpc:",
        };
        if self.port == 0 {
            write!(f, "{}{}/{}", prefix, self.server, self.database)
        } else {
            write!(f, "{}{},{}/{}", prefix, self.server, self.port, self.database)
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ShardMapKind {
    List,
    Range,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreShardMap {
    pub id: Uuid,
    pub name: String,
    pub kind: ShardMapKind,
    pub key_type: ShardKeyType,
}

impl StoreShardMap {
    pub fn new(name: impl Into<String>, kind: ShardMapKind, key_type: ShardKeyType) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            key_type,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ShardStatus {
    Offline,
    Online,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreShard {
    pub id: Uuid,
    /// Bumped by every operation that changes the shard or its mappings.
    pub version: Uuid,
    pub shard_map_id: Uuid,
    pub location: ShardLocation,
    pub status: ShardStatus,
}

impl StoreShard {
    pub fn new(shard_map_id: Uuid, location: ShardLocation, status: ShardStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            version: Uuid::new_v4(),
            shard_map_id,
            location,
            status,
        }
    }

    pub fn with_version(&self, version: Uuid) -> Self {
        Self {
            version,
            ..self.clone()
        }
    }

    pub fn with_status(&self, status: ShardStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MappingStatus {
    Offline,
    Online,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreMapping {
    pub id: Uuid,
    pub shard_map_id: Uuid,
    pub min_value: ShardKey,
    /// `None` for point mappings.
    pub max_value: Option<ShardKey>,
    pub status: MappingStatus,
    pub lock_owner_id: Option<Uuid>,
    pub shard: StoreShard,
}

impl StoreMapping {
    pub fn point(shard_map_id: Uuid, key: ShardKey, shard: StoreShard, status: MappingStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            shard_map_id,
            min_value: key,
            max_value: None,
            status,
            lock_owner_id: None,
            shard,
        }
    }

    pub fn range(shard_map_id: Uuid, range: &ShardRange, shard: StoreShard, status: MappingStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            shard_map_id,
            min_value: range.low().clone(),
            max_value: Some(range.high().clone()),
            status,
            lock_owner_id: None,
            shard,
        }
    }

    pub fn is_point(&self) -> bool {
        self.max_value.is_none()
    }

    /// The covered interval, `None` for point mappings.
    pub fn key_range(&self) -> Option<ShardRange> {
        let high = self.max_value.clone()?;
        ShardRange::new(self.min_value.clone(), high).ok()
    }

    pub fn covers(&self, key: &ShardKey) -> bool {
        match &self.max_value {
            None => self.min_value == *key,
            Some(high) => self.min_value <= *key && key < high,
        }
    }

    pub fn overlaps(&self, other: &StoreMapping) -> bool {
        match (&self.max_value, &other.max_value) {
            (None, None) => self.min_value == other.min_value,
            (Some(high), None) => self.min_value <= other.min_value && other.min_value < *high,
            (None, Some(high)) => other.min_value <= self.min_value && self.min_value < *high,
            (Some(a_high), Some(b_high)) => self.min_value < *b_high && other.min_value < *a_high,
        }
    }

    pub fn intersects_range(&self, range: &ShardRange) -> bool {
        match &self.max_value {
            None => range.contains(&self.min_value),
            Some(high) => self.min_value < *range.high() && *range.low() < *high,
        }
    }

    pub fn with_status(&self, status: MappingStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    pub fn with_shard(&self, shard: StoreShard) -> Self {
        Self {
            shard,
            ..self.clone()
        }
    }

    pub fn with_lock_owner(&self, lock_owner_id: Option<Uuid>) -> Self {
        Self {
            lock_owner_id,
            ..self.clone()
        }
    }

    /// Same content under a fresh identity.
    pub fn with_new_id(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            ..self.clone()
        }
    }

    pub fn describe(&self) -> String {
        match self.key_range() {
            Some(range) => range.to_string(),
            None => self.min_value.to_string(),
        }
    }
}

/// Durable record of an in-flight multi-step operation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreLogEntry {
    pub id: Uuid,
    pub operation_code: OperationCode,
    /// Opaque serialized operation payload.
    pub data: Vec<u8>,
    pub undo_start_state: StoreOperationState,
    pub shard_id_removes: Option<Uuid>,
    pub shard_id_adds: Option<Uuid>,
    /// Filled in by the global store when the entry is written.
    pub original_shard_version_removes: Option<Uuid>,
    pub original_shard_version_adds: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl StoreLogEntry {
    pub fn touches_shard(&self, shard_id: Uuid) -> bool {
        self.shard_id_removes == Some(shard_id) || self.shard_id_adds == Some(shard_id)
    }
}

/// Named sharding schema blob kept in the global store.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreSchemaInfo {
    pub name: String,
    pub info: String,
}

/// Version of the deployed store structures.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct StoreVersion {
    pub major: u32,
    pub minor: u32,
}

impl StoreVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Stores are compatible within a major version.
    pub fn is_compatible_with(&self, other: &StoreVersion) -> bool {
        self.major == other.major
    }
}

impl fmt::Display for StoreVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Lock owner id that overrides any existing lock.
pub const FORCE_UNLOCK_OWNER_ID: Uuid = Uuid::from_u128(u128::MAX);

pub const GLOBAL_STORE_VERSION: StoreVersion = StoreVersion::new(1, 2);
pub const LOCAL_STORE_VERSION: StoreVersion = StoreVersion::new(1, 2);
