//! Outcome codes and the result envelope returned by every store request

use serde::{Deserialize, Serialize};

use super::types::{
    ShardLocation, StoreLogEntry, StoreMapping, StoreSchemaInfo, StoreShard, StoreShardMap,
    StoreVersion,
};
use super::StoreError;

/// Logical outcome of a store request. The numeric values are shared with the
/// store and must round-trip exactly.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StoreResult {
    Failure = 0,
    Success = 1,
    MissingParametersForStoredProcedure = 50,
    StoreVersionMismatch = 51,
    ShardPendingOperation = 52,
    UnexpectedStoreError = 53,
    ShardMapExists = 101,
    ShardMapDoesNotExist = 102,
    ShardMapHasShards = 103,
    ShardExists = 201,
    ShardDoesNotExist = 202,
    ShardHasMappings = 203,
    ShardVersionMismatch = 204,
    ShardLocationExists = 205,
    MappingDoesNotExist = 301,
    MappingRangeAlreadyMapped = 302,
    MappingPointAlreadyMapped = 303,
    MappingNotFoundForKey = 304,
    UnableToKillSessions = 305,
    MappingIsNotOffline = 306,
    MappingLockOwnerIdDoesNotMatch = 307,
    MappingIsAlreadyLocked = 308,
    MappingIsOffline = 309,
    SchemaInfoNameDoesNotExist = 401,
    SchemaInfoNameConflict = 402,
}

impl StoreResult {
    pub const ALL: [StoreResult; 25] = [
        StoreResult::Failure,
        StoreResult::Success,
        StoreResult::MissingParametersForStoredProcedure,
        StoreResult::StoreVersionMismatch,
        StoreResult::ShardPendingOperation,
        StoreResult::UnexpectedStoreError,
        StoreResult::ShardMapExists,
        StoreResult::ShardMapDoesNotExist,
        StoreResult::ShardMapHasShards,
        StoreResult::ShardExists,
        StoreResult::ShardDoesNotExist,
        StoreResult::ShardHasMappings,
        StoreResult::ShardVersionMismatch,
        StoreResult::ShardLocationExists,
        StoreResult::MappingDoesNotExist,
        StoreResult::MappingRangeAlreadyMapped,
        StoreResult::MappingPointAlreadyMapped,
        StoreResult::MappingNotFoundForKey,
        StoreResult::UnableToKillSessions,
        StoreResult::MappingIsNotOffline,
        StoreResult::MappingLockOwnerIdDoesNotMatch,
        StoreResult::MappingIsAlreadyLocked,
        StoreResult::MappingIsOffline,
        StoreResult::SchemaInfoNameDoesNotExist,
        StoreResult::SchemaInfoNameConflict,
    ];

    pub fn code(self) -> i32 {
        self as i32
    }

    /// Decode a numeric code reported by the store. Unknown codes are an error.
    pub fn from_code(code: i32) -> Result<Self, StoreError> {
        let result = match code {
            0 => StoreResult::Failure,
            1 => StoreResult::Success,
            50 => StoreResult::MissingParametersForStoredProcedure,
            51 => StoreResult::StoreVersionMismatch,
            52 => StoreResult::ShardPendingOperation,
            53 => StoreResult::UnexpectedStoreError,
            101 => StoreResult::ShardMapExists,
            102 => StoreResult::ShardMapDoesNotExist,
            103 => StoreResult::ShardMapHasShards,
            201 => StoreResult::ShardExists,
            202 => StoreResult::ShardDoesNotExist,
            203 => StoreResult::ShardHasMappings,
            204 => StoreResult::ShardVersionMismatch,
            205 => StoreResult::ShardLocationExists,
            301 => StoreResult::MappingDoesNotExist,
            302 => StoreResult::MappingRangeAlreadyMapped,
            303 => StoreResult::MappingPointAlreadyMapped,
            304 => StoreResult::MappingNotFoundForKey,
            305 => StoreResult::UnableToKillSessions,
            306 => StoreResult::MappingIsNotOffline,
            307 => StoreResult::MappingLockOwnerIdDoesNotMatch,
            308 => StoreResult::MappingIsAlreadyLocked,
            309 => StoreResult::MappingIsOffline,
            401 => StoreResult::SchemaInfoNameDoesNotExist,
            402 => StoreResult::SchemaInfoNameConflict,
            other => return Err(StoreError::UnknownResultCode(other)),
        };
        Ok(result)
    }

    pub fn is_success(self) -> bool {
        self == StoreResult::Success
    }
}

/// Everything a store request can return.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StoreResults {
    pub result: StoreResult,
    pub shard_maps: Vec<StoreShardMap>,
    pub shards: Vec<StoreShard>,
    pub mappings: Vec<StoreMapping>,
    pub locations: Vec<ShardLocation>,
    pub log_entries: Vec<StoreLogEntry>,
    pub schema_info: Vec<StoreSchemaInfo>,
    pub version: Option<StoreVersion>,
}

impl StoreResults {
    pub fn new(result: StoreResult) -> Self {
        Self {
            result,
            shard_maps: Vec::new(),
            shards: Vec::new(),
            mappings: Vec::new(),
            locations: Vec::new(),
            log_entries: Vec::new(),
            schema_info: Vec::new(),
            version: None,
        }
    }

    pub fn success() -> Self {
        Self::new(StoreResult::Success)
    }

    pub fn with_shard_maps(mut self, shard_maps: Vec<StoreShardMap>) -> Self {
        self.shard_maps = shard_maps;
        self
    }

    pub fn with_shards(mut self, shards: Vec<StoreShard>) -> Self {
        self.shards = shards;
        self
    }

    pub fn with_mappings(mut self, mappings: Vec<StoreMapping>) -> Self {
        self.mappings = mappings;
        self
    }

    pub fn with_locations(mut self, locations: Vec<ShardLocation>) -> Self {
        self.locations = locations;
        self
    }

    pub fn with_log_entries(mut self, log_entries: Vec<StoreLogEntry>) -> Self {
        self.log_entries = log_entries;
        self
    }

    pub fn with_schema_info(mut self, schema_info: Vec<StoreSchemaInfo>) -> Self {
        self.schema_info = schema_info;
        self
    }

    pub fn with_version(mut self, version: Option<StoreVersion>) -> Self {
        self.version = version;
        self
    }

    pub fn is_success(&self) -> bool {
        self.result.is_success()
    }
}
