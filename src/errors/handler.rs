//! Translation of store result codes into management errors
//!
//! One function per operation family and store side. Every function matches
//! exhaustively on [`StoreResult`]; codes a family never expects fall through to
//! the common handler, which reports them as `UnexpectedError`. Call sites are
//! responsible for treating benign end states (for example a missing shard map
//! during delete) as success before reaching these functions.

use super::{ShardManagementError, ShardManagementErrorCategory, ShardManagementErrorCode as Code};
use crate::store::{ShardLocation, StoreResult, StoreShardMap};

/// Where a failing result came from.
#[derive(Clone, Copy, Debug)]
pub struct ErrorSite<'a> {
    pub operation: &'a str,
    pub category: ShardManagementErrorCategory,
    pub shard_map: Option<&'a StoreShardMap>,
    pub location: Option<&'a ShardLocation>,
}

impl<'a> ErrorSite<'a> {
    pub fn new(category: ShardManagementErrorCategory, operation: &'a str) -> Self {
        Self {
            operation,
            category,
            shard_map: None,
            location: None,
        }
    }

    pub fn shard_map(mut self, shard_map: &'a StoreShardMap) -> Self {
        self.shard_map = Some(shard_map);
        self
    }

    pub fn location(mut self, location: &'a ShardLocation) -> Self {
        self.location = Some(location);
        self
    }

    fn map_name(&self) -> &str {
        self.shard_map.map_or("<unknown>", |m| m.name.as_str())
    }

    fn place(&self) -> String {
        self.location.map_or_else(|| "the global store".to_string(), |l| l.to_string())
    }

    pub fn error(&self, code: Code, message: impl Into<String>) -> ShardManagementError {
        let mut err = ShardManagementError::new(self.category, code, message).with_operation(self.operation);
        if let Some(map) = self.shard_map {
            err = err.with_shard_map(map.name.clone());
        }
        if let Some(location) = self.location {
            err = err.with_location(location.clone());
        }
        err
    }
}

fn common(result: StoreResult, site: &ErrorSite<'_>, version_mismatch: Code) -> ShardManagementError {
    match result {
        StoreResult::MissingParametersForStoredProcedure => site.error(
            Code::StoredProcedureParameterMissing,
            format!("{} was missing required parameters", site.operation),
        ),
        StoreResult::StoreVersionMismatch => site.error(
            version_mismatch,
            format!("store version at {} is not supported by this client", site.place()),
        ),
        StoreResult::ShardPendingOperation => site.error(
            Code::ShardPendingOperation,
            format!("another operation is in progress on a shard of '{}'", site.map_name()),
        ),
        StoreResult::Failure | StoreResult::UnexpectedStoreError => site.error(
            Code::StorageOperationFailure,
            format!("{} failed at {}", site.operation, site.place()),
        ),
        other => site.error(
            Code::UnexpectedError,
            format!("unexpected store result {:?} ({}) for {}", other, other.code(), site.operation),
        ),
    }
}

/// Codes shared by every global-store request.
pub fn on_common_error_global(result: StoreResult, site: &ErrorSite<'_>) -> ShardManagementError {
    common(result, site, Code::GlobalStoreVersionMismatch)
}

/// Codes shared by every local-store request.
pub fn on_common_error_local(result: StoreResult, site: &ErrorSite<'_>) -> ShardManagementError {
    common(result, site, Code::LocalStoreVersionMismatch)
}

/// Shard map creation, lookup and removal on the global store.
pub fn on_shard_map_manager_error_global(result: StoreResult, site: &ErrorSite<'_>) -> ShardManagementError {
    match result {
        StoreResult::ShardMapExists => site.error(
            Code::ShardMapAlreadyExists,
            format!("shard map '{}' already exists", site.map_name()),
        ),
        StoreResult::ShardMapDoesNotExist => site.error(
            Code::ShardMapDoesNotExist,
            format!("shard map '{}' does not exist", site.map_name()),
        ),
        StoreResult::ShardMapHasShards => site.error(
            Code::ShardMapHasShards,
            format!("shard map '{}' still has shards", site.map_name()),
        ),
        StoreResult::Failure
        | StoreResult::Success
        | StoreResult::MissingParametersForStoredProcedure
        | StoreResult::StoreVersionMismatch
        | StoreResult::ShardPendingOperation
        | StoreResult::UnexpectedStoreError
        | StoreResult::ShardExists
        | StoreResult::ShardDoesNotExist
        | StoreResult::ShardHasMappings
        | StoreResult::ShardVersionMismatch
        | StoreResult::ShardLocationExists
        | StoreResult::MappingDoesNotExist
        | StoreResult::MappingRangeAlreadyMapped
        | StoreResult::MappingPointAlreadyMapped
        | StoreResult::MappingNotFoundForKey
        | StoreResult::UnableToKillSessions
        | StoreResult::MappingIsNotOffline
        | StoreResult::MappingLockOwnerIdDoesNotMatch
        | StoreResult::MappingIsAlreadyLocked
        | StoreResult::MappingIsOffline
        | StoreResult::SchemaInfoNameDoesNotExist
        | StoreResult::SchemaInfoNameConflict => on_common_error_global(result, site),
    }
}

/// Shard add/remove/update on the global store.
pub fn on_shard_map_error_global(result: StoreResult, site: &ErrorSite<'_>) -> ShardManagementError {
    match result {
        StoreResult::ShardMapDoesNotExist => site.error(
            Code::ShardMapDoesNotExist,
            format!("shard map '{}' does not exist", site.map_name()),
        ),
        StoreResult::ShardExists => site.error(
            Code::ShardAlreadyExists,
            format!("shard at {} already exists in '{}'", site.place(), site.map_name()),
        ),
        StoreResult::ShardLocationExists => site.error(
            Code::ShardLocationAlreadyExists,
            format!("location {} is already used by a shard of '{}'", site.place(), site.map_name()),
        ),
        StoreResult::ShardDoesNotExist => site.error(
            Code::ShardDoesNotExist,
            format!("shard at {} does not exist in '{}'", site.place(), site.map_name()),
        ),
        StoreResult::ShardVersionMismatch => site.error(
            Code::ShardVersionMismatch,
            format!("shard at {} was modified concurrently", site.place()),
        ),
        StoreResult::ShardHasMappings => site.error(
            Code::ShardHasMappings,
            format!("shard at {} still has mappings", site.place()),
        ),
        StoreResult::Failure
        | StoreResult::Success
        | StoreResult::MissingParametersForStoredProcedure
        | StoreResult::StoreVersionMismatch
        | StoreResult::ShardPendingOperation
        | StoreResult::UnexpectedStoreError
        | StoreResult::ShardMapExists
        | StoreResult::ShardMapHasShards
        | StoreResult::MappingDoesNotExist
        | StoreResult::MappingRangeAlreadyMapped
        | StoreResult::MappingPointAlreadyMapped
        | StoreResult::MappingNotFoundForKey
        | StoreResult::UnableToKillSessions
        | StoreResult::MappingIsNotOffline
        | StoreResult::MappingLockOwnerIdDoesNotMatch
        | StoreResult::MappingIsAlreadyLocked
        | StoreResult::MappingIsOffline
        | StoreResult::SchemaInfoNameDoesNotExist
        | StoreResult::SchemaInfoNameConflict => on_common_error_global(result, site),
    }
}

/// Shard steps on a local store.
pub fn on_shard_map_error_local(result: StoreResult, site: &ErrorSite<'_>) -> ShardManagementError {
    match result {
        StoreResult::ShardVersionMismatch => site.error(
            Code::ShardVersionMismatch,
            format!("local shard version at {} does not match", site.place()),
        ),
        StoreResult::Failure
        | StoreResult::Success
        | StoreResult::MissingParametersForStoredProcedure
        | StoreResult::StoreVersionMismatch
        | StoreResult::ShardPendingOperation
        | StoreResult::UnexpectedStoreError
        | StoreResult::ShardMapExists
        | StoreResult::ShardMapDoesNotExist
        | StoreResult::ShardMapHasShards
        | StoreResult::ShardExists
        | StoreResult::ShardDoesNotExist
        | StoreResult::ShardHasMappings
        | StoreResult::ShardLocationExists
        | StoreResult::MappingDoesNotExist
        | StoreResult::MappingRangeAlreadyMapped
        | StoreResult::MappingPointAlreadyMapped
        | StoreResult::MappingNotFoundForKey
        | StoreResult::UnableToKillSessions
        | StoreResult::MappingIsNotOffline
        | StoreResult::MappingLockOwnerIdDoesNotMatch
        | StoreResult::MappingIsAlreadyLocked
        | StoreResult::MappingIsOffline
        | StoreResult::SchemaInfoNameDoesNotExist
        | StoreResult::SchemaInfoNameConflict => on_common_error_local(result, site),
    }
}

/// Mapping changes and lookups on the global store.
pub fn on_shard_mapper_error_global(result: StoreResult, site: &ErrorSite<'_>) -> ShardManagementError {
    match result {
        StoreResult::ShardMapDoesNotExist => site.error(
            Code::ShardMapDoesNotExist,
            format!("shard map '{}' does not exist", site.map_name()),
        ),
        StoreResult::ShardDoesNotExist => site.error(
            Code::ShardDoesNotExist,
            format!("shard at {} does not exist in '{}'", site.place(), site.map_name()),
        ),
        StoreResult::ShardVersionMismatch => site.error(
            Code::ShardVersionMismatch,
            format!("shard at {} was modified concurrently", site.place()),
        ),
        StoreResult::MappingDoesNotExist => site.error(
            Code::MappingDoesNotExist,
            format!("mapping does not exist in '{}'", site.map_name()),
        ),
        StoreResult::MappingRangeAlreadyMapped => site.error(
            Code::MappingRangeAlreadyMapped,
            format!("range is already mapped in '{}'", site.map_name()),
        ),
        StoreResult::MappingPointAlreadyMapped => site.error(
            Code::MappingPointAlreadyMapped,
            format!("point is already mapped in '{}'", site.map_name()),
        ),
        StoreResult::MappingNotFoundForKey => site.error(
            Code::MappingNotFoundForKey,
            format!("no mapping for key in '{}'", site.map_name()),
        ),
        StoreResult::MappingIsNotOffline => site.error(
            Code::MappingIsNotOffline,
            format!("mapping in '{}' must be offline for this change", site.map_name()),
        ),
        StoreResult::MappingLockOwnerIdDoesNotMatch => site.error(
            Code::MappingLockOwnerIdDoesNotMatch,
            format!("mapping in '{}' is locked by another owner", site.map_name()),
        ),
        StoreResult::MappingIsAlreadyLocked => site.error(
            Code::MappingIsAlreadyLocked,
            format!("mapping in '{}' is already locked", site.map_name()),
        ),
        StoreResult::Failure
        | StoreResult::Success
        | StoreResult::MissingParametersForStoredProcedure
        | StoreResult::StoreVersionMismatch
        | StoreResult::ShardPendingOperation
        | StoreResult::UnexpectedStoreError
        | StoreResult::ShardMapExists
        | StoreResult::ShardMapHasShards
        | StoreResult::ShardExists
        | StoreResult::ShardHasMappings
        | StoreResult::ShardLocationExists
        | StoreResult::UnableToKillSessions
        | StoreResult::MappingIsOffline
        | StoreResult::SchemaInfoNameDoesNotExist
        | StoreResult::SchemaInfoNameConflict => on_common_error_global(result, site),
    }
}

/// Mapping steps on a local store.
pub fn on_shard_mapper_error_local(result: StoreResult, site: &ErrorSite<'_>) -> ShardManagementError {
    match result {
        StoreResult::UnableToKillSessions => site.error(
            Code::MappingsKillConnectionFailure,
            format!("could not terminate connections for a mapping at {}", site.place()),
        ),
        StoreResult::ShardVersionMismatch => site.error(
            Code::ShardVersionMismatch,
            format!("local shard version at {} does not match", site.place()),
        ),
        StoreResult::Failure
        | StoreResult::Success
        | StoreResult::MissingParametersForStoredProcedure
        | StoreResult::StoreVersionMismatch
        | StoreResult::ShardPendingOperation
        | StoreResult::UnexpectedStoreError
        | StoreResult::ShardMapExists
        | StoreResult::ShardMapDoesNotExist
        | StoreResult::ShardMapHasShards
        | StoreResult::ShardExists
        | StoreResult::ShardDoesNotExist
        | StoreResult::ShardHasMappings
        | StoreResult::ShardLocationExists
        | StoreResult::MappingDoesNotExist
        | StoreResult::MappingRangeAlreadyMapped
        | StoreResult::MappingPointAlreadyMapped
        | StoreResult::MappingNotFoundForKey
        | StoreResult::MappingIsNotOffline
        | StoreResult::MappingLockOwnerIdDoesNotMatch
        | StoreResult::MappingIsAlreadyLocked
        | StoreResult::MappingIsOffline
        | StoreResult::SchemaInfoNameDoesNotExist
        | StoreResult::SchemaInfoNameConflict => on_common_error_local(result, site),
    }
}

/// Detach, attach and difference resolution on the global store.
pub fn on_recovery_manager_error_global(result: StoreResult, site: &ErrorSite<'_>) -> ShardManagementError {
    match result {
        StoreResult::ShardMapExists => site.error(
            Code::ShardMapAlreadyExists,
            format!("a different shard map named '{}' already exists", site.map_name()),
        ),
        StoreResult::ShardMapDoesNotExist => site.error(
            Code::ShardMapDoesNotExist,
            format!("shard map '{}' does not exist", site.map_name()),
        ),
        StoreResult::ShardExists => site.error(
            Code::ShardAlreadyExists,
            format!("shard at {} is already attached", site.place()),
        ),
        StoreResult::ShardLocationExists => site.error(
            Code::ShardLocationAlreadyExists,
            format!("location {} is already used by a shard of '{}'", site.place(), site.map_name()),
        ),
        StoreResult::ShardDoesNotExist => site.error(
            Code::ShardDoesNotExist,
            format!("shard at {} does not exist in '{}'", site.place(), site.map_name()),
        ),
        StoreResult::ShardVersionMismatch => site.error(
            Code::ShardVersionMismatch,
            format!("shard at {} was modified concurrently", site.place()),
        ),
        StoreResult::MappingDoesNotExist => site.error(
            Code::MappingDoesNotExist,
            format!("mapping no longer exists in '{}'", site.map_name()),
        ),
        StoreResult::MappingRangeAlreadyMapped => site.error(
            Code::MappingRangeAlreadyMapped,
            format!("range is already mapped in '{}'", site.map_name()),
        ),
        StoreResult::MappingPointAlreadyMapped => site.error(
            Code::MappingPointAlreadyMapped,
            format!("point is already mapped in '{}'", site.map_name()),
        ),
        StoreResult::MappingLockOwnerIdDoesNotMatch => site.error(
            Code::MappingLockOwnerIdDoesNotMatch,
            format!("mapping in '{}' is locked by another owner", site.map_name()),
        ),
        StoreResult::Failure
        | StoreResult::Success
        | StoreResult::MissingParametersForStoredProcedure
        | StoreResult::StoreVersionMismatch
        | StoreResult::ShardPendingOperation
        | StoreResult::UnexpectedStoreError
        | StoreResult::ShardMapHasShards
        | StoreResult::ShardHasMappings
        | StoreResult::MappingNotFoundForKey
        | StoreResult::UnableToKillSessions
        | StoreResult::MappingIsNotOffline
        | StoreResult::MappingIsAlreadyLocked
        | StoreResult::MappingIsOffline
        | StoreResult::SchemaInfoNameDoesNotExist
        | StoreResult::SchemaInfoNameConflict => on_common_error_global(result, site),
    }
}

/// Reads and repairs on a local store during recovery.
pub fn on_recovery_manager_error_local(result: StoreResult, site: &ErrorSite<'_>) -> ShardManagementError {
    match result {
        StoreResult::ShardMapDoesNotExist => site.error(
            Code::ShardMapDoesNotExist,
            format!("shard map '{}' is not present at {}", site.map_name(), site.place()),
        ),
        StoreResult::ShardDoesNotExist => site.error(
            Code::ShardDoesNotExist,
            format!("no shard record at {}", site.place()),
        ),
        StoreResult::ShardVersionMismatch => site.error(
            Code::ShardVersionMismatch,
            format!("local shard version at {} does not match", site.place()),
        ),
        StoreResult::Failure
        | StoreResult::Success
        | StoreResult::MissingParametersForStoredProcedure
        | StoreResult::StoreVersionMismatch
        | StoreResult::ShardPendingOperation
        | StoreResult::UnexpectedStoreError
        | StoreResult::ShardMapExists
        | StoreResult::ShardMapHasShards
        | StoreResult::ShardExists
        | StoreResult::ShardHasMappings
        | StoreResult::ShardLocationExists
        | StoreResult::MappingDoesNotExist
        | StoreResult::MappingRangeAlreadyMapped
        | StoreResult::MappingPointAlreadyMapped
        | StoreResult::MappingNotFoundForKey
        | StoreResult::UnableToKillSessions
        | StoreResult::MappingIsNotOffline
        | StoreResult::MappingLockOwnerIdDoesNotMatch
        | StoreResult::MappingIsAlreadyLocked
        | StoreResult::MappingIsOffline
        | StoreResult::SchemaInfoNameDoesNotExist
        | StoreResult::SchemaInfoNameConflict => on_common_error_local(result, site),
    }
}

/// Connection validation against a local store.
pub fn on_validation_error_local(result: StoreResult, site: &ErrorSite<'_>) -> ShardManagementError {
    match result {
        StoreResult::ShardMapDoesNotExist => site.error(
            Code::ShardMapDoesNotExist,
            format!("shard map '{}' is not present at {}", site.map_name(), site.place()),
        ),
        StoreResult::ShardDoesNotExist => site.error(
            Code::ShardDoesNotExist,
            format!("shard is not present at {}", site.place()),
        ),
        StoreResult::ShardVersionMismatch => site.error(
            Code::ShardVersionMismatch,
            format!("shard at {} has changed since it was resolved", site.place()),
        ),
        StoreResult::MappingDoesNotExist => site.error(
            Code::MappingDoesNotExist,
            format!("mapping is not present at {}", site.place()),
        ),
        StoreResult::MappingIsOffline => site.error(
            Code::MappingIsOffline,
            format!("mapping at {} is offline", site.place()),
        ),
        StoreResult::Failure
        | StoreResult::Success
        | StoreResult::MissingParametersForStoredProcedure
        | StoreResult::StoreVersionMismatch
        | StoreResult::ShardPendingOperation
        | StoreResult::UnexpectedStoreError
        | StoreResult::ShardMapExists
        | StoreResult::ShardMapHasShards
        | StoreResult::ShardExists
        | StoreResult::ShardHasMappings
        | StoreResult::ShardLocationExists
        | StoreResult::MappingRangeAlreadyMapped
        | StoreResult::MappingPointAlreadyMapped
        | StoreResult::MappingNotFoundForKey
        | StoreResult::UnableToKillSessions
        | StoreResult::MappingIsNotOffline
        | StoreResult::MappingLockOwnerIdDoesNotMatch
        | StoreResult::MappingIsAlreadyLocked
        | StoreResult::SchemaInfoNameDoesNotExist
        | StoreResult::SchemaInfoNameConflict => on_common_error_local(result, site),
    }
}

/// Schema info requests on the global store.
pub fn on_schema_info_error_global(result: StoreResult, name: &str, site: &ErrorSite<'_>) -> ShardManagementError {
    match result {
        StoreResult::SchemaInfoNameConflict => site.error(
            Code::SchemaInfoNameConflict,
            format!("schema info '{}' already exists", name),
        ),
        StoreResult::SchemaInfoNameDoesNotExist => site.error(
            Code::SchemaInfoNameDoesNotExist,
            format!("schema info '{}' does not exist", name),
        ),
        StoreResult::Failure
        | StoreResult::Success
        | StoreResult::MissingParametersForStoredProcedure
        | StoreResult::StoreVersionMismatch
        | StoreResult::ShardPendingOperation
        | StoreResult::UnexpectedStoreError
        | StoreResult::ShardMapExists
        | StoreResult::ShardMapDoesNotExist
        | StoreResult::ShardMapHasShards
        | StoreResult::ShardExists
        | StoreResult::ShardDoesNotExist
        | StoreResult::ShardHasMappings
        | StoreResult::ShardVersionMismatch
        | StoreResult::ShardLocationExists
        | StoreResult::MappingDoesNotExist
        | StoreResult::MappingRangeAlreadyMapped
        | StoreResult::MappingPointAlreadyMapped
        | StoreResult::MappingNotFoundForKey
        | StoreResult::UnableToKillSessions
        | StoreResult::MappingIsNotOffline
        | StoreResult::MappingLockOwnerIdDoesNotMatch
        | StoreResult::MappingIsAlreadyLocked
        | StoreResult::MappingIsOffline => on_common_error_global(result, site),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::ShardKeyType;
    use crate::store::ShardMapKind;

    type Handler = fn(StoreResult, &ErrorSite<'_>) -> ShardManagementError;

    fn schema_handler(result: StoreResult, site: &ErrorSite<'_>) -> ShardManagementError {
        on_schema_info_error_global(result, "s", site)
    }

    /// Each family with the results it translates into a specific code.
    fn families() -> Vec<(&'static str, Handler, Vec<StoreResult>)> {
        use StoreResult::*;
        let common = vec![
            Failure,
            MissingParametersForStoredProcedure,
            StoreVersionMismatch,
            ShardPendingOperation,
            UnexpectedStoreError,
        ];
        let with = |extra: &[StoreResult]| {
            let mut v = common.clone();
            v.extend_from_slice(extra);
            v
        };
        vec![
            (
                "manager",
                on_shard_map_manager_error_global as Handler,
                with(&[ShardMapExists, ShardMapDoesNotExist, ShardMapHasShards]),
            ),
            (
                "shard map global",
                on_shard_map_error_global as Handler,
                with(&[
                    ShardMapDoesNotExist,
                    ShardExists,
                    ShardLocationExists,
                    ShardDoesNotExist,
                    ShardVersionMismatch,
                    ShardHasMappings,
                ]),
            ),
            ("shard map local", on_shard_map_error_local as Handler, with(&[ShardVersionMismatch])),
            (
                "mapper global",
                on_shard_mapper_error_global as Handler,
                with(&[
                    ShardMapDoesNotExist,
                    ShardDoesNotExist,
                    ShardVersionMismatch,
                    MappingDoesNotExist,
                    MappingRangeAlreadyMapped,
                    MappingPointAlreadyMapped,
                    MappingNotFoundForKey,
                    MappingIsNotOffline,
                    MappingLockOwnerIdDoesNotMatch,
                    MappingIsAlreadyLocked,
                ]),
            ),
            (
                "mapper local",
                on_shard_mapper_error_local as Handler,
                with(&[UnableToKillSessions, ShardVersionMismatch]),
            ),
            (
                "recovery global",
                on_recovery_manager_error_global as Handler,
                with(&[
                    ShardMapExists,
                    ShardMapDoesNotExist,
                    ShardExists,
                    ShardLocationExists,
                    ShardDoesNotExist,
                    ShardVersionMismatch,
                    MappingDoesNotExist,
                    MappingRangeAlreadyMapped,
                    MappingPointAlreadyMapped,
                    MappingLockOwnerIdDoesNotMatch,
                ]),
            ),
            (
                "recovery local",
                on_recovery_manager_error_local as Handler,
                with(&[ShardMapDoesNotExist, ShardDoesNotExist, ShardVersionMismatch]),
            ),
            (
                "validation",
                on_validation_error_local as Handler,
                with(&[
                    ShardMapDoesNotExist,
                    ShardDoesNotExist,
                    ShardVersionMismatch,
                    MappingDoesNotExist,
                    MappingIsOffline,
                ]),
            ),
            (
                "schema info",
                schema_handler as Handler,
                with(&[SchemaInfoNameConflict, SchemaInfoNameDoesNotExist]),
            ),
        ]
    }

    #[test]
    fn test_every_result_is_handled_by_every_family() {
        let map = StoreShardMap::new("m", ShardMapKind::Range, ShardKeyType::Int32);
        let location = ShardLocation::new("srv", "db");
        let site = ErrorSite::new(ShardManagementErrorCategory::RangeShardMap, "Op")
            .shard_map(&map)
            .location(&location);

        for (family, handler, expected) in families() {
            for result in StoreResult::ALL {
                let err = handler(result, &site);
                if expected.contains(&result) {
                    assert_ne!(
                        err.code,
                        Code::UnexpectedError,
                        "{} should translate {:?}",
                        family,
                        result
                    );
                } else {
                    assert_eq!(
                        err.code,
                        Code::UnexpectedError,
                        "{} should reject {:?} loudly",
                        family,
                        result
                    );
                }
                assert_eq!(err.context.shard_map_name.as_deref(), Some("m"));
            }
        }
    }

    #[test]
    fn test_version_mismatch_side() {
        let site = ErrorSite::new(ShardManagementErrorCategory::ShardMap, "Op");
        assert_eq!(
            on_shard_map_error_global(StoreResult::StoreVersionMismatch, &site).code,
            Code::GlobalStoreVersionMismatch
        );
        assert_eq!(
            on_shard_map_error_local(StoreResult::StoreVersionMismatch, &site).code,
            Code::LocalStoreVersionMismatch
        );
    }

    #[test]
    fn test_specific_translations() {
        let site = ErrorSite::new(ShardManagementErrorCategory::ListShardMap, "AddPointMapping");
        let err = on_shard_mapper_error_local(StoreResult::UnableToKillSessions, &site);
        assert_eq!(err.code, Code::MappingsKillConnectionFailure);
        assert_eq!(err.category, ShardManagementErrorCategory::ListShardMap);

        let err = on_shard_map_error_global(StoreResult::ShardExists, &site);
        assert_eq!(err.code, Code::ShardAlreadyExists);
    }
}
