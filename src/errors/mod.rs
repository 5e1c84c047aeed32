//! Error taxonomy for shard management
//!
//! Logical store outcomes are translated into a [`ShardManagementError`] at the
//! point where they occur; infrastructure failures travel as
//! [`StoreError`](crate::store::StoreError) until the retry policy gives up.

pub mod handler;

use std::fmt;

use thiserror::Error;

use crate::store::{ShardLocation, StoreError};

pub type Result<T> = std::result::Result<T, ShardManagementError>;

/// Area of the API that raised an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShardManagementErrorCategory {
    Validation,
    ShardMapManagerFactory,
    ShardMapManager,
    ShardMap,
    ListShardMap,
    RangeShardMap,
    SchemaInfoCollection,
    Recovery,
    General,
}

/// Specific error condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShardManagementErrorCode {
    // Store manager deployment
    ShardMapManagerStoreAlreadyExists,
    ShardMapManagerStoreDoesNotExist,
    GlobalStoreVersionMismatch,
    LocalStoreVersionMismatch,

    // Existence conflicts
    ShardMapAlreadyExists,
    ShardMapDoesNotExist,
    ShardMapTypeConversionError,
    ShardAlreadyExists,
    ShardLocationAlreadyExists,
    ShardDoesNotExist,
    MappingDoesNotExist,
    MappingRangeAlreadyMapped,
    MappingPointAlreadyMapped,
    MappingNotFoundForKey,
    SchemaInfoNameConflict,
    SchemaInfoNameDoesNotExist,

    // Concurrency conflicts
    ShardVersionMismatch,
    ShardPendingOperation,
    MappingIsAlreadyLocked,
    MappingLockOwnerIdDoesNotMatch,

    // Structural
    ShardMapHasShards,
    ShardHasMappings,
    MappingIsNotOffline,
    MappingIsOffline,
    MappingsKillConnectionFailure,

    // Infrastructure
    StorageOperationFailure,
    StoredProcedureParameterMissing,
    RetryLimitExceeded,
    UnexpectedError,

    // Recovery
    ShardNotValid,
    RecoveryTokenNotFound,
    MappingDifferenceNotFound,

    InvalidArgument,
}

impl ShardManagementErrorCode {
    /// Conflicts that a caller may clear by retrying after backoff.
    pub fn is_concurrency_conflict(self) -> bool {
        matches!(
            self,
            ShardManagementErrorCode::ShardVersionMismatch
                | ShardManagementErrorCode::ShardPendingOperation
                | ShardManagementErrorCode::MappingIsAlreadyLocked
                | ShardManagementErrorCode::MappingLockOwnerIdDoesNotMatch
        )
    }
}

/// Identifiers describing where an error happened.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub operation: Option<String>,
    pub shard_map_name: Option<String>,
    pub location: Option<ShardLocation>,
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(op) = &self.operation {
            parts.push(format!("operation={}", op));
        }
        if let Some(name) = &self.shard_map_name {
            parts.push(format!("shard_map={}", name));
        }
        if let Some(location) = &self.location {
            parts.push(format!("location={}", location));
        }
        write!(f, "{}", parts.join(", "))
    }
}

/// Domain failure raised by shard management operations.
#[derive(Error, Debug)]
#[error("{category:?}/{code:?}: {message}{}", format_suffix(.context, .undo_failure))]
pub struct ShardManagementError {
    pub category: ShardManagementErrorCategory,
    pub code: ShardManagementErrorCode,
    pub message: String,
    pub context: ErrorContext,
    #[source]
    pub source: Option<StoreError>,
    /// Set when undoing a partially applied operation also failed.
    pub undo_failure: Option<Box<ShardManagementError>>,
}

fn format_suffix(context: &ErrorContext, undo: &Option<Box<ShardManagementError>>) -> String {
    let mut suffix = String::new();
    let ctx = context.to_string();
    if !ctx.is_empty() {
        suffix.push_str(&format!(" ({})", ctx));
    }
    if let Some(undo) = undo {
        suffix.push_str(&format!("; undo failed: {}", undo));
    }
    suffix
}

impl ShardManagementError {
    pub fn new(
        category: ShardManagementErrorCategory,
        code: ShardManagementErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code,
            message: message.into(),
            context: ErrorContext::default(),
            source: None,
            undo_failure: None,
        }
    }

    pub fn invalid_argument(category: ShardManagementErrorCategory, message: impl Into<String>) -> Self {
        Self::new(category, ShardManagementErrorCode::InvalidArgument, message)
    }

    /// Wrap an infrastructure failure that was not (or no longer) retried.
    pub fn from_store_error(
        category: ShardManagementErrorCategory,
        operation: &str,
        error: StoreError,
    ) -> Self {
        Self::new(
            category,
            ShardManagementErrorCode::StorageOperationFailure,
            format!("store operation failed: {}", error),
        )
        .with_operation(operation)
        .with_source(error)
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.context.operation = Some(operation.into());
        self
    }

    pub fn with_shard_map(mut self, name: impl Into<String>) -> Self {
        self.context.shard_map_name = Some(name.into());
        self
    }

    pub fn with_location(mut self, location: ShardLocation) -> Self {
        self.context.location = Some(location);
        self
    }

    pub fn with_source(mut self, source: StoreError) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_undo_failure(mut self, undo: ShardManagementError) -> Self {
        self.undo_failure = Some(Box::new(undo));
        self
    }

    /// True when the underlying cause is a store failure the transient
    /// detector would retry.
    pub fn is_transient(&self) -> bool {
        self.source.as_ref().map_or(false, StoreError::is_transient)
            && self.code == ShardManagementErrorCode::StorageOperationFailure
    }

    /// The store may hold a partially applied operation that needs an explicit
    /// recovery pass.
    pub fn requires_manual_recovery(&self) -> bool {
        self.undo_failure.is_some()
    }
}

/// A batch operation in which some items failed.
#[derive(Error, Debug)]
#[error("{} of {attempted} items failed: {}", errors.len(), summarize(.errors))]
pub struct ShardManagementAggregateError {
    pub attempted: usize,
    pub errors: Vec<ShardManagementError>,
}

fn summarize(errors: &[ShardManagementError]) -> String {
    errors
        .iter()
        .map(|e| format!("{:?}", e.code))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ShardLocation;

    #[test]
    fn test_display_includes_context() {
        let err = ShardManagementError::new(
            ShardManagementErrorCategory::RangeShardMap,
            ShardManagementErrorCode::MappingRangeAlreadyMapped,
            "range [0, 10) is already mapped",
        )
        .with_operation("AddRangeMapping")
        .with_shard_map("customers")
        .with_location(ShardLocation::new("srv", "db1"));

        let text = err.to_string();
        assert!(text.contains("MappingRangeAlreadyMapped"));
        assert!(text.contains("shard_map=customers"));
        assert!(text.contains("operation=AddRangeMapping"));
        assert!(text.contains("srv/db1"));
    }

    #[test]
    fn test_transient_follows_source() {
        let err = ShardManagementError::from_store_error(
            ShardManagementErrorCategory::ShardMap,
            "AddShard",
            StoreError::Transient("deadlock victim".into()),
        );
        assert!(err.is_transient());

        let err = ShardManagementError::from_store_error(
            ShardManagementErrorCategory::ShardMap,
            "AddShard",
            StoreError::NotDeployed("gsm".into()),
        );
        assert!(!err.is_transient());
    }

    #[test]
    fn test_undo_failure_marks_manual_recovery() {
        let undo = ShardManagementError::new(
            ShardManagementErrorCategory::ShardMap,
            ShardManagementErrorCode::ShardVersionMismatch,
            "version moved",
        );
        let err = ShardManagementError::new(
            ShardManagementErrorCategory::ShardMap,
            ShardManagementErrorCode::StorageOperationFailure,
            "local step failed",
        )
        .with_undo_failure(undo);
        assert!(err.requires_manual_recovery());
        assert!(err.to_string().contains("undo failed"));
    }

    #[test]
    fn test_aggregate_summary() {
        let agg = ShardManagementAggregateError {
            attempted: 3,
            errors: vec![ShardManagementError::new(
                ShardManagementErrorCategory::Recovery,
                ShardManagementErrorCode::ShardNotValid,
                "not deployed",
            )],
        };
        assert_eq!(agg.to_string(), "1 of 3 items failed: ShardNotValid");
    }
}
