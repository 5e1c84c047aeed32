//! Connection and transaction-scope traits

use uuid::Uuid;

use super::request::{StoreCommand, StoreRequest};
use super::result::StoreResults;
use super::types::ShardLocation;
use super::StoreError;

/// Role a connection plays in an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreConnectionKind {
    Global,
    LocalSource,
    LocalTarget,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreTransactionScopeKind {
    NonTransactional,
    ReadOnly,
    ReadWrite,
}

/// Hands out connections to the global store and to shards.
pub trait StoreConnectionFactory: Send + Sync {
    fn get_connection(
        &self,
        kind: StoreConnectionKind,
        location: &ShardLocation,
    ) -> Result<Box<dyn StoreConnection>, StoreError>;
}

/// A single connection to a store database.
pub trait StoreConnection: Send {
    fn kind(&self) -> StoreConnectionKind;

    fn location(&self) -> &ShardLocation;

    fn open(&mut self) -> Result<(), StoreError>;

    /// Open and acquire the application lock `lock_id`, held until `close`.
    fn open_with_lock(&mut self, lock_id: Uuid) -> Result<(), StoreError>;

    /// Release any held lock and close. Safe to call more than once.
    fn close(&mut self);

    fn get_transaction_scope(
        &mut self,
        kind: StoreTransactionScopeKind,
    ) -> Result<Box<dyn StoreTransactionScope + '_>, StoreError>;
}

/// Unit of work against one store. Dropping the scope commits if
/// `set_success(true)` was called and rolls back otherwise.
pub trait StoreTransactionScope {
    fn kind(&self) -> StoreTransactionScopeKind;

    fn set_success(&mut self, success: bool);

    fn execute_operation(&mut self, request: &StoreRequest) -> Result<StoreResults, StoreError>;

    fn execute_command_batch(&mut self, commands: &[StoreCommand]) -> Result<(), StoreError>;
}
