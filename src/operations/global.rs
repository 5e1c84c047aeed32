//! Operations against the global store only

use super::engine::StoreOperation;
use super::OperationContext;
use crate::cache::CacheStore;
use crate::errors::handler::ErrorSite;
use crate::errors::{Result, ShardManagementError, ShardManagementErrorCategory, ShardManagementErrorCode};
use crate::store::{
    ShardLocation, StoreConnectionKind, StoreError, StoreMapping, StoreRequest, StoreResult, StoreResults,
    StoreShardMap, StoreTransactionScope, StoreTransactionScopeKind,
};

/// A unit of work confined to the global store.
pub trait GlobalOperation {
    type Output;

    fn name(&self) -> &str;

    fn category(&self) -> ShardManagementErrorCategory;

    fn scope_kind(&self) -> StoreTransactionScopeKind {
        StoreTransactionScopeKind::ReadWrite
    }

    /// Run the store requests. The scope commits when the returned results
    /// are a success.
    fn execute(&self, scope: &mut dyn StoreTransactionScope) -> std::result::Result<StoreResults, StoreError>;

    /// Turn the final results into the operation's output or error.
    fn handle_results(&self, results: StoreResults) -> Result<Self::Output>;

    fn update_cache_pre(&self, _cache: &dyn CacheStore, _error: &ShardManagementError) {}

    fn update_cache_post(&self, _cache: &dyn CacheStore, _output: &Self::Output) {}
}

/// Run a global operation under the retry policy. A result reporting another
/// operation pending on a shard undoes that operation and tries again.
pub fn run_global<O: GlobalOperation>(ctx: &OperationContext, op: &O) -> Result<O::Output> {
    let mut pending_undone = 0;
    loop {
        let results = ctx.retry.execute(op.name(), || attempt(ctx, op));
        let results = match results {
            Ok(results) => results,
            Err(error) => {
                op.update_cache_pre(&*ctx.cache, &error);
                return Err(error);
            }
        };

        if results.result == StoreResult::ShardPendingOperation && pending_undone <= ctx.retry.retry_count() {
            if let Some(entry) = results.log_entries.first() {
                pending_undone += 1;
                log::warn!("{} found pending operation {}, undoing it", op.name(), entry.id);
                StoreOperation::from_log_entry(entry)?.undo(ctx, entry.undo_start_state)?;
                continue;
            }
        }

        return match op.handle_results(results) {
            Ok(output) => {
                op.update_cache_post(&*ctx.cache, &output);
                Ok(output)
            }
            Err(error) => {
                op.update_cache_pre(&*ctx.cache, &error);
                Err(error)
            }
        };
    }
}

fn attempt<O: GlobalOperation>(ctx: &OperationContext, op: &O) -> Result<StoreResults> {
    let location = ctx.global_location();
    let wrap = |e| ShardManagementError::from_store_error(op.category(), op.name(), e).with_location(location.clone());
    let mut connection = ctx.connect(StoreConnectionKind::Global, location, None, op.category(), op.name())?;
    let results = {
        let mut scope = connection.get_transaction_scope(op.scope_kind()).map_err(wrap)?;
        let results = op.execute(&mut *scope).map_err(wrap)?;
        if results.is_success() {
            scope.set_success(true);
        }
        results
    };
    connection.close();
    Ok(results)
}

/// Handler used to translate a failing result.
pub type ResultHandler<'a> = &'a dyn Fn(StoreResult, &ErrorSite<'_>) -> ShardManagementError;

/// A sequence of global requests run in one transaction. Execution stops at
/// the first result that is not a success.
pub struct GlobalRequest<'a> {
    pub name: &'a str,
    pub category: ShardManagementErrorCategory,
    pub requests: Vec<StoreRequest>,
    pub scope_kind: StoreTransactionScopeKind,
    pub handler: ResultHandler<'a>,
    pub shard_map: Option<&'a StoreShardMap>,
    pub location: Option<&'a ShardLocation>,
    /// Results the caller treats as an outcome rather than an error.
    pub accepted: &'a [StoreResult],
    /// Mapping to evict when the store says it no longer exists.
    pub evict_mapping: Option<&'a StoreMapping>,
}

impl<'a> GlobalRequest<'a> {
    pub fn new(
        name: &'a str,
        category: ShardManagementErrorCategory,
        request: StoreRequest,
        handler: ResultHandler<'a>,
    ) -> Self {
        Self {
            name,
            category,
            requests: vec![request],
            scope_kind: StoreTransactionScopeKind::ReadWrite,
            handler,
            shard_map: None,
            location: None,
            accepted: &[],
            evict_mapping: None,
        }
    }

    pub fn then(mut self, request: StoreRequest) -> Self {
        self.requests.push(request);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.scope_kind = StoreTransactionScopeKind::ReadOnly;
        self
    }

    pub fn shard_map(mut self, shard_map: &'a StoreShardMap) -> Self {
        self.shard_map = Some(shard_map);
        self
    }

    pub fn location(mut self, location: &'a ShardLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn accepting(mut self, accepted: &'a [StoreResult]) -> Self {
        self.accepted = accepted;
        self
    }

    pub fn evicting(mut self, mapping: &'a StoreMapping) -> Self {
        self.evict_mapping = Some(mapping);
        self
    }

    fn site(&self) -> ErrorSite<'_> {
        let mut site = ErrorSite::new(self.category, self.name);
        if let Some(shard_map) = self.shard_map {
            site = site.shard_map(shard_map);
        }
        if let Some(location) = self.location {
            site = site.location(location);
        }
        site
    }
}

impl GlobalOperation for GlobalRequest<'_> {
    type Output = StoreResults;

    fn name(&self) -> &str {
        self.name
    }

    fn category(&self) -> ShardManagementErrorCategory {
        self.category
    }

    fn scope_kind(&self) -> StoreTransactionScopeKind {
        self.scope_kind
    }

    fn execute(&self, scope: &mut dyn StoreTransactionScope) -> std::result::Result<StoreResults, StoreError> {
        let mut last = StoreResults::success();
        for request in &self.requests {
            last = scope.execute_operation(request)?;
            if !last.is_success() {
                break;
            }
        }
        Ok(last)
    }

    fn handle_results(&self, results: StoreResults) -> Result<StoreResults> {
        if results.is_success() || self.accepted.contains(&results.result) {
            Ok(results)
        } else {
            Err((self.handler)(results.result, &self.site()))
        }
    }

    fn update_cache_pre(&self, cache: &dyn CacheStore, error: &ShardManagementError) {
        match error.code {
            ShardManagementErrorCode::ShardMapDoesNotExist => {
                if let Some(shard_map) = self.shard_map {
                    cache.delete_shard_map(shard_map);
                }
            }
            ShardManagementErrorCode::MappingDoesNotExist => {
                if let Some(mapping) = self.evict_mapping {
                    cache.delete_mapping(mapping);
                }
            }
            _ => {}
        }
    }
}
