//! Operations against a single shard's local store

use super::global::ResultHandler;
use super::OperationContext;
use crate::cache::CacheStore;
use crate::errors::handler::ErrorSite;
use crate::errors::{Result, ShardManagementError, ShardManagementErrorCategory};
use crate::store::{
    ShardLocation, StoreConnectionKind, StoreError, StoreRequest, StoreResult, StoreResults, StoreShardMap,
    StoreTransactionScope, StoreTransactionScopeKind,
};

/// A unit of work confined to one local store.
pub trait LocalOperation {
    type Output;

    fn name(&self) -> &str;

    fn category(&self) -> ShardManagementErrorCategory;

    fn location(&self) -> &ShardLocation;

    fn scope_kind(&self) -> StoreTransactionScopeKind {
        StoreTransactionScopeKind::ReadOnly
    }

    fn execute(&self, scope: &mut dyn StoreTransactionScope) -> std::result::Result<StoreResults, StoreError>;

    fn handle_results(&self, results: StoreResults) -> Result<Self::Output>;

    fn update_cache_pre(&self, _cache: &dyn CacheStore, _error: &ShardManagementError) {}
}

/// Run a local operation under the retry policy.
pub fn run_local<O: LocalOperation>(ctx: &OperationContext, op: &O) -> Result<O::Output> {
    let results = ctx.retry.execute(op.name(), || attempt(ctx, op));
    match results.and_then(|results| op.handle_results(results)) {
        Ok(output) => Ok(output),
        Err(error) => {
            op.update_cache_pre(&*ctx.cache, &error);
            Err(error)
        }
    }
}

fn attempt<O: LocalOperation>(ctx: &OperationContext, op: &O) -> Result<StoreResults> {
    let location = op.location();
    let wrap = |e| ShardManagementError::from_store_error(op.category(), op.name(), e).with_location(location.clone());
    let mut connection = ctx.connect(StoreConnectionKind::LocalSource, location, None, op.category(), op.name())?;
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

/// A sequence of local requests run in one transaction, stopping at the
/// first result that is not a success.
pub struct LocalRequest<'a> {
    pub name: &'a str,
    pub category: ShardManagementErrorCategory,
    pub location: &'a ShardLocation,
    pub requests: Vec<StoreRequest>,
    pub scope_kind: StoreTransactionScopeKind,
    pub handler: ResultHandler<'a>,
    pub shard_map: Option<&'a StoreShardMap>,
    pub accepted: &'a [StoreResult],
}

impl<'a> LocalRequest<'a> {
    pub fn new(
        name: &'a str,
        category: ShardManagementErrorCategory,
        location: &'a ShardLocation,
        request: StoreRequest,
        handler: ResultHandler<'a>,
    ) -> Self {
        Self {
            name,
            category,
            location,
            requests: vec![request],
            scope_kind: StoreTransactionScopeKind::ReadOnly,
            handler,
            shard_map: None,
            accepted: &[],
        }
    }

    pub fn read_write(mut self) -> Self {
        self.scope_kind = StoreTransactionScopeKind::ReadWrite;
        self
    }

    pub fn shard_map(mut self, shard_map: &'a StoreShardMap) -> Self {
        self.shard_map = Some(shard_map);
        self
    }

    pub fn accepting(mut self, accepted: &'a [StoreResult]) -> Self {
        self.accepted = accepted;
        self
    }

    fn site(&self) -> ErrorSite<'_> {
        let site = ErrorSite::new(self.category, self.name).location(self.location);
        match self.shard_map {
            Some(shard_map) => site.shard_map(shard_map),
            None => site,
        }
    }
}

impl LocalOperation for LocalRequest<'_> {
    type Output = StoreResults;

    fn name(&self) -> &str {
        self.name
    }

    fn category(&self) -> ShardManagementErrorCategory {
        self.category
    }

    fn location(&self) -> &ShardLocation {
        self.location
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
}
