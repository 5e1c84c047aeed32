//! Logged multi-store operation engine
//!
//! A logged operation runs four steps in order, each in its own transaction:
//!
//! 1. global pre-local: record the intent in the operation log
//! 2. local source: apply the change to the source shard's local store
//! 3. local target: apply the change to the target shard's local store
//! 4. global post-local: apply the change to the global store and drop the log
//!    entry
//!
//! Every step is idempotent, so an attempt that fails with a transient error is
//! simply replayed from the start. If the operation fails for good after the
//! log entry was written, it is undone in reverse order starting from the
//! furthest step reached. The undo start state is persisted in the log entry
//! first so that a later undo, from this or another process, resumes in the
//! same place.

use uuid::Uuid;

use super::payload::OperationPayload;
use super::state::{OperationCode, StoreOperationState};
use super::OperationContext;
use crate::cache::CacheStore;
use crate::errors::handler::ErrorSite;
use crate::errors::{Result, ShardManagementError, ShardManagementErrorCategory, ShardManagementErrorCode};
use crate::store::request::new_log_entry;
use crate::store::{
    GlobalChange, ShardLocation, StoreCommand, StoreConnection, StoreConnectionKind, StoreError,
    StoreLogEntry, StoreRequest, StoreResult, StoreShardMap, StoreTransactionScope, StoreTransactionScopeKind,
};

/// One unit of work inside a local-store step.
#[derive(Clone, Debug, PartialEq)]
pub enum LocalStep {
    /// Deploy the local store schema if the database has none yet.
    EnsureDeployed,
    Request(StoreRequest),
    /// Run the request only when the local store is deployed.
    IfDeployed(StoreRequest),
}

/// What a logged operation does at each step.
pub trait StoreOperationSteps {
    fn shard_map(&self) -> &StoreShardMap;

    fn category(&self) -> ShardManagementErrorCategory;

    /// Shard losing mappings (or being removed or updated).
    fn shard_id_removes(&self) -> Option<Uuid> {
        None
    }

    /// Shard gaining mappings (or being added or updated).
    fn shard_id_adds(&self) -> Option<Uuid> {
        None
    }

    fn global_change(&self) -> GlobalChange;

    fn source_location(&self) -> Option<&ShardLocation>;

    fn target_location(&self) -> Option<&ShardLocation> {
        None
    }

    fn local_source_do(&self, operation_id: Uuid) -> Vec<LocalStep>;

    /// Reverse the source step. `entry` carries the original shard versions
    /// recorded when the operation began.
    fn local_source_undo(&self, operation_id: Uuid, entry: &StoreLogEntry) -> Vec<LocalStep>;

    fn local_target_do(&self, _operation_id: Uuid) -> Vec<LocalStep> {
        Vec::new()
    }

    fn local_target_undo(&self, _operation_id: Uuid, _entry: &StoreLogEntry) -> Vec<LocalStep> {
        Vec::new()
    }

    fn on_global_error(&self, result: StoreResult, site: &ErrorSite<'_>) -> ShardManagementError;

    fn on_local_error(&self, result: StoreResult, site: &ErrorSite<'_>) -> ShardManagementError;

    /// Evict cache entries the failure shows to be stale.
    fn update_cache_pre(&self, cache: &dyn CacheStore, error: &ShardManagementError) {
        if error.code == ShardManagementErrorCode::ShardMapDoesNotExist {
            cache.delete_shard_map(self.shard_map());
        }
    }

    /// Reflect the committed change in the cache.
    fn update_cache_post(&self, _cache: &dyn CacheStore) {}
}

enum DoOutcome {
    Completed,
    /// Another operation holds one of our shards; carries its log entry.
    Pending(StoreLogEntry),
}

struct Progress {
    current: StoreOperationState,
    max_do: StoreOperationState,
}

impl Progress {
    fn new(start: StoreOperationState) -> Self {
        Self {
            current: start,
            max_do: StoreOperationState::DoBegin,
        }
    }

    fn enter(&mut self, state: StoreOperationState) {
        self.current = state;
        if !state.is_undo() && state > self.max_do {
            self.max_do = state;
        }
    }
}

/// A logged operation ready to run.
#[derive(Clone, Debug)]
pub struct StoreOperation {
    id: Uuid,
    code: OperationCode,
    payload: OperationPayload,
}

impl StoreOperation {
    pub fn new(code: OperationCode, payload: OperationPayload) -> Self {
        debug_assert!(payload.accepts(code), "{:?} does not fit the payload", code);
        Self {
            id: Uuid::new_v4(),
            code,
            payload,
        }
    }

    /// Rebuild an operation from its log entry.
    pub fn from_log_entry(entry: &StoreLogEntry) -> Result<Self> {
        Ok(Self {
            id: entry.id,
            code: entry.operation_code,
            payload: OperationPayload::from_log_entry(entry)?,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn code(&self) -> OperationCode {
        self.code
    }

    pub fn payload(&self) -> &OperationPayload {
        &self.payload
    }

    fn steps(&self) -> &dyn StoreOperationSteps {
        self.payload.steps()
    }

    fn name(&self) -> &'static str {
        self.code.name()
    }

    /// Run the operation to completion, undoing it on failure.
    pub fn execute(&self, ctx: &OperationContext) -> Result<()> {
        let steps = self.steps();
        let mut pending_undone = 0;
        loop {
            let mut progress = Progress::new(StoreOperationState::DoBegin);
            let outcome = ctx
                .retry
                .execute(self.name(), || self.do_attempt(ctx, &mut progress));

            match outcome {
                Ok(DoOutcome::Completed) => {
                    steps.update_cache_post(&*ctx.cache);
                    log::info!("{} {} completed on shard map '{}'", self.name(), self.id, steps.shard_map().name);
                    return Ok(());
                }
                Ok(DoOutcome::Pending(entry)) => {
                    if pending_undone > ctx.retry.retry_count() {
                        return Err(steps.on_global_error(StoreResult::ShardPendingOperation, &self.global_site()));
                    }
                    pending_undone += 1;
                    log::warn!(
                        "{} {} found pending {} {}, undoing it first",
                        self.name(),
                        self.id,
                        entry.operation_code.name(),
                        entry.id
                    );
                    let pending = StoreOperation::from_log_entry(&entry)?;
                    pending.undo(ctx, entry.undo_start_state)?;
                }
                Err(error) => {
                    steps.update_cache_pre(&*ctx.cache, &error);
                    let Some(start) = StoreOperationState::undo_start_for(progress.max_do) else {
                        return Err(error);
                    };
                    log::warn!(
                        "{} {} failed after reaching {:?}, undoing from {:?}: {}",
                        self.name(),
                        self.id,
                        progress.max_do,
                        start,
                        error
                    );
                    return match self.undo(ctx, start) {
                        Ok(()) => Err(error),
                        Err(undo_error) => {
                            log::error!("undo of {} {} failed: {}", self.name(), self.id, undo_error);
                            Err(error.with_undo_failure(undo_error))
                        }
                    };
                }
            }
        }
    }

    /// Revert whatever part of the operation was applied, starting at `start`.
    /// Succeeds without doing anything when the log entry is already gone.
    pub fn undo(&self, ctx: &OperationContext, start: StoreOperationState) -> Result<()> {
        let operation = format!("Undo{}", self.name());
        let mut progress = Progress::new(StoreOperationState::UndoBegin);
        ctx.retry
            .execute(&operation, || self.undo_attempt(ctx, start, &mut progress))
            .map_err(|e| {
                log::debug!("undo of {} stopped at {:?}", self.id, progress.current);
                e
            })
    }

    fn do_attempt(&self, ctx: &OperationContext, progress: &mut Progress) -> Result<DoOutcome> {
        use StoreOperationState::*;
        let steps = self.steps();
        // A failure at or after End may hide a commit; the log entry is then
        // gone and Begin would validate the change against its own result.
        let resume_at_end = progress.max_do >= DoGlobalPostLocalExecute;

        progress.enter(DoGlobalConnect);
        let mut global = self.connect(ctx, StoreConnectionKind::Global, ctx.global_location())?;

        if resume_at_end {
            log::debug!("{} {} resuming at the global post-local step", self.name(), self.id);
        } else {
            if let Some(pending) = self.pre_local(&mut *global, progress)? {
                return Ok(DoOutcome::Pending(pending));
            }
            self.apply_locally(ctx, progress)?;
        }

        progress.enter(DoGlobalPostLocalBeginTransaction);
        {
            let mut scope = self.scope(&mut *global, None)?;
            progress.enter(DoGlobalPostLocalExecute);
            let request = StoreRequest::EndOperationGlobal {
                operation_id: self.id,
                shard_map: steps.shard_map().clone(),
                change: steps.global_change(),
                undo: false,
            };
            let results = scope
                .execute_operation(&request)
                .map_err(|e| self.store_error(e, None))?;
            if !results.is_success() {
                return Err(steps.on_global_error(results.result, &self.global_site()));
            }
            progress.enter(DoGlobalPostLocalCommitTransaction);
            scope.set_success(true);
        }

        progress.enter(DoEnd);
        global.close();
        Ok(DoOutcome::Completed)
    }

    /// Write the log entry. Returns the blocking entry when another operation
    /// holds one of our shards.
    fn pre_local(&self, global: &mut dyn StoreConnection, progress: &mut Progress) -> Result<Option<StoreLogEntry>> {
        use StoreOperationState::*;
        let steps = self.steps();

        progress.enter(DoGlobalPreLocalBeginTransaction);
        let mut scope = self.scope(global, None)?;
        progress.enter(DoGlobalPreLocalExecute);
        let request = StoreRequest::BeginOperationGlobal {
            entry: self.new_log_entry()?,
            shard_map: steps.shard_map().clone(),
            change: steps.global_change(),
        };
        let results = scope
            .execute_operation(&request)
            .map_err(|e| self.store_error(e, None))?;
        match results.result {
            StoreResult::Success => {}
            StoreResult::ShardPendingOperation => {
                return match results.log_entries.into_iter().next() {
                    Some(pending) => Ok(Some(pending)),
                    None => Err(steps.on_global_error(StoreResult::ShardPendingOperation, &self.global_site())),
                };
            }
            other => return Err(steps.on_global_error(other, &self.global_site())),
        }
        progress.enter(DoGlobalPreLocalCommitTransaction);
        scope.set_success(true);
        Ok(None)
    }

    fn apply_locally(&self, ctx: &OperationContext, progress: &mut Progress) -> Result<()> {
        use StoreOperationState::*;
        let steps = self.steps();

        if let Some(location) = steps.source_location() {
            progress.enter(DoLocalSourceConnect);
            let mut local = self.connect(ctx, StoreConnectionKind::LocalSource, location)?;
            progress.enter(DoLocalSourceBeginTransaction);
            self.run_local_steps(
                &mut *local,
                location,
                &steps.local_source_do(self.id),
                progress,
                (DoLocalSourceExecute, DoLocalSourceCommitTransaction),
            )?;
        }

        if let Some(location) = steps.target_location() {
            progress.enter(DoLocalTargetConnect);
            let mut local = self.connect(ctx, StoreConnectionKind::LocalTarget, location)?;
            progress.enter(DoLocalTargetBeginTransaction);
            self.run_local_steps(
                &mut *local,
                location,
                &steps.local_target_do(self.id),
                progress,
                (DoLocalTargetExecute, DoLocalTargetCommitTransaction),
            )?;
        }

        Ok(())
    }

    fn undo_attempt(&self, ctx: &OperationContext, start: StoreOperationState, progress: &mut Progress) -> Result<()> {
        use StoreOperationState::*;
        let steps = self.steps();

        progress.enter(UndoGlobalConnect);
        let mut global = self.connect(ctx, StoreConnectionKind::Global, ctx.global_location())?;

        progress.enter(UndoGlobalPreLocalBeginTransaction);
        let entry = {
            let mut scope = self.scope(&mut *global, None)?;
            progress.enter(UndoGlobalPreLocalExecute);
            let request = StoreRequest::FindAndUpdateOperationLogEntryByIdGlobal {
                operation_id: self.id,
                undo_start_state: start,
            };
            let results = scope
                .execute_operation(&request)
                .map_err(|e| self.store_error(e, None))?;
            if !results.is_success() {
                return Err(steps.on_global_error(results.result, &self.global_site()));
            }
            progress.enter(UndoGlobalPreLocalCommitTransaction);
            scope.set_success(true);
            results.log_entries.into_iter().next()
        };
        let Some(entry) = entry else {
            log::debug!("{} {} has no log entry, nothing to undo", self.name(), self.id);
            return Ok(());
        };

        if start <= UndoLocalTargetCommitTransaction {
            if let Some(location) = steps.target_location() {
                progress.enter(UndoLocalTargetConnect);
                let mut local = self.connect(ctx, StoreConnectionKind::LocalTarget, location)?;
                progress.enter(UndoLocalTargetBeginTransaction);
                self.run_local_steps(
                    &mut *local,
                    location,
                    &steps.local_target_undo(self.id, &entry),
                    progress,
                    (UndoLocalTargetExecute, UndoLocalTargetCommitTransaction),
                )?;
            }
        }

        if start <= UndoLocalSourceCommitTransaction {
            if let Some(location) = steps.source_location() {
                progress.enter(UndoLocalSourceConnect);
                let mut local = self.connect(ctx, StoreConnectionKind::LocalSource, location)?;
                progress.enter(UndoLocalSourceBeginTransaction);
                self.run_local_steps(
                    &mut *local,
                    location,
                    &steps.local_source_undo(self.id, &entry),
                    progress,
                    (UndoLocalSourceExecute, UndoLocalSourceCommitTransaction),
                )?;
            }
        }

        progress.enter(UndoGlobalPostLocalBeginTransaction);
        {
            let mut scope = self.scope(&mut *global, None)?;
            progress.enter(UndoGlobalPostLocalExecute);
            let request = StoreRequest::EndOperationGlobal {
                operation_id: self.id,
                shard_map: steps.shard_map().clone(),
                change: steps.global_change(),
                undo: true,
            };
            let results = scope
                .execute_operation(&request)
                .map_err(|e| self.store_error(e, None))?;
            if !results.is_success() {
                return Err(steps.on_global_error(results.result, &self.global_site()));
            }
            progress.enter(UndoGlobalPostLocalCommitTransaction);
            scope.set_success(true);
        }

        progress.enter(UndoEnd);
        global.close();
        log::info!("undid {} {} on shard map '{}'", self.name(), self.id, steps.shard_map().name);
        Ok(())
    }

    fn run_local_steps(
        &self,
        connection: &mut dyn StoreConnection,
        location: &ShardLocation,
        local_steps: &[LocalStep],
        progress: &mut Progress,
        (execute, commit): (StoreOperationState, StoreOperationState),
    ) -> Result<()> {
        let wrap = |e| self.store_error(e, Some(location));
        let mut scope = self.scope(connection, Some(location))?;
        progress.enter(execute);
        for step in local_steps {
            match step {
                LocalStep::EnsureDeployed => {
                    if !local_store_deployed(&mut *scope).map_err(wrap)? {
                        scope
                            .execute_command_batch(&[StoreCommand::DeployLocalStore])
                            .map_err(wrap)?;
                        log::info!("deployed local store at {}", location);
                    }
                }
                LocalStep::Request(request) => self.run_local_request(&mut *scope, request, location)?,
                LocalStep::IfDeployed(request) => {
                    if local_store_deployed(&mut *scope).map_err(wrap)? {
                        self.run_local_request(&mut *scope, request, location)?;
                    } else {
                        log::debug!("skipping {} at {}: no local store", request.name(), location);
                    }
                }
            }
        }
        progress.enter(commit);
        scope.set_success(true);
        Ok(())
    }

    fn run_local_request(
        &self,
        scope: &mut dyn StoreTransactionScope,
        request: &StoreRequest,
        location: &ShardLocation,
    ) -> Result<()> {
        let results = scope
            .execute_operation(request)
            .map_err(|e| self.store_error(e, Some(location)))?;
        if results.is_success() {
            Ok(())
        } else {
            let site = self.global_site().location(location);
            Err(self.steps().on_local_error(results.result, &site))
        }
    }

    fn connect(
        &self,
        ctx: &OperationContext,
        kind: StoreConnectionKind,
        location: &ShardLocation,
    ) -> Result<Box<dyn StoreConnection>> {
        ctx.connect(kind, location, Some(self.id), self.steps().category(), self.name())
            .map_err(|e| e.with_shard_map(self.steps().shard_map().name.clone()))
    }

    fn scope<'c>(
        &self,
        connection: &'c mut dyn StoreConnection,
        location: Option<&ShardLocation>,
    ) -> Result<Box<dyn StoreTransactionScope + 'c>> {
        connection
            .get_transaction_scope(StoreTransactionScopeKind::ReadWrite)
            .map_err(|e| self.store_error(e, location))
    }

    fn new_log_entry(&self) -> Result<StoreLogEntry> {
        let steps = self.steps();
        Ok(new_log_entry(
            self.id,
            self.code,
            self.payload.to_bytes()?,
            steps.shard_id_removes(),
            steps.shard_id_adds(),
        ))
    }

    fn global_site(&self) -> ErrorSite<'_> {
        let steps = self.steps();
        let site = ErrorSite::new(steps.category(), self.name()).shard_map(steps.shard_map());
        match steps.source_location() {
            Some(location) => site.location(location),
            None => site,
        }
    }

    fn store_error(&self, error: StoreError, location: Option<&ShardLocation>) -> ShardManagementError {
        let steps = self.steps();
        let err = ShardManagementError::from_store_error(steps.category(), self.name(), error)
            .with_shard_map(steps.shard_map().name.clone());
        match location {
            Some(location) => err.with_location(location.clone()),
            None => err,
        }
    }
}

fn local_store_deployed(scope: &mut dyn StoreTransactionScope) -> std::result::Result<bool, StoreError> {
    Ok(scope.execute_operation(&StoreRequest::GetStoreVersionLocal)?.version.is_some())
}
