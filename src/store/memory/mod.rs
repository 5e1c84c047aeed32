//! In-memory store backend
//!
//! Holds any number of databases keyed by [`ShardLocation`]. A database may
//! carry global store structures, local store structures, or both. Transaction
//! scopes work on a private copy of the database state and swap it in on
//! commit, so an abandoned scope leaves nothing behind. A scope locks its
//! database until it is dropped, so callers must not nest scopes on one
//! database.
//!
//! Databases can be saved to a directory as `{n}.json` files and loaded back.

mod global;
mod local;

pub use global::{GlobalState, MappingRow};
pub use local::LocalState;

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::connection::{
    StoreConnection, StoreConnectionFactory, StoreConnectionKind, StoreTransactionScope,
    StoreTransactionScopeKind,
};
use super::request::{StoreCommand, StoreRequest, StoreTarget};
use super::result::{StoreResult, StoreResults};
use super::types::{ShardLocation, GLOBAL_STORE_VERSION, LOCAL_STORE_VERSION};
use super::StoreError;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Contents of one database.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct DatabaseState {
    pub global: Option<GlobalState>,
    pub local: Option<LocalState>,
}

/// What an injected fault does when it fires.
#[derive(Clone, Debug, PartialEq)]
pub enum FaultOutcome {
    /// Fail before the request runs.
    Error(StoreError),
    /// Return this logical result instead of running the request.
    Result(StoreResult),
    /// Run and commit the request, then report the error as if the
    /// acknowledgement was lost.
    ErrorAfterCommit(StoreError),
}

/// Make a named request fail a number of times.
#[derive(Clone, Debug, PartialEq)]
pub struct FaultInjection {
    /// `None` matches every database.
    pub location: Option<ShardLocation>,
    pub request: String,
    pub times: usize,
    pub outcome: FaultOutcome,
}

impl FaultInjection {
    pub fn new(request: impl Into<String>, outcome: FaultOutcome) -> Self {
        Self {
            location: None,
            request: request.into(),
            times: 1,
            outcome,
        }
    }

    pub fn at(mut self, location: ShardLocation) -> Self {
        self.location = Some(location);
        self
    }

    pub fn times(mut self, times: usize) -> Self {
        self.times = times;
        self
    }
}

struct MemoryDatabase {
    state: Mutex<DatabaseState>,
    held_locks: Mutex<HashSet<Uuid>>,
    lock_released: Condvar,
}

impl MemoryDatabase {
    fn new(state: DatabaseState) -> Self {
        Self {
            state: Mutex::new(state),
            held_locks: Mutex::new(HashSet::new()),
            lock_released: Condvar::new(),
        }
    }

    fn acquire_lock(&self, lock_id: Uuid, timeout: Duration) -> Result<(), StoreError> {
        let deadline = Instant::now() + timeout;
        let mut held = lock_or_recover(&self.held_locks);
        while held.contains(&lock_id) {
            let now = Instant::now();
            if now >= deadline {
                return Err(StoreError::LockTimeout(lock_id));
            }
            held = match self.lock_released.wait_timeout(held, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        held.insert(lock_id);
        Ok(())
    }

    fn release_lock(&self, lock_id: Uuid) {
        lock_or_recover(&self.held_locks).remove(&lock_id);
        self.lock_released.notify_all();
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct MemoryStoreInner {
    databases: Mutex<HashMap<ShardLocation, Arc<MemoryDatabase>>>,
    faults: Mutex<Vec<FaultInjection>>,
    lock_timeout: Duration,
}

impl MemoryStoreInner {
    fn database(&self, location: &ShardLocation) -> Option<Arc<MemoryDatabase>> {
        lock_or_recover(&self.databases).get(location).cloned()
    }

    /// Consume one firing of the first fault matching this request.
    fn take_fault(&self, location: &ShardLocation, request: &str) -> Option<FaultOutcome> {
        let mut faults = lock_or_recover(&self.faults);
        let index = faults.iter().position(|f| {
            f.request == request && f.times > 0 && f.location.as_ref().map_or(true, |l| l == location)
        })?;
        let fault = &mut faults[index];
        fault.times -= 1;
        let outcome = fault.outcome.clone();
        if fault.times == 0 {
            faults.remove(index);
        }
        Some(outcome)
    }
}

/// Shared handle to an in-memory multi-database store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryStoreInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(MemoryStoreInner {
                databases: Mutex::new(HashMap::new()),
                faults: Mutex::new(Vec::new()),
                lock_timeout,
            }),
        }
    }

    /// Create an empty database. Existing databases are left untouched.
    pub fn create_database(&self, location: &ShardLocation) {
        lock_or_recover(&self.inner.databases)
            .entry(location.clone())
            .or_insert_with(|| Arc::new(MemoryDatabase::new(DatabaseState::default())));
    }

    pub fn drop_database(&self, location: &ShardLocation) -> bool {
        lock_or_recover(&self.inner.databases).remove(location).is_some()
    }

    pub fn has_database(&self, location: &ShardLocation) -> bool {
        lock_or_recover(&self.inner.databases).contains_key(location)
    }

    pub fn locations(&self) -> Vec<ShardLocation> {
        let mut locations: Vec<_> = lock_or_recover(&self.inner.databases).keys().cloned().collect();
        locations.sort();
        locations
    }

    pub fn connection_factory(&self) -> MemoryStoreConnectionFactory {
        MemoryStoreConnectionFactory {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn inject_fault(&self, fault: FaultInjection) {
        lock_or_recover(&self.inner.faults).push(fault);
    }

    pub fn clear_faults(&self) {
        lock_or_recover(&self.inner.faults).clear();
    }

    /// Number of fault firings still pending.
    pub fn pending_faults(&self) -> usize {
        lock_or_recover(&self.inner.faults).iter().map(|f| f.times).sum()
    }

    /// Copy of a database's committed state.
    pub fn snapshot(&self, location: &ShardLocation) -> Option<DatabaseState> {
        let db = self.inner.database(location)?;
        let state = lock_or_recover(&db.state).clone();
        Some(state)
    }

    pub fn global_state(&self, location: &ShardLocation) -> Option<GlobalState> {
        self.snapshot(location).and_then(|s| s.global)
    }

    pub fn local_state(&self, location: &ShardLocation) -> Option<LocalState> {
        self.snapshot(location).and_then(|s| s.local)
    }

    /// Edit a database's committed state directly, bypassing the request
    /// layer. Returns `None` if the database does not exist.
    pub fn modify<R>(&self, location: &ShardLocation, f: impl FnOnce(&mut DatabaseState) -> R) -> Option<R> {
        let db = self.inner.database(location)?;
        let mut state = lock_or_recover(&db.state);
        Some(f(&mut state))
    }

    /// Write every database to `dir` as a numbered JSON file.
    pub fn save_to_dir(&self, dir: &Path) -> Result<(), StoreError> {
        std::fs::create_dir_all(dir)?;
        for (n, location) in self.locations().into_iter().enumerate() {
            let Some(state) = self.snapshot(&location) else {
                continue;
            };
            let saved = SavedDatabase { location, state };
            let json = serde_json::to_string_pretty(&saved)?;
            std::fs::write(dir.join(format!("{}.json", n)), json)?;
        }
        Ok(())
    }

    /// Load every `*.json` database file in `dir` into a new store.
    pub fn load_from_dir(dir: &Path) -> Result<Self, StoreError> {
        let store = Self::new();
        if !dir.exists() {
            return Ok(store);
        }
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let data = std::fs::read(&path)?;
            let saved: SavedDatabase = serde_json::from_slice(&data)?;
            lock_or_recover(&store.inner.databases)
                .insert(saved.location, Arc::new(MemoryDatabase::new(saved.state)));
        }
        Ok(store)
    }
}

#[derive(Serialize, Deserialize)]
struct SavedDatabase {
    location: ShardLocation,
    state: DatabaseState,
}

/// [`StoreConnectionFactory`] over a [`MemoryStore`].
#[derive(Clone)]
pub struct MemoryStoreConnectionFactory {
    inner: Arc<MemoryStoreInner>,
}

impl StoreConnectionFactory for MemoryStoreConnectionFactory {
    fn get_connection(
        &self,
        kind: StoreConnectionKind,
        location: &ShardLocation,
    ) -> Result<Box<dyn StoreConnection>, StoreError> {
        Ok(Box::new(MemoryStoreConnection {
            inner: Arc::clone(&self.inner),
            kind,
            location: location.clone(),
            database: None,
            lock: None,
        }))
    }
}

struct MemoryStoreConnection {
    inner: Arc<MemoryStoreInner>,
    kind: StoreConnectionKind,
    location: ShardLocation,
    database: Option<Arc<MemoryDatabase>>,
    lock: Option<Uuid>,
}

impl StoreConnection for MemoryStoreConnection {
    fn kind(&self) -> StoreConnectionKind {
        self.kind
    }

    fn location(&self) -> &ShardLocation {
        &self.location
    }

    fn open(&mut self) -> Result<(), StoreError> {
        if let Some(FaultOutcome::Error(e)) = self.inner.take_fault(&self.location, "Open") {
            return Err(e);
        }
        let db = self
            .inner
            .database(&self.location)
            .ok_or_else(|| StoreError::DatabaseNotFound(self.location.clone()))?;
        self.database = Some(db);
        Ok(())
    }

    fn open_with_lock(&mut self, lock_id: Uuid) -> Result<(), StoreError> {
        self.open()?;
        if let Some(db) = &self.database {
            db.acquire_lock(lock_id, self.inner.lock_timeout)?;
            self.lock = Some(lock_id);
        }
        Ok(())
    }

    fn close(&mut self) {
        if let (Some(db), Some(lock_id)) = (&self.database, self.lock.take()) {
            db.release_lock(lock_id);
        }
        self.database = None;
    }

    fn get_transaction_scope(
        &mut self,
        kind: StoreTransactionScopeKind,
    ) -> Result<Box<dyn StoreTransactionScope + '_>, StoreError> {
        let db = self.database.as_ref().ok_or(StoreError::ConnectionNotOpen)?;
        let guard = lock_or_recover(&db.state);
        let working = guard.clone();
        Ok(Box::new(MemoryTransactionScope {
            inner: &*self.inner,
            connection_kind: self.kind,
            location: &self.location,
            kind,
            guard,
            working,
            success: false,
        }))
    }
}

impl Drop for MemoryStoreConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Holds the database mutex until dropped. Only one scope per database can
/// be open at a time; a second one on the same thread blocks forever.
struct MemoryTransactionScope<'a> {
    inner: &'a MemoryStoreInner,
    connection_kind: StoreConnectionKind,
    location: &'a ShardLocation,
    kind: StoreTransactionScopeKind,
    guard: MutexGuard<'a, DatabaseState>,
    working: DatabaseState,
    success: bool,
}

impl MemoryTransactionScope<'_> {
    fn check_target(&self, target: StoreTarget, what: &str) -> Result<(), StoreError> {
        let ok = match target {
            StoreTarget::Global => self.connection_kind == StoreConnectionKind::Global,
            StoreTarget::Local => self.connection_kind != StoreConnectionKind::Global,
        };
        if ok {
            Ok(())
        } else {
            Err(StoreError::InvalidRequest(format!(
                "{} cannot run on a {:?} connection",
                what, self.connection_kind
            )))
        }
    }

    fn run(&mut self, request: &StoreRequest) -> Result<StoreResults, StoreError> {
        match request.target() {
            StoreTarget::Global => {
                if matches!(request, StoreRequest::GetStoreVersionGlobal) {
                    let version = self.working.global.as_ref().map(|g| g.version);
                    return Ok(StoreResults::success().with_version(version));
                }
                let global = self.working.global.as_mut().ok_or_else(|| {
                    StoreError::NotDeployed(format!("global store at {}", self.location))
                })?;
                if !GLOBAL_STORE_VERSION.is_compatible_with(&global.version) {
                    return Ok(StoreResults::new(StoreResult::StoreVersionMismatch)
                        .with_version(Some(global.version)));
                }
                global.execute(request)
            }
            StoreTarget::Local => {
                if matches!(request, StoreRequest::GetStoreVersionLocal) {
                    let version = self.working.local.as_ref().map(|l| l.version);
                    return Ok(StoreResults::success().with_version(version));
                }
                let local = self.working.local.as_mut().ok_or_else(|| {
                    StoreError::NotDeployed(format!("local store at {}", self.location))
                })?;
                if !LOCAL_STORE_VERSION.is_compatible_with(&local.version) {
                    return Ok(StoreResults::new(StoreResult::StoreVersionMismatch)
                        .with_version(Some(local.version)));
                }
                local.execute(request)
            }
        }
    }

    fn commit_now(&mut self) {
        *self.guard = self.working.clone();
    }
}

impl StoreTransactionScope for MemoryTransactionScope<'_> {
    fn kind(&self) -> StoreTransactionScopeKind {
        self.kind
    }

    fn set_success(&mut self, success: bool) {
        self.success = success;
    }

    fn execute_operation(&mut self, request: &StoreRequest) -> Result<StoreResults, StoreError> {
        self.check_target(request.target(), request.name())?;

        let fault = self.inner.take_fault(self.location, request.name());
        match fault {
            Some(FaultOutcome::Error(e)) => {
                log::debug!("injected failure for {} at {}: {}", request.name(), self.location, e);
                return Err(e);
            }
            Some(FaultOutcome::Result(result)) => {
                log::debug!("injected result {:?} for {} at {}", result, request.name(), self.location);
                return Ok(StoreResults::new(result));
            }
            _ => {}
        }

        let results = self.run(request)?;

        if let Some(FaultOutcome::ErrorAfterCommit(e)) = fault {
            log::debug!("committing {} at {} then failing: {}", request.name(), self.location, e);
            self.commit_now();
            return Err(e);
        }
        if self.kind == StoreTransactionScopeKind::NonTransactional {
            self.commit_now();
        }
        Ok(results)
    }

    fn execute_command_batch(&mut self, commands: &[StoreCommand]) -> Result<(), StoreError> {
        for command in commands {
            let target = match command {
                StoreCommand::DeployGlobalStore | StoreCommand::DropGlobalStore => StoreTarget::Global,
                StoreCommand::DeployLocalStore | StoreCommand::DropLocalStore => StoreTarget::Local,
            };
            self.check_target(target, &format!("{:?}", command))?;
            if let Some(FaultOutcome::Error(e)) = self.inner.take_fault(self.location, &format!("{:?}", command)) {
                return Err(e);
            }
            match command {
                StoreCommand::DeployGlobalStore => {
                    if self.working.global.is_some() {
                        return Err(StoreError::InvalidRequest(format!(
                            "global store already deployed at {}",
                            self.location
                        )));
                    }
                    self.working.global = Some(GlobalState::new(GLOBAL_STORE_VERSION));
                }
                StoreCommand::DropGlobalStore => self.working.global = None,
                StoreCommand::DeployLocalStore => {
                    if self.working.local.is_none() {
                        self.working.local = Some(LocalState::new(LOCAL_STORE_VERSION));
                    }
                }
                StoreCommand::DropLocalStore => self.working.local = None,
            }
        }
        if self.kind == StoreTransactionScopeKind::NonTransactional {
            self.commit_now();
        }
        Ok(())
    }
}

impl Drop for MemoryTransactionScope<'_> {
    fn drop(&mut self) {
        if self.success && self.kind == StoreTransactionScopeKind::ReadWrite {
            self.commit_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreRequest;

    fn gsm() -> ShardLocation {
        ShardLocation::new("srv", "gsm")
    }

    fn deploy_global(store: &MemoryStore) {
        store.create_database(&gsm());
        let mut conn = store
            .connection_factory()
            .get_connection(StoreConnectionKind::Global, &gsm())
            .unwrap();
        conn.open().unwrap();
        let mut scope = conn.get_transaction_scope(StoreTransactionScopeKind::ReadWrite).unwrap();
        scope.execute_command_batch(&[StoreCommand::DeployGlobalStore]).unwrap();
        scope.set_success(true);
    }

    #[test]
    fn test_scope_without_success_rolls_back() {
        let store = MemoryStore::new();
        store.create_database(&gsm());
        {
            let mut conn = store
                .connection_factory()
                .get_connection(StoreConnectionKind::Global, &gsm())
                .unwrap();
            conn.open().unwrap();
            let mut scope = conn.get_transaction_scope(StoreTransactionScopeKind::ReadWrite).unwrap();
            scope.execute_command_batch(&[StoreCommand::DeployGlobalStore]).unwrap();
        }
        assert!(store.global_state(&gsm()).is_none());

        deploy_global(&store);
        assert!(store.global_state(&gsm()).is_some());
    }

    #[test]
    fn test_missing_database_fails_open() {
        let store = MemoryStore::new();
        let mut conn = store
            .connection_factory()
            .get_connection(StoreConnectionKind::LocalSource, &ShardLocation::new("srv", "nope"))
            .unwrap();
        assert!(matches!(conn.open(), Err(StoreError::DatabaseNotFound(_))));
    }

    #[test]
    fn test_local_request_on_global_connection_is_rejected() {
        let store = MemoryStore::new();
        deploy_global(&store);
        let mut conn = store
            .connection_factory()
            .get_connection(StoreConnectionKind::Global, &gsm())
            .unwrap();
        conn.open().unwrap();
        let mut scope = conn.get_transaction_scope(StoreTransactionScopeKind::ReadOnly).unwrap();
        assert!(matches!(
            scope.execute_operation(&StoreRequest::GetShardsLocal),
            Err(StoreError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_version_mismatch_is_reported() {
        let store = MemoryStore::new();
        deploy_global(&store);
        store.modify(&gsm(), |db| {
            if let Some(global) = db.global.as_mut() {
                global.version = crate::store::StoreVersion::new(9, 0);
            }
        });
        let mut conn = store
            .connection_factory()
            .get_connection(StoreConnectionKind::Global, &gsm())
            .unwrap();
        conn.open().unwrap();
        let mut scope = conn.get_transaction_scope(StoreTransactionScopeKind::ReadOnly).unwrap();
        let results = scope.execute_operation(&StoreRequest::GetShardMapsGlobal).unwrap();
        assert_eq!(results.result, StoreResult::StoreVersionMismatch);
    }

    #[test]
    fn test_fault_fires_requested_number_of_times() {
        let store = MemoryStore::new();
        deploy_global(&store);
        store.inject_fault(
            FaultInjection::new("GetShardMapsGlobal", FaultOutcome::Error(StoreError::Transient("boom".into())))
                .times(2),
        );
        let mut conn = store
            .connection_factory()
            .get_connection(StoreConnectionKind::Global, &gsm())
            .unwrap();
        conn.open().unwrap();
        let mut scope = conn.get_transaction_scope(StoreTransactionScopeKind::ReadOnly).unwrap();
        assert!(scope.execute_operation(&StoreRequest::GetShardMapsGlobal).is_err());
        assert!(scope.execute_operation(&StoreRequest::GetShardMapsGlobal).is_err());
        assert!(scope.execute_operation(&StoreRequest::GetShardMapsGlobal).is_ok());
        assert_eq!(store.pending_faults(), 0);
    }

    #[test]
    fn test_lock_is_exclusive_until_close() {
        let store = MemoryStore::with_lock_timeout(Duration::from_millis(20));
        deploy_global(&store);
        let factory = store.connection_factory();
        let lock_id = Uuid::new_v4();

        let mut first = factory.get_connection(StoreConnectionKind::Global, &gsm()).unwrap();
        first.open_with_lock(lock_id).unwrap();

        let mut second = factory.get_connection(StoreConnectionKind::Global, &gsm()).unwrap();
        assert!(matches!(second.open_with_lock(lock_id), Err(StoreError::LockTimeout(_))));

        first.close();
        second.open_with_lock(lock_id).unwrap();
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let store = MemoryStore::new();
        deploy_global(&store);
        store.create_database(&ShardLocation::new("srv", "shard1"));

        let dir = tempfile::tempdir().unwrap();
        store.save_to_dir(dir.path()).unwrap();

        let loaded = MemoryStore::load_from_dir(dir.path()).unwrap();
        assert_eq!(loaded.locations(), store.locations());
        assert_eq!(loaded.snapshot(&gsm()), store.snapshot(&gsm()));
    }
}
