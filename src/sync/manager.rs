use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::down::SyncDownTarget;
use super::rest::RestClient;
use super::state::{SyncOptions, SyncState, SyncStatus, SyncType};
use super::target::TargetRegistry;
use super::up::SyncUpTarget;
use super::worker;
use crate::error::{StoreError, StoreResult};
use crate::storage::{SmartStore, StoreScope};

/// Lifecycle of a sync manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    AcceptingSyncs,
    /// Running syncs finish their current page or record, then stop
    StopRequested,
    Stopped,
}

#[derive(Clone)]
enum ResolvedTarget {
    Down(Arc<dyn SyncDownTarget>),
    Up(Arc<dyn SyncUpTarget>),
}

/// A started sync. Updates arrive on `updates`; the terminal one is last.
#[derive(Debug)]
pub struct SyncRun {
    pub sync_id: i64,
    pub updates: mpsc::UnboundedReceiver<SyncState>,
    handle: JoinHandle<SyncState>,
}

impl SyncRun {
    /// Wait for the run and return its terminal state
    pub async fn finished(self) -> StoreResult<SyncState> {
        Ok(self.handle.await?)
    }
}

struct Shared {
    store: Arc<SmartStore>,
    rest: Arc<dyn RestClient>,
    targets: Arc<TargetRegistry>,
    state: RwLock<ManagerState>,
    active: Mutex<HashSet<i64>>,
    /// Targets handed in by the caller, reused by re-syncs in this process
    live_targets: Mutex<HashMap<i64, ResolvedTarget>>,
}

impl Shared {
    fn is_stop_requested(&self) -> bool {
        *self.state.read() != ManagerState::AcceptingSyncs
    }

    /// Mark a sync as running. The state is read under the `active` lock,
    /// the same lock `stop` holds while deciding between StopRequested and
    /// Stopped, so no run can start after a stop has been decided.
    fn claim(&self, sync_id: i64) -> StoreResult<()> {
        let mut active = self.active.lock();
        if *self.state.read() != ManagerState::AcceptingSyncs {
            return Err(StoreError::ManagerStopped);
        }
        if !active.insert(sync_id) {
            return Err(StoreError::SyncAlreadyRunning(sync_id));
        }
        Ok(())
    }

    fn release(&self, sync_id: i64) {
        let mut active = self.active.lock();
        active.remove(&sync_id);
        let mut state = self.state.write();
        if *state == ManagerState::StopRequested && active.is_empty() {
            *state = ManagerState::Stopped;
            info!("Sync manager for '{}' stopped", self.store.name());
        }
    }
}

/// Runs sync downs and sync ups against one store.
///
/// Cloning is cheap and every clone drives the same manager. Runs are
/// spawned on the current Tokio runtime.
#[derive(Clone)]
pub struct SyncManager {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("store", &self.shared.store.name())
            .field("state", &self.state())
            .field("active", &self.shared.active.lock().len())
            .finish()
    }
}

impl SyncManager {
    pub fn new(
        store: Arc<SmartStore>,
        rest: Arc<dyn RestClient>,
        targets: Arc<TargetRegistry>,
    ) -> StoreResult<Self> {
        SyncState::setup_syncs_soup_if_needed(&store)?;
        Ok(Self {
            shared: Arc::new(Shared {
                store,
                rest,
                targets,
                state: RwLock::new(ManagerState::AcceptingSyncs),
                active: Mutex::new(HashSet::new()),
                live_targets: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn store(&self) -> &Arc<SmartStore> {
        &self.shared.store
    }

    pub fn state(&self) -> ManagerState {
        *self.shared.state.read()
    }

    pub fn is_stopping(&self) -> bool {
        self.state() == ManagerState::StopRequested
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == ManagerState::Stopped
    }

    pub fn active_sync_count(&self) -> usize {
        self.shared.active.lock().len()
    }

    fn check_accepting(&self) -> StoreResult<()> {
        match self.state() {
            ManagerState::AcceptingSyncs => Ok(()),
            _ => Err(StoreError::ManagerStopped),
        }
    }

    // ==================== Lifecycle ====================

    /// Ask running syncs to stop; they end with status STOPPED
    pub fn stop(&self) {
        let active = self.shared.active.lock();
        let mut state = self.shared.state.write();
        if *state != ManagerState::AcceptingSyncs {
            return;
        }
        *state = if active.is_empty() {
            ManagerState::Stopped
        } else {
            ManagerState::StopRequested
        };
        info!(
            "Stopping sync manager for '{}' ({} running)",
            self.shared.store.name(),
            active.len()
        );
    }

    /// Accept syncs again, optionally re-running every STOPPED sync.
    /// Refused while running syncs are still winding down.
    pub fn restart(&self, restart_stopped_syncs: bool) -> StoreResult<Vec<SyncRun>> {
        {
            let mut state = self.shared.state.write();
            match *state {
                ManagerState::StopRequested => return Err(StoreError::CannotRestart),
                ManagerState::AcceptingSyncs | ManagerState::Stopped => {
                    *state = ManagerState::AcceptingSyncs;
                }
            }
        }
        info!("Sync manager for '{}' restarted", self.shared.store.name());
        if !restart_stopped_syncs {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        for state in SyncState::all(&self.shared.store)? {
            if state.status == SyncStatus::Stopped {
                match self.re_sync(state.id) {
                    Ok(run) => runs.push(run),
                    Err(e) => warn!("Could not restart sync {}: {}", state.id, e),
                }
            }
        }
        Ok(runs)
    }

    // ==================== Sync records ====================

    pub fn get_sync_status(&self, sync_id: i64) -> StoreResult<Option<SyncState>> {
        SyncState::by_id(&self.shared.store, sync_id)
    }

    pub fn get_sync_status_by_name(&self, name: &str) -> StoreResult<Option<SyncState>> {
        SyncState::by_name(&self.shared.store, name)
    }

    pub fn has_sync_with_name(&self, name: &str) -> StoreResult<bool> {
        Ok(self.get_sync_status_by_name(name)?.is_some())
    }

    pub fn delete_sync(&self, sync_id: i64) -> StoreResult<()> {
        self.shared.live_targets.lock().remove(&sync_id);
        SyncState::delete_by_id(&self.shared.store, sync_id)
    }

    pub fn delete_sync_by_name(&self, name: &str) -> StoreResult<()> {
        match self.get_sync_status_by_name(name)? {
            Some(state) => self.delete_sync(state.id),
            None => Ok(()),
        }
    }

    pub fn create_sync_down(
        &self,
        target: Arc<dyn SyncDownTarget>,
        options: SyncOptions,
        soup_name: &str,
        name: Option<&str>,
    ) -> StoreResult<SyncState> {
        let state = SyncState::create_sync_down(
            &self.shared.store,
            target.to_json(),
            options,
            soup_name,
            name,
        )?;
        self.shared
            .live_targets
            .lock()
            .insert(state.id, ResolvedTarget::Down(target));
        Ok(state)
    }

    pub fn create_sync_up(
        &self,
        target: Arc<dyn SyncUpTarget>,
        options: SyncOptions,
        soup_name: &str,
        name: Option<&str>,
    ) -> StoreResult<SyncState> {
        let state = SyncState::create_sync_up(
            &self.shared.store,
            target.to_json(),
            options,
            soup_name,
            name,
        )?;
        self.shared
            .live_targets
            .lock()
            .insert(state.id, ResolvedTarget::Up(target));
        Ok(state)
    }

    // ==================== Running ====================

    /// Create a sync down and start it
    pub fn sync_down(
        &self,
        target: Arc<dyn SyncDownTarget>,
        options: SyncOptions,
        soup_name: &str,
        name: Option<&str>,
    ) -> StoreResult<SyncRun> {
        self.check_accepting()?;
        let state = self.create_sync_down(target, options, soup_name, name)?;
        self.re_sync(state.id)
    }

    /// Create a sync up and start it
    pub fn sync_up(
        &self,
        target: Arc<dyn SyncUpTarget>,
        options: SyncOptions,
        soup_name: &str,
        name: Option<&str>,
    ) -> StoreResult<SyncRun> {
        self.check_accepting()?;
        let state = self.create_sync_up(target, options, soup_name, name)?;
        self.re_sync(state.id)
    }

    pub fn re_sync_by_name(&self, name: &str) -> StoreResult<SyncRun> {
        let state = self
            .get_sync_status_by_name(name)?
            .ok_or_else(|| StoreError::SyncNotFound(name.to_string()))?;
        self.re_sync(state.id)
    }

    /// Run an existing sync again. A sync down fetches what changed since its
    /// last completed run; one that was stopped mid-fetch resumes its cursor.
    pub fn re_sync(&self, sync_id: i64) -> StoreResult<SyncRun> {
        self.check_accepting()?;
        let mut state = self
            .get_sync_status(sync_id)?
            .ok_or_else(|| StoreError::SyncNotFound(sync_id.to_string()))?;
        self.shared.claim(sync_id)?;

        let prepared = self.resolve_target(&state).and_then(|target| {
            if state.status != SyncStatus::Stopped {
                state.page_cursor = None;
            }
            state.status = SyncStatus::Running;
            state.progress = 0;
            state.start_time = chrono::Utc::now().timestamp_millis();
            state.end_time = 0;
            state.error = None;
            state.save(&self.shared.store)?;
            Ok(target)
        });
        let target = match prepared {
            Ok(target) => target,
            Err(e) => {
                self.shared.release(sync_id);
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(state.clone());
        debug!("Starting sync {} on '{}'", sync_id, state.soup_name);

        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            let stop = || shared.is_stop_requested();
            let final_state = match target {
                ResolvedTarget::Down(target) => {
                    worker::run_sync_down(&shared.store, state, target, &tx, &stop).await
                }
                ResolvedTarget::Up(target) => {
                    worker::run_sync_up(&shared.store, state, target, &tx, &stop).await
                }
            };
            shared.release(sync_id);
            final_state
        });

        Ok(SyncRun {
            sync_id,
            updates: rx,
            handle,
        })
    }

    /// Remove local records of a sync down that no longer exist on the
    /// server. Validation errors are returned right away; the cleanup itself
    /// runs in the background.
    pub fn clean_resync_ghosts(&self, sync_id: i64) -> StoreResult<JoinHandle<StoreResult<usize>>> {
        self.check_accepting()?;
        let state = self
            .get_sync_status(sync_id)?
            .ok_or_else(|| StoreError::SyncNotFound(sync_id.to_string()))?;
        if state.sync_type != SyncType::Down {
            return Err(StoreError::CleanGhostsOnlyForSyncDown(sync_id));
        }
        self.shared.claim(sync_id)?;
        let target = match self.resolve_target(&state) {
            Ok(ResolvedTarget::Down(target)) => target,
            Ok(ResolvedTarget::Up(_)) => {
                self.shared.release(sync_id);
                return Err(StoreError::CleanGhostsOnlyForSyncDown(sync_id));
            }
            Err(e) => {
                self.shared.release(sync_id);
                return Err(e);
            }
        };

        let shared = self.shared.clone();
        Ok(tokio::spawn(async move {
            let result = worker::clean_ghosts(&shared.store, &state, target.as_ref()).await;
            shared.release(sync_id);
            result
        }))
    }

    pub fn clean_resync_ghosts_by_name(
        &self,
        name: &str,
    ) -> StoreResult<JoinHandle<StoreResult<usize>>> {
        let state = self
            .get_sync_status_by_name(name)?
            .ok_or_else(|| StoreError::SyncNotFound(name.to_string()))?;
        self.clean_resync_ghosts(state.id)
    }

    fn resolve_target(&self, state: &SyncState) -> StoreResult<ResolvedTarget> {
        if let Some(target) = self.shared.live_targets.lock().get(&state.id) {
            return Ok(target.clone());
        }
        let rest = self.shared.rest.clone();
        let target = match state.sync_type {
            SyncType::Down => ResolvedTarget::Down(self.shared.targets.down_target(&state.target, rest)?),
            SyncType::Up => ResolvedTarget::Up(self.shared.targets.up_target(&state.target, rest)?),
        };
        self.shared
            .live_targets
            .lock()
            .insert(state.id, target.clone());
        Ok(target)
    }
}

/// One sync manager per store, keyed like the store registry
#[derive(Default)]
pub struct SyncManagerRegistry {
    managers: RwLock<HashMap<(StoreScope, String), SyncManager>>,
}

impl SyncManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The store's manager, created on first use
    pub fn get_or_create(
        &self,
        store: Arc<SmartStore>,
        rest: Arc<dyn RestClient>,
        targets: Arc<TargetRegistry>,
    ) -> StoreResult<SyncManager> {
        let key = (store.scope().clone(), store.name().to_string());
        if let Some(manager) = self.managers.read().get(&key) {
            return Ok(manager.clone());
        }
        let mut managers = self.managers.write();
        if let Some(manager) = managers.get(&key) {
            return Ok(manager.clone());
        }
        let manager = SyncManager::new(store, rest, targets)?;
        managers.insert(key, manager.clone());
        Ok(manager)
    }

    pub fn get(&self, scope: &StoreScope, store_name: &str) -> Option<SyncManager> {
        self.managers
            .read()
            .get(&(scope.clone(), store_name.to_string()))
            .cloned()
    }

    /// Stop and forget the store's manager
    pub fn remove(&self, scope: &StoreScope, store_name: &str) -> Option<SyncManager> {
        let removed = self
            .managers
            .write()
            .remove(&(scope.clone(), store_name.to_string()));
        if let Some(manager) = &removed {
            manager.stop();
        }
        removed
    }

    pub fn remove_all(&self) {
        let managers: Vec<SyncManager> = self.managers.write().drain().map(|(_, m)| m).collect();
        for manager in managers {
            manager.stop();
        }
    }

    pub fn len(&self) -> usize {
        self.managers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreRegistry;
    use crate::sync::rest::{RestRequest, RestResponse};
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct NoRest;

    #[async_trait]
    impl RestClient for NoRest {
        fn api_version(&self) -> &str {
            "v60.0"
        }

        async fn send(&self, _request: RestRequest) -> StoreResult<RestResponse> {
            Err(StoreError::NetworkError("offline".to_string()))
        }
    }

    fn manager() -> (SyncManager, StoreRegistry, TempDir) {
        let tmp = TempDir::new().unwrap();
        let registry = StoreRegistry::new(tmp.path());
        let store = registry.global_store("main").unwrap();
        let manager =
            SyncManager::new(store, Arc::new(NoRest), Arc::new(TargetRegistry::new())).unwrap();
        (manager, registry, tmp)
    }

    #[test]
    fn test_claim_after_stop_is_refused() {
        let (manager, _registry, _tmp) = manager();
        manager.stop();
        assert!(manager.is_stopped());

        let err = manager.shared.claim(1).unwrap_err();
        assert!(matches!(err, StoreError::ManagerStopped));
        assert_eq!(manager.active_sync_count(), 0);
    }

    #[test]
    fn test_stop_waits_for_claimed_syncs() {
        let (manager, _registry, _tmp) = manager();
        manager.shared.claim(1).unwrap();
        assert!(matches!(
            manager.shared.claim(1),
            Err(StoreError::SyncAlreadyRunning(1))
        ));

        manager.stop();
        assert!(manager.is_stopping());
        assert!(matches!(manager.shared.claim(2), Err(StoreError::ManagerStopped)));

        manager.shared.release(1);
        assert!(manager.is_stopped());
    }
}
