//! Background assignment of change numbers.
//!
//! The indexer merges the updates of every ECL-enabled domain in CSN
//! order and appends each one to the change-number index, but only once
//! it is certain that no replica can still deliver an older update.
//!
//! # Medium consistency point
//!
//! Every replica reports the newest CSN it is known to have reached
//! (its *last-alive* CSN) through updates and heartbeats. The medium
//! consistency point is the oldest last-alive CSN over all replicas,
//! skipping replicas that went offline exactly there. An update is safe
//! to index once its CSN is not newer than that point.
//!
//! # Threads
//!
//! The work runs on one dedicated thread. Producers update the shared
//! state under its mutex and notify a condition variable. They never wait
//! for the worker, except [`ChangeNumberIndexer::clear_domain`].

#[cfg(test)]
mod tests;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use crate::cursor::{CursorOptions, DbCursor, EclMultiDomainDbCursor, MultiDomainDbCursor, ReplicationDomainDb};
use crate::error::{ChangelogError, poisoned};
use crate::file::FileChangeNumberIndexDb;
use crate::ports::{ChangeNumberIndexListener, ChangeNumberIndexed, EclEnabledDomainPredicate};
use crate::replication::{Csn, Dn, MultiDomainServerState, UpdateMsg};

/// Name of the indexer thread.
pub const INDEXER_THREAD_NAME: &str = "replchangelog-cn-indexer";

/// State shared between producers and the worker.
#[derive(Default)]
struct IndexerState {
    /// Newest CSN each replica is known to have reached.
    last_alive: MultiDomainServerState,
    /// CSN at which each offline replica went offline.
    offline: MultiDomainServerState,
    /// Cookie resuming right after the newest indexed change.
    cookie: MultiDomainServerState,
    medium_consistency: Option<Csn>,
    /// Bumped on every change a waiting worker must react to.
    generation: u64,
    clear_requests: Vec<Option<Dn>>,
    clears_requested: u64,
    clears_done: u64,
    running: bool,
    failure: Option<String>,
}

impl IndexerState {
    /// Oldest last-alive CSN, excluding replicas offline at exactly that
    /// CSN. `None` while some replica still carries its seed.
    fn consistency_point(&self) -> Option<Csn> {
        self.last_alive
            .oldest_csn_excluding(&self.offline)
            .filter(|csn| *csn != Csn::oldest_for(csn.server_id()))
    }

    fn refresh_medium_consistency(&mut self) -> Option<Csn> {
        if let Some(point) = self.consistency_point()
            && self.medium_consistency.is_none_or(|current| point > current)
        {
            self.medium_consistency = Some(point);
        }
        self.medium_consistency
    }

    /// Whether no replica can still deliver an update older than `csn`.
    fn is_safe(&self, csn: Csn) -> bool {
        match self.last_alive.oldest_csn_excluding(&self.offline) {
            Some(oldest) => oldest >= csn,
            None => true,
        }
    }

    fn forget_domain(&mut self, base_dn: &Dn) {
        self.last_alive.remove_domain(base_dn);
        self.offline.remove_domain(base_dn);
        self.cookie.remove_domain(base_dn);
    }

    /// Un-marks offline replicas that came back and forgets the ones whose
    /// offline CSN is behind `indexed`.
    fn update_offline_replicas(&mut self, indexed: Csn) {
        let offline: Vec<(Dn, Csn)> = self.offline.csns().map(|(dn, csn)| (dn.clone(), *csn)).collect();
        for (base_dn, offline_csn) in offline {
            let alive = self.last_alive.get_csn(&base_dn, offline_csn.server_id());
            if alive.is_some_and(|alive| alive.is_newer_than(&offline_csn)) {
                self.offline.remove_csn(&base_dn, &offline_csn);
                debug!(%base_dn, server_id = offline_csn.server_id(), "replica back online");
            } else if offline_csn.is_older_than(&indexed) {
                self.offline.remove_csn(&base_dn, &offline_csn);
                if let Some(alive) = alive {
                    self.last_alive.remove_csn(&base_dn, &alive);
                }
                debug!(%base_dn, server_id = offline_csn.server_id(), "forgetting offline replica");
            }
        }
    }
}

struct IndexerShared {
    db: Arc<dyn ReplicationDomainDb>,
    cn_index: Arc<FileChangeNumberIndexDb>,
    predicate: Arc<dyn EclEnabledDomainPredicate>,
    listener: Option<Arc<dyn ChangeNumberIndexListener>>,
    state: Mutex<IndexerState>,
    wakeup: Condvar,
    shutdown: AtomicBool,
    /// Offline replicas read from disk, applied by the first initialization.
    initial_offline: Mutex<Option<MultiDomainServerState>>,
    indexed: AtomicU64,
}

/// Whether the worker keeps going after one step.
enum Step {
    Continue,
    Reinitialize,
    Stop,
}

/// Assigns change numbers to the updates of all ECL-enabled domains.
pub struct ChangeNumberIndexer {
    shared: Arc<IndexerShared>,
    worker: Mutex<Option<JoinHandle<Result<(), ChangelogError>>>>,
}

impl ChangeNumberIndexer {
    /// Creates a stopped indexer. `offline_replicas` holds the replicas
    /// known to be offline at startup.
    pub fn new(
        db: Arc<dyn ReplicationDomainDb>,
        cn_index: Arc<FileChangeNumberIndexDb>,
        predicate: Arc<dyn EclEnabledDomainPredicate>,
        listener: Option<Arc<dyn ChangeNumberIndexListener>>,
        offline_replicas: MultiDomainServerState,
    ) -> Self {
        Self {
            shared: Arc::new(IndexerShared {
                db,
                cn_index,
                predicate,
                listener,
                state: Mutex::new(IndexerState::default()),
                wakeup: Condvar::new(),
                shutdown: AtomicBool::new(false),
                initial_offline: Mutex::new(Some(offline_replicas)),
                indexed: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Spawns the worker thread.
    pub fn start(&self) -> Result<(), ChangelogError> {
        let mut worker = self.worker.lock().map_err(poisoned("indexer worker"))?;
        if worker.is_some() {
            return Err(ChangelogError::InvalidArgument("change number indexer already started".into()));
        }
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(ChangelogError::ShuttingDown);
        }
        self.shared.lock_state()?.running = true;

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(INDEXER_THREAD_NAME.into())
            .spawn(move || shared.run())
            .map_err(|e| {
                if let Ok(mut state) = self.shared.state.lock() {
                    state.running = false;
                }
                ChangelogError::Internal(format!("unable to spawn the change number indexer: {e}"))
            })?;
        *worker = Some(handle);
        info!("change number indexer started");
        Ok(())
    }

    /// Records that `base_dn`'s replica reached `heartbeat` without
    /// publishing an update.
    pub fn publish_heartbeat(&self, base_dn: &Dn, heartbeat: Csn) -> Result<(), ChangelogError> {
        if !self.shared.predicate.is_ecl_enabled_domain(base_dn) {
            return Ok(());
        }
        self.shared.signal(|state| {
            state.last_alive.update(base_dn, heartbeat);
        })
    }

    /// Records that `update` has been stored in its replica log.
    pub fn publish_update_msg(&self, base_dn: &Dn, update: &UpdateMsg) -> Result<(), ChangelogError> {
        if !self.shared.predicate.is_ecl_enabled_domain(base_dn) {
            return Ok(());
        }
        let csn = update.csn();
        self.shared.signal(|state| {
            state.last_alive.update(base_dn, csn);
        })
    }

    /// Records that the replica of `offline` went offline at that CSN.
    pub fn replica_offline(&self, base_dn: &Dn, offline: Csn) -> Result<(), ChangelogError> {
        if !self.shared.predicate.is_ecl_enabled_domain(base_dn) {
            return Ok(());
        }
        self.shared.signal(|state| {
            if let Some(previous) = state.offline.get_csn(base_dn, offline.server_id()) {
                state.offline.remove_csn(base_dn, &previous);
            }
            state.offline.update(base_dn, offline);
            state.last_alive.update(base_dn, offline);
        })
    }

    /// Forgets `base_dn`, or every domain for `None`, and waits until the
    /// worker no longer reads it.
    pub fn clear_domain(&self, base_dn: Option<&Dn>) -> Result<(), ChangelogError> {
        let shared = &self.shared;
        let mut state = shared.lock_state()?;
        if !state.running {
            match base_dn {
                Some(base_dn) => state.forget_domain(base_dn),
                None => {
                    state.last_alive.clear();
                    state.offline.clear();
                    state.cookie.clear();
                }
            }
            return Ok(());
        }

        state.clear_requests.push(base_dn.cloned());
        state.clears_requested += 1;
        state.generation += 1;
        let ticket = state.clears_requested;
        while state.running && state.clears_done < ticket && !shared.shutdown.load(Ordering::Acquire) {
            shared.wakeup.notify_all();
            state = shared.wakeup.wait(state).map_err(poisoned("indexer state"))?;
        }
        debug!(base_dn = ?base_dn, "change number indexer cleared");
        Ok(())
    }

    /// Asks the worker to stop without waiting for it.
    pub fn initiate_shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Ok(mut state) = self.shared.state.lock() {
            state.generation += 1;
        }
        self.shared.wakeup.notify_all();
    }

    /// Stops the worker and returns the error that ended it, if any.
    pub fn shutdown(&self) -> Result<(), ChangelogError> {
        self.initiate_shutdown();
        let handle = self.worker.lock().map_err(poisoned("indexer worker"))?.take();
        let Some(handle) = handle else {
            return Ok(());
        };
        let result = handle
            .join()
            .map_err(|_| ChangelogError::Internal("change number indexer panicked".into()))?;
        info!(indexed = self.indexed_count(), "change number indexer stopped");
        result
    }

    pub fn is_running(&self) -> bool {
        self.shared.state.lock().is_ok_and(|state| state.running)
    }

    /// The medium consistency point. It never moves backwards.
    pub fn medium_consistency_csn(&self) -> Result<Option<Csn>, ChangelogError> {
        Ok(self.shared.lock_state()?.refresh_medium_consistency())
    }

    /// Cookie resuming right after the newest indexed change.
    pub fn medium_consistency_cookie(&self) -> Result<MultiDomainServerState, ChangelogError> {
        Ok(self.shared.lock_state()?.cookie.clone())
    }

    /// Number of changes indexed since the indexer was created.
    pub fn indexed_count(&self) -> u64 {
        self.shared.indexed.load(Ordering::Acquire)
    }

    /// Message of the error that ended the worker.
    pub fn failure(&self) -> Option<String> {
        self.shared.state.lock().ok().and_then(|state| state.failure.clone())
    }
}

impl Drop for ChangeNumberIndexer {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "change number indexer ended with an error");
        }
    }
}

impl std::fmt::Debug for ChangeNumberIndexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNumberIndexer")
            .field("running", &self.is_running())
            .field("indexed", &self.indexed_count())
            .finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Worker
// ------------------------------------------------------------------------------------------------

impl IndexerShared {
    fn lock_state(&self) -> Result<MutexGuard<'_, IndexerState>, ChangelogError> {
        self.state.lock().map_err(poisoned("indexer state"))
    }

    /// Applies a producer change and wakes the worker.
    fn signal(&self, change: impl FnOnce(&mut IndexerState)) -> Result<(), ChangelogError> {
        let mut state = self.lock_state()?;
        change(&mut state);
        state.generation += 1;
        self.wakeup.notify_all();
        Ok(())
    }

    fn run(&self) -> Result<(), ChangelogError> {
        let result = self.index_loop();
        let mut state = self.lock_state()?;
        state.running = false;
        if let Err(e) = &result {
            error!(error = %e, "change number indexer failed");
            state.failure = Some(e.to_string());
        }
        self.wakeup.notify_all();
        result
    }

    fn index_loop(&self) -> Result<(), ChangelogError> {
        let mut cursor = self.initialize()?;
        loop {
            match self.step(&mut cursor) {
                Ok(Step::Continue) => {}
                Ok(Step::Stop) => break,
                Ok(Step::Reinitialize) => {
                    warn!("an external changelog domain was enabled, rebuilding the indexer cursor");
                    cursor.close();
                    cursor = self.open_cursor()?;
                }
                Err(e) if e.is_aborted_cursor() => {
                    warn!(error = %e, "indexer cursor aborted, rebuilding it");
                    cursor.close();
                    cursor = self.open_cursor()?;
                }
                Err(e) => {
                    cursor.close();
                    return Err(e);
                }
            }
        }
        cursor.close();
        Ok(())
    }

    /// Seeds the last-alive state with every known replica, applies the
    /// persisted offline replicas and opens the cursor.
    fn initialize(&self) -> Result<EclMultiDomainDbCursor, ChangelogError> {
        let offline = self
            .initial_offline
            .lock()
            .map_err(poisoned("indexer offline replicas"))?
            .take()
            .unwrap_or_default();
        {
            let mut state = self.lock_state()?;
            for base_dn in self.enabled_domains() {
                for server_id in self.db.replica_ids(&base_dn) {
                    state.last_alive.update(&base_dn, Csn::oldest_for(server_id));
                }
            }
            for (base_dn, csn) in offline.csns() {
                if self.predicate.is_ecl_enabled_domain(base_dn) {
                    state.offline.update(base_dn, *csn);
                    state.last_alive.update(base_dn, *csn);
                }
            }
        }
        let cursor = self.open_cursor()?;
        info!(cookie = %self.lock_state()?.cookie, "change number indexer initialized");
        Ok(cursor)
    }

    /// Opens a cursor resuming right after the newest indexed change.
    fn open_cursor(&self) -> Result<EclMultiDomainDbCursor, ChangelogError> {
        let newest = self.cn_index.newest_record()?;
        let mut start = MultiDomainServerState::new();
        if let Some(newest) = &newest {
            for base_dn in self.enabled_domains() {
                for server_id in self.db.replica_ids(&base_dn) {
                    start.update(&base_dn, resume_point(newest.csn, server_id));
                }
            }
        }
        let cursor = MultiDomainDbCursor::open(Arc::clone(&self.db), &start, CursorOptions::default())?;

        let mut state = self.lock_state()?;
        if let Some(newest) = newest
            && state.medium_consistency.is_none_or(|current| newest.csn > current)
        {
            state.medium_consistency = Some(newest.csn);
        }
        state.cookie = start;
        Ok(EclMultiDomainDbCursor::new(cursor, Arc::clone(&self.predicate)))
    }

    fn enabled_domains(&self) -> Vec<Dn> {
        self.db
            .domains()
            .into_iter()
            .filter(|base_dn| self.predicate.is_ecl_enabled_domain(base_dn))
            .collect()
    }

    fn step(&self, cursor: &mut EclMultiDomainDbCursor) -> Result<Step, ChangelogError> {
        let (generation, new_domains) = {
            let mut state = self.lock_state()?;
            if self.shutdown.load(Ordering::Acquire) {
                return Ok(Step::Stop);
            }
            self.service_clear_requests(&mut state, cursor);
            if cursor.should_reinitialize() {
                return Ok(Step::Reinitialize);
            }
            self.drop_disabled_domains(&mut state, cursor);
            let merged: BTreeSet<&Dn> = cursor.domains().chain(cursor.disabled_domains()).collect();
            let new_domains: Vec<Dn> = state
                .last_alive
                .domains()
                .filter(|base_dn| !merged.contains(base_dn))
                .cloned()
                .collect();
            (state.generation, new_domains)
        };
        for base_dn in &new_domains {
            debug!(%base_dn, "indexing new domain");
            cursor.add_domain(base_dn, None)?;
        }

        if cursor.record().is_none() && !cursor.next()? {
            return self.wait_for_change(generation);
        }
        let Some(update) = cursor.record().cloned() else {
            return Ok(Step::Continue);
        };
        let base_dn = cursor
            .data()
            .cloned()
            .ok_or_else(|| ChangelogError::Internal("merged record without a domain".into()))?;

        if update.is_replica_offline() {
            cursor.next()?;
            return Ok(Step::Continue);
        }

        let csn = update.csn();
        if !self.lock_state()?.is_safe(csn) {
            return self.wait_for_change(generation);
        }
        // An older update may have landed in an exhausted replica before
        // its replica's last-alive CSN passed this one.
        cursor.refresh()?;
        if cursor.record().map(UpdateMsg::csn) != Some(csn) {
            return Ok(Step::Continue);
        }

        let change_number = self.cn_index.add_record(&base_dn, csn)?;
        let event = {
            let mut state = self.lock_state()?;
            state.cookie.update(&base_dn, csn);
            state.update_offline_replicas(csn);
            state.refresh_medium_consistency();
            ChangeNumberIndexed {
                base_dn,
                change_number,
                cookie: state.cookie.clone(),
                update,
            }
        };
        self.indexed.fetch_add(1, Ordering::AcqRel);
        debug!(change_number, base_dn = %event.base_dn, %csn, "change indexed");
        if let Some(listener) = &self.listener {
            listener.on_change_number_indexed(&event);
        }

        cursor.next()?;
        Ok(Step::Continue)
    }

    fn service_clear_requests(&self, state: &mut IndexerState, cursor: &mut EclMultiDomainDbCursor) {
        if state.clears_done == state.clears_requested {
            return;
        }
        for request in std::mem::take(&mut state.clear_requests) {
            match request {
                Some(base_dn) => {
                    cursor.remove_domain(&base_dn);
                    state.forget_domain(&base_dn);
                }
                None => {
                    let domains: Vec<Dn> = cursor.domains().cloned().collect();
                    for base_dn in &domains {
                        cursor.remove_domain(base_dn);
                    }
                    state.last_alive.clear();
                    state.offline.clear();
                    state.cookie.clear();
                }
            }
        }
        state.clears_done = state.clears_requested;
        self.wakeup.notify_all();
    }

    /// Stops merging and waiting for domains no longer enabled for the
    /// external changelog.
    fn drop_disabled_domains(&self, state: &mut IndexerState, cursor: &mut EclMultiDomainDbCursor) {
        let disabled: BTreeSet<Dn> = cursor
            .domains()
            .chain(state.last_alive.domains())
            .chain(state.offline.domains())
            .filter(|base_dn| !self.predicate.is_ecl_enabled_domain(base_dn))
            .cloned()
            .collect();
        for base_dn in &disabled {
            cursor.disable_domain(base_dn);
            state.forget_domain(base_dn);
        }
    }

    /// Sleeps until a producer, a clear request or shutdown changed the
    /// state since `generation`.
    fn wait_for_change(&self, generation: u64) -> Result<Step, ChangelogError> {
        let mut state = self.lock_state()?;
        while state.generation == generation && !self.shutdown.load(Ordering::Acquire) {
            state = self.wakeup.wait(state).map_err(poisoned("indexer state"))?;
        }
        Ok(Step::Continue)
    }
}

/// Newest CSN of replica `server_id` that is not newer than `newest`.
///
/// Resuming every replica after this CSN skips exactly the updates that
/// were indexed before `newest`.
fn resume_point(newest: Csn, server_id: u16) -> Csn {
    if server_id <= newest.server_id() {
        Csn::new(newest.timestamp(), newest.seqnum(), server_id)
    } else if newest.seqnum() > 0 {
        Csn::new(newest.timestamp(), newest.seqnum() - 1, server_id)
    } else if newest.timestamp() > 0 {
        Csn::new(newest.timestamp() - 1, u32::MAX, server_id)
    } else {
        Csn::oldest_for(server_id)
    }
}
