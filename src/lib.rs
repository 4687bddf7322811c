//! # replchangelog
//!
//! A file-based replication changelog for a multi-master directory
//! server. Every replica of every replicated domain gets an append-only
//! log of its updates, ordered by CSN. Cursors merge those logs per
//! domain and across domains, and a background indexer assigns dense
//! change numbers to the merged stream once no replica can still deliver
//! an older update.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use replchangelog::{ChangelogConfig, ChangelogDb, Collaborators, Csn, Dn, ServerState, UpdateMsg};
//! use replchangelog::cursor::{CursorOptions, DbCursor};
//!
//! let db = ChangelogDb::open("/tmp/changelog", ChangelogConfig::default(), Collaborators::default()).unwrap();
//! let base_dn = Dn::from("dc=example,dc=com");
//!
//! // Store an update of replica 1
//! let csn = Csn::new(1_700_000_000_000, 0, 1);
//! db.publish_update(&base_dn, UpdateMsg::update(csn, b"add uid=jdoe".to_vec())).unwrap();
//!
//! // Read every replica of the domain in CSN order
//! let mut cursor = db.domain_cursor(&base_dn, &ServerState::new(), CursorOptions::default()).unwrap();
//! while cursor.next().unwrap() {
//!     println!("{}", cursor.record().unwrap().csn());
//! }
//!
//! db.shutdown().unwrap();
//! ```
//!
//! ## Layout
//!
//! - [`log`]: block-structured append-only files, rotation, purge and
//!   repositionable cursors.
//! - [`cursor`]: replica, domain, multi-domain and external changelog
//!   cursors built on one merging cursor.
//! - [`file`]: per-replica databases, the change-number index and the
//!   on-disk directory layout.
//! - [`indexer`]: the change-number indexer thread.

pub mod cursor;
pub mod encoding;
pub mod error;
pub mod file;
pub mod indexer;
pub mod log;
pub mod ports;
pub mod replication;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cursor::{
    CursorOptions, DomainCursorHandle, DomainDbCursor, MultiDomainDbCursor, ReplicaCursor, ReplicationDomainDb,
    UpdateCursor,
};
use crate::error::poisoned;
use crate::file::{
    ChangeNumberIndexParser, ChangelogState, FileChangeNumberIndexDb, FileReplicaDb, ReplicaDbParser,
    ReplicationEnvironment,
};
use crate::indexer::ChangeNumberIndexer;
use crate::log::{DEFAULT_BLOCK_SIZE, LogCursor, LogOptions, MIN_BLOCK_SIZE};

pub use error::ChangelogError;
pub use ports::Collaborators;
pub use replication::{
    ChangeNumberIndexRecord, Csn, CsnGenerator, Dn, MultiDomainServerState, ServerState, UpdateMsg,
};

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for a [`ChangelogDb`] instance.
///
/// All fields have sensible defaults via [`ChangelogConfig::default()`].
/// The configuration is validated when passed to [`ChangelogDb::open`].
///
/// # Example
///
/// ```rust
/// use replchangelog::ChangelogConfig;
/// use std::time::Duration;
///
/// // Rotate the head file every hour, whatever its size
/// let config = ChangelogConfig {
///     rotation_interval: Duration::from_secs(3600),
///     ..ChangelogConfig::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ChangelogConfig {
    /// Block size of newly created log files. Each block starts with a
    /// marker that lets readers resynchronize on a record boundary.
    ///
    /// Default: 4096. Must be ≥ 64.
    pub block_size: u32,

    /// The head file of a log is rotated once it grows past this size.
    ///
    /// Default: 10 MiB. Must be ≥ `block_size`.
    pub max_log_file_size: u64,

    /// The head file of a log is rotated once this much time elapsed
    /// since its last rotation.
    ///
    /// Default: zero, which disables time-based rotation.
    pub rotation_interval: Duration,

    /// Largest accepted encoded record.
    ///
    /// Default: 1 MiB. Must be ≥ 1.
    pub max_record_size: u32,

    /// Whether the change-number indexer runs.
    ///
    /// Default: `true`.
    pub compute_change_numbers: bool,
}

impl Default for ChangelogConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_log_file_size: 10 * 1024 * 1024,
            rotation_interval: Duration::ZERO,
            max_record_size: 1024 * 1024,
            compute_change_numbers: true,
        }
    }
}

impl ChangelogConfig {
    /// Validates all configuration parameters.
    pub fn validate(&self) -> Result<(), ChangelogError> {
        if self.block_size < MIN_BLOCK_SIZE {
            return Err(ChangelogError::InvalidConfig(format!(
                "block_size must be >= {MIN_BLOCK_SIZE}"
            )));
        }
        if self.max_log_file_size < u64::from(self.block_size) {
            return Err(ChangelogError::InvalidConfig(
                "max_log_file_size must be >= block_size".into(),
            ));
        }
        if self.max_record_size == 0 {
            return Err(ChangelogError::InvalidConfig("max_record_size must be >= 1".into()));
        }
        Ok(())
    }

    /// Converts to the options every log is opened with.
    fn to_log_options(&self, collaborators: &Collaborators) -> LogOptions {
        LogOptions {
            block_size: self.block_size,
            max_record_size: self.max_record_size,
            size_limit_per_file: self.max_log_file_size,
            rotation_interval: self.rotation_interval,
            clock: Arc::clone(&collaborators.clock),
            on_rotation: collaborators.on_rotation.clone(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Shared state
// ------------------------------------------------------------------------------------------------

type ReplicaMap = BTreeMap<Dn, BTreeMap<u16, Arc<FileReplicaDb>>>;

/// Everything the cursors and the indexer read through
/// [`ReplicationDomainDb`]. The indexer itself lives in [`ChangelogDb`] so
/// that it does not keep this state alive.
struct ChangelogInner {
    env: ReplicationEnvironment,
    /// Options of logs opened from now on.
    log_options: RwLock<LogOptions>,
    collaborators: Collaborators,
    replicas: RwLock<ReplicaMap>,
    subscribers: Mutex<BTreeMap<Dn, Vec<DomainCursorHandle>>>,
    cn_index: Arc<FileChangeNumberIndexDb>,
    shutting_down: AtomicBool,
}

impl ChangelogInner {
    fn check_open(&self) -> Result<(), ChangelogError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(ChangelogError::ShuttingDown);
        }
        Ok(())
    }

    fn replica(&self, base_dn: &Dn, server_id: u16) -> Result<Option<Arc<FileReplicaDb>>, ChangelogError> {
        let replicas = self.replicas.read().map_err(poisoned("replica map"))?;
        Ok(replicas.get(base_dn).and_then(|domain| domain.get(&server_id)).cloned())
    }

    fn domain_replicas(&self, base_dn: &Dn) -> Result<Vec<Arc<FileReplicaDb>>, ChangelogError> {
        let replicas = self.replicas.read().map_err(poisoned("replica map"))?;
        Ok(replicas
            .get(base_dn)
            .map(|domain| domain.values().cloned().collect())
            .unwrap_or_default())
    }

    fn all_replicas(&self) -> Result<Vec<Arc<FileReplicaDb>>, ChangelogError> {
        let replicas = self.replicas.read().map_err(poisoned("replica map"))?;
        Ok(replicas.values().flat_map(|domain| domain.values().cloned()).collect())
    }

    fn open_replica(
        &self,
        base_dn: &Dn,
        server_id: u16,
        offline: Option<Csn>,
    ) -> Result<FileReplicaDb, ChangelogError> {
        let parser = Arc::new(ReplicaDbParser::new(Arc::clone(&self.collaborators.crypto)));
        let options = self.log_options.read().map_err(poisoned("log options"))?.clone();
        let log = self.env.open_replica_log(base_dn, server_id, parser, options)?;
        FileReplicaDb::open(
            base_dn.clone(),
            server_id,
            log,
            offline,
            Arc::clone(&self.collaborators.registrar),
        )
    }

    /// Returns the database of a replica, creating it on first use. Open
    /// domain cursors of `base_dn` are told about a new replica.
    fn get_or_create_replica(&self, base_dn: &Dn, server_id: u16) -> Result<Arc<FileReplicaDb>, ChangelogError> {
        if let Some(db) = self.replica(base_dn, server_id)? {
            return Ok(db);
        }
        let db = {
            let mut replicas = self.replicas.write().map_err(poisoned("replica map"))?;
            if let Some(db) = replicas.get(base_dn).and_then(|domain| domain.get(&server_id)) {
                return Ok(Arc::clone(db));
            }
            self.check_open()?;
            let db = Arc::new(self.open_replica(base_dn, server_id, None)?);
            replicas
                .entry(base_dn.clone())
                .or_default()
                .insert(server_id, Arc::clone(&db));
            db
        };
        info!(%base_dn, server_id, "replica db created");

        let mut subscribers = self.subscribers.lock().map_err(poisoned("cursor subscribers"))?;
        if let Some(handles) = subscribers.get_mut(base_dn) {
            handles.retain(|handle| handle.add_replica(server_id, None));
        }
        Ok(db)
    }

    /// Shuts down and forgets every replica of `base_dn`.
    fn remove_replicas(&self, base_dn: &Dn) -> Result<(), ChangelogError> {
        let removed = self
            .replicas
            .write()
            .map_err(poisoned("replica map"))?
            .remove(base_dn)
            .unwrap_or_default();
        for db in removed.values() {
            db.shutdown();
        }
        self.subscribers
            .lock()
            .map_err(poisoned("cursor subscribers"))?
            .remove(base_dn);
        Ok(())
    }
}

impl ReplicationDomainDb for ChangelogInner {
    fn domains(&self) -> Vec<Dn> {
        self.replicas
            .read()
            .map(|replicas| replicas.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn replica_ids(&self, base_dn: &Dn) -> Vec<u16> {
        self.replicas
            .read()
            .ok()
            .and_then(|replicas| replicas.get(base_dn).map(|domain| domain.keys().copied().collect()))
            .unwrap_or_default()
    }

    fn replica_cursor(
        &self,
        base_dn: &Dn,
        server_id: u16,
        start: Option<Csn>,
        options: CursorOptions,
    ) -> Result<UpdateCursor, ChangelogError> {
        let db = self.replica(base_dn, server_id)?.ok_or_else(|| {
            ChangelogError::InvalidArgument(format!("no replica {server_id} in domain {base_dn}"))
        })?;
        Ok(Box::new(db.cursor_from(start, options)?))
    }

    fn subscribe(&self, base_dn: &Dn, handle: DomainCursorHandle) {
        match self.subscribers.lock() {
            Ok(mut subscribers) => {
                let handles = subscribers.entry(base_dn.clone()).or_default();
                handles.retain(DomainCursorHandle::is_alive);
                handles.push(handle);
            }
            Err(_) => warn!(%base_dn, "cursor subscribers lock poisoned, new replicas will not be reported"),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Changelog handle
// ------------------------------------------------------------------------------------------------

/// The main changelog handle.
///
/// Owns the changelog directory, one [`FileReplicaDb`] per replica, the
/// change-number index and the indexer thread.
///
/// # Thread safety
///
/// `ChangelogDb` is `Send + Sync`. Updates of different replicas can be
/// published from different threads while cursors read.
///
/// # Shutdown
///
/// Call [`ChangelogDb::shutdown`] to stop the indexer and release every
/// log. Dropping the handle does the same, logging errors instead of
/// returning them.
pub struct ChangelogDb {
    inner: Arc<ChangelogInner>,
    indexer: Option<ChangeNumberIndexer>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ChangelogDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangelogDb")
            .field("root", &self.inner.env.root())
            .field("indexer", &self.indexer)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ChangelogDb {
    /// Opens (or creates) the changelog rooted at `root`.
    ///
    /// Every replica found on disk is reopened, with the offline state it
    /// was left in. The indexer is started when
    /// [`ChangelogConfig::compute_change_numbers`] is set.
    ///
    /// # Errors
    ///
    /// Returns [`ChangelogError::InvalidConfig`] if any configuration
    /// parameter is out of range, and any error met while reading the
    /// directory back.
    pub fn open(
        root: impl AsRef<Path>,
        config: ChangelogConfig,
        collaborators: Collaborators,
    ) -> Result<Self, ChangelogError> {
        config.validate()?;
        let root = root.as_ref();
        let env = ReplicationEnvironment::open(root)?;
        let log_options = config.to_log_options(&collaborators);
        let state = env.changelog_state()?;

        let cn_parser = Arc::new(ChangeNumberIndexParser::new(Arc::clone(&collaborators.crypto)));
        let cn_log = env.open_change_number_index_log(cn_parser, log_options.clone())?;
        let cn_index = Arc::new(FileChangeNumberIndexDb::open(
            cn_log,
            Arc::clone(&collaborators.registrar),
        )?);

        let inner = Arc::new(ChangelogInner {
            env,
            log_options: RwLock::new(log_options),
            collaborators,
            replicas: RwLock::new(BTreeMap::new()),
            subscribers: Mutex::new(BTreeMap::new()),
            cn_index,
            shutting_down: AtomicBool::new(false),
        });
        {
            let mut replicas = inner.replicas.write().map_err(poisoned("replica map"))?;
            for base_dn in state.domains() {
                for server_id in state.replica_ids(base_dn) {
                    let offline = state.offline_replicas().get_csn(base_dn, server_id);
                    let db = inner.open_replica(base_dn, server_id, offline)?;
                    replicas
                        .entry(base_dn.clone())
                        .or_default()
                        .insert(server_id, Arc::new(db));
                }
            }
        }

        let indexer = if config.compute_change_numbers {
            let indexer = ChangeNumberIndexer::new(
                Arc::clone(&inner) as Arc<dyn ReplicationDomainDb>,
                Arc::clone(&inner.cn_index),
                Arc::clone(&inner.collaborators.ecl_predicate),
                inner.collaborators.listener.clone(),
                state.offline_replicas().clone(),
            );
            indexer.start()?;
            Some(indexer)
        } else {
            None
        };

        info!(
            root = %root.display(),
            domains = state.domains().count(),
            change_numbers = config.compute_change_numbers,
            "changelog opened"
        );
        Ok(Self {
            inner,
            indexer,
            closed: AtomicBool::new(false),
        })
    }

    // --------------------------------------------------------------------------------------------
    // Write operations
    // --------------------------------------------------------------------------------------------

    /// Stores an update in the log of its replica, creating the replica on
    /// first use.
    ///
    /// Returns `false` when the update is not newer than the newest one
    /// stored for the replica, in which case nothing changes. A replica
    /// that was offline is marked online again.
    ///
    /// # Errors
    ///
    /// Returns [`ChangelogError::InvalidArgument`] for a replica offline
    /// marker and [`ChangelogError::ShuttingDown`] after shutdown.
    pub fn publish_update(&self, base_dn: &Dn, update: UpdateMsg) -> Result<bool, ChangelogError> {
        self.inner.check_open()?;
        if update.is_replica_offline() {
            return Err(ChangelogError::InvalidArgument(
                "replica offline markers are published through replica_offline".into(),
            ));
        }
        let server_id = update.csn().server_id();
        let db = self.inner.get_or_create_replica(base_dn, server_id)?;
        if !db.add(update.clone())? {
            return Ok(false);
        }
        if self.inner.env.notify_replica_online(base_dn, server_id)? {
            db.offline_handle().clear();
        }
        if let Some(indexer) = &self.indexer {
            indexer.publish_update_msg(base_dn, &update)?;
        }
        Ok(true)
    }

    /// Records that the replica of `heartbeat` reached that CSN without
    /// publishing a new update.
    pub fn publish_heartbeat(&self, base_dn: &Dn, heartbeat: Csn) -> Result<(), ChangelogError> {
        self.inner.check_open()?;
        if let Some(indexer) = &self.indexer {
            indexer.publish_heartbeat(base_dn, heartbeat)?;
        }
        Ok(())
    }

    /// Records that the replica of `offline` left the topology at that
    /// CSN. The state is persisted, and cursors on the replica report an
    /// offline marker once they have returned its updates.
    pub fn replica_offline(&self, base_dn: &Dn, offline: Csn) -> Result<(), ChangelogError> {
        self.inner.check_open()?;
        let db = self.inner.get_or_create_replica(base_dn, offline.server_id())?;
        self.inner.env.notify_replica_offline(base_dn, offline)?;
        db.offline_handle().set_offline(offline);
        if let Some(indexer) = &self.indexer {
            indexer.replica_offline(base_dn, offline)?;
        }
        Ok(())
    }

    /// Deletes, in every replica and in the change-number index, the
    /// files holding only changes older than `csn`. Returns the oldest
    /// remaining change number.
    ///
    /// While change numbers are computed, the replicas of ECL-enabled
    /// domains are purged no further than the oldest change still in the
    /// index, so updates the indexer has not reached yet are kept.
    pub fn purge_up_to(&self, csn: &Csn) -> Result<Option<u64>, ChangelogError> {
        self.inner.check_open()?;
        let oldest = self.inner.cn_index.purge_up_to(csn)?;
        let indexed_bound = match &self.indexer {
            Some(indexer) => Some(self.indexed_purge_bound(indexer, csn)?),
            None => None,
        };

        let predicate = &self.inner.collaborators.ecl_predicate;
        for db in self.inner.all_replicas()? {
            let bound = match indexed_bound {
                Some(bound) if predicate.is_ecl_enabled_domain(db.base_dn()) => bound,
                _ => Some(*csn),
            };
            if let Some(bound) = bound {
                db.purge_up_to(&bound)?;
            }
        }
        info!(%csn, bound = ?indexed_bound.flatten(), oldest_change_number = ?oldest, "changelog purged");
        Ok(oldest)
    }

    /// Newest CSN the indexed replicas may be purged to, `None` when
    /// nothing has been indexed yet.
    fn indexed_purge_bound(&self, indexer: &ChangeNumberIndexer, csn: &Csn) -> Result<Option<Csn>, ChangelogError> {
        let Some(oldest_indexed) = self.inner.cn_index.oldest_record()?.map(|record| record.csn) else {
            return Ok(None);
        };
        let mut bound = oldest_indexed.min(*csn);
        if let Some(consistency) = indexer.medium_consistency_csn()? {
            bound = bound.min(consistency);
        }
        Ok(Some(bound))
    }

    /// Removes every replica of `base_dn` along with its directory.
    pub fn remove_domain(&self, base_dn: &Dn) -> Result<(), ChangelogError> {
        self.inner.check_open()?;
        if let Some(indexer) = &self.indexer {
            indexer.clear_domain(Some(base_dn))?;
        }
        self.inner.remove_replicas(base_dn)?;
        self.inner.env.remove_domain(base_dn)?;
        info!(%base_dn, "domain removed");
        Ok(())
    }

    /// Persists the generation id of `base_dn`. A domain whose generation
    /// changes loses every stored update.
    pub fn set_generation_id(&self, base_dn: &Dn, generation_id: u64) -> Result<(), ChangelogError> {
        self.inner.check_open()?;
        let previous = self.inner.env.set_generation_id(base_dn, generation_id)?;
        if previous.is_none() || previous == Some(generation_id) {
            return Ok(());
        }
        if let Some(indexer) = &self.indexer {
            indexer.clear_domain(Some(base_dn))?;
        }
        for db in self.inner.domain_replicas(base_dn)? {
            db.clear()?;
        }
        info!(%base_dn, generation_id, ?previous, "generation changed, domain cleared");
        Ok(())
    }

    /// Empties every replica and the change-number index. Numbering
    /// restarts at 1 and the domains stay known.
    pub fn clear(&self) -> Result<(), ChangelogError> {
        self.inner.check_open()?;
        if let Some(indexer) = &self.indexer {
            indexer.clear_domain(None)?;
        }
        for db in self.inner.all_replicas()? {
            db.clear()?;
        }
        self.inner.cn_index.clear()?;
        info!("changelog cleared");
        Ok(())
    }

    /// Changes the time-based rotation interval of every log, including
    /// logs created later. Zero disables it.
    pub fn set_rotation_interval(&self, interval: Duration) -> Result<(), ChangelogError> {
        self.inner.check_open()?;
        self.inner
            .log_options
            .write()
            .map_err(poisoned("log options"))?
            .rotation_interval = interval;
        for db in self.inner.all_replicas()? {
            db.set_rotation_interval(interval);
        }
        self.inner.cn_index.set_rotation_interval(interval);
        debug!(?interval, "rotation interval changed");
        Ok(())
    }

    /// A generator of CSNs for the local replica `server_id`, reading the
    /// changelog's clock.
    pub fn csn_generator(&self, server_id: u16) -> CsnGenerator {
        CsnGenerator::new(server_id, Arc::clone(&self.inner.collaborators.clock))
    }

    // --------------------------------------------------------------------------------------------
    // Read operations
    // --------------------------------------------------------------------------------------------

    /// Cursor over the updates of one replica. `None` starts at its first
    /// update.
    pub fn replica_cursor(
        &self,
        base_dn: &Dn,
        server_id: u16,
        start: Option<Csn>,
        options: CursorOptions,
    ) -> Result<ReplicaCursor, ChangelogError> {
        self.inner.check_open()?;
        let db = self.inner.replica(base_dn, server_id)?.ok_or_else(|| {
            ChangelogError::InvalidArgument(format!("no replica {server_id} in domain {base_dn}"))
        })?;
        let cursor = db.cursor_from(start, options)?;
        debug!(%base_dn, server_id, ?start, "replica cursor opened");
        Ok(cursor)
    }

    /// Cursor over every replica of `base_dn` in CSN order, each one
    /// resuming from its CSN in `start`.
    pub fn domain_cursor(
        &self,
        base_dn: &Dn,
        start: &ServerState,
        options: CursorOptions,
    ) -> Result<DomainDbCursor, ChangelogError> {
        self.inner.check_open()?;
        DomainDbCursor::open(self.domain_db(), base_dn, start, options)
    }

    /// Cursor over every domain in CSN order, each record tagged with its
    /// domain.
    pub fn multi_domain_cursor(
        &self,
        start: &MultiDomainServerState,
        options: CursorOptions,
    ) -> Result<MultiDomainDbCursor, ChangelogError> {
        self.inner.check_open()?;
        MultiDomainDbCursor::open(self.domain_db(), start, options)
    }

    /// Cursor over the change-number index, starting at `change_number`.
    pub fn change_number_cursor(
        &self,
        change_number: u64,
    ) -> Result<LogCursor<u64, ChangeNumberIndexRecord>, ChangelogError> {
        self.inner.check_open()?;
        self.inner.cn_index.cursor_from(change_number)
    }

    pub fn oldest_change_number(&self) -> Result<Option<u64>, ChangelogError> {
        self.inner.cn_index.oldest_change_number()
    }

    pub fn newest_change_number(&self) -> Result<Option<u64>, ChangelogError> {
        self.inner.cn_index.newest_change_number()
    }

    /// Cookie resuming right after the newest indexed change. Empty when
    /// change numbers are not computed.
    pub fn medium_consistency_cookie(&self) -> Result<MultiDomainServerState, ChangelogError> {
        match &self.indexer {
            Some(indexer) => indexer.medium_consistency_cookie(),
            None => Ok(MultiDomainServerState::new()),
        }
    }

    /// Every domain with at least one replica.
    pub fn domains(&self) -> Vec<Dn> {
        self.inner.domains()
    }

    /// The oldest and newest CSN of each replica of `base_dn`.
    pub fn domain_bounds(&self, base_dn: &Dn) -> Result<(ServerState, ServerState), ChangelogError> {
        let mut oldest = ServerState::new();
        let mut newest = ServerState::new();
        for db in self.inner.domain_replicas(base_dn)? {
            if let Some(csn) = db.oldest_csn()? {
                oldest.update(csn);
            }
            if let Some(csn) = db.newest_csn()? {
                newest.update(csn);
            }
        }
        Ok((oldest, newest))
    }

    /// The persisted state of the changelog directory.
    pub fn changelog_state(&self) -> Result<ChangelogState, ChangelogError> {
        self.inner.env.changelog_state()
    }

    fn domain_db(&self) -> Arc<dyn ReplicationDomainDb> {
        Arc::clone(&self.inner) as Arc<dyn ReplicationDomainDb>
    }

    // --------------------------------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------------------------------

    /// Stops the indexer, shuts every database down and releases their
    /// logs.
    ///
    /// Returns the error that stopped the indexer, if any. Subsequent
    /// writes return [`ChangelogError::ShuttingDown`]. Calling `shutdown`
    /// more than once is harmless.
    pub fn shutdown(&self) -> Result<(), ChangelogError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.shutting_down.store(true, Ordering::Release);

        let indexer_result = match &self.indexer {
            Some(indexer) => indexer.shutdown(),
            None => Ok(()),
        };

        let replicas = std::mem::take(&mut *self.inner.replicas.write().map_err(poisoned("replica map"))?);
        for db in replicas.values().flat_map(BTreeMap::values) {
            db.shutdown();
        }
        drop(replicas);
        self.inner.cn_index.shutdown();
        self.inner
            .subscribers
            .lock()
            .map_err(poisoned("cursor subscribers"))?
            .clear();

        info!(root = %self.inner.env.root().display(), "changelog shut down");
        indexer_result
    }
}

impl Drop for ChangelogDb {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "changelog shut down with an error");
        }
    }
}
