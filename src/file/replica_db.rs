//! Log of the updates published by one replica of one domain.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info};

use super::{Counters, seal, unseal};
use crate::cursor::{CursorOptions, ReplicaCursor, ReplicaOfflineHandle};
use crate::encoding;
use crate::error::ChangelogError;
use crate::log::{Log, Record, RecordParser};
use crate::ports::{CryptoSuite, MonitorProvider, MonitorRegistrar};
use crate::replication::{Csn, Dn, UpdateMsg};

/// Codec of replica log records. The key is the update's CSN.
pub struct ReplicaDbParser {
    crypto: Arc<dyn CryptoSuite>,
}

impl ReplicaDbParser {
    pub fn new(crypto: Arc<dyn CryptoSuite>) -> Self {
        Self { crypto }
    }
}

impl RecordParser<Csn, UpdateMsg> for ReplicaDbParser {
    fn encode_record(&self, record: &Record<Csn, UpdateMsg>) -> Result<Vec<u8>, ChangelogError> {
        seal(self.crypto.as_ref(), encoding::encode_to_vec(record.value())?)
    }

    fn decode_record(&self, bytes: &[u8]) -> Result<Record<Csn, UpdateMsg>, ChangelogError> {
        let plain = unseal(self.crypto.as_ref(), bytes)?;
        let update = encoding::decode_exact::<UpdateMsg>(&plain)?;
        Ok(Record::new(update.csn(), update))
    }

    fn encode_key_to_string(&self, key: &Csn) -> String {
        key.to_string()
    }

    fn decode_key_from_string(&self, s: &str) -> Result<Csn, ChangelogError> {
        s.parse()
    }

    fn max_key(&self) -> Csn {
        Csn::MAX
    }
}

struct ReplicaDbMonitor {
    base_dn: Dn,
    server_id: u16,
    counters: Arc<Counters<Csn>>,
}

impl MonitorProvider for ReplicaDbMonitor {
    fn monitor_data(&self) -> Vec<(String, String)> {
        let mut data = vec![
            ("domain-name".to_string(), self.base_dn.to_string()),
            ("replica-id".to_string(), self.server_id.to_string()),
        ];
        if let Ok(counters) = self.counters.snapshot() {
            if let Some(first) = counters.first {
                data.push(("first-change".to_string(), first.to_string()));
            }
            if let Some(last) = counters.last {
                data.push(("last-change".to_string(), last.to_string()));
            }
            data.push(("record-count".to_string(), counters.count.to_string()));
        }
        data
    }
}

/// The changelog of one replica.
///
/// Updates are appended in CSN order. Updates that are not newer than
/// the newest stored one are ignored.
pub struct FileReplicaDb {
    base_dn: Dn,
    server_id: u16,
    log: Log<Csn, UpdateMsg>,
    counters: Arc<Counters<Csn>>,
    offline: ReplicaOfflineHandle,
    shutting_down: AtomicBool,
    registrar: Arc<dyn MonitorRegistrar>,
    monitor_name: String,
}

impl FileReplicaDb {
    /// Wraps an open replica log. The replica starts offline as of
    /// `offline` when given.
    pub fn open(
        base_dn: Dn,
        server_id: u16,
        log: Log<Csn, UpdateMsg>,
        offline: Option<Csn>,
        registrar: Arc<dyn MonitorRegistrar>,
    ) -> Result<Self, ChangelogError> {
        let first = log.oldest_record()?.map(|record| *record.key());
        let last = log.newest_record()?.map(|record| *record.key());
        let count = log.number_of_records()?;
        let counters = Arc::new(Counters::new(first, last, count));

        let monitor_name = format!("replica-db {base_dn} {server_id}");
        registrar.register(
            &monitor_name,
            Arc::new(ReplicaDbMonitor {
                base_dn: base_dn.clone(),
                server_id,
                counters: Arc::clone(&counters),
            }),
        );
        info!(%base_dn, server_id, records = count, path = %log.path().display(), "replica db opened");

        Ok(Self {
            base_dn,
            server_id,
            log,
            counters,
            offline: ReplicaOfflineHandle::new(offline),
            shutting_down: AtomicBool::new(false),
            registrar,
            monitor_name,
        })
    }

    pub fn base_dn(&self) -> &Dn {
        &self.base_dn
    }

    pub fn server_id(&self) -> u16 {
        self.server_id
    }

    /// Appends `update`. Returns `false` when it is not newer than the
    /// newest stored update.
    pub fn add(&self, update: UpdateMsg) -> Result<bool, ChangelogError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(ChangelogError::ShuttingDown);
        }
        if update.is_replica_offline() {
            return Err(ChangelogError::InvalidArgument(
                "replica offline markers are not stored in replica logs".into(),
            ));
        }
        let csn = update.csn();
        if csn.server_id() != self.server_id {
            return Err(ChangelogError::InvalidArgument(format!(
                "update {csn} does not belong to replica {}",
                self.server_id
            )));
        }
        let mut counters = self.counters.lock()?;
        if !self.log.append(Record::new(csn, update))? {
            debug!(base_dn = %self.base_dn, server_id = self.server_id, %csn, "ignoring update older than newest");
            return Ok(false);
        }
        counters.appended(csn);
        Ok(true)
    }

    /// Cursor over the updates of the replica, positioned relative to
    /// `start`. `None` starts at the first stored update.
    pub fn cursor_from(&self, start: Option<Csn>, options: CursorOptions) -> Result<ReplicaCursor, ChangelogError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(ChangelogError::ShuttingDown);
        }
        let cursor = self
            .log
            .cursor_from(start.as_ref(), options.matching, options.positioning)?;
        Ok(ReplicaCursor::new(cursor, self.server_id, self.offline.clone()))
    }

    pub fn oldest_csn(&self) -> Result<Option<Csn>, ChangelogError> {
        Ok(self.counters.snapshot()?.first)
    }

    pub fn newest_csn(&self) -> Result<Option<Csn>, ChangelogError> {
        Ok(self.counters.snapshot()?.last)
    }

    pub fn number_of_records(&self) -> Result<u64, ChangelogError> {
        Ok(self.counters.snapshot()?.count)
    }

    /// The offline state shared with every cursor of this replica.
    pub fn offline_handle(&self) -> ReplicaOfflineHandle {
        self.offline.clone()
    }

    /// Deletes the files holding only updates older than `csn`. Returns
    /// the oldest remaining CSN.
    pub fn purge_up_to(&self, csn: &Csn) -> Result<Option<Csn>, ChangelogError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(ChangelogError::ShuttingDown);
        }
        let mut counters = self.counters.lock()?;
        let oldest = self.log.purge_up_to(csn)?.map(|record| *record.key());
        counters.purged(oldest, self.log.number_of_records()?);
        Ok(oldest)
    }

    /// Removes every update of the replica.
    pub fn clear(&self) -> Result<(), ChangelogError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(ChangelogError::ShuttingDown);
        }
        let mut counters = self.counters.lock()?;
        self.log.clear()?;
        counters.purged(None, 0);
        info!(base_dn = %self.base_dn, server_id = self.server_id, "replica db cleared");
        Ok(())
    }

    /// Changes the time-based rotation interval of the replica log.
    pub fn set_rotation_interval(&self, interval: Duration) {
        self.log.set_rotation_interval(interval);
    }

    /// Rejects further writes and withdraws the monitor. The log itself is
    /// released when the database is dropped.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.registrar.deregister(&self.monitor_name);
        info!(base_dn = %self.base_dn, server_id = self.server_id, "replica db shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn log(&self) -> &Log<Csn, UpdateMsg> {
        &self.log
    }
}

impl Drop for FileReplicaDb {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for FileReplicaDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileReplicaDb")
            .field("base_dn", &self.base_dn)
            .field("server_id", &self.server_id)
            .field("path", &self.log.path())
            .finish_non_exhaustive()
    }
}
