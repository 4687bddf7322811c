//! The change-number index: a dense, gap-free numbering of the changes
//! of all ECL-enabled domains, in CSN order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use super::{Counters, seal, unseal};
use crate::encoding;
use crate::error::{ChangelogError, poisoned};
use crate::log::{KeyMatchingStrategy, Log, LogCursor, PositionStrategy, Record, RecordParser};
use crate::ports::{CryptoSuite, MonitorProvider, MonitorRegistrar};
use crate::replication::{ChangeNumberIndexRecord, Csn, Dn};

/// Monitor registration name of the change-number index.
const MONITOR_NAME: &str = "change-number-index-db";

/// Codec of change-number index records. The key is the change number.
pub struct ChangeNumberIndexParser {
    crypto: Arc<dyn CryptoSuite>,
}

impl ChangeNumberIndexParser {
    pub fn new(crypto: Arc<dyn CryptoSuite>) -> Self {
        Self { crypto }
    }
}

impl RecordParser<u64, ChangeNumberIndexRecord> for ChangeNumberIndexParser {
    fn encode_record(&self, record: &Record<u64, ChangeNumberIndexRecord>) -> Result<Vec<u8>, ChangelogError> {
        seal(self.crypto.as_ref(), encoding::encode_to_vec(record.value())?)
    }

    fn decode_record(&self, bytes: &[u8]) -> Result<Record<u64, ChangeNumberIndexRecord>, ChangelogError> {
        let plain = unseal(self.crypto.as_ref(), bytes)?;
        let entry = encoding::decode_exact::<ChangeNumberIndexRecord>(&plain)?;
        Ok(Record::new(entry.change_number, entry))
    }

    fn encode_key_to_string(&self, key: &u64) -> String {
        key.to_string()
    }

    fn decode_key_from_string(&self, s: &str) -> Result<u64, ChangelogError> {
        s.parse()
            .map_err(|_| ChangelogError::Decode(format!("invalid change number {s:?}")))
    }

    fn max_key(&self) -> u64 {
        u64::MAX
    }
}

struct ChangeNumberIndexMonitor {
    counters: Arc<Counters<u64>>,
}

impl MonitorProvider for ChangeNumberIndexMonitor {
    fn monitor_data(&self) -> Vec<(String, String)> {
        let Ok(counters) = self.counters.snapshot() else {
            return Vec::new();
        };
        vec![
            ("first-change-number".to_string(), counters.first.unwrap_or(0).to_string()),
            ("last-change-number".to_string(), counters.last.unwrap_or(0).to_string()),
            ("record-count".to_string(), counters.count.to_string()),
        ]
    }
}

/// Change-number index stored in a [`Log`].
///
/// Change numbers start at 1 and grow by one per record. The counter
/// survives restarts because it is recomputed from the newest record.
pub struct FileChangeNumberIndexDb {
    log: Log<u64, ChangeNumberIndexRecord>,
    counters: Arc<Counters<u64>>,
    /// Next change number to assign. Held while appending so that numbers
    /// are assigned in append order.
    next_change_number: Mutex<u64>,
    shutting_down: AtomicBool,
    registrar: Arc<dyn MonitorRegistrar>,
}

impl FileChangeNumberIndexDb {
    pub fn open(
        log: Log<u64, ChangeNumberIndexRecord>,
        registrar: Arc<dyn MonitorRegistrar>,
    ) -> Result<Self, ChangelogError> {
        let first = log.oldest_record()?.map(|record| *record.key());
        let last = log.newest_record()?.map(|record| *record.key());
        let count = log.number_of_records()?;
        let counters = Arc::new(Counters::new(first, last, count));
        registrar.register(
            MONITOR_NAME,
            Arc::new(ChangeNumberIndexMonitor {
                counters: Arc::clone(&counters),
            }),
        );
        info!(path = %log.path().display(), ?first, ?last, "change number index opened");

        Ok(Self {
            log,
            counters,
            next_change_number: Mutex::new(last.map_or(1, |last| last + 1)),
            shutting_down: AtomicBool::new(false),
            registrar,
        })
    }

    /// Appends an entry for `csn` of `base_dn` and returns the change
    /// number assigned to it.
    pub fn add_record(&self, base_dn: &Dn, csn: Csn) -> Result<u64, ChangelogError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(ChangelogError::ShuttingDown);
        }
        let mut next = self
            .next_change_number
            .lock()
            .map_err(poisoned("change number counter"))?;
        let change_number = *next;
        let entry = ChangeNumberIndexRecord::new(change_number, base_dn.clone(), csn);
        let mut counters = self.counters.lock()?;
        if !self.log.append(Record::new(change_number, entry))? {
            return Err(ChangelogError::Internal(format!(
                "change number {change_number} refused by the index log"
            )));
        }
        *next += 1;
        counters.appended(change_number);
        debug!(change_number, %base_dn, %csn, "change number assigned");
        Ok(change_number)
    }

    /// Cursor starting at `change_number`, or at the first change number
    /// after it when that one has been purged.
    pub fn cursor_from(&self, change_number: u64) -> Result<LogCursor<u64, ChangeNumberIndexRecord>, ChangelogError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(ChangelogError::ShuttingDown);
        }
        self.log.cursor_from(
            Some(&change_number),
            KeyMatchingStrategy::GreaterThanOrEqualToKey,
            PositionStrategy::OnMatchingKey,
        )
    }

    pub fn oldest_record(&self) -> Result<Option<ChangeNumberIndexRecord>, ChangelogError> {
        Ok(self.log.oldest_record()?.map(Record::into_value))
    }

    pub fn newest_record(&self) -> Result<Option<ChangeNumberIndexRecord>, ChangelogError> {
        Ok(self.log.newest_record()?.map(Record::into_value))
    }

    pub fn oldest_change_number(&self) -> Result<Option<u64>, ChangelogError> {
        Ok(self.counters.snapshot()?.first)
    }

    pub fn newest_change_number(&self) -> Result<Option<u64>, ChangelogError> {
        Ok(self.counters.snapshot()?.last)
    }

    pub fn number_of_records(&self) -> Result<u64, ChangelogError> {
        Ok(self.counters.snapshot()?.count)
    }

    pub fn is_empty(&self) -> Result<bool, ChangelogError> {
        Ok(self.number_of_records()? == 0)
    }

    /// Deletes the files preceding the one holding the newest entry whose
    /// CSN is `<= csn`. Returns the oldest remaining change number.
    pub fn purge_up_to(&self, csn: &Csn) -> Result<Option<u64>, ChangelogError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(ChangelogError::ShuttingDown);
        }
        let Some(boundary) = self
            .log
            .find_boundary_key_from_record(|record| record.value().csn, csn)?
        else {
            return self.oldest_change_number();
        };
        let mut counters = self.counters.lock()?;
        let oldest = self.log.purge_up_to(&boundary)?.map(|record| *record.key());
        counters.purged(oldest, self.log.number_of_records()?);
        Ok(oldest)
    }

    /// Removes every entry and restarts numbering at 1.
    pub fn clear(&self) -> Result<(), ChangelogError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(ChangelogError::ShuttingDown);
        }
        let mut next = self
            .next_change_number
            .lock()
            .map_err(poisoned("change number counter"))?;
        let mut counters = self.counters.lock()?;
        self.log.clear()?;
        *next = 1;
        counters.purged(None, 0);
        info!("change number index cleared");
        Ok(())
    }

    /// Changes the time-based rotation interval of the index log.
    pub fn set_rotation_interval(&self, interval: Duration) {
        self.log.set_rotation_interval(interval);
    }

    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.registrar.deregister(MONITOR_NAME);
        info!("change number index shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn log(&self) -> &Log<u64, ChangeNumberIndexRecord> {
        &self.log
    }
}

impl Drop for FileChangeNumberIndexDb {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for FileChangeNumberIndexDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileChangeNumberIndexDb")
            .field("path", &self.log.path())
            .finish_non_exhaustive()
    }
}
