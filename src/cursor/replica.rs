//! Cursor over the updates of one replica.

use std::sync::{Arc, Mutex};

use super::DbCursor;
use crate::error::{ChangelogError, poisoned};
use crate::log::{LogCursor, RepositionableCursor};
use crate::replication::{Csn, UpdateMsg};

/// Shared cell holding the CSN at which a replica went offline.
#[derive(Debug, Clone, Default)]
pub struct ReplicaOfflineHandle {
    offline: Arc<Mutex<Option<Csn>>>,
}

impl ReplicaOfflineHandle {
    pub fn new(offline: Option<Csn>) -> Self {
        Self {
            offline: Arc::new(Mutex::new(offline)),
        }
    }

    /// Marks the replica offline as of `csn`.
    pub fn set_offline(&self, csn: Csn) {
        if let Ok(mut offline) = self.offline.lock() {
            *offline = Some(csn);
        }
    }

    /// Marks the replica back online.
    pub fn clear(&self) {
        if let Ok(mut offline) = self.offline.lock() {
            *offline = None;
        }
    }

    pub fn get(&self) -> Option<Csn> {
        self.offline.lock().ok().and_then(|offline| *offline)
    }
}

/// Returns the updates of a replica log, then once exhausted a single
/// [`UpdateMsg::ReplicaOffline`] marker if the replica went offline after
/// the last update returned.
pub struct ReplicaCursor {
    cursor: LogCursor<Csn, UpdateMsg>,
    server_id: u16,
    offline: ReplicaOfflineHandle,
    current: Option<UpdateMsg>,
    last_update: Option<Csn>,
    emitted_offline: Option<Csn>,
}

impl ReplicaCursor {
    pub fn new(cursor: LogCursor<Csn, UpdateMsg>, server_id: u16, offline: ReplicaOfflineHandle) -> Self {
        Self {
            cursor,
            server_id,
            offline,
            current: None,
            last_update: None,
            emitted_offline: None,
        }
    }

    pub fn server_id(&self) -> u16 {
        self.server_id
    }

    pub fn offline_handle(&self) -> ReplicaOfflineHandle {
        self.offline.clone()
    }

    fn next_offline_marker(&mut self) -> Result<Option<UpdateMsg>, ChangelogError> {
        let mut offline = self.offline.offline.lock().map_err(poisoned("replica offline state"))?;
        let Some(csn) = *offline else {
            return Ok(None);
        };
        if self.last_update.is_some_and(|last| csn <= last) {
            // The replica published again after going offline.
            *offline = None;
            return Ok(None);
        }
        if self.emitted_offline == Some(csn) {
            return Ok(None);
        }
        self.emitted_offline = Some(csn);
        Ok(Some(UpdateMsg::replica_offline(csn)))
    }
}

impl DbCursor for ReplicaCursor {
    type Item = UpdateMsg;

    fn record(&self) -> Option<&UpdateMsg> {
        self.current.as_ref()
    }

    fn next(&mut self) -> Result<bool, ChangelogError> {
        if self.cursor.next()? {
            let update = self
                .cursor
                .record()
                .map(|record| record.into_value())
                .ok_or_else(|| ChangelogError::Internal("replica cursor lost its record".into()))?;
            self.last_update = Some(update.csn());
            self.current = Some(update);
            return Ok(true);
        }
        self.current = self.next_offline_marker()?;
        Ok(self.current.is_some())
    }

    fn close(&mut self) {
        self.current = None;
        self.cursor.close();
    }
}

impl std::fmt::Debug for ReplicaCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaCursor")
            .field("server_id", &self.server_id)
            .field("current", &self.current.as_ref().map(UpdateMsg::csn))
            .field("offline", &self.offline.get())
            .finish_non_exhaustive()
    }
}
