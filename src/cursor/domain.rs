//! Merge of the replica cursors of one domain.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};

use tracing::debug;

use super::{CompositeDbCursor, CursorOptions, DbCursor, ReplicationDomainDb, UpdateCursor};
use crate::error::{ChangelogError, poisoned};
use crate::replication::{Csn, Dn, ServerState, UpdateMsg};

/// Replica changes requested from outside the cursor: `Some(start)` adds
/// the replica, `None` removes it.
type PendingChanges = BTreeMap<u16, Option<Option<Csn>>>;

/// Lets other threads add replicas to an open [`DomainDbCursor`].
#[derive(Debug, Clone)]
pub struct DomainCursorHandle {
    pending: Weak<Mutex<PendingChanges>>,
}

impl DomainCursorHandle {
    /// Schedules `server_id` to join the cursor from `start`. Returns
    /// `false` once the cursor is gone.
    pub fn add_replica(&self, server_id: u16, start: Option<Csn>) -> bool {
        self.push(server_id, Some(start))
    }

    /// Schedules `server_id` to leave the cursor.
    pub fn remove_replica(&self, server_id: u16) -> bool {
        self.push(server_id, None)
    }

    pub fn is_alive(&self) -> bool {
        self.pending.strong_count() > 0
    }

    fn push(&self, server_id: u16, change: Option<Option<Csn>>) -> bool {
        let Some(pending) = self.pending.upgrade() else {
            return false;
        };
        match pending.lock() {
            Ok(mut pending) => {
                pending.insert(server_id, change);
                true
            }
            Err(_) => false,
        }
    }
}

/// Returns the updates of every replica of one domain in CSN order.
pub struct DomainDbCursor {
    base_dn: Dn,
    db: Arc<dyn ReplicationDomainDb>,
    options: CursorOptions,
    composite: CompositeDbCursor<UpdateCursor, u16>,
    pending: Arc<Mutex<PendingChanges>>,
}

impl DomainDbCursor {
    /// Opens a cursor over every replica of `base_dn`. Each replica
    /// starts at its CSN in `start`, or at its first record when `start`
    /// has none.
    pub fn open(
        db: Arc<dyn ReplicationDomainDb>,
        base_dn: &Dn,
        start: &ServerState,
        options: CursorOptions,
    ) -> Result<Self, ChangelogError> {
        let cursor = Self::new(Arc::clone(&db), base_dn.clone(), options);
        db.subscribe(base_dn, cursor.handle());
        for server_id in db.replica_ids(base_dn) {
            cursor.handle().add_replica(server_id, start.get(server_id));
        }
        debug!(base_dn = %base_dn, start = %start, "domain cursor opened");
        Ok(cursor)
    }

    /// A cursor with no replica yet.
    pub fn new(db: Arc<dyn ReplicationDomainDb>, base_dn: Dn, options: CursorOptions) -> Self {
        Self {
            base_dn,
            db,
            options,
            composite: CompositeDbCursor::new(),
            pending: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn base_dn(&self) -> &Dn {
        &self.base_dn
    }

    pub fn handle(&self) -> DomainCursorHandle {
        DomainCursorHandle {
            pending: Arc::downgrade(&self.pending),
        }
    }

    /// Adds a replica starting at `start`. Takes effect on the next `next()`.
    pub fn add_replica(&mut self, server_id: u16, start: Option<Csn>) {
        self.handle().add_replica(server_id, start);
    }

    /// Removes a replica. Takes effect on the next `next()`.
    pub fn remove_replica(&mut self, server_id: u16) {
        self.handle().remove_replica(server_id);
    }

    /// Replica the current record comes from.
    pub fn server_id(&self) -> Option<u16> {
        self.composite.data().copied()
    }

    fn apply_pending(&mut self) -> Result<(), ChangelogError> {
        let changes = std::mem::take(&mut *self.pending.lock().map_err(poisoned("domain cursor"))?);
        for (server_id, change) in changes {
            match change {
                Some(start) if !self.composite.contains(&server_id) => {
                    let cursor = self
                        .db
                        .replica_cursor(&self.base_dn, server_id, start, self.options)?;
                    self.composite.add_cursor(cursor, server_id);
                }
                Some(_) => {}
                None => {
                    self.composite.remove_cursor(&server_id);
                }
            }
        }
        Ok(())
    }
}

impl DbCursor for DomainDbCursor {
    type Item = UpdateMsg;

    fn record(&self) -> Option<&UpdateMsg> {
        self.composite.record()
    }

    fn next(&mut self) -> Result<bool, ChangelogError> {
        self.apply_pending()?;
        self.composite.next()
    }

    fn refresh(&mut self) -> Result<(), ChangelogError> {
        self.apply_pending()?;
        self.composite.refresh()
    }

    fn close(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
        self.composite.close();
    }
}

impl std::fmt::Debug for DomainDbCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainDbCursor")
            .field("base_dn", &self.base_dn)
            .field("replicas", &self.composite)
            .finish_non_exhaustive()
    }
}
