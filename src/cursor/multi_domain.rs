//! Merge of several domain cursors.

use std::sync::Arc;

use super::{CompositeDbCursor, CursorOptions, DbCursor, DomainDbCursor, ReplicationDomainDb};
use crate::error::ChangelogError;
use crate::replication::{Dn, MultiDomainServerState, ServerState, UpdateMsg};

/// Returns the updates of several domains in CSN order, each tagged with
/// its domain.
pub struct MultiDomainDbCursor {
    db: Arc<dyn ReplicationDomainDb>,
    options: CursorOptions,
    composite: CompositeDbCursor<DomainDbCursor, Dn>,
}

impl MultiDomainDbCursor {
    pub fn new(db: Arc<dyn ReplicationDomainDb>, options: CursorOptions) -> Self {
        Self {
            db,
            options,
            composite: CompositeDbCursor::new(),
        }
    }

    /// Opens a cursor over every known domain, each starting at its
    /// state in `start`.
    pub fn open(
        db: Arc<dyn ReplicationDomainDb>,
        start: &MultiDomainServerState,
        options: CursorOptions,
    ) -> Result<Self, ChangelogError> {
        let mut cursor = Self::new(Arc::clone(&db), options);
        for base_dn in db.domains() {
            cursor.add_domain(&base_dn, start.get(&base_dn))?;
        }
        Ok(cursor)
    }

    /// Adds a domain. Takes effect on the next `next()`.
    pub fn add_domain(&mut self, base_dn: &Dn, start: Option<&ServerState>) -> Result<(), ChangelogError> {
        if self.composite.contains(base_dn) {
            return Ok(());
        }
        let empty = ServerState::new();
        let domain = DomainDbCursor::open(Arc::clone(&self.db), base_dn, start.unwrap_or(&empty), self.options)?;
        self.composite.add_cursor(domain, base_dn.clone());
        Ok(())
    }

    pub fn remove_domain(&mut self, base_dn: &Dn) -> bool {
        self.composite.remove_cursor(base_dn)
    }

    /// Domain of the current record.
    pub fn data(&self) -> Option<&Dn> {
        self.composite.data()
    }

    /// Replica of the current record.
    pub fn server_id(&self) -> Option<u16> {
        self.composite.current_cursor().and_then(DomainDbCursor::server_id)
    }

    pub fn domains(&self) -> impl Iterator<Item = &Dn> {
        self.composite.tags()
    }
}

impl DbCursor for MultiDomainDbCursor {
    type Item = UpdateMsg;

    fn record(&self) -> Option<&UpdateMsg> {
        self.composite.record()
    }

    fn next(&mut self) -> Result<bool, ChangelogError> {
        self.composite.next()
    }

    fn refresh(&mut self) -> Result<(), ChangelogError> {
        self.composite.refresh()
    }

    fn close(&mut self) {
        self.composite.close();
    }
}

impl std::fmt::Debug for MultiDomainDbCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiDomainDbCursor")
            .field("domains", &self.composite)
            .finish_non_exhaustive()
    }
}
