//! Cursor composition over replica logs.
//!
//! ```text
//! EclMultiDomainDbCursor        drops domains not enabled for the ECL
//!   └─ MultiDomainDbCursor      merges domains, tags records with their DN
//!        └─ DomainDbCursor      merges the replicas of one domain
//!             └─ ReplicaCursor  one replica log + offline marker
//! ```
//!
//! Every level is a [`DbCursor`]: `next()` advances and reports whether a
//! record is available, `record()` peeks at it without consuming.
//! Merging levels are built on [`CompositeDbCursor`], which always
//! returns the smallest CSN among its sources.

mod composite;
mod domain;
mod ecl;
mod multi_domain;
mod replica;

#[cfg(test)]
pub(crate) mod tests;

pub use composite::CompositeDbCursor;
pub use domain::{DomainCursorHandle, DomainDbCursor};
pub use ecl::EclMultiDomainDbCursor;
pub use multi_domain::MultiDomainDbCursor;
pub use replica::{ReplicaCursor, ReplicaOfflineHandle};

use crate::error::ChangelogError;
use crate::log::{KeyMatchingStrategy, PositionStrategy};
use crate::replication::{Csn, Dn, UpdateMsg};

/// A forward-only cursor over changelog records.
pub trait DbCursor {
    type Item;

    /// The current record, `None` before the first `next()` and once the
    /// cursor is exhausted.
    fn record(&self) -> Option<&Self::Item>;

    /// Moves to the next record. Returns whether one is available.
    fn next(&mut self) -> Result<bool, ChangelogError>;

    /// Polls sources that were exhausted without consuming the current
    /// record. A merging cursor whose sources received an older record
    /// meanwhile makes that record current.
    fn refresh(&mut self) -> Result<(), ChangelogError> {
        Ok(())
    }

    /// Releases the resources held by the cursor.
    fn close(&mut self);
}

impl<C: DbCursor + ?Sized> DbCursor for Box<C> {
    type Item = C::Item;

    fn record(&self) -> Option<&Self::Item> {
        (**self).record()
    }

    fn next(&mut self) -> Result<bool, ChangelogError> {
        (**self).next()
    }

    fn refresh(&mut self) -> Result<(), ChangelogError> {
        (**self).refresh()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// A cursor over the updates of one replica.
pub type UpdateCursor = Box<dyn DbCursor<Item = UpdateMsg> + Send>;

/// How replica cursors are positioned relative to their start CSN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorOptions {
    pub matching: KeyMatchingStrategy,
    pub positioning: PositionStrategy,
}

impl CursorOptions {
    pub fn new(matching: KeyMatchingStrategy, positioning: PositionStrategy) -> Self {
        Self {
            matching,
            positioning,
        }
    }
}

/// Resumes right after the start CSN, or after the closest older one.
impl Default for CursorOptions {
    fn default() -> Self {
        Self::new(KeyMatchingStrategy::LessThanOrEqualToKey, PositionStrategy::AfterMatchingKey)
    }
}

/// The domain-level database the cursors are built from.
pub trait ReplicationDomainDb: Send + Sync {
    /// Every known domain.
    fn domains(&self) -> Vec<Dn>;

    /// Every replica with a log in `base_dn`.
    fn replica_ids(&self, base_dn: &Dn) -> Vec<u16>;

    /// Opens a cursor on one replica. `None` starts at its first record.
    fn replica_cursor(
        &self,
        base_dn: &Dn,
        server_id: u16,
        start: Option<Csn>,
        options: CursorOptions,
    ) -> Result<UpdateCursor, ChangelogError>;

    /// Asks to be told about replicas created later in `base_dn`.
    fn subscribe(&self, base_dn: &Dn, handle: DomainCursorHandle);
}
