//! Multi-domain cursor restricted to external changelog domains.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::debug;

use super::{DbCursor, MultiDomainDbCursor};
use crate::error::ChangelogError;
use crate::ports::EclEnabledDomainPredicate;
use crate::replication::{Dn, ServerState, UpdateMsg};

/// Wraps a [`MultiDomainDbCursor`] and drops every domain that is not
/// enabled for the external changelog.
///
/// Eligibility is checked on every `next()`. A dropped domain that later
/// becomes enabled is reported by [`should_reinitialize`], since the
/// records it would have contributed are already behind the cursor.
///
/// [`should_reinitialize`]: EclMultiDomainDbCursor::should_reinitialize
pub struct EclMultiDomainDbCursor {
    cursor: MultiDomainDbCursor,
    predicate: Arc<dyn EclEnabledDomainPredicate>,
    ecl_disabled_domains: BTreeSet<Dn>,
}

impl EclMultiDomainDbCursor {
    pub fn new(cursor: MultiDomainDbCursor, predicate: Arc<dyn EclEnabledDomainPredicate>) -> Self {
        Self {
            cursor,
            predicate,
            ecl_disabled_domains: BTreeSet::new(),
        }
    }

    /// Whether a domain dropped earlier is now enabled.
    pub fn should_reinitialize(&self) -> bool {
        self.ecl_disabled_domains
            .iter()
            .any(|dn| self.predicate.is_ecl_enabled_domain(dn))
    }

    pub fn add_domain(&mut self, base_dn: &Dn, start: Option<&ServerState>) -> Result<(), ChangelogError> {
        self.ecl_disabled_domains.remove(base_dn);
        self.cursor.add_domain(base_dn, start)
    }

    pub fn remove_domain(&mut self, base_dn: &Dn) -> bool {
        self.cursor.remove_domain(base_dn)
    }

    /// Drops `base_dn` as if one of its records had been skipped, so that
    /// enabling it again is reported by `should_reinitialize`.
    pub fn disable_domain(&mut self, base_dn: &Dn) {
        debug!(base_dn = %base_dn, "dropping domain not enabled for the external changelog");
        self.cursor.remove_domain(base_dn);
        self.ecl_disabled_domains.insert(base_dn.clone());
    }

    /// Domain of the current record.
    pub fn data(&self) -> Option<&Dn> {
        self.cursor.data()
    }

    /// Domains currently merged.
    pub fn domains(&self) -> impl Iterator<Item = &Dn> {
        self.cursor.domains()
    }

    /// Domains dropped because they are not enabled.
    pub fn disabled_domains(&self) -> impl Iterator<Item = &Dn> {
        self.ecl_disabled_domains.iter()
    }
}

impl DbCursor for EclMultiDomainDbCursor {
    type Item = UpdateMsg;

    fn record(&self) -> Option<&UpdateMsg> {
        self.cursor.record()
    }

    fn next(&mut self) -> Result<bool, ChangelogError> {
        loop {
            if !self.cursor.next()? {
                return Ok(false);
            }
            let Some(base_dn) = self.cursor.data().cloned() else {
                return Ok(true);
            };
            if self.predicate.is_ecl_enabled_domain(&base_dn) {
                return Ok(true);
            }
            self.disable_domain(&base_dn);
        }
    }

    fn refresh(&mut self) -> Result<(), ChangelogError> {
        self.cursor.refresh()?;
        let front_disabled = self
            .cursor
            .data()
            .is_some_and(|base_dn| !self.predicate.is_ecl_enabled_domain(base_dn));
        if front_disabled {
            self.next()?;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.cursor.close();
    }
}

impl std::fmt::Debug for EclMultiDomainDbCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EclMultiDomainDbCursor")
            .field("cursor", &self.cursor)
            .field("ecl_disabled_domains", &self.ecl_disabled_domains)
            .finish_non_exhaustive()
    }
}
