//! Newest CSN per replica, for one domain or for several.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt;
use std::str::FromStr;

use super::{Csn, Dn};
use crate::error::ChangelogError;

/// Newest known CSN of each replica of one domain.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ServerState {
    csns: BTreeMap<u16, Csn>,
}

impl ServerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `csn` unless the state already holds a newer or equal CSN
    /// for its replica. Returns whether the state changed.
    pub fn update(&mut self, csn: Csn) -> bool {
        match self.csns.entry(csn.server_id()) {
            Entry::Vacant(e) => {
                e.insert(csn);
                true
            }
            Entry::Occupied(mut e) if csn > *e.get() => {
                e.insert(csn);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    pub fn get(&self, server_id: u16) -> Option<Csn> {
        self.csns.get(&server_id).copied()
    }

    /// Removes the entry of `csn`'s replica, but only if it holds exactly
    /// `csn`.
    pub fn remove_csn(&mut self, csn: &Csn) -> bool {
        if self.csns.get(&csn.server_id()) == Some(csn) {
            self.csns.remove(&csn.server_id());
            true
        } else {
            false
        }
    }

    pub fn server_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.csns.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Csn> {
        self.csns.values()
    }

    pub fn len(&self) -> usize {
        self.csns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.csns.is_empty()
    }
}

impl FromIterator<Csn> for ServerState {
    fn from_iter<I: IntoIterator<Item = Csn>>(iter: I) -> Self {
        let mut state = Self::new();
        for csn in iter {
            state.update(csn);
        }
        state
    }
}

/// Space-separated CSNs.
impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, csn) in self.csns.values().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{csn}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerState({self})")
    }
}

impl FromStr for ServerState {
    type Err = ChangelogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split_whitespace().map(Csn::from_str).collect()
    }
}

// ------------------------------------------------------------------------------------------------
// Multi-domain
// ------------------------------------------------------------------------------------------------

/// A [`ServerState`] per replication domain.
///
/// Its text form `dn1:csn csn;dn2:csn;` is the cookie of the external
/// changelog.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct MultiDomainServerState {
    domains: BTreeMap<Dn, ServerState>,
}

impl MultiDomainServerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Same rule as [`ServerState::update`], within `base_dn`.
    pub fn update(&mut self, base_dn: &Dn, csn: Csn) -> bool {
        self.domains.entry(base_dn.clone()).or_default().update(csn)
    }

    /// Replaces the whole state of `base_dn`.
    pub fn update_domain(&mut self, base_dn: &Dn, state: ServerState) {
        self.domains.insert(base_dn.clone(), state);
    }

    pub fn get(&self, base_dn: &Dn) -> Option<&ServerState> {
        self.domains.get(base_dn)
    }

    pub fn get_csn(&self, base_dn: &Dn, server_id: u16) -> Option<Csn> {
        self.domains.get(base_dn).and_then(|state| state.get(server_id))
    }

    /// Same rule as [`ServerState::remove_csn`], within `base_dn`.
    pub fn remove_csn(&mut self, base_dn: &Dn, csn: &Csn) -> bool {
        let Some(state) = self.domains.get_mut(base_dn) else {
            return false;
        };
        let removed = state.remove_csn(csn);
        if state.is_empty() {
            self.domains.remove(base_dn);
        }
        removed
    }

    pub fn remove_domain(&mut self, base_dn: &Dn) -> Option<ServerState> {
        self.domains.remove(base_dn)
    }

    pub fn clear(&mut self) {
        self.domains.clear();
    }

    pub fn domains(&self) -> impl Iterator<Item = &Dn> {
        self.domains.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Dn, &ServerState)> {
        self.domains.iter()
    }

    /// Every (domain, CSN) pair.
    pub fn csns(&self) -> impl Iterator<Item = (&Dn, &Csn)> {
        self.domains
            .iter()
            .flat_map(|(dn, state)| state.iter().map(move |csn| (dn, csn)))
    }

    pub fn is_empty(&self) -> bool {
        self.domains.values().all(ServerState::is_empty)
    }

    /// The oldest CSN of the state, skipping replicas whose CSN is equal
    /// to their CSN in `excluded`.
    pub fn oldest_csn_excluding(&self, excluded: &MultiDomainServerState) -> Option<Csn> {
        self.csns()
            .filter(|(dn, csn)| excluded.get_csn(dn, csn.server_id()) != Some(**csn))
            .map(|(_, csn)| *csn)
            .min()
    }
}

impl fmt::Display for MultiDomainServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (dn, state) in &self.domains {
            write!(f, "{dn}:{state};")?;
        }
        Ok(())
    }
}

impl fmt::Debug for MultiDomainServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MultiDomainServerState({self})")
    }
}

impl FromStr for MultiDomainServerState {
    type Err = ChangelogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut state = Self::new();
        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (dn, csns) = part
                .rsplit_once(':')
                .ok_or_else(|| ChangelogError::Decode(format!("invalid cookie part {part:?}")))?;
            state.update_domain(&Dn::from(dn.trim()), csns.parse()?);
        }
        Ok(state)
    }
}
