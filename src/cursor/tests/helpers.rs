use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::cursor::{CursorOptions, DbCursor, DomainCursorHandle, ReplicationDomainDb, UpdateCursor};
use crate::error::ChangelogError;
use crate::log::PositionStrategy;
use crate::replication::{Csn, Dn, UpdateMsg};

pub fn csn(timestamp: u64, server_id: u16) -> Csn {
    Csn::new(timestamp, 0, server_id)
}

pub fn update(timestamp: u64, server_id: u16) -> UpdateMsg {
    UpdateMsg::update(csn(timestamp, server_id), format!("change {timestamp}@{server_id}").into_bytes())
}

type Messages = Arc<Mutex<Vec<UpdateMsg>>>;

/// Cursor over an in-memory list that can grow while the cursor is open.
pub struct VecCursor {
    messages: Messages,
    next_index: usize,
    current: Option<UpdateMsg>,
}

impl VecCursor {
    pub fn new(messages: Messages, start: Option<Csn>, options: CursorOptions) -> Self {
        let next_index = match start {
            None => 0,
            Some(start) => {
                let messages = messages.lock().unwrap();
                messages
                    .iter()
                    .position(|m| match options.positioning {
                        PositionStrategy::OnMatchingKey => m.csn() >= start,
                        PositionStrategy::AfterMatchingKey => m.csn() > start,
                    })
                    .unwrap_or(messages.len())
            }
        };
        Self {
            messages,
            next_index,
            current: None,
        }
    }

    pub fn over(messages: Vec<UpdateMsg>) -> Self {
        Self::new(Arc::new(Mutex::new(messages)), None, CursorOptions::default())
    }
}

impl DbCursor for VecCursor {
    type Item = UpdateMsg;

    fn record(&self) -> Option<&UpdateMsg> {
        self.current.as_ref()
    }

    fn next(&mut self) -> Result<bool, ChangelogError> {
        self.current = self.messages.lock().unwrap().get(self.next_index).cloned();
        if self.current.is_some() {
            self.next_index += 1;
        }
        Ok(self.current.is_some())
    }

    fn close(&mut self) {
        self.current = None;
    }
}

/// In-memory domain database.
#[derive(Default)]
pub struct FakeDomainDb {
    replicas: Mutex<BTreeMap<(Dn, u16), Messages>>,
    subscribers: Mutex<Vec<(Dn, DomainCursorHandle)>>,
}

impl FakeDomainDb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Appends `msg` to the replica of `base_dn`, creating it if needed.
    pub fn publish(&self, base_dn: &str, msg: UpdateMsg) {
        let base_dn = Dn::from(base_dn);
        let server_id = msg.csn().server_id();
        let mut replicas = self.replicas.lock().unwrap();
        let created = !replicas.contains_key(&(base_dn.clone(), server_id));
        replicas
            .entry((base_dn.clone(), server_id))
            .or_default()
            .lock()
            .unwrap()
            .push(msg);
        drop(replicas);
        if created {
            for (dn, handle) in self.subscribers.lock().unwrap().iter() {
                if *dn == base_dn {
                    handle.add_replica(server_id, None);
                }
            }
        }
    }
}

impl ReplicationDomainDb for FakeDomainDb {
    fn domains(&self) -> Vec<Dn> {
        let mut domains: Vec<Dn> = self.replicas.lock().unwrap().keys().map(|(dn, _)| dn.clone()).collect();
        domains.dedup();
        domains
    }

    fn replica_ids(&self, base_dn: &Dn) -> Vec<u16> {
        self.replicas
            .lock()
            .unwrap()
            .keys()
            .filter(|(dn, _)| dn == base_dn)
            .map(|(_, sid)| *sid)
            .collect()
    }

    fn replica_cursor(
        &self,
        base_dn: &Dn,
        server_id: u16,
        start: Option<Csn>,
        options: CursorOptions,
    ) -> Result<UpdateCursor, ChangelogError> {
        let messages = self
            .replicas
            .lock()
            .unwrap()
            .entry((base_dn.clone(), server_id))
            .or_default()
            .clone();
        Ok(Box::new(VecCursor::new(messages, start, options)))
    }

    fn subscribe(&self, base_dn: &Dn, handle: DomainCursorHandle) {
        self.subscribers.lock().unwrap().push((base_dn.clone(), handle));
    }
}

/// Drains a cursor into (timestamp, server id) pairs.
pub fn drain<C: DbCursor<Item = UpdateMsg>>(cursor: &mut C) -> Vec<(u64, u16)> {
    let mut out = Vec::new();
    while cursor.next().unwrap() {
        let csn = cursor.record().unwrap().csn();
        out.push((csn.timestamp(), csn.server_id()));
    }
    out
}
