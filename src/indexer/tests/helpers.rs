use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::Receiver;

use crate::cursor::tests::helpers::FakeDomainDb;
use crate::file::FileChangeNumberIndexDb;
use crate::file::tests::helpers::{RecordingRegistrar, open_cn_index_db, open_env};
use crate::indexer::ChangeNumberIndexer;
use crate::ports::{AllDomainsEnabled, ChangeNumberIndexed, ChannelListener, EclEnabledDomainPredicate};
use crate::replication::{Dn, MultiDomainServerState, UpdateMsg};

pub use crate::file::tests::helpers::{csn, dn, init_tracing, update};

/// How long a test waits for an entry it expects.
pub const EXPECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a test waits to be sure nothing else gets indexed.
pub const QUIET_PERIOD: Duration = Duration::from_millis(200);

/// An indexer over an in-memory domain db and a real index on disk.
pub struct Fixture {
    pub db: Arc<FakeDomainDb>,
    pub cn_index: Arc<FileChangeNumberIndexDb>,
    pub indexer: ChangeNumberIndexer,
    pub events: Receiver<ChangeNumberIndexed>,
    predicate: Arc<dyn EclEnabledDomainPredicate>,
    // Keeps the directory alive.
    _env: crate::file::ReplicationEnvironment,
}

impl Fixture {
    pub fn new(root: &std::path::Path) -> Self {
        Self::with_db(root, FakeDomainDb::new(), MultiDomainServerState::new())
    }

    pub fn with_db(root: &std::path::Path, db: Arc<FakeDomainDb>, offline: MultiDomainServerState) -> Self {
        Self::with_predicate(root, db, offline, Arc::new(AllDomainsEnabled))
    }

    pub fn with_predicate(
        root: &std::path::Path,
        db: Arc<FakeDomainDb>,
        offline: MultiDomainServerState,
        predicate: Arc<dyn EclEnabledDomainPredicate>,
    ) -> Self {
        let env = open_env(root);
        let cn_index = Arc::new(open_cn_index_db(&env, Arc::new(RecordingRegistrar::default())));
        let (listener, events) = ChannelListener::new();
        let indexer = ChangeNumberIndexer::new(
            db.clone(),
            Arc::clone(&cn_index),
            Arc::clone(&predicate),
            Some(Arc::new(listener)),
            offline,
        );
        Self {
            db,
            cn_index,
            indexer,
            events,
            predicate,
            _env: env,
        }
    }

    /// Stops the indexer and starts a new one over the same db and index.
    pub fn restart(&mut self) {
        self.indexer.shutdown().unwrap();
        let (listener, events) = ChannelListener::new();
        self.indexer = ChangeNumberIndexer::new(
            self.db.clone(),
            Arc::clone(&self.cn_index),
            Arc::clone(&self.predicate),
            Some(Arc::new(listener)),
            MultiDomainServerState::new(),
        );
        self.events = events;
        self.indexer.start().unwrap();
    }

    /// Stores `msg` in the db, then tells the indexer about it.
    pub fn publish(&self, base_dn: &str, msg: UpdateMsg) {
        self.db.publish(base_dn, msg.clone());
        self.indexer.publish_update_msg(&Dn::from(base_dn), &msg).unwrap();
    }

    pub fn heartbeat(&self, base_dn: &str, timestamp: u64, server_id: u16) {
        self.indexer
            .publish_heartbeat(&Dn::from(base_dn), csn(timestamp, server_id))
            .unwrap();
    }

    /// Waits for `count` entries and checks that no more follow.
    pub fn expect_indexed(&self, count: usize) -> Vec<ChangeNumberIndexed> {
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            match self.events.recv_timeout(EXPECT_TIMEOUT) {
                Ok(event) => out.push(event),
                Err(_) => panic!("only {} of {count} entries indexed", out.len()),
            }
        }
        self.expect_quiet();
        out
    }

    pub fn expect_quiet(&self) {
        if let Ok(event) = self.events.recv_timeout(QUIET_PERIOD) {
            panic!("unexpected entry {event:?}");
        }
    }
}

/// Enables every domain except those switched off at runtime.
#[derive(Default)]
pub struct SwitchableDomains {
    disabled: Mutex<BTreeSet<Dn>>,
}

impl SwitchableDomains {
    pub fn disable(&self, base_dn: &str) {
        self.disabled.lock().unwrap().insert(Dn::from(base_dn));
    }

    pub fn enable(&self, base_dn: &str) {
        self.disabled.lock().unwrap().remove(&Dn::from(base_dn));
    }
}

impl EclEnabledDomainPredicate for SwitchableDomains {
    fn is_ecl_enabled_domain(&self, base_dn: &Dn) -> bool {
        !self.disabled.lock().unwrap().contains(base_dn)
    }
}

/// `(timestamp, server id)` of each event.
pub fn csns_of(events: &[ChangeNumberIndexed]) -> Vec<(u64, u16)> {
    events
        .iter()
        .map(|e| (e.update.csn().timestamp(), e.update.csn().server_id()))
        .collect()
}
