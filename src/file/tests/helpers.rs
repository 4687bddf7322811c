use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing_subscriber::EnvFilter;

use crate::cursor::DbCursor;
use crate::error::ChangelogError;
use crate::file::{
    ChangeNumberIndexParser, FileChangeNumberIndexDb, FileReplicaDb, ReplicaDbParser, ReplicationEnvironment,
};
use crate::log::LogOptions;
use crate::ports::{CryptoSuite, MonitorProvider, MonitorRegistrar, NoEncryption};
use crate::replication::{Csn, Dn, UpdateMsg};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times, only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// XORs every byte with a fixed key.
#[derive(Debug, Default)]
pub struct XorCrypto;

const XOR_KEY: u8 = 0x5a;

impl CryptoSuite for XorCrypto {
    fn is_encrypted(&self) -> bool {
        true
    }

    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, ChangelogError> {
        Ok(data.iter().map(|b| b ^ XOR_KEY).collect())
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, ChangelogError> {
        Ok(data.iter().map(|b| b ^ XOR_KEY).collect())
    }
}

/// Remembers the providers currently registered.
#[derive(Default)]
pub struct RecordingRegistrar {
    providers: Mutex<BTreeMap<String, Arc<dyn MonitorProvider>>>,
}

impl RecordingRegistrar {
    pub fn names(&self) -> Vec<String> {
        self.providers.lock().unwrap().keys().cloned().collect()
    }

    /// Monitor data published under `name`, as a map.
    pub fn data(&self, name: &str) -> BTreeMap<String, String> {
        let providers = self.providers.lock().unwrap();
        providers[name].monitor_data().into_iter().collect()
    }
}

impl MonitorRegistrar for RecordingRegistrar {
    fn register(&self, name: &str, provider: Arc<dyn MonitorProvider>) {
        self.providers.lock().unwrap().insert(name.to_string(), provider);
    }

    fn deregister(&self, name: &str) {
        self.providers.lock().unwrap().remove(name);
    }
}

pub fn csn(timestamp: u64, server_id: u16) -> Csn {
    Csn::new(timestamp, 0, server_id)
}

pub fn update(timestamp: u64, server_id: u16) -> UpdateMsg {
    UpdateMsg::update(csn(timestamp, server_id), format!("change {timestamp}@{server_id}").into_bytes())
}

pub fn dn(s: &str) -> Dn {
    Dn::from(s)
}

pub fn open_env(root: &Path) -> ReplicationEnvironment {
    init_tracing();
    ReplicationEnvironment::open(root).unwrap()
}

/// Options that never rotate on their own.
pub fn options() -> LogOptions {
    LogOptions {
        size_limit_per_file: u64::MAX,
        ..LogOptions::default()
    }
}

pub fn open_replica_db(
    env: &ReplicationEnvironment,
    base_dn: &Dn,
    server_id: u16,
    crypto: Arc<dyn CryptoSuite>,
    registrar: Arc<dyn MonitorRegistrar>,
) -> FileReplicaDb {
    let log = env
        .open_replica_log(base_dn, server_id, Arc::new(ReplicaDbParser::new(crypto)), options())
        .unwrap();
    let offline = env
        .changelog_state()
        .unwrap()
        .offline_replicas()
        .get_csn(base_dn, server_id);
    FileReplicaDb::open(base_dn.clone(), server_id, log, offline, registrar).unwrap()
}

pub fn plain_replica_db(env: &ReplicationEnvironment, base_dn: &Dn, server_id: u16) -> FileReplicaDb {
    open_replica_db(env, base_dn, server_id, Arc::new(NoEncryption), Arc::new(RecordingRegistrar::default()))
}

pub fn open_cn_index_db(env: &ReplicationEnvironment, registrar: Arc<dyn MonitorRegistrar>) -> FileChangeNumberIndexDb {
    let log = env
        .open_change_number_index_log(Arc::new(ChangeNumberIndexParser::new(Arc::new(NoEncryption))), options())
        .unwrap();
    FileChangeNumberIndexDb::open(log, registrar).unwrap()
}

/// Drains a replica cursor into `(timestamp, is_offline_marker)` pairs.
pub fn drain(cursor: &mut impl DbCursor<Item = UpdateMsg>) -> Vec<(u64, bool)> {
    let mut out = Vec::new();
    while cursor.next().unwrap() {
        let msg = cursor.record().unwrap();
        out.push((msg.csn().timestamp(), msg.is_replica_offline()));
    }
    out
}
