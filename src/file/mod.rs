//! File-backed databases built on [`Log`](crate::log::Log).
//!
//! - [`FileReplicaDb`]: the updates of one replica of one domain, keyed
//!   by CSN.
//! - [`FileChangeNumberIndexDb`]: the change-number index, keyed by
//!   change number.
//! - [`ReplicationEnvironment`]: the directory tree holding all of them
//!   and the small state files describing domains and replicas.
//!
//! # Record payloads
//!
//! Both databases prefix every stored payload with a one-byte format tag:
//!
//! ```text
//! [0x01][plain bytes]
//! [0x02][bytes produced by CryptoSuite::encrypt]
//! ```
//!
//! Any other tag is a decoding failure.

mod cn_index_db;
mod environment;
mod replica_db;

#[cfg(test)]
pub(crate) mod tests;

pub use cn_index_db::{ChangeNumberIndexParser, FileChangeNumberIndexDb};
pub use environment::{ChangelogState, ReplicationEnvironment};
pub use replica_db::{FileReplicaDb, ReplicaDbParser};

use std::sync::{Mutex, MutexGuard};

use crate::error::{ChangelogError, poisoned};
use crate::ports::CryptoSuite;

const PLAIN_FORMAT: u8 = 0x01;
const ENCRYPTED_FORMAT: u8 = 0x02;

/// Tags `plain` and encrypts it when the suite asks for it.
fn seal(crypto: &dyn CryptoSuite, plain: Vec<u8>) -> Result<Vec<u8>, ChangelogError> {
    let (tag, body) = if crypto.is_encrypted() {
        (ENCRYPTED_FORMAT, crypto.encrypt(&plain)?)
    } else {
        (PLAIN_FORMAT, plain)
    };
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(tag);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Inverse of [`seal`].
fn unseal(crypto: &dyn CryptoSuite, stored: &[u8]) -> Result<Vec<u8>, ChangelogError> {
    match stored.split_first() {
        Some((&PLAIN_FORMAT, body)) => Ok(body.to_vec()),
        Some((&ENCRYPTED_FORMAT, body)) => crypto.decrypt(body),
        Some((tag, _)) => Err(ChangelogError::Decode(format!("unknown record format tag {tag:#04x}"))),
        None => Err(ChangelogError::Decode("empty record".into())),
    }
}

/// Oldest key, newest key and record count of a database, kept in memory
/// so that monitoring never scans files.
#[derive(Debug)]
struct Counters<K> {
    inner: Mutex<CountersInner<K>>,
}

#[derive(Debug, Clone)]
struct CountersInner<K> {
    first: Option<K>,
    last: Option<K>,
    count: u64,
}

impl<K: Clone> CountersInner<K> {
    fn appended(&mut self, key: K) {
        if self.first.is_none() {
            self.first = Some(key.clone());
        }
        self.last = Some(key);
        self.count += 1;
    }

    /// Keeps the newest key unless nothing is left.
    fn purged(&mut self, oldest: Option<K>, count: u64) {
        if oldest.is_none() {
            self.last = None;
        }
        self.first = oldest;
        self.count = count;
    }
}

impl<K: Clone> Counters<K> {
    fn new(first: Option<K>, last: Option<K>, count: u64) -> Self {
        Self {
            inner: Mutex::new(CountersInner { first, last, count }),
        }
    }

    fn snapshot(&self) -> Result<CountersInner<K>, ChangelogError> {
        Ok(self.inner.lock().map_err(poisoned("db counters"))?.clone())
    }

    /// Holds the counters while a write and its bookkeeping happen
    /// together.
    fn lock(&self) -> Result<MutexGuard<'_, CountersInner<K>>, ChangelogError> {
        self.inner.lock().map_err(poisoned("db counters"))
    }
}
