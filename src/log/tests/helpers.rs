use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing_subscriber::EnvFilter;

use crate::encoding::{self, Decode, Encode};
use crate::error::ChangelogError;
use crate::log::{Log, LogCursor, LogOptions, Record, RecordParser, RepositionableCursor};
use crate::ports::Clock;

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
/// Safe to call multiple times, only the first call takes effect.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// `u64` keys, `String` values.
#[derive(Debug, Default)]
pub struct U64Parser;

impl RecordParser<u64, String> for U64Parser {
    fn encode_record(&self, record: &Record<u64, String>) -> Result<Vec<u8>, ChangelogError> {
        let mut buf = Vec::new();
        record.key().encode_to(&mut buf)?;
        record.value().encode_to(&mut buf)?;
        Ok(buf)
    }

    fn decode_record(&self, bytes: &[u8]) -> Result<Record<u64, String>, ChangelogError> {
        let (key, n) = u64::decode_from(bytes)?;
        let value = encoding::decode_exact::<String>(&bytes[n..])?;
        Ok(Record::new(key, value))
    }

    fn encode_key_to_string(&self, key: &u64) -> String {
        key.to_string()
    }

    fn decode_key_from_string(&self, s: &str) -> Result<u64, ChangelogError> {
        s.parse()
            .map_err(|_| ChangelogError::Decode(format!("invalid key {s:?}")))
    }

    fn max_key(&self) -> u64 {
        u64::MAX
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

pub fn parser() -> Arc<dyn RecordParser<u64, String>> {
    Arc::new(U64Parser)
}

/// Options with no size- or time-based rotation.
pub fn no_rotation_options() -> LogOptions {
    init_tracing();
    LogOptions {
        size_limit_per_file: u64::MAX,
        ..LogOptions::default()
    }
}

/// 64-byte blocks and files rotated past `size_limit` bytes.
pub fn small_options(size_limit: u64) -> LogOptions {
    init_tracing();
    LogOptions {
        block_size: 64,
        size_limit_per_file: size_limit,
        ..LogOptions::default()
    }
}

pub fn open_log(path: &Path, options: LogOptions) -> Log<u64, String> {
    Log::open(path, parser(), options).unwrap()
}

pub fn value(key: u64) -> String {
    format!("value-{key}")
}

pub fn record(key: u64) -> Record<u64, String> {
    Record::new(key, value(key))
}

/// Appends `record(k)` for every key in `keys`.
pub fn append_all(log: &Log<u64, String>, keys: impl IntoIterator<Item = u64>) {
    for key in keys {
        assert!(log.append(record(key)).unwrap(), "append of {key} refused");
    }
}

/// Drains the cursor and returns the keys it produced.
pub fn collect_keys(cursor: &mut LogCursor<u64, String>) -> Vec<u64> {
    let mut keys = Vec::new();
    while cursor.next().unwrap() {
        let record = cursor.record().unwrap();
        assert_eq!(*record.value(), value(*record.key()));
        keys.push(*record.key());
    }
    keys
}

/// Names of the files in the log directory, sorted.
pub fn file_names(path: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(path)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
