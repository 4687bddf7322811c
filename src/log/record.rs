//! Records stored in a [`Log`](super::Log) and the parser that encodes them.

use std::fmt::Debug;

use crate::error::ChangelogError;

/// Bound required from log keys.
pub trait LogKey: Ord + Clone + Debug + Send + Sync + 'static {}
impl<T> LogKey for T where T: Ord + Clone + Debug + Send + Sync + 'static {}

/// Bound required from log values.
pub trait LogValue: Clone + Debug + Send + Sync + 'static {}
impl<T> LogValue for T where T: Clone + Debug + Send + Sync + 'static {}

/// An immutable (key, value) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record<K, V> {
    key: K,
    value: V,
}

impl<K, V> Record<K, V> {
    pub fn new(key: K, value: V) -> Self {
        Self { key, value }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn into_value(self) -> V {
        self.value
    }

    pub fn into_parts(self) -> (K, V) {
        (self.key, self.value)
    }
}

/// Binary and textual codec for the records of one log.
///
/// `decode_record(encode_record(r))` must return `r`, and
/// `decode_key_from_string(encode_key_to_string(k))` must return `k`.
/// Key strings end up in file names, so they must not contain `_`
/// or path separators.
pub trait RecordParser<K, V>: Send + Sync {
    /// Encodes a record into the payload stored in a log file.
    fn encode_record(&self, record: &Record<K, V>) -> Result<Vec<u8>, ChangelogError>;

    /// Decodes a payload produced by [`RecordParser::encode_record`].
    fn decode_record(&self, bytes: &[u8]) -> Result<Record<K, V>, ChangelogError>;

    /// String form of a key, used to name rotated log files.
    fn encode_key_to_string(&self, key: &K) -> String;

    /// Inverse of [`RecordParser::encode_key_to_string`].
    fn decode_key_from_string(&self, s: &str) -> Result<K, ChangelogError>;

    /// A key greater than any real key. The head file is registered
    /// under it.
    fn max_key(&self) -> K;
}
