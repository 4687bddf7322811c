//! Reference-counted table of open logs.
//!
//! Two owners opening the same directory get handles on one shared
//! [`Log`] instance. The instance is closed when the last handle is
//! dropped.

use std::any::Any;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use super::record::{LogKey, LogValue, RecordParser};
use super::{Log, LogOptions, LogShared};
use crate::error::{ChangelogError, IoResultExt, poisoned};

/// Type-erased view of a shared log held by the registry.
pub(crate) trait RegisteredLog: Send + Sync {
    fn close_log(&self) -> Result<(), ChangelogError>;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<K: LogKey, V: LogValue> RegisteredLog for LogShared<K, V> {
    fn close_log(&self) -> Result<(), ChangelogError> {
        self.close()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct RegistryEntry {
    log: Arc<dyn RegisteredLog>,
    references: usize,
}

/// Registry of open logs keyed by canonical directory path.
#[derive(Clone, Default)]
pub struct LogRegistry {
    entries: Arc<Mutex<HashMap<PathBuf, RegistryEntry>>>,
}

impl LogRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the log stored in `path`, or takes one more reference on it
    /// if it is already open.
    ///
    /// `parser` and `options` are ignored when the log is already open.
    /// Opening a log with a key/value type different from the one it
    /// was first opened with fails with [`ChangelogError::InvalidArgument`].
    pub fn open_log<K: LogKey, V: LogValue>(
        &self,
        path: &Path,
        parser: Arc<dyn RecordParser<K, V>>,
        options: LogOptions,
    ) -> Result<Log<K, V>, ChangelogError> {
        fs::create_dir_all(path).at(path)?;
        let canonical = fs::canonicalize(path).at(path)?;
        let mut entries = self.entries.lock().map_err(poisoned("log registry"))?;

        if let Some(entry) = entries.get_mut(&canonical) {
            let shared = Arc::clone(&entry.log)
                .into_any()
                .downcast::<LogShared<K, V>>()
                .map_err(|_| {
                    ChangelogError::InvalidArgument(format!(
                        "log {} is already open with another record type",
                        canonical.display()
                    ))
                })?;
            entry.references += 1;
            debug!(path = %canonical.display(), references = entry.references, "log reference acquired");
            return Ok(Log::with_registry(shared, self.clone()));
        }

        let shared = Arc::new(LogShared::open(&canonical, parser, options)?);
        entries.insert(
            canonical,
            RegistryEntry {
                log: Arc::clone(&shared) as Arc<dyn RegisteredLog>,
                references: 1,
            },
        );
        Ok(Log::with_registry(shared, self.clone()))
    }

    /// Drops one reference on the log at `path`, closing it when it was
    /// the last one.
    pub(crate) fn release(&self, path: &Path) -> Result<(), ChangelogError> {
        let closing = {
            let mut entries = self.entries.lock().map_err(poisoned("log registry"))?;
            let Some(entry) = entries.get_mut(path) else {
                warn!(path = %path.display(), "releasing a log that is not registered");
                return Ok(());
            };
            entry.references -= 1;
            if entry.references > 0 {
                debug!(path = %path.display(), references = entry.references, "log reference released");
                return Ok(());
            }
            entries.remove(path).map(|entry| entry.log)
        };
        match closing {
            Some(log) => log.close_log(),
            None => Ok(()),
        }
    }

    /// Number of handles currently held on the log at `path`.
    pub fn references(&self, path: &Path) -> usize {
        let Ok(canonical) = fs::canonicalize(path) else {
            return 0;
        };
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(&canonical).map(|entry| entry.references))
            .unwrap_or(0)
    }

    /// Number of distinct open logs.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for LogRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogRegistry").field("open_logs", &self.len()).finish()
    }
}
