//! Multi-file, key-ordered, append-only record log.
//!
//! A log is a directory holding one appendable `head.log` file and any
//! number of immutable files named `<lowKey>_<highKey>.log`. Files are
//! indexed by their highest key, and the head file by the parser's
//! sentinel [`RecordParser::max_key`], so iterating the index visits all
//! records in key order.
//!
//! # Concurrency
//!
//! One `RwLock` guards the file index:
//!
//! - **Shared**: appends that need no rotation, reads, cursor creation
//!   and cursor movement.
//! - **Exclusive**: rotation, purge, clear and close.
//!
//! Cursors are registered with the log so that exclusive operations can
//! move them to the rotated file (rotation), abort them (purge, clear) or
//! close them (close). Locks are always taken in the order log lock,
//! cursor registry, individual cursor.

mod block;
mod cursor;
mod log_file;
mod record;
mod registry;

#[cfg(test)]
mod tests;

pub use block::{DEFAULT_BLOCK_SIZE, MIN_BLOCK_SIZE};
pub use cursor::{LogCursor, RepositionableCursor};
pub use record::{LogKey, LogValue, Record, RecordParser};
pub use registry::LogRegistry;

use std::collections::BTreeMap;
use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::{ChangelogError, IoResultExt, poisoned};
use crate::ports::{Clock, SystemClock};
use cursor::{CursorSlot, CursorState};
use log_file::{HEAD_LOG_FILE_NAME, LOG_FILE_NAME_SEPARATOR, LOG_FILE_SUFFIX, LogFile, LogFileCursor};

/// Which record a positioned cursor selects for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyMatchingStrategy {
    /// Exactly the key.
    EqualToKey,
    /// The key, or the greatest key before it.
    LessThanOrEqualToKey,
    /// The key, or the smallest key after it.
    GreaterThanOrEqualToKey,
}

/// Where a positioned cursor stands relative to the selected record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PositionStrategy {
    /// The next `next()` returns the selected record.
    OnMatchingKey,
    /// The next `next()` returns the record after it.
    AfterMatchingKey,
}

/// Called with the path of every newly rotated file.
pub type RotationListener = Arc<dyn Fn(&Path) + Send + Sync>;

/// Tuning of one log.
#[derive(Clone)]
pub struct LogOptions {
    /// Block size of newly created files.
    pub block_size: u32,
    /// Largest accepted encoded record.
    pub max_record_size: u32,
    /// The head file is rotated once it grows past this many bytes.
    pub size_limit_per_file: u64,
    /// The head file is rotated once this much time elapsed since the last
    /// rotation. Zero disables time-based rotation.
    pub rotation_interval: Duration,
    /// Time source for time-based rotation.
    pub clock: Arc<dyn Clock>,
    /// Invoked after each rotation.
    pub on_rotation: Option<RotationListener>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_record_size: 1024 * 1024,
            size_limit_per_file: 10 * 1024 * 1024,
            rotation_interval: Duration::ZERO,
            clock: Arc::new(SystemClock),
            on_rotation: None,
        }
    }
}

impl std::fmt::Debug for LogOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogOptions")
            .field("block_size", &self.block_size)
            .field("max_record_size", &self.max_record_size)
            .field("size_limit_per_file", &self.size_limit_per_file)
            .field("rotation_interval", &self.rotation_interval)
            .field("on_rotation", &self.on_rotation.is_some())
            .finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// File index
// ------------------------------------------------------------------------------------------------

pub(crate) struct LogState<K, V> {
    closed: bool,
    files: BTreeMap<K, Arc<LogFile<K, V>>>,
}

impl<K: LogKey, V: LogValue> LogState<K, V> {
    fn head(&self) -> Result<&Arc<LogFile<K, V>>, ChangelogError> {
        self.files
            .last_key_value()
            .map(|(_, file)| file)
            .ok_or_else(|| ChangelogError::Internal("log has no head file".into()))
    }

    fn oldest_file(&self) -> Result<&Arc<LogFile<K, V>>, ChangelogError> {
        self.files
            .first_key_value()
            .map(|(_, file)| file)
            .ok_or_else(|| ChangelogError::Internal("log has no head file".into()))
    }

    /// File following `file` in key order, `None` after the head.
    pub(crate) fn next_file_after(
        &self,
        file: &Arc<LogFile<K, V>>,
    ) -> Result<Option<Arc<LogFile<K, V>>>, ChangelogError> {
        if file.is_appendable() {
            return Ok(None);
        }
        let Some(newest) = file.newest_key()? else {
            return Ok(None);
        };
        Ok(self
            .files
            .range((Bound::Excluded(newest), Bound::Unbounded))
            .next()
            .map(|(_, file)| Arc::clone(file)))
    }

    /// Newest key of the whole log.
    fn newest_key(&self) -> Result<Option<K>, ChangelogError> {
        for file in self.files.values().rev() {
            if let Some(key) = file.newest_key()? {
                return Ok(Some(key));
            }
        }
        Ok(None)
    }

    /// The file in which a cursor for `key` must start.
    fn find_log_file_for(
        &self,
        key: Option<&K>,
        matching: KeyMatchingStrategy,
    ) -> Result<&Arc<LogFile<K, V>>, ChangelogError> {
        let Some(key) = key else {
            return self.oldest_file();
        };
        if self.files.range(..key).next().is_none() {
            return self.oldest_file();
        }
        let candidate = match self.files.range(key..).next() {
            Some((_, file)) => file,
            None => self.head()?,
        };
        if matching == KeyMatchingStrategy::LessThanOrEqualToKey {
            let starts_after_key = match candidate.oldest_record()? {
                Some(oldest) => oldest.key() > key,
                None => true,
            };
            if starts_after_key && let Some((_, floor)) = self.files.range(..=key).next_back() {
                return Ok(floor);
            }
        }
        Ok(candidate)
    }

    /// Builds a per-file cursor positioned for `key`.
    pub(crate) fn locate(
        &self,
        key: Option<&K>,
        matching: KeyMatchingStrategy,
        positioning: PositionStrategy,
    ) -> Result<(bool, LogFileCursor<K, V>), ChangelogError> {
        let file = Arc::clone(self.find_log_file_for(key, matching)?);
        let mut cursor = LogFileCursor::new(file);
        let found = match key {
            None => true,
            Some(key) => cursor.position_to(key, matching, positioning)?,
        };
        Ok((found, cursor))
    }

    /// Per-file key ranges are ascending and do not overlap.
    fn is_ordered(&self) -> bool {
        let mut previous: Option<K> = None;
        for file in self.files.values() {
            let (Ok(Some(oldest)), Ok(Some(newest))) = (file.oldest_record(), file.newest_record()) else {
                continue;
            };
            if previous.as_ref().is_some_and(|p| p >= oldest.key()) || oldest.key() > newest.key() {
                return false;
            }
            previous = Some(newest.key().clone());
        }
        true
    }
}

// ------------------------------------------------------------------------------------------------
// Shared log
// ------------------------------------------------------------------------------------------------

pub(crate) struct LogShared<K, V> {
    path: PathBuf,
    parser: Arc<dyn RecordParser<K, V>>,
    options: LogOptions,
    rotation_interval_ms: AtomicU64,
    last_rotation_ms: AtomicU64,
    state: RwLock<LogState<K, V>>,
    cursors: Mutex<Vec<Weak<Mutex<CursorState<K, V>>>>>,
}

impl<K: LogKey, V: LogValue> LogShared<K, V> {
    /// Opens or creates the log in directory `path`.
    pub(crate) fn open(
        path: &Path,
        parser: Arc<dyn RecordParser<K, V>>,
        options: LogOptions,
    ) -> Result<Self, ChangelogError> {
        if options.block_size < MIN_BLOCK_SIZE {
            return Err(ChangelogError::InvalidConfig(format!(
                "block size {} is below the minimum of {MIN_BLOCK_SIZE}",
                options.block_size
            )));
        }
        fs::create_dir_all(path).at(path)?;

        let mut files = BTreeMap::new();
        for entry in fs::read_dir(path).at(path)? {
            let entry = entry.at(path)?;
            let file_path = entry.path();
            let Some(name) = file_path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name == HEAD_LOG_FILE_NAME || !name.ends_with(LOG_FILE_SUFFIX) {
                continue;
            }
            let high = Self::decode_high_key(parser.as_ref(), name)
                .map_err(|e| ChangelogError::Decode(format!("invalid log file name {}: {e}", file_path.display())))?;
            let file = LogFile::open_read_only(&file_path, Arc::clone(&parser), options.max_record_size)?;
            files.insert(high, Arc::new(file));
        }

        let head = LogFile::open_appendable(
            &path.join(HEAD_LOG_FILE_NAME),
            Arc::clone(&parser),
            options.block_size,
            options.max_record_size,
        )?;
        files.insert(parser.max_key(), Arc::new(head));

        info!(path = %path.display(), files = files.len(), "log opened");
        let now = options.clock.now_millis();
        Ok(Self {
            path: path.to_path_buf(),
            rotation_interval_ms: AtomicU64::new(interval_millis(options.rotation_interval)),
            last_rotation_ms: AtomicU64::new(now),
            parser,
            options,
            state: RwLock::new(LogState {
                closed: false,
                files,
            }),
            cursors: Mutex::new(Vec::new()),
        })
    }

    fn decode_high_key(parser: &dyn RecordParser<K, V>, name: &str) -> Result<K, ChangelogError> {
        let stem = name.trim_end_matches(LOG_FILE_SUFFIX);
        let (low, high) = stem
            .split_once(LOG_FILE_NAME_SEPARATOR)
            .ok_or_else(|| ChangelogError::Decode("missing key separator".into()))?;
        parser.decode_key_from_string(low)?;
        parser.decode_key_from_string(high)
    }

    pub(crate) fn read_state(&self) -> Result<RwLockReadGuard<'_, LogState<K, V>>, ChangelogError> {
        self.state.read().map_err(poisoned("log"))
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, LogState<K, V>>, ChangelogError> {
        self.state.write().map_err(poisoned("log"))
    }

    // --------------------------------------------------------------------------------------------
    // Cursor registry
    // --------------------------------------------------------------------------------------------

    fn register_cursor(&self, slot: &CursorSlot<K, V>) -> Result<(), ChangelogError> {
        let mut cursors = self.cursors.lock().map_err(poisoned("cursor registry"))?;
        cursors.retain(|weak| weak.strong_count() > 0);
        cursors.push(Arc::downgrade(slot));
        Ok(())
    }

    pub(crate) fn unregister_cursor(&self, slot: &CursorSlot<K, V>) {
        if let Ok(mut cursors) = self.cursors.lock() {
            let target = Arc::as_ptr(slot);
            cursors.retain(|weak| weak.strong_count() > 0 && weak.as_ptr() != target);
        }
    }

    fn open_cursors(&self) -> Result<Vec<CursorSlot<K, V>>, ChangelogError> {
        let cursors = self.cursors.lock().map_err(poisoned("cursor registry"))?;
        Ok(cursors.iter().filter_map(Weak::upgrade).collect())
    }

    /// Applies `f` to the state of every open cursor. The exclusive log
    /// lock must be held.
    fn for_each_cursor(&self, mut f: impl FnMut(&mut CursorState<K, V>)) -> Result<(), ChangelogError> {
        for slot in self.open_cursors()? {
            let mut state = slot.lock().map_err(poisoned("cursor"))?;
            f(&mut state);
        }
        Ok(())
    }

    fn abort_cursors_on(&self, file: &Arc<LogFile<K, V>>) -> Result<usize, ChangelogError> {
        let mut aborted = 0;
        self.for_each_cursor(|state| {
            if let CursorState::Active(cursor) = state
                && Arc::ptr_eq(cursor.file(), file)
            {
                *state = CursorState::Aborted(file.path().to_path_buf());
                aborted += 1;
            }
        })?;
        Ok(aborted)
    }

    // --------------------------------------------------------------------------------------------
    // Writing
    // --------------------------------------------------------------------------------------------

    fn must_rotate(&self, head: &LogFile<K, V>) -> Result<bool, ChangelogError> {
        if head.is_empty()? {
            return Ok(false);
        }
        if head.size_in_bytes() > self.options.size_limit_per_file {
            return Ok(true);
        }
        let interval = self.rotation_interval_ms.load(Ordering::Relaxed);
        let elapsed = self
            .options
            .clock
            .now_millis()
            .saturating_sub(self.last_rotation_ms.load(Ordering::Relaxed));
        Ok(interval > 0 && elapsed > interval)
    }

    fn would_break_key_ordering(&self, state: &LogState<K, V>, record: &Record<K, V>) -> Result<bool, ChangelogError> {
        Ok(state.newest_key()?.is_some_and(|newest| *record.key() <= newest))
    }

    fn append(&self, record: &Record<K, V>) -> Result<bool, ChangelogError> {
        if *record.key() >= self.parser.max_key() {
            return Err(ChangelogError::InvalidArgument(format!(
                "key {:?} is not below the sentinel key of log {}",
                record.key(),
                self.path.display()
            )));
        }

        {
            let state = self.read_state()?;
            if state.closed {
                return Err(ChangelogError::ShuttingDown);
            }
            let head = state.head()?;
            if !self.must_rotate(head)? {
                if head.is_empty()? && self.would_break_key_ordering(&state, record)? {
                    return Ok(false);
                }
                return head.append(record);
            }
        }

        let mut state = self.write_state()?;
        if state.closed {
            return Err(ChangelogError::ShuttingDown);
        }
        if self.would_break_key_ordering(&state, record)? {
            return Ok(false);
        }
        if self.must_rotate(state.head()?)? {
            self.rotate(&mut state)?;
        }
        let written = state.head()?.append(record)?;
        debug_assert!(state.is_ordered(), "log files of {} out of order", self.path.display());
        Ok(written)
    }

    /// Renames the head file to `<low>_<high>.log` and installs a fresh
    /// head. Cursors reading the head keep their position in the renamed
    /// file.
    fn rotate(&self, state: &mut LogState<K, V>) -> Result<(), ChangelogError> {
        let head = Arc::clone(state.head()?);
        let (Some(oldest), Some(newest)) = (head.oldest_record()?, head.newest_record()?) else {
            return Ok(());
        };

        let mut captured = Vec::new();
        for slot in self.open_cursors()? {
            let mut cursor_state = slot.lock().map_err(poisoned("cursor"))?;
            if let CursorState::Active(cursor) = &*cursor_state
                && Arc::ptr_eq(cursor.file(), &head)
            {
                captured.push((Arc::clone(&slot), cursor.state()));
                *cursor_state = CursorState::Closed;
            }
        }

        let rotated_path = self.path.join(format!(
            "{}{LOG_FILE_NAME_SEPARATOR}{}{LOG_FILE_SUFFIX}",
            self.parser.encode_key_to_string(oldest.key()),
            self.parser.encode_key_to_string(newest.key()),
        ));
        let (rotated, fresh) = match self.replace_head(&head, &rotated_path) {
            Ok(files) => files,
            Err(e) => {
                // Detached cursors cannot be put back on a closed head.
                for (slot, _) in &captured {
                    let mut cursor_state = slot.lock().map_err(poisoned("cursor"))?;
                    *cursor_state = CursorState::Aborted(head.path().to_path_buf());
                }
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    aborted = captured.len(),
                    "log head file rotation failed"
                );
                return Err(e);
            }
        };
        state.files.insert(newest.key().clone(), Arc::clone(&rotated));
        state.files.insert(self.parser.max_key(), Arc::new(fresh));

        for (slot, (position, current)) in captured {
            let mut cursor_state = slot.lock().map_err(poisoned("cursor"))?;
            *cursor_state = CursorState::Active(LogFileCursor::restore(Arc::clone(&rotated), position, current));
        }

        self.last_rotation_ms
            .store(self.options.clock.now_millis(), Ordering::Relaxed);
        info!(
            path = %self.path.display(),
            file = %rotated_path.display(),
            size = rotated.size_in_bytes(),
            "log head file rotated"
        );
        if let Some(listener) = &self.options.on_rotation {
            listener(&rotated_path);
        }
        Ok(())
    }

    /// Closes `head`, renames it to `rotated_path` and opens both the
    /// renamed file and a fresh head.
    fn replace_head(
        &self,
        head: &LogFile<K, V>,
        rotated_path: &Path,
    ) -> Result<(Arc<LogFile<K, V>>, LogFile<K, V>), ChangelogError> {
        head.close()?;
        fs::rename(head.path(), rotated_path).at(head.path())?;
        let rotated = Arc::new(LogFile::open_read_only(
            rotated_path,
            Arc::clone(&self.parser),
            self.options.max_record_size,
        )?);
        let fresh = LogFile::open_appendable(
            &self.path.join(HEAD_LOG_FILE_NAME),
            Arc::clone(&self.parser),
            self.options.block_size,
            self.options.max_record_size,
        )?;
        Ok((rotated, fresh))
    }

    // --------------------------------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------------------------------

    pub(crate) fn close(&self) -> Result<(), ChangelogError> {
        let mut state = self.write_state()?;
        if state.closed {
            return Ok(());
        }
        state.closed = true;

        let mut still_open = Vec::new();
        self.for_each_cursor(|cursor| {
            if matches!(cursor, CursorState::Active(_)) {
                still_open.push(cursor.describe());
            }
            *cursor = CursorState::Closed;
        })?;
        if !still_open.is_empty() {
            error!(path = %self.path.display(), cursors = ?still_open, "log closed while cursors are still open");
        }

        let mut result = Ok(());
        for file in state.files.values() {
            if let Err(e) = file.close() {
                warn!(file = %file.path().display(), error = %e, "unable to close log file");
                result = Err(e);
            }
        }
        info!(path = %self.path.display(), "log closed");
        result
    }
}

// ------------------------------------------------------------------------------------------------
// Public handle
// ------------------------------------------------------------------------------------------------

/// Handle on an open log.
///
/// Handles obtained from a [`LogRegistry`] share the underlying log with
/// every other handle on the same directory. The log is closed when the
/// last handle is dropped.
pub struct Log<K: LogKey, V: LogValue> {
    shared: Arc<LogShared<K, V>>,
    registry: Option<LogRegistry>,
    released: bool,
}

impl<K: LogKey, V: LogValue> Log<K, V> {
    /// Opens or creates a log owned by this handle alone.
    pub fn open(
        path: &Path,
        parser: Arc<dyn RecordParser<K, V>>,
        options: LogOptions,
    ) -> Result<Self, ChangelogError> {
        Ok(Self {
            shared: Arc::new(LogShared::open(path, parser, options)?),
            registry: None,
            released: false,
        })
    }

    fn with_registry(shared: Arc<LogShared<K, V>>, registry: LogRegistry) -> Self {
        Self {
            shared,
            registry: Some(registry),
            released: false,
        }
    }

    /// Directory holding the log files.
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Appends `record` at the end of the log.
    ///
    /// Returns `false` and leaves the log untouched when the key is not
    /// greater than the newest key of the log.
    pub fn append(&self, record: Record<K, V>) -> Result<bool, ChangelogError> {
        self.shared.append(&record)
    }

    /// Forces appended records to durable storage.
    pub fn sync(&self) -> Result<(), ChangelogError> {
        self.shared.read_state()?.head()?.sync()
    }

    /// Rotates the head file unless it is empty.
    pub fn rotate_if_not_empty(&self) -> Result<(), ChangelogError> {
        let mut state = self.shared.write_state()?;
        if state.closed {
            return Err(ChangelogError::ShuttingDown);
        }
        self.shared.rotate(&mut state)
    }

    /// Changes the time-based rotation interval. Zero disables it.
    pub fn set_rotation_interval(&self, interval: Duration) {
        self.shared
            .rotation_interval_ms
            .store(interval_millis(interval), Ordering::Relaxed);
    }

    // --------------------------------------------------------------------------------------------
    // Cursors
    // --------------------------------------------------------------------------------------------

    /// Cursor on the first record of the log.
    pub fn cursor(&self) -> Result<LogCursor<K, V>, ChangelogError> {
        self.cursor_from(None, KeyMatchingStrategy::EqualToKey, PositionStrategy::OnMatchingKey)
    }

    /// Cursor on the record with exactly `key`, or an empty cursor.
    pub fn cursor_at(&self, key: &K) -> Result<LogCursor<K, V>, ChangelogError> {
        self.cursor_from(Some(key), KeyMatchingStrategy::EqualToKey, PositionStrategy::OnMatchingKey)
    }

    /// Cursor positioned for `key`.
    ///
    /// When [`KeyMatchingStrategy::EqualToKey`] finds no record, the
    /// cursor is permanently empty. Otherwise the cursor is always usable
    /// and picks up records appended later.
    pub fn cursor_from(
        &self,
        key: Option<&K>,
        matching: KeyMatchingStrategy,
        positioning: PositionStrategy,
    ) -> Result<LogCursor<K, V>, ChangelogError> {
        let state = self.shared.read_state()?;
        if state.closed {
            return Ok(LogCursor::empty());
        }
        let (found, cursor) = state.locate(key, matching, positioning)?;
        if !found && matching == KeyMatchingStrategy::EqualToKey {
            debug!(path = %self.shared.path.display(), ?key, "no record for key, returning empty cursor");
            return Ok(LogCursor::empty());
        }
        let slot = Arc::new(Mutex::new(CursorState::Active(cursor)));
        self.shared.register_cursor(&slot)?;
        debug!(path = %self.shared.path.display(), ?key, ?matching, ?positioning, "log cursor created");
        Ok(LogCursor::registered(Arc::clone(&self.shared), slot))
    }

    // --------------------------------------------------------------------------------------------
    // Queries
    // --------------------------------------------------------------------------------------------

    pub fn oldest_record(&self) -> Result<Option<Record<K, V>>, ChangelogError> {
        let state = self.shared.read_state()?;
        for file in state.files.values() {
            if let Some(record) = file.oldest_record()? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    pub fn newest_record(&self) -> Result<Option<Record<K, V>>, ChangelogError> {
        let state = self.shared.read_state()?;
        for file in state.files.values().rev() {
            if let Some(record) = file.newest_record()? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Counts all records by scanning every file.
    pub fn number_of_records(&self) -> Result<u64, ChangelogError> {
        let state = self.shared.read_state()?;
        state
            .files
            .values()
            .try_fold(0u64, |total, file| Ok::<_, ChangelogError>(total + file.number_of_records()?))
    }

    /// Number of files, the head included.
    pub fn number_of_files(&self) -> Result<usize, ChangelogError> {
        Ok(self.shared.read_state()?.files.len())
    }

    /// Walks the files in key order and returns the oldest key of the
    /// last file whose oldest record maps to a value `<= limit`.
    pub fn find_boundary_key_from_record<T: Ord>(
        &self,
        mapper: impl Fn(&Record<K, V>) -> T,
        limit: &T,
    ) -> Result<Option<K>, ChangelogError> {
        let state = self.shared.read_state()?;
        let mut boundary = None;
        for file in state.files.values() {
            let Some(oldest) = file.oldest_record()? else {
                continue;
            };
            if mapper(&oldest) > *limit {
                break;
            }
            boundary = Some(oldest.key().clone());
        }
        Ok(boundary)
    }

    // --------------------------------------------------------------------------------------------
    // Purge and clear
    // --------------------------------------------------------------------------------------------

    /// Deletes every rotated file whose highest key is below `key` and
    /// aborts the cursors reading them. Returns the oldest remaining
    /// record.
    pub fn purge_up_to(&self, key: &K) -> Result<Option<Record<K, V>>, ChangelogError> {
        let shared = &self.shared;
        let mut state = shared.write_state()?;
        if state.closed {
            return Err(ChangelogError::ShuttingDown);
        }

        let doomed: Vec<K> = state
            .files
            .iter()
            .filter(|(_, file)| !file.is_appendable())
            .map(|(high, _)| high)
            .take_while(|high| *high < key)
            .cloned()
            .collect();

        let mut undeletable = Vec::new();
        let mut purged = 0;
        for high in doomed {
            let Some(file) = state.files.get(&high).cloned() else {
                continue;
            };
            let aborted = shared.abort_cursors_on(&file)?;
            if aborted > 0 {
                warn!(file = %file.path().display(), aborted, "aborting cursors on purged log file");
            }
            match file.close().and_then(|()| file.delete()) {
                Ok(()) => {
                    state.files.remove(&high);
                    purged += 1;
                }
                Err(e) => {
                    warn!(file = %file.path().display(), error = %e, "unable to delete log file");
                    undeletable.push(file.path().to_path_buf());
                }
            }
        }
        if purged > 0 {
            info!(path = %shared.path.display(), purged, "log files purged");
        }
        if !undeletable.is_empty() {
            return Err(ChangelogError::UndeletableFiles(undeletable));
        }

        for file in state.files.values() {
            if let Some(record) = file.oldest_record()? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Aborts every cursor, deletes every file and starts over with an
    /// empty head file.
    pub fn clear(&self) -> Result<(), ChangelogError> {
        let shared = &self.shared;
        let mut state = shared.write_state()?;
        if state.closed {
            return Err(ChangelogError::ShuttingDown);
        }

        shared.for_each_cursor(|cursor| {
            if let CursorState::Active(active) = cursor {
                let path = active.file().path().to_path_buf();
                *cursor = CursorState::Aborted(path);
            }
        })?;

        let mut undeletable = Vec::new();
        for file in std::mem::take(&mut state.files).into_values() {
            if let Err(e) = file.close().and_then(|()| file.delete()) {
                warn!(file = %file.path().display(), error = %e, "unable to delete log file");
                undeletable.push(file.path().to_path_buf());
            }
        }

        let head = LogFile::open_appendable(
            &shared.path.join(HEAD_LOG_FILE_NAME),
            Arc::clone(&shared.parser),
            shared.options.block_size,
            shared.options.max_record_size,
        )?;
        state.files.insert(shared.parser.max_key(), Arc::new(head));
        shared
            .last_rotation_ms
            .store(shared.options.clock.now_millis(), Ordering::Relaxed);
        info!(path = %shared.path.display(), "log cleared");

        if undeletable.is_empty() {
            Ok(())
        } else {
            Err(ChangelogError::UndeletableFiles(undeletable))
        }
    }

    /// Releases this handle. Equivalent to dropping it, but reports
    /// failures.
    pub fn close(mut self) -> Result<(), ChangelogError> {
        self.release()
    }

    fn release(&mut self) -> Result<(), ChangelogError> {
        if std::mem::replace(&mut self.released, true) {
            return Ok(());
        }
        match &self.registry {
            Some(registry) => registry.release(&self.shared.path),
            None => self.shared.close(),
        }
    }
}

impl<K: LogKey, V: LogValue> Drop for Log<K, V> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(path = %self.shared.path.display(), error = %e, "error while closing log");
        }
    }
}

impl<K: LogKey, V: LogValue> std::fmt::Debug for Log<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Log")
            .field("path", &self.shared.path)
            .field("registered", &self.registry.is_some())
            .finish_non_exhaustive()
    }
}

fn interval_millis(interval: Duration) -> u64 {
    u64::try_from(interval.as_millis()).unwrap_or(u64::MAX)
}
