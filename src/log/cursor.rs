//! Cursors over a whole [`Log`](super::Log).

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use super::log_file::LogFileCursor;
use super::record::{LogKey, LogValue, Record};
use super::{KeyMatchingStrategy, LogShared, PositionStrategy};
use crate::error::{ChangelogError, poisoned};

/// A cursor that can be moved to a key after it has been created.
pub trait RepositionableCursor<K, V> {
    /// The record the cursor is on, or `None` before the first `next()`
    /// and after exhaustion.
    fn record(&self) -> Option<Record<K, V>>;

    /// Advances the cursor. Returns whether a record is now available.
    fn next(&mut self) -> Result<bool, ChangelogError>;

    /// Moves the cursor so that the next call to `next()` yields the
    /// record selected by `key` and the strategies. `None` moves it back
    /// to the very first record. Returns whether a matching record exists.
    fn position_to(
        &mut self,
        key: Option<&K>,
        matching: KeyMatchingStrategy,
        positioning: PositionStrategy,
    ) -> Result<bool, ChangelogError>;

    /// Releases the cursor. Later calls to `next()` return `false`.
    fn close(&mut self);
}

/// State of a registered cursor. Rotation, purge, clear and close of the
/// owning log rewrite it while holding the log's exclusive lock.
pub(crate) enum CursorState<K, V> {
    /// Reading a file of the log.
    Active(LogFileCursor<K, V>),
    /// Never returns anything.
    Empty,
    /// The file it was reading has been deleted.
    Aborted(PathBuf),
    /// Closed by its owner or by the log.
    Closed,
}

impl<K: LogKey, V: LogValue> CursorState<K, V> {
    pub fn describe(&self) -> String {
        match self {
            CursorState::Active(cursor) => {
                format!("cursor on {} at {}", cursor.file().path().display(), cursor.state().0)
            }
            CursorState::Empty => "empty cursor".to_string(),
            CursorState::Aborted(path) => format!("aborted cursor on {}", path.display()),
            CursorState::Closed => "closed cursor".to_string(),
        }
    }
}

pub(crate) type CursorSlot<K, V> = Arc<Mutex<CursorState<K, V>>>;

/// Cursor over every file of a log, in key order.
///
/// The cursor keeps reading across rotations of the head file. When the
/// file it is reading is purged, every later call fails with
/// [`ChangelogError::AbortedCursor`].
pub struct LogCursor<K: LogKey, V: LogValue> {
    log: Option<Arc<LogShared<K, V>>>,
    slot: CursorSlot<K, V>,
}

impl<K: LogKey, V: LogValue> LogCursor<K, V> {
    pub(crate) fn registered(log: Arc<LogShared<K, V>>, slot: CursorSlot<K, V>) -> Self {
        Self { log: Some(log), slot }
    }

    /// A cursor that never returns anything.
    pub fn empty() -> Self {
        Self {
            log: None,
            slot: Arc::new(Mutex::new(CursorState::Empty)),
        }
    }

    /// Whether the log aborted this cursor.
    pub fn is_aborted(&self) -> bool {
        self.slot
            .lock()
            .is_ok_and(|state| matches!(*state, CursorState::Aborted(_)))
    }

    fn unregister(&mut self) {
        if let Some(log) = self.log.take() {
            log.unregister_cursor(&self.slot);
        }
    }
}

impl<K: LogKey, V: LogValue> RepositionableCursor<K, V> for LogCursor<K, V> {
    fn record(&self) -> Option<Record<K, V>> {
        match &*self.slot.lock().ok()? {
            CursorState::Active(cursor) => cursor.record().cloned(),
            _ => None,
        }
    }

    fn next(&mut self) -> Result<bool, ChangelogError> {
        let Some(log) = &self.log else {
            return Ok(false);
        };
        let files = log.read_state()?;
        let mut slot = self.slot.lock().map_err(poisoned("cursor"))?;
        let cursor = match &mut *slot {
            CursorState::Active(cursor) => cursor,
            CursorState::Aborted(path) => return Err(ChangelogError::AbortedCursor(path.clone())),
            CursorState::Empty | CursorState::Closed => return Ok(false),
        };
        while !cursor.next()? {
            match files.next_file_after(cursor.file())? {
                Some(file) => *cursor = LogFileCursor::new(file),
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    fn position_to(
        &mut self,
        key: Option<&K>,
        matching: KeyMatchingStrategy,
        positioning: PositionStrategy,
    ) -> Result<bool, ChangelogError> {
        let Some(log) = &self.log else {
            return Ok(false);
        };
        let files = log.read_state()?;
        let mut slot = self.slot.lock().map_err(poisoned("cursor"))?;
        match &*slot {
            CursorState::Active(_) => {}
            CursorState::Aborted(path) => return Err(ChangelogError::AbortedCursor(path.clone())),
            CursorState::Empty | CursorState::Closed => return Ok(false),
        }
        let (found, cursor) = files.locate(key, matching, positioning)?;
        *slot = CursorState::Active(cursor);
        Ok(found)
    }

    fn close(&mut self) {
        if let Ok(mut state) = self.slot.lock() {
            *state = CursorState::Closed;
        }
        self.unregister();
    }
}

impl<K: LogKey, V: LogValue> Drop for LogCursor<K, V> {
    fn drop(&mut self) {
        self.unregister();
    }
}

impl<K: LogKey, V: LogValue> std::fmt::Debug for LogCursor<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self
            .slot
            .lock()
            .map(|state| state.describe())
            .unwrap_or_else(|_| "poisoned".to_string());
        f.debug_struct("LogCursor").field("state", &state).finish()
    }
}
