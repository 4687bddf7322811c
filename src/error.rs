//! Error type shared by every layer of the changelog.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::encoding::EncodingError;

/// Errors returned by changelog operations.
///
/// Structural failures carry the offending path. [`ChangelogError::AbortedCursor`]
/// and [`ChangelogError::ShuttingDown`] are distinct so that callers can
/// react to them (re-open a cursor, stop writing) without inspecting
/// I/O errors.
#[derive(Debug, Error)]
pub enum ChangelogError {
    /// A file or directory operation failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        /// File or directory the operation was applied to.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// A value could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Bytes read from a log file do not form a valid record.
    #[error("corrupted data in {} at offset {offset}: {reason}", path.display())]
    Corrupted {
        /// Log file containing the bad bytes.
        path: PathBuf,
        /// Physical offset of the record or header.
        offset: u64,
        /// What check failed.
        reason: String,
    },

    /// A record payload or key string could not be decoded.
    #[error("unable to decode: {0}")]
    Decode(String),

    /// Purge or clear could not delete some files. Deletions that
    /// succeeded are kept.
    #[error("unable to delete log files: {0:?}")]
    UndeletableFiles(Vec<PathBuf>),

    /// The cursor's backing file was purged or cleared while it was open.
    #[error("cursor on {} has been aborted", .0.display())]
    AbortedCursor(PathBuf),

    /// A write was attempted after shutdown started.
    #[error("database is shutting down")]
    ShuttingDown,

    /// The injected crypto service failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Invalid configuration parameter.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Argument constraint violated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Encoded record is larger than the configured maximum.
    #[error("record size exceeds limit ({0} bytes)")]
    RecordTooLarge(usize),

    /// Internal consistency or locking error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ChangelogError {
    /// Returns `true` for [`ChangelogError::AbortedCursor`].
    pub fn is_aborted_cursor(&self) -> bool {
        matches!(self, ChangelogError::AbortedCursor(_))
    }
}

/// Attaches a path to an [`io::Error`].
pub(crate) trait IoResultExt<T> {
    fn at(self, path: &Path) -> Result<T, ChangelogError>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn at(self, path: &Path) -> Result<T, ChangelogError> {
        self.map_err(|source| ChangelogError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Maps a poisoned lock to [`ChangelogError::Internal`].
pub(crate) fn poisoned<E>(what: &'static str) -> impl FnOnce(E) -> ChangelogError {
    move |_| ChangelogError::Internal(format!("{what} lock poisoned"))
}
