//! A single physical log file: the appendable head or an immutable,
//! rotated file.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use memmap2::Mmap;
use tracing::{debug, warn};

use super::block::{BlockLayout, BlockReader, ByteSource, LOG_HDR_SIZE, LogFileHeader, frame_record};
use super::record::{LogKey, LogValue, Record, RecordParser};
use super::{KeyMatchingStrategy, PositionStrategy};
use crate::error::{ChangelogError, IoResultExt, poisoned};

/// Reserved name of the appendable file of a log.
pub(crate) const HEAD_LOG_FILE_NAME: &str = "head.log";

/// Extension shared by all log files.
pub(crate) const LOG_FILE_SUFFIX: &str = ".log";

/// Separator between the low and high key of a rotated file name.
pub(crate) const LOG_FILE_NAME_SEPARATOR: char = '_';

enum Storage {
    Appendable {
        /// `None` once the file is closed.
        writer: Mutex<Option<File>>,
        reader: File,
    },
    ReadOnly {
        mmap: Mmap,
    },
}

pub(crate) struct LogFile<K, V> {
    path: PathBuf,
    parser: Arc<dyn RecordParser<K, V>>,
    layout: BlockLayout,
    max_record_size: u32,
    storage: Storage,
    /// Bytes of fully appended records. Readers never look past it.
    size: AtomicU64,
    oldest: RwLock<Option<Record<K, V>>>,
    newest: RwLock<Option<Record<K, V>>>,
}

impl<K: LogKey, V: LogValue> LogFile<K, V> {
    /// Creates `path` as an empty head file, or reopens an existing one.
    ///
    /// A trailing record left incomplete by a crash is cut off so that
    /// appends resume right after the last complete record.
    pub fn open_appendable(
        path: &Path,
        parser: Arc<dyn RecordParser<K, V>>,
        block_size: u32,
        max_record_size: u32,
    ) -> Result<Self, ChangelogError> {
        let writer = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .at(path)?;
        let len = writer.metadata().at(path)?.len();

        let header = if len < LOG_HDR_SIZE {
            if len > 0 {
                warn!(path = %path.display(), len, "incomplete log header, reinitialising head file");
                writer.set_len(0).at(path)?;
            }
            let header = LogFileHeader::new(block_size);
            writer.write_all_at(&header.to_bytes()?, 0).at(path)?;
            writer.sync_all().at(path)?;
            header
        } else {
            let mut bytes = [0u8; LOG_HDR_SIZE as usize];
            writer.read_exact_at(&mut bytes, 0).at(path)?;
            LogFileHeader::parse(&bytes, path)?
        };

        let reader = File::open(path).at(path)?;
        let file = Self {
            path: path.to_path_buf(),
            parser,
            layout: BlockLayout::new(header.block_size),
            max_record_size,
            storage: Storage::Appendable {
                writer: Mutex::new(Some(writer)),
                reader,
            },
            size: AtomicU64::new(len.max(LOG_HDR_SIZE)),
            oldest: RwLock::new(None),
            newest: RwLock::new(None),
        };
        file.recover_tail()?;
        Ok(file)
    }

    /// Opens an immutable, rotated log file.
    pub fn open_read_only(
        path: &Path,
        parser: Arc<dyn RecordParser<K, V>>,
        max_record_size: u32,
    ) -> Result<Self, ChangelogError> {
        let handle = File::open(path).at(path)?;
        // SAFETY: rotated log files are never modified once renamed, and
        // the mapping is read-only.
        let mmap = unsafe { Mmap::map(&handle).at(path)? };
        let header = LogFileHeader::parse(&mmap, path)?;
        let size = mmap.len() as u64;

        let file = Self {
            path: path.to_path_buf(),
            parser,
            layout: BlockLayout::new(header.block_size),
            max_record_size,
            storage: Storage::ReadOnly { mmap },
            size: AtomicU64::new(size),
            oldest: RwLock::new(None),
            newest: RwLock::new(None),
        };
        let oldest = file.read_at(LOG_HDR_SIZE)?.map(|(record, _)| record);
        let newest = file.scan_newest()?;
        *file.oldest.write().map_err(poisoned("log file"))? = oldest;
        *file.newest.write().map_err(poisoned("log file"))? = newest;
        Ok(file)
    }

    // --------------------------------------------------------------------------------------------
    // Accessors
    // --------------------------------------------------------------------------------------------

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_appendable(&self) -> bool {
        matches!(self.storage, Storage::Appendable { .. })
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn oldest_record(&self) -> Result<Option<Record<K, V>>, ChangelogError> {
        Ok(self.oldest.read().map_err(poisoned("log file"))?.clone())
    }

    pub fn newest_record(&self) -> Result<Option<Record<K, V>>, ChangelogError> {
        Ok(self.newest.read().map_err(poisoned("log file"))?.clone())
    }

    /// Newest key without cloning the value.
    pub fn newest_key(&self) -> Result<Option<K>, ChangelogError> {
        Ok(self
            .newest
            .read()
            .map_err(poisoned("log file"))?
            .as_ref()
            .map(|r| r.key().clone()))
    }

    pub fn is_empty(&self) -> Result<bool, ChangelogError> {
        Ok(self.newest.read().map_err(poisoned("log file"))?.is_none())
    }

    /// Position of the first record.
    pub fn first_position(&self) -> u64 {
        LOG_HDR_SIZE
    }

    // --------------------------------------------------------------------------------------------
    // Writing
    // --------------------------------------------------------------------------------------------

    /// Whether appending `record` would not move the newest key forward.
    pub fn append_would_break_key_ordering(&self, record: &Record<K, V>) -> Result<bool, ChangelogError> {
        Ok(self
            .newest
            .read()
            .map_err(poisoned("log file"))?
            .as_ref()
            .is_some_and(|newest| record.key() <= newest.key()))
    }

    /// Appends `record`. Returns `false` without writing anything when
    /// its key is not greater than the newest key of this file.
    pub fn append(&self, record: &Record<K, V>) -> Result<bool, ChangelogError> {
        let Storage::Appendable { writer, .. } = &self.storage else {
            return Err(ChangelogError::Internal(format!(
                "append to read-only log file {}",
                self.path.display()
            )));
        };
        let guard = writer.lock().map_err(poisoned("log writer"))?;
        let Some(file) = guard.as_ref() else {
            return Err(ChangelogError::Internal(format!(
                "append to closed log file {}",
                self.path.display()
            )));
        };
        if self.append_would_break_key_ordering(record)? {
            return Ok(false);
        }

        let payload = self.parser.encode_record(record)?;
        if payload.is_empty() {
            return Err(ChangelogError::InvalidArgument("record encodes to zero bytes".into()));
        }
        if payload.len() > self.max_record_size as usize {
            return Err(ChangelogError::RecordTooLarge(payload.len()));
        }

        let start = self.size.load(Ordering::Acquire);
        let bytes = self.layout.lay_out(start, &frame_record(&payload)?)?;
        file.write_all_at(&bytes, start).at(&self.path)?;
        self.size.store(start + bytes.len() as u64, Ordering::Release);

        let mut oldest = self.oldest.write().map_err(poisoned("log file"))?;
        if oldest.is_none() {
            *oldest = Some(record.clone());
        }
        drop(oldest);
        *self.newest.write().map_err(poisoned("log file"))? = Some(record.clone());
        Ok(true)
    }

    /// Flushes appended records to durable storage.
    pub fn sync(&self) -> Result<(), ChangelogError> {
        if let Storage::Appendable { writer, .. } = &self.storage
            && let Some(file) = writer.lock().map_err(poisoned("log writer"))?.as_ref()
        {
            file.sync_data().at(&self.path)?;
        }
        Ok(())
    }

    /// Syncs and releases the write handle. Reads stay possible.
    pub fn close(&self) -> Result<(), ChangelogError> {
        if let Storage::Appendable { writer, .. } = &self.storage
            && let Some(file) = writer.lock().map_err(poisoned("log writer"))?.take()
        {
            file.sync_all().at(&self.path)?;
        }
        Ok(())
    }

    pub fn delete(&self) -> Result<(), ChangelogError> {
        fs::remove_file(&self.path).at(&self.path)
    }

    // --------------------------------------------------------------------------------------------
    // Reading
    // --------------------------------------------------------------------------------------------

    fn reader(&self) -> BlockReader<'_> {
        let source: &dyn ByteSource = match &self.storage {
            Storage::Appendable { reader, .. } => reader,
            Storage::ReadOnly { mmap } => mmap,
        };
        BlockReader {
            source,
            layout: self.layout,
            limit: self.size.load(Ordering::Acquire),
            max_record_size: self.max_record_size,
            path: &self.path,
        }
    }

    fn decode_at(
        &self,
        reader: &BlockReader<'_>,
        pos: u64,
    ) -> Result<Option<(Record<K, V>, u64)>, ChangelogError> {
        match reader.read_record(pos)? {
            None => Ok(None),
            Some((payload, next)) => Ok(Some((self.parser.decode_record(&payload)?, next))),
        }
    }

    /// Reads the record starting at `pos` together with the position of
    /// the record that follows it.
    pub fn read_at(&self, pos: u64) -> Result<Option<(Record<K, V>, u64)>, ChangelogError> {
        self.decode_at(&self.reader(), pos)
    }

    /// Finds the position a cursor must take so that its next read returns
    /// the record selected by `key` and the strategies.
    ///
    /// Returns whether a matching record exists in this file. When it does
    /// not, the position is the start of the file for
    /// [`KeyMatchingStrategy::LessThanOrEqualToKey`] and the end of the
    /// file otherwise.
    pub fn seek(
        &self,
        key: &K,
        matching: KeyMatchingStrategy,
        positioning: PositionStrategy,
    ) -> Result<(bool, u64), ChangelogError> {
        let reader = self.reader();
        let on_match = |start: u64, end: u64| match positioning {
            PositionStrategy::OnMatchingKey => start,
            PositionStrategy::AfterMatchingKey => end,
        };

        // Greatest block whose first recoverable record is <= key.
        let mut pos = LOG_HDR_SIZE;
        let (mut lo, mut hi) = (0, self.layout.block_count(reader.limit));
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let start = reader.record_start_in_block(mid)?;
            match self.decode_at(&reader, start)? {
                Some((record, _)) if record.key() <= key => {
                    pos = start;
                    lo = mid + 1;
                }
                _ => hi = mid,
            }
        }

        let mut last_lower: Option<(u64, u64)> = None;
        while let Some((record, next)) = self.decode_at(&reader, pos)? {
            match record.key().cmp(key) {
                std::cmp::Ordering::Less => last_lower = Some((pos, next)),
                std::cmp::Ordering::Equal => return Ok((true, on_match(pos, next))),
                std::cmp::Ordering::Greater => match matching {
                    KeyMatchingStrategy::EqualToKey => return Ok((false, pos)),
                    KeyMatchingStrategy::GreaterThanOrEqualToKey => return Ok((true, pos)),
                    KeyMatchingStrategy::LessThanOrEqualToKey => break,
                },
            }
            pos = next;
        }

        match (matching, last_lower) {
            (KeyMatchingStrategy::LessThanOrEqualToKey, Some((start, end))) => {
                Ok((true, on_match(start, end)))
            }
            (KeyMatchingStrategy::LessThanOrEqualToKey, None) => Ok((false, LOG_HDR_SIZE)),
            _ => Ok((false, pos)),
        }
    }

    /// Counts the records of this file by scanning it.
    pub fn number_of_records(&self) -> Result<u64, ChangelogError> {
        let reader = self.reader();
        let mut count = 0;
        let mut pos = LOG_HDR_SIZE;
        while let Some((_, next)) = reader.read_record(pos)? {
            count += 1;
            pos = next;
        }
        Ok(count)
    }

    /// Reads the last record, starting from the last block boundary.
    fn scan_newest(&self) -> Result<Option<Record<K, V>>, ChangelogError> {
        let reader = self.reader();
        let blocks = self.layout.block_count(reader.limit);
        let mut pos = match blocks {
            0 => return Ok(None),
            n => reader.record_start_in_block(n - 1)?,
        };
        let mut newest = None;
        while let Some((record, next)) = self.decode_at(&reader, pos)? {
            newest = Some(record);
            pos = next;
        }
        Ok(newest)
    }

    /// Validates the head file and truncates an incomplete trailing record.
    fn recover_tail(&self) -> Result<(), ChangelogError> {
        let reader = self.reader();
        let blocks = self.layout.block_count(reader.limit);
        let tail_start = match blocks {
            0 => LOG_HDR_SIZE,
            n => reader.record_start_in_block(n - 1).unwrap_or(LOG_HDR_SIZE),
        };

        let (newest, valid_end) = match self.walk_valid(&reader, tail_start)? {
            Some((Some(newest), end)) => (Some(newest), end),
            // Nothing readable from the tail block: walk from the start.
            _ => self
                .walk_valid(&reader, LOG_HDR_SIZE)?
                .unwrap_or((None, LOG_HDR_SIZE)),
        };

        if valid_end < reader.limit {
            warn!(
                path = %self.path.display(),
                valid_end,
                file_len = reader.limit,
                "truncating incomplete records at end of head log file"
            );
            if let Storage::Appendable { writer, .. } = &self.storage
                && let Some(file) = writer.lock().map_err(poisoned("log writer"))?.as_ref()
            {
                file.set_len(valid_end).at(&self.path)?;
                file.sync_all().at(&self.path)?;
            }
            self.size.store(valid_end, Ordering::Release);
        }

        let oldest = self.read_at(LOG_HDR_SIZE)?.map(|(record, _)| record);
        debug!(path = %self.path.display(), size = valid_end, empty = oldest.is_none(), "head log file opened");
        *self.oldest.write().map_err(poisoned("log file"))? = oldest;
        *self.newest.write().map_err(poisoned("log file"))? = newest;
        Ok(())
    }

    /// Walks records from `start` until the end or the first framing
    /// error. Returns `None` if not even the first record is readable
    /// while bytes remain, otherwise the last record and the end of the
    /// valid region. Payload decode failures are propagated.
    fn walk_valid(
        &self,
        reader: &BlockReader<'_>,
        start: u64,
    ) -> Result<Option<(Option<Record<K, V>>, u64)>, ChangelogError> {
        let mut pos = start;
        let mut newest = None;
        loop {
            match reader.read_record(pos) {
                Ok(None) => return Ok(Some((newest, pos))),
                Ok(Some((payload, next))) => {
                    newest = Some(self.parser.decode_record(&payload)?);
                    pos = next;
                }
                Err(ChangelogError::Corrupted { .. }) if newest.is_none() && pos == start && start != LOG_HDR_SIZE => {
                    return Ok(None);
                }
                Err(ChangelogError::Corrupted { .. }) => return Ok(Some((newest, pos))),
                Err(e) => return Err(e),
            }
        }
    }
}

impl<K, V> std::fmt::Debug for LogFile<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogFile")
            .field("path", &self.path)
            .field("size", &self.size.load(Ordering::Relaxed))
            .field("appendable", &matches!(self.storage, Storage::Appendable { .. }))
            .finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Per-file cursor
// ------------------------------------------------------------------------------------------------

/// Sequential reader over one [`LogFile`].
///
/// `position` is the physical offset of the next record to read, and
/// together with `current` forms the state that is carried over to the
/// rotated file when the head file is renamed.
pub(crate) struct LogFileCursor<K, V> {
    file: Arc<LogFile<K, V>>,
    position: u64,
    current: Option<Record<K, V>>,
}

impl<K: LogKey, V: LogValue> LogFileCursor<K, V> {
    pub fn new(file: Arc<LogFile<K, V>>) -> Self {
        let position = file.first_position();
        Self {
            file,
            position,
            current: None,
        }
    }

    pub fn restore(file: Arc<LogFile<K, V>>, position: u64, current: Option<Record<K, V>>) -> Self {
        Self {
            file,
            position,
            current,
        }
    }

    pub fn file(&self) -> &Arc<LogFile<K, V>> {
        &self.file
    }

    pub fn record(&self) -> Option<&Record<K, V>> {
        self.current.as_ref()
    }

    pub fn state(&self) -> (u64, Option<Record<K, V>>) {
        (self.position, self.current.clone())
    }

    pub fn next(&mut self) -> Result<bool, ChangelogError> {
        match self.file.read_at(self.position)? {
            Some((record, next)) => {
                self.current = Some(record);
                self.position = next;
                Ok(true)
            }
            None => {
                self.current = None;
                Ok(false)
            }
        }
    }

    pub fn position_to(
        &mut self,
        key: &K,
        matching: KeyMatchingStrategy,
        positioning: PositionStrategy,
    ) -> Result<bool, ChangelogError> {
        let (found, position) = self.file.seek(key, matching, positioning)?;
        self.position = position;
        self.current = None;
        Ok(found)
    }
}
