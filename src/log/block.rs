//! Physical layout of a log file: header, blocks, offset markers and
//! record framing.
//!
//! # On-disk layout
//!
//! ```text
//! [MAGIC "RCLG"][VERSION_LE][BLOCK_SIZE_LE][HEADER_CRC32_LE]
//! [OFFSET_LE][record bytes ...................................]   block 0
//! [OFFSET_LE][... record bytes continued, next records .......]   block 1
//! ...
//! ```
//!
//! After the 16-byte header the file is cut into blocks of `block_size`
//! bytes. The first four bytes of every block hold an offset marker: the
//! distance back from the block start to the start of the record that
//! straddles the boundary, or `0` when a record starts exactly at the
//! block start. Records are written as
//!
//! ```text
//! [REC_LEN_LE][REC_BYTES][REC_CRC32_LE]
//! ```
//!
//! with the checksum computed over `len || bytes`. Record bytes flow
//! around the markers, so a record may span any number of blocks.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use crc32fast::Hasher as Crc32;
use memmap2::Mmap;

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::error::ChangelogError;

/// Size of the log file header in bytes.
pub(crate) const LOG_HDR_SIZE: u64 = 16;

/// Size of the offset marker at the start of each block.
pub(crate) const BLOCK_OFFSET_SIZE: u64 = 4;

const U32_SIZE: usize = std::mem::size_of::<u32>();

/// Smallest block size accepted by the writer.
pub const MIN_BLOCK_SIZE: u32 = 64;

/// Block size used when none is configured.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

// ------------------------------------------------------------------------------------------------
// Header
// ------------------------------------------------------------------------------------------------

/// Metadata written at the start of every log file, followed by its CRC32.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LogFileHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub block_size: u32,
}

impl LogFileHeader {
    pub const MAGIC: [u8; 4] = *b"RCLG";
    pub const VERSION: u32 = 1;

    pub fn new(block_size: u32) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            block_size,
        }
    }

    /// Serializes the header and appends its checksum.
    pub fn to_bytes(self) -> Result<Vec<u8>, EncodingError> {
        let mut buf = encoding::encode_to_vec(&self)?;
        let crc = crc32fast::hash(&buf);
        crc.encode_to(&mut buf)?;
        Ok(buf)
    }

    /// Parses and validates a header read from `path`.
    pub fn parse(bytes: &[u8], path: &Path) -> Result<Self, ChangelogError> {
        let corrupted = |reason: String| ChangelogError::Corrupted {
            path: path.to_path_buf(),
            offset: 0,
            reason,
        };
        if bytes.len() < LOG_HDR_SIZE as usize {
            return Err(corrupted(format!("header truncated to {} bytes", bytes.len())));
        }
        let body = &bytes[..LOG_HDR_SIZE as usize - U32_SIZE];
        let (stored_crc, _) = u32::decode_from(&bytes[body.len()..])?;
        if crc32fast::hash(body) != stored_crc {
            return Err(corrupted("header checksum mismatch".into()));
        }
        let (header, _) = encoding::decode_from_slice::<LogFileHeader>(body)?;
        if header.magic != Self::MAGIC {
            return Err(corrupted(format!("bad magic {:?}", header.magic)));
        }
        if header.version != Self::VERSION {
            return Err(corrupted(format!("unsupported version {}", header.version)));
        }
        if header.block_size < MIN_BLOCK_SIZE {
            return Err(corrupted(format!("invalid block size {}", header.block_size)));
        }
        Ok(header)
    }
}

impl Encode for LogFileHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.magic.encode_to(buf)?;
        self.version.encode_to(buf)?;
        self.block_size.encode_to(buf)
    }
}

impl Decode for LogFileHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (magic, mut offset) = <[u8; 4]>::decode_from(buf)?;
        let (version, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (block_size, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                magic,
                version,
                block_size,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Block layout
// ------------------------------------------------------------------------------------------------

/// Arithmetic over physical file positions for one block size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockLayout {
    block_size: u64,
}

impl BlockLayout {
    pub fn new(block_size: u32) -> Self {
        Self {
            block_size: u64::from(block_size),
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn is_block_start(&self, pos: u64) -> bool {
        pos >= LOG_HDR_SIZE && (pos - LOG_HDR_SIZE) % self.block_size == 0
    }

    pub fn block_start(&self, index: u64) -> u64 {
        LOG_HDR_SIZE + index * self.block_size
    }

    /// Start of the block following the one containing `pos`.
    pub fn next_block_start(&self, pos: u64) -> u64 {
        self.block_start((pos - LOG_HDR_SIZE) / self.block_size + 1)
    }

    /// Number of blocks holding at least one byte below `end`.
    pub fn block_count(&self, end: u64) -> u64 {
        if end <= LOG_HDR_SIZE {
            0
        } else {
            (end - LOG_HDR_SIZE - 1) / self.block_size + 1
        }
    }

    /// Interleaves offset markers into `framed`, a framed record to be
    /// written at physical position `start`.
    ///
    /// Record sizes are bounded by the configured maximum record size,
    /// which always fits a marker.
    pub fn lay_out(&self, start: u64, framed: &[u8]) -> Result<Vec<u8>, ChangelogError> {
        let markers = framed.len() as u64 / (self.block_size - BLOCK_OFFSET_SIZE) + 1;
        let mut out = Vec::with_capacity(framed.len() + (markers * BLOCK_OFFSET_SIZE) as usize);
        let mut pos = start;
        let mut rest = framed;
        while !rest.is_empty() {
            if self.is_block_start(pos) {
                let distance =
                    u32::try_from(pos - start).map_err(|_| ChangelogError::RecordTooLarge(framed.len()))?;
                out.extend_from_slice(&distance.to_le_bytes());
                pos += BLOCK_OFFSET_SIZE;
            }
            let room = (self.next_block_start(pos) - pos) as usize;
            let n = room.min(rest.len());
            out.extend_from_slice(&rest[..n]);
            pos += n as u64;
            rest = &rest[n..];
        }
        Ok(out)
    }
}

/// Frames a record payload as `[len][payload][crc32(len || payload)]`.
pub(crate) fn frame_record(payload: &[u8]) -> Result<Vec<u8>, ChangelogError> {
    let len = u32::try_from(payload.len()).map_err(|_| ChangelogError::RecordTooLarge(payload.len()))?;
    let mut framed = Vec::with_capacity(payload.len() + 2 * U32_SIZE);
    framed.extend_from_slice(&len.to_le_bytes());
    framed.extend_from_slice(payload);
    let mut hasher = Crc32::new();
    hasher.update(&framed);
    framed.extend_from_slice(&hasher.finalize().to_le_bytes());
    Ok(framed)
}

// ------------------------------------------------------------------------------------------------
// Byte sources
// ------------------------------------------------------------------------------------------------

/// Random-access read over the bytes of a log file.
pub(crate) trait ByteSource: Send + Sync {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
}

impl ByteSource for File {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.read_exact_at(buf, offset)
    }
}

impl ByteSource for Mmap {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let start = usize::try_from(offset).map_err(|_| io::ErrorKind::InvalidInput)?;
        let end = start + buf.len();
        if end > self.len() {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        buf.copy_from_slice(&self[start..end]);
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Block reader
// ------------------------------------------------------------------------------------------------

/// Reads framed records from a [`ByteSource`], never past `limit`.
pub(crate) struct BlockReader<'a> {
    pub source: &'a dyn ByteSource,
    pub layout: BlockLayout,
    pub limit: u64,
    pub max_record_size: u32,
    pub path: &'a Path,
}

impl BlockReader<'_> {
    fn corrupted(&self, offset: u64, reason: impl Into<String>) -> ChangelogError {
        ChangelogError::Corrupted {
            path: self.path.to_path_buf(),
            offset,
            reason: reason.into(),
        }
    }

    /// Reads `len` record bytes starting at `pos`, skipping markers.
    /// Returns the bytes and the position following them.
    fn read_bytes(&self, mut pos: u64, len: usize) -> Result<(Vec<u8>, u64), ChangelogError> {
        let mut out = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            if self.layout.is_block_start(pos) {
                pos += BLOCK_OFFSET_SIZE;
            }
            let room = (self.layout.next_block_start(pos) - pos) as usize;
            let chunk = room.min(len - filled);
            if pos + chunk as u64 > self.limit {
                return Err(self.corrupted(pos, "record extends past end of file"));
            }
            self.source
                .read_at(pos, &mut out[filled..filled + chunk])
                .map_err(|e| ChangelogError::Io {
                    path: self.path.to_path_buf(),
                    source: e,
                })?;
            filled += chunk;
            pos += chunk as u64;
        }
        Ok((out, pos))
    }

    /// Reads the record starting at `pos`.
    ///
    /// Returns `None` at the end of the readable bytes, otherwise the
    /// record payload and the position of the following record.
    pub fn read_record(&self, pos: u64) -> Result<Option<(Vec<u8>, u64)>, ChangelogError> {
        let first_byte = if self.layout.is_block_start(pos) {
            pos + BLOCK_OFFSET_SIZE
        } else {
            pos
        };
        if first_byte >= self.limit {
            return Ok(None);
        }

        let (len_bytes, after_len) = self.read_bytes(pos, U32_SIZE)?;
        let (len, _) = u32::decode_from(&len_bytes)?;
        if len == 0 || len > self.max_record_size {
            return Err(self.corrupted(pos, format!("invalid record length {len}")));
        }

        let (body, next) = self.read_bytes(after_len, len as usize + U32_SIZE)?;
        let (payload, crc_bytes) = body.split_at(len as usize);
        let (stored_crc, _) = u32::decode_from(crc_bytes)?;
        let mut hasher = Crc32::new();
        hasher.update(&len_bytes);
        hasher.update(payload);
        if hasher.finalize() != stored_crc {
            return Err(self.corrupted(pos, "record checksum mismatch"));
        }

        tracing::trace!(path = %self.path.display(), pos, len, "record read");
        Ok(Some((payload.to_vec(), next)))
    }

    /// Position of the first record boundary recoverable from block
    /// `index`: the start of the record straddling the block start, or
    /// the block start itself.
    pub fn record_start_in_block(&self, index: u64) -> Result<u64, ChangelogError> {
        let block_start = self.layout.block_start(index);
        if block_start + BLOCK_OFFSET_SIZE > self.limit {
            return Err(self.corrupted(block_start, "block marker past end of file"));
        }
        let mut marker = [0u8; U32_SIZE];
        self.source
            .read_at(block_start, &mut marker)
            .map_err(|e| ChangelogError::Io {
                path: self.path.to_path_buf(),
                source: e,
            })?;
        let distance = u64::from(u32::from_le_bytes(marker));
        if distance > block_start - LOG_HDR_SIZE {
            return Err(self.corrupted(block_start, format!("invalid block offset {distance}")));
        }
        Ok(block_start - distance)
    }
}
