//! Change sequence numbers.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use crate::encoding::{Decode, Encode, EncodingError};
use crate::error::{ChangelogError, poisoned};
use crate::ports::Clock;

/// Length of the string form of a [`Csn`].
pub const CSN_STRING_LEN: usize = 28;

/// Identifies one change made on one replica.
///
/// CSNs are ordered by timestamp, then sequence number, then replica id,
/// so that the CSNs of all replicas form a single total order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Csn {
    timestamp: u64,
    seqnum: u32,
    server_id: u16,
}

impl Csn {
    /// Greater than every CSN a replica generates.
    pub const MAX: Csn = Csn {
        timestamp: u64::MAX,
        seqnum: u32::MAX,
        server_id: u16::MAX,
    };

    pub const fn new(timestamp: u64, seqnum: u32, server_id: u16) -> Self {
        Self {
            timestamp,
            seqnum,
            server_id,
        }
    }

    /// The oldest possible CSN of `server_id`.
    pub const fn oldest_for(server_id: u16) -> Self {
        Self::new(0, 0, server_id)
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn seqnum(&self) -> u32 {
        self.seqnum
    }

    pub fn server_id(&self) -> u16 {
        self.server_id
    }

    pub fn is_older_than(&self, other: &Csn) -> bool {
        self < other
    }

    pub fn is_newer_than(&self, other: &Csn) -> bool {
        self > other
    }
}

impl Ord for Csn {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.seqnum.cmp(&other.seqnum))
            .then(self.server_id.cmp(&other.server_id))
    }
}

impl PartialOrd for Csn {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:04x}{:08x}", self.timestamp, self.server_id, self.seqnum)
    }
}

impl fmt::Debug for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Csn({self})")
    }
}

impl FromStr for Csn {
    type Err = ChangelogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ChangelogError::Decode(format!("invalid CSN {s:?}"));
        if s.len() != CSN_STRING_LEN || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        let timestamp = u64::from_str_radix(&s[..16], 16).map_err(|_| invalid())?;
        let server_id = u16::from_str_radix(&s[16..20], 16).map_err(|_| invalid())?;
        let seqnum = u32::from_str_radix(&s[20..], 16).map_err(|_| invalid())?;
        Ok(Self::new(timestamp, seqnum, server_id))
    }
}

impl Encode for Csn {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.timestamp.encode_to(buf)?;
        self.seqnum.encode_to(buf)?;
        self.server_id.encode_to(buf)
    }
}

impl Decode for Csn {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (timestamp, mut offset) = u64::decode_from(buf)?;
        let (seqnum, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (server_id, n) = u16::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self::new(timestamp, seqnum, server_id), offset))
    }
}

// ------------------------------------------------------------------------------------------------
// Generator
// ------------------------------------------------------------------------------------------------

/// Issues strictly increasing CSNs for one replica.
pub struct CsnGenerator {
    server_id: u16,
    clock: Arc<dyn Clock>,
    last: Mutex<(u64, u32)>,
}

impl CsnGenerator {
    pub fn new(server_id: u16, clock: Arc<dyn Clock>) -> Self {
        Self {
            server_id,
            clock,
            last: Mutex::new((0, 0)),
        }
    }

    pub fn server_id(&self) -> u16 {
        self.server_id
    }

    /// Returns a CSN newer than every CSN returned or observed so far.
    pub fn new_csn(&self) -> Result<Csn, ChangelogError> {
        let mut last = self.last.lock().map_err(poisoned("csn generator"))?;
        let now = self.clock.now_millis();
        let (timestamp, seqnum) = if now > last.0 {
            (now, 0)
        } else if last.1 == u32::MAX {
            (last.0 + 1, 0)
        } else {
            (last.0, last.1 + 1)
        };
        *last = (timestamp, seqnum);
        Ok(Csn::new(timestamp, seqnum, self.server_id))
    }

    /// Makes sure later CSNs are newer than `seen`, a CSN received from
    /// another replica.
    pub fn adjust(&self, seen: &Csn) -> Result<(), ChangelogError> {
        let mut last = self.last.lock().map_err(poisoned("csn generator"))?;
        if (seen.timestamp, seen.seqnum) > *last {
            *last = (seen.timestamp, seen.seqnum);
        }
        Ok(())
    }
}

impl fmt::Debug for CsnGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsnGenerator")
            .field("server_id", &self.server_id)
            .finish_non_exhaustive()
    }
}
