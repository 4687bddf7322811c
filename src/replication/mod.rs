//! Replication identities and state: change sequence numbers, base DNs,
//! per-domain server states, update messages and change-number index
//! records.

mod change_number;
mod csn;
mod server_state;
mod update_msg;


pub use change_number::ChangeNumberIndexRecord;
pub use csn::{Csn, CsnGenerator};
pub use server_state::{MultiDomainServerState, ServerState};
pub use update_msg::UpdateMsg;

use std::fmt;

use crate::encoding::{Decode, Encode, EncodingError};

/// Base DN of a replication domain.
///
/// Compared as an opaque string. The changelog never parses it.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Dn(String);

impl Dn {
    pub fn new(dn: impl Into<String>) -> Self {
        Self(dn.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Dn {
    fn from(dn: &str) -> Self {
        Self(dn.to_string())
    }
}

impl From<String> for Dn {
    fn from(dn: String) -> Self {
        Self(dn)
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dn({:?})", self.0)
    }
}

impl Encode for Dn {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.0.as_str().encode_to(buf)
    }
}

impl Decode for Dn {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (dn, n) = String::decode_from(buf)?;
        Ok((Self(dn), n))
    }
}
