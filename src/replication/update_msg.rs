//! Messages stored in replica logs.

use super::Csn;
use crate::encoding::{self, Decode, Encode, EncodingError};

const UPDATE_TAG: u8 = 1;
const REPLICA_OFFLINE_TAG: u8 = 2;

/// A change recorded in a replica log, or the marker a replica cursor
/// synthesizes when its replica went offline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateMsg {
    /// A real update with its opaque payload.
    Update { csn: Csn, payload: Vec<u8> },
    /// The replica went offline at `csn`.
    ReplicaOffline { csn: Csn },
}

impl UpdateMsg {
    pub fn update(csn: Csn, payload: impl Into<Vec<u8>>) -> Self {
        UpdateMsg::Update {
            csn,
            payload: payload.into(),
        }
    }

    pub fn replica_offline(csn: Csn) -> Self {
        UpdateMsg::ReplicaOffline { csn }
    }

    pub fn csn(&self) -> Csn {
        match self {
            UpdateMsg::Update { csn, .. } | UpdateMsg::ReplicaOffline { csn } => *csn,
        }
    }

    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            UpdateMsg::Update { payload, .. } => Some(payload),
            UpdateMsg::ReplicaOffline { .. } => None,
        }
    }

    pub fn is_replica_offline(&self) -> bool {
        matches!(self, UpdateMsg::ReplicaOffline { .. })
    }
}

impl Encode for UpdateMsg {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            UpdateMsg::Update { csn, payload } => {
                UPDATE_TAG.encode_to(buf)?;
                csn.encode_to(buf)?;
                encoding::encode_bytes(payload, buf)
            }
            UpdateMsg::ReplicaOffline { csn } => {
                REPLICA_OFFLINE_TAG.encode_to(buf)?;
                csn.encode_to(buf)
            }
        }
    }
}

impl Decode for UpdateMsg {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, mut offset) = u8::decode_from(buf)?;
        let (csn, n) = Csn::decode_from(&buf[offset..])?;
        offset += n;
        match tag {
            UPDATE_TAG => {
                let (payload, n) = encoding::decode_bytes(&buf[offset..])?;
                offset += n;
                Ok((UpdateMsg::update(csn, payload), offset))
            }
            REPLICA_OFFLINE_TAG => Ok((UpdateMsg::ReplicaOffline { csn }, offset)),
            other => Err(EncodingError::InvalidTag {
                tag: u32::from(other),
                type_name: "UpdateMsg",
            }),
        }
    }
}
