use super::{Csn, Dn};
use crate::encoding::{Decode, Encode, EncodingError};

/// One entry of the change-number index: the `change_number`-th change
/// published by this server was `csn` in domain `base_dn`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNumberIndexRecord {
    pub change_number: u64,
    pub base_dn: Dn,
    pub csn: Csn,
}

impl ChangeNumberIndexRecord {
    pub fn new(change_number: u64, base_dn: Dn, csn: Csn) -> Self {
        Self {
            change_number,
            base_dn,
            csn,
        }
    }
}

impl Encode for ChangeNumberIndexRecord {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.change_number.encode_to(buf)?;
        self.base_dn.encode_to(buf)?;
        self.csn.encode_to(buf)
    }
}

impl Decode for ChangeNumberIndexRecord {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (change_number, mut offset) = u64::decode_from(buf)?;
        let (base_dn, n) = Dn::decode_from(&buf[offset..])?;
        offset += n;
        let (csn, n) = Csn::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self::new(change_number, base_dn, csn), offset))
    }
}
