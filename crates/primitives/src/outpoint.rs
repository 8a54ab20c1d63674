use plbd_consensus::Hash256;

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct OutPoint {
    pub hash: Hash256,
    pub index: u32,
}

impl OutPoint {
    pub const NULL_INDEX: u32 = u32::MAX;

    pub fn null() -> Self {
        Self {
            hash: [0u8; 32],
            index: Self::NULL_INDEX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.hash == [0u8; 32] && self.index == Self::NULL_INDEX
    }

    /// Fixed 36-byte key used by the coin and index columns.
    pub fn key(&self) -> [u8; 36] {
        let mut key = [0u8; 36];
        key[0..32].copy_from_slice(&self.hash);
        key[32..36].copy_from_slice(&self.index.to_le_bytes());
        key
    }

    pub fn from_key(key: &[u8]) -> Option<Self> {
        if key.len() != 36 {
            return None;
        }
        let hash: Hash256 = key[0..32].try_into().ok()?;
        let index = u32::from_le_bytes(key[32..36].try_into().ok()?);
        Some(Self { hash, index })
    }
}

impl Encodable for OutPoint {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_bytes(&self.hash);
        encoder.write_u32_le(self.index);
    }
}

impl Decodable for OutPoint {
    fn consensus_decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let hash = decoder.read_fixed::<32>()?;
        let index = decoder.read_u32_le()?;
        Ok(Self { hash, index })
    }
}
