//! Unspent output records.

use crate::encoding::{DecodeError, Decoder, Encoder};

/// A UTXO: the output itself plus the provenance the spend rules need.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Coin {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
    pub height: u32,
    pub is_coinbase: bool,
    pub is_coinstake: bool,
    /// Timestamp of the creating transaction; the stake-age rules read it.
    pub time: u32,
}

impl Coin {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(self.script_pubkey.len() + 24);
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
        encoder.write_u32_le(self.height);
        let mut flags = 0u8;
        if self.is_coinbase {
            flags |= 1;
        }
        if self.is_coinstake {
            flags |= 2;
        }
        encoder.write_u8(flags);
        encoder.write_u32_le(self.time);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        let height = decoder.read_u32_le()?;
        let flags = decoder.read_u8()?;
        let time = decoder.read_u32_le()?;
        decoder.finish()?;
        Ok(Self {
            value,
            script_pubkey,
            height,
            is_coinbase: flags & 1 != 0,
            is_coinstake: flags & 2 != 0,
            time,
        })
    }

    /// Approximate memory footprint, used by the cache byte budget.
    pub fn memory_usage(&self) -> usize {
        32 + self.script_pubkey.len()
    }
}

#[cfg(test)]
mod tests {
    use super::Coin;

    #[test]
    fn coin_roundtrip_preserves_flags() {
        let coin = Coin {
            value: 1_234,
            script_pubkey: vec![0x76, 0xa9, 0x14],
            height: 77,
            is_coinbase: true,
            is_coinstake: false,
            time: 1_700_000_000,
        };
        let decoded = Coin::decode(&coin.encode()).expect("decode");
        assert_eq!(decoded, coin);

        let stake = Coin {
            is_coinbase: false,
            is_coinstake: true,
            ..coin
        };
        let decoded = Coin::decode(&stake.encode()).expect("decode");
        assert!(decoded.is_coinstake);
        assert!(!decoded.is_coinbase);
    }
}
