//! Transaction types and consensus serialization.
//!
//! Transactions carry a timestamp after the version field; the coinstake
//! timestamp rules depend on it. Witness data uses the usual marker/flag
//! framing and is excluded from the txid.

use plbd_consensus::Hash256;

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

pub const CURRENT_TX_VERSION: i32 = 2;
const SEGWIT_MARKER: u8 = 0x00;
const SEGWIT_FLAG: u8 = 0x01;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    pub witness: Vec<Vec<u8>>,
}

impl TxIn {
    pub const SEQUENCE_FINAL: u32 = u32::MAX;
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    /// An empty output, as required in slot 0 of a coinstake.
    pub fn empty() -> Self {
        Self {
            value: 0,
            script_pubkey: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value == 0 && self.script_pubkey.is_empty()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub version: i32,
    pub time: u32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    pub fn is_coinstake(&self) -> bool {
        !self.vin.is_empty()
            && !self.vin[0].prevout.is_null()
            && self.vout.len() >= 2
            && self.vout[0].is_empty()
    }

    pub fn has_witness(&self) -> bool {
        self.vin.iter().any(|input| !input.witness.is_empty())
    }

    pub fn txid(&self) -> Hash256 {
        sha256d(&self.encode(false))
    }

    pub fn wtxid(&self) -> Hash256 {
        sha256d(&self.encode(true))
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        self.encode(true)
    }

    pub fn encode(&self, with_witness: bool) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(self.base_size_hint());
        self.encode_into(&mut encoder, with_witness);
        encoder.into_inner()
    }

    pub fn encode_into(&self, encoder: &mut Encoder, with_witness: bool) {
        let with_witness = with_witness && self.has_witness();
        encoder.write_i32_le(self.version);
        encoder.write_u32_le(self.time);
        if with_witness {
            encoder.write_u8(SEGWIT_MARKER);
            encoder.write_u8(SEGWIT_FLAG);
        }
        encoder.write_var_int(self.vin.len() as u64);
        for input in &self.vin {
            input.prevout.consensus_encode(encoder);
            encoder.write_var_bytes(&input.script_sig);
            encoder.write_u32_le(input.sequence);
        }
        encoder.write_var_int(self.vout.len() as u64);
        for output in &self.vout {
            encoder.write_i64_le(output.value);
            encoder.write_var_bytes(&output.script_pubkey);
        }
        if with_witness {
            for input in &self.vin {
                encoder.write_var_int(input.witness.len() as u64);
                for item in &input.witness {
                    encoder.write_var_bytes(item);
                }
            }
        }
        encoder.write_u32_le(self.lock_time);
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::decode_from(&mut decoder)?;
        decoder.finish()?;
        Ok(tx)
    }

    pub fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let time = decoder.read_u32_le()?;

        let mut segwit = false;
        let mut vin_count = decoder.read_var_int()?;
        if vin_count == SEGWIT_MARKER as u64 {
            let flag = decoder.read_u8()?;
            if flag != SEGWIT_FLAG {
                return Err(DecodeError::NonCanonicalVarInt);
            }
            segwit = true;
            vin_count = decoder.read_var_int()?;
        }
        if vin_count > 1_000_000 {
            return Err(DecodeError::OversizedLength);
        }

        let mut vin = Vec::with_capacity(vin_count as usize);
        for _ in 0..vin_count {
            let prevout = OutPoint::consensus_decode(decoder)?;
            let script_sig = decoder.read_var_bytes()?;
            let sequence = decoder.read_u32_le()?;
            vin.push(TxIn {
                prevout,
                script_sig,
                sequence,
                witness: Vec::new(),
            });
        }

        let vout_count = decoder.read_var_int()?;
        if vout_count > 1_000_000 {
            return Err(DecodeError::OversizedLength);
        }
        let mut vout = Vec::with_capacity(vout_count as usize);
        for _ in 0..vout_count {
            let value = decoder.read_i64_le()?;
            let script_pubkey = decoder.read_var_bytes()?;
            vout.push(TxOut {
                value,
                script_pubkey,
            });
        }

        if segwit {
            for input in &mut vin {
                let item_count = decoder.read_var_int()?;
                if item_count > 100_000 {
                    return Err(DecodeError::OversizedLength);
                }
                let mut witness = Vec::with_capacity(item_count as usize);
                for _ in 0..item_count {
                    witness.push(decoder.read_var_bytes()?);
                }
                input.witness = witness;
            }
        }

        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            time,
            vin,
            vout,
            lock_time,
        })
    }

    pub fn base_size(&self) -> usize {
        self.encode(false).len()
    }

    pub fn total_size(&self) -> usize {
        self.encode(true).len()
    }

    /// Weight per BIP141: base size counts four times, witness bytes once.
    pub fn weight(&self) -> usize {
        self.base_size() * 3 + self.total_size()
    }

    pub fn vsize(&self) -> usize {
        (self.weight() + 3) / 4
    }

    fn base_size_hint(&self) -> usize {
        16 + self.vin.len() * 48 + self.vout.len() * 40
    }
}

#[cfg(test)]
mod tests {
    use super::{OutPoint, Transaction, TxIn, TxOut};

    fn sample_tx(witness: bool) -> Transaction {
        Transaction {
            version: 2,
            time: 1_700_000_000,
            vin: vec![TxIn {
                prevout: OutPoint {
                    hash: [0x22; 32],
                    index: 1,
                },
                script_sig: vec![0x51],
                sequence: TxIn::SEQUENCE_FINAL,
                witness: if witness {
                    vec![vec![0xaa; 72], vec![0x02; 33]]
                } else {
                    Vec::new()
                },
            }],
            vout: vec![TxOut {
                value: 5_000,
                script_pubkey: vec![0x76, 0xa9],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn decode_reverses_encode_with_and_without_witness() {
        for witness in [false, true] {
            let tx = sample_tx(witness);
            let bytes = tx.consensus_encode();
            let decoded = Transaction::consensus_decode(&bytes).expect("decode");
            assert_eq!(decoded, tx);
        }
    }

    #[test]
    fn txid_ignores_witness() {
        let stripped = sample_tx(false);
        let with_witness = sample_tx(true);
        assert_eq!(stripped.txid(), with_witness.txid());
        assert_ne!(with_witness.txid(), with_witness.wtxid());
        assert_eq!(stripped.txid(), stripped.wtxid());
    }

    #[test]
    fn coinbase_and_coinstake_shapes() {
        let mut coinbase = sample_tx(false);
        coinbase.vin[0].prevout = OutPoint::null();
        assert!(coinbase.is_coinbase());
        assert!(!coinbase.is_coinstake());

        let mut coinstake = sample_tx(false);
        coinstake.vout.insert(0, TxOut::empty());
        assert!(coinstake.is_coinstake());
        assert!(!coinstake.is_coinbase());
    }

    #[test]
    fn weight_counts_witness_once() {
        let tx = sample_tx(true);
        assert!(tx.weight() < tx.total_size() * 4);
        assert!(tx.weight() > tx.base_size() * 3);
        assert_eq!(sample_tx(false).weight(), sample_tx(false).base_size() * 4);
    }
}
