//! Block header and block types.
//!
//! The header carries the KAWPOW fields (height, 64-bit nonce, mix hash).
//! Proof-of-stake blocks additionally carry a block-level signature over the
//! header hash, appended after the transaction list.

use plbd_consensus::Hash256;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;
use crate::transaction::Transaction;

pub const CURRENT_BLOCK_VERSION: i32 = 4;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub height: u32,
    pub nonce64: u64,
    pub mix_hash: Hash256,
}

impl BlockHeader {
    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(120);
        self.encode_into(&mut encoder);
        encoder.into_inner()
    }

    pub fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_bytes(&self.prev_block);
        encoder.write_bytes(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.height);
        encoder.write_u64_le(self.nonce64);
        encoder.write_bytes(&self.mix_hash);
    }

    pub fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_fixed::<32>()?,
            merkle_root: decoder.read_fixed::<32>()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            height: decoder.read_u32_le()?,
            nonce64: decoder.read_u64_le()?,
            mix_hash: decoder.read_fixed::<32>()?,
        })
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = Self::decode_from(&mut decoder)?;
        decoder.finish()?;
        Ok(header)
    }

    /// The index hash identifying this header everywhere.
    pub fn hash(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    /// Signature by the kernel output's key; empty on proof-of-work blocks.
    pub signature: Vec<u8>,
}

impl Block {
    pub fn is_proof_of_stake(&self) -> bool {
        self.transactions.len() > 1 && self.transactions[1].is_coinstake()
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(256);
        self.header.encode_into(&mut encoder);
        encoder.write_var_int(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode_into(&mut encoder, true);
        }
        encoder.write_var_bytes(&self.signature);
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::decode_from(&mut decoder)?;
        let tx_count = decoder.read_var_int()?;
        if tx_count > 1_000_000 {
            return Err(DecodeError::OversizedLength);
        }
        let mut transactions = Vec::with_capacity(tx_count as usize);
        for _ in 0..tx_count {
            transactions.push(Transaction::decode_from(&mut decoder)?);
        }
        let signature = decoder.read_var_bytes()?;
        decoder.finish()?;
        Ok(Self {
            header,
            transactions,
            signature,
        })
    }

    pub fn merkle_root(&self) -> Hash256 {
        let txids: Vec<Hash256> = self.transactions.iter().map(|tx| tx.txid()).collect();
        compute_merkle_root(&txids)
    }

    /// Witness merkle root per BIP141; the coinbase wtxid is zeroed.
    pub fn witness_merkle_root(&self) -> Hash256 {
        let mut wtxids: Vec<Hash256> = self.transactions.iter().map(|tx| tx.wtxid()).collect();
        if let Some(first) = wtxids.first_mut() {
            *first = [0u8; 32];
        }
        compute_merkle_root(&wtxids)
    }
}

pub fn compute_merkle_root(txids: &[Hash256]) -> Hash256 {
    if txids.is_empty() {
        return [0u8; 32];
    }
    let mut layer = txids.to_vec();
    while layer.len() > 1 {
        if layer.len() % 2 == 1 {
            let last = *layer.last().expect("non-empty");
            layer.push(last);
        }
        let mut next = Vec::with_capacity((layer.len() + 1) / 2);
        for pair in layer.chunks(2) {
            next.push(merkle_hash_pair(&pair[0], &pair[1]));
        }
        layer = next;
    }
    layer[0]
}

fn merkle_hash_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut buf = [0u8; 64];
    buf[0..32].copy_from_slice(left);
    buf[32..64].copy_from_slice(right);
    sha256d(&buf)
}

#[cfg(test)]
mod tests {
    use super::{compute_merkle_root, Block, BlockHeader};
    use crate::outpoint::OutPoint;
    use crate::transaction::{Transaction, TxIn, TxOut};

    fn coinbase(height: u32) -> Transaction {
        Transaction {
            version: 2,
            time: 1_700_000_000,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: height.to_le_bytes().to_vec(),
                sequence: TxIn::SEQUENCE_FINAL,
                witness: Vec::new(),
            }],
            vout: vec![TxOut {
                value: 10,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    fn sample_block() -> Block {
        let coinbase = coinbase(5);
        let merkle_root = compute_merkle_root(&[coinbase.txid()]);
        Block {
            header: BlockHeader {
                version: 4,
                prev_block: [0x01; 32],
                merkle_root,
                time: 1_700_000_100,
                bits: 0x207f_ffff,
                height: 5,
                nonce64: 42,
                mix_hash: [0u8; 32],
            },
            transactions: vec![coinbase],
            signature: Vec::new(),
        }
    }

    #[test]
    fn block_roundtrip() {
        let block = sample_block();
        let bytes = block.consensus_encode();
        let decoded = Block::consensus_decode(&bytes).expect("decode");
        assert_eq!(decoded, block);
        assert_eq!(decoded.header.hash(), block.header.hash());
    }

    #[test]
    fn merkle_root_single_tx_is_txid() {
        let block = sample_block();
        assert_eq!(block.merkle_root(), block.transactions[0].txid());
        assert_eq!(block.merkle_root(), block.header.merkle_root);
    }

    #[test]
    fn merkle_duplicates_odd_layer() {
        let a = [0x0a; 32];
        let b = [0x0b; 32];
        let c = [0x0c; 32];
        // Odd layers hash the last entry against itself.
        let abc = compute_merkle_root(&[a, b, c]);
        let abcc = compute_merkle_root(&[a, b, c, c]);
        assert_eq!(abc, abcc);
    }
}
