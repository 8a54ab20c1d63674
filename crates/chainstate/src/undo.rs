//! Per-block undo records.
//!
//! Every connect writes one undo record: the spent coin for each
//! non-coinbase input in order, the token reversal side-table and the
//! governance reversals. Disconnect replays them in reverse.

use plbd_consensus::Hash256;
use plbd_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use plbd_primitives::hash::sha256d;
use plbd_primitives::{Coin, OutPoint};
use plbd_tokens::TokenUndoOp;

use crate::governance::GovernanceUndoOp;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxUndo {
    pub spent: Vec<(OutPoint, Coin)>,
}

#[derive(Clone, Debug, Default)]
pub struct BlockUndo {
    /// One entry per transaction after the coinbase.
    pub tx_undos: Vec<TxUndo>,
    pub token_ops: Vec<TokenUndoOp>,
    pub governance_ops: Vec<GovernanceUndoOp>,
}

impl BlockUndo {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_var_int(self.tx_undos.len() as u64);
        for tx_undo in &self.tx_undos {
            encoder.write_var_int(tx_undo.spent.len() as u64);
            for (outpoint, coin) in &tx_undo.spent {
                outpoint.consensus_encode(&mut encoder);
                encoder.write_var_bytes(&coin.encode());
            }
        }
        encoder.write_var_int(self.token_ops.len() as u64);
        for op in &self.token_ops {
            op.encode_into(&mut encoder);
        }
        encoder.write_var_int(self.governance_ops.len() as u64);
        for op in &self.governance_ops {
            op.encode_into(&mut encoder);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx_count = decoder.read_var_int()?;
        if tx_count > 1_000_000 {
            return Err(DecodeError::OversizedLength);
        }
        let mut tx_undos = Vec::with_capacity(tx_count as usize);
        for _ in 0..tx_count {
            let input_count = decoder.read_var_int()?;
            if input_count > 1_000_000 {
                return Err(DecodeError::OversizedLength);
            }
            let mut spent = Vec::with_capacity(input_count as usize);
            for _ in 0..input_count {
                let outpoint = OutPoint::consensus_decode(&mut decoder)?;
                let coin_bytes = decoder.read_var_bytes()?;
                let coin = Coin::decode(&coin_bytes)?;
                spent.push((outpoint, coin));
            }
            tx_undos.push(TxUndo { spent });
        }
        let token_count = decoder.read_var_int()?;
        if token_count > 1_000_000 {
            return Err(DecodeError::OversizedLength);
        }
        let mut token_ops = Vec::with_capacity(token_count as usize);
        for _ in 0..token_count {
            token_ops.push(
                TokenUndoOp::decode_from(&mut decoder)
                    .map_err(|_| DecodeError::TrailingBytes)?,
            );
        }
        let governance_count = decoder.read_var_int()?;
        if governance_count > 1_000_000 {
            return Err(DecodeError::OversizedLength);
        }
        let mut governance_ops = Vec::with_capacity(governance_count as usize);
        for _ in 0..governance_count {
            governance_ops.push(GovernanceUndoOp::decode_from(&mut decoder)?);
        }
        decoder.finish()?;
        Ok(Self {
            tx_undos,
            token_ops,
            governance_ops,
        })
    }
}

/// Undo frames carry `sha256d(prev_hash ‖ undo_bytes)` as their trailer.
pub fn undo_checksum(prev_hash: &Hash256, undo_bytes: &[u8]) -> Hash256 {
    let mut buf = Vec::with_capacity(32 + undo_bytes.len());
    buf.extend_from_slice(prev_hash);
    buf.extend_from_slice(undo_bytes);
    sha256d(&buf)
}

#[cfg(test)]
mod tests {
    use super::{undo_checksum, BlockUndo, TxUndo};
    use plbd_primitives::{Coin, OutPoint};
    use plbd_tokens::TokenUndoOp;

    #[test]
    fn undo_roundtrip() {
        let undo = BlockUndo {
            tx_undos: vec![TxUndo {
                spent: vec![(
                    OutPoint {
                        hash: [1u8; 32],
                        index: 3,
                    },
                    Coin {
                        value: 777,
                        script_pubkey: vec![0x51, 0x52],
                        height: 42,
                        is_coinbase: true,
                        is_coinstake: false,
                        time: 1_700_000_000,
                    },
                )],
            }],
            token_ops: vec![TokenUndoOp::Credit {
                name: "PLBGOLD".to_string(),
                owner: [2u8; 32],
                amount: 10,
            }],
            governance_ops: Vec::new(),
        };
        let bytes = undo.encode();
        let decoded = BlockUndo::decode(&bytes).expect("decode");
        assert_eq!(decoded.tx_undos, undo.tx_undos);
        assert_eq!(decoded.token_ops, undo.token_ops);
    }

    #[test]
    fn checksum_binds_predecessor() {
        let bytes = b"undo-payload";
        let a = undo_checksum(&[1u8; 32], bytes);
        let b = undo_checksum(&[2u8; 32], bytes);
        assert_ne!(a, b);
    }
}
