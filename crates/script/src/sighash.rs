//! Transaction signature hashes, legacy and segwit v0.

use plbd_consensus::Hash256;
use plbd_primitives::encoding::Encoder;
use plbd_primitives::hash::sha256d;
use plbd_primitives::Transaction;

pub const SIGHASH_ALL: u32 = 1;
pub const SIGHASH_NONE: u32 = 2;
pub const SIGHASH_SINGLE: u32 = 3;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

const ONE_HASH: Hash256 = {
    let mut one = [0u8; 32];
    one[0] = 1;
    one
};

/// Legacy signature hash. The executing input's script is replaced by
/// `script_code`, every other input script is cleared.
pub fn legacy_sighash(
    tx: &Transaction,
    input_index: usize,
    script_code: &[u8],
    hash_type: u32,
) -> Hash256 {
    if input_index >= tx.vin.len() {
        return ONE_HASH;
    }
    let anyone_can_pay = hash_type & SIGHASH_ANYONECANPAY != 0;
    let base_type = hash_type & 0x1f;

    if base_type == SIGHASH_SINGLE && input_index >= tx.vout.len() {
        return ONE_HASH;
    }

    let mut encoder = Encoder::with_capacity(tx.base_size() + 64);
    encoder.write_i32_le(tx.version);
    encoder.write_u32_le(tx.time);

    if anyone_can_pay {
        encoder.write_var_int(1);
        serialize_input(&mut encoder, tx, input_index, script_code, base_type);
    } else {
        encoder.write_var_int(tx.vin.len() as u64);
        for index in 0..tx.vin.len() {
            if index == input_index {
                serialize_input(&mut encoder, tx, index, script_code, base_type);
            } else {
                serialize_input(&mut encoder, tx, index, &[], base_type);
            }
        }
    }

    match base_type {
        SIGHASH_NONE => encoder.write_var_int(0),
        SIGHASH_SINGLE => {
            encoder.write_var_int(input_index as u64 + 1);
            for output in tx.vout.iter().take(input_index) {
                let _ = output;
                encoder.write_i64_le(-1);
                encoder.write_var_int(0);
            }
            let output = &tx.vout[input_index];
            encoder.write_i64_le(output.value);
            encoder.write_var_bytes(&output.script_pubkey);
        }
        _ => {
            encoder.write_var_int(tx.vout.len() as u64);
            for output in &tx.vout {
                encoder.write_i64_le(output.value);
                encoder.write_var_bytes(&output.script_pubkey);
            }
        }
    }

    encoder.write_u32_le(tx.lock_time);
    encoder.write_u32_le(hash_type);
    sha256d(&encoder.into_inner())
}

fn serialize_input(
    encoder: &mut Encoder,
    tx: &Transaction,
    index: usize,
    script: &[u8],
    base_type: u32,
) {
    let input = &tx.vin[index];
    encoder.write_bytes(&input.prevout.hash);
    encoder.write_u32_le(input.prevout.index);
    encoder.write_var_bytes(script);
    let executing = !script.is_empty();
    if !executing && (base_type == SIGHASH_NONE || base_type == SIGHASH_SINGLE) {
        encoder.write_u32_le(0);
    } else {
        encoder.write_u32_le(input.sequence);
    }
}

/// Midstate hashes shared by every input of a transaction under segwit
/// signing; computed once and reused by the check workers.
#[derive(Clone, Debug)]
pub struct PrecomputedTxData {
    pub hash_prevouts: Hash256,
    pub hash_sequence: Hash256,
    pub hash_outputs: Hash256,
}

impl PrecomputedTxData {
    pub fn new(tx: &Transaction) -> Self {
        let mut prevouts = Encoder::with_capacity(tx.vin.len() * 36);
        let mut sequences = Encoder::with_capacity(tx.vin.len() * 4);
        for input in &tx.vin {
            prevouts.write_bytes(&input.prevout.hash);
            prevouts.write_u32_le(input.prevout.index);
            sequences.write_u32_le(input.sequence);
        }
        let mut outputs = Encoder::new();
        for output in &tx.vout {
            outputs.write_i64_le(output.value);
            outputs.write_var_bytes(&output.script_pubkey);
        }
        Self {
            hash_prevouts: sha256d(&prevouts.into_inner()),
            hash_sequence: sha256d(&sequences.into_inner()),
            hash_outputs: sha256d(&outputs.into_inner()),
        }
    }
}

/// Segwit v0 signature hash (BIP143 layout, with the transaction timestamp
/// serialized after the version).
pub fn segwit_sighash(
    tx: &Transaction,
    txdata: &PrecomputedTxData,
    input_index: usize,
    script_code: &[u8],
    amount: i64,
    hash_type: u32,
) -> Hash256 {
    let anyone_can_pay = hash_type & SIGHASH_ANYONECANPAY != 0;
    let base_type = hash_type & 0x1f;
    let zero = [0u8; 32];

    let hash_prevouts = if anyone_can_pay {
        &zero
    } else {
        &txdata.hash_prevouts
    };
    let hash_sequence = if anyone_can_pay || base_type == SIGHASH_NONE || base_type == SIGHASH_SINGLE
    {
        &zero
    } else {
        &txdata.hash_sequence
    };

    let single_output;
    let hash_outputs = match base_type {
        SIGHASH_NONE => &zero,
        SIGHASH_SINGLE => {
            if input_index < tx.vout.len() {
                let mut encoder = Encoder::new();
                let output = &tx.vout[input_index];
                encoder.write_i64_le(output.value);
                encoder.write_var_bytes(&output.script_pubkey);
                single_output = sha256d(&encoder.into_inner());
                &single_output
            } else {
                &zero
            }
        }
        _ => &txdata.hash_outputs,
    };

    let input = &tx.vin[input_index];
    let mut encoder = Encoder::with_capacity(200 + script_code.len());
    encoder.write_i32_le(tx.version);
    encoder.write_u32_le(tx.time);
    encoder.write_bytes(hash_prevouts);
    encoder.write_bytes(hash_sequence);
    encoder.write_bytes(&input.prevout.hash);
    encoder.write_u32_le(input.prevout.index);
    encoder.write_var_bytes(script_code);
    encoder.write_i64_le(amount);
    encoder.write_u32_le(input.sequence);
    encoder.write_bytes(hash_outputs);
    encoder.write_u32_le(tx.lock_time);
    encoder.write_u32_le(hash_type);
    sha256d(&encoder.into_inner())
}

#[cfg(test)]
mod tests {
    use super::{legacy_sighash, segwit_sighash, PrecomputedTxData, SIGHASH_ALL, SIGHASH_SINGLE};
    use plbd_primitives::{OutPoint, Transaction, TxIn, TxOut};

    fn two_in_two_out() -> Transaction {
        Transaction {
            version: 2,
            time: 1_700_000_000,
            vin: (0..2)
                .map(|index| TxIn {
                    prevout: OutPoint {
                        hash: [index as u8 + 1; 32],
                        index: index as u32,
                    },
                    script_sig: Vec::new(),
                    sequence: TxIn::SEQUENCE_FINAL,
                    witness: Vec::new(),
                })
                .collect(),
            vout: (0..2)
                .map(|index| TxOut {
                    value: 1_000 * (index + 1),
                    script_pubkey: vec![0x51],
                })
                .collect(),
            lock_time: 0,
        }
    }

    #[test]
    fn sighash_differs_per_input() {
        let tx = two_in_two_out();
        let script = vec![0x76, 0xa9];
        let a = legacy_sighash(&tx, 0, &script, SIGHASH_ALL);
        let b = legacy_sighash(&tx, 1, &script, SIGHASH_ALL);
        assert_ne!(a, b);
    }

    #[test]
    fn single_out_of_range_returns_one() {
        let mut tx = two_in_two_out();
        tx.vout.truncate(1);
        let hash = legacy_sighash(&tx, 1, &[0x51], SIGHASH_SINGLE);
        let mut one = [0u8; 32];
        one[0] = 1;
        assert_eq!(hash, one);
    }

    #[test]
    fn segwit_sighash_commits_to_amount() {
        let tx = two_in_two_out();
        let txdata = PrecomputedTxData::new(&tx);
        let a = segwit_sighash(&tx, &txdata, 0, &[0x51], 500, SIGHASH_ALL);
        let b = segwit_sighash(&tx, &txdata, 0, &[0x51], 501, SIGHASH_ALL);
        assert_ne!(a, b);
    }
}
