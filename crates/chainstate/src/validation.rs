//! Context-free and contextual block checks, and the verdict taxonomy the
//! chain controller surfaces.

use std::collections::HashSet;

use plbd_consensus::constants::{
    LOCKTIME_THRESHOLD, MAX_BLOCK_BASE_SIZE, MAX_BLOCK_SIGOPS_COST, MAX_BLOCK_WEIGHT,
    MAX_FUTURE_BLOCK_TIME, MIN_BLOCK_VERSION, OFFLINE_STAKING_VERSION_MASK, WITNESS_SCALE_FACTOR,
};
use plbd_consensus::money::{money_range, MAX_MONEY};
use plbd_consensus::ConsensusParams;
use plbd_pos::validation::check_proof_of_stake_structure;
use plbd_pow::validation as pow_validation;
use plbd_primitives::block::Block;
use plbd_primitives::hash::sha256d;
use plbd_primitives::{Transaction, TxIn};
use plbd_script::opcodes::OP_RETURN;
use plbd_script::standard::legacy_sigop_count;
use plbd_storage::StoreError;

use crate::coins::CoinViewError;
use crate::flatfiles::FlatFileError;

pub const REJECT_MALFORMED: u8 = 0x01;
pub const REJECT_INVALID: u8 = 0x10;
pub const REJECT_OBSOLETE: u8 = 0x11;
pub const REJECT_DUPLICATE: u8 = 0x12;
pub const REJECT_NONSTANDARD: u8 = 0x40;
pub const REJECT_INSUFFICIENT_FEE: u8 = 0x42;

/// A consensus violation: the submitting peer is at fault unless
/// `corruption_possible` says the failure may be local.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InvalidVerdict {
    pub code: u8,
    pub reason: String,
    pub corruption_possible: bool,
}

#[derive(Debug)]
pub enum ChainError {
    Invalid(InvalidVerdict),
    MissingInputs,
    MissingPrev,
    Duplicate,
    System(String),
}

impl ChainError {
    pub fn invalid(code: u8, reason: impl Into<String>) -> Self {
        ChainError::Invalid(InvalidVerdict {
            code,
            reason: reason.into(),
            corruption_possible: false,
        })
    }

    pub fn corruption(reason: impl Into<String>) -> Self {
        ChainError::Invalid(InvalidVerdict {
            code: REJECT_INVALID,
            reason: reason.into(),
            corruption_possible: true,
        })
    }

    pub fn reason(&self) -> &str {
        match self {
            ChainError::Invalid(verdict) => &verdict.reason,
            ChainError::MissingInputs => "missing-inputs",
            ChainError::MissingPrev => "prev-blk-not-found",
            ChainError::Duplicate => "duplicate",
            ChainError::System(message) => message,
        }
    }
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainError::Invalid(verdict) => write!(f, "invalid: {}", verdict.reason),
            ChainError::MissingInputs => write!(f, "missing inputs"),
            ChainError::MissingPrev => write!(f, "previous block not found"),
            ChainError::Duplicate => write!(f, "already known"),
            ChainError::System(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<StoreError> for ChainError {
    fn from(err: StoreError) -> Self {
        ChainError::System(err.to_string())
    }
}

impl From<FlatFileError> for ChainError {
    fn from(err: FlatFileError) -> Self {
        ChainError::System(err.to_string())
    }
}

impl From<CoinViewError> for ChainError {
    fn from(err: CoinViewError) -> Self {
        match err {
            CoinViewError::MissingInput => {
                ChainError::invalid(REJECT_INVALID, "bad-txns-inputs-missingorspent")
            }
            CoinViewError::Overwrite => {
                ChainError::invalid(REJECT_INVALID, "bad-txns-unexpected-coin")
            }
            CoinViewError::Store(message) => ChainError::System(message),
        }
    }
}

impl From<plbd_tokens::TokenError> for ChainError {
    fn from(err: plbd_tokens::TokenError) -> Self {
        match err {
            plbd_tokens::TokenError::Store(message) => ChainError::System(message),
            other => ChainError::invalid(REJECT_INVALID, other.to_string()),
        }
    }
}

/// Context-free transaction checks.
pub fn check_transaction(tx: &Transaction) -> Result<(), ChainError> {
    if tx.vin.is_empty() {
        return Err(ChainError::invalid(REJECT_INVALID, "bad-txns-vin-empty"));
    }
    if tx.vout.is_empty() {
        return Err(ChainError::invalid(REJECT_INVALID, "bad-txns-vout-empty"));
    }
    if tx.base_size() > MAX_BLOCK_BASE_SIZE {
        return Err(ChainError::invalid(REJECT_INVALID, "bad-txns-oversize"));
    }

    let mut total_out = 0i64;
    for output in &tx.vout {
        if output.value < 0 {
            return Err(ChainError::invalid(REJECT_INVALID, "bad-txns-vout-negative"));
        }
        if output.value > MAX_MONEY {
            return Err(ChainError::invalid(REJECT_INVALID, "bad-txns-vout-toolarge"));
        }
        total_out = total_out
            .checked_add(output.value)
            .ok_or_else(|| ChainError::invalid(REJECT_INVALID, "bad-txns-txouttotal-toolarge"))?;
        if !money_range(total_out) {
            return Err(ChainError::invalid(
                REJECT_INVALID,
                "bad-txns-txouttotal-toolarge",
            ));
        }
    }

    let mut seen = HashSet::with_capacity(tx.vin.len());
    for input in &tx.vin {
        if !seen.insert(input.prevout) {
            return Err(ChainError::invalid(
                REJECT_INVALID,
                "bad-txns-inputs-duplicate",
            ));
        }
    }

    if tx.is_coinbase() {
        let script_len = tx.vin[0].script_sig.len();
        if !(2..=100).contains(&script_len) {
            return Err(ChainError::invalid(REJECT_INVALID, "bad-cb-length"));
        }
    } else {
        for input in &tx.vin {
            if input.prevout.is_null() {
                return Err(ChainError::invalid(REJECT_INVALID, "bad-txns-prevout-null"));
            }
        }
    }
    Ok(())
}

/// Context-free block checks: proof sanity, structural shape, merkle
/// roots, witness commitment and per-transaction rules.
pub fn check_block(
    block: &Block,
    params: &ConsensusParams,
    check_pow: bool,
) -> Result<(), ChainError> {
    let proof_of_stake = block.is_proof_of_stake();
    pow_validation::check_target_bounds(&block.header, proof_of_stake, params)
        .map_err(|err| ChainError::invalid(REJECT_INVALID, err.to_string()))?;
    // Genesis carries no solution; header acceptance pins height zero to
    // the genesis hash.
    if !proof_of_stake && check_pow && block.header.height != 0 {
        pow_validation::check_proof_of_work(&block.header, params)
            .map_err(|_| ChainError::invalid(REJECT_INVALID, "high-hash"))?;
    }

    if block.transactions.is_empty() {
        return Err(ChainError::invalid(REJECT_INVALID, "bad-blk-length"));
    }
    if !block.transactions[0].is_coinbase() {
        return Err(ChainError::invalid(REJECT_INVALID, "bad-cb-missing"));
    }
    for tx in block.transactions.iter().skip(1) {
        if tx.is_coinbase() {
            return Err(ChainError::invalid(REJECT_INVALID, "bad-cb-multiple"));
        }
    }

    if proof_of_stake {
        check_proof_of_stake_structure(block)
            .map_err(|err| ChainError::invalid(REJECT_INVALID, err.to_string()))?;
    } else {
        if block.transactions.iter().any(|tx| tx.is_coinstake()) {
            return Err(ChainError::invalid(REJECT_INVALID, "coinstake"));
        }
        if !block.signature.is_empty() {
            return Err(ChainError::invalid(REJECT_INVALID, "bad-blk-signature"));
        }
    }

    if block.merkle_root() != block.header.merkle_root {
        return Err(ChainError::Invalid(InvalidVerdict {
            code: REJECT_INVALID,
            reason: "bad-txnmrklroot".to_string(),
            corruption_possible: true,
        }));
    }

    let mut txids = HashSet::with_capacity(block.transactions.len());
    for tx in &block.transactions {
        if !txids.insert(tx.txid()) {
            return Err(ChainError::Invalid(InvalidVerdict {
                code: REJECT_INVALID,
                reason: "bad-txns-duplicate".to_string(),
                corruption_possible: true,
            }));
        }
    }

    let weight: usize = block.transactions.iter().map(|tx| tx.weight()).sum();
    if weight > MAX_BLOCK_WEIGHT {
        return Err(ChainError::invalid(REJECT_INVALID, "bad-blk-length"));
    }

    let mut sigops = 0u32;
    for tx in &block.transactions {
        for input in &tx.vin {
            sigops += legacy_sigop_count(&input.script_sig, false);
        }
        for output in &tx.vout {
            sigops += legacy_sigop_count(&output.script_pubkey, false);
        }
        check_transaction(tx)?;
    }
    if sigops * WITNESS_SCALE_FACTOR as u32 > MAX_BLOCK_SIGOPS_COST {
        return Err(ChainError::invalid(REJECT_INVALID, "bad-blk-sigops"));
    }

    check_witness_commitment(block)?;
    Ok(())
}

const WITNESS_COMMITMENT_HEADER: [u8; 4] = [0xaa, 0x21, 0xa9, 0xed];

/// Locate the witness commitment output in the coinbase: the last output
/// whose script starts `OP_RETURN 0x24 aa21a9ed`.
fn witness_commitment_output(coinbase: &Transaction) -> Option<usize> {
    coinbase.vout.iter().rposition(|out| {
        out.script_pubkey.len() >= 38
            && out.script_pubkey[0] == OP_RETURN
            && out.script_pubkey[1] == 0x24
            && out.script_pubkey[2..6] == WITNESS_COMMITMENT_HEADER
    })
}

fn check_witness_commitment(block: &Block) -> Result<(), ChainError> {
    let coinbase = &block.transactions[0];
    let commitment_pos = witness_commitment_output(coinbase);

    let any_witness = block
        .transactions
        .iter()
        .skip(1)
        .any(|tx| tx.has_witness());
    let Some(position) = commitment_pos else {
        if any_witness {
            return Err(ChainError::invalid(REJECT_INVALID, "unexpected-witness"));
        }
        return Ok(());
    };

    let witness = &coinbase.vin[0].witness;
    if witness.len() != 1 || witness[0].len() != 32 {
        return Err(ChainError::invalid(
            REJECT_INVALID,
            "bad-witness-nonce-size",
        ));
    }
    let witness_root = block.witness_merkle_root();
    let mut preimage = Vec::with_capacity(64);
    preimage.extend_from_slice(&witness_root);
    preimage.extend_from_slice(&witness[0]);
    let commitment = sha256d(&preimage);
    if coinbase.vout[position].script_pubkey[6..38] != commitment {
        return Err(ChainError::invalid(
            REJECT_INVALID,
            "bad-witness-merkle-match",
        ));
    }
    Ok(())
}

/// Build the witness commitment script for a block's coinbase.
pub fn make_witness_commitment(block: &Block, nonce: &[u8; 32]) -> Vec<u8> {
    let witness_root = block.witness_merkle_root();
    let mut preimage = Vec::with_capacity(64);
    preimage.extend_from_slice(&witness_root);
    preimage.extend_from_slice(nonce);
    let commitment = sha256d(&preimage);
    let mut script = Vec::with_capacity(38);
    script.push(OP_RETURN);
    script.push(0x24);
    script.extend_from_slice(&WITNESS_COMMITMENT_HEADER);
    script.extend_from_slice(&commitment);
    script
}

/// Lock-time finality under BIP113 semantics: the cutoff is the past
/// median time, not the block time.
pub fn is_final_tx(tx: &Transaction, height: i32, cutoff_time: i64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let threshold = if tx.lock_time < LOCKTIME_THRESHOLD {
        height as i64
    } else {
        cutoff_time
    };
    if (tx.lock_time as i64) < threshold {
        return true;
    }
    tx.vin
        .iter()
        .all(|input| input.sequence == TxIn::SEQUENCE_FINAL)
}

/// The minimal push of `height` that must prefix the coinbase signature
/// script.
pub fn serialize_height(height: i32) -> Vec<u8> {
    if height == 0 {
        return vec![0x00];
    }
    if (1..=16).contains(&height) {
        return vec![0x50 + height as u8];
    }
    let mut payload = Vec::new();
    let mut value = height as i64;
    while value > 0 {
        payload.push((value & 0xff) as u8);
        value >>= 8;
    }
    if payload.last().map(|last| last & 0x80 != 0).unwrap_or(false) {
        payload.push(0);
    }
    let mut script = Vec::with_capacity(payload.len() + 1);
    script.push(payload.len() as u8);
    script.extend_from_slice(&payload);
    script
}

/// Contextual checks against the predecessor.
pub fn contextual_check_block(
    block: &Block,
    height: i32,
    median_time_past: i64,
    now: i64,
    params: &ConsensusParams,
) -> Result<(), ChainError> {
    let time = block.header.time as i64;
    if time <= median_time_past {
        return Err(ChainError::invalid(REJECT_INVALID, "time-too-old"));
    }
    if time > now + MAX_FUTURE_BLOCK_TIME {
        return Err(ChainError::invalid(REJECT_INVALID, "time-too-new"));
    }
    if block.header.height != height as u32 {
        return Err(ChainError::invalid(REJECT_INVALID, "bad-header-height"));
    }

    if block.header.version < MIN_BLOCK_VERSION {
        return Err(ChainError::invalid(
            REJECT_OBSOLETE,
            format!("bad-version(0x{:08x})", block.header.version),
        ));
    }
    if height >= params.offline_staking_height
        && block.header.version & OFFLINE_STAKING_VERSION_MASK == 0
    {
        return Err(ChainError::invalid(
            REJECT_OBSOLETE,
            format!("bad-version(0x{:08x})", block.header.version),
        ));
    }

    if block.is_proof_of_stake() && height < params.pos_height {
        return Err(ChainError::invalid(REJECT_INVALID, "pos-too-early"));
    }

    if height > 0 {
        let coinbase_script = &block.transactions[0].vin[0].script_sig;
        let expected = serialize_height(height);
        if coinbase_script.len() < expected.len() || coinbase_script[..expected.len()] != expected {
            return Err(ChainError::invalid(REJECT_INVALID, "bad-cb-height"));
        }
    }

    for tx in &block.transactions {
        if !is_final_tx(tx, height, median_time_past) {
            return Err(ChainError::invalid(REJECT_INVALID, "bad-txns-nonfinal"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        check_block, check_transaction, contextual_check_block, is_final_tx, serialize_height,
        ChainError,
    };
    use plbd_consensus::{chain_params, Network};
    use plbd_primitives::block::{Block, BlockHeader};
    use plbd_primitives::{compute_merkle_root, OutPoint, Transaction, TxIn, TxOut};

    fn coinbase(height: i32) -> Transaction {
        let mut script_sig = serialize_height(height);
        script_sig.push(0x00);
        Transaction {
            version: 2,
            time: 1_700_000_000,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig,
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

    fn block_at(height: i32) -> Block {
        let coinbase = coinbase(height);
        let merkle_root = compute_merkle_root(&[coinbase.txid()]);
        Block {
            header: BlockHeader {
                version: 4 | plbd_consensus::constants::OFFLINE_STAKING_VERSION_MASK,
                prev_block: [1u8; 32],
                merkle_root,
                time: 1_700_000_000,
                bits: 0x207f_ffff,
                height: height as u32,
                nonce64: 0,
                mix_hash: [0u8; 32],
            },
            transactions: vec![coinbase],
            signature: Vec::new(),
        }
    }

    #[test]
    fn structural_tx_rules() {
        let mut tx = coinbase(5);
        check_transaction(&tx).expect("coinbase ok");
        tx.vin[0].script_sig = vec![0x00];
        assert!(matches!(
            check_transaction(&tx),
            Err(ChainError::Invalid(verdict)) if verdict.reason == "bad-cb-length"
        ));

        let mut spend = coinbase(5);
        spend.vin[0].prevout = OutPoint {
            hash: [2u8; 32],
            index: 0,
        };
        spend.vin.push(spend.vin[0].clone());
        assert!(matches!(
            check_transaction(&spend),
            Err(ChainError::Invalid(verdict)) if verdict.reason == "bad-txns-inputs-duplicate"
        ));
    }

    #[test]
    fn merkle_mismatch_flags_possible_corruption() {
        let params = chain_params(Network::Regtest).consensus;
        let mut block = block_at(5);
        block.header.merkle_root = [0xee; 32];
        match check_block(&block, &params, false) {
            Err(ChainError::Invalid(verdict)) => {
                assert_eq!(verdict.reason, "bad-txnmrklroot");
                assert!(verdict.corruption_possible);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn contextual_enforces_coinbase_height() {
        let params = chain_params(Network::Regtest).consensus;
        let block = block_at(5);
        contextual_check_block(&block, 5, 1_600_000_000, 1_700_000_100, &params)
            .expect("height 5 ok");
        assert!(matches!(
            contextual_check_block(&block, 6, 1_600_000_000, 1_700_000_100, &params),
            Err(ChainError::Invalid(verdict)) if verdict.reason == "bad-header-height"
        ));
    }

    #[test]
    fn finality_uses_median_time() {
        let mut tx = coinbase(5);
        tx.vin[0].sequence = 0;
        tx.lock_time = 1_650_000_000;
        assert!(is_final_tx(&tx, 100, 1_650_000_001));
        assert!(!is_final_tx(&tx, 100, 1_650_000_000));
        tx.lock_time = 90;
        assert!(!is_final_tx(&tx, 90, 0));
        assert!(is_final_tx(&tx, 91, 0));
    }

    #[test]
    fn height_serialization_matches_minimal_push() {
        assert_eq!(serialize_height(1), vec![0x51]);
        assert_eq!(serialize_height(16), vec![0x60]);
        assert_eq!(serialize_height(17), vec![0x01, 17]);
        assert_eq!(serialize_height(128), vec![0x02, 0x80, 0x00]);
        assert_eq!(serialize_height(1_000), vec![0x02, 0xe8, 0x03]);
    }
}
