//! Coinstake and proof-of-stake block validation.

use std::sync::OnceLock;

use plbd_consensus::constants::COINBASE_MATURITY;
use plbd_consensus::money::Amount;
use plbd_consensus::ConsensusParams;
use plbd_primitives::hash::hash160;
use plbd_primitives::{Block, Coin, Transaction};
use plbd_script::standard::is_offline_staking;
use secp256k1::{ecdsa, Message, PublicKey, Secp256k1, VerifyOnly};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PosError {
    InvalidTarget,
    KernelTooHigh,
    ImmatureStake,
    StakeTooYoung,
    TimestampMismatch,
    CoinbaseNotEmpty,
    CoinstakeMissing,
    ExtraCoinstake,
    MissingSignature,
    UnexpectedSignature,
    BadSignature,
    OfflineStakeEscape,
    OfflineStakeGreed,
}

impl std::fmt::Display for PosError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            PosError::InvalidTarget => "invalid stake target",
            PosError::KernelTooHigh => "kernel hash above weighted target",
            PosError::ImmatureStake => "stake input not matured",
            PosError::StakeTooYoung => "stake input below minimum age",
            PosError::TimestampMismatch => "coinstake timestamp differs from block",
            PosError::CoinbaseNotEmpty => "proof-of-stake coinbase pays value",
            PosError::CoinstakeMissing => "second transaction is not coinstake",
            PosError::ExtraCoinstake => "more than one coinstake",
            PosError::MissingSignature => "proof-of-stake block lacks signature",
            PosError::UnexpectedSignature => "proof-of-work block carries signature",
            PosError::BadSignature => "block signature verification failed",
            PosError::OfflineStakeEscape => {
                "coinstake moved offline-staked coins to an unauthorised script"
            }
            PosError::OfflineStakeGreed => {
                "offline staker claimed more than ten percent of the reward"
            }
        };
        write!(f, "{text}")
    }
}

impl std::error::Error for PosError {}

fn secp() -> &'static Secp256k1<VerifyOnly> {
    static SECP: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();
    SECP.get_or_init(Secp256k1::verification_only)
}

/// Structural rules for the transaction list of a proof-of-stake block:
/// the coinbase pays nothing, the second transaction is the coinstake and
/// no other transaction may be one, and the coinstake carries the block
/// timestamp.
pub fn check_proof_of_stake_structure(block: &Block) -> Result<(), PosError> {
    let coinstake = block
        .transactions
        .get(1)
        .filter(|tx| tx.is_coinstake())
        .ok_or(PosError::CoinstakeMissing)?;
    for tx in block.transactions.iter().skip(2) {
        if tx.is_coinstake() {
            return Err(PosError::ExtraCoinstake);
        }
    }
    if coinstake.time != block.header.time {
        return Err(PosError::TimestampMismatch);
    }
    let coinbase = &block.transactions[0];
    if coinbase.vout.iter().any(|out| out.value != 0) {
        return Err(PosError::CoinbaseNotEmpty);
    }
    Ok(())
}

/// Stake inputs must reach coinbase maturity in depth and the configured
/// minimum age in time.
pub fn check_stake_maturity(
    kernel_coin: &Coin,
    spend_height: i32,
    block_time: u32,
    params: &ConsensusParams,
) -> Result<(), PosError> {
    let depth = spend_height as i64 - kernel_coin.height as i64;
    if depth < COINBASE_MATURITY as i64 {
        return Err(PosError::ImmatureStake);
    }
    if (block_time as i64) < kernel_coin.time as i64 + params.stake_min_age {
        return Err(PosError::StakeTooYoung);
    }
    Ok(())
}

/// Offline-staking split: when the kernel coin sits on an offline-staking
/// script, at least ninety percent of the reward must return to that same
/// script; everything else is the operator's cut.
pub fn check_offline_stake_split(
    coinstake: &Transaction,
    kernel_coin: &Coin,
    value_in: Amount,
) -> Result<(), PosError> {
    if is_offline_staking(&kernel_coin.script_pubkey).is_none() {
        return Ok(());
    }
    let total_out: Amount = coinstake.vout.iter().map(|out| out.value).sum();
    let reward = total_out.saturating_sub(value_in);
    if reward <= 0 {
        return Ok(());
    }

    let staker_script = kernel_coin.script_pubkey.as_slice();
    let mut returned: Amount = 0;
    let mut operator: Amount = 0;
    for out in coinstake.vout.iter().skip(1) {
        if out.script_pubkey == staker_script {
            returned += out.value;
        } else {
            operator += out.value;
        }
    }
    if returned < value_in {
        return Err(PosError::OfflineStakeEscape);
    }
    if operator > reward / 10 {
        return Err(PosError::OfflineStakeGreed);
    }
    Ok(())
}

/// Proof-of-stake blocks are signed by the staking key; the key is taken
/// from the coinstake input's signature script (its last push) and must
/// hash to the kernel script's key hash.
pub fn check_block_signature(block: &Block, kernel_coin: &Coin) -> Result<(), PosError> {
    if !block.is_proof_of_stake() {
        if block.signature.is_empty() {
            return Ok(());
        }
        return Err(PosError::UnexpectedSignature);
    }
    if block.signature.is_empty() {
        return Err(PosError::MissingSignature);
    }

    let coinstake = &block.transactions[1];
    let pubkey_bytes =
        last_push(&coinstake.vin[0].script_sig).ok_or(PosError::BadSignature)?;
    let Ok(pubkey) = PublicKey::from_slice(pubkey_bytes) else {
        return Err(PosError::BadSignature);
    };

    let authorised = match plbd_script::classify(&kernel_coin.script_pubkey) {
        plbd_script::ScriptClass::PayToPubkey(key) => key == pubkey_bytes,
        plbd_script::ScriptClass::PayToPubkeyHash(hash) => hash == hash160(pubkey_bytes),
        plbd_script::ScriptClass::OfflineStaking { staker, .. } => {
            staker == hash160(pubkey_bytes)
        }
        _ => false,
    };
    if !authorised {
        return Err(PosError::BadSignature);
    }

    let Ok(signature) = ecdsa::Signature::from_der_lax(&block.signature) else {
        return Err(PosError::BadSignature);
    };
    let message = Message::from_digest(block.header.hash());
    secp()
        .verify_ecdsa(&message, &signature, &pubkey)
        .map_err(|_| PosError::BadSignature)
}

fn last_push(script: &[u8]) -> Option<&[u8]> {
    let mut pc = 0usize;
    let mut last = None;
    while pc < script.len() {
        match script[pc] {
            len @ 0x01..=0x4b => {
                let data = script.get(pc + 1..pc + 1 + len as usize)?;
                last = Some(data);
                pc += 1 + len as usize;
            }
            0x4c => {
                let len = *script.get(pc + 1)? as usize;
                let data = script.get(pc + 2..pc + 2 + len)?;
                last = Some(data);
                pc += 2 + len;
            }
            _ => pc += 1,
        }
    }
    last
}

#[cfg(test)]
mod tests {
    use super::{
        check_offline_stake_split, check_proof_of_stake_structure, check_stake_maturity, PosError,
    };
    use plbd_consensus::money::COIN;
    use plbd_consensus::{chain_params, Network};
    use plbd_primitives::block::{Block, BlockHeader};
    use plbd_primitives::{Coin, OutPoint, Transaction, TxIn, TxOut};
    use plbd_script::standard::offline_staking_script;

    fn coinstake(time: u32, outputs: Vec<TxOut>) -> Transaction {
        let mut vout = vec![TxOut::empty()];
        vout.extend(outputs);
        Transaction {
            version: 2,
            time,
            vin: vec![TxIn {
                prevout: OutPoint {
                    hash: [3u8; 32],
                    index: 0,
                },
                script_sig: Vec::new(),
                sequence: TxIn::SEQUENCE_FINAL,
                witness: Vec::new(),
            }],
            vout,
            lock_time: 0,
        }
    }

    fn empty_coinbase(time: u32) -> Transaction {
        Transaction {
            version: 2,
            time,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: vec![0x01, 0x05],
                sequence: TxIn::SEQUENCE_FINAL,
                witness: Vec::new(),
            }],
            vout: vec![TxOut::empty()],
            lock_time: 0,
        }
    }

    fn pos_block(time: u32, coinstake_time: u32) -> Block {
        Block {
            header: BlockHeader {
                version: 4,
                prev_block: [1u8; 32],
                merkle_root: [0u8; 32],
                time,
                bits: 0x207f_ffff,
                height: 60,
                nonce64: 0,
                mix_hash: [0u8; 32],
            },
            transactions: vec![
                empty_coinbase(time),
                coinstake(
                    coinstake_time,
                    vec![TxOut {
                        value: 100 * COIN,
                        script_pubkey: vec![0x51],
                    }],
                ),
            ],
            signature: vec![0x30],
        }
    }

    #[test]
    fn coinstake_timestamp_must_match_header() {
        let good = pos_block(1_000, 1_000);
        check_proof_of_stake_structure(&good).expect("structure");

        let bad = pos_block(1_000, 999);
        assert_eq!(
            check_proof_of_stake_structure(&bad),
            Err(PosError::TimestampMismatch)
        );
    }

    #[test]
    fn stake_maturity_enforced() {
        let params = chain_params(Network::Regtest).consensus;
        let coin = Coin {
            value: 50 * COIN,
            script_pubkey: vec![0x51],
            height: 10,
            is_coinbase: false,
            is_coinstake: true,
            time: 500,
        };
        assert_eq!(
            check_stake_maturity(&coin, 50, 1_000, &params),
            Err(PosError::ImmatureStake)
        );
        check_stake_maturity(&coin, 110, 1_000, &params).expect("mature");
    }

    #[test]
    fn offline_split_caps_operator_share() {
        let staking_script = offline_staking_script(&[1u8; 20], &[2u8; 20]);
        let kernel = Coin {
            value: 1_000 * COIN,
            script_pubkey: staking_script.clone(),
            height: 10,
            is_coinbase: false,
            is_coinstake: false,
            time: 500,
        };
        let reward = 10 * COIN;

        // 10% to the operator is allowed.
        let tx = coinstake(
            1_000,
            vec![
                TxOut {
                    value: 1_000 * COIN + reward - reward / 10,
                    script_pubkey: staking_script.clone(),
                },
                TxOut {
                    value: reward / 10,
                    script_pubkey: vec![0x51],
                },
            ],
        );
        check_offline_stake_split(&tx, &kernel, 1_000 * COIN).expect("ten percent ok");

        // More than 10% is not.
        let greedy = coinstake(
            1_000,
            vec![
                TxOut {
                    value: 1_000 * COIN + reward / 2,
                    script_pubkey: staking_script.clone(),
                },
                TxOut {
                    value: reward / 2,
                    script_pubkey: vec![0x51],
                },
            ],
        );
        assert_eq!(
            check_offline_stake_split(&greedy, &kernel, 1_000 * COIN),
            Err(PosError::OfflineStakeGreed)
        );

        // Principal must come back to the staking script.
        let escape = coinstake(
            1_000,
            vec![TxOut {
                value: 1_000 * COIN + reward,
                script_pubkey: vec![0x51],
            }],
        );
        assert_eq!(
            check_offline_stake_split(&escape, &kernel, 1_000 * COIN),
            Err(PosError::OfflineStakeEscape)
        );
    }
}
