//! Proof-of-work header checks.
//!
//! The ProgPoW mix verification itself belongs to the hash library; what is
//! enforced here is the target encoding and the index-hash bound.

use plbd_consensus::ConsensusParams;
use plbd_primitives::block::BlockHeader;

use crate::difficulty::{compact_to_u256, hash_meets_target, CompactError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowError {
    InvalidTarget,
    HighHash,
}

impl std::fmt::Display for PowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowError::InvalidTarget => write!(f, "invalid difficulty target"),
            PowError::HighHash => write!(f, "block hash above target"),
        }
    }
}

impl std::error::Error for PowError {}

impl From<CompactError> for PowError {
    fn from(_: CompactError) -> Self {
        PowError::InvalidTarget
    }
}

/// Target sanity applied to every header on admission: the compact target
/// must decode and may not exceed the proof-type limit.
pub fn check_target_bounds(
    header: &BlockHeader,
    proof_of_stake: bool,
    params: &ConsensusParams,
) -> Result<(), PowError> {
    let limit_bits = if proof_of_stake {
        params.pos_limit_bits
    } else {
        params.pow_limit_bits
    };
    let target = compact_to_u256(header.bits)?;
    let limit = compact_to_u256(limit_bits)?;
    if target.is_zero() || target > limit {
        return Err(PowError::InvalidTarget);
    }
    Ok(())
}

/// Full proof check for a proof-of-work block: index hash at or below the
/// header target.
pub fn check_proof_of_work(
    header: &BlockHeader,
    params: &ConsensusParams,
) -> Result<(), PowError> {
    check_target_bounds(header, false, params)?;
    if !hash_meets_target(&header.hash(), header.bits)? {
        return Err(PowError::HighHash);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{check_proof_of_work, check_target_bounds, PowError};
    use plbd_consensus::{chain_params, Network};
    use plbd_primitives::block::BlockHeader;

    fn header(bits: u32) -> BlockHeader {
        BlockHeader {
            version: 4,
            prev_block: [0u8; 32],
            merkle_root: [0u8; 32],
            time: 1_700_000_000,
            bits,
            height: 1,
            nonce64: 0,
            mix_hash: [0u8; 32],
        }
    }

    #[test]
    fn target_above_limit_rejected() {
        let params = chain_params(Network::Mainnet).consensus;
        // Regtest-easy bits exceed the mainnet limit.
        let result = check_target_bounds(&header(0x207f_ffff), false, &params);
        assert_eq!(result, Err(PowError::InvalidTarget));
    }

    #[test]
    fn regtest_header_can_be_ground() {
        let params = chain_params(Network::Regtest).consensus;
        let mut header = header(params.pow_limit_bits);
        // Half of all hashes meet the regtest limit; a few tries suffice.
        for nonce in 0..1024 {
            header.nonce64 = nonce;
            if check_proof_of_work(&header, &params).is_ok() {
                return;
            }
        }
        panic!("no regtest solution found in 1024 tries");
    }
}
