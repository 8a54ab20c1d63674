//! Stake kernel hashing and modifier evolution.

use plbd_consensus::money::COIN;
use plbd_consensus::Hash256;
use plbd_pow::difficulty::compact_to_u256;
use plbd_primitives::encoding::Encoder;
use plbd_primitives::hash::sha256d;
use plbd_primitives::{Coin, OutPoint};
use primitive_types::U256;

use crate::validation::PosError;

/// Stake modifier for the block following `prev`, folding in the block's
/// own identity so modifiers cannot be precomputed far ahead.
pub fn next_stake_modifier(prev_modifier: &Hash256, block_hash: &Hash256) -> Hash256 {
    let mut buf = [0u8; 64];
    buf[0..32].copy_from_slice(block_hash);
    buf[32..64].copy_from_slice(prev_modifier);
    sha256d(&buf)
}

/// Kernel preimage: modifier, creating-tx time, prevout, candidate time.
pub fn kernel_hash(
    stake_modifier: &Hash256,
    coin_time: u32,
    prevout: &OutPoint,
    block_time: u32,
) -> Hash256 {
    let mut encoder = Encoder::with_capacity(76);
    encoder.write_bytes(stake_modifier);
    encoder.write_u32_le(coin_time);
    encoder.write_bytes(&prevout.hash);
    encoder.write_u32_le(prevout.index);
    encoder.write_u32_le(block_time);
    sha256d(&encoder.into_inner())
}

/// The kernel meets the target when its hash is at or below the compact
/// target scaled by the staked value in whole coins.
pub fn check_kernel_target(
    stake_modifier: &Hash256,
    coin: &Coin,
    prevout: &OutPoint,
    block_time: u32,
    bits: u32,
) -> Result<(), PosError> {
    let target = compact_to_u256(bits).map_err(|_| PosError::InvalidTarget)?;
    let weight = (coin.value / COIN).max(1) as u64;
    let (weighted, overflow) = target.overflowing_mul(U256::from(weight));
    let weighted = if overflow { U256::MAX } else { weighted };

    let hash = kernel_hash(stake_modifier, coin.time, prevout, block_time);
    let hash_value = U256::from_little_endian(&hash);
    if hash_value > weighted {
        return Err(PosError::KernelTooHigh);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{check_kernel_target, kernel_hash, next_stake_modifier};
    use plbd_consensus::money::COIN;
    use plbd_primitives::{Coin, OutPoint};

    fn coin(value: i64) -> Coin {
        Coin {
            value,
            script_pubkey: vec![0x51],
            height: 10,
            is_coinbase: false,
            is_coinstake: false,
            time: 1_700_000_000,
        }
    }

    #[test]
    fn modifier_depends_on_both_inputs() {
        let a = next_stake_modifier(&[1u8; 32], &[2u8; 32]);
        let b = next_stake_modifier(&[1u8; 32], &[3u8; 32]);
        let c = next_stake_modifier(&[4u8; 32], &[2u8; 32]);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn kernel_hash_moves_with_block_time() {
        let prevout = OutPoint {
            hash: [9u8; 32],
            index: 0,
        };
        let one = kernel_hash(&[0u8; 32], 100, &prevout, 200);
        let two = kernel_hash(&[0u8; 32], 100, &prevout, 260);
        assert_ne!(one, two);
    }

    #[test]
    fn permissive_target_accepts_any_kernel() {
        let prevout = OutPoint {
            hash: [9u8; 32],
            index: 0,
        };
        // 0x2100ffff decodes above every 256-bit hash value.
        check_kernel_target(&[0u8; 32], &coin(100 * COIN), &prevout, 200, 0x2100_ffff)
            .expect("kernel accepted");
    }
}
