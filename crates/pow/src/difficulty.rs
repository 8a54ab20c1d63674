//! Difficulty and compact target utilities.

use plbd_consensus::{ConsensusParams, Hash256};
use primitive_types::U256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

/// Header fields the retarget filter samples.
#[derive(Clone, Copy, Debug)]
pub struct HeaderInfo {
    pub height: i64,
    pub time: i64,
    pub bits: u32,
    pub proof_of_stake: bool,
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = (bits >> 24) as u32;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        let shift = 8 * (3 - size);
        word >>= shift;
        U256::from(word)
    } else {
        let shift = 8 * (size - 3);
        U256::from(word) << shift
    };

    if word != 0 {
        let overflow =
            size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = ((value.bits() + 7) / 8) as u32;
    let mut compact: u32;

    if size <= 3 {
        compact = value.low_u32() << (8 * (3 - size));
    } else {
        let shift = 8 * (size - 3);
        compact = (value >> shift).low_u32();
    }

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn hash_meets_target(hash: &Hash256, bits: u32) -> Result<bool, CompactError> {
    let target = compact_to_u256(bits)?;
    let hash_value = U256::from_little_endian(hash);
    Ok(hash_value <= target)
}

/// Work contributed by a header: floor(2^256 / (target + 1)).
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    let one = U256::from(1u64);
    Ok((!target / (target + one)) + one)
}

const SHORT_SAMPLE: i64 = 30;
const MEDIUM_SAMPLE: i64 = 400;
const LONG_SAMPLE: i64 = 2000;

/// Next required target over a contiguous ancestor window ending at the
/// chain tip, considering only blocks of the requested proof type.
///
/// Solve times are averaged at three scales, the three averages are
/// averaged again, damped by 0.25 towards the target spacing and clamped
/// to a 9% per-block adjustment before rescaling the last target.
pub fn next_target_required(
    chain: &[HeaderInfo],
    proof_of_stake: bool,
    params: &ConsensusParams,
) -> Result<u32, CompactError> {
    let limit_bits = if proof_of_stake {
        params.pos_limit_bits
    } else {
        params.pow_limit_bits
    };
    let limit = compact_to_u256(limit_bits)?;

    let Some(last) = chain.last() else {
        return Ok(limit_bits);
    };

    let mut first_short_time = 0i64;
    let mut first_medium_time = 0i64;
    let mut first_long_time = 0i64;

    let mut cursor = chain.len() - 1;
    let mut i = 0i64;
    let mut j = 0i64;
    while j <= LONG_SAMPLE + 1 {
        if cursor == 0 {
            // Hit the start of the window before finding enough blocks.
            return Ok(limit_bits);
        }
        let current = &chain[cursor];
        let prev = &chain[cursor - 1];
        let mut skip = false;
        if proof_of_stake {
            if current.proof_of_stake {
                j += 1;
            }
            if !prev.proof_of_stake {
                skip = true;
            }
        } else {
            if !current.proof_of_stake {
                j += 1;
            }
            if prev.proof_of_stake {
                skip = true;
            }
        }
        cursor -= 1;

        if i < LONG_SAMPLE {
            first_long_time = chain[cursor].time;
        }
        if skip {
            continue;
        }
        if i == SHORT_SAMPLE - 1 {
            first_short_time = chain[cursor].time;
        }
        if i == MEDIUM_SAMPLE - 1 {
            first_medium_time = chain[cursor].time;
        }
        i += 1;
    }

    let spacing = params.target_spacing;
    let mut short_span = 0i64;
    let mut medium_span = 0i64;
    let mut long_span = 0i64;
    if last.time != first_short_time {
        short_span = (last.time - first_short_time) / SHORT_SAMPLE;
    }
    if last.time != first_medium_time {
        medium_span = (last.time - first_medium_time) / MEDIUM_SAMPLE;
    }
    if last.time != first_long_time {
        long_span = (last.time - first_long_time) / LONG_SAMPLE;
    }

    let span_sum = short_span + medium_span + long_span;
    let mut actual_timespan = 0i64;
    if span_sum != 0 {
        actual_timespan = span_sum / 3;
    }

    // 0.25 damping towards the target spacing.
    actual_timespan = (actual_timespan + 3 * spacing) / 4;

    // 9% per-block adjustment limiter.
    let timespan_max = spacing * 494 / 453;
    let timespan_min = spacing * 453 / 494;
    actual_timespan = actual_timespan.clamp(timespan_min, timespan_max);

    let last_target = compact_to_u256(last.bits)?;
    let mut next = last_target * U256::from(actual_timespan as u64) / U256::from(spacing as u64);
    if next.is_zero() || next > limit {
        next = limit;
    }
    Ok(u256_to_compact(next))
}

#[cfg(test)]
mod tests {
    use super::{
        block_proof, compact_to_u256, hash_meets_target, next_target_required, u256_to_compact,
        HeaderInfo,
    };
    use plbd_consensus::{chain_params, Network};
    use primitive_types::U256;

    #[test]
    fn compact_roundtrip() {
        for bits in [0x207f_ffffu32, 0x1e00_ffff, 0x1d00_ffff, 0x1b04_864c] {
            let value = compact_to_u256(bits).expect("decode");
            assert_eq!(u256_to_compact(value), bits);
        }
    }

    #[test]
    fn negative_compact_rejected() {
        assert!(compact_to_u256(0x0180_0000).is_err());
    }

    #[test]
    fn proof_grows_as_target_shrinks() {
        let easy = block_proof(0x207f_ffff).expect("easy");
        let hard = block_proof(0x1d00_ffff).expect("hard");
        assert!(hard > easy);
        assert!(easy > U256::zero());
    }

    #[test]
    fn hash_comparison_is_little_endian() {
        let mut hash = [0xffu8; 32];
        assert!(!hash_meets_target(&hash, 0x207f_ffff).expect("cmp"));
        hash = [0u8; 32];
        hash[0] = 1;
        assert!(hash_meets_target(&hash, 0x207f_ffff).expect("cmp"));
    }

    #[test]
    fn short_window_returns_limit() {
        let params = chain_params(Network::Regtest).consensus;
        let chain: Vec<HeaderInfo> = (0..10)
            .map(|height| HeaderInfo {
                height,
                time: 1_700_000_000 + height * 60,
                bits: params.pow_limit_bits,
                proof_of_stake: false,
            })
            .collect();
        let bits = next_target_required(&chain, false, &params).expect("bits");
        assert_eq!(bits, params.pow_limit_bits);
    }
}
