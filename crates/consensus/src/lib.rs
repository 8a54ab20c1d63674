//! Consensus rules shared across validation: constants, money, chain
//! parameters and the subsidy schedule.

pub mod constants;
pub mod money;
pub mod params;
pub mod rewards;

pub type Hash256 = [u8; 32];

pub use params::{chain_params, ChainParams, Checkpoint, ConsensusParams, Network};
pub use rewards::block_subsidy;

/// Zero hash, used as the predecessor of the genesis block.
pub const ZERO_HASH: Hash256 = [0u8; 32];

pub fn hash256_from_hex(hex: &str) -> Option<Hash256> {
    if hex.len() != 64 {
        return None;
    }
    let mut out = [0u8; 32];
    let bytes = hex.as_bytes();
    for (i, chunk) in bytes.chunks(2).enumerate() {
        let high = (chunk[0] as char).to_digit(16)? as u8;
        let low = (chunk[1] as char).to_digit(16)? as u8;
        out[i] = high << 4 | low;
    }
    // Hashes are displayed big-endian but stored little-endian.
    out.reverse();
    Some(out)
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push(char::from_digit((byte >> 4) as u32, 16).unwrap_or('0'));
        out.push(char::from_digit((byte & 0x0f) as u32, 16).unwrap_or('0'));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{hash256_from_hex, hash256_to_hex};

    #[test]
    fn hex_roundtrip_reverses_byte_order() {
        let hex = "00000000000000000000000000000000000000000000000000000000000000ff";
        let hash = hash256_from_hex(hex).expect("parse");
        assert_eq!(hash[0], 0xff);
        assert_eq!(hash256_to_hex(&hash), hex);
    }
}
