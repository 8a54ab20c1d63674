//! Per-network chain parameters.

use crate::money::{Amount, COIN};
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "mainnet" => Some(Self::Mainnet),
            "testnet" => Some(Self::Testnet),
            "regtest" => Some(Self::Regtest),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash256,
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    /// Filled in at startup from the constructed genesis block.
    pub hash_genesis_block: Hash256,
    /// Compact proof-of-work limit.
    pub pow_limit_bits: u32,
    /// Compact proof-of-stake limit.
    pub pos_limit_bits: u32,
    /// Target seconds between blocks.
    pub target_spacing: i64,
    /// Height at which proof-of-stake blocks become valid.
    pub pos_height: i32,
    /// Height at which the offline-staking output split activates.
    pub offline_staking_height: i32,
    /// Height at which token operations activate.
    pub tokens_height: i32,
    /// Height at which restricted-token operations activate.
    pub restricted_tokens_height: i32,
    /// Hash-indexed checkpoints; headers at these heights must match.
    pub checkpoints: Vec<Checkpoint>,
    /// Cumulative work a competing header chain must reach before its
    /// blocks are stored.
    pub min_chain_work: Hash256,
    /// Script checks are skipped for ancestors of this block, if set.
    pub assume_valid: Option<Hash256>,
    /// Seconds a coin must age before it may stake.
    pub stake_min_age: i64,
    /// Seconds between stake-modifier rotations.
    pub stake_modifier_interval: i64,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub consensus: ConsensusParams,
    /// Frame marker for block and undo files.
    pub disk_magic: [u8; 4],
    /// Script holding governance authority over freezes and fee updates.
    pub governance_script: Vec<u8>,
    /// Script that must receive token issuance fees.
    pub issuance_fee_script: Vec<u8>,
    /// Default issuance cost per token class, governance-updatable.
    pub issuance_cost_root: Amount,
    pub issuance_cost_sub: Amount,
    pub issuance_cost_unique: Amount,
    pub issuance_cost_qualifier: Amount,
    pub issuance_cost_restricted: Amount,
    pub genesis: GenesisParams,
}

/// Raw material the genesis block is built from at startup.
#[derive(Clone, Debug)]
pub struct GenesisParams {
    pub version: i32,
    pub time: u32,
    pub bits: u32,
    pub nonce64: u64,
    pub coinbase_message: &'static str,
    pub coinbase_pubkey: &'static str,
}

const GENESIS_MESSAGE: &str =
    "The Times 22/Feb/2022 Heating or eating: how one family is facing the cost of living crisis";
const GENESIS_PUBKEY: &str =
    "04678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5f";

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            consensus: ConsensusParams {
                hash_genesis_block: [0u8; 32],
                pow_limit_bits: 0x1e00_ffff,
                pos_limit_bits: 0x1e00_ffff,
                target_spacing: 60,
                pos_height: 500,
                offline_staking_height: 100_000,
                tokens_height: 1,
                restricted_tokens_height: 1,
                checkpoints: Vec::new(),
                min_chain_work: [0u8; 32],
                assume_valid: None,
                stake_min_age: 60 * 60 * 8,
                stake_modifier_interval: 60 * 10,
            },
            disk_magic: [0x50, 0x4c, 0x42, 0x44],
            governance_script: Vec::new(),
            issuance_fee_script: Vec::new(),
            issuance_cost_root: 100 * COIN,
            issuance_cost_sub: 10 * COIN,
            issuance_cost_unique: COIN,
            issuance_cost_qualifier: 100 * COIN,
            issuance_cost_restricted: 150 * COIN,
            genesis: GenesisParams {
                version: 4,
                time: 1_645_531_200,
                bits: 0x1e00_ffff,
                nonce64: 0x0000_0000_0018_a922,
                coinbase_message: GENESIS_MESSAGE,
                coinbase_pubkey: GENESIS_PUBKEY,
            },
        },
        Network::Testnet => {
            let mut params = chain_params(Network::Mainnet);
            params.network = network;
            params.disk_magic = [0x54, 0x4c, 0x42, 0x44];
            params.consensus.pos_height = 200;
            params.consensus.offline_staking_height = 1_000;
            params.genesis.time = 1_645_531_201;
            params.genesis.nonce64 = 0x0000_0000_0000_4d21;
            params
        }
        Network::Regtest => {
            let mut params = chain_params(Network::Mainnet);
            params.network = network;
            params.disk_magic = [0x52, 0x4c, 0x42, 0x44];
            params.consensus.pow_limit_bits = 0x207f_ffff;
            params.consensus.pos_limit_bits = 0x207f_ffff;
            params.consensus.pos_height = 50;
            params.consensus.offline_staking_height = 60;
            params.consensus.stake_min_age = 0;
            params.genesis.bits = 0x207f_ffff;
            params.genesis.nonce64 = 0;
            params
        }
    }
}
