//! Genesis block construction.

use plbd_consensus::params::ChainParams;
use plbd_primitives::block::{Block, BlockHeader};
use plbd_primitives::{compute_merkle_root, OutPoint, Transaction, TxIn, TxOut};
use plbd_script::standard::push_data;

/// Deterministically build the genesis block for a network. The genesis
/// coinbase pays nothing; the premine is block 1's coinbase.
pub fn genesis_block(params: &ChainParams) -> Block {
    let genesis = &params.genesis;

    let mut script_sig = Vec::new();
    push_data(&mut script_sig, &genesis.bits.to_le_bytes());
    push_data(&mut script_sig, &[4]);
    push_data(&mut script_sig, genesis.coinbase_message.as_bytes());

    let mut pubkey_bytes = Vec::with_capacity(65);
    let hex = genesis.coinbase_pubkey.as_bytes();
    for chunk in hex.chunks(2) {
        let high = (chunk[0] as char).to_digit(16).unwrap_or(0) as u8;
        let low = (chunk[1] as char).to_digit(16).unwrap_or(0) as u8;
        pubkey_bytes.push(high << 4 | low);
    }
    let script_pubkey = plbd_script::standard::pay_to_pubkey(&pubkey_bytes);

    let coinbase = Transaction {
        version: 1,
        time: genesis.time,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: TxIn::SEQUENCE_FINAL,
            witness: Vec::new(),
        }],
        vout: vec![TxOut {
            value: 0,
            script_pubkey,
        }],
        lock_time: 0,
    };

    let merkle_root = compute_merkle_root(&[coinbase.txid()]);
    Block {
        header: BlockHeader {
            version: genesis.version,
            prev_block: [0u8; 32],
            merkle_root,
            time: genesis.time,
            bits: genesis.bits,
            height: 0,
            nonce64: genesis.nonce64,
            mix_hash: [0u8; 32],
        },
        transactions: vec![coinbase],
        signature: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::genesis_block;
    use plbd_consensus::{chain_params, Network};

    #[test]
    fn genesis_is_deterministic_and_distinct_per_network() {
        let mainnet = genesis_block(&chain_params(Network::Mainnet));
        let mainnet_again = genesis_block(&chain_params(Network::Mainnet));
        let regtest = genesis_block(&chain_params(Network::Regtest));

        assert_eq!(mainnet.header.hash(), mainnet_again.header.hash());
        assert_ne!(mainnet.header.hash(), regtest.header.hash());
        assert_eq!(mainnet.header.merkle_root, mainnet.merkle_root());
        assert_eq!(mainnet.transactions[0].vout[0].value, 0);
    }
}
