//! End-to-end chain scenarios on regtest.

use std::path::PathBuf;
use std::sync::Arc;

use plbd_chainstate::state::{ChainState, ChainStateConfig};
use plbd_chainstate::validation::{serialize_height, ChainError};
use plbd_consensus::money::COIN;
use plbd_consensus::rewards::{block_subsidy, PREMINE};
use plbd_consensus::{chain_params, ChainParams, Network};
use plbd_pow::validation::check_proof_of_work;
use plbd_primitives::block::{Block, BlockHeader};
use plbd_primitives::hash::hash160;
use plbd_primitives::{compute_merkle_root, OutPoint, Transaction, TxIn, TxOut};
use plbd_script::sighash::{legacy_sighash, SIGHASH_ALL};
use plbd_script::standard::{pay_to_pubkey_hash, push_data};
use plbd_storage::memory::MemoryStore;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

const BLOCK_VERSION: i32 = 4 | plbd_consensus::constants::OFFLINE_STAKING_VERSION_MASK;

struct Harness {
    chain: ChainState<MemoryStore>,
    params: ChainParams,
    secret: SecretKey,
    pubkey: Vec<u8>,
    reward_script: Vec<u8>,
}

fn temp_dir(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("plbd-chain-{tag}-{}", std::process::id()))
}

impl Harness {
    fn new(tag: &str) -> Self {
        Self::with_config(tag, |_| {})
    }

    fn with_config(tag: &str, tune: impl FnOnce(&mut ChainStateConfig)) -> Self {
        let dir = temp_dir(tag);
        let _ = std::fs::remove_dir_all(&dir);
        let mut config = ChainStateConfig {
            data_dir: dir,
            require_standard: false,
            ..ChainStateConfig::default()
        };
        tune(&mut config);
        let params = chain_params(Network::Regtest);
        let chain = ChainState::new(Arc::new(MemoryStore::new()), params, config)
            .expect("chain state opens");
        let params = chain.params().clone();
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[0x42; 32]).expect("secret");
        let pubkey = PublicKey::from_secret_key(&secp, &secret)
            .serialize()
            .to_vec();
        let reward_script = pay_to_pubkey_hash(&hash160(&pubkey));
        Self {
            chain,
            params,
            secret,
            pubkey,
            reward_script,
        }
    }

    fn coinbase(&self, height: i32, value: i64, time: u32) -> Transaction {
        let mut script_sig = serialize_height(height);
        script_sig.push(0x00);
        Transaction {
            version: 2,
            time,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig,
                sequence: TxIn::SEQUENCE_FINAL,
                witness: Vec::new(),
            }],
            vout: vec![TxOut {
                value,
                script_pubkey: self.reward_script.clone(),
            }],
            lock_time: 0,
        }
    }

    fn block_time(&self, height: i32) -> u32 {
        self.params.genesis.time + height as u32 * 600
    }

    /// Build and grind a proof-of-work block on top of `prev_hash`.
    fn build_block_on(
        &self,
        prev_hash: [u8; 32],
        height: i32,
        txs: Vec<Transaction>,
        reward: i64,
        time_nudge: u32,
    ) -> Block {
        let time = self.block_time(height) + time_nudge;
        let coinbase = self.coinbase(height, reward, time);
        let mut transactions = vec![coinbase];
        transactions.extend(txs);
        let txids: Vec<[u8; 32]> = transactions.iter().map(|tx| tx.txid()).collect();
        let merkle_root = compute_merkle_root(&txids);
        let mut block = Block {
            header: BlockHeader {
                version: BLOCK_VERSION,
                prev_block: prev_hash,
                merkle_root,
                time,
                bits: self.params.consensus.pow_limit_bits,
                height: height as u32,
                nonce64: 0,
                mix_hash: [0u8; 32],
            },
            transactions,
            signature: Vec::new(),
        };
        for nonce in 0..100_000u64 {
            block.header.nonce64 = nonce;
            if check_proof_of_work(&block.header, &self.params.consensus).is_ok() {
                return block;
            }
        }
        panic!("no proof-of-work solution found");
    }

    fn mine(&self, txs: Vec<Transaction>, fees: i64) -> Block {
        let tip = self.chain.best_block().expect("tip");
        let height = tip.height + 1;
        let reward = block_subsidy(height) + fees;
        let block = self.build_block_on(tip.hash, height, txs, reward, 0);
        self.chain.accept_block(&block, true).expect("block accepted");
        block
    }

    fn mine_chain(&self, count: usize) -> Vec<Block> {
        (0..count).map(|_| self.mine(Vec::new(), 0)).collect()
    }

    /// A signed spend of one of our P2PKH outputs.
    fn spend(&self, prevout: OutPoint, input_value: i64, fee: i64, to: &[u8]) -> Transaction {
        let mut tx = Transaction {
            version: 2,
            time: 0,
            vin: vec![TxIn {
                prevout,
                script_sig: Vec::new(),
                sequence: TxIn::SEQUENCE_FINAL,
                witness: Vec::new(),
            }],
            vout: vec![TxOut {
                value: input_value - fee,
                script_pubkey: to.to_vec(),
            }],
            lock_time: 0,
        };
        let secp = Secp256k1::new();
        let digest = legacy_sighash(&tx, 0, &self.reward_script, SIGHASH_ALL);
        let mut sig = secp
            .sign_ecdsa(&Message::from_digest(digest), &self.secret)
            .serialize_der()
            .to_vec();
        sig.push(SIGHASH_ALL as u8);
        let mut script_sig = Vec::new();
        push_data(&mut script_sig, &sig);
        push_data(&mut script_sig, &self.pubkey);
        tx.vin[0].script_sig = script_sig;
        tx
    }
}

#[test]
fn premine_schedule_is_enforced() {
    let harness = Harness::new("premine");
    let genesis_tip = harness.chain.best_block().expect("genesis connected");
    assert_eq!(genesis_tip.height, 0);

    // Block 1 pays exactly the premine.
    let block1 = harness.mine(Vec::new(), 0);
    assert_eq!(block1.transactions[0].vout[0].value, PREMINE);
    assert_eq!(block1.transactions[0].vout[0].value, 1_000_000_000 * COIN);
    let tip = harness.chain.best_block().expect("tip");
    assert_eq!(tip.height, 1);
    assert_eq!(tip.hash, block1.header.hash());

    // Every later block pays the fixed reward.
    let block2 = harness.mine(Vec::new(), 0);
    assert_eq!(block2.transactions[0].vout[0].value, 10 * COIN);

    // A coinbase above the schedule is rejected and the tip stands.
    let tip = harness.chain.best_block().expect("tip");
    let greedy = harness.build_block_on(tip.hash, tip.height + 1, Vec::new(), 11 * COIN, 0);
    let result = harness.chain.accept_block(&greedy, true);
    assert!(result.is_ok(), "block stored; connect verdict is internal");
    let after = harness.chain.best_block().expect("tip");
    assert_eq!(after.hash, tip.hash, "greedy block must not become tip");
}

#[test]
fn simple_reorg_switches_to_heavier_branch() {
    let harness = Harness::new("reorg");
    let blocks = harness.mine_chain(8);
    let tip_a = harness.chain.best_block().expect("tip");
    assert_eq!(tip_a.height, 8);

    // Branch B forks three blocks back and grows one longer.
    let fork_height = 5;
    let fork_hash = blocks[fork_height - 1].header.hash();
    let mut prev = fork_hash;
    let mut b_blocks = Vec::new();
    for offset in 0..4 {
        let height = fork_height as i32 + 1 + offset;
        let block = harness.build_block_on(
            prev,
            height,
            Vec::new(),
            block_subsidy(height),
            // Distinct times keep branch hashes apart from branch A.
            7 + offset as u32,
        );
        prev = block.header.hash();
        harness.chain.accept_block(&block, true).expect("b branch accepted");
        b_blocks.push(block);
    }

    let tip_b = harness.chain.best_block().expect("tip");
    assert_eq!(tip_b.height, 9);
    assert_eq!(tip_b.hash, b_blocks.last().expect("blocks").header.hash());

    // The orphaned A blocks are still indexed and readable.
    for block in &blocks[fork_height..] {
        let loaded = harness
            .chain
            .read_block(&block.header.hash())
            .expect("read")
            .expect("still stored");
        assert_eq!(loaded.header.hash(), block.header.hash());
    }
}

#[test]
fn invalid_script_marks_block_failed_and_keeps_tip() {
    let harness = Harness::new("badscript");
    harness.mine_chain(102);
    let premine_coinbase = harness
        .chain
        .read_block(
            &harness
                .chain
                .block_hash_at_height(1)
                .expect("block 1"),
        )
        .expect("read")
        .expect("block 1");
    let premine_outpoint = OutPoint {
        hash: premine_coinbase.transactions[0].txid(),
        index: 0,
    };

    // A spend whose signature is garbage.
    let mut bad_spend = harness.spend(premine_outpoint, PREMINE, 10_000, &[0x51]);
    bad_spend.vin[0].script_sig = {
        let mut script = Vec::new();
        push_data(&mut script, &[0x30, 0x06, 0x02, 0x01, 0x01, 0x02, 0x01, 0x01, 0x01]);
        push_data(&mut script, &harness.pubkey);
        script
    };

    let tip = harness.chain.best_block().expect("tip");
    let bad_block = harness.build_block_on(
        tip.hash,
        tip.height + 1,
        vec![bad_spend],
        block_subsidy(tip.height + 1) + 10_000,
        0,
    );
    harness
        .chain
        .accept_block(&bad_block, true)
        .expect("stored; connect fails internally");

    let after = harness.chain.best_block().expect("tip");
    assert_eq!(after.hash, tip.hash, "invalid block must not advance tip");

    // A valid spend of the same coin connects fine.
    let good_spend = harness.spend(premine_outpoint, PREMINE, 10_000, &[0x51]);
    harness.mine(vec![good_spend.clone()], 10_000);
    let after = harness.chain.best_block().expect("tip");
    assert_eq!(after.height, tip.height + 1);
    let location = harness
        .chain
        .tx_location(&good_spend.txid())
        .expect("query");
    assert!(location.is_some(), "confirmed tx is indexed");
}

#[test]
fn undo_roundtrip_restores_previous_state() {
    let harness = Harness::new("undo");
    harness.mine_chain(102);
    let block1 = harness
        .chain
        .read_block(&harness.chain.block_hash_at_height(1).expect("h1"))
        .expect("read")
        .expect("block");
    let premine_outpoint = OutPoint {
        hash: block1.transactions[0].txid(),
        index: 0,
    };

    let spend = harness.spend(premine_outpoint, PREMINE, 10_000, &[0x51]);
    let spend_txid = spend.txid();
    let block = harness.mine(vec![spend], 10_000);
    let tip = harness.chain.best_block().expect("tip");
    assert_eq!(tip.hash, block.header.hash());

    // Disconnect via invalidate: the spend's coin returns, the created
    // coin disappears, and the tip moves back.
    harness
        .chain
        .invalidate_block(&block.header.hash())
        .expect("invalidate");
    let after = harness.chain.best_block().expect("tip");
    assert_eq!(after.height, tip.height - 1);

    // The disconnected spend went back to the mempool.
    assert!(harness.chain.mempool_txids().contains(&spend_txid));

    // Reconsidering restores the heavier chain.
    harness
        .chain
        .reconsider_block(&block.header.hash())
        .expect("reconsider");
    let restored = harness.chain.best_block().expect("tip");
    assert_eq!(restored.hash, block.header.hash());
    assert!(!harness.chain.mempool_txids().contains(&spend_txid));
}

#[test]
fn proof_of_stake_block_connects() {
    let harness = Harness::new("pos");
    // Mature the premine past coinbase maturity and the PoS start.
    harness.mine_chain(110);
    let block1 = harness
        .chain
        .read_block(&harness.chain.block_hash_at_height(1).expect("h1"))
        .expect("read")
        .expect("block");
    let kernel_outpoint = OutPoint {
        hash: block1.transactions[0].txid(),
        index: 0,
    };

    let tip = harness.chain.best_block().expect("tip");
    let height = tip.height + 1;
    let time = harness.block_time(height);

    // Coinbase of a PoS block pays nothing.
    let coinbase = {
        let mut script_sig = serialize_height(height);
        script_sig.push(0x00);
        Transaction {
            version: 2,
            time,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig,
                sequence: TxIn::SEQUENCE_FINAL,
                witness: Vec::new(),
            }],
            vout: vec![TxOut::empty()],
            lock_time: 0,
        }
    };

    // Coinstake: empty marker, then principal plus reward back to us.
    let mut coinstake = Transaction {
        version: 2,
        time,
        vin: vec![TxIn {
            prevout: kernel_outpoint,
            script_sig: Vec::new(),
            sequence: TxIn::SEQUENCE_FINAL,
            witness: Vec::new(),
        }],
        vout: vec![
            TxOut::empty(),
            TxOut {
                value: PREMINE + block_subsidy(height),
                script_pubkey: harness.reward_script.clone(),
            },
        ],
        lock_time: 0,
    };
    let secp = Secp256k1::new();
    let digest = legacy_sighash(&coinstake, 0, &harness.reward_script, SIGHASH_ALL);
    let mut sig = secp
        .sign_ecdsa(&Message::from_digest(digest), &harness.secret)
        .serialize_der()
        .to_vec();
    sig.push(SIGHASH_ALL as u8);
    let mut script_sig = Vec::new();
    push_data(&mut script_sig, &sig);
    push_data(&mut script_sig, &harness.pubkey);
    coinstake.vin[0].script_sig = script_sig;

    let transactions = vec![coinbase, coinstake];
    let txids: Vec<[u8; 32]> = transactions.iter().map(|tx| tx.txid()).collect();
    let mut block = Block {
        header: BlockHeader {
            version: BLOCK_VERSION,
            prev_block: tip.hash,
            merkle_root: compute_merkle_root(&txids),
            time,
            bits: harness.params.consensus.pos_limit_bits,
            height: height as u32,
            nonce64: 0,
            mix_hash: [0u8; 32],
        },
        transactions,
        signature: Vec::new(),
    };
    let header_digest = block.header.hash();
    block.signature = secp
        .sign_ecdsa(&Message::from_digest(header_digest), &harness.secret)
        .serialize_der()
        .to_vec();

    harness.chain.accept_block(&block, true).expect("pos accepted");
    let after = harness.chain.best_block().expect("tip");
    assert_eq!(after.hash, block.header.hash());
    assert_eq!(after.height, height);
}

#[test]
fn pruning_unlinks_old_files_and_fails_reads_clearly() {
    let harness = Harness::with_config("prune", |config| {
        // Tiny files so every few blocks rotate.
        config.max_flatfile_size = 4 * 1024;
    });
    let blocks = harness.mine_chain(350);
    harness.chain.flush(true).expect("flush");

    let pruned = harness.chain.prune_to_height(40).expect("prune");
    assert!(pruned > 0, "some files must go");

    // An early block is gone and says so.
    let early = blocks[2].header.hash();
    match harness.chain.read_block(&early) {
        Err(ChainError::System(message)) => {
            assert!(message.contains("pruned"), "unexpected message: {message}");
        }
        other => panic!("expected pruned error, got {other:?}"),
    }

    // Recent blocks stay readable.
    let recent = blocks[349].header.hash();
    assert!(harness
        .chain
        .read_block(&recent)
        .expect("read")
        .is_some());
}

#[test]
fn verify_chain_passes_on_healthy_chain() {
    let harness = Harness::new("verify");
    harness.mine_chain(20);
    harness.chain.flush(true).expect("flush");
    harness.chain.verify_chain(4, 10).expect("verify level 4");
}

#[test]
fn restart_recovers_tip_from_disk() {
    let dir = temp_dir("restart");
    let _ = std::fs::remove_dir_all(&dir);
    let store = Arc::new(MemoryStore::new());
    let config = ChainStateConfig {
        data_dir: dir.clone(),
        require_standard: false,
        ..ChainStateConfig::default()
    };
    let tip_hash = {
        let chain = ChainState::new(
            Arc::clone(&store),
            chain_params(Network::Regtest),
            config.clone(),
        )
        .expect("open");
        let harness_like = chain.best_block().expect("genesis");
        assert_eq!(harness_like.height, 0);
        // Mine a few blocks through a throwaway harness-less loop.
        let params = chain.params().clone();
        let mut prev = harness_like.hash;
        for height in 1..=5 {
            let time = params.genesis.time + height as u32 * 600;
            let mut script_sig = serialize_height(height);
            script_sig.push(0x00);
            let coinbase = Transaction {
                version: 2,
                time,
                vin: vec![TxIn {
                    prevout: OutPoint::null(),
                    script_sig,
                    sequence: TxIn::SEQUENCE_FINAL,
                    witness: Vec::new(),
                }],
                vout: vec![TxOut {
                    value: block_subsidy(height),
                    script_pubkey: vec![0x51],
                }],
                lock_time: 0,
            };
            let txids = vec![coinbase.txid()];
            let mut block = Block {
                header: BlockHeader {
                    version: BLOCK_VERSION,
                    prev_block: prev,
                    merkle_root: compute_merkle_root(&txids),
                    time,
                    bits: params.consensus.pow_limit_bits,
                    height: height as u32,
                    nonce64: 0,
                    mix_hash: [0u8; 32],
                },
                transactions: vec![coinbase],
                signature: Vec::new(),
            };
            for nonce in 0..100_000u64 {
                block.header.nonce64 = nonce;
                if check_proof_of_work(&block.header, &params.consensus).is_ok() {
                    break;
                }
            }
            prev = block.header.hash();
            chain.accept_block(&block, true).expect("accepted");
        }
        chain.flush(true).expect("flush");
        chain.best_block().expect("tip").hash
    };

    // Reopen over the same store and files.
    let chain = ChainState::new(store, chain_params(Network::Regtest), config).expect("reopen");
    let tip = chain.best_block().expect("tip");
    assert_eq!(tip.height, 5);
    assert_eq!(tip.hash, tip_hash);
    let _ = std::fs::remove_dir_all(&dir);
}
