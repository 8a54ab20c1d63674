use std::collections::HashMap;

use plbd_consensus::money::COIN;
use plbd_mempool::{AcceptContext, Mempool, MempoolErrorKind, PoolCoins, TokenGate};
use plbd_primitives::{Coin, OutPoint, Transaction, TxIn, TxOut};

struct TestCoins {
    map: HashMap<OutPoint, Coin>,
    height: i32,
}

impl TestCoins {
    fn new(height: i32) -> Self {
        Self {
            map: HashMap::new(),
            height,
        }
    }

    fn fund(&mut self, tag: u8, value: i64) -> OutPoint {
        let outpoint = OutPoint {
            hash: [tag; 32],
            index: 0,
        };
        self.map.insert(
            outpoint,
            Coin {
                value,
                script_pubkey: vec![0x51],
                height: 1,
                is_coinbase: false,
                is_coinstake: false,
                time: 0,
            },
        );
        outpoint
    }
}

impl PoolCoins for TestCoins {
    fn coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, String> {
        Ok(self.map.get(outpoint).cloned())
    }

    fn spend_height(&self) -> i32 {
        self.height
    }
}

struct NoTokens;

impl TokenGate for NoTokens {
    fn token_exists(&mut self, _name: &str) -> Result<bool, String> {
        Ok(false)
    }
    fn global_frozen(&mut self, _token: &str) -> Result<bool, String> {
        Ok(false)
    }
    fn address_frozen(&mut self, _token: &str, _address: &[u8; 20]) -> Result<bool, String> {
        Ok(false)
    }
}

fn ctx() -> AcceptContext {
    AcceptContext {
        next_height: 200,
        median_time_past: 1_600_000_000,
        now: 1_700_000_000,
        require_standard: false,
        min_relay_fee_per_kb: 1_000,
        bypass_limits: false,
        test_only: false,
    }
}

fn spend(outpoint: OutPoint, value: i64, outputs: usize) -> Transaction {
    let each = value / outputs as i64;
    Transaction {
        version: 2,
        time: 1_700_000_000,
        vin: vec![TxIn {
            prevout: outpoint,
            script_sig: Vec::new(),
            sequence: TxIn::SEQUENCE_FINAL,
            witness: Vec::new(),
        }],
        vout: (0..outputs)
            .map(|_| TxOut {
                value: each,
                script_pubkey: vec![0x51],
            })
            .collect(),
        lock_time: 0,
    }
}

#[test]
fn accept_then_conflict_is_rejected() {
    let mut pool = Mempool::default();
    let mut coins = TestCoins::new(200);
    let funding = coins.fund(1, COIN);

    // T1 spends outpoint O.
    let t1 = spend(funding, COIN - 10_000, 1);
    let outcome = pool
        .try_accept(t1.clone(), &ctx(), &mut coins, &mut NoTokens, None)
        .expect("t1 accepted");
    assert_eq!(outcome.fee, 10_000);
    assert!(pool.contains(&t1.txid()));

    // T2 spends O with double the fee: replacement is off, T1 stays.
    let t2 = spend(funding, COIN - 20_000, 1);
    let err = pool
        .try_accept(t2, &ctx(), &mut coins, &mut NoTokens, None)
        .unwrap_err();
    assert_eq!(err.kind, MempoolErrorKind::Conflict);
    assert_eq!(err.reason, "txn-mempool-conflict");
    assert!(pool.contains(&t1.txid()));
    pool.assert_consistent();
}

#[test]
fn ancestor_chain_caps_at_twenty_five() {
    let mut pool = Mempool::default();
    let mut coins = TestCoins::new(200);
    let funding = coins.fund(2, 1_000 * COIN);

    let mut prevout = funding;
    let mut value = 1_000 * COIN;
    let mut accepted = 0usize;
    let mut rejected = None;
    for _ in 0..26 {
        value -= 50_000;
        let tx = spend(prevout, value, 1);
        prevout = OutPoint {
            hash: tx.txid(),
            index: 0,
        };
        match pool.try_accept(tx, &ctx(), &mut coins, &mut NoTokens, None) {
            Ok(_) => accepted += 1,
            Err(err) => {
                rejected = Some(err);
                break;
            }
        }
    }
    assert_eq!(accepted, 25);
    let err = rejected.expect("26th rejected");
    assert_eq!(err.kind, MempoolErrorKind::TooLongChain);
    assert_eq!(err.reason, "too-long-mempool-chain");
    pool.assert_consistent();
}

#[test]
fn missing_inputs_are_not_invalid() {
    let mut pool = Mempool::default();
    let mut coins = TestCoins::new(200);
    let unknown = OutPoint {
        hash: [9u8; 32],
        index: 3,
    };
    let err = pool
        .try_accept(spend(unknown, 100, 1), &ctx(), &mut coins, &mut NoTokens, None)
        .unwrap_err();
    assert_eq!(err.kind, MempoolErrorKind::MissingInputs);
    assert!(pool.is_empty());
}

#[test]
fn fee_floor_enforced_unless_bypassed() {
    let mut pool = Mempool::default();
    let mut coins = TestCoins::new(200);
    let funding = coins.fund(3, COIN);

    let free = spend(funding, COIN, 1);
    let err = pool
        .try_accept(free.clone(), &ctx(), &mut coins, &mut NoTokens, None)
        .unwrap_err();
    assert_eq!(err.kind, MempoolErrorKind::FeeTooLow);

    let mut bypass = ctx();
    bypass.bypass_limits = true;
    pool.try_accept(free, &bypass, &mut coins, &mut NoTokens, None)
        .expect("bypass admits zero fee");
}

#[test]
fn trim_evicts_lowest_fee_rate_chain() {
    // A pool that fits roughly one entry.
    let mut pool = Mempool::new(100, 336 * 3600);
    let mut coins = TestCoins::new(200);
    let cheap_funding = coins.fund(4, COIN);
    let rich_funding = coins.fund(5, COIN);

    let cheap = spend(cheap_funding, COIN - 1_000, 1);
    pool.try_accept(cheap.clone(), &ctx(), &mut coins, &mut NoTokens, None)
        .expect("cheap accepted");

    let rich = spend(rich_funding, COIN - 500_000, 1);
    let outcome = pool
        .try_accept(rich.clone(), &ctx(), &mut coins, &mut NoTokens, None)
        .expect("rich accepted");
    assert!(outcome.evicted.contains(&cheap.txid()));
    assert!(pool.contains(&rich.txid()));
    assert!(!pool.contains(&cheap.txid()));
    pool.assert_consistent();
}

#[test]
fn coinbase_maturity_enforced_for_inputs() {
    let mut pool = Mempool::default();
    let mut coins = TestCoins::new(50);
    let outpoint = OutPoint {
        hash: [6u8; 32],
        index: 0,
    };
    coins.map.insert(
        outpoint,
        Coin {
            value: COIN,
            script_pubkey: vec![0x51],
            height: 1,
            is_coinbase: true,
            is_coinstake: false,
            time: 0,
        },
    );
    // Height 50 spending a height-1 coinbase: 49 < 100 confirmations.
    let mut young = ctx();
    young.next_height = 51;
    let err = pool
        .try_accept(spend(outpoint, COIN - 10_000, 1), &young, &mut coins, &mut NoTokens, None)
        .unwrap_err();
    assert_eq!(err.kind, MempoolErrorKind::InvalidTransaction);
    assert_eq!(err.reason, "bad-txns-premature-spend-of-coinbase");
}

#[test]
fn dump_parses_back_in_order() {
    let mut pool = Mempool::default();
    let mut coins = TestCoins::new(200);
    let a = coins.fund(7, COIN);
    let b = coins.fund(8, COIN);
    let tx_a = spend(a, COIN - 10_000, 1);
    let tx_b = spend(b, COIN - 20_000, 1);
    pool.try_accept(tx_a.clone(), &ctx(), &mut coins, &mut NoTokens, None)
        .expect("a");
    pool.try_accept(tx_b.clone(), &ctx(), &mut coins, &mut NoTokens, None)
        .expect("b");

    let dump = pool.dump();
    let parsed = Mempool::parse_dump(&dump).expect("parse");
    assert_eq!(parsed.len(), 2);
    assert_eq!(parsed[0].0.txid(), tx_a.txid());
    assert_eq!(parsed[1].0.txid(), tx_b.txid());
}
