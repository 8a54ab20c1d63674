//! The script check engine.
//!
//! A fixed pool of workers drains a channel of per-input checks; the
//! controller pushes batches while holding the chain lock, releases it,
//! and waits on a completion barrier. A shared flag records the first
//! failure; later tasks still drain but their results are ignored. A
//! salted, bounded, randomly-evicting cache short-circuits whole
//! transactions that already verified under the same flags.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};
use plbd_consensus::Hash256;
use plbd_primitives::encoding::Encoder;
use plbd_primitives::hash::sha256;
use plbd_primitives::Transaction;
use plbd_script::sighash::PrecomputedTxData;
use plbd_script::{verify_script, ScriptError};
use rand::Rng;

pub struct ScriptCheck {
    pub tx: Arc<Transaction>,
    pub input_index: usize,
    pub script_pubkey: Vec<u8>,
    pub amount: i64,
    pub flags: u32,
    pub txdata: Arc<PrecomputedTxData>,
}

impl ScriptCheck {
    pub fn execute(&self) -> Result<(), ScriptError> {
        let input = &self.tx.vin[self.input_index];
        verify_script(
            &input.script_sig,
            &self.script_pubkey,
            &input.witness,
            &self.tx,
            self.input_index,
            self.amount,
            self.flags,
            &self.txdata,
        )
    }
}

struct QueueState {
    pending: Mutex<usize>,
    done: Condvar,
    failed: AtomicBool,
}

/// Single instance per node; `workers == 0` runs every check inline on
/// the pushing thread.
pub struct CheckQueue {
    sender: Option<Sender<ScriptCheck>>,
    state: Arc<QueueState>,
    workers: Vec<JoinHandle<()>>,
    in_session: AtomicBool,
}

impl CheckQueue {
    pub fn new(worker_count: usize) -> Self {
        let state = Arc::new(QueueState {
            pending: Mutex::new(0),
            done: Condvar::new(),
            failed: AtomicBool::new(false),
        });
        if worker_count == 0 {
            return Self {
                sender: None,
                state,
                workers: Vec::new(),
                in_session: AtomicBool::new(false),
            };
        }
        let (sender, receiver) = unbounded::<ScriptCheck>();
        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let receiver = receiver.clone();
            let state = Arc::clone(&state);
            workers.push(std::thread::spawn(move || {
                for check in receiver.iter() {
                    if !state.failed.load(Ordering::Acquire) && check.execute().is_err() {
                        state.failed.store(true, Ordering::Release);
                    }
                    let mut pending = state.pending.lock().expect("check queue poisoned");
                    *pending -= 1;
                    if *pending == 0 {
                        state.done.notify_all();
                    }
                }
            }));
        }
        Self {
            sender: Some(sender),
            state,
            workers,
            in_session: AtomicBool::new(false),
        }
    }

    /// Claim the queue for one block's worth of checks.
    pub fn session(&self) -> CheckSession<'_> {
        let was = self.in_session.swap(true, Ordering::AcqRel);
        assert!(!was, "script check session already active");
        self.state.failed.store(false, Ordering::Release);
        CheckSession { queue: self }
    }

    pub fn shutdown(mut self) {
        self.sender = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

pub struct CheckSession<'a> {
    queue: &'a CheckQueue,
}

impl CheckSession<'_> {
    pub fn push_batch(&self, checks: Vec<ScriptCheck>) {
        let state = &self.queue.state;
        match &self.queue.sender {
            Some(sender) => {
                {
                    let mut pending = state.pending.lock().expect("check queue poisoned");
                    *pending += checks.len();
                }
                for check in checks {
                    sender.send(check).expect("check workers alive");
                }
            }
            None => {
                for check in checks {
                    if state.failed.load(Ordering::Acquire) {
                        break;
                    }
                    if check.execute().is_err() {
                        state.failed.store(true, Ordering::Release);
                    }
                }
            }
        }
    }

    /// Block until every pushed check finished; true iff all succeeded.
    pub fn wait(&self) -> bool {
        let state = &self.queue.state;
        let mut pending = state.pending.lock().expect("check queue poisoned");
        while *pending > 0 {
            pending = state.done.wait(pending).expect("check queue poisoned");
        }
        !state.failed.load(Ordering::Acquire)
    }
}

impl Drop for CheckSession<'_> {
    fn drop(&mut self) {
        self.wait();
        self.queue.in_session.store(false, Ordering::Release);
    }
}

const DEFAULT_SCRIPT_CACHE_ENTRIES: usize = 1 << 16;

struct CacheInner {
    set: HashSet<Hash256>,
    order: Vec<Hash256>,
    max_entries: usize,
}

/// Content-addressed script verification cache. A hit means the whole
/// transaction verified under the given flags; entries are stored only
/// after success and evicted at random when full.
pub struct ScriptExecutionCache {
    nonce: Hash256,
    inner: Mutex<CacheInner>,
}

impl ScriptExecutionCache {
    pub fn new(max_entries: usize) -> Self {
        let mut nonce = [0u8; 32];
        rand::thread_rng().fill(&mut nonce);
        Self {
            nonce,
            inner: Mutex::new(CacheInner {
                set: HashSet::new(),
                order: Vec::new(),
                max_entries: max_entries.max(1),
            }),
        }
    }

    pub fn key(&self, wtxid: &Hash256, flags: u32) -> Hash256 {
        let mut encoder = Encoder::with_capacity(68);
        encoder.write_bytes(&self.nonce);
        encoder.write_bytes(wtxid);
        encoder.write_u32_le(flags);
        sha256(&encoder.into_inner())
    }

    pub fn contains(&self, key: &Hash256) -> bool {
        self.inner
            .lock()
            .expect("script cache poisoned")
            .set
            .contains(key)
    }

    pub fn insert(&self, key: Hash256) {
        let mut inner = self.inner.lock().expect("script cache poisoned");
        if !inner.set.insert(key) {
            return;
        }
        inner.order.push(key);
        while inner.order.len() > inner.max_entries {
            let victim = rand::thread_rng().gen_range(0..inner.order.len());
            let evicted = inner.order.swap_remove(victim);
            inner.set.remove(&evicted);
        }
    }
}

impl Default for ScriptExecutionCache {
    fn default() -> Self {
        Self::new(DEFAULT_SCRIPT_CACHE_ENTRIES)
    }
}

#[cfg(test)]
mod tests {
    use super::{CheckQueue, ScriptCheck, ScriptExecutionCache};
    use plbd_primitives::{OutPoint, Transaction, TxIn, TxOut};
    use plbd_script::sighash::PrecomputedTxData;
    use std::sync::Arc;

    fn check(script_pubkey: Vec<u8>) -> ScriptCheck {
        let tx = Transaction {
            version: 2,
            time: 0,
            vin: vec![TxIn {
                prevout: OutPoint {
                    hash: [1u8; 32],
                    index: 0,
                },
                script_sig: Vec::new(),
                sequence: TxIn::SEQUENCE_FINAL,
                witness: Vec::new(),
            }],
            vout: vec![TxOut {
                value: 1,
                script_pubkey: Vec::new(),
            }],
            lock_time: 0,
        };
        let txdata = Arc::new(PrecomputedTxData::new(&tx));
        ScriptCheck {
            tx: Arc::new(tx),
            input_index: 0,
            script_pubkey,
            amount: 1,
            flags: 0,
            txdata,
        }
    }

    fn run(worker_count: usize) {
        let queue = CheckQueue::new(worker_count);
        {
            // OP_1 leaves true on the stack.
            let session = queue.session();
            session.push_batch(vec![check(vec![0x51]), check(vec![0x51])]);
            assert!(session.wait());
        }
        {
            // OP_0 leaves false: the batch fails even with passing peers.
            let session = queue.session();
            session.push_batch((0..8).map(|_| check(vec![0x51])).collect());
            session.push_batch(vec![check(vec![0x00])]);
            assert!(!session.wait());
        }
        {
            // Failure state resets per session.
            let session = queue.session();
            session.push_batch(vec![check(vec![0x51])]);
            assert!(session.wait());
        }
        queue.shutdown();
    }

    #[test]
    fn inline_mode_checks() {
        run(0);
    }

    #[test]
    fn worker_pool_checks() {
        run(3);
    }

    #[test]
    fn cache_bounded_with_random_eviction() {
        let cache = ScriptExecutionCache::new(8);
        for tag in 0..64u8 {
            let key = cache.key(&[tag; 32], 0);
            cache.insert(key);
        }
        let cached: usize = (0..64u8)
            .filter(|tag| cache.contains(&cache.key(&[*tag; 32], 0)))
            .count();
        assert!(cached <= 8);

        // Different flags produce different keys.
        assert_ne!(cache.key(&[1u8; 32], 0), cache.key(&[1u8; 32], 1));
    }
}
