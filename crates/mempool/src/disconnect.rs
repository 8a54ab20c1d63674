//! Transactions orphaned by a reorg, parked for re-admission.
//!
//! Blocks disconnect tip-first and push their transactions in reverse
//! block order; draining in reverse insertion order therefore hands
//! parents back before children.

use std::collections::{HashSet, VecDeque};

use plbd_consensus::constants::MAX_DISCONNECT_POOL_BYTES;
use plbd_consensus::Hash256;
use plbd_primitives::Transaction;

pub struct DisconnectPool {
    queue: VecDeque<(Hash256, Transaction)>,
    members: HashSet<Hash256>,
    bytes: usize,
    max_bytes: usize,
}

impl Default for DisconnectPool {
    fn default() -> Self {
        Self::new(MAX_DISCONNECT_POOL_BYTES)
    }
}

impl DisconnectPool {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            members: HashSet::new(),
            bytes: 0,
            max_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.members.contains(txid)
    }

    /// Park one disconnected block's transactions (coinbase and
    /// coinstake excluded by the caller), given in reverse block order.
    /// When the byte bound overflows, the oldest entries fall off.
    pub fn add_disconnected(&mut self, txs: impl IntoIterator<Item = Transaction>) {
        for tx in txs {
            let txid = tx.txid();
            if !self.members.insert(txid) {
                continue;
            }
            self.bytes += tx.total_size();
            self.queue.push_back((txid, tx));
        }
        while self.bytes > self.max_bytes {
            let Some((txid, tx)) = self.queue.pop_front() else {
                break;
            };
            self.members.remove(&txid);
            self.bytes -= tx.total_size();
        }
    }

    /// Drain for re-admission: newest insertion first, which is
    /// parent-before-child across the disconnected blocks.
    pub fn drain_for_readmission(&mut self) -> Vec<Transaction> {
        self.members.clear();
        self.bytes = 0;
        let mut txs: Vec<Transaction> = self.queue.drain(..).map(|(_, tx)| tx).collect();
        txs.reverse();
        txs
    }
}

#[cfg(test)]
mod tests {
    use super::DisconnectPool;
    use plbd_primitives::{OutPoint, Transaction, TxIn, TxOut};

    fn tx(tag: u8) -> Transaction {
        Transaction {
            version: 2,
            time: tag as u32,
            vin: vec![TxIn {
                prevout: OutPoint {
                    hash: [tag; 32],
                    index: 0,
                },
                script_sig: Vec::new(),
                sequence: TxIn::SEQUENCE_FINAL,
                witness: Vec::new(),
            }],
            vout: vec![TxOut {
                value: 1,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn drain_order_is_reverse_of_insertion() {
        let mut pool = DisconnectPool::new(1 << 20);
        // Disconnecting two blocks: the tip block's txs arrive first.
        pool.add_disconnected(vec![tx(3), tx(2)]);
        pool.add_disconnected(vec![tx(1), tx(0)]);
        let drained = pool.drain_for_readmission();
        let tags: Vec<u8> = drained.iter().map(|tx| tx.time as u8).collect();
        assert_eq!(tags, vec![0, 1, 2, 3]);
        assert!(pool.is_empty());
        assert_eq!(pool.bytes(), 0);
    }

    #[test]
    fn byte_bound_sheds_oldest() {
        let size = tx(0).total_size();
        let mut pool = DisconnectPool::new(size * 2);
        pool.add_disconnected(vec![tx(1)]);
        pool.add_disconnected(vec![tx(2)]);
        pool.add_disconnected(vec![tx(3)]);
        assert_eq!(pool.len(), 2);
        assert!(!pool.contains(&tx(1).txid()));
        assert!(pool.contains(&tx(3).txid()));
    }
}
