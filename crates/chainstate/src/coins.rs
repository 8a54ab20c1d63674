//! The layered UTXO store.
//!
//! Three layers satisfy one capability: the database view at the bottom,
//! the long-lived tip cache above it, and short-lived overlays stacked on
//! the tip cache during block validation. Reads resolve bottom-up and
//! populate the upper layer; flushes push dirty entries down one layer
//! atomically and move the best-block marker last.

use std::collections::HashMap;

use plbd_consensus::Hash256;
use plbd_primitives::{Coin, OutPoint};
use plbd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

pub const COINS_BEST_BLOCK_KEY: &[u8] = b"coins_best_block";
pub const COINS_HEAD_BLOCKS_KEY: &[u8] = b"coins_head_blocks";

#[derive(Debug)]
pub enum CoinViewError {
    Store(String),
    MissingInput,
    Overwrite,
}

impl std::fmt::Display for CoinViewError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoinViewError::Store(message) => write!(f, "{message}"),
            CoinViewError::MissingInput => write!(f, "missing input"),
            CoinViewError::Overwrite => write!(f, "unexpected coin overwrite"),
        }
    }
}

impl std::error::Error for CoinViewError {}

impl From<StoreError> for CoinViewError {
    fn from(err: StoreError) -> Self {
        CoinViewError::Store(err.to_string())
    }
}

/// Dirty entries pushed down one layer. `fresh` marks coins created and
/// never seen by any lower layer; a fresh spent coin cancels out.
#[derive(Debug, Default)]
pub struct CoinFlush {
    pub entries: Vec<(OutPoint, Option<Coin>, bool)>,
    pub best_block: Option<Hash256>,
}

pub trait CoinView {
    fn coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinViewError>;
    fn best_block(&mut self) -> Result<Option<Hash256>, CoinViewError>;
    fn apply(&mut self, flush: CoinFlush) -> Result<(), CoinViewError>;

    fn have(&mut self, outpoint: &OutPoint) -> Result<bool, CoinViewError> {
        Ok(self.coin(outpoint)?.is_some())
    }
}

impl<V: CoinView + ?Sized> CoinView for &mut V {
    fn coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinViewError> {
        (**self).coin(outpoint)
    }
    fn best_block(&mut self) -> Result<Option<Hash256>, CoinViewError> {
        (**self).best_block()
    }
    fn apply(&mut self, flush: CoinFlush) -> Result<(), CoinViewError> {
        (**self).apply(flush)
    }
    fn have(&mut self, outpoint: &OutPoint) -> Result<bool, CoinViewError> {
        (**self).have(outpoint)
    }
}

/// Bottom layer over the coins column.
pub struct CoinsDb<S> {
    store: S,
}

impl<S> CoinsDb<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> CoinsDb<S> {
    /// Stage a flush into a caller-owned batch. The caller is responsible
    /// for the head-block marker discipline around the commit.
    pub fn write_flush(&self, flush: &CoinFlush, batch: &mut WriteBatch) {
        for (outpoint, coin, fresh) in &flush.entries {
            match coin {
                Some(coin) => batch.put(Column::Coins, outpoint.key(), coin.encode()),
                None => {
                    if !fresh {
                        batch.delete(Column::Coins, outpoint.key());
                    }
                }
            }
        }
        if let Some(best) = &flush.best_block {
            batch.put(Column::Meta, COINS_BEST_BLOCK_KEY, best.to_vec());
        }
    }

    /// Record that a flush from `old` to `new` is in flight; cleared by the
    /// same batch that lands the new best-block marker.
    pub fn stage_head_marker(
        &self,
        old: Option<&Hash256>,
        new: &Hash256,
    ) -> Result<(), StoreError> {
        let mut value = Vec::with_capacity(64);
        value.extend_from_slice(old.unwrap_or(&[0u8; 32]));
        value.extend_from_slice(new);
        self.store.put(Column::Meta, COINS_HEAD_BLOCKS_KEY, &value)
    }

    pub fn clear_head_marker(&self, batch: &mut WriteBatch) {
        batch.delete(Column::Meta, COINS_HEAD_BLOCKS_KEY);
    }

    /// Markers left by an interrupted flush: (old tip, new tip).
    pub fn head_blocks(&self) -> Result<Option<(Hash256, Hash256)>, StoreError> {
        let Some(bytes) = self.store.get(Column::Meta, COINS_HEAD_BLOCKS_KEY)? else {
            return Ok(None);
        };
        if bytes.len() != 64 {
            return Err(StoreError::Backend("corrupt head-blocks marker".to_string()));
        }
        let old: Hash256 = bytes[0..32].try_into().expect("length checked");
        let new: Hash256 = bytes[32..64].try_into().expect("length checked");
        Ok(Some((old, new)))
    }
}

impl<S: KeyValueStore> CoinView for CoinsDb<S> {
    fn coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinViewError> {
        match self.store.get(Column::Coins, &outpoint.key())? {
            Some(bytes) => Ok(Some(
                Coin::decode(&bytes).map_err(|err| CoinViewError::Store(err.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    fn best_block(&mut self) -> Result<Option<Hash256>, CoinViewError> {
        match self.store.get(Column::Meta, COINS_BEST_BLOCK_KEY)? {
            Some(bytes) => {
                let hash: Hash256 = bytes
                    .try_into()
                    .map_err(|_| CoinViewError::Store("corrupt best block".to_string()))?;
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    fn apply(&mut self, flush: CoinFlush) -> Result<(), CoinViewError> {
        let old = self.best_block()?;
        if let Some(new) = &flush.best_block {
            self.stage_head_marker(old.as_ref(), new)?;
        }
        let mut batch = WriteBatch::new();
        self.write_flush(&flush, &mut batch);
        self.clear_head_marker(&mut batch);
        self.store.write_batch(&batch)?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct CacheEntry {
    coin: Option<Coin>,
    dirty: bool,
    fresh: bool,
}

/// Middle and top layers: a write-back cache over any parent view.
pub struct CoinCache<P> {
    parent: P,
    entries: HashMap<OutPoint, CacheEntry>,
    best: Option<Hash256>,
    cached_bytes: usize,
}

impl<P: CoinView> CoinCache<P> {
    pub fn new(parent: P) -> Self {
        Self {
            parent,
            entries: HashMap::new(),
            best: None,
            cached_bytes: 0,
        }
    }

    pub fn parent_mut(&mut self) -> &mut P {
        &mut self.parent
    }

    /// Approximate bytes held by cached coins, for the flush budget.
    pub fn memory_usage(&self) -> usize {
        self.cached_bytes + self.entries.len() * 64
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn set_best_block(&mut self, hash: Hash256) {
        self.best = Some(hash);
    }

    /// Insert a new coin. `allow_overwrite` admits re-creation of an
    /// existing unspent coin (only valid during replay); the result says
    /// whether an overwrite actually happened.
    pub fn add(
        &mut self,
        outpoint: OutPoint,
        coin: Coin,
        allow_overwrite: bool,
    ) -> Result<bool, CoinViewError> {
        let existing = self.coin(&outpoint)?;
        let overwrote = existing.is_some();
        if overwrote && !allow_overwrite {
            return Err(CoinViewError::Overwrite);
        }
        // Fresh iff no layer below holds a version that must be deleted:
        // the read-through entry is spent and carries no pending write.
        let fresh = match self.entries.get(&outpoint) {
            Some(entry) => entry.coin.is_none() && !entry.dirty,
            None => false,
        };
        self.cached_bytes += coin.memory_usage();
        if let Some(previous) = existing {
            self.cached_bytes = self.cached_bytes.saturating_sub(previous.memory_usage());
        }
        self.entries.insert(
            outpoint,
            CacheEntry {
                coin: Some(coin),
                dirty: true,
                fresh,
            },
        );
        Ok(overwrote)
    }

    /// Remove a coin, returning its previous value for the undo record.
    pub fn spend(&mut self, outpoint: &OutPoint) -> Result<Coin, CoinViewError> {
        let coin = self.coin(outpoint)?.ok_or(CoinViewError::MissingInput)?;
        self.cached_bytes = self.cached_bytes.saturating_sub(coin.memory_usage());
        let entry = self
            .entries
            .get_mut(outpoint)
            .expect("read-through populated entry");
        if entry.fresh {
            self.entries.remove(outpoint);
        } else {
            entry.coin = None;
            entry.dirty = true;
        }
        Ok(coin)
    }

    /// Drain dirty entries and the best-block marker for the parent.
    pub fn take_flush(&mut self) -> CoinFlush {
        let mut flush = CoinFlush {
            entries: Vec::new(),
            best_block: self.best.take(),
        };
        for (outpoint, entry) in self.entries.drain() {
            if !entry.dirty {
                continue;
            }
            if entry.fresh && entry.coin.is_none() {
                continue;
            }
            flush.entries.push((outpoint, entry.coin, entry.fresh));
        }
        self.cached_bytes = 0;
        flush
    }

    /// Atomically push every dirty entry into the parent and clear.
    pub fn flush(&mut self) -> Result<(), CoinViewError> {
        let flush = self.take_flush();
        if flush.entries.is_empty() && flush.best_block.is_none() {
            return Ok(());
        }
        self.parent.apply(flush)
    }

    /// Drop all cached state, dirty or not.
    pub fn discard(&mut self) {
        self.entries.clear();
        self.best = None;
        self.cached_bytes = 0;
    }

    /// Forget a clean cached entry, releasing memory without a flush.
    pub fn uncache(&mut self, outpoint: &OutPoint) {
        if let Some(entry) = self.entries.get(outpoint) {
            if !entry.dirty {
                if let Some(coin) = &entry.coin {
                    self.cached_bytes = self.cached_bytes.saturating_sub(coin.memory_usage());
                }
                self.entries.remove(outpoint);
            }
        }
    }
}

impl<P: CoinView> CoinView for CoinCache<P> {
    fn coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, CoinViewError> {
        if let Some(entry) = self.entries.get(outpoint) {
            return Ok(entry.coin.clone());
        }
        let coin = self.parent.coin(outpoint)?;
        if let Some(coin) = &coin {
            self.cached_bytes += coin.memory_usage();
        }
        self.entries.insert(
            *outpoint,
            CacheEntry {
                coin: coin.clone(),
                dirty: false,
                fresh: false,
            },
        );
        Ok(coin)
    }

    fn best_block(&mut self) -> Result<Option<Hash256>, CoinViewError> {
        if let Some(best) = self.best {
            return Ok(Some(best));
        }
        self.parent.best_block()
    }

    fn apply(&mut self, flush: CoinFlush) -> Result<(), CoinViewError> {
        for (outpoint, coin, child_fresh) in flush.entries {
            match self.entries.get_mut(&outpoint) {
                None => {
                    if let Some(coin) = &coin {
                        self.cached_bytes += coin.memory_usage();
                    }
                    self.entries.insert(
                        outpoint,
                        CacheEntry {
                            coin,
                            dirty: true,
                            fresh: child_fresh,
                        },
                    );
                }
                Some(entry) => {
                    if let Some(previous) = &entry.coin {
                        self.cached_bytes =
                            self.cached_bytes.saturating_sub(previous.memory_usage());
                    }
                    if coin.is_none() && entry.fresh {
                        self.entries.remove(&outpoint);
                    } else {
                        if let Some(coin) = &coin {
                            self.cached_bytes += coin.memory_usage();
                        }
                        entry.coin = coin;
                        entry.dirty = true;
                    }
                }
            }
        }
        if let Some(best) = flush.best_block {
            self.best = Some(best);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{CoinCache, CoinView, CoinViewError, CoinsDb};
    use plbd_primitives::{Coin, OutPoint};
    use plbd_storage::memory::MemoryStore;
    use std::sync::Arc;

    fn coin(value: i64) -> Coin {
        Coin {
            value,
            script_pubkey: vec![0x51],
            height: 1,
            is_coinbase: false,
            is_coinstake: false,
            time: 0,
        }
    }

    fn outpoint(tag: u8) -> OutPoint {
        OutPoint {
            hash: [tag; 32],
            index: 0,
        }
    }

    #[test]
    fn add_spend_flush_roundtrip() {
        let store = Arc::new(MemoryStore::new());
        let mut db = CoinsDb::new(Arc::clone(&store));
        let mut tip = CoinCache::new(&mut db);

        tip.add(outpoint(1), coin(100), false).expect("add");
        tip.add(outpoint(2), coin(200), false).expect("add");
        tip.set_best_block([0xaa; 32]);
        tip.flush().expect("flush");

        let mut fresh = CoinsDb::new(store);
        assert_eq!(fresh.coin(&outpoint(1)).expect("read").unwrap().value, 100);
        assert_eq!(fresh.best_block().expect("best"), Some([0xaa; 32]));
    }

    #[test]
    fn fresh_spent_coin_never_reaches_parent() {
        let store = Arc::new(MemoryStore::new());
        let mut db = CoinsDb::new(Arc::clone(&store));
        let mut tip = CoinCache::new(&mut db);

        tip.add(outpoint(1), coin(100), false).expect("add");
        let spent = tip.spend(&outpoint(1)).expect("spend");
        assert_eq!(spent.value, 100);
        tip.set_best_block([0xbb; 32]);
        tip.flush().expect("flush");

        let mut fresh = CoinsDb::new(store);
        assert_eq!(fresh.coin(&outpoint(1)).expect("read"), None);
    }

    #[test]
    fn overlay_spend_commits_into_tip_on_flush_only() {
        let store = Arc::new(MemoryStore::new());
        let mut db = CoinsDb::new(Arc::clone(&store));
        let mut tip = CoinCache::new(&mut db);
        tip.add(outpoint(1), coin(100), false).expect("add");

        {
            let mut overlay = CoinCache::new(&mut tip);
            overlay.spend(&outpoint(1)).expect("spend");
            overlay.add(outpoint(2), coin(50), false).expect("add");
            // Dropped without flush: the tip is unchanged.
            overlay.discard();
        }
        assert!(tip.have(&outpoint(1)).expect("have"));
        assert!(!tip.have(&outpoint(2)).expect("have"));

        {
            let mut overlay = CoinCache::new(&mut tip);
            overlay.spend(&outpoint(1)).expect("spend");
            overlay.add(outpoint(2), coin(50), false).expect("add");
            overlay.flush().expect("flush");
        }
        assert!(!tip.have(&outpoint(1)).expect("have"));
        assert!(tip.have(&outpoint(2)).expect("have"));
    }

    #[test]
    fn double_add_requires_overwrite_permission() {
        let store = MemoryStore::new();
        let mut db = CoinsDb::new(store);
        let mut tip = CoinCache::new(&mut db);
        tip.add(outpoint(1), coin(100), false).expect("add");
        let err = tip.add(outpoint(1), coin(100), false).unwrap_err();
        assert!(matches!(err, CoinViewError::Overwrite));
        let overwrote = tip.add(outpoint(1), coin(150), true).expect("overwrite");
        assert!(overwrote);
    }

    #[test]
    fn missing_input_reported() {
        let store = MemoryStore::new();
        let mut db = CoinsDb::new(store);
        let mut tip = CoinCache::new(&mut db);
        let err = tip.spend(&outpoint(9)).unwrap_err();
        assert!(matches!(err, CoinViewError::MissingInput));
    }
}
