//! The chain controller.
//!
//! One `ChainState` per node owns the block index, the active chain, the
//! coin and token caches, the mempool and the disk layout. Every public
//! operation takes the chain lock; the mempool has an inner lock acquired
//! after it. Script check workers run outside both locks on task-local
//! data.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use plbd_consensus::constants::{
    ACTIVATE_CONNECT_BATCH, COINBASE_MATURITY, DEFAULT_MAX_MEMPOOL_BYTES,
    DEFAULT_MEMPOOL_EXPIRY_SECS, DEFAULT_MIN_RELAY_FEE_PER_KB, MAX_BLOCK_SIGOPS_COST,
    MAX_FUTURE_BLOCK_TIME, MAX_REORG_DEPTH, MEDIAN_TIME_SPAN, MIN_BLOCKS_TO_KEEP,
    MIN_BLOCK_VERSION, OFFLINE_STAKING_VERSION_MASK, WITNESS_SCALE_FACTOR,
};
use plbd_consensus::params::ChainParams;
use plbd_consensus::rewards::block_subsidy;
use plbd_consensus::{hash256_to_hex, Hash256};
use plbd_mempool::{
    AcceptContext, AcceptOutcome, DisconnectPool, Mempool, MempoolError, MempoolErrorKind,
    PoolCoins, ScriptCacheHook, TokenGate,
};
use plbd_pos::kernel::{check_kernel_target, next_stake_modifier};
use plbd_pos::validation as pos_validation;
use plbd_pow::difficulty::{block_proof, next_target_required, HeaderInfo};
use plbd_primitives::block::{Block, BlockHeader};
use plbd_primitives::{Coin, OutPoint, Transaction, TxOut};
use plbd_script::opcodes::OP_RETURN;
use plbd_script::sighash::PrecomputedTxData;
use plbd_script::standard::legacy_sigop_count;
use plbd_script::MANDATORY_SCRIPT_VERIFY_FLAGS;
use plbd_storage::{Column, KeyValueStore, WriteBatch};
use plbd_tokens::{parse_token_script, TokenCache, TokenView, TokensDb};
use primitive_types::U256;
use rayon::prelude::*;

use crate::blockindex::{status, BlockIndex, Handle, IndexEntry};
use crate::coins::{CoinCache, CoinView, CoinsDb};
use crate::flatfiles::{FileLocation, FlatFileError, FlatFileInfo, FlatFileStore};
use crate::genesis::genesis_block;
use crate::governance::{decode_governance_op, GovernanceCache};
use crate::indexing::{
    write_flag, AddressIndex, SpentIndex, SpentIndexValue, TimestampIndex, TxIndex, TxLocation,
    FLAG_ADDRESSINDEX, FLAG_PRUNED, FLAG_SPENTINDEX, FLAG_TIMESTAMPINDEX, FLAG_TOKENINDEX,
    FLAG_TXINDEX,
};
use crate::metrics::ConnectMetrics;
use crate::scriptcheck::{CheckQueue, ScriptCheck, ScriptExecutionCache};
use crate::tokenops::{apply_token_tx, undo_token_ops};
use crate::undo::{undo_checksum, BlockUndo, TxUndo};
use crate::validation::{
    check_block, contextual_check_block, ChainError, REJECT_DUPLICATE, REJECT_INVALID,
    REJECT_OBSOLETE,
};

const DIFFICULTY_WINDOW: usize = 2_102;
const VERIFY_ROLLBACK_DEPTH: usize = 6;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ChainTip {
    pub hash: Hash256,
    pub height: i32,
    pub work: U256,
}

#[derive(Clone, Debug)]
pub struct ChainStateConfig {
    pub data_dir: PathBuf,
    pub script_workers: usize,
    pub coin_cache_bytes: usize,
    pub max_flatfile_size: u64,
    pub prune_target_bytes: Option<u64>,
    pub require_standard: bool,
    pub min_relay_fee_per_kb: i64,
    pub mempool_max_bytes: usize,
    pub mempool_expiry_secs: u64,
    pub check_pow: bool,
    pub flush_interval: Duration,
}

impl Default for ChainStateConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            script_workers: 0,
            coin_cache_bytes: 256 * 1024 * 1024,
            max_flatfile_size: 128 * 1024 * 1024,
            prune_target_bytes: None,
            require_standard: true,
            min_relay_fee_per_kb: DEFAULT_MIN_RELAY_FEE_PER_KB,
            mempool_max_bytes: DEFAULT_MAX_MEMPOOL_BYTES,
            mempool_expiry_secs: DEFAULT_MEMPOOL_EXPIRY_SECS,
            check_pow: true,
            flush_interval: Duration::from_secs(60 * 10),
        }
    }
}

struct Inner<S> {
    index: BlockIndex,
    /// Active chain by height; `active[h]` is the handle at height `h`.
    active: Vec<Handle>,
    coins: CoinCache<CoinsDb<Arc<S>>>,
    tokens: TokenCache<TokensDb<Arc<S>>>,
    block_file_info: HashMap<u32, FlatFileInfo>,
    undo_file_info: HashMap<u32, FlatFileInfo>,
    dirty_block_files: Vec<u32>,
    dirty_undo_files: Vec<u32>,
    pruned: bool,
    last_flush: Instant,
}

impl<S> Inner<S> {
    fn tip_handle(&self) -> Option<Handle> {
        self.active.last().copied()
    }
}

struct MempoolState {
    pool: Mempool,
    disconnect: DisconnectPool,
}

pub struct ChainState<S> {
    store: Arc<S>,
    params: ChainParams,
    config: ChainStateConfig,
    blocks: FlatFileStore,
    undo_files: FlatFileStore,
    script_queue: CheckQueue,
    script_cache: ScriptExecutionCache,
    metrics: ConnectMetrics,
    shutdown: Arc<AtomicBool>,
    inner: Mutex<Inner<S>>,
    mempool: Mutex<MempoolState>,
}

enum DisconnectResult {
    Clean,
    Unclean,
    Failed(&'static str),
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

/// Outputs that never enter the UTXO set: provably unspendable data
/// carriers and the empty marker slot of a coinstake.
fn is_unspendable(output: &TxOut) -> bool {
    output.script_pubkey.first() == Some(&OP_RETURN) || output.is_empty()
}

fn block_file_key(file_id: u32) -> [u8; 5] {
    let mut key = [b'b', 0, 0, 0, 0];
    key[1..5].copy_from_slice(&file_id.to_be_bytes());
    key
}

fn undo_file_key(file_id: u32) -> [u8; 5] {
    let mut key = [b'u', 0, 0, 0, 0];
    key[1..5].copy_from_slice(&file_id.to_be_bytes());
    key
}

impl<S: KeyValueStore + 'static> ChainState<S> {
    pub fn new(
        store: Arc<S>,
        mut params: ChainParams,
        config: ChainStateConfig,
    ) -> Result<Self, ChainError> {
        let genesis = genesis_block(&params);
        params.consensus.hash_genesis_block = genesis.header.hash();

        let blocks_dir = config.data_dir.join("blocks");
        let blocks = FlatFileStore::open(
            &blocks_dir,
            "blk",
            params.disk_magic,
            config.max_flatfile_size,
        )?;
        let undo_files = FlatFileStore::open(
            &blocks_dir,
            "rev",
            params.disk_magic,
            config.max_flatfile_size,
        )?;

        let coins = CoinCache::new(CoinsDb::new(Arc::clone(&store)));
        let tokens = TokenCache::new(TokensDb::new(Arc::clone(&store)));
        let mempool = Mempool::new(config.mempool_max_bytes, config.mempool_expiry_secs);

        let state = Self {
            script_queue: CheckQueue::new(config.script_workers),
            script_cache: ScriptExecutionCache::default(),
            metrics: ConnectMetrics::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
            inner: Mutex::new(Inner {
                index: BlockIndex::new(),
                active: Vec::new(),
                coins,
                tokens,
                block_file_info: HashMap::new(),
                undo_file_info: HashMap::new(),
                dirty_block_files: Vec::new(),
                dirty_undo_files: Vec::new(),
                pruned: false,
                last_flush: Instant::now(),
            }),
            mempool: Mutex::new(MempoolState {
                pool: mempool,
                disconnect: DisconnectPool::default(),
            }),
            store,
            params,
            config,
            blocks,
            undo_files,
        };

        {
            let mut inner = state.lock_inner();
            state.load_index(&mut inner)?;
            state.load_file_info(&mut inner)?;
            if inner.index.is_empty() {
                state.seed_genesis(&mut inner, &genesis)?;
            }
            state.replay_blocks(&mut inner)?;
            state.load_active_chain(&mut inner)?;
        }
        state.activate_best_chain()?;
        Ok(state)
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner<S>> {
        self.inner.lock().expect("chain lock poisoned")
    }

    fn lock_mempool(&self) -> MutexGuard<'_, MempoolState> {
        self.mempool.lock().expect("mempool lock poisoned")
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn metrics(&self) -> &ConnectMetrics {
        &self.metrics
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn tip_info(&self, inner: &Inner<S>) -> Option<ChainTip> {
        let handle = inner.tip_handle()?;
        let entry = inner.index.get(handle);
        Some(ChainTip {
            hash: entry.hash,
            height: entry.height,
            work: entry.work,
        })
    }

    pub fn best_block(&self) -> Option<ChainTip> {
        let inner = self.lock_inner();
        self.tip_info(&inner)
    }

    pub fn best_header(&self) -> Option<ChainTip> {
        let inner = self.lock_inner();
        let handle = inner.index.best_header()?;
        let entry = inner.index.get(handle);
        Some(ChainTip {
            hash: entry.hash,
            height: entry.height,
            work: entry.work,
        })
    }

    pub fn block_hash_at_height(&self, height: i32) -> Option<Hash256> {
        let inner = self.lock_inner();
        let handle = *inner.active.get(height.max(0) as usize)?;
        Some(inner.index.get(handle).hash)
    }

    pub fn read_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainError> {
        let location = {
            let inner = self.lock_inner();
            let Some(handle) = inner.index.lookup(hash) else {
                return Ok(None);
            };
            let entry = inner.index.get(handle);
            let Some(location) = entry.block_loc else {
                if inner.pruned {
                    return Err(ChainError::System(format!(
                        "block {} has been pruned",
                        hash256_to_hex(hash)
                    )));
                }
                return Ok(None);
            };
            location
        };
        let bytes = self.blocks.read(location)?;
        let block = Block::consensus_decode(&bytes)
            .map_err(|_| ChainError::System("corrupt block bytes on disk".to_string()))?;
        Ok(Some(block))
    }

    pub fn tx_location(&self, txid: &Hash256) -> Result<Option<TxLocation>, ChainError> {
        Ok(TxIndex::new(Arc::clone(&self.store)).get(txid)?)
    }

    // ------------------------------------------------------------------
    // Startup

    fn load_index(&self, inner: &mut Inner<S>) -> Result<(), ChainError> {
        let rows = self.store.scan_prefix(Column::BlockIndex, &[])?;
        if rows.is_empty() {
            return Ok(());
        }
        let mut decoded = Vec::with_capacity(rows.len());
        for (_, value) in rows {
            let entry = IndexEntry::decode(&value)
                .map_err(|err| ChainError::System(format!("corrupt block index: {err}")))?;
            decoded.push(entry);
        }
        decoded.sort_by_key(|entry| entry.height);
        for entry in decoded {
            let prev = if entry.height == 0 {
                None
            } else {
                match inner.index.lookup(&entry.header.prev_block) {
                    Some(prev) => Some(prev),
                    None => {
                        eprintln!(
                            "orphan block index entry {} dropped on load",
                            hash256_to_hex(&entry.hash)
                        );
                        continue;
                    }
                }
            };
            let work = block_proof(entry.header.bits)
                .map_err(|_| ChainError::System("corrupt header bits in index".to_string()))?;
            let handle = inner.index.insert(
                entry.header.clone(),
                prev,
                work,
                entry.proof_of_stake,
                entry.stake_modifier,
            );
            inner.index.modify(handle, |loaded| {
                loaded.status = entry.status;
                loaded.tx_count = entry.tx_count;
                loaded.block_loc = entry.block_loc;
                loaded.undo_loc = entry.undo_loc;
            });
            if entry.status & status::HAVE_DATA != 0 && entry.tx_count > 0 {
                inner.index.connect_block_data(handle, entry.tx_count);
            }
        }
        // The load marked everything dirty; the on-disk image is current.
        inner.index.take_dirty();
        Ok(())
    }

    fn load_file_info(&self, inner: &mut Inner<S>) -> Result<(), ChainError> {
        for (key, value) in self.store.scan_prefix(Column::FileInfo, &[])? {
            if key.len() != 5 {
                continue;
            }
            let file_id = u32::from_be_bytes(key[1..5].try_into().expect("length checked"));
            let info = FlatFileInfo::decode(&value)
                .map_err(|err| ChainError::System(format!("corrupt file info: {err}")))?;
            match key[0] {
                b'b' => {
                    inner.block_file_info.insert(file_id, info);
                }
                b'u' => {
                    inner.undo_file_info.insert(file_id, info);
                }
                _ => {}
            }
        }
        inner.pruned = crate::indexing::read_flag(&*self.store, FLAG_PRUNED)?;
        Ok(())
    }

    fn seed_genesis(&self, inner: &mut Inner<S>, genesis: &Block) -> Result<(), ChainError> {
        let work = block_proof(genesis.header.bits)
            .map_err(|_| ChainError::System("invalid genesis bits".to_string()))?;
        let handle = inner
            .index
            .insert(genesis.header.clone(), None, work, false, [0u8; 32]);
        let bytes = genesis.consensus_encode();
        let location = self.blocks.append(&bytes, None)?;
        self.record_block_file(inner, location, 0, genesis.header.time, bytes.len());
        inner.index.modify(handle, |entry| {
            entry.block_loc = Some(location);
        });
        inner.index.raise_validity(handle, status::VALID_TRANSACTIONS);
        inner
            .index
            .connect_block_data(handle, genesis.transactions.len() as u32);
        Ok(())
    }

    fn load_active_chain(&self, inner: &mut Inner<S>) -> Result<(), ChainError> {
        let best = inner.coins.best_block()?;
        let Some(best) = best else {
            return Ok(());
        };
        let Some(mut walk) = inner.index.lookup(&best) else {
            return Err(ChainError::System(
                "coin database best block missing from index".to_string(),
            ));
        };
        let mut chain = Vec::with_capacity(inner.index.get(walk).height as usize + 1);
        loop {
            chain.push(walk);
            match inner.index.get(walk).prev {
                Some(prev) => walk = prev,
                None => break,
            }
        }
        chain.reverse();
        inner.active = chain;
        if let Some(tip) = inner.tip_handle() {
            inner.index.add_candidate(tip);
        }
        Ok(())
    }

    /// Heal an interrupted coin flush: roll the UTXO set from the stale
    /// marker to the intended one, overwrites permitted.
    fn replay_blocks(&self, inner: &mut Inner<S>) -> Result<(), ChainError> {
        let marker = inner.coins.parent_mut().head_blocks()?;
        let Some((old, new)) = marker else {
            return Ok(());
        };
        eprintln!("interrupted chainstate flush detected; replaying blocks");
        let new_handle = inner.index.lookup(&new).ok_or_else(|| {
            ChainError::System("replay target missing from block index".to_string())
        })?;
        let old_handle = if old == [0u8; 32] {
            None
        } else {
            inner.index.lookup(&old)
        };

        let fork = old_handle.map(|old_handle| inner.index.find_fork(old_handle, new_handle));

        // Walk back from the old head, reverting its side of the fork.
        if let (Some(mut walk), Some(fork)) = (old_handle, fork) {
            while walk != fork {
                if self.shutdown_requested() {
                    return Ok(());
                }
                let entry = inner.index.get(walk).clone();
                let block = self.read_block_at(&entry)?;
                let undo = self.read_undo(&entry)?;
                let Inner { coins, tokens, .. } = &mut *inner;
                let mut coin_overlay = CoinCache::new(&mut *coins);
                let mut token_overlay = TokenCache::new(&mut *tokens);
                for (tx_index, tx) in block.transactions.iter().enumerate().rev() {
                    let txid = tx.txid();
                    for (out_index, output) in tx.vout.iter().enumerate().rev() {
                        if is_unspendable(output) {
                            continue;
                        }
                        let outpoint = OutPoint {
                            hash: txid,
                            index: out_index as u32,
                        };
                        let _ = coin_overlay.spend(&outpoint);
                    }
                    if tx_index > 0 {
                        if let Some(tx_undo) = undo.tx_undos.get(tx_index - 1) {
                            for (outpoint, coin) in tx_undo.spent.iter().rev() {
                                let _ = coin_overlay.add(*outpoint, coin.clone(), true);
                            }
                        }
                    }
                }
                undo_token_ops(&mut token_overlay, &undo.token_ops)?;
                coin_overlay.set_best_block(entry.header.prev_block);
                coin_overlay.flush()?;
                token_overlay.flush()?;
                walk = entry.prev.ok_or_else(|| {
                    ChainError::System("replay walked past genesis".to_string())
                })?;
            }
        }

        // Roll forward to the new head, reapplying UTXO effects.
        let mut path = Vec::new();
        let mut walk = new_handle;
        loop {
            if Some(walk) == fork {
                break;
            }
            path.push(walk);
            match inner.index.get(walk).prev {
                Some(prev) => walk = prev,
                None => break,
            }
        }
        path.reverse();
        for handle in path {
            if self.shutdown_requested() {
                return Ok(());
            }
            let entry = inner.index.get(handle).clone();
            let block = self.read_block_at(&entry)?;
            let Inner { coins, tokens, .. } = &mut *inner;
            let mut coin_overlay = CoinCache::new(&mut *coins);
            let mut token_overlay = TokenCache::new(&mut *tokens);
            for (tx_index, tx) in block.transactions.iter().enumerate() {
                let txid = tx.txid();
                if tx_index > 0 {
                    for input in &tx.vin {
                        let _ = coin_overlay.spend(&input.prevout);
                    }
                }
                for (out_index, output) in tx.vout.iter().enumerate() {
                    if is_unspendable(output) {
                        continue;
                    }
                    let outpoint = OutPoint {
                        hash: txid,
                        index: out_index as u32,
                    };
                    coin_overlay.add(
                        outpoint,
                        Coin {
                            value: output.value,
                            script_pubkey: output.script_pubkey.clone(),
                            height: entry.height as u32,
                            is_coinbase: tx_index == 0,
                            is_coinstake: tx.is_coinstake(),
                            time: tx.time,
                        },
                        true,
                    )?;
                }
            }
            coin_overlay.set_best_block(entry.hash);
            coin_overlay.flush()?;
            token_overlay.flush()?;
        }

        // Land the healed state and clear the marker.
        let coin_flush = inner.coins.take_flush();
        let token_flush = inner.tokens.take_flush();
        let mut batch = WriteBatch::new();
        inner.coins.parent_mut().write_flush(&coin_flush, &mut batch);
        TokensDb::new(Arc::clone(&self.store)).write_flush(&token_flush, &mut batch);
        inner.coins.parent_mut().clear_head_marker(&mut batch);
        self.store.write_batch(&batch)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Header and block acceptance

    pub fn accept_header(&self, header: &BlockHeader) -> Result<Hash256, ChainError> {
        let mut inner = self.lock_inner();
        let handle = self.accept_header_inner(&mut inner, header, now_secs())?;
        Ok(inner.index.get(handle).hash)
    }

    fn accept_header_inner(
        &self,
        inner: &mut Inner<S>,
        header: &BlockHeader,
        now: i64,
    ) -> Result<Handle, ChainError> {
        let hash = header.hash();
        if let Some(handle) = inner.index.lookup(&hash) {
            if inner.index.get(handle).failed() {
                return Err(ChainError::invalid(REJECT_DUPLICATE, "duplicate-invalid"));
            }
            return Ok(handle);
        }

        let consensus = &self.params.consensus;
        let is_genesis =
            header.prev_block == [0u8; 32] && hash == consensus.hash_genesis_block;
        let prev = if is_genesis {
            None
        } else {
            let prev = inner
                .index
                .lookup(&header.prev_block)
                .ok_or(ChainError::MissingPrev)?;
            if inner.index.get(prev).failed() {
                return Err(ChainError::invalid(REJECT_INVALID, "bad-prevblk"));
            }
            Some(prev)
        };
        let height = prev.map(|prev| inner.index.get(prev).height + 1).unwrap_or(0);

        // Target bounds; whether the proof is work or stake is known only
        // once the block body arrives, and both limits coincide.
        pow_validation_bounds(header, consensus)?;
        if header.height != height as u32 {
            return Err(ChainError::invalid(REJECT_INVALID, "bad-header-height"));
        }

        if let Some(prev) = prev {
            let mtp = self.median_time_past(&inner.index, prev);
            if (header.time as i64) <= mtp {
                return Err(ChainError::invalid(REJECT_INVALID, "time-too-old"));
            }
            if header.time as i64 > now + MAX_FUTURE_BLOCK_TIME {
                return Err(ChainError::invalid(REJECT_INVALID, "time-too-new"));
            }
            if header.version < MIN_BLOCK_VERSION {
                return Err(ChainError::invalid(
                    REJECT_OBSOLETE,
                    format!("bad-version(0x{:08x})", header.version),
                ));
            }
            if height >= consensus.offline_staking_height
                && header.version & OFFLINE_STAKING_VERSION_MASK == 0
            {
                return Err(ChainError::invalid(
                    REJECT_OBSOLETE,
                    format!("bad-version(0x{:08x})", header.version),
                ));
            }

            if let Some(checkpoint) = consensus
                .checkpoints
                .iter()
                .find(|checkpoint| checkpoint.height == height)
            {
                if checkpoint.hash != hash {
                    return Err(ChainError::invalid(REJECT_INVALID, "checkpoint mismatch"));
                }
            }

            if let Some(tip) = inner.tip_handle() {
                let fork_height = height - 1;
                if inner.index.get(tip).height - fork_height > MAX_REORG_DEPTH {
                    return Err(ChainError::invalid(
                        REJECT_INVALID,
                        "forked chain older than max reorganization depth",
                    ));
                }
            }
        }

        let work = block_proof(header.bits)
            .map_err(|_| ChainError::invalid(REJECT_INVALID, "bad-diffbits"))?;
        let stake_modifier = match prev {
            Some(prev) => next_stake_modifier(&inner.index.get(prev).stake_modifier, &hash),
            None => [0u8; 32],
        };
        let handle = inner
            .index
            .insert(header.clone(), prev, work, false, stake_modifier);
        Ok(handle)
    }

    /// Accept a block's data. `Ok(true)` means the block was stored and
    /// may extend the best chain; `Ok(false)` means it was ignored
    /// (unrequested and too far from the tip or below minimum work).
    pub fn accept_block(&self, block: &Block, requested: bool) -> Result<bool, ChainError> {
        let stored = {
            let mut inner = self.lock_inner();
            self.accept_block_inner(&mut inner, block, requested, now_secs())?
        };
        if stored {
            self.activate_best_chain()?;
        }
        Ok(stored)
    }

    fn accept_block_inner(
        &self,
        inner: &mut Inner<S>,
        block: &Block,
        requested: bool,
        now: i64,
    ) -> Result<bool, ChainError> {
        let handle = self.accept_header_inner(inner, &block.header, now)?;
        if inner.index.get(handle).have_data() {
            return Err(ChainError::Duplicate);
        }
        let height = inner.index.get(handle).height;

        if !requested {
            if let Some(tip) = inner.tip_handle() {
                let tip_height = inner.index.get(tip).height;
                if height > tip_height + MIN_BLOCKS_TO_KEEP {
                    return Ok(false);
                }
            }
            let min_work = U256::from_big_endian(&self.params.consensus.min_chain_work);
            if inner.index.get(handle).work < min_work {
                return Ok(false);
            }
        }

        let consensus = &self.params.consensus;
        if let Err(err) = check_block(block, consensus, self.config.check_pow) {
            if let ChainError::Invalid(verdict) = &err {
                if !verdict.corruption_possible {
                    inner.index.mark_failed(handle);
                }
            }
            return Err(err);
        }
        let mtp = match inner.index.get(handle).prev {
            Some(prev) => self.median_time_past(&inner.index, prev),
            None => 0,
        };
        if let Err(err) = contextual_check_block(block, height, mtp, now, consensus) {
            if matches!(&err, ChainError::Invalid(v) if !v.corruption_possible) {
                inner.index.mark_failed(handle);
            }
            return Err(err);
        }

        let bytes = block.consensus_encode();
        let location = self.blocks.append(&bytes, None)?;
        self.record_block_file(inner, location, height, block.header.time, bytes.len());

        let has_witness = block.transactions.iter().any(|tx| tx.has_witness());
        let proof_of_stake = block.is_proof_of_stake();
        inner.index.modify(handle, |entry| {
            entry.block_loc = Some(location);
            entry.proof_of_stake = proof_of_stake;
            if has_witness {
                entry.status |= status::OPT_WITNESS;
            }
        });
        inner.index.raise_validity(handle, status::VALID_TRANSACTIONS);
        inner
            .index
            .connect_block_data(handle, block.transactions.len() as u32);
        Ok(true)
    }

    fn record_block_file(
        &self,
        inner: &mut Inner<S>,
        location: FileLocation,
        height: i32,
        time: u32,
        payload_len: usize,
    ) {
        let info = inner.block_file_info.entry(location.file_id).or_default();
        info.record(height, time, payload_len as u64 + 8);
        if !inner.dirty_block_files.contains(&location.file_id) {
            inner.dirty_block_files.push(location.file_id);
        }
    }

    fn record_undo_file(
        &self,
        inner: &mut Inner<S>,
        location: FileLocation,
        height: i32,
        time: u32,
        payload_len: usize,
    ) {
        let info = inner.undo_file_info.entry(location.file_id).or_default();
        info.record(height, time, payload_len as u64 + 40);
        if !inner.dirty_undo_files.contains(&location.file_id) {
            inner.dirty_undo_files.push(location.file_id);
        }
    }

    fn median_time_past(&self, index: &BlockIndex, handle: Handle) -> i64 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut walk = Some(handle);
        while let Some(current) = walk {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            let entry = index.get(current);
            times.push(entry.header.time as i64);
            walk = entry.prev;
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    fn header_window(&self, index: &BlockIndex, last: Handle) -> Vec<HeaderInfo> {
        let mut window = Vec::with_capacity(DIFFICULTY_WINDOW.min(512));
        let mut walk = Some(last);
        while let Some(current) = walk {
            if window.len() == DIFFICULTY_WINDOW {
                break;
            }
            let entry = index.get(current);
            window.push(HeaderInfo {
                height: entry.height as i64,
                time: entry.header.time as i64,
                bits: entry.header.bits,
                proof_of_stake: entry.proof_of_stake,
            });
            walk = entry.prev;
        }
        window.reverse();
        window
    }

    // ------------------------------------------------------------------
    // ActivateBestChain

    pub fn activate_best_chain(&self) -> Result<(), ChainError> {
        loop {
            if self.shutdown_requested() {
                break;
            }
            let mut inner = self.lock_inner();
            let Some(best) = inner.index.best_candidate() else {
                break;
            };
            let tip = inner.tip_handle();
            if tip == Some(best) {
                inner.index.prune_candidates(best);
                break;
            }

            let fork = tip.map(|tip| inner.index.find_fork(tip, best));
            let mut had_disconnects = false;
            while inner.tip_handle() != fork && inner.tip_handle().is_some() {
                if self.shutdown_requested() {
                    return Ok(());
                }
                self.disconnect_tip(&mut inner)?;
                had_disconnects = true;
            }

            let mut path = Vec::new();
            let mut walk = best;
            loop {
                if Some(walk) == fork {
                    break;
                }
                path.push(walk);
                match inner.index.get(walk).prev {
                    Some(prev) => walk = prev,
                    None => break,
                }
            }
            path.reverse();

            let mut invalid_block = false;
            for &next in path.iter().take(ACTIVATE_CONNECT_BATCH) {
                if self.shutdown_requested() {
                    break;
                }
                match self.connect_tip(&mut inner, next) {
                    Ok(()) => {}
                    Err(ChainError::Invalid(verdict)) if !verdict.corruption_possible => {
                        eprintln!(
                            "invalid block {} at height {}: {}",
                            hash256_to_hex(&inner.index.get(next).hash),
                            inner.index.get(next).height,
                            verdict.reason
                        );
                        inner.index.mark_failed(next);
                        invalid_block = true;
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }

            self.reconcile_mempool(&mut inner, had_disconnects)?;
            if let Some(tip) = inner.tip_handle() {
                inner.index.prune_candidates(tip);
            }
            drop(inner);
            if invalid_block {
                continue;
            }
        }
        self.flush(false)?;
        Ok(())
    }

    fn disconnect_tip(&self, inner: &mut Inner<S>) -> Result<(), ChainError> {
        let tip = inner
            .tip_handle()
            .ok_or_else(|| ChainError::System("disconnect with no tip".to_string()))?;
        let entry = inner.index.get(tip).clone();
        if entry.height == 0 {
            return Err(ChainError::System(
                "attempt to disconnect genesis".to_string(),
            ));
        }
        let block = self.read_block_at(&entry)?;
        let undo = self.read_undo(&entry)?;

        let mut batch = WriteBatch::new();
        {
            let Inner { coins, tokens, .. } = &mut *inner;
            let mut coin_overlay = CoinCache::new(&mut *coins);
            let mut token_overlay = TokenCache::new(&mut *tokens);
            let mut governance = GovernanceCache::new();
            let result = self.disconnect_block(
                &block,
                &entry,
                &undo,
                &mut coin_overlay,
                &mut token_overlay,
                &mut governance,
                &mut batch,
            )?;
            match result {
                DisconnectResult::Failed(reason) => {
                    return Err(ChainError::System(format!(
                        "disconnect of {} failed: {reason}; chainstate indeterminate",
                        hash256_to_hex(&entry.hash)
                    )));
                }
                DisconnectResult::Unclean => {
                    eprintln!(
                        "unclean disconnect of block {}",
                        hash256_to_hex(&entry.hash)
                    );
                }
                DisconnectResult::Clean => {}
            }
            coin_overlay.set_best_block(entry.header.prev_block);
            coin_overlay.flush()?;
            token_overlay.flush()?;
            governance.write_to_batch(&mut batch);
        }
        self.store.write_batch(&batch)?;
        inner.active.pop();

        let mut mempool = self.lock_mempool();
        mempool.disconnect.add_disconnected(
            block
                .transactions
                .iter()
                .rev()
                .filter(|tx| !tx.is_coinbase() && !tx.is_coinstake())
                .cloned(),
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn disconnect_block<P: CoinView, Q: TokenView>(
        &self,
        block: &Block,
        entry: &IndexEntry,
        undo: &BlockUndo,
        coin_overlay: &mut CoinCache<P>,
        token_overlay: &mut TokenCache<Q>,
        governance: &mut GovernanceCache,
        batch: &mut WriteBatch,
    ) -> Result<DisconnectResult, ChainError> {
        if undo.tx_undos.len() + 1 != block.transactions.len() {
            return Ok(DisconnectResult::Failed("undo transaction count mismatch"));
        }
        let mut unclean = false;
        let height = entry.height;

        let address_index = AddressIndex::new(Arc::clone(&self.store));
        let spent_index = SpentIndex::new(Arc::clone(&self.store));
        let tx_index = TxIndex::new(Arc::clone(&self.store));
        let timestamp_index = TimestampIndex::new(Arc::clone(&self.store));

        for op in undo.governance_ops.iter().rev() {
            governance.apply_undo(op);
        }
        undo_token_ops(token_overlay, &undo.token_ops)?;

        for (tx_index_pos, tx) in block.transactions.iter().enumerate().rev() {
            let txid = tx.txid();
            for (out_index, output) in tx.vout.iter().enumerate().rev() {
                if is_unspendable(output) {
                    continue;
                }
                let outpoint = OutPoint {
                    hash: txid,
                    index: out_index as u32,
                };
                match coin_overlay.spend(&outpoint) {
                    Ok(_) => {}
                    Err(crate::coins::CoinViewError::MissingInput) => {
                        unclean = true;
                    }
                    Err(err) => return Err(err.into()),
                }
                address_index.erase_output(batch, &output.script_pubkey, height, &outpoint);
            }
            tx_index.delete(batch, &txid);

            if tx_index_pos > 0 {
                let tx_undo = &undo.tx_undos[tx_index_pos - 1];
                if tx_undo.spent.len() != tx.vin.len() {
                    return Ok(DisconnectResult::Failed("undo input count mismatch"));
                }
                for (outpoint, coin) in tx_undo.spent.iter().rev() {
                    let overwrote = coin_overlay.add(*outpoint, coin.clone(), true)?;
                    if overwrote {
                        unclean = true;
                    }
                    let token = token_name_of(&coin.script_pubkey);
                    address_index.erase_spend(
                        batch,
                        &coin.script_pubkey,
                        height,
                        outpoint,
                        coin.value,
                        &token,
                    );
                    spent_index.delete(batch, outpoint);
                }
            }
        }

        timestamp_index.delete(batch, block.header.time, &entry.hash);
        if unclean {
            Ok(DisconnectResult::Unclean)
        } else {
            Ok(DisconnectResult::Clean)
        }
    }

    fn connect_tip(&self, inner: &mut Inner<S>, handle: Handle) -> Result<(), ChainError> {
        let entry = inner.index.get(handle).clone();
        let block = self.read_block_at(&entry)?;
        let mut batch = WriteBatch::new();

        let undo = {
            let Inner { index, coins, tokens, .. } = &mut *inner;
            let mut coin_overlay = CoinCache::new(&mut *coins);
            let mut token_overlay = TokenCache::new(&mut *tokens);
            let mut governance = GovernanceCache::new();
            let undo = self.connect_block(
                &block,
                &entry,
                index,
                &mut coin_overlay,
                &mut token_overlay,
                &mut governance,
                &mut batch,
            )?;
            coin_overlay.set_best_block(entry.hash);
            coin_overlay.flush()?;
            token_overlay.flush()?;
            governance.write_to_batch(&mut batch);
            undo
        };

        let undo_bytes = undo.encode();
        let checksum = undo_checksum(&entry.header.prev_block, &undo_bytes);
        // Undo records pair with their block's file for pruning.
        let undo_file_id = entry
            .block_loc
            .map(|loc| loc.file_id)
            .unwrap_or_else(|| self.undo_files.current_file_id());
        let undo_location = self
            .undo_files
            .append_at(undo_file_id, &undo_bytes, Some(&checksum))?;
        self.record_undo_file(
            inner,
            undo_location,
            entry.height,
            entry.header.time,
            undo_bytes.len(),
        );
        inner.index.modify(handle, |entry| {
            entry.undo_loc = Some(undo_location);
            entry.status |= status::HAVE_UNDO;
        });
        inner.index.raise_validity(handle, status::VALID_SCRIPTS);

        self.store.write_batch(&batch)?;
        inner.active.push(handle);
        self.metrics.record_block();

        let mut mempool = self.lock_mempool();
        mempool.pool.remove_confirmed(&block.transactions);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn connect_block<P: CoinView, Q: TokenView>(
        &self,
        block: &Block,
        entry: &IndexEntry,
        index: &BlockIndex,
        coin_overlay: &mut CoinCache<P>,
        token_overlay: &mut TokenCache<Q>,
        governance: &mut GovernanceCache,
        batch: &mut WriteBatch,
    ) -> Result<BlockUndo, ChainError> {
        let consensus = &self.params.consensus;
        let height = entry.height;

        // A failure here means the block on disk differs from what was
        // accepted; suspect local corruption and abort.
        if let Err(err) = check_block(block, consensus, self.config.check_pow) {
            return Err(ChainError::System(format!(
                "corrupt block read from disk: {err}"
            )));
        }

        let view_best = coin_overlay.best_block()?;
        if height > 0 && view_best != Some(entry.header.prev_block) {
            return Err(ChainError::System(
                "coin view does not sit on the block's predecessor".to_string(),
            ));
        }

        // Difficulty recheck against the ancestor window.
        if let Some(prev) = entry.prev {
            let window = self.header_window(index, prev);
            let expected =
                next_target_required(&window, block.is_proof_of_stake(), consensus)
                    .map_err(|_| ChainError::invalid(REJECT_INVALID, "bad-diffbits"))?;
            if block.header.bits != expected {
                return Err(ChainError::invalid(REJECT_INVALID, "bad-diffbits"));
            }
        }

        let check_scripts = self.scripts_required(index, entry);

        // Proof-of-stake: kernel, maturity, split and block signature.
        let mut kernel_coin = None;
        if block.is_proof_of_stake() {
            let coinstake = &block.transactions[1];
            let kernel_prevout = coinstake.vin[0].prevout;
            let coin = coin_overlay
                .coin(&kernel_prevout)?
                .ok_or_else(|| ChainError::invalid(REJECT_INVALID, "bad-stake-missing-input"))?;
            pos_validation::check_stake_maturity(&coin, height, block.header.time, consensus)
                .map_err(|err| ChainError::invalid(REJECT_INVALID, err.to_string()))?;
            let prev_modifier = entry
                .prev
                .map(|prev| index.get(prev).stake_modifier)
                .unwrap_or([0u8; 32]);
            check_kernel_target(
                &prev_modifier,
                &coin,
                &kernel_prevout,
                block.header.time,
                block.header.bits,
            )
            .map_err(|err| ChainError::invalid(REJECT_INVALID, err.to_string()))?;
            pos_validation::check_block_signature(block, &coin)
                .map_err(|err| ChainError::invalid(REJECT_INVALID, err.to_string()))?;
            kernel_coin = Some(coin);
        }

        let address_index = AddressIndex::new(Arc::clone(&self.store));
        let spent_index = SpentIndex::new(Arc::clone(&self.store));
        let tx_index = TxIndex::new(Arc::clone(&self.store));
        let timestamp_index = TimestampIndex::new(Arc::clone(&self.store));

        let mut undo = BlockUndo::default();
        let mut total_fees = 0i64;
        let mut coinstake_value_in = 0i64;
        let mut sigops = 0u32;
        let mut cache_keys = Vec::new();
        let session = check_scripts.then(|| self.script_queue.session());
        let script_start = Instant::now();

        for (tx_pos, tx) in block.transactions.iter().enumerate() {
            let txid = tx.txid();
            let is_coinbase = tx_pos == 0;
            let is_coinstake = tx.is_coinstake();

            for input in &tx.vin {
                sigops += legacy_sigop_count(&input.script_sig, false)
                    * WITNESS_SCALE_FACTOR as u32;
            }
            for output in &tx.vout {
                sigops += legacy_sigop_count(&output.script_pubkey, false)
                    * WITNESS_SCALE_FACTOR as u32;
            }
            if sigops > MAX_BLOCK_SIGOPS_COST {
                return Err(ChainError::invalid(REJECT_INVALID, "bad-blk-sigops"));
            }

            let mut spent_coins: Vec<Coin> = Vec::with_capacity(tx.vin.len());
            if !is_coinbase {
                let utxo_start = Instant::now();
                let mut value_in = 0i64;
                let mut tx_undo = TxUndo::default();
                for (input_index, input) in tx.vin.iter().enumerate() {
                    let coin = match coin_overlay.spend(&input.prevout) {
                        Ok(coin) => coin,
                        Err(crate::coins::CoinViewError::MissingInput) => {
                            eprintln!(
                                "missing input {}:{} for tx {} at height {}",
                                hash256_to_hex(&input.prevout.hash),
                                input.prevout.index,
                                hash256_to_hex(&txid),
                                height
                            );
                            return Err(ChainError::invalid(
                                REJECT_INVALID,
                                "bad-txns-inputs-missingorspent",
                            ));
                        }
                        Err(err) => return Err(err.into()),
                    };
                    if governance.script_frozen(&*self.store, &coin.script_pubkey)? {
                        return Err(ChainError::invalid(
                            REJECT_INVALID,
                            "bad-txns-frozen-input",
                        ));
                    }
                    if coin.is_coinbase || coin.is_coinstake {
                        let depth = height as i64 - coin.height as i64;
                        if depth < COINBASE_MATURITY as i64 {
                            return Err(ChainError::invalid(
                                REJECT_INVALID,
                                "bad-txns-premature-spend-of-coinbase",
                            ));
                        }
                    }
                    value_in = value_in
                        .checked_add(coin.value)
                        .ok_or_else(|| {
                            ChainError::invalid(REJECT_INVALID, "bad-txns-inputvalues-outofrange")
                        })?;
                    let token = token_name_of(&coin.script_pubkey);
                    address_index.record_spend(
                        batch,
                        &coin.script_pubkey,
                        height,
                        &input.prevout,
                        coin.value,
                        &token,
                    );
                    spent_index.insert(
                        batch,
                        &input.prevout,
                        SpentIndexValue {
                            txid,
                            input_index: input_index as u32,
                            block_height: height as u32,
                        },
                    );
                    tx_undo.spent.push((input.prevout, coin.clone()));
                    spent_coins.push(coin);
                }
                self.metrics.record_utxo(utxo_start.elapsed());

                let value_out: i64 = tx.vout.iter().map(|out| out.value).sum();
                if is_coinstake {
                    coinstake_value_in = value_in;
                } else {
                    if value_in < value_out {
                        return Err(ChainError::invalid(REJECT_INVALID, "bad-txns-in-belowout"));
                    }
                    let fee = value_in - value_out;
                    total_fees = total_fees
                        .checked_add(fee)
                        .ok_or_else(|| {
                            ChainError::invalid(REJECT_INVALID, "bad-txns-fee-outofrange")
                        })?;
                }

                if let Some(session) = &session {
                    let wtxid = tx.wtxid();
                    let key = self
                        .script_cache
                        .key(&wtxid, MANDATORY_SCRIPT_VERIFY_FLAGS);
                    if !self.script_cache.contains(&key) {
                        let shared_tx = Arc::new(tx.clone());
                        let txdata = Arc::new(PrecomputedTxData::new(tx));
                        let checks: Vec<ScriptCheck> = spent_coins
                            .iter()
                            .enumerate()
                            .map(|(input_index, coin)| ScriptCheck {
                                tx: Arc::clone(&shared_tx),
                                input_index,
                                script_pubkey: coin.script_pubkey.clone(),
                                amount: coin.value,
                                flags: MANDATORY_SCRIPT_VERIFY_FLAGS,
                                txdata: Arc::clone(&txdata),
                            })
                            .collect();
                        session.push_batch(checks);
                        cache_keys.push(key);
                    }
                }
                undo.tx_undos.push(tx_undo);
            }

            let token_start = Instant::now();
            apply_token_tx(
                &*self.store,
                governance,
                &self.params,
                token_overlay,
                tx,
                &spent_coins,
                height,
                &mut undo.token_ops,
            )?;
            self.metrics.record_token(token_start.elapsed());

            // Governance: master-key-authorised OP_RETURN outputs.
            if !self.params.governance_script.is_empty()
                && spent_coins
                    .iter()
                    .any(|coin| coin.script_pubkey == self.params.governance_script)
            {
                for output in &tx.vout {
                    let Some(op) = decode_governance_op(&output.script_pubkey) else {
                        continue;
                    };
                    // A freeze naming the master key itself is ignored.
                    if let crate::governance::GovernanceOp::Freeze { script } = &op {
                        if *script == self.params.governance_script {
                            continue;
                        }
                    }
                    let undo_op = governance.apply(&*self.store, &op)?;
                    undo.governance_ops.push(undo_op);
                }
            }

            let index_start = Instant::now();
            for (out_index, output) in tx.vout.iter().enumerate() {
                if is_unspendable(output) {
                    continue;
                }
                let outpoint = OutPoint {
                    hash: txid,
                    index: out_index as u32,
                };
                coin_overlay
                    .add(
                        outpoint,
                        Coin {
                            value: output.value,
                            script_pubkey: output.script_pubkey.clone(),
                            height: height as u32,
                            is_coinbase,
                            is_coinstake,
                            time: tx.time,
                        },
                        false,
                    )
                    .map_err(|_| {
                        ChainError::invalid(REJECT_INVALID, "bad-txns-BIP30")
                    })?;
                let token = token_name_of(&output.script_pubkey);
                address_index.record_output(
                    batch,
                    &output.script_pubkey,
                    height,
                    &outpoint,
                    output.value,
                    &token,
                );
            }
            if let Some(block_loc) = entry.block_loc {
                tx_index.insert(
                    batch,
                    &txid,
                    TxLocation {
                        block: block_loc,
                        index: tx_pos as u32,
                    },
                );
            }
            self.metrics.record_index(index_start.elapsed());
        }

        // Reward limits: the premine at height 1, a fixed reward after.
        let subsidy = block_subsidy(height);
        if block.is_proof_of_stake() {
            let coinstake = &block.transactions[1];
            let stake_out: i64 = coinstake.vout.iter().map(|out| out.value).sum();
            let reward = stake_out.saturating_sub(coinstake_value_in);
            let limit = subsidy
                .checked_add(total_fees)
                .ok_or_else(|| ChainError::invalid(REJECT_INVALID, "bad-cs-amount"))?;
            if reward > limit {
                return Err(ChainError::invalid(REJECT_INVALID, "bad-cs-amount"));
            }
            let kernel = kernel_coin.as_ref().expect("kernel resolved above");
            pos_validation::check_offline_stake_split(coinstake, kernel, coinstake_value_in)
                .map_err(|err| ChainError::invalid(REJECT_INVALID, err.to_string()))?;
        } else {
            let coinbase_out: i64 = block.transactions[0]
                .vout
                .iter()
                .map(|out| out.value)
                .sum();
            let limit = subsidy
                .checked_add(total_fees)
                .ok_or_else(|| ChainError::invalid(REJECT_INVALID, "bad-cb-amount"))?;
            if coinbase_out > limit {
                return Err(ChainError::invalid(REJECT_INVALID, "bad-cb-amount"));
            }
        }

        if let Some(session) = session {
            let ok = session.wait();
            self.metrics.record_script(script_start.elapsed());
            if !ok {
                return Err(ChainError::invalid(
                    REJECT_INVALID,
                    "mandatory-script-verify-flag-failed",
                ));
            }
            for key in cache_keys {
                self.script_cache.insert(key);
            }
        }

        timestamp_index.insert(batch, block.header.time, &entry.hash);
        Ok(undo)
    }

    /// Scripts are skipped only for ancestors of the assume-valid block.
    fn scripts_required(&self, index: &BlockIndex, entry: &IndexEntry) -> bool {
        let Some(assume_valid) = &self.params.consensus.assume_valid else {
            return true;
        };
        let Some(av_handle) = index.lookup(assume_valid) else {
            return true;
        };
        index
            .ancestor(av_handle, entry.height)
            .map(|ancestor| index.get(ancestor).hash != entry.hash)
            .unwrap_or(true)
    }

    fn read_block_at(&self, entry: &IndexEntry) -> Result<Block, ChainError> {
        let location = entry.block_loc.ok_or_else(|| match entry.have_data() {
            true => ChainError::System(format!(
                "block {} has been pruned",
                hash256_to_hex(&entry.hash)
            )),
            false => ChainError::System(format!(
                "no data for block {}",
                hash256_to_hex(&entry.hash)
            )),
        })?;
        let bytes = match self.blocks.read(location) {
            Ok(bytes) => bytes,
            Err(FlatFileError::Pruned(file_id)) => {
                return Err(ChainError::System(format!(
                    "block file {file_id} has been pruned"
                )));
            }
            Err(err) => return Err(err.into()),
        };
        Block::consensus_decode(&bytes)
            .map_err(|_| ChainError::System("corrupt block bytes on disk".to_string()))
    }

    fn read_undo(&self, entry: &IndexEntry) -> Result<BlockUndo, ChainError> {
        let location = entry.undo_loc.ok_or_else(|| {
            ChainError::System(format!(
                "missing undo data for block {}; resync required",
                hash256_to_hex(&entry.hash)
            ))
        })?;
        let bytes = self.undo_files.read(location)?;
        let checksum = self.undo_files.read_trailer(location)?;
        if checksum != undo_checksum(&entry.header.prev_block, &bytes) {
            return Err(ChainError::System(format!(
                "undo data checksum mismatch for block {}",
                hash256_to_hex(&entry.hash)
            )));
        }
        BlockUndo::decode(&bytes)
            .map_err(|_| ChainError::System("corrupt undo bytes on disk".to_string()))
    }

    // ------------------------------------------------------------------
    // Mempool

    fn accept_context(&self, inner: &Inner<S>, bypass_limits: bool, test_only: bool) -> AcceptContext {
        let (next_height, mtp) = match inner.tip_handle() {
            Some(tip) => (
                inner.index.get(tip).height + 1,
                self.median_time_past(&inner.index, tip),
            ),
            None => (0, 0),
        };
        AcceptContext {
            next_height,
            median_time_past: mtp,
            now: now_secs() as u64,
            require_standard: self.config.require_standard,
            min_relay_fee_per_kb: self.config.min_relay_fee_per_kb,
            bypass_limits,
            test_only,
        }
    }

    pub fn submit_transaction(
        &self,
        tx: Transaction,
        test_only: bool,
    ) -> Result<AcceptOutcome, MempoolError> {
        let mut inner = self.lock_inner();
        let ctx = self.accept_context(&inner, false, test_only);
        let Inner { coins, tokens, .. } = &mut *inner;
        let mut pool_coins = PoolCoinsAdapter {
            coins,
            height: ctx.next_height,
        };
        let mut gate = TokenGateAdapter { tokens };
        let cache = CacheAdapter {
            cache: &self.script_cache,
        };
        let mut mempool = self.lock_mempool();
        let outcome = mempool
            .pool
            .try_accept(tx, &ctx, &mut pool_coins, &mut gate, Some(&cache))?;
        for outpoint in &outcome.released_outpoints {
            pool_coins.coins.uncache(outpoint);
        }
        mempool.pool.expire(ctx.now);
        Ok(outcome)
    }

    fn reconcile_mempool(
        &self,
        inner: &mut Inner<S>,
        had_disconnects: bool,
    ) -> Result<(), ChainError> {
        if !had_disconnects {
            return Ok(());
        }
        let ctx = self.accept_context(inner, true, false);
        let Inner { coins, tokens, .. } = &mut *inner;
        let mut pool_coins = PoolCoinsAdapter {
            coins,
            height: ctx.next_height,
        };
        let mut gate = TokenGateAdapter { tokens };
        let cache = CacheAdapter {
            cache: &self.script_cache,
        };
        let mut mempool = self.lock_mempool();
        let MempoolState { pool, disconnect } = &mut *mempool;
        for tx in disconnect.drain_for_readmission() {
            let txid = tx.txid();
            match pool.try_accept(tx, &ctx, &mut pool_coins, &mut gate, Some(&cache)) {
                Ok(_) => {}
                Err(err) if err.kind == MempoolErrorKind::AlreadyInMempool => {}
                Err(_) => {
                    // Re-admission failed: anything in the pool that
                    // depends on it goes too.
                    pool.remove_recursive(&txid);
                }
            }
        }
        let (_, released) = pool.trim_to_size();
        for outpoint in &released {
            pool_coins.coins.uncache(outpoint);
        }
        Ok(())
    }

    pub fn mempool_txids(&self) -> Vec<Hash256> {
        self.lock_mempool().pool.txids()
    }

    pub fn mempool_len(&self) -> usize {
        self.lock_mempool().pool.len()
    }

    pub fn prioritise_transaction(&self, txid: Hash256, fee_delta: i64) {
        self.lock_mempool().pool.prioritise(txid, fee_delta);
    }

    pub fn dump_mempool(&self) -> Vec<u8> {
        self.lock_mempool().pool.dump()
    }

    /// Re-admit a persisted mempool image through the normal accept path.
    pub fn load_mempool(&self, bytes: &[u8]) -> Result<usize, ChainError> {
        let parsed = Mempool::parse_dump(bytes)
            .map_err(|err| ChainError::System(format!("corrupt mempool file: {err}")))?;
        let mut loaded = 0usize;
        for (tx, _time, fee_delta) in parsed {
            let txid = tx.txid();
            if fee_delta != 0 {
                self.prioritise_transaction(txid, fee_delta);
            }
            if self.submit_transaction(tx, false).is_ok() {
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    // ------------------------------------------------------------------
    // Operator commands

    pub fn invalidate_block(&self, hash: &Hash256) -> Result<(), ChainError> {
        {
            let mut inner = self.lock_inner();
            let handle = inner
                .index
                .lookup(hash)
                .ok_or_else(|| ChainError::System("unknown block".to_string()))?;
            let target_height = inner.index.get(handle).height;
            // Disconnect while the target is on the active chain.
            while let Some(tip) = inner.tip_handle() {
                if inner.index.ancestor(tip, target_height) != Some(handle) {
                    break;
                }
                self.disconnect_tip(&mut inner)?;
            }
            inner.index.mark_failed(handle);
            for candidate in inner.index.handles().collect::<Vec<_>>() {
                inner.index.add_candidate(candidate);
            }
            self.reconcile_mempool(&mut inner, true)?;
        }
        self.activate_best_chain()
    }

    pub fn reconsider_block(&self, hash: &Hash256) -> Result<(), ChainError> {
        {
            let mut inner = self.lock_inner();
            let handle = inner
                .index
                .lookup(hash)
                .ok_or_else(|| ChainError::System("unknown block".to_string()))?;
            inner.index.clear_failure(handle);
        }
        self.activate_best_chain()
    }

    pub fn precious_block(&self, hash: &Hash256) -> Result<(), ChainError> {
        {
            let mut inner = self.lock_inner();
            let handle = inner
                .index
                .lookup(hash)
                .ok_or_else(|| ChainError::System("unknown block".to_string()))?;
            inner.index.make_precious(handle);
        }
        self.activate_best_chain()
    }

    // ------------------------------------------------------------------
    // Flushing and pruning

    pub fn flush(&self, force: bool) -> Result<(), ChainError> {
        let mut inner = self.lock_inner();
        let due = inner.last_flush.elapsed() >= self.config.flush_interval;
        let over_budget = inner.coins.memory_usage() > self.config.coin_cache_bytes;
        if !(force || due || over_budget) {
            return Ok(());
        }

        // Data files first, so the index never references unsynced bytes.
        self.blocks.sync()?;
        self.undo_files.sync()?;

        let mut index_batch = WriteBatch::new();
        for handle in inner.index.take_dirty() {
            let entry = inner.index.get(handle);
            index_batch.put(Column::BlockIndex, entry.hash.to_vec(), entry.encode());
        }
        for file_id in inner.dirty_block_files.drain(..).collect::<Vec<_>>() {
            if let Some(info) = inner.block_file_info.get(&file_id) {
                index_batch.put(Column::FileInfo, block_file_key(file_id), info.encode());
            }
        }
        for file_id in inner.dirty_undo_files.drain(..).collect::<Vec<_>>() {
            if let Some(info) = inner.undo_file_info.get(&file_id) {
                index_batch.put(Column::FileInfo, undo_file_key(file_id), info.encode());
            }
        }
        write_flag(&mut index_batch, FLAG_TXINDEX, true);
        write_flag(&mut index_batch, FLAG_ADDRESSINDEX, true);
        write_flag(&mut index_batch, FLAG_TOKENINDEX, true);
        write_flag(&mut index_batch, FLAG_TIMESTAMPINDEX, true);
        write_flag(&mut index_batch, FLAG_SPENTINDEX, true);
        write_flag(&mut index_batch, FLAG_PRUNED, inner.pruned);
        if !index_batch.is_empty() {
            self.store.write_batch(&index_batch)?;
        }

        // Coin and token state last, bracketed by the head markers.
        let coin_flush = inner.coins.take_flush();
        let token_flush = inner.tokens.take_flush();
        if !coin_flush.entries.is_empty()
            || coin_flush.best_block.is_some()
            || !token_flush.is_empty()
        {
            let old_best = inner.coins.parent_mut().best_block()?;
            let new_best = coin_flush.best_block.or(old_best);
            if let Some(new_best) = &new_best {
                inner
                    .coins
                    .parent_mut()
                    .stage_head_marker(old_best.as_ref(), new_best)?;
            }
            let mut state_batch = WriteBatch::new();
            inner.coins.parent_mut().write_flush(&coin_flush, &mut state_batch);
            TokensDb::new(Arc::clone(&self.store)).write_flush(&token_flush, &mut state_batch);
            inner.coins.parent_mut().clear_head_marker(&mut state_batch);
            self.store.write_batch(&state_batch)?;
            inner.tokens.discard();
        }
        inner.last_flush = Instant::now();

        if self.config.prune_target_bytes.is_some() {
            self.maybe_prune(&mut inner)?;
        }
        Ok(())
    }

    /// Delete block and undo files whose newest block is deeper than the
    /// keep horizon, down to the byte budget.
    fn maybe_prune(&self, inner: &mut Inner<S>) -> Result<(), ChainError> {
        let Some(budget) = self.config.prune_target_bytes else {
            return Ok(());
        };
        let Some(tip) = inner.tip_handle() else {
            return Ok(());
        };
        let horizon = inner.index.get(tip).height - MIN_BLOCKS_TO_KEEP;
        let mut total: u64 = inner.block_file_info.values().map(|info| info.size).sum::<u64>()
            + inner.undo_file_info.values().map(|info| info.size).sum::<u64>();
        if total <= budget {
            return Ok(());
        }

        let mut removable: Vec<u32> = inner
            .block_file_info
            .iter()
            .filter(|(file_id, info)| {
                info.height_max < horizon && **file_id != self.blocks.current_file_id()
            })
            .map(|(file_id, _)| *file_id)
            .collect();
        removable.sort_unstable();

        for file_id in removable {
            if total <= budget {
                break;
            }
            self.prune_file(inner, file_id)?;
            total = inner.block_file_info.values().map(|info| info.size).sum::<u64>()
                + inner.undo_file_info.values().map(|info| info.size).sum::<u64>();
        }
        Ok(())
    }

    /// Manual pruning: drop files wholly below `height`, never closer
    /// than the keep horizon.
    pub fn prune_to_height(&self, height: i32) -> Result<u32, ChainError> {
        self.flush(true)?;
        let mut inner = self.lock_inner();
        let Some(tip) = inner.tip_handle() else {
            return Ok(0);
        };
        let horizon = (inner.index.get(tip).height - MIN_BLOCKS_TO_KEEP).min(height);
        let removable: Vec<u32> = inner
            .block_file_info
            .iter()
            .filter(|(file_id, info)| {
                info.height_max < horizon && **file_id != self.blocks.current_file_id()
            })
            .map(|(file_id, _)| *file_id)
            .collect();
        let mut pruned = 0u32;
        for file_id in removable {
            self.prune_file(&mut inner, file_id)?;
            pruned += 1;
        }
        Ok(pruned)
    }

    fn prune_file(&self, inner: &mut Inner<S>, file_id: u32) -> Result<(), ChainError> {
        self.blocks.unlink(file_id)?;
        let _ = self.undo_files.unlink(file_id);
        inner.block_file_info.remove(&file_id);
        inner.undo_file_info.remove(&file_id);

        let mut batch = WriteBatch::new();
        batch.delete(Column::FileInfo, block_file_key(file_id));
        batch.delete(Column::FileInfo, undo_file_key(file_id));
        inner.pruned = true;
        write_flag(&mut batch, FLAG_PRUNED, true);

        // Strip data references from affected index entries.
        let affected: Vec<Handle> = inner
            .index
            .handles()
            .filter(|handle| {
                let entry = inner.index.get(*handle);
                entry
                    .block_loc
                    .map(|loc| loc.file_id == file_id)
                    .unwrap_or(false)
                    || entry
                        .undo_loc
                        .map(|loc| loc.file_id == file_id)
                        .unwrap_or(false)
            })
            .collect();
        for handle in affected {
            inner.index.modify(handle, |entry| {
                if entry.block_loc.map(|loc| loc.file_id == file_id).unwrap_or(false) {
                    entry.block_loc = None;
                    entry.status &= !status::HAVE_DATA;
                }
                if entry.undo_loc.map(|loc| loc.file_id == file_id).unwrap_or(false) {
                    entry.undo_loc = None;
                    entry.status &= !status::HAVE_UNDO;
                }
            });
            let entry = inner.index.get(handle);
            batch.put(Column::BlockIndex, entry.hash.to_vec(), entry.encode());
        }
        inner.index.take_dirty();
        self.store.write_batch(&batch)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Verification

    /// Walk the active chain backwards over `depth` blocks, checking at
    /// increasing thoroughness: 0 linkage, 1 block rules, 2 undo data,
    /// 3 disconnectability of recent blocks, 4 reconnect.
    pub fn verify_chain(&self, level: u32, depth: u32) -> Result<(), String> {
        let level = level.min(4);
        let mut inner = self.lock_inner();
        let Some(tip) = inner.tip_handle() else {
            return Ok(());
        };
        let tip_height = inner.index.get(tip).height;
        let depth = if depth == 0 {
            tip_height as u32 + 1
        } else {
            depth.min(tip_height as u32 + 1)
        };

        let mut handles = Vec::with_capacity(depth as usize);
        let mut walk = Some(tip);
        for _ in 0..depth {
            let Some(current) = walk else { break };
            handles.push(current);
            walk = inner.index.get(current).prev;
        }

        let mut blocks = Vec::with_capacity(handles.len());
        for &handle in &handles {
            let entry = inner.index.get(handle).clone();
            if !entry.have_data() {
                if inner.pruned {
                    break;
                }
                return Err(format!(
                    "missing block data at height {}",
                    entry.height
                ));
            }
            let block = self
                .read_block_at(&entry)
                .map_err(|err| err.to_string())?;
            if block.header.hash() != entry.hash {
                return Err(format!("block hash mismatch at height {}", entry.height));
            }
            if block.header.prev_block != entry.header.prev_block {
                return Err(format!(
                    "block prev-hash mismatch at height {}",
                    entry.height
                ));
            }
            blocks.push((entry, block));
        }

        if level >= 1 {
            let consensus = &self.params.consensus;
            let check_pow = self.config.check_pow;
            blocks
                .par_iter()
                .map(|(entry, block)| {
                    check_block(block, consensus, check_pow).map_err(|err| {
                        format!("invalid block at height {}: {}", entry.height, err)
                    })
                })
                .collect::<Result<Vec<()>, String>>()?;
        }

        if level >= 2 {
            for (entry, _) in &blocks {
                if entry.height == 0 {
                    continue;
                }
                self.read_undo(entry).map_err(|err| err.to_string())?;
            }
        }

        if level >= 3 {
            let rollback = blocks
                .iter()
                .take(VERIFY_ROLLBACK_DEPTH)
                .filter(|(entry, _)| entry.height > 0)
                .cloned()
                .collect::<Vec<_>>();
            let index_snapshot = std::mem::take(&mut inner.index);
            let Inner { coins, tokens, .. } = &mut *inner;
            let mut coin_overlay = CoinCache::new(&mut *coins);
            let mut token_overlay = TokenCache::new(&mut *tokens);
            let mut scratch = WriteBatch::new();
            let mut verify_err = None;
            for (entry, block) in &rollback {
                let undo = match self.read_undo(entry) {
                    Ok(undo) => undo,
                    Err(err) => {
                        verify_err = Some(err.to_string());
                        break;
                    }
                };
                let mut governance = GovernanceCache::new();
                let result = self.disconnect_block(
                    block,
                    entry,
                    &undo,
                    &mut coin_overlay,
                    &mut token_overlay,
                    &mut governance,
                    &mut scratch,
                );
                match result {
                    Ok(DisconnectResult::Failed(_)) => {
                        verify_err = Some(format!(
                            "irrecoverable inconsistency disconnecting height {}",
                            entry.height
                        ));
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        verify_err = Some(err.to_string());
                        break;
                    }
                }
            }

            // Level 4: reconnect what was just rolled back, still inside
            // the throwaway overlay.
            if level >= 4 && verify_err.is_none() {
                for (entry, block) in rollback.iter().rev() {
                    let mut governance = GovernanceCache::new();
                    coin_overlay.set_best_block(entry.header.prev_block);
                    if let Err(err) = self.connect_block(
                        block,
                        entry,
                        &index_snapshot,
                        &mut coin_overlay,
                        &mut token_overlay,
                        &mut governance,
                        &mut scratch,
                    ) {
                        verify_err =
                            Some(format!("reconnect failed at height {}: {err}", entry.height));
                        break;
                    }
                }
            }

            // The verify pass works entirely in the overlay; discard it.
            coin_overlay.discard();
            token_overlay.discard();
            inner.index = index_snapshot;
            if let Some(err) = verify_err {
                return Err(err);
            }
        }
        Ok(())
    }
}

fn pow_validation_bounds(
    header: &BlockHeader,
    consensus: &plbd_consensus::ConsensusParams,
) -> Result<(), ChainError> {
    plbd_pow::validation::check_target_bounds(header, false, consensus)
        .map_err(|err| ChainError::invalid(REJECT_INVALID, err.to_string()))
}

fn token_name_of(script_pubkey: &[u8]) -> String {
    parse_token_script(script_pubkey)
        .ok()
        .flatten()
        .map(|payload| payload.name().to_string())
        .unwrap_or_default()
}

struct PoolCoinsAdapter<'a, S> {
    coins: &'a mut CoinCache<CoinsDb<Arc<S>>>,
    height: i32,
}

impl<S: KeyValueStore> PoolCoins for PoolCoinsAdapter<'_, S> {
    fn coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, String> {
        self.coins.coin(outpoint).map_err(|err| err.to_string())
    }

    fn spend_height(&self) -> i32 {
        self.height
    }
}

struct TokenGateAdapter<'a, S> {
    tokens: &'a mut TokenCache<TokensDb<Arc<S>>>,
}

impl<S: KeyValueStore> TokenGate for TokenGateAdapter<'_, S> {
    fn token_exists(&mut self, name: &str) -> Result<bool, String> {
        self.tokens
            .issuance(name)
            .map(|record| record.is_some())
            .map_err(|err| err.to_string())
    }

    fn global_frozen(&mut self, token: &str) -> Result<bool, String> {
        self.tokens
            .global_frozen(token)
            .map_err(|err| err.to_string())
    }

    fn address_frozen(&mut self, token: &str, address: &[u8; 20]) -> Result<bool, String> {
        self.tokens
            .address_frozen(token, address)
            .map_err(|err| err.to_string())
    }
}

struct CacheAdapter<'a> {
    cache: &'a ScriptExecutionCache,
}

impl ScriptCacheHook for CacheAdapter<'_> {
    fn contains(&self, wtxid: &Hash256, flags: u32) -> bool {
        self.cache.contains(&self.cache.key(wtxid, flags))
    }

    fn insert(&self, wtxid: &Hash256, flags: u32) {
        self.cache.insert(self.cache.key(wtxid, flags));
    }
}
