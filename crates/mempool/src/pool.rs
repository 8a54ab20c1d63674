//! Indexed unconfirmed transactions with ancestor/descendant tracking.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use plbd_consensus::constants::{
    DEFAULT_ANCESTOR_LIMIT, DEFAULT_ANCESTOR_SIZE_LIMIT, DEFAULT_DESCENDANT_LIMIT,
    DEFAULT_DESCENDANT_SIZE_LIMIT, DEFAULT_MAX_MEMPOOL_BYTES, DEFAULT_MEMPOOL_EXPIRY_SECS,
    MAX_STANDARD_TX_SIGOPS_COST, MAX_STANDARD_TX_WEIGHT, WITNESS_SCALE_FACTOR,
};
use plbd_consensus::money::{money_range, MAX_MONEY};
use plbd_consensus::Hash256;
use plbd_primitives::encoding::{DecodeError, Decoder, Encoder};
use plbd_primitives::{Coin, OutPoint, Transaction};
use plbd_script::sighash::PrecomputedTxData;
use plbd_script::standard::legacy_sigop_count;
use plbd_script::{
    classify, verify_script, ScriptClass, MANDATORY_SCRIPT_VERIFY_FLAGS,
    STANDARD_SCRIPT_VERIFY_FLAGS,
};
use plbd_tokens::{parse_token_script, TokenScript};

#[cfg(feature = "replacement")]
use plbd_consensus::constants::{INCREMENTAL_RELAY_FEE_PER_KB, MAX_REPLACEMENT_CANDIDATES};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MempoolErrorKind {
    AlreadyInMempool,
    Conflict,
    MissingInputs,
    InvalidTransaction,
    InvalidScript,
    NonStandard,
    FeeTooLow,
    TooLongChain,
    MempoolFull,
    Internal,
}

#[derive(Clone, Debug)]
pub struct MempoolError {
    pub kind: MempoolErrorKind,
    pub reason: String,
}

impl MempoolError {
    pub fn new(kind: MempoolErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for MempoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl std::error::Error for MempoolError {}

/// Input resolution against the pool-augmented coin view. The chain
/// controller implements this over its tip cache.
pub trait PoolCoins {
    fn coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, String>;
    /// Height the next block will have; coinbase maturity is checked
    /// against it.
    fn spend_height(&self) -> i32;
}

/// Token-state questions the accept path needs.
pub trait TokenGate {
    fn token_exists(&mut self, name: &str) -> Result<bool, String>;
    fn global_frozen(&mut self, token: &str) -> Result<bool, String>;
    fn address_frozen(&mut self, token: &str, address: &[u8; 20]) -> Result<bool, String>;
}

/// Post-verification hook into the script execution cache.
pub trait ScriptCacheHook {
    fn contains(&self, wtxid: &Hash256, flags: u32) -> bool;
    fn insert(&self, wtxid: &Hash256, flags: u32);
}

pub struct MempoolEntry {
    pub txid: Hash256,
    pub wtxid: Hash256,
    pub tx: Arc<Transaction>,
    pub fee: i64,
    pub fee_delta: i64,
    pub time: u64,
    pub entry_height: i32,
    pub vsize: usize,
    pub sigop_cost: u32,
    pub order: u64,
    /// Direct in-pool parents and children; closures are computed on
    /// demand and bounded by the chain limits.
    pub parents: HashSet<Hash256>,
    pub children: HashSet<Hash256>,
}

impl MempoolEntry {
    pub fn modified_fee(&self) -> i64 {
        self.fee.saturating_add(self.fee_delta)
    }

    fn fee_rate_cmp(&self, other: &MempoolEntry) -> std::cmp::Ordering {
        let left = i128::from(self.modified_fee()) * other.vsize.max(1) as i128;
        let right = i128::from(other.modified_fee()) * self.vsize.max(1) as i128;
        left.cmp(&right)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AcceptContext {
    pub next_height: i32,
    pub median_time_past: i64,
    pub now: u64,
    pub require_standard: bool,
    pub min_relay_fee_per_kb: i64,
    pub bypass_limits: bool,
    pub test_only: bool,
}

#[derive(Clone, Debug, Default)]
pub struct AcceptOutcome {
    pub txid: Hash256,
    pub fee: i64,
    pub vsize: usize,
    /// Entries evicted to make room (size trim or replacement).
    pub evicted: Vec<Hash256>,
    /// Prevouts freed by evictions; the coin cache may release them.
    pub released_outpoints: Vec<OutPoint>,
}

pub struct Mempool {
    entries: HashMap<Hash256, MempoolEntry>,
    spent: HashMap<OutPoint, Hash256>,
    by_order: BTreeMap<u64, Hash256>,
    fee_deltas: HashMap<Hash256, i64>,
    next_order: u64,
    total_vbytes: usize,
    max_bytes: usize,
    expiry_secs: u64,
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MEMPOOL_BYTES, DEFAULT_MEMPOOL_EXPIRY_SECS)
    }
}

impl Mempool {
    pub fn new(max_bytes: usize, expiry_secs: u64) -> Self {
        Self {
            entries: HashMap::new(),
            spent: HashMap::new(),
            by_order: BTreeMap::new(),
            fee_deltas: HashMap::new(),
            next_order: 0,
            total_vbytes: 0,
            max_bytes,
            expiry_secs,
        }
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    pub fn spender(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.spent.get(outpoint).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn vbytes(&self) -> usize {
        self.total_vbytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Entries in insertion order; reorg replay and persistence use it.
    pub fn entries_by_order(&self) -> impl Iterator<Item = &MempoolEntry> {
        self.by_order.values().filter_map(|txid| self.entries.get(txid))
    }

    pub fn txids(&self) -> Vec<Hash256> {
        let mut txids: Vec<Hash256> = self.entries.keys().copied().collect();
        txids.sort_unstable();
        txids
    }

    /// Per-transaction fee adjustment applied to accept limits and
    /// eviction ordering.
    pub fn prioritise(&mut self, txid: Hash256, delta: i64) {
        let total = self
            .fee_deltas
            .entry(txid)
            .and_modify(|entry| *entry = entry.saturating_add(delta))
            .or_insert(delta);
        let total = *total;
        if let Some(entry) = self.entries.get_mut(&txid) {
            entry.fee_delta = total;
        }
    }

    /// Transitive in-pool ancestors of the given direct parents. Fails
    /// once the walk exceeds the count or virtual-size limit.
    pub fn calc_ancestors(
        &self,
        direct_parents: &HashSet<Hash256>,
        extra_vsize: usize,
    ) -> Result<HashSet<Hash256>, MempoolError> {
        let mut ancestors: HashSet<Hash256> = HashSet::new();
        let mut queue: VecDeque<Hash256> = direct_parents.iter().copied().collect();
        let mut total_vsize = extra_vsize;
        while let Some(txid) = queue.pop_front() {
            if !ancestors.insert(txid) {
                continue;
            }
            let entry = self
                .entries
                .get(&txid)
                .ok_or_else(|| MempoolError::new(MempoolErrorKind::Internal, "missing ancestor"))?;
            total_vsize += entry.vsize;
            if ancestors.len() + 1 > DEFAULT_ANCESTOR_LIMIT
                || total_vsize > DEFAULT_ANCESTOR_SIZE_LIMIT
            {
                return Err(MempoolError::new(
                    MempoolErrorKind::TooLongChain,
                    "too-long-mempool-chain",
                ));
            }
            for parent in &entry.parents {
                queue.push_back(*parent);
            }
        }
        Ok(ancestors)
    }

    /// Transitive in-pool descendants including `txid` itself.
    pub fn calc_descendants(&self, txid: &Hash256) -> HashSet<Hash256> {
        let mut descendants = HashSet::new();
        let mut queue = VecDeque::from([*txid]);
        while let Some(current) = queue.pop_front() {
            if !descendants.insert(current) {
                continue;
            }
            if let Some(entry) = self.entries.get(&current) {
                for child in &entry.children {
                    queue.push_back(*child);
                }
            }
        }
        descendants
    }

    /// Full accept pipeline.
    pub fn try_accept(
        &mut self,
        tx: Transaction,
        ctx: &AcceptContext,
        coins: &mut dyn PoolCoins,
        tokens: &mut dyn TokenGate,
        script_cache: Option<&dyn ScriptCacheHook>,
    ) -> Result<AcceptOutcome, MempoolError> {
        let txid = tx.txid();
        if self.contains(&txid) {
            return Err(MempoolError::new(
                MempoolErrorKind::AlreadyInMempool,
                "txn-already-in-mempool",
            ));
        }

        self.check_structure(&tx, ctx)?;

        // Conflicts with in-pool spenders.
        let mut conflicts: HashSet<Hash256> = HashSet::new();
        for input in &tx.vin {
            if let Some(spender) = self.spent.get(&input.prevout) {
                conflicts.insert(*spender);
            }
        }
        #[cfg(not(feature = "replacement"))]
        if !conflicts.is_empty() {
            return Err(MempoolError::new(
                MempoolErrorKind::Conflict,
                "txn-mempool-conflict",
            ));
        }

        let (coins_in, parents, value_in) = self.resolve_inputs(&tx, coins)?;
        let value_out: i64 = tx.vout.iter().map(|out| out.value).sum();
        if value_in < value_out {
            return Err(MempoolError::new(
                MempoolErrorKind::InvalidTransaction,
                "bad-txns-in-belowout",
            ));
        }
        let fee = value_in - value_out;
        let fee_delta = self.fee_deltas.get(&txid).copied().unwrap_or(0);
        let vsize = tx.vsize();

        self.check_tokens(&tx, &coins_in, tokens)?;

        let sigop_cost = sigop_cost(&tx, &coins_in);
        if sigop_cost > MAX_STANDARD_TX_SIGOPS_COST {
            return Err(MempoolError::new(
                MempoolErrorKind::NonStandard,
                "bad-txns-too-many-sigops",
            ));
        }

        if !ctx.bypass_limits {
            let min_fee = ctx.min_relay_fee_per_kb.saturating_mul(vsize as i64) / 1_000;
            if fee.saturating_add(fee_delta) < min_fee {
                return Err(MempoolError::new(
                    MempoolErrorKind::FeeTooLow,
                    "min relay fee not met",
                ));
            }
        }

        if !ctx.bypass_limits {
            let ancestors = self.calc_ancestors(&parents, vsize)?;
            self.check_descendant_limits(&ancestors, vsize)?;
        }

        #[cfg(feature = "replacement")]
        if !conflicts.is_empty() {
            self.check_replacement(&tx, fee, vsize, &parents, &conflicts)?;
        }

        self.verify_scripts(&tx, &coins_in, ctx, script_cache)?;

        if ctx.test_only {
            return Ok(AcceptOutcome {
                txid,
                fee,
                vsize,
                evicted: Vec::new(),
                released_outpoints: Vec::new(),
            });
        }

        let mut outcome = AcceptOutcome {
            txid,
            fee,
            vsize,
            evicted: Vec::new(),
            released_outpoints: Vec::new(),
        };

        #[cfg(feature = "replacement")]
        for conflict in &conflicts {
            let (evicted, released) = self.remove_recursive(conflict);
            outcome.evicted.extend(evicted);
            outcome.released_outpoints.extend(released);
        }

        self.next_order += 1;
        let order = self.next_order;
        let entry = MempoolEntry {
            txid,
            wtxid: tx.wtxid(),
            tx: Arc::new(tx),
            fee,
            fee_delta,
            time: ctx.now,
            entry_height: ctx.next_height - 1,
            vsize,
            sigop_cost,
            order,
            parents: parents.clone(),
            children: HashSet::new(),
        };
        for input in &entry.tx.vin {
            self.spent.insert(input.prevout, txid);
        }
        for parent in &parents {
            if let Some(parent_entry) = self.entries.get_mut(parent) {
                parent_entry.children.insert(txid);
            }
        }
        self.by_order.insert(order, txid);
        self.total_vbytes += vsize;
        self.entries.insert(txid, entry);

        if !ctx.bypass_limits {
            let (evicted, released) = self.trim_to_size();
            outcome.evicted.extend(evicted);
            outcome.released_outpoints.extend(released);
            if !self.contains(&txid) {
                return Err(MempoolError::new(MempoolErrorKind::MempoolFull, "mempool full"));
            }
        }
        Ok(outcome)
    }

    fn check_structure(&self, tx: &Transaction, ctx: &AcceptContext) -> Result<(), MempoolError> {
        if tx.is_coinbase() {
            return Err(MempoolError::new(
                MempoolErrorKind::InvalidTransaction,
                "coinbase",
            ));
        }
        if tx.is_coinstake() {
            return Err(MempoolError::new(
                MempoolErrorKind::InvalidTransaction,
                "coinstake",
            ));
        }
        if tx.vin.is_empty() || tx.vout.is_empty() {
            return Err(MempoolError::new(
                MempoolErrorKind::InvalidTransaction,
                "bad-txns-vin-empty",
            ));
        }
        if tx.version < 1 {
            return Err(MempoolError::new(
                MempoolErrorKind::NonStandard,
                "version",
            ));
        }
        let mut seen = HashSet::with_capacity(tx.vin.len());
        for input in &tx.vin {
            if input.prevout.is_null() || !seen.insert(input.prevout) {
                return Err(MempoolError::new(
                    MempoolErrorKind::InvalidTransaction,
                    "bad-txns-inputs-duplicate",
                ));
            }
        }
        let mut total = 0i64;
        for output in &tx.vout {
            if output.value < 0 || output.value > MAX_MONEY {
                return Err(MempoolError::new(
                    MempoolErrorKind::InvalidTransaction,
                    "bad-txns-vout-notlegalmoney",
                ));
            }
            total = total.saturating_add(output.value);
        }
        if !money_range(total) {
            return Err(MempoolError::new(
                MempoolErrorKind::InvalidTransaction,
                "bad-txns-txouttotal-toolarge",
            ));
        }

        if !is_final(tx, ctx.next_height, ctx.median_time_past) {
            return Err(MempoolError::new(
                MempoolErrorKind::InvalidTransaction,
                "non-final",
            ));
        }

        if ctx.require_standard {
            if tx.weight() > MAX_STANDARD_TX_WEIGHT {
                return Err(MempoolError::new(MempoolErrorKind::NonStandard, "tx-size"));
            }
            for input in &tx.vin {
                if !plbd_script::interpreter::is_push_only(&input.script_sig) {
                    return Err(MempoolError::new(
                        MempoolErrorKind::NonStandard,
                        "scriptsig-not-pushonly",
                    ));
                }
            }
            let mut nulldata = 0usize;
            for output in &tx.vout {
                match classify(&output.script_pubkey) {
                    ScriptClass::Nonstandard => {
                        return Err(MempoolError::new(
                            MempoolErrorKind::NonStandard,
                            "scriptpubkey",
                        ));
                    }
                    ScriptClass::NullData => nulldata += 1,
                    _ => {}
                }
            }
            if nulldata > 1 {
                return Err(MempoolError::new(
                    MempoolErrorKind::NonStandard,
                    "multi-op-return",
                ));
            }
        }
        Ok(())
    }

    fn resolve_inputs(
        &self,
        tx: &Transaction,
        coins: &mut dyn PoolCoins,
    ) -> Result<(Vec<Coin>, HashSet<Hash256>, i64), MempoolError> {
        let spend_height = coins.spend_height();
        let mut coins_in = Vec::with_capacity(tx.vin.len());
        let mut parents = HashSet::new();
        let mut value_in = 0i64;
        for input in &tx.vin {
            let coin = if let Some(entry) = self.entries.get(&input.prevout.hash) {
                // Pool-augmented resolution: outputs of in-pool parents.
                let output = entry
                    .tx
                    .vout
                    .get(input.prevout.index as usize)
                    .ok_or_else(|| {
                        MempoolError::new(MempoolErrorKind::MissingInputs, "missing-inputs")
                    })?;
                parents.insert(input.prevout.hash);
                Coin {
                    value: output.value,
                    script_pubkey: output.script_pubkey.clone(),
                    height: spend_height as u32,
                    is_coinbase: false,
                    is_coinstake: false,
                    time: entry.tx.time,
                }
            } else {
                let coin = coins
                    .coin(&input.prevout)
                    .map_err(|err| MempoolError::new(MempoolErrorKind::Internal, err))?
                    .ok_or_else(|| {
                        MempoolError::new(MempoolErrorKind::MissingInputs, "missing-inputs")
                    })?;
                if coin.is_coinbase || coin.is_coinstake {
                    let depth = spend_height as i64 - coin.height as i64;
                    if depth < plbd_consensus::constants::COINBASE_MATURITY as i64 {
                        return Err(MempoolError::new(
                            MempoolErrorKind::InvalidTransaction,
                            "bad-txns-premature-spend-of-coinbase",
                        ));
                    }
                }
                coin
            };
            value_in = value_in.checked_add(coin.value).ok_or_else(|| {
                MempoolError::new(MempoolErrorKind::InvalidTransaction, "bad-txns-inputvalues-outofrange")
            })?;
            coins_in.push(coin);
        }
        Ok((coins_in, parents, value_in))
    }

    fn check_tokens(
        &self,
        tx: &Transaction,
        coins_in: &[Coin],
        tokens: &mut dyn TokenGate,
    ) -> Result<(), MempoolError> {
        let map_err = |err: plbd_tokens::TokenError| {
            MempoolError::new(MempoolErrorKind::InvalidTransaction, err.to_string())
        };
        let gate_err = |err: String| MempoolError::new(MempoolErrorKind::Internal, err);

        let mut inputs: HashMap<String, i64> = HashMap::new();
        for coin in coins_in {
            if let Some(payload) = parse_token_script(&coin.script_pubkey).map_err(map_err)? {
                *inputs.entry(payload.name().to_string()).or_insert(0) += payload.amount();
            }
        }
        let mut outputs: HashMap<String, i64> = HashMap::new();
        for output in &tx.vout {
            let Some(payload) = parse_token_script(&output.script_pubkey).map_err(map_err)? else {
                continue;
            };
            match &payload {
                TokenScript::Issue { name, .. } => {
                    if tokens.token_exists(name).map_err(gate_err)? {
                        return Err(MempoolError::new(
                            MempoolErrorKind::InvalidTransaction,
                            format!("token-already-issued-{name}"),
                        ));
                    }
                }
                TokenScript::Transfer { name, amount } => {
                    if *amount <= 0 {
                        return Err(MempoolError::new(
                            MempoolErrorKind::InvalidTransaction,
                            "bad-token-amount",
                        ));
                    }
                    *outputs.entry(name.clone()).or_insert(0) += amount;
                    if tokens.global_frozen(name).map_err(gate_err)? {
                        return Err(MempoolError::new(
                            MempoolErrorKind::InvalidTransaction,
                            format!("token-globally-frozen-{name}"),
                        ));
                    }
                    if let ScriptClass::PayToPubkeyHash(hash) = classify(&output.script_pubkey) {
                        if tokens.address_frozen(name, &hash).map_err(gate_err)? {
                            return Err(MempoolError::new(
                                MempoolErrorKind::InvalidTransaction,
                                format!("token-address-frozen-{name}"),
                            ));
                        }
                    }
                }
                _ => {}
            }
        }
        for (name, out_amount) in &outputs {
            let in_amount = inputs.get(name).copied().unwrap_or(0);
            if in_amount < *out_amount {
                return Err(MempoolError::new(
                    MempoolErrorKind::InvalidTransaction,
                    format!("bad-token-transfer-{name}"),
                ));
            }
        }
        Ok(())
    }

    fn verify_scripts(
        &self,
        tx: &Transaction,
        coins_in: &[Coin],
        ctx: &AcceptContext,
        script_cache: Option<&dyn ScriptCacheHook>,
    ) -> Result<(), MempoolError> {
        let wtxid = tx.wtxid();
        if let Some(cache) = script_cache {
            if cache.contains(&wtxid, MANDATORY_SCRIPT_VERIFY_FLAGS) {
                return Ok(());
            }
        }
        let txdata = PrecomputedTxData::new(tx);
        let flags = if ctx.require_standard {
            STANDARD_SCRIPT_VERIFY_FLAGS
        } else {
            MANDATORY_SCRIPT_VERIFY_FLAGS
        };
        for (index, (input, coin)) in tx.vin.iter().zip(coins_in).enumerate() {
            let result = verify_script(
                &input.script_sig,
                &coin.script_pubkey,
                &input.witness,
                tx,
                index,
                coin.value,
                flags,
                &txdata,
            );
            if let Err(standard_err) = result {
                // Retry under mandatory flags to tell policy failures
                // from consensus failures.
                let mandatory = verify_script(
                    &input.script_sig,
                    &coin.script_pubkey,
                    &input.witness,
                    tx,
                    index,
                    coin.value,
                    MANDATORY_SCRIPT_VERIFY_FLAGS,
                    &txdata,
                );
                return Err(match mandatory {
                    Ok(()) => MempoolError::new(
                        MempoolErrorKind::NonStandard,
                        format!("non-mandatory-script-verify-flag ({standard_err})"),
                    ),
                    Err(err) => MempoolError::new(
                        MempoolErrorKind::InvalidScript,
                        format!("mandatory-script-verify-flag-failed ({err})"),
                    ),
                });
            }
        }
        if let Some(cache) = script_cache {
            cache.insert(&wtxid, MANDATORY_SCRIPT_VERIFY_FLAGS);
        }
        Ok(())
    }

    fn check_descendant_limits(
        &self,
        ancestors: &HashSet<Hash256>,
        extra_vsize: usize,
    ) -> Result<(), MempoolError> {
        for ancestor in ancestors {
            let descendants = self.calc_descendants(ancestor);
            let total_vsize: usize = descendants
                .iter()
                .filter_map(|txid| self.entries.get(txid))
                .map(|entry| entry.vsize)
                .sum();
            if descendants.len() + 1 > DEFAULT_DESCENDANT_LIMIT
                || total_vsize + extra_vsize > DEFAULT_DESCENDANT_SIZE_LIMIT
            {
                return Err(MempoolError::new(
                    MempoolErrorKind::TooLongChain,
                    "too-long-mempool-chain",
                ));
            }
        }
        Ok(())
    }

    #[cfg(feature = "replacement")]
    fn check_replacement(
        &self,
        tx: &Transaction,
        fee: i64,
        vsize: usize,
        parents: &HashSet<Hash256>,
        conflicts: &HashSet<Hash256>,
    ) -> Result<(), MempoolError> {
        // Every new input must be confirmed.
        if !parents.is_empty() {
            return Err(MempoolError::new(
                MempoolErrorKind::Conflict,
                "replacement-adds-unconfirmed",
            ));
        }
        let mut replaced: HashSet<Hash256> = HashSet::new();
        for conflict in conflicts {
            replaced.extend(self.calc_descendants(conflict));
        }
        if replaced.len() > MAX_REPLACEMENT_CANDIDATES {
            return Err(MempoolError::new(
                MempoolErrorKind::Conflict,
                "too many potential replacements",
            ));
        }
        let mut replaced_fees = 0i64;
        for txid in &replaced {
            let entry = self
                .entries
                .get(txid)
                .ok_or_else(|| MempoolError::new(MempoolErrorKind::Internal, "missing conflict"))?;
            replaced_fees = replaced_fees.saturating_add(entry.modified_fee());
            // Strictly higher fee rate than every direct conflict.
            if conflicts.contains(txid) {
                let left = i128::from(fee) * entry.vsize.max(1) as i128;
                let right = i128::from(entry.modified_fee()) * vsize.max(1) as i128;
                if left <= right {
                    return Err(MempoolError::new(
                        MempoolErrorKind::FeeTooLow,
                        "insufficient fee",
                    ));
                }
            }
        }
        let incremental = INCREMENTAL_RELAY_FEE_PER_KB.saturating_mul(vsize as i64) / 1_000;
        if fee < replaced_fees.saturating_add(incremental) {
            return Err(MempoolError::new(
                MempoolErrorKind::FeeTooLow,
                "insufficient fee",
            ));
        }
        Ok(())
    }

    fn detach(&mut self, txid: &Hash256) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        self.total_vbytes = self.total_vbytes.saturating_sub(entry.vsize);
        self.by_order.remove(&entry.order);
        for input in &entry.tx.vin {
            if self.spent.get(&input.prevout) == Some(txid) {
                self.spent.remove(&input.prevout);
            }
        }
        for parent in &entry.parents {
            if let Some(parent_entry) = self.entries.get_mut(parent) {
                parent_entry.children.remove(txid);
            }
        }
        for child in &entry.children {
            if let Some(child_entry) = self.entries.get_mut(child) {
                child_entry.parents.remove(txid);
            }
        }
        Some(entry)
    }

    /// Remove an entry and everything that descends from it.
    pub fn remove_recursive(&mut self, txid: &Hash256) -> (Vec<Hash256>, Vec<OutPoint>) {
        let mut removed = Vec::new();
        let mut released = Vec::new();
        for victim in self.calc_descendants(txid) {
            if let Some(entry) = self.detach(&victim) {
                released.extend(entry.tx.vin.iter().map(|input| input.prevout));
                removed.push(victim);
            }
        }
        (removed, released)
    }

    /// Drop entries confirmed by a connected block, plus anything that
    /// conflicts with its spends.
    pub fn remove_confirmed(&mut self, block_txs: &[Transaction]) -> Vec<Hash256> {
        let mut removed = Vec::new();
        for tx in block_txs {
            let txid = tx.txid();
            if self.detach(&txid).is_some() {
                removed.push(txid);
            }
            for input in &tx.vin {
                if let Some(conflict) = self.spent.get(&input.prevout).copied() {
                    let (evicted, _) = self.remove_recursive(&conflict);
                    removed.extend(evicted);
                }
            }
        }
        removed
    }

    /// Evict lowest-fee-rate descendant chains until under the byte cap.
    pub fn trim_to_size(&mut self) -> (Vec<Hash256>, Vec<OutPoint>) {
        let mut evicted = Vec::new();
        let mut released = Vec::new();
        while self.total_vbytes > self.max_bytes {
            let worst = self
                .entries
                .values()
                .filter(|entry| entry.children.is_empty())
                .min_by(|a, b| {
                    a.fee_rate_cmp(b)
                        .then_with(|| b.time.cmp(&a.time))
                        .then_with(|| a.txid.cmp(&b.txid))
                })
                .map(|entry| entry.txid);
            let Some(worst) = worst else {
                break;
            };
            if let Some(entry) = self.detach(&worst) {
                released.extend(entry.tx.vin.iter().map(|input| input.prevout));
                evicted.push(worst);
            }
        }
        (evicted, released)
    }

    /// Drop entries older than the expiry window, recursively.
    pub fn expire(&mut self, now: u64) -> Vec<Hash256> {
        let cutoff = now.saturating_sub(self.expiry_secs);
        let stale: Vec<Hash256> = self
            .entries
            .values()
            .filter(|entry| entry.time < cutoff)
            .map(|entry| entry.txid)
            .collect();
        let mut removed = Vec::new();
        for txid in stale {
            let (evicted, _) = self.remove_recursive(&txid);
            removed.extend(evicted);
        }
        removed
    }

    /// Consistency sweep used by tests and `verifychain`: no entry spends
    /// an outpoint another entry spends, and every recorded parent link
    /// matches an actual input.
    pub fn assert_consistent(&self) {
        let mut seen: HashMap<OutPoint, Hash256> = HashMap::new();
        for entry in self.entries.values() {
            for input in &entry.tx.vin {
                if let Some(previous) = seen.insert(input.prevout, entry.txid) {
                    panic!(
                        "mempool outpoint conflict between {:?} and {:?}",
                        previous, entry.txid
                    );
                }
                assert_eq!(self.spent.get(&input.prevout), Some(&entry.txid));
            }
            for parent in &entry.parents {
                assert!(self.entries.contains_key(parent), "dangling parent link");
            }
        }
    }

    /// Versioned persistence image: raw transactions in insertion order
    /// with their arrival time and fee delta.
    pub fn dump(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u32_le(MEMPOOL_DUMP_VERSION);
        encoder.write_var_int(self.len() as u64);
        for entry in self.entries_by_order() {
            encoder.write_var_bytes(&entry.tx.consensus_encode());
            encoder.write_u64_le(entry.time);
            encoder.write_i64_le(entry.fee_delta);
        }
        encoder.into_inner()
    }

    /// Decode a dump produced by [`Mempool::dump`]; entries must be
    /// re-admitted through `try_accept` by the caller.
    pub fn parse_dump(bytes: &[u8]) -> Result<Vec<(Transaction, u64, i64)>, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_u32_le()?;
        if version != MEMPOOL_DUMP_VERSION {
            return Err(DecodeError::TrailingBytes);
        }
        let count = decoder.read_var_int()?;
        if count > 10_000_000 {
            return Err(DecodeError::OversizedLength);
        }
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let raw = decoder.read_var_bytes()?;
            let tx = Transaction::consensus_decode(&raw)?;
            let time = decoder.read_u64_le()?;
            let fee_delta = decoder.read_i64_le()?;
            out.push((tx, time, fee_delta));
        }
        decoder.finish()?;
        Ok(out)
    }
}

pub const MEMPOOL_DUMP_VERSION: u32 = 1;

fn is_final(tx: &Transaction, height: i32, median_time_past: i64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let threshold = if tx.lock_time < plbd_consensus::constants::LOCKTIME_THRESHOLD {
        height as i64
    } else {
        median_time_past
    };
    if (tx.lock_time as i64) < threshold {
        return true;
    }
    tx.vin
        .iter()
        .all(|input| input.sequence == plbd_primitives::TxIn::SEQUENCE_FINAL)
}

/// Weighted signature-op cost: legacy counts scale by the witness factor.
fn sigop_cost(tx: &Transaction, coins_in: &[Coin]) -> u32 {
    let mut cost = 0u32;
    for input in &tx.vin {
        cost += legacy_sigop_count(&input.script_sig, false) * WITNESS_SCALE_FACTOR as u32;
    }
    for output in &tx.vout {
        cost += legacy_sigop_count(&output.script_pubkey, false) * WITNESS_SCALE_FACTOR as u32;
    }
    for (input, coin) in tx.vin.iter().zip(coins_in) {
        if plbd_script::standard::is_p2sh(&coin.script_pubkey) {
            if let Some(redeem) = last_push(&input.script_sig) {
                cost += legacy_sigop_count(redeem, true) * WITNESS_SCALE_FACTOR as u32;
            }
        }
        if !input.witness.is_empty() {
            if let Some(witness_script) = input.witness.last() {
                cost += legacy_sigop_count(witness_script, true);
            }
        }
    }
    cost
}

fn last_push(script: &[u8]) -> Option<&[u8]> {
    let mut pc = 0usize;
    let mut last = None;
    while pc < script.len() {
        match script[pc] {
            len @ 0x01..=0x4b => {
                last = script.get(pc + 1..pc + 1 + len as usize);
                pc += 1 + len as usize;
            }
            0x4c => {
                let len = *script.get(pc + 1)? as usize;
                last = script.get(pc + 2..pc + 2 + len);
                pc += 2 + len;
            }
            _ => pc += 1,
        }
    }
    last
}
