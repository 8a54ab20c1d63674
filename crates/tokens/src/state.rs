//! Layered token state.
//!
//! The token tables mirror the coin view stack: a database-backed bottom
//! layer, a long-lived tip cache and per-block overlays, flushed in
//! lockstep with the coins. Balances are tracked per (token, script hash).

use std::collections::HashMap;

use plbd_consensus::Hash256;
use plbd_primitives::encoding::{DecodeError, Decoder, Encoder};
use plbd_primitives::hash::sha256;
use plbd_storage::{Column, KeyValueStore, WriteBatch};

use crate::data::TokenError;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IssuanceRecord {
    pub name: String,
    pub amount: i64,
    pub units: u8,
    pub reissuable: bool,
    pub ipfs: Option<Vec<u8>>,
    pub height: i32,
}

impl IssuanceRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_var_bytes(self.name.as_bytes());
        encoder.write_i64_le(self.amount);
        encoder.write_u8(self.units);
        encoder.write_u8(self.reissuable as u8);
        match &self.ipfs {
            Some(ipfs) => {
                encoder.write_u8(1);
                encoder.write_var_bytes(ipfs);
            }
            None => encoder.write_u8(0),
        }
        encoder.write_i64_le(self.height as i64);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let name = String::from_utf8(decoder.read_var_bytes()?)
            .map_err(|_| DecodeError::TrailingBytes)?;
        let amount = decoder.read_i64_le()?;
        let units = decoder.read_u8()?;
        let reissuable = decoder.read_u8()? != 0;
        let ipfs = if decoder.read_u8()? != 0 {
            Some(decoder.read_var_bytes()?)
        } else {
            None
        };
        let height = decoder.read_i64_le()? as i32;
        decoder.finish()?;
        Ok(Self {
            name,
            amount,
            units,
            reissuable,
            ipfs,
            height,
        })
    }
}

pub fn script_owner_hash(script_pubkey: &[u8]) -> Hash256 {
    sha256(plbd_script::strip_token_data(script_pubkey))
}

/// Dirty entries pushed down one layer on flush. Balances and flags carry
/// their absolute new value; zero or false entries delete.
#[derive(Debug, Default)]
pub struct TokenFlush {
    pub issuances: Vec<(String, Option<IssuanceRecord>)>,
    pub balances: Vec<(String, Hash256, i64)>,
    pub qualifiers: Vec<(String, [u8; 20], bool)>,
    pub address_freezes: Vec<(String, [u8; 20], bool)>,
    pub global_freezes: Vec<(String, bool)>,
    pub verifiers: Vec<(String, Option<String>)>,
}

impl TokenFlush {
    pub fn is_empty(&self) -> bool {
        self.issuances.is_empty()
            && self.balances.is_empty()
            && self.qualifiers.is_empty()
            && self.address_freezes.is_empty()
            && self.global_freezes.is_empty()
            && self.verifiers.is_empty()
    }
}

pub trait TokenView {
    fn issuance(&mut self, name: &str) -> Result<Option<IssuanceRecord>, TokenError>;
    fn balance(&mut self, name: &str, owner: &Hash256) -> Result<i64, TokenError>;
    fn has_qualifier(&mut self, qualifier: &str, address: &[u8; 20]) -> Result<bool, TokenError>;
    fn address_frozen(&mut self, token: &str, address: &[u8; 20]) -> Result<bool, TokenError>;
    fn global_frozen(&mut self, token: &str) -> Result<bool, TokenError>;
    fn verifier(&mut self, token: &str) -> Result<Option<String>, TokenError>;
    fn apply(&mut self, flush: TokenFlush) -> Result<(), TokenError>;
}

impl<V: TokenView + ?Sized> TokenView for &mut V {
    fn issuance(&mut self, name: &str) -> Result<Option<IssuanceRecord>, TokenError> {
        (**self).issuance(name)
    }
    fn balance(&mut self, name: &str, owner: &Hash256) -> Result<i64, TokenError> {
        (**self).balance(name, owner)
    }
    fn has_qualifier(&mut self, qualifier: &str, address: &[u8; 20]) -> Result<bool, TokenError> {
        (**self).has_qualifier(qualifier, address)
    }
    fn address_frozen(&mut self, token: &str, address: &[u8; 20]) -> Result<bool, TokenError> {
        (**self).address_frozen(token, address)
    }
    fn global_frozen(&mut self, token: &str) -> Result<bool, TokenError> {
        (**self).global_frozen(token)
    }
    fn verifier(&mut self, token: &str) -> Result<Option<String>, TokenError> {
        (**self).verifier(token)
    }
    fn apply(&mut self, flush: TokenFlush) -> Result<(), TokenError> {
        (**self).apply(flush)
    }
}

fn balance_key(name: &str, owner: &Hash256) -> Vec<u8> {
    let mut key = Vec::with_capacity(name.len() + 33);
    key.extend_from_slice(name.as_bytes());
    key.push(0);
    key.extend_from_slice(owner);
    key
}

fn tag_key(name: &str, address: &[u8; 20]) -> Vec<u8> {
    let mut key = Vec::with_capacity(name.len() + 21);
    key.extend_from_slice(name.as_bytes());
    key.push(0);
    key.extend_from_slice(address);
    key
}

/// Bottom layer reading the token columns.
pub struct TokensDb<S> {
    store: S,
}

impl<S> TokensDb<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> TokensDb<S> {
    /// Stage a flush into a caller-owned batch; the chain flush commits
    /// coins and tokens in the same write.
    pub fn write_flush(&self, flush: &TokenFlush, batch: &mut WriteBatch) {
        for (name, record) in &flush.issuances {
            match record {
                Some(record) => {
                    batch.put(Column::TokenIssuance, name.as_bytes(), record.encode())
                }
                None => batch.delete(Column::TokenIssuance, name.as_bytes()),
            }
        }
        for (name, owner, amount) in &flush.balances {
            let key = balance_key(name, owner);
            if *amount == 0 {
                batch.delete(Column::TokenBalance, key);
            } else {
                batch.put(Column::TokenBalance, key, amount.to_le_bytes().to_vec());
            }
        }
        for (name, address, present) in &flush.qualifiers {
            let key = tag_key(name, address);
            if *present {
                batch.put(Column::TokenQualifier, key, Vec::new());
            } else {
                batch.delete(Column::TokenQualifier, key);
            }
        }
        for (name, address, frozen) in &flush.address_freezes {
            let key = tag_key(name, address);
            if *frozen {
                batch.put(Column::TokenRestriction, key, Vec::new());
            } else {
                batch.delete(Column::TokenRestriction, key);
            }
        }
        for (name, frozen) in &flush.global_freezes {
            if *frozen {
                batch.put(Column::TokenRestriction, name.as_bytes(), Vec::new());
            } else {
                batch.delete(Column::TokenRestriction, name.as_bytes());
            }
        }
        for (name, verifier) in &flush.verifiers {
            match verifier {
                Some(verifier) => batch.put(
                    Column::TokenVerifier,
                    name.as_bytes(),
                    verifier.as_bytes().to_vec(),
                ),
                None => batch.delete(Column::TokenVerifier, name.as_bytes()),
            }
        }
    }
}

impl<S: KeyValueStore> TokenView for TokensDb<S> {
    fn issuance(&mut self, name: &str) -> Result<Option<IssuanceRecord>, TokenError> {
        match self.store.get(Column::TokenIssuance, name.as_bytes())? {
            Some(bytes) => Ok(Some(IssuanceRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn balance(&mut self, name: &str, owner: &Hash256) -> Result<i64, TokenError> {
        match self.store.get(Column::TokenBalance, &balance_key(name, owner))? {
            Some(bytes) => {
                let bytes: [u8; 8] = bytes.try_into().map_err(|_| TokenError::Malformed)?;
                Ok(i64::from_le_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    fn has_qualifier(&mut self, qualifier: &str, address: &[u8; 20]) -> Result<bool, TokenError> {
        Ok(self
            .store
            .get(Column::TokenQualifier, &tag_key(qualifier, address))?
            .is_some())
    }

    fn address_frozen(&mut self, token: &str, address: &[u8; 20]) -> Result<bool, TokenError> {
        Ok(self
            .store
            .get(Column::TokenRestriction, &tag_key(token, address))?
            .is_some())
    }

    fn global_frozen(&mut self, token: &str) -> Result<bool, TokenError> {
        Ok(self
            .store
            .get(Column::TokenRestriction, token.as_bytes())?
            .is_some())
    }

    fn verifier(&mut self, token: &str) -> Result<Option<String>, TokenError> {
        match self.store.get(Column::TokenVerifier, token.as_bytes())? {
            Some(bytes) => Ok(Some(
                String::from_utf8(bytes).map_err(|_| TokenError::Malformed)?,
            )),
            None => Ok(None),
        }
    }

    fn apply(&mut self, flush: TokenFlush) -> Result<(), TokenError> {
        let mut batch = WriteBatch::new();
        self.write_flush(&flush, &mut batch);
        self.store.write_batch(&batch)?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct Slot<T> {
    value: T,
    dirty: bool,
}

/// Read-through cache over a parent view. Used both as the tip cache (over
/// the database) and as the per-block overlay (over the tip cache).
pub struct TokenCache<P> {
    parent: P,
    issuances: HashMap<String, Slot<Option<IssuanceRecord>>>,
    balances: HashMap<(String, Hash256), Slot<i64>>,
    qualifiers: HashMap<(String, [u8; 20]), Slot<bool>>,
    address_freezes: HashMap<(String, [u8; 20]), Slot<bool>>,
    global_freezes: HashMap<String, Slot<bool>>,
    verifiers: HashMap<String, Slot<Option<String>>>,
}

impl<P: TokenView> TokenCache<P> {
    pub fn new(parent: P) -> Self {
        Self {
            parent,
            issuances: HashMap::new(),
            balances: HashMap::new(),
            qualifiers: HashMap::new(),
            address_freezes: HashMap::new(),
            global_freezes: HashMap::new(),
            verifiers: HashMap::new(),
        }
    }

    pub fn parent_mut(&mut self) -> &mut P {
        &mut self.parent
    }

    pub fn set_issuance(&mut self, record: IssuanceRecord) {
        self.issuances.insert(
            record.name.clone(),
            Slot {
                value: Some(record),
                dirty: true,
            },
        );
    }

    pub fn remove_issuance(&mut self, name: &str) {
        self.issuances.insert(
            name.to_string(),
            Slot {
                value: None,
                dirty: true,
            },
        );
    }

    /// Adjust a balance by `delta`; negative deltas may not take the
    /// balance below zero.
    pub fn credit(
        &mut self,
        name: &str,
        owner: &Hash256,
        delta: i64,
    ) -> Result<i64, TokenError> {
        let current = self.balance(name, owner)?;
        let next = current
            .checked_add(delta)
            .ok_or(TokenError::InvalidAmount)?;
        if next < 0 {
            return Err(TokenError::TransferImbalance(name.to_string()));
        }
        self.balances.insert(
            (name.to_string(), *owner),
            Slot {
                value: next,
                dirty: true,
            },
        );
        Ok(next)
    }

    pub fn set_qualifier(
        &mut self,
        qualifier: &str,
        address: &[u8; 20],
        present: bool,
    ) -> Result<bool, TokenError> {
        let previous = self.has_qualifier(qualifier, address)?;
        self.qualifiers.insert(
            (qualifier.to_string(), *address),
            Slot {
                value: present,
                dirty: true,
            },
        );
        Ok(previous)
    }

    pub fn set_address_freeze(
        &mut self,
        token: &str,
        address: &[u8; 20],
        frozen: bool,
    ) -> Result<bool, TokenError> {
        let previous = self.address_frozen(token, address)?;
        self.address_freezes.insert(
            (token.to_string(), *address),
            Slot {
                value: frozen,
                dirty: true,
            },
        );
        Ok(previous)
    }

    pub fn set_global_freeze(&mut self, token: &str, frozen: bool) -> Result<bool, TokenError> {
        let previous = self.global_frozen(token)?;
        self.global_freezes.insert(
            token.to_string(),
            Slot {
                value: frozen,
                dirty: true,
            },
        );
        Ok(previous)
    }

    pub fn set_verifier(
        &mut self,
        token: &str,
        verifier: Option<String>,
    ) -> Result<Option<String>, TokenError> {
        let previous = self.verifier(token)?;
        self.verifiers.insert(
            token.to_string(),
            Slot {
                value: verifier,
                dirty: true,
            },
        );
        Ok(previous)
    }

    /// Drain every dirty slot for the parent layer and clear the cache.
    pub fn take_flush(&mut self) -> TokenFlush {
        let mut flush = TokenFlush::default();
        for (name, slot) in self.issuances.drain() {
            if slot.dirty {
                flush.issuances.push((name, slot.value));
            }
        }
        for ((name, owner), slot) in self.balances.drain() {
            if slot.dirty {
                flush.balances.push((name, owner, slot.value));
            }
        }
        for ((name, address), slot) in self.qualifiers.drain() {
            if slot.dirty {
                flush.qualifiers.push((name, address, slot.value));
            }
        }
        for ((name, address), slot) in self.address_freezes.drain() {
            if slot.dirty {
                flush.address_freezes.push((name, address, slot.value));
            }
        }
        for (name, slot) in self.global_freezes.drain() {
            if slot.dirty {
                flush.global_freezes.push((name, slot.value));
            }
        }
        for (name, slot) in self.verifiers.drain() {
            if slot.dirty {
                flush.verifiers.push((name, slot.value));
            }
        }
        flush
    }

    /// Push every dirty slot into the parent and clear.
    pub fn flush(&mut self) -> Result<(), TokenError> {
        let flush = self.take_flush();
        if flush.is_empty() {
            return Ok(());
        }
        self.parent.apply(flush)
    }

    /// Discard all cached and pending state.
    pub fn discard(&mut self) {
        self.issuances.clear();
        self.balances.clear();
        self.qualifiers.clear();
        self.address_freezes.clear();
        self.global_freezes.clear();
        self.verifiers.clear();
    }
}

impl<P: TokenView> TokenView for TokenCache<P> {
    fn issuance(&mut self, name: &str) -> Result<Option<IssuanceRecord>, TokenError> {
        if let Some(slot) = self.issuances.get(name) {
            return Ok(slot.value.clone());
        }
        let value = self.parent.issuance(name)?;
        self.issuances.insert(
            name.to_string(),
            Slot {
                value: value.clone(),
                dirty: false,
            },
        );
        Ok(value)
    }

    fn balance(&mut self, name: &str, owner: &Hash256) -> Result<i64, TokenError> {
        let key = (name.to_string(), *owner);
        if let Some(slot) = self.balances.get(&key) {
            return Ok(slot.value);
        }
        let value = self.parent.balance(name, owner)?;
        self.balances.insert(
            key,
            Slot {
                value,
                dirty: false,
            },
        );
        Ok(value)
    }

    fn has_qualifier(&mut self, qualifier: &str, address: &[u8; 20]) -> Result<bool, TokenError> {
        let key = (qualifier.to_string(), *address);
        if let Some(slot) = self.qualifiers.get(&key) {
            return Ok(slot.value);
        }
        let value = self.parent.has_qualifier(qualifier, address)?;
        self.qualifiers.insert(
            key,
            Slot {
                value,
                dirty: false,
            },
        );
        Ok(value)
    }

    fn address_frozen(&mut self, token: &str, address: &[u8; 20]) -> Result<bool, TokenError> {
        let key = (token.to_string(), *address);
        if let Some(slot) = self.address_freezes.get(&key) {
            return Ok(slot.value);
        }
        let value = self.parent.address_frozen(token, address)?;
        self.address_freezes.insert(
            key,
            Slot {
                value,
                dirty: false,
            },
        );
        Ok(value)
    }

    fn global_frozen(&mut self, token: &str) -> Result<bool, TokenError> {
        if let Some(slot) = self.global_freezes.get(token) {
            return Ok(slot.value);
        }
        let value = self.parent.global_frozen(token)?;
        self.global_freezes.insert(
            token.to_string(),
            Slot {
                value,
                dirty: false,
            },
        );
        Ok(value)
    }

    fn verifier(&mut self, token: &str) -> Result<Option<String>, TokenError> {
        if let Some(slot) = self.verifiers.get(token) {
            return Ok(slot.value.clone());
        }
        let value = self.parent.verifier(token)?;
        self.verifiers.insert(
            token.to_string(),
            Slot {
                value: value.clone(),
                dirty: false,
            },
        );
        Ok(value)
    }

    fn apply(&mut self, flush: TokenFlush) -> Result<(), TokenError> {
        for (name, record) in flush.issuances {
            self.issuances.insert(
                name,
                Slot {
                    value: record,
                    dirty: true,
                },
            );
        }
        for (name, owner, amount) in flush.balances {
            self.balances.insert(
                (name, owner),
                Slot {
                    value: amount,
                    dirty: true,
                },
            );
        }
        for (name, address, present) in flush.qualifiers {
            self.qualifiers.insert(
                (name, address),
                Slot {
                    value: present,
                    dirty: true,
                },
            );
        }
        for (name, address, frozen) in flush.address_freezes {
            self.address_freezes.insert(
                (name, address),
                Slot {
                    value: frozen,
                    dirty: true,
                },
            );
        }
        for (name, frozen) in flush.global_freezes {
            self.global_freezes.insert(
                name,
                Slot {
                    value: frozen,
                    dirty: true,
                },
            );
        }
        for (name, verifier) in flush.verifiers {
            self.verifiers.insert(
                name,
                Slot {
                    value: verifier,
                    dirty: true,
                },
            );
        }
        Ok(())
    }
}

/// Reversal entries for one block, recorded in connect order and applied
/// in reverse on disconnect.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TokenUndoOp {
    /// Re-add units removed by a spend.
    Credit {
        name: String,
        owner: Hash256,
        amount: i64,
    },
    /// Remove units added by an output.
    Debit {
        name: String,
        owner: Hash256,
        amount: i64,
    },
    RemoveIssuance {
        name: String,
    },
    RestoreIssuance {
        record: IssuanceRecord,
    },
    SetQualifier {
        qualifier: String,
        address: [u8; 20],
        present: bool,
    },
    SetAddressFreeze {
        token: String,
        address: [u8; 20],
        frozen: bool,
    },
    SetGlobalFreeze {
        token: String,
        frozen: bool,
    },
    SetVerifier {
        token: String,
        verifier: Option<String>,
    },
}

impl TokenUndoOp {
    pub fn encode_into(&self, encoder: &mut Encoder) {
        match self {
            TokenUndoOp::Credit {
                name,
                owner,
                amount,
            } => {
                encoder.write_u8(0);
                encoder.write_var_bytes(name.as_bytes());
                encoder.write_bytes(owner);
                encoder.write_i64_le(*amount);
            }
            TokenUndoOp::Debit {
                name,
                owner,
                amount,
            } => {
                encoder.write_u8(1);
                encoder.write_var_bytes(name.as_bytes());
                encoder.write_bytes(owner);
                encoder.write_i64_le(*amount);
            }
            TokenUndoOp::RemoveIssuance { name } => {
                encoder.write_u8(2);
                encoder.write_var_bytes(name.as_bytes());
            }
            TokenUndoOp::RestoreIssuance { record } => {
                encoder.write_u8(3);
                encoder.write_var_bytes(&record.encode());
            }
            TokenUndoOp::SetQualifier {
                qualifier,
                address,
                present,
            } => {
                encoder.write_u8(4);
                encoder.write_var_bytes(qualifier.as_bytes());
                encoder.write_bytes(address);
                encoder.write_u8(*present as u8);
            }
            TokenUndoOp::SetAddressFreeze {
                token,
                address,
                frozen,
            } => {
                encoder.write_u8(5);
                encoder.write_var_bytes(token.as_bytes());
                encoder.write_bytes(address);
                encoder.write_u8(*frozen as u8);
            }
            TokenUndoOp::SetGlobalFreeze { token, frozen } => {
                encoder.write_u8(6);
                encoder.write_var_bytes(token.as_bytes());
                encoder.write_u8(*frozen as u8);
            }
            TokenUndoOp::SetVerifier { token, verifier } => {
                encoder.write_u8(7);
                encoder.write_var_bytes(token.as_bytes());
                match verifier {
                    Some(verifier) => {
                        encoder.write_u8(1);
                        encoder.write_var_bytes(verifier.as_bytes());
                    }
                    None => encoder.write_u8(0),
                }
            }
        }
    }

    pub fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, TokenError> {
        let kind = decoder.read_u8()?;
        let read_name = |decoder: &mut Decoder<'_>| -> Result<String, TokenError> {
            String::from_utf8(decoder.read_var_bytes()?).map_err(|_| TokenError::Malformed)
        };
        let op = match kind {
            0 | 1 => {
                let name = read_name(decoder)?;
                let owner = decoder.read_fixed::<32>()?;
                let amount = decoder.read_i64_le()?;
                if kind == 0 {
                    TokenUndoOp::Credit {
                        name,
                        owner,
                        amount,
                    }
                } else {
                    TokenUndoOp::Debit {
                        name,
                        owner,
                        amount,
                    }
                }
            }
            2 => TokenUndoOp::RemoveIssuance {
                name: read_name(decoder)?,
            },
            3 => {
                let bytes = decoder.read_var_bytes()?;
                TokenUndoOp::RestoreIssuance {
                    record: IssuanceRecord::decode(&bytes)?,
                }
            }
            4 => TokenUndoOp::SetQualifier {
                qualifier: read_name(decoder)?,
                address: decoder.read_fixed::<20>()?,
                present: decoder.read_u8()? != 0,
            },
            5 => TokenUndoOp::SetAddressFreeze {
                token: read_name(decoder)?,
                address: decoder.read_fixed::<20>()?,
                frozen: decoder.read_u8()? != 0,
            },
            6 => TokenUndoOp::SetGlobalFreeze {
                token: read_name(decoder)?,
                frozen: decoder.read_u8()? != 0,
            },
            7 => {
                let token = read_name(decoder)?;
                let verifier = if decoder.read_u8()? != 0 {
                    Some(
                        String::from_utf8(decoder.read_var_bytes()?)
                            .map_err(|_| TokenError::Malformed)?,
                    )
                } else {
                    None
                };
                TokenUndoOp::SetVerifier { token, verifier }
            }
            _ => return Err(TokenError::Malformed),
        };
        Ok(op)
    }

    /// Apply this reversal against a cache layer.
    pub fn apply<P: TokenView>(&self, cache: &mut TokenCache<P>) -> Result<(), TokenError> {
        match self {
            TokenUndoOp::Credit {
                name,
                owner,
                amount,
            } => {
                cache.credit(name, owner, *amount)?;
            }
            TokenUndoOp::Debit {
                name,
                owner,
                amount,
            } => {
                cache.credit(name, owner, -*amount)?;
            }
            TokenUndoOp::RemoveIssuance { name } => cache.remove_issuance(name),
            TokenUndoOp::RestoreIssuance { record } => cache.set_issuance(record.clone()),
            TokenUndoOp::SetQualifier {
                qualifier,
                address,
                present,
            } => {
                cache.set_qualifier(qualifier, address, *present)?;
            }
            TokenUndoOp::SetAddressFreeze {
                token,
                address,
                frozen,
            } => {
                cache.set_address_freeze(token, address, *frozen)?;
            }
            TokenUndoOp::SetGlobalFreeze { token, frozen } => {
                cache.set_global_freeze(token, *frozen)?;
            }
            TokenUndoOp::SetVerifier { token, verifier } => {
                cache.set_verifier(token, verifier.clone())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{IssuanceRecord, TokenCache, TokenUndoOp, TokenView, TokensDb};
    use plbd_primitives::encoding::{Decoder, Encoder};
    use plbd_storage::memory::MemoryStore;
    use std::sync::Arc;

    fn record(name: &str, amount: i64) -> IssuanceRecord {
        IssuanceRecord {
            name: name.to_string(),
            amount,
            units: 0,
            reissuable: true,
            ipfs: None,
            height: 5,
        }
    }

    #[test]
    fn cache_reads_through_and_flushes_down() {
        let store = Arc::new(MemoryStore::new());
        let mut db = TokensDb::new(Arc::clone(&store));
        let mut tip = TokenCache::new(&mut db);

        tip.set_issuance(record("PLBGOLD", 1_000));
        tip.credit("PLBGOLD", &[1u8; 32], 1_000).expect("credit");

        {
            let mut overlay = TokenCache::new(&mut tip);
            assert_eq!(
                overlay.issuance("PLBGOLD").expect("issuance").unwrap().amount,
                1_000
            );
            overlay.credit("PLBGOLD", &[1u8; 32], -400).expect("debit");
            overlay.credit("PLBGOLD", &[2u8; 32], 400).expect("credit");
            overlay.flush().expect("overlay flush");
        }

        assert_eq!(tip.balance("PLBGOLD", &[1u8; 32]).expect("balance"), 600);
        tip.flush().expect("tip flush");

        let mut fresh = TokensDb::new(store);
        assert_eq!(fresh.balance("PLBGOLD", &[2u8; 32]).expect("balance"), 400);
        assert_eq!(
            fresh.issuance("PLBGOLD").expect("issuance").unwrap().amount,
            1_000
        );
    }

    #[test]
    fn overspend_rejected() {
        let store = MemoryStore::new();
        let mut db = TokensDb::new(store);
        let mut cache = TokenCache::new(&mut db);
        cache.credit("PLBGOLD", &[1u8; 32], 100).expect("credit");
        assert!(cache.credit("PLBGOLD", &[1u8; 32], -200).is_err());
    }

    #[test]
    fn undo_ops_roundtrip() {
        let ops = vec![
            TokenUndoOp::Credit {
                name: "PLBGOLD".to_string(),
                owner: [3u8; 32],
                amount: 77,
            },
            TokenUndoOp::RestoreIssuance {
                record: record("PLBGOLD", 50),
            },
            TokenUndoOp::SetVerifier {
                token: "$LTD".to_string(),
                verifier: Some("#KYC".to_string()),
            },
        ];
        let mut encoder = Encoder::new();
        for op in &ops {
            op.encode_into(&mut encoder);
        }
        let bytes = encoder.into_inner();
        let mut decoder = Decoder::new(&bytes);
        for op in &ops {
            let decoded = TokenUndoOp::decode_from(&mut decoder).expect("decode");
            assert_eq!(&decoded, op);
        }
        assert!(decoder.is_empty());
    }
}
