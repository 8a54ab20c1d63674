//! Secondary indices: transactions, addresses, spent outputs, timestamps.
//!
//! All of them are optional write amplification over the chain state and
//! are maintained inside the connect/disconnect batches. Enablement flags
//! persist in the meta column so a restart notices mismatched history.

use plbd_consensus::Hash256;
use plbd_primitives::encoding::{DecodeError, Decoder, Encoder};
use plbd_primitives::hash::sha256;
use plbd_primitives::OutPoint;
use plbd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::flatfiles::FileLocation;

pub const FLAG_TXINDEX: &[u8] = b"txindex";
pub const FLAG_ADDRESSINDEX: &[u8] = b"addressindex";
pub const FLAG_TOKENINDEX: &[u8] = b"tokenindex";
pub const FLAG_TIMESTAMPINDEX: &[u8] = b"timestampindex";
pub const FLAG_SPENTINDEX: &[u8] = b"spentindex";
pub const FLAG_PRUNED: &[u8] = b"prunedblockfiles";
pub const REINDEX_SENTINEL: &[u8] = b"reindexing";

pub fn read_flag<S: KeyValueStore>(store: &S, flag: &[u8]) -> Result<bool, StoreError> {
    Ok(store.get(Column::Meta, flag)?.map(|v| v == [1]).unwrap_or(false))
}

pub fn write_flag(batch: &mut WriteBatch, flag: &[u8], value: bool) {
    batch.put(Column::Meta, flag.to_vec(), vec![value as u8]);
}

pub fn script_hash(script_pubkey: &[u8]) -> Hash256 {
    sha256(plbd_script::strip_token_data(script_pubkey))
}

/// txid → block location + position inside the block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TxLocation {
    pub block: FileLocation,
    pub index: u32,
}

impl TxLocation {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(20);
        self.block.encode_into(&mut encoder);
        encoder.write_u32_le(self.index);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let block = FileLocation::decode_from(&mut decoder)?;
        let index = decoder.read_u32_le()?;
        decoder.finish()?;
        Ok(Self { block, index })
    }
}

pub struct TxIndex<S> {
    store: S,
}

impl<S> TxIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn insert(&self, batch: &mut WriteBatch, txid: &Hash256, location: TxLocation) {
        batch.put(Column::TxIndex, txid.to_vec(), location.encode());
    }

    pub fn delete(&self, batch: &mut WriteBatch, txid: &Hash256) {
        batch.delete(Column::TxIndex, txid.to_vec());
    }
}

impl<S: KeyValueStore> TxIndex<S> {
    pub fn get(&self, txid: &Hash256) -> Result<Option<TxLocation>, StoreError> {
        match self.store.get(Column::TxIndex, txid)? {
            Some(bytes) => TxLocation::decode(&bytes)
                .map(Some)
                .map_err(|err| StoreError::Backend(err.to_string())),
            None => Ok(None),
        }
    }
}

/// One row per output affecting an address, keyed for height-range scans:
/// `script_hash ‖ height(BE) ‖ outpoint`; the value carries the amount,
/// spent flag and the token the output moves (empty for the base coin).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddressDelta {
    pub amount: i64,
    pub spending: bool,
    pub token: String,
}

impl AddressDelta {
    fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i64_le(self.amount);
        encoder.write_u8(self.spending as u8);
        encoder.write_var_bytes(self.token.as_bytes());
        encoder.into_inner()
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let amount = decoder.read_i64_le()?;
        let spending = decoder.read_u8()? != 0;
        let token = String::from_utf8(decoder.read_var_bytes()?)
            .map_err(|_| DecodeError::TrailingBytes)?;
        decoder.finish()?;
        Ok(Self {
            amount,
            spending,
            token,
        })
    }
}

fn delta_key(script_hash: &Hash256, height: i32, outpoint: &OutPoint, spending: bool) -> Vec<u8> {
    let mut key = Vec::with_capacity(73);
    key.extend_from_slice(script_hash);
    key.extend_from_slice(&(height as u32).to_be_bytes());
    key.extend_from_slice(&outpoint.key());
    key.push(spending as u8);
    key
}

fn unspent_key(script_hash: &Hash256, outpoint: &OutPoint) -> Vec<u8> {
    let mut key = Vec::with_capacity(68);
    key.extend_from_slice(script_hash);
    key.extend_from_slice(&outpoint.key());
    key
}

pub struct AddressIndex<S> {
    store: S,
}

impl<S> AddressIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn record_output(
        &self,
        batch: &mut WriteBatch,
        script_pubkey: &[u8],
        height: i32,
        outpoint: &OutPoint,
        amount: i64,
        token: &str,
    ) {
        let hash = script_hash(script_pubkey);
        let delta = AddressDelta {
            amount,
            spending: false,
            token: token.to_string(),
        };
        batch.put(
            Column::AddressIndex,
            delta_key(&hash, height, outpoint, false),
            delta.encode(),
        );
        batch.put(
            Column::AddressUnspent,
            unspent_key(&hash, outpoint),
            delta.encode(),
        );
    }

    pub fn record_spend(
        &self,
        batch: &mut WriteBatch,
        script_pubkey: &[u8],
        height: i32,
        outpoint: &OutPoint,
        amount: i64,
        token: &str,
    ) {
        let hash = script_hash(script_pubkey);
        let delta = AddressDelta {
            amount: -amount,
            spending: true,
            token: token.to_string(),
        };
        batch.put(
            Column::AddressIndex,
            delta_key(&hash, height, outpoint, true),
            delta.encode(),
        );
        batch.delete(Column::AddressUnspent, unspent_key(&hash, outpoint));
    }

    /// Reverse of `record_output` during disconnect.
    pub fn erase_output(
        &self,
        batch: &mut WriteBatch,
        script_pubkey: &[u8],
        height: i32,
        outpoint: &OutPoint,
    ) {
        let hash = script_hash(script_pubkey);
        batch.delete(Column::AddressIndex, delta_key(&hash, height, outpoint, false));
        batch.delete(Column::AddressUnspent, unspent_key(&hash, outpoint));
    }

    /// Reverse of `record_spend` during disconnect: the delta row goes
    /// away and the output becomes unspent again.
    pub fn erase_spend(
        &self,
        batch: &mut WriteBatch,
        script_pubkey: &[u8],
        height: i32,
        outpoint: &OutPoint,
        amount: i64,
        token: &str,
    ) {
        let hash = script_hash(script_pubkey);
        batch.delete(Column::AddressIndex, delta_key(&hash, height, outpoint, true));
        let delta = AddressDelta {
            amount,
            spending: false,
            token: token.to_string(),
        };
        batch.put(
            Column::AddressUnspent,
            unspent_key(&hash, outpoint),
            delta.encode(),
        );
    }
}

impl<S: KeyValueStore> AddressIndex<S> {
    pub fn unspent(&self, script_pubkey: &[u8]) -> Result<Vec<(OutPoint, i64, String)>, StoreError> {
        let hash = script_hash(script_pubkey);
        let entries = self.store.scan_prefix(Column::AddressUnspent, &hash)?;
        let mut outpoints = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            if key.len() != 68 {
                continue;
            }
            let Some(outpoint) = OutPoint::from_key(&key[32..68]) else {
                continue;
            };
            let delta = AddressDelta::decode(&value)
                .map_err(|err| StoreError::Backend(err.to_string()))?;
            outpoints.push((outpoint, delta.amount, delta.token));
        }
        Ok(outpoints)
    }

    pub fn deltas(
        &self,
        script_pubkey: &[u8],
    ) -> Result<Vec<(i32, OutPoint, AddressDelta)>, StoreError> {
        let hash = script_hash(script_pubkey);
        let entries = self.store.scan_prefix(Column::AddressIndex, &hash)?;
        let mut deltas = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            if key.len() != 73 {
                continue;
            }
            let height = u32::from_be_bytes(key[32..36].try_into().expect("length checked")) as i32;
            let Some(outpoint) = OutPoint::from_key(&key[36..72]) else {
                continue;
            };
            let delta = AddressDelta::decode(&value)
                .map_err(|err| StoreError::Backend(err.to_string()))?;
            deltas.push((height, outpoint, delta));
        }
        Ok(deltas)
    }
}

/// prevout → the transaction input that consumed it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SpentIndexValue {
    pub txid: Hash256,
    pub input_index: u32,
    pub block_height: u32,
}

impl SpentIndexValue {
    pub fn encode(&self) -> [u8; 40] {
        let mut out = [0u8; 40];
        out[0..32].copy_from_slice(&self.txid);
        out[32..36].copy_from_slice(&self.input_index.to_le_bytes());
        out[36..40].copy_from_slice(&self.block_height.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 40 {
            return None;
        }
        let mut txid = [0u8; 32];
        txid.copy_from_slice(&bytes[0..32]);
        let input_index = u32::from_le_bytes(bytes[32..36].try_into().ok()?);
        let block_height = u32::from_le_bytes(bytes[36..40].try_into().ok()?);
        Some(Self {
            txid,
            input_index,
            block_height,
        })
    }
}

pub struct SpentIndex<S> {
    store: S,
}

impl<S> SpentIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn insert(&self, batch: &mut WriteBatch, outpoint: &OutPoint, value: SpentIndexValue) {
        batch.put(Column::SpentIndex, outpoint.key(), value.encode().to_vec());
    }

    pub fn delete(&self, batch: &mut WriteBatch, outpoint: &OutPoint) {
        batch.delete(Column::SpentIndex, outpoint.key());
    }
}

impl<S: KeyValueStore> SpentIndex<S> {
    pub fn get(&self, outpoint: &OutPoint) -> Result<Option<SpentIndexValue>, StoreError> {
        let bytes = match self.store.get(Column::SpentIndex, &outpoint.key())? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        SpentIndexValue::decode(&bytes)
            .ok_or_else(|| StoreError::Backend("invalid spent index entry".to_string()))
            .map(Some)
    }
}

/// `time(BE) ‖ hash` rows for block-time range queries.
pub struct TimestampIndex<S> {
    store: S,
}

impl<S> TimestampIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn insert(&self, batch: &mut WriteBatch, time: u32, hash: &Hash256) {
        let mut key = Vec::with_capacity(36);
        key.extend_from_slice(&time.to_be_bytes());
        key.extend_from_slice(hash);
        batch.put(Column::TimestampIndex, key, Vec::new());
    }

    pub fn delete(&self, batch: &mut WriteBatch, time: u32, hash: &Hash256) {
        let mut key = Vec::with_capacity(36);
        key.extend_from_slice(&time.to_be_bytes());
        key.extend_from_slice(hash);
        batch.delete(Column::TimestampIndex, key);
    }
}

impl<S: KeyValueStore> TimestampIndex<S> {
    /// Hashes of blocks whose time lies in `[from, to]`, ascending.
    pub fn range(&self, from: u32, to: u32) -> Result<Vec<(u32, Hash256)>, StoreError> {
        let mut results = Vec::new();
        let mut visitor = |key: &[u8], _value: &[u8]| {
            if key.len() == 36 {
                let time = u32::from_be_bytes(key[0..4].try_into().expect("length checked"));
                if time >= from && time <= to {
                    let hash: Hash256 = key[4..36].try_into().expect("length checked");
                    results.push((time, hash));
                }
            }
            Ok(())
        };
        self.store
            .for_each_prefix(Column::TimestampIndex, &[], &mut visitor)?;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::{AddressIndex, SpentIndex, SpentIndexValue, TimestampIndex, TxIndex, TxLocation};
    use crate::flatfiles::FileLocation;
    use plbd_primitives::OutPoint;
    use plbd_storage::memory::MemoryStore;
    use plbd_storage::{KeyValueStore, WriteBatch};
    use std::sync::Arc;

    #[test]
    fn tx_index_roundtrip() {
        let store = Arc::new(MemoryStore::new());
        let index = TxIndex::new(Arc::clone(&store));
        let location = TxLocation {
            block: FileLocation {
                file_id: 2,
                offset: 1_024,
                len: 300,
            },
            index: 5,
        };
        let mut batch = WriteBatch::new();
        index.insert(&mut batch, &[9u8; 32], location);
        store.write_batch(&batch).expect("commit");
        assert_eq!(index.get(&[9u8; 32]).expect("get"), Some(location));
    }

    #[test]
    fn address_index_tracks_unspent_set() {
        let store = Arc::new(MemoryStore::new());
        let index = AddressIndex::new(Arc::clone(&store));
        let script = vec![0x76, 0xa9];
        let outpoint = OutPoint {
            hash: [1u8; 32],
            index: 0,
        };

        let mut batch = WriteBatch::new();
        index.record_output(&mut batch, &script, 10, &outpoint, 500, "");
        store.write_batch(&batch).expect("commit");
        let unspent = index.unspent(&script).expect("scan");
        assert_eq!(unspent, vec![(outpoint, 500, String::new())]);

        let mut batch = WriteBatch::new();
        index.record_spend(&mut batch, &script, 11, &outpoint, 500, "");
        store.write_batch(&batch).expect("commit");
        assert!(index.unspent(&script).expect("scan").is_empty());
        // Two delta rows survive: the funding and the spend.
        assert_eq!(index.deltas(&script).expect("deltas").len(), 2);

        let mut batch = WriteBatch::new();
        index.erase_spend(&mut batch, &script, 11, &outpoint, 500, "");
        store.write_batch(&batch).expect("commit");
        assert_eq!(index.unspent(&script).expect("scan").len(), 1);
    }

    #[test]
    fn spent_index_roundtrip() {
        let store = Arc::new(MemoryStore::new());
        let index = SpentIndex::new(Arc::clone(&store));
        let outpoint = OutPoint {
            hash: [4u8; 32],
            index: 2,
        };
        let value = SpentIndexValue {
            txid: [8u8; 32],
            input_index: 1,
            block_height: 77,
        };
        let mut batch = WriteBatch::new();
        index.insert(&mut batch, &outpoint, value);
        store.write_batch(&batch).expect("commit");
        assert_eq!(index.get(&outpoint).expect("get"), Some(value));
    }

    #[test]
    fn timestamp_range_query() {
        let store = Arc::new(MemoryStore::new());
        let index = TimestampIndex::new(Arc::clone(&store));
        let mut batch = WriteBatch::new();
        index.insert(&mut batch, 100, &[1u8; 32]);
        index.insert(&mut batch, 200, &[2u8; 32]);
        index.insert(&mut batch, 300, &[3u8; 32]);
        store.write_batch(&batch).expect("commit");

        let hits = index.range(150, 250).expect("range");
        assert_eq!(hits, vec![(200, [2u8; 32])]);
    }
}
