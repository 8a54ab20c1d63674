//! In-memory store used by tests and the `--backend memory` mode.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::{Column, KeyValueStore, PrefixVisitor, ScanResult, StoreError, WriteBatch, WriteOp};

type ColumnMap = BTreeMap<(Column, Vec<u8>), Vec<u8>>;

#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<ColumnMap>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("memory store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries.get(&(column, key.to_vec())).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.insert((column, key.to_vec()), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.remove(&(column, key.to_vec()));
        Ok(())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let entries = self.entries.read().map_err(poisoned)?;
        let mut results = Vec::new();
        for ((col, key), value) in entries.range((column, prefix.to_vec())..) {
            if *col != column || !key.starts_with(prefix) {
                break;
            }
            results.push((key.clone(), value.clone()));
        }
        Ok(results)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        for (key, value) in self.scan_prefix(column, prefix)? {
            visitor(&key, &value)?;
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    entries.insert((*column, key.as_slice().to_vec()), value.clone());
                }
                WriteOp::Delete { column, key } => {
                    entries.remove(&(*column, key.as_slice().to_vec()));
                }
            }
        }
        Ok(())
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Backend("memory store poisoned".to_string())
}

#[cfg(test)]
mod tests {
    use super::MemoryStore;
    use crate::{Column, KeyValueStore, WriteBatch};

    #[test]
    fn batch_applies_atomically_visible() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, b"a".to_vec(), b"1".to_vec());
        batch.put(Column::Meta, b"b".to_vec(), b"2".to_vec());
        batch.delete(Column::Meta, b"a".to_vec());
        store.write_batch(&batch).expect("write");

        assert_eq!(store.get(Column::Meta, b"a").expect("get"), None);
        assert_eq!(
            store.get(Column::Meta, b"b").expect("get"),
            Some(b"2".to_vec())
        );
    }

    #[test]
    fn prefix_scan_is_column_scoped() {
        let store = MemoryStore::new();
        store.put(Column::Coins, b"aa1", b"x").expect("put");
        store.put(Column::Coins, b"aa2", b"y").expect("put");
        store.put(Column::Coins, b"ab1", b"z").expect("put");
        store.put(Column::Meta, b"aa9", b"w").expect("put");

        let results = store.scan_prefix(Column::Coins, b"aa").expect("scan");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, b"aa1".to_vec());
        assert_eq!(results[1].0, b"aa2".to_vec());
    }
}
