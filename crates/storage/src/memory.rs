use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::{Column, KeyValueStore, ScanResult, StoreError, WriteBatch, WriteOp};

type MemoryStoreMap = BTreeMap<(Column, Vec<u8>), Vec<u8>>;

/// BTreeMap-backed store used by tests and the volatile UTXO mode.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreMap>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("memory store lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let guard = self.inner.read().expect("memory store lock");
        Ok(guard.get(&(column, key.to_vec())).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        guard.insert((column, key.to_vec()), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        guard.remove(&(column, key.to_vec()));
        Ok(())
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let guard = self.inner.read().expect("memory store lock");
        let mut results = Vec::new();
        for ((entry_column, key), value) in guard.iter() {
            if *entry_column == column && key.starts_with(prefix) {
                results.push((key.clone(), value.clone()));
            }
        }
        Ok(results)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    guard.insert((*column, key.clone()), value.clone());
                }
                WriteOp::Delete { column, key } => {
                    guard.remove(&(*column, key.clone()));
                }
            }
        }
        Ok(())
    }

    fn clear_column(&self, column: Column) -> Result<(), StoreError> {
        let mut guard = self.inner.write().expect("memory store lock");
        guard.retain(|(entry_column, _), _| *entry_column != column);
        Ok(())
    }

    fn persist(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_applies_in_order() {
        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, b"k".as_slice(), b"1".as_slice());
        batch.delete(Column::Meta, b"k".as_slice());
        batch.put(Column::Meta, b"k".as_slice(), b"2".as_slice());
        store.write_batch(&batch).unwrap();
        assert_eq!(store.get(Column::Meta, b"k").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn columns_are_disjoint() {
        let store = MemoryStore::new();
        store.put(Column::Utxo, b"k", b"utxo").unwrap();
        store.put(Column::Undo, b"k", b"undo").unwrap();
        assert_eq!(store.get(Column::Utxo, b"k").unwrap(), Some(b"utxo".to_vec()));
        store.clear_column(Column::Utxo).unwrap();
        assert_eq!(store.get(Column::Utxo, b"k").unwrap(), None);
        assert_eq!(store.get(Column::Undo, b"k").unwrap(), Some(b"undo".to_vec()));
    }

    #[test]
    fn prefix_scan() {
        let store = MemoryStore::new();
        store.put(Column::Undo, &[0, 1], b"a").unwrap();
        store.put(Column::Undo, &[0, 2], b"b").unwrap();
        store.put(Column::Undo, &[1, 0], b"c").unwrap();
        let hits = store.scan_prefix(Column::Undo, &[0]).unwrap();
        assert_eq!(hits.len(), 2);
    }
}
