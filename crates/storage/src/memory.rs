use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::{Column, KeyValueStore, StoreError, WriteBatch, WriteOp};

type ColumnMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// Heap-backed store with one map per column; used by tests and as the
/// default backing for the sync engine's bookkeeping.
pub struct MemoryStore {
    columns: [RwLock<ColumnMap>; Column::ALL.len()],
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            columns: std::array::from_fn(|_| RwLock::new(ColumnMap::new())),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn column(&self, column: Column) -> &RwLock<ColumnMap> {
        &self.columns[column.index()]
    }

    pub fn len(&self) -> usize {
        self.columns
            .iter()
            .map(|map| map.read().expect("memory store lock").len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let map = self.column(column).read().expect("memory store lock");
        Ok(map.get(key).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut map = self.column(column).write().expect("memory store lock");
        map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut map = self.column(column).write().expect("memory store lock");
        map.remove(key);
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    self.put(*column, key.as_slice(), value.as_slice())?;
                }
                WriteOp::Delete { column, key } => {
                    self.delete(*column, key.as_slice())?;
                }
            }
        }
        Ok(())
    }

    fn has(&self, column: Column, key: &[u8]) -> Result<bool, StoreError> {
        let map = self.column(column).read().expect("memory store lock");
        Ok(map.contains_key(key))
    }
}
