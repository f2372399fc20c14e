use std::path::Path;

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use crate::{Column, KeyValueStore, StoreError, WriteBatch, WriteOp};

pub struct FjallStore {
    keyspace: Keyspace,
    partitions: Vec<PartitionHandle>,
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_config(Config::new(path))
    }

    pub fn open_with_config(config: Config) -> Result<Self, StoreError> {
        let keyspace = config.open().map_err(map_err)?;
        let mut partitions = Vec::with_capacity(Column::ALL.len());
        for column in Column::ALL {
            let handle = keyspace
                .open_partition(column.as_str(), PartitionCreateOptions::default())
                .map_err(map_err)?;
            partitions.push(handle);
        }
        Ok(Self {
            keyspace,
            partitions,
        })
    }

    fn partition(&self, column: Column) -> &PartitionHandle {
        &self.partitions[column.index()]
    }

    pub fn persist(&self) -> Result<(), StoreError> {
        self.keyspace
            .persist(PersistMode::SyncAll)
            .map_err(map_err)
    }
}

impl KeyValueStore for FjallStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self.partition(column).get(key).map_err(map_err)?;
        Ok(value.map(|slice| slice.to_vec()))
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.partition(column).insert(key, value).map_err(map_err)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.partition(column).remove(key).map_err(map_err)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut inner = self.keyspace.batch();
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    inner.insert(self.partition(*column), key.as_slice(), value.as_slice());
                }
                WriteOp::Delete { column, key } => {
                    inner.remove(self.partition(*column), key.as_slice());
                }
            }
        }
        inner.commit().map_err(map_err)
    }

    fn has(&self, column: Column, key: &[u8]) -> Result<bool, StoreError> {
        self.partition(column)
            .contains_key(key)
            .map_err(map_err)
    }
}

fn map_err(err: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(err.to_string())
}
