//! In-memory backend for tests and ephemeral runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::{Column, KeyValueStore, ScanResult, StoreError, WriteBatch, WriteOp};

#[derive(Default)]
pub struct MemoryStore {
    columns: Mutex<HashMap<Column, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_columns<R>(
        &self,
        f: impl FnOnce(&mut HashMap<Column, BTreeMap<Vec<u8>, Vec<u8>>>) -> R,
    ) -> Result<R, StoreError> {
        let mut columns = self
            .columns
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))?;
        Ok(f(&mut columns))
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_columns(|columns| {
            columns
                .get(&column)
                .and_then(|entries| entries.get(key).cloned())
        })
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.with_columns(|columns| {
            columns
                .entry(column)
                .or_default()
                .insert(key.to_vec(), value.to_vec());
        })
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.with_columns(|columns| {
            if let Some(entries) = columns.get_mut(&column) {
                entries.remove(key);
            }
        })
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        self.with_columns(|columns| {
            let Some(entries) = columns.get(&column) else {
                return Vec::new();
            };
            entries
                .range(prefix.to_vec()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        })
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.with_columns(|columns| {
            for op in batch.iter() {
                match op {
                    WriteOp::Put { column, key, value } => {
                        columns
                            .entry(*column)
                            .or_default()
                            .insert(key.as_slice().to_vec(), value.clone());
                    }
                    WriteOp::Delete { column, key } => {
                        if let Some(entries) = columns.get_mut(column) {
                            entries.remove(key.as_slice());
                        }
                    }
                }
            }
        })
    }
}
