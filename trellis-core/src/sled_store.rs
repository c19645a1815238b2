//! sled-backed key-value store
//!
//! One sled tree per [`Table`]. sled provides the single-row CAS, ordered
//! iteration in both directions and atomic read-modify-write the engine
//! needs. Its iterators do not read from a snapshot.

use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;

use crate::kv::{decode_counter, KeyValueStore, KvPair, Result, ScanRange, StorageError, Table};

pub struct SledStore {
    db: sled::Db,
    trees: Vec<sled::Tree>,
}

impl SledStore {
    /// Open or create a store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path).map_err(|e| {
            StorageError::Database(format!("Failed to open sled database at {:?}: {}", path, e))
        })?;
        Self::from_db(db)
    }

    /// Store that is deleted when dropped
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| StorageError::Database(format!("Failed to open temporary store: {}", e)))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let mut trees = Vec::with_capacity(Table::ALL.len());
        for table in Table::ALL {
            let tree = db.open_tree(table.name()).map_err(|e| {
                StorageError::Database(format!("Failed to open table {}: {}", table.name(), e))
            })?;
            trees.push(tree);
        }
        Ok(Self { db, trees })
    }

    fn tree(&self, table: Table) -> &sled::Tree {
        &self.trees[table.index()]
    }

    /// Flush dirty buffers to disk
    pub async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| StorageError::Database(format!("Failed to flush: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for SledStore {
    async fn get(&self, table: Table, key: &[u8]) -> Result<Option<Bytes>> {
        Ok(self
            .tree(table)
            .get(key)
            .map_err(|e| StorageError::Database(format!("Get failed: {}", e)))?
            .map(|v| Bytes::copy_from_slice(&v)))
    }

    async fn put(&self, table: Table, key: &[u8], value: &[u8]) -> Result<()> {
        self.tree(table)
            .insert(key, value)
            .map_err(|e| StorageError::Database(format!("Put failed: {}", e)))?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        table: Table,
        key: &[u8],
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> Result<bool> {
        let outcome = self
            .tree(table)
            .compare_and_swap(key, expected, Some(value))
            .map_err(|e| StorageError::Database(format!("Compare-and-swap failed: {}", e)))?;
        Ok(outcome.is_ok())
    }

    async fn scan(&self, table: Table, range: &ScanRange) -> Result<Vec<KvPair>> {
        if range.is_empty_range() {
            return Ok(Vec::new());
        }
        let iter = self
            .tree(table)
            .range::<Vec<u8>, _>((range.start.clone(), range.end.clone()));
        let limit = range.limit.unwrap_or(usize::MAX);
        let to_pair = |item: sled::Result<(sled::IVec, sled::IVec)>| -> Result<KvPair> {
            let (k, v) = item.map_err(|e| StorageError::Database(format!("Scan failed: {}", e)))?;
            Ok((Bytes::copy_from_slice(&k), Bytes::copy_from_slice(&v)))
        };
        if range.reverse {
            iter.rev().take(limit).map(to_pair).collect()
        } else {
            iter.take(limit).map(to_pair).collect()
        }
    }

    async fn increment(&self, table: Table, key: &[u8], delta: i64) -> Result<i64> {
        let mut malformed = false;
        let updated = self
            .tree(table)
            .update_and_fetch(key, |old| match old {
                None => Some(delta.to_be_bytes().to_vec()),
                Some(bytes) => match decode_counter(bytes) {
                    Some(current) => Some((current + delta).to_be_bytes().to_vec()),
                    None => {
                        malformed = true;
                        Some(bytes.to_vec())
                    }
                },
            })
            .map_err(|e| StorageError::Database(format!("Increment failed: {}", e)))?;
        if malformed {
            return Err(StorageError::Backend(format!(
                "Counter {:?} is not 8 bytes",
                String::from_utf8_lossy(key)
            )));
        }
        updated
            .as_deref()
            .and_then(decode_counter)
            .ok_or_else(|| StorageError::Backend("Increment produced no value".to_string()))
    }
}
