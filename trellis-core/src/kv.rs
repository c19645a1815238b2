//! Key-value storage abstraction
//!
//! The engine runs on an ordered key-value substrate that offers only
//! single-row atomicity:
//! - point get and put
//! - compare-and-swap against the previous value (including put-if-absent)
//! - ordered range scans, optionally reversed and bounded
//! - atomic increment of an 8-byte big-endian counter
//!
//! Scans are not point-in-time snapshots. Callers that need a consistent
//! view must build it themselves.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Mutex;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Logical tables. Each maps to its own keyspace in the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Branches,
    Files,
    Folders,
    Commits,
    Merges,
    Repos,
}

impl Table {
    pub const ALL: [Table; 6] = [
        Table::Branches,
        Table::Files,
        Table::Folders,
        Table::Commits,
        Table::Merges,
        Table::Repos,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Table::Branches => "branches",
            Table::Files => "files",
            Table::Folders => "folders",
            Table::Commits => "commits",
            Table::Merges => "merges",
            Table::Repos => "repos",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// A key range to scan, with direction and an optional row limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRange {
    pub start: Bound<Vec<u8>>,
    pub end: Bound<Vec<u8>>,
    pub reverse: bool,
    pub limit: Option<usize>,
}

impl ScanRange {
    /// Every key starting with `prefix`.
    pub fn prefix(prefix: &[u8]) -> Self {
        let end = match prefix_successor(prefix) {
            Some(next) => Bound::Excluded(next),
            None => Bound::Unbounded,
        };
        Self::between(Bound::Included(prefix.to_vec()), end)
    }

    pub fn between(start: Bound<Vec<u8>>, end: Bound<Vec<u8>>) -> Self {
        Self {
            start,
            end,
            reverse: false,
            limit: None,
        }
    }

    /// `[start, end]`
    pub fn inclusive(start: Vec<u8>, end: Vec<u8>) -> Self {
        Self::between(Bound::Included(start), Bound::Included(end))
    }

    /// Iterate from the end of the range towards the start.
    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// True when no key can satisfy both bounds.
    pub fn is_empty_range(&self) -> bool {
        match (&self.start, &self.end) {
            (Bound::Included(s), Bound::Included(e)) => s > e,
            (Bound::Included(s), Bound::Excluded(e))
            | (Bound::Excluded(s), Bound::Included(e))
            | (Bound::Excluded(s), Bound::Excluded(e)) => s >= e,
            _ => false,
        }
    }
}

/// Smallest key greater than every key with this prefix.
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut next = prefix.to_vec();
    while let Some(last) = next.pop() {
        if last < u8::MAX {
            next.push(last + 1);
            return Some(next);
        }
    }
    None
}

/// Counter values are stored as 8-byte big-endian integers.
pub(crate) fn decode_counter(value: &[u8]) -> Option<i64> {
    let arr: [u8; 8] = value.try_into().ok()?;
    Some(i64::from_be_bytes(arr))
}

pub type KvPair = (Bytes, Bytes);

/// Ordered key-value store with single-row atomic operations
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get a row's value
    async fn get(&self, table: Table, key: &[u8]) -> Result<Option<Bytes>>;

    /// Unconditionally write a row
    async fn put(&self, table: Table, key: &[u8], value: &[u8]) -> Result<()>;

    /// Write `value` only if the row currently holds exactly `expected`
    /// (`None` meaning absent). Returns whether the write happened.
    async fn compare_and_swap(
        &self,
        table: Table,
        key: &[u8],
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> Result<bool>;

    /// Write only if the row does not exist yet
    async fn put_if_absent(&self, table: Table, key: &[u8], value: &[u8]) -> Result<bool> {
        self.compare_and_swap(table, key, None, value).await
    }

    /// Rows within `range`, in key order (or reverse key order)
    async fn scan(&self, table: Table, range: &ScanRange) -> Result<Vec<KvPair>>;

    /// Atomically add `delta` to a counter row (missing counts as 0).
    /// Returns the new value.
    async fn increment(&self, table: Table, key: &[u8], delta: i64) -> Result<i64>;
}

/// In-memory store backed by ordered maps, for tests and tooling
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<HashMap<Table, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_table<T>(
        &self,
        table: Table,
        f: impl FnOnce(&mut BTreeMap<Vec<u8>, Vec<u8>>) -> Result<T>,
    ) -> Result<T> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| StorageError::Backend("Memory store lock poisoned".to_string()))?;
        f(tables.entry(table).or_default())
    }
}

fn borrowed(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    bound.as_ref().map(|v| v.as_slice())
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, table: Table, key: &[u8]) -> Result<Option<Bytes>> {
        self.with_table(table, |map| Ok(map.get(key).map(|v| Bytes::from(v.clone()))))
    }

    async fn put(&self, table: Table, key: &[u8], value: &[u8]) -> Result<()> {
        self.with_table(table, |map| {
            map.insert(key.to_vec(), value.to_vec());
            Ok(())
        })
    }

    async fn compare_and_swap(
        &self,
        table: Table,
        key: &[u8],
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> Result<bool> {
        self.with_table(table, |map| {
            if map.get(key).map(Vec::as_slice) != expected {
                return Ok(false);
            }
            map.insert(key.to_vec(), value.to_vec());
            Ok(true)
        })
    }

    async fn scan(&self, table: Table, range: &ScanRange) -> Result<Vec<KvPair>> {
        if range.is_empty_range() {
            return Ok(Vec::new());
        }
        self.with_table(table, |map| {
            let bounds = (borrowed(&range.start), borrowed(&range.end));
            let iter = map.range::<[u8], _>(bounds);
            let limit = range.limit.unwrap_or(usize::MAX);
            let to_pair = |(k, v): (&Vec<u8>, &Vec<u8>)| (Bytes::from(k.clone()), Bytes::from(v.clone()));
            let rows = if range.reverse {
                iter.rev().take(limit).map(to_pair).collect()
            } else {
                iter.take(limit).map(to_pair).collect()
            };
            Ok(rows)
        })
    }

    async fn increment(&self, table: Table, key: &[u8], delta: i64) -> Result<i64> {
        self.with_table(table, |map| {
            let current = match map.get(key) {
                Some(v) => decode_counter(v).ok_or_else(|| {
                    StorageError::Backend(format!("Counter {:?} is not 8 bytes", String::from_utf8_lossy(key)))
                })?,
                None => 0,
            };
            let next = current + delta;
            map.insert(key.to_vec(), next.to_be_bytes().to_vec());
            Ok(next)
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_conformance() {
        let store = MemoryStore::new();
        conformance::exercise_store(&store).await;
    }

    #[test]
    fn test_prefix_successor() {
        assert_eq!(prefix_successor(b"ab"), Some(b"ac".to_vec()));
        assert_eq!(prefix_successor(&[0x61, 0xff]), Some(vec![0x62]));
        assert_eq!(prefix_successor(&[0xff, 0xff]), None);
    }

    #[test]
    fn test_empty_range_detection() {
        assert!(ScanRange::inclusive(b"b".to_vec(), b"a".to_vec()).is_empty_range());
        assert!(!ScanRange::inclusive(b"a".to_vec(), b"a".to_vec()).is_empty_range());
        assert!(ScanRange::between(Bound::Excluded(b"a".to_vec()), Bound::Included(b"a".to_vec())).is_empty_range());
        assert!(!ScanRange::prefix(b"").is_empty_range());
    }
}
