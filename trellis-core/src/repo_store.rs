//! Typed row access for one repository
//!
//! Wraps a [`KeyValueStore`] with the row keys of a single `org:repo` and
//! decodes rows into model types. Nothing here retries or coordinates;
//! the multi-row protocols live in push, merge and the allocator.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::keys::RowKeyer;
use crate::kv::{decode_counter, KeyValueStore, ScanRange, Table};
use crate::object::{BinaryCodec, BranchEntry, CommitEntry, FileEntry, FolderListing, MergeLock, RepoEntry};

/// A decoded row together with the exact bytes it was read from,
/// which is what a later compare-and-swap must match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub raw: Bytes,
}

#[derive(Clone)]
pub struct RepoStore {
    kv: Arc<dyn KeyValueStore>,
    keys: RowKeyer,
}

impl RepoStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, org: &str, repo: &str) -> Self {
        Self {
            kv,
            keys: RowKeyer::new(org, repo),
        }
    }

    pub fn keys(&self) -> &RowKeyer {
        &self.keys
    }

    pub fn kv(&self) -> &dyn KeyValueStore {
        self.kv.as_ref()
    }

    pub fn org(&self) -> &str {
        self.keys.org()
    }

    pub fn repo(&self) -> &str {
        self.keys.repo()
    }

    async fn get_decoded<T: BinaryCodec>(&self, table: Table, key: &[u8]) -> Result<Option<T>> {
        match self.kv.get(table, key).await? {
            Some(raw) => Ok(Some(T::from_bytes(&raw)?)),
            None => Ok(None),
        }
    }

    // Repository

    pub async fn get_repo(&self) -> Result<Option<RepoEntry>> {
        self.get_decoded(Table::Repos, &self.keys.repo_entry()).await
    }

    /// Returns false if the repo already existed.
    pub async fn create_repo_entry(&self, entry: &RepoEntry) -> Result<bool> {
        Ok(self
            .kv
            .put_if_absent(Table::Repos, &self.keys.repo_entry(), &entry.to_bytes()?)
            .await?)
    }

    /// Bytes stored so far; a missing counter reads as zero.
    pub async fn repo_size(&self) -> Result<u64> {
        match self.kv.get(Table::Repos, &self.keys.repo_size()).await? {
            Some(raw) => decode_counter(&raw)
                .map(|v| v.max(0) as u64)
                .ok_or_else(|| Error::Corruption("Repo size counter is not 8 bytes".to_string())),
            None => Ok(0),
        }
    }

    pub async fn add_to_repo_size(&self, bytes: u64) -> Result<u64> {
        let delta = i64::try_from(bytes)
            .map_err(|_| Error::InvalidArgument(format!("Size increment {} is too large", bytes)))?;
        let total = self
            .kv
            .increment(Table::Repos, &self.keys.repo_size(), delta)
            .await?;
        Ok(total.max(0) as u64)
    }

    // Branches

    pub async fn get_branch(&self, name: &str) -> Result<Option<BranchEntry>> {
        self.get_decoded(Table::Branches, &self.keys.branch(name)).await
    }

    pub async fn get_branch_versioned(&self, name: &str) -> Result<Option<Versioned<BranchEntry>>> {
        match self.kv.get(Table::Branches, &self.keys.branch(name)).await? {
            Some(raw) => Ok(Some(Versioned {
                value: BranchEntry::from_bytes(&raw)?,
                raw,
            })),
            None => Ok(None),
        }
    }

    /// Returns false if the branch already existed.
    pub async fn create_branch(&self, entry: &BranchEntry) -> Result<bool> {
        Ok(self
            .kv
            .put_if_absent(Table::Branches, &self.keys.branch(&entry.name), &entry.to_bytes()?)
            .await?)
    }

    /// CAS the branch row against the bytes it was read from.
    pub async fn update_branch_if_unchanged(
        &self,
        previous: &Versioned<BranchEntry>,
        updated: &BranchEntry,
    ) -> Result<bool> {
        Ok(self
            .kv
            .compare_and_swap(
                Table::Branches,
                &self.keys.branch(&updated.name),
                Some(previous.raw.as_ref()),
                &updated.to_bytes()?,
            )
            .await?)
    }

    // Files

    pub async fn get_file(&self, file_id: &str) -> Result<Option<FileEntry>> {
        self.get_decoded(Table::Files, &self.keys.file(file_id)).await
    }

    pub async fn has_file(&self, file_id: &str) -> Result<bool> {
        Ok(self.kv.get(Table::Files, &self.keys.file(file_id)).await?.is_some())
    }

    pub async fn put_file(&self, entry: &FileEntry) -> Result<()> {
        self.kv
            .put(Table::Files, &self.keys.file(&entry.id), &entry.to_bytes()?)
            .await?;
        Ok(())
    }

    // Folders

    fn folder_key(&self, listing: &FolderListing) -> Vec<u8> {
        self.keys.folder(&listing.branch, &listing.path, listing.commit_id)
    }

    pub async fn put_folder(&self, listing: &FolderListing) -> Result<()> {
        self.kv
            .put(Table::Folders, &self.folder_key(listing), &listing.to_bytes()?)
            .await?;
        Ok(())
    }

    /// Returns false if a listing already exists at that key.
    pub async fn put_folder_if_absent(&self, listing: &FolderListing) -> Result<bool> {
        Ok(self
            .kv
            .put_if_absent(Table::Folders, &self.folder_key(listing), &listing.to_bytes()?)
            .await?)
    }

    pub async fn scan_folders(&self, range: &ScanRange) -> Result<Vec<(Bytes, FolderListing)>> {
        let rows = self.kv.scan(Table::Folders, range).await?;
        rows.into_iter()
            .map(|(key, value)| Ok((key, FolderListing::from_bytes(&value)?)))
            .collect()
    }

    /// Listings of `path` on `branch` with commit ids strictly after `after_commit`,
    /// oldest first. Merge locks are not consulted.
    pub async fn folder_listings_since(
        &self,
        branch: &str,
        path: &str,
        after_commit: u64,
    ) -> Result<Vec<FolderListing>> {
        let range = ScanRange::between(
            Bound::Excluded(self.keys.folder(branch, path, after_commit)),
            Bound::Included(self.keys.folder(branch, path, u64::MAX)),
        );
        Ok(self
            .scan_folders(&range)
            .await?
            .into_iter()
            .map(|(_, listing)| listing)
            .filter(|listing| listing.path == path)
            .collect())
    }

    /// Newest listing of every path on `branch` at or below `at_most`,
    /// ignoring merge locks.
    pub async fn latest_folders_on_branch(
        &self,
        branch: &str,
        at_most: u64,
    ) -> Result<BTreeMap<String, FolderListing>> {
        let range = ScanRange::prefix(&self.keys.branch_prefix(branch));
        let mut latest: BTreeMap<String, FolderListing> = BTreeMap::new();
        for (_, listing) in self.scan_folders(&range).await? {
            if listing.branch != branch || listing.commit_id > at_most {
                continue;
            }
            let newer = latest
                .get(&listing.path)
                .is_none_or(|current| current.commit_id < listing.commit_id);
            if newer {
                latest.insert(listing.path.clone(), listing);
            }
        }
        Ok(latest)
    }

    // Commits

    pub async fn get_commit(&self, branch: &str, commit_id: u64) -> Result<Option<CommitEntry>> {
        self.get_decoded(Table::Commits, &self.keys.commit(branch, commit_id)).await
    }

    pub async fn put_commit(&self, commit: &CommitEntry) -> Result<()> {
        self.kv
            .put(
                Table::Commits,
                &self.keys.commit(&commit.branch_name, commit.commit_id),
                &commit.to_bytes()?,
            )
            .await?;
        Ok(())
    }

    /// Commits on `branch` with ids at or below `at_most`, newest first.
    pub async fn commits_descending(
        &self,
        branch: &str,
        at_most: u64,
        limit: Option<usize>,
    ) -> Result<Vec<CommitEntry>> {
        let mut range =
            ScanRange::inclusive(self.keys.commit(branch, 0), self.keys.commit(branch, at_most)).reversed();
        range.limit = limit;
        let rows = self.kv.scan(Table::Commits, &range).await?;
        rows.into_iter()
            .map(|(_, value)| Ok(CommitEntry::from_bytes(&value)?))
            .collect()
    }

    // Merge locks

    /// Write the lock under both its timestamp key and its id key.
    pub async fn put_merge_lock(&self, lock: &MergeLock) -> Result<()> {
        let value = lock.to_bytes()?;
        self.kv
            .put(
                Table::Merges,
                &self.keys.merge_lock_by_timestamp(lock.timestamp_millis, &lock.id),
                &value,
            )
            .await?;
        self.kv
            .put(Table::Merges, &self.keys.merge_lock_by_id(&lock.id), &value)
            .await?;
        Ok(())
    }

    pub async fn get_merge_lock(&self, lock_id: &str) -> Result<Option<MergeLock>> {
        self.get_decoded(Table::Merges, &self.keys.merge_lock_by_id(lock_id)).await
    }

    /// Locks whose timestamp falls in `[from_millis, to_millis]`.
    pub async fn merge_locks_between(&self, from_millis: i64, to_millis: i64) -> Result<Vec<MergeLock>> {
        let range = ScanRange::between(
            Bound::Included(self.keys.merge_locks_at(from_millis)),
            Bound::Excluded(self.keys.merge_locks_at(to_millis.saturating_add(1))),
        );
        let rows = self.kv.scan(Table::Merges, &range).await?;
        rows.into_iter()
            .map(|(_, value)| Ok(MergeLock::from_bytes(&value)?))
            .collect()
    }
}
