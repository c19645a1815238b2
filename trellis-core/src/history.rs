//! Time-travel reads of folder listings
//!
//! Listings are an append-only log keyed by commit id. Reading a folder at
//! a commit means walking that log backwards from the commit and returning
//! the first listing the visibility snapshot accepts. A branch that never
//! wrote a path inherits main's history up to the branch's base commit.

use std::collections::HashMap;
use std::ops::Bound;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::kv::ScanRange;
use crate::object::{FolderListing, MAIN_BRANCH};
use crate::repo_store::RepoStore;
use crate::visibility::MergeVisibility;

/// Rows fetched per backward scan step.
const SCAN_PAGE: usize = 16;

pub struct FolderHistory<'a> {
    store: &'a RepoStore,
    visibility: &'a MergeVisibility,
    branch_bases: Mutex<HashMap<String, Option<u64>>>,
}

impl<'a> FolderHistory<'a> {
    pub fn new(store: &'a RepoStore, visibility: &'a MergeVisibility) -> Self {
        Self {
            store,
            visibility,
            branch_bases: Mutex::new(HashMap::new()),
        }
    }

    /// Most recent visible listing of `path` on `branch` at or before `commit_id`,
    /// falling back to main for branches.
    pub async fn get_at_commit(
        &self,
        branch: &str,
        path: &str,
        commit_id: u64,
    ) -> Result<Option<FolderListing>> {
        if let Some(listing) = self.latest_visible(branch, path, commit_id).await? {
            return Ok(Some(listing));
        }
        if branch == MAIN_BRANCH {
            return Ok(None);
        }
        let main_commit = match self.branch_base(branch).await? {
            Some(base) => commit_id.min(base),
            None => commit_id,
        };
        self.latest_visible(MAIN_BRANCH, path, main_commit).await
    }

    async fn branch_base(&self, branch: &str) -> Result<Option<u64>> {
        let mut bases = self.branch_bases.lock().await;
        if let Some(base) = bases.get(branch) {
            return Ok(*base);
        }
        let base = self
            .store
            .get_branch(branch)
            .await?
            .map(|entry| entry.base_commit_id);
        bases.insert(branch.to_string(), base);
        Ok(base)
    }

    async fn latest_visible(
        &self,
        branch: &str,
        path: &str,
        commit_id: u64,
    ) -> Result<Option<FolderListing>> {
        let keys = self.store.keys();
        let start = Bound::Included(keys.folder(branch, path, 0));
        let mut end = Bound::Included(keys.folder(branch, path, commit_id));
        loop {
            let range = ScanRange::between(start.clone(), end.clone())
                .reversed()
                .with_limit(SCAN_PAGE);
            let rows = self.store.scan_folders(&range).await?;
            let fetched = rows.len();
            for (key, listing) in rows {
                end = Bound::Excluded(key.to_vec());
                if listing.path != path || listing.branch != branch {
                    continue;
                }
                if self.visibility.is_visible(&listing).await? {
                    return Ok(Some(listing));
                }
            }
            if fetched < SCAN_PAGE {
                return Ok(None);
            }
        }
    }
}
