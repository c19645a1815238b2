//! Merge-lock visibility overlay
//!
//! Listings written by a merge carry the merge's lock id. They become
//! visible only once that lock is COMPLETED. An IN_PROGRESS or FAILED lock
//! hides them, which is what lets a crashed merge vanish without rollback.
//!
//! A [`MergeVisibility`] is a snapshot: the locks in a recent time window
//! are loaded once, and older locks are fetched by id on demand and cached.
//! One snapshot is applied uniformly to every row a single operation reads.

use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};
use crate::object::{FolderListing, MergeLock, MergeState};
use crate::repo_store::RepoStore;

/// Window used by merge pre-checks.
pub const MERGE_WINDOW_MILLIS: i64 = 60 * 60 * 1000;

/// Window used by checkout and browsing.
pub const CHECKOUT_WINDOW_MILLIS: i64 = 30 * 60 * 1000;

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct MergeVisibility {
    store: RepoStore,
    recent: HashMap<String, MergeLock>,
    fetched: RwLock<HashMap<String, MergeLock>>,
}

impl MergeVisibility {
    /// Snapshot the locks created in the last `window_millis` before now.
    pub async fn load(store: RepoStore, window_millis: i64) -> Result<Self> {
        Self::load_at(store, now_millis(), window_millis).await
    }

    pub async fn load_at(store: RepoStore, now_millis: i64, window_millis: i64) -> Result<Self> {
        let locks = store
            .merge_locks_between(now_millis - window_millis, now_millis)
            .await?;
        debug!(count = locks.len(), "loaded merge locks in window");
        let recent = locks.into_iter().map(|lock| (lock.id.clone(), lock)).collect();
        Ok(Self {
            store,
            recent,
            fetched: RwLock::new(HashMap::new()),
        })
    }

    pub fn recent_count(&self) -> usize {
        self.recent.len()
    }

    /// State of a lock as seen by this snapshot. A missing lock means a
    /// listing references a merge that was never recorded.
    pub async fn lock(&self, lock_id: &str) -> Result<MergeLock> {
        if let Some(lock) = self.recent.get(lock_id) {
            return Ok(lock.clone());
        }
        if let Some(lock) = self.fetched.read().await.get(lock_id) {
            return Ok(lock.clone());
        }
        let lock = self
            .store
            .get_merge_lock(lock_id)
            .await?
            .ok_or_else(|| Error::Corruption(format!("Merge lock {} not found", lock_id)))?;
        self.fetched
            .write()
            .await
            .insert(lock_id.to_string(), lock.clone());
        Ok(lock)
    }

    pub async fn is_visible(&self, listing: &FolderListing) -> Result<bool> {
        match &listing.merge_lock_id {
            None => Ok(true),
            Some(lock_id) => Ok(self.lock(lock_id).await?.state == MergeState::Completed),
        }
    }
}
