//! Commit id allocation for a target branch
//!
//! The branch row's head commit id is the only counter. Every merge into a
//! branch takes its new commit id here, so this CAS loop is the single point
//! where concurrent merges into the same branch are serialized.

use tracing::debug;

use crate::cas::update_with_retries;
use crate::error::{Error, Result};
use crate::kv::Table;
use crate::object::BranchEntry;
use crate::repo_store::RepoStore;

/// Attempts before giving up under contention.
pub const ALLOCATION_ATTEMPTS: usize = 5;

pub struct CommitIdAllocator {
    store: RepoStore,
}

impl CommitIdAllocator {
    pub fn new(store: RepoStore) -> Self {
        Self { store }
    }

    /// Advance `branch`'s head by one and return the new head.
    pub async fn take_next(&self, branch: &str) -> Result<u64> {
        let key = self.store.keys().branch(branch);
        let updated = update_with_retries::<BranchEntry, _>(
            self.store.kv(),
            Table::Branches,
            &key,
            ALLOCATION_ATTEMPTS,
            |entry| Ok(entry.with_head(entry.head_commit_id + 1)),
        )
        .await
        .map_err(|e| match e {
            Error::Contention(_) => Error::Contention(format!(
                "Failed to take a commit number on {} after {} tries. There may be many concurrent merges.",
                branch, ALLOCATION_ATTEMPTS
            )),
            Error::NotFound(_) => Error::NotFound(format!("Branch {} not found", branch)),
            other => other,
        })?;
        debug!(branch, commit_id = updated.head_commit_id, "allocated commit id");
        Ok(updated.head_commit_id)
    }
}
