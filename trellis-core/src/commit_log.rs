//! Commit history of a branch, optionally filtered to a folder

use tracing::debug;

use crate::error::Result;
use crate::object::CommitEntry;
use crate::paths::ROOT_PATH;
use crate::repo_store::RepoStore;

/// Commits fetched per scan.
pub const LOG_BATCH_SIZE: usize = 50;

/// Most commits a single log call returns.
pub const MAX_LOG_RESULTS: usize = 20;

/// Give up filtering after this many commits have been examined.
pub const MAX_LOG_SCANNED: usize = 1000;

pub struct CommitLog {
    store: RepoStore,
}

impl CommitLog {
    pub fn new(store: RepoStore) -> Self {
        Self { store }
    }

    /// Newest-first commits on `branch` at or below `at_commit_id` that touch
    /// something under `path`.
    pub async fn log(&self, branch: &str, path: &str, at_commit_id: u64) -> Result<Vec<CommitEntry>> {
        let mut results = Vec::new();
        let mut scanned = 0usize;
        let mut upper = Some(at_commit_id);

        while let Some(at_most) = upper {
            if results.len() >= MAX_LOG_RESULTS || scanned >= MAX_LOG_SCANNED {
                break;
            }
            let batch = self
                .store
                .commits_descending(branch, at_most, Some(LOG_BATCH_SIZE))
                .await?;
            if batch.is_empty() {
                break;
            }
            scanned += batch.len();
            upper = batch
                .last()
                .and_then(|oldest| oldest.commit_id.checked_sub(1));
            let short_batch = batch.len() < LOG_BATCH_SIZE;
            for commit in batch {
                if touches(&commit, path) {
                    results.push(commit);
                    if results.len() == MAX_LOG_RESULTS {
                        break;
                    }
                }
            }
            if short_batch {
                break;
            }
        }
        debug!(branch, path, scanned, found = results.len(), "commit log");
        Ok(results)
    }
}

fn touches(commit: &CommitEntry, path: &str) -> bool {
    path == ROOT_PATH
        || commit
            .changed_paths
            .iter()
            .any(|changed| changed.path.starts_with(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;
    use crate::object::ChangedPath;
    use std::sync::Arc;

    fn store() -> RepoStore {
        RepoStore::new(Arc::new(MemoryStore::new()), "acme", "widgets")
    }

    async fn commit(store: &RepoStore, id: u64, path: &str) {
        store
            .put_commit(&CommitEntry::new(
                "main",
                id,
                "alice",
                format!("commit {}", id),
                vec![ChangedPath::added(path, format!("file-{}", id))],
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_root_log_is_newest_first_and_capped() {
        let store = store();
        for id in 1..=30 {
            commit(&store, id, "/a.txt").await;
        }
        let log = CommitLog::new(store).log("main", "/", 25).await.unwrap();
        assert_eq!(log.len(), MAX_LOG_RESULTS);
        assert_eq!(log[0].commit_id, 25);
        assert_eq!(log[19].commit_id, 6);
    }

    #[tokio::test]
    async fn test_path_filter_crosses_batches() {
        let store = store();
        for id in 1..=120 {
            let path = if id % 40 == 0 { "/docs/guide.md" } else { "/src/lib.rs" };
            commit(&store, id, path).await;
        }
        let log = CommitLog::new(store).log("main", "/docs/", 120).await.unwrap();
        let ids: Vec<u64> = log.iter().map(|c| c.commit_id).collect();
        assert_eq!(ids, vec![120, 80, 40]);
    }

    #[tokio::test]
    async fn test_empty_branch() {
        let log = CommitLog::new(store()).log("feature", "/", 10).await.unwrap();
        assert!(log.is_empty());
    }
}
