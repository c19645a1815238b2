//! Merging a branch into main
//!
//! A merge runs `PRECHECK -> LOCKED -> WRITING -> SEALED`, or stops at
//! `PRECHECK` with a failed [`MergeResult`] when main has moved under one of
//! the branch's folders.
//!
//! - PRECHECK: for every folder the branch head touches, look for listings
//!   on main newer than the branch's integration base.
//! - LOCKED: record an IN_PROGRESS merge lock.
//! - WRITING: take a new main commit id and copy every branch-head listing
//!   onto main at that id, tagged with the lock (put-if-absent).
//! - SEALED: mark the lock COMPLETED, then write the merge commit on main.
//!
//! Nothing written in WRITING is visible until the lock completes. If
//! WRITING fails the lock is marked FAILED and the copies stay hidden.
//!
//! PRECHECK and the commit-id reservation are not atomic together. A second
//! merge can reserve a commit id and write a conflicting listing after this
//! merge's pre-check has already passed. Closing that needs per-path
//! reservations; it is a known consistency gap.

use tracing::{info, warn};

use crate::allocator::CommitIdAllocator;
use crate::error::{Error, Result};
use crate::object::{
    BranchEntry, ChangedPath, CommitEntry, FolderListing, MergeLock, MergeResult, MergeState, MAIN_BRANCH,
};
use crate::repo_store::RepoStore;
use crate::visibility::{now_millis, MergeVisibility, MERGE_WINDOW_MILLIS};

/// Author recorded on synthesized merge commits.
pub const MERGE_AUTHOR: &str = "Trellis Merge";

pub struct MergeCoordinator {
    store: RepoStore,
    window_millis: i64,
}

impl MergeCoordinator {
    pub fn new(store: RepoStore) -> Self {
        Self {
            store,
            window_millis: MERGE_WINDOW_MILLIS,
        }
    }

    pub fn with_window_millis(mut self, window_millis: i64) -> Self {
        self.window_millis = window_millis;
        self
    }

    /// Merge `branch_name` at `head_commit_id` into main.
    pub async fn merge(&self, branch_name: &str, head_commit_id: u64) -> Result<MergeResult> {
        if branch_name == MAIN_BRANCH {
            return Err(Error::InvalidArgument("Can't merge main into itself".to_string()));
        }
        let branch = self.store.get_branch(branch_name).await?.ok_or_else(|| {
            Error::NotFound(format!(
                "Branch {} wasn't found on the server. Has it been pushed?",
                branch_name
            ))
        })?;
        if branch.head_commit_id != head_commit_id {
            return Err(Error::Stale(format!(
                "Branch {} is at commit {} on the server, not {}",
                branch_name, branch.head_commit_id, head_commit_id
            )));
        }

        let now = now_millis();
        let visibility = MergeVisibility::load_at(self.store.clone(), now, self.window_millis).await?;

        // PRECHECK
        let head_listings = self
            .store
            .latest_folders_on_branch(branch_name, head_commit_id)
            .await?;
        let branch_commits = self
            .store
            .commits_descending(branch_name, head_commit_id, None)
            .await?;
        let integration_base = integration_base(&branch, &branch_commits)?;

        for path in head_listings.keys() {
            if let Some(conflict) = self
                .newer_on_main(&visibility, path, integration_base)
                .await?
            {
                info!(
                    branch = branch_name,
                    path = %path,
                    main_commit = conflict.commit_id,
                    "merge rejected: main changed under branch"
                );
                return Ok(MergeResult::failed(format!(
                    "A folder has changed on both main and the branch ({}). The branch should be rebased before trying to merge again.",
                    path
                )));
            }
        }

        // LOCKED
        let lock = MergeLock::in_progress(branch_name, now);
        self.store.put_merge_lock(&lock).await?;

        // WRITING
        let new_commit_id = match self.write_listings(&lock, head_listings.values()).await {
            Ok(id) => id,
            Err(e) => {
                warn!(branch = branch_name, lock = %lock.id, error = %e, "merge failed while writing");
                if let Err(mark_err) = self
                    .store
                    .put_merge_lock(&lock.with_state(MergeState::Failed))
                    .await
                {
                    warn!(lock = %lock.id, error = %mark_err, "couldn't mark merge lock failed");
                }
                return Err(e);
            }
        };

        // SEALED
        self.store
            .put_merge_lock(&lock.with_state(MergeState::Completed))
            .await?;

        // Newest branch commit first, matching the scan order.
        let changed_paths: Vec<ChangedPath> = branch_commits
            .iter()
            .flat_map(|commit| commit.changed_paths.iter().cloned())
            .collect();
        let merge_commit = CommitEntry::new(
            MAIN_BRANCH,
            new_commit_id,
            MERGE_AUTHOR,
            format!("Merge of branch {}:{}", branch_name, head_commit_id),
            changed_paths,
        )
        .with_integration(branch_name, head_commit_id);
        self.store.put_commit(&merge_commit).await?;

        info!(
            branch = branch_name,
            head = head_commit_id,
            main_commit = new_commit_id,
            folders = head_listings.len(),
            "merge completed"
        );
        Ok(MergeResult::successful(new_commit_id))
    }

    /// First listing on main after `base` that counts as a conflict. Listings
    /// under a FAILED lock never happened; IN_PROGRESS ones belong to a merge
    /// that may still land, so they count.
    async fn newer_on_main(
        &self,
        visibility: &MergeVisibility,
        path: &str,
        base: u64,
    ) -> Result<Option<FolderListing>> {
        for listing in self.store.folder_listings_since(MAIN_BRANCH, path, base).await? {
            let conflicts = match &listing.merge_lock_id {
                None => true,
                Some(lock_id) => visibility.lock(lock_id).await?.state != MergeState::Failed,
            };
            if conflicts {
                return Ok(Some(listing));
            }
        }
        Ok(None)
    }

    async fn write_listings<'a>(
        &self,
        lock: &MergeLock,
        listings: impl Iterator<Item = &'a FolderListing>,
    ) -> Result<u64> {
        let new_commit_id = CommitIdAllocator::new(self.store.clone())
            .take_next(MAIN_BRANCH)
            .await?;
        for listing in listings {
            let copy = listing.relocated(MAIN_BRANCH, new_commit_id, &lock.id);
            if !self.store.put_folder_if_absent(&copy).await? {
                return Err(Error::Contention(format!(
                    "A listing for {} already exists at main:{}",
                    copy.path, new_commit_id
                )));
            }
        }
        Ok(new_commit_id)
    }
}

/// Commit on main the branch last integrated: the newest integration commit
/// on the branch, or the branch's base.
fn integration_base(branch: &BranchEntry, commits_descending: &[CommitEntry]) -> Result<u64> {
    for commit in commits_descending {
        if let Some(integration) = &commit.integration {
            if integration.branch != MAIN_BRANCH {
                return Err(Error::Corruption(format!(
                    "Commit {}:{} integrates {} rather than main",
                    branch.name, commit.commit_id, integration.branch
                )));
            }
            return Ok(integration.commit_id);
        }
    }
    Ok(branch.base_commit_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::FolderHistory;
    use crate::kv::MemoryStore;
    use crate::object::{FolderEntry, MergeResultType};
    use crate::visibility::CHECKOUT_WINDOW_MILLIS;
    use std::sync::Arc;

    const PATH: &str = "/some/path/";

    async fn setup() -> RepoStore {
        let store = RepoStore::new(Arc::new(MemoryStore::new()), "acme", "widgets");
        store.create_branch(&BranchEntry::new(MAIN_BRANCH, 1, 100)).await.unwrap();
        store
            .put_folder(&FolderListing::new(
                PATH,
                MAIN_BRANCH,
                100,
                vec![FolderEntry::file("base.txt", "base")],
            ))
            .await
            .unwrap();
        store
    }

    async fn push_branch(store: &RepoStore, name: &str, file: &str) {
        store.create_branch(&BranchEntry::new(name, 100, 101)).await.unwrap();
        store
            .put_folder(&FolderListing::new(
                PATH,
                name,
                101,
                vec![FolderEntry::file("base.txt", "base"), FolderEntry::file(file, file)],
            ))
            .await
            .unwrap();
        store
            .put_commit(&CommitEntry::new(
                name,
                101,
                "alice",
                "add file",
                vec![ChangedPath::added(format!("{}{}", PATH, file), file)],
            ))
            .await
            .unwrap();
    }

    async fn main_listing(store: &RepoStore, commit: u64) -> Option<FolderListing> {
        let vis = MergeVisibility::load(store.clone(), CHECKOUT_WINDOW_MILLIS).await.unwrap();
        FolderHistory::new(store, &vis)
            .get_at_commit(MAIN_BRANCH, PATH, commit)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_merge_simple() {
        let store = setup().await;
        push_branch(&store, "feature", "newer.txt").await;

        let result = MergeCoordinator::new(store.clone()).merge("feature", 101).await.unwrap();
        assert_eq!(result.result_type, MergeResultType::Successful);
        assert_eq!(result.new_commit_id_on_main, 101);

        let listing = main_listing(&store, 101).await.unwrap();
        assert_eq!(listing.entries.len(), 2);
        assert!(listing.merge_lock_id.is_some());

        let commit = store.get_commit(MAIN_BRANCH, 101).await.unwrap().unwrap();
        assert_eq!(commit.author_user_id, MERGE_AUTHOR);
        assert_eq!(commit.message, "Merge of branch feature:101");
        assert_eq!(commit.changed_paths.len(), 1);
        let integration = commit.integration.unwrap();
        assert_eq!((integration.branch.as_str(), integration.commit_id), ("feature", 101));

        // main's earlier history is untouched
        assert_eq!(main_listing(&store, 100).await.unwrap().entries.len(), 1);
    }

    #[tokio::test]
    async fn test_merge_commit_lists_newest_changes_first() {
        let store = setup().await;
        push_branch(&store, "feature", "first.txt").await;
        store
            .put_folder(&FolderListing::new(
                PATH,
                "feature",
                102,
                vec![
                    FolderEntry::file("base.txt", "base"),
                    FolderEntry::file("first.txt", "first.txt"),
                    FolderEntry::file("second.txt", "second.txt"),
                ],
            ))
            .await
            .unwrap();
        store
            .put_commit(&CommitEntry::new(
                "feature",
                102,
                "alice",
                "add second",
                vec![ChangedPath::added(format!("{}second.txt", PATH), "second.txt")],
            ))
            .await
            .unwrap();
        let branch = store.get_branch_versioned("feature").await.unwrap().unwrap();
        assert!(store
            .update_branch_if_unchanged(&branch, &BranchEntry::new("feature", 100, 102))
            .await
            .unwrap());

        let result = MergeCoordinator::new(store.clone()).merge("feature", 102).await.unwrap();
        assert!(result.is_successful());
        let commit = store
            .get_commit(MAIN_BRANCH, result.new_commit_id_on_main)
            .await
            .unwrap()
            .unwrap();
        let paths: Vec<&str> = commit.changed_paths.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["/some/path/second.txt", "/some/path/first.txt"]);
    }

    #[tokio::test]
    async fn test_second_branch_conflicts() {
        let store = setup().await;
        push_branch(&store, "branch1", "newer1.txt").await;
        push_branch(&store, "branch2", "newer2.txt").await;

        let first = MergeCoordinator::new(store.clone()).merge("branch1", 101).await.unwrap();
        assert!(first.is_successful());

        let second = MergeCoordinator::new(store.clone()).merge("branch2", 101).await.unwrap();
        assert_eq!(second.result_type, MergeResultType::Failed);
        assert!(second.message.contains(PATH));
        assert!(second.message.contains("rebased"));

        let names: Vec<String> = main_listing(&store, 101)
            .await
            .unwrap()
            .entries
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["base.txt", "newer1.txt"]);
        assert_eq!(store.get_branch(MAIN_BRANCH).await.unwrap().unwrap().head_commit_id, 101);
    }

    #[tokio::test]
    async fn test_merge_twice_fails() {
        let store = setup().await;
        push_branch(&store, "feature", "newer.txt").await;
        let coordinator = MergeCoordinator::new(store.clone());
        assert!(coordinator.merge("feature", 101).await.unwrap().is_successful());
        assert!(!coordinator.merge("feature", 101).await.unwrap().is_successful());
    }

    #[tokio::test]
    async fn test_failed_merge_listing_is_not_a_conflict() {
        let store = setup().await;
        push_branch(&store, "feature", "newer.txt").await;

        let dead = MergeLock::in_progress("crashed", now_millis()).with_state(MergeState::Failed);
        store.put_merge_lock(&dead).await.unwrap();
        let mut orphan = FolderListing::new(PATH, MAIN_BRANCH, 101, vec![]);
        orphan.merge_lock_id = Some(dead.id.clone());
        store.put_folder(&orphan).await.unwrap();
        // the crashed merge had taken 101
        let main = store.get_branch_versioned(MAIN_BRANCH).await.unwrap().unwrap();
        store.update_branch_if_unchanged(&main, &main.value.with_head(101)).await.unwrap();

        let result = MergeCoordinator::new(store.clone()).merge("feature", 101).await.unwrap();
        assert!(result.is_successful(), "{}", result.message);
        assert_eq!(result.new_commit_id_on_main, 102);
        assert_eq!(main_listing(&store, 101).await.unwrap().commit_id, 100);
        assert_eq!(main_listing(&store, 102).await.unwrap().entries.len(), 2);
    }

    #[tokio::test]
    async fn test_in_progress_merge_blocks() {
        let store = setup().await;
        push_branch(&store, "feature", "newer.txt").await;

        let pending = MergeLock::in_progress("other", now_millis());
        store.put_merge_lock(&pending).await.unwrap();
        let mut staged = FolderListing::new(PATH, MAIN_BRANCH, 101, vec![]);
        staged.merge_lock_id = Some(pending.id.clone());
        store.put_folder(&staged).await.unwrap();

        let result = MergeCoordinator::new(store).merge("feature", 101).await.unwrap();
        assert!(!result.is_successful());
    }

    #[tokio::test]
    async fn test_write_conflict_marks_lock_failed() {
        let store = setup().await;
        push_branch(&store, "feature", "newer.txt").await;
        // someone already occupies main:101 without advancing main's head
        let mut squatter = FolderListing::new(PATH, MAIN_BRANCH, 101, vec![]);
        squatter.merge_lock_id = Some("ghost".to_string());
        store.put_folder(&squatter).await.unwrap();
        let ghost = MergeLock {
            id: "ghost".to_string(),
            branch_name: "ghost".to_string(),
            state: MergeState::Failed,
            timestamp_millis: now_millis(),
        };
        store.put_merge_lock(&ghost).await.unwrap();

        let err = MergeCoordinator::new(store.clone()).merge("feature", 101).await.unwrap_err();
        assert!(matches!(err, Error::Contention(_)));

        let locks = store.merge_locks_between(0, now_millis()).await.unwrap();
        let ours: Vec<_> = locks.iter().filter(|l| l.branch_name == "feature").collect();
        assert_eq!(ours.len(), 1);
        assert_eq!(ours[0].state, MergeState::Failed);
    }

    #[tokio::test]
    async fn test_unknown_branch_and_stale_head() {
        let store = setup().await;
        let err = MergeCoordinator::new(store.clone()).merge("nope", 5).await.unwrap_err();
        assert!(err.to_string().contains("Has it been pushed?"));

        push_branch(&store, "feature", "newer.txt").await;
        let err = MergeCoordinator::new(store).merge("feature", 100).await.unwrap_err();
        assert!(matches!(err, Error::Stale(_)));
    }

    #[tokio::test]
    async fn test_rebased_branch_uses_integration_base() {
        let store = setup().await;
        // main moves to 105 after the branch was cut
        store
            .put_folder(&FolderListing::new(PATH, MAIN_BRANCH, 105, vec![FolderEntry::file("m.txt", "m")]))
            .await
            .unwrap();
        let main = store.get_branch_versioned(MAIN_BRANCH).await.unwrap().unwrap();
        store.update_branch_if_unchanged(&main, &main.value.with_head(105)).await.unwrap();

        push_branch(&store, "feature", "newer.txt").await;
        assert!(!MergeCoordinator::new(store.clone()).merge("feature", 101).await.unwrap().is_successful());

        // rebase onto main:105
        let branch = store.get_branch_versioned("feature").await.unwrap().unwrap();
        store.update_branch_if_unchanged(&branch, &branch.value.with_head(102)).await.unwrap();
        store
            .put_commit(&CommitEntry::new("feature", 102, "alice", "rebase", vec![]).with_integration(MAIN_BRANCH, 105))
            .await
            .unwrap();
        store
            .put_folder(&FolderListing::new(
                PATH,
                "feature",
                102,
                vec![FolderEntry::file("m.txt", "m"), FolderEntry::file("newer.txt", "newer.txt")],
            ))
            .await
            .unwrap();

        let result = MergeCoordinator::new(store).merge("feature", 102).await.unwrap();
        assert!(result.is_successful(), "{}", result.message);
        assert_eq!(result.new_commit_id_on_main, 106);
    }
}
