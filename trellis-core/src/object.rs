//! Data model for versioned repository storage
//!
//! Every row stored by the engine is one of these types, bincode-encoded
//! through [`BinaryCodec`]:
//! - [`BranchEntry`]: per-branch base and head commit ids, mutated only by CAS
//! - [`CommitEntry`]: immutable commit metadata and changed paths
//! - [`FolderListing`]: one directory's contents at one commit
//! - [`FileEntry`]: full or delta-encoded file content
//! - [`MergeLock`]: provisional marker over merge-produced listings
//! - [`RepoEntry`]: one per repository

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The integration branch every other branch merges into.
pub const MAIN_BRANCH: &str = "main";

/// Longest diff chain a reader will follow before declaring corruption.
pub const MAX_DIFF_SEARCH: usize = 10;

/// Inline file contents above this size must go through the blob store.
pub const LARGE_FILE_SIZE_THRESHOLD: u64 = 1024 * 1024;

/// Bincode encoding shared by all persisted and wire-level types.
pub trait BinaryCodec: Serialize + DeserializeOwned {
    /// Serialize to binary format
    fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from binary format
    fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// Lowercase hex SHA-256 of `data`, used as the id of content-addressed entries.
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// A branch's position relative to main.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchEntry {
    pub name: String,
    /// Commit on main this branch diverged from
    pub base_commit_id: u64,
    /// Highest commit id reachable on this branch
    pub head_commit_id: u64,
}

impl BranchEntry {
    pub fn new(name: impl Into<String>, base_commit_id: u64, head_commit_id: u64) -> Self {
        Self {
            name: name.into(),
            base_commit_id,
            head_commit_id,
        }
    }

    /// Same branch with a new head.
    pub fn with_head(&self, head_commit_id: u64) -> Self {
        Self {
            name: self.name.clone(),
            base_commit_id: self.base_commit_id,
            head_commit_id,
        }
    }
}

impl BinaryCodec for BranchEntry {}

impl std::fmt::Display for BranchEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (base {}, head {})",
            self.name, self.base_commit_id, self.head_commit_id
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    Add,
    Delete,
    Diff,
}

/// One file touched by a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedPath {
    pub path: String,
    pub change_type: ChangeType,
    pub previous_file_id: Option<String>,
    pub this_file_id: Option<String>,
}

impl ChangedPath {
    pub fn added(path: impl Into<String>, file_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            change_type: ChangeType::Add,
            previous_file_id: None,
            this_file_id: Some(file_id.into()),
        }
    }

    pub fn deleted(path: impl Into<String>, previous_file_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            change_type: ChangeType::Delete,
            previous_file_id: Some(previous_file_id.into()),
            this_file_id: None,
        }
    }

    pub fn modified(
        path: impl Into<String>,
        previous_file_id: impl Into<String>,
        this_file_id: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            change_type: ChangeType::Diff,
            previous_file_id: Some(previous_file_id.into()),
            this_file_id: Some(this_file_id.into()),
        }
    }
}

/// Records that a commit carries another branch's work into main.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Integration {
    pub branch: String,
    pub commit_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitEntry {
    pub branch_name: String,
    pub commit_id: u64,
    pub author_user_id: String,
    pub message: String,
    pub changed_paths: Vec<ChangedPath>,
    pub integration: Option<Integration>,
}

impl CommitEntry {
    pub fn new(
        branch_name: impl Into<String>,
        commit_id: u64,
        author_user_id: impl Into<String>,
        message: impl Into<String>,
        changed_paths: Vec<ChangedPath>,
    ) -> Self {
        Self {
            branch_name: branch_name.into(),
            commit_id,
            author_user_id: author_user_id.into(),
            message: message.into(),
            changed_paths,
            integration: None,
        }
    }

    pub fn with_integration(mut self, branch: impl Into<String>, commit_id: u64) -> Self {
        self.integration = Some(Integration {
            branch: branch.into(),
            commit_id,
        });
        self
    }

    pub fn with_author(mut self, author_user_id: impl Into<String>) -> Self {
        self.author_user_id = author_user_id.into();
        self
    }
}

impl BinaryCodec for CommitEntry {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    File,
    Folder,
}

/// A single name inside a folder listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderEntry {
    pub name: String,
    pub entry_type: EntryType,
    /// Present iff `entry_type` is `File`
    pub file_id: Option<String>,
}

impl FolderEntry {
    pub fn file(name: impl Into<String>, file_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entry_type: EntryType::File,
            file_id: Some(file_id.into()),
        }
    }

    pub fn folder(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entry_type: EntryType::Folder,
            file_id: None,
        }
    }
}

/// Snapshot of one directory's immediate contents at one commit.
///
/// Listings written by a merge carry the merge's lock id and stay invisible
/// to readers until that lock completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderListing {
    pub path: String,
    pub branch: String,
    pub commit_id: u64,
    pub merge_lock_id: Option<String>,
    pub entries: Vec<FolderEntry>,
}

impl FolderListing {
    pub fn new(
        path: impl Into<String>,
        branch: impl Into<String>,
        commit_id: u64,
        entries: Vec<FolderEntry>,
    ) -> Self {
        Self {
            path: path.into(),
            branch: branch.into(),
            commit_id,
            merge_lock_id: None,
            entries,
        }
    }

    /// Copy of this listing relocated onto another branch/commit under a merge lock.
    pub fn relocated(&self, branch: &str, commit_id: u64, merge_lock_id: &str) -> Self {
        Self {
            path: self.path.clone(),
            branch: branch.to_string(),
            commit_id,
            merge_lock_id: Some(merge_lock_id.to_string()),
            entries: self.entries.clone(),
        }
    }

    pub fn file_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(|e| e.file_id.as_deref())
    }
}

impl BinaryCodec for FolderListing {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentsType {
    Full,
    Diff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageType {
    Inline,
    /// Bytes live in the large-file store under the entry id
    Blob,
}

/// File content, either whole or as a delta against `base_entry_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: String,
    pub contents_type: ContentsType,
    /// Present iff `contents_type` is `Diff`
    pub base_entry_id: Option<String>,
    pub storage_type: StorageType,
    pub contents: Vec<u8>,
}

impl FileEntry {
    /// Full inline entry addressed by the hash of its contents.
    pub fn full_from_contents(contents: Vec<u8>) -> Self {
        Self::full(content_hash(&contents), contents)
    }

    pub fn full(id: impl Into<String>, contents: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            contents_type: ContentsType::Full,
            base_entry_id: None,
            storage_type: StorageType::Inline,
            contents,
        }
    }

    pub fn diff(id: impl Into<String>, base_entry_id: impl Into<String>, delta: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            contents_type: ContentsType::Diff,
            base_entry_id: Some(base_entry_id.into()),
            storage_type: StorageType::Inline,
            contents: delta,
        }
    }

    /// Full entry whose bytes are kept in the large-file store.
    pub fn large(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            contents_type: ContentsType::Full,
            base_entry_id: None,
            storage_type: StorageType::Blob,
            contents: Vec::new(),
        }
    }
}

impl BinaryCodec for FileEntry {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeState {
    InProgress,
    Completed,
    Failed,
}

impl std::fmt::Display for MergeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MergeState::InProgress => "IN_PROGRESS",
            MergeState::Completed => "COMPLETED",
            MergeState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeLock {
    pub id: String,
    pub branch_name: String,
    pub state: MergeState,
    pub timestamp_millis: i64,
}

impl MergeLock {
    /// Fresh lock with a random id.
    pub fn in_progress(branch_name: impl Into<String>, timestamp_millis: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            branch_name: branch_name.into(),
            state: MergeState::InProgress,
            timestamp_millis,
        }
    }

    pub fn with_state(&self, state: MergeState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }
}

impl BinaryCodec for MergeLock {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoEntry {
    pub org: String,
    pub repo: String,
    pub created_at_millis: i64,
}

impl BinaryCodec for RepoEntry {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeResultType {
    Successful,
    Failed,
}

/// Outcome of a merge attempt. Conflicts come back as `Failed`, not as errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeResult {
    pub result_type: MergeResultType,
    pub message: String,
    pub new_commit_id_on_main: u64,
}

impl MergeResult {
    pub fn successful(new_commit_id_on_main: u64) -> Self {
        Self {
            result_type: MergeResultType::Successful,
            message: "Merge successful".to_string(),
            new_commit_id_on_main,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            result_type: MergeResultType::Failed,
            message: message.into(),
            new_commit_id_on_main: 0,
        }
    }

    pub fn is_successful(&self) -> bool {
        self.result_type == MergeResultType::Successful
    }
}

impl BinaryCodec for MergeResult {}
