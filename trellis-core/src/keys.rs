//! Row key encoding
//!
//! Keys are plain UTF-8 strings compared as bytes by the store. Commit ids
//! are zero-padded to 20 digits so that lexicographic order matches numeric
//! order, which lets a range scan over one prefix walk a single entity's
//! history in commit order.

/// Builds row keys for one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowKeyer {
    org: String,
    repo: String,
}

impl RowKeyer {
    pub fn new(org: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            org: org.into(),
            repo: repo.into(),
        }
    }

    pub fn org(&self) -> &str {
        &self.org
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    /// `org:repo`
    pub fn repo_entry(&self) -> Vec<u8> {
        format!("{}:{}", self.org, self.repo).into_bytes()
    }

    /// `org:repo:size`
    pub fn repo_size(&self) -> Vec<u8> {
        format!("{}:{}:size", self.org, self.repo).into_bytes()
    }

    /// `org:repo:branch`
    pub fn branch(&self, branch: &str) -> Vec<u8> {
        format!("{}:{}:{}", self.org, self.repo, branch).into_bytes()
    }

    /// `org:repo:fileId`
    pub fn file(&self, file_id: &str) -> Vec<u8> {
        format!("{}:{}:{}", self.org, self.repo, file_id).into_bytes()
    }

    /// `org:repo:branch:<commitId %020d>`
    pub fn commit(&self, branch: &str, commit_id: u64) -> Vec<u8> {
        format!("{}:{}:{}:{:020}", self.org, self.repo, branch, commit_id).into_bytes()
    }

    /// `org:repo:branch:path:<commitId %020d>`
    pub fn folder(&self, branch: &str, path: &str, commit_id: u64) -> Vec<u8> {
        format!(
            "{}:{}:{}:{}:{:020}",
            self.org, self.repo, branch, path, commit_id
        )
        .into_bytes()
    }

    /// Prefix shared by every commit or folder row of a branch.
    pub fn branch_prefix(&self, branch: &str) -> Vec<u8> {
        format!("{}:{}:{}:", self.org, self.repo, branch).into_bytes()
    }

    /// `org:repo:<timestampMillis>:lockId`
    pub fn merge_lock_by_timestamp(&self, timestamp_millis: i64, lock_id: &str) -> Vec<u8> {
        format!("{}:{}:{}:{}", self.org, self.repo, timestamp_millis, lock_id).into_bytes()
    }

    /// `org:repo:<timestampMillis>`, the scan boundary for locks at a point in time.
    pub fn merge_locks_at(&self, timestamp_millis: i64) -> Vec<u8> {
        format!("{}:{}:{}", self.org, self.repo, timestamp_millis).into_bytes()
    }

    /// `org:repo:ID_lockId`
    pub fn merge_lock_by_id(&self, lock_id: &str) -> Vec<u8> {
        format!("{}:{}:ID_{}", self.org, self.repo, lock_id).into_bytes()
    }
}
