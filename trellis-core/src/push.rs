//! Server side of the push protocol
//!
//! A push streams a [`PushSpec`] followed by FILE, FOLDER, COMMIT and
//! LARGE_FILE_CONTENTS records. Each object is persisted as soon as it is
//! read. Nothing becomes visible until the final compare-and-swap moves the
//! branch head, so a push that dies halfway leaves only rows at commit ids
//! above the head, which the next attempt simply overwrites.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::AsyncBufRead;
use tracing::{debug, info, warn};

use crate::blob::LargeFileStore;
use crate::error::{Error, Result};
use crate::kv::KeyValueStore;
use crate::object::{
    BinaryCodec, BranchEntry, CommitEntry, FileEntry, FolderListing, StorageType,
    LARGE_FILE_SIZE_THRESHOLD, MAIN_BRANCH,
};
use crate::paths::validate_branch_name;
use crate::quota::{QuotaPolicy, RepoQuota};
use crate::repo_store::{RepoStore, Versioned};
use crate::wire::{ObjectReader, ObjectType, RecordHeader};

/// First record of every push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSpec {
    pub org: String,
    pub repo: String,
    pub branch_name: String,
    pub base_commit_id: u64,
    pub new_head_commit_id: u64,
}

impl BinaryCodec for PushSpec {}

/// Advisory request sent before a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushQuery {
    pub org: String,
    pub repo: String,
    pub branch_name: String,
    pub base_commit_id: u64,
    pub new_head_commit_id: u64,
    pub file_ids: Vec<String>,
}

impl BinaryCodec for PushQuery {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushQueryResponseType {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushQueryResponse {
    pub response_type: PushQueryResponseType,
    pub message: String,
    pub file_ids_server_already_has: Vec<String>,
}

impl BinaryCodec for PushQueryResponse {}

/// What a completed push did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushOutcome {
    pub branch_name: String,
    pub objects_written: usize,
    pub bytes_written: u64,
    /// `None` when the push carried no objects and the branch was left alone
    pub new_head_commit_id: Option<u64>,
}

impl BinaryCodec for PushOutcome {}

pub struct PushIngestor {
    kv: Arc<dyn KeyValueStore>,
    large_files: Arc<dyn LargeFileStore>,
    quotas: QuotaPolicy,
}

impl PushIngestor {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        large_files: Arc<dyn LargeFileStore>,
        quotas: QuotaPolicy,
    ) -> Self {
        Self {
            kv,
            large_files,
            quotas,
        }
    }

    /// Check the client's base against the server's and report which of the
    /// client's file ids are already stored.
    pub async fn handle_query(&self, query: &PushQuery) -> Result<PushQueryResponse> {
        let store = RepoStore::new(self.kv.clone(), &query.org, &query.repo);
        if let Some(branch) = store.get_branch(&query.branch_name).await? {
            if branch.base_commit_id != query.base_commit_id {
                return Ok(PushQueryResponse {
                    response_type: PushQueryResponseType::Error,
                    message: format!(
                        "Mismatched base commit ids: server's is {} and client's is {}",
                        branch.base_commit_id, query.base_commit_id
                    ),
                    file_ids_server_already_has: Vec::new(),
                });
            }
        }

        let mut already_has = Vec::new();
        for file_id in &query.file_ids {
            if store.has_file(file_id).await? {
                already_has.push(file_id.clone());
            }
        }
        Ok(PushQueryResponse {
            response_type: PushQueryResponseType::Ok,
            message: "Push looks ok".to_string(),
            file_ids_server_already_has: already_has,
        })
    }

    /// Consume a whole push stream and seal the branch head.
    pub async fn ingest<R>(&self, user_id: &str, reader: &mut ObjectReader<R>) -> Result<PushOutcome>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let spec = read_push_spec(reader).await?;
        self.ingest_spec(spec, user_id, reader).await
    }

    /// Like [`ingest`](Self::ingest), but the push spec must name `org/repo`.
    pub async fn ingest_into<R>(
        &self,
        org: &str,
        repo: &str,
        user_id: &str,
        reader: &mut ObjectReader<R>,
    ) -> Result<PushOutcome>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let spec = read_push_spec(reader).await?;
        if spec.org != org || spec.repo != repo {
            return Err(Error::InvalidArgument(format!(
                "Push for {}/{} sent to {}/{}",
                spec.org, spec.repo, org, repo
            )));
        }
        self.ingest_spec(spec, user_id, reader).await
    }

    async fn ingest_spec<R>(
        &self,
        spec: PushSpec,
        user_id: &str,
        reader: &mut ObjectReader<R>,
    ) -> Result<PushOutcome>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        if spec.branch_name == MAIN_BRANCH {
            return Err(Error::InvalidArgument("You can't push directly to main.".to_string()));
        }
        validate_branch_name(&spec.branch_name)?;

        let store = RepoStore::new(self.kv.clone(), &spec.org, &spec.repo);
        if store.get_repo().await?.is_none() {
            return Err(Error::NotFound(format!("Repo {}/{} not found", spec.org, spec.repo)));
        }
        let quota = self.quotas.quota_for(&spec.org);
        let existing_size = store.repo_size().await?;
        quota.ensure_allowed(existing_size)?;

        let branch = open_branch(&store, &spec).await?;
        info!(
            org = %spec.org,
            repo = %spec.repo,
            branch = %spec.branch_name,
            head = branch.value.head_commit_id,
            user = user_id,
            "push started"
        );

        let mut session = PushSession {
            store,
            large_files: self.large_files.as_ref(),
            spec,
            branch,
            user_id,
            quota,
            existing_size,
            bytes_written: 0,
            objects_written: 0,
            highest_seen: 0,
            commit_ids: HashSet::new(),
            pending_large: None,
        };
        while let Some(header) = reader.next_header().await? {
            session.handle(header, reader).await?;
        }
        session.finish().await
    }
}

async fn read_push_spec<R>(reader: &mut ObjectReader<R>) -> Result<PushSpec>
where
    R: AsyncBufRead + Unpin + Send,
{
    let header = reader
        .next_header()
        .await?
        .ok_or_else(|| Error::Protocol("Empty push stream".to_string()))?;
    if header.object_type != ObjectType::PushSpec {
        return Err(Error::Protocol("Expected a push spec first".to_string()));
    }
    reader.read_object().await
}

/// Fetch the branch with its raw bytes, creating it at the push's base if new.
async fn open_branch(store: &RepoStore, spec: &PushSpec) -> Result<Versioned<BranchEntry>> {
    if let Some(existing) = store.get_branch_versioned(&spec.branch_name).await? {
        if existing.value.base_commit_id != spec.base_commit_id {
            return Err(Error::Stale(format!(
                "Mismatched base commit ids: server's is {} and client's is {}",
                existing.value.base_commit_id, spec.base_commit_id
            )));
        }
        return Ok(existing);
    }

    let created = BranchEntry::new(&spec.branch_name, spec.base_commit_id, spec.base_commit_id);
    if store.create_branch(&created).await? {
        debug!(branch = %spec.branch_name, base = spec.base_commit_id, "created branch");
    }
    let current = store
        .get_branch_versioned(&spec.branch_name)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Branch {} vanished", spec.branch_name)))?;
    if current.value.base_commit_id != spec.base_commit_id {
        return Err(Error::Stale(format!(
            "Mismatched base commit ids: server's is {} and client's is {}",
            current.value.base_commit_id, spec.base_commit_id
        )));
    }
    Ok(current)
}

struct PushSession<'a> {
    store: RepoStore,
    large_files: &'a dyn LargeFileStore,
    spec: PushSpec,
    branch: Versioned<BranchEntry>,
    user_id: &'a str,
    quota: RepoQuota,
    existing_size: u64,
    bytes_written: u64,
    objects_written: usize,
    highest_seen: u64,
    commit_ids: HashSet<u64>,
    /// Large file whose contents arrived and whose FILE entry must come next
    pending_large: Option<String>,
}

impl PushSession<'_> {
    fn head(&self) -> u64 {
        self.branch.value.head_commit_id
    }

    fn check_quota(&self, additional: u64) -> Result<()> {
        self.quota
            .ensure_allowed(self.existing_size + self.bytes_written + additional)
    }

    fn expect_no_pending_large(&self) -> Result<()> {
        match &self.pending_large {
            Some(id) => Err(Error::Protocol(format!(
                "Expected the FILE entry for large file {}",
                id
            ))),
            None => Ok(()),
        }
    }

    async fn handle<R>(&mut self, header: RecordHeader, reader: &mut ObjectReader<R>) -> Result<()>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        match header.object_type {
            ObjectType::LargeFileContents => {
                self.expect_no_pending_large()?;
                let mut payload = reader.payload_reader();
                let size = self
                    .large_files
                    .save(
                        &self.spec.org,
                        &self.spec.repo,
                        &header.object_id,
                        &mut payload,
                        header.len,
                    )
                    .await?;
                self.bytes_written += size;
                self.check_quota(0)?;
                self.pending_large = Some(header.object_id);
            }
            ObjectType::File => {
                let entry: FileEntry = reader.read_object().await?;
                self.write_file(entry).await?;
            }
            ObjectType::Folder => {
                self.expect_no_pending_large()?;
                let listing: FolderListing = reader.read_object().await?;
                self.write_folder(listing).await?;
            }
            ObjectType::Commit => {
                self.expect_no_pending_large()?;
                let commit: CommitEntry = reader.read_object().await?;
                self.write_commit(commit).await?;
            }
            ObjectType::PushSpec | ObjectType::MergeResult => {
                return Err(Error::Protocol(format!(
                    "Unexpected {} record in push",
                    header.object_type
                )));
            }
        }
        Ok(())
    }

    async fn write_file(&mut self, entry: FileEntry) -> Result<()> {
        match (self.pending_large.take(), entry.storage_type) {
            (Some(id), StorageType::Blob) if id == entry.id => {}
            (Some(id), _) => {
                return Err(Error::Protocol(format!(
                    "Expected the FILE entry for large file {}, got {}",
                    id, entry.id
                )));
            }
            (None, StorageType::Blob) => {
                return Err(Error::Protocol(format!(
                    "Got large FILE entry {} without its contents",
                    entry.id
                )));
            }
            (None, StorageType::Inline) => {
                let len = entry.contents.len() as u64;
                if len > LARGE_FILE_SIZE_THRESHOLD {
                    return Err(Error::Protocol(format!(
                        "Inline file {} is {} bytes; files over {} bytes must be sent as large files",
                        entry.id, len, LARGE_FILE_SIZE_THRESHOLD
                    )));
                }
                self.check_quota(len)?;
                self.bytes_written += len;
            }
        }
        self.store.put_file(&entry).await?;
        self.objects_written += 1;
        Ok(())
    }

    async fn write_folder(&mut self, listing: FolderListing) -> Result<()> {
        if listing.branch != self.spec.branch_name {
            return Err(Error::Protocol(format!(
                "Folder {} is for branch {}, not {}",
                listing.path, listing.branch, self.spec.branch_name
            )));
        }
        if listing.merge_lock_id.is_some() {
            return Err(Error::Protocol(format!(
                "Pushed folder {} carries a merge lock",
                listing.path
            )));
        }
        if listing.commit_id <= self.head() {
            return Err(Error::Stale(format!(
                "Got new folder with commit id {} for branch at {}",
                listing.commit_id,
                self.head()
            )));
        }
        self.highest_seen = self.highest_seen.max(listing.commit_id);
        self.store.put_folder(&listing).await?;
        self.objects_written += 1;
        Ok(())
    }

    async fn write_commit(&mut self, commit: CommitEntry) -> Result<()> {
        if commit.branch_name != self.spec.branch_name {
            return Err(Error::Protocol(format!(
                "Commit {} is for branch {}, not {}",
                commit.commit_id, commit.branch_name, self.spec.branch_name
            )));
        }
        if commit.commit_id <= self.head() {
            return Err(Error::Stale(format!(
                "Got new commit with id {} for branch at {}",
                commit.commit_id,
                self.head()
            )));
        }
        if !self.commit_ids.insert(commit.commit_id) {
            return Err(Error::Protocol(format!(
                "Commit {} was sent twice",
                commit.commit_id
            )));
        }
        if commit.integration.is_some() {
            self.highest_seen = self.highest_seen.max(commit.commit_id);
        }
        let commit = commit.with_author(self.user_id);
        self.store.put_commit(&commit).await?;
        self.objects_written += 1;
        Ok(())
    }

    async fn finish(self) -> Result<PushOutcome> {
        self.expect_no_pending_large()?;
        if self.objects_written == 0 {
            info!(branch = %self.spec.branch_name, "push carried no objects");
            return Ok(PushOutcome {
                branch_name: self.spec.branch_name,
                objects_written: 0,
                bytes_written: self.bytes_written,
                new_head_commit_id: None,
            });
        }
        if self.spec.new_head_commit_id != self.highest_seen {
            return Err(Error::Stale(format!(
                "The new head commit ({}) didn't match the newest folder commit ({})",
                self.spec.new_head_commit_id, self.highest_seen
            )));
        }

        let total = self.store.add_to_repo_size(self.bytes_written).await?;
        if let Err(e) = self.quota.ensure_allowed(total) {
            // a concurrent push got in first; this one was within quota when checked
            warn!(repo = %self.spec.repo, size = total, error = %e, "repo is over quota after push");
        }

        let updated = self.branch.value.with_head(self.spec.new_head_commit_id);
        if !self.store.update_branch_if_unchanged(&self.branch, &updated).await? {
            return Err(Error::Stale(format!(
                "Branch failed to update! {} changed on the server during the push.",
                self.spec.branch_name
            )));
        }
        info!(
            branch = %self.spec.branch_name,
            head = self.spec.new_head_commit_id,
            objects = self.objects_written,
            bytes = self.bytes_written,
            "push finished"
        );
        Ok(PushOutcome {
            branch_name: self.spec.branch_name,
            objects_written: self.objects_written,
            bytes_written: self.bytes_written,
            new_head_commit_id: Some(self.spec.new_head_commit_id),
        })
    }
}
