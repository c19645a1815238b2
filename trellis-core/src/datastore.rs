//! Engine facade
//!
//! Holds the shared store handles and exposes every repository operation by
//! `(org, repo)`. Each call builds the per-repo components it needs; nothing
//! here is cached across calls.

use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tracing::info;

use crate::blob::{FsLargeFileStore, LargeFileStore};
use crate::checkout::{CheckoutCrawler, CheckoutStats, ClientCheckoutSpec, ServerCheckoutSpec};
use crate::commit_log::CommitLog;
use crate::config::EngineConfig;
use crate::content::ContentResolver;
use crate::delta::{DeltaCodec, GitDeltaCodec};
use crate::error::{Error, Result};
use crate::history::FolderHistory;
use crate::kv::KeyValueStore;
use crate::merge::MergeCoordinator;
use crate::object::{BranchEntry, CommitEntry, ContentsType, FolderListing, MergeResult, RepoEntry, MAIN_BRANCH};
use crate::paths::{validate_repo_name, CheckoutPathSet, ROOT_PATH};
use crate::push::{PushIngestor, PushOutcome, PushQuery, PushQueryResponse};
use crate::repo_store::RepoStore;
use crate::sled_store::SledStore;
use crate::visibility::{now_millis, MergeVisibility};
use crate::wire::{ObjectReader, ObjectWriter};

/// First commit id on main; the empty root listing lives there.
pub const INITIAL_COMMIT_ID: u64 = 1;

/// Result of walking one file's diff chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileReport {
    pub file_id: String,
    /// Ids from the file back to its FULL base, newest first
    pub chain: Vec<String>,
    pub reaches_full: bool,
    pub resolved_len: Option<usize>,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct Datastore {
    kv: Arc<dyn KeyValueStore>,
    large_files: Arc<dyn LargeFileStore>,
    codec: Arc<dyn DeltaCodec>,
    config: EngineConfig,
}

impl Datastore {
    /// Open the sled database and large-file directory under `config.data_dir`.
    pub fn open(config: &EngineConfig) -> Result<Self> {
        let kv = SledStore::open(config.db_path())?;
        let large_files = FsLargeFileStore::new(config.large_file_path());
        Ok(Self::new(Arc::new(kv), Arc::new(large_files), config.clone()))
    }

    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        large_files: Arc<dyn LargeFileStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            kv,
            large_files,
            codec: Arc::new(GitDeltaCodec::new()),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn repo(&self, org: &str, repo: &str) -> RepoStore {
        RepoStore::new(self.kv.clone(), org, repo)
    }

    fn resolver(&self, org: &str, repo: &str) -> ContentResolver {
        ContentResolver::new(self.repo(org, repo), self.large_files.clone(), self.codec.clone())
    }

    fn crawler(&self, org: &str, repo: &str) -> CheckoutCrawler {
        CheckoutCrawler::new(
            self.repo(org, repo),
            self.resolver(org, repo),
            self.large_files.clone(),
        )
        .with_window_millis(self.config.checkout_window_millis())
    }

    fn ingestor(&self) -> PushIngestor {
        PushIngestor::new(self.kv.clone(), self.large_files.clone(), self.config.quota.clone())
    }

    // Repository lifecycle

    /// Create a repo with an empty root folder on main at commit 1.
    pub async fn create_repo(&self, org: &str, repo: &str) -> Result<RepoEntry> {
        validate_repo_name("org", org)?;
        validate_repo_name("repo", repo)?;
        let store = self.repo(org, repo);
        let entry = RepoEntry {
            org: org.to_string(),
            repo: repo.to_string(),
            created_at_millis: now_millis(),
        };
        if !store.create_repo_entry(&entry).await? {
            return Err(Error::InvalidArgument(format!("Repo {}/{} already exists", org, repo)));
        }
        store.add_to_repo_size(0).await?;
        store
            .create_branch(&BranchEntry::new(MAIN_BRANCH, INITIAL_COMMIT_ID, INITIAL_COMMIT_ID))
            .await?;
        store
            .put_folder_if_absent(&FolderListing::new(ROOT_PATH, MAIN_BRANCH, INITIAL_COMMIT_ID, vec![]))
            .await?;
        info!(org, repo, "created repo");
        Ok(entry)
    }

    pub async fn get_branch(&self, org: &str, repo: &str, branch: &str) -> Result<Option<BranchEntry>> {
        self.repo(org, repo).get_branch(branch).await
    }

    pub async fn repo_size(&self, org: &str, repo: &str) -> Result<u64> {
        self.repo(org, repo).repo_size().await
    }

    // Push

    pub async fn handle_push_query(&self, query: &PushQuery) -> Result<PushQueryResponse> {
        self.ingestor().handle_query(query).await
    }

    pub async fn push<R>(&self, user_id: &str, reader: &mut ObjectReader<R>) -> Result<PushOutcome>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        self.ingestor().ingest(user_id, reader).await
    }

    /// Push addressed to `org/repo`; a stream naming any other repo is rejected.
    pub async fn push_to<R>(
        &self,
        org: &str,
        repo: &str,
        user_id: &str,
        reader: &mut ObjectReader<R>,
    ) -> Result<PushOutcome>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        self.ingestor().ingest_into(org, repo, user_id, reader).await
    }

    // Checkout

    pub async fn compute_checkout(
        &self,
        org: &str,
        repo: &str,
        branch: &str,
        commit_id: u64,
        paths: &CheckoutPathSet,
    ) -> Result<ServerCheckoutSpec> {
        self.crawler(org, repo)
            .compute_checkout(branch, commit_id, paths)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn do_checkout<W>(
        &self,
        org: &str,
        repo: &str,
        branch: &str,
        commit_id: u64,
        paths: &CheckoutPathSet,
        client: &ClientCheckoutSpec,
        out: &mut ObjectWriter<W>,
    ) -> Result<CheckoutStats>
    where
        W: AsyncWrite + Unpin + Send,
    {
        self.crawler(org, repo)
            .do_checkout(branch, commit_id, paths, client, out)
            .await
    }

    // Merge

    pub async fn merge(&self, org: &str, repo: &str, branch: &str, head_commit_id: u64) -> Result<MergeResult> {
        MergeCoordinator::new(self.repo(org, repo))
            .with_window_millis(self.config.merge_window_millis())
            .merge(branch, head_commit_id)
            .await
    }

    // Browsing

    pub async fn log(
        &self,
        org: &str,
        repo: &str,
        branch: &str,
        path: &str,
        at_commit_id: u64,
    ) -> Result<Vec<CommitEntry>> {
        CommitLog::new(self.repo(org, repo))
            .log(branch, path, at_commit_id)
            .await
    }

    pub async fn file_contents(&self, org: &str, repo: &str, file_id: &str) -> Result<Bytes> {
        self.resolver(org, repo).resolve_id(file_id).await
    }

    pub async fn folder_at(
        &self,
        org: &str,
        repo: &str,
        branch: &str,
        path: &str,
        commit_id: u64,
    ) -> Result<Option<FolderListing>> {
        let store = self.repo(org, repo);
        let visibility =
            MergeVisibility::load(store.clone(), self.config.checkout_window_millis()).await?;
        FolderHistory::new(&store, &visibility)
            .get_at_commit(branch, path, commit_id)
            .await
    }

    /// Walk a file's diff chain and try to resolve it. Damage is reported in
    /// the result rather than returned as an error.
    pub async fn verify_file(&self, org: &str, repo: &str, file_id: &str) -> Result<FileReport> {
        let store = self.repo(org, repo);
        let entry = store
            .get_file(file_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("File {} not found", file_id)))?;
        let resolver = self.resolver(org, repo);

        let mut report = FileReport {
            file_id: file_id.to_string(),
            chain: Vec::new(),
            reaches_full: false,
            resolved_len: None,
            error: None,
        };
        match resolver.chain_ids(file_id).await {
            Ok(chain) => {
                if let Some(last) = chain.last() {
                    report.reaches_full = store
                        .get_file(last)
                        .await?
                        .is_some_and(|base| base.contents_type == ContentsType::Full);
                }
                report.chain = chain;
            }
            Err(e) => {
                report.error = Some(e.to_string());
                return Ok(report);
            }
        }
        match resolver.resolve(&entry).await {
            Ok(view) => report.resolved_len = Some(view.len()),
            Err(e) => report.error = Some(e.to_string()),
        }
        Ok(report)
    }
}
