//! Checkout: crawl folders at a commit and stream what the client lacks
//!
//! A checkout is two round trips. [`CheckoutCrawler::compute_checkout`]
//! tells the client every file id the requested folders need, including the
//! bases of diff chains. The client answers with the ids it is missing and
//! [`CheckoutCrawler::do_checkout`] streams the folder listings followed by
//! those file entries.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tracing::{debug, info, warn};

use crate::blob::LargeFileStore;
use crate::content::ContentResolver;
use crate::error::{Error, Result};
use crate::history::FolderHistory;
use crate::object::{BinaryCodec, EntryType, FolderListing, StorageType};
use crate::paths::{join_subfolder, CheckoutPathSet};
use crate::repo_store::RepoStore;
use crate::visibility::{MergeVisibility, CHECKOUT_WINDOW_MILLIS};
use crate::wire::{ObjectType, ObjectWriter};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCheckoutSpec {
    pub all_file_ids_from_server: Vec<String>,
}

impl BinaryCodec for ServerCheckoutSpec {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientCheckoutSpec {
    pub file_ids_client_needs: Vec<String>,
}

impl BinaryCodec for ClientCheckoutSpec {}

/// Folders reached by a crawl, in BFS order, and the closure of file ids
/// they reference.
#[derive(Debug, Default)]
pub struct CrawlResult {
    pub folders: Vec<FolderListing>,
    pub file_ids: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckoutStats {
    pub folders_sent: usize,
    pub files_sent: usize,
    pub large_bytes_sent: u64,
}

pub struct CheckoutCrawler {
    store: RepoStore,
    resolver: ContentResolver,
    large_files: Arc<dyn LargeFileStore>,
    window_millis: i64,
}

impl CheckoutCrawler {
    pub fn new(store: RepoStore, resolver: ContentResolver, large_files: Arc<dyn LargeFileStore>) -> Self {
        Self {
            store,
            resolver,
            large_files,
            window_millis: CHECKOUT_WINDOW_MILLIS,
        }
    }

    pub fn with_window_millis(mut self, window_millis: i64) -> Self {
        self.window_millis = window_millis;
        self
    }

    /// Breadth-first walk from each requested root, using one visibility
    /// snapshot for the whole crawl.
    pub async fn crawl(&self, branch: &str, commit_id: u64, paths: &CheckoutPathSet) -> Result<CrawlResult> {
        let visibility = MergeVisibility::load(self.store.clone(), self.window_millis).await?;
        let history = FolderHistory::new(&self.store, &visibility);

        let mut result = CrawlResult::default();
        let mut queue: VecDeque<String> = VecDeque::new();
        for root in paths.iter() {
            match history.get_at_commit(branch, root, commit_id).await? {
                Some(listing) => self.visit(listing, &mut queue, &mut result),
                None => {
                    return Err(Error::NotFound(format!(
                        "No such folder found on the server: {} on branch {}:{}",
                        root, branch, commit_id
                    )));
                }
            }
        }
        while let Some(path) = queue.pop_front() {
            match history.get_at_commit(branch, &path, commit_id).await? {
                Some(listing) => self.visit(listing, &mut queue, &mut result),
                None => warn!(path = %path, branch, commit_id, "folder has no listing at commit, skipping"),
            }
        }

        let direct: Vec<String> = result.file_ids.iter().cloned().collect();
        let mut seen = HashSet::new();
        let mut chain = Vec::new();
        for file_id in &direct {
            self.resolver.collect_chain(file_id, &mut seen, &mut chain).await?;
        }
        result.file_ids.extend(chain);
        debug!(
            folders = result.folders.len(),
            files = result.file_ids.len(),
            "checkout crawl finished"
        );
        Ok(result)
    }

    fn visit(&self, listing: FolderListing, queue: &mut VecDeque<String>, result: &mut CrawlResult) {
        for entry in &listing.entries {
            match entry.entry_type {
                EntryType::Folder => queue.push_back(join_subfolder(&listing.path, &entry.name)),
                EntryType::File => {
                    if let Some(file_id) = &entry.file_id {
                        result.file_ids.insert(file_id.clone());
                    }
                }
            }
        }
        result.folders.push(listing);
    }

    /// Every file id a checkout of `paths` needs.
    pub async fn compute_checkout(
        &self,
        branch: &str,
        commit_id: u64,
        paths: &CheckoutPathSet,
    ) -> Result<ServerCheckoutSpec> {
        let crawl = self.crawl(branch, commit_id, paths).await?;
        Ok(ServerCheckoutSpec {
            all_file_ids_from_server: crawl.file_ids.into_iter().collect(),
        })
    }

    /// Stream the crawled folders, then the requested files.
    pub async fn do_checkout<W>(
        &self,
        branch: &str,
        commit_id: u64,
        paths: &CheckoutPathSet,
        client: &ClientCheckoutSpec,
        out: &mut ObjectWriter<W>,
    ) -> Result<CheckoutStats>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let crawl = self.crawl(branch, commit_id, paths).await?;
        let mut stats = CheckoutStats::default();

        for listing in &crawl.folders {
            let id = format!("{}:{}", listing.path, listing.commit_id);
            out.write_object(ObjectType::Folder, &id, listing).await?;
            stats.folders_sent += 1;
        }

        for file_id in &client.file_ids_client_needs {
            if !crawl.file_ids.contains(file_id) {
                warn!(file_id = %file_id, "client asked for a file outside the checkout, skipping");
                continue;
            }
            let entry = self.store.get_file(file_id).await?.ok_or_else(|| {
                Error::Corruption(format!("File entry {} is missing", file_id))
            })?;
            if entry.storage_type == StorageType::Blob {
                let (reader, len) = self
                    .large_files
                    .open(self.store.org(), self.store.repo(), &entry.id)
                    .await?;
                out.write_stream(ObjectType::LargeFileContents, &entry.id, len, reader)
                    .await?;
                stats.large_bytes_sent += len;
            }
            out.write_object(ObjectType::File, &entry.id, &entry).await?;
            stats.files_sent += 1;
        }
        out.flush().await?;

        info!(
            branch,
            commit_id,
            folders = stats.folders_sent,
            files = stats.files_sent,
            "checkout sent"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::FsLargeFileStore;
    use crate::delta::{DeltaCodec, GitDeltaCodec};
    use crate::kv::{KeyValueStore, MemoryStore};
    use crate::object::{BranchEntry, FileEntry, FolderEntry, MergeLock, MergeState};
    use crate::wire::ObjectReader;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: RepoStore,
        large_files: Arc<dyn LargeFileStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
            let large_files: Arc<dyn LargeFileStore> = Arc::new(FsLargeFileStore::new(dir.path()));
            Self {
                _dir: dir,
                store: RepoStore::new(kv, "acme", "widgets"),
                large_files,
            }
        }

        fn crawler(&self) -> CheckoutCrawler {
            let resolver = ContentResolver::new(
                self.store.clone(),
                self.large_files.clone(),
                Arc::new(GitDeltaCodec::new()),
            );
            CheckoutCrawler::new(self.store.clone(), resolver, self.large_files.clone())
        }
    }

    fn paths(p: &[&str]) -> CheckoutPathSet {
        CheckoutPathSet::new(p.iter().copied()).unwrap()
    }

    /// main:1 has `/` with `a.txt` and `docs/`; `docs/` holds a diff of a.txt.
    async fn seed(fx: &Fixture) -> (FileEntry, FileEntry) {
        let base = FileEntry::full_from_contents(b"hello world".to_vec());
        let delta = GitDeltaCodec::new().compute_delta(b"hello world", b"hello there world");
        let diff = FileEntry::diff("notes-v2", base.id.clone(), delta);
        fx.store.put_file(&base).await.unwrap();
        fx.store.put_file(&diff).await.unwrap();
        fx.store.create_branch(&BranchEntry::new("main", 1, 1)).await.unwrap();
        fx.store
            .put_folder(&FolderListing::new(
                "/",
                "main",
                1,
                vec![FolderEntry::file("a.txt", base.id.clone()), FolderEntry::folder("docs")],
            ))
            .await
            .unwrap();
        fx.store
            .put_folder(&FolderListing::new(
                "/docs/",
                "main",
                1,
                vec![FolderEntry::file("notes.txt", "notes-v2")],
            ))
            .await
            .unwrap();
        (base, diff)
    }

    #[tokio::test]
    async fn test_compute_includes_chain_bases() {
        let fx = Fixture::new();
        let (base, diff) = seed(&fx).await;
        let spec = fx
            .crawler()
            .compute_checkout("main", 1, &paths(&["/docs/"]))
            .await
            .unwrap();
        let mut expected = vec![base.id, diff.id];
        expected.sort();
        assert_eq!(spec.all_file_ids_from_server, expected);
    }

    #[tokio::test]
    async fn test_crawl_is_breadth_first() {
        let fx = Fixture::new();
        seed(&fx).await;
        let crawl = fx.crawler().crawl("main", 1, &paths(&["/"])).await.unwrap();
        let order: Vec<&str> = crawl.folders.iter().map(|l| l.path.as_str()).collect();
        assert_eq!(order, vec!["/", "/docs/"]);
    }

    #[tokio::test]
    async fn test_missing_root_is_not_found() {
        let fx = Fixture::new();
        seed(&fx).await;
        let err = fx
            .crawler()
            .crawl("main", 1, &paths(&["/nowhere/"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::NotFound(ref m) if m == "No such folder found on the server: /nowhere/ on branch main:1"
        ));
    }

    #[tokio::test]
    async fn test_missing_subfolder_skipped() {
        let fx = Fixture::new();
        fx.store
            .put_folder(&FolderListing::new("/", "main", 1, vec![FolderEntry::folder("ghost")]))
            .await
            .unwrap();
        let crawl = fx.crawler().crawl("main", 1, &paths(&["/"])).await.unwrap();
        assert_eq!(crawl.folders.len(), 1);
    }

    #[tokio::test]
    async fn test_unfinished_merge_hidden_from_checkout() {
        let fx = Fixture::new();
        seed(&fx).await;
        let lock = MergeLock::in_progress("feature", crate::visibility::now_millis());
        fx.store.put_merge_lock(&lock).await.unwrap();
        fx.store
            .put_folder(&FolderListing::new("/", "feature", 2, vec![]).relocated("main", 2, &lock.id))
            .await
            .unwrap();
        let crawl = fx.crawler().crawl("main", 2, &paths(&["/"])).await.unwrap();
        assert_eq!(crawl.folders[0].commit_id, 1);

        fx.store
            .put_merge_lock(&lock.with_state(MergeState::Completed))
            .await
            .unwrap();
        let crawl = fx.crawler().crawl("main", 2, &paths(&["/"])).await.unwrap();
        assert_eq!(crawl.folders[0].commit_id, 2);
        assert!(crawl.file_ids.is_empty());
    }

    #[tokio::test]
    async fn test_do_checkout_streams_folders_then_requested_files() {
        let fx = Fixture::new();
        let (base, _) = seed(&fx).await;
        let big = FileEntry::large("big-one");
        let mut contents: &[u8] = b"large payload";
        fx.large_files
            .save("acme", "widgets", "big-one", &mut contents, 13)
            .await
            .unwrap();
        fx.store.put_file(&big).await.unwrap();
        fx.store
            .put_folder(&FolderListing::new(
                "/",
                "main",
                2,
                vec![FolderEntry::file("a.txt", base.id.clone()), FolderEntry::file("big", "big-one")],
            ))
            .await
            .unwrap();

        let client = ClientCheckoutSpec {
            file_ids_client_needs: vec!["big-one".into(), "not-in-checkout".into(), base.id.clone()],
        };
        let mut out = ObjectWriter::new(Vec::new());
        let stats = fx
            .crawler()
            .do_checkout("main", 2, &paths(&["/"]), &client, &mut out)
            .await
            .unwrap();
        assert_eq!(
            stats,
            CheckoutStats {
                folders_sent: 1,
                files_sent: 2,
                large_bytes_sent: 13,
            }
        );

        let bytes = out.into_inner();
        let mut reader = ObjectReader::new(bytes.as_slice());
        let header = reader.next_header().await.unwrap().unwrap();
        assert_eq!((header.object_type, header.object_id.as_str()), (ObjectType::Folder, "/:2"));
        reader.read_payload().await.unwrap();

        let header = reader.next_header().await.unwrap().unwrap();
        assert_eq!(header.object_type, ObjectType::LargeFileContents);
        assert_eq!(reader.read_payload().await.unwrap(), b"large payload");
        let header = reader.next_header().await.unwrap().unwrap();
        assert_eq!((header.object_type, header.object_id.as_str()), (ObjectType::File, "big-one"));
        reader.read_payload().await.unwrap();

        let header = reader.next_header().await.unwrap().unwrap();
        assert_eq!(header.object_id, base.id);
        let entry: FileEntry = reader.read_object().await.unwrap();
        assert_eq!(entry, base);
        assert!(reader.next_header().await.unwrap().is_none());
    }
}
