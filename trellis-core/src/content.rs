//! File content reconstruction from diff chains
//!
//! A DIFF entry points at its predecessor through `base_entry_id`; the chain
//! ends at a FULL entry at most [`MAX_DIFF_SEARCH`] hops back. Writers keep
//! chains within that bound, so running past it means the data is damaged.

use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;

use crate::blob::LargeFileStore;
use crate::delta::DeltaCodec;
use crate::error::{Error, Result};
use crate::object::{ContentsType, FileEntry, StorageType, MAX_DIFF_SEARCH};
use crate::patched::PatchedView;
use crate::repo_store::RepoStore;

#[derive(Clone)]
pub struct ContentResolver {
    store: RepoStore,
    large_files: Arc<dyn LargeFileStore>,
    codec: Arc<dyn DeltaCodec>,
}

impl ContentResolver {
    pub fn new(
        store: RepoStore,
        large_files: Arc<dyn LargeFileStore>,
        codec: Arc<dyn DeltaCodec>,
    ) -> Self {
        Self {
            store,
            large_files,
            codec,
        }
    }

    async fn base_entry(&self, entry: &FileEntry) -> Result<FileEntry> {
        let base_id = entry.base_entry_id.as_deref().ok_or_else(|| {
            Error::Corruption(format!("Diff entry {} has no base entry id", entry.id))
        })?;
        self.store.get_file(base_id).await?.ok_or_else(|| {
            Error::Corruption(format!("Base entry {} of {} is missing", base_id, entry.id))
        })
    }

    async fn full_contents(&self, entry: &FileEntry) -> Result<Bytes> {
        match entry.storage_type {
            StorageType::Inline => Ok(Bytes::from(entry.contents.clone())),
            StorageType::Blob => Ok(Bytes::from(
                self.large_files
                    .read_all(self.store.org(), self.store.repo(), &entry.id)
                    .await?,
            )),
        }
    }

    /// Contents of `entry` as a lazily patched view over its FULL base.
    pub async fn resolve(&self, entry: &FileEntry) -> Result<PatchedView> {
        let mut deltas: Vec<Bytes> = Vec::new();
        let mut current = entry.clone();
        for _ in 0..=MAX_DIFF_SEARCH {
            match current.contents_type {
                ContentsType::Full => {
                    let mut view = PatchedView::base(self.full_contents(&current).await?);
                    for delta in deltas.into_iter().rev() {
                        view = view.patch(self.codec.as_ref(), delta)?;
                    }
                    return Ok(view);
                }
                ContentsType::Diff => {
                    let base = self.base_entry(&current).await?;
                    deltas.push(Bytes::from(std::mem::take(&mut current.contents)));
                    current = base;
                }
            }
        }
        Err(Error::Corruption(format!(
            "Couldn't resolve {} after {} diff entries",
            entry.id, MAX_DIFF_SEARCH
        )))
    }

    pub async fn resolve_bytes(&self, entry: &FileEntry) -> Result<Bytes> {
        Ok(self.resolve(entry).await?.to_bytes())
    }

    /// Load and resolve a stored file by id.
    pub async fn resolve_id(&self, file_id: &str) -> Result<Bytes> {
        let entry = self
            .store
            .get_file(file_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("File {} not found", file_id)))?;
        self.resolve_bytes(&entry).await
    }

    /// Ids along the chain from `file_id` back to its FULL base, newest first.
    pub async fn chain_ids(&self, file_id: &str) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        self.collect_chain(file_id, &mut HashSet::new(), &mut ids).await?;
        Ok(ids)
    }

    /// Append `file_id` and its bases to `out`, stopping early at any id
    /// already in `seen` (its own chain was collected then).
    pub async fn collect_chain(
        &self,
        file_id: &str,
        seen: &mut HashSet<String>,
        out: &mut Vec<String>,
    ) -> Result<()> {
        let mut next = Some(file_id.to_string());
        for _ in 0..=MAX_DIFF_SEARCH {
            let Some(id) = next.take() else {
                return Ok(());
            };
            if !seen.insert(id.clone()) {
                return Ok(());
            }
            let entry = self.store.get_file(&id).await?.ok_or_else(|| {
                Error::Corruption(format!("File entry {} is missing", id))
            })?;
            out.push(id);
            if entry.contents_type == ContentsType::Diff {
                next = Some(entry.base_entry_id.ok_or_else(|| {
                    Error::Corruption(format!("Diff entry {} has no base entry id", entry.id))
                })?);
            }
        }
        match next {
            None => Ok(()),
            Some(_) => Err(Error::Corruption(format!(
                "Diff chain of {} is longer than {} entries",
                file_id, MAX_DIFF_SEARCH
            ))),
        }
    }
}
