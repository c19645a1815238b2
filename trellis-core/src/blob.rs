//! Large file storage
//!
//! Files above the inline threshold are kept outside the key-value store.
//! Contents stream straight through to disk and back out, never fully
//! buffered. The filesystem layout is content-addressed by the file id:
//!
//! ```text
//! {root}/{org}/{repo}/{h[0..2]}/{h[2..]}   where h = sha256(fileId)
//! ```

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::error::{Error, Result};
use crate::object::content_hash;
use crate::paths::validate_repo_name;

pub type BlobReader = Box<dyn AsyncRead + Unpin + Send>;

#[async_trait]
pub trait LargeFileStore: Send + Sync {
    /// Store exactly `expected_len` bytes from `reader`. A shorter stream is
    /// a protocol error and leaves nothing behind.
    async fn save(
        &self,
        org: &str,
        repo: &str,
        file_id: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        expected_len: u64,
    ) -> Result<u64>;

    /// Open stored contents for streaming, with their length.
    async fn open(&self, org: &str, repo: &str, file_id: &str) -> Result<(BlobReader, u64)>;

    async fn exists(&self, org: &str, repo: &str, file_id: &str) -> Result<bool>;

    /// Read stored contents fully into memory.
    async fn read_all(&self, org: &str, repo: &str, file_id: &str) -> Result<Vec<u8>> {
        let (mut reader, len) = self.open(org, repo, file_id).await?;
        let mut buf = Vec::with_capacity(len as usize);
        reader.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

/// Large files on the local filesystem.
pub struct FsLargeFileStore {
    root: PathBuf,
}

impl FsLargeFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, org: &str, repo: &str, file_id: &str) -> Result<PathBuf> {
        validate_repo_name("org", org)?;
        validate_repo_name("repo", repo)?;
        let hash = content_hash(file_id.as_bytes());
        Ok(self.root.join(org).join(repo).join(&hash[..2]).join(&hash[2..]))
    }
}

#[async_trait]
impl LargeFileStore for FsLargeFileStore {
    async fn save(
        &self,
        org: &str,
        repo: &str,
        file_id: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        expected_len: u64,
    ) -> Result<u64> {
        let path = self.blob_path(org, repo, file_id)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        let copied = match tokio::io::copy(&mut reader.take(expected_len), &mut file).await {
            Ok(n) => n,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(e.into());
            }
        };
        if copied != expected_len {
            drop(file);
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(Error::Protocol(format!(
                "Large file {} ended after {} of {} bytes",
                file_id, copied, expected_len
            )));
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, &path).await?;
        debug!(file_id, bytes = copied, "stored large file");
        Ok(copied)
    }

    async fn open(&self, org: &str, repo: &str, file_id: &str) -> Result<(BlobReader, u64)> {
        let path = self.blob_path(org, repo, file_id)?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotFound(format!("Large file {} not found", file_id)));
            }
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata().await?.len();
        Ok((Box::new(file), len))
    }

    async fn exists(&self, org: &str, repo: &str, file_id: &str) -> Result<bool> {
        let path = self.blob_path(org, repo, file_id)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }
}
