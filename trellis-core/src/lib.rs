//! Trellis Core Library
//!
//! Versioned file storage on an ordered key-value store:
//! - Object model (branches, commits, folder listings, file entries, merge locks)
//! - Row keys whose byte order is commit order
//! - Key-value abstraction over sled, plus an in-memory store
//! - Diff-chain content resolution with lazily patched views
//! - Merge-lock visibility and time-travel folder reads
//! - Push ingestion, checkout crawling and merging into main
//! - Record framing for push and checkout streams

pub mod allocator;
pub mod blob;
pub mod cas;
pub mod checkout;
pub mod commit_log;
pub mod config;
pub mod content;
pub mod datastore;
pub mod delta;
pub mod error;
pub mod history;
pub mod keys;
pub mod kv;
pub mod merge;
pub mod object;
pub mod patched;
pub mod paths;
pub mod push;
pub mod quota;
pub mod repo_store;
pub mod sled_store;
pub mod visibility;
pub mod wire;

pub use blob::{FsLargeFileStore, LargeFileStore};
pub use checkout::{CheckoutStats, ClientCheckoutSpec, ServerCheckoutSpec};
pub use config::EngineConfig;
pub use datastore::{Datastore, FileReport};
pub use error::{Error, Result};
pub use kv::{KeyValueStore, MemoryStore, StorageError, Table};
pub use object::{
    BranchEntry, ChangeType, ChangedPath, CommitEntry, ContentsType, EntryType, FileEntry, FolderEntry,
    FolderListing, MergeLock, MergeResult, MergeResultType, MergeState, RepoEntry, StorageType,
    LARGE_FILE_SIZE_THRESHOLD, MAIN_BRANCH, MAX_DIFF_SEARCH,
};
pub use paths::CheckoutPathSet;
pub use push::{PushOutcome, PushQuery, PushQueryResponse, PushQueryResponseType, PushSpec};
pub use quota::{Plan, QuotaPolicy};
pub use sled_store::SledStore;
pub use wire::{ObjectReader, ObjectType, ObjectWriter, RecordHeader};
