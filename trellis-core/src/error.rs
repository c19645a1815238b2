//! Error taxonomy for the storage engine
//!
//! Storage-layer failures come up as [`StorageError`] and are wrapped here.
//! Everything else maps onto the operational categories callers act on:
//! stale client state, quota overage, CAS contention and data corruption.
//! A merge conflict is not an error; it is a failed [`MergeResult`].
//!
//! [`MergeResult`]: crate::object::MergeResult

use crate::kv::StorageError;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Client and server disagree about branch state.
    #[error("{0}")]
    Stale(String),

    #[error(
        "Sorry, this repo has reached its maximum size ({max_bytes} bytes). You can upgrade your plan to increase this limit."
    )]
    QuotaExceeded { max_bytes: u64 },

    /// Bounded CAS retries ran out.
    #[error("Contention: {0}")]
    Contention(String),

    #[error("Corruption: {0}")]
    Corruption(String),

    /// Malformed or out-of-order wire records.
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Short machine-friendly category name, used in logs and HTTP errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Storage(_) => "storage",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io",
            Error::NotFound(_) => "not_found",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::Stale(_) => "stale",
            Error::QuotaExceeded { .. } => "quota_exceeded",
            Error::Contention(_) => "contention",
            Error::Corruption(_) => "corruption",
            Error::Protocol(_) => "protocol",
        }
    }
}
