//! Trellis HTTP frontend
//!
//! Maps `/{org}/{repo}/{op}` requests onto the core [`Datastore`].
//! Request and response bodies are bincode values or record streams.
//!
//! [`Datastore`]: trellis_core::Datastore

pub mod handlers;
pub mod query;

pub use handlers::{ServerError, TrellisHandler, ERROR_HEADER, ERROR_KIND_HEADER, USER_HEADER};
