//! Bounded optimistic update of a single row

use tracing::debug;

use crate::error::{Error, Result};
use crate::kv::{KeyValueStore, Table};
use crate::object::BinaryCodec;

/// Read a row, transform it, and compare-and-swap it back against the bytes
/// that were read, retrying up to `attempts` times when another writer wins.
///
/// Running out of attempts is a [`Error::Contention`]; the caller decides
/// whether that is fatal. A missing row is [`Error::NotFound`].
pub async fn update_with_retries<T, F>(
    kv: &dyn KeyValueStore,
    table: Table,
    key: &[u8],
    attempts: usize,
    mut transform: F,
) -> Result<T>
where
    T: BinaryCodec + Send,
    F: FnMut(&T) -> Result<T> + Send,
{
    let key_name = String::from_utf8_lossy(key).into_owned();
    for attempt in 1..=attempts {
        let raw = kv
            .get(table, key)
            .await?
            .ok_or_else(|| Error::NotFound(format!("No row at {}", key_name)))?;
        let current = T::from_bytes(&raw)?;
        let next = transform(&current)?;
        if kv
            .compare_and_swap(table, key, Some(raw.as_ref()), &next.to_bytes()?)
            .await?
        {
            return Ok(next);
        }
        debug!(key = %key_name, attempt, "compare-and-swap lost, retrying");
    }
    Err(Error::Contention(format!(
        "Failed to update {} after {} tries. There may be many concurrent writers.",
        key_name, attempts
    )))
}
