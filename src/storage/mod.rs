//! Key-value persistence for limit records and token balances.

mod file;
mod memory;
#[cfg(test)]
pub(crate) mod flaky;

use async_trait::async_trait;

use crate::error::Result;

pub use file::FileStore;
pub use memory::MemoryStore;

/// Async string key-value store.
///
/// Values are opaque strings; callers store JSON or stringified integers.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete `key`. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<()>;
}
