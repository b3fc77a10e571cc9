//! Fault-injecting store for tests.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use super::{KeyValueStore, MemoryStore};
use crate::error::{ChatLimitError, Result};

/// Memory store whose reads and writes can be switched to fail.
#[derive(Debug, Default)]
pub(crate) struct FlakyStore {
    inner: MemoryStore,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    reject_prefix: parking_lot::Mutex<Option<String>>,
}

impl FlakyStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail writes only for keys starting with `prefix`.
    pub(crate) fn fail_writes_under(&self, prefix: &str) {
        *self.reject_prefix.lock() = Some(prefix.to_string());
    }

    fn write_fails(&self, key: &str) -> bool {
        self.fail_writes.load(Ordering::SeqCst)
            || self
                .reject_prefix
                .lock()
                .as_deref()
                .is_some_and(|prefix| key.starts_with(prefix))
    }
}

#[async_trait]
impl KeyValueStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(ChatLimitError::Storage(format!("read of {} failed", key)));
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        if self.write_fails(key) {
            return Err(ChatLimitError::Storage(format!("write of {} failed", key)));
        }
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        if self.write_fails(key) {
            return Err(ChatLimitError::Storage(format!("remove of {} failed", key)));
        }
        self.inner.remove(key).await
    }
}
