//! Persistence of limit records.
//!
//! Reads are fail-safe: a missing, unreadable or malformed record becomes a
//! fresh full-quota record so storage trouble never blocks sending. Writes
//! propagate their errors.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, trace, warn};

use super::record::{LimitRecord, LimitSnapshot};
use super::rules::LimitConfig;
use crate::clock::Clock;
use crate::error::Result;
use crate::storage::KeyValueStore;

/// Loads, normalizes and writes limit records.
///
/// Every operation on a key runs under that key's lock, so read-modify-write
/// sequences issued through one store never interleave. Writers in other
/// processes sharing the backing storage are not coordinated.
pub struct LimitStateStore {
    storage: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LimitStateStore {
    /// Create a store over `storage`, timestamping with `clock`.
    pub fn new(storage: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            locks: DashMap::new(),
        }
    }

    /// The clock used for expiry and timestamps.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Load the record for `key`, creating it when absent.
    ///
    /// Never fails: read, parse and write-back errors are logged and answered
    /// with a fresh full-quota record.
    pub async fn load(&self, key: &str, config: &LimitConfig) -> LimitRecord {
        let _guard = self.lock_key(key).await;
        self.load_locked(key, config).await
    }

    /// Normalize and write `snapshot`, returning what was stored.
    pub async fn persist(
        &self,
        key: &str,
        snapshot: LimitSnapshot,
        config: &LimitConfig,
    ) -> Result<LimitRecord> {
        let _guard = self.lock_key(key).await;
        self.persist_locked(key, snapshot, config).await
    }

    /// Restore the full quota for `key`.
    pub async fn reset(&self, key: &str, config: &LimitConfig) -> Result<LimitRecord> {
        let _guard = self.lock_key(key).await;

        let record = LimitRecord::fresh(config, self.clock.now_ms());
        self.write(key, &record).await?;
        debug!(key = %key, remaining = record.remaining, "Reset limit record");
        Ok(record)
    }

    /// Delete the persisted record for `key`.
    pub async fn clear(&self, key: &str) -> Result<()> {
        let _guard = self.lock_key(key).await;

        self.storage.remove(key).await?;
        debug!(key = %key, "Cleared limit record");
        Ok(())
    }

    /// Load, transform and persist `key` as one serialized step.
    ///
    /// `f` receives the current normalized record and the current time.
    pub async fn update<F>(&self, key: &str, config: &LimitConfig, f: F) -> Result<LimitRecord>
    where
        F: FnOnce(&LimitRecord, i64) -> LimitSnapshot + Send,
    {
        let _guard = self.lock_key(key).await;

        let current = self.load_locked(key, config).await;
        let snapshot = f(&current, self.clock.now_ms());
        self.persist_locked(key, snapshot, config).await
    }

    async fn load_locked(&self, key: &str, config: &LimitConfig) -> LimitRecord {
        let now = self.clock.now_ms();

        let raw = match self.storage.get(key).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read limit record, using fresh quota");
                return LimitRecord::fresh(config, now);
            }
        };

        let record = match raw {
            None => {
                debug!(key = %key, limit = config.message_limit, "Creating limit record");
                LimitRecord::fresh(config, now)
            }
            Some(raw) => match LimitRecord::decode(&raw, config, now) {
                Ok(record) => record,
                Err(e) => {
                    warn!(key = %key, error = %e, "Malformed limit record, using fresh quota");
                    LimitRecord::fresh(config, now)
                }
            },
        };

        if let Err(e) = self.write(key, &record).await {
            warn!(key = %key, error = %e, "Failed to write back limit record");
        }

        record
    }

    async fn persist_locked(
        &self,
        key: &str,
        snapshot: LimitSnapshot,
        config: &LimitConfig,
    ) -> Result<LimitRecord> {
        let now = self.clock.now_ms();
        let record = LimitRecord::normalize(snapshot, config, now, now);
        self.write(key, &record).await?;

        trace!(
            key = %key,
            remaining = record.remaining,
            cooldown_until = ?record.cooldown_until,
            "Persisted limit record"
        );
        Ok(record)
    }

    async fn write(&self, key: &str, record: &LimitRecord) -> Result<()> {
        let encoded = record.encode()?;
        self.storage.set(key, &encoded).await
    }

    async fn lock_key<'a>(&'a self, key: &'a str) -> KeyGuard<'a> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        KeyGuard {
            locks: &self.locks,
            key,
            guard: Some(lock.lock_owned().await),
        }
    }
}

/// Holds one key's lock and drops the map entry once no one else waits on it.
struct KeyGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    key: &'a str,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl std::fmt::Debug for LimitStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimitStateStore")
            .field("locked_keys", &self.locks.len())
            .finish()
    }
}
