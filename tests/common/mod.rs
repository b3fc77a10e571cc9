//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use chatlimit::clock::ManualClock;
use chatlimit::error::{ChatLimitError, Result};
use chatlimit::ratelimit::{LimitConfig, LimitController, LimitStateStore};
use chatlimit::storage::{KeyValueStore, MemoryStore};
use chatlimit::tokens::{TokenBalanceService, TokenConfig};

pub const START: i64 = 1_700_000_000_000;

/// Memory store that fails reads of selected keys.
#[derive(Default)]
pub struct BrokenReads {
    inner: MemoryStore,
    broken: Mutex<HashSet<String>>,
}

impl BrokenReads {
    pub fn break_key(&self, key: &str) {
        self.broken.lock().insert(key.to_string());
    }
}

#[async_trait]
impl KeyValueStore for BrokenReads {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        if self.broken.lock().contains(key) {
            return Err(ChatLimitError::Storage(format!("cannot read {}", key)));
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.inner.remove(key).await
    }
}

pub struct Fixture {
    pub storage: Arc<BrokenReads>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<LimitStateStore>,
    pub tokens: Arc<TokenBalanceService>,
}

impl Fixture {
    pub fn new() -> Self {
        let storage = Arc::new(BrokenReads::default());
        let clock = Arc::new(ManualClock::new(START));
        let store = Arc::new(LimitStateStore::new(storage.clone(), clock.clone()));
        let tokens = Arc::new(TokenBalanceService::new(
            storage.clone(),
            &TokenConfig::default(),
        ));
        Self {
            storage,
            clock,
            store,
            tokens,
        }
    }

    pub async fn controller(&self, chat: &str, config: LimitConfig) -> LimitController {
        let controller =
            LimitController::new(chat, config, self.store.clone(), self.tokens.clone());
        controller.initialize().await;
        controller
    }

    pub async fn raw(&self, key: &str) -> Option<String> {
        self.storage.get(key).await.unwrap()
    }
}

/// `{messageLimit: 3, cooldownMs: 60000, tokenCost: 5}`
pub fn scenario_config() -> LimitConfig {
    LimitConfig::new(3, 60_000, 5)
}
