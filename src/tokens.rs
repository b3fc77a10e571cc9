//! Token balance persistence.
//!
//! Tokens are the in-app currency spent on early unlocks. The balance is a
//! single non-negative integer per installation, stored as a decimal string.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{ChatLimitError, Result};
use crate::storage::KeyValueStore;

/// Default storage key for the balance.
pub const DEFAULT_BALANCE_KEY: &str = "app.tokens.balance";

/// Token balance configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Storage key of the balance
    #[serde(default = "default_balance_key")]
    pub storage_key: String,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            storage_key: default_balance_key(),
        }
    }
}

fn default_balance_key() -> String {
    DEFAULT_BALANCE_KEY.to_string()
}

/// Reads and mutates the persisted token balance.
pub struct TokenBalanceService {
    storage: Arc<dyn KeyValueStore>,
    key: String,
    /// Serializes read-modify-write within this process.
    lock: Mutex<()>,
}

impl TokenBalanceService {
    /// Create a service over `storage` using `config.storage_key`.
    pub fn new(storage: Arc<dyn KeyValueStore>, config: &TokenConfig) -> Self {
        Self {
            storage,
            key: config.storage_key.clone(),
            lock: Mutex::new(()),
        }
    }

    /// Current balance. A missing entry is a zero balance.
    pub async fn get(&self) -> Result<u64> {
        self.read().await
    }

    /// Overwrite the balance.
    pub async fn set(&self, balance: u64) -> Result<u64> {
        let _guard = self.lock.lock().await;
        self.write(balance).await?;
        info!(balance = balance, "Token balance set");
        Ok(balance)
    }

    /// Credit `amount` tokens, returning the new balance.
    pub async fn add(&self, amount: u64) -> Result<u64> {
        let _guard = self.lock.lock().await;
        let balance = self.read().await?.saturating_add(amount);
        self.write(balance).await?;
        debug!(amount = amount, balance = balance, "Credited tokens");
        Ok(balance)
    }

    /// Debit `amount` tokens, returning the new balance.
    ///
    /// Fails with [`ChatLimitError::InsufficientTokens`] rather than going
    /// below zero; nothing is written in that case.
    pub async fn subtract(&self, amount: u64) -> Result<u64> {
        let _guard = self.lock.lock().await;
        let current = self.read().await?;
        let balance = current
            .checked_sub(amount)
            .ok_or(ChatLimitError::InsufficientTokens {
                balance: current,
                required: amount,
            })?;
        self.write(balance).await?;
        debug!(amount = amount, balance = balance, "Debited tokens");
        Ok(balance)
    }

    async fn read(&self) -> Result<u64> {
        match self.storage.get(&self.key).await? {
            None => Ok(0),
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map_err(|_| ChatLimitError::InvalidBalance(raw)),
        }
    }

    async fn write(&self, balance: u64) -> Result<()> {
        self.storage.set(&self.key, &balance.to_string()).await
    }
}

impl std::fmt::Debug for TokenBalanceService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBalanceService")
            .field("key", &self.key)
            .finish()
    }
}
