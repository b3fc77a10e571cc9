//! Message limit rules.
//!
//! A [`LimitConfig`] describes one quota: how many messages a cycle allows,
//! how long the lockout lasts once the quota is spent, what an early unlock
//! costs, and whether the quota is tracked per chat or for the whole app.

use serde::{Deserialize, Serialize};

use crate::error::{ChatLimitError, Result};

/// Default namespace for persisted limit records.
pub const DEFAULT_STORAGE_KEY_PREFIX: &str = "chat.limit";

const DEFAULT_MESSAGE_LIMIT: u32 = 20;
const DEFAULT_COOLDOWN_MS: u64 = 60 * 60 * 1000;
const DEFAULT_TOKEN_COST: u64 = 5;

/// Whether a quota is tracked per conversation or shared across the app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitScope {
    /// One record per chat identifier.
    #[default]
    Chat,
    /// One record for the whole installation.
    Global,
}

/// Configuration for a message quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitConfig {
    /// Messages allowed per cycle
    pub message_limit: u32,
    /// Lockout duration once the cycle is exhausted, in milliseconds
    pub cooldown_ms: u64,
    /// Token price of an early unlock
    pub token_cost: u64,
    /// Namespace for persisted keys
    pub storage_key_prefix: String,
    /// Tracking scope
    pub scope: LimitScope,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            message_limit: DEFAULT_MESSAGE_LIMIT,
            cooldown_ms: DEFAULT_COOLDOWN_MS,
            token_cost: DEFAULT_TOKEN_COST,
            storage_key_prefix: DEFAULT_STORAGE_KEY_PREFIX.to_string(),
            scope: LimitScope::Chat,
        }
    }
}

impl LimitConfig {
    /// Create a chat-scoped config with the default prefix.
    pub fn new(message_limit: u32, cooldown_ms: u64, token_cost: u64) -> Self {
        Self {
            message_limit,
            cooldown_ms,
            token_cost,
            ..Self::default()
        }
    }

    /// Return a copy with a different scope.
    pub fn with_scope(mut self, scope: LimitScope) -> Self {
        self.scope = scope;
        self
    }

    /// Return a copy with a different key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.storage_key_prefix = prefix.into();
        self
    }

    /// Parse a config from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: LimitConfig = serde_yaml::from_str(yaml)
            .map_err(|e| ChatLimitError::Config(format!("Failed to parse limit config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configs the state machine cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.message_limit == 0 {
            return Err(ChatLimitError::Config(
                "message_limit must be positive".to_string(),
            ));
        }
        if self.cooldown_ms == 0 {
            return Err(ChatLimitError::Config(
                "cooldown_ms must be positive".to_string(),
            ));
        }
        if i64::try_from(self.cooldown_ms).is_err() {
            return Err(ChatLimitError::Config(
                "cooldown_ms is out of range".to_string(),
            ));
        }
        if self.storage_key_prefix.is_empty() {
            return Err(ChatLimitError::Config(
                "storage_key_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
