//! Storage key generation for limit records.

use super::rules::{LimitConfig, LimitScope};

/// Fixed scope key used when a quota is shared across the app.
pub const GLOBAL_SCOPE_KEY: &str = "global";

/// A key that uniquely identifies one limit record.
///
/// Global quotas collapse every chat onto [`GLOBAL_SCOPE_KEY`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimitKey {
    /// Namespace prefix
    pub prefix: String,
    /// Chat identifier, or the global constant
    pub scope_key: String,
}

impl LimitKey {
    /// Resolve the key for `scope_key` under `config`.
    pub fn new(scope_key: &str, config: &LimitConfig) -> Self {
        let scope_key = match config.scope {
            LimitScope::Global => GLOBAL_SCOPE_KEY,
            LimitScope::Chat => scope_key,
        };

        Self {
            prefix: config.storage_key_prefix.clone(),
            scope_key: scope_key.to_string(),
        }
    }

    /// The persisted key string, `prefix:scope_key`.
    pub fn to_storage_key(&self) -> String {
        format!("{}:{}", self.prefix, self.scope_key)
    }
}

impl std::fmt::Display for LimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_storage_key())
    }
}

/// Build the persisted key for `scope_key` under `config`.
pub fn build_storage_key(scope_key: &str, config: &LimitConfig) -> String {
    LimitKey::new(scope_key, config).to_storage_key()
}
