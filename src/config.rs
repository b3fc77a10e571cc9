//! Configuration management for chatlimit.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ChatLimitError, Result};
use crate::ratelimit::LimitConfig;
use crate::submit::NoticeMessages;
use crate::tokens::TokenConfig;

/// Prefix of environment variable overrides, e.g. `CHATLIMIT__LIMIT__MESSAGE_LIMIT`.
pub const ENV_PREFIX: &str = "CHATLIMIT";

/// Main configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Message quota
    #[serde(default)]
    pub limit: LimitConfig,

    /// Token balance
    #[serde(default)]
    pub tokens: TokenConfig,

    /// Persistence
    #[serde(default)]
    pub storage: StorageConfig,

    /// User-facing notice texts
    #[serde(default)]
    pub notices: NoticeMessages,
}

/// Persistence configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path of the JSON state file
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("chatlimit-state.json")
}

impl AppConfig {
    /// Load configuration from defaults, an optional YAML file, and
    /// `CHATLIMIT__`-prefixed environment variables, in that order.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                config::File::new(&path.to_string_lossy(), config::FileFormat::Yaml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| ChatLimitError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: AppConfig =
            serde_yaml::from_str(yaml).map_err(|e| ChatLimitError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.limit.validate()?;
        if self.tokens.storage_key.is_empty() {
            return Err(ChatLimitError::Config(
                "tokens.storage_key must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
