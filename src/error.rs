//! Error types for chatlimit.

use thiserror::Error;

/// Main error type for chatlimit operations.
#[derive(Error, Debug)]
pub enum ChatLimitError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistence adapter failures
    #[error("Storage error: {0}")]
    Storage(String),

    /// JSON encoding/decoding errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted token balance that is not a non-negative integer
    #[error("Invalid token balance: {0:?}")]
    InvalidBalance(String),

    /// A debit larger than the current balance
    #[error("Insufficient tokens: balance {balance}, required {required}")]
    InsufficientTokens { balance: u64, required: u64 },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for chatlimit operations.
pub type Result<T> = std::result::Result<T, ChatLimitError>;
