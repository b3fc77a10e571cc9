//! Chatlimit - Persisted Chat Message Quotas
//!
//! This crate implements per-chat or app-wide message quotas. Spending the
//! last message of a cycle arms a cooldown; tokens from the in-app balance
//! can be spent to lift it early. State lives behind a pluggable key-value
//! store so it survives restarts.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod storage;
pub mod submit;
pub mod tokens;
