//! Persisted limit records and their normalization rules.

use serde::de::Error as _;
use serde::{Deserialize, Serialize};

use super::rules::LimitConfig;
use crate::error::Result;

/// Quota state for one scope key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitRecord {
    /// Messages left in the current cycle
    pub remaining: u32,
    /// Epoch milliseconds until which sending is locked
    pub cooldown_until: Option<i64>,
    /// Epoch milliseconds of the last mutation
    pub updated_at: i64,
}

/// Caller-provided state before clamping and expiry are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitSnapshot {
    pub remaining: i64,
    pub cooldown_until: Option<i64>,
}

impl LimitSnapshot {
    pub fn new(remaining: i64, cooldown_until: Option<i64>) -> Self {
        Self {
            remaining,
            cooldown_until,
        }
    }
}

impl From<LimitRecord> for LimitSnapshot {
    fn from(record: LimitRecord) -> Self {
        Self::new(i64::from(record.remaining), record.cooldown_until)
    }
}

/// Persisted shape as read back from storage. `remaining` may be out of range.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredRecord {
    remaining: i64,
    #[serde(default)]
    cooldown_until: Option<i64>,
    #[serde(default)]
    updated_at: Option<i64>,
}

impl LimitRecord {
    /// A full-quota record with no cooldown.
    pub fn fresh(config: &LimitConfig, now_ms: i64) -> Self {
        Self {
            remaining: config.message_limit,
            cooldown_until: None,
            updated_at: now_ms,
        }
    }

    /// Apply the clamp and expiry rules to `snapshot`.
    ///
    /// An elapsed cooldown restores the full quota. A record that still has
    /// messages left never carries a cooldown.
    pub fn normalize(
        snapshot: LimitSnapshot,
        config: &LimitConfig,
        updated_at: i64,
        now_ms: i64,
    ) -> Self {
        if matches!(snapshot.cooldown_until, Some(until) if until <= now_ms) {
            return Self::fresh(config, now_ms);
        }

        let remaining = snapshot
            .remaining
            .clamp(0, i64::from(config.message_limit)) as u32;
        let cooldown_until = if remaining > 0 {
            None
        } else {
            snapshot.cooldown_until
        };

        Self {
            remaining,
            cooldown_until,
            updated_at,
        }
    }

    /// Decode a persisted record and normalize it.
    ///
    /// Anything that does not match the persisted schema is an error.
    pub fn decode(raw: &str, config: &LimitConfig, now_ms: i64) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        if !value.is_object() {
            return Err(serde_json::Error::custom("limit record is not a JSON object").into());
        }
        let stored: StoredRecord = serde_json::from_value(value)?;
        let snapshot = LimitSnapshot::new(stored.remaining, stored.cooldown_until);
        Ok(Self::normalize(
            snapshot,
            config,
            stored.updated_at.unwrap_or(now_ms),
            now_ms,
        ))
    }

    /// Encode for persistence.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Milliseconds until the cooldown ends, zero when none is running.
    pub fn cooldown_ms_left(&self, now_ms: i64) -> u64 {
        self.cooldown_until
            .map(|until| until.saturating_sub(now_ms).max(0) as u64)
            .unwrap_or(0)
    }

    /// Whether a cooldown is set and still in the future.
    pub fn is_cooling_down(&self, now_ms: i64) -> bool {
        matches!(self.cooldown_until, Some(until) if until > now_ms)
    }
}
