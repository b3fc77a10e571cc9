//! Limiter trait for decoupling send orchestration from the limit controller.

use async_trait::async_trait;

use super::controller::{LimitView, SendCheck, UnlockOutcome};
use super::rules::LimitConfig;
use crate::error::Result;

/// Trait for message quota implementations.
///
/// This trait abstracts over the concrete [`LimitController`](super::LimitController)
/// so the submit layer can be driven by any quota source.
#[async_trait]
pub trait SendLimiter: Send + Sync {
    /// The quota being enforced.
    fn config(&self) -> &LimitConfig;

    /// Snapshot of the current quota state.
    fn view(&self) -> LimitView;

    /// Decide whether a message may be sent now.
    async fn ensure_can_send(&self) -> SendCheck;

    /// Consume one message from the quota after a confirmed send.
    async fn register_successful_send(&self) -> Result<()>;

    /// Spend tokens to restore the full quota.
    async fn unlock_with_tokens(&self) -> UnlockOutcome;
}
