//! Send orchestration.
//!
//! [`SubmitController`] sequences a quota check, the caller's own send
//! action, and the post-send bookkeeping, and turns blocked sends and unlock
//! results into user-facing notices. It knows nothing about message contents.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::ratelimit::{format_remaining, SendLimiter, UnlockOutcome};

/// Severity of a user-facing notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Warning,
    Error,
    Success,
}

/// Sink for user-facing notices (toast, snackbar, log line).
pub trait Notifier: Send + Sync {
    fn notify(&self, severity: Severity, message: &str);
}

/// Notifier that writes notices to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Warning => warn!(notice = %message, "User notice"),
            Severity::Error => error!(notice = %message, "User notice"),
            Severity::Success => info!(notice = %message, "User notice"),
        }
    }
}

/// Whether a submit creates a new message or edits an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubmitMode {
    /// A new message; subject to the quota.
    #[default]
    Compose,
    /// An edit of an existing message; never consumes quota.
    Edit,
}

/// Notice templates. `{time}`, `{balance}` and `{cost}` are substituted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoticeMessages {
    /// Blocked by a running cooldown
    pub limit_reached: String,
    /// Blocked with no cooldown time to show
    pub limit_reached_generic: String,
    /// Unlock succeeded
    pub unlocked: String,
    /// Unlock refused for lack of tokens
    pub insufficient_tokens: String,
    /// Unlock refused because the balance could not be read
    pub balance_unavailable: String,
    /// Unlock failed
    pub unlock_failed: String,
}

impl Default for NoticeMessages {
    fn default() -> Self {
        Self {
            limit_reached: "You've reached the message limit. Try again in {time}.".to_string(),
            limit_reached_generic:
                "You've reached the message limit. Please wait before sending more messages."
                    .to_string(),
            unlocked: "Chat unlocked! You have {balance} tokens left.".to_string(),
            insufficient_tokens:
                "Not enough tokens. Unlocking costs {cost} tokens and you have {balance}."
                    .to_string(),
            balance_unavailable: "Your token balance is unavailable right now.".to_string(),
            unlock_failed: "Couldn't unlock right now. Please try again.".to_string(),
        }
    }
}

fn render(template: &str, vars: &[(&str, String)]) -> String {
    vars.iter().fold(template.to_string(), |text, (name, value)| {
        text.replace(&format!("{{{}}}", name), value)
    })
}

/// Wraps a send action with quota enforcement.
pub struct SubmitController<L: SendLimiter> {
    limiter: Arc<L>,
    notifier: Arc<dyn Notifier>,
    messages: NoticeMessages,
}

impl<L: SendLimiter> SubmitController<L> {
    /// Create a controller with the default notice texts.
    pub fn new(limiter: Arc<L>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            limiter,
            notifier,
            messages: NoticeMessages::default(),
        }
    }

    /// Replace the notice texts.
    pub fn with_messages(mut self, messages: NoticeMessages) -> Self {
        self.messages = messages;
        self
    }

    /// The wrapped limiter.
    pub fn limiter(&self) -> &Arc<L> {
        &self.limiter
    }

    /// Remaining cooldown formatted for display, empty when none is running.
    pub fn countdown_text(&self) -> String {
        let view = self.limiter.view();
        if view.is_cooldown_active {
            format_remaining(view.cooldown_ms_left)
        } else {
            String::new()
        }
    }

    /// Run `submit` with quota enforcement.
    ///
    /// Edits bypass the quota. A blocked send raises a warning notice and
    /// returns `false` without calling `submit`. An accepted new message is
    /// counted against the quota. Returns whatever `submit` returned.
    pub async fn handle_submit<P, F, Fut>(&self, payload: P, mode: SubmitMode, submit: F) -> bool
    where
        P: Send,
        F: FnOnce(P) -> Fut + Send,
        Fut: Future<Output = bool> + Send,
    {
        let enforce = mode == SubmitMode::Compose;

        if enforce {
            let check = self.limiter.ensure_can_send().await;
            if !check.is_allowed() {
                let message = match check.cooldown_ms_remaining() {
                    0 => self.messages.limit_reached_generic.clone(),
                    ms => render(
                        &self.messages.limit_reached,
                        &[("time", format_remaining(ms))],
                    ),
                };
                self.notifier.notify(Severity::Warning, &message);
                return false;
            }
        }

        let accepted = submit(payload).await;

        if accepted && enforce {
            if let Err(e) = self.limiter.register_successful_send().await {
                warn!(error = %e, "Failed to count message against quota");
            }
        }

        accepted
    }

    /// Spend tokens to unlock and report the result to the user.
    pub async fn handle_unlock(&self) -> UnlockOutcome {
        let outcome = self.limiter.unlock_with_tokens().await;

        match outcome {
            UnlockOutcome::Unlocked { balance } => {
                let message = render(&self.messages.unlocked, &[("balance", balance.to_string())]);
                self.notifier.notify(Severity::Success, &message);
            }
            UnlockOutcome::InsufficientTokens { balance } => {
                let message = render(
                    &self.messages.insufficient_tokens,
                    &[
                        ("cost", self.limiter.config().token_cost.to_string()),
                        ("balance", balance.to_string()),
                    ],
                );
                self.notifier.notify(Severity::Warning, &message);
            }
            UnlockOutcome::BalanceUnavailable => {
                self.notifier
                    .notify(Severity::Warning, &self.messages.balance_unavailable);
            }
            UnlockOutcome::Failed => {
                self.notifier
                    .notify(Severity::Error, &self.messages.unlock_failed);
            }
        }

        outcome
    }
}
