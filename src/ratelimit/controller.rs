//! Quota controller.
//!
//! A [`LimitController`] mirrors one persisted limit record in memory, keeps a
//! one-second countdown running while a cooldown is armed, and lets the
//! caller spend tokens to restore the quota early. Every state change is
//! published on a watch channel so observers can redraw.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, trace, warn};

use super::backend::SendLimiter;
use super::countdown::{Countdown, TICK_INTERVAL};
use super::key::build_storage_key;
use super::record::{LimitRecord, LimitSnapshot};
use super::rules::LimitConfig;
use super::store::LimitStateStore;
use crate::clock::Clock;
use crate::error::{ChatLimitError, Result};
use crate::tokens::TokenBalanceService;

/// Outcome of a pre-send quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendCheck {
    /// Sending is allowed; `remaining` messages are left in the cycle.
    Allowed { remaining: u32 },
    /// A cooldown is running.
    Cooldown { cooldown_ms_remaining: u64 },
    /// The quota is spent but no cooldown is armed.
    Limit,
}

impl SendCheck {
    pub fn is_allowed(&self) -> bool {
        matches!(self, SendCheck::Allowed { .. })
    }

    /// Remaining cooldown, zero unless the check hit a running cooldown.
    pub fn cooldown_ms_remaining(&self) -> u64 {
        match self {
            SendCheck::Cooldown {
                cooldown_ms_remaining,
            } => *cooldown_ms_remaining,
            _ => 0,
        }
    }
}

/// Outcome of a token-funded unlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlockOutcome {
    /// Quota restored; `balance` is the balance after the debit.
    Unlocked { balance: u64 },
    /// Not enough tokens. Nothing was changed.
    InsufficientTokens { balance: u64 },
    /// The balance could not be read. Nothing was changed.
    BalanceUnavailable,
    /// The debit or the quota reset could not be stored.
    Failed,
}

impl UnlockOutcome {
    pub fn is_unlocked(&self) -> bool {
        matches!(self, UnlockOutcome::Unlocked { .. })
    }

    /// The known balance, if any.
    pub fn balance(&self) -> Option<u64> {
        match self {
            UnlockOutcome::Unlocked { balance } | UnlockOutcome::InsufficientTokens { balance } => {
                Some(*balance)
            }
            UnlockOutcome::BalanceUnavailable | UnlockOutcome::Failed => None,
        }
    }
}

/// Read-only snapshot of a controller's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LimitView {
    pub remaining_messages: u32,
    pub cooldown_ends_at: Option<i64>,
    pub cooldown_ms_left: u64,
    pub token_balance: Option<u64>,
    pub is_unlocking: bool,
    pub is_cooldown_active: bool,
    pub is_locked: bool,
    pub is_initialized: bool,
}

#[derive(Debug)]
struct ControllerState {
    record: LimitRecord,
    cooldown_ms_left: u64,
    token_balance: Option<u64>,
    is_unlocking: bool,
    is_initialized: bool,
}

struct ControllerInner {
    config: LimitConfig,
    storage_key: String,
    store: Arc<LimitStateStore>,
    tokens: Arc<TokenBalanceService>,
    state: RwLock<ControllerState>,
    view_tx: watch::Sender<LimitView>,
    countdown: Mutex<Option<Countdown>>,
}

/// Controls the message quota of one scope key.
///
/// The countdown task is owned by the controller and stops when the
/// controller is dropped.
pub struct LimitController {
    inner: Arc<ControllerInner>,
}

impl LimitController {
    /// Create a controller for `scope_key`.
    ///
    /// The in-memory state starts at full quota; call
    /// [`initialize`](Self::initialize) to load the persisted state.
    pub fn new(
        scope_key: &str,
        config: LimitConfig,
        store: Arc<LimitStateStore>,
        tokens: Arc<TokenBalanceService>,
    ) -> Self {
        let storage_key = build_storage_key(scope_key, &config);
        let record = LimitRecord::fresh(&config, store.clock().now_ms());
        let state = ControllerState {
            record,
            cooldown_ms_left: 0,
            token_balance: None,
            is_unlocking: false,
            is_initialized: false,
        };
        let view = view_of(&state);
        let (view_tx, _) = watch::channel(view);

        Self {
            inner: Arc::new(ControllerInner {
                config,
                storage_key,
                store,
                tokens,
                state: RwLock::new(state),
                view_tx,
                countdown: Mutex::new(None),
            }),
        }
    }

    /// The quota being enforced.
    pub fn config(&self) -> &LimitConfig {
        &self.inner.config
    }

    /// The persisted key of this controller's record.
    pub fn storage_key(&self) -> &str {
        &self.inner.storage_key
    }

    /// Current state snapshot.
    pub fn view(&self) -> LimitView {
        self.inner.view()
    }

    /// Observe every state change, including countdown ticks.
    pub fn subscribe(&self) -> watch::Receiver<LimitView> {
        self.inner.view_tx.subscribe()
    }

    pub fn is_cooldown_active(&self) -> bool {
        self.view().is_cooldown_active
    }

    pub fn is_locked(&self) -> bool {
        self.view().is_locked
    }

    /// Load the persisted record and the token balance.
    ///
    /// The two loads run concurrently and neither waits on the other. The
    /// controller is marked initialized once the record is in.
    pub async fn initialize(&self) {
        let inner = &self.inner;

        let limits = async {
            let record = inner.store.load(&inner.storage_key, &inner.config).await;
            inner.state.write().is_initialized = true;
            inner.apply_record(record);
        };
        let balance = self.refresh_token_balance();
        future::join(limits, balance).await;

        let view = self.view();
        info!(
            key = %inner.storage_key,
            remaining = view.remaining_messages,
            cooldown_ends_at = ?view.cooldown_ends_at,
            token_balance = ?view.token_balance,
            "Limit controller initialized"
        );
    }

    /// Decide whether a message may be sent now.
    ///
    /// Always re-reads the persisted record so controllers sharing a key see
    /// each other's sends.
    pub async fn ensure_can_send(&self) -> SendCheck {
        let inner = &self.inner;
        let record = inner.store.load(&inner.storage_key, &inner.config).await;
        inner.apply_record(record);

        let now = inner.clock().now_ms();
        if record.is_cooling_down(now) {
            let cooldown_ms_remaining = record.cooldown_ms_left(now);
            debug!(
                key = %inner.storage_key,
                cooldown_ms_remaining = cooldown_ms_remaining,
                "Send blocked by cooldown"
            );
            return SendCheck::Cooldown {
                cooldown_ms_remaining,
            };
        }

        if record.remaining == 0 {
            debug!(key = %inner.storage_key, "Send blocked by exhausted quota");
            return SendCheck::Limit;
        }

        SendCheck::Allowed {
            remaining: record.remaining,
        }
    }

    /// Consume one message after a confirmed send.
    ///
    /// Spending the last message arms the cooldown. Storage write failures
    /// are returned to the caller.
    pub async fn register_successful_send(&self) -> Result<()> {
        let inner = &self.inner;
        let cooldown_ms = i64::try_from(inner.config.cooldown_ms).unwrap_or(i64::MAX);

        let record = inner
            .store
            .update(&inner.storage_key, &inner.config, move |current, now| {
                let next = current.remaining.saturating_sub(1);
                if next == 0 {
                    LimitSnapshot::new(0, Some(now.saturating_add(cooldown_ms)))
                } else {
                    LimitSnapshot::new(i64::from(next), None)
                }
            })
            .await?;
        inner.apply_record(record);

        match record.cooldown_until {
            Some(until) => info!(
                key = %inner.storage_key,
                cooldown_until = until,
                "Message quota exhausted, cooldown armed"
            ),
            None => trace!(
                key = %inner.storage_key,
                remaining = record.remaining,
                "Registered message send"
            ),
        }
        Ok(())
    }

    /// Spend `token_cost` tokens to restore the full quota.
    ///
    /// The balance is re-read first; an insufficient balance changes nothing.
    /// `is_unlocking` is set for the duration of the call.
    pub async fn unlock_with_tokens(&self) -> UnlockOutcome {
        let inner = &self.inner;
        let _unlocking = UnlockingGuard::new(inner);

        let Some(balance) = self.refresh_token_balance().await else {
            return UnlockOutcome::BalanceUnavailable;
        };

        let cost = inner.config.token_cost;
        if balance < cost {
            debug!(balance = balance, cost = cost, "Not enough tokens to unlock");
            return UnlockOutcome::InsufficientTokens { balance };
        }

        let balance = match inner.tokens.subtract(cost).await {
            Ok(balance) => balance,
            Err(ChatLimitError::InsufficientTokens { balance, .. }) => {
                inner.set_token_balance(Some(balance));
                return UnlockOutcome::InsufficientTokens { balance };
            }
            Err(e) => {
                warn!(error = %e, "Failed to debit tokens for unlock");
                return UnlockOutcome::Failed;
            }
        };
        inner.set_token_balance(Some(balance));

        match inner.store.reset(&inner.storage_key, &inner.config).await {
            Ok(record) => {
                inner.apply_record(record);
                info!(
                    key = %inner.storage_key,
                    cost = cost,
                    balance = balance,
                    "Quota unlocked with tokens"
                );
                UnlockOutcome::Unlocked { balance }
            }
            Err(e) => {
                warn!(key = %inner.storage_key, error = %e, "Failed to reset quota after debit, refunding");
                match inner.tokens.add(cost).await {
                    Ok(refunded) => inner.set_token_balance(Some(refunded)),
                    Err(e) => warn!(error = %e, cost = cost, "Failed to refund unlock debit"),
                }
                UnlockOutcome::Failed
            }
        }
    }

    /// Restore the full quota unconditionally.
    pub async fn reset_limits(&self) -> Result<()> {
        let inner = &self.inner;
        let record = inner.store.reset(&inner.storage_key, &inner.config).await?;
        inner.apply_record(record);
        info!(key = %inner.storage_key, "Limits reset");
        Ok(())
    }

    /// Delete the persisted record. The next read recreates it at full quota.
    pub async fn clear_limits(&self) -> Result<()> {
        let inner = &self.inner;
        inner.store.clear(&inner.storage_key).await?;
        inner.apply_record(LimitRecord::fresh(&inner.config, inner.clock().now_ms()));
        info!(key = %inner.storage_key, "Limits cleared");
        Ok(())
    }

    /// Re-read the token balance. Failures are logged and cached as `None`.
    pub async fn refresh_token_balance(&self) -> Option<u64> {
        let inner = &self.inner;
        match inner.tokens.get().await {
            Ok(balance) => {
                inner.set_token_balance(Some(balance));
                Some(balance)
            }
            Err(e) => {
                warn!(error = %e, "Token balance unavailable");
                inner.set_token_balance(None);
                None
            }
        }
    }

    /// Credit earned tokens and return the new balance.
    pub async fn reward_tokens(&self, amount: u64) -> Result<u64> {
        let balance = self.inner.tokens.add(amount).await?;
        self.inner.set_token_balance(Some(balance));
        info!(amount = amount, balance = balance, "Tokens rewarded");
        Ok(balance)
    }
}

impl Drop for LimitController {
    fn drop(&mut self) {
        self.inner.countdown.lock().take();
    }
}

impl std::fmt::Debug for LimitController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimitController")
            .field("storage_key", &self.inner.storage_key)
            .field("config", &self.inner.config)
            .field("state", &*self.inner.state.read())
            .finish()
    }
}

#[async_trait]
impl SendLimiter for LimitController {
    fn config(&self) -> &LimitConfig {
        LimitController::config(self)
    }

    fn view(&self) -> LimitView {
        LimitController::view(self)
    }

    async fn ensure_can_send(&self) -> SendCheck {
        LimitController::ensure_can_send(self).await
    }

    async fn register_successful_send(&self) -> Result<()> {
        LimitController::register_successful_send(self).await
    }

    async fn unlock_with_tokens(&self) -> UnlockOutcome {
        LimitController::unlock_with_tokens(self).await
    }
}

impl ControllerInner {
    fn clock(&self) -> &Arc<dyn Clock> {
        self.store.clock()
    }

    fn view(&self) -> LimitView {
        view_of(&self.state.read())
    }

    fn publish(&self) {
        self.view_tx.send_replace(self.view());
    }

    fn set_token_balance(&self, balance: Option<u64>) {
        self.state.write().token_balance = balance;
        self.publish();
    }

    fn set_unlocking(&self, unlocking: bool) {
        self.state.write().is_unlocking = unlocking;
        self.publish();
    }

    /// Mirror `record` and re-arm the countdown if its deadline moved.
    fn apply_record(self: &Arc<Self>, record: LimitRecord) {
        let now = self.clock().now_ms();
        {
            let mut state = self.state.write();
            state.record = record;
            state.cooldown_ms_left = record.cooldown_ms_left(now);
        }
        self.sync_countdown(record.cooldown_until.filter(|until| *until > now));
        self.publish();
    }

    fn sync_countdown(self: &Arc<Self>, deadline: Option<i64>) {
        let mut slot = self.countdown.lock();
        if slot.as_ref().map(Countdown::deadline) == deadline {
            return;
        }
        // Replacing the slot drops, and so aborts, any previous ticker.
        *slot = deadline.map(|deadline| self.spawn_countdown(deadline));
    }

    fn spawn_countdown(self: &Arc<Self>, deadline: i64) -> Countdown {
        let weak = Arc::downgrade(self);
        trace!(key = %self.storage_key, deadline = deadline, "Starting countdown");

        let handle = tokio::spawn(async move {
            let mut ticks = IntervalStream::new(tokio::time::interval(TICK_INTERVAL));
            while ticks.next().await.is_some() {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.tick(deadline).await {
                    break;
                }
            }
        });

        Countdown::new(deadline, handle)
    }

    /// Refresh the remaining time. Returns `true` once the countdown is done.
    async fn tick(self: &Arc<Self>, deadline: i64) -> bool {
        let now = self.clock().now_ms();
        let left = deadline.saturating_sub(now).max(0) as u64;

        if left > 0 {
            {
                let mut state = self.state.write();
                if state.record.cooldown_until != Some(deadline) {
                    return true;
                }
                state.cooldown_ms_left = left;
            }
            self.publish();
            return false;
        }

        // The stored record decides: a controller sharing this key may have
        // armed a later deadline.
        debug!(key = %self.storage_key, "Cooldown elapsed, restoring quota");
        let result = self
            .store
            .update(&self.storage_key, &self.config, |current, _now| {
                LimitSnapshot::from(*current)
            })
            .await;
        match result {
            Ok(record) => {
                if record.cooldown_until.is_some() {
                    debug!(
                        key = %self.storage_key,
                        cooldown_until = ?record.cooldown_until,
                        "Stored cooldown outlives local deadline"
                    );
                }
                self.apply_record(record);
                true
            }
            Err(e) => {
                warn!(key = %self.storage_key, error = %e, "Failed to restore quota after cooldown");
                false
            }
        }
    }
}

fn view_of(state: &ControllerState) -> LimitView {
    let is_cooldown_active = state.record.cooldown_until.is_some() && state.cooldown_ms_left > 0;
    LimitView {
        remaining_messages: state.record.remaining,
        cooldown_ends_at: state.record.cooldown_until,
        cooldown_ms_left: state.cooldown_ms_left,
        token_balance: state.token_balance,
        is_unlocking: state.is_unlocking,
        is_cooldown_active,
        is_locked: is_cooldown_active || state.record.remaining == 0,
        is_initialized: state.is_initialized,
    }
}

/// Holds `is_unlocking` up until dropped, on every exit path.
struct UnlockingGuard<'a> {
    inner: &'a ControllerInner,
}

impl<'a> UnlockingGuard<'a> {
    fn new(inner: &'a ControllerInner) -> Self {
        inner.set_unlocking(true);
        Self { inner }
    }
}

impl Drop for UnlockingGuard<'_> {
    fn drop(&mut self) {
        self.inner.set_unlocking(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::LimitScope;
    use crate::storage::flaky::FlakyStore;
    use crate::storage::{KeyValueStore, MemoryStore};
    use crate::tokens::{TokenConfig, DEFAULT_BALANCE_KEY};
    use std::time::Duration;

    const START: i64 = 1_700_000_000_000;

    struct Harness {
        storage: Arc<FlakyStore>,
        clock: Arc<ManualClock>,
        store: Arc<LimitStateStore>,
        tokens: Arc<TokenBalanceService>,
    }

    impl Harness {
        fn new() -> Self {
            let storage = Arc::new(FlakyStore::new());
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

        fn controller(&self, chat: &str) -> LimitController {
            LimitController::new(
                chat,
                LimitConfig::new(3, 60_000, 5),
                self.store.clone(),
                self.tokens.clone(),
            )
        }
    }

    #[tokio::test]
    async fn test_initialize_loads_record_and_balance() {
        let harness = Harness::new();
        harness.tokens.set(7).await.unwrap();
        let controller = harness.controller("chat-1");

        assert!(!controller.view().is_initialized);
        controller.initialize().await;

        let view = controller.view();
        assert!(view.is_initialized);
        assert_eq!(view.remaining_messages, 3);
        assert_eq!(view.token_balance, Some(7));
        assert!(!view.is_locked);
        assert_eq!(controller.storage_key(), "chat.limit:chat-1");
    }

    #[tokio::test]
    async fn test_initialize_tolerates_unreadable_balance() {
        let harness = Harness::new();
        harness
            .storage
            .set(DEFAULT_BALANCE_KEY, "garbage")
            .await
            .unwrap();
        let controller = harness.controller("chat-1");

        controller.initialize().await;

        let view = controller.view();
        assert!(view.is_initialized);
        assert_eq!(view.token_balance, None);
        assert_eq!(view.remaining_messages, 3);
    }

    #[tokio::test]
    async fn test_last_send_arms_cooldown() {
        let harness = Harness::new();
        let controller = harness.controller("chat-1");
        controller.initialize().await;

        controller.register_successful_send().await.unwrap();
        controller.register_successful_send().await.unwrap();
        let view = controller.view();
        assert_eq!(view.remaining_messages, 1);
        assert_eq!(view.cooldown_ends_at, None);

        controller.register_successful_send().await.unwrap();
        let view = controller.view();
        assert_eq!(view.remaining_messages, 0);
        assert_eq!(view.cooldown_ends_at, Some(START + 60_000));
        assert_eq!(view.cooldown_ms_left, 60_000);
        assert!(view.is_cooldown_active);
        assert!(view.is_locked);
    }

    #[tokio::test]
    async fn test_register_propagates_write_failure() {
        let harness = Harness::new();
        let controller = harness.controller("chat-1");
        controller.initialize().await;

        harness.storage.fail_writes(true);
        let result = controller.register_successful_send().await;
        assert!(matches!(result, Err(ChatLimitError::Storage(_))));
    }

    #[tokio::test]
    async fn test_unlock_read_failure_clears_flag() {
        let harness = Harness::new();
        let controller = harness.controller("chat-1");
        controller.initialize().await;

        harness.storage.fail_reads(true);
        let outcome = controller.unlock_with_tokens().await;

        assert_eq!(outcome, UnlockOutcome::BalanceUnavailable);
        assert_eq!(outcome.balance(), None);
        let view = controller.view();
        assert!(!view.is_unlocking);
        assert_eq!(view.token_balance, None);
    }

    #[tokio::test]
    async fn test_unlock_publishes_unlocking_flag() {
        let harness = Harness::new();
        harness.tokens.set(10).await.unwrap();
        let controller = harness.controller("chat-1");
        controller.initialize().await;

        let mut rx = controller.subscribe();

        let outcome = controller.unlock_with_tokens().await;
        assert_eq!(outcome, UnlockOutcome::Unlocked { balance: 5 });
        assert!(rx.has_changed().unwrap());
        assert!(!rx.borrow_and_update().is_unlocking);
    }

    #[tokio::test]
    async fn test_unlock_refunds_when_reset_fails() {
        let harness = Harness::new();
        harness.tokens.set(8).await.unwrap();
        let controller = harness.controller("chat-1");
        controller.initialize().await;

        harness.storage.fail_writes_under("chat.limit:");
        let outcome = controller.unlock_with_tokens().await;

        assert_eq!(outcome, UnlockOutcome::Failed);
        assert_eq!(harness.tokens.get().await.unwrap(), 8);
        assert_eq!(controller.view().token_balance, Some(8));
        assert!(!controller.view().is_unlocking);
    }

    #[tokio::test]
    async fn test_refresh_token_balance() {
        let harness = Harness::new();
        let controller = harness.controller("chat-1");

        assert_eq!(controller.refresh_token_balance().await, Some(0));

        controller.reward_tokens(12).await.unwrap();
        assert_eq!(controller.view().token_balance, Some(12));

        harness.storage.fail_reads(true);
        assert_eq!(controller.refresh_token_balance().await, None);
        assert_eq!(controller.view().token_balance, None);
    }

    #[tokio::test]
    async fn test_clear_limits_removes_record() {
        let harness = Harness::new();
        let controller = harness.controller("chat-1");
        controller.initialize().await;
        controller.register_successful_send().await.unwrap();

        controller.clear_limits().await.unwrap();

        assert_eq!(harness.storage.get("chat.limit:chat-1").await.unwrap(), None);
        assert_eq!(controller.view().remaining_messages, 3);
    }

    #[tokio::test]
    async fn test_reset_limits_clears_cooldown() {
        let harness = Harness::new();
        let controller = harness.controller("chat-1");
        controller.initialize().await;
        for _ in 0..3 {
            controller.register_successful_send().await.unwrap();
        }
        assert!(controller.is_locked());

        controller.reset_limits().await.unwrap();

        assert!(!controller.is_locked());
        assert!(!controller.is_cooldown_active());
        assert_eq!(
            controller.ensure_can_send().await,
            SendCheck::Allowed { remaining: 3 }
        );
    }

    #[tokio::test]
    async fn test_stored_exhausted_record_without_cooldown_hits_limit() {
        let harness = Harness::new();
        harness
            .storage
            .set(
                "chat.limit:chat-1",
                r#"{"remaining":0,"cooldownUntil":null,"updatedAt":1}"#,
            )
            .await
            .unwrap();
        let controller = harness.controller("chat-1");

        let check = controller.ensure_can_send().await;
        assert_eq!(check, SendCheck::Limit);
        assert_eq!(check.cooldown_ms_remaining(), 0);
        assert!(controller.is_locked());
        assert!(!controller.is_cooldown_active());
    }

    #[tokio::test]
    async fn test_memory_store_controllers_share_global_scope() {
        let storage = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(START));
        let store = Arc::new(LimitStateStore::new(storage.clone(), clock));
        let tokens = Arc::new(TokenBalanceService::new(storage, &TokenConfig::default()));
        let config =
            LimitConfig::new(3, 60_000, 5).with_scope(LimitScope::Global);

        let first = LimitController::new("chat-a", config.clone(), store.clone(), tokens.clone());
        let second = LimitController::new("chat-b", config, store, tokens);
        assert_eq!(first.storage_key(), second.storage_key());

        first.register_successful_send().await.unwrap();
        second.register_successful_send().await.unwrap();

        assert_eq!(
            first.ensure_can_send().await,
            SendCheck::Allowed { remaining: 1 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_ticks_and_restores_quota() {
        let harness = Harness::new();
        let controller = harness.controller("chat-1");
        controller.initialize().await;
        for _ in 0..3 {
            controller.register_successful_send().await.unwrap();
        }

        harness.clock.advance(10_000);
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(controller.view().cooldown_ms_left, 50_000);
        assert!(controller.is_locked());

        harness.clock.advance(50_000);
        let mut rx = controller.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|view| !view.is_locked))
            .await
            .unwrap()
            .unwrap();

        let view = controller.view();
        assert_eq!(view.remaining_messages, 3);
        assert_eq!(view.cooldown_ends_at, None);
        assert!(controller.inner.countdown.lock().is_none());

        // Persisted eagerly, not just in memory
        let raw = harness.storage.get("chat.limit:chat-1").await.unwrap().unwrap();
        assert!(raw.contains(r#""remaining":3"#));
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_ticker_keeps_newer_shared_cooldown() {
        let harness = Harness::new();
        harness.tokens.set(10).await.unwrap();
        let config = LimitConfig::new(3, 60_000, 5).with_scope(LimitScope::Global);
        let first = LimitController::new(
            "chat-a",
            config.clone(),
            harness.store.clone(),
            harness.tokens.clone(),
        );
        let second = LimitController::new(
            "chat-b",
            config,
            harness.store.clone(),
            harness.tokens.clone(),
        );
        first.initialize().await;
        for _ in 0..3 {
            first.register_successful_send().await.unwrap();
        }
        assert_eq!(first.view().cooldown_ends_at, Some(START + 60_000));

        second.initialize().await;
        assert!(matches!(
            second.unlock_with_tokens().await,
            UnlockOutcome::Unlocked { .. }
        ));
        harness.clock.advance(30_000);
        for _ in 0..3 {
            second.register_successful_send().await.unwrap();
        }
        assert_eq!(second.view().cooldown_ends_at, Some(START + 90_000));

        // The first controller's own deadline passes while the shared one runs
        harness.clock.advance(30_000);
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        let raw = harness
            .storage
            .get(first.storage_key())
            .await
            .unwrap()
            .unwrap();
        assert!(raw.contains(&format!(r#""cooldownUntil":{}"#, START + 90_000)));
        assert_eq!(first.view().cooldown_ends_at, Some(START + 90_000));
        assert!(first.is_locked());
        assert_eq!(
            second.ensure_can_send().await,
            SendCheck::Cooldown {
                cooldown_ms_remaining: 30_000
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlock_stops_countdown() {
        let harness = Harness::new();
        harness.tokens.set(5).await.unwrap();
        let controller = harness.controller("chat-1");
        controller.initialize().await;
        for _ in 0..3 {
            controller.register_successful_send().await.unwrap();
        }
        assert!(controller.inner.countdown.lock().is_some());

        controller.unlock_with_tokens().await;
        assert!(controller.inner.countdown.lock().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_countdown() {
        let harness = Harness::new();
        let controller = harness.controller("chat-1");
        controller.initialize().await;
        for _ in 0..3 {
            controller.register_successful_send().await.unwrap();
        }

        let weak = Arc::downgrade(&controller.inner);
        drop(controller);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(weak.upgrade().is_none());
    }
}
