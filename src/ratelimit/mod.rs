//! Message quota logic and state management.

mod backend;
mod controller;
mod countdown;
mod key;
mod record;
mod rules;
mod store;

pub use backend::SendLimiter;
pub use controller::{LimitController, LimitView, SendCheck, UnlockOutcome};
pub use countdown::{format_remaining, TICK_INTERVAL};
pub use key::{build_storage_key, LimitKey, GLOBAL_SCOPE_KEY};
pub use record::{LimitRecord, LimitSnapshot};
pub use rules::{LimitConfig, LimitScope, DEFAULT_STORAGE_KEY_PREFIX};
pub use store::LimitStateStore;
