//! Cooldown countdown ticker handle and formatting.

use std::time::Duration;

use tokio::task::JoinHandle;

/// How often a running countdown refreshes its remaining time.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Handle to a spawned countdown task.
///
/// Dropping the handle cancels the task, so replacing or discarding it can
/// never leave a ticker running.
#[derive(Debug)]
pub(crate) struct Countdown {
    deadline: i64,
    handle: JoinHandle<()>,
}

impl Countdown {
    pub(crate) fn new(deadline: i64, handle: JoinHandle<()>) -> Self {
        Self { deadline, handle }
    }

    /// The cooldown deadline this ticker counts down to.
    pub(crate) fn deadline(&self) -> i64 {
        self.deadline
    }
}

impl Drop for Countdown {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Format a remaining duration as `M:SS`, or `H:MM:SS` from one hour up.
///
/// Partial seconds round up so the display never reads `0:00` while a
/// cooldown is still running.
pub fn format_remaining(ms: u64) -> String {
    let total_secs = ms.div_ceil(1000);
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}
