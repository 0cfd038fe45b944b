//! Bounded condition polling
//!
//! Every wait in the step pipeline goes through [`poll_until`] instead of a
//! bare sleep, so tests can drive the pipeline under tokio's paused clock.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Outcome of a bounded poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The condition became true; carries the number of attempts used
    Ready(u32),
    /// The attempt budget was exhausted
    TimedOut,
}

impl PollOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, PollOutcome::Ready(_))
    }
}

/// Evaluate `condition` up to `attempts` times, sleeping `interval` between
/// attempts. Returns as soon as the condition holds. Never blocks beyond
/// `attempts * interval`.
pub async fn poll_until<F, Fut>(attempts: u32, interval: Duration, mut condition: F) -> PollOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for attempt in 1..=attempts {
        if condition().await {
            return PollOutcome::Ready(attempt);
        }
        if attempt < attempts {
            sleep(interval).await;
        }
    }
    PollOutcome::TimedOut
}
