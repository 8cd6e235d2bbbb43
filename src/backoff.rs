//! Bounded exponential polling for long-running remote operations.

use std::time::Duration;

use tokio::time::Instant;

/// Polls with a doubling interval until a deadline passes.
#[derive(Debug, Clone)]
pub struct PollSchedule {
    interval: Duration,
    max_interval: Duration,
    deadline: Instant,
}

impl PollSchedule {
    /// Starts polling at `initial`, never waiting longer than `max_interval`
    /// between attempts, for at most `budget` overall.
    pub fn new(initial: Duration, max_interval: Duration, budget: Duration) -> Self {
        Self {
            interval: initial,
            max_interval,
            deadline: Instant::now() + budget,
        }
    }

    /// Interval the next call to [`PollSchedule::tick`] will sleep for.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sleeps for the current interval and doubles it.
    ///
    /// Returns `false` without sleeping once the deadline has passed.
    pub async fn tick(&mut self) -> bool {
        let now = Instant::now();
        if now >= self.deadline {
            return false;
        }
        let sleep_for = self.interval.min(self.deadline - now);
        tokio::time::sleep(sleep_for).await;
        self.interval = (self.interval * 2).min(self.max_interval);
        true
    }
}
