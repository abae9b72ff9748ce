use std::time::Duration;

/// Bounded exponential backoff used when a ready connection drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Reconnection attempts before the connection is given up as closed.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the given attempt (1-based): doubles from `initial_delay`,
    /// never exceeding `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    pub fn delays(&self) -> impl Iterator<Item = (u32, Duration)> + '_ {
        (1..=self.max_retries).map(move |attempt| (attempt, self.delay(attempt)))
    }
}
