use std::time::Duration;

/// Bounded exponential backoff.
///
/// `max_attempts` counts every try including the first one; `None` retries
/// forever. The delay before retry `n` (1-based) is
/// `initial_backoff * 2^(n-1)`, capped at `max_backoff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: Option<u32>,
    initial_backoff: Duration,
    max_backoff: Duration,
}

/// Tries made before a token refresh failure is surfaced.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Some(DEFAULT_MAX_ATTEMPTS), DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_BACKOFF)
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: Option<u32>, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.map(|n| n.max(1)),
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
        }
    }

    /// `max_attempts` tries with no delay between them.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(Some(max_attempts), Duration::ZERO, Duration::ZERO)
    }

    /// Never gives up.
    pub fn unbounded(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self::new(None, initial_backoff, max_backoff)
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Whether another try is allowed after `attempts` have failed.
    pub fn should_retry(&self, attempts: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempts < max,
            None => true,
        }
    }

    /// Delay to wait after the `attempt`-th failure.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}
