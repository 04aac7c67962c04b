use std::time::Duration;

use crate::models::outcome::FailureKind;

/// What to do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the delay.
    Retry(Duration),
    /// Record for operator review, then acknowledge.
    DeadLetter,
    /// Acknowledge without recording. Only for kinds configured non-actionable.
    Drop,
}

/// Bounded exponential backoff with a dead-letter cutoff.
///
/// Pure: no clock, no I/O. `attempt` is the number of attempts already made
/// for the job, starting at 1.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base: Duration,
    ceiling: Duration,
    max_attempts: u32,
    non_actionable: Vec<FailureKind>,
}

impl RetryPolicy {
    pub fn new(base: Duration, ceiling: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            ceiling: ceiling.max(base),
            max_attempts: max_attempts.max(1),
            non_actionable: Vec::new(),
        }
    }

    /// Mark permanent kinds that are dropped instead of dead-lettered.
    /// Transient kinds are ignored here; they are never dropped.
    pub fn with_non_actionable(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.non_actionable = kinds.into_iter().filter(|k| !k.is_transient()).collect();
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn decide(&self, kind: FailureKind, attempt: u32) -> RetryDecision {
        if attempt >= self.max_attempts {
            return RetryDecision::DeadLetter;
        }

        if !kind.is_transient() {
            if self.non_actionable.contains(&kind) {
                return RetryDecision::Drop;
            }
            return RetryDecision::DeadLetter;
        }

        RetryDecision::Retry(self.backoff(attempt))
    }

    /// `min(base * 2^(attempt-1), ceiling)`, saturating.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.ceiling)
            .min(self.ceiling)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30), 5)
    }
}
