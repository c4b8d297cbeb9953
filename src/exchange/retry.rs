use crate::config::ExchangeConfig;
use crate::generation::{ErrorKind, ExecutionError};
use std::time::Duration;

/// What to do after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RetryDecision {
    /// Sleep for the delay, then run budget check and execution again.
    Retry(Duration),
    /// Transient failures outlasted the retry limit.
    Exhausted,
    Fatal,
    Cancelled,
}

/// Exponential backoff bounded by a per-task retry limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ExchangeConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay(),
            max_delay: config.max_retry_delay(),
        }
    }

    /// Apply a task's own `max_retries`, if it set one.
    #[must_use]
    pub fn for_task(self, max_retries: Option<u32>) -> Self {
        Self {
            max_retries: max_retries.unwrap_or(self.max_retries),
            ..self
        }
    }

    /// Delay before retry number `attempt` (1-based): `2^attempt * base`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Decide the next step given the failure and the attempt counter
    /// *after* it was incremented for this failure.
    pub fn decide(&self, error: &ExecutionError, attempts: u32) -> RetryDecision {
        match error.kind() {
            ErrorKind::Cancelled => RetryDecision::Cancelled,
            ErrorKind::Fatal => RetryDecision::Fatal,
            ErrorKind::Transient if attempts > self.max_retries => RetryDecision::Exhausted,
            ErrorKind::Transient => RetryDecision::Retry(self.backoff(attempts)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::from_config(&ExchangeConfig::default())
    }

    #[test]
    fn test_default_backoff_schedule() {
        let p = policy();
        assert_eq!(p.max_retries, 5);
        let delays: Vec<u64> = (1..=5).map(|a| p.backoff(a).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32]);
    }

    #[test]
    fn test_backoff_capped() {
        let p = policy();
        assert_eq!(p.backoff(6), Duration::from_secs(60));
        assert_eq!(p.backoff(40), Duration::from_secs(60));
    }

    #[test]
    fn test_task_override() {
        assert_eq!(policy().for_task(Some(1)).max_retries, 1);
        assert_eq!(policy().for_task(None).max_retries, 5);
    }

    #[test]
    fn test_transient_until_exhausted() {
        let p = policy().for_task(Some(2));
        let err = ExecutionError::from_message("Fetch failed");
        assert_eq!(p.decide(&err, 1), RetryDecision::Retry(Duration::from_secs(2)));
        assert_eq!(p.decide(&err, 2), RetryDecision::Retry(Duration::from_secs(4)));
        assert_eq!(p.decide(&err, 3), RetryDecision::Exhausted);
    }

    #[test]
    fn test_fatal_and_cancelled_never_retry() {
        let p = policy();
        assert_eq!(
            p.decide(&ExecutionError::from_message("Context too long"), 1),
            RetryDecision::Fatal
        );
        assert_eq!(
            p.decide(&ExecutionError::cancelled(), 1),
            RetryDecision::Cancelled
        );
    }

    #[test]
    fn test_zero_retries_fails_first_transient() {
        let p = policy().for_task(Some(0));
        assert_eq!(
            p.decide(&ExecutionError::transient("network down"), 1),
            RetryDecision::Exhausted
        );
    }
}
