use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::handler::ProcessingError;

/// What to do with a DLQ delivery once its attempt has run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `backoff`, then send the task back to the main queue carrying `next_count`
    Retry { next_count: u32, backoff: Duration },
    /// Out of attempts; persist with `retry_count` and leave the live system
    Quarantine { retry_count: u32 },
    /// Processed; record the status and announce completion
    Complete { retry_count: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, BackoffPolicy::exponential())
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: BackoffPolicy) -> Self {
        Self { max_retries, backoff }
    }

    /// Attempt number for a delivery that has been through the DLQ `retry_counter` times
    pub fn attempt_for(&self, retry_counter: u32) -> u32 {
        retry_counter.saturating_add(1)
    }

    pub fn decide(&self, attempt: u32, outcome: &Result<(), ProcessingError>) -> RetryDecision {
        match outcome {
            Ok(()) => RetryDecision::Complete { retry_count: attempt },
            Err(_) if attempt < self.max_retries => RetryDecision::Retry {
                next_count: attempt,
                backoff: self.backoff.delay_for(attempt),
            },
            Err(_) => RetryDecision::Quarantine { retry_count: attempt },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed() -> Result<(), ProcessingError> {
        Err(ProcessingError::new("boom"))
    }

    #[test]
    fn test_failures_below_limit_retry_with_growing_backoff() {
        let policy = RetryPolicy::new(3, BackoffPolicy::exponential());

        assert_eq!(
            policy.decide(1, &failed()),
            RetryDecision::Retry { next_count: 1, backoff: Duration::from_secs(2) }
        );
        assert_eq!(
            policy.decide(2, &failed()),
            RetryDecision::Retry { next_count: 2, backoff: Duration::from_secs(4) }
        );
    }

    #[test]
    fn test_failure_at_or_past_limit_quarantines() {
        let policy = RetryPolicy::new(3, BackoffPolicy::exponential());
        assert_eq!(policy.decide(3, &failed()), RetryDecision::Quarantine { retry_count: 3 });
        assert_eq!(policy.decide(7, &failed()), RetryDecision::Quarantine { retry_count: 7 });
    }

    #[test]
    fn test_success_completes_at_any_attempt() {
        let policy = RetryPolicy::new(3, BackoffPolicy::exponential());
        assert_eq!(policy.decide(1, &Ok(())), RetryDecision::Complete { retry_count: 1 });
        assert_eq!(policy.decide(3, &Ok(())), RetryDecision::Complete { retry_count: 3 });
    }

    #[test]
    fn test_attempt_for_counter() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.attempt_for(0), 1);
        assert_eq!(policy.attempt_for(4), 5);
        assert_eq!(policy.attempt_for(u32::MAX), u32::MAX);
    }

    #[test]
    fn test_single_retry_limit_never_retries() {
        let policy = RetryPolicy::new(1, BackoffPolicy::exponential());
        assert_eq!(policy.decide(1, &failed()), RetryDecision::Quarantine { retry_count: 1 });
    }
}
