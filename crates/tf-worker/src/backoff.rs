use std::time::Duration;

use rand::Rng;

/// Exponential delay between DLQ retries: `base^attempt` seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_secs: u64,
    /// Upper bound for one delay; `None` lets the delay grow without limit
    pub max_delay: Option<Duration>,
    /// Pick a uniformly random delay in `[0, computed]` instead of the exact value
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_secs: 2,
            max_delay: None,
            jitter: false,
        }
    }
}

impl BackoffPolicy {
    pub fn exponential() -> Self {
        Self::default()
    }

    pub fn with_max_delay(mut self, max_delay: Option<Duration>) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before re-publishing the task whose DLQ attempt `attempt` just failed
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let secs = self.base_secs.checked_pow(attempt).unwrap_or(u64::MAX);
        let mut delay = Duration::from_secs(secs);
        if let Some(max) = self.max_delay {
            delay = delay.min(max);
        }

        if self.jitter && !delay.is_zero() {
            let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
            delay = Duration::from_millis(rand::thread_rng().gen_range(0..=millis));
        }
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_is_two_to_the_attempt() {
        let policy = BackoffPolicy::exponential();
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(4), Duration::from_secs(16));
    }

    #[test]
    fn test_delay_is_monotonic() {
        let policy = BackoffPolicy::exponential();
        let delays: Vec<_> = (0..20).map(|n| policy.delay_for(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_delay_saturates_instead_of_overflowing() {
        let policy = BackoffPolicy::exponential();
        assert_eq!(policy.delay_for(64), Duration::from_secs(u64::MAX));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_cap_bounds_the_delay() {
        let policy = BackoffPolicy::exponential().with_max_delay(Some(Duration::from_secs(300)));
        assert_eq!(policy.delay_for(5), Duration::from_secs(32));
        assert_eq!(policy.delay_for(8), Duration::from_secs(256));
        assert_eq!(policy.delay_for(9), Duration::from_secs(300));
        assert_eq!(policy.delay_for(40), Duration::from_secs(300));
    }

    #[test]
    fn test_jitter_stays_below_computed_delay() {
        let policy = BackoffPolicy::exponential().with_jitter(true);
        for _ in 0..100 {
            assert!(policy.delay_for(3) <= Duration::from_secs(8));
        }
    }
}
