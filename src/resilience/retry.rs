use std::time::Duration;

/// Exponential backoff schedule for upstream retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Base delay before the given 1-based attempt: `base * 2^(n-2)`, capped
    /// at the maximum. The first attempt has no delay.
    pub fn backoff_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt <= 1 {
            return None;
        }
        let factor = 2u32.saturating_pow(attempt - 2);
        let delay = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }

    /// Backoff delay plus random jitter in `[0, delay)` to avoid retry
    /// synchronization across callers.
    pub fn jittered_delay(&self, attempt: u32) -> Option<Duration> {
        self.backoff_delay(attempt)
            .map(|delay| delay + delay.mul_f64(fastrand::f64()))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(10))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_attempt_has_no_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(1), None);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(6, Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(policy.backoff_delay(2), Some(Duration::from_secs(1)));
        assert_eq!(policy.backoff_delay(3), Some(Duration::from_secs(2)));
        assert_eq!(policy.backoff_delay(4), Some(Duration::from_secs(4)));
        assert_eq!(policy.backoff_delay(5), Some(Duration::from_secs(8)));
        // Capped at max_delay from here on
        assert_eq!(policy.backoff_delay(6), Some(Duration::from_secs(10)));
        assert_eq!(policy.backoff_delay(7), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_delays_non_decreasing() {
        let policy = RetryPolicy::default();
        let mut previous = Duration::ZERO;
        for attempt in 2..=8 {
            let delay = policy.backoff_delay(attempt).unwrap();
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(10));
            previous = delay;
        }
    }

    #[test]
    fn test_jitter_stays_within_one_delay() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let base = policy.backoff_delay(3).unwrap();
            let jittered = policy.jittered_delay(3).unwrap();
            assert!(jittered >= base);
            assert!(jittered < base * 2);
        }
    }
}
