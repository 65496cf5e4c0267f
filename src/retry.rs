//! Retry policies for `schedule_activity_with_retry`.
//!
//! Delays between attempts are waited out on durable timers, so a policy must
//! compute the same delay for the same attempt on every replay.
use std::time::Duration;

/// How long to wait before the next attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    /// Retry immediately.
    None,
    Fixed {
        delay: Duration,
    },
    /// `base * attempt`, capped at `max`.
    Linear {
        base: Duration,
        max: Duration,
    },
    /// `base * multiplier^(attempt - 1)`, capped at `max`.
    Exponential {
        base: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(30),
        }
    }
}

impl BackoffStrategy {
    /// Delay after the 1-based `attempt` failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed { delay } => *delay,
            BackoffStrategy::Linear { base, max } => base.saturating_mul(attempt).min(*max),
            BackoffStrategy::Exponential { base, multiplier, max } => {
                let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let factor = multiplier.powi(exp);
                let millis = base.as_millis() as f64 * factor;
                if !millis.is_finite() || millis >= max.as_millis() as f64 {
                    *max
                } else {
                    Duration::from_millis(millis.max(0.0) as u64)
                }
            }
        }
    }
}

/// Attempt budget, per-attempt timeout and backoff for one activity call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub timeout: Option<Duration>,
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: None,
            backoff: BackoffStrategy::default(),
        }
    }
}

impl RetryPolicy {
    /// # Panics
    /// When `max_attempts` is 0.
    pub fn new(max_attempts: u32) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be at least 1");
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Wait `interval` between every attempt.
    pub fn with_first_retry_interval(self, interval: Duration) -> Self {
        self.with_backoff(BackoffStrategy::Fixed { delay: interval })
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Test: first-retry interval maps to fixed backoff
    #[test]
    fn test_first_retry_interval_is_fixed() {
        let policy = RetryPolicy::new(3).with_first_retry_interval(Duration::from_millis(5000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(5000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(5000));
        assert_eq!(policy.max_attempts, 3);
    }

    /// Test: exponential backoff saturates instead of overflowing
    #[test]
    fn test_exponential_large_attempt_caps() {
        let backoff = BackoffStrategy::Exponential {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(30),
        };
        assert_eq!(backoff.delay_for_attempt(u32::MAX), Duration::from_secs(30));
    }

    proptest! {
        /// Property: linear delay is base * attempt capped at max
        #[test]
        fn linear_delay_matches_formula(base_ms in 0u64..10_000, max_ms in 0u64..100_000, attempt in 1u32..10_000) {
            let backoff = BackoffStrategy::Linear {
                base: Duration::from_millis(base_ms),
                max: Duration::from_millis(max_ms),
            };
            let expected = (base_ms * attempt as u64).min(max_ms);
            prop_assert_eq!(backoff.delay_for_attempt(attempt), Duration::from_millis(expected));
        }

        /// Property: exponential delays never exceed max and never shrink
        #[test]
        fn exponential_delay_is_monotonic_and_capped(
            base_ms in 0u64..5_000,
            multiplier in 1.0f64..4.0,
            max_ms in 0u64..120_000,
            attempt in 1u32..200,
        ) {
            let backoff = BackoffStrategy::Exponential {
                base: Duration::from_millis(base_ms),
                multiplier,
                max: Duration::from_millis(max_ms),
            };
            let here = backoff.delay_for_attempt(attempt);
            let next = backoff.delay_for_attempt(attempt + 1);
            prop_assert!(here <= Duration::from_millis(max_ms));
            prop_assert!(next >= here);
        }

        /// Property: fixed and none strategies ignore the attempt number
        #[test]
        fn fixed_delay_constant(delay_ms in 0u64..100_000, attempt in 1u32..u32::MAX) {
            let fixed = BackoffStrategy::Fixed { delay: Duration::from_millis(delay_ms) };
            prop_assert_eq!(fixed.delay_for_attempt(attempt), Duration::from_millis(delay_ms));
            prop_assert_eq!(BackoffStrategy::None.delay_for_attempt(attempt), Duration::ZERO);
        }
    }
}
