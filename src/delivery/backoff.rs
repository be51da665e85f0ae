use std::time::Duration;

/// Exponential backoff doubling from `base`, capped at `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next attempt once `attempt_count` attempts have failed.
    pub fn delay(&self, attempt_count: u32) -> Duration {
        if attempt_count == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt_count - 1).min(31);
        let factor = 1u32 << exponent;
        self.base.saturating_mul(factor).min(self.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_from_base() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(5));
        assert_eq!(policy.delay(2), Duration::from_secs(10));
        assert_eq!(policy.delay(3), Duration::from_secs(20));
    }

    #[test]
    fn is_capped() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(7), Duration::from_secs(300));
        assert_eq!(policy.delay(40), Duration::from_secs(300));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(300));
    }

    #[test]
    fn never_decreases() {
        let policies = [
            BackoffPolicy::default(),
            BackoffPolicy {
                base: Duration::from_millis(250),
                cap: Duration::from_secs(90),
            },
            BackoffPolicy {
                base: Duration::from_secs(1),
                cap: Duration::from_secs(1),
            },
        ];
        for policy in policies {
            let mut previous = Duration::ZERO;
            for attempt in 0..64 {
                let delay = policy.delay(attempt);
                assert!(delay >= previous, "{policy:?} decreased at {attempt}");
                assert!(delay <= policy.cap);
                previous = delay;
            }
        }
    }
}
