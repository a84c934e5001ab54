use std::time::Duration;

/// Exponential backoff for transient transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
            multiplier: 2,
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based), or `None` once the
    /// attempts are used up.
    pub fn delay_for(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry >= self.max_attempts {
            return None;
        }
        let factor = self.multiplier.saturating_pow(retry - 1);
        Some(self.base_delay.saturating_mul(factor).min(self.max_delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_and_stop() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(50)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for(3), None);
        assert_eq!(RetryPolicy::none().delay_for(1), None);
    }

    #[test]
    fn delays_are_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for(9), Some(Duration::from_secs(1)));
    }
}
