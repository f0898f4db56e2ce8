use std::time::Duration;

/// Exponential backoff with an attempt budget for re-acquiring a subscription.
///
/// Once the budget is spent the channel stays down and delivery is covered by
/// the backup poller and recovery fetches until a force refresh resets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResubscribePolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
    max_attempts: u32,
}

impl ResubscribePolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64, max_attempts: u32) -> Self {
        Self {
            base_delay_ms: base_delay_ms.max(1),
            max_delay_ms: max_delay_ms.max(base_delay_ms.max(1)),
            max_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `attempt` (zero-based), or `None` once the budget is spent.
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 1_u64 << attempt.min(20);
        let delay = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Some(Duration::from_millis(delay))
    }
}

impl Default for ResubscribePolicy {
    fn default() -> Self {
        Self::new(1_000, 30_000, 5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_from_base_until_capped() {
        let policy = ResubscribePolicy::new(250, 1_000, 10);
        assert_eq!(policy.delay_for_attempt(0), Some(Duration::from_millis(250)));
        assert_eq!(policy.delay_for_attempt(1), Some(Duration::from_millis(500)));
        assert_eq!(policy.delay_for_attempt(4), Some(Duration::from_millis(1_000)));
    }

    #[test]
    fn stops_after_attempt_budget() {
        let policy = ResubscribePolicy::new(100, 1_000, 2);
        assert!(policy.delay_for_attempt(1).is_some());
        assert_eq!(policy.delay_for_attempt(2), None);
    }

    #[test]
    fn zero_budget_never_retries() {
        let policy = ResubscribePolicy::new(100, 1_000, 0);
        assert_eq!(policy.delay_for_attempt(0), None);
    }
}
