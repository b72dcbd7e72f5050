use rand::Rng;
use std::time::Duration;

/// Bounded exponential backoff.
///
/// Attempt `n` (1-based) waits `base * 2^(n-1)`, capped at `max_delay`.
/// Past `max_attempts` there is no further delay: the caller gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_delay: max_delay.max(base),
            max_attempts,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }

        let shift = (attempt - 1).min(30);
        let factor = 1u32 << shift;
        let delay = self.base.saturating_mul(factor);
        Some(delay.min(self.max_delay))
    }

    /// `delay_for` plus up to 10% random jitter.
    pub fn jittered(&self, attempt: u32) -> Option<Duration> {
        let delay = self.delay_for(attempt)?;
        let spread = (delay.as_millis() / 10) as u64;
        if spread == 0 {
            return Some(delay);
        }
        let jitter = rand::thread_rng().gen_range(0..=spread);
        Some(delay + Duration::from_millis(jitter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(8), 10)
    }

    #[test]
    fn doubles_until_capped() {
        let policy = policy();
        assert_eq!(policy.delay_for(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_secs(4)));
        assert_eq!(policy.delay_for(4), Some(Duration::from_secs(8)));
        assert_eq!(policy.delay_for(9), Some(Duration::from_secs(8)));
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let policy = policy();
        assert!(policy.delay_for(10).is_some());
        assert_eq!(policy.delay_for(11), None);
        assert_eq!(policy.delay_for(0), None);
    }

    #[test]
    fn zero_attempts_never_retries() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(8), 0);
        assert_eq!(policy.delay_for(1), None);
    }

    #[test]
    fn large_attempts_do_not_overflow() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60), u32::MAX);
        assert_eq!(policy.delay_for(1000), Some(Duration::from_secs(60)));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let policy = policy();
        for attempt in 1..=10 {
            let base = policy.delay_for(attempt).unwrap();
            let jittered = policy.jittered(attempt).unwrap();
            assert!(jittered >= base);
            assert!(jittered <= base + base / 10);
        }
    }
}
