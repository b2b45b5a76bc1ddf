//! Per-key exponential backoff for requeues.

use std::time::Duration;

/// Exponential backoff used when a reconcile fails.
///
/// delay = base_delay * 2^(failures - 1), capped at `max_delay`.
///
/// Example with the defaults (5ms base, 1000s cap):
/// - failure 1: 5ms
/// - failure 2: 10ms
/// - failure 3: 20ms
/// - failure 19 and later: 1000s
#[derive(Debug, Clone)]
pub struct Backoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
        }
    }
}

impl Backoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay before the next attempt after `failures` consecutive failures (1-indexed).
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(62);
        let factor = 1u64 << exponent;
        let base_nanos = u64::try_from(self.base_delay.as_nanos()).unwrap_or(u64::MAX);
        let nanos = base_nanos.saturating_mul(factor);
        Duration::from_nanos(nanos).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backoff_values() {
        let backoff = Backoff::default();
        assert_eq!(backoff.base_delay, Duration::from_millis(5));
        assert_eq!(backoff.max_delay, Duration::from_secs(1000));
    }

    #[test]
    fn delay_doubles_per_failure() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(1), Duration::from_millis(5));
        assert_eq!(backoff.delay(2), Duration::from_millis(10));
        assert_eq!(backoff.delay(3), Duration::from_millis(20));
        assert_eq!(backoff.delay(0), Duration::from_millis(5));
    }

    #[test]
    fn delay_is_capped() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(backoff.delay(6), Duration::from_secs(30));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(30));
    }
}
