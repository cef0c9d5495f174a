//! Exponential reconnect backoff.

use std::time::Duration;

/// Reconnect schedule: attempt `n` (1-based) waits `base * 2^(n-1)`.
///
/// After `max_attempts` delays have been handed out, `next_delay` returns
/// `None` and the caller must give up.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_attempts,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt += 1;
        let factor = 2u32.saturating_pow(self.attempt - 1);
        Some(self.base.saturating_mul(factor))
    }

    /// Attempts consumed since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Called after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod proptest_suite {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn yields_exactly_max_attempts(base_ms in 1u64..5_000, max in 0u32..12) {
            let mut backoff = Backoff::new(Duration::from_millis(base_ms), max);
            let mut n = 0;
            while backoff.next_delay().is_some() {
                n += 1;
            }
            prop_assert_eq!(n, max);
            prop_assert!(backoff.is_exhausted());
        }

        #[test]
        fn delays_double(base_ms in 1u64..5_000, max in 2u32..12) {
            let mut backoff = Backoff::new(Duration::from_millis(base_ms), max);
            let mut prev = backoff.next_delay().unwrap();
            prop_assert_eq!(prev, Duration::from_millis(base_ms));
            while let Some(next) = backoff.next_delay() {
                prop_assert_eq!(next, prev * 2);
                prev = next;
            }
        }
    }
}
