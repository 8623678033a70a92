//! Bounded retry policy with exponential backoff.

use std::time::Duration;
use tokio_retry2::strategy::{jitter, ExponentialBackoff};

/// How often and how patiently a single URL is retried.
///
/// The schedule is `base_delay * 2^n`, capped at `max_delay`, with one
/// delay per retry. The defaults give 1s, 2s, 4s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Scale every delay by a random factor in `[0.5, 1.5)`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Total number of attempts, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// The backoff schedule, one entry per retry.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let jittered = self.jitter;
        self.schedule().map(move |delay| {
            if jittered {
                jitter(delay)
            } else {
                delay
            }
        })
    }

    /// `ExponentialBackoff` yields `factor * 2^(n + 1)` milliseconds, so a
    /// factor of half the base delay starts the schedule at `base_delay`.
    fn schedule(&self) -> std::iter::Take<ExponentialBackoff> {
        let half_base = (self.base_delay.as_millis() / 2).min(u64::MAX as u128) as u64;
        ExponentialBackoff::from_millis(2)
            .factor(half_base)
            .max_delay(self.max_delay)
            .take(self.max_retries as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_doubles() {
        let delays: Vec<_> = RetryPolicy::default().delays().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[test]
    fn delays_are_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            max_delay: Duration::from_secs(5),
            ..RetryPolicy::default()
        };
        assert!(policy.delays().all(|d| d <= Duration::from_secs(5)));
        assert_eq!(policy.delays().last(), Some(Duration::from_secs(5)));
        assert_eq!(policy.max_attempts(), 11);
    }

    #[test]
    fn schedule_scales_with_base_delay() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            ..RetryPolicy::default()
        };
        let delays: Vec<_> = policy.delays().collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(40)
            ]
        );
    }

    #[test]
    fn no_retries_means_one_attempt() {
        let policy = RetryPolicy::none();
        assert_eq!(policy.delays().count(), 0);
        assert_eq!(policy.max_attempts(), 1);
    }

    #[test]
    fn jitter_stays_within_half_of_the_base_schedule() {
        let policy = RetryPolicy {
            jitter: true,
            ..RetryPolicy::default()
        };
        for (delay, base) in policy.delays().zip(policy.schedule()) {
            assert!(delay >= base / 2);
            assert!(delay <= base * 3 / 2);
        }
    }
}
