// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Retry policies for radio link operations.
//!
//! A policy bounds how many times an operation is attempted in one round
//! and how long to wait between attempts. What happens after a round is
//! exhausted (longer backoff, giving up) is up to the caller.

use std::time::Duration;

use crate::radio::LinkError;

/// Policy for retrying failed operations.
pub trait RetryPolicy: Send + Sync {
    /// Determine if the operation should be retried after failed attempt
    /// number `attempt` (zero-based).
    fn should_retry(&self, attempt: u32, error: &LinkError) -> bool;

    /// Get the delay before the next retry attempt.
    fn delay(&self, attempt: u32) -> Duration;

    /// Get the maximum number of attempts allowed.
    fn max_attempts(&self) -> u32;
}

/// Exponential backoff retry policy.
///
/// Delays double with each attempt, up to a configured maximum delay.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialBackoff {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(5), Duration::from_secs(10))
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn should_retry(&self, attempt: u32, error: &LinkError) -> bool {
        attempt + 1 < self.max_attempts && error.is_transient()
    }

    fn delay(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(multiplier).min(self.max_delay)
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Fixed delay retry policy.
#[derive(Debug, Clone)]
pub struct FixedDelay {
    max_attempts: u32,
    delay: Duration,
}

impl FixedDelay {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

impl RetryPolicy for FixedDelay {
    fn should_retry(&self, attempt: u32, error: &LinkError) -> bool {
        attempt + 1 < self.max_attempts && error.is_transient()
    }

    fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::Characteristic;

    #[test]
    fn test_exponential_backoff_delays() {
        let policy = ExponentialBackoff::new(5, Duration::from_millis(100), Duration::from_secs(1));

        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        // capped
        assert_eq!(policy.delay(4), Duration::from_secs(1));
        assert_eq!(policy.delay(40), Duration::from_secs(1));
    }

    #[test]
    fn test_fixed_delay_round_of_three() {
        let policy = FixedDelay::new(3, Duration::from_secs(5));
        let err = LinkError::connect("timeout");

        assert!(policy.should_retry(0, &err));
        assert!(policy.should_retry(1, &err));
        assert!(!policy.should_retry(2, &err));
        assert_eq!(policy.delay(7), Duration::from_secs(5));
    }

    #[test]
    fn test_permanent_errors_not_retried() {
        let policy = FixedDelay::new(3, Duration::from_secs(1));
        let fatal = LinkError::unsupported(Characteristic::PersistedPosition);
        assert!(!policy.should_retry(0, &fatal));

        let backoff = ExponentialBackoff::default();
        assert!(!backoff.should_retry(0, &fatal));
        assert_eq!(backoff.max_attempts(), 3);
    }
}
