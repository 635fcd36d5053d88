//! Fibonacci reconnect backoff.

use std::time::Duration;

/// Delays in seconds, indexed by consecutive failure count.
const DELAY_PATTERN: [u64; 14] = [0, 1, 1, 2, 3, 5, 8, 13, 21, 34, 55, 89, 144, 233];

/// After this many milliseconds without a failure, the failure history is
/// forgotten. 377 is the next Fibonacci number after the delay table.
const RESET_THRESHOLD_MS: i64 = 377_000;

/// What a failed attempt should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffAction {
    /// Wait this long, then try again.
    Retry(Duration),
    /// The delay table is exhausted; stop retrying permanently.
    GiveUp,
}

/// Tracks consecutive connection failures and hands out Fibonacci delays.
///
/// The caller owns the clock: every method takes the current time as epoch
/// milliseconds, so retry schedules can be tested without sleeping.
///
/// # Examples
///
/// ```
/// use cloakroom_tasks::{BackoffAction, FibonacciBackoff};
/// use std::time::Duration;
///
/// let mut backoff = FibonacciBackoff::new(0);
/// assert_eq!(backoff.on_failure(10), BackoffAction::Retry(Duration::from_secs(1)));
/// assert_eq!(backoff.on_failure(20), BackoffAction::Retry(Duration::from_secs(1)));
/// assert_eq!(backoff.on_failure(30), BackoffAction::Retry(Duration::from_secs(2)));
/// ```
#[derive(Debug)]
pub struct FibonacciBackoff {
    attempt: usize,
    last_connect_ms: i64,
}

impl FibonacciBackoff {
    /// Create a backoff tracker, treating `now_ms` as the last good connect.
    pub fn new(now_ms: i64) -> Self {
        Self {
            attempt: 0,
            last_connect_ms: now_ms,
        }
    }

    /// Record a successful connection; clears the failure history.
    pub fn connected(&mut self, now_ms: i64) {
        self.attempt = 0;
        self.last_connect_ms = now_ms;
    }

    /// Record a failed attempt and decide what to do next.
    ///
    /// If the last connect was more than the reset threshold ago the counter
    /// starts over and the retry is immediate. Otherwise the delay grows along
    /// the Fibonacci table until it is exhausted, at which point the caller
    /// must stop for good.
    pub fn on_failure(&mut self, now_ms: i64) -> BackoffAction {
        let delta = now_ms - self.last_connect_ms;

        if delta > RESET_THRESHOLD_MS {
            // Connectivity trouble was long ago, forget it.
            self.attempt = 0;
            self.last_connect_ms = now_ms;
            return BackoffAction::Retry(Duration::from_secs(DELAY_PATTERN[0]));
        }

        self.attempt += 1;

        if self.attempt >= DELAY_PATTERN.len() {
            BackoffAction::GiveUp
        } else {
            // Assume the upcoming attempt will succeed.
            self.last_connect_ms = now_ms;
            BackoffAction::Retry(Duration::from_secs(DELAY_PATTERN[self.attempt]))
        }
    }

    /// Number of consecutive failures since the last reset.
    pub fn attempt(&self) -> usize {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_follow_fibonacci_table() {
        let mut backoff = FibonacciBackoff::new(0);
        let expected = [1u64, 1, 2, 3, 5, 8, 13, 21, 34, 55, 89, 144, 233];

        for (i, secs) in expected.iter().enumerate() {
            let action = backoff.on_failure((i as i64 + 1) * 10);
            assert_eq!(action, BackoffAction::Retry(Duration::from_secs(*secs)));
        }
    }

    #[test]
    fn test_gives_up_after_exhausting_table() {
        let mut backoff = FibonacciBackoff::new(0);

        for _ in 0..13 {
            assert!(matches!(backoff.on_failure(10), BackoffAction::Retry(_)));
        }

        assert_eq!(backoff.on_failure(10), BackoffAction::GiveUp);
        // Stays given up while failures keep coming in.
        assert_eq!(backoff.on_failure(20), BackoffAction::GiveUp);
    }

    #[test]
    fn test_resets_attempt_counter_after_quiet_period() {
        let mut backoff = FibonacciBackoff::new(0);

        for _ in 0..10 {
            backoff.on_failure(1_000);
        }
        assert_eq!(backoff.attempt(), 10);

        // Last connect was more than 377s ago: counter starts over.
        let action = backoff.on_failure(1_000 + 377_001);
        assert_eq!(action, BackoffAction::Retry(Duration::from_secs(0)));
        assert_eq!(backoff.attempt(), 0);
    }

    #[test]
    fn test_connected_clears_history() {
        let mut backoff = FibonacciBackoff::new(0);
        backoff.on_failure(10);
        backoff.on_failure(20);
        backoff.connected(30);

        assert_eq!(backoff.attempt(), 0);
        assert_eq!(
            backoff.on_failure(40),
            BackoffAction::Retry(Duration::from_secs(1))
        );
    }
}
