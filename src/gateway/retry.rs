//! Jittered exponential backoff for the reconnect supervisor.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Backoff configuration for reconnect scheduling.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// delay before the first retry
    first_backoff: Duration,
    /// upper bound for the exponential growth
    max_backoff: Duration,
    /// jitter ratio in `[0, 1]`, applied as `1 + U[-ratio, +ratio]`
    jitter_ratio: f64,
    /// give up after this many consecutive failed attempts
    max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl RetryPolicy {
    /// Create a policy with the given backoff window, half jitter and no
    /// retry cap.
    pub fn new(first_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            first_backoff,
            max_backoff,
            jitter_ratio: 0.5,
            max_retries: None,
        }
    }

    /// Set the jitter ratio; values are clamped into `[0, 1]`.
    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// Cap the number of consecutive failed attempts.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Configured retry cap, if any.
    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    /// Compute the delay before the given attempt, 1-based.
    ///
    /// `min(first_backoff * 2^(attempts-1), max_backoff)`, scaled by a
    /// uniformly random jitter factor.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(u32::from(u16::MAX));
        let base_ms = u64::try_from(self.first_backoff.as_millis())
            .unwrap_or(u64::MAX)
            .saturating_mul(1u64.checked_shl(exponent).unwrap_or(u64::MAX));
        let capped_ms = base_ms.min(
            u64::try_from(self.max_backoff.as_millis()).unwrap_or(u64::MAX),
        );

        let jitter = 1.0 + self.jitter_ratio * (fastrand::f64() * 2.0 - 1.0);
        let delayed_ms = (capped_ms as f64 * jitter).max(0.0) as u64;

        Duration::from_millis(delayed_ms)
    }
}

/// Attempt bookkeeping for one client, reset on every successful
/// ready/resumed handshake.
#[derive(Debug, Default)]
pub struct RetryContext {
    attempts: AtomicU32,
    reset_count: AtomicU32,
}

impl RetryContext {
    /// Create a fresh context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consecutive failed attempts since the last success.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// How many times the context was reset by a successful handshake.
    pub fn reset_count(&self) -> u32 {
        self.reset_count.load(Ordering::SeqCst)
    }

    /// Record one more attempt, returning the new count.
    pub fn next(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Clear the attempt counter after a successful handshake.
    pub fn reset(&self) {
        self.attempts.store(0, Ordering::SeqCst);
        self.reset_count.fetch_add(1, Ordering::SeqCst);
    }
}
