//! Retry primitives for the rejuvenation loop.
//!
//! Two scopes of retry show up in a fleet that rotates on a schedule:
//!
//! - **Within a cycle**: a probe or remote call is attempted a bounded
//!   number of times with a fixed backoff. [`retry`] runs such an operation
//!   and returns a typed [`RetryOutcome`] instead of looping on a counter.
//! - **Across cycles**: something that keeps failing cycle after cycle
//!   (a client that never accepts its migration message) should be
//!   escalated. [`RetryTracker`] counts failures per key inside a window.
//!
//! # Invariants
//!
//! - An operation is attempted at least once and at most `max_attempts` times
//! - Backoff is slept only between attempts, never after the last one
//! - No lock is held while sleeping

use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};

use tracing::debug;

/// Attempt budget for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Duration,
}

impl RetryPolicy {
    /// Fixed backoff between at most `max_attempts` attempts (minimum 1).
    pub fn fixed(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Exactly one attempt.
    pub fn once() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_MAX_ATTEMPTS, DEFAULT_BACKOFF)
    }
}

/// Result of running an operation under a [`RetryPolicy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T, E> {
    /// The operation succeeded on attempt `attempts` (1-based).
    Succeeded { value: T, attempts: u32 },
    /// Every attempt failed; `last_error` is from the final one.
    Exhausted { last_error: E, attempts: u32 },
}

impl<T, E> RetryOutcome<T, E> {
    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Succeeded { .. })
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts, .. } | RetryOutcome::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn into_result(self) -> Result<T, E> {
        match self {
            RetryOutcome::Succeeded { value, .. } => Ok(value),
            RetryOutcome::Exhausted { last_error, .. } => Err(last_error),
        }
    }
}

/// Runs `op` until it succeeds or the policy's attempts are used up.
///
/// `op` receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => {
                return RetryOutcome::Succeeded {
                    value,
                    attempts: attempt,
                }
            }
            Err(e) if attempt >= policy.max_attempts => {
                return RetryOutcome::Exhausted {
                    last_error: e,
                    attempts: attempt,
                }
            }
            Err(e) => {
                debug!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "attempt failed, backing off"
                );
                tokio::time::sleep(policy.backoff).await;
                attempt += 1;
            }
        }
    }
}

/// Retry tracker for failures that recur across cycles.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    /// Failures tolerated inside the window.
    max_retries: u32,

    /// Retry window duration.
    window: Duration,

    /// Tracked failures: key -> (count, first_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RetryTracker {
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for `key`.
    ///
    /// Returns true once failures inside the window exceed `max_retries`.
    pub fn record_failure(&mut self, key: &str) -> bool {
        let now = Instant::now();

        let (count, first) = self.failures.entry(key.to_string()).or_insert((0, now));

        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    pub fn is_exhausted(&self, key: &str) -> bool {
        let Some((count, first)) = self.failures.get(key) else {
            return false;
        };

        if Instant::now().duration_since(*first) > self.window {
            return false;
        }

        *count > self.max_retries
    }

    /// Forget `key` after it succeeded.
    pub fn clear(&mut self, key: &str) {
        self.failures.remove(key);
    }

    /// Drop entries whose window has passed.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }

    pub fn tracked(&self) -> usize {
        self.failures.len()
    }
}

/// Default attempts for a reachability probe.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default pause between probe attempts.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(10);

/// Cycles a client may fail before it is escalated.
pub const DEFAULT_MAX_CLIENT_FAILURES: u32 = 3;

/// Window over which client failures are counted.
pub const DEFAULT_CLIENT_FAILURE_WINDOW: Duration = Duration::from_secs(60 * 60);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let outcome = retry(&RetryPolicy::fixed(3, Duration::from_secs(10)), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err("refused")
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(
            outcome,
            RetryOutcome::Succeeded {
                value: 3,
                attempts: 3
            }
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_without_trailing_backoff() {
        let start = tokio::time::Instant::now();

        let outcome: RetryOutcome<(), &str> =
            retry(&RetryPolicy::fixed(2, Duration::from_secs(5)), |_| async {
                Err("timeout")
            })
            .await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.attempts(), 2);
        assert_eq!(outcome.into_result(), Err("timeout"));
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let policy = RetryPolicy::fixed(0, Duration::ZERO);
        assert_eq!(policy.max_attempts(), 1);
        let outcome: RetryOutcome<u8, &str> = retry(&policy, |_| async { Ok(7) }).await;
        assert_eq!(outcome.into_result(), Ok(7));
    }

    #[test]
    fn test_retry_tracker() {
        let mut tracker = RetryTracker::new(3, Duration::from_secs(60));

        assert!(!tracker.record_failure("10.0.0.3")); // 1st
        assert!(!tracker.record_failure("10.0.0.3")); // 2nd
        assert!(!tracker.record_failure("10.0.0.3")); // 3rd
        assert!(tracker.record_failure("10.0.0.3")); // 4th - exhausted

        assert!(tracker.is_exhausted("10.0.0.3"));
        assert!(!tracker.is_exhausted("10.0.0.4"));

        tracker.clear("10.0.0.3");
        assert!(!tracker.is_exhausted("10.0.0.3"));
        assert_eq!(tracker.tracked(), 0);
    }

    #[test]
    fn test_retry_tracker_window_expiry() {
        let mut tracker = RetryTracker::new(0, Duration::ZERO);
        assert!(tracker.record_failure("a"));
        std::thread::sleep(Duration::from_millis(2));
        tracker.prune();
        assert_eq!(tracker.tracked(), 0);
    }
}
