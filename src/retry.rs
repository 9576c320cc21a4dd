//! Retry primitives.
//!
//! [`RetryPolicy`] is the single bounded-retry executor used for connects,
//! health probes and node creation: fixed delay between attempts, each attempt
//! raced against a timeout, only the last failure surfaces.
//!
//! [`LinearBackoff`] is the separate attempt counter used by relay-socket
//! clients, where the n-th reconnect waits `base_delay * n`.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{BridgeError, Result};

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Bounded retry with a fixed delay and a per-attempt timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    /// Pause between a failed attempt and the next one. Not applied after the last.
    pub delay: Duration,
    /// Window each attempt is raced against.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    /// 3 attempts, 2000 ms apart, 10 s per attempt.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(2000),
            timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration, timeout: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            timeout,
        }
    }

    /// Run `op` until it succeeds or `max_attempts` is exhausted.
    ///
    /// Attempts run strictly one after another. A timed-out attempt is
    /// abandoned (its future is dropped) and counts as a failure.
    ///
    /// # Returns
    /// - `Ok(T)`: the first successful attempt's value.
    /// - `Err(e)`: the error of the **last** attempt; earlier errors are only logged.
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let err = match tokio::time::timeout(self.timeout, op()).await {
                Ok(Ok(value)) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Ok(Err(e)) => e,
                Err(_) => BridgeError::Timeout {
                    operation: operation.to_string(),
                    after_ms: self.timeout.as_millis() as u64,
                },
            };

            warn!(
                operation,
                attempt,
                max_attempts = attempts,
                error = %err,
                "attempt failed"
            );

            if attempt >= attempts {
                return Err(err);
            }

            tokio::time::sleep(self.delay).await;
            attempt += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// LinearBackoff
// ---------------------------------------------------------------------------

/// Reconnect counter for relay-socket clients.
///
/// The counter only grows between successes and never passes `max_attempts`;
/// [`reset`](Self::reset) must be called on every successful (re)connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearBackoff {
    base_delay: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl LinearBackoff {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
            attempts: 0,
        }
    }

    /// Consume one reconnect attempt and return how long to wait before it.
    ///
    /// Returns `None` once `max_attempts` reconnects have been handed out.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.base_delay.saturating_mul(self.attempts))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

impl Default for LinearBackoff {
    /// 1000 ms base, 5 reconnects.
    fn default() -> Self {
        Self::new(Duration::from_millis(1000), 5)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(200))
    }

    #[test]
    fn test_default_policy_values() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_attempts, 3);
        assert_eq!(p.delay, Duration::from_millis(2000));
        assert_eq!(p.timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_execute_returns_first_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let out = fast(3)
            .execute("op", || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, BridgeError>(7)
                }
            })
            .await;
        assert_eq!(out.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_succeeds_on_third_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let out = fast(3)
            .execute("op", || {
                let c = Arc::clone(&c);
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(BridgeError::HealthCheck(format!("fail {n}")))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(out.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_execute_surfaces_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let err = fast(4)
            .execute("op", || {
                let c = Arc::clone(&c);
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                    Err::<(), _>(BridgeError::HealthCheck(format!("fail {n}")))
                }
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "health check failed: fail 4");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_execute_zero_attempts_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let _ = fast(0)
            .execute("op", || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(BridgeError::NotRunning)
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_timeout_counts_as_failure() {
        let policy = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(20));
        let err = policy
            .execute("slow probe", || async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok::<_, BridgeError>(())
            })
            .await
            .unwrap_err();
        match err {
            BridgeError::Timeout { operation, after_ms } => {
                assert_eq!(operation, "slow probe");
                assert_eq!(after_ms, 20);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_waits_fixed_delay_between_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(2000), Duration::from_secs(10));
        let started = tokio::time::Instant::now();
        let _ = policy
            .execute("op", || async { Err::<(), _>(BridgeError::NotRunning) })
            .await;
        // Two gaps for three attempts, no gap after the last.
        assert_eq!(started.elapsed(), Duration::from_millis(4000));
    }

    #[test]
    fn test_backoff_is_linear() {
        let mut b = LinearBackoff::new(Duration::from_millis(1000), 5);
        assert_eq!(b.next_delay(), Some(Duration::from_millis(1000)));
        assert_eq!(b.next_delay(), Some(Duration::from_millis(2000)));
        assert_eq!(b.next_delay(), Some(Duration::from_millis(3000)));
    }

    #[test]
    fn test_backoff_caps_at_max_attempts() {
        let mut b = LinearBackoff::new(Duration::from_millis(10), 2);
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_some());
        assert_eq!(b.next_delay(), None);
        assert_eq!(b.attempts(), 2);
        assert!(b.is_exhausted());
    }

    #[test]
    fn test_backoff_reset_restarts_from_base() {
        let mut b = LinearBackoff::default();
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.attempts(), 0);
        assert_eq!(b.next_delay(), Some(Duration::from_millis(1000)));
    }
}
