//! RetryPolicy and LinearBackoff behaviour under arbitrary parameters.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conectify_bridge::error::BridgeError;
use conectify_bridge::retry::{LinearBackoff, RetryPolicy};
use proptest::prelude::*;

fn failing_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::ZERO, Duration::from_secs(5))
}

proptest! {
    #[test]
    fn prop_exhausted_retry_returns_last_error(max_attempts in 1u32..8) {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = failing_policy(max_attempts);

        let counter = Arc::clone(&calls);
        let result: Result<(), _> = tokio_test::block_on(policy.execute("op", move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err(BridgeError::Protocol(format!("attempt {n}"))) }
        }));

        prop_assert_eq!(calls.load(Ordering::SeqCst), max_attempts);
        match result {
            Err(BridgeError::Protocol(msg)) => prop_assert_eq!(msg, format!("attempt {max_attempts}")),
            other => prop_assert!(false, "unexpected result: {:?}", other),
        }
    }

    #[test]
    fn prop_succeeds_on_first_ok_attempt(max_attempts in 1u32..8, ok_at in 1u32..8) {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = failing_policy(max_attempts);

        let counter = Arc::clone(&calls);
        let result = tokio_test::block_on(policy.execute("op", move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n >= ok_at { Ok(n) } else { Err(BridgeError::HealthCheck("down".into())) }
            }
        }));

        if ok_at <= max_attempts {
            prop_assert_eq!(result.ok(), Some(ok_at));
            prop_assert_eq!(calls.load(Ordering::SeqCst), ok_at);
        } else {
            prop_assert!(result.is_err());
            prop_assert_eq!(calls.load(Ordering::SeqCst), max_attempts);
        }
    }

    #[test]
    fn prop_backoff_counter_is_monotonic_and_capped(max in 0u32..20, base_ms in 1u64..5000, steps in 0usize..40) {
        let mut backoff = LinearBackoff::new(Duration::from_millis(base_ms), max);
        let mut last = 0;
        for _ in 0..steps {
            let delay = backoff.next_delay();
            prop_assert!(backoff.attempts() >= last);
            prop_assert!(backoff.attempts() <= max);
            if let Some(d) = delay {
                prop_assert_eq!(d, Duration::from_millis(base_ms * u64::from(backoff.attempts())));
            } else {
                prop_assert!(backoff.is_exhausted());
            }
            last = backoff.attempts();
        }
        backoff.reset();
        prop_assert_eq!(backoff.attempts(), 0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_delay_only_between_attempts() {
    let policy = RetryPolicy::new(4, Duration::from_secs(2), Duration::from_secs(30));
    let started = tokio::time::Instant::now();

    let result: Result<(), _> = policy
        .execute("op", || async { Err(BridgeError::HealthCheck("no".into())) })
        .await;

    assert!(result.is_err());
    // Three pauses for four attempts; none after the last.
    assert_eq!(started.elapsed(), Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn test_hung_attempt_times_out_and_is_retried() {
    let calls = Arc::new(AtomicU32::new(0));
    let policy = RetryPolicy::new(2, Duration::from_millis(100), Duration::from_secs(1));

    let counter = Arc::clone(&calls);
    let result = policy
        .execute("connect ae", move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    std::future::pending::<()>().await;
                }
                Ok("up")
            }
        })
        .await;

    assert_eq!(result.unwrap(), "up");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_all_attempts_hanging_reports_timeout() {
    let policy = RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(500));
    let err = policy
        .execute("health probe", || std::future::pending::<conectify_bridge::Result<()>>())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "timeout");
    assert_eq!(err.to_string(), "health probe timed out after 500 ms");
}
