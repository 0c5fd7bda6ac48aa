//! Retry helper for backend operations.
//!
//! Retries are never implicit: an operation is repeated only as often as the
//! caller's [`RetryPolicy`] allows, and every failed attempt is logged.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

use netemu_shared::RetryPolicy;

/// Longest wait between two attempts
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

fn next_delay(delay: Duration, multiplier: f32) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * f64::from(multiplier))
        .unwrap_or(MAX_RETRY_DELAY)
        .min(MAX_RETRY_DELAY)
}

/// Retry with exponential backoff, returning the last error once attempts run out.
pub async fn retry_async<F, Fut, T, E>(
    mut operation: F,
    policy: &RetryPolicy,
    operation_name: &str,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut delay = policy.initial_delay;
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        "Operation '{}' succeeded after {} attempts",
                        operation_name, attempt
                    );
                }
                return Ok(result);
            }
            Err(err) if attempt < max_attempts => {
                warn!(
                    "Operation '{}' failed on attempt {}/{}: {}",
                    operation_name, attempt, max_attempts, err
                );
                debug!("Retrying '{}' in {:?}", operation_name, delay);
                tokio::time::sleep(delay).await;
                delay = next_delay(delay, policy.backoff_multiplier);
                attempt += 1;
            }
            Err(err) => {
                if max_attempts > 1 {
                    error!(
                        "Operation '{}' failed after {} attempts: {}",
                        operation_name, max_attempts, err
                    );
                }
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::attempts(max_attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_single_attempt_by_default() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), String> = retry_async(
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("refused".to_string())
            },
            &RetryPolicy::default(),
            "connect",
        )
        .await;

        assert_eq!(result.unwrap_err(), "refused");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_succeeds_after_retries() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<u32, String> = retry_async(
            move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 { Err(format!("attempt {}", n)) } else { Ok(n) }
            },
            &policy(5),
            "connect",
        )
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_next_delay_is_bounded() {
        let base = Duration::from_millis(100);
        assert_eq!(next_delay(base, 2.0), Duration::from_millis(200));
        assert_eq!(next_delay(base, 1e30), MAX_RETRY_DELAY);
        assert_eq!(next_delay(base, f32::INFINITY), MAX_RETRY_DELAY);
        assert_eq!(next_delay(base, f32::NAN), MAX_RETRY_DELAY);
        assert_eq!(next_delay(base, -1.0), MAX_RETRY_DELAY);
        assert_eq!(next_delay(MAX_RETRY_DELAY, 2.0), MAX_RETRY_DELAY);
    }

    #[tokio::test]
    async fn test_unchecked_multiplier_does_not_panic() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let mut retry = policy(2);
        retry.backoff_multiplier = -1.0;
        let result: Result<u32, String> = retry_async(
            move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 2 { Err("refused".to_string()) } else { Ok(n) }
            },
            &retry,
            "connect",
        )
        .await;

        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_returns_last_error() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), String> = retry_async(
            move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Err(format!("attempt {}", n))
            },
            &policy(3),
            "connect",
        )
        .await;

        assert_eq!(result.unwrap_err(), "attempt 3");
    }
}
