//! Retry with exponential backoff and jitter

use std::future::Future;
use std::time::Duration;

use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;

/// How many times to try an operation and how long to wait between tries
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: usize,
    /// Delay before the second attempt; doubles after each failure
    pub initial_backoff: Duration,
    /// Upper bound on a single delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delays between attempts: initial * 2^n scaled by a jitter factor in [0.5, 1.0)
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let initial_ms = self.initial_backoff.as_millis().max(1) as u64;
        ExponentialBackoff::from_millis(2)
            .factor(initial_ms)
            .max_delay(self.max_backoff * 2)
            .map(|d| d / 2)
            .map(jitter)
            .take(self.max_attempts.saturating_sub(1))
    }
}

fn jitter(delay: Duration) -> Duration {
    delay.mul_f64(0.5 + rand::random::<f64>() * 0.5)
}

/// Run `operation` until it succeeds or the policy's attempts are used up.
/// Returns the last error on exhaustion.
pub async fn with_backoff<T, E, F, Fut>(policy: RetryPolicy, label: &str, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0usize;
    Retry::spawn(policy.delays(), || {
        attempt += 1;
        let current = attempt;
        let fut = operation();
        async move {
            let result = fut.await;
            if let Err(e) = &result {
                tracing::warn!(
                    operation = %label,
                    attempt = current,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "Attempt failed"
                );
            }
            result
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_default_policy_delays() {
        let delays: Vec<Duration> = RetryPolicy::default().delays().collect();
        assert_eq!(delays.len(), 2);
        assert!(delays[0] >= Duration::from_millis(500));
        assert!(delays[0] < Duration::from_millis(1000));
        assert!(delays[1] >= Duration::from_millis(1000));
        assert!(delays[1] < Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn test_stops_after_max_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result: Result<(), String> = with_backoff(fast_policy(), "always_fails", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err("boom".to_string())
            }
        })
        .await;

        assert_eq!(result.unwrap_err(), "boom");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_returns_first_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result: Result<usize, String> = with_backoff(fast_policy(), "flaky", || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 2 {
                    Err("not yet".to_string())
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
