//! Retry combinator shared by every external client and stage task.
//!
//! One policy covers them all: bounded attempts, exponential backoff with
//! optional jitter, and a caller-supplied classification of which errors
//! are worth retrying. Rate-limited errors can carry their own server-
//! mandated delay, which overrides the backoff.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// How an error should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Transient: retry with exponential backoff.
    Retryable,
    /// Rate limited: retry after the given server-mandated delay.
    RetryAfter(Duration),
    /// Permanent: give up immediately.
    Fatal,
}

/// Retry policy: attempt count, base delay, cap, jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            jitter: true,
        }
    }

    /// Backoff delay before the given retry (0-indexed attempt that just
    /// failed): base * 2^attempt, capped, with up to 25% random jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        if !self.jitter {
            return exp;
        }
        let jitter_ms = (exp.as_millis() as u64) / 4;
        if jitter_ms == 0 {
            return exp;
        }
        let extra = rand::thread_rng().gen_range(0..=jitter_ms);
        exp + Duration::from_millis(extra)
    }
}

/// Run `operation` until it succeeds, the classification says fatal, or the
/// attempt budget runs out. The operation receives the 0-indexed attempt
/// number.
pub async fn retry_with_policy<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    classify: C,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryClass,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let class = classify(&error);
                let last_attempt = attempt + 1 >= policy.max_attempts;
                if class == RetryClass::Fatal || last_attempt {
                    return Err(error);
                }
                let delay = match class {
                    RetryClass::RetryAfter(delay) => delay,
                    _ => policy.delay_for_attempt(attempt),
                };
                tracing::warn!(
                    "attempt {}/{} failed ({}), retrying in {:?}",
                    attempt + 1,
                    policy.max_attempts,
                    error,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(8),
            jitter: false,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(
            3,
            Duration::from_millis(100),
            Duration::from_secs(30),
        );
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(125));
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> =
            retry_with_policy(&no_jitter(), |_| RetryClass::Retryable, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err("transient".to_string())
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_errors_do_not_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> =
            retry_with_policy(&no_jitter(), |_| RetryClass::Fatal, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("bad request".to_string()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_budget_exhausted() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> =
            retry_with_policy(&no_jitter(), |_| RetryClass::Retryable, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("down".to_string()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_after_delay_is_honoured() {
        let start = std::time::Instant::now();
        let _: Result<(), String> = retry_with_policy(
            &no_jitter(),
            |_| RetryClass::RetryAfter(Duration::from_millis(30)),
            |_| async { Err("429".to_string()) },
        )
        .await;
        // Two sleeps of 30ms each before giving up on the third attempt
        assert!(start.elapsed() >= Duration::from_millis(60));
    }
}
