//! Utility functions for minicatalog

use std::time::Duration;

/// Random duration in `[base, 2 * base)`.
pub fn jittered(base: Duration) -> Duration {
    let millis = base.as_millis().max(1) as u64;
    base + Duration::from_millis(rand::random::<u64>() % millis)
}

/// Retry with exponential backoff.
///
/// Only retryable errors are retried; the last error is returned once the
/// attempts are exhausted.
pub async fn retry_with_backoff<F, Fut, T>(
    f: F,
    max_retries: usize,
    initial_delay: Duration,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    retry_with_backoff_while(f, max_retries, initial_delay, crate::Error::is_retryable).await
}

/// Like [`retry_with_backoff`], retrying only errors accepted by `retry`.
pub async fn retry_with_backoff_while<F, Fut, T, P>(
    mut f: F,
    max_retries: usize,
    initial_delay: Duration,
    retry: P,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
    P: Fn(&crate::Error) -> bool,
{
    let mut delay = initial_delay;
    let attempts = max_retries.max(1);

    for attempt in 1..=attempts {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if retry(&e) && attempt < attempts => {
                tracing::debug!(
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(2));
            }
            Err(e) => return Err(e),
        }
    }

    Err(crate::Error::Internal("retry loop exited without a result".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_jittered_range() {
        let base = Duration::from_millis(100);
        for _ in 0..100 {
            let d = jittered(base);
            assert!(d >= base && d < base * 2);
        }
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = AtomicUsize::new(0);
        let result = retry_with_backoff(
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::NotPrimary(None))
                } else {
                    Ok(7)
                }
            },
            5,
            Duration::from_millis(1),
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_permanent_error() {
        let calls = AtomicUsize::new(0);
        let result: crate::Result<()> = retry_with_backoff(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::InvalidArgument("bad".into()))
            },
            5,
            Duration::from_millis(1),
        )
        .await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_returns_last_error() {
        let result: crate::Result<()> = retry_with_backoff(
            || async { Err(Error::Timeout("majority".into())) },
            3,
            Duration::from_millis(1),
        )
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }
}
