//! Fixed-interval retry gated by a relevance check.

use crate::error::{SyncError, SyncResult};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Runs `operation` until it succeeds or the caller stops caring.
///
/// Relevance is checked before every attempt and again after a success. A
/// failed attempt is logged and retried after `interval`, with no attempt
/// limit, except that a decode error is returned at once. An operation
/// already in flight is never interrupted; if the caller lost interest
/// meanwhile its result is discarded and `Cancelled` returned.
pub async fn retry<T, F, Fut>(
    interval: Duration,
    mut is_relevant: impl FnMut() -> bool,
    mut operation: F,
) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let mut attempt: u64 = 0;
    loop {
        if !is_relevant() {
            debug!(attempt, "retry cancelled before attempt");
            return Err(SyncError::Cancelled);
        }

        attempt += 1;
        match operation().await {
            Ok(value) if is_relevant() => return Ok(value),
            Ok(_) => {
                debug!(attempt, "result discarded, no longer relevant");
                return Err(SyncError::Cancelled);
            }
            Err(err) if err.is_decode() => {
                warn!(attempt, error = %err, "undecodable response, giving up");
                return Err(err);
            }
            Err(err) => {
                warn!(attempt, error = %err, retryable = err.is_retryable(),
                    delay_ms = interval.as_millis() as u64, "operation failed, retrying");
                tokio::time::sleep(interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use suitesync_protocol::{ApiErrorKind, ProtocolError};
    use tokio::time::Instant;

    const INTERVAL: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn irrelevant_before_start_never_invokes() {
        let calls = AtomicUsize::new(0);
        let result: SyncResult<()> = retry(INTERVAL, || false, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;

        assert_eq!(result, Err(SyncError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_two_waits() {
        let calls = AtomicUsize::new(0);
        let start = Instant::now();

        let result = retry(INTERVAL, || true, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(SyncError::transport_retryable("connection refused"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), INTERVAL * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn decode_error_ends_retrying() {
        let calls = AtomicUsize::new(0);
        let start = Instant::now();

        let result: SyncResult<()> = retry(INTERVAL, || true, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProtocolError::decoding_failed("expected value at line 1").into()) }
        })
        .await;

        assert!(result.unwrap_err().is_decode());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn success_discarded_when_interest_lost() {
        let mounted = Arc::new(AtomicBool::new(true));
        let flag = mounted.clone();

        let result = retry(
            INTERVAL,
            || mounted.load(Ordering::SeqCst),
            || {
                flag.store(false, Ordering::SeqCst);
                async { Ok("page") }
            },
        )
        .await;

        assert_eq!(result, Err(SyncError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_retrying_once_unmounted() {
        let mounted = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(AtomicUsize::new(0));

        let task = {
            let mounted = mounted.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                retry(
                    INTERVAL,
                    || mounted.load(Ordering::SeqCst),
                    || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async { Err::<(), _>(SyncError::api(ApiErrorKind::Unknown, "fetch")) }
                    },
                )
                .await
            })
        };

        tokio::time::sleep(INTERVAL * 3 + Duration::from_secs(1)).await;
        mounted.store(false, Ordering::SeqCst);
        let result = task.await.unwrap();

        assert_eq!(result, Err(SyncError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
