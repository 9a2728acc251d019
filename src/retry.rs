//! Exponential-backoff retry around a single remote call.
//!
//! Every remote operation on a [`Connection`](crate::connection::Connection)
//! goes through [`with_retry`]. Transient failures (server busy, client
//! timeout, malformed response) are retried after sleeping
//! `2^count * base`, where `count` is the connection's consecutive-failure
//! counter and `base` depends on the [`CallClass`]. Once the counter
//! reaches the ceiling the last error is returned as
//! [`RemoteError::RetryExhausted`]. Permanent errors are returned at once.
//!
//! The counter belongs to the connection, not to the call: concurrent
//! operations on one connection share it, so the delay is a best-effort
//! backpressure signal. Any success resets it to zero.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use cb_admin_core::store::StoreError;
use thiserror::Error;

use crate::config::RetryConfig;

/// Which base delay applies to a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallClass {
    /// Key-value document operations.
    Document,
    /// View queries, which fail under index pressure and need longer pauses.
    View,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub ceiling: u32,
    pub document_base: Duration,
    pub view_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            ceiling: cfg.ceiling,
            document_base: Duration::from_millis(cfg.document_base_ms),
            view_base: Duration::from_millis(cfg.view_base_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn delay(&self, class: CallClass, failures: u32) -> Duration {
        let base = match class {
            CallClass::Document => self.document_base,
            CallClass::View => self.view_base,
        };
        base.saturating_mul(1u32 << failures.min(16))
    }
}

/// Consecutive transient failures seen on one connection.
#[derive(Debug, Default)]
pub struct RetryState {
    failures: AtomicU32,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    fn record_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn reset(&self) {
        self.failures.store(0, Ordering::SeqCst);
    }
}

/// Error of a retried remote call.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{operation}: gave up after {failures} consecutive transient failures: {last}")]
    RetryExhausted {
        operation: String,
        failures: u32,
        last: StoreError,
    },
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::Store(e) if e.is_not_found())
    }

    pub fn store_error(&self) -> &StoreError {
        match self {
            RemoteError::Store(e) => e,
            RemoteError::RetryExhausted { last, .. } => last,
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or exhausts the ceiling.
///
/// `op` is re-invoked with the same captured arguments on every attempt;
/// making the remote call safe to repeat is the caller's job.
pub async fn with_retry<T, F, Fut>(
    state: &RetryState,
    policy: &RetryPolicy,
    class: CallClass,
    operation: &str,
    mut op: F,
) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    loop {
        match op().await {
            Ok(value) => {
                state.reset();
                return Ok(value);
            }
            Err(err) if err.is_transient() => {
                let failures = state.record_failure();
                if failures >= policy.ceiling {
                    tracing::error!(operation, failures, error = %err, "retry ceiling reached");
                    return Err(RemoteError::RetryExhausted {
                        operation: operation.to_string(),
                        failures,
                        last: err,
                    });
                }
                let delay = policy.delay(class, failures);
                tracing::warn!(
                    operation,
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cb_admin_core::store::ErrorCode;
    use std::sync::atomic::AtomicUsize;

    fn policy() -> RetryPolicy {
        RetryPolicy::default()
    }

    #[test]
    fn delay_doubles_per_failure() {
        let p = policy();
        assert_eq!(p.delay(CallClass::Document, 1), Duration::from_millis(100));
        assert_eq!(p.delay(CallClass::Document, 3), Duration::from_millis(400));
        assert_eq!(p.delay(CallClass::View, 1), Duration::from_millis(10_000));
    }

    #[tokio::test(start_paused = true)]
    async fn always_transient_stops_after_ceiling_attempts() {
        let state = RetryState::new();
        let attempts = AtomicUsize::new(0);

        let result: Result<(), _> = with_retry(&state, &policy(), CallClass::Document, "get k", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::new(ErrorCode::Busy, "busy")) }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 10);
        match result {
            Err(RemoteError::RetryExhausted { failures, last, .. }) => {
                assert_eq!(failures, 10);
                assert_eq!(last.code, ErrorCode::Busy);
            }
            other => panic!("expected RetryExhausted, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_then_success_resets_counter() {
        let state = RetryState::new();
        let attempts = AtomicUsize::new(0);

        let value = with_retry(&state, &policy(), CallClass::View, "query", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err(StoreError::new(ErrorCode::Timeout, "timeout"))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(state.failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_sleeps_exponentially() {
        let state = RetryState::new();
        let attempts = AtomicUsize::new(0);
        let start = tokio::time::Instant::now();

        with_retry(&state, &policy(), CallClass::Document, "upsert", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StoreError::new(ErrorCode::MalformedResponse, "bad body"))
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap();

        // 2^1 * 50ms + 2^2 * 50ms
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(350), "{:?}", elapsed);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let state = RetryState::new();
        let attempts = AtomicUsize::new(0);

        let err = with_retry(&state, &policy(), CallClass::Document, "remove", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(StoreError::not_found("k")) }
        })
        .await
        .unwrap_err();

        assert!(err.is_not_found());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(state.failures(), 0);
    }
}
