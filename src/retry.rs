//! Retry logic with exponential backoff
//!
//! Used by both readiness phases of the supervisor and by every RPC call.
//! The base delay is a pure function of the attempt number
//! ([`RetryConfig::delay_for`]); jitter is layered on top and never fed back
//! into the next calculation.
//!
//! # Example
//!
//! ```no_run
//! use aria_dl::retry::{IsRetryable, with_retry};
//! use aria_dl::config::RetryConfig;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{self:?}")
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # async fn example() -> Result<(), MyError> {
//! let config = RetryConfig::default();
//! with_retry(&config, || async { Ok::<_, MyError>(()) }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{Error, RpcError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (connection refused, timeouts, resets) return `true`.
/// Application-level failures (the daemon rejected a URL, bad secret) return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Network(e) => e.is_timeout() || e.is_connect(),
            Error::Io(e) => is_transient_io(e),
            // Gateway-style statuses from something sitting in front of the daemon
            Error::Rpc(RpcError::Http { status, .. }) => matches!(status, 502..=504),
            Error::Rpc(RpcError::Fault { .. } | RpcError::Malformed { .. }) => false,
            Error::Startup(_) => false,
            Error::Config { .. } => false,
            Error::InvalidState { .. } => false,
        }
    }
}

/// Connection-level I/O error kinds worth another attempt
pub(crate) fn is_transient_io(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::Interrupted
    )
}

/// Execute an async operation with exponential backoff, sleeping on the tokio timer
///
/// Returns the first success, the first non-retryable error, or the last
/// error once `config.max_attempts` attempts have been made.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    with_retry_using(config, tokio::time::sleep, operation).await
}

/// Same as [`with_retry`] with an injected sleep function
///
/// Tests pass a recording sleeper so backoff behaviour can be checked without
/// waiting on the clock.
pub async fn with_retry_using<S, SFut, F, Fut, T, E>(
    config: &RetryConfig,
    sleep: S,
    operation: F,
) -> Result<T, E>
where
    S: FnMut(Duration) -> SFut,
    SFut: Future<Output = ()>,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    retry_loop(config, sleep, E::is_retryable, operation).await
}

/// Execute an async operation with exponential backoff, retrying only errors
/// accepted by `retryable`
///
/// Used for calls that are not safe to repeat on every transient failure,
/// such as job submission.
pub async fn with_retry_if<P, F, Fut, T, E>(
    config: &RetryConfig,
    retryable: P,
    operation: F,
) -> Result<T, E>
where
    P: Fn(&E) -> bool,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_loop(config, tokio::time::sleep, retryable, operation).await
}

/// Whether the request provably never reached the daemon
///
/// Only a failed connection qualifies. A timeout after connecting may mean
/// the daemon acted on the call and the reply got lost.
pub fn is_undelivered(error: &Error) -> bool {
    match error {
        Error::Network(e) => e.is_connect(),
        Error::Io(e) => e.kind() == std::io::ErrorKind::ConnectionRefused,
        _ => false,
    }
}

async fn retry_loop<S, SFut, P, F, Fut, T, E>(
    config: &RetryConfig,
    mut sleep: S,
    retryable: P,
    mut operation: F,
) -> Result<T, E>
where
    S: FnMut(Duration) -> SFut,
    SFut: Future<Output = ()>,
    P: Fn(&E) -> bool,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt: u32 = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::debug!(attempts = attempt + 1, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if retryable(&e) && attempt + 1 < config.max_attempts => {
                let delay = config.delay_for(attempt);
                let delay = if config.jitter {
                    add_jitter(delay)
                } else {
                    delay
                };
                attempt += 1;

                tracing::debug!(
                    error = %e,
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis(),
                    "operation failed, retrying"
                );

                sleep(delay).await;
            }
            Err(e) => {
                if retryable(&e) {
                    tracing::warn!(
                        error = %e,
                        attempts = attempt + 1,
                        "operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::debug!(error = %e, "operation failed with non-retryable error");
                }
                return Err(e);
            }
        }
    }
}

/// Add random jitter to a delay to prevent synchronized retries
///
/// Jitter is uniformly distributed between 0% and 100% of the delay, so the
/// result lies between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}
