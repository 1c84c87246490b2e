//! Two-phase readiness probing
//!
//! Phase one waits for the RPC port to accept a TCP connection. Phase two
//! waits for a well-formed `aria2.getGlobalStat` answer. Both phases use the
//! shared retry loop with their own bounded policy, and neither is allowed to
//! stand in for the other.

use crate::config::RetryConfig;
use crate::error::{Error, RpcError, StartupError};
use crate::retry::{IsRetryable, with_retry};
use crate::rpc::GlobalStat;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;

/// Upper bound for a single TCP connect attempt
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Why the TCP phase gave up
#[derive(Debug)]
pub(crate) enum TcpWaitFailure {
    /// The daemon process exited; carries its exit status
    Exited(String),
    /// Every attempt failed to connect
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Last connection error
        source: io::Error,
    },
}

#[derive(Debug)]
enum TcpAttempt {
    Exited(String),
    Connect(io::Error),
}

impl std::fmt::Display for TcpAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TcpAttempt::Exited(status) => write!(f, "daemon exited ({status})"),
            TcpAttempt::Connect(e) => write!(f, "connect failed: {e}"),
        }
    }
}

impl IsRetryable for TcpAttempt {
    fn is_retryable(&self) -> bool {
        matches!(self, TcpAttempt::Connect(_))
    }
}

/// Wait until `addr` accepts a TCP connection
///
/// `exit_status` is checked before every attempt and returns the exit status
/// once the daemon process is gone, which ends the wait immediately.
/// Returns the number of attempts used.
pub(crate) async fn wait_for_tcp<F>(
    addr: SocketAddr,
    policy: &RetryConfig,
    mut exit_status: F,
) -> Result<u32, TcpWaitFailure>
where
    F: FnMut() -> Option<String>,
{
    let mut attempts = 0u32;

    let outcome = with_retry(policy, || {
        attempts += 1;
        let exited = exit_status();
        async move {
            if let Some(status) = exited {
                return Err(TcpAttempt::Exited(status));
            }
            match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(_stream)) => Ok(()),
                Ok(Err(e)) => Err(TcpAttempt::Connect(e)),
                Err(_) => Err(TcpAttempt::Connect(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {addr} timed out"),
                ))),
            }
        }
    })
    .await;

    match outcome {
        Ok(()) => Ok(attempts),
        Err(TcpAttempt::Exited(status)) => Err(TcpWaitFailure::Exited(status)),
        Err(TcpAttempt::Connect(source)) => Err(TcpWaitFailure::Exhausted { attempts, source }),
    }
}

#[derive(Debug)]
struct RpcAttempt(Error);

impl std::fmt::Display for RpcAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// A listener that is still initialising may refuse, time out or answer with
// garbage; only an explicit JSON-RPC fault (e.g. wrong secret) is final.
impl IsRetryable for RpcAttempt {
    fn is_retryable(&self) -> bool {
        !matches!(self.0, Error::Rpc(RpcError::Fault { .. }))
    }
}

/// Wait until `check` returns a well-formed global stat
///
/// Returns the number of attempts used.
pub(crate) async fn wait_for_rpc<F, Fut>(
    port: u16,
    policy: &RetryConfig,
    mut check: F,
) -> Result<u32, StartupError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = crate::error::Result<GlobalStat>>,
{
    let mut attempts = 0u32;

    let outcome = with_retry(policy, || {
        attempts += 1;
        let call = check();
        async move { call.await.map_err(RpcAttempt) }
    })
    .await;

    match outcome {
        Ok(stat) => {
            tracing::debug!(port, attempts, active = stat.num_active, "daemon answered RPC");
            Ok(attempts)
        }
        Err(RpcAttempt(source)) => Err(StartupError::RpcNotReady {
            port,
            attempts,
            source: Box::new(source),
        }),
    }
}
