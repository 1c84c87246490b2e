//! # aria-dl
//!
//! Embedded download orchestration on top of an aria2c child process.
//!
//! ## Design Philosophy
//!
//! aria-dl is designed to be:
//! - **Self-contained per run** - Each batch launches its own daemon on an ephemeral loopback port and tears it down afterwards
//! - **Strict about readiness** - A daemon is only used once it accepts TCP *and* answers RPC
//! - **Failure-tolerant** - A bad URL fails its own job, never the batch
//! - **Event-driven** - Consumers can subscribe to supervisor and job events
//!
//! ## Quick Start
//!
//! ```no_run
//! use aria_dl::{BatchConfig, DownloadOrchestrator, ProcessSupervisor, parse_sources};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BatchConfig {
//!         directory: "downloads".into(),
//!         max_concurrent: 3,
//!         ..Default::default()
//!     };
//!
//!     let sources = parse_sources("https://example.com/a.iso\n# comment\n".as_bytes())?;
//!
//!     let supervisor = ProcessSupervisor::new(config.daemon.clone(), config.rpc.clone());
//!     let orchestrator = DownloadOrchestrator::new(config, supervisor);
//!
//!     // Subscribe to events
//!     let mut events = orchestrator.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let report = orchestrator.run(sources.groups, CancellationToken::new()).await?;
//!     print!("{}", report.render_summary());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Batch orchestration: submission, polling, reconciliation
pub mod orchestrator;
/// Batch outcome reporting
pub mod report;
/// Retry logic with exponential backoff
pub mod retry;
/// Daemon JSON-RPC surface and HTTP client
pub mod rpc;
/// URL list parsing
pub mod sources;
/// Daemon process supervision
pub mod supervisor;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::{BatchConfig, DaemonConfig, RetryConfig, RpcConfig};
pub use error::{Error, Result, RpcError, StartupError};
pub use orchestrator::DownloadOrchestrator;
pub use report::{BatchReport, JobOutcome, JobReport};
pub use rpc::{Aria2Client, DaemonRpc};
pub use sources::{ParsedSources, parse_sources, read_sources};
pub use supervisor::{ProcessSupervisor, StartRequest, Supervise};
pub use types::{DownloadJob, Endpoint, Event, JobId, JobStatus, SupervisorState};

use tokio_util::sync::CancellationToken;

/// Cancel `cancel` when the process receives a termination signal.
///
/// Returns early, without cancelling, once `cancel` is cancelled by someone
/// else, so it can be spawned alongside a batch and left to finish on its own.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use aria_dl::cancel_on_signal;
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() {
/// let cancel = CancellationToken::new();
/// tokio::spawn(cancel_on_signal(cancel.clone()));
/// # }
/// ```
pub async fn cancel_on_signal(cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = wait_for_signal() => {
            tracing::warn!("interrupted, cancelling batch and stopping aria2c");
            cancel.cancel();
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
