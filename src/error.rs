//! Error types for aria-dl
//!
//! This module provides the error hierarchy for the library:
//! - [`Error`], the top-level type returned by every fallible operation
//! - [`StartupError`], raised when the daemon never becomes ready
//! - [`RpcError`], application-level failures reported over JSON-RPC
//!
//! Only a [`StartupError`] aborts a batch run. Everything else is captured at
//! the job level and aggregated into the batch report.

use crate::types::SupervisorState;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for aria-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Process exit code for a batch where every job completed
pub const EXIT_SUCCESS: u8 = 0;

/// Process exit code for a batch with errored or incomplete jobs
pub const EXIT_FAILURE: u8 = 1;

/// Process exit code when the daemon never became ready
pub const EXIT_STARTUP_FAILURE: u8 = 2;

/// Main error type for aria-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "max_concurrent")
        key: Option<String>,
    },

    /// The daemon could not be started or never became ready
    #[error("daemon startup failed: {0}")]
    Startup(#[from] StartupError),

    /// The daemon answered an RPC call with an error
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport-level HTTP error (connect failure, timeout, broken body)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Operation not permitted in the supervisor's current state
    #[error("cannot {operation} while supervisor is {state}")]
    InvalidState {
        /// The operation that was attempted (e.g., "start")
        operation: &'static str,
        /// The state that prevented it
        state: SupervisorState,
    },
}

impl Error {
    /// Exit code a command line front-end should use when a run fails with this error
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::Startup(_) => EXIT_STARTUP_FAILURE,
            _ => EXIT_FAILURE,
        }
    }

    /// Shorthand for a configuration error bound to a key
    pub(crate) fn config(key: &str, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }
}

/// Errors raised while launching the daemon and waiting for it to become ready
#[derive(Debug, Error)]
pub enum StartupError {
    /// The daemon executable could not be located
    #[error("aria2c executable is required but was not found: {0}")]
    BinaryNotFound(String),

    /// The download directory could not be created
    #[error("cannot create download directory {}: {source}", path.display())]
    Directory {
        /// The directory the daemon was to download into
        path: PathBuf,
        /// The underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// The private config file carrying the RPC secret could not be written
    #[error("cannot write daemon config file: {0}")]
    ConfigFile(#[source] std::io::Error),

    /// No loopback port could be reserved for the RPC listener
    #[error("failed to reserve a loopback port: {0}")]
    NoPort(#[source] std::io::Error),

    /// The process could not be spawned at all
    #[error("failed to spawn {}: {source}", binary.display())]
    Spawn {
        /// The executable that failed to spawn
        binary: PathBuf,
        /// The underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// The process exited before it began accepting connections
    #[error("aria2c exited early ({status}) on port {port}: {stderr}")]
    ExitedEarly {
        /// The RPC port the daemon was asked to listen on
        port: u16,
        /// Exit status as reported by the OS
        status: String,
        /// Last lines the daemon wrote to stderr
        stderr: String,
    },

    /// The RPC port never accepted a TCP connection
    #[error("aria2c not accepting TCP on port {port} after {attempts} attempts: {source}")]
    TcpNotReady {
        /// The RPC port that was checked
        port: u16,
        /// Number of connection attempts made
        attempts: u32,
        /// The last connection error
        #[source]
        source: std::io::Error,
    },

    /// The RPC port accepted connections but never answered a readiness call
    #[error("aria2c RPC not responding on port {port} after {attempts} attempts: {source}")]
    RpcNotReady {
        /// The RPC port that was checked
        port: u16,
        /// Number of readiness calls made
        attempts: u32,
        /// The last RPC error
        #[source]
        source: Box<Error>,
    },

    /// A concurrent stop interrupted the startup sequence
    #[error("startup interrupted: supervisor moved to {state}")]
    Interrupted {
        /// The state observed when startup tried to advance
        state: SupervisorState,
    },
}

/// Application-level RPC failures
#[derive(Debug, Error)]
pub enum RpcError {
    /// The daemon returned a JSON-RPC error object
    #[error("{method} failed with code {code}: {message}")]
    Fault {
        /// The RPC method that was called
        method: String,
        /// JSON-RPC error code
        code: i64,
        /// Error message from the daemon
        message: String,
    },

    /// The daemon answered with a non-success HTTP status and no JSON-RPC body
    #[error("{method} returned HTTP {status}")]
    Http {
        /// The RPC method that was called
        method: String,
        /// HTTP status code
        status: u16,
    },

    /// The response body was not a well-formed JSON-RPC response
    #[error("malformed {method} response: {reason}")]
    Malformed {
        /// The RPC method that was called
        method: String,
        /// What was wrong with the response
        reason: String,
    },
}
