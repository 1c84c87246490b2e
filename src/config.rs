//! Configuration types for aria-dl

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Immutable configuration for one batch run
///
/// Built once from caller input (usually the command line) and never mutated
/// while a batch is in flight.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Destination directory for downloaded files (default: ".")
    #[serde(default = "default_directory")]
    pub directory: PathBuf,

    /// Maximum concurrent downloads enforced by the daemon (default: 5)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Forward daemon diagnostics at info level and keep finished progress bars
    #[serde(default)]
    pub verbose: bool,

    /// RPC shared secret (None = no secret)
    #[serde(default)]
    pub secret: Option<String>,

    /// Delay between two polls of the daemon (default: 1 second)
    #[serde(default = "default_poll_interval", with = "duration_ms_serde")]
    pub poll_interval: Duration,

    /// Draw progress bars on stderr (default: true)
    #[serde(default = "default_true")]
    pub show_progress: bool,

    /// Daemon process settings
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// RPC transport settings
    #[serde(default)]
    pub rpc: RpcConfig,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            max_concurrent: default_max_concurrent(),
            verbose: false,
            secret: None,
            poll_interval: default_poll_interval(),
            show_progress: true,
            daemon: DaemonConfig::default(),
            rpc: RpcConfig::default(),
        }
    }
}

impl BatchConfig {
    /// Check every setting, returning the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::config(
                "max_concurrent",
                "max_concurrent must be greater than zero",
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::config(
                "poll_interval",
                "poll_interval must be greater than zero",
            ));
        }
        if let Some(secret) = &self.secret
            && (secret.is_empty() || secret.chars().any(char::is_whitespace))
        {
            return Err(Error::config(
                "secret",
                "secret must be non-empty and contain no whitespace",
            ));
        }
        self.daemon.validate()?;
        self.rpc.validate()
    }
}

/// How the daemon process is located, launched and shut down
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Path to the aria2c executable (auto-detected if None)
    #[serde(default)]
    pub binary: Option<PathBuf>,

    /// Whether to search PATH for aria2c if no explicit path is set (default: true)
    #[serde(default = "default_true")]
    pub search_path: bool,

    /// Fixed RPC port (None = ephemeral port picked by the OS)
    #[serde(default)]
    pub listen_port: Option<u16>,

    /// Extra command line arguments appended after the managed ones
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Retry policy for the TCP readiness phase
    #[serde(default = "default_tcp_retry")]
    pub tcp_retry: RetryConfig,

    /// Retry policy for the RPC readiness phase
    #[serde(default = "default_rpc_retry")]
    pub rpc_retry: RetryConfig,

    /// How long to wait for the daemon to exit after the shutdown call (default: 2 seconds)
    #[serde(default = "default_shutdown_grace", with = "duration_ms_serde")]
    pub shutdown_grace: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            binary: None,
            search_path: true,
            listen_port: None,
            extra_args: Vec::new(),
            tcp_retry: default_tcp_retry(),
            rpc_retry: default_rpc_retry(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl DaemonConfig {
    fn validate(&self) -> Result<()> {
        if self.binary.is_none() && !self.search_path {
            return Err(Error::config(
                "daemon.binary",
                "no aria2c path configured and PATH search is disabled",
            ));
        }
        if self.listen_port == Some(0) {
            return Err(Error::config(
                "daemon.listen_port",
                "use None instead of 0 to request an ephemeral port",
            ));
        }
        self.tcp_retry.validate("daemon.tcp_retry")?;
        self.rpc_retry.validate("daemon.rpc_retry")
    }
}

/// JSON-RPC transport settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Per-call transport timeout (default: 10 seconds)
    #[serde(default = "default_rpc_timeout", with = "duration_ms_serde")]
    pub timeout: Duration,

    /// Retry policy for calls failing with transient errors
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout: default_rpc_timeout(),
            retry: RetryConfig::default(),
        }
    }
}

impl RpcConfig {
    fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(Error::config(
                "rpc.timeout",
                "rpc timeout must be greater than zero",
            ));
        }
        self.retry.validate("rpc.retry")
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total number of attempts, the first one included (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (default: 200 milliseconds)
    #[serde(default = "default_initial_delay", with = "duration_ms_serde")]
    pub initial_delay: Duration,

    /// Cap for the base delay between retries (default: 2 seconds)
    #[serde(default = "default_max_delay", with = "duration_ms_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Base delay to wait after the failed attempt number `attempt` (0-indexed)
    ///
    /// Computed as `initial_delay × backoff_multiplier^attempt`, clamped to
    /// `max_delay`. Pure: jitter is applied separately by the retry loop.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !secs.is_finite() || secs < 0.0 || secs > self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    fn validate(&self, key: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::config(key, "max_attempts must be at least 1"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::config(key, "backoff_multiplier must be >= 1.0"));
        }
        if self.initial_delay > self.max_delay {
            return Err(Error::config(key, "initial_delay must not exceed max_delay"));
        }
        Ok(())
    }
}

// Default value functions
fn default_directory() -> PathBuf {
    PathBuf::from(".")
}

fn default_max_concurrent() -> usize {
    5
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(2)
}

fn default_rpc_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(200)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_tcp_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 12,
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_secs(1),
        backoff_multiplier: 2.0,
        jitter: true,
    }
}

fn default_rpc_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 8,
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_millis(1500),
        backoff_multiplier: 2.0,
        jitter: true,
    }
}

// Duration serialization helper (whole milliseconds)
mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
