//! Core types for aria-dl

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Opaque job identifier assigned by the daemon (aria2 calls it a "gid")
///
/// Ids are never generated locally; a job only has one after the daemon
/// accepted its submission.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Create a new JobId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw gid string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl PartialEq<str> for JobId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for JobId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status of one download job
///
/// Jobs only move forward: `Queued → Active → (Completed | Errored)`.
/// `Completed` and `Errored` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted (or about to be submitted), not yet transferring
    Queued,
    /// Currently downloading
    Active,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Errored,
}

impl JobStatus {
    /// Map an aria2 status string onto the job state machine
    ///
    /// `paused` is folded into `Queued` and `removed` into `Errored`.
    /// Returns `None` for strings the daemon is not documented to send.
    pub fn from_daemon(status: &str) -> Option<Self> {
        match status {
            "waiting" | "paused" => Some(JobStatus::Queued),
            "active" => Some(JobStatus::Active),
            "complete" => Some(JobStatus::Completed),
            "error" | "removed" => Some(JobStatus::Errored),
            _ => None,
        }
    }

    /// Whether no further transitions can happen
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Errored)
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Active => 1,
            JobStatus::Completed | JobStatus::Errored => 2,
        }
    }

    /// Whether an observation of `next` is a legal forward step (or no change)
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return *self == next;
        }
        next.rank() >= self.rank()
    }

    /// Lowercase label used in logs and progress bars
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Errored => "errored",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One requested resource, possibly reachable through several mirrors
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DownloadJob {
    /// Daemon-assigned id, `None` until the submission was accepted
    pub id: Option<JobId>,
    /// Mirror URLs for the same resource, in preference order
    pub urls: Vec<String>,
    /// Current status
    pub status: JobStatus,
    /// Human-readable failure cause (only set when `Errored`)
    pub error: Option<String>,
    /// Daemon error code, when the daemon reported one
    pub error_code: Option<String>,
    /// Bytes received so far (never decreases)
    pub bytes_downloaded: u64,
    /// Total size, `None` until the daemon knows it
    pub bytes_total: Option<u64>,
    /// Path of the first output file, once the daemon reports it
    pub path: Option<PathBuf>,
}

impl DownloadJob {
    /// Create a job for a URL group that has not been submitted yet
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            id: None,
            urls,
            status: JobStatus::Queued,
            error: None,
            error_code: None,
            bytes_downloaded: 0,
            bytes_total: None,
            path: None,
        }
    }

    /// First mirror URL, used as a display fallback
    pub fn primary_url(&self) -> &str {
        self.urls.first().map(String::as_str).unwrap_or_default()
    }
}

/// Lifecycle state of the supervised daemon
///
/// `NotStarted → Starting → TcpReady → RpcReady → Running → Stopping → Stopped`,
/// with `Failed` reachable from `Starting` or `TcpReady`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SupervisorState {
    /// No process has been spawned yet
    NotStarted = 0,
    /// Process spawned, waiting for the RPC port to accept connections
    Starting = 1,
    /// RPC port accepts TCP connections
    TcpReady = 2,
    /// RPC calls are answered
    RpcReady = 3,
    /// A batch is using the daemon
    Running = 4,
    /// Shutdown in progress
    Stopping = 5,
    /// Process gone; terminal
    Stopped = 6,
    /// Readiness retries exhausted
    Failed = 7,
}

impl SupervisorState {
    /// Decode the value stored in the supervisor's atomic cell
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => SupervisorState::NotStarted,
            1 => SupervisorState::Starting,
            2 => SupervisorState::TcpReady,
            3 => SupervisorState::RpcReady,
            4 => SupervisorState::Running,
            5 => SupervisorState::Stopping,
            6 => SupervisorState::Stopped,
            _ => SupervisorState::Failed,
        }
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: SupervisorState) -> bool {
        use SupervisorState::*;
        matches!(
            (*self, next),
            (NotStarted, Starting)
                | (Starting, TcpReady)
                | (TcpReady, RpcReady)
                | (RpcReady, Running)
                | (Starting | TcpReady, Failed)
                | (NotStarted | Starting | TcpReady | RpcReady | Running | Failed, Stopping)
                | (Stopping, Stopped)
        )
    }

    /// Whether an RPC client may talk to the daemon in this state
    pub fn is_serving(&self) -> bool {
        matches!(self, SupervisorState::RpcReady | SupervisorState::Running)
    }

    /// Snake-case label used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorState::NotStarted => "not_started",
            SupervisorState::Starting => "starting",
            SupervisorState::TcpReady => "tcp_ready",
            SupervisorState::RpcReady => "rpc_ready",
            SupervisorState::Running => "running",
            SupervisorState::Stopping => "stopping",
            SupervisorState::Stopped => "stopped",
            SupervisorState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection parameters for one supervised daemon instance
///
/// The host is always the IPv4 loopback address; the RPC listener is never
/// exposed on other interfaces.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Loopback address the daemon listens on
    pub host: IpAddr,
    /// RPC port
    pub port: u16,
    /// Shared secret, if the daemon was started with one
    pub secret: Option<String>,
}

impl Endpoint {
    /// Endpoint on 127.0.0.1
    pub fn loopback(port: u16, secret: Option<String>) -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            secret,
        }
    }

    /// Socket address used by the TCP readiness check
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// JSON-RPC URL
    pub fn rpc_url(&self) -> String {
        format!("http://{}:{}/jsonrpc", self.host, self.port)
    }

    /// The `token:<secret>` parameter every call must lead with, if any
    pub fn token(&self) -> Option<String> {
        self.secret.as_ref().map(|secret| format!("token:{secret}"))
    }
}

// The secret never ends up in logs
impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Event emitted during the supervisor and batch lifecycle
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// The supervisor moved to a new state
    SupervisorStateChanged {
        /// Previous state
        from: SupervisorState,
        /// New state
        to: SupervisorState,
    },

    /// The daemon accepted a job
    JobSubmitted {
        /// Position of the job in the batch
        index: usize,
        /// Daemon-assigned id
        id: JobId,
    },

    /// The daemon rejected a job at submission time
    JobRejected {
        /// Position of the job in the batch
        index: usize,
        /// Rejection cause
        error: String,
    },

    /// Byte counters of a job changed
    JobProgress {
        /// Job id
        id: JobId,
        /// Bytes received so far
        bytes_downloaded: u64,
        /// Total size if known
        #[serde(skip_serializing_if = "Option::is_none")]
        bytes_total: Option<u64>,
    },

    /// A job finished successfully
    JobCompleted {
        /// Job id
        id: JobId,
        /// Output file, when reported
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<PathBuf>,
    },

    /// A job finished with an error
    JobFailed {
        /// Job id
        id: JobId,
        /// Failure cause
        error: String,
    },

    /// The batch was cancelled before every job finished
    BatchCancelled {
        /// Number of jobs left non-terminal
        incomplete: usize,
    },
}
