//! Daemon RPC surface
//!
//! The orchestrator and supervisor only talk to aria2 through [`DaemonRpc`],
//! a narrow trait covering the handful of JSON-RPC methods a batch run needs.
//! [`Aria2Client`] is the HTTP implementation; tests substitute an in-memory
//! fake.

mod client;

pub use client::Aria2Client;

use crate::error::Result;
use crate::types::{JobId, JobStatus};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Page size used for `tellWaiting` and `tellStopped`
pub const POLL_PAGE_SIZE: u32 = 1000;

/// Keys requested from the daemon when polling job status
pub const STATUS_KEYS: &[&str] = &[
    "gid",
    "status",
    "totalLength",
    "completedLength",
    "errorCode",
    "errorMessage",
    "files",
];

/// Trait for talking to a running download daemon
///
/// Methods map one-to-one onto aria2 JSON-RPC calls. Implementations are
/// responsible for attaching the secret token and for retrying transient
/// transport failures; application-level faults are returned as
/// [`crate::error::RpcError::Fault`] without retry.
#[async_trait]
pub trait DaemonRpc: Send + Sync {
    /// Submit one job made of one or more mirror URLs (`aria2.addUri`)
    async fn add_uri(&self, urls: &[String], options: &AddUriOptions) -> Result<JobId>;

    /// Jobs currently downloading (`aria2.tellActive`)
    async fn tell_active(&self) -> Result<Vec<JobSnapshot>>;

    /// Queued or paused jobs (`aria2.tellWaiting`)
    async fn tell_waiting(&self, offset: i64, num: u32) -> Result<Vec<JobSnapshot>>;

    /// Completed, errored or removed jobs (`aria2.tellStopped`)
    async fn tell_stopped(&self, offset: i64, num: u32) -> Result<Vec<JobSnapshot>>;

    /// Lightweight liveness call (`aria2.getGlobalStat`)
    async fn get_global_stat(&self) -> Result<GlobalStat>;

    /// Ask the daemon to exit (`aria2.shutdown`)
    async fn shutdown(&self) -> Result<()>;
}

/// Per-job options sent with `aria2.addUri`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddUriOptions {
    /// Destination directory
    pub dir: PathBuf,
    /// Additional aria2 options, passed through verbatim
    pub extra: BTreeMap<String, String>,
}

impl AddUriOptions {
    /// Options for downloading into `dir` with resume and integrity checks on
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            extra: BTreeMap::new(),
        }
    }

    /// The options object as aria2 expects it (all values are strings)
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(
            "dir".to_string(),
            Value::String(self.dir.to_string_lossy().into_owned()),
        );
        map.insert("continue".to_string(), Value::String("true".to_string()));
        map.insert(
            "check-integrity".to_string(),
            Value::String("true".to_string()),
        );
        for (key, value) in &self.extra {
            map.insert(key.clone(), Value::String(value.clone()));
        }
        Value::Object(map)
    }
}

/// One job as reported by `tellActive`/`tellWaiting`/`tellStopped`
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    /// Daemon-assigned id
    pub gid: String,
    /// Raw aria2 status (`active`, `waiting`, `paused`, `complete`, `error`, `removed`)
    pub status: String,
    /// Total size in bytes, `0` while unknown
    #[serde(default, deserialize_with = "lenient_u64")]
    pub total_length: u64,
    /// Bytes received so far
    #[serde(default, deserialize_with = "lenient_u64")]
    pub completed_length: u64,
    /// aria2 error code (`"0"` on success)
    #[serde(default)]
    pub error_code: Option<String>,
    /// aria2 error message
    #[serde(default)]
    pub error_message: Option<String>,
    /// Output files
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

impl JobSnapshot {
    /// Status mapped onto the job lifecycle, `None` for unknown values
    pub fn job_status(&self) -> Option<JobStatus> {
        JobStatus::from_daemon(&self.status)
    }

    /// Path of the first output file, if the daemon has decided on one
    pub fn first_path(&self) -> Option<PathBuf> {
        self.files
            .first()
            .map(|f| f.path.as_str())
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    }

    /// Total size, `None` while the daemon does not know it yet
    pub fn known_total(&self) -> Option<u64> {
        (self.total_length > 0).then_some(self.total_length)
    }

    /// Human-readable failure cause for an errored job
    pub fn error_text(&self) -> String {
        if self.status == "removed" {
            return "removed from the daemon queue".to_string();
        }
        if let Some(message) = self.error_message.as_deref().map(str::trim)
            && !message.is_empty()
        {
            return message.to_string();
        }
        match self.error_code.as_deref() {
            Some(code) if !code.is_empty() && code != "0" => format!("error code {code}"),
            _ => "download failed".to_string(),
        }
    }
}

/// One entry of a job's `files` array
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct FileEntry {
    /// Local path, empty until the daemon has resolved the file name
    #[serde(default)]
    pub path: String,
}

/// Result of `aria2.getGlobalStat`
///
/// Every field is required so a half-initialised listener that answers with
/// an unrelated body is not mistaken for a ready daemon.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStat {
    /// Overall download speed in bytes/sec
    #[serde(deserialize_with = "lenient_u64")]
    pub download_speed: u64,
    /// Number of active jobs
    #[serde(deserialize_with = "lenient_u64")]
    pub num_active: u64,
    /// Number of waiting jobs
    #[serde(deserialize_with = "lenient_u64")]
    pub num_waiting: u64,
    /// Number of stopped jobs
    #[serde(deserialize_with = "lenient_u64")]
    pub num_stopped: u64,
}

/// aria2 encodes integers as strings; accept either form
fn lenient_u64<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) if s.trim().is_empty() => Ok(0),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}
