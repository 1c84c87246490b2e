//! Daemon launch helpers: binary discovery, port reservation, arguments and
//! output forwarding.

use super::StartRequest;
use crate::config::DaemonConfig;
use crate::error::StartupError;
use std::collections::VecDeque;
use std::io::Write;
use std::net::{Ipv4Addr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;

/// Default executable name looked up on PATH
pub(crate) const DEFAULT_BINARY: &str = "aria2c";

/// Number of stderr lines kept for startup error messages
const TAIL_LINES: usize = 20;

/// How long to wait for output forwarders to drain after the daemon exited
const OUTPUT_SETTLE: Duration = Duration::from_millis(500);

/// Locate the aria2c executable
///
/// An explicitly configured path wins (bare names are looked up on PATH);
/// otherwise PATH is searched for `aria2c` if allowed.
pub(crate) fn resolve_binary(config: &DaemonConfig) -> Result<PathBuf, StartupError> {
    if let Some(path) = &config.binary {
        return which::which(path)
            .map_err(|e| StartupError::BinaryNotFound(format!("{}: {e}", path.display())));
    }

    if config.search_path {
        return which::which(DEFAULT_BINARY)
            .map_err(|e| StartupError::BinaryNotFound(format!("{DEFAULT_BINARY} on PATH: {e}")));
    }

    Err(StartupError::BinaryNotFound(
        "no path configured and PATH search disabled".to_string(),
    ))
}

/// Ask the OS for a free loopback port
///
/// The listener is dropped before the daemon binds, so another process could
/// grab the port in between; the daemon then exits early and startup reports it.
pub(crate) fn reserve_port() -> Result<u16, StartupError> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).map_err(StartupError::NoPort)?;
    let port = listener.local_addr().map_err(StartupError::NoPort)?.port();
    drop(listener);
    Ok(port)
}

/// Write the RPC secret into a private config file for `--conf-path`
///
/// The file is created owner-only (0600 on unix) and removed when the
/// returned handle is dropped.
pub(crate) fn write_secret_file(secret: &str) -> Result<NamedTempFile, StartupError> {
    let mut file = tempfile::Builder::new()
        .prefix("aria-dl-")
        .suffix(".conf")
        .tempfile()
        .map_err(StartupError::ConfigFile)?;
    writeln!(file, "rpc-secret={secret}").map_err(StartupError::ConfigFile)?;
    file.flush().map_err(StartupError::ConfigFile)?;
    Ok(file)
}

/// Command line for one daemon run
///
/// The secret never appears here; it reaches the daemon through `conf_path`.
pub(crate) fn daemon_args(
    request: &StartRequest,
    port: u16,
    conf_path: Option<&Path>,
    extra: &[String],
) -> Vec<String> {
    let mut args = vec![
        "--enable-rpc=true".to_string(),
        "--rpc-listen-all=false".to_string(),
        format!("--rpc-listen-port={port}"),
        "--continue=true".to_string(),
        "--check-integrity=true".to_string(),
        format!("--max-concurrent-downloads={}", request.max_concurrent),
        format!("--dir={}", request.directory.display()),
    ];
    if let Some(path) = conf_path {
        args.push(format!("--conf-path={}", path.display()));
    }
    args.extend(extra.iter().cloned());
    args
}

/// Rolling buffer of the daemon's most recent stderr lines
#[derive(Clone, Debug, Default)]
pub(crate) struct OutputTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl OutputTail {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Buffered lines joined into one string for an error message
    pub(crate) fn render(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.is_empty() {
            "(no output)".to_string()
        } else {
            lines.iter().cloned().collect::<Vec<_>>().join("; ")
        }
    }
}

/// Forward the child's stdout and stderr into `tracing` under target `aria2c`
pub(crate) fn forward_output(child: &mut Child, verbose: bool) -> (OutputTail, Vec<JoinHandle<()>>) {
    let tail = OutputTail::default();
    let mut handles = Vec::with_capacity(2);

    if let Some(stdout) = child.stdout.take() {
        handles.push(tokio::spawn(forward_lines(stdout, "stdout", verbose, None)));
    }
    if let Some(stderr) = child.stderr.take() {
        handles.push(tokio::spawn(forward_lines(
            stderr,
            "stderr",
            verbose,
            Some(tail.clone()),
        )));
    }

    (tail, handles)
}

/// Wait (bounded) for forwarders to reach end of stream
pub(crate) async fn settle_output(handles: &mut Vec<JoinHandle<()>>) {
    let pending = handles.drain(..).collect::<Vec<_>>();
    if pending.is_empty() {
        return;
    }
    if tokio::time::timeout(OUTPUT_SETTLE, futures::future::join_all(pending))
        .await
        .is_err()
    {
        tracing::debug!("daemon output still open after exit, not waiting further");
    }
}

async fn forward_lines<R>(reader: R, stream: &'static str, verbose: bool, tail: Option<OutputTail>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                if verbose {
                    tracing::info!(target: "aria2c", stream, "{line}");
                } else {
                    tracing::debug!(target: "aria2c", stream, "{line}");
                }
                if let Some(tail) = &tail {
                    tail.push(line.to_string());
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(target: "aria2c", stream, error = %e, "stopped reading daemon output");
                break;
            }
        }
    }
}
