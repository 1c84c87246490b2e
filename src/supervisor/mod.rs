//! Daemon process supervision
//!
//! [`ProcessSupervisor`] owns the aria2c child process and its endpoint for
//! exactly one run. State lives in an atomic cell so [`Supervise::state`]
//! never blocks, and every transition goes through a compare-and-swap that
//! refuses to skip a readiness phase.
//!
//! # Example
//!
//! ```no_run
//! use aria_dl::config::BatchConfig;
//! use aria_dl::supervisor::{ProcessSupervisor, StartRequest, Supervise};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BatchConfig::default();
//! let supervisor = ProcessSupervisor::new(config.daemon.clone(), config.rpc.clone());
//!
//! let endpoint = supervisor.start(&StartRequest::from(&config)).await?;
//! println!("aria2c listening on {}", endpoint.rpc_url());
//!
//! supervisor.stop().await?;
//! # Ok(())
//! # }
//! ```

mod launch;
mod readiness;

use crate::config::{BatchConfig, DaemonConfig, RpcConfig};
use crate::error::{Error, Result, StartupError};
use crate::rpc::{Aria2Client, DaemonRpc};
use crate::types::{Endpoint, Event, SupervisorState};
use async_trait::async_trait;
use launch::OutputTail;
use readiness::TcpWaitFailure;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;

/// How long to wait after SIGTERM before killing
const TERM_GRACE: Duration = Duration::from_secs(1);

/// How long to wait for the OS to reap a killed process
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Parameters for one daemon launch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StartRequest {
    /// Destination directory, created if missing
    pub directory: PathBuf,
    /// Daemon-side concurrency limit (must be at least 1)
    pub max_concurrent: usize,
    /// RPC secret, if any
    pub secret: Option<String>,
    /// Forward daemon output at info level instead of debug
    pub verbose: bool,
}

impl From<&BatchConfig> for StartRequest {
    fn from(config: &BatchConfig) -> Self {
        Self {
            directory: config.directory.clone(),
            max_concurrent: config.max_concurrent,
            secret: config.secret.clone(),
            verbose: config.verbose,
        }
    }
}

/// Lifecycle control over a download daemon
///
/// The orchestrator only depends on this trait, so batch logic can be tested
/// without spawning a process.
#[async_trait]
pub trait Supervise: Send + Sync {
    /// Launch the daemon and wait until it answers RPC calls
    ///
    /// # Errors
    ///
    /// Returns [`Error::Startup`] if the daemon cannot be launched or never
    /// becomes ready, and [`Error::InvalidState`] if called twice.
    async fn start(&self, request: &StartRequest) -> Result<Endpoint>;

    /// Shut the daemon down; idempotent and never fails in practice
    async fn stop(&self) -> Result<()>;

    /// Current lifecycle state (lock-free)
    fn state(&self) -> SupervisorState;

    /// RPC client for the running daemon, moving `RpcReady` to `Running`
    fn client(&self) -> Result<Arc<dyn DaemonRpc>>;
}

struct RunningDaemon {
    child: Child,
    endpoint: Endpoint,
    tail: OutputTail,
    forwarders: Vec<JoinHandle<()>>,
    /// Holds the secret for `--conf-path`; deleted when the daemon is dropped
    conf_file: Option<tempfile::NamedTempFile>,
}

/// Supervisor for a real aria2c child process
pub struct ProcessSupervisor {
    config: DaemonConfig,
    rpc_config: RpcConfig,
    state: AtomicU8,
    client: OnceLock<Arc<Aria2Client>>,
    daemon: Mutex<Option<RunningDaemon>>,
    event_tx: broadcast::Sender<Event>,
}

impl ProcessSupervisor {
    /// Create a supervisor; nothing is spawned until [`Supervise::start`]
    pub fn new(config: DaemonConfig, rpc_config: RpcConfig) -> Self {
        let (event_tx, _rx) = broadcast::channel(256);
        Self::with_event_sender(config, rpc_config, event_tx)
    }

    /// Create a supervisor that publishes state changes on an existing channel
    pub fn with_event_sender(
        config: DaemonConfig,
        rpc_config: RpcConfig,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            config,
            rpc_config,
            state: AtomicU8::new(SupervisorState::NotStarted as u8),
            client: OnceLock::new(),
            daemon: Mutex::new(None),
            event_tx,
        }
    }

    /// Subscribe to state change events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Endpoint of the running daemon, if any
    pub async fn endpoint(&self) -> Option<Endpoint> {
        self.daemon.lock().await.as_ref().map(|d| d.endpoint.clone())
    }

    /// Move from `from` to `to`, returning the actual state if it was not `from`
    fn advance(&self, from: SupervisorState, to: SupervisorState) -> std::result::Result<(), SupervisorState> {
        debug_assert!(from.can_transition_to(to), "illegal transition {from} -> {to}");

        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map_err(SupervisorState::from_u8)?;

        tracing::debug!(%from, %to, "supervisor state changed");
        self.event_tx
            .send(Event::SupervisorStateChanged { from, to })
            .ok();
        Ok(())
    }

    async fn launch(&self, request: &StartRequest) -> Result<RunningDaemon> {
        tokio::fs::create_dir_all(&request.directory)
            .await
            .map_err(|source| StartupError::Directory {
                path: request.directory.clone(),
                source,
            })?;

        let binary = launch::resolve_binary(&self.config)?;
        let port = match self.config.listen_port {
            Some(port) => port,
            None => launch::reserve_port()?,
        };
        let endpoint = Endpoint::loopback(port, request.secret.clone());
        let conf_file = request
            .secret
            .as_deref()
            .map(launch::write_secret_file)
            .transpose()?;

        let mut child = Command::new(&binary)
            .args(launch::daemon_args(
                request,
                port,
                conf_file.as_ref().map(|f| f.path()),
                &self.config.extra_args,
            ))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| StartupError::Spawn {
                binary: binary.clone(),
                source,
            })?;

        tracing::info!(
            binary = %binary.display(),
            port,
            pid = child.id(),
            directory = %request.directory.display(),
            "spawned aria2c"
        );

        let (tail, forwarders) = launch::forward_output(&mut child, request.verbose);
        let mut daemon = RunningDaemon {
            child,
            endpoint,
            tail,
            forwarders,
            conf_file,
        };

        match self.await_ready(&mut daemon).await {
            Ok(()) => Ok(daemon),
            Err(e) => {
                kill(&mut daemon.child).await;
                Err(e)
            }
        }
    }

    async fn await_ready(&self, daemon: &mut RunningDaemon) -> Result<()> {
        let addr = daemon.endpoint.socket_addr();
        let port = addr.port();

        let child = &mut daemon.child;
        let tcp = readiness::wait_for_tcp(addr, &self.config.tcp_retry, || {
            match child.try_wait() {
                Ok(Some(status)) => Some(status.to_string()),
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!(error = %e, "could not poll aria2c process status");
                    None
                }
            }
        })
        .await;

        match tcp {
            Ok(attempts) => tracing::debug!(port, attempts, "aria2c accepting TCP connections"),
            Err(TcpWaitFailure::Exited(status)) => {
                launch::settle_output(&mut daemon.forwarders).await;
                return Err(StartupError::ExitedEarly {
                    port,
                    status,
                    stderr: daemon.tail.render(),
                }
                .into());
            }
            Err(TcpWaitFailure::Exhausted { attempts, source }) => {
                return Err(StartupError::TcpNotReady {
                    port,
                    attempts,
                    source,
                }
                .into());
            }
        }

        self.advance(SupervisorState::Starting, SupervisorState::TcpReady)
            .map_err(|state| StartupError::Interrupted { state })?;

        let client = Arc::new(Aria2Client::new(&daemon.endpoint, &self.rpc_config)?);
        let ready_client: &Aria2Client = &client;
        readiness::wait_for_rpc(port, &self.config.rpc_retry, move || ready_client.check_ready()).await?;

        self.client.set(client).ok();
        self.advance(SupervisorState::TcpReady, SupervisorState::RpcReady)
            .map_err(|state| StartupError::Interrupted { state })?;

        tracing::info!(port, pid = daemon.child.id(), "aria2c ready");
        Ok(())
    }

    async fn shutdown_daemon(&self, mut daemon: RunningDaemon, graceful: bool) {
        let pid = daemon.child.id();

        if graceful && let Some(client) = self.client.get() {
            match client.shutdown().await {
                Ok(()) => tracing::debug!(?pid, "aria2.shutdown accepted"),
                Err(e) => tracing::warn!(error = %e, ?pid, "aria2.shutdown failed, falling back to signals"),
            }
        }

        let exited = match wait_for_exit(&mut daemon.child, self.config.shutdown_grace).await {
            Some(status) => Some(status),
            None => terminate(&mut daemon.child).await,
        };

        match exited {
            Some(status) => tracing::info!(?pid, %status, "aria2c exited"),
            None => tracing::warn!(?pid, "aria2c did not report an exit status"),
        }

        launch::settle_output(&mut daemon.forwarders).await;

        if let Some(file) = daemon.conf_file.take()
            && let Err(e) = file.close()
        {
            tracing::warn!(error = %e, "could not remove daemon config file");
        }
    }
}

#[async_trait]
impl Supervise for ProcessSupervisor {
    async fn start(&self, request: &StartRequest) -> Result<Endpoint> {
        if request.max_concurrent == 0 {
            return Err(Error::config(
                "max_concurrent",
                "max_concurrent must be greater than zero",
            ));
        }

        self.advance(SupervisorState::NotStarted, SupervisorState::Starting)
            .map_err(|state| Error::InvalidState {
                operation: "start",
                state,
            })?;

        let mut slot = self.daemon.lock().await;
        match self.launch(request).await {
            Ok(daemon) => {
                let endpoint = daemon.endpoint.clone();
                *slot = Some(daemon);
                Ok(endpoint)
            }
            Err(e) => {
                tracing::error!(error = %e, "aria2c failed to start");
                let failed = [SupervisorState::Starting, SupervisorState::TcpReady]
                    .into_iter()
                    .any(|from| self.advance(from, SupervisorState::Failed).is_ok());
                if !failed {
                    tracing::debug!(state = %self.state(), "startup failure after a concurrent stop");
                }
                Err(e)
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        let previous = loop {
            let current = self.state();
            match current {
                SupervisorState::Stopping | SupervisorState::Stopped => {
                    tracing::debug!(state = %current, "stop requested, nothing to do");
                    return Ok(());
                }
                _ => {
                    if self.advance(current, SupervisorState::Stopping).is_ok() {
                        break current;
                    }
                }
            }
        };

        let daemon = self.daemon.lock().await.take();
        if let Some(daemon) = daemon {
            self.shutdown_daemon(daemon, previous.is_serving()).await;
        }

        if let Err(state) = self.advance(SupervisorState::Stopping, SupervisorState::Stopped) {
            tracing::warn!(%state, "unexpected state at end of stop");
        }
        Ok(())
    }

    fn state(&self) -> SupervisorState {
        SupervisorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn client(&self) -> Result<Arc<dyn DaemonRpc>> {
        // Losing this race just means someone else already moved to Running
        self.advance(SupervisorState::RpcReady, SupervisorState::Running)
            .ok();

        let state = self.state();
        match self.client.get() {
            Some(client) if state.is_serving() => {
                let client: Arc<dyn DaemonRpc> = client.clone();
                Ok(client)
            }
            _ => Err(Error::InvalidState {
                operation: "hand out an RPC client",
                state,
            }),
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Some(daemon) = self.daemon.get_mut().as_mut() {
            tracing::warn!(pid = daemon.child.id(), "supervisor dropped without stop, killing aria2c");
            daemon.child.start_kill().ok();
        }
    }
}

async fn wait_for_exit(child: &mut Child, limit: Duration) -> Option<ExitStatus> {
    match tokio::time::timeout(limit, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "failed to wait for aria2c");
            None
        }
        Err(_) => None,
    }
}

/// Escalate: SIGTERM first where available, then kill
async fn terminate(child: &mut Child) -> Option<ExitStatus> {
    if send_sigterm(child)
        && let Some(status) = wait_for_exit(child, TERM_GRACE).await
    {
        return Some(status);
    }
    kill(child).await
}

#[cfg(unix)]
fn send_sigterm(child: &Child) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    tracing::debug!(pid, "sending SIGTERM to aria2c");
    // SAFETY: kill(2) takes no pointers; the pid belongs to our unreaped child
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        tracing::warn!(pid, error = %std::io::Error::last_os_error(), "SIGTERM failed");
        return false;
    }
    true
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) -> bool {
    false
}

async fn kill(child: &mut Child) -> Option<ExitStatus> {
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "kill failed, process probably already exited");
    }
    wait_for_exit(child, KILL_WAIT).await
}
