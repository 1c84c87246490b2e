//! In-memory daemon and supervisor used by orchestrator tests.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use crate::error::{Error, Result, RpcError, StartupError};
use crate::rpc::{AddUriOptions, DaemonRpc, FileEntry, GlobalStat, JobSnapshot};
use crate::supervisor::{StartRequest, Supervise};
use crate::types::{Endpoint, JobId, SupervisorState};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// How the fake daemon treats a submitted URL
#[derive(Clone, Debug)]
pub(crate) enum Plan {
    /// Reported complete on the first poll
    Complete,
    /// Reported errored on the first poll
    Fail {
        code: &'static str,
        message: &'static str,
    },
    /// Reported active forever
    StayActive,
    /// Reported in both the active and the stopped list, as complete
    Race,
    /// Accepted, then never reported in any list
    Vanish,
}

struct FakeJob {
    gid: String,
    url: String,
    plan: Plan,
}

#[derive(Default)]
struct FakeState {
    jobs: Vec<FakeJob>,
    plans: HashMap<String, Plan>,
    reject: HashSet<String>,
    polls: usize,
    submissions: usize,
    fail_polls: bool,
    cancel_after_polls: Option<(usize, CancellationToken)>,
    cancel_after_submissions: Option<(usize, CancellationToken)>,
}

/// Scriptable in-memory stand-in for aria2
#[derive(Default)]
pub(crate) struct FakeDaemon {
    state: Mutex<FakeState>,
}

impl FakeDaemon {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn plan(self, url: &str, plan: Plan) -> Self {
        self.state.lock().unwrap().plans.insert(url.to_string(), plan);
        self
    }

    pub(crate) fn reject(self, url: &str) -> Self {
        self.state.lock().unwrap().reject.insert(url.to_string());
        self
    }

    pub(crate) fn failing_polls(self) -> Self {
        self.state.lock().unwrap().fail_polls = true;
        self
    }

    pub(crate) fn cancel_after_polls(self, polls: usize, token: CancellationToken) -> Self {
        self.state.lock().unwrap().cancel_after_polls = Some((polls, token));
        self
    }

    pub(crate) fn cancel_after_submissions(self, submissions: usize, token: CancellationToken) -> Self {
        self.state.lock().unwrap().cancel_after_submissions = Some((submissions, token));
        self
    }

    pub(crate) fn submitted_urls(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .jobs
            .iter()
            .map(|j| j.url.clone())
            .collect()
    }

    pub(crate) fn polls(&self) -> usize {
        self.state.lock().unwrap().polls
    }

    fn snapshots(&self, pick: impl Fn(&Plan) -> Option<JobSnapshot>) -> Vec<JobSnapshot> {
        let state = self.state.lock().unwrap();
        state
            .jobs
            .iter()
            .filter_map(|job| {
                pick(&job.plan).map(|mut s| {
                    s.gid = job.gid.clone();
                    s.files = vec![FileEntry {
                        path: format!("/downloads/{}", job.url.rsplit('/').next().unwrap_or("file")),
                    }];
                    s
                })
            })
            .collect()
    }
}

fn page(jobs: Vec<JobSnapshot>, offset: i64, num: u32) -> Vec<JobSnapshot> {
    jobs.into_iter()
        .skip(offset.max(0) as usize)
        .take(num as usize)
        .collect()
}

#[async_trait]
impl DaemonRpc for FakeDaemon {
    async fn add_uri(&self, urls: &[String], _options: &AddUriOptions) -> Result<JobId> {
        let mut state = self.state.lock().unwrap();
        state.submissions += 1;
        if let Some((after, token)) = &state.cancel_after_submissions
            && state.submissions >= *after
        {
            token.cancel();
        }

        let url = urls[0].clone();
        if state.reject.contains(&url) {
            return Err(RpcError::Fault {
                method: "aria2.addUri".into(),
                code: 1,
                message: format!("Could not understand URI {url}"),
            }
            .into());
        }

        let gid = format!("{:016x}", state.jobs.len() + 1);
        let plan = state.plans.get(&url).cloned().unwrap_or(Plan::Complete);
        state.jobs.push(FakeJob {
            gid: gid.clone(),
            url,
            plan,
        });
        Ok(JobId::new(gid))
    }

    async fn tell_active(&self) -> Result<Vec<JobSnapshot>> {
        {
            let mut state = self.state.lock().unwrap();
            state.polls += 1;
            if state.fail_polls {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )));
            }
        }
        Ok(self.snapshots(|plan| match plan {
            Plan::StayActive | Plan::Race => Some(JobSnapshot {
                status: "active".into(),
                total_length: 2048,
                completed_length: 512,
                ..Default::default()
            }),
            _ => None,
        }))
    }

    async fn tell_waiting(&self, offset: i64, num: u32) -> Result<Vec<JobSnapshot>> {
        Ok(page(Vec::new(), offset, num))
    }

    async fn tell_stopped(&self, offset: i64, num: u32) -> Result<Vec<JobSnapshot>> {
        let stopped = self.snapshots(|plan| match plan {
            Plan::Complete | Plan::Race => Some(JobSnapshot {
                status: "complete".into(),
                total_length: 1024,
                completed_length: 1024,
                error_code: Some("0".into()),
                ..Default::default()
            }),
            Plan::Fail { code, message } => Some(JobSnapshot {
                status: "error".into(),
                error_code: Some((*code).into()),
                error_message: Some((*message).into()),
                ..Default::default()
            }),
            Plan::StayActive | Plan::Vanish => None,
        });

        let state = self.state.lock().unwrap();
        if let Some((after, token)) = &state.cancel_after_polls
            && state.polls >= *after
        {
            token.cancel();
        }

        Ok(page(stopped, offset, num))
    }

    async fn get_global_stat(&self) -> Result<GlobalStat> {
        Ok(GlobalStat::default())
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}

/// Supervisor that hands out a [`FakeDaemon`] and counts lifecycle calls
pub(crate) struct FakeSupervisor {
    daemon: Arc<FakeDaemon>,
    state: Mutex<SupervisorState>,
    fail_start: bool,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
}

impl FakeSupervisor {
    pub(crate) fn new(daemon: FakeDaemon) -> Self {
        Self {
            daemon: Arc::new(daemon),
            state: Mutex::new(SupervisorState::NotStarted),
            fail_start: false,
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail_start: true,
            ..Self::new(FakeDaemon::new())
        }
    }

    pub(crate) fn daemon(&self) -> &FakeDaemon {
        &self.daemon
    }

    pub(crate) fn starts(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn stops(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Supervise for FakeSupervisor {
    async fn start(&self, _request: &StartRequest) -> Result<Endpoint> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_start {
            *self.state.lock().unwrap() = SupervisorState::Failed;
            return Err(StartupError::TcpNotReady {
                port: 6800,
                attempts: 3,
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
            }
            .into());
        }
        *self.state.lock().unwrap() = SupervisorState::RpcReady;
        Ok(Endpoint::loopback(6800, None))
    }

    async fn stop(&self) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        *self.state.lock().unwrap() = SupervisorState::Stopped;
        Ok(())
    }

    fn state(&self) -> SupervisorState {
        *self.state.lock().unwrap()
    }

    fn client(&self) -> Result<Arc<dyn DaemonRpc>> {
        let mut state = self.state.lock().unwrap();
        if !state.is_serving() {
            return Err(Error::InvalidState {
                operation: "hand out an RPC client",
                state: *state,
            });
        }
        *state = SupervisorState::Running;
        let client: Arc<dyn DaemonRpc> = self.daemon.clone();
        Ok(client)
    }
}
