//! Batch download orchestration
//!
//! [`DownloadOrchestrator::run`] is one sequential state machine: start the
//! daemon, submit every job, poll until everything is terminal or the batch
//! is cancelled, then stop the daemon no matter how the middle part ended.
//! Download concurrency is left to the daemon.
//!
//! # Example
//!
//! ```no_run
//! use aria_dl::config::BatchConfig;
//! use aria_dl::orchestrator::DownloadOrchestrator;
//! use aria_dl::supervisor::ProcessSupervisor;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BatchConfig::default();
//! let supervisor = ProcessSupervisor::new(config.daemon.clone(), config.rpc.clone());
//! let orchestrator = DownloadOrchestrator::new(config, supervisor);
//!
//! let urls = vec![vec!["https://example.com/file.iso".to_string()]];
//! let report = orchestrator.run(urls, CancellationToken::new()).await?;
//! print!("{}", report.render_summary());
//! # Ok(())
//! # }
//! ```

mod jobs;
mod progress;
#[cfg(test)]
pub(crate) mod test_helpers;

pub use jobs::{ChangeKind, JobChange, JobTable, PollSnapshot};
pub use progress::BatchProgress;

use crate::config::BatchConfig;
use crate::error::Result;
use crate::report::BatchReport;
use crate::rpc::{AddUriOptions, DaemonRpc, JobSnapshot, POLL_PAGE_SIZE};
use crate::supervisor::{StartRequest, Supervise};
use crate::types::Event;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Drives one batch of downloads through a supervised daemon
pub struct DownloadOrchestrator<S: Supervise> {
    config: BatchConfig,
    supervisor: S,
    event_tx: broadcast::Sender<Event>,
}

impl<S: Supervise> DownloadOrchestrator<S> {
    /// Create an orchestrator that owns `supervisor` for its lifetime
    pub fn new(config: BatchConfig, supervisor: S) -> Self {
        let (event_tx, _rx) = broadcast::channel(1000);
        Self::with_event_sender(config, supervisor, event_tx)
    }

    /// Create an orchestrator publishing on an existing event channel
    pub fn with_event_sender(
        config: BatchConfig,
        supervisor: S,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            config,
            supervisor,
            event_tx,
        }
    }

    /// Subscribe to job lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// The supervisor driving the daemon
    pub fn supervisor(&self) -> &S {
        &self.supervisor
    }

    /// The batch configuration
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Run one batch of URL groups to completion or cancellation
    ///
    /// An empty batch returns an empty report without starting the daemon.
    /// Per-job failures end up in the report; only a startup failure (or an
    /// invalid configuration) is returned as an error. The supervisor is
    /// stopped before this returns, including when polling panics.
    pub async fn run(
        &self,
        groups: Vec<Vec<String>>,
        cancel: CancellationToken,
    ) -> Result<BatchReport> {
        let started_at = Utc::now();

        if groups.is_empty() {
            tracing::info!("no URLs to download, daemon not started");
            return Ok(BatchReport::empty(started_at));
        }

        self.config.validate()?;

        let mut table = JobTable::new(groups);
        let request = StartRequest::from(&self.config);

        let started = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.supervisor.start(&request) => Some(result),
        };

        match started {
            None => {
                tracing::info!("batch cancelled while the daemon was starting");
                self.stop_supervisor().await;
                return Ok(self.finish(&table, true, started_at));
            }
            Some(Err(e)) => {
                self.stop_supervisor().await;
                return Err(e);
            }
            Some(Ok(endpoint)) => {
                tracing::info!(port = endpoint.port, jobs = table.len(), "daemon ready, submitting batch");
            }
        }

        let mut progress = BatchProgress::new(
            table.len(),
            self.config.show_progress,
            self.config.verbose,
        );

        let outcome = AssertUnwindSafe(self.drive(&mut table, &mut progress, &cancel))
            .catch_unwind()
            .await;

        progress.clear();
        self.stop_supervisor().await;

        let cancelled = match outcome {
            Ok(Ok(cancelled)) => cancelled,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "batch aborted");
                let cause = format!("batch aborted: {e}");
                self.fail_remaining(&mut table, &cause);
                false
            }
            Err(panic) => std::panic::resume_unwind(panic),
        };

        Ok(self.finish(&table, cancelled, started_at))
    }

    /// Submit and poll; returns whether the batch was cancelled
    async fn drive(
        &self,
        table: &mut JobTable,
        progress: &mut BatchProgress,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let client = self.supervisor.client()?;
        let options = AddUriOptions::new(&self.config.directory);

        for index in 0..table.len() {
            if cancel.is_cancelled() {
                tracing::info!(remaining = table.len() - index, "batch cancelled during submission");
                return Ok(true);
            }

            let urls = table.jobs()[index].urls.clone();
            let submitted = match until_cancelled(cancel, client.add_uri(&urls, &options)).await {
                Some(result) => result,
                None => return Ok(true),
            };

            match submitted {
                Ok(id) => {
                    if table.mark_submitted(index, id.clone()) {
                        tracing::debug!(index, gid = %id, url = %urls[0], "download submitted");
                        self.emit(Event::JobSubmitted { index, id });
                    } else {
                        self.emit_rejected(table, index);
                    }
                }
                Err(e) => {
                    tracing::warn!(index, url = %urls[0], error = %e, "daemon rejected download");
                    table.mark_rejected(index, e.to_string());
                    self.emit_rejected(table, index);
                }
            }
            progress.update(index, &table.jobs()[index]);
        }

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !table.all_terminal() {
            if until_cancelled(cancel, ticker.tick()).await.is_none() {
                return Ok(true);
            }

            let polled = match until_cancelled(cancel, poll_daemon(client.as_ref())).await {
                Some(result) => result,
                None => return Ok(true),
            };

            match polled {
                Ok(snapshot) => {
                    let changes = table.reconcile(&snapshot);
                    self.publish(table, progress, &changes);

                    let lost: Vec<JobChange> = table
                        .fail_unreported(&snapshot)
                        .into_iter()
                        .map(|index| JobChange {
                            index,
                            kind: ChangeKind::Failed,
                        })
                        .collect();
                    self.publish(table, progress, &lost);
                }
                Err(e) => {
                    tracing::error!(error = %e, "lost contact with daemon");
                    let cause = format!("lost contact with daemon: {e}");
                    for index in self.fail_remaining(table, &cause) {
                        progress.update(index, &table.jobs()[index]);
                    }
                    break;
                }
            }
        }

        Ok(false)
    }

    fn publish(&self, table: &JobTable, progress: &mut BatchProgress, changes: &[JobChange]) {
        for change in changes {
            let Some(job) = table.get(change.index) else {
                continue;
            };
            progress.update(change.index, job);

            let Some(id) = job.id.clone() else {
                continue;
            };
            match change.kind {
                ChangeKind::Progress | ChangeKind::Activated => self.emit(Event::JobProgress {
                    id,
                    bytes_downloaded: job.bytes_downloaded,
                    bytes_total: job.bytes_total,
                }),
                ChangeKind::Completed => {
                    tracing::info!(gid = %id, path = ?job.path, "download complete");
                    self.emit(Event::JobCompleted {
                        id,
                        path: job.path.clone(),
                    });
                }
                ChangeKind::Failed => {
                    let error = job.error.clone().unwrap_or_default();
                    tracing::warn!(gid = %id, url = %job.primary_url(), %error, "download failed");
                    self.emit(Event::JobFailed { id, error });
                }
            }
        }
    }

    fn fail_remaining(&self, table: &mut JobTable, cause: &str) -> Vec<usize> {
        let failed = table.fail_outstanding(cause);
        for &index in &failed {
            if let Some(id) = table.jobs()[index].id.clone() {
                self.emit(Event::JobFailed {
                    id,
                    error: cause.to_string(),
                });
            }
        }
        failed
    }

    fn emit_rejected(&self, table: &JobTable, index: usize) {
        let error = table.jobs()[index].error.clone().unwrap_or_default();
        self.emit(Event::JobRejected { index, error });
    }

    fn finish(&self, table: &JobTable, cancelled: bool, started_at: DateTime<Utc>) -> BatchReport {
        if cancelled {
            self.emit(Event::BatchCancelled {
                incomplete: table.outstanding(),
            });
        }

        let report = BatchReport::from_jobs(table.jobs(), cancelled, started_at);
        tracing::info!(
            total = report.total,
            completed = report.completed,
            errored = report.errored,
            incomplete = report.incomplete,
            cancelled,
            "batch finished"
        );
        report
    }

    async fn stop_supervisor(&self) {
        if let Err(e) = self.supervisor.stop().await {
            tracing::warn!(error = %e, "failed to stop daemon cleanly");
        }
    }

    fn emit(&self, event: Event) {
        self.event_tx.send(event).ok();
    }
}

/// `None` if `cancel` fires first
async fn until_cancelled<F: Future>(cancel: &CancellationToken, future: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        output = future => Some(output),
    }
}

/// One poll cycle: active first, then waiting and stopped, each fully paged
async fn poll_daemon(client: &dyn DaemonRpc) -> Result<PollSnapshot> {
    let active = client.tell_active().await?;

    let mut waiting = Vec::new();
    loop {
        let page = client.tell_waiting(waiting.len() as i64, POLL_PAGE_SIZE).await?;
        if extend_page(&mut waiting, page) {
            break;
        }
    }

    let mut stopped = Vec::new();
    loop {
        let page = client.tell_stopped(stopped.len() as i64, POLL_PAGE_SIZE).await?;
        if extend_page(&mut stopped, page) {
            break;
        }
    }

    Ok(PollSnapshot {
        active,
        waiting,
        stopped,
    })
}

/// Append a page, returning true if it was the last one
fn extend_page(into: &mut Vec<JobSnapshot>, page: Vec<JobSnapshot>) -> bool {
    let last = page.len() < POLL_PAGE_SIZE as usize;
    into.extend(page);
    last
}
