//! In-memory job table and poll reconciliation

use crate::rpc::JobSnapshot;
use crate::types::{DownloadJob, JobId, JobStatus};
use std::collections::{HashMap, HashSet};

/// Consecutive polls a submitted job may be missing from every list
pub const UNREPORTED_POLL_LIMIT: u32 = 2;

/// Failure cause for jobs the daemon stopped reporting
pub const UNREPORTED_CAUSE: &str = "daemon no longer reports this job";

/// One poll cycle worth of daemon state
#[derive(Clone, Debug, Default)]
pub struct PollSnapshot {
    /// Result of `tellActive`
    pub active: Vec<JobSnapshot>,
    /// Result of `tellWaiting`
    pub waiting: Vec<JobSnapshot>,
    /// Result of `tellStopped`
    pub stopped: Vec<JobSnapshot>,
}

/// What changed for a job during reconciliation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    /// Byte counters moved, status unchanged
    Progress,
    /// The daemon started downloading the job
    Activated,
    /// The job finished successfully
    Completed,
    /// The job finished with an error
    Failed,
}

/// A change to the job at `index`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JobChange {
    /// Position in the batch
    pub index: usize,
    /// Kind of change
    pub kind: ChangeKind,
}

/// Jobs of one batch in submission order, indexed by daemon id
///
/// Status only moves forward. Reports that would move a job backwards, or
/// out of a terminal state, are logged and dropped.
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: Vec<DownloadJob>,
    by_id: HashMap<String, usize>,
    misses: Vec<u32>,
}

impl JobTable {
    /// Table with one `Queued` job per URL group
    pub fn new(groups: Vec<Vec<String>>) -> Self {
        let jobs: Vec<DownloadJob> = groups.into_iter().map(DownloadJob::new).collect();
        Self {
            misses: vec![0; jobs.len()],
            jobs,
            by_id: HashMap::new(),
        }
    }

    /// All jobs in submission order
    pub fn jobs(&self) -> &[DownloadJob] {
        &self.jobs
    }

    /// Job at `index`
    pub fn get(&self, index: usize) -> Option<&DownloadJob> {
        self.jobs.get(index)
    }

    /// Number of jobs
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether the table holds no jobs
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Record the id the daemon assigned to the job at `index`
    ///
    /// Returns `false` (and fails the job) if the daemon handed out an id
    /// that already belongs to another job of this batch.
    pub fn mark_submitted(&mut self, index: usize, id: JobId) -> bool {
        if let Some(&other) = self.by_id.get(id.as_str()) {
            tracing::warn!(gid = %id, index, other, "daemon returned a job id already in use");
            self.mark_rejected(index, format!("daemon reused job id {id}"));
            return false;
        }

        let Some(job) = self.jobs.get_mut(index) else {
            return false;
        };
        self.by_id.insert(id.as_str().to_string(), index);
        job.id = Some(id);
        true
    }

    /// Record that the daemon refused the job at `index`
    pub fn mark_rejected(&mut self, index: usize, error: String) {
        if let Some(job) = self.jobs.get_mut(index) {
            job.status = JobStatus::Errored;
            job.error = Some(error);
        }
    }

    /// Apply one poll cycle, returning what changed
    ///
    /// Waiting, active and stopped lists are applied in that order. A job that
    /// shows up as both active and stopped in the same cycle is taken from the
    /// stopped list only.
    pub fn reconcile(&mut self, poll: &PollSnapshot) -> Vec<JobChange> {
        let stopped: HashSet<&str> = poll.stopped.iter().map(|s| s.gid.as_str()).collect();

        let active = poll.active.iter().filter(|s| {
            let conflict = stopped.contains(s.gid.as_str());
            if conflict {
                tracing::warn!(gid = %s.gid, "job reported both active and stopped, keeping stopped");
            }
            !conflict
        });

        let mut changes = Vec::new();
        for snapshot in poll.waiting.iter().chain(active).chain(&poll.stopped) {
            if let Some(change) = self.apply(snapshot) {
                changes.push(change);
            }
        }
        changes
    }

    fn apply(&mut self, snapshot: &JobSnapshot) -> Option<JobChange> {
        let Some(&index) = self.by_id.get(snapshot.gid.as_str()) else {
            tracing::trace!(gid = %snapshot.gid, "ignoring job not submitted by this batch");
            return None;
        };
        let Some(next) = snapshot.job_status() else {
            tracing::warn!(gid = %snapshot.gid, status = %snapshot.status, "unknown job status");
            return None;
        };

        let job = &mut self.jobs[index];
        if !job.status.can_advance_to(next) {
            tracing::warn!(
                gid = %snapshot.gid,
                from = %job.status,
                to = %next,
                "ignoring status report that would move a job backwards"
            );
            return None;
        }

        let previous_status = job.status;
        let previous_bytes = (job.bytes_downloaded, job.bytes_total);

        job.status = next;
        job.bytes_downloaded = job.bytes_downloaded.max(snapshot.completed_length);
        if let Some(total) = snapshot.known_total() {
            job.bytes_total = Some(job.bytes_total.map_or(total, |t| t.max(total)));
        }
        if let Some(path) = snapshot.first_path() {
            job.path = Some(path);
        }
        if next == JobStatus::Errored && previous_status != JobStatus::Errored {
            job.error = Some(snapshot.error_text());
            job.error_code = snapshot
                .error_code
                .clone()
                .filter(|code| !code.is_empty() && code != "0");
        }

        let kind = if previous_status != next {
            match next {
                JobStatus::Completed => ChangeKind::Completed,
                JobStatus::Errored => ChangeKind::Failed,
                JobStatus::Active => ChangeKind::Activated,
                JobStatus::Queued => ChangeKind::Progress,
            }
        } else if previous_bytes != (job.bytes_downloaded, job.bytes_total) {
            ChangeKind::Progress
        } else {
            return None;
        };

        Some(JobChange { index, kind })
    }

    /// Fail submitted jobs that are missing from every list of the poll
    ///
    /// A job absent from one poll is only counted; it fails once it has been
    /// absent for [`UNREPORTED_POLL_LIMIT`] consecutive polls. This happens
    /// when the daemon purged its stopped result before we saw it. Returns
    /// the indices of the jobs failed by this call.
    pub fn fail_unreported(&mut self, poll: &PollSnapshot) -> Vec<usize> {
        let reported: HashSet<&str> = poll
            .active
            .iter()
            .chain(&poll.waiting)
            .chain(&poll.stopped)
            .map(|s| s.gid.as_str())
            .collect();

        let mut failed = Vec::new();
        for (index, job) in self.jobs.iter_mut().enumerate() {
            let Some(id) = &job.id else {
                continue;
            };
            if job.status.is_terminal() || reported.contains(id.as_str()) {
                self.misses[index] = 0;
                continue;
            }

            self.misses[index] += 1;
            if self.misses[index] >= UNREPORTED_POLL_LIMIT {
                tracing::warn!(
                    gid = %id,
                    polls = self.misses[index],
                    "job missing from every daemon list, marking it failed"
                );
                job.status = JobStatus::Errored;
                job.error = Some(UNREPORTED_CAUSE.to_string());
                failed.push(index);
            }
        }
        failed
    }

    /// Whether every job reached `Completed` or `Errored`
    pub fn all_terminal(&self) -> bool {
        self.jobs.iter().all(|job| job.status.is_terminal())
    }

    /// Number of jobs not yet terminal
    pub fn outstanding(&self) -> usize {
        self.jobs.iter().filter(|job| !job.status.is_terminal()).count()
    }

    /// Fail every submitted job that is not terminal yet, returning their indices
    pub fn fail_outstanding(&mut self, cause: &str) -> Vec<usize> {
        let mut failed = Vec::new();
        for (index, job) in self.jobs.iter_mut().enumerate() {
            if !job.status.is_terminal() {
                job.status = JobStatus::Errored;
                job.error = Some(cause.to_string());
                failed.push(index);
            }
        }
        failed
    }
}
