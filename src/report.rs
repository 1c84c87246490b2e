//! Batch outcome reporting

use crate::error::{EXIT_FAILURE, EXIT_SUCCESS};
use crate::types::{DownloadJob, JobId, JobStatus};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::PathBuf;

/// Final bucket of a job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    /// Downloaded successfully
    Completed,
    /// Rejected at submission, failed in the daemon, or lost with the daemon
    Errored,
    /// Still queued or active when the batch was cancelled
    Incomplete,
}

impl JobOutcome {
    fn from_status(status: JobStatus) -> Self {
        match status {
            JobStatus::Completed => JobOutcome::Completed,
            JobStatus::Errored => JobOutcome::Errored,
            JobStatus::Queued | JobStatus::Active => JobOutcome::Incomplete,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "OK",
            JobOutcome::Errored => "ERROR",
            JobOutcome::Incomplete => "INCOMPLETE",
        }
    }
}

/// Per-job line of a batch report
#[derive(Clone, Debug, Serialize)]
pub struct JobReport {
    /// Position in the batch
    pub index: usize,
    /// Daemon id, if the job was accepted
    pub id: Option<JobId>,
    /// Mirror URLs
    pub urls: Vec<String>,
    /// Final bucket
    pub outcome: JobOutcome,
    /// Failure cause for errored jobs
    pub error: Option<String>,
    /// Daemon error code, if one was reported
    pub error_code: Option<String>,
    /// Output file, if known
    pub path: Option<PathBuf>,
    /// Bytes received
    pub bytes_downloaded: u64,
    /// Total size, if known
    pub bytes_total: Option<u64>,
}

impl JobReport {
    fn from_job(index: usize, job: &DownloadJob) -> Self {
        Self {
            index,
            id: job.id.clone(),
            urls: job.urls.clone(),
            outcome: JobOutcome::from_status(job.status),
            error: job.error.clone(),
            error_code: job.error_code.clone(),
            path: job.path.clone(),
            bytes_downloaded: job.bytes_downloaded,
            bytes_total: job.bytes_total,
        }
    }

    /// File name if known, otherwise the daemon id, otherwise the first URL
    pub fn display_name(&self) -> String {
        if let Some(name) = self.path.as_deref().and_then(|p| p.file_name()) {
            return name.to_string_lossy().into_owned();
        }
        if let Some(id) = &self.id {
            return id.to_string();
        }
        self.urls.first().cloned().unwrap_or_default()
    }

    /// Detail shown in the summary's message column
    pub fn message(&self) -> String {
        match self.outcome {
            JobOutcome::Completed => String::new(),
            JobOutcome::Incomplete => "cancelled before completion".to_string(),
            JobOutcome::Errored => match (&self.error, &self.error_code) {
                (Some(error), _) => error.clone(),
                (None, Some(code)) => format!("error code {code}"),
                (None, None) => "unknown error".to_string(),
            },
        }
    }
}

/// Aggregated result of one batch run
#[derive(Clone, Debug, Serialize)]
pub struct BatchReport {
    /// Jobs in the batch
    pub total: usize,
    /// Jobs the daemon accepted
    pub submitted: usize,
    /// Jobs that completed
    pub completed: usize,
    /// Jobs that errored
    pub errored: usize,
    /// Jobs left unfinished by cancellation
    pub incomplete: usize,
    /// Whether the run was cancelled
    pub cancelled: bool,
    /// Per-job detail in submission order
    pub jobs: Vec<JobReport>,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the run finished
    pub finished_at: DateTime<Utc>,
}

impl BatchReport {
    /// Build a report from the final job list
    pub fn from_jobs(
        jobs: &[DownloadJob],
        cancelled: bool,
        started_at: DateTime<Utc>,
    ) -> Self {
        let jobs: Vec<JobReport> = jobs
            .iter()
            .enumerate()
            .map(|(index, job)| JobReport::from_job(index, job))
            .collect();
        let count = |outcome| jobs.iter().filter(|j| j.outcome == outcome).count();

        Self {
            total: jobs.len(),
            submitted: jobs.iter().filter(|j| j.id.is_some()).count(),
            completed: count(JobOutcome::Completed),
            errored: count(JobOutcome::Errored),
            incomplete: count(JobOutcome::Incomplete),
            cancelled,
            jobs,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Report for a batch with nothing to do
    pub fn empty(started_at: DateTime<Utc>) -> Self {
        Self::from_jobs(&[], false, started_at)
    }

    /// Whether every job completed
    pub fn is_success(&self) -> bool {
        self.errored == 0 && self.incomplete == 0
    }

    /// Process exit code for this outcome
    pub fn exit_code(&self) -> u8 {
        if self.is_success() {
            EXIT_SUCCESS
        } else {
            EXIT_FAILURE
        }
    }

    /// Jobs that did not complete
    pub fn failures(&self) -> impl Iterator<Item = &JobReport> {
        self.jobs
            .iter()
            .filter(|j| j.outcome != JobOutcome::Completed)
    }

    /// Plain-text table followed by the bucket totals
    pub fn render_summary(&self) -> String {
        let mut out = String::new();

        if self.jobs.is_empty() {
            out.push_str("No downloads.\n");
        } else {
            let rows: Vec<[String; 4]> = self
                .jobs
                .iter()
                .map(|job| {
                    [
                        job.outcome.label().to_string(),
                        job.display_name(),
                        format_size(job.bytes_total.unwrap_or(job.bytes_downloaded)),
                        job.message(),
                    ]
                })
                .collect();

            let headers = ["Status", "File", "Size", "Message"];
            let mut widths = headers.map(str::len);
            for row in &rows {
                for (width, cell) in widths.iter_mut().zip(row) {
                    *width = (*width).max(cell.chars().count());
                }
            }

            write_row(&mut out, &headers.map(String::from), &widths);
            let rule = widths.map(|w| "-".repeat(w));
            write_row(&mut out, &rule, &widths);
            for row in &rows {
                write_row(&mut out, row, &widths);
            }
            out.push('\n');
        }

        let _ = writeln!(
            out,
            "Completed: {}  Failed: {}  Incomplete: {}",
            self.completed, self.errored, self.incomplete
        );
        if self.cancelled {
            out.push_str("Batch was cancelled.\n");
        }
        out
    }
}

fn write_row(out: &mut String, cells: &[String; 4], widths: &[usize; 4]) {
    let line = cells
        .iter()
        .zip(widths)
        .map(|(cell, &width)| format!("{cell:<width$}"))
        .collect::<Vec<_>>()
        .join("  ");
    out.push_str(line.trim_end());
    out.push('\n');
}

/// Human-readable byte count using 1024-based units
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    if bytes < 1024 {
        return format!("{bytes} B");
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn job(status: JobStatus, id: Option<&str>) -> DownloadJob {
        let mut job = DownloadJob::new(vec!["https://example.com/file.bin".into()]);
        job.status = status;
        job.id = id.map(JobId::new);
        job
    }

    #[test]
    fn buckets_are_counted_separately() {
        let mut failed = job(JobStatus::Errored, Some("g2"));
        failed.error = Some("404 Not Found".into());
        let jobs = vec![
            job(JobStatus::Completed, Some("g1")),
            failed,
            job(JobStatus::Active, Some("g3")),
            job(JobStatus::Errored, None),
        ];

        let report = BatchReport::from_jobs(&jobs, true, Utc::now());

        assert_eq!(report.total, 4);
        assert_eq!(report.submitted, 3);
        assert_eq!(report.completed, 1);
        assert_eq!(report.errored, 2);
        assert_eq!(report.incomplete, 1);
        assert!(!report.is_success());
        assert_eq!(report.exit_code(), EXIT_FAILURE);
        assert_eq!(report.failures().count(), 3);
    }

    #[test]
    fn empty_report_is_success() {
        let report = BatchReport::empty(Utc::now());
        assert_eq!(report.total, 0);
        assert!(report.is_success());
        assert_eq!(report.exit_code(), EXIT_SUCCESS);
        assert!(report.render_summary().contains("No downloads."));
        assert!(report.finished_at >= report.started_at);
    }

    #[test]
    fn message_falls_back_to_error_code() {
        let mut failed = job(JobStatus::Errored, Some("g1"));
        failed.error_code = Some("22".into());
        let report = BatchReport::from_jobs(&[failed], false, Utc::now());

        assert_eq!(report.jobs[0].message(), "error code 22");
    }

    #[test]
    fn display_name_prefers_path_then_id() {
        let mut done = job(JobStatus::Completed, Some("abc"));
        let report = BatchReport::from_jobs(std::slice::from_ref(&done), false, Utc::now());
        assert_eq!(report.jobs[0].display_name(), "abc");

        done.path = Some(PathBuf::from("/dl/show.mp3"));
        let report = BatchReport::from_jobs(&[done], false, Utc::now());
        assert_eq!(report.jobs[0].display_name(), "show.mp3");

        let report = BatchReport::from_jobs(&[job(JobStatus::Errored, None)], false, Utc::now());
        assert_eq!(report.jobs[0].display_name(), "https://example.com/file.bin");
    }

    #[test]
    fn summary_lists_every_job_and_totals() {
        let mut done = job(JobStatus::Completed, Some("g1"));
        done.path = Some(PathBuf::from("/dl/a.iso"));
        done.bytes_total = Some(3 * 1024 * 1024);
        let mut failed = job(JobStatus::Errored, Some("g2"));
        failed.error = Some("404 Not Found".into());

        let summary = BatchReport::from_jobs(&[done, failed], false, Utc::now()).render_summary();

        let lines: Vec<&str> = summary.lines().collect();
        assert!(lines[0].starts_with("Status"));
        assert!(lines[1].starts_with("------"));
        assert!(lines[2].contains("a.iso") && lines[2].contains("3.0 MB"));
        assert!(lines[3].contains("ERROR") && lines[3].contains("404 Not Found"));
        assert!(summary.contains("Completed: 1  Failed: 1  Incomplete: 0"));
    }

    #[test]
    fn format_size_uses_binary_units() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(5 * 1024 * 1024 * 1024), "5.0 GB");
        assert_eq!(format_size(u64::MAX), "16777216.0 TB");
    }

    #[test]
    fn report_serializes_outcomes_in_snake_case() {
        let report = BatchReport::from_jobs(&[job(JobStatus::Queued, None)], true, Utc::now());
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["jobs"][0]["outcome"], "incomplete");
        assert_eq!(value["cancelled"], true);
    }
}
