//! Terminal progress display

use crate::types::{DownloadJob, JobStatus};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

const BAR_TEMPLATE: &str =
    "{msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} ETA {eta}";

const SPINNER_TEMPLATE: &str = "{spinner:.green} {msg} {bytes} {bytes_per_sec}";

/// One progress bar per job
///
/// Bars of finished jobs are cleared unless `keep_finished` is set, so a
/// normal run ends with only the summary on screen.
pub struct BatchProgress {
    multi: MultiProgress,
    bars: Vec<Option<ProgressBar>>,
    keep_finished: bool,
}

impl BatchProgress {
    /// Progress display for `jobs` jobs, drawn on stderr when `visible`
    pub fn new(jobs: usize, visible: bool, keep_finished: bool) -> Self {
        let target = if visible {
            ProgressDrawTarget::stderr()
        } else {
            ProgressDrawTarget::hidden()
        };
        Self {
            multi: MultiProgress::with_draw_target(target),
            bars: (0..jobs).map(|_| None).collect(),
            keep_finished,
        }
    }

    /// Refresh the bar of one job, creating it on first use
    pub fn update(&mut self, index: usize, job: &DownloadJob) {
        let Some(slot) = self.bars.get_mut(index) else {
            return;
        };

        let bar = slot.get_or_insert_with(|| {
            let bar = self.multi.add(ProgressBar::new(0));
            bar.set_style(spinner_style());
            bar
        });

        if let Some(total) = job.bytes_total
            && bar.length() != Some(total)
        {
            bar.set_length(total);
            bar.set_style(bar_style());
        }
        bar.set_position(job.bytes_downloaded);
        bar.set_message(describe(job));

        if job.status.is_terminal() {
            if self.keep_finished {
                bar.finish();
            } else {
                bar.finish_and_clear();
            }
        }
    }

    /// Remove every bar still on screen
    pub fn clear(&mut self) {
        for bar in self.bars.iter().flatten() {
            if !bar.is_finished() {
                bar.abandon();
            }
        }
        self.multi.clear().ok();
    }
}

/// `"<file> [STATUS]"`, falling back to the first URL before a path is known
pub fn describe(job: &DownloadJob) -> String {
    let name = job
        .path
        .as_deref()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| job.primary_url().to_string());
    format!("{name} [{}]", status_label(job.status))
}

fn status_label(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Queued => "QUEUED",
        JobStatus::Active => "ACTIVE",
        JobStatus::Completed => "COMPLETE",
        JobStatus::Errored => "ERROR",
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template(SPINNER_TEMPLATE).unwrap_or_else(|_| ProgressStyle::default_spinner())
}
