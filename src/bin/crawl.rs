//! `crawl` command line front end
//!
//! `crawl aria [FILENAME]` reads a URL list (a file, or stdin when the name is
//! omitted or `-`), runs it through an embedded aria2c daemon and prints a
//! summary table. The exit code is 0 when every job completed, 1 when any job
//! failed or was left unfinished, and 2 when the daemon never became ready.

use aria_dl::error::EXIT_FAILURE;
use aria_dl::{
    BatchConfig, DaemonConfig, DownloadOrchestrator, ProcessSupervisor, cancel_on_signal,
    read_sources,
};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Batch downloader backed by an embedded aria2c daemon.
#[derive(Parser, Debug)]
#[command(name = "crawl", author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download every URL listed in FILENAME (or stdin) with aria2c.
    Aria(AriaArgs),
}

#[derive(Args, Debug)]
struct AriaArgs {
    /// URL list, one entry per line; "-" or omitted reads stdin.
    #[arg(default_value = "-")]
    filename: String,

    /// Destination directory for downloaded files.
    #[arg(short, long, default_value = ".")]
    directory: PathBuf,

    /// Maximum number of concurrent downloads.
    #[arg(
        short = 'j',
        long,
        default_value_t = 5,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    max_concurrent: u32,

    /// Show daemon output and debug logs, keep finished progress bars.
    #[arg(short, long)]
    verbose: bool,

    /// Shared secret for the daemon's RPC interface.
    #[arg(long)]
    secret: Option<String>,

    /// Path to the aria2c binary (default: looked up on PATH).
    #[arg(long, value_name = "PATH")]
    aria2c: Option<PathBuf>,

    /// Milliseconds between two status polls.
    #[arg(
        long,
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    poll_interval_ms: u64,
}

impl AriaArgs {
    fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            directory: self.directory.clone(),
            max_concurrent: self.max_concurrent as usize,
            verbose: self.verbose,
            secret: self.secret.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            daemon: DaemonConfig {
                binary: self.aria2c.clone(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Aria(args) => {
            init_tracing(args.verbose);
            ExitCode::from(run_aria(args).await)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_aria(args: AriaArgs) -> u8 {
    let sources = match read_sources(&args.filename) {
        Ok(sources) => sources,
        Err(e) => {
            tracing::error!(source = %args.filename, error = %e, "could not read URL list");
            return EXIT_FAILURE;
        }
    };

    for skipped in &sources.skipped {
        tracing::warn!(
            line = skipped.line,
            content = %skipped.content,
            reason = %skipped.reason,
            "skipping line"
        );
    }
    if sources.duplicates > 0 {
        tracing::warn!(duplicates = sources.duplicates, "ignored duplicate entries");
    }

    let config = args.batch_config();
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid configuration");
        return e.exit_code();
    }

    let supervisor = ProcessSupervisor::new(config.daemon.clone(), config.rpc.clone());
    let orchestrator = DownloadOrchestrator::new(config, supervisor);

    let cancel = CancellationToken::new();
    let watcher = tokio::spawn(cancel_on_signal(cancel.clone()));

    let result = orchestrator.run(sources.groups, cancel.clone()).await;

    // Lets the signal watcher return.
    cancel.cancel();
    watcher.await.ok();

    match result {
        Ok(report) => {
            print!("{}", report.render_summary());
            report.exit_code()
        }
        Err(e) => {
            tracing::error!(error = %e, "batch failed");
            e.exit_code()
        }
    }
}
