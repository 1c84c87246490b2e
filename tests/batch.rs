//! End-to-end batch runs against a stand-in aria2c process
//!
//! The "daemon" is a shell script that just sleeps; the RPC side is a
//! wiremock server bound to the port the script was told to listen on. This
//! exercises the real supervisor (spawn, readiness, shutdown, SIGTERM) and the
//! real JSON-RPC client without needing aria2 installed.

#![cfg(unix)]

mod common;

use aria_dl::error::{EXIT_FAILURE, EXIT_STARTUP_FAILURE, EXIT_SUCCESS};
use aria_dl::{
    DownloadOrchestrator, Error, Event, JobOutcome, ProcessSupervisor, Supervise,
    SupervisorState, read_sources,
};
use common::{FakeAria2, batch_config, write_script};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

fn groups(urls: &[&str]) -> Vec<Vec<String>> {
    urls.iter().map(|u| vec![u.to_string()]).collect()
}

fn orchestrator(config: aria_dl::BatchConfig) -> DownloadOrchestrator<ProcessSupervisor> {
    let supervisor = ProcessSupervisor::new(config.daemon.clone(), config.rpc.clone());
    DownloadOrchestrator::new(config, supervisor)
}

// ============================================================================
// Successful runs
// ============================================================================

#[tokio::test]
async fn mixed_batch_reports_every_outcome() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "fake-aria2c", "exec sleep 30");
    let (server, fake) = FakeAria2::start().await;
    let downloads = dir.path().join("downloads");

    let orchestrator = orchestrator(batch_config(script, server.address().port(), &downloads));
    let mut events = orchestrator.subscribe();

    let report = orchestrator
        .run(
            groups(&[
                "https://example.com/a.iso",
                "https://example.com/missing.bin",
                "https://example.com/reject-me",
                "https://example.com/b.iso",
            ]),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(report.total, 4);
    assert_eq!(report.submitted, 3);
    assert_eq!(report.completed, 2);
    assert_eq!(report.errored, 2);
    assert_eq!(report.incomplete, 0);
    assert!(!report.cancelled);
    assert_eq!(report.exit_code(), EXIT_FAILURE);

    assert_eq!(report.jobs[0].outcome, JobOutcome::Completed);
    assert_eq!(
        report.jobs[0].path,
        Some(PathBuf::from(format!("{}/a.iso", downloads.display())))
    );
    assert_eq!(report.jobs[0].bytes_total, Some(4096));
    assert_eq!(report.jobs[1].outcome, JobOutcome::Errored);
    assert_eq!(report.jobs[1].message(), "Resource not found");
    assert_eq!(report.jobs[2].outcome, JobOutcome::Errored);
    assert!(report.jobs[2].id.is_none());
    assert!(report.jobs[2].message().contains("Could not understand URI"));
    assert_eq!(report.jobs[3].outcome, JobOutcome::Completed);

    // Jobs were handed over in input order, into the configured directory
    let submitted = fake.jobs();
    assert_eq!(submitted.len(), 3);
    assert_eq!(submitted[0].urls, vec!["https://example.com/a.iso"]);
    assert_eq!(submitted[2].urls, vec!["https://example.com/b.iso"]);
    assert!(submitted.iter().all(|j| j.dir == downloads.display().to_string()));
    assert!(downloads.is_dir());

    // Daemon was shut down exactly once, after the last poll
    assert_eq!(fake.count("aria2.shutdown"), 1);
    assert_eq!(fake.calls().last().map(String::as_str), Some("aria2.shutdown"));
    assert_eq!(orchestrator.supervisor().state(), SupervisorState::Stopped);

    let mut completed = 0;
    let mut failed = 0;
    let mut rejected = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            Event::JobCompleted { .. } => completed += 1,
            Event::JobFailed { .. } => failed += 1,
            Event::JobRejected { index, .. } => {
                assert_eq!(index, 2);
                rejected += 1;
            }
            _ => {}
        }
    }
    assert_eq!((completed, failed, rejected), (2, 1, 1));
}

#[tokio::test]
async fn clean_batch_exits_zero_and_sends_the_secret() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "fake-aria2c", "exec sleep 30");
    let (server, fake) = FakeAria2::start().await;

    let mut config = batch_config(script, server.address().port(), dir.path());
    config.secret = Some("s3cret".to_string());
    let orchestrator = orchestrator(config);

    let report = orchestrator
        .run(
            groups(&["https://example.com/one", "https://example.com/two"]),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(report.is_success());
    assert_eq!(report.exit_code(), EXIT_SUCCESS);
    assert!(report.render_summary().contains("Completed: 2  Failed: 0  Incomplete: 0"));

    let tokens = fake.tokens();
    assert!(!tokens.is_empty());
    assert!(
        tokens.iter().all(|t| t.as_deref() == Some("token:s3cret")),
        "every call should carry the token: {tokens:?}"
    );
}

#[tokio::test]
async fn url_file_feeds_mirror_groups_to_the_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let list = dir.path().join("urls.txt");
    std::fs::write(
        &list,
        "# nightly images\n\
         https://a.example/img.iso\thttps://b.example/img.iso\n\
         \n\
         not a url\n\
         https://a.example/img.iso\thttps://b.example/img.iso\n",
    )
    .unwrap();

    let sources = read_sources(list.to_str().unwrap()).unwrap();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources.skipped.len(), 1);
    assert_eq!(sources.duplicates, 1);

    let script = write_script(dir.path(), "fake-aria2c", "exec sleep 30");
    let (server, fake) = FakeAria2::start().await;
    let orchestrator = orchestrator(batch_config(script, server.address().port(), dir.path()));

    let report = orchestrator
        .run(sources.groups, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.completed, 1);
    assert_eq!(
        fake.jobs()[0].urls,
        vec!["https://a.example/img.iso", "https://b.example/img.iso"]
    );
}

// ============================================================================
// Failure and cancellation
// ============================================================================

#[tokio::test]
async fn daemon_that_dies_at_startup_is_a_startup_failure() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "broken-aria2c",
        "echo 'Exception caught: Failed to bind a socket' >&2\nexit 1",
    );
    let (server, fake) = FakeAria2::start().await;
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    drop(server);

    let orchestrator = orchestrator(batch_config(script, port, dir.path()));
    let err = orchestrator
        .run(groups(&["https://example.com/a.iso"]), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Startup(_)), "got {err:?}");
    assert_eq!(err.exit_code(), EXIT_STARTUP_FAILURE);
    assert!(fake.calls().is_empty());
    assert_eq!(orchestrator.supervisor().state(), SupervisorState::Stopped);
}

#[tokio::test]
async fn missing_binary_is_a_startup_failure() {
    let dir = tempfile::tempdir().unwrap();
    let (server, _fake) = FakeAria2::start().await;

    let orchestrator = orchestrator(batch_config(
        dir.path().join("no-such-aria2c"),
        server.address().port(),
        dir.path(),
    ));
    let err = orchestrator
        .run(groups(&["https://example.com/a.iso"]), CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.exit_code(), EXIT_STARTUP_FAILURE);
}

#[tokio::test]
async fn cancelled_batch_still_stops_the_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "fake-aria2c", "exec sleep 30");
    let (server, fake) = FakeAria2::start().await;

    let orchestrator = orchestrator(batch_config(script, server.address().port(), dir.path()));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = orchestrator
        .run(groups(&["https://example.com/a.iso"]), cancel)
        .await
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.incomplete, 1);
    assert_eq!(report.exit_code(), EXIT_FAILURE);
    assert_eq!(fake.count("aria2.addUri"), 0);
    assert_eq!(orchestrator.supervisor().state(), SupervisorState::Stopped);
}
