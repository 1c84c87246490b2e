//! Common test utilities for aria-dl integration tests

#[allow(dead_code)]
pub mod fake_aria2;

#[allow(unused_imports)]
pub use fake_aria2::*;

use aria_dl::config::{BatchConfig, DaemonConfig, RetryConfig};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Write an executable `/bin/sh` script that stands in for the aria2c binary
#[cfg(unix)]
#[allow(dead_code)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Readiness policy that gives up quickly
#[allow(dead_code)]
pub fn fast_retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(50),
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

/// Batch config pointing at `binary` with a pinned RPC port and no progress bars
#[allow(dead_code)]
pub fn batch_config(binary: PathBuf, port: u16, directory: &Path) -> BatchConfig {
    BatchConfig {
        directory: directory.to_path_buf(),
        max_concurrent: 2,
        poll_interval: Duration::from_millis(25),
        show_progress: false,
        daemon: DaemonConfig {
            binary: Some(binary),
            listen_port: Some(port),
            tcp_retry: fast_retry(20),
            rpc_retry: fast_retry(20),
            shutdown_grace: Duration::from_millis(200),
            ..Default::default()
        },
        ..Default::default()
    }
}
