//! Shared helpers for worker-process integration tests

#![allow(dead_code)]

use dns_challenge::{BuildOptions, ProcessOptions};
use std::path::{Path, PathBuf};

/// Options pointing workers at the built `dns-challenge` binary.
pub fn worker_options() -> ProcessOptions {
    ProcessOptions::default().with_executable(env!("CARGO_BIN_EXE_dns-challenge"))
}

pub fn build_options() -> BuildOptions {
    BuildOptions {
        process: worker_options(),
        ..Default::default()
    }
}

/// Write an executable shell script into `dir`.
#[cfg(unix)]
pub fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Script that appends its arguments to `log` and succeeds.
#[cfg(unix)]
pub fn recording_script(dir: &Path, name: &str, log: &Path) -> PathBuf {
    script(dir, name, &format!("echo \"$@\" >> '{}'", log.display()))
}

/// Lines recorded so far, empty if nothing ran.
pub fn recorded(log: &Path) -> Vec<String> {
    std::fs::read_to_string(log)
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Whether `pid` is alive; zombies count as gone.
#[cfg(target_os = "linux")]
pub fn is_running(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit_once(") ")
            .and_then(|(_, rest)| rest.chars().next())
            .is_some_and(|state| state != 'Z' && state != 'X'),
        Err(_) => false,
    }
}
