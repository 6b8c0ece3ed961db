//! Provider process integration tests
//!
//! Spawns real workers (the `dns-challenge` binary in worker mode) and
//! checks isolation, lifecycle and error propagation across the boundary.

#![cfg(unix)]

mod common;

use common::{recorded, recording_script, script, worker_options};
use dns_challenge::plugin::protocol::{MAGIC_COOKIE_KEY, WORKER_ARG};
use dns_challenge::{DnsProvider, Error, ProviderProcess, ProviderSpec};
use std::process::Stdio;
use std::time::Duration;

fn exec_spec(path: impl Into<String>) -> ProviderSpec {
    ProviderSpec::new("exec").with_config("EXEC_PATH", path)
}

// ============================================================================
// ISOLATION
// ============================================================================

#[tokio::test]
async fn test_workers_only_see_their_own_environment() {
    const KEY: &str = "DNS_CHALLENGE_ISOLATION_PROBE";

    let first = ProviderProcess::launch(&exec_spec("/bin/true").with_config(KEY, "1"), worker_options())
        .await
        .unwrap();
    let second =
        ProviderProcess::launch(&exec_spec("/bin/true").with_config(KEY, "2"), worker_options())
            .await
            .unwrap();

    assert_eq!(first.getenv(KEY).await.unwrap().as_deref(), Some("1"));
    assert_eq!(second.getenv(KEY).await.unwrap().as_deref(), Some("2"));
    assert!(std::env::var(KEY).is_err(), "parent environment must stay untouched");

    first.close().await.unwrap();
    second.close().await.unwrap();
}

#[tokio::test]
async fn test_alias_is_applied_inside_worker() {
    let spec = ProviderSpec::new("exec").with_config("EXEC_SCRIPT", "/bin/true");
    let process = ProviderProcess::launch(&spec, worker_options()).await.unwrap();

    assert_eq!(
        process.getenv("EXEC_PATH").await.unwrap().as_deref(),
        Some("/bin/true")
    );
    process.close().await.unwrap();
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[tokio::test]
async fn test_present_before_configure_fails_immediately() {
    let process = ProviderProcess::spawn("exec", worker_options()).await.unwrap();
    assert!(!process.is_configured());

    let err = process.present("example.com", "t", "k").await.unwrap_err();
    assert!(matches!(err, Error::NotConfigured(ref name) if name == "exec"));

    process.close().await.unwrap();
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let process = ProviderProcess::launch(&exec_spec("/bin/true"), worker_options())
        .await
        .unwrap();
    let closer = process.closer();

    closer.close().await.unwrap();
    closer.close().await.unwrap();
    process.close().await.unwrap();
    assert!(process.is_closed());

    let err = process.present("example.com", "t", "k").await.unwrap_err();
    assert!(matches!(err, Error::Closed(_)));
}

#[tokio::test]
async fn test_declared_timing_crosses_the_boundary() {
    let spec = exec_spec("/bin/true")
        .with_config("EXEC_SEQUENCE_INTERVAL", "123")
        .with_config("EXEC_PROPAGATION_TIMEOUT", "300")
        .with_config("EXEC_POLLING_INTERVAL", "7");
    let process = ProviderProcess::launch(&spec, worker_options()).await.unwrap();

    assert_eq!(process.sequential(), Some(Duration::from_secs(123)));
    let timeouts = process.timeout().unwrap();
    assert_eq!(timeouts.timeout, Duration::from_secs(300));
    assert_eq!(timeouts.interval, Duration::from_secs(7));

    process.close().await.unwrap();
}

#[tokio::test]
async fn test_extreme_declared_timing_is_carried_exactly() {
    let spec = exec_spec("/bin/true")
        .with_config("EXEC_SEQUENCE_INTERVAL", "18446744073709552")
        .with_config("EXEC_PROPAGATION_TIMEOUT", "18446744073709551615");
    let process = ProviderProcess::launch(&spec, worker_options()).await.unwrap();

    assert_eq!(
        process.sequential(),
        Some(Duration::from_secs(18_446_744_073_709_552))
    );
    assert_eq!(process.timeout().unwrap().timeout, Duration::from_secs(u64::MAX));

    process.close().await.unwrap();
}

#[test]
fn test_worker_refuses_to_serve_without_cookie() {
    let output = std::process::Command::new(env!("CARGO_BIN_EXE_dns-challenge"))
        .args([WORKER_ARG, "exec"])
        .env_remove(MAGIC_COOKIE_KEY)
        .stdin(Stdio::null())
        .output()
        .unwrap();

    assert!(!output.status.success());
    assert!(output.stdout.is_empty(), "{:?}", output.stdout);
}

// ============================================================================
// CONFIGURATION ERRORS
// ============================================================================

#[tokio::test]
async fn test_unrepresentable_setting_is_a_configuration_error() {
    for (key, value) in [("BAD=KEY", "x"), ("EXEC_MODE", "a\0b")] {
        let spec = exec_spec("/bin/true").with_config(key, value);
        let err = ProviderProcess::launch(&spec, worker_options())
            .await
            .unwrap_err();
        assert!(err.is_configuration(), "{:?}: {:?}", key, err);
    }
}

#[tokio::test]
async fn test_unknown_provider_is_distinguishable() {
    let err = ProviderProcess::launch(&ProviderSpec::new("nonexistent"), worker_options())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownProvider(ref name) if name == "nonexistent"));
}

#[tokio::test]
async fn test_missing_required_setting_fails_configure() {
    let err = ProviderProcess::launch(&ProviderSpec::new("exec"), worker_options())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
    assert_eq!(err.to_string(), "exec: EXEC_PATH is required");
}

// ============================================================================
// CALLS
// ============================================================================

#[tokio::test]
async fn test_present_and_clean_up_are_forwarded() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("calls.log");
    let hook = recording_script(dir.path(), "hook.sh", &log);

    let spec = exec_spec(hook.to_string_lossy()).with_config("EXEC_MODE", "RAW");
    let process = ProviderProcess::launch(&spec, worker_options()).await.unwrap();

    process
        .present("example.com", "tok", "tok.thumb")
        .await
        .unwrap();
    process
        .clean_up("example.com", "tok", "tok.thumb")
        .await
        .unwrap();
    process.close().await.unwrap();

    assert_eq!(
        recorded(&log),
        vec![
            "present example.com tok tok.thumb",
            "cleanup example.com tok tok.thumb"
        ]
    );
}

#[tokio::test]
async fn test_provider_error_text_is_preserved() {
    let dir = tempfile::tempdir().unwrap();
    let hook = script(dir.path(), "fail.sh", "echo 'zone example.com is locked' >&2\nexit 3");

    let process = ProviderProcess::launch(&exec_spec(hook.to_string_lossy()), worker_options())
        .await
        .unwrap();

    let err = process.present("example.com", "t", "k").await.unwrap_err();
    assert!(matches!(err, Error::Provider(_)));
    let text = err.to_string();
    assert!(text.contains("zone example.com is locked"), "{}", text);
    assert!(text.contains("_acme-challenge.example.com."), "{}", text);

    process.close().await.unwrap();
}

#[tokio::test]
async fn test_worker_crash_is_an_ordinary_error() {
    let process = ProviderProcess::launch(&exec_spec("/bin/true"), worker_options())
        .await
        .unwrap();
    let pid = process.pid().unwrap();

    let status = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .unwrap();
    assert!(status.success());
    tokio::time::sleep(Duration::from_millis(200)).await;

    let err = process.present("example.com", "t", "k").await.unwrap_err();
    assert!(matches!(err, Error::Process(_)), "{:?}", err);

    process.close().await.unwrap();
}

#[tokio::test]
async fn test_call_timeout_leaves_process_closable() {
    let dir = tempfile::tempdir().unwrap();
    let hook = script(dir.path(), "slow.sh", "sleep 10");

    let options = worker_options().with_call_timeout(Duration::from_secs(1));
    let process = ProviderProcess::launch(&exec_spec(hook.to_string_lossy()), options)
        .await
        .unwrap();

    let err = process.present("example.com", "t", "k").await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));

    process.close().await.unwrap();
    assert!(process.is_closed());
}

#[tokio::test]
async fn test_abandoned_call_leaves_process_closable() {
    let dir = tempfile::tempdir().unwrap();
    let hook = script(dir.path(), "slow.sh", "sleep 5");

    let process = ProviderProcess::launch(&exec_spec(hook.to_string_lossy()), worker_options())
        .await
        .unwrap();

    let aborted = tokio::time::timeout(
        Duration::from_millis(300),
        process.present("example.com", "t", "k"),
    )
    .await;
    assert!(aborted.is_err());

    process.close().await.unwrap();
    assert!(process.is_closed());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_close_after_timeout_stops_running_hook() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("hook.pid");
    let hook = script(
        dir.path(),
        "slow.sh",
        &format!("sleep 37 &\necho $! > '{}'\nwait", pid_file.display()),
    );

    let options = worker_options().with_call_timeout(Duration::from_secs(1));
    let process = ProviderProcess::launch(&exec_spec(hook.to_string_lossy()), options)
        .await
        .unwrap();

    let err = process.present("example.com", "t", "k").await.unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));

    let pid: u32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(common::is_running(pid));

    process.close().await.unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while common::is_running(pid) && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(!common::is_running(pid), "hook {} outlived its worker", pid);
}
