#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Integration tests use unwrap for brevity

//! End-to-end tests for the subprocess supervisor.
//!
//! Each test launches a small POSIX shell script as the "assistant" and
//! drives it through the supervisor:
//! - readiness by marker and by delay
//! - output relay order
//! - premature exit reporting
//! - teardown of the whole process group and idempotent stop
//! - args-file handoff
//! - teardown when the terminator cannot free the port

use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedReceiver;

use ailaunch_launcher::subprocess::{
    ConfigHandoff, LaunchRequest, OutputStream, ProcessEvent, ProcessState, Readiness,
    Supervisor, SupervisorConfig, SupervisorError, TreeTerminator, find_free_port, is_port_free,
    process_exists,
};

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

fn script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("assistant.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn config(executable: &Path) -> SupervisorConfig {
    SupervisorConfig::new(executable)
        .with_readiness(Readiness::Marker("READY".into()))
        .with_grace_period(Duration::from_millis(300))
        .with_port_release(3, Duration::from_millis(50))
}

fn supervisor(config: SupervisorConfig) -> (Supervisor, UnboundedReceiver<ProcessEvent>) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    (Supervisor::new(config, tx), rx)
}

fn request(dir: &Path, start: u16) -> LaunchRequest {
    let port = find_free_port(start).unwrap().release();
    LaunchRequest::new(dir, port).unwrap()
}

/// Collect events until one matches `done`, returning everything seen.
async fn collect_until(
    rx: &mut UnboundedReceiver<ProcessEvent>,
    done: impl Fn(&ProcessEvent) -> bool,
) -> Vec<ProcessEvent> {
    let mut seen = Vec::new();
    let outcome = tokio::time::timeout(EVENT_TIMEOUT, async {
        while let Some(event) = rx.recv().await {
            let finished = done(&event);
            seen.push(event);
            if finished {
                return;
            }
        }
        panic!("event channel closed");
    })
    .await;
    assert!(outcome.is_ok(), "timed out; events so far: {seen:?}");
    seen
}

fn stdout_lines(events: &[ProcessEvent]) -> Vec<&str> {
    events
        .iter()
        .filter_map(|e| match e {
            ProcessEvent::Output {
                stream: OutputStream::Stdout,
                line,
                ..
            } => Some(line.as_str()),
            _ => None,
        })
        .collect()
}

/// Terminator whose signals do nothing and which never finds a port owner.
///
/// With `slow_lookup` set, the first owner lookup blocks long enough to
/// outlast any stop budget used here.
#[derive(Default)]
struct StubbornTerminator {
    slow_lookup: bool,
    looked_up: AtomicBool,
    kills: AtomicUsize,
}

impl TreeTerminator for StubbornTerminator {
    fn interrupt_tree(&self, _pid: u32) -> std::io::Result<()> {
        Ok(())
    }

    fn kill_tree(&self, _pid: u32) -> std::io::Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn kill_pid(&self, _pid: u32) -> std::io::Result<()> {
        Ok(())
    }

    fn listening_pids(&self, _port: u16) -> std::io::Result<Vec<u32>> {
        if self.slow_lookup && !self.looked_up.swap(true, Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(2500));
        }
        Ok(Vec::new())
    }
}

async fn wait_gone(pid: u32) -> bool {
    for _ in 0..40 {
        if !process_exists(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_ready_after_marker_and_fast_stop() {
    let dir = tempfile::TempDir::new().unwrap();
    let exe = script(dir.path(), "echo starting\necho READY\nexec sleep 30");
    let (sup, mut rx) = supervisor(config(&exe));

    let process = sup.launch(request(dir.path(), 31_000)).await.unwrap();
    let events = collect_until(&mut rx, |e| matches!(e, ProcessEvent::Ready { .. })).await;

    let ready_at = events
        .iter()
        .position(|e| matches!(e, ProcessEvent::Ready { .. }))
        .unwrap();
    let marker_at = events
        .iter()
        .position(|e| matches!(e, ProcessEvent::Output { line, .. } if line == "READY"))
        .unwrap();
    assert!(marker_at < ready_at);
    assert_eq!(process.state(), ProcessState::Ready);
    assert!(process.ready().await);

    let started = Instant::now();
    sup.stop(&process).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(process.state(), ProcessState::Stopped);
    assert!(!process.is_running());
}

#[tokio::test]
async fn test_stop_is_idempotent_and_frees_port() {
    let dir = tempfile::TempDir::new().unwrap();
    let exe = script(dir.path(), "echo READY\nexec sleep 30");
    let (sup, mut rx) = supervisor(config(&exe));

    let process = sup.launch(request(dir.path(), 31_100)).await.unwrap();
    collect_until(&mut rx, |e| matches!(e, ProcessEvent::Ready { .. })).await;

    sup.stop(&process).await.unwrap();
    sup.stop(&process).await.unwrap();
    assert!(is_port_free(process.port()));
}

#[tokio::test]
async fn test_immediate_stop_leaves_no_process() {
    let dir = tempfile::TempDir::new().unwrap();
    let exe = script(dir.path(), "exec sleep 30");
    let (sup, _rx) = supervisor(config(&exe));

    let process = sup.launch(request(dir.path(), 31_200)).await.unwrap();
    let pid = process.pid();
    sup.stop(&process).await.unwrap();

    assert!(wait_gone(pid).await, "pid {pid} still alive");
    assert!(!process.ready().await);
}

#[tokio::test]
async fn test_descendants_are_killed_on_stop() {
    let dir = tempfile::TempDir::new().unwrap();
    let exe = script(
        dir.path(),
        "sleep 30 &\necho \"child $!\"\necho READY\nwait",
    );
    let (sup, mut rx) = supervisor(config(&exe));

    let process = sup.launch(request(dir.path(), 31_300)).await.unwrap();
    let events = collect_until(&mut rx, |e| matches!(e, ProcessEvent::Ready { .. })).await;
    let child_pid: u32 = stdout_lines(&events)
        .iter()
        .find_map(|l| l.strip_prefix("child "))
        .unwrap()
        .parse()
        .unwrap();
    assert!(process_exists(child_pid));

    sup.stop(&process).await.unwrap();
    assert!(wait_gone(process.pid()).await);
    assert!(wait_gone(child_pid).await, "descendant {child_pid} survived");
}

#[tokio::test]
async fn test_stdout_order_is_preserved() {
    let dir = tempfile::TempDir::new().unwrap();
    let exe = script(
        dir.path(),
        "i=1\nwhile [ $i -le 50 ]; do echo \"line $i\"; i=$((i+1)); done\necho READY\nexec sleep 30",
    );
    let (sup, mut rx) = supervisor(config(&exe));

    let process = sup.launch(request(dir.path(), 31_400)).await.unwrap();
    let events = collect_until(&mut rx, |e| matches!(e, ProcessEvent::Ready { .. })).await;

    let expected: Vec<String> = (1..=50).map(|i| format!("line {i}")).collect();
    let lines = stdout_lines(&events);
    assert_eq!(lines[..50], expected[..]);
    assert_eq!(lines[50], "READY");

    sup.stop(&process).await.unwrap();
}

#[tokio::test]
async fn test_premature_exit_is_reported() {
    let dir = tempfile::TempDir::new().unwrap();
    let exe = script(dir.path(), "echo 'bad api key' >&2\nexit 3");
    let (sup, mut rx) = supervisor(config(&exe));

    let process = sup.launch(request(dir.path(), 31_500)).await.unwrap();
    let port = process.port();
    let events = collect_until(&mut rx, |e| matches!(e, ProcessEvent::Error { .. })).await;

    match events.last().unwrap() {
        ProcessEvent::Error {
            port: p,
            error: SupervisorError::PrematureExit { stderr_tail, .. },
        } => {
            assert_eq!(*p, port);
            assert_eq!(stderr_tail, &["bad api key".to_string()]);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(!events.iter().any(|e| matches!(e, ProcessEvent::Ready { .. })));

    process.stopped().await;
    assert!(!process.is_running());
    // Already cleaned up by the supervisor.
    sup.stop(&process).await.unwrap();
}

#[tokio::test]
async fn test_exit_after_ready_is_unexpected() {
    let dir = tempfile::TempDir::new().unwrap();
    let exe = script(dir.path(), "echo READY\nsleep 0.2\nexit 0");
    let (sup, mut rx) = supervisor(config(&exe));

    let process = sup.launch(request(dir.path(), 31_600)).await.unwrap();
    let events = collect_until(&mut rx, |e| matches!(e, ProcessEvent::Error { .. })).await;
    assert!(matches!(
        events.last().unwrap(),
        ProcessEvent::Error {
            error: SupervisorError::UnexpectedExit { .. },
            ..
        }
    ));
    process.stopped().await;
}

#[tokio::test]
async fn test_delay_readiness_without_marker() {
    let dir = tempfile::TempDir::new().unwrap();
    let exe = script(dir.path(), "exec sleep 30");
    let config = config(&exe).with_readiness(Readiness::Delay(Duration::from_millis(200)));
    let (sup, mut rx) = supervisor(config);

    let process = sup.launch(request(dir.path(), 31_700)).await.unwrap();
    collect_until(&mut rx, |e| matches!(e, ProcessEvent::Ready { .. })).await;
    assert!(process.ready().await);

    sup.stop(&process).await.unwrap();
}

#[tokio::test]
async fn test_environment_reaches_child() {
    let dir = tempfile::TempDir::new().unwrap();
    let exe = script(
        dir.path(),
        "echo \"port=$APP_PORT model=$APP_MODEL\"\necho READY\nexec sleep 30",
    );
    let (sup, mut rx) = supervisor(config(&exe));

    let req = request(dir.path(), 31_800).with_model("m-test");
    let port = req.port();
    let process = sup.launch(req).await.unwrap();
    let events = collect_until(&mut rx, |e| matches!(e, ProcessEvent::Ready { .. })).await;
    assert_eq!(stdout_lines(&events)[0], format!("port={port} model=m-test"));

    sup.stop(&process).await.unwrap();
}

#[tokio::test]
async fn test_args_file_handoff() {
    let dir = tempfile::TempDir::new().unwrap();
    let args_path = dir.path().join("bundle").join("_internal").join("args.json");
    let exe = script(
        dir.path(),
        &format!("cat '{}'\necho\necho READY\nexec sleep 30", args_path.display()),
    );
    let config = config(&exe).with_handoff(ConfigHandoff::ArgsFile(args_path.clone()));
    let (sup, mut rx) = supervisor(config);

    let req = request(dir.path(), 31_900).with_api_key("sk-test-1234");
    let port = req.port();
    let process = sup.launch(req).await.unwrap();
    let events = collect_until(&mut rx, |e| matches!(e, ProcessEvent::Ready { .. })).await;

    let lines = stdout_lines(&events);
    let json_text = lines[..lines.len() - 1].join("\n");
    let json: serde_json::Value = serde_json::from_str(&json_text).unwrap();
    assert_eq!(json["port"], port.to_string());
    assert_eq!(json["api_key"], "sk-test-1234");
    assert_eq!(json["directory"], dir.path().display().to_string());
    assert!(json.get("model").is_some());
    assert!(json.get("api_base").is_some());

    sup.stop(&process).await.unwrap();
    assert!(!args_path.exists());
}

#[tokio::test]
async fn test_missing_executable_fails_without_events() {
    let dir = tempfile::TempDir::new().unwrap();
    let (sup, mut rx) = supervisor(config(&dir.path().join("nope.sh")));

    let err = sup.launch(request(dir.path(), 32_000)).await.unwrap_err();
    assert!(matches!(err, SupervisorError::ExecutableNotFound { .. }));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_non_utf8_output_is_relayed() {
    let dir = tempfile::TempDir::new().unwrap();
    let exe = script(dir.path(), "printf 'caf\\351\\n'\necho READY\nexec sleep 30");
    let (sup, mut rx) = supervisor(config(&exe));

    let process = sup.launch(request(dir.path(), 32_050)).await.unwrap();
    let events = collect_until(&mut rx, |e| matches!(e, ProcessEvent::Ready { .. })).await;
    assert_eq!(stdout_lines(&events), ["caf\u{FFFD}", "READY"]);

    sup.stop(&process).await.unwrap();
}

#[tokio::test]
async fn test_exit_is_the_only_error_when_port_stays_held() {
    let dir = tempfile::TempDir::new().unwrap();
    let exe = script(dir.path(), "echo 'bad api key' >&2\nexit 3");
    let holder = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = holder.local_addr().unwrap().port();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let sup = Supervisor::new(config(&exe).with_port_release(1, Duration::from_millis(10)), tx)
        .with_terminator(Arc::new(StubbornTerminator::default()));

    let process = sup
        .launch(LaunchRequest::new(dir.path(), port).unwrap())
        .await
        .unwrap();
    let events = collect_until(&mut rx, |e| {
        matches!(
            e,
            ProcessEvent::State {
                state: ProcessState::Stopped,
                ..
            }
        )
    })
    .await;

    let errors: Vec<&SupervisorError> = events
        .iter()
        .filter_map(|e| match e {
            ProcessEvent::Error { error, .. } => Some(error),
            _ => None,
        })
        .collect();
    assert_eq!(errors.len(), 1, "events: {events:?}");
    match errors[0] {
        SupervisorError::PrematureExit { stderr_tail, .. } => {
            assert_eq!(stderr_tail, &["bad api key".to_string()]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    process.stopped().await;
    drop(holder);
}

#[tokio::test]
async fn test_stop_falls_back_to_forced_cleanup_within_budget() {
    let dir = tempfile::TempDir::new().unwrap();
    let exe = script(dir.path(), "trap '' INT\necho READY\nexec sleep 30");
    let holder = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = holder.local_addr().unwrap().port();
    let terminator = Arc::new(StubbornTerminator {
        slow_lookup: true,
        ..Default::default()
    });
    let config = config(&exe)
        .with_grace_period(Duration::from_millis(100))
        .with_kill_wait(Duration::from_millis(100))
        .with_port_release(1, Duration::from_millis(10));
    let budget = config.stop_budget();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let sup = Supervisor::new(config, tx).with_terminator(terminator.clone());

    let process = sup
        .launch(LaunchRequest::new(dir.path(), port).unwrap())
        .await
        .unwrap();
    collect_until(&mut rx, |e| matches!(e, ProcessEvent::Ready { .. })).await;

    let started = Instant::now();
    let err = sup.stop(&process).await.unwrap_err();
    let elapsed = started.elapsed();
    assert!(
        matches!(err, SupervisorError::PortReleaseError { port: p, .. } if p == port),
        "unexpected error: {err:?}"
    );
    assert!(elapsed >= budget, "returned before the budget ran out: {elapsed:?}");
    assert!(
        elapsed < budget + Duration::from_millis(500),
        "took {elapsed:?} with a budget of {budget:?}"
    );
    // Once from the monitor task, once from the forced cleanup.
    assert!(terminator.kills.load(Ordering::SeqCst) >= 2);
    assert!(wait_gone(process.pid()).await, "pid {} still alive", process.pid());

    // Stop after the fallback has nothing left to do.
    sup.stop(&process).await.unwrap();
    drop(holder);
}
