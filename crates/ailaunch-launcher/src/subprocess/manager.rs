//! Managed subprocess lifecycle.
//!
//! Launches the packaged assistant, relays its output, detects readiness,
//! and tears the whole process tree down, reclaiming the port afterwards.
//!
//! Each launched process gets exactly one monitor task. The task owns the
//! [`Child`], reads both pipes through `tokio::select!`, and is the only
//! writer of the process state. The caller keeps a [`ManagedProcess`] handle
//! that observes the state and can ask the task to stop.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::error::SupervisorError;
use super::terminate::{TreeTerminator, platform_terminator, reclaim_port};
use super::types::{ConfigHandoff, LaunchRequest, OutputStream, ProcessEvent, ProcessState, Readiness};

/// Lines of stderr kept for the premature-exit report.
const STDERR_TAIL_LINES: usize = 20;

/// Longest line relayed as a single event. Longer lines are split.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Time allowed to drain buffered output after the child exits.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Slack added on top of the termination budget before `stop` gives up on
/// the monitor task.
const STOP_MARGIN: Duration = Duration::from_secs(1);

#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

/// Channel end the supervisor delivers [`ProcessEvent`]s to.
pub type EventSender = mpsc::UnboundedSender<ProcessEvent>;

/// Supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// The external executable. Launched with no arguments.
    pub executable: PathBuf,
    /// Readiness rule.
    pub readiness: Readiness,
    /// Time between the interrupt and the force-kill.
    pub grace_period: Duration,
    /// Time to wait for the child to be reaped after the force-kill.
    pub kill_wait: Duration,
    /// Rounds of port-owner cleanup before reporting `PortReleaseError`.
    pub port_release_attempts: u32,
    /// Pause between cleanup rounds.
    pub port_release_interval: Duration,
    /// How the launch configuration reaches the child.
    pub handoff: ConfigHandoff,
}

impl SupervisorConfig {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            readiness: Readiness::default(),
            grace_period: Duration::from_secs(1),
            kill_wait: Duration::from_secs(2),
            port_release_attempts: 5,
            port_release_interval: Duration::from_millis(200),
            handoff: ConfigHandoff::Environment,
        }
    }

    #[must_use]
    pub fn with_readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }

    #[must_use]
    pub const fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    #[must_use]
    pub const fn with_kill_wait(mut self, wait: Duration) -> Self {
        self.kill_wait = wait;
        self
    }

    #[must_use]
    pub const fn with_port_release(mut self, attempts: u32, interval: Duration) -> Self {
        self.port_release_attempts = attempts;
        self.port_release_interval = interval;
        self
    }

    #[must_use]
    pub fn with_handoff(mut self, handoff: ConfigHandoff) -> Self {
        self.handoff = handoff;
        self
    }

    /// Upper bound on how long `stop` waits for the monitor task before
    /// falling back to a forced cleanup.
    pub fn stop_budget(&self) -> Duration {
        self.grace_period
            + self.kill_wait * 2
            + self.port_release_interval * self.port_release_attempts
            + DRAIN_TIMEOUT
            + STOP_MARGIN
    }
}

/// Handle to one launched process.
///
/// Dropping the handle asks the monitor task to tear the process down.
#[derive(Debug)]
pub struct ManagedProcess {
    id: String,
    pid: u32,
    port: u16,
    working_directory: PathBuf,
    started_at: SystemTime,
    started: Instant,
    running: Arc<AtomicBool>,
    became_ready: Arc<AtomicBool>,
    state_rx: watch::Receiver<ProcessState>,
    cancel_tx: watch::Sender<bool>,
    monitor: Mutex<Option<JoinHandle<Result<(), SupervisorError>>>>,
}

impl ManagedProcess {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// OS process identifier; also the process-group id on Unix.
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    pub const fn started_at(&self) -> SystemTime {
        self.started_at
    }

    /// Time since launch.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn state(&self) -> ProcessState {
        *self.state_rx.borrow()
    }

    /// Whether the process is still considered running by its supervisor.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && self.state().is_live()
    }

    /// A receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<ProcessState> {
        self.state_rx.clone()
    }

    /// Wait until the process is ready or gone. Returns `true` if readiness
    /// was reached.
    pub async fn ready(&self) -> bool {
        let mut rx = self.state_rx.clone();
        let _ = rx
            .wait_for(|s| {
                matches!(
                    s,
                    ProcessState::Ready | ProcessState::Stopping | ProcessState::Stopped
                )
            })
            .await;
        self.became_ready.load(Ordering::Acquire)
    }

    /// Wait until the process reaches `Stopped`.
    pub async fn stopped(&self) {
        let mut rx = self.state_rx.clone();
        let _ = rx.wait_for(|s| *s == ProcessState::Stopped).await;
    }

    fn take_monitor(&self) -> Option<JoinHandle<Result<(), SupervisorError>>> {
        self.monitor
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }
}

/// Supervisor for externally launched processes.
pub struct Supervisor {
    config: SupervisorConfig,
    terminator: Arc<dyn TreeTerminator>,
    events: EventSender,
}

impl Supervisor {
    /// Create a supervisor that reports to `events`.
    pub fn new(config: SupervisorConfig, events: EventSender) -> Self {
        Self {
            config,
            terminator: platform_terminator(),
            events,
        }
    }

    /// Replace the platform terminator.
    #[must_use]
    pub fn with_terminator(mut self, terminator: Arc<dyn TreeTerminator>) -> Self {
        self.terminator = terminator;
        self
    }

    pub const fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Start the executable for `request` and return immediately.
    ///
    /// Readiness and output arrive later on the event channel.
    pub async fn launch(&self, request: LaunchRequest) -> Result<ManagedProcess, SupervisorError> {
        let executable = &self.config.executable;
        if !executable.is_file() {
            return Err(SupervisorError::ExecutableNotFound {
                path: executable.clone(),
            });
        }
        if !request.working_directory().is_dir() {
            return Err(SupervisorError::InvalidRequest {
                reason: format!(
                    "working directory {} does not exist",
                    request.working_directory().display()
                ),
            });
        }

        let args_file = match &self.config.handoff {
            ConfigHandoff::Environment => None,
            ConfigHandoff::ArgsFile(path) => {
                write_args_file(path, &request).await?;
                Some(path.clone())
            }
        };

        let mut cmd = Command::new(executable);
        cmd.current_dir(request.working_directory())
            .envs(request.environment())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);

        let port = request.port();
        info!(
            executable = %executable.display(),
            working_dir = %request.working_directory().display(),
            port,
            "Spawning subprocess"
        );

        let spawned = cmd.spawn().and_then(|mut child| {
            let pid = child.id().ok_or_else(|| {
                std::io::Error::other("process exited before its pid could be read")
            })?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| std::io::Error::other("failed to capture stdout"))?;
            let stderr = child
                .stderr
                .take()
                .ok_or_else(|| std::io::Error::other("failed to capture stderr"))?;
            Ok((child, pid, stdout, stderr))
        });
        let (child, pid, stdout, stderr) = match spawned {
            Ok(parts) => parts,
            Err(e) => {
                if let Some(path) = &args_file {
                    remove_args_file(path).await;
                }
                return Err(SupervisorError::Spawn {
                    reason: e.to_string(),
                });
            }
        };

        let id = uuid::Uuid::new_v4().to_string();
        let running = Arc::new(AtomicBool::new(true));
        let became_ready = Arc::new(AtomicBool::new(false));
        let (state_tx, state_rx) = watch::channel(ProcessState::Launching);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let monitor = Monitor {
            id: id.clone(),
            pid,
            port,
            child,
            stdout: Some(LineReader::new(stdout)),
            stderr: Some(LineReader::new(stderr)),
            state_tx,
            cancel_rx,
            running: Arc::clone(&running),
            became_ready: Arc::clone(&became_ready),
            events: self.events.clone(),
            readiness: self.config.readiness.clone(),
            terminator: Arc::clone(&self.terminator),
            config: self.config.clone(),
            args_file,
            stderr_tail: VecDeque::with_capacity(STDERR_TAIL_LINES),
        };
        let task = tokio::spawn(monitor.run());

        info!(process_id = %id, pid, port, "Subprocess started");

        Ok(ManagedProcess {
            id,
            pid,
            port,
            working_directory: request.working_directory().to_path_buf(),
            started_at: SystemTime::now(),
            started: Instant::now(),
            running,
            became_ready,
            state_rx,
            cancel_tx,
            monitor: Mutex::new(Some(task)),
        })
    }

    /// Stop the process tree and free its port.
    ///
    /// Idempotent: calling it on a handle that was already stopped, or whose
    /// process already exited and was cleaned up, returns `Ok(())`.
    pub async fn stop(&self, handle: &ManagedProcess) -> Result<(), SupervisorError> {
        let Some(mut task) = handle.take_monitor() else {
            debug!(process_id = %handle.id, "Stop on already-stopped process");
            return Ok(());
        };

        debug!(process_id = %handle.id, pid = handle.pid, port = handle.port, "Stopping subprocess");
        handle.running.store(false, Ordering::Release);
        let _ = handle.cancel_tx.send(true);

        match tokio::time::timeout(self.config.stop_budget(), &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                error!(process_id = %handle.id, error = %join_err, "Monitor task failed");
                self.force_cleanup(handle).await
            }
            Err(_) => {
                warn!(process_id = %handle.id, "Monitor task did not finish in time, aborting");
                task.abort();
                self.force_cleanup(handle).await
            }
        }
    }

    /// Last-resort teardown when the monitor task is gone.
    async fn force_cleanup(&self, handle: &ManagedProcess) -> Result<(), SupervisorError> {
        if let Err(e) = self.terminator.kill_tree(handle.pid) {
            warn!(pid = handle.pid, error = %e, "Failed to kill process tree");
        }
        release_port(
            Arc::clone(&self.terminator),
            handle.port,
            self.config.port_release_attempts,
            self.config.port_release_interval,
        )
        .await
    }
}

async fn write_args_file(path: &Path, request: &LaunchRequest) -> Result<(), SupervisorError> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }
    let json = serde_json::to_string_pretty(&request.to_args_json())
        .map_err(|e| SupervisorError::Io(std::io::Error::other(e)))?;
    tokio::fs::write(path, json).await?;
    debug!(path = %path.display(), "Wrote launch arguments file");
    Ok(())
}

async fn remove_args_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed leftover arguments file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove arguments file"),
    }
}

async fn release_port(
    terminator: Arc<dyn TreeTerminator>,
    port: u16,
    attempts: u32,
    interval: Duration,
) -> Result<(), SupervisorError> {
    tokio::task::spawn_blocking(move || reclaim_port(terminator.as_ref(), port, attempts, interval))
        .await
        .map_err(|e| SupervisorError::Io(std::io::Error::other(e)))?
}

enum Outcome {
    Cancelled,
    Exited(std::io::Result<ExitStatus>),
}

/// State owned by the per-process monitor task.
struct Monitor {
    id: String,
    pid: u32,
    port: u16,
    child: Child,
    stdout: Option<LineReader<ChildStdout>>,
    stderr: Option<LineReader<ChildStderr>>,
    state_tx: watch::Sender<ProcessState>,
    cancel_rx: watch::Receiver<bool>,
    running: Arc<AtomicBool>,
    became_ready: Arc<AtomicBool>,
    events: EventSender,
    readiness: Readiness,
    terminator: Arc<dyn TreeTerminator>,
    config: SupervisorConfig,
    args_file: Option<PathBuf>,
    stderr_tail: VecDeque<String>,
}

/// Splits child output into lines without trusting it to be UTF-8.
///
/// Invalid bytes are replaced, `\r\n` endings are trimmed, and a line longer
/// than [`MAX_LINE_BYTES`] is delivered in pieces. Partial input is kept in
/// `pending`, so dropping a `next_line` future inside `select!` loses nothing.
struct LineReader<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            pending: Vec::new(),
        }
    }

    /// Next line, or `None` at end of stream.
    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                return Ok((!self.pending.is_empty()).then(|| self.take_line()));
            }
            let room = MAX_LINE_BYTES - self.pending.len();
            // One extra byte lets a full-length line keep its own newline.
            let window = &available[..available.len().min(room + 1)];
            if let Some(end) = window.iter().position(|b| *b == b'\n') {
                self.pending.extend_from_slice(&window[..end]);
                self.reader.consume(end + 1);
                return Ok(Some(self.take_line()));
            }
            let taken = window.len().min(room);
            self.pending.extend_from_slice(&window[..taken]);
            self.reader.consume(taken);
            if self.pending.len() >= MAX_LINE_BYTES {
                return Ok(Some(self.take_line()));
            }
        }
    }

    fn take_line(&mut self) -> String {
        if self.pending.last() == Some(&b'\r') {
            self.pending.pop();
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        line
    }
}

async fn next_line<R: AsyncRead + Unpin>(reader: &mut Option<LineReader<R>>) -> Option<String> {
    match reader {
        Some(r) => match r.next_line().await {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "Reading child output failed, closing stream");
                None
            }
        },
        None => std::future::pending().await,
    }
}

impl Monitor {
    async fn run(mut self) -> Result<(), SupervisorError> {
        self.set_state(ProcessState::Running);

        let grace = self.readiness.delay();
        let grace_timer = async move {
            match grace {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(grace_timer);
        let mut grace_pending = grace.is_some();

        let outcome = loop {
            if !self.running.load(Ordering::Acquire) {
                break Outcome::Cancelled;
            }
            tokio::select! {
                biased;
                changed = self.cancel_rx.changed() => {
                    // A dropped handle counts as a stop request.
                    if changed.is_err() || *self.cancel_rx.borrow() {
                        break Outcome::Cancelled;
                    }
                }
                line = next_line(&mut self.stdout), if self.stdout.is_some() => match line {
                    Some(line) => self.relay(OutputStream::Stdout, line),
                    None => self.stdout = None,
                },
                line = next_line(&mut self.stderr), if self.stderr.is_some() => match line {
                    Some(line) => self.relay(OutputStream::Stderr, line),
                    None => self.stderr = None,
                },
                status = self.child.wait() => break Outcome::Exited(status),
                () = &mut grace_timer, if grace_pending => {
                    grace_pending = false;
                    self.grace_elapsed();
                }
            }
        };

        match outcome {
            Outcome::Cancelled => self.shutdown().await,
            Outcome::Exited(status) => {
                self.unexpected_exit(status).await;
                Ok(())
            }
        }
    }

    fn set_state(&self, state: ProcessState) {
        self.state_tx.send_replace(state);
        trace!(process_id = %self.id, port = self.port, %state, "State changed");
        self.emit(ProcessEvent::State {
            port: self.port,
            state,
        });
    }

    fn emit(&self, event: ProcessEvent) {
        // A caller that dropped its receiver no longer cares.
        let _ = self.events.send(event);
    }

    fn relay(&mut self, stream: OutputStream, line: String) {
        trace!(process_id = %self.id, ?stream, "{}", line);
        let hit = !self.became_ready.load(Ordering::Acquire)
            && self.readiness.marker().is_some_and(|m| line.contains(m));
        if stream == OutputStream::Stderr {
            if self.stderr_tail.len() == STDERR_TAIL_LINES {
                self.stderr_tail.pop_front();
            }
            self.stderr_tail.push_back(line.clone());
        }
        self.emit(ProcessEvent::Output {
            port: self.port,
            stream,
            line,
        });
        if hit {
            self.mark_ready("marker observed");
        }
    }

    fn grace_elapsed(&mut self) {
        if self.became_ready.load(Ordering::Acquire) {
            return;
        }
        // The child has not been reaped, so it is still alive.
        match self.child.try_wait() {
            Ok(None) => self.mark_ready("grace delay elapsed"),
            Ok(Some(status)) => debug!(process_id = %self.id, %status, "Exited before grace delay"),
            Err(e) => warn!(process_id = %self.id, error = %e, "Cannot poll child"),
        }
    }

    fn mark_ready(&self, reason: &str) {
        self.became_ready.store(true, Ordering::Release);
        info!(process_id = %self.id, port = self.port, reason, "Subprocess ready");
        self.set_state(ProcessState::Ready);
        self.emit(ProcessEvent::Ready { port: self.port });
    }

    /// Caller-requested teardown: interrupt, wait, kill, reclaim.
    async fn shutdown(mut self) -> Result<(), SupervisorError> {
        self.running.store(false, Ordering::Release);
        self.set_state(ProcessState::Stopping);
        self.terminate_tree().await;
        let result = self.cleanup().await;
        self.set_state(ProcessState::Stopped);
        result
    }

    /// The child went away on its own. Clean up, then report.
    ///
    /// Exactly one `Error` event is sent: the exit itself. A cleanup failure
    /// is only logged, since the exit is what the caller has to act on.
    async fn unexpected_exit(mut self, status: std::io::Result<ExitStatus>) {
        self.running.store(false, Ordering::Release);
        self.drain_output().await;

        let status = match status {
            Ok(s) => s.to_string(),
            Err(e) => format!("wait failed: {e}"),
        };
        warn!(process_id = %self.id, port = self.port, %status, "Subprocess exited unexpectedly");

        // Descendants may outlive the leader.
        if let Err(e) = self.terminator.kill_tree(self.pid) {
            debug!(pid = self.pid, error = %e, "Process group sweep failed");
        }
        if let Err(e) = self.cleanup().await {
            error!(process_id = %self.id, port = self.port, error = %e, "Cleanup after exit failed");
        }

        let error = if self.became_ready.load(Ordering::Acquire) {
            SupervisorError::UnexpectedExit {
                port: self.port,
                status,
            }
        } else {
            SupervisorError::PrematureExit {
                port: self.port,
                status,
                stderr_tail: self.stderr_tail.drain(..).collect(),
            }
        };
        self.emit(ProcessEvent::Error {
            port: self.port,
            error,
        });
        self.set_state(ProcessState::Stopped);
    }

    /// Relay whatever output is still buffered after exit.
    async fn drain_output(&mut self) {
        let drain = async {
            while self.stdout.is_some() || self.stderr.is_some() {
                tokio::select! {
                    line = next_line(&mut self.stdout), if self.stdout.is_some() => match line {
                        Some(line) => self.relay(OutputStream::Stdout, line),
                        None => self.stdout = None,
                    },
                    line = next_line(&mut self.stderr), if self.stderr.is_some() => match line {
                        Some(line) => self.relay(OutputStream::Stderr, line),
                        None => self.stderr = None,
                    },
                }
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            debug!(process_id = %self.id, "Output still open after exit; a descendant holds the pipe");
        }
    }

    async fn terminate_tree(&mut self) {
        let pid = self.pid;
        if let Err(e) = self.terminator.interrupt_tree(pid) {
            warn!(process_id = %self.id, pid, error = %e, "Failed to interrupt process tree");
        }

        match tokio::time::timeout(self.config.grace_period, self.child.wait()).await {
            Ok(Ok(status)) => info!(process_id = %self.id, %status, "Process exited gracefully"),
            Ok(Err(e)) => warn!(process_id = %self.id, error = %e, "Error waiting for process"),
            Err(_) => warn!(process_id = %self.id, "Timeout waiting for graceful shutdown, killing"),
        }

        // Also sweeps descendants left behind by a leader that did exit.
        if let Err(e) = self.terminator.kill_tree(pid) {
            warn!(process_id = %self.id, pid, error = %e, "Failed to kill process tree");
        }
        if !matches!(
            tokio::time::timeout(self.config.kill_wait, self.child.wait()).await,
            Ok(Ok(_))
        ) {
            self.child.start_kill().ok();
            let _ = tokio::time::timeout(self.config.kill_wait, self.child.wait()).await;
        }
    }

    async fn cleanup(&mut self) -> Result<(), SupervisorError> {
        if let Some(path) = self.args_file.take() {
            remove_args_file(&path).await;
        }
        release_port(
            Arc::clone(&self.terminator),
            self.port,
            self.config.port_release_attempts,
            self.config.port_release_interval,
        )
        .await
    }
}
