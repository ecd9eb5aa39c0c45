//! Process-tree termination and port-owner cleanup.
//!
//! The child is started as the leader of its own process group (Unix) or
//! with `CREATE_NEW_PROCESS_GROUP` (Windows), so signalling the group or
//! running `taskkill /T` reaches everything it spawned.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::error::SupervisorError;
use super::port::is_port_free;

/// Capability to terminate a process together with its descendants.
pub trait TreeTerminator: Send + Sync {
    /// Ask the tree to exit (interrupt-equivalent).
    fn interrupt_tree(&self, pid: u32) -> std::io::Result<()>;

    /// Force-kill the tree.
    fn kill_tree(&self, pid: u32) -> std::io::Result<()>;

    /// Force-kill a single process found holding a port.
    fn kill_pid(&self, pid: u32) -> std::io::Result<()>;

    /// Processes with a listening TCP socket on `port`.
    fn listening_pids(&self, port: u16) -> std::io::Result<Vec<u32>>;
}

/// Terminator for the current platform.
pub fn platform_terminator() -> Arc<dyn TreeTerminator> {
    #[cfg(unix)]
    {
        Arc::new(ProcessGroupTerminator)
    }
    #[cfg(windows)]
    {
        Arc::new(TaskkillTerminator)
    }
}

/// Whether a process with this pid currently exists.
#[cfg(unix)]
pub fn process_exists(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs only the existence and permission check.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(pid, 0) };
    let alive = ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    #[cfg(target_os = "linux")]
    let alive = alive && !procfs::is_zombie(pid);
    alive
}

/// Whether a process with this pid currently exists.
#[cfg(windows)]
pub fn process_exists(pid: u32) -> bool {
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH", "/FO", "CSV"])
        .output()
        .is_ok_and(|o| String::from_utf8_lossy(&o.stdout).contains(&format!("\"{pid}\"")))
}

/// POSIX implementation: signals go to the process group led by the child.
#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessGroupTerminator;

#[cfg(unix)]
impl ProcessGroupTerminator {
    fn signal(target: i32, sig: libc::c_int) -> std::io::Result<()> {
        // SAFETY: kill(2) has no memory-safety preconditions; a negative
        // target addresses the process group we created for the child.
        #[allow(unsafe_code)]
        let ret = unsafe { libc::kill(target, sig) };
        if ret == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            // Already gone.
            return Ok(());
        }
        Err(err)
    }

    fn group_target(pid: u32) -> std::io::Result<i32> {
        i32::try_from(pid)
            .map(|p| -p)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))
    }
}

#[cfg(unix)]
impl TreeTerminator for ProcessGroupTerminator {
    fn interrupt_tree(&self, pid: u32) -> std::io::Result<()> {
        Self::signal(Self::group_target(pid)?, libc::SIGINT)
    }

    fn kill_tree(&self, pid: u32) -> std::io::Result<()> {
        Self::signal(Self::group_target(pid)?, libc::SIGKILL)
    }

    fn kill_pid(&self, pid: u32) -> std::io::Result<()> {
        let target = i32::try_from(pid)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
        Self::signal(target, libc::SIGKILL)
    }

    fn listening_pids(&self, port: u16) -> std::io::Result<Vec<u32>> {
        #[cfg(target_os = "linux")]
        {
            procfs::listening_pids(port)
        }
        #[cfg(not(target_os = "linux"))]
        {
            lsof_listening_pids(port)
        }
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn lsof_listening_pids(port: u16) -> std::io::Result<Vec<u32>> {
    let output = match std::process::Command::new("lsof")
        .args(["-t", "-n", "-P", &format!("-iTCP:{port}"), "-sTCP:LISTEN"])
        .output()
    {
        Ok(o) => o,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("lsof not available; skipping port owner lookup");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };
    Ok(parse_pid_lines(&String::from_utf8_lossy(&output.stdout)))
}

#[cfg(all(unix, not(target_os = "linux")))]
fn parse_pid_lines(text: &str) -> Vec<u32> {
    text.lines().filter_map(|l| l.trim().parse().ok()).collect()
}

/// Socket-to-process lookup through `/proc`.
#[cfg(target_os = "linux")]
mod procfs {
    use std::collections::HashSet;

    const TCP_LISTEN: &str = "0A";

    pub(super) fn listening_pids(port: u16) -> std::io::Result<Vec<u32>> {
        let mut inodes = HashSet::new();
        for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
            match std::fs::read_to_string(table) {
                Ok(content) => inodes.extend(listening_inodes(&content, port)),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        if inodes.is_empty() {
            return Ok(Vec::new());
        }

        let mut pids = Vec::new();
        for entry in std::fs::read_dir("/proc")?.flatten() {
            let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            // Processes we may not inspect are skipped.
            let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
                continue;
            };
            let owns_socket = fds.flatten().any(|fd| {
                std::fs::read_link(fd.path())
                    .ok()
                    .and_then(|target| socket_inode(&target.to_string_lossy()))
                    .is_some_and(|inode| inodes.contains(&inode))
            });
            if owns_socket {
                pids.push(pid);
            }
        }
        Ok(pids)
    }

    /// Inodes of sockets in LISTEN state on `port` from a `/proc/net/tcp*` table.
    pub(super) fn listening_inodes(table: &str, port: u16) -> Vec<u64> {
        table
            .lines()
            .skip(1)
            .filter_map(|line| {
                let fields: Vec<&str> = line.split_whitespace().collect();
                let local = fields.get(1)?;
                let state = fields.get(3)?;
                let inode = fields.get(9)?;
                let (_, port_hex) = local.rsplit_once(':')?;
                let local_port = u16::from_str_radix(port_hex, 16).ok()?;
                (local_port == port && *state == TCP_LISTEN)
                    .then(|| inode.parse().ok())
                    .flatten()
            })
            .collect()
    }

    pub(super) fn socket_inode(link: &str) -> Option<u64> {
        link.strip_prefix("socket:[")?.strip_suffix(']')?.parse().ok()
    }

    /// Exited but not yet reaped by its parent.
    pub(super) fn is_zombie(pid: i32) -> bool {
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .ok()
            .and_then(|stat| stat_state(&stat))
            == Some('Z')
    }

    /// State letter from a `/proc/<pid>/stat` line. The command name may
    /// contain spaces and parentheses, so parse from the last `)`.
    pub(super) fn stat_state(stat: &str) -> Option<char> {
        let (_, rest) = stat.rsplit_once(')')?;
        rest.trim_start().chars().next()
    }
}

/// Windows implementation built on `taskkill /T` and `netstat -ano`.
#[cfg(windows)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskkillTerminator;

#[cfg(windows)]
impl TaskkillTerminator {
    fn taskkill(args: &[&str]) -> std::io::Result<()> {
        let output = std::process::Command::new("taskkill").args(args).output()?;
        if !output.status.success() {
            debug!(
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "taskkill reported failure"
            );
        }
        Ok(())
    }
}

#[cfg(windows)]
impl TreeTerminator for TaskkillTerminator {
    fn interrupt_tree(&self, pid: u32) -> std::io::Result<()> {
        Self::taskkill(&["/T", "/PID", &pid.to_string()])
    }

    fn kill_tree(&self, pid: u32) -> std::io::Result<()> {
        Self::taskkill(&["/F", "/T", "/PID", &pid.to_string()])
    }

    fn kill_pid(&self, pid: u32) -> std::io::Result<()> {
        Self::taskkill(&["/F", "/PID", &pid.to_string()])
    }

    fn listening_pids(&self, port: u16) -> std::io::Result<Vec<u32>> {
        let output = std::process::Command::new("netstat")
            .args(["-ano", "-p", "tcp"])
            .output()?;
        Ok(parse_netstat(&String::from_utf8_lossy(&output.stdout), port))
    }
}

/// Pids from `netstat -ano` rows listening on `port`.
#[cfg(any(windows, test))]
fn parse_netstat(text: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{port}");
    text.lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [_, local, _, state, pid] if local.ends_with(&suffix) && *state == "LISTENING" => {
                    pid.parse().ok()
                }
                _ => None,
            }
        })
        .collect()
}

/// Force-terminate whatever still listens on `port` until a bind probe
/// succeeds, giving up after `attempts` rounds.
///
/// Blocking; call from `spawn_blocking` inside async code.
pub fn reclaim_port(
    terminator: &dyn TreeTerminator,
    port: u16,
    attempts: u32,
    interval: Duration,
) -> Result<(), SupervisorError> {
    let own_pid = std::process::id();
    for attempt in 1..=attempts {
        if is_port_free(port) {
            debug!(port, attempt, "Port is free");
            return Ok(());
        }
        match terminator.listening_pids(port) {
            Ok(pids) => {
                for pid in pids.into_iter().filter(|p| *p != own_pid) {
                    info!(port, pid, "Killing leftover process holding port");
                    if let Err(e) = terminator.kill_pid(pid) {
                        warn!(port, pid, error = %e, "Failed to kill port owner");
                    }
                }
            }
            Err(e) => warn!(port, error = %e, "Port owner lookup failed"),
        }
        std::thread::sleep(interval);
    }
    if is_port_free(port) {
        return Ok(());
    }
    Err(SupervisorError::PortReleaseError { port, attempts })
}
