//! Errors from supervisor operations.

use std::path::PathBuf;

/// Errors from port allocation, launch, and teardown.
///
/// Launch-time variants are returned synchronously. `PrematureExit` and
/// `UnexpectedExit` arrive on the event channel after cleanup.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("No free port in range {start}..={end}")]
    NoPortAvailable { start: u16, end: u16 },

    #[error("Executable not found: {}", .path.display())]
    ExecutableNotFound { path: PathBuf },

    #[error("Failed to spawn subprocess: {reason}")]
    Spawn { reason: String },

    #[error("Process on port {port} exited before it was ready ({status}){}", stderr_suffix(.stderr_tail))]
    PrematureExit {
        port: u16,
        status: String,
        stderr_tail: Vec<String>,
    },

    #[error("Process on port {port} ended unexpectedly ({status})")]
    UnexpectedExit { port: u16, status: String },

    #[error("Port {port} still in use after {attempts} cleanup attempts")]
    PortReleaseError { port: u16, attempts: u32 },

    #[error("Port {port} is already claimed by another instance")]
    PortInUse { port: u16 },

    #[error("Invalid launch request: {reason}")]
    InvalidRequest { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn stderr_suffix(tail: &[String]) -> String {
    if tail.is_empty() {
        String::new()
    } else {
        format!(": {}", tail.join(" | "))
    }
}
