//! Instance registry.
//!
//! Maps each claimed port to the [`ManagedProcess`] serving it. The registry
//! is owned by the launcher controller; only `insert` (after a launch) and
//! `remove` (before a stop) mutate it. When a claims file is configured, the
//! set of claimed ports is mirrored to disk as a JSON array so sibling
//! launcher processes can avoid them.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::subprocess::{ManagedProcess, ProcessState, SupervisorError};

/// Display snapshot of one running instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub port: u16,
    pub pid: u32,
    pub directory: PathBuf,
    pub state: ProcessState,
    pub runtime: String,
}

/// Ports claimed by this launcher and the processes behind them.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: BTreeMap<u16, ManagedProcess>,
    claims_file: Option<PathBuf>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that mirrors its ports to `path`.
    pub fn with_claims_file(path: impl Into<PathBuf>) -> Self {
        Self {
            instances: BTreeMap::new(),
            claims_file: Some(path.into()),
        }
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn get(&self, port: u16) -> Option<&ManagedProcess> {
        self.instances.get(&port)
    }

    pub fn ports(&self) -> Vec<u16> {
        self.instances.keys().copied().collect()
    }

    /// Register a launched process under its port.
    pub fn insert(&mut self, process: ManagedProcess) -> Result<(), SupervisorError> {
        let port = process.port();
        if self.instances.contains_key(&port) {
            return Err(SupervisorError::PortInUse { port });
        }
        self.instances.insert(port, process);
        debug!(port, "Claimed port");
        self.write_claims(&[]);
        Ok(())
    }

    /// Unregister the process on `port`, returning it for stopping.
    pub fn remove(&mut self, port: u16) -> Option<ManagedProcess> {
        let process = self.instances.remove(&port)?;
        debug!(port, "Released port");
        self.write_claims(&[port]);
        Some(process)
    }

    /// Remove every instance, e.g. at shutdown.
    pub fn drain(&mut self) -> Vec<ManagedProcess> {
        let released = self.ports();
        let drained: Vec<_> = std::mem::take(&mut self.instances).into_values().collect();
        if !drained.is_empty() {
            self.write_claims(&released);
        }
        drained
    }

    /// Ports claimed here or by any sibling sharing the claims file.
    pub fn claimed_ports(&self) -> HashSet<u16> {
        let mut ports: HashSet<u16> = self.instances.keys().copied().collect();
        if let Some(path) = &self.claims_file {
            ports.extend(read_claims(path));
        }
        ports
    }

    pub fn snapshot(&self) -> Vec<InstanceInfo> {
        self.instances
            .values()
            .map(|p| InstanceInfo {
                port: p.port(),
                pid: p.pid(),
                directory: p.working_directory().to_path_buf(),
                state: p.state(),
                runtime: format_runtime(p.uptime().as_secs()),
            })
            .collect()
    }

    /// Rewrite the claims file: entries written by siblings stay, `released`
    /// ports go, and our current ports are added.
    fn write_claims(&self, released: &[u16]) {
        let Some(path) = &self.claims_file else {
            return;
        };
        let ports = merge_claims(read_claims(path), self.instances.keys().copied(), released);
        if let Err(e) = write_claims_file(path, &ports) {
            warn!(path = %path.display(), error = %e, "Failed to write port claims file");
        }
    }
}

fn merge_claims(
    existing: Vec<u16>,
    ours: impl IntoIterator<Item = u16>,
    released: &[u16],
) -> Vec<u16> {
    let mut ports: Vec<u16> = existing
        .into_iter()
        .filter(|p| !released.contains(p))
        .collect();
    ports.extend(ours);
    ports.sort_unstable();
    ports.dedup();
    ports
}

fn read_claims(path: &Path) -> Vec<u16> {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "Invalid port claims file, ignoring");
            Vec::new()
        }),
        Err(_) => Vec::new(),
    }
}

fn write_claims_file(path: &Path, ports: &[u16]) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_string(ports).map_err(std::io::Error::other)?;
    std::fs::write(path, json)
}

/// Format whole seconds as `HH:MM:SS`.
pub fn format_runtime(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
